use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::response::IntoResponse;
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::engine::coordinator;
use crate::error::AppError;
use crate::events::{Subscription, Topic};
use crate::state::AppState;

#[derive(Deserialize)]
pub struct WsParams {
    /// Own channel, e.g. `customer:<uuid>`.
    pub identity: String,
}

/// Frames a client may send.
#[derive(Debug, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum ClientFrame {
    Subscribe { order_id: Uuid },
    Unsubscribe { order_id: Uuid },
}

/// Control frames sent back in reply to a [`ClientFrame`]. Events are sent
/// as plain envelopes.
#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerFrame {
    Subscribed { order_id: Uuid },
    Unsubscribed { order_id: Uuid },
    Error { kind: String, message: String },
}

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    Query(params): Query<WsParams>,
) -> Result<impl IntoResponse, AppError> {
    let identity: Topic = params.identity.parse().map_err(AppError::BadRequest)?;
    if identity.is_order() {
        return Err(AppError::BadRequest(
            "identity must be a customer, driver or merchant channel".to_string(),
        ));
    }

    Ok(ws.on_upgrade(move |socket| handle_socket(socket, state, identity)))
}

async fn handle_socket(socket: WebSocket, state: Arc<AppState>, identity: Topic) {
    let (mut sender, mut receiver) = socket.split();
    let mut subscription = state.broadcaster.connect(identity);

    state.metrics.ws_connections_active.inc();
    info!(
        channel = %subscription.identity(),
        connection_id = subscription.id(),
        "websocket client connected"
    );

    loop {
        tokio::select! {
            envelope = subscription.recv() => {
                let Some(envelope) = envelope else { break };
                let json = match serde_json::to_string(&envelope) {
                    Ok(json) => json,
                    Err(err) => {
                        warn!(error = %err, "failed to serialize event for ws");
                        continue;
                    }
                };

                if sender.send(Message::Text(json)).await.is_err() {
                    break;
                }
            }
            incoming = receiver.next() => {
                let text = match incoming {
                    Some(Ok(Message::Text(text))) => text,
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => continue,
                    Some(Err(err)) => {
                        debug!(error = %err, "websocket receive error");
                        break;
                    }
                };

                let reply = handle_client_frame(&state, &subscription, &text).await;
                let json = match serde_json::to_string(&reply) {
                    Ok(json) => json,
                    Err(err) => {
                        warn!(error = %err, "failed to serialize ws reply");
                        continue;
                    }
                };
                if sender.send(Message::Text(json)).await.is_err() {
                    break;
                }
            }
        }
    }

    state.metrics.ws_connections_active.dec();
    info!(
        channel = %subscription.identity(),
        connection_id = subscription.id(),
        "websocket client disconnected"
    );
}

async fn handle_client_frame(state: &AppState, subscription: &Subscription, text: &str) -> ServerFrame {
    let frame = match serde_json::from_str::<ClientFrame>(text) {
        Ok(frame) => frame,
        Err(err) => {
            return ServerFrame::Error {
                kind: "bad_request".to_string(),
                message: format!("unrecognised frame: {err}"),
            };
        }
    };

    match frame {
        ClientFrame::Subscribe { order_id } => {
            match coordinator::subscribe_to_order(state, subscription.id(), order_id).await {
                Ok(()) => ServerFrame::Subscribed { order_id },
                Err(err) => ServerFrame::Error {
                    kind: err.kind().to_string(),
                    message: err.to_string(),
                },
            }
        }
        ClientFrame::Unsubscribe { order_id } => {
            coordinator::unsubscribe_from_order(state, subscription.id(), order_id);
            ServerFrame::Unsubscribed { order_id }
        }
    }
}
