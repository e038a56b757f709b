use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use dispatch_coordinator::api::rest::router;
use dispatch_coordinator::config::Config;
use dispatch_coordinator::engine::assignment::run_assignment_engine;
use dispatch_coordinator::engine::queue::DispatchJob;
use dispatch_coordinator::state::AppState;
use serde_json::{Value, json};
use tokio::sync::mpsc;
use tower::ServiceExt;
use uuid::Uuid;

fn setup() -> (axum::Router, mpsc::Receiver<DispatchJob>) {
    let (state, rx) = AppState::new(&Config::default());
    (router(Arc::new(state)), rx)
}

fn json_request(method: &str, uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method(method)
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(serde_json::to_string(&body).unwrap()))
        .unwrap()
}

fn get_request(uri: &str) -> Request<Body> {
    Request::builder()
        .method("GET")
        .uri(uri)
        .body(Body::empty())
        .unwrap()
}

fn post_empty(uri: &str) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .body(Body::empty())
        .unwrap()
}

async fn body_json(response: axum::response::Response) -> Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

async fn body_string(response: axum::response::Response) -> String {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    String::from_utf8(bytes.to_vec()).unwrap()
}

fn order_body() -> Value {
    json!({
        "customer_id": Uuid::new_v4(),
        "merchant_id": Uuid::new_v4(),
        "pickup": {
            "location": { "lat": 40.7128, "lng": -74.0060 },
            "address": "City Hall, New York"
        },
        "dropoff": {
            "location": { "lat": 40.7580, "lng": -73.9855 },
            "address": "Times Square, New York"
        },
        "items": [{ "name": "shirts", "quantity": 3 }]
    })
}

fn driver_body(name: &str, lat: f64, lng: f64) -> Value {
    json!({
        "name": name,
        "vehicle_type": "motorcycle",
        "rating": 4.5,
        "verified": true,
        "location": { "lat": lat, "lng": lng },
        "available": true
    })
}

async fn create_order(app: &axum::Router) -> Value {
    let response = app
        .clone()
        .oneshot(json_request("POST", "/orders", order_body()))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    body_json(response).await
}

async fn register_driver(app: &axum::Router, name: &str, lat: f64, lng: f64) -> Value {
    let response = app
        .clone()
        .oneshot(json_request("POST", "/drivers", driver_body(name, lat, lng)))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    body_json(response).await
}

async fn transition(app: &axum::Router, order_id: &str, status: &str) -> axum::response::Response {
    app.clone()
        .oneshot(json_request(
            "POST",
            &format!("/orders/{order_id}/status"),
            json!({ "status": status }),
        ))
        .await
        .unwrap()
}

#[tokio::test]
async fn health_returns_ok() {
    let (app, _rx) = setup();
    let response = app.oneshot(get_request("/health")).await.unwrap();

    assert_eq!(response.status(), StatusCode::OK);

    let body = body_json(response).await;
    assert_eq!(body["status"], "ok");
    assert_eq!(body["drivers"], 0);
    assert_eq!(body["orders"], 0);
    assert_eq!(body["history_entries"], 0);
    assert_eq!(body["connections"], 0);
}

#[tokio::test]
async fn metrics_returns_prometheus_format() {
    let (app, _rx) = setup();
    let response = app.oneshot(get_request("/metrics")).await.unwrap();

    assert_eq!(response.status(), StatusCode::OK);

    let content_type = response
        .headers()
        .get("content-type")
        .unwrap()
        .to_str()
        .unwrap()
        .to_string();
    assert!(content_type.contains("text/plain"));

    let body = body_string(response).await;
    assert!(body.contains("dispatch_queue_depth"));
}

#[tokio::test]
async fn register_driver_returns_driver() {
    let (app, _rx) = setup();
    let body = register_driver(&app, "Alice", 40.73, -74.0).await;

    assert_eq!(body["name"], "Alice");
    assert_eq!(body["vehicle_type"], "motorcycle");
    assert_eq!(body["availability"], "AVAILABLE");
    assert_eq!(body["rating"], 4.5);
    assert_eq!(body["verified"], true);
    assert!(!body["id"].as_str().unwrap().is_empty());
}

#[tokio::test]
async fn register_driver_empty_name_returns_400() {
    let (app, _rx) = setup();
    let response = app
        .oneshot(json_request("POST", "/drivers", driver_body("  ", 40.73, -74.0)))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body = body_json(response).await;
    assert_eq!(body["kind"], "bad_request");
}

#[tokio::test]
async fn register_driver_rating_clamped_to_5() {
    let (app, _rx) = setup();
    let mut payload = driver_body("Max", 40.73, -74.0);
    payload["rating"] = json!(9.9);

    let response = app
        .oneshot(json_request("POST", "/drivers", payload))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["rating"], 5.0);
}

#[tokio::test]
async fn driver_summary_includes_active_order_count() {
    let (app, _rx) = setup();
    let driver = register_driver(&app, "Alice", 40.73, -74.0).await;
    let id = driver["id"].as_str().unwrap();

    let response = app
        .oneshot(get_request(&format!("/drivers/{id}")))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["id"], driver["id"]);
    assert_eq!(body["active_order_count"], 0);
}

#[tokio::test]
async fn nearby_drivers_sorted_by_distance() {
    let (app, _rx) = setup();
    let far = register_driver(&app, "Far", 40.7400, -74.0060).await;
    let near = register_driver(&app, "Near", 40.7200, -74.0060).await;

    let response = app
        .oneshot(get_request(
            "/drivers/nearby?lat=40.7128&lng=-74.0060&radius_km=5",
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    let drivers = body.as_array().unwrap();
    assert_eq!(drivers.len(), 2);
    assert_eq!(drivers[0]["id"], near["id"]);
    assert_eq!(drivers[1]["id"], far["id"]);
    assert!(drivers[0]["distance_km"].as_f64().unwrap() < drivers[1]["distance_km"].as_f64().unwrap());
}

#[tokio::test]
async fn location_update_is_acknowledged() {
    let (app, _rx) = setup();
    let driver = register_driver(&app, "Alice", 40.73, -74.0).await;
    let id = driver["id"].as_str().unwrap();

    let response = app
        .clone()
        .oneshot(json_request(
            "PATCH",
            &format!("/drivers/{id}/location"),
            json!({ "lat": 40.75, "lng": -73.99 }),
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["acknowledged"], true);

    let response = app
        .oneshot(json_request(
            "PATCH",
            &format!("/drivers/{id}/location"),
            json!({ "lat": 95.0, "lng": -73.99 }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn availability_toggle_and_break() {
    let (app, _rx) = setup();
    let driver = register_driver(&app, "Alice", 40.73, -74.0).await;
    let id = driver["id"].as_str().unwrap();

    let response = app
        .clone()
        .oneshot(json_request(
            "PATCH",
            &format!("/drivers/{id}/availability"),
            json!({ "available": false }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_json(response).await["availability"], "OFFLINE");

    let response = app
        .oneshot(post_empty(&format!("/drivers/{id}/break")))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_json(response).await["availability"], "ON_BREAK");
}

#[tokio::test]
async fn get_nonexistent_order_returns_404() {
    let (app, _rx) = setup();
    let response = app
        .oneshot(get_request(&format!("/orders/{}", Uuid::new_v4())))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    let body = body_json(response).await;
    assert_eq!(body["kind"], "not_found");
}

#[tokio::test]
async fn create_order_returns_pending_with_history() {
    let (app, _rx) = setup();
    let order = create_order(&app).await;

    assert_eq!(order["status"], "PENDING_PAYMENT");
    assert!(order["driver_id"].is_null());

    let id = order["id"].as_str().unwrap();
    let response = app
        .oneshot(get_request(&format!("/orders/{id}/history")))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let history = body_json(response).await;
    let entries = history.as_array().unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0]["status"], "PENDING_PAYMENT");
}

#[tokio::test]
async fn create_order_without_items_returns_400() {
    let (app, _rx) = setup();
    let mut payload = order_body();
    payload["items"] = json!([]);

    let response = app
        .oneshot(json_request("POST", "/orders", payload))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn invalid_transition_returns_409() {
    let (app, _rx) = setup();
    let order = create_order(&app).await;
    let id = order["id"].as_str().unwrap();

    let response = transition(&app, id, "DELIVERED").await;

    assert_eq!(response.status(), StatusCode::CONFLICT);
    let body = body_json(response).await;
    assert_eq!(body["kind"], "invalid_transition");

    let response = app
        .oneshot(get_request(&format!("/orders/{id}")))
        .await
        .unwrap();
    assert_eq!(body_json(response).await["status"], "PENDING_PAYMENT");
}

#[tokio::test]
async fn cancel_pending_order_records_reason() {
    let (app, _rx) = setup();
    let order = create_order(&app).await;
    let id = order["id"].as_str().unwrap();

    let response = app
        .oneshot(json_request(
            "POST",
            &format!("/orders/{id}/cancel"),
            json!({ "reason": "duplicate order" }),
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["status"], "CANCELLED");
    assert_eq!(body["cancellation_reason"], "duplicate order");
}

#[tokio::test]
async fn cancel_without_body_is_accepted() {
    let (app, _rx) = setup();
    let order = create_order(&app).await;
    let id = order["id"].as_str().unwrap();

    let response = app
        .oneshot(post_empty(&format!("/orders/{id}/cancel")))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_json(response).await["status"], "CANCELLED");
}

#[tokio::test]
async fn auto_assign_without_drivers_returns_503() {
    let (app, _rx) = setup();
    let order = create_order(&app).await;
    let id = order["id"].as_str().unwrap();
    assert_eq!(transition(&app, id, "PAYMENT_CONFIRMED").await.status(), StatusCode::OK);

    let response = app
        .oneshot(post_empty(&format!("/orders/{id}/auto-assign")))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body_json(response).await["kind"], "unavailable");
}

#[tokio::test]
async fn full_delivery_flow() {
    let (app, _rx) = setup();
    let driver = register_driver(&app, "Alice", 40.7300, -74.0000).await;
    let order = create_order(&app).await;
    let id = order["id"].as_str().unwrap();

    assert_eq!(transition(&app, id, "PAYMENT_CONFIRMED").await.status(), StatusCode::OK);

    let response = app
        .clone()
        .oneshot(post_empty(&format!("/orders/{id}/auto-assign")))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let assignment = body_json(response).await;
    assert_eq!(assignment["order"]["status"], "DRIVER_ASSIGNED");
    assert_eq!(assignment["assigned_driver"]["driver_id"], driver["id"]);
    let distance = assignment["assigned_driver"]["distance_km"].as_f64().unwrap();
    assert!((distance - 1.98).abs() < 0.2);

    let driver_id = driver["id"].as_str().unwrap();
    let response = app
        .clone()
        .oneshot(get_request(&format!("/drivers/{driver_id}")))
        .await
        .unwrap();
    let summary = body_json(response).await;
    assert_eq!(summary["availability"], "BUSY");
    assert_eq!(summary["active_order_count"], 1);

    for status in [
        "PICKED_UP",
        "IN_TRANSIT_TO_MERCHANT",
        "RECEIVED_BY_MERCHANT",
        "IN_PROCESS",
        "READY_FOR_DELIVERY",
        "OUT_FOR_DELIVERY",
        "DELIVERED",
    ] {
        let response = transition(&app, id, status).await;
        assert_eq!(response.status(), StatusCode::OK, "transition to {status}");
    }

    let response = app
        .clone()
        .oneshot(post_empty(&format!("/orders/{id}/cancel")))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(body_json(response).await["kind"], "invalid_operation");

    let response = app
        .clone()
        .oneshot(get_request(&format!("/drivers/{driver_id}")))
        .await
        .unwrap();
    assert_eq!(body_json(response).await["availability"], "AVAILABLE");

    let response = app
        .oneshot(get_request(&format!("/orders/{id}/history")))
        .await
        .unwrap();
    let history = body_json(response).await;
    assert_eq!(history.as_array().unwrap().len(), 10);
}

#[tokio::test]
async fn manual_assign_to_offline_driver_returns_409() {
    let (app, _rx) = setup();
    let driver = register_driver(&app, "Alice", 40.7300, -74.0000).await;
    let driver_id = driver["id"].as_str().unwrap();
    app.clone()
        .oneshot(json_request(
            "PATCH",
            &format!("/drivers/{driver_id}/availability"),
            json!({ "available": false }),
        ))
        .await
        .unwrap();

    let order = create_order(&app).await;
    let id = order["id"].as_str().unwrap();
    transition(&app, id, "PAYMENT_CONFIRMED").await;

    let response = app
        .oneshot(json_request(
            "POST",
            &format!("/orders/{id}/assign"),
            json!({ "driver_id": driver_id }),
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::CONFLICT);
    assert_eq!(body_json(response).await["kind"], "conflict");
}

#[tokio::test]
async fn background_dispatch_assigns_paid_orders() {
    let mut config = Config::default();
    config.dispatch.auto_dispatch = true;
    let (state, rx) = AppState::new(&config);
    let shared = Arc::new(state);
    tokio::spawn(run_assignment_engine(shared.clone(), rx));
    let app = router(shared.clone());

    register_driver(&app, "Alice", 40.7300, -74.0000).await;
    let order = create_order(&app).await;
    let id = order["id"].as_str().unwrap();
    assert_eq!(transition(&app, id, "PAYMENT_CONFIRMED").await.status(), StatusCode::OK);

    tokio::time::sleep(Duration::from_millis(200)).await;

    let response = app
        .oneshot(get_request(&format!("/orders/{id}")))
        .await
        .unwrap();
    let body = body_json(response).await;
    assert_eq!(body["status"], "DRIVER_ASSIGNED");
    assert!(!body["driver_id"].is_null());
}
