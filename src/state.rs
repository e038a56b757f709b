use std::sync::Arc;

use tokio::sync::mpsc;

use crate::config::{Config, DispatchConfig};
use crate::engine::queue::DispatchJob;
use crate::events::EventBroadcaster;
use crate::notify::{LogNotifier, Notifier};
use crate::observability::metrics::Metrics;
use crate::store::{InMemoryStore, Store};

/// Everything a request needs. Built once per process (or per test); there
/// is no global registry behind it.
pub struct AppState {
    pub store: Arc<dyn Store>,
    pub notifier: Arc<dyn Notifier>,
    pub broadcaster: EventBroadcaster,
    pub dispatch_tx: mpsc::Sender<DispatchJob>,
    pub config: DispatchConfig,
    pub metrics: Metrics,
}

impl AppState {
    pub fn new(config: &Config) -> (Self, mpsc::Receiver<DispatchJob>) {
        Self::with_backends(config, Arc::new(InMemoryStore::new()), Arc::new(LogNotifier))
    }

    pub fn with_backends(
        config: &Config,
        store: Arc<dyn Store>,
        notifier: Arc<dyn Notifier>,
    ) -> (Self, mpsc::Receiver<DispatchJob>) {
        let (dispatch_tx, dispatch_rx) = mpsc::channel(config.dispatch_queue_size.max(1));
        let metrics = Metrics::new();
        let broadcaster =
            EventBroadcaster::new(config.dispatch.subscriber_buffer_size, metrics.clone());

        (
            Self {
                store,
                notifier,
                broadcaster,
                dispatch_tx,
                config: config.dispatch.clone(),
                metrics,
            },
            dispatch_rx,
        )
    }
}
