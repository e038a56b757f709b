use tokio::sync::mpsc::error::TrySendError;
use uuid::Uuid;

use crate::error::AppError;
use crate::state::AppState;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DispatchJob {
    pub order_id: Uuid,
    pub attempt: u32,
}

impl DispatchJob {
    pub fn new(order_id: Uuid) -> Self {
        Self {
            order_id,
            attempt: 0,
        }
    }

    pub fn next_attempt(self) -> Self {
        Self {
            attempt: self.attempt + 1,
            ..self
        }
    }
}

/// Never waits on a full queue: callers run after a commit and must not
/// stall behind the worker.
pub fn enqueue_order(state: &AppState, job: DispatchJob) -> Result<(), AppError> {
    state.dispatch_tx.try_send(job).map_err(|err| match err {
        TrySendError::Full(job) => {
            AppError::Internal(format!("dispatch queue full; order {} not queued", job.order_id))
        }
        TrySendError::Closed(job) => {
            AppError::Internal(format!("dispatch queue closed; order {} not queued", job.order_id))
        }
    })?;

    state.metrics.dispatch_queue_depth.inc();
    Ok(())
}
