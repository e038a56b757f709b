use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::time::sleep;
use tracing::{error, info, warn};

use crate::engine::coordinator::auto_assign_driver;
use crate::engine::queue::{DispatchJob, enqueue_order};
use crate::error::AppError;
use crate::state::AppState;

/// Drains the dispatch queue, auto-assigning each paid order. Orders with
/// no driver in range are retried after a delay until the attempt budget
/// runs out; any other failure means the order moved on without us.
pub async fn run_assignment_engine(state: Arc<AppState>, mut dispatch_rx: mpsc::Receiver<DispatchJob>) {
    info!("assignment engine started");

    while let Some(job) = dispatch_rx.recv().await {
        state.metrics.dispatch_queue_depth.dec();
        process_job(state.clone(), job).await;
    }

    warn!("assignment engine stopped: queue channel closed");
}

async fn process_job(state: Arc<AppState>, job: DispatchJob) {
    match auto_assign_driver(&state, job.order_id).await {
        Ok(assignment) => {
            info!(
                order_id = %job.order_id,
                driver_id = %assignment.assigned_driver.driver_id,
                attempt = job.attempt,
                "background dispatch succeeded"
            );
        }
        Err(AppError::NoAvailableDrivers) if job.attempt + 1 < state.config.max_attempts => {
            warn!(
                order_id = %job.order_id,
                attempt = job.attempt,
                "no drivers available; retrying later"
            );
            schedule_retry(state, job.next_attempt());
        }
        Err(AppError::NoAvailableDrivers) => {
            error!(
                order_id = %job.order_id,
                attempts = job.attempt + 1,
                "giving up on background dispatch"
            );
        }
        Err(err) => {
            info!(
                order_id = %job.order_id,
                error = %err,
                "dropping dispatch job"
            );
        }
    }
}

fn schedule_retry(state: Arc<AppState>, job: DispatchJob) {
    let delay = state.config.retry_delay;
    tokio::spawn(async move {
        sleep(delay).await;
        if let Err(err) = enqueue_order(&state, job) {
            error!(order_id = %job.order_id, error = %err, "failed to re-queue order");
        }
    });
}
