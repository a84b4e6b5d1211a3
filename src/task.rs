//! Polling wait for backend control tasks.

use crate::backend::{ControlBackend, TaskRef, TaskStatus};
use crate::error::InventoryError;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, trace};

/// Poll `task` until it settles. `Error` outcomes surface as
/// [`InventoryError::TaskFailed`]; missing the deadline surfaces as
/// [`InventoryError::Timeout`]. Status is checked before the deadline, so
/// an already-settled task succeeds even under a zero timeout.
pub async fn wait_for_completion(
    control: &dyn ControlBackend,
    task: &TaskRef,
    poll: Duration,
    timeout: Option<Duration>,
) -> Result<(), InventoryError> {
    let deadline = timeout.map(|limit| Instant::now() + limit);
    loop {
        match control.task_status(task).await? {
            TaskStatus::Success => {
                debug!(task = %task, "Task completed");
                return Ok(());
            }
            TaskStatus::Error(message) => {
                debug!(task = %task, error = %message, "Task failed");
                return Err(InventoryError::TaskFailed {
                    task: task.to_string(),
                    message,
                });
            }
            status @ (TaskStatus::Queued | TaskStatus::Running) => {
                trace!(task = %task, status = ?status, "Task still in progress");
            }
        }
        if let (Some(deadline), Some(limit)) = (deadline, timeout) {
            if Instant::now() >= deadline {
                return Err(InventoryError::Timeout(format!(
                    "task {} did not complete within {:?}",
                    task, limit
                )));
            }
        }
        tokio::time::sleep(poll).await;
    }
}
