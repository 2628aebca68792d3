//! Waiting on asynchronous remote tasks.
//!
//! Every wait destroys its task exactly once, whichever way it ends. A wait
//! that fails while the task may still be running cancels it first. A wait
//! dropped before it finishes hands both steps to a background cleanup.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::api::{self, TaskStatus, VmPowerState};
use crate::error::{Result, XapiError};
use crate::pool::Connection;
use crate::xmlrpc;

/// How a wait ended successfully.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskOutcome {
    /// The task reported success. `result` is the unwrapped task result, if any.
    Completed { result: Option<String> },
    /// The task handle vanished but the target already reached its end state.
    EndStateReached,
}

impl TaskOutcome {
    pub fn result(&self) -> Option<&str> {
        match self {
            TaskOutcome::Completed { result } => result.as_deref(),
            TaskOutcome::EndStateReached => None,
        }
    }
}

/// Checks whether an operation's side effect already happened.
///
/// Consulted only when the task handle becomes invalid mid-poll.
#[async_trait]
pub trait EndStateProbe: Send + Sync {
    async fn reached(&self, conn: &Connection) -> Result<bool>;
}

/// A VM is in the expected power state.
pub struct VmPowerStateProbe {
    pub vm_ref: String,
    pub expected: VmPowerState,
}

#[async_trait]
impl EndStateProbe for VmPowerStateProbe {
    async fn reached(&self, conn: &Connection) -> Result<bool> {
        Ok(api::vm_get_power_state(conn, &self.vm_ref).await? == self.expected)
    }
}

type Cleanups = Arc<Mutex<Vec<JoinHandle<()>>>>;

fn lock(cleanups: &Cleanups) -> MutexGuard<'_, Vec<JoinHandle<()>>> {
    cleanups.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Polls tasks to completion.
///
/// Clones share the list of background cleanups left by abandoned waits.
#[derive(Debug, Clone)]
pub struct TaskRunner {
    poll_interval: Duration,
    timeout: Duration,
    cleanups: Cleanups,
}

impl Default for TaskRunner {
    fn default() -> Self {
        Self::new(Duration::from_millis(1000), Duration::from_secs(3600))
    }
}

impl TaskRunner {
    pub fn new(poll_interval: Duration, timeout: Duration) -> Self {
        Self {
            poll_interval,
            timeout,
            cleanups: Arc::default(),
        }
    }

    pub fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Wait with this runner's default interval and timeout.
    pub async fn wait(
        &self,
        conn: &Arc<Connection>,
        task: &str,
        probe: Option<&dyn EndStateProbe>,
    ) -> Result<TaskOutcome> {
        self.wait_for_task_with(conn, task, self.poll_interval, self.timeout, probe)
            .await
    }

    pub async fn wait_for_task(
        &self,
        conn: &Arc<Connection>,
        task: &str,
        poll_interval: Duration,
        timeout: Duration,
    ) -> Result<TaskOutcome> {
        self.wait_for_task_with(conn, task, poll_interval, timeout, None)
            .await
    }

    /// Poll `task` until it leaves `pending`, then read its outcome.
    ///
    /// Fails with `TimedOut` once `timeout` has elapsed with the task still
    /// pending, with `TaskFailed` for any terminal non-success status, and
    /// with the transport's own error otherwise.
    ///
    /// If the returned future is dropped early, the task is cancelled and
    /// destroyed in the background; see [`TaskRunner::finish_cleanups`].
    pub async fn wait_for_task_with(
        &self,
        conn: &Arc<Connection>,
        task: &str,
        poll_interval: Duration,
        timeout: Duration,
        probe: Option<&dyn EndStateProbe>,
    ) -> Result<TaskOutcome> {
        let guard = AbandonedTask {
            conn: Some(Arc::clone(conn)),
            task: task.to_string(),
            cleanups: Arc::clone(&self.cleanups),
        };

        let mut last_status = None;
        let outcome =
            poll_to_completion(conn, task, poll_interval, timeout, probe, &mut last_status).await;

        if needs_cancel(&outcome, last_status) {
            cancel(conn, task).await;
        }
        destroy(conn, task).await;
        guard.disarm();
        outcome
    }

    /// Wait for the cleanups of abandoned waits to finish.
    pub async fn finish_cleanups(&self) {
        let pending = std::mem::take(&mut *lock(&self.cleanups));
        if pending.is_empty() {
            return;
        }
        debug!(count = pending.len(), "Waiting for task cleanups");
        for cleanup in pending {
            if let Err(e) = cleanup.await {
                warn!(error = %e, "Task cleanup did not complete");
            }
        }
    }
}

/// Cancels and destroys the task of a wait dropped before it finished.
struct AbandonedTask {
    conn: Option<Arc<Connection>>,
    task: String,
    cleanups: Cleanups,
}

impl AbandonedTask {
    fn disarm(mut self) {
        self.conn = None;
    }
}

impl Drop for AbandonedTask {
    fn drop(&mut self) {
        let Some(conn) = self.conn.take() else {
            return;
        };
        let task = std::mem::take(&mut self.task);
        let Ok(handle) = Handle::try_current() else {
            warn!(task = %task, "Wait abandoned without a runtime, task left on the pool");
            return;
        };

        warn!(task = %task, "Wait abandoned, cancelling task");
        let cleanup = handle.spawn(async move {
            cancel(&conn, &task).await;
            destroy(&conn, &task).await;
        });
        lock(&self.cleanups).push(cleanup);
    }
}

/// A failed wait leaves the task running unless it is gone or already cancelled.
fn needs_cancel(outcome: &Result<TaskOutcome>, last_status: Option<TaskStatus>) -> bool {
    match outcome {
        Ok(_) | Err(XapiError::HandleInvalid { .. }) => false,
        Err(_) => last_status != Some(TaskStatus::Cancelled),
    }
}

async fn poll_to_completion(
    conn: &Connection,
    task: &str,
    poll_interval: Duration,
    timeout: Duration,
    probe: Option<&dyn EndStateProbe>,
    last_status: &mut Option<TaskStatus>,
) -> Result<TaskOutcome> {
    let start = Instant::now();

    let status = loop {
        let status = match api::task_get_status(conn, task).await {
            Ok(status) => status,
            Err(e @ XapiError::HandleInvalid { .. }) => {
                return end_state_or(conn, task, probe, e).await;
            }
            Err(e) => return Err(e),
        };
        *last_status = Some(status);

        if status != TaskStatus::Pending {
            break status;
        }

        tokio::time::sleep(poll_interval).await;
        let elapsed = start.elapsed();
        debug!(task = %task, elapsed_ms = elapsed.as_millis(), "Task still pending");

        if elapsed > timeout {
            warn!(task = %task, timeout_ms = timeout.as_millis(), "Task timed out");
            return Err(XapiError::TimedOut {
                task: task.to_string(),
                elapsed,
            });
        }
    };

    match status {
        TaskStatus::Success => {
            let raw = match api::task_get_result(conn, task).await {
                Ok(raw) => raw,
                Err(e @ XapiError::HandleInvalid { .. }) => {
                    return end_state_or(conn, task, probe, e).await;
                }
                Err(e) => return Err(e),
            };
            let result = xmlrpc::unwrap_task_result(&raw);
            info!(task = %task, elapsed_ms = start.elapsed().as_millis(), "Task succeeded");
            Ok(TaskOutcome::Completed {
                result: (!result.is_empty()).then_some(result),
            })
        }
        other => {
            let error_info = api::task_get_error_info(conn, task).await?;
            warn!(task = %task, status = ?other, error_info = ?error_info, "Task failed");
            Err(XapiError::TaskFailed {
                task: task.to_string(),
                error_info,
            })
        }
    }
}

/// Treat a vanished handle as success if the probe confirms the end state.
async fn end_state_or(
    conn: &Connection,
    task: &str,
    probe: Option<&dyn EndStateProbe>,
    cause: XapiError,
) -> Result<TaskOutcome> {
    let Some(probe) = probe else {
        return Err(cause);
    };

    match probe.reached(conn).await {
        Ok(true) => {
            info!(task = %task, "Task handle invalid but end state reached");
            Ok(TaskOutcome::EndStateReached)
        }
        Ok(false) => Err(cause),
        Err(e) => {
            warn!(task = %task, error = %e, "End state check failed");
            Err(cause)
        }
    }
}

async fn cancel(conn: &Connection, task: &str) {
    debug!(task = %task, "Cancelling task");
    if let Err(e) = api::task_cancel(conn, task).await {
        warn!(task = %task, error = %e, "Failed to cancel task");
    }
}

async fn destroy(conn: &Connection, task: &str) {
    if let Err(e) = api::task_destroy(conn, task).await {
        warn!(task = %task, error = %e, "Failed to destroy task");
    }
}
