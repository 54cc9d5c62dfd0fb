//! Long-running task polling.
//!
//! [`TaskPoller`] drives a submitted LAM task to a terminal status by
//! periodically asking the backend for its state. The poll interval backs
//! off to bound request volume on long tasks, the whole wait is bounded by a
//! deadline, a bounded number of transient poll failures is tolerated so an
//! intermittent network blip does not abort a legitimate long task, and a
//! caller-initiated cancel signal stops polling promptly.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio::sync::watch;
use tokio::time::Instant;

use crate::client::{LamBackend, LamStatusResponse, TaskStatus};
use crate::error::{Error, Result};

/// Timing policy for a polling wait.
///
/// Injectable so tests can run the state machine under paused tokio time
/// without real delays.
#[derive(Debug, Clone)]
pub struct PollPolicy {
    /// First poll interval.
    pub initial_interval: Duration,
    /// Upper bound on the poll interval as it backs off.
    pub max_interval: Duration,
    /// Overall deadline for the wait.
    pub max_wait: Duration,
    /// Consecutive transient poll failures tolerated before giving up.
    pub max_transient_errors: u32,
}

impl Default for PollPolicy {
    fn default() -> Self {
        Self {
            initial_interval: Duration::from_secs(1),
            max_interval: Duration::from_secs(10),
            max_wait: Duration::from_secs(300),
            max_transient_errors: 5,
        }
    }
}

/// Local view of a remote task, updated only by the poller.
#[derive(Debug, Clone)]
pub struct TaskHandle {
    /// Remote task identifier.
    pub task_id: String,
    /// Last observed status.
    pub status: TaskStatus,
    /// Result payload, set once the task succeeds.
    pub result_payload: Option<Value>,
    /// Failure detail, set when the task fails.
    pub error_detail: Option<String>,
    /// When this handle was created.
    pub created_at: DateTime<Utc>,
}

impl TaskHandle {
    /// Create a handle for a freshly submitted task.
    pub fn new(task_id: impl Into<String>) -> Self {
        Self {
            task_id: task_id.into(),
            status: TaskStatus::Pending,
            result_payload: None,
            error_detail: None,
            created_at: Utc::now(),
        }
    }

    /// Whether the handle has reached a terminal status.
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Fold a status observation into the handle.
    ///
    /// Terminal handles never transition again: applying further
    /// observations is a no-op, so repeated status reads are idempotent.
    pub fn apply(&mut self, observation: &LamStatusResponse) -> Result<()> {
        if self.is_terminal() {
            return Ok(());
        }
        let status = observation.status()?;
        self.status = status;
        match status {
            TaskStatus::Succeeded => {
                self.result_payload = Some(extract_payload(observation));
            }
            TaskStatus::Failed => {
                self.error_detail = Some(
                    observation
                        .message
                        .clone()
                        .unwrap_or_else(|| "task failed without detail".into()),
                );
            }
            _ => {}
        }
        Ok(())
    }

    /// Mark the handle cancelled. No-op if already terminal.
    pub fn mark_cancelled(&mut self) {
        if !self.is_terminal() {
            self.status = TaskStatus::Cancelled;
        }
    }
}

/// Shape the status observation into the result payload handed to callers:
/// a single data item stays bare, multiple items become an array, and a
/// data-less success falls back to properties or the final message.
fn extract_payload(observation: &LamStatusResponse) -> Value {
    match observation.data.as_deref() {
        Some([single]) => single.clone(),
        Some(items) if !items.is_empty() => Value::Array(items.to_vec()),
        _ => {
            if let Some(properties) = &observation.properties {
                properties.clone()
            } else {
                Value::String(observation.message.clone().unwrap_or_default())
            }
        }
    }
}

/// Whether a single failed poll may be absorbed and tried again.
///
/// An intermittent remote or transport failure must not abort a
/// long-running legitimate task; only credential rejections (and local
/// invariants) end the wait at first sight.
fn poll_tolerable(err: &Error) -> bool {
    err.is_transient() || matches!(err, Error::Remote { .. } | Error::Timeout(_))
}

/// Drives submitted tasks to completion against a [`LamBackend`].
pub struct TaskPoller<B> {
    backend: B,
    policy: PollPolicy,
}

impl<B: LamBackend> TaskPoller<B> {
    /// Create a poller over the given backend.
    pub fn new(backend: B, policy: PollPolicy) -> Self {
        Self { backend, policy }
    }

    /// Poll until the task reaches a terminal status.
    ///
    /// Returns the terminal handle, or [`Error::Timeout`] once `max_wait`
    /// elapses or the transient-failure tolerance is exhausted. A cancel
    /// signal flips the local handle to `Cancelled`, stops polling, and
    /// fires a best-effort remote cancel whose outcome does not change the
    /// local terminal state.
    pub async fn await_completion(
        &self,
        task_id: &str,
        mut cancel: watch::Receiver<bool>,
    ) -> Result<TaskHandle> {
        let deadline = Instant::now() + self.policy.max_wait;
        let mut interval = self.policy.initial_interval;
        let mut transient_failures = 0u32;
        let mut cancel_open = true;
        let mut handle = TaskHandle::new(task_id);

        loop {
            if cancel_open && *cancel.borrow() {
                return Ok(self.cancelled(handle).await);
            }

            let poll = self.backend.task_status(task_id).await.and_then(|observation| {
                if let Some(url) = &observation.livestream_url {
                    tracing::info!(task_id, livestream_url = %url, "task in progress");
                }
                handle.apply(&observation)
            });

            match poll {
                Ok(()) => {
                    transient_failures = 0;
                    if handle.is_terminal() {
                        tracing::debug!(task_id, status = ?handle.status, "task reached terminal status");
                        return Ok(handle);
                    }
                }
                Err(err) if poll_tolerable(&err) => {
                    transient_failures += 1;
                    tracing::warn!(
                        task_id,
                        transient_failures,
                        error = %err,
                        "transient poll failure"
                    );
                    if transient_failures > self.policy.max_transient_errors {
                        return Err(Error::Timeout(format!(
                            "gave up waiting for task {task_id}: {transient_failures} consecutive poll failures, last: {err}"
                        )));
                    }
                }
                Err(err) => return Err(err),
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(Error::Timeout(format!(
                    "task {task_id} still {:?} after {:?}",
                    handle.status, self.policy.max_wait
                )));
            }
            let sleep_for = interval.min(deadline - now);

            if cancel_open {
                tokio::select! {
                    _ = tokio::time::sleep(sleep_for) => {}
                    changed = cancel.changed() => match changed {
                        Ok(()) => {
                            if *cancel.borrow() {
                                return Ok(self.cancelled(handle).await);
                            }
                        }
                        Err(_) => {
                            // Sender dropped; nobody can cancel any more.
                            cancel_open = false;
                            tokio::time::sleep(sleep_for).await;
                        }
                    },
                }
            } else {
                tokio::time::sleep(sleep_for).await;
            }

            interval = (interval * 2).min(self.policy.max_interval);
        }
    }

    async fn cancelled(&self, mut handle: TaskHandle) -> TaskHandle {
        handle.mark_cancelled();
        // Best-effort remote cancel; the local state is already terminal.
        if let Err(err) = self.backend.cancel_task(&handle.task_id).await {
            tracing::warn!(task_id = %handle.task_id, error = %err, "remote cancel failed");
        }
        handle
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::testing::*;
    use serde_json::json;
    use std::sync::Arc;

    fn never_cancel() -> watch::Receiver<bool> {
        let (tx, rx) = watch::channel(false);
        // Keep the sender alive for the life of the test process.
        std::mem::forget(tx);
        rx
    }

    #[tokio::test(start_paused = true)]
    async fn completes_after_processing_polls() {
        let backend = Arc::new(ScriptedBackend::new());
        backend.push_poll(Ok(running_response()));
        backend.push_poll(Ok(running_response()));
        backend.push_poll(Ok(succeeded_response(vec![json!({"title": "Example Domain"})])));

        let poller = TaskPoller::new(backend.clone(), PollPolicy::default());
        let handle = poller
            .await_completion("task-1", never_cancel())
            .await
            .unwrap();

        assert_eq!(handle.status, TaskStatus::Succeeded);
        assert_eq!(
            handle.result_payload,
            Some(json!({"title": "Example Domain"}))
        );
        assert_eq!(backend.status_count(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn never_terminal_backend_times_out_within_deadline_plus_one_interval() {
        let backend = Arc::new(ScriptedBackend::new());
        let policy = PollPolicy {
            max_wait: Duration::from_secs(5),
            ..PollPolicy::default()
        };
        let poller = TaskPoller::new(backend, policy);

        let started = Instant::now();
        let err = poller
            .await_completion("task-1", never_cancel())
            .await
            .unwrap_err();
        let elapsed = started.elapsed();

        assert_eq!(err.kind(), "timeout");
        // max_wait plus at most one poll interval, never unbounded.
        assert!(elapsed <= Duration::from_secs(5) + Duration::from_secs(10));
    }

    #[tokio::test(start_paused = true)]
    async fn tolerates_bounded_transient_poll_failures() {
        let backend = Arc::new(ScriptedBackend::new());
        backend.push_poll(Err(Error::Network("blip".into())));
        backend.push_poll(Err(Error::Network("blip".into())));
        backend.push_poll(Ok(succeeded_response(vec![json!({"ok": true})])));

        let poller = TaskPoller::new(backend, PollPolicy::default());
        let handle = poller
            .await_completion("task-1", never_cancel())
            .await
            .unwrap();
        assert_eq!(handle.status, TaskStatus::Succeeded);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_transient_tolerance_is_a_timeout() {
        let backend = Arc::new(ScriptedBackend::new());
        for _ in 0..20 {
            backend.push_poll(Err(Error::Network("down".into())));
        }
        let policy = PollPolicy {
            max_transient_errors: 3,
            ..PollPolicy::default()
        };
        let poller = TaskPoller::new(backend.clone(), policy);

        let err = poller
            .await_completion("task-1", never_cancel())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "timeout");
        assert_eq!(backend.status_count(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn auth_failure_ends_the_wait_immediately() {
        let backend = Arc::new(ScriptedBackend::new());
        backend.push_poll(Err(Error::Auth("bad key".into())));

        let poller = TaskPoller::new(backend.clone(), PollPolicy::default());
        let err = poller
            .await_completion("task-1", never_cancel())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "auth_error");
        assert_eq!(backend.status_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn intermittent_remote_error_does_not_abort_the_task() {
        let backend = Arc::new(ScriptedBackend::new());
        backend.push_poll(Err(Error::Remote {
            code: "internal".into(),
            message: "hiccup".into(),
        }));
        backend.push_poll(Ok(succeeded_response(vec![json!({"ok": true})])));

        let poller = TaskPoller::new(backend, PollPolicy::default());
        let handle = poller
            .await_completion("task-1", never_cancel())
            .await
            .unwrap();
        assert_eq!(handle.status, TaskStatus::Succeeded);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_signal_stops_polling_and_fires_remote_cancel() {
        let backend = Arc::new(ScriptedBackend::new());

        let (tx, rx) = watch::channel(false);
        let wait = tokio::spawn({
            let backend = backend.clone();
            async move {
                let poller = TaskPoller::new(backend, PollPolicy::default());
                poller.await_completion("task-1", rx).await
            }
        });

        // Let the first poll happen, then cancel.
        tokio::time::sleep(Duration::from_millis(100)).await;
        tx.send(true).unwrap();

        let handle = wait.await.unwrap().unwrap();
        assert_eq!(handle.status, TaskStatus::Cancelled);
        assert_eq!(backend.cancel_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_task_carries_error_detail() {
        let backend = Arc::new(ScriptedBackend::new());
        backend.push_poll(Ok(failed_response("element not found")));

        let poller = TaskPoller::new(backend, PollPolicy::default());
        let handle = poller
            .await_completion("task-1", never_cancel())
            .await
            .unwrap();
        assert_eq!(handle.status, TaskStatus::Failed);
        assert_eq!(handle.error_detail.as_deref(), Some("element not found"));
    }

    #[test]
    fn terminal_handle_is_idempotent_under_further_observations() {
        let mut handle = TaskHandle::new("task-1");
        handle
            .apply(&succeeded_response(vec![json!({"a": 1})]))
            .unwrap();
        assert_eq!(handle.status, TaskStatus::Succeeded);

        // Later observations no longer transition the handle.
        handle.apply(&failed_response("late failure")).unwrap();
        assert_eq!(handle.status, TaskStatus::Succeeded);
        assert_eq!(handle.result_payload, Some(json!({"a": 1})));
        assert!(handle.error_detail.is_none());

        handle.mark_cancelled();
        assert_eq!(handle.status, TaskStatus::Succeeded);
    }

    #[test]
    fn payload_extraction_shapes() {
        let single = succeeded_response(vec![json!({"a": 1})]);
        assert_eq!(extract_payload(&single), json!({"a": 1}));

        let multi = succeeded_response(vec![json!(1), json!(2)]);
        assert_eq!(extract_payload(&multi), json!([1, 2]));

        let mut bare = succeeded_response(vec![]);
        bare.properties = Some(json!({"pages_visited": 3}));
        assert_eq!(extract_payload(&bare), json!({"pages_visited": 3}));
    }
}
