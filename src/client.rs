//! LAM API client.
//!
//! [`LamClient`] is a thin, stateless wrapper over the remote Raccoon LAM
//! HTTP API: it attaches the credential pair to every request, applies a
//! bounded timeout, and deserializes responses into typed structs. The
//! [`LamBackend`] trait is the seam the poller and gateway work against, so
//! tests can substitute a scripted in-process backend. [`RetryingBackend`]
//! layers bounded exponential-backoff retry over any backend.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::config::Config;
use crate::error::{Error, Result};

/// Header carrying the Raccoon passcode on every outbound request.
pub const PASSCODE_HEADER: &str = "raccoon-passcode";

/// Terminal and non-terminal states of a remote LAM task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    /// Accepted by the remote API, not yet started.
    Pending,
    /// Actively executing.
    Running,
    /// Finished with a result payload.
    Succeeded,
    /// Finished with a remote failure.
    Failed,
    /// Stopped before completion.
    Cancelled,
}

impl TaskStatus {
    /// Whether this status is terminal (no further transitions).
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskStatus::Succeeded | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }

    /// Map a wire status string onto the local state machine.
    ///
    /// The remote API owns these strings; anything unrecognized is a
    /// malformed response, not a panic.
    pub fn from_wire(raw: &str) -> Result<Self> {
        match raw.to_ascii_uppercase().as_str() {
            "PENDING" | "QUEUED" => Ok(TaskStatus::Pending),
            "PROCESSING" | "RUNNING" | "IN_PROGRESS" => Ok(TaskStatus::Running),
            "DONE" | "SUCCEEDED" | "COMPLETED" | "SUCCESS" => Ok(TaskStatus::Succeeded),
            "FAILED" | "ERROR" | "FAILURE" => Ok(TaskStatus::Failed),
            "CANCELLED" | "CANCELED" => Ok(TaskStatus::Cancelled),
            other => Err(Error::Remote {
                code: "malformed_response".into(),
                message: format!("unknown task status: {other}"),
            }),
        }
    }
}

/// Execution mode for a LAM run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LamMode {
    /// Single-agent web task execution.
    Default,
    /// Multi-source research mode.
    DeepSearch,
}

/// Parameters for submitting a LAM run.
///
/// Built per invocation from validated tool arguments and dropped once the
/// corresponding response is produced. Credentials are never part of this
/// struct; they travel as request headers.
#[derive(Debug, Clone, Serialize)]
pub struct LamRunParams {
    /// The main prompt for the web agent.
    pub query: String,
    /// Entrypoint URL for the web agent.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub app_url: Option<String>,
    /// Expected shape of extracted data.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub schema: Option<Value>,
    /// Conversation history giving the model context.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub chat_history: Vec<Value>,
    /// Maximum number of results to extract.
    pub max_count: u32,
    /// Execution mode.
    pub mode: LamMode,
    /// Advanced session options (ad blocking, captcha solving, proxy).
    pub advanced: Value,
}

impl LamRunParams {
    /// Create run parameters with the given query and defaults elsewhere.
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            app_url: None,
            schema: None,
            chat_history: Vec::new(),
            max_count: 1,
            mode: LamMode::Default,
            advanced: default_advanced(),
        }
    }
}

/// Default advanced session options, matching the API defaults.
pub fn default_advanced() -> Value {
    json!({
        "block_ads": false,
        "solve_captchas": false,
        "proxy": false,
        "extension_ids": []
    })
}

/// Acknowledgement returned when a task is submitted.
#[derive(Debug, Clone, Deserialize)]
pub struct LamSubmission {
    /// Remote task identifier.
    pub task_id: String,
}

/// A single status observation of a remote task.
#[derive(Debug, Clone, Deserialize)]
pub struct LamStatusResponse {
    /// Wire status string (e.g. "PROCESSING", "DONE").
    pub task_status: String,
    /// Human-readable progress or failure message.
    #[serde(default)]
    pub message: Option<String>,
    /// Session properties reported by the agent.
    #[serde(default)]
    pub properties: Option<Value>,
    /// Extracted data items, present once the task succeeds.
    #[serde(default)]
    pub data: Option<Vec<Value>>,
    /// Live browser view URL, present while the task is running.
    #[serde(default)]
    pub livestream_url: Option<String>,
}

impl LamStatusResponse {
    /// Parse the wire status into the local state machine.
    pub fn status(&self) -> Result<TaskStatus> {
        TaskStatus::from_wire(&self.task_status)
    }
}

/// Operations the gateway needs from the remote LAM API.
#[async_trait]
pub trait LamBackend: Send + Sync {
    /// Submit a run, returning the remote task handle.
    async fn submit_task(&self, params: &LamRunParams) -> Result<LamSubmission>;

    /// Fetch the current status of a task.
    async fn task_status(&self, task_id: &str) -> Result<LamStatusResponse>;

    /// Ask the remote API to stop a task. Best-effort.
    async fn cancel_task(&self, task_id: &str) -> Result<()>;
}

#[async_trait]
impl<B: LamBackend + ?Sized> LamBackend for Arc<B> {
    async fn submit_task(&self, params: &LamRunParams) -> Result<LamSubmission> {
        (**self).submit_task(params).await
    }

    async fn task_status(&self, task_id: &str) -> Result<LamStatusResponse> {
        (**self).task_status(task_id).await
    }

    async fn cancel_task(&self, task_id: &str) -> Result<()> {
        (**self).cancel_task(task_id).await
    }
}

/// Bounded retry schedule for transient failures.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts, including the first (not "retries after").
    pub max_attempts: u32,
    /// Delay before the first retry.
    pub base_delay: Duration,
    /// Upper bound on any single delay.
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl RetryPolicy {
    /// Backoff delay before retry number `attempt` (1-based), with jitter.
    ///
    /// Doubles per attempt, capped at `max_delay`; jitter spreads the value
    /// over [delay/2, delay] so synchronized callers fan out.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(16);
        let raw = self
            .base_delay
            .saturating_mul(2u32.saturating_pow(exp))
            .min(self.max_delay);
        let half = raw / 2;
        half + rand::thread_rng().gen_range(Duration::ZERO..=raw - half)
    }
}

/// Retry decorator over any [`LamBackend`].
///
/// Only transient errors (network, rate limiting) are retried; auth and
/// remote errors propagate immediately.
pub struct RetryingBackend<B> {
    inner: B,
    policy: RetryPolicy,
}

impl<B: LamBackend> RetryingBackend<B> {
    /// Wrap a backend with the given retry policy.
    pub fn new(inner: B, policy: RetryPolicy) -> Self {
        Self { inner, policy }
    }

    async fn with_retry<T, F, Fut>(&self, what: &str, mut call: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<T>>,
    {
        let mut attempt = 1;
        loop {
            match call().await {
                Ok(value) => return Ok(value),
                Err(err) if err.is_transient() && attempt < self.policy.max_attempts => {
                    let delay = self.policy.delay_for(attempt);
                    tracing::warn!(
                        operation = what,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "transient LAM error, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }
}

#[async_trait]
impl<B: LamBackend> LamBackend for RetryingBackend<B> {
    async fn submit_task(&self, params: &LamRunParams) -> Result<LamSubmission> {
        self.with_retry("submit_task", || self.inner.submit_task(params))
            .await
    }

    async fn task_status(&self, task_id: &str) -> Result<LamStatusResponse> {
        self.with_retry("task_status", || self.inner.task_status(task_id))
            .await
    }

    async fn cancel_task(&self, task_id: &str) -> Result<()> {
        self.with_retry("cancel_task", || self.inner.cancel_task(task_id))
            .await
    }
}

/// HTTP implementation of [`LamBackend`] against the Raccoon LAM API.
///
/// Stateless apart from the shared reqwest connection pool, which is
/// internally synchronized and safe to reuse across concurrent invocations.
pub struct LamClient {
    http: reqwest::Client,
    config: Config,
}

impl LamClient {
    /// Build a client from the process configuration.
    pub fn new(config: Config) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| Error::Internal(format!("failed to build HTTP client: {e}")))?;
        Ok(Self { http, config })
    }

    fn authed(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        builder
            .bearer_auth(self.config.credentials.secret_key())
            .header(PASSCODE_HEADER, self.config.credentials.passcode())
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.config.base_url, path)
    }

    async fn send<T: serde::de::DeserializeOwned>(
        &self,
        builder: reqwest::RequestBuilder,
    ) -> Result<T> {
        let response = self.authed(builder).send().await.map_err(classify_reqwest)?;
        let status = response.status();
        let body = response.text().await.map_err(classify_reqwest)?;

        if !status.is_success() {
            return Err(classify_http_failure(status, &body));
        }

        serde_json::from_str(&body).map_err(|e| Error::Remote {
            code: "malformed_response".into(),
            message: format!("unexpected response shape: {e}"),
        })
    }

    /// Endpoint path for run submission.
    const RUN_PATH: &'static str = "/lam/run";

    fn task_path(task_id: &str) -> String {
        format!("/lam/tasks/{task_id}")
    }

    fn cancel_path(task_id: &str) -> String {
        format!("/lam/tasks/{task_id}/cancel")
    }
}

#[async_trait]
impl LamBackend for LamClient {
    async fn submit_task(&self, params: &LamRunParams) -> Result<LamSubmission> {
        self.send(self.http.post(self.url(Self::RUN_PATH)).json(params))
            .await
    }

    async fn task_status(&self, task_id: &str) -> Result<LamStatusResponse> {
        self.send(self.http.get(self.url(&Self::task_path(task_id))))
            .await
    }

    async fn cancel_task(&self, task_id: &str) -> Result<()> {
        let response = self
            .authed(self.http.post(self.url(&Self::cancel_path(task_id))))
            .send()
            .await
            .map_err(classify_reqwest)?;
        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            let body = response.text().await.unwrap_or_default();
            Err(classify_http_failure(status, &body))
        }
    }
}

fn classify_reqwest(err: reqwest::Error) -> Error {
    if err.is_timeout() {
        Error::Timeout(format!("request exceeded deadline: {err}"))
    } else {
        Error::Network(err.to_string())
    }
}

/// Map an HTTP failure status onto the error taxonomy.
///
/// 401/403 are credential rejections and never retried; 429 and 5xx are
/// transient; everything else surfaces the remote code and message verbatim.
fn classify_http_failure(status: reqwest::StatusCode, body: &str) -> Error {
    let detail = remote_detail(body);
    match status.as_u16() {
        401 | 403 => Error::Auth(detail.unwrap_or_else(|| "credentials rejected".into())),
        429 => Error::RateLimited(detail.unwrap_or_else(|| "too many requests".into())),
        500..=599 => Error::RateLimited(
            detail.unwrap_or_else(|| format!("server error: HTTP {}", status.as_u16())),
        ),
        code => Error::Remote {
            code: remote_code(body).unwrap_or_else(|| format!("http_{code}")),
            message: detail.unwrap_or_else(|| status.to_string()),
        },
    }
}

fn remote_detail(body: &str) -> Option<String> {
    let value: Value = serde_json::from_str(body).ok()?;
    value
        .get("error")
        .and_then(|e| e.get("message"))
        .or_else(|| value.get("message"))
        .and_then(Value::as_str)
        .map(String::from)
}

fn remote_code(body: &str) -> Option<String> {
    let value: Value = serde_json::from_str(body).ok()?;
    value
        .get("error")
        .and_then(|e| e.get("code"))
        .or_else(|| value.get("code"))
        .and_then(Value::as_str)
        .map(String::from)
}

#[cfg(test)]
pub(crate) mod testing {
    //! Scripted in-process backend for unit and integration tests.

    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;

    use super::*;

    /// Backend that replays scripted responses and counts calls.
    ///
    /// When the poll script runs out it keeps answering with a running
    /// status, which models a task that never terminates.
    #[derive(Default)]
    pub struct ScriptedBackend {
        pub submissions: Mutex<VecDeque<Result<LamSubmission>>>,
        pub polls: Mutex<VecDeque<Result<LamStatusResponse>>>,
        pub submit_calls: AtomicU32,
        pub status_calls: AtomicU32,
        pub cancel_calls: AtomicU32,
    }

    impl ScriptedBackend {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn push_submission(&self, result: Result<LamSubmission>) {
            self.submissions.lock().unwrap().push_back(result);
        }

        pub fn push_poll(&self, result: Result<LamStatusResponse>) {
            self.polls.lock().unwrap().push_back(result);
        }

        pub fn submit_count(&self) -> u32 {
            self.submit_calls.load(Ordering::SeqCst)
        }

        pub fn status_count(&self) -> u32 {
            self.status_calls.load(Ordering::SeqCst)
        }

        pub fn cancel_count(&self) -> u32 {
            self.cancel_calls.load(Ordering::SeqCst)
        }
    }

    /// A status response in the running state.
    pub fn running_response() -> LamStatusResponse {
        LamStatusResponse {
            task_status: "PROCESSING".into(),
            message: Some("working".into()),
            properties: None,
            data: None,
            livestream_url: Some("https://live.example.com/t1".into()),
        }
    }

    /// A succeeded status response carrying the given data items.
    pub fn succeeded_response(data: Vec<Value>) -> LamStatusResponse {
        LamStatusResponse {
            task_status: "DONE".into(),
            message: Some("completed".into()),
            properties: None,
            data: Some(data),
            livestream_url: None,
        }
    }

    /// A failed status response with the given message.
    pub fn failed_response(message: &str) -> LamStatusResponse {
        LamStatusResponse {
            task_status: "FAILED".into(),
            message: Some(message.into()),
            properties: None,
            data: None,
            livestream_url: None,
        }
    }

    #[async_trait]
    impl LamBackend for ScriptedBackend {
        async fn submit_task(&self, _params: &LamRunParams) -> Result<LamSubmission> {
            self.submit_calls.fetch_add(1, Ordering::SeqCst);
            self.submissions
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| {
                    Ok(LamSubmission {
                        task_id: "task-1".into(),
                    })
                })
        }

        async fn task_status(&self, _task_id: &str) -> Result<LamStatusResponse> {
            self.status_calls.fetch_add(1, Ordering::SeqCst);
            self.polls
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Ok(running_response()))
        }

        async fn cancel_task(&self, _task_id: &str) -> Result<()> {
            self.cancel_calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }
}
