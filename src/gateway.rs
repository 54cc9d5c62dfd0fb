//! Tool-call dispatch.
//!
//! [`Gateway::dispatch`] is the single seam between the MCP boundary and
//! the LAM pipeline: resolve, validate, submit, poll, translate. No internal
//! error crosses it unconverted; every failure path becomes a
//! [`ToolResponse`] carrying a machine-readable kind and a human-readable
//! message, and secrets never appear in either.

use std::sync::Arc;

use serde::Serialize;
use serde_json::Value;
use tokio::sync::watch;
use uuid::Uuid;

use crate::error::Error;
use crate::protocol::{ContentItem, ToolCallResult, ToolDefinition};
use crate::tools::ToolRegistry;

/// Machine-readable error info attached to failed tool calls.
#[derive(Debug, Clone, Serialize)]
pub struct ErrorInfo {
    /// Stable error kind (e.g. "unknown_tool", "timeout").
    pub kind: String,
    /// Human-readable message.
    pub message: String,
}

/// Outcome of a single tool invocation. Produced exactly once per call.
#[derive(Debug, Clone, Serialize)]
pub struct ToolResponse {
    /// Whether the invocation succeeded.
    pub success: bool,
    /// Result payload on success.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
    /// Error info on failure.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorInfo>,
}

impl ToolResponse {
    /// Successful outcome with a payload.
    pub fn success(payload: Value) -> Self {
        Self {
            success: true,
            payload: Some(payload),
            error: None,
        }
    }

    /// Failed outcome translated from an internal error.
    pub fn failure(error: &Error) -> Self {
        Self {
            success: false,
            payload: None,
            error: Some(ErrorInfo {
                kind: error.kind().to_string(),
                message: error.to_string(),
            }),
        }
    }

    /// Render into the MCP tool-call result shape.
    pub fn into_call_result(self) -> ToolCallResult {
        let text = if self.success {
            let body = self
                .payload
                .as_ref()
                .map(|p| serde_json::to_string_pretty(p).unwrap_or_else(|_| p.to_string()))
                .unwrap_or_default();
            format!("Status: SUCCEEDED\n\n{body}")
        } else {
            match self.error.as_ref() {
                Some(info) => format!("Status: FAILED ({})\n\n{}", info.kind, info.message),
                None => "Status: FAILED".to_string(),
            }
        };

        ToolCallResult {
            content: vec![ContentItem::text(text)],
            is_error: !self.success,
        }
    }
}

/// Receives tool-call invocations and drives them through the registry.
pub struct Gateway {
    registry: Arc<ToolRegistry>,
}

impl Gateway {
    /// Create a gateway over a built registry.
    pub fn new(registry: ToolRegistry) -> Self {
        Self {
            registry: Arc::new(registry),
        }
    }

    /// Tool catalog for the MCP runtime.
    pub fn list_tools(&self) -> Vec<ToolDefinition> {
        self.registry.list_tools()
    }

    /// Dispatch a tool call. Infallible: every failure is translated.
    pub async fn dispatch(
        &self,
        tool_name: &str,
        raw_args: Value,
        cancel: watch::Receiver<bool>,
    ) -> ToolResponse {
        let invocation = Uuid::new_v4();
        tracing::info!(%invocation, tool = tool_name, "dispatching tool call");

        match self.registry.execute(tool_name, raw_args, cancel).await {
            Ok(payload) => {
                tracing::info!(%invocation, tool = tool_name, "tool call succeeded");
                ToolResponse::success(payload)
            }
            Err(err) => {
                tracing::warn!(
                    %invocation,
                    tool = tool_name,
                    kind = err.kind(),
                    error = %err,
                    "tool call failed"
                );
                ToolResponse::failure(&err)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::testing::*;
    use crate::client::LamSubmission;
    use crate::poller::PollPolicy;
    use crate::tools::ToolContext;
    use serde_json::json;

    fn gateway() -> (Arc<ScriptedBackend>, Gateway) {
        let backend = Arc::new(ScriptedBackend::new());
        let context = ToolContext::new(backend.clone(), PollPolicy::default());
        (backend, Gateway::new(ToolRegistry::new(context)))
    }

    fn never_cancel() -> watch::Receiver<bool> {
        let (tx, rx) = watch::channel(false);
        std::mem::forget(tx);
        rx
    }

    #[tokio::test]
    async fn unknown_tool_never_reaches_the_backend() {
        let (backend, gateway) = gateway();
        let response = gateway
            .dispatch("definitely_not_a_tool", json!({}), never_cancel())
            .await;

        assert!(!response.success);
        assert_eq!(response.error.as_ref().unwrap().kind, "unknown_tool");
        assert_eq!(backend.submit_count(), 0);
        assert_eq!(backend.status_count(), 0);
    }

    #[tokio::test]
    async fn missing_required_field_never_reaches_the_backend() {
        let (backend, gateway) = gateway();
        let response = gateway
            .dispatch("lam_browse", json!({"app_url": "https://example.com"}), never_cancel())
            .await;

        assert!(!response.success);
        assert_eq!(response.error.as_ref().unwrap().kind, "invalid_params");
        assert_eq!(backend.submit_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn extract_happy_path() {
        let (backend, gateway) = gateway();
        backend.push_submission(Ok(LamSubmission {
            task_id: "task-42".into(),
        }));
        backend.push_poll(Ok(succeeded_response(vec![
            json!({"title": "Example Domain"}),
        ])));

        let response = gateway
            .dispatch(
                "lam_extract",
                json!({"url": "https://example.com", "schema": {"title": "string"}}),
                never_cancel(),
            )
            .await;

        assert!(response.success);
        assert_eq!(response.payload, Some(json!({"title": "Example Domain"})));
        assert!(response.error.is_none());
        assert_eq!(backend.submit_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_task_is_translated_to_remote_error() {
        let (backend, gateway) = gateway();
        backend.push_poll(Ok(failed_response("login wall")));

        let response = gateway
            .dispatch("lam_browse", json!({"query": "buy a thing"}), never_cancel())
            .await;

        assert!(!response.success);
        let info = response.error.as_ref().unwrap();
        assert_eq!(info.kind, "remote_error");
        assert!(info.message.contains("login wall"));
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_is_translated() {
        let (backend, gateway) = gateway();
        let gateway = Arc::new(gateway);

        let (tx, rx) = watch::channel(false);
        let call = tokio::spawn({
            let gateway = gateway.clone();
            async move {
                gateway
                    .dispatch("lam_browse", json!({"query": "long task"}), rx)
                    .await
            }
        });

        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        tx.send(true).unwrap();

        let response = call.await.unwrap();
        assert!(!response.success);
        assert_eq!(response.error.as_ref().unwrap().kind, "cancelled");
        assert_eq!(backend.cancel_count(), 1);
    }

    #[test]
    fn call_result_rendering() {
        let ok = ToolResponse::success(json!({"a": 1})).into_call_result();
        assert!(!ok.is_error);

        let err = ToolResponse::failure(&Error::Timeout("too slow".into())).into_call_result();
        assert!(err.is_error);
        match &err.content[0] {
            ContentItem::Text { text } => {
                assert!(text.contains("timeout"));
                assert!(text.contains("too slow"));
            }
        }
    }
}
