//! MCP server implementation.
//!
//! Speaks JSON-RPC 2.0 over stdio. Tool calls run as independent tasks so a
//! long-running LAM task does not block protocol traffic, and a client
//! `notifications/cancelled` for an in-flight call propagates into the
//! poller through a per-invocation cancel signal.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::{mpsc, watch, RwLock};

use crate::error::{codes, Result};
use crate::gateway::Gateway;
use crate::protocol::{
    GetPromptParams, GetPromptResult, InitializeParams, InitializeResult, JsonRpcId,
    JsonRpcRequest, JsonRpcResponse, ListPromptsResult, ListResourcesResult, ListToolsResult,
    McpMessage, PromptArgument, PromptDefinition, PromptMessage, PromptsCapability,
    ReadResourceParams, ReadResourceResult, ResourceContents, ResourceDefinition,
    ResourcesCapability, ServerCapabilities, ServerInfo, ToolCallParams, ToolsCapability,
};

/// MCP protocol version.
pub const PROTOCOL_VERSION: &str = "2024-11-05";

/// Server name.
pub const SERVER_NAME: &str = "raccoonai-mcp";

/// Server version.
pub const SERVER_VERSION: &str = env!("CARGO_PKG_VERSION");

/// URI of the LAM request schema resource.
pub const LAM_SCHEMA_URI: &str = "schema://raccoonai_lam_tool";

/// URI of the usage information resource.
pub const USAGE_URI: &str = "usage://lam";

/// MCP server state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
    /// Waiting for initialization.
    Uninitialized,
    /// Server is initialized and ready.
    Ready,
    /// Server is shutting down.
    ShuttingDown,
}

/// MCP server bridging tool calls to the LAM gateway.
#[derive(Clone)]
pub struct McpServer {
    state: Arc<RwLock<ServerState>>,
    gateway: Arc<Gateway>,
    in_flight: Arc<RwLock<HashMap<JsonRpcId, watch::Sender<bool>>>>,
}

impl McpServer {
    /// Create a server over a built gateway.
    pub fn new(gateway: Gateway) -> Self {
        Self {
            state: Arc::new(RwLock::new(ServerState::Uninitialized)),
            gateway: Arc::new(gateway),
            in_flight: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Run the server on stdio.
    ///
    /// Tool calls are spawned so invocations interleave; everything else is
    /// handled inline since it completes without suspension.
    pub async fn run_stdio(&self) -> Result<()> {
        let stdin = tokio::io::stdin();
        let mut lines = BufReader::new(stdin).lines();

        let (out_tx, mut out_rx) = mpsc::channel::<String>(32);
        let writer = tokio::spawn(async move {
            let mut stdout = tokio::io::stdout();
            while let Some(line) = out_rx.recv().await {
                if stdout.write_all(line.as_bytes()).await.is_err() {
                    break;
                }
                if stdout.write_all(b"\n").await.is_err() {
                    break;
                }
                let _ = stdout.flush().await;
            }
        });

        tracing::info!("MCP server starting on stdio");

        while let Some(line) = lines.next_line().await? {
            if line.is_empty() {
                continue;
            }

            tracing::debug!("Received: {}", line);

            if is_tool_call(&line) {
                let server = self.clone();
                let out = out_tx.clone();
                tokio::spawn(async move {
                    if let Some(response) = server.handle_message(&line).await {
                        if let Ok(json) = serde_json::to_string(&response) {
                            let _ = out.send(json).await;
                        }
                    }
                });
            } else if let Some(response) = self.handle_message(&line).await {
                let json = serde_json::to_string(&response)?;
                tracing::debug!("Sending: {}", json);
                if out_tx.send(json).await.is_err() {
                    break;
                }
            }

            if *self.state.read().await == ServerState::ShuttingDown {
                break;
            }
        }

        drop(out_tx);
        let _ = writer.await;

        tracing::info!("MCP server shutting down");
        Ok(())
    }

    /// Handle an incoming message.
    pub async fn handle_message(&self, json: &str) -> Option<JsonRpcResponse> {
        match McpMessage::parse(json) {
            Ok(McpMessage::Request(request)) => Some(self.handle_request(request).await),
            Ok(McpMessage::Notification(notification)) => {
                self.handle_notification(notification).await;
                None
            }
            Ok(McpMessage::Response(_)) => {
                // We don't expect responses in this direction
                None
            }
            Err(e) => Some(JsonRpcResponse::error(
                None,
                codes::PARSE_ERROR,
                e.to_string(),
            )),
        }
    }

    /// Handle a JSON-RPC request.
    async fn handle_request(&self, request: JsonRpcRequest) -> JsonRpcResponse {
        let id = request.id.clone();

        match request.method.as_str() {
            "initialize" => self.handle_initialize(id, request.params).await,
            "tools/list" => self.handle_tools_list(id).await,
            "tools/call" => self.handle_tools_call(id, request.params).await,
            "resources/list" => self.handle_resources_list(id).await,
            "resources/read" => self.handle_resources_read(id, request.params).await,
            "prompts/list" => self.handle_prompts_list(id).await,
            "prompts/get" => self.handle_prompts_get(id, request.params).await,
            "ping" => JsonRpcResponse::success(id, json!({})),
            "shutdown" => {
                *self.state.write().await = ServerState::ShuttingDown;
                JsonRpcResponse::success(id, json!({}))
            }
            _ => JsonRpcResponse::error(
                id,
                codes::METHOD_NOT_FOUND,
                format!("method not found: {}", request.method),
            ),
        }
    }

    /// Handle a notification (no response expected).
    async fn handle_notification(&self, notification: JsonRpcRequest) {
        match notification.method.as_str() {
            "notifications/initialized" => {
                tracing::info!("Client initialized");
            }
            "notifications/cancelled" => {
                self.handle_cancelled(notification.params).await;
            }
            "exit" => {
                *self.state.write().await = ServerState::ShuttingDown;
            }
            _ => {
                tracing::debug!("Unknown notification: {}", notification.method);
            }
        }
    }

    /// Propagate a client-side cancellation into the matching invocation.
    async fn handle_cancelled(&self, params: Option<Value>) {
        let Some(id) = params
            .as_ref()
            .and_then(|p| p.get("requestId"))
            .and_then(|v| serde_json::from_value::<JsonRpcId>(v.clone()).ok())
        else {
            tracing::debug!("cancellation notification without requestId");
            return;
        };

        if let Some(signal) = self.in_flight.read().await.get(&id) {
            tracing::info!(request_id = ?id, "cancelling in-flight tool call");
            let _ = signal.send(true);
        } else {
            tracing::debug!(request_id = ?id, "cancellation for unknown request");
        }
    }

    /// Handle initialize request.
    async fn handle_initialize(
        &self,
        id: Option<JsonRpcId>,
        params: Option<Value>,
    ) -> JsonRpcResponse {
        let _params: InitializeParams = match params {
            Some(p) => match serde_json::from_value(p) {
                Ok(params) => params,
                Err(e) => {
                    return JsonRpcResponse::error(
                        id,
                        codes::INVALID_PARAMS,
                        format!("invalid initialize params: {}", e),
                    );
                }
            },
            None => {
                return JsonRpcResponse::error(
                    id,
                    codes::INVALID_PARAMS,
                    "initialize params required",
                );
            }
        };

        *self.state.write().await = ServerState::Ready;

        let result = InitializeResult {
            protocol_version: PROTOCOL_VERSION.into(),
            capabilities: ServerCapabilities {
                tools: Some(ToolsCapability {
                    list_changed: false,
                }),
                resources: Some(ResourcesCapability {
                    subscribe: false,
                    list_changed: false,
                }),
                prompts: Some(PromptsCapability {
                    list_changed: false,
                }),
            },
            server_info: ServerInfo {
                name: SERVER_NAME.into(),
                version: SERVER_VERSION.into(),
            },
        };

        JsonRpcResponse::success(id, result)
    }

    async fn require_ready(&self, id: &Option<JsonRpcId>) -> Option<JsonRpcResponse> {
        if *self.state.read().await != ServerState::Ready {
            return Some(JsonRpcResponse::error(
                id.clone(),
                codes::INTERNAL_ERROR,
                "server not initialized",
            ));
        }
        None
    }

    /// Handle tools/list request.
    async fn handle_tools_list(&self, id: Option<JsonRpcId>) -> JsonRpcResponse {
        if let Some(err) = self.require_ready(&id).await {
            return err;
        }

        let result = ListToolsResult {
            tools: self.gateway.list_tools(),
        };
        JsonRpcResponse::success(id, result)
    }

    /// Handle tools/call request.
    async fn handle_tools_call(
        &self,
        id: Option<JsonRpcId>,
        params: Option<Value>,
    ) -> JsonRpcResponse {
        if let Some(err) = self.require_ready(&id).await {
            return err;
        }

        let params: ToolCallParams = match params {
            Some(p) => match serde_json::from_value(p) {
                Ok(params) => params,
                Err(e) => {
                    return JsonRpcResponse::error(
                        id,
                        codes::INVALID_PARAMS,
                        format!("invalid tool call params: {}", e),
                    );
                }
            },
            None => {
                return JsonRpcResponse::error(
                    id,
                    codes::INVALID_PARAMS,
                    "tool call params required",
                );
            }
        };

        let (cancel_tx, cancel_rx) = watch::channel(false);
        if let Some(request_id) = &id {
            self.in_flight
                .write()
                .await
                .insert(request_id.clone(), cancel_tx);
        }

        let response = self
            .gateway
            .dispatch(&params.name, params.arguments, cancel_rx)
            .await;

        if let Some(request_id) = &id {
            self.in_flight.write().await.remove(request_id);
        }

        // Tool-level failures ride in the result with isError set; only
        // protocol-level problems become JSON-RPC errors.
        JsonRpcResponse::success(id, response.into_call_result())
    }

    /// Handle resources/list request.
    async fn handle_resources_list(&self, id: Option<JsonRpcId>) -> JsonRpcResponse {
        if let Some(err) = self.require_ready(&id).await {
            return err;
        }

        let result = ListResourcesResult {
            resources: vec![
                ResourceDefinition {
                    uri: LAM_SCHEMA_URI.into(),
                    name: "LAM request schema".into(),
                    description: Some("JSON schema for LAM API requests".into()),
                    mime_type: Some("application/json".into()),
                },
                ResourceDefinition {
                    uri: USAGE_URI.into(),
                    name: "LAM API usage".into(),
                    description: Some("How to view Raccoon API usage and billing".into()),
                    mime_type: Some("text/plain".into()),
                },
            ],
        };
        JsonRpcResponse::success(id, result)
    }

    /// Handle resources/read request.
    async fn handle_resources_read(
        &self,
        id: Option<JsonRpcId>,
        params: Option<Value>,
    ) -> JsonRpcResponse {
        if let Some(err) = self.require_ready(&id).await {
            return err;
        }

        let params: ReadResourceParams = match params.map(serde_json::from_value) {
            Some(Ok(p)) => p,
            _ => {
                return JsonRpcResponse::error(id, codes::INVALID_PARAMS, "resource uri required")
            }
        };

        let contents = match params.uri.as_str() {
            LAM_SCHEMA_URI => ResourceContents {
                uri: params.uri.clone(),
                mime_type: Some("application/json".into()),
                text: serde_json::to_string_pretty(&lam_request_schema())
                    .unwrap_or_else(|_| "{}".into()),
            },
            USAGE_URI => ResourceContents {
                uri: params.uri.clone(),
                mime_type: Some("text/plain".into()),
                text: USAGE_INFO.into(),
            },
            other => {
                return JsonRpcResponse::error(
                    id,
                    codes::INVALID_PARAMS,
                    format!("unknown resource: {other}"),
                );
            }
        };

        JsonRpcResponse::success(
            id,
            ReadResourceResult {
                contents: vec![contents],
            },
        )
    }

    /// Handle prompts/list request.
    async fn handle_prompts_list(&self, id: Option<JsonRpcId>) -> JsonRpcResponse {
        if let Some(err) = self.require_ready(&id).await {
            return err;
        }

        JsonRpcResponse::success(
            id,
            ListPromptsResult {
                prompts: prompt_catalog(),
            },
        )
    }

    /// Handle prompts/get request.
    async fn handle_prompts_get(
        &self,
        id: Option<JsonRpcId>,
        params: Option<Value>,
    ) -> JsonRpcResponse {
        if let Some(err) = self.require_ready(&id).await {
            return err;
        }

        let params: GetPromptParams = match params.map(serde_json::from_value) {
            Some(Ok(p)) => p,
            _ => return JsonRpcResponse::error(id, codes::INVALID_PARAMS, "prompt name required"),
        };

        let arg = |name: &str| -> Option<String> {
            params
                .arguments
                .get(name)
                .and_then(Value::as_str)
                .map(String::from)
        };

        let rendered = match params.name.as_str() {
            "extract_data" => {
                let (Some(website_url), Some(data)) = (arg("website_url"), arg("data_to_extract"))
                else {
                    return JsonRpcResponse::error(
                        id,
                        codes::INVALID_PARAMS,
                        "extract_data requires website_url and data_to_extract",
                    );
                };
                extract_data_prompt(&website_url, &data)
            }
            "execute_web_task" => {
                let (Some(entrypoint), Some(task)) =
                    (arg("entrypoint_url"), arg("task_to_execute"))
                else {
                    return JsonRpcResponse::error(
                        id,
                        codes::INVALID_PARAMS,
                        "execute_web_task requires entrypoint_url and task_to_execute",
                    );
                };
                execute_web_task_prompt(&entrypoint, &task)
            }
            other => {
                return JsonRpcResponse::error(
                    id,
                    codes::INVALID_PARAMS,
                    format!("unknown prompt: {other}"),
                );
            }
        };

        JsonRpcResponse::success(
            id,
            GetPromptResult {
                description: None,
                messages: vec![PromptMessage::user(rendered)],
            },
        )
    }
}

/// Cheap sniff for tools/call so only long-running requests are spawned.
fn is_tool_call(line: &str) -> bool {
    serde_json::from_str::<Value>(line)
        .ok()
        .and_then(|v| v.get("method").and_then(Value::as_str).map(String::from))
        .is_some_and(|m| m == "tools/call")
}

/// The JSON schema describing LAM API requests, exposed as a resource.
pub fn lam_request_schema() -> Value {
    json!({
        "type": "object",
        "required": ["query"],
        "properties": {
            "query": {
                "type": "string",
                "description": "The input query string for the request. This is typically the main prompt."
            },
            "chat_history": {
                "type": "array",
                "description": "The history of the conversation as a list of messages to give the model context."
            },
            "app_url": {
                "type": "string",
                "description": "The entrypoint URL for the web agent."
            },
            "schema": {
                "type": "object",
                "description": "The expected schema for the response, describing fields and their purposes."
            },
            "max_count": {
                "type": "integer",
                "description": "The maximum number of results to extract (default: 1)."
            },
            "mode": {
                "type": "string",
                "enum": ["deepsearch", "default"],
                "description": "Mode of execution (default: 'default'). Use deepsearch when the task requires gathering information from multiple sources."
            },
            "advanced": {
                "type": "object",
                "description": "Advanced configuration options for the session."
            }
        }
    })
}

const USAGE_INFO: &str = "\
To view your Raccoon API usage:
1. Visit the usage page on Raccoon Platform at https://platform.flyingraccoon.tech/usage
2. View your current usage and billing information
";

fn extract_data_prompt(website_url: &str, data_to_extract: &str) -> String {
    format!(
        "I need to extract the following information from {website_url}:\n\n\
         {data_to_extract}\n\n\
         Please create a Raccoon LAM query that will extract this data in a structured format. Include:\n\
         1. The appropriate schema definition\n\
         2. Any advanced settings needed (like CAPTCHA solving if applicable)\n\
         3. The base app_url\n\
         4. A clear query instructing the web agent\n\
         5. A value for mode which can be default or deepsearch"
    )
}

fn execute_web_task_prompt(entrypoint_url: &str, task_to_execute: &str) -> String {
    format!(
        "I need to do the task: {task_to_execute} starting from the following website: {entrypoint_url}\n\n\
         Please create a Raccoon LAM query that will:\n\
         1. Visit the entrypoint url\n\
         2. Execute the required task on behalf of the user\n\
         3. Share acknowledgement with the user that the task is successful"
    )
}

fn prompt_catalog() -> Vec<PromptDefinition> {
    vec![
        PromptDefinition {
            name: "extract_data".into(),
            description: Some("Create a LAM query for extracting specific data from a website".into()),
            arguments: vec![
                PromptArgument {
                    name: "website_url".into(),
                    description: Some("URL of the website to extract data from".into()),
                    required: true,
                },
                PromptArgument {
                    name: "data_to_extract".into(),
                    description: Some("Description of the data to extract".into()),
                    required: true,
                },
            ],
        },
        PromptDefinition {
            name: "execute_web_task".into(),
            description: Some("Create a LAM query for executing actions on one or more websites".into()),
            arguments: vec![
                PromptArgument {
                    name: "entrypoint_url".into(),
                    description: Some("URL of the website to start the execution from".into()),
                    required: true,
                },
                PromptArgument {
                    name: "task_to_execute".into(),
                    description: Some("Description of the task to execute".into()),
                    required: true,
                },
            ],
        },
    ]
}
