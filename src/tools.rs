//! Tool definitions and registry.
//!
//! The registry is built once at startup from a static tool table and is
//! read-only afterwards, so concurrent lookups need no locking. Every tool
//! declares a closed JSON schema; arguments are validated against it before
//! anything touches the network.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::watch;

use crate::client::{default_advanced, LamBackend, LamMode, LamRunParams};
use crate::error::{Error, Result};
use crate::poller::{PollPolicy, TaskHandle, TaskPoller};
use crate::protocol::ToolDefinition;

/// Tool trait for implementing MCP tools.
#[async_trait]
pub trait Tool: Send + Sync {
    /// Get the tool definition.
    fn definition(&self) -> ToolDefinition;

    /// Execute the tool with validated arguments.
    ///
    /// The cancel signal propagates a caller-initiated cancellation into
    /// any polling wait the tool starts.
    async fn execute(
        &self,
        arguments: Value,
        context: &ToolContext,
        cancel: watch::Receiver<bool>,
    ) -> Result<Value>;
}

impl std::fmt::Debug for dyn Tool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tool")
            .field("name", &self.definition().name)
            .finish()
    }
}

/// Shared context passed to tools during execution.
pub struct ToolContext {
    /// Backend used for all remote LAM operations.
    pub backend: Arc<dyn LamBackend>,
    /// Polling policy for long-running tasks.
    pub poll_policy: PollPolicy,
}

impl ToolContext {
    /// Create a tool context over the given backend.
    pub fn new(backend: Arc<dyn LamBackend>, poll_policy: PollPolicy) -> Self {
        Self {
            backend,
            poll_policy,
        }
    }

    /// Submit a run and poll it to a terminal status.
    ///
    /// `Succeeded` yields the result payload; `Failed` and `Cancelled`
    /// become errors for the gateway to translate.
    pub async fn run_to_completion(
        &self,
        params: LamRunParams,
        cancel: watch::Receiver<bool>,
    ) -> Result<Value> {
        let submission = self.backend.submit_task(&params).await?;
        tracing::info!(task_id = %submission.task_id, mode = ?params.mode, "LAM task submitted");
        drop(params);

        let poller = TaskPoller::new(self.backend.clone(), self.poll_policy.clone());
        let handle = poller.await_completion(&submission.task_id, cancel).await?;
        terminal_payload(handle)
    }
}

fn terminal_payload(handle: TaskHandle) -> Result<Value> {
    use crate::client::TaskStatus;
    match handle.status {
        TaskStatus::Succeeded => Ok(handle.result_payload.unwrap_or(Value::Null)),
        TaskStatus::Failed => Err(Error::Remote {
            code: "task_failed".into(),
            message: handle
                .error_detail
                .unwrap_or_else(|| "task failed without detail".into()),
        }),
        TaskStatus::Cancelled => Err(Error::Cancelled(format!(
            "task {} cancelled before completion",
            handle.task_id
        ))),
        status => Err(Error::Internal(format!(
            "poller returned non-terminal status {status:?}"
        ))),
    }
}

/// Registry of available tools.
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
    context: Arc<ToolContext>,
}

impl ToolRegistry {
    /// Build the registry with the built-in tool table.
    pub fn new(context: ToolContext) -> Self {
        let context = Arc::new(context);
        let mut tools: HashMap<String, Arc<dyn Tool>> = HashMap::new();

        let table: Vec<Arc<dyn Tool>> = vec![
            Arc::new(BrowseTool),
            Arc::new(ExtractTool),
            Arc::new(DeepSearchTool),
            Arc::new(MultiStepTaskTool),
            Arc::new(SampleQueryTool),
        ];
        for tool in table {
            let name = tool.definition().name.clone();
            debug_assert!(!tools.contains_key(&name), "duplicate tool name {name}");
            tools.insert(name, tool);
        }

        Self { tools, context }
    }

    /// Get tool definitions for the MCP catalog.
    pub fn list_tools(&self) -> Vec<ToolDefinition> {
        let mut tools: Vec<_> = self.tools.values().map(|t| t.definition()).collect();
        tools.sort_by(|a, b| a.name.cmp(&b.name));
        tools
    }

    /// Look up a tool by name.
    pub fn resolve(&self, name: &str) -> Result<Arc<dyn Tool>> {
        self.tools
            .get(name)
            .cloned()
            .ok_or_else(|| Error::ToolNotFound(name.to_string()))
    }

    /// Validate arguments, then execute a tool by name.
    pub async fn execute(
        &self,
        name: &str,
        arguments: Value,
        cancel: watch::Receiver<bool>,
    ) -> Result<Value> {
        let tool = self.resolve(name)?;
        let definition = tool.definition();
        validate_arguments(&definition.input_schema, &arguments)?;
        tool.execute(arguments, &self.context, cancel).await
    }
}

// ============================================================================
// Schema validation
// ============================================================================

/// Validate tool-call arguments against a declared input schema.
///
/// Schemas here are closed: unknown fields are rejected, required fields
/// must be present and non-null, and declared types (plus `minLength` and
/// `enum` where present) are enforced. Runs before any network call.
pub fn validate_arguments(schema: &Value, arguments: &Value) -> Result<()> {
    let empty = serde_json::Map::new();

    let args = match arguments {
        Value::Null => &empty,
        Value::Object(map) => map,
        other => {
            return Err(Error::InvalidParams(format!(
                "arguments must be an object, got {}",
                json_type_name(other)
            )))
        }
    };

    let properties = schema
        .get("properties")
        .and_then(Value::as_object)
        .unwrap_or(&empty);

    if let Some(required) = schema.get("required").and_then(Value::as_array) {
        for name in required.iter().filter_map(Value::as_str) {
            match args.get(name) {
                Some(value) if !value.is_null() => {}
                _ => {
                    return Err(Error::InvalidParams(format!(
                        "missing required field: {name}"
                    )))
                }
            }
        }
    }

    for (name, value) in args {
        let Some(declared) = properties.get(name) else {
            return Err(Error::InvalidParams(format!("unknown field: {name}")));
        };
        if value.is_null() {
            continue;
        }
        check_declared_type(name, declared, value)?;
    }

    Ok(())
}

fn check_declared_type(name: &str, declared: &Value, value: &Value) -> Result<()> {
    let expected = declared.get("type").and_then(Value::as_str);
    let matches = match expected {
        Some("string") => value.is_string(),
        Some("integer") => value.is_i64() || value.is_u64(),
        Some("number") => value.is_number(),
        Some("boolean") => value.is_boolean(),
        Some("object") => value.is_object(),
        Some("array") => value.is_array(),
        _ => true,
    };
    if !matches {
        return Err(Error::InvalidParams(format!(
            "field {name} must be of type {}, got {}",
            expected.unwrap_or("unknown"),
            json_type_name(value)
        )));
    }

    if let Some(min_len) = declared.get("minLength").and_then(Value::as_u64) {
        if let Some(s) = value.as_str() {
            if (s.trim().len() as u64) < min_len {
                return Err(Error::InvalidParams(format!(
                    "field {name} must be a non-empty string"
                )));
            }
        }
    }

    if let Some(allowed) = declared.get("enum").and_then(Value::as_array) {
        if !allowed.contains(value) {
            return Err(Error::InvalidParams(format!(
                "field {name} must be one of {allowed:?}"
            )));
        }
    }

    Ok(())
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

// ============================================================================
// Built-in Tools
// ============================================================================

/// Tool for executing web tasks and workflows via the LAM agent.
pub struct BrowseTool;

#[derive(Debug, Deserialize)]
struct BrowseArgs {
    query: String,
    app_url: Option<String>,
    max_count: Option<u32>,
    advanced: Option<Value>,
}

#[async_trait]
impl Tool for BrowseTool {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: "lam_browse".into(),
            description: "Browse and interact with the web: navigate pages, fill forms, and complete user-defined tasks across sites. Use for actions rather than data collection.".into(),
            input_schema: json!({
                "type": "object",
                "additionalProperties": false,
                "properties": {
                    "query": {
                        "type": "string",
                        "minLength": 1,
                        "description": "The task for the web agent, stated as a prompt"
                    },
                    "app_url": {
                        "type": "string",
                        "description": "Entrypoint URL for the web agent"
                    },
                    "max_count": {
                        "type": "integer",
                        "description": "Maximum number of results (default: 1)"
                    },
                    "advanced": {
                        "type": "object",
                        "description": "Advanced session options (block_ads, solve_captchas, proxy)"
                    }
                },
                "required": ["query"]
            }),
        }
    }

    async fn execute(
        &self,
        arguments: Value,
        context: &ToolContext,
        cancel: watch::Receiver<bool>,
    ) -> Result<Value> {
        let args: BrowseArgs =
            serde_json::from_value(arguments).map_err(|e| Error::InvalidParams(e.to_string()))?;

        let mut params = LamRunParams::new(args.query);
        params.app_url = args.app_url;
        params.max_count = args.max_count.unwrap_or(1);
        params.advanced = args.advanced.unwrap_or_else(default_advanced);

        context.run_to_completion(params, cancel).await
    }
}

/// Tool for structured data extraction from websites.
pub struct ExtractTool;

#[derive(Debug, Deserialize)]
struct ExtractArgs {
    url: String,
    schema: Value,
    query: Option<String>,
    max_count: Option<u32>,
}

#[async_trait]
impl Tool for ExtractTool {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: "lam_extract".into(),
            description: "Extract structured data from a website. Provide a schema describing the fields you want; the web agent returns matching data items.".into(),
            input_schema: json!({
                "type": "object",
                "additionalProperties": false,
                "properties": {
                    "url": {
                        "type": "string",
                        "minLength": 1,
                        "description": "URL of the website to extract data from"
                    },
                    "schema": {
                        "type": "object",
                        "description": "Expected shape of the extracted data, fields mapped to their purposes"
                    },
                    "query": {
                        "type": "string",
                        "description": "Optional instruction for the web agent"
                    },
                    "max_count": {
                        "type": "integer",
                        "description": "Maximum number of results to extract (default: 1)"
                    }
                },
                "required": ["url", "schema"]
            }),
        }
    }

    async fn execute(
        &self,
        arguments: Value,
        context: &ToolContext,
        cancel: watch::Receiver<bool>,
    ) -> Result<Value> {
        let args: ExtractArgs =
            serde_json::from_value(arguments).map_err(|e| Error::InvalidParams(e.to_string()))?;

        let mut params = LamRunParams::new(args.query.unwrap_or_else(|| {
            "Extract structured data matching the provided schema.".to_string()
        }));
        params.app_url = Some(args.url);
        params.schema = Some(args.schema);
        params.max_count = args.max_count.unwrap_or(1);

        context.run_to_completion(params, cancel).await
    }
}

/// Tool for multi-source research via deepsearch mode.
pub struct DeepSearchTool;

#[derive(Debug, Deserialize)]
struct DeepSearchArgs {
    query: String,
    schema: Option<Value>,
    max_count: Option<u32>,
}

#[async_trait]
impl Tool for DeepSearchTool {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: "lam_deepsearch".into(),
            description: "Research a question across multiple sources and compile the findings. Use when answering requires gathering information from more than one site. A schema may be supplied to structure the findings.".into(),
            input_schema: json!({
                "type": "object",
                "additionalProperties": false,
                "properties": {
                    "query": {
                        "type": "string",
                        "minLength": 1,
                        "description": "The research question"
                    },
                    "schema": {
                        "type": "object",
                        "description": "Optional shape for the compiled findings"
                    },
                    "max_count": {
                        "type": "integer",
                        "description": "Maximum number of results (default: 1)"
                    }
                },
                "required": ["query"]
            }),
        }
    }

    async fn execute(
        &self,
        arguments: Value,
        context: &ToolContext,
        cancel: watch::Receiver<bool>,
    ) -> Result<Value> {
        let args: DeepSearchArgs =
            serde_json::from_value(arguments).map_err(|e| Error::InvalidParams(e.to_string()))?;

        let mut params = LamRunParams::new(args.query);
        params.mode = LamMode::DeepSearch;
        params.schema = args.schema;
        params.max_count = args.max_count.unwrap_or(1);

        context.run_to_completion(params, cancel).await
    }
}

/// Tool for multi-step workflows spanning several sites.
pub struct MultiStepTaskTool;

#[derive(Debug, Deserialize)]
struct MultiStepTaskArgs {
    query: String,
    app_url: Option<String>,
    chat_history: Option<Vec<Value>>,
    advanced: Option<Value>,
}

#[async_trait]
impl Tool for MultiStepTaskTool {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: "lam_task".into(),
            description: "Execute a multi-step workflow across one or more websites, optionally carrying conversation history so the agent has context from earlier turns.".into(),
            input_schema: json!({
                "type": "object",
                "additionalProperties": false,
                "properties": {
                    "query": {
                        "type": "string",
                        "minLength": 1,
                        "description": "The workflow to execute, stated as a prompt"
                    },
                    "app_url": {
                        "type": "string",
                        "description": "URL to start the workflow from"
                    },
                    "chat_history": {
                        "type": "array",
                        "description": "Conversation history as a list of messages"
                    },
                    "advanced": {
                        "type": "object",
                        "description": "Advanced session options (block_ads, solve_captchas, proxy)"
                    }
                },
                "required": ["query"]
            }),
        }
    }

    async fn execute(
        &self,
        arguments: Value,
        context: &ToolContext,
        cancel: watch::Receiver<bool>,
    ) -> Result<Value> {
        let args: MultiStepTaskArgs =
            serde_json::from_value(arguments).map_err(|e| Error::InvalidParams(e.to_string()))?;

        let mut params = LamRunParams::new(args.query);
        params.app_url = args.app_url;
        params.chat_history = args.chat_history.unwrap_or_default();
        params.advanced = args.advanced.unwrap_or_else(default_advanced);

        context.run_to_completion(params, cancel).await
    }
}

/// Tool returning a sample LAM query document.
pub struct SampleQueryTool;

#[async_trait]
impl Tool for SampleQueryTool {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: "lam_sample_query".into(),
            description: "Return a sample LAM query demonstrating schemas, deepsearch mode, and advanced options.".into(),
            input_schema: json!({
                "type": "object",
                "additionalProperties": false,
                "properties": {},
                "required": []
            }),
        }
    }

    async fn execute(
        &self,
        _arguments: Value,
        _context: &ToolContext,
        _cancel: watch::Receiver<bool>,
    ) -> Result<Value> {
        Ok(json!({
            "query": "Find three YCombinator startups who got funded in W24",
            "app_url": "https://www.ycombinator.com/companies",
            "schema": {
                "name": "Name of the company as a string",
                "funding_season": "The funding season like W24 as a string",
                "address": {
                    "city": "What city is the company located in?",
                    "country": "Which country is the company located in?"
                }
            },
            "max_count": 3,
            "mode": "deepsearch",
            "advanced": {
                "block_ads": true,
                "solve_captchas": false
            }
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::testing::ScriptedBackend;

    fn registry() -> (Arc<ScriptedBackend>, ToolRegistry) {
        let backend = Arc::new(ScriptedBackend::new());
        let context = ToolContext::new(backend.clone(), PollPolicy::default());
        (backend, ToolRegistry::new(context))
    }

    fn never_cancel() -> watch::Receiver<bool> {
        let (tx, rx) = watch::channel(false);
        std::mem::forget(tx);
        rx
    }

    #[test]
    fn tool_names_are_unique_and_sorted_in_catalog() {
        let (_, registry) = registry();
        let tools = registry.list_tools();
        assert_eq!(tools.len(), 5);
        let names: Vec<_> = tools.iter().map(|t| t.name.as_str()).collect();
        let mut deduped = names.clone();
        deduped.dedup();
        assert_eq!(names, deduped);
        assert!(names.contains(&"lam_browse"));
        assert!(names.contains(&"lam_extract"));
        assert!(names.contains(&"lam_deepsearch"));
        assert!(names.contains(&"lam_task"));
    }

    #[test]
    fn resolve_unknown_tool() {
        let (_, registry) = registry();
        let err = registry.resolve("lam_transmogrify").unwrap_err();
        assert_eq!(err.kind(), "unknown_tool");
    }

    #[test]
    fn validation_missing_required_field() {
        let schema = json!({
            "type": "object",
            "properties": {"query": {"type": "string"}},
            "required": ["query"]
        });
        let err = validate_arguments(&schema, &json!({})).unwrap_err();
        assert_eq!(err.kind(), "invalid_params");
        assert!(err.to_string().contains("query"));
    }

    #[test]
    fn validation_rejects_unknown_field() {
        let schema = json!({
            "type": "object",
            "properties": {"query": {"type": "string"}},
            "required": ["query"]
        });
        let err =
            validate_arguments(&schema, &json!({"query": "q", "bogus": 1})).unwrap_err();
        assert!(err.to_string().contains("bogus"));
    }

    #[test]
    fn validation_enforces_declared_types() {
        let schema = json!({
            "type": "object",
            "properties": {
                "query": {"type": "string"},
                "max_count": {"type": "integer"},
                "schema": {"type": "object"}
            },
            "required": []
        });
        assert!(validate_arguments(&schema, &json!({"max_count": "three"})).is_err());
        assert!(validate_arguments(&schema, &json!({"schema": []})).is_err());
        assert!(validate_arguments(&schema, &json!({"max_count": 3})).is_ok());
    }

    #[test]
    fn validation_rejects_empty_bounded_strings() {
        let schema = json!({
            "type": "object",
            "properties": {"url": {"type": "string", "minLength": 1}},
            "required": ["url"]
        });
        assert!(validate_arguments(&schema, &json!({"url": "  "})).is_err());
        assert!(validate_arguments(&schema, &json!({"url": "https://example.com"})).is_ok());
    }

    #[test]
    fn validation_rejects_non_object_arguments() {
        let schema = json!({"type": "object", "properties": {}, "required": []});
        assert!(validate_arguments(&schema, &json!([1, 2])).is_err());
        assert!(validate_arguments(&schema, &Value::Null).is_ok());
    }

    #[tokio::test]
    async fn rejected_arguments_never_reach_the_backend() {
        let (backend, registry) = registry();
        let err = registry
            .execute("lam_extract", json!({"url": "https://example.com"}), never_cancel())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "invalid_params");
        assert_eq!(backend.submit_count(), 0);
        assert_eq!(backend.status_count(), 0);
    }

    #[tokio::test]
    async fn sample_query_tool_is_local() {
        let (backend, registry) = registry();
        let value = registry
            .execute("lam_sample_query", json!({}), never_cancel())
            .await
            .unwrap();
        assert_eq!(value["mode"], "deepsearch");
        assert_eq!(backend.submit_count(), 0);
    }
}
