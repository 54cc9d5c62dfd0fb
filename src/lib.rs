//! # raccoonai-mcp
//!
//! MCP (Model Context Protocol) server bridging tool calls to the Raccoon
//! AI LAM (large action model) web-automation API.
//!
//! This crate is a bounded, resilient protocol bridge: it exposes a fixed
//! set of schema-validated MCP tools, forwards them to the remote LAM API
//! with scoped credentials, drives long-running tasks to completion by
//! polling with backoff, and translates every failure into a structured
//! result before it crosses the MCP boundary.
//!
//! ## Available Tools
//!
//! - `lam_browse`: execute web tasks and workflows across sites
//! - `lam_extract`: extract structured data from a website against a schema
//! - `lam_deepsearch`: multi-source research and report gathering
//! - `lam_task`: multi-step workflows with conversation history
//! - `lam_sample_query`: a canned example LAM query
//!
//! ## Configuration
//!
//! Two secrets are required in the environment at startup:
//! `RACCOON_SECRET_KEY` and `RACCOON_PASSCODE`. The server refuses to start
//! without them. `RACCOON_API_BASE_URL` optionally overrides the API
//! endpoint.
//!
//! ## Usage with Claude Desktop
//!
//! ```json
//! {
//!   "mcpServers": {
//!     "raccoonai": {
//!       "command": "raccoonai-mcp",
//!       "env": {
//!         "RACCOON_SECRET_KEY": "...",
//!         "RACCOON_PASSCODE": "..."
//!       }
//!     }
//!   }
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod client;
pub mod config;
pub mod error;
pub mod gateway;
pub mod poller;
pub mod protocol;
pub mod server;
pub mod tools;

pub use client::{LamBackend, LamClient, RetryPolicy, RetryingBackend, TaskStatus};
pub use config::{Config, Credentials};
pub use error::{Error, Result};
pub use gateway::{Gateway, ToolResponse};
pub use poller::{PollPolicy, TaskHandle, TaskPoller};
pub use protocol::{JsonRpcRequest, JsonRpcResponse, McpMessage};
pub use server::McpServer;
pub use tools::{Tool, ToolContext, ToolRegistry};
