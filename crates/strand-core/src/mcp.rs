//! MCP client contract and the sensitive-environment filter.
//!
//! The engine consumes tool servers through this trait; the wire transports
//! (child process with line-delimited JSON-RPC over stdio, or SSE + POST)
//! live outside the workspace. Local transports spawning child processes
//! must strip sensitive variables from the child environment via
//! [`filter_sensitive_env`] unless the caller explicitly re-supplied them;
//! the shell executor applies the same filter to its children.

use std::collections::HashMap;
use std::sync::LazyLock;
use std::time::Duration;

use futures_util::future::BoxFuture;
use regex::Regex;
use serde_json::Value;
use strand_types::llm::ToolDef;
use thiserror::Error;

/// Default per-request timeout for MCP calls.
pub const DEFAULT_MCP_TIMEOUT: Duration = Duration::from_secs(60);

/// Environment variable names matching this pattern are stripped from
/// spawned children.
static SENSITIVE_ENV: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        "(?i)(API_KEY|APIKEY|TOKEN|SECRET|PASSWORD|PASSWD|PWD|CREDENTIAL|AUTH|ACCESS_KEY|PRIVATE_KEY)",
    )
    .expect("valid sensitive-env pattern")
});

/// Errors from an MCP client implementation.
#[derive(Debug, Error)]
pub enum McpError {
    #[error("mcp transport error: {0}")]
    Transport(String),

    #[error("mcp request timed out")]
    Timeout,

    #[error("mcp tool '{tool}' failed: {message}")]
    Tool { tool: String, message: String },

    #[error("mcp server stopped")]
    Stopped,
}

/// Tool-server client consumed by llm steps.
///
/// Request ids are monotonic per client; each request carries a configurable
/// timeout (default 60 s). Object-safe by construction so the engine context
/// can hold a heterogeneous `HashMap<String, Arc<dyn McpClient>>`.
pub trait McpClient: Send + Sync {
    /// Server name as referenced by `mcp_servers` in llm steps.
    fn name(&self) -> &str;

    /// Perform the protocol handshake. Idempotent.
    fn initialize<'a>(&'a self) -> BoxFuture<'a, Result<(), McpError>>;

    /// Tools the server exposes.
    fn list_tools<'a>(&'a self) -> BoxFuture<'a, Result<Vec<ToolDef>, McpError>>;

    /// Invoke a tool.
    fn call_tool<'a>(
        &'a self,
        name: &'a str,
        args: Value,
    ) -> BoxFuture<'a, Result<Value, McpError>>;

    /// Shut the transport down.
    fn stop<'a>(&'a self) -> BoxFuture<'a, Result<(), McpError>>;
}

/// Remove sensitive variables from an environment map, keeping any name the
/// caller explicitly re-supplied in `allow`.
pub fn filter_sensitive_env(
    env: impl IntoIterator<Item = (String, String)>,
    allow: &[String],
) -> HashMap<String, String> {
    env.into_iter()
        .filter(|(name, _)| {
            allow.iter().any(|a| a == name) || !SENSITIVE_ENV.is_match(name)
        })
        .collect()
}
