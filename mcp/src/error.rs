//! MCP error types.
//!
//! All fallible operations return [`McpResult`]. Errors never cross the API
//! boundary as panics; callers that need the wire shape convert through
//! [`McpError::code`] and [`McpError::to_error_body`].

use serde_json::{json, Value};
use thiserror::Error;

pub type McpResult<T> = Result<T, McpError>;

#[derive(Debug, Error)]
pub enum McpError {
    /// I/O failure or request timeout (-32000).
    #[error("Request timed out: {0}")]
    Timeout(String),

    #[error("Transport error: {0}")]
    Transport(String),

    /// Permission veto, repetition block, or server unavailable (-32001).
    #[error("{0}")]
    PolicyDenied(String),

    #[error("{0}")]
    LoopBlocked(String),

    #[error("{0}")]
    ServerUnavailable(String),

    /// Server not connected or repeatedly failing (-32002).
    #[error("{0}")]
    ServerUnhealthy(String),

    #[error("Tool not found: {0}")]
    ToolNotFound(String),

    /// Invalid parameters or failed schema validation (-32602).
    #[error("{0}")]
    InvalidArguments(String),

    #[error("Configuration error: {0}")]
    Config(String),

    /// Error declared by the server and surfaced verbatim.
    #[error("{message}")]
    Server { code: i64, message: String },

    #[error("Internal error: {0}")]
    Internal(String),
}

impl McpError {
    /// Stable error-code assignment for the wire shape.
    pub fn code(&self) -> i64 {
        match self {
            McpError::Timeout(_) | McpError::Transport(_) => -32000,
            McpError::PolicyDenied(_)
            | McpError::LoopBlocked(_)
            | McpError::ServerUnavailable(_) => -32001,
            McpError::ServerUnhealthy(_) => -32002,
            McpError::ToolNotFound(_) => -32601,
            McpError::InvalidArguments(_) => -32602,
            McpError::Config(_) | McpError::Internal(_) => -32603,
            McpError::Server { code, .. } => *code,
        }
    }

    /// The structured error shape handed to upstream consumers:
    /// `{"error": true, "message": ..., "code": ...}`.
    pub fn to_error_body(&self) -> Value {
        json!({
            "error": true,
            "message": self.to_string(),
            "code": self.code(),
        })
    }

    /// Server-declared security blocks are never retried and surface
    /// verbatim.
    pub fn is_security_block(&self) -> bool {
        matches!(self, McpError::Server { message, .. } if message.contains("SECURITY BLOCK"))
    }

    pub fn is_timeout(&self) -> bool {
        match self {
            McpError::Timeout(_) => true,
            McpError::Server { message, .. } => {
                let lower = message.to_lowercase();
                lower.contains("timed out") || lower.contains("timeout")
            }
            _ => false,
        }
    }
}
