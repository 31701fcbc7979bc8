//! Core types for extracted tool calls.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A parsed tool invocation: tool name plus a JSON object of arguments.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub tool_name: String,
    pub arguments: Value,
}

impl ToolCall {
    pub fn new(tool_name: impl Into<String>, arguments: Value) -> Self {
        Self {
            tool_name: tool_name.into(),
            arguments,
        }
    }

    /// Canonical form used for dedup hashing: name plus arguments with
    /// sorted keys (serde_json's default map ordering).
    pub fn canonical(&self) -> String {
        format!("{}:{}", self.tool_name, self.arguments)
    }
}

/// A tool call extracted from a stream, together with the raw
/// sentinel-delimited block it was parsed from.
#[derive(Debug, Clone, PartialEq)]
pub struct ExtractedCall {
    pub raw_block: String,
    pub call: ToolCall,
}
