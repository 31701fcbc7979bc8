//! Shared fixtures for integration tests: built-in server configs, a
//! scriptable mock tool server, and SSE stream collection.
#![allow(dead_code)]

use std::collections::HashMap;
use std::io::Write;
use std::path::Path;
use std::sync::Arc;

use bytes::Bytes;
use serde_json::Value;
use tokio::sync::mpsc;

use ziya::Core;
use ziya_mcp::{McpConfig, McpServerConfig, PermissionsStore};

pub fn server_config(name: &str, command: &str, args: Vec<String>) -> McpServerConfig {
    McpServerConfig {
        name: name.to_string(),
        command: command.to_string(),
        args,
        env: HashMap::new(),
        enabled: true,
        builtin: name == "time" || name == "shell",
        external_server: false,
        description: None,
    }
}

/// Configuration pointing at the real built-in server binaries.
pub fn builtin_test_config() -> McpConfig {
    let mut servers = HashMap::new();
    servers.insert(
        "time".to_string(),
        server_config("time", env!("CARGO_BIN_EXE_ziya-time-server"), vec![]),
    );
    servers.insert(
        "shell".to_string(),
        server_config("shell", env!("CARGO_BIN_EXE_ziya-shell-server"), vec![]),
    );
    McpConfig {
        servers,
        config_path: None,
        search_paths: vec![],
    }
}

/// A mock tool server whose `tools/call` always fails with the given error,
/// written as a shell script speaking the line-delimited dialect.
pub fn write_flaky_server_script(dir: &Path, error_code: i64, error_message: &str) -> String {
    let script = format!(
        r#"#!/bin/sh
while IFS= read -r line; do
  case "$line" in
    *'"initialize"'*)
      echo '{{"jsonrpc":"2.0","id":1,"result":{{"protocolVersion":"2024-11-05","capabilities":{{"tools":{{}}}},"serverInfo":{{"name":"mock","version":"0"}}}}}}'
      ;;
    *'"tools/list"'*)
      echo '{{"jsonrpc":"2.0","id":2,"result":{{"tools":[{{"name":"flaky_tool","description":"always fails","inputSchema":{{"type":"object","properties":{{"attempt":{{"type":"integer"}}}}}}}}]}}}}'
      ;;
    *'"tools/call"'*)
      echo '{{"jsonrpc":"2.0","id":3,"error":{{"code":{code},"message":"{message}"}}}}'
      ;;
  esac
done
"#,
        code = error_code,
        message = error_message,
    );
    let path = dir.join("mock_server.sh");
    let mut file = std::fs::File::create(&path).unwrap();
    file.write_all(script.as_bytes()).unwrap();
    path.display().to_string()
}

pub async fn core_with_config(config: McpConfig, dir: &Path) -> Arc<Core> {
    let permissions = Arc::new(PermissionsStore::with_path(dir.join("mcp_permissions.json")));
    Core::initialize_with_config(config, permissions).await
}

/// Drain the SSE channel into raw frames.
pub async fn collect_frames(mut rx: mpsc::Receiver<Result<Bytes, std::io::Error>>) -> Vec<String> {
    let mut frames = Vec::new();
    while let Some(chunk) = rx.recv().await {
        frames.push(String::from_utf8(chunk.unwrap().to_vec()).unwrap());
    }
    frames
}

/// Parse a `data:` frame's JSON payload; `None` for `[DONE]` or named
/// events.
pub fn frame_payload(frame: &str) -> Option<Value> {
    let data = frame.strip_prefix("data: ")?.trim_end();
    serde_json::from_str(data).ok()
}

/// Classify a frame by its payload shape: `content`, `tool_call`,
/// `tool_result`, `tool_error`, `warning`, `error`, a named `event`, or the
/// terminal `done`.
pub fn frame_kind(frame: &str) -> String {
    if frame.starts_with("event: ") {
        return "event".to_string();
    }
    if frame.trim_end() == "data: [DONE]" {
        return "done".to_string();
    }
    if let Some(payload) = frame_payload(frame) {
        for key in [
            "content",
            "tool_call",
            "tool_result",
            "tool_error",
            "warning",
            "error",
            "type",
        ] {
            if payload.get(key).is_some() {
                return key.to_string();
            }
        }
    }
    "unknown".to_string()
}
