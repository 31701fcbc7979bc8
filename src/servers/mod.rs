//! Built-in tool servers, shipped as sibling binaries.
//!
//! Each speaks the newline-delimited JSON-RPC dialect over stdio: one JSON
//! object per line, diagnostics on stderr. These double as the offline mock
//! servers for integration tests.

pub mod shell;
pub mod time;

use std::future::Future;

use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

/// Run a line-delimited JSON-RPC server over this process's stdio.
///
/// The handler returns `None` for notifications (no response is written).
/// Exits cleanly on stdin EOF.
pub async fn run_stdio_server<H, Fut>(mut handler: H) -> std::io::Result<()>
where
    H: FnMut(Value) -> Fut,
    Fut: Future<Output = Option<Value>>,
{
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdout = tokio::io::stdout();

    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let request: Value = match serde_json::from_str(line) {
            Ok(value) => value,
            Err(_) => {
                eprintln!("JSON decode error");
                continue;
            }
        };
        if let Some(response) = handler(request).await {
            let mut out = serde_json::to_string(&response)
                .map_err(|e| std::io::Error::other(e.to_string()))?;
            out.push('\n');
            stdout.write_all(out.as_bytes()).await?;
            stdout.flush().await?;
        }
    }
    eprintln!("EOF received, shutting down");
    Ok(())
}

/// Standard JSON-RPC error response.
pub(crate) fn error_response(id: Value, code: i64, message: impl Into<String>) -> Value {
    serde_json::json!({
        "jsonrpc": "2.0",
        "id": id,
        "error": { "code": code, "message": message.into() }
    })
}

/// Standard JSON-RPC result response.
pub(crate) fn result_response(id: Value, result: Value) -> Value {
    serde_json::json!({
        "jsonrpc": "2.0",
        "id": id,
        "result": result
    })
}
