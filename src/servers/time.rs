//! Built-in time server: a single `get_current_time` tool.

use chrono::format::{Item, StrftimeItems};
use chrono::Local;
use serde_json::{json, Value};

use super::{error_response, result_response};

const DEFAULT_FORMAT: &str = "%Y-%m-%d %H:%M:%S %Z";

/// Handle one request; `None` for notifications.
pub fn handle_request(request: &Value) -> Option<Value> {
    let method = request.get("method").and_then(Value::as_str)?;
    let id = request.get("id").cloned().unwrap_or(Value::Null);
    eprintln!("Received request: {}", method);

    match method {
        "initialize" => Some(result_response(
            id,
            json!({
                "protocolVersion": "2024-11-05",
                "capabilities": { "tools": { "listChanged": true } },
                "serverInfo": { "name": "time-server", "version": env!("CARGO_PKG_VERSION") }
            }),
        )),
        "notifications/initialized" => None,
        "tools/list" => Some(result_response(
            id,
            json!({
                "tools": [{
                    "name": "get_current_time",
                    "description": "Get the current local date and time",
                    "inputSchema": {
                        "type": "object",
                        "properties": {
                            "format": {
                                "type": "string",
                                "description": "Optional strftime format string"
                            }
                        },
                        "required": []
                    }
                }]
            }),
        )),
        "tools/call" => {
            let params = request.get("params").cloned().unwrap_or(json!({}));
            let tool_name = params.get("name").and_then(Value::as_str).unwrap_or("");
            if tool_name != "get_current_time" {
                return Some(error_response(
                    id,
                    -32602,
                    format!("Unknown tool: {}", tool_name),
                ));
            }

            let format = params
                .get("arguments")
                .and_then(|a| a.get("format"))
                .and_then(Value::as_str)
                .unwrap_or(DEFAULT_FORMAT);

            let items: Vec<Item> = StrftimeItems::new(format).collect();
            if items.iter().any(|item| matches!(item, Item::Error)) {
                return Some(error_response(
                    id,
                    -32602,
                    format!("Invalid time format: {}", format),
                ));
            }

            let now = Local::now().format_with_items(items.into_iter()).to_string();
            Some(result_response(
                id,
                json!({ "content": [{ "type": "text", "text": now }] }),
            ))
        }
        other => Some(error_response(
            id,
            -32601,
            format!("Method not found: {}", other),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn call(method: &str, params: Value) -> Value {
        json!({ "jsonrpc": "2.0", "id": 1, "method": method, "params": params })
    }

    #[test]
    fn test_initialize_advertises_tools_capability() {
        let response = handle_request(&call("initialize", json!({}))).unwrap();
        assert_eq!(response["result"]["protocolVersion"], "2024-11-05");
        assert!(response["result"]["capabilities"]["tools"].is_object());
    }

    #[test]
    fn test_initialized_notification_has_no_response() {
        let notification = json!({ "jsonrpc": "2.0", "method": "notifications/initialized" });
        assert!(handle_request(&notification).is_none());
    }

    #[test]
    fn test_tools_list() {
        let response = handle_request(&call("tools/list", json!({}))).unwrap();
        let tools = response["result"]["tools"].as_array().unwrap();
        assert_eq!(tools.len(), 1);
        assert_eq!(tools[0]["name"], "get_current_time");
        assert_eq!(tools[0]["inputSchema"]["type"], "object");
    }

    #[test]
    fn test_get_current_time_returns_text() {
        let response = handle_request(&call(
            "tools/call",
            json!({ "name": "get_current_time", "arguments": {} }),
        ))
        .unwrap();
        let text = response["result"]["content"][0]["text"].as_str().unwrap();
        assert!(!text.is_empty());
    }

    #[test]
    fn test_custom_format() {
        let response = handle_request(&call(
            "tools/call",
            json!({ "name": "get_current_time", "arguments": { "format": "%Y" } }),
        ))
        .unwrap();
        let text = response["result"]["content"][0]["text"].as_str().unwrap();
        assert_eq!(text.len(), 4);
        assert!(text.chars().all(|c| c.is_ascii_digit()));
    }

    #[test]
    fn test_invalid_format_rejected() {
        let response = handle_request(&call(
            "tools/call",
            json!({ "name": "get_current_time", "arguments": { "format": "%Q%Q" } }),
        ))
        .unwrap();
        assert_eq!(response["error"]["code"], -32602);
    }

    #[test]
    fn test_unknown_tool_rejected() {
        let response =
            handle_request(&call("tools/call", json!({ "name": "other", "arguments": {} })))
                .unwrap();
        assert_eq!(response["error"]["code"], -32602);
    }

    #[test]
    fn test_unknown_method() {
        let response = handle_request(&call("bogus/method", json!({}))).unwrap();
        assert_eq!(response["error"]["code"], -32601);
    }
}
