//! Integration tests driving the real built-in tool-server binaries over
//! stdio.

mod common;

use serde_json::json;
use ziya_mcp::{ServerClient, ToolDescriptor};

use common::{builtin_test_config, core_with_config, server_config};

fn time_client() -> ServerClient {
    ServerClient::new(server_config(
        "time",
        env!("CARGO_BIN_EXE_ziya-time-server"),
        vec![],
    ))
}

fn shell_client() -> ServerClient {
    ServerClient::new(server_config(
        "shell",
        env!("CARGO_BIN_EXE_ziya-shell-server"),
        vec![],
    ))
}

#[tokio::test]
async fn test_connect_discovers_tools() {
    let client = time_client();
    assert!(client.connect().await);
    assert!(client.is_connected());

    let tools: Vec<ToolDescriptor> = client.tools();
    assert_eq!(tools.len(), 1);
    assert_eq!(tools[0].name, "get_current_time");
    assert_eq!(tools[0].input_schema["type"], "object");

    client.disconnect().await;
    assert!(!client.is_connected());
}

#[tokio::test]
async fn test_call_tool_returns_text_content() {
    let client = time_client();
    assert!(client.connect().await);

    let result = client.call_tool("get_current_time", json!({})).await.unwrap();
    let text = result["content"][0]["text"].as_str().unwrap();
    assert!(!text.is_empty());

    client.disconnect().await;
}

#[tokio::test]
async fn test_json_string_arguments_parsed_before_dispatch() {
    let client = shell_client();
    assert!(client.connect().await);

    // Arguments arrive as a JSON string; they must be parsed to an object
    // and dispatched with the decoded command.
    let result = client
        .call_tool("run_shell_command", json!(r#"{"command": "echo wrapped"}"#))
        .await
        .unwrap();
    let text = result["content"][0]["text"].as_str().unwrap();
    assert!(text.starts_with("$ echo wrapped"));
    assert!(text.contains("wrapped"));

    client.disconnect().await;
}

#[tokio::test]
async fn test_tool_input_wrapper_unwrapped() {
    let client = shell_client();
    assert!(client.connect().await);

    let result = client
        .call_tool(
            "run_shell_command",
            json!({"tool_input": {"command": "echo unwrapped"}}),
        )
        .await
        .unwrap();
    let text = result["content"][0]["text"].as_str().unwrap();
    assert!(text.contains("unwrapped"));

    client.disconnect().await;
}

#[tokio::test]
async fn test_missing_required_field_fails_without_dispatch() {
    let client = shell_client();
    assert!(client.connect().await);

    let err = client
        .call_tool("run_shell_command", json!({"timeout": 5}))
        .await
        .unwrap_err();
    assert_eq!(err.code(), -32602);
    assert!(err.to_string().contains("Missing required field: command"));

    client.disconnect().await;
}

#[tokio::test]
async fn test_security_block_surfaces_verbatim() {
    let client = shell_client();
    assert!(client.connect().await);
    client.set_tool_rate_limit("run_shell_command", 0.0);

    let err = client
        .call_tool("run_shell_command", json!({"command": "rm -rf /tmp/x"}))
        .await
        .unwrap_err();
    assert!(err.is_security_block());
    assert!(err.to_string().contains("SECURITY BLOCK"));

    client.disconnect().await;
}

#[tokio::test]
async fn test_timeout_coerced_from_string() {
    let client = shell_client();
    assert!(client.connect().await);
    client.set_tool_rate_limit("run_shell_command", 0.0);

    // "timeout" is declared as a number; a numeric string must coerce.
    let result = client
        .call_tool(
            "run_shell_command",
            json!({"command": "echo coerced", "timeout": "5"}),
        )
        .await
        .unwrap();
    let text = result["content"][0]["text"].as_str().unwrap();
    assert!(text.contains("coerced"));

    client.disconnect().await;
}

#[tokio::test]
async fn test_manager_aggregates_all_server_tools() {
    let dir = tempfile::tempdir().unwrap();
    let core = core_with_config(builtin_test_config(), dir.path()).await;
    let manager = core.manager();
    assert!(manager.is_initialized());

    // The aggregated list is exactly the union of tools/list across the
    // connected servers.
    let tools = manager.get_all_tools();
    let mut names: Vec<&str> = tools.iter().map(|t| t.tool.name.as_str()).collect();
    names.sort_unstable();
    assert_eq!(names, vec!["get_current_time", "run_shell_command"]);

    let by_server: Vec<(&str, &str)> = tools
        .iter()
        .map(|t| (t.server_name.as_str(), t.tool.name.as_str()))
        .collect();
    assert!(by_server.contains(&("time", "get_current_time")));
    assert!(by_server.contains(&("shell", "run_shell_command")));

    let status = core.server_status();
    assert_eq!(status["time"]["connected"], true);
    assert_eq!(status["shell"]["connected"], true);

    core.shutdown().await;
}

#[tokio::test]
async fn test_manager_routes_by_tool_name() {
    let dir = tempfile::tempdir().unwrap();
    let core = core_with_config(builtin_test_config(), dir.path()).await;

    let result = core
        .manager()
        .call_tool("get_current_time", json!({}), None, Some("conv-route"))
        .await
        .unwrap();
    assert!(result["content"][0]["text"].as_str().is_some());

    core.shutdown().await;
}

#[tokio::test]
async fn test_mcp_prefix_stripped_for_lookup() {
    let dir = tempfile::tempdir().unwrap();
    let core = core_with_config(builtin_test_config(), dir.path()).await;

    let result = core
        .manager()
        .call_tool("mcp_get_current_time", json!({}), None, Some("conv-prefix"))
        .await
        .unwrap();
    assert!(result["content"][0]["text"].as_str().is_some());

    core.shutdown().await;
}

#[tokio::test]
async fn test_disabled_tool_vetoed_without_dispatch() {
    let dir = tempfile::tempdir().unwrap();
    let core = core_with_config(builtin_test_config(), dir.path()).await;

    core.permissions()
        .update_tool_permission("time", "get_current_time", ziya_mcp::PermissionLevel::Disabled)
        .unwrap();

    let err = core
        .manager()
        .call_tool("get_current_time", json!({}), None, Some("conv-veto"))
        .await
        .unwrap_err();
    assert_eq!(err.code(), -32001);
    assert!(err.to_string().contains("disabled"));

    core.shutdown().await;
}

#[tokio::test]
async fn test_restart_server_reconnects() {
    let dir = tempfile::tempdir().unwrap();
    let core = core_with_config(builtin_test_config(), dir.path()).await;
    let manager = core.manager();

    assert!(manager.restart_server("time", None).await);
    let client = manager.get_client("time").unwrap();
    assert!(client.is_connected());

    let result = manager
        .call_tool("get_current_time", json!({}), Some("time"), Some("conv-restart"))
        .await
        .unwrap();
    assert!(result["content"][0]["text"].as_str().is_some());

    core.shutdown().await;
}

#[tokio::test]
async fn test_per_tool_rate_limit_spaces_calls() {
    let client = time_client();
    assert!(client.connect().await);
    client.set_tool_rate_limit("get_current_time", 1.0);

    let start = std::time::Instant::now();
    client.call_tool("get_current_time", json!({})).await.unwrap();
    client.call_tool("get_current_time", json!({})).await.unwrap();
    assert!(start.elapsed() >= std::time::Duration::from_secs(1));

    client.disconnect().await;
}

#[tokio::test]
async fn test_secure_tool_set_excludes_disabled() {
    let dir = tempfile::tempdir().unwrap();
    let core = core_with_config(builtin_test_config(), dir.path()).await;

    let names: Vec<String> = core.secure_tools().into_iter().map(|t| t.name).collect();
    assert!(names.contains(&"mcp_get_current_time".to_string()));
    assert!(names.contains(&"mcp_run_shell_command".to_string()));

    core.permissions()
        .update_tool_permission("shell", "run_shell_command", ziya_mcp::PermissionLevel::Disabled)
        .unwrap();

    let names: Vec<String> = core.secure_tools().into_iter().map(|t| t.name).collect();
    assert!(names.contains(&"mcp_get_current_time".to_string()));
    assert!(!names.contains(&"mcp_run_shell_command".to_string()));

    core.shutdown().await;
}
