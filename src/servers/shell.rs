//! Built-in shell server: executes allow-listed commands with a timeout.
//!
//! The allow-list is pattern-based: each permitted command matches as a
//! leading word, pipelines may only chain permitted commands, and git is
//! restricted to read-only operations. Everything else is refused with a
//! SECURITY BLOCK error.

use std::time::Duration;

use regex::Regex;
use serde_json::{json, Value};

use super::{error_response, result_response};

/// Commands permitted by default.
const DEFAULT_ALLOWED_COMMANDS: &[&str] = &[
    "ls", "cat", "pwd", "grep", "wc", "touch", "find", "date", "od", "df", "netstat", "lsof",
    "ps", "sed", "awk", "cut", "sort", "which", "hexdump", "xxd", "tail", "head", "echo",
    "printf", "tr", "uniq", "column", "nl", "tee", "base64", "md5sum", "sha1sum", "sha256sum",
    "bc", "expr", "seq", "paste", "join", "fold", "expand", "cd", "tree", "less", "xargs",
    "curl", "ping", "du", "file",
];

/// Read-only git operations and their patterns.
const GIT_PATTERNS: &[(&str, &str)] = &[
    ("status", r"^git\s+status(\s+.*)?$"),
    ("log", r"^git\s+log(\s+.*)?$"),
    ("show", r"^git\s+show(\s+.*)?$"),
    ("diff", r"^git\s+diff(\s+.*)?$"),
    ("branch", r"^git\s+branch(\s+(?:[^-].*|-[^dD-].*)?)?$"),
    ("remote", r"^git\s+remote(\s+(?:(?:[^r].*)|r[^me].*)?)?$"),
    ("ls-files", r"^git\s+ls-files(\s+.*)?$"),
    ("ls-tree", r"^git\s+ls-tree(\s+.*)?$"),
    ("blame", r"^git\s+blame(\s+.*)?$"),
    ("rev-parse", r"^git\s+rev-parse(\s+.*)?$"),
    ("describe", r"^git\s+describe(\s+.*)?$"),
    ("shortlog", r"^git\s+shortlog(\s+.*)?$"),
    ("reflog", r"^git\s+reflog(\s+.*)?$"),
];

const DEFAULT_COMMAND_TIMEOUT_SECS: u64 = 30;
const DEFAULT_CALL_TIMEOUT_SECS: f64 = 10.0;

pub struct ShellServer {
    allowed_commands: Vec<String>,
    patterns: Vec<(String, Regex)>,
    command_timeout: Duration,
}

impl ShellServer {
    /// Build from the environment: `ALLOW_COMMANDS` extends the allow-list,
    /// `GIT_OPERATIONS_ENABLED` gates the git patterns, `COMMAND_TIMEOUT`
    /// overrides the default per-command timeout.
    pub fn from_env() -> Self {
        let mut allowed: Vec<String> = DEFAULT_ALLOWED_COMMANDS
            .iter()
            .map(|c| c.to_string())
            .collect();
        if let Ok(extra) = std::env::var("ALLOW_COMMANDS") {
            for cmd in extra.split(',') {
                let cmd = cmd.trim();
                if !cmd.is_empty() && !allowed.iter().any(|a| a == cmd) {
                    allowed.push(cmd.to_string());
                }
            }
        }

        let git_enabled = std::env::var("GIT_OPERATIONS_ENABLED")
            .map(|v| matches!(v.to_lowercase().as_str(), "true" | "1" | "yes"))
            .unwrap_or(true);

        let command_timeout = std::env::var("COMMAND_TIMEOUT")
            .ok()
            .and_then(|v| v.trim().parse().ok())
            .map(Duration::from_secs)
            .unwrap_or(Duration::from_secs(DEFAULT_COMMAND_TIMEOUT_SECS));

        let patterns = build_patterns(&allowed, git_enabled);
        eprintln!(
            "Shell server starting with {} allowed command patterns",
            patterns.len()
        );
        eprintln!("Git operations enabled: {}", git_enabled);

        Self {
            allowed_commands: allowed,
            patterns,
            command_timeout,
        }
    }

    /// A command is allowed when its first line matches any allow pattern.
    pub fn is_command_allowed(&self, command: &str) -> bool {
        let command = command.trim();
        if command.is_empty() {
            return false;
        }
        // Only the first line counts; pasted output must not smuggle extras.
        let command = command.lines().next().unwrap_or("").trim();
        self.patterns.iter().any(|(name, pattern)| {
            if pattern.is_match(command) {
                eprintln!("Command '{}' matched pattern '{}'", command, name);
                true
            } else {
                false
            }
        })
    }

    pub fn allowed_commands_description(&self) -> String {
        let mut names: Vec<&str> = self
            .allowed_commands
            .iter()
            .map(String::as_str)
            .collect();
        names.sort_unstable();
        names.join(", ")
    }

    /// Handle one request; `None` for notifications.
    pub async fn handle_request(&self, request: Value) -> Option<Value> {
        let method = request.get("method").and_then(Value::as_str)?.to_string();
        let id = request.get("id").cloned().unwrap_or(Value::Null);
        eprintln!("Received request: {}", method);

        match method.as_str() {
            "initialize" => Some(result_response(
                id,
                json!({
                    "protocolVersion": "2024-11-05",
                    "capabilities": { "tools": { "listChanged": true } },
                    "serverInfo": { "name": "shell-server", "version": env!("CARGO_PKG_VERSION") }
                }),
            )),
            "notifications/initialized" => None,
            "tools/list" => Some(result_response(
                id,
                json!({
                    "tools": [{
                        "name": "run_shell_command",
                        "description": format!(
                            "Execute a shell command. Allowed commands: {}",
                            self.allowed_commands_description()
                        ),
                        "inputSchema": {
                            "type": "object",
                            "properties": {
                                "command": {
                                    "type": "string",
                                    "description": "The shell command to execute"
                                },
                                "timeout": {
                                    "type": "number",
                                    "description": "Timeout in seconds (default: 10)",
                                    "default": 10
                                }
                            },
                            "required": ["command"]
                        }
                    }]
                }),
            )),
            "tools/call" => Some(self.handle_tool_call(id, &request).await),
            other => Some(error_response(
                id,
                -32601,
                format!("Method not found: {}", other),
            )),
        }
    }

    async fn handle_tool_call(&self, id: Value, request: &Value) -> Value {
        let params = request.get("params").cloned().unwrap_or(json!({}));
        let tool_name = params.get("name").and_then(Value::as_str).unwrap_or("");
        if tool_name != "run_shell_command" {
            return error_response(id, -32602, format!("Unknown tool: {}", tool_name));
        }

        let arguments = params.get("arguments").cloned().unwrap_or(json!({}));
        let Some(command) = arguments
            .get("command")
            .and_then(Value::as_str)
            .filter(|c| !c.trim().is_empty())
        else {
            return error_response(id, -32602, "Command is required");
        };

        // Timeout may arrive as a number or a numeric string.
        let timeout_secs = match arguments.get("timeout") {
            Some(Value::Number(n)) => n.as_f64().unwrap_or(DEFAULT_CALL_TIMEOUT_SECS),
            Some(Value::String(s)) => s.trim().parse().unwrap_or_else(|_| {
                eprintln!("Warning: invalid timeout value '{}', using default", s);
                self.command_timeout.as_secs_f64()
            }),
            _ => self.command_timeout.as_secs_f64(),
        };

        if !self.is_command_allowed(command) {
            eprintln!("Command '{}' did not match any allowed patterns", command);
            return error_response(
                id,
                -32602,
                format!(
                    "🚫 SECURITY BLOCK: Command '{}' is not allowed.\n\n📋 Allowed commands: \
                     {}\n\n💡 Tip: You can configure allowed commands in the Shell \
                     Configuration settings.",
                    command,
                    self.allowed_commands_description()
                ),
            );
        }

        eprintln!("Executing command: {}", command);
        let run = tokio::process::Command::new("sh")
            .arg("-c")
            .arg(command)
            .kill_on_drop(true)
            .output();
        match tokio::time::timeout(Duration::from_secs_f64(timeout_secs), run).await {
            Err(_) => error_response(
                id,
                -32603,
                format!("Command timed out after {} seconds", timeout_secs),
            ),
            Ok(Err(e)) => error_response(id, -32603, format!("Error executing command: {}", e)),
            Ok(Ok(output)) => {
                let mut text = format!("$ {}\n", command);
                text.push_str(&String::from_utf8_lossy(&output.stdout));
                text.push_str(&String::from_utf8_lossy(&output.stderr));
                if let Some(code) = output.status.code() {
                    if code != 0 {
                        text.push_str(&format!("\n[Exit code: {}]", code));
                    }
                }
                result_response(id, json!({ "content": [{ "type": "text", "text": text }] }))
            }
        }
    }
}

fn build_patterns(allowed: &[String], git_enabled: bool) -> Vec<(String, Regex)> {
    let mut patterns = Vec::new();

    for cmd in allowed {
        if cmd.starts_with("git ") {
            continue;
        }
        let pattern = format!(r"(?i)^{}(\s+.*)?$", regex::escape(cmd));
        if let Ok(re) = Regex::new(&pattern) {
            patterns.push((cmd.clone(), re));
        }
    }

    // Pipelines chaining only allowed commands.
    let alternatives: Vec<String> = allowed
        .iter()
        .filter(|c| !c.starts_with("git "))
        .map(|c| regex::escape(c))
        .collect();
    let alternation = alternatives.join("|");
    if let Ok(re) = Regex::new(&format!(
        r"(?i)^({alt})(\s+[^|]*?)?(\s*\|\s*({alt})(\s+[^|]*?)?)*$",
        alt = alternation
    )) {
        patterns.push(("piped_commands".to_string(), re));
    }

    // find -exec restricted to allowed commands.
    if let Ok(re) = Regex::new(&format!(r"(?i)^find\s+.*-exec\s+({})\s+.*$", alternation)) {
        patterns.push(("find_exec".to_string(), re));
    }

    if git_enabled {
        for (name, pattern) in GIT_PATTERNS {
            if let Ok(re) = Regex::new(pattern) {
                patterns.push((format!("git_{}", name.replace('-', "_")), re));
            }
        }
    }

    patterns
}

#[cfg(test)]
mod tests {
    use super::*;

    fn server() -> ShellServer {
        let allowed: Vec<String> = DEFAULT_ALLOWED_COMMANDS
            .iter()
            .map(|c| c.to_string())
            .collect();
        let patterns = build_patterns(&allowed, true);
        ShellServer {
            allowed_commands: allowed,
            patterns,
            command_timeout: Duration::from_secs(DEFAULT_COMMAND_TIMEOUT_SECS),
        }
    }

    fn call(command: &str, timeout: Option<f64>) -> Value {
        let mut arguments = json!({ "command": command });
        if let Some(t) = timeout {
            arguments["timeout"] = json!(t);
        }
        json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": "tools/call",
            "params": { "name": "run_shell_command", "arguments": arguments }
        })
    }

    #[test]
    fn test_simple_commands_allowed() {
        let server = server();
        assert!(server.is_command_allowed("ls -la"));
        assert!(server.is_command_allowed("pwd"));
        assert!(server.is_command_allowed("echo hello world"));
        assert!(server.is_command_allowed("git status"));
    }

    #[test]
    fn test_dangerous_commands_blocked() {
        let server = server();
        assert!(!server.is_command_allowed("rm -rf /"));
        assert!(!server.is_command_allowed("sudo reboot"));
        assert!(!server.is_command_allowed("git push origin main"));
        assert!(!server.is_command_allowed(""));
    }

    #[test]
    fn test_pipelines_of_allowed_commands() {
        let server = server();
        assert!(server.is_command_allowed("ls -la | grep rs | wc -l"));
        assert!(!server.is_command_allowed("ls | rm -rf /"));
    }

    #[test]
    fn test_only_first_line_considered() {
        let server = server();
        assert!(server.is_command_allowed("ls\nrm -rf /"));
        assert!(!server.is_command_allowed("rm -rf /\nls"));
    }

    #[tokio::test]
    async fn test_blocked_command_returns_security_block() {
        let server = server();
        let response = server.handle_request(call("rm -rf /tmp/x", None)).await.unwrap();
        assert_eq!(response["error"]["code"], -32602);
        assert!(response["error"]["message"]
            .as_str()
            .unwrap()
            .contains("SECURITY BLOCK"));
    }

    #[tokio::test]
    async fn test_command_executes_with_shell_style_output() {
        let server = server();
        let response = server.handle_request(call("echo hello", None)).await.unwrap();
        let text = response["result"]["content"][0]["text"].as_str().unwrap();
        assert!(text.starts_with("$ echo hello\n"));
        assert!(text.contains("hello"));
    }

    #[tokio::test]
    async fn test_nonzero_exit_code_reported() {
        let server = server();
        let response = server
            .handle_request(call("ls /definitely/not/a/path", None))
            .await
            .unwrap();
        let text = response["result"]["content"][0]["text"].as_str().unwrap();
        assert!(text.contains("[Exit code:"));
    }

    #[tokio::test]
    async fn test_command_timeout_is_error() {
        let server = server();
        // `tail -f` on a pipe never terminates; the 1 s cap converts it into
        // a server-declared timeout error.
        let response = server
            .handle_request(call("tail -f /dev/null", Some(1.0)))
            .await
            .unwrap();
        assert_eq!(response["error"]["code"], -32603);
        assert!(response["error"]["message"]
            .as_str()
            .unwrap()
            .contains("timed out"));
    }

    #[tokio::test]
    async fn test_missing_command_rejected() {
        let server = server();
        let request = json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": "tools/call",
            "params": { "name": "run_shell_command", "arguments": {} }
        });
        let response = server.handle_request(request).await.unwrap();
        assert_eq!(response["error"]["code"], -32602);
    }

    #[tokio::test]
    async fn test_tools_list_describes_shell_tool() {
        let server = server();
        let request = json!({ "jsonrpc": "2.0", "id": 1, "method": "tools/list" });
        let response = server.handle_request(request).await.unwrap();
        let tool = &response["result"]["tools"][0];
        assert_eq!(tool["name"], "run_shell_command");
        assert_eq!(tool["inputSchema"]["required"][0], "command");
    }
}
