//! Extraction of complete tool-call blocks from model output.
//!
//! All surface forms are treated equivalently:
//!
//! ```text
//! <TOOL_SENTINEL><name>tool</name><arguments>{...}</arguments></TOOL_SENTINEL>
//! <TOOL_SENTINEL><n>tool</n><arguments>{...}</arguments></TOOL_SENTINEL>
//! <TOOL_SENTINEL><name>tool</name>{...}</TOOL_SENTINEL>
//! <TOOL_SENTINEL><invoke name="tool"><parameter name="k">v</parameter></invoke></TOOL_SENTINEL>
//! <run_shell_command><command>ls</command></run_shell_command>
//! ```
//!
//! The bare-tag form is accepted only for a small allow-list of known tools.

use regex::Regex;
use serde_json::{Map, Value};

use crate::{repair::repair_json_arguments, sentinel::Sentinel, types::ToolCall};

/// Tools that may be invoked with bare `<tool_name>...</tool_name>` tags.
pub const KNOWN_BARE_TOOLS: &[&str] = &["get_current_time", "run_shell_command"];

/// Parser for sentinel-delimited tool calls.
///
/// Regexes are compiled once per parser against the configured sentinel pair.
pub struct SentinelParser {
    sentinel: Sentinel,
    re_tagged_complete: Regex,
    re_tagged_partial: Regex,
    re_invoke: Regex,
    re_param: Regex,
    re_direct: Regex,
    re_simple_name: Regex,
    re_args: Regex,
}

impl SentinelParser {
    pub fn new(sentinel: Sentinel) -> Self {
        let open = regex::escape(sentinel.open());
        let close = regex::escape(sentinel.close());

        let re_tagged_complete = Regex::new(&format!(
            r"(?s){open}\s*<(?:name|n)>([^<]+)</(?:name|n)>\s*<arguments>\s*(\{{.*?\}})\s*</arguments>\s*{close}"
        ))
        .expect("tagged pattern");
        let re_tagged_partial = Regex::new(&format!(
            r"(?s){open}\s*<(?:name|n)>([^<]+)</(?:name|n)>\s*<arguments>\s*(\{{.*?\}})\s*</arguments>"
        ))
        .expect("partial pattern");
        let re_invoke = Regex::new(&format!(
            r#"(?s){open}\s*<invoke\s+name="([^"]+)"[^>]*>(.*?)</invoke>\s*{close}"#
        ))
        .expect("invoke pattern");
        let re_param =
            Regex::new(r#"(?s)<parameter\s+name="([^"]+)"[^>]*>(.*?)</parameter>"#).expect("param pattern");
        let re_direct = Regex::new(&format!(
            r"(?s){open}\s*<(?:name|n)>([^<]+)</(?:name|n)>\s*(\{{.*?\}})\s*{close}"
        ))
        .expect("direct pattern");
        let re_simple_name = Regex::new(r"<(?:name|n)>([^<]+)</(?:name|n)>").expect("name pattern");
        let re_args =
            Regex::new(r"(?s)<arguments>\s*(\{.*?\})\s*</arguments>").expect("args pattern");

        Self {
            sentinel,
            re_tagged_complete,
            re_tagged_partial,
            re_invoke,
            re_param,
            re_direct,
            re_simple_name,
            re_args,
        }
    }

    pub fn sentinel(&self) -> &Sentinel {
        &self.sentinel
    }

    /// Parse a tool call out of `content`, trying each surface form in turn.
    /// Returns `None` if no coherent call could be extracted.
    pub fn parse_tool_call(&self, content: &str) -> Option<ToolCall> {
        // Format 1/2: name tags with <arguments>, complete then unterminated.
        for re in [&self.re_tagged_complete, &self.re_tagged_partial] {
            if let Some(caps) = re.captures(content) {
                let tool_name = caps[1].trim().to_string();
                return parse_arguments(&caps[2])
                    .map(|arguments| ToolCall::new(tool_name, arguments));
            }
        }

        // Format 4: <invoke name="..."><parameter .../></invoke>
        if let Some(caps) = self.re_invoke.captures(content) {
            let tool_name = caps[1].trim().to_string();
            let mut arguments = Map::new();
            for param in self.re_param.captures_iter(&caps[2]) {
                let key = param[1].to_string();
                let raw = param[2].trim();
                // Parameter values may themselves be JSON; fall back to string.
                let value = serde_json::from_str(raw)
                    .unwrap_or_else(|_| Value::String(raw.to_string()));
                arguments.insert(key, value);
            }
            return Some(ToolCall::new(tool_name, Value::Object(arguments)));
        }

        // Format 3: name tags with a bare JSON object, no <arguments> wrapper.
        if let Some(caps) = self.re_direct.captures(content) {
            let tool_name = caps[1].trim().to_string();
            return parse_arguments(&caps[2]).map(|arguments| ToolCall::new(tool_name, arguments));
        }

        // Format 5: bare tags for the known-tool allow-list.
        if let Some(call) = parse_bare_tool_call(content) {
            return Some(call);
        }

        // Fallback: a name tag somewhere, with or without a separate
        // arguments block.
        if let Some(caps) = self.re_simple_name.captures(content) {
            let tool_name = caps[1].trim().to_string();
            let arguments = self
                .re_args
                .captures(content)
                .and_then(|a| serde_json::from_str(&a[1]).ok())
                .unwrap_or_else(|| Value::Object(Map::new()));
            return Some(ToolCall::new(tool_name, arguments));
        }

        if content.contains(self.sentinel.open()) {
            let preview: String = content.chars().take(120).collect();
            tracing::warn!("Sentinel found but no tool call could be parsed from: {}...", preview);
        }
        None
    }

    /// Fast-path test: does this text contain what looks like a complete
    /// tool-call block? The [`parse_tool_call`](Self::parse_tool_call)
    /// verdict remains authoritative.
    pub fn contains_complete_call(&self, text: &str) -> bool {
        if text.contains(self.sentinel.open()) && text.contains(self.sentinel.close()) {
            let has_name = (text.contains("<n>") && text.contains("</n>"))
                || (text.contains("<name>") && text.contains("</name>"));
            let has_args = text.contains("<arguments>") && text.contains("</arguments>");
            if has_name && has_args {
                return true;
            }
            if text.contains("<invoke name=") && text.contains("</invoke>") {
                return true;
            }
        }
        bare_complete_call(text).is_some()
    }

    /// Hold-path test: an opened but unterminated sentinel or known-tool tag.
    pub fn contains_partial(&self, text: &str) -> bool {
        if text.contains(self.sentinel.open()) && !text.contains(self.sentinel.close()) {
            return true;
        }
        for tool in KNOWN_BARE_TOOLS {
            let open = format!("<{}", tool);
            let close = format!("</{}>", tool);
            if text.contains(&open) && !text.contains(&close) {
                return true;
            }
        }
        false
    }
}

impl Default for SentinelParser {
    fn default() -> Self {
        Self::new(Sentinel::from_env())
    }
}

/// Parse an arguments blob, repairing it if it is not valid JSON.
fn parse_arguments(raw: &str) -> Option<Value> {
    match serde_json::from_str(raw) {
        Ok(value) => Some(value),
        Err(first_err) => {
            let repaired = repair_json_arguments(raw);
            match serde_json::from_str(&repaired) {
                Ok(value) => {
                    tracing::debug!("Recovered tool arguments after JSON repair");
                    Some(value)
                }
                Err(_) => {
                    tracing::warn!("Failed to parse tool arguments: {}", first_err);
                    None
                }
            }
        }
    }
}

/// Find a complete bare `<tool>...</tool>` span for a known tool.
fn bare_complete_call(text: &str) -> Option<(&'static str, usize, usize)> {
    for tool in KNOWN_BARE_TOOLS {
        let open = format!("<{}>", tool);
        let close = format!("</{}>", tool);
        if let Some(start) = text.find(&open) {
            if let Some(close_start) = text[start..].find(&close) {
                return Some((tool, start, start + close_start + close.len()));
            }
        }
    }
    None
}

fn parse_bare_tool_call(content: &str) -> Option<ToolCall> {
    let (tool, start, end) = bare_complete_call(content)?;
    let inner = &content[start..end];

    let mut arguments = Map::new();
    if tool == "run_shell_command" {
        let command = extract_inner_tag(inner, "command")?;
        if command.trim().is_empty() {
            return None;
        }
        arguments.insert("command".to_string(), Value::String(command.trim().to_string()));
        if let Some(timeout) = extract_inner_tag(inner, "timeout") {
            if let Ok(n) = timeout.trim().parse::<i64>() {
                arguments.insert("timeout".to_string(), Value::from(n));
            }
        }
    }
    Some(ToolCall::new(tool.to_string(), Value::Object(arguments)))
}

fn extract_inner_tag(text: &str, tag: &str) -> Option<String> {
    let open = format!("<{}>", tag);
    let close = format!("</{}>", tag);
    let start = text.find(&open)? + open.len();
    let end = text[start..].find(&close)? + start;
    Some(text[start..end].to_string())
}

/// Validate a parsed tool call before execution: required fields present,
/// non-empty name, object arguments, and a non-empty `command` for the
/// shell-command family.
pub fn validate_tool_call(call: &ToolCall) -> bool {
    if call.tool_name.trim().is_empty() {
        tracing::error!("Tool call has an empty name");
        return false;
    }
    if !call.arguments.is_object() {
        tracing::error!("Tool call arguments must be an object, got: {}", call.arguments);
        return false;
    }
    if call.tool_name.contains("run_shell_command") {
        match call.arguments.get("command").and_then(Value::as_str) {
            Some(command) if !command.trim().is_empty() => {}
            _ => {
                tracing::error!("Shell command tool missing a non-empty 'command' argument");
                return false;
            }
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn parser() -> SentinelParser {
        SentinelParser::new(Sentinel::default())
    }

    #[test]
    fn test_parse_name_tag_format() {
        let content = r#"<TOOL_SENTINEL><name>get_current_time</name><arguments>{}</arguments></TOOL_SENTINEL>"#;
        let call = parser().parse_tool_call(content).unwrap();
        assert_eq!(call.tool_name, "get_current_time");
        assert_eq!(call.arguments, json!({}));
    }

    #[test]
    fn test_parse_n_tag_format() {
        let content = r#"<TOOL_SENTINEL><n>run_shell_command</n><arguments>{"command": "ls"}</arguments></TOOL_SENTINEL>"#;
        let call = parser().parse_tool_call(content).unwrap();
        assert_eq!(call.tool_name, "run_shell_command");
        assert_eq!(call.arguments["command"], "ls");
    }

    #[test]
    fn test_parse_direct_json_format() {
        let content = r#"<TOOL_SENTINEL><name>search</name>{"query": "rust"}</TOOL_SENTINEL>"#;
        let call = parser().parse_tool_call(content).unwrap();
        assert_eq!(call.tool_name, "search");
        assert_eq!(call.arguments["query"], "rust");
    }

    #[test]
    fn test_parse_invoke_format() {
        let content = r#"<TOOL_SENTINEL><invoke name="fetch"><parameter name="url">https://example.com</parameter><parameter name="raw">true</parameter></invoke></TOOL_SENTINEL>"#;
        let call = parser().parse_tool_call(content).unwrap();
        assert_eq!(call.tool_name, "fetch");
        assert_eq!(call.arguments["url"], "https://example.com");
        assert_eq!(call.arguments["raw"], true);
    }

    #[test]
    fn test_parse_bare_known_tool() {
        let content = "<run_shell_command><command>pwd</command></run_shell_command>";
        let call = parser().parse_tool_call(content).unwrap();
        assert_eq!(call.tool_name, "run_shell_command");
        assert_eq!(call.arguments["command"], "pwd");
    }

    #[test]
    fn test_parse_bare_unknown_tool_rejected() {
        let content = "<format_disk><target>/dev/sda</target></format_disk>";
        assert!(parser().parse_tool_call(content).is_none());
    }

    #[test]
    fn test_parse_unterminated_sentinel() {
        let content = r#"<TOOL_SENTINEL><n>get_current_time</n><arguments>{}</arguments>"#;
        let call = parser().parse_tool_call(content).unwrap();
        assert_eq!(call.tool_name, "get_current_time");
    }

    #[test]
    fn test_parse_repairs_malformed_arguments() {
        let content = r#"<TOOL_SENTINEL><n>run_shell_command</n><arguments>{command: "ls -la",}</arguments></TOOL_SENTINEL>"#;
        let call = parser().parse_tool_call(content).unwrap();
        assert_eq!(call.arguments["command"], "ls -la");
    }

    #[test]
    fn test_parse_unrepairable_arguments_returns_none() {
        // `{broken}` has no key/value shape; repair cannot save it, and the
        // failure is terminal rather than falling through to a looser format.
        let content = r#"<TOOL_SENTINEL><n>x</n><arguments>{broken}</arguments></TOOL_SENTINEL>"#;
        assert!(parser().parse_tool_call(content).is_none());
    }

    #[test]
    fn test_custom_sentinel() {
        let p = SentinelParser::new(Sentinel::new("ACTION"));
        let content = r#"<ACTION><name>search</name><arguments>{"q": 1}</arguments></ACTION>"#;
        let call = p.parse_tool_call(content).unwrap();
        assert_eq!(call.tool_name, "search");
    }

    #[test]
    fn test_contains_complete_call() {
        let p = parser();
        assert!(p.contains_complete_call(
            "<TOOL_SENTINEL><name>t</name><arguments>{}</arguments></TOOL_SENTINEL>"
        ));
        assert!(p.contains_complete_call(
            "<run_shell_command><command>ls</command></run_shell_command>"
        ));
        assert!(!p.contains_complete_call("<TOOL_SENTINEL><name>t</name>"));
        assert!(!p.contains_complete_call("plain text"));
    }

    #[test]
    fn test_contains_partial() {
        let p = parser();
        assert!(p.contains_partial("before <TOOL_SENTINEL><n>t</n>"));
        assert!(p.contains_partial("<run_shell_command><command>ls"));
        assert!(!p.contains_partial("no markers at all"));
        assert!(!p.contains_partial(
            "<TOOL_SENTINEL><n>t</n><arguments>{}</arguments></TOOL_SENTINEL>"
        ));
    }

    #[test]
    fn test_validate_tool_call() {
        assert!(validate_tool_call(&ToolCall::new("get_current_time", json!({}))));
        assert!(!validate_tool_call(&ToolCall::new("", json!({}))));
        assert!(!validate_tool_call(&ToolCall::new("t", json!("not a map"))));
        assert!(!validate_tool_call(&ToolCall::new(
            "run_shell_command",
            json!({"command": "  "})
        )));
        assert!(validate_tool_call(&ToolCall::new(
            "mcp_run_shell_command",
            json!({"command": "ls"})
        )));
    }

    #[test]
    fn test_multiline_arguments() {
        let content = "<TOOL_SENTINEL>\n<name>run_shell_command</name>\n<arguments>\n{\"command\": \"echo hi\"}\n</arguments>\n</TOOL_SENTINEL>";
        let call = parser().parse_tool_call(content).unwrap();
        assert_eq!(call.arguments["command"], "echo hi");
    }
}
