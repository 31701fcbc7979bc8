//! Ordered repair steps for malformed JSON tool arguments.
//!
//! Models routinely emit argument blobs that are almost JSON: unquoted keys,
//! trailing commas, shell commands with raw quotes. Each step here is a pure
//! function; [`repair_json_arguments`] applies them in a fixed order that
//! must be preserved.

use once_cell::sync::Lazy;
use regex::{Captures, Regex};

static COMMAND_FIELD_START: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#""command"\s*:\s*""#).unwrap());

/// End-of-command-value anchors, tried in order.
static COMMAND_FIELD_ENDS: Lazy<Vec<Regex>> = Lazy::new(|| {
    vec![
        Regex::new(r#"",\s*"timeout""#).unwrap(),
        Regex::new(r#"",\s*"[^"]+"\s*:"#).unwrap(),
        Regex::new(r#""\s*\}"#).unwrap(),
    ]
});

static UNQUOTED_KEYS: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"([{,])\s*([A-Za-z0-9_]+)\s*:").unwrap());

static TRAILING_COMMA: Lazy<Regex> = Lazy::new(|| Regex::new(r",\s*\}").unwrap());

static UNQUOTED_VALUE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#""([^"]+)"\s*:\s*([^",{}\[\]]+?)\s*([,}])"#).unwrap());

static NUMBER_LIKE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^-?\d+(\.\d+)?$").unwrap());

static BARE_COMMAND_TEXT: Lazy<Regex> = Lazy::new(|| Regex::new(r#"[^"{}]+"#).unwrap());

/// Aggressively escape backslashes and quotes inside a `command` string value
/// when it looks like a complex shell command (embedded `printf`/`awk`, or
/// simply long enough that raw quotes are likely).
pub fn escape_command_field(args: &str) -> String {
    let Some(m) = COMMAND_FIELD_START.find(args) else {
        return args.to_string();
    };
    let start = m.end();

    let mut end = None;
    for pattern in COMMAND_FIELD_ENDS.iter() {
        if let Some(em) = pattern.find(&args[start..]) {
            end = Some(start + em.start());
            break;
        }
    }
    // Assume the command runs to just before the closing brace.
    let end = end.unwrap_or_else(|| args.len().saturating_sub(2).max(start));

    let value = &args[start..end];
    let needs_escape =
        value.contains('"') && (value.contains("printf") || value.contains("awk") || value.len() > 100);
    if !needs_escape {
        return args.to_string();
    }

    let escaped = value.replace('\\', "\\\\").replace('"', "\\\"");
    tracing::debug!("Escaped complex shell command while repairing arguments");
    format!("{}{}{}", &args[..start], escaped, &args[end..])
}

/// Quote bare object keys: `{command: ...}` becomes `{"command": ...}`.
pub fn quote_unquoted_keys(args: &str) -> String {
    UNQUOTED_KEYS.replace_all(args, "$1\"$2\":").into_owned()
}

/// Drop trailing commas before a closing brace.
pub fn strip_trailing_commas(args: &str) -> String {
    TRAILING_COMMA.replace_all(args, "}").into_owned()
}

/// Quote unquoted scalar values that are not numbers, booleans, or null.
pub fn quote_unquoted_values(args: &str) -> String {
    UNQUOTED_VALUE
        .replace_all(args, |caps: &Captures| {
            let key = &caps[1];
            let value = caps[2].trim();
            let delim = &caps[3];
            if NUMBER_LIKE.is_match(value) || matches!(value, "true" | "false" | "null") {
                format!("\"{}\": {}{}", key, value, delim)
            } else {
                format!("\"{}\": \"{}\"{}", key, value, delim)
            }
        })
        .into_owned()
}

/// Last resort: a blob that does not even start with `{` is treated as a raw
/// shell command and wrapped as `{"command": "<text>"}`.
pub fn wrap_bare_command(args: &str) -> String {
    if args.trim_start().starts_with('{') {
        return args.to_string();
    }
    if let Some(m) = BARE_COMMAND_TEXT.find(args) {
        let text = m.as_str().trim();
        if !text.is_empty() {
            tracing::debug!("Wrapped raw text as command object while repairing arguments");
            return format!("{{\"command\": \"{}\"}}", text);
        }
    }
    args.to_string()
}

/// Apply all repair steps in order. The order matters: command escaping must
/// run before key/value quoting, and bare-text wrapping runs last.
pub fn repair_json_arguments(args: &str) -> String {
    let repaired = escape_command_field(args);
    let repaired = quote_unquoted_keys(&repaired);
    let repaired = strip_trailing_commas(&repaired);
    let repaired = quote_unquoted_values(&repaired);
    wrap_bare_command(&repaired)
}
