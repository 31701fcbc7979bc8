//! Output scrubbing: stray sentinel removal and fabricated tool-result
//! detection.
//!
//! Models that have seen tool transcripts will sometimes write out text that
//! *looks* like an executed tool result. Those spans are replaced with a
//! visible marker; stray sentinel fragments are deleted outright. Scrubbing
//! is applied twice to catch fragments uncovered by the first pass, and
//! scrubbing already-scrubbed text is a fixed point.

use std::collections::HashSet;

use once_cell::sync::Lazy;
use regex::Regex;

use crate::sentinel::Sentinel;

/// Replacement written in place of a fabricated tool-result span.
pub const HALLUCINATION_MARKER: &str = "⚠️ **[HALLUCINATED CONTENT REMOVED]**";

static FAKE_RESULT_LINES: Lazy<Vec<Regex>> = Lazy::new(|| {
    vec![
        Regex::new(r"\*\*Tool Result:\*\*[^\n]*").unwrap(),
        Regex::new(r"(?:✅ )?(?:MCP )?Tool execution completed:[^\n]*").unwrap(),
        Regex::new(r"🔧 \*\*Executing Tool\*\*:[^\n]*").unwrap(),
        Regex::new(r"⏳ \*\*Throttling Delay\*\*:[^\n]*").unwrap(),
        Regex::new(r"❌ \*\*MCP (?:Server )?Error\*\*:[^\n]*").unwrap(),
        Regex::new(r"⏱️ \*\*MCP (?:Tool |Server )?Timeout\*\*[^\n]*").unwrap(),
    ]
});

static FAKE_TOOL_BLOCK: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)```tool:([A-Za-z0-9_\-]+)\n.*?```").unwrap());

static NAME_TAG_FRAGMENTS: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?s)<n>[^<]*</n>|<name>[^<]*</name>|</?n>|</?name>").unwrap()
});

static ARG_TAG_FRAGMENTS: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)<arguments>.*?</arguments>|</?arguments>").unwrap());

static EXCESS_NEWLINES: Lazy<Regex> = Lazy::new(|| Regex::new(r"\n{3,}").unwrap());

/// Remove all sentinel tags and fragments from text: complete blocks,
/// unterminated blocks, and bare open/close tags, plus the name/arguments
/// tag fragments that travel with them.
pub fn clean_sentinels(text: &str, sentinel: &Sentinel) -> String {
    if text.is_empty() {
        return text.to_string();
    }

    let mut cleaned = remove_spans(text, sentinel.open(), sentinel.close());
    if sentinel.open() != "<TOOL_SENTINEL>" {
        cleaned = remove_spans(&cleaned, "<TOOL_SENTINEL>", "</TOOL_SENTINEL>");
    }

    // Unterminated block: open tag to end of text.
    if let Some(pos) = cleaned.find(sentinel.open()) {
        cleaned.truncate(pos);
    }
    // Orphaned close tag: start of text through the close tag.
    if let Some(pos) = cleaned.find(sentinel.close()) {
        cleaned.drain(..pos + sentinel.close().len());
    }

    // Bare tag fragments.
    cleaned = cleaned
        .replace(sentinel.open(), "")
        .replace(sentinel.close(), "")
        .replace("<TOOL_SENTINEL>", "")
        .replace("</TOOL_SENTINEL>", "");

    cleaned = NAME_TAG_FRAGMENTS.replace_all(&cleaned, "").into_owned();
    cleaned = ARG_TAG_FRAGMENTS.replace_all(&cleaned, "").into_owned();
    EXCESS_NEWLINES.replace_all(&cleaned, "\n\n").into_owned()
}

fn remove_spans(text: &str, open: &str, close: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    loop {
        let Some(start) = rest.find(open) else {
            out.push_str(rest);
            return out;
        };
        let Some(close_off) = rest[start..].find(close) else {
            out.push_str(rest);
            return out;
        };
        out.push_str(&rest[..start]);
        rest = &rest[start + close_off + close.len()..];
    }
}

/// Replace fabricated tool-result spans with [`HALLUCINATION_MARKER`].
///
/// A fenced ```` ```tool:<name> ```` block survives only when `<name>` was
/// actually executed in this stream.
pub fn remove_hallucinated_results(text: &str, executed_tools: &HashSet<String>) -> String {
    let mut cleaned = FAKE_TOOL_BLOCK
        .replace_all(text, |caps: &regex::Captures| {
            let tool = &caps[1];
            if executed_tools.contains(tool) {
                caps[0].to_string()
            } else {
                tracing::warn!("Removing fabricated tool result block for '{}'", tool);
                HALLUCINATION_MARKER.to_string()
            }
        })
        .into_owned();

    for pattern in FAKE_RESULT_LINES.iter() {
        cleaned = pattern.replace_all(&cleaned, HALLUCINATION_MARKER).into_owned();
    }
    cleaned
}

/// Full scrub applied to stream output: hallucinated-result removal followed
/// by sentinel cleanup, run twice to handle nested fragments.
pub fn scrub_stream_text(
    text: &str,
    sentinel: &Sentinel,
    executed_tools: &HashSet<String>,
) -> String {
    let mut cleaned = text.to_string();
    for _ in 0..2 {
        cleaned = remove_hallucinated_results(&cleaned, executed_tools);
        cleaned = clean_sentinels(&cleaned, sentinel);
    }
    cleaned
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scrub(text: &str) -> String {
        scrub_stream_text(text, &Sentinel::default(), &HashSet::new())
    }

    #[test]
    fn test_complete_block_removed() {
        let text = "before <TOOL_SENTINEL><name>t</name><arguments>{}</arguments></TOOL_SENTINEL> after";
        assert_eq!(scrub(text), "before  after");
    }

    #[test]
    fn test_unterminated_block_removed() {
        let text = "visible <TOOL_SENTINEL><n>t</n><arguments>{";
        assert_eq!(scrub(text), "visible ");
    }

    #[test]
    fn test_orphaned_close_removed() {
        let text = "{}</arguments></TOOL_SENTINEL> visible";
        assert_eq!(scrub(text), " visible");
    }

    #[test]
    fn test_fake_tool_result_replaced() {
        let text = "Here: **Tool Result:** totally real output";
        let cleaned = scrub(text);
        assert!(cleaned.contains(HALLUCINATION_MARKER));
        assert!(!cleaned.contains("totally real"));
    }

    #[test]
    fn test_fake_fenced_block_replaced() {
        let text = "```tool:fake_tool\nFake output\n```";
        let cleaned = scrub(text);
        assert!(cleaned.contains(HALLUCINATION_MARKER));
        assert!(!cleaned.contains("Fake output"));
    }

    #[test]
    fn test_executed_tool_block_preserved() {
        let executed: HashSet<String> = ["real_tool".to_string()].into();
        let text = "```tool:real_tool\nActual output\n```";
        let cleaned = scrub_stream_text(text, &Sentinel::default(), &executed);
        assert!(cleaned.contains("Actual output"));
        assert!(!cleaned.contains(HALLUCINATION_MARKER));
    }

    #[test]
    fn test_fake_completion_phrase_replaced() {
        let text = "✅ MCP Tool execution completed: fake_tool";
        assert!(scrub(text).contains(HALLUCINATION_MARKER));
    }

    #[test]
    fn test_plain_code_block_untouched() {
        let text = "Here's some code: ```python\nprint('hello')\n```";
        assert_eq!(scrub(text), text);
    }

    #[test]
    fn test_scrub_is_idempotent() {
        let samples = [
            "before <TOOL_SENTINEL><name>t</name><arguments>{}</arguments></TOOL_SENTINEL> after",
            "**Tool Result:** fake",
            "```tool:fake\nout\n```",
            "plain text\n\n\nwith gaps",
            "<name>orphan</name> and </arguments>",
        ];
        for sample in samples {
            let once = scrub(sample);
            let twice = scrub(&once);
            assert_eq!(once, twice, "scrub not idempotent for: {}", sample);
        }
    }

    #[test]
    fn test_name_fragments_deleted() {
        let text = "x <name>run_shell_command</name> y </arguments> z";
        let cleaned = scrub(text);
        assert!(!cleaned.contains("<name>"));
        assert!(!cleaned.contains("</arguments>"));
    }

    #[test]
    fn test_custom_sentinel_cleaned() {
        let s = Sentinel::new("ACTION");
        let text = "a <ACTION>stuff</ACTION> b";
        let cleaned = scrub_stream_text(text, &s, &HashSet::new());
        assert_eq!(cleaned, "a  b");
    }
}
