//! Streaming tool-call extraction.
//!
//! Maintains a private rolling buffer across chunks. A sentinel opens a tool
//! block; output is suppressed until the closing sentinel arrives, at which
//! point the block is parsed and deduplicated. A run of malformed or empty
//! blocks bails out by resetting the buffer.

use std::collections::HashSet;

use crate::{
    helpers::ends_with_partial_token,
    parser::{validate_tool_call, SentinelParser},
    types::ExtractedCall,
};

/// Minimum length for a block to be considered a real call rather than a
/// fragment.
const MIN_BLOCK_LEN: usize = 50;

/// Consecutive malformed/empty blocks tolerated before the buffer is reset.
const MAX_CONSECUTIVE_EMPTY: usize = 5;

/// Buffer cap outside of a tool block; the front half is dropped past this.
const MAX_IDLE_BUFFER: usize = 10_000;

/// Result of feeding one chunk to the extractor.
#[derive(Debug, Default)]
pub struct StreamStep {
    /// Text safe to pass through downstream (tool blocks removed).
    pub text: String,
    /// A complete, validated, previously-unseen tool call, if one closed in
    /// this chunk.
    pub call: Option<ExtractedCall>,
}

/// Per-request streaming extractor state machine.
pub struct StreamingExtractor {
    parser: SentinelParser,
    buffer: String,
    in_tool_block: bool,
    executed_hashes: HashSet<String>,
    executed_tools: HashSet<String>,
    consecutive_empty: usize,
}

impl StreamingExtractor {
    pub fn new(parser: SentinelParser) -> Self {
        Self {
            parser,
            buffer: String::new(),
            in_tool_block: false,
            executed_hashes: HashSet::new(),
            executed_tools: HashSet::new(),
            consecutive_empty: 0,
        }
    }

    pub fn parser(&self) -> &SentinelParser {
        &self.parser
    }

    /// Names of tools whose calls have been extracted so far. Used by the
    /// scrubber to tell real result blocks from fabricated ones.
    pub fn executed_tools(&self) -> &HashSet<String> {
        &self.executed_tools
    }

    /// Feed one chunk. Returns pass-through text and at most one newly
    /// extracted call; any remaining partial block stays buffered.
    pub fn process_chunk(&mut self, chunk: &str) -> StreamStep {
        self.buffer.push_str(chunk);
        let mut step = StreamStep::default();

        loop {
            if !self.in_tool_block {
                let open = self.parser.sentinel().open().to_string();
                if let Some(pos) = self.buffer.find(&open) {
                    step.text.push_str(&self.buffer[..pos]);
                    self.buffer.drain(..pos);
                    self.in_tool_block = true;
                    continue;
                }
                if let Some(partial) = ends_with_partial_token(&self.buffer, &open) {
                    // Hold back the possible marker prefix only.
                    let emit_to = self.buffer.len() - partial;
                    step.text.push_str(&self.buffer[..emit_to]);
                    self.buffer.drain(..emit_to);
                    break;
                }
                step.text.push_str(&self.buffer);
                self.buffer.clear();
                break;
            }

            let close = self.parser.sentinel().close().to_string();
            let Some(close_pos) = self.buffer.find(&close) else {
                // Inside a block with no terminator yet: suppress output.
                break;
            };
            let end = close_pos + close.len();
            let block: String = self.buffer.drain(..end).collect();
            self.in_tool_block = false;

            step.call = self.handle_block(block);
            if step.call.is_some() {
                // Text after the block keeps its position relative to the
                // call's result: it stays buffered until the call has been
                // handled.
                break;
            }
        }

        if !self.in_tool_block && self.buffer.len() > MAX_IDLE_BUFFER {
            let keep_from = self.buffer.len() - MAX_IDLE_BUFFER / 2;
            self.buffer.drain(..keep_from);
        }

        step
    }

    fn handle_block(&mut self, block: String) -> Option<ExtractedCall> {
        if block.len() < MIN_BLOCK_LEN {
            tracing::warn!(
                "Tool block too short ({} chars), attempt {}/{}",
                block.len(),
                self.consecutive_empty + 1,
                MAX_CONSECUTIVE_EMPTY
            );
            self.record_empty();
            return None;
        }

        let Some(call) = self.parser.parse_tool_call(&block) else {
            tracing::warn!(
                "Failed to parse tool block, attempt {}/{}",
                self.consecutive_empty + 1,
                MAX_CONSECUTIVE_EMPTY
            );
            self.record_empty();
            return None;
        };

        if !validate_tool_call(&call) {
            self.record_empty();
            return None;
        }

        let signature = format!("{:x}", md5::compute(call.canonical()));
        if !self.executed_hashes.insert(signature) {
            tracing::debug!("Skipping already-processed tool call: {}", call.tool_name);
            return None;
        }

        self.consecutive_empty = 0;
        self.executed_tools.insert(call.tool_name.clone());
        Some(ExtractedCall {
            raw_block: block,
            call,
        })
    }

    /// Take any buffered text that is not part of an open tool block. An
    /// unterminated block at end of stream is dropped, never shown.
    pub fn drain_text(&mut self) -> String {
        if self.in_tool_block {
            self.buffer.clear();
            self.in_tool_block = false;
            return String::new();
        }
        std::mem::take(&mut self.buffer)
    }

    fn record_empty(&mut self) {
        self.consecutive_empty += 1;
        if self.consecutive_empty >= MAX_CONSECUTIVE_EMPTY {
            tracing::error!(
                "Too many consecutive malformed tool blocks ({}), resetting buffer",
                self.consecutive_empty
            );
            self.buffer.clear();
            self.in_tool_block = false;
            self.consecutive_empty = 0;
        }
    }

    pub fn reset(&mut self) {
        self.buffer.clear();
        self.in_tool_block = false;
        self.executed_hashes.clear();
        self.executed_tools.clear();
        self.consecutive_empty = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sentinel::Sentinel;

    fn extractor() -> StreamingExtractor {
        StreamingExtractor::new(SentinelParser::new(Sentinel::default()))
    }

    const CALL_BLOCK: &str = "<TOOL_SENTINEL><name>get_current_time</name><arguments>{}</arguments></TOOL_SENTINEL>";

    #[test]
    fn test_single_chunk_extraction() {
        let mut ex = extractor();
        let step = ex.process_chunk(&format!("hi {} done", CALL_BLOCK));
        // Text before the block is released; text after stays buffered so
        // it lands behind the call's result.
        assert_eq!(step.text, "hi ");
        let call = step.call.unwrap();
        assert_eq!(call.call.tool_name, "get_current_time");
        assert_eq!(call.raw_block, CALL_BLOCK);

        let step = ex.process_chunk("");
        assert_eq!(step.text, " done");
        assert!(step.call.is_none());
    }

    #[test]
    fn test_split_across_chunks() {
        let mut ex = extractor();
        let (a, b) = CALL_BLOCK.split_at(30);

        let step = ex.process_chunk(&format!("hello {}", a));
        assert_eq!(step.text, "hello ");
        assert!(step.call.is_none());

        let step = ex.process_chunk(&format!("{} bye", b));
        assert_eq!(step.text, "");
        assert_eq!(step.call.unwrap().call.tool_name, "get_current_time");

        assert_eq!(ex.drain_text(), " bye");
    }

    #[test]
    fn test_drain_drops_unterminated_block() {
        let mut ex = extractor();
        ex.process_chunk("keep <TOOL_SENTINEL><name>x</name>");
        assert_eq!(ex.drain_text(), "");
    }

    #[test]
    fn test_partial_open_marker_held_back() {
        let mut ex = extractor();
        let step = ex.process_chunk("text <TOOL_");
        assert_eq!(step.text, "text ");
        // The held-back prefix resolves to plain text on the next chunk.
        let step = ex.process_chunk("WRENCH> more");
        assert_eq!(step.text, "<TOOL_WRENCH> more");
    }

    #[test]
    fn test_duplicate_call_skipped() {
        let mut ex = extractor();
        let first = ex.process_chunk(CALL_BLOCK);
        assert!(first.call.is_some());
        let second = ex.process_chunk(CALL_BLOCK);
        assert!(second.call.is_none());
    }

    #[test]
    fn test_distinct_args_not_deduped() {
        let mut ex = extractor();
        let a = r#"<TOOL_SENTINEL><name>run_shell_command</name><arguments>{"command": "ls"}</arguments></TOOL_SENTINEL>"#;
        let b = r#"<TOOL_SENTINEL><name>run_shell_command</name><arguments>{"command": "pwd"}</arguments></TOOL_SENTINEL>"#;
        assert!(ex.process_chunk(a).call.is_some());
        assert!(ex.process_chunk(b).call.is_some());
    }

    #[test]
    fn test_malformed_blocks_bail_out() {
        let mut ex = extractor();
        let bad = "<TOOL_SENTINEL><n>x</n><arguments>{broken}</arguments></TOOL_SENTINEL>";
        for _ in 0..5 {
            let step = ex.process_chunk(bad);
            assert!(step.call.is_none());
        }
        // After the bail-out the extractor still works normally.
        let step = ex.process_chunk(CALL_BLOCK);
        assert!(step.call.is_some());
    }

    #[test]
    fn test_suppresses_output_inside_block() {
        let mut ex = extractor();
        let step = ex.process_chunk("<TOOL_SENTINEL><name>get_current_time</name>");
        assert_eq!(step.text, "");
        assert!(step.call.is_none());
    }

    #[test]
    fn test_executed_tools_tracked() {
        let mut ex = extractor();
        ex.process_chunk(CALL_BLOCK);
        assert!(ex.executed_tools().contains("get_current_time"));
    }
}
