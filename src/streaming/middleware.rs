//! Streaming middleware: rewrites the outbound SSE stream to execute tool
//! calls inline.
//!
//! The middleware consumes the model's heterogeneous stream items, buffers
//! text while a tool-call block may be forming, flushes ordinary text
//! immediately, executes detected calls through the core, and splices
//! `tool_call`/`tool_result` events into the output where the call appeared.
//! Repetitive output trips a guard; an upstream failure preserves the
//! partial response.

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;

use futures::{Stream, StreamExt};
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tracing::{info, warn};

use tool_parser::{
    helpers::ends_with_partial_token, parser::KNOWN_BARE_TOOLS, scrub_stream_text,
    validate_tool_call, SentinelParser, StreamingExtractor, ToolCall,
};
use ziya_mcp::secure::ExecutionOutcome;

use crate::core::Core;
use crate::streaming::sse::{send_data, send_done, send_named_event, sse_response, SseSender};

/// Buffer length past which content is flushed regardless of look.
const FLUSH_THRESHOLD: usize = 500;

/// Preservation caps: number of tool outputs kept and size of each.
const MAX_PRESERVED_TOOLS: usize = 10;
const MAX_TOOL_OUTPUT_LENGTH: usize = 5_000;

/// Repetition guard: lines tracked and repeats tolerated.
const MAX_RECENT_LINES: usize = 100;
const MAX_LINE_REPETITIONS: usize = 10;

/// One item of the model-produced stream.
#[derive(Debug, Clone)]
pub enum StreamEvent {
    /// Plain text that may contain embedded tool-call markup.
    Text(String),
    /// A structured chunk (thinking blocks, log patches) forwarded as-is.
    Structured(Value),
    /// A continuation boundary, forwarded atomically and never reordered.
    ContinuationBoundary(Value),
    /// An error dict; terminal errors end the stream.
    Error(Value),
    /// Explicit end of the upstream stream.
    Done,
}

/// Per-request middleware state.
struct RequestState {
    extractor: StreamingExtractor,
    content_buffer: String,
    accumulated_content: String,
    successful_tool_outputs: Vec<Value>,
    tool_sequence_count: usize,
    bare_call_hashes: HashSet<String>,
    repetition: RepetitionGuard,
    partial_preserved: bool,
}

impl RequestState {
    fn new() -> Self {
        Self {
            extractor: StreamingExtractor::new(SentinelParser::default()),
            content_buffer: String::new(),
            accumulated_content: String::new(),
            successful_tool_outputs: Vec::new(),
            tool_sequence_count: 0,
            bare_call_hashes: HashSet::new(),
            repetition: RepetitionGuard::new(),
            partial_preserved: false,
        }
    }
}

/// Tracks recent non-empty lines; trips when any single line repeats past
/// the tolerance.
struct RepetitionGuard {
    recent: VecDeque<String>,
}

impl RepetitionGuard {
    fn new() -> Self {
        Self {
            recent: VecDeque::new(),
        }
    }

    fn record_and_check(&mut self, text: &str) -> bool {
        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            self.recent.push_back(line.to_string());
            while self.recent.len() > MAX_RECENT_LINES {
                self.recent.pop_front();
            }
        }
        let mut counts: std::collections::HashMap<&str, usize> = std::collections::HashMap::new();
        for line in &self.recent {
            let count = counts.entry(line.as_str()).or_insert(0);
            *count += 1;
            if *count > MAX_LINE_REPETITIONS {
                return true;
            }
        }
        false
    }
}

/// The streaming middleware, bound to a [`Core`].
pub struct StreamingMiddleware {
    core: Arc<Core>,
}

impl StreamingMiddleware {
    pub fn new(core: Arc<Core>) -> Self {
        Self { core }
    }

    /// Build an SSE response that drains `upstream` through the rewrite
    /// machinery.
    pub fn stream_response<S>(&self, upstream: S, conversation_id: String) -> axum::response::Response
    where
        S: Stream<Item = StreamEvent> + Send + Unpin + 'static,
    {
        let (tx, rx) = mpsc::channel(64);
        let core = Arc::clone(&self.core);
        tokio::spawn(async move {
            safe_stream(core, upstream, tx, &conversation_id).await;
        });
        sse_response(rx)
    }
}

/// Consume the upstream item stream and produce SSE events, terminated by
/// `data: [DONE]`.
pub async fn safe_stream<S>(core: Arc<Core>, mut upstream: S, tx: SseSender, conversation_id: &str)
where
    S: Stream<Item = StreamEvent> + Unpin,
{
    let mut state = RequestState::new();
    core.reset_request_cycle();

    while let Some(event) = upstream.next().await {
        match event {
            StreamEvent::ContinuationBoundary(value) => {
                // Never reordered with surrounding content: pending text goes
                // out first, then the boundary verbatim.
                if !flush_content(&mut state, &tx).await {
                    return;
                }
                info!("Detected continuation boundary, passing through atomically");
                if !send_data(&tx, &value).await {
                    return;
                }
            }
            StreamEvent::Structured(value) => {
                if !send_data(&tx, &value).await {
                    return;
                }
            }
            StreamEvent::Error(value) => {
                if !send_data(&tx, &value).await {
                    return;
                }
                if is_terminal_error(&value) {
                    preserve_partial(&mut state, &tx).await;
                    send_done(&tx).await;
                    return;
                }
            }
            StreamEvent::Done => break,
            StreamEvent::Text(text) => {
                if !process_text(&core, &mut state, &tx, conversation_id, &text).await {
                    return;
                }
            }
        }
    }

    // End of stream: pump the extractor dry (it may hold text released by
    // the last extracted call, or further complete blocks), then flush.
    loop {
        let had_work = {
            let step = state.extractor.process_chunk("");
            let progressed = !step.text.is_empty() || step.call.is_some();
            if !step.text.is_empty() {
                state.content_buffer.push_str(&step.text);
            }
            if let Some(extracted) = step.call {
                if !flush_content(&mut state, &tx).await {
                    return;
                }
                if !execute_and_emit(
                    &core,
                    &mut state,
                    &tx,
                    conversation_id,
                    &extracted.raw_block,
                    &extracted.call,
                )
                .await
                {
                    return;
                }
            }
            progressed
        };
        if !had_work {
            break;
        }
    }
    let leftover = state.extractor.drain_text();
    state.content_buffer.push_str(&leftover);

    flush_content(&mut state, &tx).await;
    send_done(&tx).await;
}

fn is_terminal_error(value: &Value) -> bool {
    if value.get("type").and_then(Value::as_str) == Some("error") {
        return true;
    }
    matches!(
        value.get("error").and_then(Value::as_str),
        Some("authentication_error") | Some("model_error")
    )
}

/// Handle one text chunk: repetition guard, sentinel extraction, bare-tool
/// detection, and the buffering/flush state machine. Returns `false` when
/// the stream must end.
async fn process_text(
    core: &Arc<Core>,
    state: &mut RequestState,
    tx: &SseSender,
    conversation_id: &str,
    text: &str,
) -> bool {
    state.accumulated_content.push_str(text);

    if state.repetition.record_and_check(text) {
        warn!("Detected repetitive content in stream, interrupting");
        let warning = json!({
            "warning": "repetitive_content",
            "detail": "Response was interrupted because repetitive content was detected."
        });
        send_data(tx, &warning).await;
        send_done(tx).await;
        return false;
    }

    // Sentinel-delimited calls are extracted by the streaming state machine;
    // text outside blocks passes through to the content buffer.
    let step = state.extractor.process_chunk(text);
    if !step.text.is_empty() {
        state.content_buffer.push_str(&step.text);
    }
    if let Some(extracted) = step.call {
        // Content preceding the block keeps its position in the stream.
        if !flush_content(state, tx).await {
            return false;
        }
        if !execute_and_emit(core, state, tx, conversation_id, &extracted.raw_block, &extracted.call)
            .await
        {
            return false;
        }
    }

    // Fast-path for bare known-tool tags; the parser verdict is
    // authoritative before anything executes.
    let parser_sees_call = state
        .extractor
        .parser()
        .contains_complete_call(&state.content_buffer);
    if parser_sees_call {
        if let Some(call) = state
            .extractor
            .parser()
            .parse_tool_call(&state.content_buffer)
        {
            if validate_tool_call(&call) {
                let signature = format!("{:x}", md5::compute(call.canonical()));
                let block = std::mem::take(&mut state.content_buffer);
                if state.bare_call_hashes.insert(signature) {
                    if !execute_and_emit(core, state, tx, conversation_id, &block, &call).await {
                        return false;
                    }
                }
            }
        }
    }

    if should_flush(&state.content_buffer, state.extractor.parser()) {
        return flush_content(state, tx).await;
    }
    true
}

/// Flush conditions: a complete tool-call block, an oversized buffer, or
/// text that plainly is not the start of a tool call. An unclosed sentinel
/// or known-tool tag holds the buffer.
fn should_flush(buffer: &str, parser: &SentinelParser) -> bool {
    if buffer.is_empty() {
        return false;
    }
    if parser.contains_complete_call(buffer) {
        return true;
    }
    if buffer.len() >= FLUSH_THRESHOLD {
        return true;
    }
    if parser.contains_partial(buffer) {
        return false;
    }
    // A known-tool tag may still be arriving split mid-name.
    for tool in KNOWN_BARE_TOOLS {
        if ends_with_partial_token(buffer, &format!("<{}>", tool)).is_some() {
            return false;
        }
    }
    !buffer.trim().is_empty()
}

/// Emit buffered content (scrubbed) as a `content` event.
async fn flush_content(state: &mut RequestState, tx: &SseSender) -> bool {
    if state.content_buffer.is_empty() {
        return true;
    }
    let text = scrub_stream_text(
        &state.content_buffer,
        state.extractor.parser().sentinel(),
        state.extractor.executed_tools(),
    );
    state.content_buffer.clear();
    if text.is_empty() {
        return true;
    }
    send_data(tx, &json!({ "content": text })).await
}

/// Emit the `tool_call` event, execute through the core, then emit either
/// `tool_result` or `tool_error` where the call appeared.
async fn execute_and_emit(
    core: &Arc<Core>,
    state: &mut RequestState,
    tx: &SseSender,
    conversation_id: &str,
    raw_block: &str,
    call: &ToolCall,
) -> bool {
    info!("Executing tool call in streaming middleware: {}", call.tool_name);
    if !send_data(tx, &json!({ "tool_call": raw_block })).await {
        return false;
    }

    match core.execute_tool_call(call, conversation_id).await {
        ExecutionOutcome::Success(result) => {
            record_tool_output(state, &result);
            send_data(tx, &json!({ "tool_result": result })).await
        }
        ExecutionOutcome::Error(message) => {
            let detail = if message.is_empty() {
                // Suppressed (early consecutive timeout): the event still
                // marks the failure, with no user-visible notice.
                String::new()
            } else {
                format!("\n\n```tool:error\n❌ **Tool Error:** {}\n```\n\n", message)
            };
            send_data(tx, &json!({ "tool_error": detail })).await
        }
    }
}

fn record_tool_output(state: &mut RequestState, output: &str) {
    state.tool_sequence_count += 1;
    let mut capped = output.to_string();
    if capped.len() > MAX_TOOL_OUTPUT_LENGTH {
        let truncated: String = capped.chars().take(MAX_TOOL_OUTPUT_LENGTH).collect();
        capped = format!(
            "{}\n... [Tool output truncated - {} total chars]",
            truncated,
            output.len()
        );
    }
    state.successful_tool_outputs.push(json!({
        "sequence": state.tool_sequence_count,
        "content": capped,
    }));
    let overflow = state
        .successful_tool_outputs
        .len()
        .saturating_sub(MAX_PRESERVED_TOOLS);
    if overflow > 0 {
        state.successful_tool_outputs.drain(..overflow);
    }
}

/// On upstream failure, carry the accumulated content and recent tool
/// outputs forward so the response is not lost.
async fn preserve_partial(state: &mut RequestState, tx: &SseSender) {
    if state.accumulated_content.is_empty() || state.partial_preserved {
        return;
    }
    info!(
        "Preserving {} characters of partial response before error",
        state.accumulated_content.len()
    );
    let warning = json!({
        "warning": "partial_response_preserved",
        "detail": format!(
            "Server encountered an error after generating {} characters. The partial response has been preserved.",
            state.accumulated_content.len()
        ),
        "partial_content": state.accumulated_content,
        "successful_tool_outputs": state.successful_tool_outputs,
        "execution_summary": {
            "total_tool_sequences": state.tool_sequence_count,
            "successful_sequences": state.successful_tool_outputs.len(),
            "has_successful_tools": !state.successful_tool_outputs.is_empty(),
        }
    });
    send_data(tx, &warning).await;
    send_named_event(
        tx,
        "preservedContent",
        &json!({ "type": "preservedContent", "data": warning }),
    )
    .await;
    state.partial_preserved = true;
}
