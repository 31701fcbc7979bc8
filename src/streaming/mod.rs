//! Outbound SSE stream rewriting.

pub mod middleware;
pub mod sse;

pub use middleware::{safe_stream, StreamEvent, StreamingMiddleware};
pub use sse::{format_sse_data, send_data, send_done, sse_response, SseSender, DONE_MARKER};
