//! SSE framing for the outbound stream.
//!
//! Events are written through an mpsc channel backing the response body:
//! `data: <json>\n\n` lines terminated by a final `data: [DONE]\n\n`.

use std::io;

use axum::{
    body::Body,
    http::{header, StatusCode},
    response::Response,
};
use bytes::Bytes;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::error;

pub type SseSender = mpsc::Sender<Result<Bytes, io::Error>>;

/// Terminal stream marker.
pub const DONE_MARKER: &str = "data: [DONE]\n\n";

/// Format a JSON payload as an SSE data line.
pub fn format_sse_data(data: &Value) -> Bytes {
    let json = serde_json::to_string(data).unwrap_or_else(|_| "{}".to_string());
    Bytes::from(format!("data: {}\n\n", json))
}

/// Send a `data:` event. Returns `false` if the receiver was dropped.
pub async fn send_data(tx: &SseSender, data: &Value) -> bool {
    tx.send(Ok(format_sse_data(data))).await.is_ok()
}

/// Send a named SSE event: `event: <name>\ndata: <json>\n\n`.
pub async fn send_named_event(tx: &SseSender, event: &str, data: &Value) -> bool {
    let json = serde_json::to_string(data).unwrap_or_else(|_| "{}".to_string());
    let bytes = Bytes::from(format!("event: {}\ndata: {}\n\n", event, json));
    tx.send(Ok(bytes)).await.is_ok()
}

/// Send the terminal `[DONE]` marker.
pub async fn send_done(tx: &SseSender) -> bool {
    tx.send(Ok(Bytes::from_static(DONE_MARKER.as_bytes())))
        .await
        .is_ok()
}

/// Build an SSE response whose body drains the given receiver.
pub fn sse_response(rx: mpsc::Receiver<Result<Bytes, io::Error>>) -> Response {
    let stream = tokio_stream::wrappers::ReceiverStream::new(rx);
    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "text/event-stream")
        .header(header::CACHE_CONTROL, "no-cache")
        .header(header::CONNECTION, "keep-alive")
        .body(Body::from_stream(stream))
        .unwrap_or_else(|e| {
            error!("Failed to build streaming response: {}", e);
            Response::builder()
                .status(StatusCode::INTERNAL_SERVER_ERROR)
                .body(Body::empty())
                .expect("static error response")
        })
}
