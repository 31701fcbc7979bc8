//! Sentinel-delimited tool call parsing for streamed model output.
//!
//! ## Modules
//!
//! - [`sentinel`]: configurable sentinel tag pair
//! - [`parser`]: complete-block extraction and validation
//! - [`repair`]: ordered JSON repair steps for malformed arguments
//! - [`streaming`]: per-chunk extractor state machine
//! - [`scrub`]: sentinel cleanup and hallucinated-result removal

pub mod helpers;
pub mod parser;
pub mod repair;
pub mod scrub;
pub mod sentinel;
pub mod streaming;
pub mod types;

pub use parser::{validate_tool_call, SentinelParser};
pub use scrub::{clean_sentinels, scrub_stream_text, HALLUCINATION_MARKER};
pub use sentinel::Sentinel;
pub use streaming::{StreamStep, StreamingExtractor};
pub use types::{ExtractedCall, ToolCall};
