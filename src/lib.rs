//! Ziya gateway: streaming middleware with MCP tool-server integration.
//!
//! The [`core::Core`] handle wires the MCP subsystem together; the
//! [`streaming`] module rewrites the outbound SSE stream to execute tool
//! calls inline; [`servers`] holds the built-in tool-server binaries'
//! implementations.

pub mod core;
pub mod servers;
pub mod streaming;

pub use crate::core::Core;
pub use crate::streaming::{StreamEvent, StreamingMiddleware};
