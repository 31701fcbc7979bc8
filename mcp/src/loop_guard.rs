//! Loop detection for repetitive tool calls, tracked per conversation.
//!
//! A call is blocked as repetitive once five identical (tool, canonical
//! arguments) pairs land inside the sliding window and the most recent
//! identical call is under the retry grace period. Blocked calls are not
//! recorded, so the block clears once the grace period elapses.

use std::time::{Duration, Instant};

use dashmap::DashMap;
use serde_json::Value;
use tracing::warn;

/// Sliding window over which identical calls are counted.
const DETECTION_WINDOW: Duration = Duration::from_secs(60);

/// Identical calls allowed inside the window before blocking.
const BLOCK_THRESHOLD: usize = 5;

/// A repeat this long after the last identical call is allowed again.
const RETRY_GRACE: Duration = Duration::from_secs(10);

/// Recent calls kept per conversation.
const MAX_RECENT_CALLS: usize = 10;

#[derive(Debug, Clone)]
struct CallRecord {
    signature: String,
    at: Instant,
}

/// Per-conversation repetition guard.
#[derive(Default)]
pub struct LoopGuard {
    recent: DashMap<String, Vec<CallRecord>>,
}

impl LoopGuard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `true` if the call must be blocked as repetitive. Allowed
    /// calls are recorded; blocked ones are not.
    pub fn check_and_record(
        &self,
        conversation_id: Option<&str>,
        tool_name: &str,
        arguments: &Value,
    ) -> bool {
        let conv_id = conversation_id.unwrap_or("default").to_string();
        let signature = format!("{}:{}", tool_name, arguments);
        let now = Instant::now();

        let mut calls = self.recent.entry(conv_id).or_default();
        calls.retain(|record| now.duration_since(record.at) <= DETECTION_WINDOW);

        let mut identical = calls
            .iter()
            .filter(|record| record.signature == signature)
            .count();

        // A repeat after a reasonable delay is a deliberate retry, not a loop.
        let last_identical = calls
            .iter()
            .filter(|record| record.signature == signature)
            .map(|record| record.at)
            .max();
        if let Some(last) = last_identical {
            if now.duration_since(last) > RETRY_GRACE {
                identical = 0;
            }
        }

        if identical < BLOCK_THRESHOLD {
            calls.push(CallRecord { signature, at: now });
            let overflow = calls.len().saturating_sub(MAX_RECENT_CALLS);
            if overflow > 0 {
                calls.drain(..overflow);
            }
            return false;
        }

        warn!(
            "Blocking repetitive tool call: {} with {}",
            tool_name, arguments
        );
        true
    }

    /// Drop all state for a conversation.
    pub fn clear_conversation(&self, conversation_id: &str) {
        self.recent.remove(conversation_id);
    }
}
