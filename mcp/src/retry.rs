//! Retry policy for tool-server errors.
//!
//! Classification of a server-declared error into a retry decision, plus the
//! tool-specific "smart retry" parameter mutations attempted on the first
//! failure. Timeouts are never retried here; they surface immediately so the
//! caller can pick a lighter alternative.

use std::time::Duration;

use serde_json::Value;

/// Message substrings that mark an external-server error as transient.
pub const EXTERNAL_TRANSIENT_PATTERNS: &[&str] = &[
    "ExtractArticle.js",
    "non-zero exit status",
    "Command",
    "returned",
    "cache",
    "processing",
    "temporary",
    "busy",
];

/// Message substrings (lowercased) indicating cache contamination.
pub const CACHE_INDICATORS: &[&str] = &["cached", "previous", "mixed", "wrong url"];

/// Maximum attempts for external transient errors.
pub const MAX_EXTERNAL_RETRIES: u32 = 5;

/// Base delay for exponential back-off.
pub const BASE_BACKOFF: Duration = Duration::from_secs(1);

/// What to do with a server-declared error.
#[derive(Debug, Clone, PartialEq)]
pub enum RetryDecision {
    /// Retry with mutated parameters (smart retry); does not consume an
    /// attempt.
    Retry { params: Value },
    /// Retry the same request after the given delay.
    RetryAfter(Duration),
    /// Give up and surface the error.
    Surface,
}

/// delay = base * 2^attempt, capped at 30 s.
pub fn calculate_backoff(attempt: u32) -> Duration {
    let factor = 2u64.saturating_pow(attempt.min(16));
    let millis = (BASE_BACKOFF.as_millis() as u64).saturating_mul(factor);
    Duration::from_millis(millis.min(30_000))
}

pub fn is_security_block(message: &str) -> bool {
    message.contains("SECURITY BLOCK")
}

pub fn is_timeout_message(message: &str) -> bool {
    let lower = message.to_lowercase();
    lower.contains("timed out") || lower.contains("timeout")
}

pub fn is_external_transient(message: &str) -> bool {
    EXTERNAL_TRANSIENT_PATTERNS.iter().any(|p| message.contains(p))
}

pub fn is_cache_contamination(message: &str) -> bool {
    let lower = message.to_lowercase();
    CACHE_INDICATORS.iter().any(|p| lower.contains(p))
}

/// Classify a server-declared error into a retry decision.
///
/// Precedence: security blocks and timeouts surface immediately; external
/// transients back off exponentially (with one smart-retry attempt on the
/// first failure); cache contamination gets up to two quick retries; any
/// other error gets one quick retry.
pub fn classify_error(message: &str, attempt: u32, params: Option<&Value>) -> RetryDecision {
    if is_security_block(message) {
        return RetryDecision::Surface;
    }

    if is_external_transient(message) && attempt < MAX_EXTERNAL_RETRIES {
        if attempt == 0 {
            if let Some(mutated) = smart_retry_params(params, message) {
                return RetryDecision::Retry { params: mutated };
            }
        }
        return RetryDecision::RetryAfter(calculate_backoff(attempt));
    }

    if is_cache_contamination(message) && attempt < 2 {
        return RetryDecision::RetryAfter(Duration::from_millis(500));
    }

    if is_timeout_message(message) {
        return RetryDecision::Surface;
    }

    if attempt < 1 {
        return RetryDecision::RetryAfter(Duration::from_millis(500));
    }

    RetryDecision::Surface
}

/// Tool-specific parameter mutation for the first retry.
///
/// Currently: the `fetch` tool's HTML-extraction failures
/// (`ExtractArticle.js` exiting non-zero) are retried with `raw: true`.
pub fn smart_retry_params(params: Option<&Value>, message: &str) -> Option<Value> {
    let params = params?;
    let tool_name = params.get("name").and_then(Value::as_str)?;
    let arguments = params.get("arguments").filter(|a| a.is_object())?;

    if tool_name == "fetch"
        && message.contains("ExtractArticle.js")
        && message.contains("non-zero exit status")
        && !arguments.get("raw").and_then(Value::as_bool).unwrap_or(false)
    {
        let mut mutated = params.clone();
        mutated["arguments"]["raw"] = Value::Bool(true);
        return Some(mutated);
    }

    None
}

/// Strip cache-contamination prefixes from a `{content: [...]}` result,
/// keeping the remaining lines.
pub fn clean_contaminated_response(result: &mut Value) {
    const CONTAMINATION_PREFIXES: &[&str] = &[
        "Contents of https://wttr.in/",
        "Contents of https://api.",
        "Failed to fetch https://",
    ];

    let Some(items) = result.get_mut("content").and_then(Value::as_array_mut) else {
        return;
    };
    let Some(first) = items.first_mut() else {
        return;
    };
    let Some(text) = first.get("text").and_then(Value::as_str) else {
        return;
    };

    if !CONTAMINATION_PREFIXES.iter().any(|p| text.contains(p)) {
        return;
    }

    tracing::warn!("Cache contamination detected in response, cleaning");
    let clean: Vec<&str> = text
        .lines()
        .filter(|line| !CONTAMINATION_PREFIXES.iter().any(|p| line.contains(p)))
        .collect();
    first["text"] = Value::String(clean.join("\n").trim().to_string());
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_backoff_doubles() {
        assert_eq!(calculate_backoff(0), Duration::from_secs(1));
        assert_eq!(calculate_backoff(1), Duration::from_secs(2));
        assert_eq!(calculate_backoff(3), Duration::from_secs(8));
    }

    #[test]
    fn test_security_block_surfaces() {
        let decision = classify_error("SECURITY BLOCK: rm not allowed", 0, None);
        assert_eq!(decision, RetryDecision::Surface);
    }

    #[test]
    fn test_timeout_surfaces_immediately() {
        let decision = classify_error("request timed out after 30s", 0, None);
        assert_eq!(decision, RetryDecision::Surface);
    }

    #[test]
    fn test_external_transient_backs_off() {
        match classify_error("server busy, try later", 1, None) {
            RetryDecision::RetryAfter(d) => assert_eq!(d, Duration::from_secs(2)),
            other => panic!("expected backoff, got {:?}", other),
        }
    }

    #[test]
    fn test_external_retries_exhaust() {
        let decision = classify_error("server busy, try later", MAX_EXTERNAL_RETRIES, None);
        assert_eq!(decision, RetryDecision::Surface);
    }

    #[test]
    fn test_smart_retry_forces_raw_fetch() {
        let params = json!({
            "name": "fetch",
            "arguments": {"url": "https://example.com"}
        });
        let decision = classify_error(
            "ExtractArticle.js: Command returned non-zero exit status 1",
            0,
            Some(&params),
        );
        match decision {
            RetryDecision::Retry { params } => {
                assert_eq!(params["arguments"]["raw"], true);
                assert_eq!(params["arguments"]["url"], "https://example.com");
            }
            other => panic!("expected smart retry, got {:?}", other),
        }
    }

    #[test]
    fn test_smart_retry_not_repeated_when_raw_set() {
        let params = json!({
            "name": "fetch",
            "arguments": {"url": "https://example.com", "raw": true}
        });
        let msg = "ExtractArticle.js: Command returned non-zero exit status 1";
        match classify_error(msg, 0, Some(&params)) {
            RetryDecision::RetryAfter(_) => {}
            other => panic!("expected plain backoff, got {:?}", other),
        }
    }

    #[test]
    fn test_cache_contamination_quick_retry() {
        match classify_error("response contains cached data from wrong url", 1, None) {
            // "cache" is also an external-transient pattern; the external
            // branch wins and backs off exponentially.
            RetryDecision::RetryAfter(d) => assert!(d >= Duration::from_millis(500)),
            other => panic!("expected retry, got {:?}", other),
        }
    }

    #[test]
    fn test_generic_error_single_retry() {
        assert_eq!(
            classify_error("unexpected condition", 0, None),
            RetryDecision::RetryAfter(Duration::from_millis(500))
        );
        assert_eq!(classify_error("unexpected condition", 1, None), RetryDecision::Surface);
    }

    #[test]
    fn test_clean_contaminated_response() {
        let mut result = json!({
            "content": [{
                "type": "text",
                "text": "Contents of https://wttr.in/london\nSunny, 21C\nWind: 5mph"
            }]
        });
        clean_contaminated_response(&mut result);
        let text = result["content"][0]["text"].as_str().unwrap();
        assert!(!text.contains("Contents of"));
        assert!(text.contains("Sunny, 21C"));
    }

    #[test]
    fn test_clean_leaves_normal_response() {
        let mut result = json!({"content": [{"type": "text", "text": "plain output"}]});
        clean_contaminated_response(&mut result);
        assert_eq!(result["content"][0]["text"], "plain output");
    }
}
