//! Execution tokens and the execution registry.
//!
//! Every secure tool invocation is recorded as a signed token in the
//! registry, completed or failed there, and purged once older than five
//! minutes.

use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use dashmap::DashMap;
use serde_json::Value;
use sha2::{Digest, Sha256};

/// Registry entries older than this are purged.
const MAX_EXECUTION_AGE: Duration = Duration::from_secs(300);

/// What kind of trigger produced a tool execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerType {
    ToolCall,
    ContextRequest,
    LintCheck,
    DiffValidation,
}

impl TriggerType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TriggerType::ToolCall => "tool_call",
            TriggerType::ContextRequest => "context_request",
            TriggerType::LintCheck => "lint_check",
            TriggerType::DiffValidation => "diff_validation",
        }
    }
}

/// A signed record of one tool invocation.
#[derive(Debug, Clone)]
pub struct ExecutionToken {
    pub tool_name: String,
    pub arguments: Value,
    pub conversation_id: String,
    pub trigger_type: TriggerType,
    pub timestamp: f64,
    pub signature: String,
}

impl ExecutionToken {
    pub fn new(
        tool_name: impl Into<String>,
        arguments: Value,
        conversation_id: impl Into<String>,
        trigger_type: TriggerType,
    ) -> Self {
        let tool_name = tool_name.into();
        let conversation_id = conversation_id.into();
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs_f64())
            .unwrap_or(0.0);

        let payload = format!(
            "{}:{}:{}:{}:{}",
            tool_name,
            arguments,
            conversation_id,
            trigger_type.as_str(),
            timestamp
        );
        let signature = format!("{:x}", Sha256::digest(payload.as_bytes()));

        Self {
            tool_name,
            arguments,
            conversation_id,
            trigger_type,
            timestamp,
            signature,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionStatus {
    Pending,
    Completed,
    Failed,
}

struct ExecutionRecord {
    token: ExecutionToken,
    registered_at: Instant,
    status: ExecutionStatus,
    error: Option<String>,
}

/// Tracks in-flight and recent tool executions.
#[derive(Default)]
pub struct ExecutionRegistry {
    executions: DashMap<String, ExecutionRecord>,
    results: DashMap<String, String>,
}

impl ExecutionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new execution; returns its id.
    pub fn register_execution(&self, token: ExecutionToken) -> String {
        self.cleanup();
        let execution_id = uuid::Uuid::new_v4().to_string();
        self.executions.insert(
            execution_id.clone(),
            ExecutionRecord {
                token,
                registered_at: Instant::now(),
                status: ExecutionStatus::Pending,
                error: None,
            },
        );
        execution_id
    }

    pub fn complete_execution(&self, execution_id: &str, result: impl Into<String>) -> bool {
        let Some(mut record) = self.executions.get_mut(execution_id) else {
            return false;
        };
        record.status = ExecutionStatus::Completed;
        self.results.insert(execution_id.to_string(), result.into());
        true
    }

    pub fn fail_execution(&self, execution_id: &str, error: impl Into<String>) -> bool {
        let Some(mut record) = self.executions.get_mut(execution_id) else {
            return false;
        };
        record.status = ExecutionStatus::Failed;
        record.error = Some(error.into());
        true
    }

    /// Verify an execution id against its token signature.
    pub fn verify_execution(&self, execution_id: &str, signature: &str) -> bool {
        self.executions
            .get(execution_id)
            .map(|record| record.token.signature == signature)
            .unwrap_or(false)
    }

    pub fn status(&self, execution_id: &str) -> Option<ExecutionStatus> {
        self.executions.get(execution_id).map(|r| r.status)
    }

    pub fn get_result(&self, execution_id: &str) -> Option<String> {
        self.results.get(execution_id).map(|r| r.clone())
    }

    pub fn len(&self) -> usize {
        self.executions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.executions.is_empty()
    }

    fn cleanup(&self) {
        let now = Instant::now();
        let expired: Vec<String> = self
            .executions
            .iter()
            .filter(|entry| now.duration_since(entry.registered_at) > MAX_EXECUTION_AGE)
            .map(|entry| entry.key().clone())
            .collect();
        for id in expired {
            self.executions.remove(&id);
            self.results.remove(&id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn token() -> ExecutionToken {
        ExecutionToken::new(
            "run_shell_command",
            json!({"command": "ls"}),
            "conv-1",
            TriggerType::ToolCall,
        )
    }

    #[test]
    fn test_token_signature_is_sha256_hex() {
        let t = token();
        assert_eq!(t.signature.len(), 64);
        assert!(t.signature.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_tokens_have_distinct_signatures() {
        let a = ExecutionToken::new("a", json!({}), "c", TriggerType::ToolCall);
        let b = ExecutionToken::new("b", json!({}), "c", TriggerType::ToolCall);
        assert_ne!(a.signature, b.signature);
    }

    #[test]
    fn test_register_complete_roundtrip() {
        let registry = ExecutionRegistry::new();
        let id = registry.register_execution(token());
        assert_eq!(registry.status(&id), Some(ExecutionStatus::Pending));

        assert!(registry.complete_execution(&id, "output"));
        assert_eq!(registry.status(&id), Some(ExecutionStatus::Completed));
        assert_eq!(registry.get_result(&id).as_deref(), Some("output"));
    }

    #[test]
    fn test_fail_execution() {
        let registry = ExecutionRegistry::new();
        let id = registry.register_execution(token());
        assert!(registry.fail_execution(&id, "timed out"));
        assert_eq!(registry.status(&id), Some(ExecutionStatus::Failed));
        assert!(registry.get_result(&id).is_none());
    }

    #[test]
    fn test_unknown_execution_rejected() {
        let registry = ExecutionRegistry::new();
        assert!(!registry.complete_execution("nope", "x"));
        assert!(!registry.fail_execution("nope", "x"));
        assert!(!registry.verify_execution("nope", "sig"));
    }

    #[test]
    fn test_verify_signature() {
        let registry = ExecutionRegistry::new();
        let t = token();
        let signature = t.signature.clone();
        let id = registry.register_execution(t);
        assert!(registry.verify_execution(&id, &signature));
        assert!(!registry.verify_execution(&id, "forged"));
    }
}
