//! Secure tool wrapper and the assembled-tool-set cache.
//!
//! Each MCP tool is exposed upstream as a uniformly-shaped callable. An
//! invocation creates an execution token, registers it, honors a minimum
//! per-(tool, conversation) interval plus a progressive delay, runs the call
//! under a hard timeout, truncates oversized output, and settles the
//! registry entry. The assembled tool set is cached with a TTL and
//! invalidated on any permission write or manager cache invalidation.

use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use dashmap::DashMap;
use parking_lot::Mutex;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::{
    error::McpError,
    manager::McpManager,
    permissions::{PermissionLevel, PermissionsStore},
    pool::ConnectionPool,
    security::{ExecutionRegistry, ExecutionToken, TriggerType},
};

/// Base seconds of progressive delay per prior execution in the cycle.
pub const TOOL_DELAY_ENV_VAR: &str = "MCP_TOOL_DELAY_SECONDS";
const DEFAULT_BASE_DELAY_SECS: u64 = 5;

/// Hard cap on sequential tool executions per request cycle.
pub const MAX_SEQUENTIAL_ENV_VAR: &str = "MCP_MAX_SEQUENTIAL_TOOLS";
const DEFAULT_MAX_SEQUENTIAL: u32 = 20;

/// Truncation cap on formatted tool output, in characters.
pub const MAX_OUTPUT_SIZE_ENV_VAR: &str = "MCP_MAX_TOOL_OUTPUT_SIZE";
const DEFAULT_MAX_OUTPUT_SIZE: usize = 10_000;

/// Secure mode flag; truthy by default.
pub const SECURE_MCP_ENV_VAR: &str = "ZIYA_SECURE_MCP";

/// Hard timeout on one wrapped tool execution.
const EXECUTION_TIMEOUT: Duration = Duration::from_secs(30);

/// Minimum interval between executions per (tool, conversation).
const MIN_EXECUTION_INTERVAL: Duration = Duration::from_secs(1);

/// Consecutive timeouts suppressed before one is surfaced.
const TIMEOUT_SURFACE_THRESHOLD: u32 = 3;

/// TTL for the assembled tool set.
const TOOL_SET_TTL: Duration = Duration::from_secs(300);

fn env_u64(var: &str, default: u64) -> u64 {
    std::env::var(var)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

pub fn secure_mode_enabled() -> bool {
    match std::env::var(SECURE_MCP_ENV_VAR) {
        Ok(v) => matches!(v.to_lowercase().as_str(), "true" | "1" | "yes"),
        Err(_) => true,
    }
}

/// The settled result of a wrapped execution. `Error` carries the
/// human-readable failure text; an empty string marks a suppressed
/// consecutive timeout (silent to the user, still a failure).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutionOutcome {
    Success(String),
    Error(String),
}

impl ExecutionOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, ExecutionOutcome::Success(_))
    }

    pub fn into_text(self) -> String {
        match self {
            ExecutionOutcome::Success(text) | ExecutionOutcome::Error(text) => text,
        }
    }
}

/// One exposed tool: the upstream-facing name (always `mcp_`-prefixed) plus
/// routing metadata.
#[derive(Debug, Clone)]
pub struct SecureTool {
    pub name: String,
    pub description: String,
    pub mcp_tool_name: String,
    pub server_name: Option<String>,
    /// When secure mode is off the wrapper skips token bookkeeping and the
    /// execution-time marker, exposing the tool unwrapped.
    pub secure: bool,
}

/// Shared execution state behind all secure tools.
pub struct SecureToolRuntime {
    pool: Arc<ConnectionPool>,
    registry: Arc<ExecutionRegistry>,
    last_execution: DashMap<String, Instant>,
    execution_counter: Mutex<u32>,
    consecutive_timeouts: DashMap<String, u32>,
    base_delay: Duration,
    max_sequential: u32,
    max_output_size: usize,
}

impl SecureToolRuntime {
    pub fn new(pool: Arc<ConnectionPool>, registry: Arc<ExecutionRegistry>) -> Self {
        Self {
            pool,
            registry,
            last_execution: DashMap::new(),
            execution_counter: Mutex::new(0),
            consecutive_timeouts: DashMap::new(),
            base_delay: Duration::from_secs(env_u64(TOOL_DELAY_ENV_VAR, DEFAULT_BASE_DELAY_SECS)),
            max_sequential: env_u64(MAX_SEQUENTIAL_ENV_VAR, DEFAULT_MAX_SEQUENTIAL as u64) as u32,
            max_output_size: env_u64(MAX_OUTPUT_SIZE_ENV_VAR, DEFAULT_MAX_OUTPUT_SIZE as u64)
                as usize,
        }
    }

    pub fn registry(&self) -> &Arc<ExecutionRegistry> {
        &self.registry
    }

    pub fn max_output_size(&self) -> usize {
        self.max_output_size
    }

    /// Reset for a new request cycle: execution order restarts and timeout
    /// suppression clears.
    pub fn reset_cycle(&self) {
        *self.execution_counter.lock() = 0;
        self.consecutive_timeouts.clear();
        info!("Tool execution counter reset for new request cycle");
    }

    /// Execute a wrapped tool and return a human-readable result string.
    pub async fn execute(
        &self,
        tool: &SecureTool,
        tool_input: Value,
        conversation_id: &str,
    ) -> String {
        self.execute_outcome(tool, tool_input, conversation_id)
            .await
            .into_text()
    }

    /// Execute a wrapped tool, keeping the success/error distinction for
    /// callers that route the two differently (the streaming middleware).
    pub async fn execute_outcome(
        &self,
        tool: &SecureTool,
        tool_input: Value,
        conversation_id: &str,
    ) -> ExecutionOutcome {
        // Sequential cap for the request cycle.
        let execution_order = {
            let mut counter = self.execution_counter.lock();
            if *counter >= self.max_sequential {
                warn!(
                    "Hit sequential limit of {} tools, blocking '{}'",
                    self.max_sequential, tool.mcp_tool_name
                );
                return ExecutionOutcome::Error(format!(
                    "⚠️ **Tool Execution Limit Reached**: Maximum of {} sequential tools per \
                     request cycle. Tool '{}' was not executed to prevent system overload.",
                    self.max_sequential, tool.mcp_tool_name
                ));
            }
            let order = *counter;
            *counter += 1;
            order
        };

        // Progressive delay: first tool runs immediately, each subsequent
        // one waits order × base.
        let delay = self.base_delay * execution_order;
        if !delay.is_zero() {
            info!(
                "Tool throttling: waiting {:?} before executing {} (execution #{})",
                delay,
                tool.mcp_tool_name,
                execution_order + 1
            );
            tokio::time::sleep(delay).await;
        }

        let token = ExecutionToken::new(
            tool.mcp_tool_name.clone(),
            tool_input.clone(),
            conversation_id,
            TriggerType::ToolCall,
        );
        let execution_id = if tool.secure {
            Some(self.registry.register_execution(token))
        } else {
            None
        };

        // Minimum spacing per (tool, conversation).
        let exec_key = format!("{}:{}", tool.name, conversation_id);
        let wait = self
            .last_execution
            .get(&exec_key)
            .and_then(|last| MIN_EXECUTION_INTERVAL.checked_sub(last.elapsed()));
        if let Some(wait) = wait {
            if !wait.is_zero() {
                tokio::time::sleep(wait).await;
            }
        }
        self.last_execution.insert(exec_key, Instant::now());

        let started = Instant::now();
        let outcome = tokio::time::timeout(
            EXECUTION_TIMEOUT,
            self.pool.call_tool(
                conversation_id,
                &tool.mcp_tool_name,
                tool_input,
                tool.server_name.as_deref(),
            ),
        )
        .await;
        let execution_time = started.elapsed();

        match outcome {
            Err(_) => {
                if let Some(id) = &execution_id {
                    self.registry.fail_execution(id, "Tool execution timed out");
                }
                if !self.track_timeout(&tool.mcp_tool_name) {
                    debug!(
                        "MCP tool {} timed out (suppressed)",
                        tool.mcp_tool_name
                    );
                    return ExecutionOutcome::Error(String::new());
                }
                ExecutionOutcome::Error(format!(
                    "⏱️ **Secure Tool Timeout**: {}\n\nThe tool execution timed out after {} \
                     seconds. This may indicate that the command is taking too long to complete \
                     or the system is under heavy load.",
                    tool.mcp_tool_name,
                    EXECUTION_TIMEOUT.as_secs()
                ))
            }
            Ok(Err(error)) => {
                if let Some(id) = &execution_id {
                    self.registry.fail_execution(id, error.to_string());
                }
                ExecutionOutcome::Error(self.format_error(tool, &error, execution_time))
            }
            Ok(Ok(result)) => {
                self.reset_timeout_counter(&tool.mcp_tool_name);
                let formatted = self.truncate_if_needed(format_result(&result));
                if let Some(id) = &execution_id {
                    self.registry.complete_execution(id, formatted.clone());
                    debug!(
                        "Executed {} with secure verification",
                        tool.mcp_tool_name
                    );
                    let marker = execution_time_marker(execution_time);
                    return ExecutionOutcome::Success(format!("{}{}", marker, formatted));
                }
                ExecutionOutcome::Success(formatted)
            }
        }
    }

    fn format_error(&self, tool: &SecureTool, error: &McpError, execution_time: Duration) -> String {
        let message = error.to_string();

        if error.is_security_block() || message.contains("Command not allowed") {
            return format!("🚫 **SECURITY BLOCK**: {}", message);
        }

        if error.code() == -32602 || message.to_lowercase().contains("validation") {
            return format!(
                "❌ **Parameter Validation Error**: {}\n\nPlease check the tool's parameter \
                 requirements and try again with correct parameter types.",
                message
            );
        }

        if error.is_timeout() {
            if !self.track_timeout(&tool.mcp_tool_name) {
                debug!(
                    "MCP server timeout for {} (suppressed)",
                    tool.mcp_tool_name
                );
                return String::new();
            }
            return format!(
                "⏱️ **MCP Server Timeout** (3+ consecutive): {}\n\n**Execution Time:** {:.1}s",
                message,
                execution_time.as_secs_f64()
            );
        }

        format!("❌ **MCP Server Error**: {}\n\n{}", tool.mcp_tool_name, message)
    }

    /// Record a timeout; returns `true` once the run of consecutive
    /// timeouts reaches the surfacing threshold.
    fn track_timeout(&self, tool_name: &str) -> bool {
        let mut entry = self
            .consecutive_timeouts
            .entry(tool_name.to_string())
            .or_insert(0);
        *entry += 1;
        *entry >= TIMEOUT_SURFACE_THRESHOLD
    }

    fn reset_timeout_counter(&self, tool_name: &str) {
        self.consecutive_timeouts.remove(tool_name);
    }

    fn truncate_if_needed(&self, text: String) -> String {
        if text.len() <= self.max_output_size {
            return text;
        }
        let truncated: String = text.chars().take(self.max_output_size).collect();
        format!(
            "{}\n\n... (Output truncated, exceeded {} characters)",
            truncated, self.max_output_size
        )
    }
}

fn execution_time_marker(execution_time: Duration) -> String {
    format!("⏱️ **Execution Time**: {:.2}s\n\n", execution_time.as_secs_f64())
}

/// Format a tool result for display: `{content: [...]}` joins text blocks,
/// `{content: "..."}` is used directly, anything else is stringified.
pub fn format_result(result: &Value) -> String {
    let content = result
        .get("content")
        .or_else(|| result.get("result"))
        .or_else(|| result.get("output"))
        .unwrap_or(result);

    match content {
        Value::Array(items) => {
            let texts: Vec<String> = items
                .iter()
                .map(|item| match item {
                    Value::Object(o) => o
                        .get("text")
                        .and_then(Value::as_str)
                        .map(str::to_string)
                        .unwrap_or_else(|| item.to_string()),
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                })
                .collect();
            texts.join("\n")
        }
        Value::String(s) => s.clone(),
        Value::Object(o) => o
            .get("text")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| content.to_string()),
        other => other.to_string(),
    }
}

/// The assembled secure tool set, cached against the current permissions and
/// manager tool list.
pub struct SecureToolsCache {
    manager: Arc<McpManager>,
    permissions: Arc<PermissionsStore>,
    cache: Mutex<Option<(Vec<SecureTool>, Instant)>>,
}

impl SecureToolsCache {
    pub fn new(manager: Arc<McpManager>, permissions: Arc<PermissionsStore>) -> Self {
        Self {
            manager,
            permissions,
            cache: Mutex::new(None),
        }
    }

    /// The current tool set, rebuilt when stale.
    pub fn get_tools(&self) -> Vec<SecureTool> {
        {
            let cache = self.cache.lock();
            if let Some((tools, built_at)) = cache.as_ref() {
                if built_at.elapsed() < TOOL_SET_TTL {
                    debug!("Using cached secure MCP tools ({} tools)", tools.len());
                    return tools.clone();
                }
            }
        }

        let tools = self.build_tools();
        *self.cache.lock() = Some((tools.clone(), Instant::now()));
        info!("Created {} secure MCP tools", tools.len());
        tools
    }

    /// Force a rebuild with current settings on the next access.
    pub fn invalidate(&self) {
        *self.cache.lock() = None;
        info!("MCP tools cache invalidated - will rebuild with current settings on next request");
    }

    fn build_tools(&self) -> Vec<SecureTool> {
        if !self.manager.is_initialized() {
            warn!("MCP manager not initialized, cannot create secure tools");
            return Vec::new();
        }

        let secure = secure_mode_enabled();
        if !secure {
            info!("Secure MCP mode disabled, falling back to unwrapped tool exposure");
        }

        let mut tools = Vec::new();
        for annotated in self.manager.get_all_tools() {
            // Disabled tools are not exposed to the agent context at all.
            if !annotated.dynamic {
                let permission = self
                    .permissions
                    .effective_tool_permission(&annotated.server_name, &annotated.tool.name);
                if permission == PermissionLevel::Disabled {
                    debug!(
                        "Skipping disabled tool {} from server {}",
                        annotated.tool.name, annotated.server_name
                    );
                    continue;
                }
            }

            let name = if annotated.tool.name.starts_with("mcp_") {
                annotated.tool.name.clone()
            } else {
                format!("mcp_{}", annotated.tool.name)
            };
            let server_name = (!annotated.dynamic).then(|| annotated.server_name.clone());
            tools.push(SecureTool {
                name,
                description: annotated.tool.description.clone(),
                mcp_tool_name: annotated.tool.name,
                server_name,
                secure,
            });
        }
        tools
    }
}

/// Wire permission writes and manager cache invalidation to the secure
/// tool-set cache. Weak references keep the object graph acyclic.
pub fn wire_cache_invalidation(
    manager: &McpManager,
    permissions: &PermissionsStore,
    cache: &Arc<SecureToolsCache>,
) {
    let weak = Arc::downgrade(cache);
    manager.set_invalidation_callback(move || {
        if let Some(cache) = weak.upgrade() {
            cache.invalidate();
        }
    });
    let weak = Arc::downgrade(cache);
    permissions.set_invalidation_callback(move || {
        if let Some(cache) = weak.upgrade() {
            cache.invalidate();
        }
    });
}
