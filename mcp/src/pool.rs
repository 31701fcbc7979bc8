//! Connection pool: per-(tool, conversation) call spacing and routing.
//!
//! A single process-wide object. It does not own subprocess lifetimes (the
//! manager does); it enforces the minimum inter-call interval and pins
//! shell-command tools to the `shell` server before delegating.

use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use dashmap::DashMap;
use serde_json::Value;
use tracing::{debug, info};

use crate::{error::McpResult, manager::McpManager};

/// Minimum interval between calls for one (tool, conversation) pair.
const MIN_CALL_INTERVAL: Duration = Duration::from_millis(500);

pub struct ConnectionPool {
    manager: Arc<McpManager>,
    last_call_time: DashMap<(String, String), Instant>,
}

impl ConnectionPool {
    pub fn new(manager: Arc<McpManager>) -> Self {
        Self {
            manager,
            last_call_time: DashMap::new(),
        }
    }

    pub fn manager(&self) -> &Arc<McpManager> {
        &self.manager
    }

    /// Call a tool through the manager, spacing calls per
    /// (tool, conversation).
    pub async fn call_tool(
        &self,
        conversation_id: &str,
        tool_name: &str,
        arguments: Value,
        server_name: Option<&str>,
    ) -> McpResult<Value> {
        info!("Connection pool: calling tool {}", tool_name);

        // Shell commands always run on the shell server.
        let server_name = if tool_name == "run_shell_command" || tool_name == "mcp_run_shell_command"
        {
            debug!("Pinning shell command to the 'shell' server");
            Some("shell")
        } else {
            server_name
        };

        let key = (tool_name.to_string(), conversation_id.to_string());
        let wait = self
            .last_call_time
            .get(&key)
            .and_then(|last| MIN_CALL_INTERVAL.checked_sub(last.elapsed()));
        if let Some(wait) = wait {
            if !wait.is_zero() {
                tokio::time::sleep(wait).await;
            }
        }
        self.last_call_time.insert(key, Instant::now());

        self.manager
            .call_tool(tool_name, arguments, server_name, Some(conversation_id))
            .await
    }
}
