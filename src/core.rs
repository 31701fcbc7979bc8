//! The `Core` handle: explicitly constructed wiring of the MCP subsystem.
//!
//! One `Core` is built at startup and handed to whoever needs it; there are
//! no process-wide singletons. When `ZIYA_ENABLE_MCP` is not truthy the core
//! is a stub that advertises no tools and fails tool calls with a disabled
//! notice.

use std::{collections::HashMap, sync::Arc};

use serde_json::Value;
use tracing::info;

use tool_parser::ToolCall;
use ziya_mcp::{
    secure::ExecutionOutcome, wire_cache_invalidation, ConnectionPool, DynamicToolLoader,
    ExecutionRegistry, McpConfig, McpManager, PermissionsStore, SecureTool, SecureToolRuntime,
    SecureToolsCache,
};

pub struct Core {
    enabled: bool,
    manager: Arc<McpManager>,
    pool: Arc<ConnectionPool>,
    permissions: Arc<PermissionsStore>,
    dynamic_tools: Arc<DynamicToolLoader>,
    registry: Arc<ExecutionRegistry>,
    runtime: Arc<SecureToolRuntime>,
    secure_tools: Arc<SecureToolsCache>,
}

impl Core {
    /// Build and initialize from the environment: config discovery, parallel
    /// server connects. A disabled core comes back as a stub.
    pub async fn initialize() -> Arc<Self> {
        let enabled = McpConfig::mcp_enabled();
        let core = Self::build(Arc::new(PermissionsStore::new()), enabled);
        if enabled {
            core.manager.initialize().await;
            let _cleanup = core.manager.spawn_external_cleanup();
        } else {
            info!("MCP is disabled; core running as a stub");
        }
        core
    }

    /// Build with an explicit configuration and permission store (tests,
    /// embedded use). The environment gate is bypassed: passing a config is
    /// the opt-in.
    pub async fn initialize_with_config(
        config: McpConfig,
        permissions: Arc<PermissionsStore>,
    ) -> Arc<Self> {
        let core = Self::build(permissions, true);
        core.manager.initialize_with_config(config).await;
        core
    }

    fn build(permissions: Arc<PermissionsStore>, enabled: bool) -> Arc<Self> {
        let dynamic_tools = Arc::new(DynamicToolLoader::new());
        let manager = Arc::new(McpManager::new(
            Arc::clone(&permissions),
            Arc::clone(&dynamic_tools),
        ));
        let pool = Arc::new(ConnectionPool::new(Arc::clone(&manager)));
        let registry = Arc::new(ExecutionRegistry::new());
        let runtime = Arc::new(SecureToolRuntime::new(
            Arc::clone(&pool),
            Arc::clone(&registry),
        ));
        let secure_tools = Arc::new(SecureToolsCache::new(
            Arc::clone(&manager),
            Arc::clone(&permissions),
        ));
        wire_cache_invalidation(&manager, &permissions, &secure_tools);

        Arc::new(Self {
            enabled,
            manager,
            pool,
            permissions,
            dynamic_tools,
            registry,
            runtime,
            secure_tools,
        })
    }

    pub fn mcp_enabled(&self) -> bool {
        self.enabled
    }

    pub fn manager(&self) -> &Arc<McpManager> {
        &self.manager
    }

    pub fn pool(&self) -> &Arc<ConnectionPool> {
        &self.pool
    }

    pub fn permissions(&self) -> &Arc<PermissionsStore> {
        &self.permissions
    }

    pub fn dynamic_tools(&self) -> &Arc<DynamicToolLoader> {
        &self.dynamic_tools
    }

    pub fn registry(&self) -> &Arc<ExecutionRegistry> {
        &self.registry
    }

    pub fn runtime(&self) -> &Arc<SecureToolRuntime> {
        &self.runtime
    }

    /// The assembled secure tool set; empty when MCP is disabled.
    pub fn secure_tools(&self) -> Vec<SecureTool> {
        if !self.enabled {
            return Vec::new();
        }
        self.secure_tools.get_tools()
    }

    /// Per-server status for diagnostics endpoints.
    pub fn server_status(&self) -> HashMap<String, Value> {
        self.manager.server_status()
    }

    /// Reconcile dynamic tools with the user's attached files.
    pub fn sync_attached_files(&self, file_paths: &[String]) {
        self.manager.sync_dynamic_tools(file_paths);
    }

    /// New request cycle: reset the progressive-delay counter and timeout
    /// suppression.
    pub fn reset_request_cycle(&self) {
        self.runtime.reset_cycle();
    }

    /// Execute one parsed tool call through the secure runtime.
    pub async fn execute_tool_call(
        &self,
        call: &ToolCall,
        conversation_id: &str,
    ) -> ExecutionOutcome {
        if !self.enabled {
            return ExecutionOutcome::Error("MCP is disabled".to_string());
        }

        let internal_name = call
            .tool_name
            .strip_prefix("mcp_")
            .unwrap_or(&call.tool_name)
            .to_string();
        let tool = SecureTool {
            name: format!("mcp_{}", internal_name),
            description: String::new(),
            mcp_tool_name: internal_name,
            server_name: None,
            secure: ziya_mcp::secure_mode_enabled(),
        };
        self.runtime
            .execute_outcome(&tool, call.arguments.clone(), conversation_id)
            .await
    }

    pub async fn shutdown(&self) {
        if self.enabled {
            self.manager.shutdown().await;
        }
    }
}
