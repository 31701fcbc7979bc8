//! MCP manager: the single authoritative entry point for tool routing.
//!
//! Supervises all server clients, aggregates their advertised tools behind a
//! TTL cache, and runs the policy pipeline (dynamic tools, permissions, loop
//! detection, parameter normalization) in front of every call.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use serde_json::{json, Map, Value};
use tracing::{debug, error, info, warn};

use crate::{
    client::ServerClient,
    config::{builtin_server_definitions, McpConfig, McpServerConfig},
    dynamic::DynamicToolLoader,
    error::{McpError, McpResult},
    loop_guard::LoopGuard,
    permissions::{PermissionLevel, PermissionsStore},
    protocol::{text_content_result, PromptDescriptor, ResourceDescriptor, ToolDescriptor},
};

/// TTL for the aggregated tools snapshot.
const TOOLS_CACHE_TTL: Duration = Duration::from_secs(300);

/// Minimum interval between reconnection attempts per server.
const RECONNECT_INTERVAL: Duration = Duration::from_secs(30);

/// Reconnect failures tolerated before a server enters the failed set.
const MAX_RECONNECT_FAILURES: u32 = 3;

/// Interval for the stuck-external-server sweep.
const EXTERNAL_CLEANUP_INTERVAL: Duration = Duration::from_secs(300);

/// A tool annotated with its owning server.
#[derive(Debug, Clone)]
pub struct AnnotatedTool {
    pub tool: ToolDescriptor,
    pub server_name: String,
    pub dynamic: bool,
}

struct ToolsCache {
    tools: Vec<AnnotatedTool>,
    cached_at: Instant,
}

pub type InvalidationCallback = Box<dyn Fn() + Send + Sync>;

pub struct McpManager {
    config: RwLock<McpConfig>,
    clients: DashMap<String, Arc<ServerClient>>,
    permissions: Arc<PermissionsStore>,
    dynamic_tools: Arc<DynamicToolLoader>,
    loop_guard: LoopGuard,
    tools_cache: Mutex<Option<ToolsCache>>,
    reconnection_attempts: DashMap<String, Instant>,
    reconnection_failures: DashMap<String, u32>,
    failed_servers: DashMap<String, ()>,
    initialized: AtomicBool,
    invalidation_callback: Mutex<Option<InvalidationCallback>>,
}

impl McpManager {
    pub fn new(permissions: Arc<PermissionsStore>, dynamic_tools: Arc<DynamicToolLoader>) -> Self {
        Self {
            config: RwLock::new(McpConfig {
                servers: HashMap::new(),
                config_path: None,
                search_paths: Vec::new(),
            }),
            clients: DashMap::new(),
            permissions,
            dynamic_tools,
            loop_guard: LoopGuard::new(),
            tools_cache: Mutex::new(None),
            reconnection_attempts: DashMap::new(),
            reconnection_failures: DashMap::new(),
            failed_servers: DashMap::new(),
            initialized: AtomicBool::new(false),
            invalidation_callback: Mutex::new(None),
        }
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::SeqCst)
    }

    /// Register the callback fired whenever the tools cache is invalidated
    /// (the secure tool-set cache hangs off this).
    pub fn set_invalidation_callback<F>(&self, callback: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        *self.invalidation_callback.lock() = Some(Box::new(callback));
    }

    /// Initialize from discovered configuration. A no-op returning `false`
    /// unless `ZIYA_ENABLE_MCP` is truthy.
    pub async fn initialize(&self) -> bool {
        if !McpConfig::mcp_enabled() {
            info!("MCP is disabled. Set ZIYA_ENABLE_MCP to enable MCP integration.");
            self.initialized.store(false, Ordering::SeqCst);
            return false;
        }
        self.initialize_with_config(McpConfig::load()).await
    }

    /// Initialize with an explicit configuration: connect all enabled
    /// servers in parallel.
    pub async fn initialize_with_config(&self, config: McpConfig) -> bool {
        *self.config.write() = config;

        let mut connect_tasks = Vec::new();
        {
            let config = self.config.read();
            for (server_name, server_config) in &config.servers {
                if !server_config.enabled {
                    info!("MCP server {} is disabled, skipping", server_name);
                    continue;
                }
                let client = Arc::new(ServerClient::new(server_config.clone()));
                self.clients.insert(server_name.clone(), Arc::clone(&client));
                let name = server_name.clone();
                connect_tasks.push(async move { (name, client.connect().await) });
            }
        }

        let results = futures::future::join_all(connect_tasks).await;
        self.invalidate_tools_cache();

        let connected = results.iter().filter(|(_, ok)| *ok).count();
        info!(
            "MCP Manager initialized: {}/{} servers connected",
            connected,
            results.len()
        );
        for (name, ok) in &results {
            if *ok {
                let client = self.clients.get(name).expect("client just inserted");
                info!(
                    "✅ {}: {} tools, {} resources",
                    name,
                    client.tools().len(),
                    client.resources().len()
                );
            } else {
                warn!("❌ {}: Connection failed", name);
            }
        }

        self.initialized.store(true, Ordering::SeqCst);
        true
    }

    fn client_snapshot(&self) -> Vec<(String, Arc<ServerClient>)> {
        self.clients
            .iter()
            .map(|entry| (entry.key().clone(), Arc::clone(entry.value())))
            .collect()
    }

    pub fn get_client(&self, server_name: &str) -> Option<Arc<ServerClient>> {
        self.clients.get(server_name).map(|c| Arc::clone(&c))
    }

    // ========================================================================
    // Tool aggregation
    // ========================================================================

    /// All tools from connected+enabled servers (cached with a 300 s TTL)
    /// plus the currently active dynamic tools.
    pub fn get_all_tools(&self) -> Vec<AnnotatedTool> {
        let mut tools = {
            let mut cache = self.tools_cache.lock();
            let fresh = cache
                .as_ref()
                .filter(|c| c.cached_at.elapsed() < TOOLS_CACHE_TTL);
            match fresh {
                Some(cached) => {
                    debug!("get_all_tools: using cached tools ({})", cached.tools.len());
                    cached.tools.clone()
                }
                None => {
                    let collected = self.collect_server_tools();
                    debug!(
                        "get_all_tools: cached {} tools for {}s",
                        collected.len(),
                        TOOLS_CACHE_TTL.as_secs()
                    );
                    *cache = Some(ToolsCache {
                        tools: collected.clone(),
                        cached_at: Instant::now(),
                    });
                    collected
                }
            }
        };

        // Dynamic tools are never cached; they change with file attachments.
        for tool in self.dynamic_tools.tool_descriptors() {
            tools.push(AnnotatedTool {
                tool,
                server_name: "dynamic".to_string(),
                dynamic: true,
            });
        }
        tools
    }

    fn collect_server_tools(&self) -> Vec<AnnotatedTool> {
        let config = self.config.read();
        let mut tools = Vec::new();
        for (server_name, client) in self.client_snapshot() {
            let enabled = config
                .servers
                .get(&server_name)
                .map(|c| c.enabled)
                .unwrap_or(true);
            if !client.is_connected() {
                warn!(
                    "get_all_tools: server '{}' is not connected, skipping its tools",
                    server_name
                );
                continue;
            }
            if !enabled {
                debug!("get_all_tools: server '{}' is disabled, skipping tools", server_name);
                continue;
            }
            for tool in client.tools() {
                tools.push(AnnotatedTool {
                    tool,
                    server_name: server_name.clone(),
                    dynamic: false,
                });
            }
        }
        tools
    }

    /// Force a rebuild on the next `get_all_tools` call and notify
    /// dependents.
    pub fn invalidate_tools_cache(&self) {
        *self.tools_cache.lock() = None;
        if let Some(callback) = self.invalidation_callback.lock().as_ref() {
            callback();
        }
        info!("Tools cache invalidated");
    }

    /// Reconcile dynamic tools with attached files, invalidating the cache
    /// when the set changed.
    pub fn sync_dynamic_tools(&self, file_paths: &[String]) {
        if self.dynamic_tools.sync_with_files(file_paths) {
            self.invalidate_tools_cache();
        }
    }

    // ========================================================================
    // Tool invocation pipeline
    // ========================================================================

    /// Execute a tool. The pipeline order matters: dynamic tools first, then
    /// the permission gate, loop detection, parameter normalization, and
    /// finally dispatch to the owning client.
    pub async fn call_tool(
        &self,
        tool_name: &str,
        arguments: Value,
        server_name: Option<&str>,
        conversation_id: Option<&str>,
    ) -> McpResult<Value> {
        let internal_name = tool_name.strip_prefix("mcp_").unwrap_or(tool_name);

        // 1. In-process dynamic tools bypass the subprocess path entirely.
        if let Some(tool) = self.dynamic_tools.get_tool(internal_name) {
            info!("Executing dynamic tool: {}", internal_name);
            let text = tool.execute(arguments).await?;
            return Ok(text_content_result(text));
        }

        // 2. Permission gate.
        if let Some(tool_server) = self.find_tool_server(internal_name) {
            let permission = self
                .permissions
                .effective_tool_permission(&tool_server, internal_name);
            if permission == PermissionLevel::Disabled {
                info!("Tool {} is disabled", internal_name);
                return Err(McpError::PolicyDenied(format!(
                    "Tool '{}' is currently disabled. You can enable it in MCP Server Settings.",
                    internal_name
                )));
            }
        }

        // 3. Loop detection.
        if self
            .loop_guard
            .check_and_record(conversation_id, tool_name, &arguments)
        {
            return Err(McpError::LoopBlocked(format!(
                "Tool call blocked: {} has been called repeatedly with similar arguments. \
                 Please try a different approach or check if the previous results contain \
                 what you need.",
                tool_name
            )));
        }

        // 4. Schema-driven parameter normalization and type coercion.
        let arguments = self.normalize_tool_parameters(internal_name, arguments)?;
        let arguments = self.coerce_argument_types(internal_name, arguments);

        // 5. Dispatch.
        if let Some(server_name) = server_name {
            let Some(client) = self.get_client(server_name) else {
                return Err(McpError::ServerUnhealthy(format!(
                    "Server '{}' is not connected",
                    server_name
                )));
            };
            if !client.is_connected() {
                return Err(McpError::ServerUnhealthy(format!(
                    "Server '{}' is not connected",
                    server_name
                )));
            }
            if !self.ensure_client_healthy(server_name, &client).await {
                error!("Client {} is unhealthy, cannot execute tool", server_name);
                return Err(McpError::ServerUnhealthy(format!(
                    "Server '{}' is unhealthy",
                    server_name
                )));
            }
            return client.call_tool(internal_name, arguments).await;
        }

        for (name, client) in self.client_snapshot() {
            if !client.is_connected() {
                continue;
            }
            let name_to_use = if client.has_tool(tool_name) {
                tool_name
            } else if client.has_tool(internal_name) {
                internal_name
            } else {
                continue;
            };
            if !self.ensure_client_healthy(&name, &client).await {
                warn!("Client {} unhealthy, skipping tool execution", name);
                continue;
            }
            debug!("Found tool '{}' in server '{}', executing", name_to_use, name);
            return client.call_tool(name_to_use, arguments).await;
        }

        warn!("Tool '{}' not found in any connected server", internal_name);

        // Point at the built-in shell server when its flagship tool is asked
        // for while the server is down.
        let shell_is_builtin = self
            .config
            .read()
            .servers
            .get("shell")
            .map(|c| c.builtin)
            .unwrap_or(false);
        if internal_name == "run_shell_command" && shell_is_builtin {
            return Err(McpError::ServerUnhealthy(format!(
                "Tool '{}' is available in the 'shell' server, but that server is currently \
                 disconnected. Please check MCP Server Settings to reconnect it.",
                internal_name
            )));
        }

        Err(McpError::ToolNotFound(internal_name.to_string()))
    }

    /// Which connected server advertises this tool.
    fn find_tool_server(&self, tool_name: &str) -> Option<String> {
        self.client_snapshot()
            .into_iter()
            .find(|(_, client)| client.is_connected() && client.has_tool(tool_name))
            .map(|(name, _)| name)
    }

    fn find_tool_schema(&self, tool_name: &str) -> Option<Value> {
        self.client_snapshot()
            .into_iter()
            .filter(|(_, client)| client.is_connected())
            .find_map(|(_, client)| client.tool_schema(tool_name))
    }

    /// Reshape arguments against the schema's `tool_input` convention: wrap
    /// when the schema expects exactly one `tool_input` property, unwrap
    /// when it does not but the arguments are wrapped.
    fn normalize_tool_parameters(&self, tool_name: &str, arguments: Value) -> McpResult<Value> {
        let mut args_map = match arguments {
            Value::Object(map) => map,
            other => return Ok(other),
        };

        // A JSON-string `tool_input` is parsed before any shape decision.
        if let Some(Value::String(s)) = args_map.get("tool_input") {
            match serde_json::from_str::<Value>(s) {
                Ok(parsed) => {
                    info!("Parsed tool_input JSON string for {}", tool_name);
                    args_map.insert("tool_input".to_string(), parsed);
                }
                Err(e) => {
                    return Err(McpError::InvalidArguments(format!(
                        "Invalid JSON in tool_input: {}",
                        e
                    )));
                }
            }
        }

        let Some(schema) = self.find_tool_schema(tool_name) else {
            return Ok(Value::Object(args_map));
        };
        let Some(props) = schema.get("properties").and_then(Value::as_object) else {
            return Ok(Value::Object(args_map));
        };

        let schema_uses_wrapper = props.len() == 1
            && props
                .get("tool_input")
                .map(|p| p.get("properties").is_some())
                .unwrap_or(false);
        let params_are_wrapped = args_map.len() == 1 && args_map.contains_key("tool_input");

        if schema_uses_wrapper && !params_are_wrapped {
            info!("Auto-wrapping parameters for {} with tool_input", tool_name);
            let mut wrapped = Map::new();
            wrapped.insert("tool_input".to_string(), Value::Object(args_map));
            return Ok(Value::Object(wrapped));
        }
        if !schema_uses_wrapper && params_are_wrapped {
            info!("Auto-unwrapping tool_input for {}", tool_name);
            return Ok(args_map.remove("tool_input").unwrap_or_else(|| json!({})));
        }
        Ok(Value::Object(args_map))
    }

    /// Coerce string-typed scalars toward the schema's declared types.
    /// Unconvertible values pass through unchanged; the server will reject
    /// them with a proper validation error.
    fn coerce_argument_types(&self, tool_name: &str, arguments: Value) -> Value {
        let args_map = match arguments {
            Value::Object(map) => map,
            other => return other,
        };
        let Some(schema) = self.find_tool_schema(tool_name) else {
            return Value::Object(args_map);
        };
        let Some(props) = schema.get("properties").and_then(Value::as_object) else {
            return Value::Object(args_map);
        };

        let mut coerced = Map::new();
        for (key, value) in args_map {
            let expected = props
                .get(&key)
                .and_then(|p| p.get("type"))
                .and_then(Value::as_str);
            let new_value = match (expected, value) {
                (Some("number"), Value::String(s)) => {
                    let trimmed = s.trim();
                    if trimmed.contains('.') {
                        trimmed
                            .parse::<f64>()
                            .ok()
                            .and_then(serde_json::Number::from_f64)
                            .map(Value::Number)
                            .unwrap_or(Value::String(s))
                    } else {
                        trimmed.parse::<i64>().map(Value::from).unwrap_or(Value::String(s))
                    }
                }
                (Some("integer"), Value::String(s)) => {
                    s.trim().parse::<i64>().map(Value::from).unwrap_or(Value::String(s))
                }
                (Some("boolean"), Value::String(s)) => {
                    Value::Bool(matches!(s.to_lowercase().as_str(), "true" | "1" | "yes"))
                }
                (_, v) => v,
            };
            coerced.insert(key, new_value);
        }
        Value::Object(coerced)
    }

    // ========================================================================
    // Health and lifecycle
    // ========================================================================

    /// Reconnect an unhealthy client, rate-limited to once per 30 s per
    /// server. Three failed attempts quarantine the server.
    async fn ensure_client_healthy(&self, server_name: &str, client: &Arc<ServerClient>) -> bool {
        if self.failed_servers.contains_key(server_name) {
            debug!("Server {} is in failed state, skipping health check", server_name);
            return false;
        }
        if client.is_connected() && client.is_healthy() {
            return true;
        }

        if let Some(last) = self.reconnection_attempts.get(server_name) {
            if last.elapsed() < RECONNECT_INTERVAL {
                debug!(
                    "Skipping reconnection attempt for {} - too recent",
                    server_name
                );
                return false;
            }
        }
        self.reconnection_attempts
            .insert(server_name.to_string(), Instant::now());

        warn!("Client {} unhealthy, attempting reconnection", server_name);
        client.disconnect().await;
        if client.connect().await {
            info!("Client {} reconnection successful", server_name);
            self.invalidate_tools_cache();
            self.reconnection_failures.remove(server_name);
            true
        } else {
            error!("Client {} reconnection failed", server_name);
            let failures = {
                let mut entry = self
                    .reconnection_failures
                    .entry(server_name.to_string())
                    .or_insert(0);
                *entry += 1;
                *entry
            };
            if failures >= MAX_RECONNECT_FAILURES {
                error!(
                    "Server {} failed {} times, disabling",
                    server_name, failures
                );
                self.failed_servers.insert(server_name.to_string(), ());
            }
            false
        }
    }

    /// Restart external servers stuck at the consecutive-failure ceiling.
    pub async fn cleanup_stuck_external_servers(&self) {
        for (name, client) in self.client_snapshot() {
            if !client.config().external_server && !client.config().uses_extended_timeout() {
                continue;
            }
            if client.is_healthy() {
                continue;
            }
            warn!("Restarting stuck external server: {}", name);
            client.disconnect().await;
            // Give the external process time to release its resources.
            tokio::time::sleep(Duration::from_secs(2)).await;
            if client.connect().await {
                info!("Successfully restarted external server: {}", name);
                self.invalidate_tools_cache();
            } else {
                error!("Failed to restart external server {}", name);
                self.failed_servers.insert(name, ());
            }
        }
    }

    /// Background sweep for stuck external servers.
    pub fn spawn_external_cleanup(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(EXTERNAL_CLEANUP_INTERVAL);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                interval.tick().await;
                manager.cleanup_stuck_external_servers().await;
            }
        })
    }

    /// Restart one server, optionally with a new configuration.
    pub async fn restart_server(
        &self,
        server_name: &str,
        new_config: Option<McpServerConfig>,
    ) -> bool {
        if let Some((_, client)) = self.clients.remove(server_name) {
            client.disconnect().await;
        }
        self.failed_servers.remove(server_name);
        self.reconnection_failures.remove(server_name);

        let server_config = match new_config {
            Some(config) => config,
            None => {
                let existing = self.config.read().servers.get(server_name).cloned();
                match existing.or_else(|| builtin_server_definitions().remove(server_name)) {
                    Some(config) => config,
                    None => {
                        error!(
                            "No configuration found for server '{}' during restart",
                            server_name
                        );
                        return false;
                    }
                }
            }
        };
        self.config
            .write()
            .servers
            .insert(server_name.to_string(), server_config.clone());

        let client = Arc::new(ServerClient::new(server_config));
        self.clients
            .insert(server_name.to_string(), Arc::clone(&client));
        let success = client.connect().await;
        self.invalidate_tools_cache();
        info!(
            "Server {} restart {}",
            server_name,
            if success { "successful" } else { "failed" }
        );
        success
    }

    /// Disconnect all servers in parallel and clear state.
    pub async fn shutdown(&self) {
        let clients = self.client_snapshot();
        let tasks = clients
            .iter()
            .map(|(_, client)| client.disconnect())
            .collect::<Vec<_>>();
        futures::future::join_all(tasks).await;
        self.clients.clear();
        self.invalidate_tools_cache();
        self.initialized.store(false, Ordering::SeqCst);
        info!("MCP Manager shutdown complete");
    }

    // ========================================================================
    // Status and secondary lookups
    // ========================================================================

    /// Per-server status, including servers that failed to connect.
    pub fn server_status(&self) -> HashMap<String, Value> {
        let config = self.config.read();
        let mut status = HashMap::new();
        for (server_name, server_config) in &config.servers {
            let entry = match self.get_client(server_name) {
                Some(client) => json!({
                    "connected": client.is_connected(),
                    "resources": client.resources().len(),
                    "tools": client.tools().len(),
                    "prompts": client.prompts().len(),
                    "capabilities": client.capabilities(),
                    "builtin": server_config.builtin,
                }),
                None => json!({
                    "connected": false,
                    "resources": 0,
                    "tools": 0,
                    "prompts": 0,
                    "capabilities": {},
                    "builtin": server_config.builtin,
                }),
            };
            status.insert(server_name.clone(), entry);
        }
        status
    }

    pub fn get_all_prompts(&self) -> Vec<(String, PromptDescriptor)> {
        self.client_snapshot()
            .into_iter()
            .filter(|(_, client)| client.is_connected())
            .flat_map(|(name, client)| {
                client
                    .prompts()
                    .into_iter()
                    .map(move |p| (name.clone(), p))
                    .collect::<Vec<_>>()
            })
            .collect()
    }

    pub fn get_all_resources(&self) -> Vec<(String, ResourceDescriptor)> {
        self.client_snapshot()
            .into_iter()
            .filter(|(_, client)| client.is_connected())
            .flat_map(|(name, client)| {
                client
                    .resources()
                    .into_iter()
                    .map(move |r| (name.clone(), r))
                    .collect::<Vec<_>>()
            })
            .collect()
    }

    /// Read resource content, from one server or the first that has it.
    pub async fn get_resource_content(
        &self,
        uri: &str,
        server_name: Option<&str>,
    ) -> Option<String> {
        if let Some(server_name) = server_name {
            let client = self.get_client(server_name)?;
            if client.is_connected() {
                return client.get_resource(uri).await;
            }
            return None;
        }
        for (_, client) in self.client_snapshot() {
            if client.is_connected() {
                if let Some(content) = client.get_resource(uri).await {
                    return Some(content);
                }
            }
        }
        None
    }

    /// Fetch a prompt, from one server or the first that advertises it.
    pub async fn get_prompt_content(
        &self,
        prompt_name: &str,
        arguments: Option<Value>,
        server_name: Option<&str>,
    ) -> Option<String> {
        if let Some(server_name) = server_name {
            let client = self.get_client(server_name)?;
            if client.is_connected() {
                return client.get_prompt(prompt_name, arguments).await;
            }
            return None;
        }
        for (_, client) in self.client_snapshot() {
            if client.is_connected() && client.prompts().iter().any(|p| p.name == prompt_name) {
                return client.get_prompt(prompt_name, arguments.clone()).await;
            }
        }
        None
    }
}
