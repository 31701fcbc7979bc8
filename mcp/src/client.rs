//! MCP server client: JSON-RPC 2.0 over a child process's stdio.
//!
//! One client owns one subprocess exclusively. Requests are serialized (at
//! most one in flight) by holding the process lock across the write/read
//! pair; request ids are strictly increasing. Responses are sanitized for
//! external-server quirks, and the dispatch loop applies the retry policy
//! from [`crate::retry`].

use std::{
    collections::VecDeque,
    path::{Path, PathBuf},
    process::Stdio,
    sync::{
        atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use serde_json::{json, Map, Value};
use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
    process::{Child, ChildStdin, ChildStdout, Command},
    time::timeout,
};
use tracing::{debug, error, info, warn};

use crate::{
    config::McpServerConfig,
    error::{McpError, McpResult},
    protocol::{
        empty_object, initialize_params, JsonRpcNotification, JsonRpcRequest, JsonRpcResponse,
        PromptDescriptor, ResourceDescriptor, ToolDescriptor,
    },
    retry::{classify_error, clean_contaminated_response, is_security_block, RetryDecision},
};

/// Response timeout for generic servers.
const GENERIC_RESPONSE_TIMEOUT: Duration = Duration::from_secs(30);

/// Response timeout for external servers (name matches the external set).
const EXTERNAL_RESPONSE_TIMEOUT: Duration = Duration::from_secs(60);

/// Grace period between terminate and kill on disconnect.
const DISCONNECT_GRACE: Duration = Duration::from_secs(5);

/// Minimum interval between reconnection attempts.
const RECONNECT_INTERVAL: Duration = Duration::from_secs(30);

/// Stdout buffer size; a large `tools/list` can exceed default line buffers.
const STDOUT_BUFFER_CAPACITY: usize = 1024 * 1024;

/// Default seconds between consecutive calls to the same tool.
const DEFAULT_TOOL_RATE_LIMIT: f64 = 2.0;

/// Ring-buffer cap for captured stderr lines.
const LOG_BUFFER_CAP: usize = 100;

/// Consecutive-failure thresholds before a server is flagged unhealthy.
const EXTERNAL_FAILURE_THRESHOLD: u32 = 5;
const GENERIC_FAILURE_THRESHOLD: u32 = 3;

struct ProcessHandle {
    child: Child,
    stdin: ChildStdin,
    stdout: BufReader<ChildStdout>,
}

/// Client for a single MCP tool server.
pub struct ServerClient {
    config: McpServerConfig,
    process: tokio::sync::Mutex<Option<ProcessHandle>>,
    request_id: AtomicU64,
    connected: AtomicBool,
    capabilities: RwLock<Value>,
    tools: RwLock<Vec<ToolDescriptor>>,
    resources: RwLock<Vec<ResourceDescriptor>>,
    prompts: RwLock<Vec<PromptDescriptor>>,
    logs: Arc<Mutex<VecDeque<String>>>,
    stderr_task: Mutex<Option<tokio::task::JoinHandle<()>>>,
    last_successful_call: Mutex<Instant>,
    last_reconnect_attempt: Mutex<Option<Instant>>,
    consecutive_failures: AtomicU32,
    tool_last_call: DashMap<String, Instant>,
    tool_rate_limits: DashMap<String, f64>,
}

impl ServerClient {
    pub fn new(config: McpServerConfig) -> Self {
        Self {
            config,
            process: tokio::sync::Mutex::new(None),
            request_id: AtomicU64::new(0),
            connected: AtomicBool::new(false),
            capabilities: RwLock::new(empty_object()),
            tools: RwLock::new(Vec::new()),
            resources: RwLock::new(Vec::new()),
            prompts: RwLock::new(Vec::new()),
            logs: Arc::new(Mutex::new(VecDeque::new())),
            stderr_task: Mutex::new(None),
            last_successful_call: Mutex::new(Instant::now()),
            last_reconnect_attempt: Mutex::new(None),
            consecutive_failures: AtomicU32::new(0),
            tool_last_call: DashMap::new(),
            tool_rate_limits: DashMap::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn config(&self) -> &McpServerConfig {
        &self.config
    }

    /// True iff the child is running and the `initialize` handshake
    /// completed.
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    pub fn tools(&self) -> Vec<ToolDescriptor> {
        self.tools.read().clone()
    }

    pub fn resources(&self) -> Vec<ResourceDescriptor> {
        self.resources.read().clone()
    }

    pub fn prompts(&self) -> Vec<PromptDescriptor> {
        self.prompts.read().clone()
    }

    pub fn capabilities(&self) -> Value {
        self.capabilities.read().clone()
    }

    pub fn has_tool(&self, name: &str) -> bool {
        self.tools.read().iter().any(|t| t.name == name)
    }

    pub fn tool_schema(&self, name: &str) -> Option<Value> {
        self.tools
            .read()
            .iter()
            .find(|t| t.name == name)
            .map(|t| t.input_schema.clone())
    }

    pub fn logs(&self) -> Vec<String> {
        self.logs.lock().iter().cloned().collect()
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures.load(Ordering::SeqCst)
    }

    /// Minimum seconds between consecutive calls to `tool_name`; `0`
    /// disables rate limiting for that tool.
    pub fn set_tool_rate_limit(&self, tool_name: &str, seconds: f64) {
        info!("Set rate limit for tool '{}': {}s", tool_name, seconds);
        self.tool_rate_limits.insert(tool_name.to_string(), seconds);
    }

    fn failure_threshold(&self) -> u32 {
        if self.config.external_server || self.config.uses_extended_timeout() {
            EXTERNAL_FAILURE_THRESHOLD
        } else {
            GENERIC_FAILURE_THRESHOLD
        }
    }

    pub fn is_healthy(&self) -> bool {
        self.consecutive_failures() < self.failure_threshold()
    }

    fn push_log(&self, entry: String) {
        let mut logs = self.logs.lock();
        logs.push_back(entry);
        while logs.len() > LOG_BUFFER_CAP {
            logs.pop_front();
        }
    }

    fn record_call_result(&self, success: bool) {
        if success {
            self.consecutive_failures.store(0, Ordering::SeqCst);
            *self.last_successful_call.lock() = Instant::now();
        } else {
            self.consecutive_failures.fetch_add(1, Ordering::SeqCst);
        }
        debug!(
            "MCP server health: {} consecutive failures",
            self.consecutive_failures()
        );
    }

    // ========================================================================
    // Connection lifecycle
    // ========================================================================

    /// Connect to the server: spawn the child, complete the `initialize`
    /// handshake, and load advertised capabilities.
    pub async fn connect(&self) -> bool {
        match self.try_connect().await {
            Ok(()) => {
                info!("Successfully connected to MCP server: {}", self.config.name);
                true
            }
            Err(e) => {
                error!("Error connecting to MCP server {}: {}", self.config.name, e);
                self.push_log(format!("ERROR: Connection failed - {}", e));
                self.disconnect().await;
                false
            }
        }
    }

    async fn try_connect(&self) -> McpResult<()> {
        // Drop any previous process first.
        self.disconnect().await;

        let (command, args) = resolve_command(&self.config);
        info!(
            "Starting MCP server '{}' with command: {} {}",
            self.config.name,
            command,
            args.join(" ")
        );

        let mut child = Command::new(&command)
            .args(&args)
            .envs(self.config.env.iter())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| McpError::Transport(format!("failed to spawn '{}': {}", command, e)))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| McpError::Transport("child has no stdin".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| McpError::Transport("child has no stdout".into()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| McpError::Transport("child has no stderr".into()))?;

        // Capture stderr into the ring buffer for diagnostics.
        let logs = Arc::clone(&self.logs);
        let task = tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                let mut logs = logs.lock();
                logs.push_back(format!("STDERR: {}", line.trim_end()));
                while logs.len() > LOG_BUFFER_CAP {
                    logs.pop_front();
                }
            }
        });
        *self.stderr_task.lock() = Some(task);

        *self.process.lock().await = Some(ProcessHandle {
            child,
            stdin,
            stdout: BufReader::with_capacity(STDOUT_BUFFER_CAPACITY, stdout),
        });

        let init_result = self
            .send_request_raw("initialize", Some(initialize_params()))
            .await?;
        *self.capabilities.write() = init_result
            .get("capabilities")
            .cloned()
            .unwrap_or_else(empty_object);
        self.connected.store(true, Ordering::SeqCst);
        *self.last_successful_call.lock() = Instant::now();
        self.consecutive_failures.store(0, Ordering::SeqCst);

        self.send_notification("notifications/initialized", None).await;
        self.load_server_capabilities().await;
        Ok(())
    }

    /// Disconnect: close stdin, give the child up to 5 s to exit, then kill.
    pub async fn disconnect(&self) {
        if let Some(task) = self.stderr_task.lock().take() {
            task.abort();
        }
        let handle = self.process.lock().await.take();
        if let Some(handle) = handle {
            let ProcessHandle {
                mut child,
                stdin,
                stdout,
            } = handle;
            drop(stdin);
            drop(stdout);
            if timeout(DISCONNECT_GRACE, child.wait()).await.is_err() {
                warn!("MCP server '{}' did not exit, killing", self.config.name);
                let _ = child.start_kill();
                let _ = child.wait().await;
            }
        }
        self.connected.store(false, Ordering::SeqCst);
    }

    /// Load resources, tools, and prompts, gated on advertised capabilities.
    /// Items that fail lenient deserialization are skipped.
    async fn load_server_capabilities(&self) {
        let capabilities = self.capabilities.read().clone();
        let server_name = self.config.name.clone();

        if capabilities.get("resources").is_some() {
            match self.send_request_raw("resources/list", None).await {
                Ok(result) => {
                    *self.resources.write() = parse_descriptor_list(&result, "resources");
                }
                Err(e) => warn!("Failed to list resources from {}: {}", server_name, e),
            }
        }

        if capabilities.get("tools").is_some() {
            match self.send_request_raw("tools/list", None).await {
                Ok(result) => {
                    let tools: Vec<ToolDescriptor> = parse_descriptor_list(&result, "tools");
                    info!(
                        "Successfully loaded {} tools for server {}",
                        tools.len(),
                        server_name
                    );
                    *self.tools.write() = tools;
                }
                Err(e) => warn!("Failed to list tools from {}: {}", server_name, e),
            }
        }

        if capabilities.get("prompts").is_some() {
            match self.send_request_raw("prompts/list", None).await {
                Ok(result) => {
                    *self.prompts.write() = parse_descriptor_list(&result, "prompts");
                }
                Err(e) => debug!("No prompts or failed to list on {}: {}", server_name, e),
            }
        }

        info!(
            "Loaded MCP capabilities for {}: {} resources, {} tools, {} prompts",
            server_name,
            self.resources.read().len(),
            self.tools.read().len(),
            self.prompts.read().len()
        );
    }

    // ========================================================================
    // Request dispatch
    // ========================================================================

    async fn is_process_healthy(&self) -> bool {
        let mut guard = self.process.lock().await;
        let Some(handle) = guard.as_mut() else {
            return false;
        };
        if let Ok(Some(status)) = handle.child.try_wait() {
            warn!(
                "MCP server process has terminated with code: {:?}",
                status.code()
            );
            *guard = None;
            self.connected.store(false, Ordering::SeqCst);
            return false;
        }
        drop(guard);

        // External servers are additionally gated on consecutive failures.
        if self.config.uses_extended_timeout() && !self.is_healthy() {
            warn!(
                "External server {} has {} consecutive failures",
                self.config.name,
                self.consecutive_failures()
            );
            return false;
        }
        true
    }

    /// Send a request with an up-front health check; an unhealthy process
    /// triggers a reconnection attempt, rate-limited to one per 30 s.
    pub async fn send_request(&self, method: &str, params: Option<Value>) -> McpResult<Value> {
        if !self.is_process_healthy().await {
            {
                let mut last = self.last_reconnect_attempt.lock();
                if let Some(prev) = *last {
                    if prev.elapsed() < RECONNECT_INTERVAL {
                        warn!("Process unhealthy, but reconnection rate limited");
                        return Err(McpError::ServerUnhealthy(
                            "Process unhealthy and reconnection rate limited".into(),
                        ));
                    }
                }
                *last = Some(Instant::now());
            }
            warn!("Process unhealthy, attempting reconnection");
            match self.try_connect().await {
                Ok(()) => info!("Reconnection successful, retrying request"),
                Err(e) => {
                    error!("Reconnection failed: {}", e);
                    return Err(McpError::ServerUnhealthy(format!(
                        "Reconnection failed: {}",
                        e
                    )));
                }
            }
        }
        self.send_request_raw(method, params).await
    }

    /// The dispatch loop: write one request line, read one response line,
    /// apply the retry policy. Holding the process lock across the
    /// write/read pair keeps at most one request in flight.
    async fn send_request_raw(&self, method: &str, params: Option<Value>) -> McpResult<Value> {
        let mut params = params;
        let mut attempt: u32 = 0;
        let mut transport_retries: u32 = 0;
        let mut external_timeout_retried = false;
        let read_timeout = if self.config.uses_extended_timeout() {
            EXTERNAL_RESPONSE_TIMEOUT
        } else {
            GENERIC_RESPONSE_TIMEOUT
        };

        loop {
            let id = self.request_id.fetch_add(1, Ordering::SeqCst) + 1;
            let request = JsonRpcRequest::new(id, method, params.clone());
            let mut line = serde_json::to_string(&request)
                .map_err(|e| McpError::Internal(format!("serialize request: {}", e)))?;
            line.push('\n');

            let mut guard = self.process.lock().await;
            let Some(handle) = guard.as_mut() else {
                return Err(McpError::Transport(
                    "No active process or stdin not available".into(),
                ));
            };

            if let Err(e) = handle.stdin.write_all(line.as_bytes()).await {
                *guard = None;
                self.connected.store(false, Ordering::SeqCst);
                return Err(McpError::Transport(format!("Error sending MCP request: {}", e)));
            }
            if let Err(e) = handle.stdin.flush().await {
                *guard = None;
                self.connected.store(false, Ordering::SeqCst);
                return Err(McpError::Transport(format!("Error sending MCP request: {}", e)));
            }

            let mut response_line = String::new();
            let read = timeout(read_timeout, handle.stdout.read_line(&mut response_line)).await;
            match read {
                Err(_) => {
                    // External servers get one immediate retry on a read
                    // timeout; otherwise the timeout surfaces so the caller
                    // can choose an alternative tool.
                    if self.config.uses_extended_timeout() && !external_timeout_retried {
                        warn!(
                            "External server {} timed out, trying immediate retry",
                            self.config.name
                        );
                        external_timeout_retried = true;
                        drop(guard);
                        tokio::time::sleep(Duration::from_secs(1)).await;
                        continue;
                    }
                    // The pending response would desynchronize the pipe;
                    // drop the process and let the reconnect path restart it.
                    *guard = None;
                    self.connected.store(false, Ordering::SeqCst);
                    error!(
                        "Timeout waiting for response from MCP server for method '{}'",
                        method
                    );
                    return Err(McpError::Timeout(format!(
                        "Request timed out after {} seconds for method '{}'",
                        read_timeout.as_secs(),
                        method
                    )));
                }
                Ok(Err(e)) => {
                    *guard = None;
                    self.connected.store(false, Ordering::SeqCst);
                    return Err(McpError::Transport(format!(
                        "Error reading from MCP server: {}",
                        e
                    )));
                }
                Ok(Ok(0)) => {
                    let code = handle.child.try_wait().ok().flatten().and_then(|s| s.code());
                    *guard = None;
                    self.connected.store(false, Ordering::SeqCst);
                    error!("No response from MCP server (EOF), exit code: {:?}", code);
                    return Err(McpError::Transport("No response from MCP server (EOF)".into()));
                }
                Ok(Ok(_)) => {}
            }
            drop(guard);

            let text = response_line.trim();
            if text.is_empty() || !(text.starts_with('{') && text.ends_with('}')) {
                // Malformed frame: a transport error, retried once.
                if transport_retries < 1 {
                    transport_retries += 1;
                    warn!("Invalid response format from MCP server, retrying once");
                    tokio::time::sleep(Duration::from_millis(500)).await;
                    continue;
                }
                let preview: String = text.chars().take(100).collect();
                return Err(McpError::Transport(format!(
                    "Invalid response format: expected JSON-RPC, got: {}...",
                    preview
                )));
            }

            let response: JsonRpcResponse = match serde_json::from_str(text) {
                Ok(r) => r,
                Err(e) => {
                    if transport_retries < 1 {
                        transport_retries += 1;
                        warn!("JSON decode error from MCP server, retrying once: {}", e);
                        tokio::time::sleep(Duration::from_millis(500)).await;
                        continue;
                    }
                    return Err(McpError::Transport(format!(
                        "Invalid JSON response from MCP server: {}",
                        e
                    )));
                }
            };

            if let Some(rpc_error) = response.error {
                let message = rpc_error.message.clone();

                // Intentional rejections are surfaced verbatim, never retried.
                if is_security_block(&message) {
                    info!("MCP server security block: {}", message);
                    return Err(McpError::Server {
                        code: rpc_error.code,
                        message,
                    });
                }

                match classify_error(&message, attempt, params.as_ref()) {
                    RetryDecision::Retry { params: mutated } => {
                        warn!("Smart retry with modified parameters for '{}'", method);
                        params = Some(mutated);
                        continue;
                    }
                    RetryDecision::RetryAfter(delay) => {
                        warn!(
                            "MCP server error, retrying in {:?} (attempt {}): {}",
                            delay,
                            attempt + 1,
                            message
                        );
                        attempt += 1;
                        tokio::time::sleep(delay).await;
                        continue;
                    }
                    RetryDecision::Surface => {
                        error!("MCP server error: {}", message);
                        return Err(McpError::Server {
                            code: rpc_error.code,
                            message,
                        });
                    }
                }
            }

            *self.last_successful_call.lock() = Instant::now();
            return Ok(response.result.unwrap_or(Value::Null));
        }
    }

    /// Fire-and-forget notification (no id, no response).
    pub async fn send_notification(&self, method: &str, params: Option<Value>) {
        let notification = JsonRpcNotification::new(method, params);
        let Ok(mut line) = serde_json::to_string(&notification) else {
            return;
        };
        line.push('\n');

        let mut guard = self.process.lock().await;
        if let Some(handle) = guard.as_mut() {
            if let Err(e) = handle.stdin.write_all(line.as_bytes()).await {
                error!("Error sending MCP notification: {}", e);
                return;
            }
            let _ = handle.stdin.flush().await;
        }
    }

    // ========================================================================
    // Tool invocation
    // ========================================================================

    /// Call a tool: reshape and validate arguments against the advertised
    /// schema, honor the per-tool rate limit, dispatch, and sanitize the
    /// response.
    pub async fn call_tool(&self, name: &str, arguments: Value) -> McpResult<Value> {
        let mut arguments = arguments;

        // A JSON string at the top level is parsed into an object.
        if let Value::String(s) = &arguments {
            if let Ok(parsed @ Value::Object(_)) = serde_json::from_str::<Value>(s) {
                arguments = parsed;
            }
        }

        // Unwrap a lone `tool_input` key; its value may itself be a JSON
        // string.
        arguments = unwrap_tool_input(arguments)?;

        if let Some(schema) = self.tool_schema(name) {
            arguments = validate_and_convert_arguments(arguments, &schema)
                .map_err(McpError::InvalidArguments)?;
        }

        self.apply_tool_rate_limit(name).await;
        self.tool_last_call.insert(name.to_string(), Instant::now());

        let result = self
            .send_request("tools/call", Some(json!({ "name": name, "arguments": arguments })))
            .await;

        match result {
            Ok(mut value) => {
                clean_contaminated_response(&mut value);
                self.record_call_result(true);
                Ok(value)
            }
            Err(e) => {
                self.record_call_result(false);
                // Timeouts always surface as timeouts so the caller can pick
                // an alternative; only non-timeout failures get masked by the
                // health verdict.
                if !e.is_timeout() && !self.is_healthy() {
                    warn!(
                        "MCP server {} has {} consecutive failures",
                        self.config.name,
                        self.consecutive_failures()
                    );
                    return Err(McpError::ServerUnavailable(format!(
                        "MCP server '{}' is experiencing issues. Consider using alternative \
                         tools or restarting the server.",
                        self.config.name
                    )));
                }
                Err(e)
            }
        }
    }

    async fn apply_tool_rate_limit(&self, name: &str) {
        let rate = self
            .tool_rate_limits
            .get(name)
            .map(|v| *v)
            .unwrap_or(DEFAULT_TOOL_RATE_LIMIT);
        if rate <= 0.0 {
            return;
        }
        let remaining = self.tool_last_call.get(name).and_then(|last| {
            Duration::from_secs_f64(rate).checked_sub(last.elapsed())
        });
        if let Some(wait) = remaining {
            if !wait.is_zero() {
                warn!(
                    "Rate limit active for tool '{}': waiting {:.1}s",
                    name,
                    wait.as_secs_f64()
                );
                tokio::time::sleep(wait).await;
            }
        }
    }

    /// Read a resource's text content by URI.
    pub async fn get_resource(&self, uri: &str) -> Option<String> {
        match self
            .send_request("resources/read", Some(json!({ "uri": uri })))
            .await
        {
            Ok(result) => result
                .get("contents")
                .and_then(Value::as_array)
                .and_then(|c| c.first())
                .and_then(|first| first.get("text"))
                .and_then(Value::as_str)
                .map(str::to_string),
            Err(e) => {
                error!(
                    "Error getting MCP resource {} from {}: {}",
                    uri, self.config.name, e
                );
                None
            }
        }
    }

    /// Fetch a prompt template and join its message contents.
    pub async fn get_prompt(&self, name: &str, arguments: Option<Value>) -> Option<String> {
        let mut params = json!({ "name": name });
        if let Some(args) = arguments {
            params["arguments"] = args;
        }
        match self.send_request("prompts/get", Some(params)).await {
            Ok(result) => {
                let messages = result.get("messages").and_then(Value::as_array)?;
                let parts: Vec<String> = messages
                    .iter()
                    .filter_map(|m| m.get("content"))
                    .filter_map(|content| match content {
                        Value::String(s) => Some(s.clone()),
                        Value::Object(o) => {
                            o.get("text").and_then(Value::as_str).map(str::to_string)
                        }
                        _ => None,
                    })
                    .collect();
                Some(parts.join("\n"))
            }
            Err(e) => {
                error!(
                    "Error getting MCP prompt {} from {}: {}",
                    name, self.config.name, e
                );
                None
            }
        }
    }
}

/// Resolve relative script paths in the configured command against a fixed
/// ordered list of candidate roots. Absolute paths are used as-is.
fn resolve_command(config: &McpServerConfig) -> (String, Vec<String>) {
    let mut roots: Vec<PathBuf> = Vec::new();
    if let Ok(cwd) = std::env::current_dir() {
        roots.push(cwd);
    }
    if let Ok(exe) = std::env::current_exe() {
        if let Some(dir) = exe.parent() {
            roots.push(dir.to_path_buf());
            if let Some(parent) = dir.parent() {
                roots.push(parent.to_path_buf());
            }
        }
    }

    let resolve = |part: &str| -> String {
        if part.ends_with(".py") && !Path::new(part).is_absolute() {
            for root in &roots {
                let candidate = root.join(part);
                if candidate.exists() {
                    info!("Found MCP server script '{}' at: {}", part, candidate.display());
                    return candidate.display().to_string();
                }
            }
            warn!("MCP server script '{}' not found in candidate roots", part);
        }
        part.to_string()
    };

    let command = resolve(&config.command);
    let args = config.args.iter().map(|a| resolve(a)).collect();
    (command, args)
}

fn parse_descriptor_list<T: serde::de::DeserializeOwned>(result: &Value, key: &str) -> Vec<T> {
    let Some(items) = result.get(key).and_then(Value::as_array) else {
        warn!("No '{}' key in list response", key);
        return Vec::new();
    };
    items
        .iter()
        .filter_map(|item| {
            if !item.is_object() {
                warn!("Skipping non-object {} item", key);
                return None;
            }
            match serde_json::from_value(item.clone()) {
                Ok(parsed) => Some(parsed),
                Err(e) => {
                    error!("Failed to parse {} item: {}", key, e);
                    None
                }
            }
        })
        .collect()
}

/// Unwrap a `{"tool_input": ...}` wrapper when it is the only key. A string
/// payload must parse as JSON.
fn unwrap_tool_input(arguments: Value) -> McpResult<Value> {
    let Value::Object(map) = &arguments else {
        return Ok(arguments);
    };
    if map.len() != 1 || !map.contains_key("tool_input") {
        return Ok(arguments);
    }

    let inner = map.get("tool_input").cloned().unwrap_or(Value::Null);
    match inner {
        Value::String(s) => serde_json::from_str(&s)
            .map_err(|e| McpError::InvalidArguments(format!("Invalid tool_input JSON: {}", e))),
        other => Ok(other),
    }
}

/// Validate arguments against the tool's input schema: required fields must
/// be present; scalar types are coerced toward the declared type; a bare
/// string becomes a single-element array where the schema expects one.
fn validate_and_convert_arguments(arguments: Value, schema: &Value) -> Result<Value, String> {
    let arguments = match arguments {
        Value::String(s) => {
            // Key the string under the first required (or first declared)
            // property.
            let props = schema
                .get("properties")
                .and_then(Value::as_object)
                .ok_or("Cannot convert string argument without schema")?;
            let primary = schema
                .get("required")
                .and_then(Value::as_array)
                .and_then(|r| r.first())
                .and_then(Value::as_str)
                .or_else(|| props.keys().next().map(String::as_str))
                .ok_or("Cannot convert string argument without schema")?;
            let mut map = Map::new();
            map.insert(primary.to_string(), Value::String(s));
            Value::Object(map)
        }
        other => other,
    };

    let args_map = match arguments {
        Value::Object(map) => map,
        other => return Err(format!("Arguments must be an object, got: {}", other)),
    };

    let Some(props) = schema.get("properties").and_then(Value::as_object) else {
        return Ok(Value::Object(args_map));
    };

    let missing: Vec<&str> = schema
        .get("required")
        .and_then(Value::as_array)
        .map(|required| {
            required
                .iter()
                .filter_map(Value::as_str)
                .filter(|field| !args_map.contains_key(*field))
                .collect()
        })
        .unwrap_or_default();
    if !missing.is_empty() {
        return Err(missing
            .iter()
            .map(|f| format!("Missing required field: {}", f))
            .collect::<Vec<_>>()
            .join(" -- "));
    }

    let mut validated = Map::new();
    for (key, value) in args_map {
        let Some(field_schema) = props.get(&key) else {
            warn!("Unknown parameter: {}", key);
            validated.insert(key, value);
            continue;
        };
        let expected = field_schema.get("type").and_then(Value::as_str);
        let coerced = match (expected, value) {
            (Some("array"), Value::String(s)) => json!([s]),
            (Some("integer"), Value::String(s)) => s
                .trim()
                .parse::<i64>()
                .map(Value::from)
                .map_err(|_| format!("Cannot convert {}='{}' to integer", key, s))?,
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
            (Some("boolean"), Value::String(s)) => {
                Value::Bool(matches!(s.to_lowercase().as_str(), "true" | "1" | "yes"))
            }
            (_, v) => v,
        };
        validated.insert(key, coerced);
    }
    Ok(Value::Object(validated))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn shell_schema() -> Value {
        json!({
            "type": "object",
            "properties": {
                "command": { "type": "string" },
                "timeout": { "type": "integer" },
                "verbose": { "type": "boolean" },
                "paths": { "type": "array" }
            },
            "required": ["command"]
        })
    }

    #[test]
    fn test_missing_required_field_rejected() {
        let err = validate_and_convert_arguments(json!({"timeout": 5}), &shell_schema())
            .unwrap_err();
        assert!(err.contains("Missing required field: command"));
    }

    #[test]
    fn test_type_coercion() {
        let validated = validate_and_convert_arguments(
            json!({"command": "ls", "timeout": "30", "verbose": "yes"}),
            &shell_schema(),
        )
        .unwrap();
        assert_eq!(validated["timeout"], 30);
        assert_eq!(validated["verbose"], true);
    }

    #[test]
    fn test_string_to_array_coercion() {
        let validated = validate_and_convert_arguments(
            json!({"command": "ls", "paths": "/tmp"}),
            &shell_schema(),
        )
        .unwrap();
        assert_eq!(validated["paths"], json!(["/tmp"]));
    }

    #[test]
    fn test_uncoercible_integer_rejected() {
        let err = validate_and_convert_arguments(
            json!({"command": "ls", "timeout": "soon"}),
            &shell_schema(),
        )
        .unwrap_err();
        assert!(err.contains("integer"));
    }

    #[test]
    fn test_bare_string_keyed_under_required_field() {
        let validated =
            validate_and_convert_arguments(json!("ls -la"), &shell_schema()).unwrap();
        assert_eq!(validated["command"], "ls -la");
    }

    #[test]
    fn test_unknown_parameter_passes_with_warning() {
        let validated = validate_and_convert_arguments(
            json!({"command": "ls", "extra": "x"}),
            &shell_schema(),
        )
        .unwrap();
        assert_eq!(validated["extra"], "x");
    }

    #[test]
    fn test_unwrap_tool_input_object() {
        let args = json!({"tool_input": {"command": "ls"}});
        assert_eq!(unwrap_tool_input(args).unwrap(), json!({"command": "ls"}));
    }

    #[test]
    fn test_unwrap_tool_input_json_string() {
        let args = json!({"tool_input": "{\"command\":\"ls\"}"});
        assert_eq!(unwrap_tool_input(args).unwrap(), json!({"command": "ls"}));
    }

    #[test]
    fn test_unwrap_tool_input_bad_string_rejected() {
        let args = json!({"tool_input": "not json"});
        let err = unwrap_tool_input(args).unwrap_err();
        assert_eq!(err.code(), -32602);
    }

    #[test]
    fn test_multi_key_object_not_unwrapped() {
        let args = json!({"tool_input": {"a": 1}, "other": 2});
        assert_eq!(unwrap_tool_input(args.clone()).unwrap(), args);
    }

    #[test]
    fn test_parse_descriptor_list_skips_bad_items() {
        let result = json!({"tools": [
            {"name": "good", "description": "ok", "inputSchema": {}},
            "not an object",
            {"description": "missing name"}
        ]});
        let tools: Vec<ToolDescriptor> = parse_descriptor_list(&result, "tools");
        assert_eq!(tools.len(), 1);
        assert_eq!(tools[0].name, "good");
    }

    #[tokio::test]
    async fn test_client_starts_disconnected() {
        let config = McpServerConfig {
            name: "test".into(),
            command: "true".into(),
            args: vec![],
            env: Default::default(),
            enabled: true,
            builtin: false,
            external_server: false,
            description: None,
        };
        let client = ServerClient::new(config);
        assert!(!client.is_connected());
        assert!(client.tools().is_empty());
        assert!(client.is_healthy());
    }
}
