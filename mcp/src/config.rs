//! MCP server configuration: built-in definitions, user config discovery,
//! and normalization.
//!
//! User config lives in `mcp_config.json`, searched in the current working
//! directory, next to the installed binaries, and finally
//! `~/.ziya/mcp_config.json`. Its `mcpServers` mapping is deep-merged over
//! the built-in definitions.

use std::{
    collections::HashMap,
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

/// Environment flag gating the whole MCP subsystem.
pub const ENABLE_MCP_ENV_VAR: &str = "ZIYA_ENABLE_MCP";

/// Keywords marking a server command as external (extended timeouts/retries).
const EXTERNAL_COMMAND_KEYWORDS: &[&str] = &["fetch", "uvx", "npx"];

/// Server-name keywords that select the extended response timeout.
pub const EXTERNAL_NAME_KEYWORDS: &[&str] = &["fetch", "web", "http", "api", "external"];

/// `command` may be a scalar or a sequence; the normalized form is a scalar
/// command plus an args sequence.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(untagged)]
pub enum CommandSpec {
    Single(String),
    Argv(Vec<String>),
}

fn one_or_many<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum OneOrMany {
        One(String),
        Many(Vec<String>),
    }
    Ok(match OneOrMany::deserialize(deserializer)? {
        OneOrMany::One(s) => vec![s],
        OneOrMany::Many(v) => v,
    })
}

fn default_enabled() -> bool {
    true
}

/// A server entry as written in the user config file.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RawServerConfig {
    #[serde(default)]
    pub command: Option<CommandSpec>,
    #[serde(default, deserialize_with = "one_or_many")]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub description: Option<String>,
}

/// Shape of the user config file.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct UserConfig {
    #[serde(rename = "mcpServers", default)]
    pub mcp_servers: HashMap<String, RawServerConfig>,
}

/// Normalized server configuration: scalar command, args sequence.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct McpServerConfig {
    pub name: String,
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub builtin: bool,
    #[serde(default)]
    pub external_server: bool,
    #[serde(default)]
    pub description: Option<String>,
}

impl McpServerConfig {
    /// The full command line as one string, used for external detection.
    pub fn full_command(&self) -> String {
        let mut parts = vec![self.command.clone()];
        parts.extend(self.args.iter().cloned());
        parts.join(" ")
    }

    /// Servers whose name matches the external keyword set use the extended
    /// response timeout.
    pub fn uses_extended_timeout(&self) -> bool {
        let lower = self.name.to_lowercase();
        EXTERNAL_NAME_KEYWORDS.iter().any(|k| lower.contains(k))
    }
}

/// Fully resolved configuration plus discovery metadata.
#[derive(Debug, Clone)]
pub struct McpConfig {
    pub servers: HashMap<String, McpServerConfig>,
    pub config_path: Option<PathBuf>,
    pub search_paths: Vec<PathBuf>,
}

impl McpConfig {
    /// Whether MCP is enabled for this process (`ZIYA_ENABLE_MCP` truthy).
    pub fn mcp_enabled() -> bool {
        match std::env::var(ENABLE_MCP_ENV_VAR) {
            Ok(v) => matches!(v.to_lowercase().as_str(), "true" | "1" | "yes"),
            Err(_) => false,
        }
    }

    /// Load configuration: built-in definitions merged with the user config
    /// file, if one is found.
    pub fn load() -> Self {
        let (config_path, search_paths) = find_config_file();
        Self::load_with_path(config_path, search_paths)
    }

    /// Load using an explicit config path (tests, `--mcp-config` flag).
    pub fn load_from(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let exists = path.exists();
        Self::load_with_path(exists.then(|| path.clone()), vec![path])
    }

    fn load_with_path(config_path: Option<PathBuf>, search_paths: Vec<PathBuf>) -> Self {
        let mut servers = builtin_server_definitions();
        info!(
            "Initialized with {} built-in server definitions",
            servers.len()
        );

        if let Some(path) = &config_path {
            match read_user_config(path) {
                Ok(user) => {
                    let count = user.mcp_servers.len();
                    for (name, raw) in user.mcp_servers {
                        merge_user_server(&mut servers, name, raw);
                    }
                    info!(
                        "Loaded {} user server configurations from {}",
                        count,
                        path.display()
                    );
                }
                Err(e) => {
                    error!("Error reading MCP config from {}: {}", path.display(), e);
                    warn!("Skipping malformed config file, using built-in defaults only");
                }
            }
        } else {
            debug!(
                "No MCP config file found. Searched: {:?}",
                search_paths
            );
        }

        // External servers get extended retry/timeout handling.
        for config in servers.values_mut() {
            let full = config.full_command().to_lowercase();
            if EXTERNAL_COMMAND_KEYWORDS.iter().any(|k| full.contains(k)) {
                config.external_server = true;
                info!("Configured {} as external server", config.name);
            }
        }

        Self {
            servers,
            config_path,
            search_paths,
        }
    }

    /// Discovery metadata for diagnostics.
    pub fn search_info(&self) -> serde_json::Value {
        serde_json::json!({
            "config_path": self.config_path.as_ref().map(|p| p.display().to_string()),
            "config_exists": self.config_path.as_ref().map(|p| p.exists()).unwrap_or(false),
            "search_paths": self.search_paths.iter().map(|p| p.display().to_string()).collect::<Vec<_>>(),
        })
    }
}

fn read_user_config(path: &Path) -> Result<UserConfig, String> {
    let content = std::fs::read_to_string(path).map_err(|e| e.to_string())?;
    serde_json::from_str(&content).map_err(|e| e.to_string())
}

/// Merge one user server entry over the built-in set, normalizing the
/// command shape.
fn merge_user_server(
    servers: &mut HashMap<String, McpServerConfig>,
    name: String,
    raw: RawServerConfig,
) {
    // Normalize: sequence command splits into head + prepended args.
    let (command, mut args) = match raw.command {
        Some(CommandSpec::Single(cmd)) => (Some(cmd), raw.args),
        Some(CommandSpec::Argv(argv)) => {
            if argv.is_empty() {
                error!("Server '{}' has an empty command array, skipping", name);
                return;
            }
            warn!(
                "Server '{}' has command as array, normalizing to command + args",
                name
            );
            let mut iter = argv.into_iter();
            let head = iter.next();
            let mut prepended: Vec<String> = iter.collect();
            prepended.extend(raw.args);
            (head, prepended)
        }
        None => (None, raw.args),
    };

    if let Some(existing) = servers.get(&name).filter(|s| s.builtin) {
        info!("User configuration for '{}' overrides built-in server", name);
        let mut merged = existing.clone();
        merged.enabled = raw.enabled;
        if !raw.env.is_empty() {
            merged.env.extend(raw.env);
        }
        if raw.description.is_some() {
            merged.description = raw.description;
        }
        // The built-in's absolute launch path must survive a user override
        // that points at a relative script.
        if let Some(cmd) = command {
            let script = args.last().cloned().unwrap_or_else(|| cmd.clone());
            if Path::new(&script).is_absolute() {
                merged.command = cmd;
                merged.args = std::mem::take(&mut args);
            } else {
                info!(
                    "Preserved absolute launch path for built-in server '{}'",
                    name
                );
            }
        }
        servers.insert(name, merged);
        return;
    }

    let Some(command) = command else {
        error!("No command specified for MCP server '{}', skipping", name);
        return;
    };

    info!("Loaded user-defined server: '{}'", name);
    servers.insert(
        name.clone(),
        McpServerConfig {
            name,
            command,
            args,
            env: raw.env,
            enabled: raw.enabled,
            builtin: false,
            external_server: false,
            description: raw.description,
        },
    );
}

/// Built-in server definitions: the `time` and `shell` servers shipped as
/// sibling binaries, referenced by absolute path.
pub fn builtin_server_definitions() -> HashMap<String, McpServerConfig> {
    let mut servers = HashMap::new();

    for (name, bin, description) in [
        ("time", "ziya-time-server", "Provides current time functionality"),
        ("shell", "ziya-shell-server", "Provides shell command execution"),
    ] {
        let command = locate_builtin_binary(bin)
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| bin.to_string());
        servers.insert(
            name.to_string(),
            McpServerConfig {
                name: name.to_string(),
                command,
                args: Vec::new(),
                env: HashMap::new(),
                enabled: true,
                builtin: true,
                external_server: false,
                description: Some(description.to_string()),
            },
        );
    }
    servers
}

/// Locate a built-in server binary, searching a fixed ordered list of
/// candidate roots: the running executable's directory, its parent (test
/// binaries live one level below the build output), and the current working
/// directory.
pub fn locate_builtin_binary(name: &str) -> Option<PathBuf> {
    let mut roots: Vec<PathBuf> = Vec::new();
    if let Ok(exe) = std::env::current_exe() {
        if let Some(dir) = exe.parent() {
            roots.push(dir.to_path_buf());
            if let Some(parent) = dir.parent() {
                roots.push(parent.to_path_buf());
            }
        }
    }
    if let Ok(cwd) = std::env::current_dir() {
        roots.push(cwd);
    }

    for root in roots {
        let candidate = root.join(name);
        if candidate.exists() {
            debug!("Found built-in server binary '{}' at {}", name, candidate.display());
            return Some(candidate);
        }
    }
    None
}

/// Search for the user config file: CWD, the install root, then
/// `~/.ziya/mcp_config.json`.
pub fn find_config_file() -> (Option<PathBuf>, Vec<PathBuf>) {
    let mut search_paths = Vec::new();

    if let Ok(cwd) = std::env::current_dir() {
        search_paths.push(cwd.join("mcp_config.json"));
    }
    if let Ok(exe) = std::env::current_exe() {
        if let Some(root) = exe.parent().and_then(Path::parent) {
            search_paths.push(root.join("mcp_config.json"));
        }
    }
    if let Some(home) = dirs::home_dir() {
        search_paths.push(home.join(".ziya").join("mcp_config.json"));
    }

    for path in &search_paths {
        if path.exists() {
            info!("Found MCP config file at: {}", path.display());
            return (Some(path.clone()), search_paths.clone());
        }
    }
    (None, search_paths)
}
