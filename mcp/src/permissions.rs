//! Per-server and per-tool permission settings.
//!
//! File-backed at `~/.ziya/mcp_permissions.json`. Reads are lazy; writes are
//! atomic (write-then-rename) and fire an invalidation callback so dependent
//! caches rebuild with the new settings.
//!
//! Effective level for a tool: tool-level override, else server-level
//! override, else the default. That precedence is implemented once, here.

use std::{
    collections::HashMap,
    path::{Path, PathBuf},
};

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tracing::{error, info};

use crate::error::{McpError, McpResult};

pub type InvalidationCallback = Box<dyn Fn() + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum PermissionLevel {
    #[default]
    Enabled,
    Disabled,
    Ask,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PermissionDefaults {
    #[serde(default)]
    pub server: PermissionLevel,
    #[serde(default)]
    pub tool: PermissionLevel,
}

impl Default for PermissionDefaults {
    fn default() -> Self {
        Self {
            server: PermissionLevel::Enabled,
            tool: PermissionLevel::Enabled,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ToolPermission {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub permission: Option<PermissionLevel>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServerPermissions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub permission: Option<PermissionLevel>,
    #[serde(default)]
    pub tools: HashMap<String, ToolPermission>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Permissions {
    #[serde(default)]
    pub defaults: PermissionDefaults,
    #[serde(default)]
    pub servers: HashMap<String, ServerPermissions>,
}

impl Permissions {
    /// Effective level for a tool: tool override ?? server override ??
    /// default.
    pub fn effective_tool_permission(&self, server: &str, tool: &str) -> PermissionLevel {
        let server_perms = self.servers.get(server);
        server_perms
            .and_then(|s| s.tools.get(tool))
            .and_then(|t| t.permission)
            .or_else(|| server_perms.and_then(|s| s.permission))
            .unwrap_or(self.defaults.tool)
    }

    pub fn effective_server_permission(&self, server: &str) -> PermissionLevel {
        self.servers
            .get(server)
            .and_then(|s| s.permission)
            .unwrap_or(self.defaults.server)
    }
}

/// File-backed permission store.
pub struct PermissionsStore {
    path: PathBuf,
    permissions: RwLock<Permissions>,
    invalidation_callback: Mutex<Option<InvalidationCallback>>,
}

impl PermissionsStore {
    /// Store at the default location, `~/.ziya/mcp_permissions.json`.
    pub fn new() -> Self {
        let path = dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".ziya")
            .join("mcp_permissions.json");
        Self::with_path(path)
    }

    pub fn with_path(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let permissions = load_permissions(&path);
        Self {
            path,
            permissions: RwLock::new(permissions),
            invalidation_callback: Mutex::new(None),
        }
    }

    /// Register the callback fired after every write (cache invalidation).
    pub fn set_invalidation_callback<F>(&self, callback: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        *self.invalidation_callback.lock() = Some(Box::new(callback));
    }

    pub fn permissions(&self) -> Permissions {
        self.permissions.read().clone()
    }

    pub fn effective_tool_permission(&self, server: &str, tool: &str) -> PermissionLevel {
        self.permissions.read().effective_tool_permission(server, tool)
    }

    pub fn effective_server_permission(&self, server: &str) -> PermissionLevel {
        self.permissions.read().effective_server_permission(server)
    }

    /// Persist a full permission set atomically and notify dependents.
    pub fn save(&self, permissions: Permissions) -> McpResult<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| McpError::Internal(format!("create permissions dir: {}", e)))?;
        }
        let content = serde_json::to_string_pretty(&permissions)
            .map_err(|e| McpError::Internal(format!("serialize permissions: {}", e)))?;

        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, content)
            .map_err(|e| McpError::Internal(format!("write permissions: {}", e)))?;
        std::fs::rename(&tmp, &self.path)
            .map_err(|e| McpError::Internal(format!("rename permissions: {}", e)))?;

        *self.permissions.write() = permissions;
        if let Some(callback) = self.invalidation_callback.lock().as_ref() {
            callback();
        }
        info!("Saved MCP permissions to {}", self.path.display());
        Ok(())
    }

    pub fn update_server_permission(
        &self,
        server_name: &str,
        permission: PermissionLevel,
    ) -> McpResult<()> {
        let mut permissions = self.permissions();
        permissions
            .servers
            .entry(server_name.to_string())
            .or_default()
            .permission = Some(permission);
        self.save(permissions)
    }

    pub fn update_tool_permission(
        &self,
        server_name: &str,
        tool_name: &str,
        permission: PermissionLevel,
    ) -> McpResult<()> {
        let mut permissions = self.permissions();
        permissions
            .servers
            .entry(server_name.to_string())
            .or_default()
            .tools
            .insert(
                tool_name.to_string(),
                ToolPermission {
                    permission: Some(permission),
                },
            );
        self.save(permissions)
    }
}

impl Default for PermissionsStore {
    fn default() -> Self {
        Self::new()
    }
}

fn load_permissions(path: &Path) -> Permissions {
    if !path.exists() {
        return Permissions::default();
    }
    match std::fs::read_to_string(path) {
        Ok(content) => match serde_json::from_str(&content) {
            Ok(permissions) => permissions,
            Err(e) => {
                error!("Failed to load MCP permissions: {}", e);
                Permissions::default()
            }
        },
        Err(e) => {
            error!("Failed to load MCP permissions: {}", e);
            Permissions::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    };

    fn store() -> (PermissionsStore, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let store = PermissionsStore::with_path(dir.path().join("mcp_permissions.json"));
        (store, dir)
    }

    #[test]
    fn test_default_is_enabled() {
        let (store, _dir) = store();
        assert_eq!(
            store.effective_tool_permission("shell", "run_shell_command"),
            PermissionLevel::Enabled
        );
    }

    #[test]
    fn test_tool_override_beats_server() {
        let (store, _dir) = store();
        store
            .update_server_permission("shell", PermissionLevel::Disabled)
            .unwrap();
        store
            .update_tool_permission("shell", "run_shell_command", PermissionLevel::Enabled)
            .unwrap();
        assert_eq!(
            store.effective_tool_permission("shell", "run_shell_command"),
            PermissionLevel::Enabled
        );
        // A sibling tool with no override inherits the server level.
        assert_eq!(
            store.effective_tool_permission("shell", "other_tool"),
            PermissionLevel::Disabled
        );
    }

    #[test]
    fn test_persists_across_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mcp_permissions.json");
        {
            let store = PermissionsStore::with_path(&path);
            store
                .update_tool_permission("time", "get_current_time", PermissionLevel::Ask)
                .unwrap();
        }
        let reloaded = PermissionsStore::with_path(&path);
        assert_eq!(
            reloaded.effective_tool_permission("time", "get_current_time"),
            PermissionLevel::Ask
        );
    }

    #[test]
    fn test_write_fires_invalidation_callback() {
        let (store, _dir) = store();
        let fired = Arc::new(AtomicUsize::new(0));
        let fired_clone = Arc::clone(&fired);
        store.set_invalidation_callback(move || {
            fired_clone.fetch_add(1, Ordering::SeqCst);
        });
        store
            .update_server_permission("shell", PermissionLevel::Ask)
            .unwrap();
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_malformed_file_falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mcp_permissions.json");
        std::fs::write(&path, "{bad json").unwrap();
        let store = PermissionsStore::with_path(&path);
        assert_eq!(
            store.effective_server_permission("anything"),
            PermissionLevel::Enabled
        );
    }

    #[test]
    fn test_permission_file_shape() {
        let (store, _dir) = store();
        store
            .update_tool_permission("shell", "run_shell_command", PermissionLevel::Disabled)
            .unwrap();
        let content = std::fs::read_to_string(&store.path).unwrap();
        let value: serde_json::Value = serde_json::from_str(&content).unwrap();
        assert_eq!(
            value["servers"]["shell"]["tools"]["run_shell_command"]["permission"],
            "disabled"
        );
        assert_eq!(value["defaults"]["tool"], "enabled");
    }
}
