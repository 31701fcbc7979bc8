//! Dynamic in-process tools, loaded and unloaded by file extension.
//!
//! These tools run inside the gateway process rather than behind a
//! subprocess. When the set of user-attached files changes, tools registered
//! for the present extensions are activated (if their dependencies are met)
//! and tools for absent extensions are dropped. Any change invalidates the
//! manager's tools cache through the returned flag.

use std::{
    collections::{HashMap, HashSet},
    path::Path,
    sync::Arc,
};

use async_trait::async_trait;
use parking_lot::RwLock;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::{error::McpResult, protocol::ToolDescriptor};

/// An in-process tool that is not backed by a subprocess.
#[async_trait]
pub trait DynamicTool: Send + Sync {
    fn name(&self) -> &str;
    fn description(&self) -> &str;
    fn input_schema(&self) -> Value;

    /// Only tools whose dependencies are available appear in the tool list.
    fn dependencies_met(&self) -> bool {
        true
    }

    async fn execute(&self, arguments: Value) -> McpResult<String>;
}

type ToolFactory = Box<dyn Fn() -> Arc<dyn DynamicTool> + Send + Sync>;

/// Registry of extension-triggered in-process tools.
#[derive(Default)]
pub struct DynamicToolLoader {
    factories: RwLock<HashMap<String, Vec<ToolFactory>>>,
    active: RwLock<HashMap<String, Arc<dyn DynamicTool>>>,
    active_extensions: RwLock<HashSet<String>>,
    triggers: RwLock<HashMap<String, Vec<String>>>,
}

impl DynamicToolLoader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a tool factory for a file extension (e.g. `.pcap`).
    pub fn register_extension<F>(&self, extension: impl Into<String>, factory: F)
    where
        F: Fn() -> Arc<dyn DynamicTool> + Send + Sync + 'static,
    {
        let extension = extension.into().to_lowercase();
        self.factories
            .write()
            .entry(extension)
            .or_default()
            .push(Box::new(factory));
    }

    fn detect_extensions(paths: &[String]) -> HashSet<String> {
        paths
            .iter()
            .filter_map(|p| {
                Path::new(p)
                    .extension()
                    .and_then(|e| e.to_str())
                    .map(|e| format!(".{}", e.to_lowercase()))
            })
            .collect()
    }

    /// Reconcile the active tool set with the currently attached files.
    /// Returns `true` when anything was loaded or unloaded (the caller must
    /// then invalidate its tools cache).
    pub fn sync_with_files(&self, file_paths: &[String]) -> bool {
        let detected = Self::detect_extensions(file_paths);
        debug!("Detected file types: {:?}", detected);
        let mut changed = false;

        // Load tools for newly present extensions.
        let factories = self.factories.read();
        for extension in &detected {
            let Some(ext_factories) = factories.get(extension) else {
                continue;
            };
            for factory in ext_factories {
                let tool = factory();
                let name = tool.name().to_string();

                if !tool.dependencies_met() {
                    warn!("Dynamic tool {} skipped: dependencies not met", name);
                    continue;
                }

                let mut active = self.active.write();
                let mut triggers = self.triggers.write();
                if !active.contains_key(&name) {
                    info!("Loaded dynamic tool {} (for {} files)", name, extension);
                    active.insert(name.clone(), tool);
                    triggers.insert(name, vec![extension.clone()]);
                    changed = true;
                } else {
                    let tool_triggers = triggers.entry(name).or_default();
                    if !tool_triggers.contains(extension) {
                        tool_triggers.push(extension.clone());
                    }
                }
            }
            self.active_extensions.write().insert(extension.clone());
        }

        // Unload tools whose extensions are gone.
        let stale: Vec<String> = self
            .active_extensions
            .read()
            .difference(&detected)
            .cloned()
            .collect();
        for extension in stale {
            if let Some(ext_factories) = factories.get(&extension) {
                for factory in ext_factories {
                    let name = factory().name().to_string();
                    if self.active.write().remove(&name).is_some() {
                        info!("Unloaded dynamic tool {}", name);
                        self.triggers.write().remove(&name);
                        changed = true;
                    }
                }
            }
            self.active_extensions.write().remove(&extension);
        }

        changed
    }

    pub fn get_tool(&self, name: &str) -> Option<Arc<dyn DynamicTool>> {
        self.active.read().get(name).cloned()
    }

    pub fn active_tools(&self) -> Vec<Arc<dyn DynamicTool>> {
        self.active.read().values().cloned().collect()
    }

    /// Active tools as descriptors, annotated like server tools.
    pub fn tool_descriptors(&self) -> Vec<ToolDescriptor> {
        self.active
            .read()
            .values()
            .map(|tool| ToolDescriptor {
                name: tool.name().to_string(),
                description: tool.description().to_string(),
                input_schema: tool.input_schema(),
            })
            .collect()
    }

    pub fn tool_triggers(&self, name: &str) -> Vec<String> {
        self.triggers.read().get(name).cloned().unwrap_or_default()
    }

    pub fn clear(&self) {
        let count = self.active.read().len();
        self.active.write().clear();
        self.active_extensions.write().clear();
        self.triggers.write().clear();
        info!("Cleared {} dynamic tools", count);
    }
}
