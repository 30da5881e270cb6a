use std::collections::BTreeMap;
use std::sync::Arc;

use skiff_core::tools::{Policy, Tool, ToolDefinition};

struct ToolEntry {
    tool: Arc<dyn Tool>,
    enabled: bool,
}

/// Registry of available tools: name → handler, default policy, enable flag.
pub struct ToolRegistry {
    tools: BTreeMap<String, ToolEntry>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self {
            tools: BTreeMap::new(),
        }
    }

    pub fn register(&mut self, tool: Arc<dyn Tool>) {
        let name = tool.name().to_string();
        self.tools.insert(
            name,
            ToolEntry {
                tool,
                enabled: true,
            },
        );
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).map(|e| Arc::clone(&e.tool))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    pub fn is_enabled(&self, name: &str) -> bool {
        self.tools.get(name).map(|e| e.enabled).unwrap_or(false)
    }

    pub fn set_enabled(&mut self, name: &str, enabled: bool) -> bool {
        match self.tools.get_mut(name) {
            Some(entry) => {
                entry.enabled = enabled;
                true
            }
            None => false,
        }
    }

    pub fn default_policy(&self, name: &str) -> Option<Policy> {
        self.tools.get(name).map(|e| e.tool.default_policy())
    }

    pub fn names(&self) -> Vec<String> {
        self.tools.keys().cloned().collect()
    }

    /// Definitions advertised to the model; disabled tools are not offered.
    pub fn definitions(&self) -> Vec<ToolDefinition> {
        self.tools
            .values()
            .filter(|e| e.enabled)
            .map(|e| e.tool.to_definition())
            .collect()
    }

    pub fn count(&self) -> usize {
        self.tools.len()
    }

    /// Restricted copy for a sub-agent: only the named tools, and never
    /// `spawn_subagent` (sub-agents cannot recurse).
    pub fn subset(&self, names: &[String]) -> Self {
        let mut sub = Self::new();
        for name in names {
            if name == "spawn_subagent" {
                continue;
            }
            if let Some(entry) = self.tools.get(name) {
                sub.tools.insert(
                    name.clone(),
                    ToolEntry {
                        tool: Arc::clone(&entry.tool),
                        enabled: entry.enabled,
                    },
                );
            }
        }
        sub
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}
