use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use skiff_core::tools::{Policy, Tool, ToolContext, ToolError, ToolOutcome};

use crate::subagent::SubagentRunner;

/// Spawns a nested runner on a focused task. The tool itself is always
/// allowed (the child's tools are gated individually), and its result is the
/// child's final assistant text.
pub struct SpawnSubagentTool {
    runner: Arc<SubagentRunner>,
}

impl SpawnSubagentTool {
    pub fn new(runner: Arc<SubagentRunner>) -> Self {
        Self { runner }
    }
}

#[async_trait]
impl Tool for SpawnSubagentTool {
    fn name(&self) -> &str {
        "spawn_subagent"
    }

    fn description(&self) -> &str {
        "Spawn a subagent to work on a focused task. The subagent runs as a \
         nested execution tree and returns its final result."
    }

    fn parameters_schema(&self) -> Value {
        serde_json::json!({
            "type": "object",
            "required": ["task"],
            "properties": {
                "task": {
                    "type": "string",
                    "description": "Task for the subagent"
                },
                "label": {
                    "type": "string",
                    "description": "Optional short label for the UI"
                },
                "tools_allowlist": {
                    "type": "array",
                    "items": {"type": "string"},
                    "description": "Tool names the subagent may use (default: read_file, search, http_fetch)"
                }
            }
        })
    }

    fn default_policy(&self) -> Policy {
        Policy::Allow
    }

    fn timeout(&self) -> Option<Duration> {
        // A subagent runs its own multi-step loop; give it far more room
        // than a single ordinary tool call.
        Some(Duration::from_secs(600))
    }

    async fn execute(&self, args: Value, ctx: &ToolContext) -> Result<ToolOutcome, ToolError> {
        let task = args["task"]
            .as_str()
            .ok_or_else(|| ToolError::InvalidArguments("task is required".into()))?;
        let label = args["label"].as_str();
        let allowlist = args["tools_allowlist"].as_array().map(|items| {
            items
                .iter()
                .filter_map(|v| v.as_str())
                .map(str::to_string)
                .collect::<Vec<_>>()
        });

        let result = self.runner.run(ctx, task, label, allowlist).await?;
        Ok(ToolOutcome::text(result))
    }
}
