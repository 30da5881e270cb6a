use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use skiff_core::tools::{Policy, Tool, ToolContext, ToolError, ToolOutcome};

use crate::sandbox::SandboxFs;

pub struct WriteFileTool {
    sandbox: Arc<SandboxFs>,
}

impl WriteFileTool {
    pub fn new(sandbox: Arc<SandboxFs>) -> Self {
        Self { sandbox }
    }
}

#[async_trait]
impl Tool for WriteFileTool {
    fn name(&self) -> &str {
        "write_file"
    }

    fn description(&self) -> &str {
        "Write content to a file inside the workspace. Creates parent directories if needed."
    }

    fn parameters_schema(&self) -> Value {
        serde_json::json!({
            "type": "object",
            "required": ["path", "content"],
            "properties": {
                "path": {
                    "type": "string",
                    "description": "Workspace-relative path of the file to write"
                },
                "content": {
                    "type": "string",
                    "description": "The full new content of the file"
                }
            }
        })
    }

    fn default_policy(&self) -> Policy {
        Policy::Ask
    }

    async fn execute(&self, args: Value, _ctx: &ToolContext) -> Result<ToolOutcome, ToolError> {
        let path = args["path"]
            .as_str()
            .ok_or_else(|| ToolError::InvalidArguments("path is required".into()))?;
        let content = args["content"]
            .as_str()
            .ok_or_else(|| ToolError::InvalidArguments("content is required".into()))?;

        let mutation = self
            .sandbox
            .write_file(path, content)
            .await
            .map_err(|e| ToolError::Failed(e.to_string()))?;

        let output = format!(
            "Wrote {} bytes ({} lines) to {}",
            content.len(),
            content.lines().count(),
            mutation.path
        );
        Ok(ToolOutcome {
            output,
            mutations: vec![mutation],
        })
    }
}
