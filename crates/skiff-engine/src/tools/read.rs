use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use skiff_core::tools::{Policy, Tool, ToolContext, ToolError, ToolOutcome};

use crate::sandbox::SandboxFs;

const DEFAULT_MAX_BYTES: usize = 256 * 1024;

pub struct ReadFileTool {
    sandbox: Arc<SandboxFs>,
}

impl ReadFileTool {
    pub fn new(sandbox: Arc<SandboxFs>) -> Self {
        Self { sandbox }
    }
}

#[async_trait]
impl Tool for ReadFileTool {
    fn name(&self) -> &str {
        "read_file"
    }

    fn description(&self) -> &str {
        "Read the contents of a file inside the workspace."
    }

    fn parameters_schema(&self) -> Value {
        serde_json::json!({
            "type": "object",
            "required": ["path"],
            "properties": {
                "path": {
                    "type": "string",
                    "description": "Workspace-relative path of the file to read"
                },
                "max_bytes": {
                    "type": "integer",
                    "description": "Maximum number of bytes to return"
                }
            }
        })
    }

    fn default_policy(&self) -> Policy {
        Policy::Allow
    }

    async fn execute(&self, args: Value, _ctx: &ToolContext) -> Result<ToolOutcome, ToolError> {
        let path = args["path"]
            .as_str()
            .ok_or_else(|| ToolError::InvalidArguments("path is required".into()))?;
        let max_bytes = args["max_bytes"]
            .as_u64()
            .map(|n| n as usize)
            .unwrap_or(DEFAULT_MAX_BYTES);

        let out = self
            .sandbox
            .read_file(path, Some(max_bytes))
            .await
            .map_err(|e| ToolError::Failed(e.to_string()))?;

        let mut output = out.content;
        if out.truncated {
            output.push_str(&format!("\n\n...(truncated, {} bytes total)...", out.size));
        }
        Ok(ToolOutcome::text(output))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use skiff_core::ids::{SessionId, StepId, ToolCallId, TurnId};
    use std::path::PathBuf;
    use tokio_util::sync::CancellationToken;

    fn temp_root() -> PathBuf {
        let dir = std::env::temp_dir().join(format!(
            "skiff_read_tool_{}_{:?}",
            std::process::id(),
            std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .unwrap()
                .as_nanos()
        ));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn ctx() -> ToolContext {
        ToolContext {
            session_id: SessionId::new(),
            turn_id: TurnId::new(),
            step_id: StepId::new(),
            tool_call_id: ToolCallId::new(),
            cancel: CancellationToken::new(),
        }
    }

    #[tokio::test]
    async fn reads_file_contents() {
        let root = temp_root();
        std::fs::write(root.join("f.txt"), "line 1\nline 2\n").unwrap();
        let tool = ReadFileTool::new(Arc::new(SandboxFs::new(&root).unwrap()));

        let out = tool
            .execute(serde_json::json!({"path": "f.txt"}), &ctx())
            .await
            .unwrap();
        assert!(out.output.contains("line 1"));
        assert!(out.mutations.is_empty());

        std::fs::remove_dir_all(&root).ok();
    }

    #[tokio::test]
    async fn missing_path_argument() {
        let root = temp_root();
        let tool = ReadFileTool::new(Arc::new(SandboxFs::new(&root).unwrap()));
        let err = tool.execute(serde_json::json!({}), &ctx()).await.unwrap_err();
        assert!(matches!(err, ToolError::InvalidArguments(_)));
        std::fs::remove_dir_all(&root).ok();
    }

    #[tokio::test]
    async fn escape_attempt_fails() {
        let root = temp_root();
        let tool = ReadFileTool::new(Arc::new(SandboxFs::new(&root).unwrap()));
        let err = tool
            .execute(serde_json::json!({"path": "/etc/passwd"}), &ctx())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("outside"));
        std::fs::remove_dir_all(&root).ok();
    }

    #[tokio::test]
    async fn truncation_noted_in_output() {
        let root = temp_root();
        std::fs::write(root.join("big.txt"), "x".repeat(64)).unwrap();
        let tool = ReadFileTool::new(Arc::new(SandboxFs::new(&root).unwrap()));

        let out = tool
            .execute(serde_json::json!({"path": "big.txt", "max_bytes": 16}), &ctx())
            .await
            .unwrap();
        assert!(out.output.contains("truncated"));
        std::fs::remove_dir_all(&root).ok();
    }
}
