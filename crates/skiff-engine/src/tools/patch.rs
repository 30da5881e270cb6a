use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use skiff_core::tools::{Policy, Tool, ToolContext, ToolError, ToolOutcome};

use crate::sandbox::SandboxFs;

pub struct ApplyPatchTool {
    sandbox: Arc<SandboxFs>,
}

impl ApplyPatchTool {
    pub fn new(sandbox: Arc<SandboxFs>) -> Self {
        Self { sandbox }
    }
}

#[async_trait]
impl Tool for ApplyPatchTool {
    fn name(&self) -> &str {
        "apply_patch"
    }

    fn description(&self) -> &str {
        "Apply a unified diff to one or more workspace files. Supports file creation via /dev/null headers."
    }

    fn parameters_schema(&self) -> Value {
        serde_json::json!({
            "type": "object",
            "required": ["patch"],
            "properties": {
                "patch": {
                    "type": "string",
                    "description": "A unified diff (--- a/path, +++ b/path, @@ hunks)"
                }
            }
        })
    }

    fn default_policy(&self) -> Policy {
        Policy::Ask
    }

    async fn execute(&self, args: Value, _ctx: &ToolContext) -> Result<ToolOutcome, ToolError> {
        let patch = args["patch"]
            .as_str()
            .ok_or_else(|| ToolError::InvalidArguments("patch is required".into()))?;

        let mutations = self
            .sandbox
            .apply_patch(patch)
            .await
            .map_err(|e| ToolError::Failed(e.to_string()))?;

        let paths: Vec<&str> = mutations.iter().map(|m| m.path.as_str()).collect();
        let output = format!(
            "Applied patch to {} file(s): {}",
            mutations.len(),
            paths.join(", ")
        );
        Ok(ToolOutcome { output, mutations })
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
            "skiff_patch_tool_{}_{:?}",
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
    async fn applies_patch_and_reports_mutations() {
        let root = temp_root();
        std::fs::write(root.join("a.txt"), "old\n").unwrap();
        let tool = ApplyPatchTool::new(Arc::new(SandboxFs::new(&root).unwrap()));

        let patch = "--- a/a.txt\n+++ b/a.txt\n@@ -1,1 +1,1 @@\n-old\n+new\n";
        let out = tool
            .execute(serde_json::json!({"patch": patch}), &ctx())
            .await
            .unwrap();

        assert!(out.output.contains("1 file(s)"));
        assert_eq!(out.mutations.len(), 1);
        assert_eq!(std::fs::read_to_string(root.join("a.txt")).unwrap(), "new\n");

        std::fs::remove_dir_all(&root).ok();
    }

    #[tokio::test]
    async fn bad_patch_is_tool_error() {
        let root = temp_root();
        let tool = ApplyPatchTool::new(Arc::new(SandboxFs::new(&root).unwrap()));
        let err = tool
            .execute(serde_json::json!({"patch": "garbage"}), &ctx())
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::Failed(_)));
        std::fs::remove_dir_all(&root).ok();
    }
}
