//! Builtin tools exposed through the registry: sandboxed file access, web
//! search/fetch, and sub-agent spawning.

pub mod fetch;
pub mod patch;
pub mod read;
pub mod search;
pub mod subagent;
pub mod write;

use std::sync::Arc;

use crate::registry::ToolRegistry;
use crate::sandbox::SandboxFs;

/// Register the standard tool set. The sub-agent tool is registered
/// separately because it needs a handle on the runner internals.
pub fn register_builtin(
    registry: &mut ToolRegistry,
    sandbox: Arc<SandboxFs>,
    search_api_key: Option<String>,
) {
    registry.register(Arc::new(read::ReadFileTool::new(Arc::clone(&sandbox))));
    registry.register(Arc::new(write::WriteFileTool::new(Arc::clone(&sandbox))));
    registry.register(Arc::new(patch::ApplyPatchTool::new(sandbox)));
    registry.register(Arc::new(fetch::HttpFetchTool::new()));
    registry.register(Arc::new(search::SearchTool::new(search_api_key)));
}
