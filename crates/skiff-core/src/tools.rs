use std::str::FromStr;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::ids::{SessionId, StepId, ToolCallId, TurnId};

/// Per-tool permission policy.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Policy {
    Deny,
    Ask,
    Allow,
}

impl Policy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Deny => "deny",
            Self::Ask => "ask",
            Self::Allow => "allow",
        }
    }
}

impl FromStr for Policy {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "deny" => Ok(Self::Deny),
            "ask" => Ok(Self::Ask),
            "allow" => Ok(Self::Allow),
            other => Err(format!("unknown policy: {other}")),
        }
    }
}

/// Global permission switch. `Allow` bypasses the gate for every tool.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PermissionMode {
    Ask,
    Allow,
}

impl PermissionMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ask => "ask",
            Self::Allow => "allow",
        }
    }
}

impl FromStr for PermissionMode {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ask" => Ok(Self::Ask),
            "allow" => Ok(Self::Allow),
            other => Err(format!("unknown permission mode: {other}")),
        }
    }
}

/// Tool definition advertised to the model.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

/// Execution context handed to a tool. The cancel token is a child of the
/// turn's token; handlers should abandon work when it fires.
#[derive(Clone, Debug)]
pub struct ToolContext {
    pub session_id: SessionId,
    pub turn_id: TurnId,
    pub step_id: StepId,
    pub tool_call_id: ToolCallId,
    pub cancel: CancellationToken,
}

/// A filesystem mutation performed by a tool. The runner persists the
/// pre-image as a file version and the diff as a file change before the
/// corresponding `diff` event is published.
#[derive(Clone, Debug)]
pub struct FileMutation {
    pub path: String,
    pub before: Option<String>,
    pub after: String,
    pub diff: String,
    pub note: String,
}

/// What a tool hands back to the runner.
#[derive(Clone, Debug, Default)]
pub struct ToolOutcome {
    pub output: String,
    pub mutations: Vec<FileMutation>,
}

impl ToolOutcome {
    pub fn text(output: impl Into<String>) -> Self {
        Self {
            output: output.into(),
            mutations: Vec::new(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ToolError {
    #[error("invalid arguments: {0}")]
    InvalidArguments(String),
    #[error("{0}")]
    Failed(String),
    #[error("cancelled")]
    Cancelled,
}

/// Trait implemented by each registered tool.
#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;
    fn description(&self) -> &str;
    fn parameters_schema(&self) -> Value;

    /// Policy applied when neither the store nor the session carries an
    /// override for this tool.
    fn default_policy(&self) -> Policy {
        Policy::Ask
    }

    /// Per-tool execution timeout override; None uses the runner default.
    fn timeout(&self) -> Option<std::time::Duration> {
        None
    }

    async fn execute(&self, args: Value, ctx: &ToolContext) -> Result<ToolOutcome, ToolError>;

    fn to_definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: self.name().to_string(),
            description: self.description().to_string(),
            parameters: self.parameters_schema(),
        }
    }
}
