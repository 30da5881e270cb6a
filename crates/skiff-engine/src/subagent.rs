use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::StreamExt;
use serde_json::json;
use tracing::{instrument, warn};

use skiff_core::events::{EventPayload, SubagentPayload, SubagentStatus};
use skiff_core::ids::SubagentId;
use skiff_core::messages::{ChatMessage, ToolCallRequest};
use skiff_core::provider::ModelStream;
use skiff_core::stream::{FinishReason, ModelEvent};
use skiff_core::tools::{Policy, Tool, ToolContext, ToolError, ToolOutcome};
use skiff_store::files::FileRepo;
use skiff_store::sessions::SessionRepo;
use skiff_store::Database;

use crate::bus::EventBus;
use crate::context::ContextBuilder;
use crate::gate::{PermissionGate, WaitOutcome};
use crate::registry::ToolRegistry;

const OUTPUT_PREVIEW_CHARS: usize = 2000;
const INNER_TOOL_TIMEOUT: Duration = Duration::from_secs(120);

#[derive(Clone, Debug)]
pub struct SubagentConfig {
    /// Maximum model iterations per sub-agent run.
    pub max_steps: u32,
    /// Tools granted when the caller passes no allowlist.
    pub default_tools: Vec<String>,
    pub model: String,
}

impl Default for SubagentConfig {
    fn default() -> Self {
        Self {
            max_steps: 12,
            default_tools: vec![
                "read_file".to_string(),
                "search".to_string(),
                "http_fetch".to_string(),
            ],
            model: "default".to_string(),
        }
    }
}

/// Runs a nested agent under a parent tool call. The child gets a fresh
/// message history, a restricted tool view, and shares the parent's
/// permission gate, so session-scoped approvals carry over and `always`
/// decisions remain global. All child activity is re-emitted as
/// `subagent` / `subagent_block` events tagged with the parent tool call.
pub struct SubagentRunner {
    provider: Arc<dyn ModelStream>,
    registry: Arc<ToolRegistry>,
    gate: Arc<PermissionGate>,
    bus: Arc<EventBus>,
    context: Arc<ContextBuilder>,
    sessions: SessionRepo,
    files: FileRepo,
    config: SubagentConfig,
}

impl SubagentRunner {
    pub fn new(
        provider: Arc<dyn ModelStream>,
        registry: Arc<ToolRegistry>,
        gate: Arc<PermissionGate>,
        bus: Arc<EventBus>,
        context: Arc<ContextBuilder>,
        db: Database,
        config: SubagentConfig,
    ) -> Self {
        Self {
            provider,
            registry,
            gate,
            bus,
            context,
            sessions: SessionRepo::new(db.clone()),
            files: FileRepo::new(db),
            config,
        }
    }

    #[instrument(skip(self, ctx, task, allowlist), fields(session_id = %ctx.session_id))]
    pub async fn run(
        &self,
        ctx: &ToolContext,
        task: &str,
        label: Option<&str>,
        allowlist: Option<Vec<String>>,
    ) -> Result<String, ToolError> {
        let subagent_id = SubagentId::new();
        let display_label = match label.map(str::trim).filter(|l| !l.is_empty()) {
            Some(l) => l.to_string(),
            None => {
                let t = task.trim();
                if t.chars().count() > 40 {
                    format!("{}...", t.chars().take(40).collect::<String>())
                } else {
                    t.to_string()
                }
            }
        };

        self.publish_status(
            ctx,
            &subagent_id,
            SubagentStatus::Start,
            &display_label,
            task,
            None,
            None,
        );

        let result = self
            .run_inner(ctx, &subagent_id, task, allowlist)
            .await;

        match &result {
            Ok(text) => self.publish_status(
                ctx,
                &subagent_id,
                SubagentStatus::End,
                &display_label,
                task,
                Some(text.clone()),
                None,
            ),
            Err(e) => {
                self.publish_block(
                    ctx,
                    &subagent_id,
                    json!({
                        "id": format!("error_{subagent_id}"),
                        "type": "error",
                        "text": e.to_string(),
                    }),
                );
                self.publish_status(
                    ctx,
                    &subagent_id,
                    SubagentStatus::Error,
                    &display_label,
                    task,
                    None,
                    Some(e.to_string()),
                );
            }
        }

        result
    }

    async fn run_inner(
        &self,
        ctx: &ToolContext,
        subagent_id: &SubagentId,
        task: &str,
        allowlist: Option<Vec<String>>,
    ) -> Result<String, ToolError> {
        let tool_names = allowlist.unwrap_or_else(|| self.config.default_tools.clone());
        let tools = self.registry.subset(&tool_names);
        let definitions = tools.definitions();

        let model = self
            .sessions
            .settings(&ctx.session_id)
            .ok()
            .flatten()
            .and_then(|s| s.override_model)
            .unwrap_or_else(|| self.config.model.clone());

        let system = self
            .context
            .system_prompt(&ctx.session_id)
            .await
            .map_err(|e| ToolError::Failed(e.to_string()))?;
        let system = format!(
            "{system}\n\n# Subagent\n\
             You are a subagent running inside a parent tool call.\n\
             Stay focused on the given task and return a clear final answer.\n\
             Available tools: {}.",
            tool_names.join(", ")
        );

        let mut messages = vec![ChatMessage::system(system), ChatMessage::user(task)];

        for _iteration in 0..self.config.max_steps {
            if ctx.cancel.is_cancelled() {
                return Err(ToolError::Cancelled);
            }

            let mut stream = self
                .provider
                .open(&messages, &definitions, &model)
                .await
                .map_err(|e| ToolError::Failed(e.to_string()))?;

            let mut text = String::new();
            let mut thinking = String::new();
            let mut tool_calls: Vec<ToolCallRequest> = Vec::new();
            let mut finish = FinishReason::Stop;

            loop {
                let event = tokio::select! {
                    ev = stream.next() => ev,
                    _ = ctx.cancel.cancelled() => return Err(ToolError::Cancelled),
                };
                let Some(event) = event else { break };
                match event {
                    ModelEvent::TextDelta { text: delta, .. } => text.push_str(&delta),
                    ModelEvent::ThinkingDelta { text: delta } => thinking.push_str(&delta),
                    ModelEvent::ThinkingEnd { .. } => {}
                    ModelEvent::ToolCall(call) => tool_calls.push(call),
                    ModelEvent::Stop { finish_reason, .. } => {
                        finish = finish_reason;
                        break;
                    }
                    ModelEvent::Error { message } => {
                        return Err(ToolError::Failed(message));
                    }
                }
            }

            if !thinking.is_empty() {
                self.publish_block(
                    ctx,
                    subagent_id,
                    json!({
                        "id": format!("thinking_{subagent_id}"),
                        "type": "thinking",
                        "text": thinking,
                    }),
                );
            }

            if finish == FinishReason::ToolUse && !tool_calls.is_empty() {
                messages.push(ChatMessage::assistant_with_tools(
                    text.clone(),
                    tool_calls.clone(),
                ));
                for call in &tool_calls {
                    let output = self.run_tool(ctx, subagent_id, &tools, call).await?;
                    messages.push(ChatMessage::tool_result(
                        call.id.clone(),
                        call.name.clone(),
                        output,
                    ));
                }
                continue;
            }

            let final_text = if text.trim().is_empty() {
                "(no response)".to_string()
            } else {
                text.trim().to_string()
            };
            self.publish_block(
                ctx,
                subagent_id,
                json!({
                    "id": format!("assistant_{subagent_id}"),
                    "type": "assistant",
                    "text": final_text,
                }),
            );
            return Ok(final_text);
        }

        Err(ToolError::Failed(format!(
            "subagent exceeded {} steps without a final answer",
            self.config.max_steps
        )))
    }

    /// Gate and execute one inner tool call, emitting block events. Returns
    /// the text fed back into the child's history (errors included, so the
    /// child model can react).
    async fn run_tool(
        &self,
        ctx: &ToolContext,
        subagent_id: &SubagentId,
        tools: &ToolRegistry,
        call: &ToolCallRequest,
    ) -> Result<String, ToolError> {
        let Some(tool) = tools.get(&call.name) else {
            let err = format!("unknown tool: {}", call.name);
            self.publish_tool_block(ctx, subagent_id, call, "error", None, Some(&err), 0);
            return Ok(format!("Error: {err}"));
        };
        if !tools.is_enabled(&call.name) {
            let err = format!("tool '{}' is disabled", call.name);
            self.publish_tool_block(ctx, subagent_id, call, "error", None, Some(&err), 0);
            return Ok(format!("Error: {err}"));
        }

        let policy = self
            .gate
            .effective_policy(&ctx.session_id, &call.name, tool.default_policy())
            .map_err(|e| ToolError::Failed(e.to_string()))?;

        match policy {
            Policy::Deny => {
                let err = format!("Permission denied for tool '{}'", call.name);
                self.publish_tool_block(ctx, subagent_id, call, "error", None, Some(&err), 0);
                return Ok(err);
            }
            Policy::Ask => {
                let (request, rx) = self
                    .gate
                    .open_request(
                        &ctx.session_id,
                        &ctx.turn_id,
                        &ctx.step_id,
                        &call.name,
                        &call.arguments,
                    )
                    .map_err(|e| ToolError::Failed(e.to_string()))?;
                self.publish_block(
                    ctx,
                    subagent_id,
                    json!({
                        "id": call.id.as_str(),
                        "type": "tool_call",
                        "tool_call_id": call.id.as_str(),
                        "tool_name": call.name,
                        "status": "permission_required",
                        "input": call.arguments,
                        "permission_request_id": request.id.as_str(),
                    }),
                );
                match self.gate.wait(&request.id, rx, &ctx.cancel).await {
                    WaitOutcome::Approved => {}
                    WaitOutcome::Cancelled => return Err(ToolError::Cancelled),
                    WaitOutcome::Denied | WaitOutcome::Expired => {
                        let err = format!("Permission denied for tool '{}'", call.name);
                        self.publish_tool_block(
                            ctx,
                            subagent_id,
                            call,
                            "error",
                            None,
                            Some(&err),
                            0,
                        );
                        return Ok(err);
                    }
                }
            }
            Policy::Allow => {}
        }

        self.publish_tool_block(ctx, subagent_id, call, "running", None, None, 0);

        let inner_ctx = ToolContext {
            session_id: ctx.session_id.clone(),
            turn_id: ctx.turn_id.clone(),
            step_id: ctx.step_id.clone(),
            tool_call_id: call.id.clone(),
            cancel: ctx.cancel.child_token(),
        };

        let start = Instant::now();
        let timeout = tool.timeout().unwrap_or(INNER_TOOL_TIMEOUT);
        let result = tokio::time::timeout(
            timeout,
            tool.execute(call.arguments.clone(), &inner_ctx),
        )
        .await;
        let duration_ms = start.elapsed().as_millis() as u64;

        let outcome: Result<ToolOutcome, String> = match result {
            Ok(Ok(outcome)) => Ok(outcome),
            Ok(Err(ToolError::Cancelled)) => return Err(ToolError::Cancelled),
            Ok(Err(e)) => Err(e.to_string()),
            Err(_) => Err(format!("timed out after {}s", timeout.as_secs())),
        };

        match outcome {
            Ok(outcome) => {
                self.publish_tool_block(
                    ctx,
                    subagent_id,
                    call,
                    "completed",
                    Some(&outcome.output),
                    None,
                    duration_ms,
                );
                for mutation in &outcome.mutations {
                    self.record_mutation(ctx, subagent_id, call, mutation);
                }
                Ok(outcome.output)
            }
            Err(message) => {
                self.publish_tool_block(
                    ctx,
                    subagent_id,
                    call,
                    "error",
                    None,
                    Some(&message),
                    duration_ms,
                );
                Ok(format!("Error: {message}"))
            }
        }
    }

    fn record_mutation(
        &self,
        ctx: &ToolContext,
        subagent_id: &SubagentId,
        call: &ToolCallRequest,
        mutation: &skiff_core::tools::FileMutation,
    ) {
        if let Some(before) = &mutation.before {
            if let Err(e) = self.files.add_version(
                &ctx.session_id,
                Some(&ctx.turn_id),
                Some(&ctx.step_id),
                &mutation.path,
                before,
                &mutation.note,
            ) {
                warn!(path = %mutation.path, error = %e, "failed to snapshot file version");
            }
        }
        if let Err(e) = self.files.add_change(
            &ctx.session_id,
            &ctx.turn_id,
            &ctx.step_id,
            &mutation.path,
            &mutation.diff,
        ) {
            warn!(path = %mutation.path, error = %e, "failed to record file change");
        }
        self.publish_block(
            ctx,
            subagent_id,
            json!({
                "id": format!("diff_{}_{}", call.id, mutation.path),
                "type": "diff",
                "tool_call_id": call.id.as_str(),
                "path": mutation.path,
                "diff": mutation.diff,
            }),
        );
    }

    #[allow(clippy::too_many_arguments)]
    fn publish_status(
        &self,
        ctx: &ToolContext,
        subagent_id: &SubagentId,
        status: SubagentStatus,
        label: &str,
        task: &str,
        result: Option<String>,
        error: Option<String>,
    ) {
        let payload = EventPayload::Subagent(SubagentPayload {
            parent_tool_call_id: ctx.tool_call_id.clone(),
            subagent_id: subagent_id.clone(),
            status,
            label: label.to_string(),
            task: task.to_string(),
            result,
            error,
        });
        if let Err(e) = self.bus.publish(
            &ctx.session_id,
            Some(&ctx.turn_id),
            Some(&ctx.step_id),
            &payload,
        ) {
            warn!(error = %e, "failed to publish subagent event");
        }
    }

    fn publish_block(&self, ctx: &ToolContext, subagent_id: &SubagentId, block: serde_json::Value) {
        let payload = EventPayload::SubagentBlock(skiff_core::events::SubagentBlockPayload {
            parent_tool_call_id: ctx.tool_call_id.clone(),
            subagent_id: subagent_id.clone(),
            block,
        });
        if let Err(e) = self.bus.publish(
            &ctx.session_id,
            Some(&ctx.turn_id),
            Some(&ctx.step_id),
            &payload,
        ) {
            warn!(error = %e, "failed to publish subagent block");
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn publish_tool_block(
        &self,
        ctx: &ToolContext,
        subagent_id: &SubagentId,
        call: &ToolCallRequest,
        status: &str,
        output: Option<&str>,
        error: Option<&str>,
        duration_ms: u64,
    ) {
        self.publish_block(
            ctx,
            subagent_id,
            json!({
                "id": call.id.as_str(),
                "type": "tool_call",
                "tool_call_id": call.id.as_str(),
                "tool_name": call.name,
                "status": status,
                "input": call.arguments,
                "output": output.map(|o| preview(o)),
                "error": error.map(|e| preview(e)),
                "duration_ms": duration_ms,
            }),
        );
    }
}

fn preview(text: &str) -> String {
    if text.len() > OUTPUT_PREVIEW_CHARS {
        let cut: String = text.chars().take(OUTPUT_PREVIEW_CHARS).collect();
        format!("{cut}...")
    } else {
        text.to_string()
    }
}
