use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};

use skiff_core::events::{DiffPayload, EventPayload};
use skiff_core::ids::{ContextItemId, FileVersionId, PermissionRequestId, SessionId, ToolCallId, TurnId};
use skiff_core::tools::{PermissionMode, Policy, Tool};
use skiff_store::permissions::Scope;

use crate::error::ApiError;
use crate::server::AppState;

type S = State<Arc<AppState>>;

// ── Health ──

pub async fn healthz(State(state): S) -> Result<Json<Value>, ApiError> {
    let latest = state.bus.latest_id()?;
    Ok(Json(json!({
        "status": "healthy",
        "latest_event_id": latest,
    })))
}

// ── Sessions ──

#[derive(Deserialize)]
pub struct SessionCreateBody {
    #[serde(default)]
    pub title: Option<String>,
}

pub async fn create_session(
    State(state): S,
    Json(body): Json<SessionCreateBody>,
) -> Result<impl IntoResponse, ApiError> {
    let title = body.title.as_deref().unwrap_or("New Session");
    let session = state.sessions.create(title)?;
    Ok((StatusCode::CREATED, Json(session)))
}

pub async fn list_sessions(State(state): S) -> Result<Json<Value>, ApiError> {
    let sessions = state.sessions.list()?;
    Ok(Json(json!({ "sessions": sessions })))
}

/// Session detail plus the conversation transcript for UI bootstrap.
pub async fn get_session(
    State(state): S,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let session_id = SessionId::from_raw(id);
    let session = state.sessions.get(&session_id)?;
    let turns = state.turns.list(&session_id, 500)?;
    let finals = state.bus.repo().final_texts(&session_id)?;

    let mut messages = Vec::new();
    for turn in &turns {
        messages.push(json!({
            "role": "user",
            "turn_id": turn.id,
            "text": turn.user_text,
            "ts": turn.created_at,
        }));
        if let Some(text) = finals.get(&turn.id) {
            messages.push(json!({
                "role": "assistant",
                "turn_id": turn.id,
                "text": text,
            }));
        }
    }

    let settings = state.sessions.settings(&session_id)?;
    Ok(Json(json!({
        "session": session,
        "settings": settings,
        "messages": messages,
    })))
}

#[derive(Deserialize)]
pub struct SessionPatchBody {
    pub title: String,
}

pub async fn patch_session(
    State(state): S,
    Path(id): Path<String>,
    Json(body): Json<SessionPatchBody>,
) -> Result<Json<Value>, ApiError> {
    let session_id = SessionId::from_raw(id);
    state.sessions.rename(&session_id, &body.title)?;
    Ok(Json(json!({"ok": true})))
}

pub async fn delete_session(
    State(state): S,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let session_id = SessionId::from_raw(id);
    state.orchestrator.cancel(&session_id);
    let deleted = state.sessions.delete(&session_id)?;
    if !deleted {
        return Err(ApiError::NotFound(format!("session {session_id}")));
    }
    Ok(Json(json!({"deleted": true})))
}

#[derive(Deserialize)]
pub struct SettingsBody {
    #[serde(default)]
    pub override_model: Option<String>,
}

pub async fn put_settings(
    State(state): S,
    Path(id): Path<String>,
    Json(body): Json<SettingsBody>,
) -> Result<Json<Value>, ApiError> {
    let session_id = SessionId::from_raw(id);
    state.sessions.get(&session_id)?;
    state
        .sessions
        .upsert_settings(&session_id, body.override_model.as_deref())?;
    Ok(Json(json!({"ok": true})))
}

pub async fn delete_settings(
    State(state): S,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let session_id = SessionId::from_raw(id);
    state.sessions.delete_settings(&session_id)?;
    Ok(Json(json!({"ok": true})))
}

// ── Turns ──

#[derive(Deserialize)]
pub struct TurnCreateBody {
    pub content: String,
}

/// Creates the turn row and schedules the runner; progress arrives over SSE.
pub async fn create_turn(
    State(state): S,
    Path(id): Path<String>,
    Json(body): Json<TurnCreateBody>,
) -> Result<impl IntoResponse, ApiError> {
    if body.content.trim().is_empty() {
        return Err(ApiError::BadRequest("content must not be empty".into()));
    }
    let session_id = SessionId::from_raw(id);
    let turn_id = state.orchestrator.start_turn(&session_id, &body.content)?;
    Ok((
        StatusCode::ACCEPTED,
        Json(json!({"accepted": true, "turn_id": turn_id})),
    ))
}

pub async fn cancel_turn(
    State(state): S,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let session_id = SessionId::from_raw(id);
    state.sessions.get(&session_id)?;
    let cancelled = state.orchestrator.cancel(&session_id);
    Ok(Json(json!({"cancelled": cancelled})))
}

pub async fn list_turns(
    State(state): S,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let session_id = SessionId::from_raw(id);
    state.sessions.get(&session_id)?;
    let turns = state.turns.list(&session_id, 500)?;
    Ok(Json(json!({ "turns": turns })))
}

pub async fn list_steps(
    State(state): S,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let turn_id = TurnId::from_raw(id);
    state.turns.get(&turn_id)?;
    let steps = state.turns.list_steps(&turn_id)?;
    Ok(Json(json!({ "steps": steps })))
}

// ── Event replay ──

#[derive(Deserialize)]
pub struct EventsQuery {
    pub since: Option<i64>,
    pub since_seq: Option<i64>,
    pub limit: Option<u32>,
}

pub async fn list_events(
    State(state): S,
    Path(id): Path<String>,
    Query(query): Query<EventsQuery>,
) -> Result<Json<Value>, ApiError> {
    let session_id = SessionId::from_raw(id);
    state.sessions.get(&session_id)?;
    let limit = query.limit.unwrap_or(2000);

    let events = match (query.since, query.since_seq) {
        (Some(_), _) | (None, None) => {
            state.bus.replay(Some(&session_id), query.since, limit)?
        }
        (None, Some(seq)) => state.bus.replay_since_seq(&session_id, seq, limit)?,
    };
    Ok(Json(json!({ "events": events })))
}

// ── Permissions ──

pub async fn pending_permissions(
    State(state): S,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let session_id = SessionId::from_raw(id);
    state.sessions.get(&session_id)?;
    let pending = state.gate.repo().list_pending(&session_id)?;
    Ok(Json(json!({ "pending": pending })))
}

#[derive(Deserialize)]
pub struct ResolveBody {
    pub status: String,
    #[serde(default)]
    pub scope: Option<String>,
}

pub async fn resolve_permission(
    State(state): S,
    Path(id): Path<String>,
    Json(body): Json<ResolveBody>,
) -> Result<Json<Value>, ApiError> {
    let approved = match body.status.as_str() {
        "approved" => true,
        "denied" => false,
        other => {
            return Err(ApiError::BadRequest(format!(
                "status must be approved or denied, got: {other}"
            )))
        }
    };
    let scope: Scope = body
        .scope
        .as_deref()
        .unwrap_or("once")
        .parse()
        .map_err(ApiError::BadRequest)?;

    let request_id = PermissionRequestId::from_raw(id);
    state.gate.resolve(&request_id, approved, scope)?;
    Ok(Json(json!({"ok": true})))
}

pub async fn get_permission_mode(State(state): S) -> Result<Json<Value>, ApiError> {
    let mode = state.gate.repo().mode()?;
    Ok(Json(json!({"mode": mode})))
}

#[derive(Deserialize)]
pub struct ModeBody {
    pub mode: String,
}

pub async fn put_permission_mode(
    State(state): S,
    Json(body): Json<ModeBody>,
) -> Result<Json<Value>, ApiError> {
    let mode: PermissionMode = body.mode.parse().map_err(ApiError::BadRequest)?;
    state.gate.repo().set_mode(mode)?;
    Ok(Json(json!({"ok": true, "mode": mode})))
}

// ── Tools ──

pub async fn list_tools(State(state): S) -> Result<Json<Value>, ApiError> {
    let stored = state.gate.repo().policies()?;
    let mut tools = Vec::new();
    for name in state.registry.names() {
        let Some(tool) = state.registry.get(&name) else {
            continue;
        };
        let policy = stored
            .get(&name)
            .copied()
            .unwrap_or_else(|| tool.default_policy());
        tools.push(json!({
            "name": name,
            "description": tool.description(),
            "policy": policy,
            "enabled": state.registry.is_enabled(&name),
        }));
    }
    Ok(Json(json!({ "tools": tools })))
}

#[derive(Deserialize)]
pub struct PolicyBody {
    pub policy: String,
}

pub async fn put_tool_policy(
    State(state): S,
    Path(name): Path<String>,
    Json(body): Json<PolicyBody>,
) -> Result<Json<Value>, ApiError> {
    if !state.registry.contains(&name) {
        return Err(ApiError::NotFound(format!("tool {name}")));
    }
    let policy: Policy = body.policy.parse().map_err(ApiError::BadRequest)?;
    state.gate.repo().upsert_policy(&name, policy)?;
    Ok(Json(json!({"ok": true, "tool": name, "policy": policy})))
}

// ── Filesystem ──

pub async fn fs_tree(State(state): S, Path(id): Path<String>) -> Result<Json<Value>, ApiError> {
    let session_id = SessionId::from_raw(id);
    state.sessions.get(&session_id)?;
    let listing = state
        .sandbox
        .list_tree()
        .await
        .map_err(ApiError::internal)?;
    Ok(Json(serde_json::to_value(listing).map_err(ApiError::internal)?))
}

#[derive(Deserialize)]
pub struct FsReadQuery {
    pub path: String,
    pub max_bytes: Option<usize>,
}

pub async fn fs_read(
    State(state): S,
    Path(id): Path<String>,
    Query(query): Query<FsReadQuery>,
) -> Result<Json<Value>, ApiError> {
    let session_id = SessionId::from_raw(id);
    state.sessions.get(&session_id)?;
    let out = state
        .sandbox
        .read_file(&query.path, query.max_bytes)
        .await
        .map_err(|e| match e {
            skiff_engine::sandbox::SandboxError::NotFound(p) => ApiError::NotFound(p),
            skiff_engine::sandbox::SandboxError::Outside(_)
            | skiff_engine::sandbox::SandboxError::Invalid(_) => ApiError::BadRequest(e.to_string()),
            other => ApiError::internal(other),
        })?;
    Ok(Json(serde_json::to_value(out).map_err(ApiError::internal)?))
}

#[derive(Deserialize)]
pub struct FsVersionsQuery {
    pub path: String,
}

pub async fn fs_versions(
    State(state): S,
    Path(id): Path<String>,
    Query(query): Query<FsVersionsQuery>,
) -> Result<Json<Value>, ApiError> {
    let session_id = SessionId::from_raw(id);
    state.sessions.get(&session_id)?;
    let versions = state.files.list_versions(&session_id, &query.path, 200)?;
    Ok(Json(json!({ "versions": versions })))
}

pub async fn fs_get_version(
    State(state): S,
    Path((id, version_id)): Path<(String, String)>,
) -> Result<Json<Value>, ApiError> {
    let session_id = SessionId::from_raw(id);
    let (version, content) = state
        .files
        .get_version(&FileVersionId::from_raw(version_id))?;
    if version.session_id != session_id {
        return Err(ApiError::NotFound(format!("file version {}", version.id)));
    }
    Ok(Json(json!({
        "version": version,
        "content": content,
    })))
}

#[derive(Deserialize)]
pub struct RollbackBody {
    pub path: String,
    pub version_id: String,
}

/// Restore a file to a stored version. The current content is snapshotted
/// first, so a rollback is itself rollback-able.
pub async fn fs_rollback(
    State(state): S,
    Path(id): Path<String>,
    Json(body): Json<RollbackBody>,
) -> Result<Json<Value>, ApiError> {
    let session_id = SessionId::from_raw(id);
    state.sessions.get(&session_id)?;

    let (version, content) = state
        .files
        .get_version(&FileVersionId::from_raw(body.version_id))?;
    if version.session_id != session_id || version.path != body.path {
        return Err(ApiError::NotFound(format!("file version {}", version.id)));
    }

    let mutation = state
        .sandbox
        .restore(&body.path, &content)
        .await
        .map_err(ApiError::internal)?;

    if let Some(before) = &mutation.before {
        state.files.add_version(
            &session_id,
            version.turn_id.as_ref(),
            version.step_id.as_ref(),
            &mutation.path,
            before,
            "rollback",
        )?;
    }
    if let (Some(turn_id), Some(step_id)) = (&version.turn_id, &version.step_id) {
        state
            .files
            .add_change(&session_id, turn_id, step_id, &mutation.path, &mutation.diff)?;
    }

    // Administrative diff event: no originating turn/step or tool call.
    let payload = EventPayload::Diff(DiffPayload {
        tool_call_id: ToolCallId::new(),
        path: mutation.path.clone(),
        diff: mutation.diff.clone(),
    });
    state
        .bus
        .publish(&session_id, None, None, &payload)
        .map_err(ApiError::internal)?;

    Ok(Json(json!({
        "ok": true,
        "path": mutation.path,
        "diff": mutation.diff,
    })))
}

pub async fn list_file_changes(
    State(state): S,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let session_id = SessionId::from_raw(id);
    state.sessions.get(&session_id)?;
    let changes = state.files.list_changes(&session_id, 200)?;
    Ok(Json(json!({ "file_changes": changes })))
}

// ── Context ──

pub async fn list_context(
    State(state): S,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let session_id = SessionId::from_raw(id);
    state.sessions.get(&session_id)?;
    let items = state.context.list(&session_id, 500)?;
    Ok(Json(json!({ "items": items })))
}

#[derive(Deserialize)]
pub struct ContextPinBody {
    pub context_id: String,
}

pub async fn pin_context(
    State(state): S,
    Path(id): Path<String>,
    Json(body): Json<ContextPinBody>,
) -> Result<Json<Value>, ApiError> {
    let session_id = SessionId::from_raw(id);
    state.sessions.get(&session_id)?;
    state
        .context
        .set_pinned(&ContextItemId::from_raw(body.context_id), true)?;
    Ok(Json(json!({"ok": true})))
}

pub async fn unpin_context(
    State(state): S,
    Path(id): Path<String>,
    Json(body): Json<ContextPinBody>,
) -> Result<Json<Value>, ApiError> {
    let session_id = SessionId::from_raw(id);
    state.sessions.get(&session_id)?;
    state
        .context
        .set_pinned(&ContextItemId::from_raw(body.context_id), false)?;
    Ok(Json(json!({"ok": true})))
}

#[derive(Deserialize)]
pub struct PinnedRefBody {
    pub kind: String,
    #[serde(default)]
    pub title: Option<String>,
    pub content_ref: String,
}

/// Pin an arbitrary reference (file path, URL) without it having appeared in
/// the session first.
pub async fn set_pinned_ref(
    State(state): S,
    Path(id): Path<String>,
    Json(body): Json<PinnedRefBody>,
) -> Result<Json<Value>, ApiError> {
    let session_id = SessionId::from_raw(id);
    state.sessions.get(&session_id)?;
    let title = body.title.as_deref().unwrap_or(&body.content_ref);
    let item = state
        .context
        .add(&session_id, &body.kind, title, &body.content_ref, true)?;
    Ok(Json(json!({"ok": true, "item": item})))
}

// ── Export ──

pub async fn export_json(
    State(state): S,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let session_id = SessionId::from_raw(id);
    let session = state.sessions.get(&session_id)?;
    let turns = state.turns.list(&session_id, 1000)?;

    let mut steps = Vec::new();
    for turn in &turns {
        steps.extend(state.turns.list_steps(&turn.id)?);
    }

    let events = state.bus.replay(Some(&session_id), None, 100_000)?;
    let file_changes = state.files.list_changes(&session_id, 1000)?;
    let permissions = state.gate.repo().list_for_session(&session_id, 1000)?;
    let context = state.context.list(&session_id, 1000)?;

    Ok(Json(json!({
        "session": session,
        "turns": turns,
        "steps": steps,
        "events": events,
        "file_changes": file_changes,
        "permission_requests": permissions,
        "context_items": context,
    })))
}

pub async fn export_markdown(
    State(state): S,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let session_id = SessionId::from_raw(id);
    let session = state.sessions.get(&session_id)?;
    let turns = state.turns.list(&session_id, 1000)?;
    let finals = state.bus.repo().final_texts(&session_id)?;

    let mut out = format!("# {}\n\n", session.title);
    for (i, turn) in turns.iter().enumerate() {
        out.push_str(&format!("## Turn {}\n\n**User:**\n\n{}\n\n", i + 1, turn.user_text));
        if let Some(text) = finals.get(&turn.id) {
            out.push_str(&format!("**Assistant:**\n\n{text}\n\n"));
        }
    }

    Ok((
        [(axum::http::header::CONTENT_TYPE, "text/markdown; charset=utf-8")],
        out,
    ))
}
