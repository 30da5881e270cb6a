use std::time::Duration;

use dashmap::DashMap;
use serde_json::Value;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use skiff_core::ids::{PermissionRequestId, SessionId, StepId, TurnId};
use skiff_core::tools::{PermissionMode, Policy};
use skiff_store::permissions::{PermissionRepo, PermissionRequestRow, RequestStatus, Scope};
use skiff_store::{Database, StoreError};

pub const DEFAULT_PERMISSION_TIMEOUT: Duration = Duration::from_secs(120);

/// Decision delivered to a blocked runner.
#[derive(Clone, Copy, Debug)]
pub struct PermissionDecision {
    pub approved: bool,
    pub scope: Scope,
}

/// How a permission wait ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WaitOutcome {
    Approved,
    Denied,
    Expired,
    Cancelled,
}

/// The permission gate: resolves effective policy and mediates `ask` flows
/// between a blocked runner and the resolution API.
///
/// Session-scoped approvals live in memory only (they die with the process,
/// like the runner state they belong to); `always` decisions are persisted
/// as tool policies.
pub struct PermissionGate {
    repo: PermissionRepo,
    session_overrides: DashMap<(String, String), Policy>,
    pending: DashMap<String, oneshot::Sender<PermissionDecision>>,
    timeout: Duration,
    default_policy: Option<Policy>,
}

impl PermissionGate {
    pub fn new(db: Database) -> Self {
        Self {
            repo: PermissionRepo::new(db),
            session_overrides: DashMap::new(),
            pending: DashMap::new(),
            timeout: DEFAULT_PERMISSION_TIMEOUT,
            default_policy: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Fallback applied when neither the store nor the session has an
    /// opinion, overriding each tool's built-in default.
    pub fn with_default_policy(mut self, policy: Option<Policy>) -> Self {
        self.default_policy = policy;
        self
    }

    pub fn repo(&self) -> &PermissionRepo {
        &self.repo
    }

    /// Resolution order: global mode, session-scoped override, persisted
    /// tool policy, configured fallback, the tool's own default.
    /// `spawn_subagent` is always allowed: it is compute-only orchestration;
    /// the child's tools are gated individually.
    pub fn effective_policy(
        &self,
        session_id: &SessionId,
        tool_name: &str,
        tool_default: Policy,
    ) -> Result<Policy, StoreError> {
        if self.repo.mode()? == PermissionMode::Allow {
            return Ok(Policy::Allow);
        }
        if tool_name == "spawn_subagent" {
            return Ok(Policy::Allow);
        }
        let key = (session_id.as_str().to_string(), tool_name.to_string());
        if let Some(p) = self.session_overrides.get(&key) {
            return Ok(*p);
        }
        if let Some(p) = self.repo.policy(tool_name)? {
            return Ok(p);
        }
        Ok(self.default_policy.unwrap_or(tool_default))
    }

    /// Open a pending request and register the waiter. The caller publishes
    /// the matching `permission_required` event (top-level runners emit a
    /// `tool_call` event, sub-agents a `subagent_block`).
    pub fn open_request(
        &self,
        session_id: &SessionId,
        turn_id: &TurnId,
        step_id: &StepId,
        tool_name: &str,
        input: &Value,
    ) -> Result<
        (
            PermissionRequestRow,
            oneshot::Receiver<PermissionDecision>,
        ),
        StoreError,
    > {
        let row = self
            .repo
            .create_request(session_id, turn_id, step_id, tool_name, input)?;
        let (tx, rx) = oneshot::channel();
        self.pending.insert(row.id.as_str().to_string(), tx);
        Ok((row, rx))
    }

    /// Block until the request resolves, times out, or the turn is
    /// cancelled. Timeout and cancellation both mark the stored request
    /// `expired`.
    pub async fn wait(
        &self,
        request_id: &PermissionRequestId,
        rx: oneshot::Receiver<PermissionDecision>,
        cancel: &CancellationToken,
    ) -> WaitOutcome {
        tokio::select! {
            decision = rx => match decision {
                Ok(d) if d.approved => WaitOutcome::Approved,
                Ok(_) => WaitOutcome::Denied,
                // Sender dropped without a decision: treat as expired.
                Err(_) => {
                    self.expire(request_id);
                    WaitOutcome::Expired
                }
            },
            _ = tokio::time::sleep(self.timeout) => {
                debug!(request_id = %request_id, "permission request timed out");
                self.expire(request_id);
                WaitOutcome::Expired
            }
            _ = cancel.cancelled() => {
                self.expire(request_id);
                WaitOutcome::Cancelled
            }
        }
    }

    fn expire(&self, request_id: &PermissionRequestId) {
        self.pending.remove(request_id.as_str());
        match self
            .repo
            .resolve_request(request_id, RequestStatus::Expired, Scope::Once)
        {
            Ok(()) | Err(StoreError::Conflict(_)) => {}
            Err(e) => warn!(request_id = %request_id, error = %e, "failed to expire permission request"),
        }
    }

    /// Resolve a pending request from the API. Applies scope:
    /// `once` affects only this call, `session` is remembered in memory for
    /// the session, `always` upserts the persisted tool policy.
    pub fn resolve(
        &self,
        request_id: &PermissionRequestId,
        approved: bool,
        scope: Scope,
    ) -> Result<(), StoreError> {
        let row = self.repo.get_request(request_id)?;
        let status = if approved {
            RequestStatus::Approved
        } else {
            RequestStatus::Denied
        };
        self.repo.resolve_request(request_id, status, scope)?;

        let policy = if approved { Policy::Allow } else { Policy::Deny };
        match scope {
            Scope::Once => {}
            Scope::Session => {
                self.session_overrides.insert(
                    (row.session_id.as_str().to_string(), row.tool_name.clone()),
                    policy,
                );
            }
            Scope::Always => self.repo.upsert_policy(&row.tool_name, policy)?,
        }

        if let Some((_, tx)) = self.pending.remove(request_id.as_str()) {
            let _ = tx.send(PermissionDecision { approved, scope });
        }
        Ok(())
    }

    /// Expire every pending request belonging to a turn (cancellation path)
    /// and wake their waiters with a denial.
    pub fn expire_for_turn(&self, turn_id: &TurnId) -> Result<(), StoreError> {
        for id in self.repo.expire_pending_for_turn(turn_id)? {
            if let Some((_, tx)) = self.pending.remove(id.as_str()) {
                let _ = tx.send(PermissionDecision {
                    approved: false,
                    scope: Scope::Once,
                });
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use skiff_store::sessions::SessionRepo;
    use skiff_store::turns::TurnRepo;
    use std::sync::Arc;

    fn setup() -> (PermissionGate, SessionId, TurnId, StepId) {
        let db = Database::in_memory().unwrap();
        let session = SessionRepo::new(db.clone()).create("t").unwrap();
        let turns = TurnRepo::new(db.clone());
        let turn = turns.create(&session.id, "hi").unwrap();
        let step = turns.create_step(&turn.id, 0).unwrap();
        (PermissionGate::new(db), session.id, turn.id, step.id)
    }

    #[test]
    fn mode_allow_bypasses_everything() {
        let (gate, sess, ..) = setup();
        gate.repo.upsert_policy("write_file", Policy::Deny).unwrap();
        gate.repo.set_mode(PermissionMode::Allow).unwrap();

        let policy = gate
            .effective_policy(&sess, "write_file", Policy::Ask)
            .unwrap();
        assert_eq!(policy, Policy::Allow);
    }

    #[test]
    fn stored_policy_beats_default() {
        let (gate, sess, ..) = setup();
        assert_eq!(
            gate.effective_policy(&sess, "write_file", Policy::Ask)
                .unwrap(),
            Policy::Ask
        );

        gate.repo.upsert_policy("write_file", Policy::Deny).unwrap();
        assert_eq!(
            gate.effective_policy(&sess, "write_file", Policy::Ask)
                .unwrap(),
            Policy::Deny
        );
    }

    #[test]
    fn spawn_subagent_always_allowed() {
        let (gate, sess, ..) = setup();
        gate.repo
            .upsert_policy("spawn_subagent", Policy::Deny)
            .unwrap();
        assert_eq!(
            gate.effective_policy(&sess, "spawn_subagent", Policy::Ask)
                .unwrap(),
            Policy::Allow
        );
    }

    #[test]
    fn configured_fallback_applies() {
        let (gate, sess, ..) = setup();
        let gate = gate.with_default_policy(Some(Policy::Allow));
        assert_eq!(
            gate.effective_policy(&sess, "read_file", Policy::Ask)
                .unwrap(),
            Policy::Allow
        );
    }

    #[tokio::test]
    async fn approve_once_unblocks_waiter() {
        let (gate, sess, turn, step) = setup();
        let gate = Arc::new(gate);

        let (row, rx) = gate
            .open_request(&sess, &turn, &step, "write_file", &json!({"path": "a"}))
            .unwrap();

        let resolver = Arc::clone(&gate);
        let req_id = row.id.clone();
        let resolve_task = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            resolver.resolve(&req_id, true, Scope::Once).unwrap();
        });

        let outcome = gate.wait(&row.id, rx, &CancellationToken::new()).await;
        assert_eq!(outcome, WaitOutcome::Approved);
        resolve_task.await.unwrap();

        // Once-scope leaves no residue.
        assert_eq!(
            gate.effective_policy(&sess, "write_file", Policy::Ask)
                .unwrap(),
            Policy::Ask
        );
    }

    #[tokio::test]
    async fn session_scope_remembered_in_memory() {
        let (gate, sess, turn, step) = setup();
        let (row, _rx) = gate
            .open_request(&sess, &turn, &step, "write_file", &json!({}))
            .unwrap();
        gate.resolve(&row.id, true, Scope::Session).unwrap();

        assert_eq!(
            gate.effective_policy(&sess, "write_file", Policy::Ask)
                .unwrap(),
            Policy::Allow
        );

        // Other sessions are unaffected.
        let other = SessionId::new();
        assert_eq!(
            gate.effective_policy(&other, "write_file", Policy::Ask)
                .unwrap(),
            Policy::Ask
        );
    }

    #[tokio::test]
    async fn always_scope_persists_policy() {
        let (gate, sess, turn, step) = setup();
        let (row, _rx) = gate
            .open_request(&sess, &turn, &step, "write_file", &json!({}))
            .unwrap();
        gate.resolve(&row.id, false, Scope::Always).unwrap();

        assert_eq!(gate.repo.policy("write_file").unwrap(), Some(Policy::Deny));
        assert_eq!(
            gate.effective_policy(&SessionId::new(), "write_file", Policy::Ask)
                .unwrap(),
            Policy::Deny
        );
    }

    #[tokio::test]
    async fn timeout_expires_request() {
        let (gate, sess, turn, step) = setup();
        let gate = gate.with_timeout(Duration::from_millis(30));
        let (row, rx) = gate
            .open_request(&sess, &turn, &step, "write_file", &json!({}))
            .unwrap();

        let outcome = gate.wait(&row.id, rx, &CancellationToken::new()).await;
        assert_eq!(outcome, WaitOutcome::Expired);
        assert_eq!(
            gate.repo.get_request(&row.id).unwrap().status,
            RequestStatus::Expired
        );

        // A late resolution is rejected.
        let err = gate.resolve(&row.id, true, Scope::Once).unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)));
    }

    #[tokio::test]
    async fn cancel_expires_request() {
        let (gate, sess, turn, step) = setup();
        let (row, rx) = gate
            .open_request(&sess, &turn, &step, "write_file", &json!({}))
            .unwrap();

        let cancel = CancellationToken::new();
        cancel.cancel();
        let outcome = gate.wait(&row.id, rx, &cancel).await;
        assert_eq!(outcome, WaitOutcome::Cancelled);
        assert_eq!(
            gate.repo.get_request(&row.id).unwrap().status,
            RequestStatus::Expired
        );
    }

    #[tokio::test]
    async fn expire_for_turn_wakes_waiters() {
        let (gate, sess, turn, step) = setup();
        let gate = Arc::new(gate);
        let (row, rx) = gate
            .open_request(&sess, &turn, &step, "write_file", &json!({}))
            .unwrap();

        let expirer = Arc::clone(&gate);
        let turn_clone = turn.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            expirer.expire_for_turn(&turn_clone).unwrap();
        });

        let outcome = gate.wait(&row.id, rx, &CancellationToken::new()).await;
        assert_eq!(outcome, WaitOutcome::Denied);
        assert_eq!(
            gate.repo.get_request(&row.id).unwrap().status,
            RequestStatus::Expired
        );
    }
}
