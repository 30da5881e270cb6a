use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::FutureExt;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument};

use skiff_core::events::{ErrorPayload, EventPayload};
use skiff_core::ids::{SessionId, TurnId};
use skiff_engine::runner::TurnRunner;
use skiff_store::sessions::{SessionRepo, SessionStatus};
use skiff_store::turns::TurnRepo;
use skiff_store::Database;

use crate::error::ApiError;

struct ActiveTurn {
    turn_id: TurnId,
    cancel: CancellationToken,
    join: tokio::task::JoinHandle<()>,
}

/// Schedules turn runners: at most one active turn per session, cancel on
/// demand, cancel-all on shutdown.
pub struct Orchestrator {
    runner: Arc<TurnRunner>,
    sessions: SessionRepo,
    turns: TurnRepo,
    running: DashMap<String, ActiveTurn>,
}

impl Orchestrator {
    pub fn new(runner: Arc<TurnRunner>, db: Database) -> Self {
        Self {
            runner,
            sessions: SessionRepo::new(db.clone()),
            turns: TurnRepo::new(db),
            running: DashMap::new(),
        }
    }

    /// Create the turn row and schedule the runner. Returns 409-mapped
    /// conflict when a turn is already active for the session.
    #[instrument(skip(self, content), fields(session_id = %session_id))]
    pub fn start_turn(
        self: &Arc<Self>,
        session_id: &SessionId,
        content: &str,
    ) -> Result<TurnId, ApiError> {
        self.sessions.get(session_id)?;

        let entry = self.running.entry(session_id.as_str().to_string());
        if let Entry::Occupied(ref occupied) = entry {
            if !occupied.get().join.is_finished() {
                return Err(ApiError::Conflict("session is busy".into()));
            }
        }

        let turn = self.turns.create(session_id, content)?;
        let cancel = CancellationToken::new();

        let runner = Arc::clone(&self.runner);
        let orchestrator = Arc::clone(self);
        let sid = session_id.clone();
        let tid = turn.id.clone();
        let task_cancel = cancel.clone();
        let content = content.to_string();

        let join = tokio::spawn(async move {
            let result = std::panic::AssertUnwindSafe(runner.run_turn(
                &sid,
                &tid,
                &content,
                task_cancel,
            ))
            .catch_unwind()
            .await;

            match result {
                Ok(Ok(outcome)) => {
                    info!(session_id = %sid, turn_id = %tid, ?outcome, "turn finished");
                }
                Ok(Err(e)) => {
                    error!(session_id = %sid, turn_id = %tid, error = %e, "turn failed");
                    orchestrator.report_runner_failure(&sid, &tid, &e.to_string());
                }
                Err(panic) => {
                    let message = panic
                        .downcast_ref::<String>()
                        .map(|s| s.as_str())
                        .or_else(|| panic.downcast_ref::<&str>().copied())
                        .unwrap_or("unknown panic");
                    error!(session_id = %sid, turn_id = %tid, panic = message, "runner panicked");
                    orchestrator.report_runner_failure(&sid, &tid, message);
                }
            }

            orchestrator.running.remove(sid.as_str());
        });

        let active = ActiveTurn {
            turn_id: turn.id.clone(),
            cancel,
            join,
        };
        match entry {
            Entry::Occupied(mut occupied) => {
                occupied.insert(active);
            }
            Entry::Vacant(vacant) => {
                vacant.insert(active);
            }
        }

        Ok(turn.id)
    }

    /// Runner-level failures become `error(code="runner")` events; the
    /// process stays up and the session returns to idle.
    fn report_runner_failure(&self, session_id: &SessionId, turn_id: &TurnId, message: &str) {
        let payload = EventPayload::Error(ErrorPayload {
            code: "runner".into(),
            message: message.to_string(),
        });
        if let Err(e) = self
            .runner
            .bus()
            .publish(session_id, Some(turn_id), None, &payload)
        {
            error!(error = %e, "failed to publish runner failure event");
        }
        if let Err(e) = self.sessions.set_status(session_id, SessionStatus::Idle) {
            error!(error = %e, "failed to reset session status");
        }
    }

    /// Cancel the session's active turn. Returns false when none is running.
    pub fn cancel(&self, session_id: &SessionId) -> bool {
        if let Some((_, active)) = self.running.remove(session_id.as_str()) {
            if !active.join.is_finished() {
                info!(session_id = %session_id, turn_id = %active.turn_id, "cancelling turn");
                active.cancel.cancel();
                return true;
            }
        }
        false
    }

    pub fn is_busy(&self, session_id: &SessionId) -> bool {
        self.running
            .get(session_id.as_str())
            .map(|a| !a.join.is_finished())
            .unwrap_or(false)
    }

    /// Cancel every active turn (shutdown path). Returns how many were
    /// signalled.
    pub fn abort_all(&self) -> usize {
        let mut cancelled = 0;
        for entry in self.running.iter() {
            if !entry.value().join.is_finished() {
                entry.value().cancel.cancel();
                cancelled += 1;
            }
        }
        self.running.clear();
        cancelled
    }
}
