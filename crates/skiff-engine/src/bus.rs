use tokio::sync::broadcast;
use tracing::instrument;

use skiff_core::events::{EventEnvelope, EventPayload};
use skiff_core::ids::{SessionId, StepId, TurnId};
use skiff_store::events::EventRepo;
use skiff_store::{Database, StoreError};

pub const DEFAULT_CHANNEL_CAPACITY: usize = 1024;

/// Event writer + hub. The only component that appends events: each publish
/// persists through [`EventRepo`] (which stamps `(id, seq)` inside the
/// per-session critical section) and only then fans out to live subscribers,
/// so anything a client sees live is always replayable.
///
/// Fan-out uses a broadcast channel with a bounded per-subscriber queue; a
/// subscriber that falls behind observes `Lagged` and must reconnect with
/// its last seen id. A slow subscriber never blocks the writer.
pub struct EventBus {
    repo: EventRepo,
    tx: broadcast::Sender<EventEnvelope>,
}

impl EventBus {
    pub fn new(db: Database, capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(16));
        Self {
            repo: EventRepo::new(db),
            tx,
        }
    }

    fn now_ts() -> f64 {
        chrono::Utc::now().timestamp_millis() as f64 / 1000.0
    }

    /// Persist then publish. Returns the stamped envelope.
    #[instrument(skip(self, payload), fields(session_id = %session_id, kind = payload.kind()))]
    pub fn publish(
        &self,
        session_id: &SessionId,
        turn_id: Option<&TurnId>,
        step_id: Option<&StepId>,
        payload: &EventPayload,
    ) -> Result<EventEnvelope, StoreError> {
        let value = payload.to_value()?;
        let envelope = self.repo.append(
            session_id,
            turn_id,
            step_id,
            payload.kind(),
            Self::now_ts(),
            value,
        )?;
        // No receivers is fine; the log is the source of truth.
        let _ = self.tx.send(envelope.clone());
        Ok(envelope)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EventEnvelope> {
        self.tx.subscribe()
    }

    /// Replay from the durable log: events with `id > since_id`, optionally
    /// filtered by session.
    pub fn replay(
        &self,
        session_id: Option<&SessionId>,
        since_id: Option<i64>,
        limit: u32,
    ) -> Result<Vec<EventEnvelope>, StoreError> {
        self.repo.list_since(session_id, since_id, limit)
    }

    pub fn replay_since_seq(
        &self,
        session_id: &SessionId,
        since_seq: i64,
        limit: u32,
    ) -> Result<Vec<EventEnvelope>, StoreError> {
        self.repo.list_since_seq(session_id, since_seq, limit)
    }

    pub fn latest_id(&self) -> Result<i64, StoreError> {
        self.repo.latest_id()
    }

    pub fn repo(&self) -> &EventRepo {
        &self.repo
    }
}
