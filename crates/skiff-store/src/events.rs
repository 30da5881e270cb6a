use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::Value;
use tracing::instrument;

use skiff_core::events::EventEnvelope;
use skiff_core::ids::{SessionId, StepId, TurnId};

use crate::database::Database;
use crate::error::StoreError;

/// Per-session append lock. Allocation of (id, seq) and the row insert happen
/// inside one critical section so seq values stay dense per session.
struct SessionLocks {
    locks: HashMap<String, Arc<Mutex<()>>>,
}

impl SessionLocks {
    fn new() -> Self {
        Self {
            locks: HashMap::new(),
        }
    }

    fn get(&mut self, session_id: &str) -> Arc<Mutex<()>> {
        self.locks
            .entry(session_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }
}

pub struct EventRepo {
    db: Database,
    session_locks: Mutex<SessionLocks>,
}

impl EventRepo {
    pub fn new(db: Database) -> Self {
        Self {
            db,
            session_locks: Mutex::new(SessionLocks::new()),
        }
    }

    /// Append an event: allocate the next global id (AUTOINCREMENT) and the
    /// next per-session seq in one immediate transaction, returning the
    /// stamped envelope. This is the only write path into the event log.
    #[instrument(skip(self, payload), fields(session_id = %session_id, kind))]
    pub fn append(
        &self,
        session_id: &SessionId,
        turn_id: Option<&TurnId>,
        step_id: Option<&StepId>,
        kind: &str,
        ts: f64,
        payload: Value,
    ) -> Result<EventEnvelope, StoreError> {
        let lock = self.session_locks.lock().get(session_id.as_str());
        let _guard = lock.lock();

        self.db.with_conn(|conn| {
            conn.execute_batch("BEGIN IMMEDIATE")?;

            let result = (|| -> Result<EventEnvelope, StoreError> {
                let seq: i64 = conn.query_row(
                    "SELECT COALESCE(MAX(seq), 0) + 1 FROM events WHERE session_id = ?1",
                    [session_id.as_str()],
                    |row| row.get(0),
                )?;

                conn.execute(
                    "INSERT INTO events (session_id, turn_id, step_id, seq, ts, type, payload_json)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                    rusqlite::params![
                        session_id.as_str(),
                        turn_id.map(|t| t.as_str()),
                        step_id.map(|s| s.as_str()),
                        seq,
                        ts,
                        kind,
                        serde_json::to_string(&payload)?,
                    ],
                )?;
                let id = conn.last_insert_rowid();

                Ok(EventEnvelope {
                    id,
                    seq,
                    ts,
                    event_type: kind.to_string(),
                    session_id: session_id.clone(),
                    turn_id: turn_id.cloned(),
                    step_id: step_id.cloned(),
                    payload,
                })
            })();

            match result {
                Ok(env) => {
                    conn.execute_batch("COMMIT")?;
                    Ok(env)
                }
                Err(e) => {
                    let _ = conn.execute_batch("ROLLBACK");
                    Err(e)
                }
            }
        })
    }

    /// Events with `id > since_id`, optionally filtered by session, in id
    /// order. This is the replay query behind SSE catch-up.
    pub fn list_since(
        &self,
        session_id: Option<&SessionId>,
        since_id: Option<i64>,
        limit: u32,
    ) -> Result<Vec<EventEnvelope>, StoreError> {
        self.db.with_conn(|conn| {
            let mut sql = String::from(
                "SELECT id, session_id, turn_id, step_id, seq, ts, type, payload_json FROM events",
            );
            let mut clauses = Vec::new();
            let mut params: Vec<Box<dyn rusqlite::types::ToSql>> = Vec::new();

            if let Some(sid) = session_id {
                clauses.push(format!("session_id = ?{}", params.len() + 1));
                params.push(Box::new(sid.as_str().to_string()));
            }
            if let Some(since) = since_id {
                clauses.push(format!("id > ?{}", params.len() + 1));
                params.push(Box::new(since));
            }
            if !clauses.is_empty() {
                sql.push_str(" WHERE ");
                sql.push_str(&clauses.join(" AND "));
            }
            sql.push_str(&format!(" ORDER BY id ASC LIMIT ?{}", params.len() + 1));
            params.push(Box::new(limit));

            let param_refs: Vec<&dyn rusqlite::types::ToSql> =
                params.iter().map(|p| p.as_ref()).collect();
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt
                .query_map(param_refs.as_slice(), row_to_envelope)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    /// Session events after a per-session seq (exclusive), in id order.
    pub fn list_since_seq(
        &self,
        session_id: &SessionId,
        since_seq: i64,
        limit: u32,
    ) -> Result<Vec<EventEnvelope>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, session_id, turn_id, step_id, seq, ts, type, payload_json
                 FROM events WHERE session_id = ?1 AND seq > ?2 ORDER BY id ASC LIMIT ?3",
            )?;
            let rows = stmt
                .query_map(
                    rusqlite::params![session_id.as_str(), since_seq, limit],
                    row_to_envelope,
                )?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    /// Highest assigned global id, 0 when the log is empty.
    pub fn latest_id(&self) -> Result<i64, StoreError> {
        self.db.with_conn(|conn| {
            conn.query_row("SELECT COALESCE(MAX(id), 0) FROM events", [], |row| {
                row.get(0)
            })
            .map_err(StoreError::from)
        })
    }

    /// Final assistant texts per turn, used to rebuild chat history.
    pub fn final_texts(
        &self,
        session_id: &SessionId,
    ) -> Result<HashMap<TurnId, String>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT turn_id, payload_json FROM events
                 WHERE session_id = ?1 AND type = 'final' AND turn_id IS NOT NULL
                 ORDER BY id ASC",
            )?;
            let mut out = HashMap::new();
            let rows = stmt.query_map([session_id.as_str()], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
            })?;
            for row in rows {
                let (turn_id, payload_json) = row?;
                let payload: Value = serde_json::from_str(&payload_json).unwrap_or(Value::Null);
                if let Some(text) = payload.get("text").and_then(|t| t.as_str()) {
                    out.insert(TurnId::from_raw(turn_id), text.to_string());
                }
            }
            Ok(out)
        })
    }

    pub fn count(&self, session_id: &SessionId) -> Result<i64, StoreError> {
        self.db.with_conn(|conn| {
            conn.query_row(
                "SELECT COUNT(*) FROM events WHERE session_id = ?1",
                [session_id.as_str()],
                |row| row.get(0),
            )
            .map_err(StoreError::from)
        })
    }
}

fn row_to_envelope(row: &rusqlite::Row<'_>) -> rusqlite::Result<EventEnvelope> {
    let payload_json: String = row.get(7)?;
    Ok(EventEnvelope {
        id: row.get(0)?,
        session_id: SessionId::from_raw(row.get::<_, String>(1)?),
        turn_id: row.get::<_, Option<String>>(2)?.map(TurnId::from_raw),
        step_id: row.get::<_, Option<String>>(3)?.map(StepId::from_raw),
        seq: row.get(4)?,
        ts: row.get(5)?,
        event_type: row.get(6)?,
        payload: serde_json::from_str(&payload_json).unwrap_or(Value::Null),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sessions::SessionRepo;
    use crate::turns::TurnRepo;
    use serde_json::json;

    fn setup() -> (Database, SessionId, TurnId, StepId) {
        let db = Database::in_memory().unwrap();
        let session = SessionRepo::new(db.clone()).create("t").unwrap();
        let turns = TurnRepo::new(db.clone());
        let turn = turns.create(&session.id, "hi").unwrap();
        let step = turns.create_step(&turn.id, 0).unwrap();
        (db, session.id, turn.id, step.id)
    }

    fn append(
        repo: &EventRepo,
        sess: &SessionId,
        turn: &TurnId,
        step: &StepId,
        kind: &str,
        payload: Value,
    ) -> EventEnvelope {
        repo.append(sess, Some(turn), Some(step), kind, 1000.0, payload)
            .unwrap()
    }

    #[test]
    fn append_assigns_id_and_seq() {
        let (db, sess, turn, step) = setup();
        let repo = EventRepo::new(db);

        let e1 = append(&repo, &sess, &turn, &step, "status", json!({"state": "started"}));
        let e2 = append(&repo, &sess, &turn, &step, "final", json!({"text": "hi"}));

        assert_eq!(e1.seq, 1);
        assert_eq!(e2.seq, 2);
        assert!(e2.id > e1.id);
    }

    #[test]
    fn seq_is_per_session() {
        let (db, sess_a, turn_a, step_a) = setup();
        let repo = EventRepo::new(db.clone());

        let session_b = SessionRepo::new(db.clone()).create("b").unwrap();
        let turns = TurnRepo::new(db);
        let turn_b = turns.create(&session_b.id, "x").unwrap();
        let step_b = turns.create_step(&turn_b.id, 0).unwrap();

        append(&repo, &sess_a, &turn_a, &step_a, "status", json!({}));
        let b1 = append(&repo, &session_b.id, &turn_b.id, &step_b.id, "status", json!({}));
        let a2 = append(&repo, &sess_a, &turn_a, &step_a, "final", json!({}));

        assert_eq!(b1.seq, 1);
        assert_eq!(a2.seq, 2);
    }

    #[test]
    fn list_since_filters_by_id_and_session() {
        let (db, sess, turn, step) = setup();
        let repo = EventRepo::new(db);

        let ids: Vec<i64> = (0..5)
            .map(|i| append(&repo, &sess, &turn, &step, "status", json!({"n": i})).id)
            .collect();

        let after = repo.list_since(Some(&sess), Some(ids[2]), 100).unwrap();
        assert_eq!(after.len(), 2);
        assert_eq!(after[0].id, ids[3]);
        assert_eq!(after[1].id, ids[4]);

        let all = repo.list_since(None, None, 100).unwrap();
        assert_eq!(all.len(), 5);
    }

    #[test]
    fn list_since_seq() {
        let (db, sess, turn, step) = setup();
        let repo = EventRepo::new(db);

        for i in 0..4 {
            append(&repo, &sess, &turn, &step, "status", json!({"n": i}));
        }

        let after = repo.list_since_seq(&sess, 2, 100).unwrap();
        assert_eq!(after.len(), 2);
        assert_eq!(after[0].seq, 3);
        assert_eq!(after[1].seq, 4);
    }

    #[test]
    fn latest_id_tracks_appends() {
        let (db, sess, turn, step) = setup();
        let repo = EventRepo::new(db);
        assert_eq!(repo.latest_id().unwrap(), 0);

        let e = append(&repo, &sess, &turn, &step, "status", json!({}));
        assert_eq!(repo.latest_id().unwrap(), e.id);
    }

    #[test]
    fn final_texts_maps_turns() {
        let (db, sess, turn, step) = setup();
        let repo = EventRepo::new(db);

        append(&repo, &sess, &turn, &step, "message_delta", json!({"delta": "h"}));
        append(&repo, &sess, &turn, &step, "final", json!({"text": "hello there"}));

        let finals = repo.final_texts(&sess).unwrap();
        assert_eq!(finals.get(&turn).map(String::as_str), Some("hello there"));
    }

    #[test]
    fn concurrent_appends_keep_seq_dense() {
        let (db, sess, turn, step) = setup();
        let repo = Arc::new(EventRepo::new(db));

        let mut handles = vec![];
        for i in 0..10 {
            let repo = repo.clone();
            let (sid, tid, pid) = (sess.clone(), turn.clone(), step.clone());
            handles.push(std::thread::spawn(move || {
                repo.append(&sid, Some(&tid), Some(&pid), "status", 0.0, json!({"thread": i}))
                    .unwrap()
            }));
        }

        let events: Vec<EventEnvelope> = handles.into_iter().map(|h| h.join().unwrap()).collect();

        let mut seqs: Vec<i64> = events.iter().map(|e| e.seq).collect();
        seqs.sort();
        assert_eq!(seqs, (1..=10).collect::<Vec<i64>>());

        // Global id order must match seq order for a single session.
        let all = repo.list_since(Some(&sess), None, 100).unwrap();
        for w in all.windows(2) {
            assert!(w[0].id < w[1].id);
            assert_eq!(w[0].seq + 1, w[1].seq);
        }
    }

    #[test]
    fn cascade_delete_removes_events() {
        let (db, sess, turn, step) = setup();
        let repo = EventRepo::new(db.clone());
        append(&repo, &sess, &turn, &step, "status", json!({}));
        assert_eq!(repo.count(&sess).unwrap(), 1);

        SessionRepo::new(db).delete(&sess).unwrap();
        assert_eq!(repo.count(&sess).unwrap(), 0);
    }
}
