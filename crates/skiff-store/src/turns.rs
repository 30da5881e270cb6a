use chrono::Utc;
use serde::{Deserialize, Serialize};

use skiff_core::ids::{SessionId, StepId, TurnId};

use crate::database::Database;
use crate::error::StoreError;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TurnRow {
    pub id: TurnId,
    pub session_id: SessionId,
    pub user_text: String,
    pub created_at: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Running,
    Done,
    Cancelled,
    Error,
}

impl StepStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Done => "done",
            Self::Cancelled => "cancelled",
            Self::Error => "error",
        }
    }

    fn parse(s: &str) -> Self {
        match s {
            "done" => Self::Done,
            "cancelled" => Self::Cancelled,
            "error" => Self::Error,
            _ => Self::Running,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StepRow {
    pub id: StepId,
    pub turn_id: TurnId,
    pub idx: i64,
    pub status: StepStatus,
    pub started_at: String,
    pub finished_at: Option<String>,
}

pub struct TurnRepo {
    db: Database,
}

impl TurnRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub fn create(&self, session_id: &SessionId, user_text: &str) -> Result<TurnRow, StoreError> {
        let id = TurnId::new();
        let now = Utc::now().to_rfc3339();
        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO turns (id, session_id, user_text, created_at) VALUES (?1, ?2, ?3, ?4)",
                rusqlite::params![id.as_str(), session_id.as_str(), user_text, now],
            )?;
            Ok(TurnRow {
                id: id.clone(),
                session_id: session_id.clone(),
                user_text: user_text.to_string(),
                created_at: now.clone(),
            })
        })
    }

    pub fn get(&self, id: &TurnId) -> Result<TurnRow, StoreError> {
        self.db.with_conn(|conn| {
            conn.query_row(
                "SELECT id, session_id, user_text, created_at FROM turns WHERE id = ?1",
                [id.as_str()],
                row_to_turn,
            )
            .map_err(|_| StoreError::NotFound(format!("turn {id}")))
        })
    }

    /// List turns oldest-first so history can be replayed in order.
    pub fn list(&self, session_id: &SessionId, limit: u32) -> Result<Vec<TurnRow>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, session_id, user_text, created_at FROM turns
                 WHERE session_id = ?1 ORDER BY created_at ASC, id ASC LIMIT ?2",
            )?;
            let rows = stmt
                .query_map(rusqlite::params![session_id.as_str(), limit], row_to_turn)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    pub fn create_step(&self, turn_id: &TurnId, idx: i64) -> Result<StepRow, StoreError> {
        let id = StepId::new();
        let now = Utc::now().to_rfc3339();
        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO steps (id, turn_id, idx, status, started_at)
                 VALUES (?1, ?2, ?3, 'running', ?4)",
                rusqlite::params![id.as_str(), turn_id.as_str(), idx, now],
            )?;
            Ok(StepRow {
                id: id.clone(),
                turn_id: turn_id.clone(),
                idx,
                status: StepStatus::Running,
                started_at: now.clone(),
                finished_at: None,
            })
        })
    }

    pub fn finish_step(&self, step_id: &StepId, status: StepStatus) -> Result<(), StoreError> {
        let now = Utc::now().to_rfc3339();
        self.db.with_conn(|conn| {
            conn.execute(
                "UPDATE steps SET status = ?1, finished_at = ?2 WHERE id = ?3",
                rusqlite::params![status.as_str(), now, step_id.as_str()],
            )?;
            Ok(())
        })
    }

    pub fn list_steps(&self, turn_id: &TurnId) -> Result<Vec<StepRow>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, turn_id, idx, status, started_at, finished_at
                 FROM steps WHERE turn_id = ?1 ORDER BY idx ASC",
            )?;
            let rows = stmt
                .query_map([turn_id.as_str()], row_to_step)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }
}

fn row_to_turn(row: &rusqlite::Row<'_>) -> rusqlite::Result<TurnRow> {
    Ok(TurnRow {
        id: TurnId::from_raw(row.get::<_, String>(0)?),
        session_id: SessionId::from_raw(row.get::<_, String>(1)?),
        user_text: row.get(2)?,
        created_at: row.get(3)?,
    })
}

fn row_to_step(row: &rusqlite::Row<'_>) -> rusqlite::Result<StepRow> {
    Ok(StepRow {
        id: StepId::from_raw(row.get::<_, String>(0)?),
        turn_id: TurnId::from_raw(row.get::<_, String>(1)?),
        idx: row.get(2)?,
        status: StepStatus::parse(&row.get::<_, String>(3)?),
        started_at: row.get(4)?,
        finished_at: row.get(5)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sessions::SessionRepo;

    fn setup() -> (Database, SessionId) {
        let db = Database::in_memory().unwrap();
        let session = SessionRepo::new(db.clone()).create("t").unwrap();
        (db, session.id)
    }

    #[test]
    fn create_and_list_turns() {
        let (db, sess) = setup();
        let repo = TurnRepo::new(db);

        let t1 = repo.create(&sess, "first").unwrap();
        let t2 = repo.create(&sess, "second").unwrap();

        let turns = repo.list(&sess, 50).unwrap();
        assert_eq!(turns.len(), 2);
        assert_eq!(turns[0].id, t1.id);
        assert_eq!(turns[1].id, t2.id);
        assert_eq!(turns[1].user_text, "second");
    }

    #[test]
    fn step_lifecycle() {
        let (db, sess) = setup();
        let repo = TurnRepo::new(db);
        let turn = repo.create(&sess, "hi").unwrap();

        let s0 = repo.create_step(&turn.id, 0).unwrap();
        assert_eq!(s0.status, StepStatus::Running);
        assert!(s0.finished_at.is_none());

        repo.finish_step(&s0.id, StepStatus::Done).unwrap();
        let s1 = repo.create_step(&turn.id, 1).unwrap();
        repo.finish_step(&s1.id, StepStatus::Cancelled).unwrap();

        let steps = repo.list_steps(&turn.id).unwrap();
        assert_eq!(steps.len(), 2);
        assert_eq!(steps[0].status, StepStatus::Done);
        assert!(steps[0].finished_at.is_some());
        assert_eq!(steps[1].status, StepStatus::Cancelled);
    }

    #[test]
    fn turn_not_found() {
        let (db, _) = setup();
        let repo = TurnRepo::new(db);
        let err = repo.get(&TurnId::from_raw("turn_missing")).unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));
    }
}
