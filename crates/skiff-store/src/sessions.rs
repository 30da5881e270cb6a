use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::instrument;

use skiff_core::ids::SessionId;

use crate::database::Database;
use crate::error::StoreError;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Idle,
    Running,
    Error,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Running => "running",
            Self::Error => "error",
        }
    }

    fn parse(s: &str) -> Self {
        match s {
            "running" => Self::Running,
            "error" => Self::Error,
            _ => Self::Idle,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SessionRow {
    pub id: SessionId,
    pub title: String,
    pub status: SessionStatus,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SessionSettings {
    pub session_id: SessionId,
    pub override_model: Option<String>,
}

pub struct SessionRepo {
    db: Database,
}

impl SessionRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    #[instrument(skip(self))]
    pub fn create(&self, title: &str) -> Result<SessionRow, StoreError> {
        let id = SessionId::new();
        let now = Utc::now().to_rfc3339();
        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO sessions (id, title, status, created_at, updated_at)
                 VALUES (?1, ?2, 'idle', ?3, ?3)",
                rusqlite::params![id.as_str(), title, now],
            )?;
            Ok(SessionRow {
                id: id.clone(),
                title: title.to_string(),
                status: SessionStatus::Idle,
                created_at: now.clone(),
                updated_at: now.clone(),
            })
        })
    }

    pub fn get(&self, id: &SessionId) -> Result<SessionRow, StoreError> {
        self.db.with_conn(|conn| {
            conn.query_row(
                "SELECT id, title, status, created_at, updated_at FROM sessions WHERE id = ?1",
                [id.as_str()],
                row_to_session,
            )
            .map_err(|_| StoreError::NotFound(format!("session {id}")))
        })
    }

    pub fn exists(&self, id: &SessionId) -> Result<bool, StoreError> {
        self.db.with_conn(|conn| {
            let found: Option<i64> = conn
                .query_row(
                    "SELECT 1 FROM sessions WHERE id = ?1",
                    [id.as_str()],
                    |row| row.get(0),
                )
                .ok();
            Ok(found.is_some())
        })
    }

    /// List sessions, most recently updated first.
    pub fn list(&self) -> Result<Vec<SessionRow>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, title, status, created_at, updated_at
                 FROM sessions ORDER BY updated_at DESC",
            )?;
            let rows = stmt
                .query_map([], row_to_session)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    pub fn rename(&self, id: &SessionId, title: &str) -> Result<(), StoreError> {
        let now = Utc::now().to_rfc3339();
        self.db.with_conn(|conn| {
            let n = conn.execute(
                "UPDATE sessions SET title = ?1, updated_at = ?2 WHERE id = ?3",
                rusqlite::params![title, now, id.as_str()],
            )?;
            if n == 0 {
                return Err(StoreError::NotFound(format!("session {id}")));
            }
            Ok(())
        })
    }

    #[instrument(skip(self), fields(session_id = %id))]
    pub fn set_status(&self, id: &SessionId, status: SessionStatus) -> Result<(), StoreError> {
        let now = Utc::now().to_rfc3339();
        self.db.with_conn(|conn| {
            conn.execute(
                "UPDATE sessions SET status = ?1, updated_at = ?2 WHERE id = ?3",
                rusqlite::params![status.as_str(), now, id.as_str()],
            )?;
            Ok(())
        })
    }

    /// Delete the session. Child rows cascade.
    pub fn delete(&self, id: &SessionId) -> Result<bool, StoreError> {
        self.db.with_conn(|conn| {
            let n = conn.execute("DELETE FROM sessions WHERE id = ?1", [id.as_str()])?;
            Ok(n > 0)
        })
    }

    pub fn settings(&self, id: &SessionId) -> Result<Option<SessionSettings>, StoreError> {
        self.db.with_conn(|conn| {
            let row = conn
                .query_row(
                    "SELECT session_id, override_model FROM session_settings WHERE session_id = ?1",
                    [id.as_str()],
                    |row| {
                        Ok(SessionSettings {
                            session_id: SessionId::from_raw(row.get::<_, String>(0)?),
                            override_model: row.get(1)?,
                        })
                    },
                )
                .ok();
            Ok(row)
        })
    }

    pub fn upsert_settings(
        &self,
        id: &SessionId,
        override_model: Option<&str>,
    ) -> Result<(), StoreError> {
        self.db.with_conn(|conn| {
            let n = conn.execute(
                "INSERT INTO session_settings (session_id, override_model) VALUES (?1, ?2)
                 ON CONFLICT(session_id) DO UPDATE SET override_model = excluded.override_model",
                rusqlite::params![id.as_str(), override_model],
            )?;
            if n == 0 {
                return Err(StoreError::NotFound(format!("session {id}")));
            }
            Ok(())
        })
    }

    pub fn delete_settings(&self, id: &SessionId) -> Result<(), StoreError> {
        self.db.with_conn(|conn| {
            conn.execute(
                "DELETE FROM session_settings WHERE session_id = ?1",
                [id.as_str()],
            )?;
            Ok(())
        })
    }
}

fn row_to_session(row: &rusqlite::Row<'_>) -> rusqlite::Result<SessionRow> {
    Ok(SessionRow {
        id: SessionId::from_raw(row.get::<_, String>(0)?),
        title: row.get(1)?,
        status: SessionStatus::parse(&row.get::<_, String>(2)?),
        created_at: row.get(3)?,
        updated_at: row.get(4)?,
    })
}
