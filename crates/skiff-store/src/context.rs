use chrono::Utc;
use serde::{Deserialize, Serialize};

use skiff_core::ids::{ContextItemId, SessionId};

use crate::database::Database;
use crate::error::StoreError;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ContextItemRow {
    pub id: ContextItemId,
    pub session_id: SessionId,
    pub kind: String,
    pub title: String,
    pub content_ref: String,
    pub pinned: bool,
    pub summary: Option<String>,
    pub summary_sha256: Option<String>,
    pub created_at: String,
}

pub struct ContextRepo {
    db: Database,
}

impl ContextRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub fn add(
        &self,
        session_id: &SessionId,
        kind: &str,
        title: &str,
        content_ref: &str,
        pinned: bool,
    ) -> Result<ContextItemRow, StoreError> {
        let id = ContextItemId::new();
        let now = Utc::now().to_rfc3339();
        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO context_items (id, session_id, kind, title, content_ref, pinned, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                rusqlite::params![
                    id.as_str(),
                    session_id.as_str(),
                    kind,
                    title,
                    content_ref,
                    pinned as i64,
                    now
                ],
            )?;
            Ok(ContextItemRow {
                id: id.clone(),
                session_id: session_id.clone(),
                kind: kind.to_string(),
                title: title.to_string(),
                content_ref: content_ref.to_string(),
                pinned,
                summary: None,
                summary_sha256: None,
                created_at: now.clone(),
            })
        })
    }

    /// Items newest-first, the order the inspector shows them.
    pub fn list(
        &self,
        session_id: &SessionId,
        limit: u32,
    ) -> Result<Vec<ContextItemRow>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, session_id, kind, title, content_ref, pinned, summary, summary_sha256, created_at
                 FROM context_items WHERE session_id = ?1
                 ORDER BY created_at DESC, id DESC LIMIT ?2",
            )?;
            let rows = stmt
                .query_map(rusqlite::params![session_id.as_str(), limit], row_to_item)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    pub fn set_pinned(&self, id: &ContextItemId, pinned: bool) -> Result<(), StoreError> {
        self.db.with_conn(|conn| {
            let n = conn.execute(
                "UPDATE context_items SET pinned = ?1 WHERE id = ?2",
                rusqlite::params![pinned as i64, id.as_str()],
            )?;
            if n == 0 {
                return Err(StoreError::NotFound(format!("context item {id}")));
            }
            Ok(())
        })
    }

    /// Cache a summary keyed by the content hash it was computed from.
    pub fn update_summary(
        &self,
        id: &ContextItemId,
        summary: &str,
        summary_sha256: &str,
    ) -> Result<(), StoreError> {
        self.db.with_conn(|conn| {
            let n = conn.execute(
                "UPDATE context_items SET summary = ?1, summary_sha256 = ?2 WHERE id = ?3",
                rusqlite::params![summary, summary_sha256, id.as_str()],
            )?;
            if n == 0 {
                return Err(StoreError::NotFound(format!("context item {id}")));
            }
            Ok(())
        })
    }
}

fn row_to_item(row: &rusqlite::Row<'_>) -> rusqlite::Result<ContextItemRow> {
    Ok(ContextItemRow {
        id: ContextItemId::from_raw(row.get::<_, String>(0)?),
        session_id: SessionId::from_raw(row.get::<_, String>(1)?),
        kind: row.get(2)?,
        title: row.get(3)?,
        content_ref: row.get(4)?,
        pinned: row.get::<_, i64>(5)? != 0,
        summary: row.get(6)?,
        summary_sha256: row.get(7)?,
        created_at: row.get(8)?,
    })
}
