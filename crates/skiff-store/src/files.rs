use chrono::Utc;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use skiff_core::ids::{FileChangeId, FileVersionId, SessionId, StepId, TurnId};

use crate::database::Database;
use crate::error::StoreError;

/// Version contents above this size are not snapshotted.
const MAX_VERSION_BYTES: usize = 1_000_000;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FileChangeRow {
    pub id: FileChangeId,
    pub session_id: SessionId,
    pub turn_id: TurnId,
    pub step_id: StepId,
    pub path: String,
    pub diff: String,
    pub created_at: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FileVersionRow {
    pub id: FileVersionId,
    pub session_id: SessionId,
    pub turn_id: Option<TurnId>,
    pub step_id: Option<StepId>,
    pub path: String,
    pub idx: i64,
    pub sha256: String,
    pub note: String,
    pub created_at: String,
}

pub fn sha256_hex(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    format!("{:x}", hasher.finalize())
}

pub struct FileRepo {
    db: Database,
}

impl FileRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub fn add_change(
        &self,
        session_id: &SessionId,
        turn_id: &TurnId,
        step_id: &StepId,
        path: &str,
        diff: &str,
    ) -> Result<FileChangeRow, StoreError> {
        let id = FileChangeId::new();
        let now = Utc::now().to_rfc3339();
        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO file_changes (id, session_id, turn_id, step_id, path, diff, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                rusqlite::params![
                    id.as_str(),
                    session_id.as_str(),
                    turn_id.as_str(),
                    step_id.as_str(),
                    path,
                    diff,
                    now
                ],
            )?;
            Ok(FileChangeRow {
                id: id.clone(),
                session_id: session_id.clone(),
                turn_id: turn_id.clone(),
                step_id: step_id.clone(),
                path: path.to_string(),
                diff: diff.to_string(),
                created_at: now.clone(),
            })
        })
    }

    pub fn list_changes(
        &self,
        session_id: &SessionId,
        limit: u32,
    ) -> Result<Vec<FileChangeRow>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, session_id, turn_id, step_id, path, diff, created_at
                 FROM file_changes WHERE session_id = ?1
                 ORDER BY created_at DESC, id DESC LIMIT ?2",
            )?;
            let rows = stmt
                .query_map(rusqlite::params![session_id.as_str(), limit], |row| {
                    Ok(FileChangeRow {
                        id: FileChangeId::from_raw(row.get::<_, String>(0)?),
                        session_id: SessionId::from_raw(row.get::<_, String>(1)?),
                        turn_id: TurnId::from_raw(row.get::<_, String>(2)?),
                        step_id: StepId::from_raw(row.get::<_, String>(3)?),
                        path: row.get(4)?,
                        diff: row.get(5)?,
                        created_at: row.get(6)?,
                    })
                })?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    /// Snapshot a file's content as the next version for its path. Returns
    /// None when skipped: identical to the latest snapshot, or oversized.
    /// Version indices per (session, path) are dense starting at 1.
    pub fn add_version(
        &self,
        session_id: &SessionId,
        turn_id: Option<&TurnId>,
        step_id: Option<&StepId>,
        path: &str,
        content: &str,
        note: &str,
    ) -> Result<Option<FileVersionRow>, StoreError> {
        if content.len() > MAX_VERSION_BYTES {
            return Ok(None);
        }

        let sha = sha256_hex(content);
        let id = FileVersionId::new();
        let now = Utc::now().to_rfc3339();

        self.db.with_conn(|conn| {
            let last_sha: Option<String> = conn
                .query_row(
                    "SELECT sha256 FROM file_versions
                     WHERE session_id = ?1 AND path = ?2 ORDER BY idx DESC LIMIT 1",
                    rusqlite::params![session_id.as_str(), path],
                    |row| row.get(0),
                )
                .ok();
            if last_sha.as_deref() == Some(sha.as_str()) {
                return Ok(None);
            }

            let idx: i64 = conn.query_row(
                "SELECT COALESCE(MAX(idx), 0) + 1 FROM file_versions
                 WHERE session_id = ?1 AND path = ?2",
                rusqlite::params![session_id.as_str(), path],
                |row| row.get(0),
            )?;

            conn.execute(
                "INSERT INTO file_versions
                 (id, session_id, turn_id, step_id, path, idx, sha256, content, note, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                rusqlite::params![
                    id.as_str(),
                    session_id.as_str(),
                    turn_id.map(|t| t.as_str()),
                    step_id.map(|s| s.as_str()),
                    path,
                    idx,
                    sha,
                    content,
                    note,
                    now
                ],
            )?;

            Ok(Some(FileVersionRow {
                id: id.clone(),
                session_id: session_id.clone(),
                turn_id: turn_id.cloned(),
                step_id: step_id.cloned(),
                path: path.to_string(),
                idx,
                sha256: sha.clone(),
                note: note.to_string(),
                created_at: now.clone(),
            }))
        })
    }

    /// Version metadata for a path, newest first. Content is fetched
    /// separately by id.
    pub fn list_versions(
        &self,
        session_id: &SessionId,
        path: &str,
        limit: u32,
    ) -> Result<Vec<FileVersionRow>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, session_id, turn_id, step_id, path, idx, sha256, note, created_at
                 FROM file_versions WHERE session_id = ?1 AND path = ?2
                 ORDER BY idx DESC LIMIT ?3",
            )?;
            let rows = stmt
                .query_map(
                    rusqlite::params![session_id.as_str(), path, limit],
                    row_to_version,
                )?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    pub fn get_version(
        &self,
        version_id: &FileVersionId,
    ) -> Result<(FileVersionRow, String), StoreError> {
        self.db.with_conn(|conn| {
            conn.query_row(
                "SELECT id, session_id, turn_id, step_id, path, idx, sha256, note, created_at, content
                 FROM file_versions WHERE id = ?1",
                [version_id.as_str()],
                |row| {
                    let version = row_to_version(row)?;
                    let content: String = row.get(9)?;
                    Ok((version, content))
                },
            )
            .map_err(|_| StoreError::NotFound(format!("file version {version_id}")))
        })
    }
}

fn row_to_version(row: &rusqlite::Row<'_>) -> rusqlite::Result<FileVersionRow> {
    Ok(FileVersionRow {
        id: FileVersionId::from_raw(row.get::<_, String>(0)?),
        session_id: SessionId::from_raw(row.get::<_, String>(1)?),
        turn_id: row.get::<_, Option<String>>(2)?.map(TurnId::from_raw),
        step_id: row.get::<_, Option<String>>(3)?.map(StepId::from_raw),
        path: row.get(4)?,
        idx: row.get(5)?,
        sha256: row.get(6)?,
        note: row.get(7)?,
        created_at: row.get(8)?,
    })
}
