use std::collections::HashMap;
use std::str::FromStr;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use skiff_core::ids::{PermissionRequestId, SessionId, StepId, TurnId};
use skiff_core::tools::{PermissionMode, Policy};

use crate::database::Database;
use crate::error::StoreError;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestStatus {
    Pending,
    Approved,
    Denied,
    Expired,
}

impl RequestStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Approved => "approved",
            Self::Denied => "denied",
            Self::Expired => "expired",
        }
    }

    fn parse(s: &str) -> Self {
        match s {
            "approved" => Self::Approved,
            "denied" => Self::Denied,
            "expired" => Self::Expired,
            _ => Self::Pending,
        }
    }
}

/// How long a resolution applies.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Scope {
    Once,
    Session,
    Always,
}

impl Scope {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Once => "once",
            Self::Session => "session",
            Self::Always => "always",
        }
    }
}

impl FromStr for Scope {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "once" => Ok(Self::Once),
            "session" => Ok(Self::Session),
            "always" => Ok(Self::Always),
            other => Err(format!("unknown scope: {other}")),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PermissionRequestRow {
    pub id: PermissionRequestId,
    pub session_id: SessionId,
    pub turn_id: TurnId,
    pub step_id: StepId,
    pub tool_name: String,
    pub input: Value,
    pub status: RequestStatus,
    pub scope: Scope,
    pub created_at: String,
    pub resolved_at: Option<String>,
}

pub struct PermissionRepo {
    db: Database,
}

impl PermissionRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    // ── Tool policies ──

    pub fn upsert_policy(&self, tool_name: &str, policy: Policy) -> Result<(), StoreError> {
        let now = Utc::now().to_rfc3339();
        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO tool_policies (tool_name, policy, updated_at) VALUES (?1, ?2, ?3)
                 ON CONFLICT(tool_name) DO UPDATE SET policy = excluded.policy, updated_at = excluded.updated_at",
                rusqlite::params![tool_name, policy.as_str(), now],
            )?;
            Ok(())
        })
    }

    pub fn policies(&self) -> Result<HashMap<String, Policy>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare("SELECT tool_name, policy FROM tool_policies")?;
            let mut out = HashMap::new();
            let rows = stmt.query_map([], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
            })?;
            for row in rows {
                let (name, policy) = row?;
                if let Ok(policy) = policy.parse::<Policy>() {
                    out.insert(name, policy);
                }
            }
            Ok(out)
        })
    }

    pub fn policy(&self, tool_name: &str) -> Result<Option<Policy>, StoreError> {
        self.db.with_conn(|conn| {
            let raw: Option<String> = conn
                .query_row(
                    "SELECT policy FROM tool_policies WHERE tool_name = ?1",
                    [tool_name],
                    |row| row.get(0),
                )
                .ok();
            Ok(raw.and_then(|p| p.parse().ok()))
        })
    }

    // ── Permission mode (global singleton) ──

    pub fn mode(&self) -> Result<PermissionMode, StoreError> {
        self.db.with_conn(|conn| {
            let raw: Option<String> = conn
                .query_row("SELECT mode FROM permission_mode WHERE id = 1", [], |row| {
                    row.get(0)
                })
                .ok();
            Ok(raw
                .and_then(|m| m.parse().ok())
                .unwrap_or(PermissionMode::Ask))
        })
    }

    pub fn set_mode(&self, mode: PermissionMode) -> Result<(), StoreError> {
        let now = Utc::now().to_rfc3339();
        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO permission_mode (id, mode, updated_at) VALUES (1, ?1, ?2)
                 ON CONFLICT(id) DO UPDATE SET mode = excluded.mode, updated_at = excluded.updated_at",
                rusqlite::params![mode.as_str(), now],
            )?;
            Ok(())
        })
    }

    // ── Permission requests ──

    pub fn create_request(
        &self,
        session_id: &SessionId,
        turn_id: &TurnId,
        step_id: &StepId,
        tool_name: &str,
        input: &Value,
    ) -> Result<PermissionRequestRow, StoreError> {
        let id = PermissionRequestId::new();
        let now = Utc::now().to_rfc3339();
        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO permission_requests
                 (id, session_id, turn_id, step_id, tool_name, input_json, status, scope, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, 'pending', 'once', ?7)",
                rusqlite::params![
                    id.as_str(),
                    session_id.as_str(),
                    turn_id.as_str(),
                    step_id.as_str(),
                    tool_name,
                    serde_json::to_string(input)?,
                    now
                ],
            )?;
            Ok(PermissionRequestRow {
                id: id.clone(),
                session_id: session_id.clone(),
                turn_id: turn_id.clone(),
                step_id: step_id.clone(),
                tool_name: tool_name.to_string(),
                input: input.clone(),
                status: RequestStatus::Pending,
                scope: Scope::Once,
                created_at: now.clone(),
                resolved_at: None,
            })
        })
    }

    pub fn get_request(
        &self,
        id: &PermissionRequestId,
    ) -> Result<PermissionRequestRow, StoreError> {
        self.db.with_conn(|conn| {
            conn.query_row(
                "SELECT id, session_id, turn_id, step_id, tool_name, input_json, status, scope, created_at, resolved_at
                 FROM permission_requests WHERE id = ?1",
                [id.as_str()],
                row_to_request,
            )
            .map_err(|_| StoreError::NotFound(format!("permission request {id}")))
        })
    }

    /// Transition a request out of `pending`. A request resolves at most
    /// once; a second resolution is a conflict.
    pub fn resolve_request(
        &self,
        id: &PermissionRequestId,
        status: RequestStatus,
        scope: Scope,
    ) -> Result<(), StoreError> {
        let now = Utc::now().to_rfc3339();
        self.db.with_conn(|conn| {
            let n = conn.execute(
                "UPDATE permission_requests SET status = ?1, scope = ?2, resolved_at = ?3
                 WHERE id = ?4 AND status = 'pending'",
                rusqlite::params![status.as_str(), scope.as_str(), now, id.as_str()],
            )?;
            if n == 0 {
                let exists: Option<i64> = conn
                    .query_row(
                        "SELECT 1 FROM permission_requests WHERE id = ?1",
                        [id.as_str()],
                        |row| row.get(0),
                    )
                    .ok();
                return Err(match exists {
                    Some(_) => StoreError::Conflict(format!("permission request {id} already resolved")),
                    None => StoreError::NotFound(format!("permission request {id}")),
                });
            }
            Ok(())
        })
    }

    pub fn list_pending(
        &self,
        session_id: &SessionId,
    ) -> Result<Vec<PermissionRequestRow>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, session_id, turn_id, step_id, tool_name, input_json, status, scope, created_at, resolved_at
                 FROM permission_requests WHERE session_id = ?1 AND status = 'pending'
                 ORDER BY created_at ASC",
            )?;
            let rows = stmt
                .query_map([session_id.as_str()], row_to_request)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    pub fn list_for_session(
        &self,
        session_id: &SessionId,
        limit: u32,
    ) -> Result<Vec<PermissionRequestRow>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, session_id, turn_id, step_id, tool_name, input_json, status, scope, created_at, resolved_at
                 FROM permission_requests WHERE session_id = ?1
                 ORDER BY created_at ASC LIMIT ?2",
            )?;
            let rows = stmt
                .query_map(rusqlite::params![session_id.as_str(), limit], row_to_request)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    /// Expire any still-pending requests for a turn (cancellation path).
    /// Returns the ids that were expired.
    pub fn expire_pending_for_turn(
        &self,
        turn_id: &TurnId,
    ) -> Result<Vec<PermissionRequestId>, StoreError> {
        let now = Utc::now().to_rfc3339();
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id FROM permission_requests WHERE turn_id = ?1 AND status = 'pending'",
            )?;
            let ids: Vec<String> = stmt
                .query_map([turn_id.as_str()], |row| row.get(0))?
                .collect::<Result<Vec<_>, _>>()?;

            conn.execute(
                "UPDATE permission_requests SET status = 'expired', resolved_at = ?1
                 WHERE turn_id = ?2 AND status = 'pending'",
                rusqlite::params![now, turn_id.as_str()],
            )?;

            Ok(ids.into_iter().map(PermissionRequestId::from_raw).collect())
        })
    }
}

fn row_to_request(row: &rusqlite::Row<'_>) -> rusqlite::Result<PermissionRequestRow> {
    let input_json: String = row.get(5)?;
    let scope: String = row.get(7)?;
    Ok(PermissionRequestRow {
        id: PermissionRequestId::from_raw(row.get::<_, String>(0)?),
        session_id: SessionId::from_raw(row.get::<_, String>(1)?),
        turn_id: TurnId::from_raw(row.get::<_, String>(2)?),
        step_id: StepId::from_raw(row.get::<_, String>(3)?),
        tool_name: row.get(4)?,
        input: serde_json::from_str(&input_json).unwrap_or(Value::Null),
        status: RequestStatus::parse(&row.get::<_, String>(6)?),
        scope: scope.parse().unwrap_or(Scope::Once),
        created_at: row.get(8)?,
        resolved_at: row.get(9)?,
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

    #[test]
    fn policy_upsert_and_read() {
        let (db, ..) = setup();
        let repo = PermissionRepo::new(db);

        assert!(repo.policy("write_file").unwrap().is_none());
        repo.upsert_policy("write_file", Policy::Deny).unwrap();
        assert_eq!(repo.policy("write_file").unwrap(), Some(Policy::Deny));

        repo.upsert_policy("write_file", Policy::Allow).unwrap();
        let all = repo.policies().unwrap();
        assert_eq!(all.get("write_file"), Some(&Policy::Allow));
    }

    #[test]
    fn mode_defaults_to_ask() {
        let (db, ..) = setup();
        let repo = PermissionRepo::new(db);
        assert_eq!(repo.mode().unwrap(), PermissionMode::Ask);

        repo.set_mode(PermissionMode::Allow).unwrap();
        assert_eq!(repo.mode().unwrap(), PermissionMode::Allow);

        repo.set_mode(PermissionMode::Ask).unwrap();
        assert_eq!(repo.mode().unwrap(), PermissionMode::Ask);
    }

    #[test]
    fn request_lifecycle() {
        let (db, sess, turn, step) = setup();
        let repo = PermissionRepo::new(db);

        let req = repo
            .create_request(&sess, &turn, &step, "write_file", &json!({"path": "a.txt"}))
            .unwrap();
        assert_eq!(req.status, RequestStatus::Pending);

        let pending = repo.list_pending(&sess).unwrap();
        assert_eq!(pending.len(), 1);

        repo.resolve_request(&req.id, RequestStatus::Approved, Scope::Once)
            .unwrap();
        assert!(repo.list_pending(&sess).unwrap().is_empty());

        let fetched = repo.get_request(&req.id).unwrap();
        assert_eq!(fetched.status, RequestStatus::Approved);
        assert!(fetched.resolved_at.is_some());
    }

    #[test]
    fn single_transition_out_of_pending() {
        let (db, sess, turn, step) = setup();
        let repo = PermissionRepo::new(db);
        let req = repo
            .create_request(&sess, &turn, &step, "write_file", &json!({}))
            .unwrap();

        repo.resolve_request(&req.id, RequestStatus::Denied, Scope::Once)
            .unwrap();
        let err = repo
            .resolve_request(&req.id, RequestStatus::Approved, Scope::Always)
            .unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)));

        // The first decision sticks.
        assert_eq!(
            repo.get_request(&req.id).unwrap().status,
            RequestStatus::Denied
        );
    }

    #[test]
    fn resolve_missing_is_not_found() {
        let (db, ..) = setup();
        let repo = PermissionRepo::new(db);
        let err = repo
            .resolve_request(
                &PermissionRequestId::from_raw("pr_missing"),
                RequestStatus::Approved,
                Scope::Once,
            )
            .unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));
    }

    #[test]
    fn expire_pending_for_turn() {
        let (db, sess, turn, step) = setup();
        let repo = PermissionRepo::new(db);
        let r1 = repo
            .create_request(&sess, &turn, &step, "write_file", &json!({}))
            .unwrap();
        let r2 = repo
            .create_request(&sess, &turn, &step, "apply_patch", &json!({}))
            .unwrap();
        repo.resolve_request(&r1.id, RequestStatus::Approved, Scope::Once)
            .unwrap();

        let expired = repo.expire_pending_for_turn(&turn).unwrap();
        assert_eq!(expired, vec![r2.id.clone()]);
        assert_eq!(
            repo.get_request(&r2.id).unwrap().status,
            RequestStatus::Expired
        );
        // Already-resolved requests are untouched.
        assert_eq!(
            repo.get_request(&r1.id).unwrap().status,
            RequestStatus::Approved
        );
    }
}
