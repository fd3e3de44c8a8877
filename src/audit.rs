//! Append-only audit trail for ledger and job lifecycle events.
//!
//! This is the system of record for reconciling credit disputes: every
//! debit and refund lands here, keyed by user and job.

use chrono::{DateTime, Utc};
use rusqlite::params;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::db::SharedDb;
use crate::error::Result;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    pub at: DateTime<Utc>,
    pub user_id: Uuid,
    pub job_id: Option<Uuid>,
    pub kind: String,
    pub amount: Option<i64>,
    pub detail: Option<String>,
}

#[derive(Clone)]
pub struct AuditSink {
    db: SharedDb,
}

impl AuditSink {
    pub fn new(db: SharedDb) -> Self {
        Self { db }
    }

    pub fn append(
        &self,
        user_id: Uuid,
        job_id: Option<Uuid>,
        kind: &str,
        amount: Option<i64>,
        detail: Option<&str>,
    ) -> Result<()> {
        let conn = self.db.conn();
        conn.execute(
            "INSERT INTO audit_log (at, user_id, job_id, kind, amount, detail)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                Utc::now().to_rfc3339(),
                user_id.to_string(),
                job_id.map(|j| j.to_string()),
                kind,
                amount,
                detail,
            ],
        )?;
        tracing::debug!(user_id = %user_id, job_id = ?job_id, kind, amount, "audit entry");
        Ok(())
    }

    /// Best-effort lifecycle event. A failed write is logged, never fatal:
    /// losing an event row must not fail the job it describes.
    pub fn event(&self, user_id: Uuid, job_id: Uuid, kind: &str, detail: Option<&str>) {
        if let Err(e) = self.append(user_id, Some(job_id), kind, None, detail) {
            tracing::warn!(job_id = %job_id, kind, error = %e, "audit event write failed");
        }
    }

    pub fn entries_for_job(&self, job_id: Uuid) -> Result<Vec<AuditEntry>> {
        let conn = self.db.conn();
        let mut stmt = conn.prepare(
            "SELECT at, user_id, job_id, kind, amount, detail
             FROM audit_log WHERE job_id = ?1 ORDER BY id",
        )?;
        let rows = stmt.query_map(params![job_id.to_string()], row_to_entry)?;
        Ok(rows.collect::<std::result::Result<Vec<_>, _>>()?)
    }

    pub fn entries_for_user(&self, user_id: Uuid) -> Result<Vec<AuditEntry>> {
        let conn = self.db.conn();
        let mut stmt = conn.prepare(
            "SELECT at, user_id, job_id, kind, amount, detail
             FROM audit_log WHERE user_id = ?1 ORDER BY id",
        )?;
        let rows = stmt.query_map(params![user_id.to_string()], row_to_entry)?;
        Ok(rows.collect::<std::result::Result<Vec<_>, _>>()?)
    }
}

fn row_to_entry(row: &rusqlite::Row<'_>) -> rusqlite::Result<AuditEntry> {
    let at: String = row.get(0)?;
    let user_id: String = row.get(1)?;
    let job_id: Option<String> = row.get(2)?;
    Ok(AuditEntry {
        at: DateTime::parse_from_rfc3339(&at)
            .map(|t| t.with_timezone(&Utc))
            .unwrap_or_else(|_| Utc::now()),
        user_id: user_id.parse().unwrap_or_default(),
        job_id: job_id.and_then(|j| j.parse().ok()),
        kind: row.get(3)?,
        amount: row.get(4)?,
        detail: row.get(5)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Db;

    #[test]
    fn entries_are_appended_and_ordered() {
        let db = Db::open_in_memory().unwrap();
        let sink = AuditSink::new(db);
        let user = Uuid::new_v4();
        let job = Uuid::new_v4();

        sink.append(user, Some(job), "debit", Some(12), Some("stage script"))
            .unwrap();
        sink.append(user, Some(job), "refund", Some(12), Some("provider failure"))
            .unwrap();

        let entries = sink.entries_for_job(job).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].kind, "debit");
        assert_eq!(entries[1].kind, "refund");
        assert_eq!(entries[1].amount, Some(12));
    }
}
