//! Version-guarded SQLite store for job records.
//!
//! The full record is serialized as JSON alongside indexed columns for
//! status queries. `update` bumps the version and refuses stale writers,
//! which is what keeps a slow "completed" write from clobbering a
//! "cancelled" that landed in the meantime.

use chrono::Utc;
use rusqlite::params;
use uuid::Uuid;

use super::{JobRecord, JobStatus};
use crate::db::SharedDb;
use crate::error::{ForgeError, Result};

#[derive(Clone)]
pub struct JobStore {
    db: SharedDb,
}

impl JobStore {
    pub fn new(db: SharedDb) -> Self {
        Self { db }
    }

    pub fn insert(&self, record: &JobRecord) -> Result<()> {
        let json = serde_json::to_string(record)
            .map_err(|e| ForgeError::Internal(format!("serialize job: {e}")))?;
        let conn = self.db.conn();
        conn.execute(
            "INSERT INTO jobs (id, user_id, status, version, updated_at, record)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                record.id.to_string(),
                record.user_id().to_string(),
                record.status.as_str(),
                record.version,
                record.updated_at.to_rfc3339(),
                json,
            ],
        )?;
        Ok(())
    }

    pub fn get(&self, id: Uuid) -> Result<JobRecord> {
        let conn = self.db.conn();
        let json: String = conn
            .query_row(
                "SELECT record FROM jobs WHERE id = ?1",
                params![id.to_string()],
                |row| row.get(0),
            )
            .map_err(|_| ForgeError::NotFound(id))?;
        serde_json::from_str(&json).map_err(|e| ForgeError::Internal(format!("decode job: {e}")))
    }

    /// Persist `record`, succeeding only if no other writer advanced it.
    /// On success the in-memory version/updated_at are bumped to match.
    pub fn update(&self, record: &mut JobRecord) -> Result<()> {
        let expected = record.version;
        record.updated_at = Utc::now();
        record.version = expected + 1;

        let json = serde_json::to_string(record)
            .map_err(|e| ForgeError::Internal(format!("serialize job: {e}")))?;
        let changed = {
            let conn = self.db.conn();
            conn.execute(
                "UPDATE jobs SET status = ?1, version = ?2, updated_at = ?3, record = ?4
                 WHERE id = ?5 AND version = ?6",
                params![
                    record.status.as_str(),
                    record.version,
                    record.updated_at.to_rfc3339(),
                    json,
                    record.id.to_string(),
                    expected,
                ],
            )?
        };
        if changed == 0 {
            record.version = expected;
            return Err(ForgeError::Conflict);
        }
        Ok(())
    }

    pub fn list_for_user(&self, user_id: Uuid) -> Result<Vec<JobRecord>> {
        let conn = self.db.conn();
        let mut stmt = conn.prepare(
            "SELECT record FROM jobs WHERE user_id = ?1 ORDER BY updated_at DESC",
        )?;
        let rows = stmt.query_map(params![user_id.to_string()], |row| {
            row.get::<_, String>(0)
        })?;
        let mut out = Vec::new();
        for json in rows {
            let json = json?;
            out.push(
                serde_json::from_str(&json)
                    .map_err(|e| ForgeError::Internal(format!("decode job: {e}")))?,
            );
        }
        Ok(out)
    }

    /// All jobs currently in one of `statuses` (watchdog scan path).
    pub fn list_with_status(&self, statuses: &[JobStatus]) -> Result<Vec<JobRecord>> {
        let conn = self.db.conn();
        let mut stmt = conn.prepare("SELECT record, status FROM jobs")?;
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?;
        let mut out = Vec::new();
        for row in rows {
            let (json, status) = row?;
            if statuses.iter().any(|s| s.as_str() == status) {
                out.push(
                    serde_json::from_str(&json)
                        .map_err(|e| ForgeError::Internal(format!("decode job: {e}")))?,
                );
            }
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Db;
    use crate::job::GenerationRequest;
    use crate::schema::ParamMap;

    fn store() -> JobStore {
        JobStore::new(Db::open_in_memory().unwrap())
    }

    fn record() -> JobRecord {
        JobRecord::new(
            GenerationRequest {
                id: Uuid::new_v4(),
                user_id: Uuid::new_v4(),
                model_reference: "image-basic".into(),
                prompt: "a fox".into(),
                parameters: ParamMap::new(),
                content_type: "image".into(),
            },
            1,
        )
    }

    #[test]
    fn insert_get_roundtrip() {
        let store = store();
        let rec = record();
        store.insert(&rec).unwrap();
        let loaded = store.get(rec.id).unwrap();
        assert_eq!(loaded.id, rec.id);
        assert_eq!(loaded.status, JobStatus::Pending);
    }

    #[test]
    fn stale_writer_is_rejected() {
        let store = store();
        let rec = record();
        store.insert(&rec).unwrap();

        // Two copies of the same version; the second write must lose.
        let mut first = store.get(rec.id).unwrap();
        let mut second = store.get(rec.id).unwrap();

        first.transition_to(JobStatus::FetchingAsset).unwrap();
        store.update(&mut first).unwrap();

        second.transition_to(JobStatus::Cancelled).unwrap();
        let err = store.update(&mut second).unwrap_err();
        assert_eq!(err.kind(), "conflict");

        // The store still holds the first write.
        assert_eq!(store.get(rec.id).unwrap().status, JobStatus::FetchingAsset);
    }

    #[test]
    fn completed_never_overwrites_cancelled() {
        let store = store();
        let rec = record();
        store.insert(&rec).unwrap();

        let mut runner_copy = store.get(rec.id).unwrap();
        runner_copy.transition_to(JobStatus::FetchingAsset).unwrap();
        store.update(&mut runner_copy).unwrap();

        // A cancel lands while the runner still holds its copy.
        let mut cancel_copy = store.get(rec.id).unwrap();
        cancel_copy.transition_to(JobStatus::Cancelled).unwrap();
        store.update(&mut cancel_copy).unwrap();

        // Runner tries to finish with its now-stale version.
        runner_copy.transition_to(JobStatus::Completed).unwrap();
        assert_eq!(store.update(&mut runner_copy).unwrap_err().kind(), "conflict");
        assert_eq!(store.get(rec.id).unwrap().status, JobStatus::Cancelled);
    }

    #[test]
    fn status_scan_finds_watched_jobs() {
        let store = store();
        let rec = record();
        store.insert(&rec).unwrap();
        let mut rec = store.get(rec.id).unwrap();
        rec.transition_to(JobStatus::FetchingAsset).unwrap();
        store.update(&mut rec).unwrap();

        let watched = store
            .list_with_status(&[JobStatus::FetchingAsset, JobStatus::Assembling])
            .unwrap();
        assert_eq!(watched.len(), 1);
        assert_eq!(watched[0].id, rec.id);
    }
}
