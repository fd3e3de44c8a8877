//! Credit ledger - per-user balances with optimistic-concurrency debits.
//!
//! The account row is the only hot shared resource in the system. Every
//! mutation goes through `debit`/`refund`; there is no cross-user lock
//! and no read-then-write without the version guard. Both operations
//! append to the audit trail (the system of record for disputes).

use std::time::Duration;

use rusqlite::params;
use uuid::Uuid;

use crate::audit::AuditSink;
use crate::db::SharedDb;
use crate::error::{ForgeError, Result};

/// How many times a failed refund write is retried on a background task
/// before alerting. Under-refunding is worse than a delayed refund.
const REFUND_RETRY_ATTEMPTS: u32 = 5;
const REFUND_RETRY_BASE_DELAY: Duration = Duration::from_millis(250);

#[derive(Clone)]
pub struct Ledger {
    db: SharedDb,
    audit: AuditSink,
}

impl Ledger {
    pub fn new(db: SharedDb, audit: AuditSink) -> Self {
        Self { db, audit }
    }

    pub fn audit(&self) -> &AuditSink {
        &self.audit
    }

    /// Create an account with an initial balance; no-op if it exists.
    pub fn open_account(&self, user_id: Uuid, initial_balance: i64) -> Result<()> {
        let conn = self.db.conn();
        conn.execute(
            "INSERT OR IGNORE INTO accounts (user_id, balance, version) VALUES (?1, ?2, 0)",
            params![user_id.to_string(), initial_balance],
        )?;
        Ok(())
    }

    pub fn balance(&self, user_id: Uuid) -> Result<i64> {
        let conn = self.db.conn();
        conn.query_row(
            "SELECT balance FROM accounts WHERE user_id = ?1",
            params![user_id.to_string()],
            |row| row.get(0),
        )
        .map_err(|_| ForgeError::Validation(format!("no credit account for user {user_id}")))
    }

    fn read_account(&self, user_id: Uuid) -> Result<(i64, i64)> {
        let conn = self.db.conn();
        conn.query_row(
            "SELECT balance, version FROM accounts WHERE user_id = ?1",
            params![user_id.to_string()],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .map_err(|_| ForgeError::Validation(format!("no credit account for user {user_id}")))
    }

    /// Debit `amount` credits, failing fast on insufficient funds.
    ///
    /// The update succeeds only if the account version is unchanged since
    /// the read; zero rows affected means another writer got there first
    /// and the whole submission should be retried, never partially
    /// reapplied.
    pub fn debit(&self, user_id: Uuid, amount: i64, reason: &str, job_id: Option<Uuid>) -> Result<()> {
        debug_assert!(amount >= 0);
        let (balance, version) = self.read_account(user_id)?;

        if balance < amount {
            return Err(ForgeError::InsufficientFunds {
                required: amount,
                available: balance,
            });
        }

        let changed = {
            let conn = self.db.conn();
            conn.execute(
                "UPDATE accounts SET balance = balance - ?1, version = version + 1
                 WHERE user_id = ?2 AND version = ?3 AND balance >= ?1",
                params![amount, user_id.to_string(), version],
            )?
        };
        if changed == 0 {
            return Err(ForgeError::Conflict);
        }

        self.audit
            .append(user_id, job_id, "debit", Some(amount), Some(reason))?;
        tracing::info!(user_id = %user_id, job_id = ?job_id, amount, reason, "debit");
        Ok(())
    }

    /// Refund `amount` credits. Additive and best-effort: this never fails
    /// the caller's flow. A write failure is retried with backoff on a
    /// spawned task; exhausting the retries is logged at error level so an
    /// operator is alerted before credits are silently lost.
    pub fn refund(&self, user_id: Uuid, amount: i64, reason: &str, job_id: Option<Uuid>) {
        if amount <= 0 {
            return;
        }
        match self.try_refund(user_id, amount, reason, job_id) {
            Ok(()) => {}
            Err(e) => {
                tracing::warn!(user_id = %user_id, amount, error = %e, "refund failed, scheduling retries");
                let ledger = self.clone();
                let reason = reason.to_string();
                if let Ok(handle) = tokio::runtime::Handle::try_current() {
                    handle.spawn(async move {
                        ledger.retry_refund(user_id, amount, &reason, job_id).await;
                    });
                } else {
                    tracing::error!(
                        user_id = %user_id,
                        amount,
                        "REFUND LOST: no runtime to retry on, manual reconciliation required"
                    );
                }
            }
        }
    }

    fn try_refund(&self, user_id: Uuid, amount: i64, reason: &str, job_id: Option<Uuid>) -> Result<()> {
        let changed = {
            let conn = self.db.conn();
            conn.execute(
                "UPDATE accounts SET balance = balance + ?1, version = version + 1
                 WHERE user_id = ?2",
                params![amount, user_id.to_string()],
            )?
        };
        if changed == 0 {
            return Err(ForgeError::Validation(format!(
                "no credit account for user {user_id}"
            )));
        }
        self.audit
            .append(user_id, job_id, "refund", Some(amount), Some(reason))?;
        tracing::info!(user_id = %user_id, job_id = ?job_id, amount, reason, "refund");
        Ok(())
    }

    async fn retry_refund(&self, user_id: Uuid, amount: i64, reason: &str, job_id: Option<Uuid>) {
        for attempt in 0..REFUND_RETRY_ATTEMPTS {
            tokio::time::sleep(REFUND_RETRY_BASE_DELAY * 2u32.pow(attempt)).await;
            match self.try_refund(user_id, amount, reason, job_id) {
                Ok(()) => {
                    tracing::info!(user_id = %user_id, amount, attempt, "refund retry succeeded");
                    return;
                }
                Err(e) => {
                    tracing::warn!(user_id = %user_id, amount, attempt, error = %e, "refund retry failed");
                }
            }
        }
        // Severity-1: credits were charged and the refund could not land.
        tracing::error!(
            user_id = %user_id,
            job_id = ?job_id,
            amount,
            "REFUND LOST after {REFUND_RETRY_ATTEMPTS} retries, manual reconciliation required"
        );
    }
}
