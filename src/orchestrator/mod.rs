//! Generation orchestrator.
//!
//! Owns the whole job lifecycle: submission (validate, rate-limit, price,
//! debit, persist, spawn), the approval gates, cancellation, retry, and
//! the queries the HTTP surface exposes. Each accepted job runs on its own
//! spawned task (see [`runner`]) holding a cancellation token registered
//! here, so a cancel reaches a job mid-poll without waiting out a delay.
//!
//! # Key Concepts
//!
//! - **Pre-charge vs post-charge failures**: everything before the debit
//!   fails the submission synchronously and leaves no job behind. After
//!   the debit there is always a job record carrying the outcome.
//! - **Stage charges are earned by delivery**: a stage's debit becomes
//!   final only once its artifact is recorded; cancel and provider
//!   failure refund the unearned remainder in the same logical step as
//!   the status write.

mod runner;

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::artifact::ArtifactStore;
use crate::catalog::{Catalog, StageSpec};
use crate::config::PollConfig;
use crate::error::{ForgeError, Result};
use crate::job::{JobRecord, JobStatus, JobStore, Stage};
use crate::ledger::Ledger;
use crate::pricing::price;
use crate::provider::ProviderRegistry;
use crate::ratelimit::RateLimiter;
use crate::schema::ParamMap;

/// How many times a submission retries the price-and-debit sequence when
/// another writer races the account row.
const SUBMIT_CONFLICT_RETRIES: u32 = 3;

/// What a caller supplies to start a job.
#[derive(Debug, Clone)]
pub struct NewJobRequest {
    pub user_id: Uuid,
    pub model_reference: String,
    pub prompt: String,
    pub parameters: ParamMap,
}

pub(crate) struct Inner {
    pub(crate) catalog: Catalog,
    pub(crate) ledger: Ledger,
    pub(crate) jobs: JobStore,
    pub(crate) providers: ProviderRegistry,
    pub(crate) artifacts: Arc<dyn ArtifactStore>,
    pub(crate) limiter: RateLimiter,
    pub(crate) poll: PollConfig,
    /// Cancellation tokens for jobs with a live runner task.
    pub(crate) cancels: RwLock<HashMap<Uuid, CancellationToken>>,
}

#[derive(Clone)]
pub struct Orchestrator {
    inner: Arc<Inner>,
}

impl Orchestrator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        catalog: Catalog,
        ledger: Ledger,
        jobs: JobStore,
        providers: ProviderRegistry,
        artifacts: Arc<dyn ArtifactStore>,
        limiter: RateLimiter,
        poll: PollConfig,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                catalog,
                ledger,
                jobs,
                providers,
                artifacts,
                limiter,
                poll,
                cancels: RwLock::new(HashMap::new()),
            }),
        }
    }

    pub fn ledger(&self) -> &Ledger {
        &self.inner.ledger
    }

    /// Validate, price, charge, and start a job.
    ///
    /// Order matters: rate limit and validation run before any money
    /// moves. The debit races other submissions for the account row;
    /// a version conflict retries the whole price-and-debit sequence
    /// rather than re-applying a stale read.
    pub async fn submit(&self, request: NewJobRequest) -> Result<JobRecord> {
        let model = self.inner.catalog.model(&request.model_reference)?.clone();

        if request.prompt.trim().is_empty() {
            return Err(ForgeError::Validation("prompt must not be empty".into()));
        }
        self.inner.limiter.check_and_record(request.user_id)?;

        let parameters = model.schema.filter(&request.parameters)?;
        let stages = model.stages();

        let mut record = JobRecord::new(
            crate::job::GenerationRequest {
                id: Uuid::new_v4(),
                user_id: request.user_id,
                model_reference: request.model_reference.clone(),
                prompt: request.prompt.clone(),
                parameters,
                content_type: model.content_type.clone(),
            },
            stages.len(),
        );

        // First stage is charged at submission; later stages charge on
        // entry with the pipeline context they need (e.g. script length).
        let first_cost = self.stage_price(&stages[0], &record)?;
        self.debit_with_retry(request.user_id, first_cost, &stages[0], record.id)
            .await?;
        record.record_stage_charge(0, first_cost);

        self.inner.jobs.insert(&record)?;
        tracing::info!(
            job_id = %record.id,
            user_id = %request.user_id,
            model = %request.model_reference,
            cost = first_cost,
            stages = stages.len(),
            "job accepted"
        );

        self.spawn_runner(record.id).await;
        Ok(record)
    }

    /// Approve the named gate, optionally with edited content. Approving
    /// a gate the job has already moved past is a no-op, so a replayed
    /// request can never decide the following gate.
    pub async fn approve(
        &self,
        job_id: Uuid,
        user_id: Uuid,
        gate: Stage,
        edited_content: Option<String>,
    ) -> Result<JobRecord> {
        let mut record = self.owned_job(job_id, user_id)?;
        let gate_status = gate.approval_status().ok_or_else(|| {
            ForgeError::Validation(format!("stage {} has no approval gate", gate.step_name()))
        })?;

        if record.status != gate_status {
            if record.status == JobStatus::Failed || record.status == JobStatus::Cancelled {
                return Err(ForgeError::Validation(format!(
                    "job is {} and cannot be approved",
                    record.status.as_str()
                )));
            }
            let stages = self.pipeline_stages(&record)?;
            let decided = stages
                .iter()
                .position(|s| *s == gate)
                .map(|pos| record.stage_index > pos)
                .unwrap_or(false);
            if decided {
                // Double-click or replayed request: this gate already took.
                tracing::debug!(
                    job_id = %job_id,
                    gate = gate.step_name(),
                    status = record.status.as_str(),
                    "approve replay is a no-op"
                );
                return Ok(record);
            }
            return Err(ForgeError::Validation(format!(
                "job is {} and not awaiting {} approval",
                record.status.as_str(),
                gate.step_name()
            )));
        }

        if let Some(edited) = edited_content {
            if gate != Stage::Script {
                return Err(ForgeError::Validation(
                    "only the script can be edited at approval".into(),
                ));
            }
            record.artifact_refs.script = Some(edited);
        }

        // Move into the next stage's running state here, not in the
        // runner: a replayed approve then sees a non-gate status and
        // cannot advance the pipeline a second time.
        let stages = self.pipeline_stages(&record)?;
        record.stage_index += 1;
        let next = stages.get(record.stage_index).copied().ok_or_else(|| {
            ForgeError::Internal(format!("no stage after approval gate for job {job_id}"))
        })?;
        record.transition_to(next.running_status())?;
        self.inner.jobs.update(&mut record)?;
        tracing::info!(job_id = %job_id, stage_index = record.stage_index, "approved, resuming pipeline");

        self.spawn_runner(job_id).await;
        Ok(record)
    }

    /// Reject the named gate: cancels the job and refunds charges for
    /// undelivered stages. Delivered stages stay paid.
    pub async fn reject(&self, job_id: Uuid, user_id: Uuid, gate: Stage) -> Result<JobRecord> {
        let record = self.owned_job(job_id, user_id)?;
        if gate.approval_status() != Some(record.status) {
            return Err(ForgeError::Validation(format!(
                "job is {} and cannot be rejected at the {} gate",
                record.status.as_str(),
                gate.step_name()
            )));
        }
        self.finalize_cancel(record, "rejected at approval gate")
    }

    /// Request cancellation. Idempotent: cancelling a cancelled job is a
    /// no-op; a completed job can no longer be cancelled.
    pub async fn cancel(&self, job_id: Uuid, user_id: Uuid) -> Result<JobRecord> {
        let record = self.owned_job(job_id, user_id)?;

        match record.status {
            JobStatus::Cancelled => return Ok(record),
            JobStatus::Completed | JobStatus::Failed => {
                return Err(ForgeError::Validation(format!(
                    "job already {}, nothing to cancel",
                    record.status.as_str()
                )))
            }
            _ => {}
        }

        // A live runner owns the record; signal it and wait for its one
        // status write. A runner that exits without ever observing the
        // token (parked at a gate in the same instant) leaves the record
        // live, in which case the cancel finalizes here after all.
        let live = self.inner.cancels.read().await.get(&job_id).cloned();
        if let Some(token) = live {
            token.cancel();
            tracing::info!(job_id = %job_id, "cancel signalled to runner");
            self.wait_idle(job_id).await;
            let record = self.inner.jobs.get(job_id)?;
            if record.status.is_terminal() {
                return Ok(record);
            }
            return self.finalize_cancel(record, "cancelled by user");
        }

        // No runner (pending, awaiting approval, or failed): finalize here.
        self.finalize_cancel(record, "cancelled by user")
    }

    /// Retry a failed job from the stage that broke. A failure that kept
    /// its charge (poll timeout) retries without a new debit.
    pub async fn retry(&self, job_id: Uuid, user_id: Uuid) -> Result<JobRecord> {
        let mut record = self.owned_job(job_id, user_id)?;
        if record.status != JobStatus::Failed {
            return Err(ForgeError::Validation(format!(
                "only failed jobs can be retried, job is {}",
                record.status.as_str()
            )));
        }

        record.cancel_requested = false;
        record.stuck_flagged_at = None;
        if let Some(detail) = record.error_detail.as_mut() {
            detail.dismissed = true;
        }
        self.inner.jobs.update(&mut record)?;
        tracing::info!(
            job_id = %job_id,
            stage_index = record.stage_index,
            free_retry = record.free_retry,
            "retrying failed job"
        );

        self.spawn_runner(job_id).await;
        Ok(record)
    }

    /// Hide a job's error from the default view. The detail itself is
    /// never deleted.
    pub fn dismiss_error(&self, job_id: Uuid, user_id: Uuid) -> Result<JobRecord> {
        let mut record = self.owned_job(job_id, user_id)?;
        if let Some(detail) = record.error_detail.as_mut() {
            detail.dismissed = true;
            self.inner.jobs.update(&mut record)?;
        }
        Ok(record)
    }

    pub fn job(&self, job_id: Uuid, user_id: Uuid) -> Result<JobRecord> {
        self.owned_job(job_id, user_id)
    }

    pub fn list_jobs(&self, user_id: Uuid) -> Result<Vec<JobRecord>> {
        self.inner.jobs.list_for_user(user_id)
    }

    /// Query the provider directly for a job stuck in a transient state
    /// and reconcile the record with the answer. Used by the watchdog and
    /// exposed for operators.
    pub async fn resync(&self, job_id: Uuid) -> Result<JobRecord> {
        runner::resync(Arc::clone(&self.inner), job_id).await
    }

    /// Jobs store handle for the watchdog scan.
    pub(crate) fn jobs(&self) -> &JobStore {
        &self.inner.jobs
    }

    fn owned_job(&self, job_id: Uuid, user_id: Uuid) -> Result<JobRecord> {
        let record = self.inner.jobs.get(job_id)?;
        // Ownership misses look identical to missing jobs.
        if record.user_id() != user_id {
            return Err(ForgeError::NotFound(job_id));
        }
        Ok(record)
    }

    fn stage_price(&self, stage: &StageSpec, record: &JobRecord) -> Result<i64> {
        let model = self.inner.catalog.model(&stage.model_reference)?;
        let params = runner::stage_params(stage.stage, record);
        Ok(price(model.base_cost, &model.cost_table, &params))
    }

    async fn debit_with_retry(
        &self,
        user_id: Uuid,
        amount: i64,
        stage: &StageSpec,
        job_id: Uuid,
    ) -> Result<()> {
        let reason = format!("stage {}", stage.stage.step_name());
        let mut last = ForgeError::Conflict;
        for attempt in 0..SUBMIT_CONFLICT_RETRIES {
            match self.inner.ledger.debit(user_id, amount, &reason, Some(job_id)) {
                Ok(()) => return Ok(()),
                Err(ForgeError::Conflict) => {
                    tracing::debug!(user_id = %user_id, attempt, "debit conflict, retrying");
                    last = ForgeError::Conflict;
                    // Jitter so racing submissions do not re-collide in step.
                    let backoff = {
                        use rand::Rng;
                        rand::thread_rng().gen_range(2..20)
                    };
                    tokio::time::sleep(std::time::Duration::from_millis(backoff)).await;
                }
                Err(e) => return Err(e),
            }
        }
        Err(last)
    }

    /// Cancel/reject finalization: refund undelivered stage charges and
    /// park the record in `cancelled` as one logical step.
    fn finalize_cancel(&self, mut record: JobRecord, reason: &str) -> Result<JobRecord> {
        let pipeline = self.pipeline_stages(&record)?;
        let refund = record.take_unearned(&pipeline);
        record.transition_to(JobStatus::Cancelled)?;
        self.inner.jobs.update(&mut record)?;
        self.inner
            .ledger
            .audit()
            .event(record.user_id(), record.id, "job_cancelled", Some(reason));
        if refund > 0 {
            self.inner
                .ledger
                .refund(record.user_id(), refund, reason, Some(record.id));
        }
        tracing::info!(job_id = %record.id, refund, reason, "job cancelled");
        Ok(record)
    }

    fn pipeline_stages(&self, record: &JobRecord) -> Result<Vec<Stage>> {
        Ok(self
            .inner
            .catalog
            .model(&record.request.model_reference)?
            .stages()
            .into_iter()
            .map(|s| s.stage)
            .collect())
    }

    async fn spawn_runner(&self, job_id: Uuid) {
        runner::spawn(Arc::clone(&self.inner), job_id).await;
    }

    /// Wait until no runner task is registered for `job_id`.
    pub async fn wait_idle(&self, job_id: Uuid) {
        loop {
            if !self.inner.cancels.read().await.contains_key(&job_id) {
                return;
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
    }
}
