//! Per-job pipeline runner.
//!
//! One spawned task drives one job through its stages: charge on entry,
//! invoke the provider (with the bounded poll loop for async backends),
//! persist the artifact, then either park at an approval gate or move on.
//! The runner is the only writer of a live job's record; cancels arrive
//! through the token, and any external write (watchdog resync) shows up
//! as a version conflict, at which point the runner backs off.

use std::sync::Arc;

use serde_json::Value;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::Inner;
use crate::artifact::ArtifactRef;
use crate::error::{ErrorDetail, ForgeError, Result};
use crate::job::{JobRecord, JobStatus, Stage};
use crate::pricing::price;
use crate::provider::{
    poll_until_ready, Invocation, Payload, ProviderArtifact, ProviderCall, UploadTarget,
};
use crate::schema::ParamMap;

/// Register a cancellation token and start a runner task for `job_id`.
pub(super) async fn spawn(inner: Arc<Inner>, job_id: Uuid) {
    let token = CancellationToken::new();
    inner.cancels.write().await.insert(job_id, token.clone());
    let task_inner = Arc::clone(&inner);
    tokio::spawn(async move {
        run_pipeline(task_inner, job_id, token).await;
    });
}

pub(super) async fn run_pipeline(inner: Arc<Inner>, job_id: Uuid, token: CancellationToken) {
    let outcome = drive(&inner, job_id, &token).await;
    inner.cancels.write().await.remove(&job_id);
    match outcome {
        Ok(()) => {}
        Err(ForgeError::Conflict) => {
            // Someone else advanced the record (resync, typically); their
            // write wins and this runner has nothing left to do.
            tracing::info!(job_id = %job_id, "runner yielded to an external write");
        }
        Err(e) => {
            tracing::error!(job_id = %job_id, error = %e, "runner aborted");
        }
    }
}

async fn drive(inner: &Arc<Inner>, job_id: Uuid, token: &CancellationToken) -> Result<()> {
    let mut record = inner.jobs.get(job_id)?;
    let model = inner.catalog.model(&record.request.model_reference)?.clone();
    let specs = model.stages();
    let pipeline: Vec<Stage> = specs.iter().map(|s| s.stage).collect();

    while record.stage_index < specs.len() {
        let spec = &specs[record.stage_index];

        if token.is_cancelled() {
            return finalize_cancel(inner, record, &pipeline);
        }

        // Approval already moved the record into the running state; fresh
        // and retried stages transition here.
        if record.status != spec.stage.running_status() {
            record.transition_to(spec.stage.running_status())?;
        }
        save(inner, &mut record)?;

        // Charge on stage entry. A timeout retry rides on the charge it
        // already paid; everything else pays exactly once per stage.
        if record.free_retry {
            record.free_retry = false;
        } else if record.stage_charges[record.stage_index] == 0 {
            let stage_model = inner.catalog.model(&spec.model_reference)?;
            let cost = price(
                stage_model.base_cost,
                &stage_model.cost_table,
                &stage_params(spec.stage, &record),
            );
            if cost > 0 {
                let reason = format!("stage {}", spec.stage.step_name());
                if let Err(e) = inner
                    .ledger
                    .debit(record.user_id(), cost, &reason, Some(job_id))
                {
                    return fail_job(inner, record, e, spec.stage, &pipeline);
                }
                record.record_stage_charge(record.stage_index, cost);
            }
        }
        save(inner, &mut record)?;

        match invoke_stage(inner, spec.stage, &spec.model_reference, &mut record, token).await {
            Ok(artifact) => {
                if let Err(e) = apply_artifact(inner, &mut record, spec.stage, artifact).await {
                    return fail_job(inner, record, e, spec.stage, &pipeline);
                }
                if let Some(gate) = spec.stage.approval_status() {
                    record.transition_to(gate)?;
                    save(inner, &mut record)?;
                    tracing::info!(
                        job_id = %job_id,
                        gate = record.status.as_str(),
                        "parked at approval gate"
                    );
                    return Ok(());
                }
                record.stage_index += 1;
                save(inner, &mut record)?;
            }
            Err(ForgeError::Cancelled) => return finalize_cancel(inner, record, &pipeline),
            Err(e) => return fail_job(inner, record, e, spec.stage, &pipeline),
        }
    }

    record.transition_to(JobStatus::Completed)?;
    record.pending_handle = None;
    record.stuck_flagged_at = None;
    record.error_detail = None;
    save(inner, &mut record)?;
    inner
        .ledger
        .audit()
        .event(record.user_id(), record.id, "job_completed", None);
    tracing::info!(
        job_id = %job_id,
        cost_charged = record.cost_charged,
        "job completed"
    );
    Ok(())
}

/// Invoke the provider for one stage, polling to completion for async
/// backends. The pending handle is persisted before the first poll so a
/// crashed process can still resync the task later.
async fn invoke_stage(
    inner: &Arc<Inner>,
    stage: Stage,
    model_reference: &str,
    record: &mut JobRecord,
    token: &CancellationToken,
) -> Result<ProviderArtifact> {
    let stage_model = inner.catalog.model(model_reference)?;
    let provider = inner.providers.get(&stage_model.provider_id)?;

    // Media stages get a direct-upload destination; the script stage's
    // output is small text and always travels inline.
    let upload = if stage == Stage::Script {
        None
    } else {
        let content_type = match stage_model.content_type.as_str() {
            "image" => "image/png",
            "video" => "video/mp4",
            "voice" => "audio/mpeg",
            _ => "application/octet-stream",
        };
        match inner.artifacts.presigned_destination(content_type).await {
            Ok((storage_path, upload_url)) => Some(UploadTarget {
                storage_path,
                upload_url,
            }),
            Err(e) => {
                tracing::debug!(job_id = %record.id, error = %e, "no upload destination, falling back to inline bytes");
                None
            }
        }
    };

    let call = ProviderCall {
        job_id: record.id,
        model_reference: model_reference.to_string(),
        stage,
        prompt: record.request.prompt.clone(),
        parameters: stage_params(stage, record),
        script: record.artifact_refs.script.clone(),
        upload,
    };

    let invocation = tokio::select! {
        _ = token.cancelled() => return Err(ForgeError::Cancelled),
        result = provider.submit(&call) => result?,
    };

    match invocation {
        Invocation::Completed(artifact) => Ok(artifact),
        Invocation::Pending(handle) => {
            record.pending_handle = Some(handle.clone());
            save(inner, record)?;
            poll_until_ready(
                provider.as_ref(),
                &handle,
                &inner.poll,
                token,
                stage.step_name(),
            )
            .await
        }
    }
}

/// Stage-scoped pricing and invocation parameters. The voice stage sees
/// the (possibly edited) script length, so edits at the approval gate
/// reprice naturally.
pub(super) fn stage_params(stage: Stage, record: &JobRecord) -> ParamMap {
    let mut params = record.request.parameters.clone();
    if stage == Stage::Voice {
        let chars = record
            .artifact_refs
            .script
            .as_deref()
            .map(|s| s.chars().count())
            .unwrap_or(0);
        params.insert(
            "script_chars".to_string(),
            Value::Number((chars as u64).into()),
        );
    }
    params
}

/// Record a delivered artifact on the job. Storage failures here are the
/// one place a charge is kept without an artifact URL: the provider did
/// its work and an operator recovers the payload by hand.
async fn apply_artifact(
    inner: &Arc<Inner>,
    record: &mut JobRecord,
    stage: Stage,
    artifact: ProviderArtifact,
) -> Result<()> {
    match (stage, artifact.payload) {
        (Stage::Script, Payload::Text(text)) => {
            record.artifact_refs.script = Some(text);
        }
        (Stage::Script, _) => {
            return Err(ForgeError::Provider {
                step: stage.step_name().to_string(),
                message: "script stage must deliver text".into(),
            })
        }
        (_, Payload::Text(_)) => {
            return Err(ForgeError::Provider {
                step: stage.step_name().to_string(),
                message: "media stage delivered text".into(),
            })
        }
        (_, Payload::Bytes(bytes)) => {
            let storage_path = inner.artifacts.persist(&bytes, &artifact.content_type).await?;
            let sha256 = {
                use sha2::{Digest, Sha256};
                Some(hex::encode(Sha256::digest(&bytes)))
            };
            let reference = ArtifactRef {
                url: inner.artifacts.public_url(&storage_path),
                storage_path,
                content_type: artifact.content_type,
                sha256,
                seed: artifact.seed,
                width: artifact.width,
                height: artifact.height,
                provider_cost: artifact.provider_cost,
            };
            assign_media(record, stage, reference);
        }
        (_, Payload::Stored(storage_path)) => {
            let reference = ArtifactRef {
                url: inner.artifacts.public_url(&storage_path),
                storage_path,
                content_type: artifact.content_type,
                sha256: None,
                seed: artifact.seed,
                width: artifact.width,
                height: artifact.height,
                provider_cost: artifact.provider_cost,
            };
            assign_media(record, stage, reference);
        }
    }
    record.pending_handle = None;
    record.stuck_flagged_at = None;
    Ok(())
}

fn assign_media(record: &mut JobRecord, stage: Stage, reference: ArtifactRef) {
    match stage {
        Stage::Voice => record.artifact_refs.voice_artifact = Some(reference),
        Stage::Asset | Stage::Assembly => record.artifact_refs.video_artifact = Some(reference),
        Stage::Script => {}
    }
}

/// Park the job in `failed` with an error detail, refunding undelivered
/// stage charges where the failure mode calls for it.
fn fail_job(
    inner: &Arc<Inner>,
    mut record: JobRecord,
    error: ForgeError,
    stage: Stage,
    pipeline: &[Stage],
) -> Result<()> {
    let detail = match &error {
        ForgeError::Provider { message, .. } => ErrorDetail::new("provider", message.clone()),
        ForgeError::Timeout { .. } => {
            // Not the request's fault: the charge is refunded below and
            // the retry re-runs the stage without a fresh debit. The
            // pending handle stays on the record for operators.
            record.free_retry = true;
            ErrorDetail::new("poll_timeout", error.to_string())
        }
        ForgeError::Storage(message) => {
            ErrorDetail::new("storage", message.clone()).manual_recovery()
        }
        ForgeError::InsufficientFunds { .. } => ErrorDetail::new("billing", error.to_string()),
        other => ErrorDetail::new(stage.step_name(), other.to_string()),
    };

    // Storage failures are the one case where the charge is kept: the
    // provider delivered and an operator recovers the artifact by hand.
    let refund = match &error {
        ForgeError::Storage(_) => 0,
        _ => record.take_unearned(pipeline),
    };

    record.error_detail = Some(detail);
    record.transition_to(JobStatus::Failed)?;
    save(inner, &mut record)?;
    inner.ledger.audit().event(
        record.user_id(),
        record.id,
        "job_failed",
        Some(stage.step_name()),
    );

    if refund > 0 {
        inner.ledger.refund(
            record.user_id(),
            refund,
            &format!("{} failed", stage.step_name()),
            Some(record.id),
        );
    }
    tracing::warn!(
        job_id = %record.id,
        stage = stage.step_name(),
        error = %error,
        refund,
        "job failed"
    );
    Ok(())
}

fn finalize_cancel(inner: &Arc<Inner>, mut record: JobRecord, pipeline: &[Stage]) -> Result<()> {
    record.cancel_requested = true;
    let refund = record.take_unearned(pipeline);
    record.transition_to(JobStatus::Cancelled)?;
    save(inner, &mut record)?;
    inner
        .ledger
        .audit()
        .event(record.user_id(), record.id, "job_cancelled", None);
    if refund > 0 {
        inner
            .ledger
            .refund(record.user_id(), refund, "cancelled by user", Some(record.id));
    }
    tracing::info!(job_id = %record.id, refund, "job cancelled by runner");
    Ok(())
}

fn save(inner: &Arc<Inner>, record: &mut JobRecord) -> Result<()> {
    inner.jobs.update(record)
}

/// Reconcile a stuck job with the provider's view of its pending task.
/// The task may have finished while nobody was polling; in that case the
/// artifact is recorded and the pipeline resumes (or completes) here.
pub(super) async fn resync(inner: Arc<Inner>, job_id: Uuid) -> Result<JobRecord> {
    let mut record = inner.jobs.get(job_id)?;
    if record.status.is_terminal() {
        return Ok(record);
    }
    let Some(handle) = record.pending_handle.clone() else {
        tracing::debug!(job_id = %job_id, "resync: no pending task to query");
        return Ok(record);
    };

    let model = inner.catalog.model(&record.request.model_reference)?.clone();
    let specs = model.stages();
    let pipeline: Vec<Stage> = specs.iter().map(|s| s.stage).collect();
    let stage = specs
        .get(record.stage_index)
        .map(|s| s.stage)
        .ok_or_else(|| ForgeError::Internal(format!("stage index out of range for {job_id}")))?;

    let provider = inner.providers.get(&handle.provider_id)?;
    // A provider that no longer knows the task is a terminal answer, not
    // a transport hiccup.
    let outcome = match provider.poll(&handle).await {
        Ok(outcome) => outcome,
        Err(ForgeError::Provider { message, .. }) => crate::provider::PollOutcome::Failed(message),
        Err(e) => return Err(e),
    };
    match outcome {
        crate::provider::PollOutcome::Ready(artifact) => {
            apply_artifact(&inner, &mut record, stage, artifact).await?;
            if let Some(gate) = stage.approval_status() {
                record.transition_to(gate)?;
                save(&inner, &mut record)?;
                tracing::info!(job_id = %job_id, gate = record.status.as_str(), "resync recovered the task, parked at gate");
                return Ok(record);
            }
            if record.stage_index + 1 < specs.len() {
                record.stage_index += 1;
                save(&inner, &mut record)?;
                tracing::info!(job_id = %job_id, "resync recovered the task, resuming pipeline");
                spawn(Arc::clone(&inner), job_id).await;
            } else {
                record.transition_to(JobStatus::Completed)?;
                save(&inner, &mut record)?;
                tracing::info!(job_id = %job_id, "resync recovered the task, job completed");
            }
            inner.jobs.get(job_id)
        }
        crate::provider::PollOutcome::InProgress => {
            tracing::debug!(job_id = %job_id, task_id = %handle.task_id, "resync: still in progress");
            Ok(record)
        }
        crate::provider::PollOutcome::Failed(message) => {
            let error = ForgeError::Provider {
                step: stage.step_name().to_string(),
                message,
            };
            fail_job(&inner, record, error, stage, &pipeline)?;
            inner.jobs.get(job_id)
        }
    }
}
