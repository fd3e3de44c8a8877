//! Job records and the generation state machine.
//!
//! A job is one user-initiated generation request and its full lifecycle
//! record. Records are owned by the orchestrator and mutated only through
//! `transition_to`, which validates every move against the declared
//! transition table. Writes are version-guarded in the store so a stale
//! `completed` can never overwrite a later `cancelled`.

mod store;

pub use store::JobStore;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::artifact::ArtifactRef;
use crate::error::{ErrorDetail, ForgeError, Result};
use crate::schema::ParamMap;

/// One provider-calling phase within a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Script,
    Voice,
    Asset,
    Assembly,
}

impl Stage {
    /// Status the job holds while this stage runs.
    pub fn running_status(&self) -> JobStatus {
        match self {
            Self::Script => JobStatus::GeneratingScript,
            Self::Voice => JobStatus::GeneratingVoice,
            Self::Asset => JobStatus::FetchingAsset,
            Self::Assembly => JobStatus::Assembling,
        }
    }

    /// Approval gate entered after this stage delivers, if any.
    pub fn approval_status(&self) -> Option<JobStatus> {
        match self {
            Self::Script => Some(JobStatus::AwaitingScriptApproval),
            Self::Voice => Some(JobStatus::AwaitingVoiceApproval),
            Self::Asset | Self::Assembly => None,
        }
    }

    pub fn step_name(&self) -> &'static str {
        match self {
            Self::Script => "script",
            Self::Voice => "voice",
            Self::Asset => "asset",
            Self::Assembly => "assembly",
        }
    }
}

/// Legal job statuses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    GeneratingScript,
    AwaitingScriptApproval,
    GeneratingVoice,
    AwaitingVoiceApproval,
    FetchingAsset,
    Assembling,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::GeneratingScript => "generating_script",
            Self::AwaitingScriptApproval => "awaiting_script_approval",
            Self::GeneratingVoice => "generating_voice",
            Self::AwaitingVoiceApproval => "awaiting_voice_approval",
            Self::FetchingAsset => "fetching_asset",
            Self::Assembling => "assembling",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    pub fn is_awaiting_approval(&self) -> bool {
        matches!(self, Self::AwaitingScriptApproval | Self::AwaitingVoiceApproval)
    }

    /// States the watchdog monitors for stuck jobs.
    pub fn is_watched(&self) -> bool {
        matches!(self, Self::FetchingAsset | Self::Assembling)
    }

    /// Statuses a `running` stage may legally occupy.
    fn is_running(&self) -> bool {
        matches!(
            self,
            Self::GeneratingScript | Self::GeneratingVoice | Self::FetchingAsset | Self::Assembling
        )
    }
}

/// The declared transition table. Everything not listed here is illegal.
pub fn can_transition(from: JobStatus, to: JobStatus) -> bool {
    use JobStatus::*;

    // failed/cancelled are reachable from any non-terminal state.
    if !from.is_terminal() && matches!(to, Failed | Cancelled) {
        return true;
    }

    match (from, to) {
        (Pending, GeneratingScript) | (Pending, FetchingAsset) => true,
        (GeneratingScript, AwaitingScriptApproval) => true,
        (AwaitingScriptApproval, GeneratingVoice) => true,
        (GeneratingVoice, AwaitingVoiceApproval) => true,
        (AwaitingVoiceApproval, FetchingAsset) => true,
        (FetchingAsset, Assembling) | (FetchingAsset, Completed) => true,
        (Assembling, Completed) => true,
        // retry re-enters the failed stage.
        (Failed, to) if to.is_running() => true,
        _ => false,
    }
}

/// Immutable record of what the caller asked for.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationRequest {
    pub id: Uuid,
    pub user_id: Uuid,
    pub model_reference: String,
    pub prompt: String,
    pub parameters: ParamMap,
    pub content_type: String,
}

/// References to per-stage outputs. A stage's cost is earned only once
/// its entry here is populated.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ArtifactRefs {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub script: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub voice_artifact: Option<ArtifactRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub video_artifact: Option<ArtifactRef>,
}

/// Remote task handle for an async-poll provider invocation, persisted so
/// a forced resync can query the provider directly.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PendingHandle {
    pub provider_id: String,
    pub task_id: String,
}

/// Durable state of one generation job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRecord {
    pub id: Uuid,
    pub request: GenerationRequest,
    pub status: JobStatus,
    /// Index into the model's pipeline of the stage currently running or
    /// about to run.
    pub stage_index: usize,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Bumped on every store write; guards against stale writers.
    pub version: i64,
    /// Total credits charged so far.
    pub cost_charged: i64,
    /// Per-stage charges, indexed like the pipeline.
    pub stage_charges: Vec<i64>,
    pub artifact_refs: ArtifactRefs,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pending_handle: Option<PendingHandle>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_detail: Option<ErrorDetail>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stuck_flagged_at: Option<DateTime<Utc>>,
    /// Next retry skips its debit (compensating retry after a timeout).
    #[serde(default)]
    pub free_retry: bool,
    #[serde(default)]
    pub cancel_requested: bool,
}

impl JobRecord {
    pub fn new(request: GenerationRequest, stage_count: usize) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            request,
            status: JobStatus::Pending,
            stage_index: 0,
            created_at: now,
            updated_at: now,
            version: 0,
            cost_charged: 0,
            stage_charges: vec![0; stage_count],
            artifact_refs: ArtifactRefs::default(),
            pending_handle: None,
            error_detail: None,
            stuck_flagged_at: None,
            free_retry: false,
            cancel_requested: false,
        }
    }

    pub fn user_id(&self) -> Uuid {
        self.request.user_id
    }

    /// Move to `to`, enforcing the transition table.
    pub fn transition_to(&mut self, to: JobStatus) -> Result<()> {
        if !can_transition(self.status, to) {
            return Err(ForgeError::Internal(format!(
                "illegal transition {} -> {}",
                self.status.as_str(),
                to.as_str()
            )));
        }
        tracing::debug!(job_id = %self.id, from = self.status.as_str(), to = to.as_str(), "transition");
        self.status = to;
        self.updated_at = Utc::now();
        Ok(())
    }

    /// Whether the given stage has delivered its artifact.
    pub fn stage_earned(&self, stage: Stage) -> bool {
        match stage {
            Stage::Script => self.artifact_refs.script.is_some(),
            Stage::Voice => self.artifact_refs.voice_artifact.is_some(),
            Stage::Asset | Stage::Assembly => self.artifact_refs.video_artifact.is_some(),
        }
    }

    /// Credits charged for stages that have not delivered - the amount a
    /// cancel or failure refunds.
    pub fn unearned_charge(&self, pipeline: &[Stage]) -> i64 {
        pipeline
            .iter()
            .zip(&self.stage_charges)
            .filter(|(stage, _)| !self.stage_earned(**stage))
            .map(|(_, charge)| *charge)
            .sum()
    }

    /// Zero out the charges for undelivered stages and return the total,
    /// i.e. the amount a cancel or failure refunds. Zeroing keeps a later
    /// cancel or retry from refunding or skipping the same charge twice.
    pub fn take_unearned(&mut self, pipeline: &[Stage]) -> i64 {
        let mut total = 0;
        for (idx, stage) in pipeline.iter().enumerate() {
            if !self.stage_earned(*stage) {
                if let Some(slot) = self.stage_charges.get_mut(idx) {
                    total += *slot;
                    *slot = 0;
                }
            }
        }
        self.cost_charged -= total;
        total
    }

    pub fn record_stage_charge(&mut self, stage_index: usize, amount: i64) {
        if let Some(slot) = self.stage_charges.get_mut(stage_index) {
            *slot += amount;
        }
        self.cost_charged += amount;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request() -> GenerationRequest {
        GenerationRequest {
            id: Uuid::new_v4(),
            user_id: Uuid::new_v4(),
            model_reference: "video-narrated".into(),
            prompt: "a lighthouse at dusk".into(),
            parameters: ParamMap::new(),
            content_type: "video".into(),
        }
    }

    #[test]
    fn happy_path_transitions_are_legal() {
        use JobStatus::*;
        let path = [
            Pending,
            GeneratingScript,
            AwaitingScriptApproval,
            GeneratingVoice,
            AwaitingVoiceApproval,
            FetchingAsset,
            Assembling,
            Completed,
        ];
        for pair in path.windows(2) {
            assert!(can_transition(pair[0], pair[1]), "{:?} -> {:?}", pair[0], pair[1]);
        }
    }

    #[test]
    fn cancel_is_legal_from_every_non_terminal_state() {
        use JobStatus::*;
        for from in [
            Pending,
            GeneratingScript,
            AwaitingScriptApproval,
            GeneratingVoice,
            AwaitingVoiceApproval,
            FetchingAsset,
            Assembling,
        ] {
            assert!(can_transition(from, Cancelled));
            assert!(can_transition(from, Failed));
        }
    }

    #[test]
    fn terminal_states_admit_nothing_but_retry() {
        use JobStatus::*;
        assert!(!can_transition(Completed, Pending));
        assert!(!can_transition(Completed, Cancelled));
        assert!(!can_transition(Cancelled, FetchingAsset));
        // retry from failed re-enters a running state only.
        assert!(can_transition(Failed, Assembling));
        assert!(!can_transition(Failed, Completed));
        assert!(!can_transition(Failed, AwaitingScriptApproval));
    }

    #[test]
    fn skipping_an_approval_gate_is_illegal() {
        use JobStatus::*;
        assert!(!can_transition(GeneratingScript, GeneratingVoice));
        assert!(!can_transition(GeneratingVoice, FetchingAsset));
    }

    #[test]
    fn transition_to_rejects_illegal_moves() {
        let mut record = JobRecord::new(request(), 4);
        record.transition_to(JobStatus::GeneratingScript).unwrap();
        let err = record.transition_to(JobStatus::Completed).unwrap_err();
        assert_eq!(err.kind(), "internal");
        assert_eq!(record.status, JobStatus::GeneratingScript);
    }

    #[test]
    fn unearned_charge_counts_only_undelivered_stages() {
        let pipeline = [Stage::Script, Stage::Voice, Stage::Asset, Stage::Assembly];
        let mut record = JobRecord::new(request(), pipeline.len());
        record.record_stage_charge(0, 4);
        record.record_stage_charge(1, 6);
        record.artifact_refs.script = Some("the script".into());

        assert_eq!(record.cost_charged, 10);
        // script delivered, voice not: only the voice charge is refundable.
        assert_eq!(record.unearned_charge(&pipeline), 6);
    }
}
