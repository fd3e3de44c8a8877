//! Scriptable in-memory provider, used by the test suite and local
//! development runs. Behaviors are consumed in submission order; with an
//! empty script every call succeeds immediately with a canned artifact.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use uuid::Uuid;

use super::{GenerationProvider, Invocation, Payload, PollOutcome, ProviderArtifact, ProviderCall};
use crate::error::{ForgeError, Result};
use crate::job::{PendingHandle, Stage};

#[derive(Debug, Clone)]
pub enum Behavior {
    /// Sync success with the canned artifact for the stage.
    Succeed,
    /// Sync failure from the submit call itself.
    FailSubmit { message: String },
    /// Async task that reports in-progress `polls` times, then ready.
    PendingThenReady { polls: u32 },
    /// Async task that reports in-progress once, then a terminal failure.
    PendingThenFailed { message: String },
    /// Async task that never leaves in-progress.
    NeverFinishes,
}

enum TaskState {
    InProgress { remaining: u32, stage: Stage },
    WillFail { message: String },
    Stuck,
    /// Ready immediately on the next poll (watchdog resync path).
    Ready { stage: Stage },
}

pub struct MockProvider {
    id: String,
    behaviors: Mutex<VecDeque<Behavior>>,
    tasks: Mutex<HashMap<String, TaskState>>,
    submits: AtomicU32,
    polls: AtomicU32,
}

impl MockProvider {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            behaviors: Mutex::new(VecDeque::new()),
            tasks: Mutex::new(HashMap::new()),
            submits: AtomicU32::new(0),
            polls: AtomicU32::new(0),
        }
    }

    /// Queue the behavior for the next submit call.
    pub fn push(&self, behavior: Behavior) {
        self.behaviors.lock().unwrap().push_back(behavior);
    }

    /// Mark an existing task as finished out-of-band, as a provider that
    /// completed while nobody was polling would look.
    pub fn finish_task(&self, task_id: &str, stage: Stage) {
        self.tasks
            .lock()
            .unwrap()
            .insert(task_id.to_string(), TaskState::Ready { stage });
    }

    pub fn submit_count(&self) -> u32 {
        self.submits.load(Ordering::SeqCst)
    }

    pub fn poll_count(&self) -> u32 {
        self.polls.load(Ordering::SeqCst)
    }

    fn artifact_for(stage: Stage) -> ProviderArtifact {
        match stage {
            Stage::Script => ProviderArtifact::text("INT. LIGHTHOUSE - DUSK. Waves crash below."),
            Stage::Voice => ProviderArtifact {
                payload: Payload::Bytes(b"mock-voice-bytes".as_ref().into()),
                content_type: "audio/mpeg".into(),
                seed: None,
                width: None,
                height: None,
                provider_cost: Some(0.004),
            },
            Stage::Asset | Stage::Assembly => ProviderArtifact {
                payload: Payload::Bytes(b"mock-video-bytes".as_ref().into()),
                content_type: "video/mp4".into(),
                seed: Some(42),
                width: Some(1280),
                height: Some(720),
                provider_cost: Some(0.12),
            },
        }
    }
}

#[async_trait]
impl GenerationProvider for MockProvider {
    fn provider_id(&self) -> &str {
        &self.id
    }

    async fn submit(&self, call: &ProviderCall) -> Result<Invocation> {
        self.submits.fetch_add(1, Ordering::SeqCst);
        let behavior = self
            .behaviors
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(Behavior::Succeed);

        match behavior {
            Behavior::Succeed => Ok(Invocation::Completed(Self::artifact_for(call.stage))),
            Behavior::FailSubmit { message } => Err(ForgeError::Provider {
                step: call.stage.step_name().to_string(),
                message,
            }),
            Behavior::PendingThenReady { polls } => {
                let task_id = Uuid::new_v4().to_string();
                self.tasks.lock().unwrap().insert(
                    task_id.clone(),
                    TaskState::InProgress {
                        remaining: polls,
                        stage: call.stage,
                    },
                );
                Ok(Invocation::Pending(PendingHandle {
                    provider_id: self.id.clone(),
                    task_id,
                }))
            }
            Behavior::PendingThenFailed { message } => {
                let task_id = Uuid::new_v4().to_string();
                self.tasks
                    .lock()
                    .unwrap()
                    .insert(task_id.clone(), TaskState::WillFail { message });
                Ok(Invocation::Pending(PendingHandle {
                    provider_id: self.id.clone(),
                    task_id,
                }))
            }
            Behavior::NeverFinishes => {
                let task_id = Uuid::new_v4().to_string();
                self.tasks
                    .lock()
                    .unwrap()
                    .insert(task_id.clone(), TaskState::Stuck);
                Ok(Invocation::Pending(PendingHandle {
                    provider_id: self.id.clone(),
                    task_id,
                }))
            }
        }
    }

    async fn poll(&self, handle: &PendingHandle) -> Result<PollOutcome> {
        self.polls.fetch_add(1, Ordering::SeqCst);
        let mut tasks = self.tasks.lock().unwrap();
        let state = tasks
            .get_mut(&handle.task_id)
            .ok_or_else(|| ForgeError::Provider {
                step: "poll".into(),
                message: format!("unknown task {}", handle.task_id),
            })?;

        match state {
            TaskState::Stuck => Ok(PollOutcome::InProgress),
            TaskState::WillFail { message } => Ok(PollOutcome::Failed(message.clone())),
            TaskState::Ready { stage } => Ok(PollOutcome::Ready(Self::artifact_for(*stage))),
            TaskState::InProgress { remaining, stage } => {
                if *remaining == 0 {
                    Ok(PollOutcome::Ready(Self::artifact_for(*stage)))
                } else {
                    *remaining -= 1;
                    Ok(PollOutcome::InProgress)
                }
            }
        }
    }
}
