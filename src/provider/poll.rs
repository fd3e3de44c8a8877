//! Bounded poll loop for async providers.
//!
//! Delays grow geometrically up to a cap; the attempt budget is fixed.
//! Exhausting the budget is a hard timeout so a charge never dangles
//! against a provider that went quiet. The loop is cancellable between
//! attempts, so a user cancel never waits out a full delay.

use tokio_util::sync::CancellationToken;

use super::{GenerationProvider, PollOutcome, ProviderArtifact};
use crate::config::PollConfig;
use crate::error::{ForgeError, Result};
use crate::job::PendingHandle;

/// Drive `handle` to completion or exhaust the poll budget.
pub async fn poll_until_ready(
    provider: &dyn GenerationProvider,
    handle: &PendingHandle,
    poll: &PollConfig,
    cancel: &CancellationToken,
    step: &str,
) -> Result<ProviderArtifact> {
    for attempt in 0..poll.max_attempts {
        let delay = poll.delay_for(attempt);
        tokio::select! {
            _ = cancel.cancelled() => return Err(ForgeError::Cancelled),
            _ = tokio::time::sleep(delay) => {}
        }

        match provider.poll(handle).await {
            Ok(PollOutcome::Ready(artifact)) => {
                tracing::debug!(task_id = %handle.task_id, attempt, "task ready");
                return Ok(artifact);
            }
            Ok(PollOutcome::InProgress) => {
                tracing::trace!(task_id = %handle.task_id, attempt, "still in progress");
            }
            Ok(PollOutcome::Failed(message)) => {
                return Err(ForgeError::Provider {
                    step: step.to_string(),
                    message,
                });
            }
            // Transient transport errors consume the attempt but do not
            // abort the loop; the provider may still be healthy.
            Err(e) => {
                tracing::warn!(task_id = %handle.task_id, attempt, error = %e, "poll attempt errored");
            }
        }
    }

    Err(ForgeError::Timeout {
        step: step.to_string(),
        attempts: poll.max_attempts,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::mock::{Behavior, MockProvider};
    use crate::provider::{Invocation, ProviderCall};
    use crate::job::Stage;
    use crate::schema::ParamMap;
    use uuid::Uuid;

    fn fast_poll() -> PollConfig {
        PollConfig {
            max_attempts: 8,
            first_delay_ms: 1,
            max_delay_ms: 2,
            growth: 1.0,
        }
    }

    fn call() -> ProviderCall {
        ProviderCall {
            job_id: Uuid::new_v4(),
            model_reference: "video-clip".into(),
            stage: Stage::Asset,
            prompt: "surf at dawn".into(),
            parameters: ParamMap::new(),
            script: None,
            upload: None,
        }
    }

    #[tokio::test]
    async fn finishes_when_task_becomes_ready() {
        let provider = MockProvider::new("volta");
        provider.push(Behavior::PendingThenReady { polls: 3 });

        let handle = match provider.submit(&call()).await.unwrap() {
            Invocation::Pending(h) => h,
            _ => panic!("expected pending"),
        };
        let cancel = CancellationToken::new();
        let artifact = poll_until_ready(&provider, &handle, &fast_poll(), &cancel, "asset")
            .await
            .unwrap();
        assert_eq!(artifact.content_type, "video/mp4");
        assert_eq!(provider.poll_count(), 4);
    }

    #[tokio::test]
    async fn exhausting_the_budget_is_a_hard_timeout() {
        let provider = MockProvider::new("volta");
        provider.push(Behavior::NeverFinishes);

        let handle = match provider.submit(&call()).await.unwrap() {
            Invocation::Pending(h) => h,
            _ => panic!("expected pending"),
        };
        let poll = fast_poll();
        let cancel = CancellationToken::new();
        let err = poll_until_ready(&provider, &handle, &poll, &cancel, "asset")
            .await
            .unwrap_err();
        match err {
            ForgeError::Timeout { attempts, ref step } => {
                assert_eq!(attempts, poll.max_attempts);
                assert_eq!(step, "asset");
            }
            other => panic!("expected timeout, got {other}"),
        }
        // Exactly the budget, never more.
        assert_eq!(provider.poll_count(), poll.max_attempts);
    }

    #[tokio::test]
    async fn provider_failure_surfaces_its_message() {
        let provider = MockProvider::new("volta");
        provider.push(Behavior::PendingThenFailed {
            message: "NSFW content rejected".into(),
        });

        let handle = match provider.submit(&call()).await.unwrap() {
            Invocation::Pending(h) => h,
            _ => panic!("expected pending"),
        };
        let cancel = CancellationToken::new();
        let err = poll_until_ready(&provider, &handle, &fast_poll(), &cancel, "asset")
            .await
            .unwrap_err();
        match err {
            ForgeError::Provider { message, .. } => assert!(message.contains("NSFW")),
            other => panic!("expected provider error, got {other}"),
        }
    }

    #[tokio::test]
    async fn cancel_interrupts_between_attempts() {
        let provider = MockProvider::new("volta");
        provider.push(Behavior::NeverFinishes);

        let handle = match provider.submit(&call()).await.unwrap() {
            Invocation::Pending(h) => h,
            _ => panic!("expected pending"),
        };
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = poll_until_ready(&provider, &handle, &fast_poll(), &cancel, "asset")
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "cancelled");
        assert_eq!(provider.poll_count(), 0);
    }
}
