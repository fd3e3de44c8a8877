//! Provider adapters.
//!
//! Every external generation backend sits behind [`GenerationProvider`].
//! Sync providers return the artifact from `submit`; async-poll providers
//! return a [`PendingHandle`] and are driven by the bounded poll loop in
//! [`poll`]. The orchestrator never talks HTTP directly.
//!
//! # Key Concepts
//!
//! - **Invocation**: outcome of a submit call, either a finished artifact
//!   or a remote task handle to poll.
//! - **Registry**: provider id to adapter lookup, built once at startup
//!   from the catalog.

pub mod http;
pub mod mock;
mod poll;

pub use poll::poll_until_ready;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use uuid::Uuid;

use crate::error::{ForgeError, Result};
use crate::job::{PendingHandle, Stage};
use crate::schema::ParamMap;

/// Pre-signed destination a provider may upload to directly, so large
/// payloads never round-trip through orchestrator memory.
#[derive(Debug, Clone)]
pub struct UploadTarget {
    pub storage_path: String,
    pub upload_url: String,
}

/// Everything an adapter needs to invoke one pipeline stage.
#[derive(Debug, Clone)]
pub struct ProviderCall {
    pub job_id: Uuid,
    pub model_reference: String,
    pub stage: Stage,
    pub prompt: String,
    pub parameters: ParamMap,
    /// Approved script text, fed to voice and assembly stages.
    pub script: Option<String>,
    /// Direct-upload destination for providers that support it; they
    /// answer with the storage path instead of inline bytes.
    pub upload: Option<UploadTarget>,
}

/// Raw payload delivered by a provider.
#[derive(Debug, Clone)]
pub enum Payload {
    /// Inline bytes; the orchestrator persists them.
    Bytes(Bytes),
    /// Already uploaded to the pre-signed destination at this path.
    Stored(String),
    /// Plain text output (script stages).
    Text(String),
}

/// One delivered artifact plus the metadata the provider reported.
#[derive(Debug, Clone)]
pub struct ProviderArtifact {
    pub payload: Payload,
    pub content_type: String,
    pub seed: Option<u64>,
    pub width: Option<u32>,
    pub height: Option<u32>,
    /// Provider-side cost in its own units, recorded for margin analysis.
    pub provider_cost: Option<f64>,
}

impl ProviderArtifact {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            payload: Payload::Text(text.into()),
            content_type: "text/plain".into(),
            seed: None,
            width: None,
            height: None,
            provider_cost: None,
        }
    }

    pub fn bytes(bytes: impl Into<Bytes>, content_type: impl Into<String>) -> Self {
        Self {
            payload: Payload::Bytes(bytes.into()),
            content_type: content_type.into(),
            seed: None,
            width: None,
            height: None,
            provider_cost: None,
        }
    }
}

/// Outcome of a submit call.
#[derive(Debug)]
pub enum Invocation {
    Completed(ProviderArtifact),
    Pending(PendingHandle),
}

/// Outcome of one poll attempt against a pending task.
pub enum PollOutcome {
    Ready(ProviderArtifact),
    InProgress,
    /// Provider-reported terminal failure; the message is surfaced (and
    /// truncated) to the user.
    Failed(String),
}

#[async_trait]
pub trait GenerationProvider: Send + Sync {
    fn provider_id(&self) -> &str;

    /// Invoke the backend once. Sync backends block until done; async
    /// backends return a handle.
    async fn submit(&self, call: &ProviderCall) -> Result<Invocation>;

    /// Query a pending task once. Also the forced-resync path: the
    /// watchdog calls this directly with a persisted handle.
    async fn poll(&self, handle: &PendingHandle) -> Result<PollOutcome>;
}

/// Provider id to adapter lookup.
#[derive(Clone, Default)]
pub struct ProviderRegistry {
    providers: HashMap<String, Arc<dyn GenerationProvider>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, provider: Arc<dyn GenerationProvider>) {
        self.providers
            .insert(provider.provider_id().to_string(), provider);
    }

    pub fn get(&self, provider_id: &str) -> Result<Arc<dyn GenerationProvider>> {
        self.providers
            .get(provider_id)
            .cloned()
            .ok_or_else(|| ForgeError::ModelUnavailable(format!("provider {provider_id}")))
    }
}
