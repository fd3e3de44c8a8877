//! Crate-wide error taxonomy.
//!
//! Pre-charge failures (`Validation`, `InsufficientFunds`, `RateLimited`,
//! `ModelUnavailable`, `Conflict`) are returned synchronously from `submit`
//! and never leave a job record behind. Post-charge failures (`Provider`,
//! `Timeout`, `Storage`) are recorded on the job record and surfaced through
//! status queries.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Maximum length of a user-visible error message. Provider payloads are
/// truncated to this before they reach any caller.
pub const MAX_USER_MESSAGE_LEN: usize = 240;

#[derive(Debug, thiserror::Error)]
pub enum ForgeError {
    #[error("invalid parameters: {0}")]
    Validation(String),

    #[error("insufficient funds: need {required} credits, have {available}")]
    InsufficientFunds { required: i64, available: i64 },

    #[error("rate limit reached: {cap} generations per rolling hour")]
    RateLimited { cap: u32 },

    #[error("model not available: {0}")]
    ModelUnavailable(String),

    #[error("provider error during {step}: {message}")]
    Provider { step: String, message: String },

    #[error("provider did not finish within the poll budget ({attempts} attempts)")]
    Timeout { step: String, attempts: u32 },

    #[error("artifact storage failed: {0}")]
    Storage(String),

    #[error("concurrent update conflict, retry the submission")]
    Conflict,

    #[error("job not found: {0}")]
    NotFound(Uuid),

    #[error("cancelled")]
    Cancelled,

    #[error("internal error: {0}")]
    Internal(String),
}

impl ForgeError {
    /// Stable machine-readable kind, used by the HTTP surface.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Validation(_) => "invalid_parameters",
            Self::InsufficientFunds { .. } => "insufficient_funds",
            Self::RateLimited { .. } => "rate_limited",
            Self::ModelUnavailable(_) => "model_unavailable",
            Self::Provider { .. } => "provider_error",
            Self::Timeout { .. } => "timeout",
            Self::Storage(_) => "storage_error",
            Self::Conflict => "conflict",
            Self::NotFound(_) => "not_found",
            Self::Cancelled => "cancelled",
            Self::Internal(_) => "internal",
        }
    }

    /// Length-capped message safe to show to a caller.
    pub fn user_message(&self) -> String {
        truncate_message(&self.to_string())
    }
}

impl From<rusqlite::Error> for ForgeError {
    fn from(e: rusqlite::Error) -> Self {
        Self::Internal(format!("storage backend: {e}"))
    }
}

pub type Result<T> = std::result::Result<T, ForgeError>;

/// Error detail attached to a failed job record.
///
/// `step` distinguishes where the stage broke: `"provider"` for a
/// provider-reported error, `"poll_timeout"` for poll-budget exhaustion,
/// `"storage"` for an artifact lost after a successful provider call.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ErrorDetail {
    pub message: String,
    pub step: String,
    pub at: chrono::DateTime<chrono::Utc>,
    /// Set when the provider delivered value but the artifact could not be
    /// persisted; the charge is kept and an operator recovers the artifact.
    #[serde(default)]
    pub manual_recovery: bool,
    /// Hidden from the default view after `dismiss_error`; never deleted.
    #[serde(default)]
    pub dismissed: bool,
}

impl ErrorDetail {
    pub fn new(step: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            message: truncate_message(&message.into()),
            step: step.into(),
            at: chrono::Utc::now(),
            manual_recovery: false,
            dismissed: false,
        }
    }

    pub fn manual_recovery(mut self) -> Self {
        self.manual_recovery = true;
        self
    }
}

pub fn truncate_message(msg: &str) -> String {
    if msg.len() <= MAX_USER_MESSAGE_LEN {
        return msg.to_string();
    }
    let mut end = MAX_USER_MESSAGE_LEN;
    while !msg.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}…", &msg[..end])
}
