//! Error types shared across the workspace.

use thiserror::Error;

/// Errors raised by the dispatch engine and its collaborators.
///
/// Recipient-level channel failures are not represented here: they are
/// values ([`crate::types::Outcome`]) and never escape the dispatcher.
#[derive(Debug, Error)]
pub enum UnveilError {
    #[error("Config error: {0}")]
    Config(String),

    #[error("Storage error: {0}")]
    Storage(String),

    /// The audience query itself failed (store unavailable, bad filter).
    #[error("Audience resolution failed: {0}")]
    Resolution(String),

    /// The message row could not be created or linked to its job.
    #[error("Message materialization failed: {0}")]
    Materialization(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, UnveilError>;

impl UnveilError {
    /// Whether this error aborts a job before any delivery attempt.
    pub fn is_job_level(&self) -> bool {
        matches!(self, Self::Resolution(_) | Self::Materialization(_))
    }
}
