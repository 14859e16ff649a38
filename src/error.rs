use thiserror::Error;

/// Errors raised across the delivery pipeline.
///
/// The variant decides how the orchestrator reacts: `Remote` and
/// `Delivery` failures land in the retry ledger, `State` failures are
/// skipped without touching the ledger, `Configuration` and
/// `Authentication` abort the affected delivery without touching any
/// state.
#[derive(Debug, Error)]
pub enum Error {
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("git error: {0}")]
    Git(String),

    #[error("public-inbox error: {0}")]
    PublicInbox(String),

    #[error("state error: {0}")]
    State(String),

    #[error("remote error: {0}")]
    Remote(String),

    #[error("authentication required for target '{target_id}': {reason}")]
    Authentication { target_id: String, reason: String },

    #[error("delivery error: {0}")]
    Delivery(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// True for failures that should be recorded in the failed ledger
    /// and retried on subsequent pulls.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::Remote(_) | Error::Delivery(_) | Error::Io(_)
        )
    }

    /// True for failures that must abort the delivery without marking
    /// the commit as failed.
    pub fn is_fatal_for_delivery(&self) -> bool {
        matches!(
            self,
            Error::Configuration(_) | Error::Authentication { .. }
        )
    }
}

impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Self {
        Error::Remote(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
