use thiserror::Error;

#[derive(Error, Debug)]
pub enum ReplError {
    #[error("Security violation: {0}")]
    SecurityViolation(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("IO error: {0}")]
    IOFailure(#[from] std::io::Error),

    #[error("Rate limit exhausted for {model} after {attempts} attempts")]
    RateExceeded { model: String, attempts: usize },

    #[error("Provider throttled: {0}")]
    Throttled(String),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Transient provider failure: {0}")]
    Transient(String),

    #[error("Provider error: {0}")]
    Provider(String),

    #[error("Malformed decision: {0}")]
    MalformedDecision(String),

    #[error("Trampoline limit reached after {0} iterations")]
    TrampolineLimit(usize),

    #[error("Turn cancelled")]
    Cancelled,

    #[error("Turn timed out after {0}s")]
    Timeout(u64),

    #[error("Fatal configuration error: {0}")]
    FatalConfig(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

impl ReplError {
    /// Errors the rate controller retries with backoff. `Provider` is the
    /// unknown bucket and is retried as well.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ReplError::Throttled(_) | ReplError::Transient(_) | ReplError::Provider(_)
        )
    }
}

pub type ReplResult<T> = Result<T, ReplError>;
