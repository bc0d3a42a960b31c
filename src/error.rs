use thiserror::Error;

/// Typed error hierarchy for the pipeline core.
///
/// Use at component boundaries (admission, provider calls, state-store
/// calls, validator failures). Middleware implementations may keep using
/// `anyhow::Result` internally — the `Internal` variant allows seamless
/// conversion via `?`.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("admission denied: {0}")]
    Admission(#[from] AdmissionError),

    #[error("execution deadline exceeded")]
    Timeout,

    #[error("validation failed: {0}")]
    Validation(String),

    #[error("provider error: {0}")]
    Provider(#[from] ProviderError),

    #[error("state store error: {0}")]
    StateStore(String),

    #[error("request cancelled")]
    Cancelled,

    #[error("internal invariant violated: {0}")]
    Invariant(String),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl PipelineError {
    /// Whether the failure is transient and safe to retry at a layer above
    /// the one that raised it (the provider middleware retries on its own;
    /// this is for callers deciding whether to resubmit a whole request).
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Provider(p) => p.is_retryable(),
            Self::Admission(_) | Self::Timeout | Self::Cancelled => false,
            Self::Validation(_) | Self::Invariant(_) => false,
            Self::StateStore(_) | Self::Internal(_) => false,
        }
    }
}

/// Reasons a request failed to be admitted to the pipeline.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AdmissionError {
    #[error("pipeline is shutting down")]
    ShuttingDown,
    #[error("caller cancelled before admission")]
    CallerCancelled,
}

/// Classification of errors returned by a `Provider`'s `predict`/`predict_stream`.
///
/// The core only sees this classified outcome (§4.4.5 / §9): concrete
/// providers decide how their wire-level errors map onto these variants.
#[derive(Debug, Error, Clone)]
pub enum ProviderError {
    #[error("transient provider error: {0}")]
    Transient(String),
    #[error("request validation rejected by provider: {0}")]
    Validation(String),
    #[error("provider authentication/authorization failed: {0}")]
    Auth(String),
    #[error("provider call cancelled")]
    Cancelled,
}

impl ProviderError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

pub type Result<T> = std::result::Result<T, PipelineError>;
