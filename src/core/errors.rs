// Error types for the orchestration core
//
// Using thiserror for ergonomic error definitions. Classification methods on
// ProviderError drive the retry policy: the orchestrator never matches on
// message strings, only on variants.

use thiserror::Error;

/// Errors surfaced by a provider adapter for a single request.
#[derive(Debug, Error)]
pub enum ProviderError {
    /// Malformed or undersized payload. Never retried.
    #[error("invalid input payload: {0}")]
    InvalidInput(String),

    /// The vendor definitively rejected the credential (401/403).
    #[error("credential rejected by provider: {0}")]
    Auth(String),

    /// 429 or quota-exceeded. Retried with full exponential backoff and the
    /// triggering credential penalized in the rate limiter.
    #[error("provider rate limit hit{}", retry_after_secs.map(|s| format!(" (retry after {s}s)")).unwrap_or_default())]
    RateLimited { retry_after_secs: Option<u64> },

    /// 5xx or explicit overload. Retried with linear backoff.
    #[error("provider overloaded: {0}")]
    Overloaded(String),

    /// Transport-level failure (connect, TLS, body read).
    #[error("network error: {0}")]
    Network(String),

    /// Per-call deadline elapsed. Converted to a retryable failure so one
    /// stuck call never stalls the batch.
    #[error("provider call timed out after {0}s")]
    Timeout(u64),

    /// The provider answered but the completion was empty or unparseable.
    #[error("empty or unparseable provider response: {0}")]
    EmptyResponse(String),

    /// Response parsed but failed the minimum-quality bar. Fails loud so the
    /// retry loop can take another shot instead of exporting junk metadata.
    #[error("response below quality bar: {0}")]
    QualityBelowBar(String),
}

impl ProviderError {
    /// True for errors the orchestrator may retry (possibly on another
    /// credential). Input and auth errors are excluded: input errors fail the
    /// task immediately, auth errors invalidate the credential and only the
    /// rotation path continues.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, Self::InvalidInput(_) | Self::Auth(_))
    }

    /// True when the failure is a rate/quota signal that warrants exponential
    /// backoff and a limiter penalty.
    pub fn is_rate_limit(&self) -> bool {
        matches!(self, Self::RateLimited { .. })
    }

    pub fn is_auth(&self) -> bool {
        matches!(self, Self::Auth(_))
    }

    pub fn is_input(&self) -> bool {
        matches!(self, Self::InvalidInput(_))
    }
}

impl From<reqwest::Error> for ProviderError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            Self::Timeout(0)
        } else {
            Self::Network(e.to_string())
        }
    }
}

/// Credential pool errors.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PoolError {
    #[error("unknown credential id: {0}")]
    UnknownCredential(String),
}

/// Batch-level fatal errors. Per-task failures never surface here; they
/// become `failed=true` results instead.
#[derive(Debug, Error)]
pub enum BatchError {
    #[error("no valid credentials available for {provider}")]
    NoValidCredentials { provider: String },

    #[error("a batch is already running; stop it before starting another")]
    AlreadyRunning,
}

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("max retries must be <= 10, got {0}")]
    InvalidRetryCeiling(u32),

    #[error("request timeout must be in [1, 300] seconds, got {0}")]
    InvalidTimeout(u64),

    #[error("parallelism cap must be in [1, 16], got {0}")]
    InvalidParallelism(usize),

    #[error("group size must be in [1, 16], got {0}")]
    InvalidGroupSize(usize),

    #[error("backoff base must be > 0 ms")]
    InvalidBackoff,
}

pub type ProviderResult<T> = Result<T, ProviderError>;
