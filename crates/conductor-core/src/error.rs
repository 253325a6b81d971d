use std::time::Duration;
use thiserror::Error;

/// A convenience `Result` alias using [`ConductorError`].
pub type ConductorResult<T> = Result<T, ConductorError>;

/// Top-level error type for the Conductor coordination core.
///
/// Validation-class variants are returned synchronously to the caller that
/// caused them. Runtime-class variants are mostly handled internally and only
/// surface when automatic recovery is exhausted.
#[derive(Error, Debug)]
pub enum ConductorError {
    /// A task submission was malformed (missing or invalid id, empty spec).
    #[error("Task validation error: {0}")]
    TaskValidation(String),

    /// A dependency set was cyclic or can never be satisfied.
    #[error("Task dependency error: {0}")]
    TaskDependency(String),

    /// An agent registration was malformed or its id is already taken.
    #[error("Agent registration error: {0}")]
    AgentRegistration(String),

    /// No agent could take a task this tick.
    #[error("Agent unavailable: {0}")]
    AgentUnavailable(String),

    /// Admission was denied by a rate limiter; the caller should back off.
    #[error("Rate limit exceeded for '{key}', retry after {retry_after:?}")]
    RateLimitExceeded {
        /// The limited caller key.
        key: String,
        /// Delay until the next slot frees up.
        retry_after: Duration,
    },

    /// A snapshot or log write failed.
    #[error("Persistence error: {0}")]
    Persistence(String),

    /// An agent missed its heartbeat window.
    #[error("Agent timeout: {0}")]
    AgentTimeout(String),

    /// A task, agent or workflow lookup failed.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Invalid configuration.
    #[error("Config error: {0}")]
    Config(String),

    /// A JSON serialization or deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A standard I/O error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl ConductorError {
    /// Whether this error belongs to the synchronous validation class.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            Self::TaskValidation(_)
                | Self::TaskDependency(_)
                | Self::AgentRegistration(_)
                | Self::RateLimitExceeded { .. }
                | Self::NotFound(_)
                | Self::Config(_)
        )
    }
}
