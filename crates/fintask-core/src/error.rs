use thiserror::Error;

/// Queue backend operation failures
///
/// `NotFound` and `StateConflict` are non-retryable by the worker;
/// `Unavailable` is retryable with capped exponential backoff inside the
/// worker main loop and never surfaces to handlers.
#[derive(Debug, Error)]
pub enum BackendError {
    #[error("job or worker not found: {0}")]
    NotFound(String),

    #[error("state conflict: {0}")]
    StateConflict(String),

    #[error("backend unavailable: {0}")]
    Unavailable(anyhow::Error),

    #[error("serialization error: {0}")]
    Serialization(anyhow::Error),
}

impl BackendError {
    /// Whether the worker main loop may transparently retry the backend
    /// call itself (as opposed to retrying the job).
    pub fn is_retryable(&self) -> bool {
        matches!(self, BackendError::Unavailable(_))
    }
}

/// Fatal configuration problems. A worker that hits one of these exits
/// with code 2 after logging
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("unknown configuration key(s): {0}")]
    UnknownKeys(String),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}
