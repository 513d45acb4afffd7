use thiserror::Error;

/// Errors surfaced by the worker pool.
///
/// A run settles with at most one of these; there is no partial result
/// delivery on failure or cancellation.
#[derive(Debug, Error)]
pub enum PoolError {
    #[error("remaining tasks canceled")]
    Canceled,

    #[error("task {task} failed: {source}")]
    Invocation {
        task: usize,
        #[source]
        source: anyhow::Error,
    },

    #[error("progress callback panicked after {completed} completed tasks")]
    Progress { completed: usize },

    #[error("worker pool shut down before the run settled")]
    Shutdown,

    #[error("config error: {0}")]
    Config(String),

    #[error("config parse error: {0}")]
    ConfigParse(#[from] toml::de::Error),

    #[error("config I/O error: {0}")]
    ConfigIo(#[from] std::io::Error),
}

impl PoolError {
    /// True when the run was rejected because `cancel` was called on it.
    pub fn is_canceled(&self) -> bool {
        matches!(self, PoolError::Canceled)
    }
}
