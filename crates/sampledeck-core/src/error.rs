//! Error types for SampleDeck.

use thiserror::Error;

/// Main error type for waveform engine operations.
#[derive(Error, Debug)]
pub enum SampleDeckError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Malformed buffer, id or dimensions. Never retried.
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// A worker did not answer before its deadline.
    #[error("Worker timed out on task {task_id} after {timeout_ms} ms")]
    WorkerTimeout { task_id: u64, timeout_ms: u64 },

    /// A worker replied with an error message.
    #[error("Worker failed on task {task_id}: {message}")]
    Worker { task_id: u64, message: String },

    /// Emergency cleanup could not make room for a registration.
    #[error("Memory pressure: requested {requested} bytes, only {available} bytes can be made available")]
    MemoryPressure { requested: usize, available: usize },

    /// Writing to a cache tier failed. Callers log and swallow this.
    #[error("Cache write error: {0}")]
    CacheWrite(String),

    #[error("Task cancelled")]
    Cancelled,

    #[error("Worker pool has shut down")]
    PoolShutdown,

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl SampleDeckError {
    /// Whether the caller may retry the operation on the synchronous path.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::WorkerTimeout { .. } | Self::Worker { .. } | Self::PoolShutdown
        )
    }
}

impl From<serde_json::Error> for SampleDeckError {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}

/// Result type alias for SampleDeck operations.
pub type Result<T> = std::result::Result<T, SampleDeckError>;
