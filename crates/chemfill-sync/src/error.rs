use chemfill_storage::StorageError;
use thiserror::Error;

/// Errors that end a run. Per-source and per-row failures never become one of
/// these; they are recorded on the row instead.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// Output log or checkpoint could not be written; nothing after this
    /// point is marked complete.
    #[error("fatal storage failure: {0}")]
    Fatal(#[from] StorageError),
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("invalid input: {0}")]
    Input(String),
    #[error("writer task failed: {0}")]
    Writer(String),
}

impl PipelineError {
    pub fn is_fatal(&self) -> bool {
        matches!(self, PipelineError::Fatal(_) | PipelineError::Writer(_))
    }
}
