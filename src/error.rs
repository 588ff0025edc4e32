//! Error types for the journal pipeline.

/// Top-level error type for the journal service.
///
/// The job runner matches on the variant to classify a stage failure:
/// [`JournalError::Cancelled`] finalizes cancellation, everything else marks
/// the entry failed with the diagnostic.
#[derive(Debug, thiserror::Error)]
pub enum JournalError {
    /// Entry store error (SQLite, schema, missing rows).
    #[error("store error: {0}")]
    Store(String),

    /// Audio tool error (ffmpeg / ffprobe).
    #[error("audio error: {0}")]
    Audio(String),

    /// Speech-to-text transcription error.
    #[error("transcription error: {0}")]
    Transcribe(String),

    /// Language model generation error.
    #[error("LLM error: {0}")]
    Llm(String),

    /// Note writing or marker parsing error.
    #[error("note error: {0}")]
    Note(String),

    /// Configuration / settings error.
    #[error("config error: {0}")]
    Config(String),

    /// Caller-side precondition failure (wrong stage, bad field, bad path).
    /// Surfaced to the HTTP caller as 400; never mutates entry state.
    #[error("{0}")]
    Precondition(String),

    /// The requested resource does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// The stage was interrupted by a cancel request. Not a failure.
    #[error("cancelled")]
    Cancelled,

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Convenience result type.
pub type Result<T> = std::result::Result<T, JournalError>;

impl From<crate::store::StoreError> for JournalError {
    fn from(err: crate::store::StoreError) -> Self {
        match err {
            crate::store::StoreError::NotFound(what) => Self::NotFound(what),
            other => Self::Store(other.to_string()),
        }
    }
}
