//! Domain error type shared by the indexing, retrieval, evaluation, and
//! reminder modules.
//!
//! The CLI converts these into `anyhow::Error` at the edge; library
//! callers can match on the variant to decide how to surface a failure.

#[derive(Debug, thiserror::Error)]
pub enum KbError {
    #[error("no extractable text")]
    EmptyInput,
    #[error("document '{0}' is not indexed")]
    DocumentNotIndexed(String),
    #[error("no relevant context found in the knowledge base")]
    NoContextFound,
    #[error("answer synthesis failed: {0}")]
    Synthesis(String),
    #[error("vector index write failed: {0}")]
    IndexWrite(String),
    #[error("no recognizable due date in '{0}'")]
    DateExtraction(String),
    #[error("embedding error: {0}")]
    Embedding(String),
    #[error("document source error: {0}")]
    Source(String),
    #[error("sqlite error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl KbError {
    /// Short machine-readable code, used in error-in-body responses.
    pub fn code(&self) -> &'static str {
        match self {
            KbError::EmptyInput => "empty_input",
            KbError::DocumentNotIndexed(_) => "document_not_indexed",
            KbError::NoContextFound => "no_context_found",
            KbError::Synthesis(_) => "synthesis_error",
            KbError::IndexWrite(_) => "index_write_error",
            KbError::DateExtraction(_) => "date_extraction_failure",
            KbError::Embedding(_) => "embedding_error",
            KbError::Source(_) => "source_error",
            KbError::Database(_) => "database_error",
            KbError::Io(_) => "io_error",
            KbError::Serialization(_) => "serialization_error",
        }
    }
}

pub type KbResult<T> = Result<T, KbError>;
