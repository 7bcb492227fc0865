use thiserror::Error;

use crate::config::ConfigError;
use crate::embedding::EmbeddingError;

#[derive(Error, Debug)]
pub enum SearchError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Database error: {0}")]
    Database(#[from] surrealdb::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Embedding error: {0}")]
    Embedding(#[from] EmbeddingError),
    #[error("Object store error: {0}")]
    ObjectStore(String),
    #[error("Transcription error: {0}")]
    Transcription(String),
    #[error("Invalid request: {0}")]
    Validation(String),
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Invalid transcript for {file_id}: {reason}")]
    InvalidTranscript { file_id: String, reason: String },
    #[error("Invalid job transition from {from} to {to}")]
    InvalidTransition { from: String, to: String },
    #[error("Job cancelled")]
    Cancelled,
    #[error("Transcription job did not finish after {attempts} polls")]
    PollTimeout { attempts: u32 },
    #[error("Config error: {0}")]
    Config(#[from] ConfigError),
}

impl SearchError {
    /// Errors caused by the caller's input rather than by this service or its upstreams.
    pub fn is_client_error(&self) -> bool {
        match self {
            SearchError::Validation(_) => true,
            SearchError::Embedding(e) => e.is_validation(),
            _ => false,
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, SearchError::NotFound(_))
    }
}

pub type Result<T> = std::result::Result<T, SearchError>;
