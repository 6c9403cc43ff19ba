//! Error types for mail-triage.

use std::time::Duration;

/// Top-level error type.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Classifier error: {0}")]
    Classifier(#[from] ClassifierError),

    #[error("Mail source error: {0}")]
    Source(#[from] SourceError),

    #[error("Pipeline error: {0}")]
    Pipeline(#[from] PipelineError),
}

/// Configuration-related errors. Always fatal at startup.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required configuration: {key}. {hint}")]
    MissingRequired { key: String, hint: String },

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("Failed to parse configuration: {0}")]
    ParseError(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Database-related errors.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Connection pool error: {0}")]
    Pool(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Entity not found: {entity} with id {id}")]
    NotFound { entity: String, id: String },

    /// Another writer holds the row or the database. The caller retries the
    /// whole message.
    #[error("Write conflict: {0}")]
    Conflict(String),

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl DatabaseError {
    /// Map a libsql failure, classifying busy/locked errors as conflicts.
    pub fn from_libsql(context: &str, err: libsql::Error) -> Self {
        let text = err.to_string();
        let lower = text.to_lowercase();
        if lower.contains("database is locked") || lower.contains("busy") {
            Self::Conflict(format!("{context}: {text}"))
        } else {
            Self::Query(format!("{context}: {text}"))
        }
    }

    /// Whether retrying the whole unit of work may succeed.
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict(_))
    }
}

/// Classification service errors.
///
/// Every variant is recoverable: the pipeline turns it into a default-keep
/// verdict.
#[derive(Debug, thiserror::Error)]
pub enum ClassifierError {
    #[error("Classifier {provider} request failed: {reason}")]
    RequestFailed { provider: String, reason: String },

    #[error("Classifier {provider} timed out after {timeout:?}")]
    Timeout { provider: String, timeout: Duration },

    #[error("Invalid response from {provider}: {reason}")]
    InvalidResponse { provider: String, reason: String },

    #[error("Model {model} not available on {provider}")]
    ModelNotAvailable { provider: String, model: String },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Mail source errors.
#[derive(Debug, thiserror::Error)]
pub enum SourceError {
    #[error("Mail source {name} I/O failed: {reason}")]
    Io { name: String, reason: String },

    #[error("Failed to parse message {id}: {reason}")]
    Parse { id: String, reason: String },

    #[error("Message {id} not found in {name}")]
    NotFound { name: String, id: String },
}

/// Pipeline-related errors.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("Storage failed: {0}")]
    Storage(#[from] DatabaseError),

    #[error("Mail source failed: {0}")]
    Source(#[from] SourceError),

    #[error("Classifier failed: {0}")]
    Classifier(#[from] ClassifierError),

    #[error("Message {id} is not registered")]
    UnknownMessage { id: String },
}

impl PipelineError {
    /// Whether the message should be retried as a whole.
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Storage(e) if e.is_conflict())
    }
}

/// Result type alias.
pub type Result<T> = std::result::Result<T, Error>;
