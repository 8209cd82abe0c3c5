use thiserror::Error;

#[derive(Error, Debug)]
pub enum DocMapError {
    #[error("Schema error: {0}")]
    Schema(String),

    #[error("Unknown field '{field}' in {record}")]
    UnknownField { record: String, field: String },

    #[error("Unknown record type: {0}")]
    UnknownRecordType(String),

    #[error("Field '{field}' of {record} expected {expected}, got {found}")]
    TypeMismatch {
        record: String,
        field: String,
        expected: String,
        found: String,
    },

    #[error("Field '{field}' of {record} cannot be null")]
    NullValue { record: String, field: String },

    #[error("Unique value for '{field}' already exists in {collection}")]
    Uniqueness { collection: String, field: String },

    #[error("Persistence error: {0}")]
    Persistence(String),

    #[error("{record} is not persisted (no id)")]
    NotPersisted { record: String },

    #[error("Linked field '{field}' of {record} points at a record that was never saved")]
    UnsavedLink { record: String, field: String },

    #[error("Change feed on '{collection}' disconnected: {reason}")]
    FeedDisconnected { collection: String, reason: String },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
}

impl DocMapError {
    /// Shorthand used by the backends for collaborator write failures.
    pub(crate) fn persistence(message: impl Into<String>) -> Self {
        DocMapError::Persistence(message.into())
    }
}

pub type Result<T> = std::result::Result<T, DocMapError>;
