//! Error types for deal-relay.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Top-level error type for the service.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("Delivery error: {0}")]
    Delivery(#[from] DeliveryError),

    #[error("Source error: {0}")]
    Source(#[from] SourceError),

    #[error("Pipeline error: {0}")]
    Pipeline(#[from] PipelineError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Database-related errors.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Connection pool error: {0}")]
    Pool(String),

    #[error("Query failed: {0}")]
    Query(String),

    /// The database is locked, busy, or otherwise temporarily unreachable.
    #[error("Database unavailable: {0}")]
    Unavailable(String),

    #[error("Entity not found: {entity} with id {id}")]
    NotFound { entity: String, id: String },

    #[error("Constraint violation: {0}")]
    Constraint(String),

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl DatabaseError {
    /// Wrap a libSQL error raised by `op`, classifying lock contention as
    /// `Unavailable` so callers can retry it.
    pub fn from_libsql(op: &str, e: libsql::Error) -> Self {
        let msg = e.to_string();
        let lower = msg.to_ascii_lowercase();
        if lower.contains("database is locked")
            || lower.contains("busy")
            || lower.contains("unable to open")
        {
            Self::Unavailable(format!("{op}: {msg}"))
        } else if lower.contains("constraint") {
            Self::Constraint(format!("{op}: {msg}"))
        } else {
            Self::Query(format!("{op}: {msg}"))
        }
    }

    /// Whether retrying the same operation later may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Unavailable(_) | Self::Pool(_))
    }
}

/// Publish queue errors.
#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("Queue entry {id} not found")]
    NotFound { id: i64 },

    #[error("Queue entry {id} is {from}, cannot transition to {to}")]
    InvalidTransition { id: i64, from: String, to: String },

    #[error("Queue is closed")]
    Closed,

    #[error(transparent)]
    Database(#[from] DatabaseError),
}

impl QueueError {
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Database(db) if db.is_transient())
    }
}

/// Storage-side failures the coordinator knows how to retry and classify.
pub(crate) trait StorageFailure: std::fmt::Display {
    fn is_transient(&self) -> bool;
    fn into_pipeline(self, operation: &str) -> PipelineError;
}

impl StorageFailure for DatabaseError {
    fn is_transient(&self) -> bool {
        DatabaseError::is_transient(self)
    }

    fn into_pipeline(self, operation: &str) -> PipelineError {
        PipelineError::from_database(operation, self)
    }
}

impl StorageFailure for QueueError {
    fn is_transient(&self) -> bool {
        QueueError::is_transient(self)
    }

    fn into_pipeline(self, operation: &str) -> PipelineError {
        PipelineError::from_queue(operation, self)
    }
}

/// Admission-time content rule violations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("item has no title")]
    MissingTitle,

    #[error("item has no identifying attributes")]
    MissingIdentity,

    #[error("item has no price")]
    MissingPrice,

    #[error("price {price} is below the minimum {min}")]
    PriceBelow { price: String, min: String },

    #[error("price {price} is above the maximum {max}")]
    PriceAbove { price: String, max: String },

    #[error("title contains stop word {word:?}")]
    StopWord { word: String },
}

/// Errors raised by a delivery collaborator.
#[derive(Debug, thiserror::Error)]
pub enum DeliveryError {
    #[error("Send via {publisher} failed: {reason}")]
    SendFailed { publisher: String, reason: String },

    #[error("{publisher} rejected the item: {reason}")]
    Rejected { publisher: String, reason: String },

    #[error("{publisher} refused delivery: {reason}")]
    Blocked { publisher: String, reason: String },

    #[error("{publisher} rate limited, retry after {retry_after:?}")]
    RateLimited {
        publisher: String,
        retry_after: Option<Duration>,
    },

    #[error("{publisher} timed out after {timeout:?}")]
    Timeout { publisher: String, timeout: Duration },
}

/// Errors raised by an ingestion collaborator.
#[derive(Debug, thiserror::Error)]
pub enum SourceError {
    #[error("Source {name} unavailable: {reason}")]
    Unavailable { name: String, reason: String },

    #[error("Source {name} returned malformed data: {reason}")]
    Malformed { name: String, reason: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Closed classification every pipeline failure maps into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Duplicate,
    ValidationFailed,
    Transient,
    Blocked,
    Fatal,
}

impl ErrorKind {
    pub const ALL: [ErrorKind; 5] = [
        ErrorKind::Duplicate,
        ErrorKind::ValidationFailed,
        ErrorKind::Transient,
        ErrorKind::Blocked,
        ErrorKind::Fatal,
    ];
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Duplicate => "duplicate",
            Self::ValidationFailed => "validation_failed",
            Self::Transient => "transient",
            Self::Blocked => "blocked",
            Self::Fatal => "fatal",
        };
        write!(f, "{s}")
    }
}

/// Pipeline-related errors.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("Item {key} was already admitted")]
    Duplicate { key: String },

    #[error("Item {key} failed validation: {reason}")]
    ValidationFailed { key: String, reason: ValidationError },

    #[error("{operation} failed transiently: {reason}")]
    Transient { operation: String, reason: String },

    #[error("Publish queue is full ({capacity} active entries)")]
    QueueFull { capacity: usize },

    #[error("Upstream blocked: {reason}")]
    Blocked { reason: String },

    #[error("{operation} failed: {reason}")]
    Fatal { operation: String, reason: String },

    /// The pipeline stopped accepting work while the operation was pending.
    #[error("Pipeline is shutting down")]
    ShuttingDown,
}

impl PipelineError {
    /// Map onto the closed error classification.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Duplicate { .. } => ErrorKind::Duplicate,
            Self::ValidationFailed { .. } => ErrorKind::ValidationFailed,
            Self::Transient { .. } | Self::QueueFull { .. } | Self::ShuttingDown => {
                ErrorKind::Transient
            }
            Self::Blocked { .. } => ErrorKind::Blocked,
            Self::Fatal { .. } => ErrorKind::Fatal,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.kind() == ErrorKind::Transient
    }

    pub(crate) fn from_database(operation: &str, e: DatabaseError) -> Self {
        if e.is_transient() {
            Self::Transient {
                operation: operation.to_string(),
                reason: e.to_string(),
            }
        } else {
            Self::Fatal {
                operation: operation.to_string(),
                reason: e.to_string(),
            }
        }
    }

    pub(crate) fn from_queue(operation: &str, e: QueueError) -> Self {
        match e {
            QueueError::Database(db) => Self::from_database(operation, db),
            QueueError::Closed => Self::ShuttingDown,
            other => Self::Fatal {
                operation: operation.to_string(),
                reason: other.to_string(),
            },
        }
    }
}

/// Result type alias for the service.
pub type Result<T> = std::result::Result<T, Error>;
