//! Error types for the migration library.
//!
//! Errors carry a coarse [`ErrorKind`] so recovery policy (retry, isolate to
//! the row, fail the entity, abort the run) is chosen from the kind, never
//! from message text.

use std::time::Duration;
use thiserror::Error;

/// Classification of an error for recovery dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Invalid configuration or entity graph. Fatal, raised before any I/O.
    Configuration,
    /// Store unavailable, connection lost or operation timed out. Retried.
    Connectivity,
    /// Write rejected by a target constraint. Isolated to the row.
    Constraint,
    /// Source data that cannot be transformed. Isolated to the row.
    Data,
    /// Store or state failure that retrying will not fix.
    Store,
    /// Run was cancelled.
    Cancelled,
}

/// Main error type for migration operations.
#[derive(Error, Debug)]
pub enum MigrateError {
    /// Configuration error (invalid YAML, missing fields, etc.)
    #[error("Configuration error: {0}")]
    Config(String),

    /// The declared entity dependencies contain a cycle.
    #[error("Cyclic dependency between entities: {}", .entities.join(", "))]
    CyclicDependency { entities: Vec<String> },

    /// An entity references an entity that is not defined.
    #[error("Entity '{referenced_by}' references unknown entity '{entity}'")]
    UnknownEntity {
        entity: String,
        referenced_by: String,
    },

    /// Transient store failure (network, pool exhaustion, serialization conflict).
    #[error("Connectivity error during {operation}: {message}")]
    Connectivity { operation: String, message: String },

    /// A single store operation exceeded its deadline.
    #[error("{operation} timed out after {after:?}")]
    Timeout { operation: String, after: Duration },

    /// Target rejected a write (duplicate key, broken reference, not-null, ...).
    #[error("Constraint violation: {0}")]
    Constraint(String),

    /// The per-entity transform rejected a source row.
    #[error("Transform failed for {entity} legacy id {legacy_id}: {message}")]
    Transform {
        entity: String,
        legacy_id: i64,
        message: String,
    },

    /// Non-transient store failure.
    #[error("Store error: {0}")]
    Store(String),

    /// Connection pool error with context
    #[error("Pool error: {message}\n  Context: {context}")]
    Pool { message: String, context: String },

    /// State persistence error
    #[error("State error: {0}")]
    State(String),

    /// Config hash mismatch on resume
    #[error("Config has changed since the run being resumed - cannot resume. Use --force to resume anyway.")]
    ConfigChanged,

    /// PostgreSQL driver error, classified by SQLSTATE in [`MigrateError::kind`].
    #[error("Database error: {0}")]
    Postgres(#[from] tokio_postgres::Error),

    /// IO error (file operations)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// YAML serialization/deserialization error
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Migration was cancelled (SIGINT, etc.)
    #[error("Migration cancelled")]
    Cancelled,
}

impl MigrateError {
    /// Create a Pool error with context about where it occurred
    pub fn pool(message: impl Into<String>, context: impl Into<String>) -> Self {
        MigrateError::Pool {
            message: message.into(),
            context: context.into(),
        }
    }

    /// Create a Connectivity error.
    pub fn connectivity(operation: impl Into<String>, message: impl Into<String>) -> Self {
        MigrateError::Connectivity {
            operation: operation.into(),
            message: message.into(),
        }
    }

    /// Classify this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            MigrateError::Config(_)
            | MigrateError::CyclicDependency { .. }
            | MigrateError::UnknownEntity { .. }
            | MigrateError::ConfigChanged
            | MigrateError::Yaml(_) => ErrorKind::Configuration,
            MigrateError::Connectivity { .. }
            | MigrateError::Timeout { .. }
            | MigrateError::Pool { .. } => ErrorKind::Connectivity,
            MigrateError::Constraint(_) => ErrorKind::Constraint,
            MigrateError::Transform { .. } => ErrorKind::Data,
            MigrateError::Postgres(e) => classify_pg(e),
            MigrateError::Store(_)
            | MigrateError::State(_)
            | MigrateError::Io(_)
            | MigrateError::Json(_) => ErrorKind::Store,
            MigrateError::Cancelled => ErrorKind::Cancelled,
        }
    }

    /// Whether retrying the failed operation may succeed.
    pub fn is_transient(&self) -> bool {
        self.kind() == ErrorKind::Connectivity
    }

    /// Whether the failure is confined to the row being written.
    pub fn is_row_level(&self) -> bool {
        matches!(self.kind(), ErrorKind::Constraint | ErrorKind::Data)
    }

    /// Process exit code for a run that ended with this error.
    pub fn exit_code(&self) -> u8 {
        match self.kind() {
            ErrorKind::Configuration => 1,
            ErrorKind::Connectivity => 3,
            ErrorKind::Cancelled => 130,
            _ => 1,
        }
    }

    /// Format error with full details including error chain
    pub fn format_detailed(&self) -> String {
        let mut output = format!("Error: {}\n", self);

        let mut source = std::error::Error::source(self);
        let mut depth = 1;
        while let Some(err) = source {
            output.push_str(&format!("\nCaused by:\n  {}: {}", depth, err));
            source = err.source();
            depth += 1;
        }

        output
    }
}

impl From<deadpool_postgres::PoolError> for MigrateError {
    fn from(err: deadpool_postgres::PoolError) -> Self {
        MigrateError::pool(err.to_string(), "acquiring PostgreSQL connection")
    }
}

/// Map a driver error onto the taxonomy using its SQLSTATE class.
fn classify_pg(err: &tokio_postgres::Error) -> ErrorKind {
    match err.code() {
        Some(state) => classify_sqlstate(state.code()),
        // No SQLSTATE: the failure happened below the protocol (I/O, closed socket).
        None => ErrorKind::Connectivity,
    }
}

pub(crate) fn classify_sqlstate(code: &str) -> ErrorKind {
    match code {
        // serialization_failure, deadlock_detected
        "40001" | "40P01" => ErrorKind::Connectivity,
        // admin_shutdown, crash_shutdown, cannot_connect_now
        "57P01" | "57P02" | "57P03" => ErrorKind::Connectivity,
        c if c.starts_with("08") || c.starts_with("53") => ErrorKind::Connectivity,
        c if c.starts_with("23") => ErrorKind::Constraint,
        // data_exception
        c if c.starts_with("22") => ErrorKind::Data,
        _ => ErrorKind::Store,
    }
}

/// Result type alias for migration operations.
pub type Result<T> = std::result::Result<T, MigrateError>;
