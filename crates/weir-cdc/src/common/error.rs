//! Error types for capture operations
//!
//! Nothing is recovered inside the core: every error propagates to the
//! process boundary, where the supervisor restarts the capture from its last
//! checkpoint. The category accessor exists so the boundary can distinguish a
//! bad configuration (report and stop) from a lost connection (restart).

use thiserror::Error;

/// Coarse error classification for the process boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    /// Invalid or missing configuration
    Configuration,
    /// Cannot reach or keep a database connection
    Connectivity,
    /// Catalog or scan-key mismatch
    Schema,
    /// Replication payload or scan row could not be parsed
    Decode,
    /// The downstream consumer stopped accepting messages
    Emit,
    /// Clean shutdown (watchdog or deadline), not a failure
    Cancelled,
    /// Everything else
    Other,
}

/// Capture errors
#[derive(Error, Debug)]
pub enum CaptureError {
    /// Scan-connection error from the driver
    #[error("postgres error: {0}")]
    Postgres(#[from] tokio_postgres::Error),

    /// Replication session error
    #[error("replication error: {0}")]
    Replication(String),

    /// Replication payload or scan row could not be parsed
    #[error("decode error: {0}")]
    Decode(String),

    /// Catalog or scan-key problem
    #[error("schema error: {0}")]
    Schema(String),

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// The downstream writer returned an error
    #[error("emit error: {0}")]
    Emit(#[source] std::io::Error),

    /// JSON serialization error
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// I/O error
    #[error("io error: {0}")]
    Io(std::io::Error),

    /// Internal invariant violated
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// The poll-timeout watchdog fired: no records were emitted for the
    /// configured duration. A clean exit in non-tailing mode.
    #[error("cancelled: no progress within the poll timeout")]
    Cancelled,
}

impl CaptureError {
    /// Create a replication error
    pub fn replication(msg: impl Into<String>) -> Self {
        Self::Replication(msg.into())
    }

    /// Create a decode error
    pub fn decode(msg: impl Into<String>) -> Self {
        Self::Decode(msg.into())
    }

    /// Create a schema error
    pub fn schema(msg: impl Into<String>) -> Self {
        Self::Schema(msg.into())
    }

    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create an invalid-state error
    pub fn invalid_state(msg: impl Into<String>) -> Self {
        Self::InvalidState(msg.into())
    }

    /// Get the error category for the process boundary.
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::Postgres(_) => ErrorCategory::Connectivity,
            Self::Replication(_) => ErrorCategory::Connectivity,
            Self::Decode(_) => ErrorCategory::Decode,
            Self::Schema(_) => ErrorCategory::Schema,
            Self::Config(_) => ErrorCategory::Configuration,
            Self::Emit(_) => ErrorCategory::Emit,
            Self::Json(_) => ErrorCategory::Emit,
            Self::Io(_) => ErrorCategory::Connectivity,
            Self::InvalidState(_) => ErrorCategory::Other,
            Self::Cancelled => ErrorCategory::Cancelled,
        }
    }

    /// Whether this error represents a clean shutdown rather than a failure.
    pub fn is_cancellation(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

/// Result type for capture operations
pub type Result<T> = std::result::Result<T, CaptureError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = CaptureError::replication("slot is in use");
        assert!(err.to_string().contains("replication error"));
        assert!(err.to_string().contains("slot is in use"));
    }

    #[test]
    fn test_error_category() {
        assert_eq!(
            CaptureError::config("missing slot_name").category(),
            ErrorCategory::Configuration
        );
        assert_eq!(
            CaptureError::replication("x").category(),
            ErrorCategory::Connectivity
        );
        assert_eq!(CaptureError::schema("x").category(), ErrorCategory::Schema);
        assert_eq!(CaptureError::decode("x").category(), ErrorCategory::Decode);
        assert_eq!(CaptureError::Cancelled.category(), ErrorCategory::Cancelled);
    }

    #[test]
    fn test_cancellation_is_not_a_failure() {
        assert!(CaptureError::Cancelled.is_cancellation());
        assert!(!CaptureError::schema("x").is_cancellation());
    }
}
