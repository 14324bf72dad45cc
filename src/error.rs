//! Error types for the ingestion pipeline.
//!
//! Every fallible operation in fleetwire returns [`IngestError`]. The variants are
//! grouped by where they surface:
//!
//! - **Protocol errors**: malformed or truncated binary frames. Fatal to the owning
//!   connection only.
//! - **Backpressure**: the ingestion queue stayed full for the whole enqueue window.
//!   The record is dropped and the caller carries on.
//! - **Sink errors**: a single point failed to write. Logged and skipped.
//! - **Connection errors**: socket, handshake or upstream failures. These drive the
//!   reconnect loop and are never surfaced past it.
//!
//! ## Classification
//!
//! ```rust
//! use fleetwire::IngestError;
//!
//! let error = IngestError::connection_failed("handshake refused");
//! assert!(error.is_retryable());
//!
//! let error = IngestError::truncated("vehicle id", 8, 3);
//! assert!(error.is_connection_fatal());
//! ```

use std::time::Duration;
use thiserror::Error;

/// Result type alias for pipeline operations.
pub type Result<T, E = IngestError> = std::result::Result<T, E>;

/// Main error type for pipeline operations.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum IngestError {
    #[error("Protocol error in {context}: {details}")]
    Protocol { context: String, details: String },

    #[error("Truncated {field}: need {needed} bytes, have {remaining}")]
    Truncated { field: &'static str, needed: usize, remaining: usize },

    #[error("Declared payload of {declared} bytes exceeds the {max} byte cap")]
    PayloadTooLarge { declared: u32, max: u32 },

    #[error("Ingestion queue full after waiting {waited:?}")]
    Backpressure { waited: Duration },

    #[error("Pipeline is shutting down")]
    ShuttingDown,

    #[error("Sink write failed: {reason}")]
    Sink {
        reason: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("Connection failed: {reason}")]
    Connection {
        reason: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("Operation timed out after {duration:?}")]
    Timeout { duration: Duration },

    #[error("I/O error during {context}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error("JSON error in {context}")]
    Json {
        context: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("Invalid configuration: {reason}")]
    Config { reason: String },

    #[error("Channel closed: {context}")]
    ChannelClosed { context: String },
}

impl IngestError {
    /// Returns whether this error is potentially recoverable through retry.
    pub fn is_retryable(&self) -> bool {
        match self {
            IngestError::Connection { .. } => true,
            IngestError::Timeout { .. } => true,
            IngestError::Backpressure { .. } => true,
            IngestError::Io { .. } => true,
            IngestError::Sink { .. } => false,
            IngestError::Protocol { .. } => false,
            IngestError::Truncated { .. } => false,
            IngestError::PayloadTooLarge { .. } => false,
            IngestError::ShuttingDown => false,
            IngestError::Json { .. } => false,
            IngestError::Config { .. } => false,
            IngestError::ChannelClosed { .. } => false,
        }
    }

    /// Returns whether this error should close the connection that produced it.
    ///
    /// Decode failures leave the byte stream at an unknown position, so the
    /// connection cannot be resynchronised safely.
    pub fn is_connection_fatal(&self) -> bool {
        matches!(
            self,
            IngestError::Protocol { .. }
                | IngestError::Truncated { .. }
                | IngestError::PayloadTooLarge { .. }
                | IngestError::Io { .. }
                | IngestError::Connection { .. }
        )
    }

    /// Helper constructor for protocol errors.
    pub fn protocol(context: impl Into<String>, details: impl Into<String>) -> Self {
        IngestError::Protocol { context: context.into(), details: details.into() }
    }

    /// Helper constructor for short-buffer errors.
    pub fn truncated(field: &'static str, needed: usize, remaining: usize) -> Self {
        IngestError::Truncated { field, needed, remaining }
    }

    /// Helper constructor for connection errors.
    pub fn connection_failed(reason: impl Into<String>) -> Self {
        IngestError::Connection { reason: reason.into(), source: None }
    }

    /// Helper constructor for connection errors with source.
    pub fn connection_failed_with_source(
        reason: impl Into<String>,
        source: Box<dyn std::error::Error + Send + Sync>,
    ) -> Self {
        IngestError::Connection { reason: reason.into(), source: Some(source) }
    }

    /// Helper constructor for sink errors.
    pub fn sink_failed(reason: impl Into<String>) -> Self {
        IngestError::Sink { reason: reason.into(), source: None }
    }

    /// Helper constructor for sink errors with source.
    pub fn sink_failed_with_source(
        reason: impl Into<String>,
        source: Box<dyn std::error::Error + Send + Sync>,
    ) -> Self {
        IngestError::Sink { reason: reason.into(), source: Some(source) }
    }

    /// Helper constructor for I/O errors with context.
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        IngestError::Io { context: context.into(), source }
    }

    /// Helper constructor for configuration errors.
    pub fn config(reason: impl Into<String>) -> Self {
        IngestError::Config { reason: reason.into() }
    }

    /// Helper constructor for closed-channel errors.
    pub fn channel_closed(context: impl Into<String>) -> Self {
        IngestError::ChannelClosed { context: context.into() }
    }
}

impl From<std::io::Error> for IngestError {
    fn from(err: std::io::Error) -> Self {
        IngestError::Io { context: "<unknown>".to_string(), source: err }
    }
}

impl From<serde_json::Error> for IngestError {
    fn from(err: serde_json::Error) -> Self {
        IngestError::Json { context: "<unknown>".to_string(), source: err }
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for IngestError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        IngestError::Connection { reason: "websocket".to_string(), source: Some(Box::new(err)) }
    }
}
