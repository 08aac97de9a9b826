//! Transport layer error types.

use thiserror::Error;

/// Errors reported by a transport to its delegate.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Connection could not be established.
    #[error("connection failed: {0}")]
    Connect(String),

    /// A configured header is not a valid HTTP header.
    #[error("invalid header: {0}")]
    InvalidHeader(String),

    /// No async runtime available to drive the connection.
    #[error("no tokio runtime available")]
    NoRuntime,

    /// WebSocket protocol or I/O error.
    #[cfg(feature = "websocket")]
    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
}

impl TransportError {
    /// Check if this error cannot be recovered by reconnecting.
    ///
    /// Configuration problems will fail the same way on every attempt.
    pub fn is_fatal(&self) -> bool {
        matches!(self, TransportError::InvalidHeader(_) | TransportError::NoRuntime)
    }
}

/// Result type for transport operations.
pub type TransportResult<T> = Result<T, TransportError>;
