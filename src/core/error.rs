//! Error types for the Phoenix Channels client.

use thiserror::Error;

use crate::transport::{FrameError, TransportError};

/// Misuse of the channel API.
///
/// These are not retryable: the call is rejected and the channel is left
/// untouched.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ChannelError {
    /// `join` was called on a channel instance that has already been joined.
    #[error("tried to join `{topic}` multiple times; join can only be called once per channel instance")]
    JoinedTwice {
        /// Channel topic.
        topic: String,
    },

    /// `push` was called before `join`.
    #[error("tried to push `{event}` to `{topic}` before joining")]
    PushBeforeJoin {
        /// Channel topic.
        topic: String,
        /// Event that was pushed.
        event: String,
    },
}

/// Errors raised while building or driving a socket.
#[derive(Debug, Error)]
pub enum SocketError {
    /// Endpoint is not a valid URL.
    #[error("invalid endpoint: {0}")]
    InvalidEndpoint(#[from] url::ParseError),

    /// Endpoint scheme cannot be mapped to a websocket scheme.
    #[error("unsupported endpoint scheme: {0}")]
    UnsupportedScheme(String),

    /// No scheduler was configured and no default is available.
    #[error("no scheduler configured")]
    NoScheduler,

    /// No transport was configured and no default is available.
    #[error("no transport configured")]
    NoTransport,
}

/// Top-level client errors.
#[derive(Debug, Error)]
pub enum PhoenixError {
    /// Channel error.
    #[error("channel error: {0}")]
    Channel(#[from] ChannelError),

    /// Socket error.
    #[error("socket error: {0}")]
    Socket(#[from] SocketError),

    /// Transport error.
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// Wire frame error.
    #[error("frame error: {0}")]
    Frame(#[from] FrameError),
}
