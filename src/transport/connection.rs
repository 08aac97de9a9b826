//! Transport contract between the socket and the physical connection.
//!
//! The socket never assumes a concrete transport: anything implementing
//! [`Transport`] and reporting through a [`TransportDelegate`] can carry the
//! protocol, including in-memory test doubles.

use std::sync::Arc;

use url::Url;

use super::error::TransportError;

/// Connection lifecycle phase as seen by the socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionPhase {
    /// Transport created, open in progress.
    Connecting,
    /// Transport open, frames flow.
    Open,
    /// Close requested, waiting for the transport to finish.
    Closing,
    /// No transport.
    Closed,
}

/// A message-oriented connection.
///
/// # Contract
///
/// - `connect` initiates opening and reports the outcome through the delegate,
///   possibly synchronously.
/// - `send` MUST NOT call back into the delegate synchronously: the socket
///   calls it while holding its own lock to keep frames in order.
/// - `disconnect` may report `on_close` synchronously.
pub trait Transport: Send + Sync {
    /// Start opening the connection.
    fn connect(&self, headers: &[(String, String)]);

    /// Close the connection with a close code and optional reason.
    fn disconnect(&self, code: u16, reason: Option<&str>);

    /// Send a text frame.
    fn send(&self, data: String);
}

/// Receiver of transport events.
pub trait TransportDelegate: Send + Sync {
    /// Connection opened.
    fn on_open(&self);

    /// Connection closed.
    fn on_close(&self, code: u16, reason: Option<String>);

    /// Connection failed.
    fn on_error(&self, error: TransportError);

    /// Text frame received.
    fn on_message(&self, text: String);
}

/// Creates a fresh transport for every connection attempt.
pub trait TransportFactory: Send + Sync {
    /// Create a transport for `url` that reports to `delegate`.
    fn create(&self, url: Url, delegate: Arc<dyn TransportDelegate>) -> Arc<dyn Transport>;
}

impl<F> TransportFactory for F
where
    F: Fn(Url, Arc<dyn TransportDelegate>) -> Arc<dyn Transport> + Send + Sync,
{
    fn create(&self, url: Url, delegate: Arc<dyn TransportDelegate>) -> Arc<dyn Transport> {
        self(url, delegate)
    }
}
