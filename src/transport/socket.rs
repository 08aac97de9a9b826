//! WebSocket transport over tokio-tungstenite.
//!
//! Each [`WebSocketTransport`] owns one connection attempt. A background task
//! drives the stream; the socket talks to it through an unbounded command
//! queue, so [`Transport::send`] never blocks and never re-enters the delegate.

use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::handshake::client::Request;
use tokio_tungstenite::tungstenite::http::{HeaderName, HeaderValue};
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tracing::{debug, trace, warn};
use url::Url;

use super::connection::{Transport, TransportDelegate, TransportFactory};
use super::error::{TransportError, TransportResult};
use crate::core::CLOSE_ABNORMAL;

/// Close code reported when the peer closes without a status.
const CLOSE_NO_STATUS: u16 = 1005;

enum Command {
    Send(String),
    Close { code: u16, reason: Option<String> },
}

/// A single websocket connection.
pub struct WebSocketTransport {
    url: Url,
    delegate: Arc<dyn TransportDelegate>,
    handle: Option<Handle>,
    commands: Mutex<Option<mpsc::UnboundedSender<Command>>>,
}

impl WebSocketTransport {
    /// Create an unconnected transport.
    ///
    /// Without an explicit `handle`, the runtime of the task calling
    /// [`Transport::connect`] is used.
    pub fn new(url: Url, delegate: Arc<dyn TransportDelegate>, handle: Option<Handle>) -> Self {
        Self {
            url,
            delegate,
            handle,
            commands: Mutex::new(None),
        }
    }

    /// Target URL.
    pub fn url(&self) -> &Url {
        &self.url
    }
}

impl Transport for WebSocketTransport {
    fn connect(&self, headers: &[(String, String)]) {
        let Some(handle) = self.handle.clone().or_else(|| Handle::try_current().ok()) else {
            self.delegate.on_error(TransportError::NoRuntime);
            self.delegate.on_close(CLOSE_ABNORMAL, None);
            return;
        };

        let request = match build_request(&self.url, headers) {
            Ok(request) => request,
            Err(error) => {
                self.delegate.on_error(error);
                self.delegate.on_close(CLOSE_ABNORMAL, None);
                return;
            }
        };

        let (tx, rx) = mpsc::unbounded_channel();
        *self.commands.lock() = Some(tx);
        handle.spawn(run_connection(request, Arc::clone(&self.delegate), rx));
    }

    fn disconnect(&self, code: u16, reason: Option<&str>) {
        if let Some(tx) = self.commands.lock().take() {
            let _ = tx.send(Command::Close {
                code,
                reason: reason.map(str::to_string),
            });
        }
    }

    fn send(&self, data: String) {
        match self.commands.lock().as_ref() {
            Some(tx) => {
                if tx.send(Command::Send(data)).is_err() {
                    trace!("send after connection task ended");
                }
            }
            None => trace!("send on unconnected transport dropped"),
        }
    }
}

impl std::fmt::Debug for WebSocketTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebSocketTransport")
            .field("url", &self.url.as_str())
            .field("connected", &self.commands.lock().is_some())
            .finish()
    }
}

/// Creates [`WebSocketTransport`]s.
#[derive(Debug, Clone, Default)]
pub struct WebSocketFactory {
    handle: Option<Handle>,
}

impl WebSocketFactory {
    /// Factory using the caller's runtime at connect time.
    pub fn new() -> Self {
        Self::default()
    }

    /// Factory pinned to a runtime.
    pub fn with_handle(handle: Handle) -> Self {
        Self {
            handle: Some(handle),
        }
    }
}

impl TransportFactory for WebSocketFactory {
    fn create(&self, url: Url, delegate: Arc<dyn TransportDelegate>) -> Arc<dyn Transport> {
        Arc::new(WebSocketTransport::new(url, delegate, self.handle.clone()))
    }
}

fn build_request(url: &Url, headers: &[(String, String)]) -> TransportResult<Request> {
    let mut request = url.as_str().into_client_request()?;
    for (name, value) in headers {
        let name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|_| TransportError::InvalidHeader(name.clone()))?;
        let value =
            HeaderValue::from_str(value).map_err(|_| TransportError::InvalidHeader(name.to_string()))?;
        request.headers_mut().insert(name, value);
    }
    Ok(request)
}

async fn run_connection(
    request: Request,
    delegate: Arc<dyn TransportDelegate>,
    mut commands: mpsc::UnboundedReceiver<Command>,
) {
    let connecting = tokio_tungstenite::connect_async(request);
    tokio::pin!(connecting);

    let mut early = Vec::new();
    let stream = loop {
        tokio::select! {
            result = &mut connecting => match result {
                Ok((stream, _)) => break stream,
                Err(error) => {
                    debug!(error = %error, "websocket connect failed");
                    delegate.on_error(error.into());
                    delegate.on_close(CLOSE_ABNORMAL, None);
                    return;
                }
            },
            command = commands.recv() => match command {
                Some(Command::Send(text)) => early.push(text),
                Some(Command::Close { code, reason }) => {
                    delegate.on_close(code, reason);
                    return;
                }
                None => return,
            },
        }
    };

    debug!("websocket open");
    delegate.on_open();

    let (mut write, mut read) = stream.split();
    for text in early {
        if let Err(error) = write.send(WsMessage::text(text)).await {
            delegate.on_error(error.into());
            delegate.on_close(CLOSE_ABNORMAL, None);
            return;
        }
    }

    loop {
        tokio::select! {
            incoming = read.next() => match incoming {
                Some(Ok(WsMessage::Text(text))) => delegate.on_message(text.to_string()),
                Some(Ok(WsMessage::Binary(bytes))) => match String::from_utf8(bytes.to_vec()) {
                    Ok(text) => delegate.on_message(text),
                    Err(_) => warn!(len = bytes.len(), "dropping non-utf8 binary frame"),
                },
                Some(Ok(WsMessage::Close(frame))) => {
                    let (code, reason) = match frame {
                        Some(frame) => (u16::from(frame.code), Some(frame.reason.to_string())),
                        None => (CLOSE_NO_STATUS, None),
                    };
                    debug!(code, "websocket closed by peer");
                    delegate.on_close(code, reason);
                    return;
                }
                Some(Ok(_)) => {}
                Some(Err(error)) => {
                    warn!(error = %error, "websocket read failed");
                    delegate.on_error(error.into());
                    delegate.on_close(CLOSE_ABNORMAL, None);
                    return;
                }
                None => {
                    delegate.on_close(CLOSE_ABNORMAL, None);
                    return;
                }
            },
            command = commands.recv() => match command {
                Some(Command::Send(text)) => {
                    if let Err(error) = write.send(WsMessage::text(text)).await {
                        warn!(error = %error, "websocket write failed");
                        delegate.on_error(error.into());
                        delegate.on_close(CLOSE_ABNORMAL, None);
                        return;
                    }
                }
                Some(Command::Close { code, reason }) => {
                    let frame = CloseFrame {
                        code: CloseCode::from(code),
                        reason: reason.clone().unwrap_or_default().into(),
                    };
                    let _ = write.send(WsMessage::Close(Some(frame))).await;
                    let _ = write.close().await;
                    delegate.on_close(code, reason);
                    return;
                }
                None => {
                    let _ = write.close().await;
                    return;
                }
            },
        }
    }
}
