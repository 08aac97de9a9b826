//! Socket configuration and builder.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use url::Url;

use super::socket::Socket;
use crate::core::{DEFAULT_HEARTBEAT_INTERVAL, DEFAULT_TIMEOUT, DEFAULT_VSN, Payload, SocketError};
use crate::transport::{Backoff, JsonSerializer, Scheduler, Serializer, TransportFactory, parse_endpoint};

/// Connect params, resolved on every connect.
///
/// Backed by a closure so that short-lived credentials can be refreshed
/// between reconnects.
#[derive(Clone)]
pub struct Params(Arc<dyn Fn() -> Payload + Send + Sync>);

impl Params {
    /// Params computed by `f` at each connect.
    pub fn new<F>(f: F) -> Self
    where
        F: Fn() -> Payload + Send + Sync + 'static,
    {
        Self(Arc::new(f))
    }

    /// Constant params.
    pub fn fixed(payload: Payload) -> Self {
        Self::new(move || payload.clone())
    }

    /// Current params.
    pub fn resolve(&self) -> Payload {
        (self.0)()
    }
}

impl Default for Params {
    fn default() -> Self {
        Self::fixed(Payload::new())
    }
}

impl fmt::Debug for Params {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Params(..)")
    }
}

/// Socket configuration.
#[derive(Debug, Clone)]
pub struct SocketConfig {
    /// Endpoint the socket connects to, e.g. `wss://example.com/socket`.
    pub endpoint: Url,

    /// Default timeout for join, leave and push replies.
    pub timeout: Duration,

    /// Interval between heartbeats.
    pub heartbeat_interval: Duration,

    /// Disable heartbeats entirely.
    pub skip_heartbeat: bool,

    /// Delay before each reconnect attempt.
    pub reconnect_after: Backoff,

    /// Delay before each channel rejoin attempt.
    pub rejoin_after: Backoff,

    /// Serializer protocol version sent as the `vsn` query param.
    pub vsn: String,

    /// Extra headers for the connection request.
    pub headers: Vec<(String, String)>,

    /// Query params appended to the endpoint.
    pub params: Params,
}

impl SocketConfig {
    /// Configuration with defaults for `endpoint`.
    pub fn new(endpoint: Url) -> Self {
        Self {
            endpoint,
            timeout: DEFAULT_TIMEOUT,
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            skip_heartbeat: false,
            reconnect_after: Backoff::reconnect_default(),
            rejoin_after: Backoff::rejoin_default(),
            vsn: DEFAULT_VSN.to_string(),
            headers: Vec::new(),
            params: Params::default(),
        }
    }
}

/// Builder for a [`Socket`].
///
/// # Example
///
/// ```ignore
/// use phoenix_channels::client::Socket;
/// use std::time::Duration;
///
/// let socket = Socket::builder("wss://example.com/socket")
///     .param("token", "secret")
///     .heartbeat_interval(Duration::from_secs(15))
///     .build()?;
/// socket.connect();
/// ```
pub struct SocketBuilder {
    endpoint: String,
    timeout: Duration,
    heartbeat_interval: Duration,
    skip_heartbeat: bool,
    reconnect_after: Backoff,
    rejoin_after: Backoff,
    vsn: String,
    headers: Vec<(String, String)>,
    params: ParamsSource,
    scheduler: Option<Arc<dyn Scheduler>>,
    transport: Option<Arc<dyn TransportFactory>>,
    serializer: Arc<dyn Serializer>,
}

enum ParamsSource {
    Fixed(Payload),
    Dynamic(Params),
}

impl SocketBuilder {
    /// Create a builder for `endpoint`. The endpoint is validated by [`build`](Self::build).
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            timeout: DEFAULT_TIMEOUT,
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            skip_heartbeat: false,
            reconnect_after: Backoff::reconnect_default(),
            rejoin_after: Backoff::rejoin_default(),
            vsn: DEFAULT_VSN.to_string(),
            headers: Vec::new(),
            params: ParamsSource::Fixed(Payload::new()),
            scheduler: None,
            transport: None,
            serializer: Arc::new(JsonSerializer),
        }
    }

    /// Set the default reply timeout.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Set the heartbeat interval.
    pub fn heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    /// Enable or disable heartbeats.
    pub fn skip_heartbeat(mut self, skip: bool) -> Self {
        self.skip_heartbeat = skip;
        self
    }

    /// Set the reconnect schedule.
    pub fn reconnect_after(mut self, backoff: Backoff) -> Self {
        self.reconnect_after = backoff;
        self
    }

    /// Set the rejoin schedule.
    pub fn rejoin_after(mut self, backoff: Backoff) -> Self {
        self.rejoin_after = backoff;
        self
    }

    /// Set the protocol version.
    pub fn vsn(mut self, vsn: impl Into<String>) -> Self {
        self.vsn = vsn.into();
        self
    }

    /// Add a connection request header.
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// Add a constant connect param.
    ///
    /// Ignored once [`params_with`](Self::params_with) has been called.
    pub fn param(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        if let ParamsSource::Fixed(params) = &mut self.params {
            params.insert(key.into(), value.into());
        }
        self
    }

    /// Replace the connect params with a constant map.
    pub fn params(mut self, params: Payload) -> Self {
        self.params = ParamsSource::Fixed(params);
        self
    }

    /// Resolve connect params with `f` at every connect.
    pub fn params_with<F>(mut self, f: F) -> Self
    where
        F: Fn() -> Payload + Send + Sync + 'static,
    {
        self.params = ParamsSource::Dynamic(Params::new(f));
        self
    }

    /// Use a custom scheduler for all timers.
    pub fn scheduler(mut self, scheduler: Arc<dyn Scheduler>) -> Self {
        self.scheduler = Some(scheduler);
        self
    }

    /// Use a custom transport factory.
    pub fn transport(mut self, factory: Arc<dyn TransportFactory>) -> Self {
        self.transport = Some(factory);
        self
    }

    /// Use a custom wire serializer.
    pub fn serializer(mut self, serializer: Arc<dyn Serializer>) -> Self {
        self.serializer = serializer;
        self
    }

    /// Build the socket. The socket is not connected.
    pub fn build(self) -> Result<Socket, SocketError> {
        let endpoint = parse_endpoint(&self.endpoint)?;
        let scheduler = match self.scheduler {
            Some(scheduler) => scheduler,
            None => default_scheduler()?,
        };
        let transport = match self.transport {
            Some(transport) => transport,
            None => default_transport()?,
        };
        let params = match self.params {
            ParamsSource::Fixed(payload) => Params::fixed(payload),
            ParamsSource::Dynamic(params) => params,
        };

        let config = SocketConfig {
            endpoint,
            timeout: self.timeout,
            heartbeat_interval: self.heartbeat_interval,
            skip_heartbeat: self.skip_heartbeat,
            reconnect_after: self.reconnect_after,
            rejoin_after: self.rejoin_after,
            vsn: self.vsn,
            headers: self.headers,
            params,
        };
        Ok(Socket::with_parts(config, scheduler, transport, self.serializer))
    }
}

impl fmt::Debug for SocketBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SocketBuilder")
            .field("endpoint", &self.endpoint)
            .field("timeout", &self.timeout)
            .field("heartbeat_interval", &self.heartbeat_interval)
            .field("skip_heartbeat", &self.skip_heartbeat)
            .field("vsn", &self.vsn)
            .finish_non_exhaustive()
    }
}

#[cfg(feature = "runtime")]
fn default_scheduler() -> Result<Arc<dyn Scheduler>, SocketError> {
    crate::transport::TokioScheduler::current()
        .map(|scheduler| Arc::new(scheduler) as Arc<dyn Scheduler>)
        .ok_or(SocketError::NoScheduler)
}

#[cfg(not(feature = "runtime"))]
fn default_scheduler() -> Result<Arc<dyn Scheduler>, SocketError> {
    Err(SocketError::NoScheduler)
}

#[cfg(feature = "websocket")]
fn default_transport() -> Result<Arc<dyn TransportFactory>, SocketError> {
    Ok(Arc::new(crate::transport::WebSocketFactory::new()))
}

#[cfg(not(feature = "websocket"))]
fn default_transport() -> Result<Arc<dyn TransportFactory>, SocketError> {
    Err(SocketError::NoTransport)
}
