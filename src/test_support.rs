//! In-memory transport and socket fixture for unit tests.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::{Value, json};
use url::Url;

use crate::client::{Channel, Socket, SocketBuilder};
use crate::core::{Message, Payload};
use crate::transport::{
    JsonSerializer, ManualScheduler, Serializer, Transport, TransportDelegate, TransportError, TransportFactory,
};

/// Transport that records outbound frames and lets tests inject events.
pub(crate) struct MockTransport {
    url: Url,
    delegate: Arc<dyn TransportDelegate>,
    connects: AtomicUsize,
    headers: Mutex<Vec<(String, String)>>,
    sent: Mutex<Vec<String>>,
    disconnects: Mutex<Vec<(u16, Option<String>)>>,
}

impl MockTransport {
    pub(crate) fn url(&self) -> &Url {
        &self.url
    }

    pub(crate) fn connect_count(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    pub(crate) fn headers(&self) -> Vec<(String, String)> {
        self.headers.lock().clone()
    }

    pub(crate) fn sent(&self) -> Vec<String> {
        self.sent.lock().clone()
    }

    pub(crate) fn sent_messages(&self) -> Vec<Message> {
        self.sent()
            .iter()
            .map(|text| JsonSerializer.decode(text).unwrap())
            .collect()
    }

    pub(crate) fn last_message(&self) -> Option<Message> {
        self.sent_messages().pop()
    }

    pub(crate) fn events(&self) -> Vec<String> {
        self.sent_messages().into_iter().map(|m| m.event).collect()
    }

    pub(crate) fn disconnects(&self) -> Vec<(u16, Option<String>)> {
        self.disconnects.lock().clone()
    }

    pub(crate) fn open(&self) {
        self.delegate.on_open();
    }

    pub(crate) fn close(&self, code: u16) {
        self.delegate.on_close(code, None);
    }

    pub(crate) fn fail(&self) {
        self.fail_with(TransportError::Connect("connection refused".into()));
    }

    pub(crate) fn fail_with(&self, error: TransportError) {
        self.delegate.on_error(error);
    }

    pub(crate) fn receive(&self, text: &str) {
        self.delegate.on_message(text.to_string());
    }
}

impl Transport for MockTransport {
    fn connect(&self, headers: &[(String, String)]) {
        self.connects.fetch_add(1, Ordering::SeqCst);
        *self.headers.lock() = headers.to_vec();
    }

    fn disconnect(&self, code: u16, reason: Option<&str>) {
        self.disconnects.lock().push((code, reason.map(str::to_string)));
    }

    fn send(&self, data: String) {
        self.sent.lock().push(data);
    }
}

/// Factory handing out [`MockTransport`]s and remembering each one.
#[derive(Default)]
pub(crate) struct MockFactory {
    transports: Mutex<Vec<Arc<MockTransport>>>,
}

impl MockFactory {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn count(&self) -> usize {
        self.transports.lock().len()
    }

    pub(crate) fn last(&self) -> Option<Arc<MockTransport>> {
        self.transports.lock().last().cloned()
    }
}

impl TransportFactory for MockFactory {
    fn create(&self, url: Url, delegate: Arc<dyn TransportDelegate>) -> Arc<dyn Transport> {
        let transport = Arc::new(MockTransport {
            url,
            delegate,
            connects: AtomicUsize::new(0),
            headers: Mutex::new(Vec::new()),
            sent: Mutex::new(Vec::new()),
            disconnects: Mutex::new(Vec::new()),
        });
        self.transports.lock().push(Arc::clone(&transport));
        transport
    }
}

/// A socket on a manual clock and mock transport.
pub(crate) struct Fixture {
    pub(crate) socket: Socket,
    pub(crate) scheduler: ManualScheduler,
    pub(crate) factory: Arc<MockFactory>,
}

impl Fixture {
    /// Unconnected socket with heartbeats disabled.
    pub(crate) fn new() -> Self {
        Self::with(|builder| builder)
    }

    /// Unconnected socket, customised by `configure`. Heartbeats are off
    /// unless `configure` turns them back on.
    pub(crate) fn with(configure: impl FnOnce(SocketBuilder) -> SocketBuilder) -> Self {
        let scheduler = ManualScheduler::new();
        let factory = Arc::new(MockFactory::new());
        let builder = Socket::builder("ws://localhost:4000/socket")
            .scheduler(Arc::new(scheduler.clone()))
            .transport(factory.clone())
            .skip_heartbeat(true);
        let socket = configure(builder).build().unwrap();
        Self {
            socket,
            scheduler,
            factory,
        }
    }

    /// Socket with an open connection.
    pub(crate) fn connected() -> Self {
        let fixture = Self::new();
        fixture.connect();
        fixture
    }

    /// Connect and open the transport.
    pub(crate) fn connect(&self) {
        self.socket.connect();
        self.transport().open();
    }

    /// Most recently created transport.
    pub(crate) fn transport(&self) -> Arc<MockTransport> {
        self.factory.last().expect("no transport created")
    }

    pub(crate) fn receive(&self, text: &str) {
        self.transport().receive(text);
    }

    pub(crate) fn advance(&self, by: Duration) {
        self.scheduler.advance(by);
    }

    /// Channel joined through an `ok` reply.
    pub(crate) fn joined_channel(&self, topic: &str) -> Channel {
        let channel = self.socket.channel(topic, Payload::new());
        let join = channel.join().unwrap();
        let join_ref = join.msg_ref().unwrap();
        self.receive(&reply_frame(&channel, &join_ref, "ok", json!({})));
        assert!(channel.is_joined());
        channel
    }
}

/// Wire frame for an inbound message.
pub(crate) fn frame(join_ref: Option<&str>, msg_ref: Option<&str>, topic: &str, event: &str, payload: Value) -> String {
    json!([join_ref, msg_ref, topic, event, payload]).to_string()
}

/// Wire frame replying to `msg_ref` on `channel`'s current join.
pub(crate) fn reply_frame(channel: &Channel, msg_ref: &str, status: &str, response: Value) -> String {
    frame(
        channel.join_ref().as_deref(),
        Some(msg_ref),
        channel.topic(),
        "phx_reply",
        json!({"status": status, "response": response}),
    )
}
