//! Connection manager.
//!
//! A [`Socket`] owns one transport at a time and multiplexes every
//! [`Channel`] over it. It is the only writer to the transport: channels and
//! pushes go through [`Socket::push`], which sends immediately when the
//! connection is open and buffers otherwise.
//!
//! Liveness is checked with heartbeats on the `phoenix` topic. A heartbeat
//! that is still unanswered when the next one is due closes the connection
//! abnormally, which schedules a reconnect using the configured backoff.

use std::fmt;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tracing::{debug, info, trace, warn};
use url::Url;

use super::channel::Channel;
use super::config::{SocketBuilder, SocketConfig};
use crate::core::{CLOSE_NORMAL, HEARTBEAT, HEARTBEAT_TOPIC, Message, Payload};
use crate::transport::{
    ConnectionPhase, HeartbeatTimer, Scheduler, Serializer, TimeoutTimer, Transport, TransportDelegate,
    TransportError, TransportFactory, build_endpoint_url,
};

type OpenCallback = Arc<dyn Fn() + Send + Sync>;
type CloseCallback = Arc<dyn Fn(u16, Option<&str>) + Send + Sync>;
type ErrorCallback = Arc<dyn Fn(&TransportError) + Send + Sync>;
type MessageCallback = Arc<dyn Fn(&Message) + Send + Sync>;

/// A Phoenix socket.
///
/// Cheap to clone; clones share the same connection.
#[derive(Clone)]
pub struct Socket {
    inner: Arc<SocketInner>,
}

/// Non-owning handle to a socket, held by its channels.
#[derive(Clone)]
pub(crate) struct WeakSocket(Weak<SocketInner>);

impl WeakSocket {
    pub(crate) fn upgrade(&self) -> Option<Socket> {
        self.0.upgrade().map(|inner| Socket { inner })
    }
}

struct SocketInner {
    config: SocketConfig,
    scheduler: Arc<dyn Scheduler>,
    factory: Arc<dyn TransportFactory>,
    serializer: Arc<dyn Serializer>,
    state: Mutex<SocketState>,
    reconnect_timer: TimeoutTimer,
    heartbeat: HeartbeatTimer,
    callbacks: Mutex<SocketCallbacks>,
}

struct SocketState {
    connection: Option<Arc<dyn Transport>>,
    /// Bumped whenever a transport is created or discarded; delegates carry
    /// the value they were created with and are ignored once it moves on.
    connection_id: u64,
    phase: ConnectionPhase,
    close_was_clean: bool,
    ref_counter: u64,
    pending_heartbeat_ref: Option<String>,
    channels: Vec<Channel>,
    /// Frames waiting for the connection to open, with their push ref.
    send_buffer: Vec<(Option<String>, String)>,
    endpoint_url: Option<Url>,
}

#[derive(Default)]
struct SocketCallbacks {
    next_ref: u64,
    open: Vec<(String, OpenCallback)>,
    close: Vec<(String, CloseCallback)>,
    error: Vec<(String, ErrorCallback)>,
    message: Vec<(String, MessageCallback)>,
}

impl SocketCallbacks {
    fn next_ref(&mut self) -> String {
        self.next_ref += 1;
        self.next_ref.to_string()
    }
}

impl Socket {
    /// Start building a socket for `endpoint`.
    pub fn builder(endpoint: impl Into<String>) -> SocketBuilder {
        SocketBuilder::new(endpoint)
    }

    pub(crate) fn with_parts(
        config: SocketConfig,
        scheduler: Arc<dyn Scheduler>,
        factory: Arc<dyn TransportFactory>,
        serializer: Arc<dyn Serializer>,
    ) -> Self {
        let inner = Arc::new_cyclic(|weak: &Weak<SocketInner>| {
            let weak = weak.clone();
            let reconnect_timer = TimeoutTimer::new(
                Arc::clone(&scheduler),
                config.reconnect_after.clone(),
                Arc::new(move || {
                    if let Some(inner) = weak.upgrade() {
                        Socket { inner }.reconnect();
                    }
                }),
            );
            let heartbeat = HeartbeatTimer::new(Arc::clone(&scheduler), config.heartbeat_interval);

            SocketInner {
                config,
                scheduler,
                factory,
                serializer,
                state: Mutex::new(SocketState {
                    connection: None,
                    connection_id: 0,
                    phase: ConnectionPhase::Closed,
                    close_was_clean: false,
                    ref_counter: 0,
                    pending_heartbeat_ref: None,
                    channels: Vec::new(),
                    send_buffer: Vec::new(),
                    endpoint_url: None,
                }),
                reconnect_timer,
                heartbeat,
                callbacks: Mutex::new(SocketCallbacks::default()),
            }
        });
        Self { inner }
    }

    pub(crate) fn downgrade(&self) -> WeakSocket {
        WeakSocket(Arc::downgrade(&self.inner))
    }

    pub(crate) fn scheduler(&self) -> Arc<dyn Scheduler> {
        Arc::clone(&self.inner.scheduler)
    }

    /// Socket configuration.
    pub fn config(&self) -> &SocketConfig {
        &self.inner.config
    }

    /// URL of the current or most recent connection attempt.
    pub fn endpoint_url(&self) -> Option<Url> {
        self.inner.state.lock().endpoint_url.clone()
    }

    /// Current connection phase.
    pub fn connection_phase(&self) -> ConnectionPhase {
        self.inner.state.lock().phase
    }

    /// Check if the connection is open.
    pub fn is_connected(&self) -> bool {
        self.connection_phase() == ConnectionPhase::Open
    }

    // =========================================================================
    // CONNECTION
    // =========================================================================

    /// Open the connection.
    ///
    /// Does nothing while a connection is open or opening. Connect params are
    /// resolved now, so every reconnect sees fresh values.
    pub fn connect(&self) {
        let connection_id = {
            let mut state = self.inner.state.lock();
            if matches!(state.phase, ConnectionPhase::Open | ConnectionPhase::Connecting) {
                return;
            }
            state.close_was_clean = false;
            state.phase = ConnectionPhase::Connecting;
            state.connection_id = state.connection_id.wrapping_add(1);
            state.connection_id
        };

        let params = self.inner.config.params.resolve();
        let url = build_endpoint_url(&self.inner.config.endpoint, &params, &self.inner.config.vsn);
        let delegate = Arc::new(SocketDelegate {
            socket: self.downgrade(),
            connection_id,
        });
        let transport = self.inner.factory.create(url.clone(), delegate);

        {
            let mut state = self.inner.state.lock();
            if state.connection_id != connection_id {
                // Torn down while the transport was being created.
                return;
            }
            state.connection = Some(Arc::clone(&transport));
            state.endpoint_url = Some(url);
        }

        debug!(endpoint = %self.inner.config.endpoint, "connecting");
        transport.connect(&self.inner.config.headers);
    }

    /// Close the connection with code 1000 and stop reconnecting.
    pub fn disconnect(&self) {
        self.disconnect_with(CLOSE_NORMAL, None, || {});
    }

    /// Close the connection and stop reconnecting.
    ///
    /// Close observers run synchronously, then `callback`.
    pub fn disconnect_with<F>(&self, code: u16, reason: Option<&str>, callback: F)
    where
        F: FnOnce(),
    {
        self.inner.state.lock().close_was_clean = true;
        self.inner.reconnect_timer.reset();
        self.teardown(code, reason);
        callback();
    }

    fn reconnect(&self) {
        debug!(tries = self.inner.reconnect_timer.tries(), "reconnecting");
        self.teardown(CLOSE_NORMAL, Some("reconnection"));
        self.connect();
    }

    /// Discard the current transport without waiting for its close report.
    fn teardown(&self, code: u16, reason: Option<&str>) {
        let connection = {
            let mut state = self.inner.state.lock();
            state.connection_id = state.connection_id.wrapping_add(1);
            state.phase = ConnectionPhase::Closed;
            state.pending_heartbeat_ref = None;
            state.connection.take()
        };
        if let Some(connection) = connection {
            connection.disconnect(code, reason);
        }
        self.inner.heartbeat.stop();
        self.trigger_chan_error();

        for callback in self.close_callbacks() {
            callback(code, reason);
        }
    }

    /// Close the transport without marking the close clean, so that a
    /// reconnect follows.
    fn abnormal_close(&self, reason: &str) {
        let (connection, connection_id) = {
            let mut state = self.inner.state.lock();
            state.close_was_clean = false;
            state.phase = ConnectionPhase::Closing;
            (state.connection.clone(), state.connection_id)
        };
        if let Some(connection) = connection {
            connection.disconnect(CLOSE_NORMAL, Some(reason));
        }
        // A transport that reported the close itself has already moved the
        // connection id on, making this a no-op.
        self.handle_close(connection_id, CLOSE_NORMAL, Some(reason.to_string()));
    }

    // =========================================================================
    // SENDING
    // =========================================================================

    /// Generate the next message ref.
    ///
    /// Refs are shared by heartbeats and pushes and wrap to `0` after `u64::MAX`.
    pub fn make_ref(&self) -> String {
        next_ref(&mut self.inner.state.lock())
    }

    /// Send a message, or buffer it until the connection opens.
    pub fn push(
        &self,
        topic: &str,
        event: &str,
        payload: Payload,
        msg_ref: Option<String>,
        join_ref: Option<String>,
    ) {
        let message = Message::new(topic, event, payload)
            .with_ref(msg_ref.clone())
            .with_join_ref(join_ref);
        let frame = match self.inner.serializer.encode(&message) {
            Ok(frame) => frame,
            Err(error) => {
                warn!(topic, event, error = %error, "dropping unencodable push");
                return;
            }
        };

        let mut state = self.inner.state.lock();
        match (&state.connection, state.phase) {
            (Some(connection), ConnectionPhase::Open) => {
                trace!(topic, event, msg_ref = ?message.msg_ref, "push");
                connection.send(frame);
            }
            _ => {
                trace!(topic, event, msg_ref = ?message.msg_ref, "buffering push until connected");
                state.send_buffer.push((msg_ref, frame));
            }
        }
    }

    /// Drop any buffered frame sent with `msg_ref`.
    pub(crate) fn remove_from_send_buffer(&self, msg_ref: &str) {
        self.inner
            .state
            .lock()
            .send_buffer
            .retain(|(buffered, _)| buffered.as_deref() != Some(msg_ref));
    }

    fn send_heartbeat(&self) {
        enum Beat {
            Skip,
            Send(String),
            TimedOut,
        }

        let beat = {
            let mut state = self.inner.state.lock();
            if state.phase != ConnectionPhase::Open {
                Beat::Skip
            } else if state.pending_heartbeat_ref.is_some() {
                state.pending_heartbeat_ref = None;
                Beat::TimedOut
            } else {
                let heartbeat_ref = next_ref(&mut state);
                state.pending_heartbeat_ref = Some(heartbeat_ref.clone());
                Beat::Send(heartbeat_ref)
            }
        };

        match beat {
            Beat::Skip => {}
            Beat::TimedOut => {
                warn!("heartbeat timeout, closing connection");
                self.abnormal_close("heartbeat timeout");
            }
            Beat::Send(heartbeat_ref) => {
                self.push(HEARTBEAT_TOPIC, HEARTBEAT, Payload::new(), Some(heartbeat_ref), None);
            }
        }
    }

    fn reset_heartbeat(&self) {
        self.inner.state.lock().pending_heartbeat_ref = None;
        self.inner.heartbeat.stop();
        if self.inner.config.skip_heartbeat {
            return;
        }

        let weak = self.downgrade();
        self.inner.heartbeat.start(Arc::new(move || {
            if let Some(socket) = weak.upgrade() {
                socket.send_heartbeat();
            }
        }));
    }

    // =========================================================================
    // CHANNELS
    // =========================================================================

    /// Create a channel for `topic`. The channel is not joined.
    pub fn channel(&self, topic: impl Into<String>, params: Payload) -> Channel {
        let channel = Channel::new(topic.into(), params, self);
        self.inner.state.lock().channels.push(channel.clone());
        channel
    }

    /// Remove a channel from the socket.
    ///
    /// Channels are compared by identity, so another channel on the same
    /// topic is left alone.
    pub fn remove(&self, channel: &Channel) {
        self.inner
            .state
            .lock()
            .channels
            .retain(|existing| !existing.ptr_eq(channel));
    }

    /// Channels currently registered.
    pub fn channels(&self) -> Vec<Channel> {
        self.inner.state.lock().channels.clone()
    }

    /// Leave every other joined or joining channel on `topic`.
    pub(crate) fn leave_open_topic(&self, topic: &str, except: &Channel) {
        let duplicates: Vec<Channel> = self
            .channels()
            .into_iter()
            .filter(|channel| channel.topic() == topic && !channel.ptr_eq(except))
            .filter(|channel| channel.is_joined() || channel.is_joining())
            .collect();

        for channel in duplicates {
            debug!(topic, "leaving duplicate topic");
            channel.leave();
        }
    }

    fn trigger_chan_error(&self) {
        for channel in self.channels() {
            if !(channel.is_errored() || channel.is_leaving() || channel.is_closed()) {
                channel.trigger_error();
            }
        }
    }

    // =========================================================================
    // OBSERVERS
    // =========================================================================

    /// Run `callback` whenever the connection opens. Returns a ref for [`off`](Self::off).
    pub fn on_open<F>(&self, callback: F) -> String
    where
        F: Fn() + Send + Sync + 'static,
    {
        let mut callbacks = self.inner.callbacks.lock();
        let id = callbacks.next_ref();
        callbacks.open.push((id.clone(), Arc::new(callback)));
        id
    }

    /// Run `callback` whenever the connection closes, with the close code and reason.
    pub fn on_close<F>(&self, callback: F) -> String
    where
        F: Fn(u16, Option<&str>) + Send + Sync + 'static,
    {
        let mut callbacks = self.inner.callbacks.lock();
        let id = callbacks.next_ref();
        callbacks.close.push((id.clone(), Arc::new(callback)));
        id
    }

    /// Run `callback` on transport errors.
    pub fn on_error<F>(&self, callback: F) -> String
    where
        F: Fn(&TransportError) + Send + Sync + 'static,
    {
        let mut callbacks = self.inner.callbacks.lock();
        let id = callbacks.next_ref();
        callbacks.error.push((id.clone(), Arc::new(callback)));
        id
    }

    /// Run `callback` for every decoded inbound message, after channel dispatch.
    pub fn on_message<F>(&self, callback: F) -> String
    where
        F: Fn(&Message) + Send + Sync + 'static,
    {
        let mut callbacks = self.inner.callbacks.lock();
        let id = callbacks.next_ref();
        callbacks.message.push((id.clone(), Arc::new(callback)));
        id
    }

    /// Remove observers by ref.
    pub fn off(&self, refs: &[String]) {
        let mut callbacks = self.inner.callbacks.lock();
        callbacks.open.retain(|(id, _)| !refs.contains(id));
        callbacks.close.retain(|(id, _)| !refs.contains(id));
        callbacks.error.retain(|(id, _)| !refs.contains(id));
        callbacks.message.retain(|(id, _)| !refs.contains(id));
    }

    /// Remove every observer.
    pub fn release_callbacks(&self) {
        let mut callbacks = self.inner.callbacks.lock();
        callbacks.open.clear();
        callbacks.close.clear();
        callbacks.error.clear();
        callbacks.message.clear();
    }

    fn close_callbacks(&self) -> Vec<CloseCallback> {
        let callbacks = self.inner.callbacks.lock();
        callbacks.close.iter().map(|(_, cb)| Arc::clone(cb)).collect()
    }

    // =========================================================================
    // TRANSPORT EVENTS
    // =========================================================================

    fn is_current(&self, connection_id: u64) -> bool {
        self.inner.state.lock().connection_id == connection_id
    }

    fn handle_open(&self, connection_id: u64) {
        {
            let mut state = self.inner.state.lock();
            if state.connection_id != connection_id {
                return;
            }
            state.phase = ConnectionPhase::Open;

            let buffered = std::mem::take(&mut state.send_buffer);
            if let Some(connection) = &state.connection {
                for (_, frame) in buffered {
                    connection.send(frame);
                }
            }
        }

        info!(endpoint = %self.inner.config.endpoint, "connected");
        self.inner.reconnect_timer.reset();
        self.reset_heartbeat();

        let callbacks: Vec<OpenCallback> = {
            let callbacks = self.inner.callbacks.lock();
            callbacks.open.iter().map(|(_, cb)| Arc::clone(cb)).collect()
        };
        for callback in callbacks {
            callback();
        }
        for channel in self.channels() {
            channel.on_socket_open();
        }
    }

    fn handle_close(&self, connection_id: u64, code: u16, reason: Option<String>) {
        let clean = {
            let mut state = self.inner.state.lock();
            if state.connection_id != connection_id {
                return;
            }
            state.connection_id = state.connection_id.wrapping_add(1);
            state.phase = ConnectionPhase::Closed;
            state.connection = None;
            state.pending_heartbeat_ref = None;
            state.close_was_clean
        };

        info!(code, reason = ?reason, clean, "connection closed");
        self.trigger_chan_error();
        self.inner.heartbeat.stop();
        if !clean {
            self.schedule_reconnect();
        }

        for callback in self.close_callbacks() {
            callback(code, reason.as_deref());
        }
    }

    fn handle_error(&self, connection_id: u64, error: TransportError) {
        let fatal = error.is_fatal();
        let clean = {
            let mut state = self.inner.state.lock();
            if state.connection_id != connection_id {
                return;
            }
            if fatal {
                state.close_was_clean = true;
            }
            state.close_was_clean
        };

        if fatal {
            warn!(error = %error, "fatal transport error, not reconnecting");
            self.inner.reconnect_timer.reset();
        } else {
            warn!(error = %error, "transport error");
        }
        self.trigger_chan_error();
        for channel in self.channels() {
            channel.on_socket_error();
        }
        if !clean {
            self.schedule_reconnect();
        }

        let callbacks: Vec<ErrorCallback> = {
            let callbacks = self.inner.callbacks.lock();
            callbacks.error.iter().map(|(_, cb)| Arc::clone(cb)).collect()
        };
        for callback in callbacks {
            callback(&error);
        }
    }

    fn handle_message(&self, connection_id: u64, text: String) {
        if !self.is_current(connection_id) {
            return;
        }
        let message = match self.inner.serializer.decode(&text) {
            Ok(message) => message,
            Err(error) => {
                warn!(error = %error, "dropping malformed frame");
                return;
            }
        };
        trace!(
            topic = %message.topic,
            event = %message.event,
            msg_ref = ?message.msg_ref,
            join_ref = ?message.join_ref,
            "receive"
        );

        let channels = {
            let mut state = self.inner.state.lock();
            if message.msg_ref.is_some() && message.msg_ref == state.pending_heartbeat_ref {
                state.pending_heartbeat_ref = None;
            }
            state.channels.clone()
        };

        for channel in channels.iter().filter(|channel| channel.is_member(&message)) {
            channel.trigger(message.clone());
        }

        let callbacks: Vec<MessageCallback> = {
            let callbacks = self.inner.callbacks.lock();
            callbacks.message.iter().map(|(_, cb)| Arc::clone(cb)).collect()
        };
        for callback in callbacks {
            callback(&message);
        }
    }

    fn schedule_reconnect(&self) {
        let timer = &self.inner.reconnect_timer;
        let delay = self.inner.config.reconnect_after.delay(timer.tries() + 1);
        debug!(tries = timer.tries(), delay_ms = delay.as_millis() as u64, "scheduling reconnect");
        timer.schedule_timeout();
    }

    #[cfg(test)]
    pub(crate) fn set_ref_counter(&self, value: u64) {
        self.inner.state.lock().ref_counter = value;
    }

    #[cfg(test)]
    pub(crate) fn send_buffer_len(&self) -> usize {
        self.inner.state.lock().send_buffer.len()
    }

    #[cfg(test)]
    pub(crate) fn pending_heartbeat_ref(&self) -> Option<String> {
        self.inner.state.lock().pending_heartbeat_ref.clone()
    }
}

fn next_ref(state: &mut SocketState) -> String {
    state.ref_counter = if state.ref_counter == u64::MAX {
        0
    } else {
        state.ref_counter + 1
    };
    state.ref_counter.to_string()
}

impl fmt::Debug for Socket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("Socket")
            .field("endpoint", &self.inner.config.endpoint.as_str())
            .field("phase", &state.phase)
            .field("heartbeat_interval", &self.inner.heartbeat.interval())
            .field("channels", &state.channels.len())
            .field("buffered", &state.send_buffer.len())
            .finish()
    }
}

/// Delegate handed to one transport instance.
struct SocketDelegate {
    socket: WeakSocket,
    connection_id: u64,
}

impl TransportDelegate for SocketDelegate {
    fn on_open(&self) {
        if let Some(socket) = self.socket.upgrade() {
            socket.handle_open(self.connection_id);
        }
    }

    fn on_close(&self, code: u16, reason: Option<String>) {
        if let Some(socket) = self.socket.upgrade() {
            socket.handle_close(self.connection_id, code, reason);
        }
    }

    fn on_error(&self, error: TransportError) {
        if let Some(socket) = self.socket.upgrade() {
            socket.handle_error(self.connection_id, error);
        }
    }

    fn on_message(&self, text: String) {
        if let Some(socket) = self.socket.upgrade() {
            socket.handle_message(self.connection_id, text);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{CLOSE_ABNORMAL, to_payload};
    use crate::test_support::{Fixture, frame, reply_frame};
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn counter() -> Arc<AtomicUsize> {
        Arc::new(AtomicUsize::new(0))
    }

    #[test]
    fn test_make_ref_increments_and_wraps() {
        let fixture = Fixture::new();
        let socket = &fixture.socket;

        assert_eq!(socket.make_ref(), "1");
        assert_eq!(socket.make_ref(), "2");
        assert_eq!(socket.make_ref(), "3");

        socket.set_ref_counter(u64::MAX - 1);
        assert_eq!(socket.make_ref(), u64::MAX.to_string());
        assert_eq!(socket.make_ref(), "0");
        assert_eq!(socket.make_ref(), "1");
    }

    #[test]
    fn test_connect_is_idempotent() {
        let fixture = Fixture::new();

        fixture.socket.connect();
        fixture.socket.connect();
        assert_eq!(fixture.factory.count(), 1);
        assert_eq!(fixture.socket.connection_phase(), ConnectionPhase::Connecting);

        fixture.transport().open();
        fixture.socket.connect();
        assert_eq!(fixture.factory.count(), 1);
        assert_eq!(fixture.transport().connect_count(), 1);
        assert!(fixture.socket.is_connected());
    }

    #[test]
    fn test_params_resolved_at_each_connect() {
        let calls = counter();
        let source = Arc::clone(&calls);
        let fixture = Fixture::with(move |builder| {
            builder.params_with(move || {
                to_payload(json!({"token": format!("t{}", source.fetch_add(1, Ordering::SeqCst))}))
            })
        });
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        fixture.connect();
        let url = fixture.transport().url().clone();
        assert_eq!(url.path(), "/socket/websocket");
        assert_eq!(
            url.query(),
            Some("vsn=2.0.0&token=t0"),
        );

        fixture.socket.disconnect();
        fixture.connect();
        assert_eq!(fixture.transport().url().query(), Some("vsn=2.0.0&token=t1"));
        assert_eq!(fixture.socket.endpoint_url().as_ref(), Some(fixture.transport().url()));
    }

    #[test]
    fn test_headers_passed_to_transport() {
        let fixture = Fixture::with(|builder| builder.header("x-api-key", "secret"));
        fixture.socket.connect();

        assert_eq!(
            fixture.transport().headers(),
            vec![("x-api-key".to_string(), "secret".to_string())]
        );
    }

    #[test]
    fn test_send_buffer_flushed_in_order_on_open() {
        let fixture = Fixture::new();
        for n in 1..=3 {
            fixture.socket.push("room:1", &format!("e{n}"), Payload::new(), None, None);
        }
        assert_eq!(fixture.socket.send_buffer_len(), 3);

        fixture.connect();

        assert_eq!(fixture.transport().events(), vec!["e1", "e2", "e3"]);
        assert_eq!(fixture.socket.send_buffer_len(), 0);

        fixture.socket.push("room:1", "e4", Payload::new(), None, None);
        assert_eq!(fixture.transport().events(), vec!["e1", "e2", "e3", "e4"]);
    }

    #[test]
    fn test_disconnect_is_clean() {
        let fixture = Fixture::connected();
        let log = Arc::new(Mutex::new(Vec::new()));

        let sink = Arc::clone(&log);
        fixture.socket.on_close(move |code, reason| {
            sink.lock().push(format!("close {code} {}", reason.unwrap_or("-")));
        });
        let sink = Arc::clone(&log);
        fixture
            .socket
            .disconnect_with(CLOSE_NORMAL, Some("bye"), move || sink.lock().push("done".into()));

        assert_eq!(*log.lock(), vec!["close 1000 bye".to_string(), "done".to_string()]);
        assert_eq!(fixture.transport().disconnects(), vec![(1000, Some("bye".to_string()))]);
        assert_eq!(fixture.socket.connection_phase(), ConnectionPhase::Closed);

        // A late close report from the discarded transport changes nothing.
        fixture.transport().close(CLOSE_NORMAL);
        fixture.advance(Duration::from_secs(60));
        assert_eq!(fixture.factory.count(), 1);
        assert_eq!(log.lock().len(), 2);
    }

    #[test]
    fn test_unclean_close_reconnects_with_backoff() {
        let fixture = Fixture::connected();
        let closes = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&closes);
        fixture.socket.on_close(move |code, reason| {
            sink.lock().push((code, reason.map(str::to_string)));
        });

        fixture.transport().close(CLOSE_ABNORMAL);
        assert_eq!(fixture.socket.connection_phase(), ConnectionPhase::Closed);

        fixture.advance(Duration::from_millis(9));
        assert_eq!(fixture.factory.count(), 1);
        fixture.advance(Duration::from_millis(1));
        assert_eq!(fixture.factory.count(), 2);
        assert_eq!(fixture.transport().connect_count(), 1);
        assert_eq!(
            *closes.lock(),
            vec![(CLOSE_ABNORMAL, None), (CLOSE_NORMAL, Some("reconnection".to_string()))]
        );

        // Second failure in a row waits for the next step.
        fixture.transport().close(CLOSE_ABNORMAL);
        fixture.advance(Duration::from_millis(49));
        assert_eq!(fixture.factory.count(), 2);
        fixture.advance(Duration::from_millis(1));
        assert_eq!(fixture.factory.count(), 3);

        // A successful open resets the schedule.
        fixture.transport().open();
        fixture.transport().close(CLOSE_ABNORMAL);
        fixture.advance(Duration::from_millis(10));
        assert_eq!(fixture.factory.count(), 4);
    }

    #[test]
    fn test_transport_error_schedules_reconnect() {
        let fixture = Fixture::connected();
        let errors = counter();
        let seen = Arc::clone(&errors);
        fixture.socket.on_error(move |_| {
            seen.fetch_add(1, Ordering::SeqCst);
        });

        fixture.transport().fail();
        fixture.transport().close(CLOSE_ABNORMAL);
        assert_eq!(errors.load(Ordering::SeqCst), 1);

        fixture.advance(Duration::from_millis(10));
        assert_eq!(fixture.factory.count(), 2);
        fixture.advance(Duration::from_secs(10));
        assert_eq!(fixture.factory.count(), 2);
    }

    #[test]
    fn test_stale_transport_is_ignored() {
        let fixture = Fixture::connected();
        let stale = fixture.transport();
        let messages = counter();
        let seen = Arc::clone(&messages);
        fixture.socket.on_message(move |_| {
            seen.fetch_add(1, Ordering::SeqCst);
        });

        stale.close(CLOSE_ABNORMAL);
        fixture.advance(Duration::from_millis(10));
        assert_eq!(fixture.factory.count(), 2);

        stale.open();
        stale.receive(&frame(None, None, "room:1", "new_msg", json!({})));
        assert_eq!(fixture.socket.connection_phase(), ConnectionPhase::Connecting);
        assert_eq!(messages.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_heartbeat_ack_and_timeout() {
        let fixture = Fixture::with(|builder| builder.skip_heartbeat(false));
        fixture.connect();

        fixture.advance(Duration::from_secs(30));
        let heartbeat = fixture.transport().last_message().unwrap();
        assert_eq!(heartbeat.topic, "phoenix");
        assert_eq!(heartbeat.event, "heartbeat");
        assert!(heartbeat.join_ref.is_none());
        assert_eq!(fixture.socket.pending_heartbeat_ref(), heartbeat.msg_ref);

        let ack = frame(
            None,
            heartbeat.msg_ref.as_deref(),
            "phoenix",
            "phx_reply",
            json!({"status": "ok", "response": {}}),
        );
        fixture.receive(&ack);
        assert!(fixture.socket.pending_heartbeat_ref().is_none());

        fixture.advance(Duration::from_secs(30));
        assert_eq!(fixture.transport().sent().len(), 2);
        assert!(fixture.transport().disconnects().is_empty());

        // No ack before the next beat: the connection is presumed dead.
        fixture.advance(Duration::from_secs(30));
        assert_eq!(
            fixture.transport().disconnects(),
            vec![(CLOSE_NORMAL, Some("heartbeat timeout".to_string()))]
        );
        assert_eq!(fixture.socket.connection_phase(), ConnectionPhase::Closed);

        fixture.advance(Duration::from_millis(10));
        assert_eq!(fixture.factory.count(), 2);
    }

    #[test]
    fn test_heartbeats_share_ref_counter() {
        let fixture = Fixture::with(|builder| builder.skip_heartbeat(false));
        fixture.connect();
        assert_eq!(fixture.socket.make_ref(), "1");

        fixture.advance(Duration::from_secs(30));
        let heartbeat = fixture.transport().last_message().unwrap();
        assert_eq!(heartbeat.msg_ref.as_deref(), Some("2"));
    }

    #[test]
    fn test_dispatch_to_member_channels_then_observers() {
        let fixture = Fixture::connected();
        let lobby = fixture.joined_channel("room:lobby");
        let other = fixture.joined_channel("room:other");
        let log = Arc::new(Mutex::new(Vec::new()));

        let sink = Arc::clone(&log);
        lobby.on("new_msg", move |m| sink.lock().push(format!("lobby {}", m.payload["body"])));
        let sink = Arc::clone(&log);
        other.on("new_msg", move |_| sink.lock().push("other".to_string()));
        let sink = Arc::clone(&log);
        fixture.socket.on_message(move |m| sink.lock().push(format!("socket {}", m.event)));

        fixture.receive(&frame(None, None, "room:lobby", "new_msg", json!({"body": "hi"})));

        assert_eq!(*log.lock(), vec!["lobby \"hi\"".to_string(), "socket new_msg".to_string()]);
    }

    #[test]
    fn test_malformed_frame_is_dropped() {
        let fixture = Fixture::connected();
        let messages = counter();
        let seen = Arc::clone(&messages);
        fixture.socket.on_message(move |_| {
            seen.fetch_add(1, Ordering::SeqCst);
        });

        fixture.receive("not json");
        fixture.receive(r#"{"topic":"room:1","event":"e","payload":{},"ref":null}"#);

        assert_eq!(messages.load(Ordering::SeqCst), 0);
        assert!(fixture.socket.is_connected());
    }

    #[test]
    fn test_close_errors_open_channels() {
        let fixture = Fixture::connected();
        let channel = fixture.joined_channel("room:lobby");
        let errors = counter();
        let seen = Arc::clone(&errors);
        channel.on_error(move |_| {
            seen.fetch_add(1, Ordering::SeqCst);
        });

        fixture.transport().close(CLOSE_ABNORMAL);
        assert!(channel.is_errored());
        assert_eq!(errors.load(Ordering::SeqCst), 1);

        // Reconnect teardown does not error the channel again.
        fixture.advance(Duration::from_millis(10));
        assert_eq!(errors.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_open_rejoins_errored_channels() {
        let fixture = Fixture::connected();
        let channel = fixture.joined_channel("room:lobby");
        let first_join = channel.join_ref();

        fixture.transport().close(CLOSE_ABNORMAL);
        fixture.advance(Duration::from_millis(10));
        fixture.transport().open();

        assert!(channel.is_joining());
        let join = fixture.transport().last_message().unwrap();
        assert_eq!(join.event, "phx_join");
        assert_eq!(join.join_ref, channel.join_ref());
        assert_ne!(channel.join_ref(), first_join);

        fixture.receive(&reply_frame(&channel, join.msg_ref.as_deref().unwrap(), "ok", json!({})));
        assert!(channel.is_joined());
        assert!(!channel.rejoin_pending());
    }

    #[test]
    fn test_observers_can_be_removed() {
        let fixture = Fixture::new();
        let opens = counter();

        let seen = Arc::clone(&opens);
        let first = fixture.socket.on_open(move || {
            seen.fetch_add(1, Ordering::SeqCst);
        });
        let seen = Arc::clone(&opens);
        fixture.socket.on_open(move || {
            seen.fetch_add(10, Ordering::SeqCst);
        });
        fixture.socket.off(&[first]);

        fixture.connect();
        assert_eq!(opens.load(Ordering::SeqCst), 10);

        fixture.socket.release_callbacks();
        fixture.transport().close(CLOSE_ABNORMAL);
        fixture.advance(Duration::from_millis(10));
        fixture.transport().open();
        assert_eq!(opens.load(Ordering::SeqCst), 10);
    }

    #[test]
    fn test_remove_matches_identity() {
        let fixture = Fixture::new();
        let first = fixture.socket.channel("room:1", Payload::new());
        let second = fixture.socket.channel("room:1", Payload::new());

        fixture.socket.remove(&first);

        let channels = fixture.socket.channels();
        assert_eq!(channels.len(), 1);
        assert!(channels[0].ptr_eq(&second));
    }

    #[test]
    fn test_fatal_transport_error_stops_reconnecting() {
        let fixture = Fixture::connected();
        let errors = counter();
        let seen = Arc::clone(&errors);
        fixture.socket.on_error(move |error| {
            assert!(error.is_fatal());
            seen.fetch_add(1, Ordering::SeqCst);
        });

        fixture.transport().fail_with(TransportError::NoRuntime);
        fixture.transport().close(CLOSE_ABNORMAL);
        assert_eq!(errors.load(Ordering::SeqCst), 1);
        assert_eq!(fixture.socket.connection_phase(), ConnectionPhase::Closed);

        fixture.advance(Duration::from_secs(60));
        assert_eq!(fixture.factory.count(), 1);

        // An explicit connect still works afterwards.
        fixture.socket.connect();
        assert_eq!(fixture.factory.count(), 2);
    }

    #[test]
    fn test_transport_error_errors_channels() {
        let fixture = Fixture::connected();
        let channel = fixture.joined_channel("room:1");
        let errors = counter();
        let seen = Arc::clone(&errors);
        channel.on_error(move |_| {
            seen.fetch_add(1, Ordering::SeqCst);
        });

        fixture.transport().fail();

        assert!(channel.is_errored());
        assert_eq!(errors.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_disconnect_cancels_pending_reconnect() {
        let fixture = Fixture::connected();

        fixture.transport().close(CLOSE_ABNORMAL);
        fixture.socket.disconnect();
        fixture.advance(Duration::from_secs(10));

        assert_eq!(fixture.factory.count(), 1);
        assert_eq!(fixture.socket.connection_phase(), ConnectionPhase::Closed);
    }

    #[test]
    fn test_debug_shows_heartbeat_interval() {
        let fixture = Fixture::with(|builder| builder.heartbeat_interval(Duration::from_secs(15)));
        let debug = format!("{:?}", fixture.socket);

        assert!(debug.contains("heartbeat_interval: 15s"));
    }
}
