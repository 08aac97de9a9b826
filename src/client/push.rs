//! Outbound events awaiting a correlated reply.
//!
//! Every send draws a fresh ref from the socket and binds a one-shot handler
//! on the channel under `chan_reply_<ref>`. Exactly one [`Reply`] resolves a
//! push: the server's reply, or a local timeout. Resolution retires the
//! binding and the timer, so late duplicates are ignored.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::Value;
use tracing::{debug, trace};

use super::channel::WeakChannel;
use crate::core::{Message, Payload, Reply, ReplyStatus, STATUS_TIMEOUT, reply_event_name};
use crate::transport::{Scheduler, TimerId};

type ReplyHook = Arc<dyn Fn(&Reply) + Send + Sync>;

/// Role of a push in its channel's lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PushKind {
    Join,
    Leave,
    Event,
}

/// A single outbound event.
///
/// Handles are cheap to clone and share state.
#[derive(Clone)]
pub struct Push {
    inner: Arc<PushInner>,
}

pub(crate) struct PushInner {
    channel: WeakChannel,
    event: String,
    kind: PushKind,
    scheduler: Arc<dyn Scheduler>,
    state: Mutex<PushState>,
}

struct PushState {
    payload: Payload,
    timeout: Duration,
    msg_ref: Option<String>,
    ref_event: Option<String>,
    sent: bool,
    received: Option<Reply>,
    hooks: HashMap<ReplyStatus, Vec<ReplyHook>>,
    timer: Option<TimerId>,
}

impl Push {
    pub(crate) fn new(
        channel: WeakChannel,
        scheduler: Arc<dyn Scheduler>,
        event: impl Into<String>,
        payload: Payload,
        timeout: Duration,
        kind: PushKind,
    ) -> Self {
        Self {
            inner: Arc::new(PushInner {
                channel,
                event: event.into(),
                kind,
                scheduler,
                state: Mutex::new(PushState {
                    payload,
                    timeout,
                    msg_ref: None,
                    ref_event: None,
                    sent: false,
                    received: None,
                    hooks: HashMap::new(),
                    timer: None,
                }),
            }),
        }
    }

    pub(crate) fn from_inner(inner: Arc<PushInner>) -> Self {
        Self { inner }
    }

    /// Event name.
    pub fn event(&self) -> &str {
        &self.inner.event
    }

    /// Payload sent with the event.
    pub fn payload(&self) -> Payload {
        self.inner.state.lock().payload.clone()
    }

    /// Replace the payload used by the next send.
    pub fn set_payload(&self, payload: Payload) {
        self.inner.state.lock().payload = payload;
    }

    /// Reply timeout.
    pub fn timeout(&self) -> Duration {
        self.inner.state.lock().timeout
    }

    /// Ref of the current attempt, once sent.
    pub fn msg_ref(&self) -> Option<String> {
        self.inner.state.lock().msg_ref.clone()
    }

    /// Check if the push has been sent since the last reset.
    pub fn is_sent(&self) -> bool {
        self.inner.state.lock().sent
    }

    /// Reply of the current attempt, if resolved.
    pub fn reply(&self) -> Option<Reply> {
        self.inner.state.lock().received.clone()
    }

    /// Check if the current attempt resolved with `status`.
    pub fn has_received(&self, status: ReplyStatus) -> bool {
        self.inner
            .state
            .lock()
            .received
            .as_ref()
            .is_some_and(|reply| reply.status() == status)
    }

    /// Register a hook for replies with `status`.
    ///
    /// Fires immediately if the push already resolved with that status.
    /// Hooks run in registration order.
    pub fn receive<F>(&self, status: ReplyStatus, callback: F) -> Push
    where
        F: Fn(&Reply) + Send + Sync + 'static,
    {
        let callback: ReplyHook = Arc::new(callback);
        let cached = {
            let mut state = self.inner.state.lock();
            state.hooks.entry(status).or_default().push(Arc::clone(&callback));
            state.received.clone().filter(|reply| reply.status() == status)
        };
        if let Some(reply) = cached {
            callback(&reply);
        }
        self.clone()
    }

    /// Send the push through its channel's socket.
    ///
    /// Does nothing once the push has timed out; use [`resend`](Self::resend).
    pub fn send(&self) {
        if self.has_received(ReplyStatus::Timeout) {
            debug!(event = %self.inner.event, "not sending timed out push");
            return;
        }
        let Some(channel) = self.inner.channel.upgrade() else {
            return;
        };

        self.start_timeout();
        let (payload, msg_ref) = {
            let mut state = self.inner.state.lock();
            state.sent = true;
            (state.payload.clone(), state.msg_ref.clone())
        };
        if let Some(socket) = channel.socket() {
            socket.push(channel.topic(), &self.inner.event, payload, msg_ref, channel.join_ref());
        }
    }

    /// Reset and send again with a new timeout.
    pub fn resend(&self, timeout: Duration) {
        self.inner.state.lock().timeout = timeout;
        self.reset();
        self.send();
    }

    /// Forget the current attempt so the push can be sent again.
    pub fn reset(&self) {
        self.cancel_ref_event();
        let mut state = self.inner.state.lock();
        if let Some(id) = state.timer.take() {
            self.inner.scheduler.cancel(id);
        }
        state.msg_ref = None;
        state.ref_event = None;
        state.received = None;
        state.sent = false;
    }

    /// Cancel the pending timeout without resolving the push.
    pub fn cancel_timeout(&self) {
        if let Some(id) = self.inner.state.lock().timer.take() {
            self.inner.scheduler.cancel(id);
        }
    }

    /// Take a fresh ref, bind its reply event and arm the timeout.
    pub(crate) fn start_timeout(&self) {
        let Some(channel) = self.inner.channel.upgrade() else {
            return;
        };
        let Some(socket) = channel.socket() else {
            return;
        };

        self.cancel_ref_event();
        let msg_ref = socket.make_ref();
        let ref_event = reply_event_name(&msg_ref);
        channel.bind_reply(&ref_event, Arc::clone(&self.inner));

        let weak = Arc::downgrade(&self.inner);
        let timer_event = ref_event.clone();
        let mut state = self.inner.state.lock();
        if let Some(id) = state.timer.take() {
            self.inner.scheduler.cancel(id);
        }
        state.msg_ref = Some(msg_ref);
        state.ref_event = Some(ref_event);
        state.timer = Some(self.inner.scheduler.schedule_once(
            state.timeout,
            Box::new(move || {
                if let Some(inner) = weak.upgrade() {
                    Push { inner }.trigger_timeout(&timer_event);
                }
            }),
        ));
    }

    fn cancel_ref_event(&self) {
        let ref_event = self.inner.state.lock().ref_event.clone();
        if let (Some(ref_event), Some(channel)) = (ref_event, self.inner.channel.upgrade()) {
            channel.off_event(&ref_event);
        }
    }

    fn trigger_timeout(&self, ref_event: &str) {
        let msg_ref = {
            let mut state = self.inner.state.lock();
            if state.ref_event.as_deref() != Some(ref_event) {
                return;
            }
            state.timer = None;
            state.msg_ref.clone()
        };
        trace!(event = %self.inner.event, msg_ref = ?msg_ref, "push timed out");

        match self.inner.channel.upgrade() {
            Some(channel) => {
                let mut payload = Payload::new();
                payload.insert("status".into(), Value::from(STATUS_TIMEOUT));
                payload.insert("response".into(), Value::Object(Payload::new()));
                let message = Message::new(channel.topic(), ref_event, payload).with_ref(msg_ref);
                channel.trigger(message);
            }
            None => self.resolve(Reply::Timeout, Some(ref_event)),
        }
    }

    /// Resolve from a reply dispatched on the channel under `event`.
    pub(crate) fn handle_reply(&self, event: &str, message: &Message) {
        self.resolve(Reply::from_payload(&message.payload), Some(event));
    }

    /// Resolve locally, without a server reply.
    pub(crate) fn trigger_local(&self, reply: Reply) {
        self.resolve(reply, None);
    }

    fn resolve(&self, reply: Reply, expected_event: Option<&str>) {
        let (hooks, ref_event) = {
            let mut state = self.inner.state.lock();
            if let Some(expected) = expected_event {
                if state.ref_event.as_deref() != Some(expected) {
                    return;
                }
            }
            if state.received.is_some() {
                return;
            }
            state.received = Some(reply.clone());
            if let Some(id) = state.timer.take() {
                self.inner.scheduler.cancel(id);
            }
            let hooks = state.hooks.get(&reply.status()).cloned().unwrap_or_default();
            (hooks, state.ref_event.clone())
        };

        if let Some(channel) = self.inner.channel.upgrade() {
            if let Some(ref_event) = ref_event {
                channel.off_event(&ref_event);
            }
            match self.inner.kind {
                PushKind::Join => channel.handle_join_reply(&reply),
                PushKind::Leave => channel.handle_leave_reply(),
                PushKind::Event => {}
            }
        }

        for hook in hooks {
            hook(&reply);
        }
    }
}

impl Drop for PushInner {
    fn drop(&mut self) {
        if let Some(id) = self.state.get_mut().timer.take() {
            self.scheduler.cancel(id);
        }
    }
}

impl fmt::Debug for Push {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("Push")
            .field("event", &self.inner.event)
            .field("msg_ref", &state.msg_ref)
            .field("sent", &state.sent)
            .field("received", &state.received)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{Fixture, reply_frame};
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counter() -> Arc<AtomicUsize> {
        Arc::new(AtomicUsize::new(0))
    }

    fn counting(count: &Arc<AtomicUsize>) -> impl Fn(&Reply) + Send + Sync + 'static {
        let count = Arc::clone(count);
        move |_| {
            count.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_only_matching_status_hooks_fire() {
        let fixture = Fixture::connected();
        let channel = fixture.joined_channel("room:lobby");

        for status in [ReplyStatus::Ok, ReplyStatus::Error, ReplyStatus::Timeout] {
            let (ok, error, timeout) = (counter(), counter(), counter());
            let push = channel.push("ping", Payload::new()).unwrap();
            push.receive(ReplyStatus::Timeout, counting(&timeout))
                .receive(ReplyStatus::Ok, counting(&ok))
                .receive(ReplyStatus::Error, counting(&error));

            let msg_ref = push.msg_ref().unwrap();
            match status {
                ReplyStatus::Ok => fixture.receive(&reply_frame(&channel, &msg_ref, "ok", json!({}))),
                ReplyStatus::Error => fixture.receive(&reply_frame(&channel, &msg_ref, "error", json!({}))),
                ReplyStatus::Timeout => fixture.advance(push.timeout()),
            }
            // Late duplicates and timers are inert once resolved.
            fixture.receive(&reply_frame(&channel, &msg_ref, "ok", json!({})));
            fixture.advance(push.timeout() * 2);

            let counts = [ok.load(Ordering::SeqCst), error.load(Ordering::SeqCst), timeout.load(Ordering::SeqCst)];
            let expected = match status {
                ReplyStatus::Ok => [1, 0, 0],
                ReplyStatus::Error => [0, 1, 0],
                ReplyStatus::Timeout => [0, 0, 1],
            };
            assert_eq!(counts, expected, "status {status:?}");
        }
    }

    #[test]
    fn test_receive_after_reply_fires_immediately() {
        let fixture = Fixture::connected();
        let channel = fixture.joined_channel("room:lobby");

        let push = channel.push("ping", Payload::new()).unwrap();
        let msg_ref = push.msg_ref().unwrap();
        fixture.receive(&reply_frame(&channel, &msg_ref, "ok", json!({"pong": true})));

        let seen = Arc::new(Mutex::new(None));
        let sink = Arc::clone(&seen);
        push.receive(ReplyStatus::Ok, move |reply| {
            *sink.lock() = reply.response().cloned();
        });
        let error = counter();
        push.receive(ReplyStatus::Error, counting(&error));

        assert_eq!(seen.lock().as_ref().and_then(|r| r.get("pong")), Some(&json!(true)));
        assert_eq!(error.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_timed_out_push_needs_resend() {
        let fixture = Fixture::connected();
        let channel = fixture.joined_channel("room:lobby");

        let push = channel.push("ping", Payload::new()).unwrap();
        fixture.advance(push.timeout());
        assert!(push.has_received(ReplyStatus::Timeout));

        let before = fixture.transport().sent().len();
        push.send();
        assert_eq!(fixture.transport().sent().len(), before);

        push.resend(Duration::from_secs(1));
        assert!(!push.has_received(ReplyStatus::Timeout));
        assert_eq!(fixture.transport().sent().len(), before + 1);
        assert_eq!(push.timeout(), Duration::from_secs(1));
    }

    #[test]
    fn test_resend_uses_fresh_ref() {
        let fixture = Fixture::connected();
        let channel = fixture.joined_channel("room:lobby");

        let push = channel.push("ping", Payload::new()).unwrap();
        let first = push.msg_ref().unwrap();
        push.resend(Duration::from_secs(5));
        let second = push.msg_ref().unwrap();
        assert_ne!(first, second);

        // A reply to the superseded attempt is ignored.
        let ok = counter();
        push.receive(ReplyStatus::Ok, counting(&ok));
        fixture.receive(&reply_frame(&channel, &first, "ok", json!({})));
        assert_eq!(ok.load(Ordering::SeqCst), 0);

        fixture.receive(&reply_frame(&channel, &second, "ok", json!({})));
        assert_eq!(ok.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_reset_clears_attempt() {
        let fixture = Fixture::connected();
        let channel = fixture.joined_channel("room:lobby");

        let push = channel.push("ping", Payload::new()).unwrap();
        assert!(push.is_sent());
        push.reset();

        assert!(!push.is_sent());
        assert!(push.msg_ref().is_none());
        assert!(push.reply().is_none());
        fixture.advance(push.timeout() * 2);
        assert!(push.reply().is_none());
    }

    #[test]
    fn test_payload_is_settable_before_send() {
        let fixture = Fixture::connected();
        let channel = fixture.joined_channel("room:lobby");

        let push = channel.push("ping", Payload::new()).unwrap();
        let mut payload = Payload::new();
        payload.insert("n".into(), json!(2));
        push.set_payload(payload);
        push.resend(Duration::from_secs(5));

        let last = fixture.transport().last_message().unwrap();
        assert_eq!(last.event, "ping");
        assert_eq!(last.payload.get("n"), Some(&json!(2)));
    }
}
