//! Topic subscriptions and their join/leave lifecycle.
//!
//! ```text
//! Closed --join--> Joining --ok--> Joined --leave--> Leaving --reply--> Closed
//! Joining|Joined --error / socket failure--> Errored --rejoin--> Joining
//! ```
//!
//! An errored channel rejoins on its own: immediately when the socket opens,
//! otherwise on the rejoin backoff schedule.

use std::fmt;
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::Value;
use tracing::{debug, trace};

use super::push::{Push, PushInner, PushKind};
use super::socket::{Socket, WeakSocket};
use crate::core::{
    ChannelError, Message, PHX_CLOSE, PHX_ERROR, PHX_JOIN, PHX_LEAVE, PHX_REPLY, Payload, Reply,
    is_lifecycle_event, reply_event_name,
};
use crate::transport::{Scheduler, TimeoutTimer};

type BindingCallback = Arc<dyn Fn(&Message) + Send + Sync>;
type MessageHook = Arc<dyn Fn(Message) -> Message + Send + Sync>;

/// Channel lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    /// Not joined, or left.
    Closed,
    /// Join failed or the connection dropped; a rejoin is pending.
    Errored,
    /// Joined.
    Joined,
    /// Join sent, waiting for the reply.
    Joining,
    /// Leave sent, waiting for the reply.
    Leaving,
}

#[derive(Clone)]
enum Handler {
    User(BindingCallback),
    Reply(Arc<PushInner>),
}

struct Binding {
    event: String,
    binding_ref: u64,
    handler: Handler,
}

/// A subscription to one topic on a [`Socket`].
///
/// Created with [`Socket::channel`]. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct Channel {
    inner: Arc<ChannelInner>,
}

/// Non-owning handle to a channel.
#[derive(Clone)]
pub(crate) struct WeakChannel(Weak<ChannelInner>);

impl WeakChannel {
    pub(crate) fn upgrade(&self) -> Option<Channel> {
        self.0.upgrade().map(|inner| Channel { inner })
    }
}

pub(crate) struct ChannelInner {
    topic: String,
    socket: WeakSocket,
    scheduler: Arc<dyn Scheduler>,
    rejoin_timer: TimeoutTimer,
    join_push: Push,
    core: Mutex<ChannelCore>,
}

struct ChannelCore {
    state: ChannelState,
    bindings: Vec<Binding>,
    binding_ref: u64,
    timeout: Duration,
    joined_once: bool,
    push_buffer: Vec<Push>,
    on_message: Option<MessageHook>,
}

impl Channel {
    pub(crate) fn new(topic: String, params: Payload, socket: &Socket) -> Self {
        let scheduler = socket.scheduler();
        let timeout = socket.config().timeout;
        let rejoin_after = socket.config().rejoin_after.clone();

        let inner = Arc::new_cyclic(|weak: &Weak<ChannelInner>| {
            let channel = WeakChannel(weak.clone());
            let timer_channel = channel.clone();
            let rejoin_timer = TimeoutTimer::new(
                Arc::clone(&scheduler),
                rejoin_after,
                Arc::new(move || {
                    if let Some(channel) = timer_channel.upgrade() {
                        channel.rejoin_tick();
                    }
                }),
            );
            let join_push = Push::new(
                channel,
                Arc::clone(&scheduler),
                PHX_JOIN,
                params,
                timeout,
                PushKind::Join,
            );

            ChannelInner {
                topic,
                socket: socket.downgrade(),
                scheduler,
                rejoin_timer,
                join_push,
                core: Mutex::new(ChannelCore {
                    state: ChannelState::Closed,
                    bindings: Vec::new(),
                    binding_ref: 0,
                    timeout,
                    joined_once: false,
                    push_buffer: Vec::new(),
                    on_message: None,
                }),
            }
        });
        Self { inner }
    }

    pub(crate) fn downgrade(&self) -> WeakChannel {
        WeakChannel(Arc::downgrade(&self.inner))
    }

    pub(crate) fn socket(&self) -> Option<Socket> {
        self.inner.socket.upgrade()
    }

    /// Check if two handles refer to the same channel.
    pub fn ptr_eq(&self, other: &Channel) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    // =========================================================================
    // STATE
    // =========================================================================

    /// Channel topic.
    pub fn topic(&self) -> &str {
        &self.inner.topic
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ChannelState {
        self.inner.core.lock().state
    }

    /// Check if the channel is closed.
    pub fn is_closed(&self) -> bool {
        self.state() == ChannelState::Closed
    }

    /// Check if the channel is errored.
    pub fn is_errored(&self) -> bool {
        self.state() == ChannelState::Errored
    }

    /// Check if the channel is joined.
    pub fn is_joined(&self) -> bool {
        self.state() == ChannelState::Joined
    }

    /// Check if the channel is joining.
    pub fn is_joining(&self) -> bool {
        self.state() == ChannelState::Joining
    }

    /// Check if the channel is leaving.
    pub fn is_leaving(&self) -> bool {
        self.state() == ChannelState::Leaving
    }

    /// Ref of the current join attempt.
    pub fn join_ref(&self) -> Option<String> {
        self.inner.join_push.msg_ref()
    }

    /// Default timeout for this channel's pushes.
    pub fn timeout(&self) -> Duration {
        self.inner.core.lock().timeout
    }

    /// Check if pushes go out immediately: the socket is open and the
    /// channel joined.
    pub fn can_push(&self) -> bool {
        self.socket_connected() && self.is_joined()
    }

    /// Params sent with the join.
    pub fn params(&self) -> Payload {
        self.inner.join_push.payload()
    }

    /// Replace the join params. Takes effect on the next join attempt.
    pub fn set_params(&self, params: Payload) {
        self.inner.join_push.set_payload(params);
    }

    fn socket_connected(&self) -> bool {
        self.socket().is_some_and(|socket| socket.is_connected())
    }

    // =========================================================================
    // JOIN / PUSH / LEAVE
    // =========================================================================

    /// Join the channel with the default timeout.
    ///
    /// A channel instance can only be joined once; create a new channel to
    /// join the topic again.
    pub fn join(&self) -> Result<Push, ChannelError> {
        let timeout = self.timeout();
        self.join_with_timeout(timeout)
    }

    /// Join the channel, waiting `timeout` for each join reply.
    pub fn join_with_timeout(&self, timeout: Duration) -> Result<Push, ChannelError> {
        {
            let mut core = self.inner.core.lock();
            if core.joined_once {
                return Err(ChannelError::JoinedTwice {
                    topic: self.inner.topic.clone(),
                });
            }
            core.joined_once = true;
            core.timeout = timeout;
            core.state = ChannelState::Joining;
        }
        debug!(topic = %self.inner.topic, "joining");
        self.rejoin();
        Ok(self.inner.join_push.clone())
    }

    /// Push an event with the default timeout.
    ///
    /// Pushes made before the join completes are buffered and sent, in
    /// order, once it does. Their timeouts run from now.
    pub fn push(&self, event: &str, payload: Payload) -> Result<Push, ChannelError> {
        let timeout = self.timeout();
        self.push_with_timeout(event, payload, timeout)
    }

    /// Push an event, waiting `timeout` for the reply.
    pub fn push_with_timeout(
        &self,
        event: &str,
        payload: Payload,
        timeout: Duration,
    ) -> Result<Push, ChannelError> {
        if !self.inner.core.lock().joined_once {
            return Err(ChannelError::PushBeforeJoin {
                topic: self.inner.topic.clone(),
                event: event.to_string(),
            });
        }

        let push = Push::new(
            self.downgrade(),
            Arc::clone(&self.inner.scheduler),
            event,
            payload,
            timeout,
            PushKind::Event,
        );
        if self.can_push() {
            push.send();
        } else {
            trace!(topic = %self.inner.topic, event, "buffering push until joined");
            push.start_timeout();
            self.inner.core.lock().push_buffer.push(push.clone());
        }
        Ok(push)
    }

    /// Leave the channel with the default timeout.
    pub fn leave(&self) -> Push {
        let timeout = self.timeout();
        self.leave_with_timeout(timeout)
    }

    /// Leave the channel.
    ///
    /// The channel closes on any reply to the leave, including a timeout.
    /// When nothing can be pushed, it closes right away.
    pub fn leave_with_timeout(&self, timeout: Duration) -> Push {
        let connected = self.socket_connected();
        let can_push = connected && self.is_joined();

        self.inner.rejoin_timer.reset();
        self.inner.join_push.cancel_timeout();
        self.inner.core.lock().state = ChannelState::Leaving;
        debug!(topic = %self.inner.topic, "leaving");

        let leave_push = Push::new(
            self.downgrade(),
            Arc::clone(&self.inner.scheduler),
            PHX_LEAVE,
            Payload::new(),
            timeout,
            PushKind::Leave,
        );
        if connected {
            leave_push.send();
        } else {
            self.drop_buffered_join();
        }
        if !can_push {
            leave_push.trigger_local(Reply::Ok(Payload::new()));
        }
        leave_push
    }

    fn rejoin(&self) {
        if self.is_leaving_or_closed() {
            return;
        }
        // Leaving the old channel runs its close hooks, which may leave this one.
        if let Some(socket) = self.socket() {
            socket.leave_open_topic(&self.inner.topic, self);
        }
        let timeout = {
            let mut core = self.inner.core.lock();
            if matches!(core.state, ChannelState::Leaving | ChannelState::Closed) {
                return;
            }
            core.state = ChannelState::Joining;
            core.timeout
        };
        self.inner.join_push.resend(timeout);

        if self.is_leaving_or_closed() {
            self.inner.join_push.cancel_timeout();
            self.drop_buffered_join();
        }
    }

    fn is_leaving_or_closed(&self) -> bool {
        matches!(self.state(), ChannelState::Leaving | ChannelState::Closed)
    }

    fn drop_buffered_join(&self) {
        if let (Some(join_ref), Some(socket)) = (self.join_ref(), self.socket()) {
            socket.remove_from_send_buffer(&join_ref);
        }
    }

    fn rejoin_tick(&self) {
        if self.socket_connected() {
            debug!(topic = %self.inner.topic, tries = self.inner.rejoin_timer.tries(), "rejoining");
            self.rejoin();
        } else if self.socket().is_some() {
            self.inner.rejoin_timer.schedule_timeout();
        }
    }

    // =========================================================================
    // BINDINGS
    // =========================================================================

    /// Run `callback` for every `event` on this channel. Returns a ref for [`off`](Self::off).
    pub fn on<F>(&self, event: impl Into<String>, callback: F) -> u64
    where
        F: Fn(&Message) + Send + Sync + 'static,
    {
        self.bind(event.into(), Handler::User(Arc::new(callback)))
    }

    /// Remove the binding `binding_ref` for `event`, or every binding for
    /// `event` when no ref is given.
    pub fn off(&self, event: &str, binding_ref: Option<u64>) {
        self.inner.core.lock().bindings.retain(|binding| {
            !(binding.event == event && binding_ref.is_none_or(|r| binding.binding_ref == r))
        });
    }

    /// Run `callback` when the channel closes.
    pub fn on_close<F>(&self, callback: F) -> u64
    where
        F: Fn(&Message) + Send + Sync + 'static,
    {
        self.on(PHX_CLOSE, callback)
    }

    /// Run `callback` when the channel errors.
    pub fn on_error<F>(&self, callback: F) -> u64
    where
        F: Fn(&Message) + Send + Sync + 'static,
    {
        self.on(PHX_ERROR, callback)
    }

    /// Transform every message before it reaches the bindings.
    pub fn set_on_message<F>(&self, hook: F)
    where
        F: Fn(Message) -> Message + Send + Sync + 'static,
    {
        self.inner.core.lock().on_message = Some(Arc::new(hook));
    }

    fn bind(&self, event: String, handler: Handler) -> u64 {
        let mut core = self.inner.core.lock();
        core.binding_ref += 1;
        let binding_ref = core.binding_ref;
        core.bindings.push(Binding {
            event,
            binding_ref,
            handler,
        });
        binding_ref
    }

    pub(crate) fn bind_reply(&self, ref_event: &str, push: Arc<PushInner>) {
        self.bind(ref_event.to_string(), Handler::Reply(push));
    }

    pub(crate) fn off_event(&self, event: &str) {
        self.inner.core.lock().bindings.retain(|binding| binding.event != event);
    }

    // =========================================================================
    // DISPATCH
    // =========================================================================

    /// Check if an inbound message belongs to this channel.
    ///
    /// Lifecycle events carrying the join ref of an earlier join are stale.
    pub(crate) fn is_member(&self, message: &Message) -> bool {
        if message.topic != self.inner.topic {
            return false;
        }
        if is_lifecycle_event(&message.event) {
            if let Some(join_ref) = &message.join_ref {
                if self.join_ref().as_ref() != Some(join_ref) {
                    trace!(
                        topic = %self.inner.topic,
                        event = %message.event,
                        join_ref = %join_ref,
                        "dropping outdated message"
                    );
                    return false;
                }
            }
        }
        true
    }

    /// Deliver a message to this channel.
    pub(crate) fn trigger(&self, message: Message) {
        let hook = self.inner.core.lock().on_message.clone();
        let message = match hook {
            Some(hook) => hook(message),
            None => message,
        };

        match message.event.as_str() {
            PHX_CLOSE => self.handle_close(),
            PHX_ERROR => self.handle_error(),
            _ => {}
        }

        // Replies go to the push waiting on the ref first, then to plain
        // `phx_reply` bindings.
        let mut events = Vec::with_capacity(2);
        if let (PHX_REPLY, Some(msg_ref)) = (message.event.as_str(), &message.msg_ref) {
            events.push(reply_event_name(msg_ref));
        }
        events.push(message.event.clone());

        let handlers: Vec<(usize, Handler)> = {
            let core = self.inner.core.lock();
            let bindings = &core.bindings;
            events
                .iter()
                .enumerate()
                .flat_map(move |(index, event)| {
                    bindings
                        .iter()
                        .filter(move |binding| binding.event == *event)
                        .map(move |binding| (index, binding.handler.clone()))
                })
                .collect()
        };
        for (index, handler) in handlers {
            match handler {
                Handler::User(callback) => callback(&message),
                Handler::Reply(push) => Push::from_inner(push).handle_reply(&events[index], &message),
            }
        }
    }

    pub(crate) fn trigger_error(&self) {
        let message = Message::new(self.inner.topic.clone(), PHX_ERROR, Payload::new())
            .with_join_ref(self.join_ref());
        self.trigger(message);
    }

    pub(crate) fn on_socket_open(&self) {
        self.inner.rejoin_timer.reset();
        if self.is_errored() {
            self.rejoin();
        }
    }

    pub(crate) fn on_socket_error(&self) {
        self.inner.rejoin_timer.reset();
    }

    fn handle_close(&self) {
        debug!(topic = %self.inner.topic, "channel closed");
        self.inner.rejoin_timer.reset();
        self.inner.core.lock().state = ChannelState::Closed;
        if let Some(socket) = self.socket() {
            socket.remove(self);
        }
    }

    fn handle_error(&self) {
        let was_joining = {
            let mut core = self.inner.core.lock();
            let previous = core.state;
            if matches!(previous, ChannelState::Leaving | ChannelState::Closed) {
                return;
            }
            core.state = ChannelState::Errored;
            previous == ChannelState::Joining
        };
        debug!(topic = %self.inner.topic, "channel errored");

        if was_joining {
            self.drop_buffered_join();
            self.inner.join_push.reset();
        }
        self.inner.rejoin_timer.schedule_timeout();
    }

    /// Move to `next` unless the channel is leaving or closed.
    fn transition(&self, next: ChannelState) -> bool {
        let mut core = self.inner.core.lock();
        if matches!(core.state, ChannelState::Leaving | ChannelState::Closed) {
            return false;
        }
        core.state = next;
        true
    }

    pub(crate) fn handle_join_reply(&self, reply: &Reply) {
        match reply {
            Reply::Ok(_) => {
                let buffered = {
                    let mut core = self.inner.core.lock();
                    if matches!(core.state, ChannelState::Leaving | ChannelState::Closed) {
                        return;
                    }
                    core.state = ChannelState::Joined;
                    std::mem::take(&mut core.push_buffer)
                };
                debug!(topic = %self.inner.topic, buffered = buffered.len(), "joined");
                self.inner.rejoin_timer.reset();
                for push in buffered {
                    push.send();
                }
            }
            Reply::Error(response) => {
                if !self.transition(ChannelState::Errored) {
                    return;
                }
                debug!(topic = %self.inner.topic, response = %serde_json::Value::Object(response.clone()), "join failed");
                if self.socket_connected() {
                    self.inner.rejoin_timer.schedule_timeout();
                }
            }
            Reply::Timeout => {
                if !self.transition(ChannelState::Errored) {
                    return;
                }
                debug!(topic = %self.inner.topic, "join timed out");
                let connected = self.socket_connected();
                self.drop_buffered_join();
                if connected {
                    // Clean up any partial join on the server.
                    let leave_push = Push::new(
                        self.downgrade(),
                        Arc::clone(&self.inner.scheduler),
                        PHX_LEAVE,
                        Payload::new(),
                        self.timeout(),
                        PushKind::Event,
                    );
                    leave_push.send();
                }

                self.inner.join_push.reset();
                if self.socket_connected() {
                    self.inner.rejoin_timer.schedule_timeout();
                }
            }
        }
    }

    pub(crate) fn handle_leave_reply(&self) {
        let mut payload = Payload::new();
        payload.insert("reason".into(), Value::from("leave"));
        let message = Message::new(self.inner.topic.clone(), PHX_CLOSE, payload)
            .with_join_ref(self.join_ref());
        self.trigger(message);
    }

    #[cfg(test)]
    pub(crate) fn push_buffer_len(&self) -> usize {
        self.inner.core.lock().push_buffer.len()
    }

    #[cfg(test)]
    pub(crate) fn rejoin_pending(&self) -> bool {
        self.inner.rejoin_timer.is_pending()
    }
}

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let core = self.inner.core.lock();
        f.debug_struct("Channel")
            .field("topic", &self.inner.topic)
            .field("state", &core.state)
            .field("bindings", &core.bindings.len())
            .field("buffered", &core.push_buffer.len())
            .finish()
    }
}
