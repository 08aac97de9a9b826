//! Channel-bound presence tracker.

use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::{trace, warn};

use super::state::{
    PresenceDiff, PresenceEntry, PresenceState, SyncEvent, sync_diff_events, sync_state_events,
};
use crate::client::{Channel, WeakChannel};
use crate::core::{Message, PRESENCE_DIFF, PRESENCE_STATE, Payload};

type JoinCallback = Arc<dyn Fn(&str, Option<&PresenceEntry>, &PresenceEntry) + Send + Sync>;
type LeaveCallback = Arc<dyn Fn(&str, &PresenceEntry, &PresenceEntry) + Send + Sync>;
type SyncCallback = Arc<dyn Fn() + Send + Sync>;

/// Event names the tracker listens on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PresenceOptions {
    /// Full state snapshot event.
    pub state_event: String,
    /// Incremental diff event.
    pub diff_event: String,
}

impl Default for PresenceOptions {
    fn default() -> Self {
        Self {
            state_event: PRESENCE_STATE.to_string(),
            diff_event: PRESENCE_DIFF.to_string(),
        }
    }
}

/// Tracks the presence state of one channel.
///
/// Diffs that arrive before the state snapshot of the channel's current join
/// are queued and applied, in order, right after that snapshot. Dropping the
/// tracker removes its channel bindings.
pub struct Presence {
    shared: Arc<Shared>,
    channel: WeakChannel,
    options: PresenceOptions,
    state_binding: u64,
    diff_binding: u64,
}

struct Shared {
    channel: WeakChannel,
    core: Mutex<PresenceCore>,
}

#[derive(Default)]
struct PresenceCore {
    state: PresenceState,
    pending_diffs: Vec<PresenceDiff>,
    join_ref: Option<String>,
    on_join: Option<JoinCallback>,
    on_leave: Option<LeaveCallback>,
    on_sync: Option<SyncCallback>,
}

struct Observers {
    on_join: Option<JoinCallback>,
    on_leave: Option<LeaveCallback>,
    on_sync: Option<SyncCallback>,
}

impl Presence {
    /// Track presence on `channel` using the default event names.
    pub fn new(channel: &Channel) -> Self {
        Self::with_options(channel, PresenceOptions::default())
    }

    /// Track presence on `channel` using custom event names.
    pub fn with_options(channel: &Channel, options: PresenceOptions) -> Self {
        let shared = Arc::new(Shared {
            channel: channel.downgrade(),
            core: Mutex::new(PresenceCore::default()),
        });

        let weak = Arc::downgrade(&shared);
        let state_binding = channel.on(options.state_event.clone(), move |message| {
            if let Some(shared) = weak.upgrade() {
                shared.handle_state(message);
            }
        });
        let weak: Weak<Shared> = Arc::downgrade(&shared);
        let diff_binding = channel.on(options.diff_event.clone(), move |message| {
            if let Some(shared) = weak.upgrade() {
                shared.handle_diff(message);
            }
        });

        Self {
            shared,
            channel: channel.downgrade(),
            options,
            state_binding,
            diff_binding,
        }
    }

    /// Run `callback` for every key that gains metas.
    ///
    /// Receives the key, the entry before the join (if any) and the joined
    /// metas.
    pub fn on_join<F>(&self, callback: F)
    where
        F: Fn(&str, Option<&PresenceEntry>, &PresenceEntry) + Send + Sync + 'static,
    {
        self.shared.core.lock().on_join = Some(Arc::new(callback));
    }

    /// Run `callback` for every key that loses metas.
    ///
    /// Receives the key, the remaining entry and the departed metas.
    pub fn on_leave<F>(&self, callback: F)
    where
        F: Fn(&str, &PresenceEntry, &PresenceEntry) + Send + Sync + 'static,
    {
        self.shared.core.lock().on_leave = Some(Arc::new(callback));
    }

    /// Run `callback` after each applied state or diff.
    pub fn on_sync<F>(&self, callback: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.shared.core.lock().on_sync = Some(Arc::new(callback));
    }

    /// Current converged state.
    pub fn state(&self) -> PresenceState {
        self.shared.core.lock().state.clone()
    }

    /// All entries, ordered by key.
    pub fn list(&self) -> Vec<PresenceEntry> {
        self.list_by(|_, entry| entry.clone())
    }

    /// Map every `(key, entry)` through `chooser`, ordered by key.
    pub fn list_by<T, F>(&self, mut chooser: F) -> Vec<T>
    where
        F: FnMut(&str, &PresenceEntry) -> T,
    {
        let state = self.state();
        state.iter().map(|(key, entry)| chooser(key, entry)).collect()
    }

    /// Entries matching `predicate`.
    pub fn filter<F>(&self, mut predicate: F) -> PresenceState
    where
        F: FnMut(&str, &PresenceEntry) -> bool,
    {
        let state = self.state();
        state.into_iter().filter(|(key, entry)| predicate(key, entry)).collect()
    }

    /// Check if no state snapshot has arrived for the channel's current join.
    pub fn is_pending_sync_state(&self) -> bool {
        let join_ref = self.shared.channel_join_ref();
        self.shared.core.lock().is_pending(&join_ref)
    }
}

impl Drop for Presence {
    fn drop(&mut self) {
        if let Some(channel) = self.channel.upgrade() {
            channel.off(&self.options.state_event, Some(self.state_binding));
            channel.off(&self.options.diff_event, Some(self.diff_binding));
        }
    }
}

impl std::fmt::Debug for Presence {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let core = self.shared.core.lock();
        f.debug_struct("Presence")
            .field("keys", &core.state.len())
            .field("pending_diffs", &core.pending_diffs.len())
            .field("join_ref", &core.join_ref)
            .finish()
    }
}

impl PresenceCore {
    fn is_pending(&self, channel_join_ref: &Option<String>) -> bool {
        self.join_ref.is_none() || self.join_ref != *channel_join_ref
    }

    fn observers(&self) -> Observers {
        Observers {
            on_join: self.on_join.clone(),
            on_leave: self.on_leave.clone(),
            on_sync: self.on_sync.clone(),
        }
    }
}

impl Shared {
    fn channel_join_ref(&self) -> Option<String> {
        self.channel.upgrade().and_then(|channel| channel.join_ref())
    }

    fn handle_state(&self, message: &Message) {
        let Some(new_state) = parse::<PresenceState>(message) else {
            return;
        };
        let join_ref = self.channel_join_ref();

        let mut events = Vec::new();
        let observers = {
            let mut core = self.core.lock();
            core.join_ref = join_ref;
            let current = std::mem::take(&mut core.state);
            let mut state = sync_state_events(current, new_state, &mut |event| events.push(event));
            let pending = std::mem::take(&mut core.pending_diffs);
            trace!(topic = %message.topic, pending = pending.len(), "presence state synced");
            for diff in pending {
                state = sync_diff_events(state, diff, &mut |event| events.push(event));
            }
            core.state = state;
            core.observers()
        };
        observers.notify(events);
    }

    fn handle_diff(&self, message: &Message) {
        let Some(diff) = parse::<PresenceDiff>(message) else {
            return;
        };
        let join_ref = self.channel_join_ref();

        let mut events = Vec::new();
        let observers = {
            let mut core = self.core.lock();
            if core.is_pending(&join_ref) {
                trace!(topic = %message.topic, "queueing presence diff until state arrives");
                core.pending_diffs.push(diff);
                return;
            }
            let current = std::mem::take(&mut core.state);
            core.state = sync_diff_events(current, diff, &mut |event| events.push(event));
            core.observers()
        };
        observers.notify(events);
    }
}

impl Observers {
    fn notify(self, events: Vec<SyncEvent>) {
        for event in events {
            match event {
                SyncEvent::Join { key, current, joined } => {
                    if let Some(on_join) = &self.on_join {
                        on_join(&key, current.as_ref(), &joined);
                    }
                }
                SyncEvent::Leave { key, remaining, left } => {
                    if let Some(on_leave) = &self.on_leave {
                        on_leave(&key, &remaining, &left);
                    }
                }
            }
        }
        if let Some(on_sync) = &self.on_sync {
            on_sync();
        }
    }
}

fn parse<T: DeserializeOwned>(message: &Message) -> Option<T> {
    let payload: Payload = message.payload.clone();
    match serde_json::from_value(Value::Object(payload)) {
        Ok(parsed) => Some(parsed),
        Err(err) => {
            warn!(topic = %message.topic, event = %message.event, error = %err, "dropping malformed presence payload");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::PHX_ERROR;
    use crate::test_support::{Fixture, frame};
    use serde_json::json;
    use std::time::Duration;

    fn log_events(presence: &Presence) -> Arc<Mutex<Vec<String>>> {
        let log = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&log);
        presence.on_join(move |key, current, joined| {
            let refs: Vec<&str> = joined.metas.iter().map(|m| m.phx_ref.as_str()).collect();
            sink.lock().push(format!("join {key} {} {}", current.is_some(), refs.join(",")));
        });
        let sink = Arc::clone(&log);
        presence.on_leave(move |key, remaining, left| {
            let refs: Vec<&str> = left.metas.iter().map(|m| m.phx_ref.as_str()).collect();
            sink.lock().push(format!("leave {key} {} {}", remaining.metas.len(), refs.join(",")));
        });
        let sink = Arc::clone(&log);
        presence.on_sync(move || sink.lock().push("sync".into()));
        log
    }

    fn state_frame(state: Value) -> String {
        frame(None, None, "room:1", PRESENCE_STATE, state)
    }

    fn diff_frame(joins: Value, leaves: Value) -> String {
        frame(None, None, "room:1", PRESENCE_DIFF, json!({"joins": joins, "leaves": leaves}))
    }

    #[test]
    fn test_state_then_diff() {
        let fixture = Fixture::connected();
        let channel = fixture.joined_channel("room:1");
        let presence = Presence::new(&channel);
        let log = log_events(&presence);
        assert!(presence.is_pending_sync_state());

        fixture.receive(&state_frame(json!({"u1": {"metas": [{"phx_ref": "1", "device": "web"}]}})));
        assert!(!presence.is_pending_sync_state());
        assert_eq!(presence.state()["u1"].metas[0].fields.get("device"), Some(&json!("web")));

        fixture.receive(&diff_frame(json!({}), json!({"u1": {"metas": [{"phx_ref": "1"}]}})));

        assert!(presence.state().is_empty());
        assert_eq!(*log.lock(), vec!["join u1 false 1", "sync", "leave u1 0 1", "sync"]);
    }

    #[test]
    fn test_early_diffs_wait_for_state() {
        let fixture = Fixture::connected();
        let channel = fixture.joined_channel("room:1");
        let presence = Presence::new(&channel);
        let log = log_events(&presence);

        fixture.receive(&diff_frame(json!({"u2": {"metas": [{"phx_ref": "2"}]}}), json!({})));
        assert!(presence.state().is_empty());
        assert!(log.lock().is_empty());

        fixture.receive(&state_frame(json!({"u1": {"metas": [{"phx_ref": "1"}]}})));

        assert_eq!(presence.list().len(), 2);
        assert_eq!(*log.lock(), vec!["join u1 false 1", "join u2 false 2", "sync"]);
    }

    #[test]
    fn test_rejoin_requires_fresh_state() {
        let fixture = Fixture::connected();
        let channel = fixture.joined_channel("room:1");
        let presence = Presence::new(&channel);
        fixture.receive(&state_frame(json!({"u1": {"metas": [{"phx_ref": "1"}]}})));
        assert!(!presence.is_pending_sync_state());

        let join_ref = channel.join_ref();
        fixture.receive(&frame(join_ref.as_deref(), None, "room:1", PHX_ERROR, json!({})));
        fixture.advance(Duration::from_secs(1));
        assert!(channel.join_ref().is_some());
        assert_ne!(channel.join_ref(), join_ref);
        assert!(presence.is_pending_sync_state());

        fixture.receive(&diff_frame(json!({"u2": {"metas": [{"phx_ref": "2"}]}}), json!({})));
        assert_eq!(presence.list_by(|key, _| key.to_string()), vec!["u1"]);

        fixture.receive(&state_frame(json!({"u1": {"metas": [{"phx_ref": "1"}]}})));
        assert_eq!(presence.list_by(|key, _| key.to_string()), vec!["u1", "u2"]);
    }

    #[test]
    fn test_second_device_reported_once() {
        let fixture = Fixture::connected();
        let channel = fixture.joined_channel("room:1");
        let presence = Presence::new(&channel);
        let log = log_events(&presence);

        fixture.receive(&state_frame(json!({"u1": {"metas": [{"phx_ref": "a"}]}})));
        fixture.receive(&state_frame(json!({"u1": {"metas": [{"phx_ref": "a"}, {"phx_ref": "b"}]}})));

        assert_eq!(*log.lock(), vec!["join u1 false a", "sync", "join u1 true b", "sync"]);
        assert_eq!(presence.state()["u1"].metas.len(), 2);
    }

    #[test]
    fn test_filter_by_meta_field() {
        let fixture = Fixture::connected();
        let channel = fixture.joined_channel("room:1");
        let presence = Presence::new(&channel);
        fixture.receive(&state_frame(json!({
            "u1": {"metas": [{"phx_ref": "1", "status": "away"}]},
            "u2": {"metas": [{"phx_ref": "2", "status": "online"}]},
        })));

        let online = presence.filter(|_, entry| {
            entry.metas.iter().any(|meta| meta.fields.get("status") == Some(&json!("online")))
        });

        assert_eq!(online.keys().collect::<Vec<_>>(), vec!["u2"]);
    }

    #[test]
    fn test_custom_event_names() {
        let fixture = Fixture::connected();
        let channel = fixture.joined_channel("room:1");
        let options = PresenceOptions {
            state_event: "members".into(),
            diff_event: "members_diff".into(),
        };
        let presence = Presence::with_options(&channel, options);

        fixture.receive(&state_frame(json!({"u1": {"metas": [{"phx_ref": "1"}]}})));
        assert!(presence.state().is_empty());

        fixture.receive(&frame(None, None, "room:1", "members", json!({"u1": {"metas": [{"phx_ref": "1"}]}})));
        assert_eq!(presence.list().len(), 1);
    }

    #[test]
    fn test_malformed_state_is_dropped() {
        let fixture = Fixture::connected();
        let channel = fixture.joined_channel("room:1");
        let presence = Presence::new(&channel);

        fixture.receive(&state_frame(json!({"u1": {"metas": [{"device": "web"}]}})));

        assert!(presence.is_pending_sync_state());
        assert!(presence.state().is_empty());
    }

    #[test]
    fn test_drop_unbinds() {
        let fixture = Fixture::connected();
        let channel = fixture.joined_channel("room:1");
        let presence = Presence::new(&channel);
        let syncs = Arc::new(Mutex::new(0));
        let sink = Arc::clone(&syncs);
        presence.on_sync(move || *sink.lock() += 1);

        drop(presence);
        fixture.receive(&state_frame(json!({"u1": {"metas": [{"phx_ref": "1"}]}})));

        assert_eq!(*syncs.lock(), 0);
    }
}
