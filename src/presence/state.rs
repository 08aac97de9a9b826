//! Presence data model and the differential sync algorithm.
//!
//! Both functions are pure: they take the current state by value and return
//! the converged one, reporting each join and leave through callbacks.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::core::Payload;

/// One connected instance of a presence, e.g. a single device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Meta {
    /// Server-assigned ref identifying this instance.
    pub phx_ref: String,
    /// Application fields.
    #[serde(flatten)]
    pub fields: Payload,
}

impl Meta {
    /// Create a meta without application fields.
    pub fn new(phx_ref: impl Into<String>) -> Self {
        Self {
            phx_ref: phx_ref.into(),
            fields: Payload::new(),
        }
    }
}

/// All instances of one presence key, in join order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PresenceEntry {
    /// Metas, oldest first.
    #[serde(default)]
    pub metas: Vec<Meta>,
}

impl PresenceEntry {
    /// Create an entry from its metas.
    pub fn new(metas: Vec<Meta>) -> Self {
        Self { metas }
    }

    fn refs(&self) -> Vec<&str> {
        self.metas.iter().map(|meta| meta.phx_ref.as_str()).collect()
    }

    fn without_refs(&self, refs: &[&str]) -> Vec<Meta> {
        self.metas
            .iter()
            .filter(|meta| !refs.contains(&meta.phx_ref.as_str()))
            .cloned()
            .collect()
    }
}

/// Converged membership table, keyed by presence key.
pub type PresenceState = BTreeMap<String, PresenceEntry>;

/// Incremental change pushed by the server.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PresenceDiff {
    /// Metas that joined, per key.
    #[serde(default)]
    pub joins: PresenceState,
    /// Metas that left, per key.
    #[serde(default)]
    pub leaves: PresenceState,
}

/// A single join or leave produced while syncing.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum SyncEvent {
    Join {
        key: String,
        current: Option<PresenceEntry>,
        joined: PresenceEntry,
    },
    Leave {
        key: String,
        remaining: PresenceEntry,
        left: PresenceEntry,
    },
}

/// Converge `current` with a full state snapshot.
///
/// Only metas that are new or gone relative to `current` are reported; a key
/// present in both states with the same refs produces no callbacks.
pub fn sync_state<J, L>(current: PresenceState, new_state: PresenceState, mut on_join: J, mut on_leave: L) -> PresenceState
where
    J: FnMut(&str, Option<&PresenceEntry>, &PresenceEntry),
    L: FnMut(&str, &PresenceEntry, &PresenceEntry),
{
    sync_state_events(current, new_state, &mut |event| dispatch(event, &mut on_join, &mut on_leave))
}

/// Apply an incremental diff to `current`.
///
/// Joins are applied before leaves. A key whose last meta leaves is removed.
pub fn sync_diff<J, L>(current: PresenceState, diff: PresenceDiff, mut on_join: J, mut on_leave: L) -> PresenceState
where
    J: FnMut(&str, Option<&PresenceEntry>, &PresenceEntry),
    L: FnMut(&str, &PresenceEntry, &PresenceEntry),
{
    sync_diff_events(current, diff, &mut |event| dispatch(event, &mut on_join, &mut on_leave))
}

fn dispatch<J, L>(event: SyncEvent, on_join: &mut J, on_leave: &mut L)
where
    J: FnMut(&str, Option<&PresenceEntry>, &PresenceEntry),
    L: FnMut(&str, &PresenceEntry, &PresenceEntry),
{
    match event {
        SyncEvent::Join { key, current, joined } => on_join(&key, current.as_ref(), &joined),
        SyncEvent::Leave { key, remaining, left } => on_leave(&key, &remaining, &left),
    }
}

pub(crate) fn sync_state_events(
    current: PresenceState,
    new_state: PresenceState,
    emit: &mut dyn FnMut(SyncEvent),
) -> PresenceState {
    let mut diff = PresenceDiff::default();

    for (key, presence) in &current {
        if !new_state.contains_key(key) {
            diff.leaves.insert(key.clone(), presence.clone());
        }
    }

    for (key, new_presence) in new_state {
        match current.get(&key) {
            Some(current_presence) => {
                let joined = new_presence.without_refs(&current_presence.refs());
                let left = current_presence.without_refs(&new_presence.refs());
                if !joined.is_empty() {
                    diff.joins.insert(key.clone(), PresenceEntry::new(joined));
                }
                if !left.is_empty() {
                    diff.leaves.insert(key, PresenceEntry::new(left));
                }
            }
            None => {
                diff.joins.insert(key, new_presence);
            }
        }
    }

    sync_diff_events(current, diff, emit)
}

pub(crate) fn sync_diff_events(
    mut state: PresenceState,
    diff: PresenceDiff,
    emit: &mut dyn FnMut(SyncEvent),
) -> PresenceState {
    for (key, joined) in diff.joins {
        let current = state.get(&key).cloned();
        let mut merged = joined.clone();
        if let Some(current) = &current {
            let mut metas = current.without_refs(&joined.refs());
            metas.append(&mut merged.metas);
            merged.metas = metas;
        }
        state.insert(key.clone(), merged);
        emit(SyncEvent::Join { key, current, joined });
    }

    for (key, left) in diff.leaves {
        let Some(current) = state.get_mut(&key) else {
            continue;
        };
        let refs = left.refs();
        current.metas.retain(|meta| !refs.contains(&meta.phx_ref.as_str()));
        let remaining = current.clone();
        if remaining.metas.is_empty() {
            state.remove(&key);
        }
        emit(SyncEvent::Leave { key, remaining, left });
    }

    state
}
