//! Phoenix Channels - Presence
//!
//! Client-side view of who is connected to a channel.
//!
//! - [`state`]: presence data model and the pure [`sync_state`] / [`sync_diff`] algorithms
//! - [`tracker`]: [`Presence`], which keeps that model in sync with a channel's
//!   `presence_state` and `presence_diff` events

pub mod state;
pub mod tracker;

pub use state::{Meta, PresenceDiff, PresenceEntry, PresenceState, sync_diff, sync_state};
pub use tracker::{Presence, PresenceOptions};
