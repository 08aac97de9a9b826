//! Protocol constants for Phoenix Channels.
//!
//! Event names are fixed by the server implementation and MUST NOT be changed.

use std::time::Duration;

// =============================================================================
// RESERVED EVENTS
// =============================================================================

/// Join a topic.
pub const PHX_JOIN: &str = "phx_join";

/// Leave a topic.
pub const PHX_LEAVE: &str = "phx_leave";

/// Reply to a push, correlated by `ref`.
pub const PHX_REPLY: &str = "phx_reply";

/// Channel crashed or the connection failed.
pub const PHX_ERROR: &str = "phx_error";

/// Channel closed.
pub const PHX_CLOSE: &str = "phx_close";

/// Connection liveness check.
pub const HEARTBEAT: &str = "heartbeat";

/// Topic heartbeats are sent on.
pub const HEARTBEAT_TOPIC: &str = "phoenix";

/// Prefix of the local dispatch key for a push reply. Never sent on the wire.
pub const REPLY_EVENT_PREFIX: &str = "chan_reply_";

/// Events that govern channel lifecycle and must carry a matching `join_ref`.
pub const LIFECYCLE_EVENTS: [&str; 5] = [PHX_JOIN, PHX_LEAVE, PHX_REPLY, PHX_ERROR, PHX_CLOSE];

/// Check whether an event belongs to the lifecycle set.
pub fn is_lifecycle_event(event: &str) -> bool {
    LIFECYCLE_EVENTS.contains(&event)
}

/// Local dispatch key for the reply to the push with the given ref.
pub fn reply_event_name(msg_ref: &str) -> String {
    format!("{REPLY_EVENT_PREFIX}{msg_ref}")
}

// =============================================================================
// PRESENCE EVENTS
// =============================================================================

/// Full presence snapshot, sent after join.
pub const PRESENCE_STATE: &str = "presence_state";

/// Incremental presence update.
pub const PRESENCE_DIFF: &str = "presence_diff";

// =============================================================================
// REPLY STATUSES
// =============================================================================

/// Successful reply status.
pub const STATUS_OK: &str = "ok";

/// Error reply status.
pub const STATUS_ERROR: &str = "error";

/// Locally synthesized status when no reply arrived in time.
pub const STATUS_TIMEOUT: &str = "timeout";

// =============================================================================
// PROTOCOL
// =============================================================================

/// Serializer version spoken by this client (5-element array frames).
pub const DEFAULT_VSN: &str = "2.0.0";

/// Path suffix every socket endpoint is normalised to.
pub const WEBSOCKET_PATH: &str = "websocket";

// =============================================================================
// CLOSE CODES (RFC 6455)
// =============================================================================

/// Normal closure.
pub const CLOSE_NORMAL: u16 = 1000;

/// Connection dropped without a close frame.
pub const CLOSE_ABNORMAL: u16 = 1006;

// =============================================================================
// TIMING DEFAULTS
// =============================================================================

/// Default timeout for join, leave and push replies.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// Default interval between heartbeats.
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

/// Reconnect delays by attempt, before falling back to [`RECONNECT_FALLBACK`].
pub const RECONNECT_STEPS: [Duration; 9] = [
    Duration::from_millis(10),
    Duration::from_millis(50),
    Duration::from_millis(100),
    Duration::from_millis(150),
    Duration::from_millis(200),
    Duration::from_millis(250),
    Duration::from_millis(500),
    Duration::from_secs(1),
    Duration::from_secs(2),
];

/// Reconnect delay once the steps are exhausted.
pub const RECONNECT_FALLBACK: Duration = Duration::from_secs(5);

/// Rejoin delays by attempt, before falling back to [`REJOIN_FALLBACK`].
pub const REJOIN_STEPS: [Duration; 3] = [
    Duration::from_secs(1),
    Duration::from_secs(2),
    Duration::from_secs(5),
];

/// Rejoin delay once the steps are exhausted.
pub const REJOIN_FALLBACK: Duration = Duration::from_secs(10);
