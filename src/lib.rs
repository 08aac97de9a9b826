//! # Phoenix Channels
//!
//! Client for the Phoenix Channels protocol: many topic subscriptions
//! multiplexed over one persistent WebSocket connection.
//!
//! - **Socket**: connection manager with reconnect backoff, heartbeat
//!   liveness and message dispatch
//! - **Channel**: per-topic join/leave state machine with automatic rejoin
//! - **Push**: outbound event correlated with its reply or timeout
//! - **Presence**: converged membership map driven by server state and diffs
//!
//! ## Feature Flags
//!
//! - `websocket` (default): tokio-tungstenite transport (implies `runtime`)
//! - `runtime`: tokio-backed [`TokioScheduler`](transport::TokioScheduler)
//! - `presence` (default): presence tracking
//! - `tls`: `wss://` endpoints
//!
//! ## Modules
//!
//! - [`core`]: reserved events, errors and the message model (always included)
//! - [`transport`]: wire codec, endpoint URLs, timers and transports
//! - [`client`]: [`Socket`], [`Channel`] and [`Push`]
//! - [`presence`]: presence sync (requires `presence` feature)
//!
//! ## Example Usage
//!
//! ```rust,no_run
//! use phoenix_channels::prelude::*;
//! use serde_json::json;
//!
//! # async fn run() -> Result<(), PhoenixError> {
//! let socket = Socket::builder("wss://example.com/socket")
//!     .param("token", "secret")
//!     .build()?;
//! socket.connect();
//!
//! let channel = socket.channel("room:lobby", Payload::new());
//! channel.on("new_msg", |message| println!("{:?}", message.payload));
//! channel
//!     .join()?
//!     .receive(ReplyStatus::Ok, |_| println!("joined"))
//!     .receive(ReplyStatus::Error, |reply| println!("join failed: {reply:?}"));
//!
//! channel
//!     .push("new_msg", to_payload(json!({"body": "hello"})))?
//!     .receive(ReplyStatus::Timeout, |_| println!("no reply"));
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![cfg_attr(docsrs, feature(doc_cfg))]

// Core module (always included)
pub mod core;

// Wire format, timers and transports
pub mod transport;

// Socket, channels and pushes
pub mod client;

// Presence (feature-gated)
#[cfg(feature = "presence")]
#[cfg_attr(docsrs, doc(cfg(feature = "presence")))]
pub mod presence;

#[cfg(test)]
mod test_support;

/// Prelude module for convenient imports.
pub mod prelude {
    // Core types and reserved names
    pub use crate::core::*;

    // Client API
    pub use crate::client::{Channel, ChannelState, Params, Push, Socket, SocketBuilder, SocketConfig};

    // Timers and transport seams
    pub use crate::transport::{
        Backoff, ConnectionPhase, ManualScheduler, Scheduler, Transport, TransportDelegate,
        TransportError, TransportFactory,
    };

    #[cfg(feature = "runtime")]
    pub use crate::transport::TokioScheduler;

    #[cfg(feature = "presence")]
    pub use crate::presence::{Meta, Presence, PresenceDiff, PresenceEntry, PresenceOptions, PresenceState};
}

// Re-export commonly used items at crate root
pub use client::{Channel, ChannelState, Push, Socket, SocketBuilder, SocketConfig};
pub use core::{ChannelError, Message, Payload, PhoenixError, Reply, ReplyStatus, SocketError};

#[cfg(feature = "presence")]
pub use presence::Presence;
