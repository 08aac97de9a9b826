//! Phoenix Channels - Transport layer
//!
//! Everything below the channel protocol:
//!
//! - **Transport contract**: [`Transport`], [`TransportDelegate`] and
//!   [`TransportFactory`], so the socket can run over any message pipe
//! - **Wire format**: [`Serializer`] and the `vsn=2.0.0` [`JsonSerializer`]
//! - **Endpoint URLs**: [`build_endpoint_url`]
//! - **Timers**: [`Scheduler`], [`Backoff`], [`TimeoutTimer`], [`HeartbeatTimer`]
//! - **WebSocket**: [`WebSocketTransport`] over tokio-tungstenite (feature `websocket`)
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │      Channel / Push / Presence          │
//! ├─────────────────────────────────────────┤
//! │               Socket                    │
//! ├─────────────────────────────────────────┤
//! │         Transport Layer                 │  ← This module
//! │   frames, endpoint, timers, websocket   │
//! ├─────────────────────────────────────────┤
//! │            TCP / TLS                    │
//! └─────────────────────────────────────────┘
//! ```

mod connection;
mod endpoint;
mod error;
mod frame;
mod scheduler;
#[cfg(feature = "websocket")]
mod socket;
mod timing;

pub use connection::*;
pub use endpoint::*;
pub use error::*;
pub use frame::*;
pub use scheduler::*;
#[cfg(feature = "websocket")]
pub use socket::{WebSocketFactory, WebSocketTransport};
pub use timing::*;
