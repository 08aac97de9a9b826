//! Phoenix Channels - Client
//!
//! The socket, its channels and the pushes they send.
//!
//! - [`Socket`]: connection manager (reconnect, heartbeat, dispatch)
//! - [`Channel`]: join/leave state machine and event bindings for one topic
//! - [`Push`]: an outbound event and its correlated [`Reply`](crate::core::Reply)

mod channel;
mod config;
mod push;
mod socket;

pub(crate) use channel::WeakChannel;
pub use channel::{Channel, ChannelState};
pub use config::*;
pub use push::Push;
pub use socket::Socket;
