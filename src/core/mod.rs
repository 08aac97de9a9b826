//! Phoenix Channels - Core types and constants.
//!
//! Reserved event names, error types and the message/reply model shared by
//! every other layer.

mod constants;
mod error;
mod message;

pub use constants::*;
pub use error::*;
pub use message::*;
