//! Wire frame encoding and decoding.
//!
//! Serializer `vsn=2.0.0` encodes every message as a JSON array:
//!
//! ```text
//! [join_ref, ref, topic, event, payload]
//! ```
//!
//! `join_ref` and `ref` are strings or `null`; `payload` is always an object.

use std::fmt;

use serde_json::Value;
use thiserror::Error;

use crate::core::{Message, Payload};

/// Frame encoding/decoding errors.
#[derive(Debug, Error)]
pub enum FrameError {
    /// Frame is not a valid 5-element JSON array.
    #[error("invalid frame: {0}")]
    Json(#[from] serde_json::Error),

    /// Payload element is not a JSON object.
    #[error("payload is not an object")]
    PayloadNotObject,
}

/// Converts messages to and from their wire representation.
pub trait Serializer: Send + Sync + fmt::Debug {
    /// Encode a message into a text frame.
    fn encode(&self, message: &Message) -> Result<String, FrameError>;

    /// Decode a text frame into a message.
    fn decode(&self, text: &str) -> Result<Message, FrameError>;
}

/// JSON array serializer for protocol version 2.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonSerializer;

type WireFrame = (Option<String>, Option<String>, String, String, Value);

impl Serializer for JsonSerializer {
    fn encode(&self, message: &Message) -> Result<String, FrameError> {
        let frame = (
            &message.join_ref,
            &message.msg_ref,
            &message.topic,
            &message.event,
            &message.payload,
        );
        Ok(serde_json::to_string(&frame)?)
    }

    fn decode(&self, text: &str) -> Result<Message, FrameError> {
        let (join_ref, msg_ref, topic, event, payload): WireFrame = serde_json::from_str(text)?;
        let payload: Payload = match payload {
            Value::Object(map) => map,
            _ => return Err(FrameError::PayloadNotObject),
        };
        Ok(Message {
            join_ref,
            msg_ref,
            topic,
            event,
            payload,
        })
    }
}
