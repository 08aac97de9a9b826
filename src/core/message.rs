//! Messages exchanged over a socket and the replies correlated to pushes.

use serde_json::{Map, Value};

use super::constants::{STATUS_OK, STATUS_TIMEOUT};

/// Message payload. Phoenix payloads are always JSON objects.
pub type Payload = Map<String, Value>;

/// Convert a JSON value into a payload.
///
/// Objects are taken as-is; any other value yields an empty payload.
pub fn to_payload(value: Value) -> Payload {
    match value {
        Value::Object(map) => map,
        _ => Payload::new(),
    }
}

/// A single protocol message.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    /// Ref of the join this message belongs to.
    pub join_ref: Option<String>,
    /// Correlation ref.
    pub msg_ref: Option<String>,
    /// Channel topic.
    pub topic: String,
    /// Event name.
    pub event: String,
    /// Event payload.
    pub payload: Payload,
}

impl Message {
    /// Create a locally constructed message without refs.
    pub fn new(topic: impl Into<String>, event: impl Into<String>, payload: Payload) -> Self {
        Self {
            join_ref: None,
            msg_ref: None,
            topic: topic.into(),
            event: event.into(),
            payload,
        }
    }

    /// Set the correlation ref.
    pub fn with_ref(mut self, msg_ref: Option<String>) -> Self {
        self.msg_ref = msg_ref;
        self
    }

    /// Set the join ref.
    pub fn with_join_ref(mut self, join_ref: Option<String>) -> Self {
        self.join_ref = join_ref;
        self
    }

    /// Reply status carried in the payload, if any.
    pub fn status(&self) -> Option<&str> {
        self.payload.get("status").and_then(Value::as_str)
    }
}

/// Outcome class of a push.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReplyStatus {
    /// Server replied `ok`.
    Ok,
    /// Server replied with any other status.
    Error,
    /// No reply arrived before the push timed out.
    Timeout,
}

impl ReplyStatus {
    /// Wire name of the status.
    pub fn as_str(&self) -> &'static str {
        match self {
            ReplyStatus::Ok => STATUS_OK,
            ReplyStatus::Error => super::constants::STATUS_ERROR,
            ReplyStatus::Timeout => STATUS_TIMEOUT,
        }
    }
}

/// Terminal outcome of a push.
#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    /// Server accepted the push; carries the reply `response`.
    Ok(Payload),
    /// Server rejected the push; carries the reply `response`.
    Error(Payload),
    /// No reply arrived in time.
    Timeout,
}

impl Reply {
    /// Build a reply from a `phx_reply` payload (`{"status": .., "response": ..}`).
    pub fn from_payload(payload: &Payload) -> Self {
        let response = match payload.get("response") {
            Some(Value::Object(map)) => map.clone(),
            _ => Payload::new(),
        };
        match payload.get("status").and_then(Value::as_str) {
            Some(STATUS_OK) => Reply::Ok(response),
            Some(STATUS_TIMEOUT) => Reply::Timeout,
            _ => Reply::Error(response),
        }
    }

    /// Status class of this reply.
    pub fn status(&self) -> ReplyStatus {
        match self {
            Reply::Ok(_) => ReplyStatus::Ok,
            Reply::Error(_) => ReplyStatus::Error,
            Reply::Timeout => ReplyStatus::Timeout,
        }
    }

    /// Response payload, if the server replied.
    pub fn response(&self) -> Option<&Payload> {
        match self {
            Reply::Ok(response) | Reply::Error(response) => Some(response),
            Reply::Timeout => None,
        }
    }
}
