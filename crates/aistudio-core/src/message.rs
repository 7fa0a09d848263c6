//! Messages handed from the proxy to the streaming consumer.

use serde_json::Value;

use crate::events::{ParsedEvent, UpstreamErrorEvent};

/// Literal token announcing that the proxy is bound and accepting.
pub const READY_TOKEN: &str = "READY";

/// One message on the hand-off queue.
#[derive(Debug, Clone, PartialEq)]
pub enum QueueMessage {
    /// The listener is up. Sent once.
    Ready,
    /// Cumulative decode of a sniffed response.
    Event(ParsedEvent),
    /// The origin rejected a sniffed request.
    UpstreamError(UpstreamErrorEvent),
}

impl QueueMessage {
    /// Returns the wire form: the ready token, or the event as JSON.
    pub fn to_wire(&self) -> serde_json::Result<String> {
        match self {
            Self::Ready => Ok(READY_TOKEN.to_string()),
            Self::Event(event) => serde_json::to_string(event),
            Self::UpstreamError(error) => serde_json::to_string(error),
        }
    }

    /// Parses a wire-form message, as read by a consumer in another process.
    pub fn from_wire(line: &str) -> serde_json::Result<Self> {
        let line = line.trim();
        if line == READY_TOKEN {
            return Ok(Self::Ready);
        }

        let value: Value = serde_json::from_str(line)?;
        if value.get("error").and_then(Value::as_bool) == Some(true) {
            Ok(Self::UpstreamError(serde_json::from_value(value)?))
        } else {
            Ok(Self::Event(serde_json::from_value(value)?))
        }
    }

    /// Returns true if this message ends the current response stream.
    pub fn is_terminal(&self) -> bool {
        match self {
            Self::Ready => false,
            Self::Event(event) => event.done,
            Self::UpstreamError(_) => true,
        }
    }
}

impl From<ParsedEvent> for QueueMessage {
    fn from(event: ParsedEvent) -> Self {
        Self::Event(event)
    }
}

impl From<UpstreamErrorEvent> for QueueMessage {
    fn from(error: UpstreamErrorEvent) -> Self {
        Self::UpstreamError(error)
    }
}
