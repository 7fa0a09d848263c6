//! Event types and the scanner for the origin's array-based stream format.
//!
//! The generation endpoint streams JSON arrays in which every model
//! contribution looks like `[[[null,<payload...>]],"model"]`. The payload is
//! positional: its arity tells visible text, hidden reasoning, and tool
//! calls apart.

use once_cell::sync::Lazy;
use regex::bytes::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::chunked::decode_chunked;
use crate::error::{Result, WireError};
use crate::gzip::decompress_gzip;
use crate::params::{decode_params, ToolParams};

/// Shortest span shaped like one model fragment.
static FRAGMENT_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?-u)\[\[\[null,.*?\]\],"model"\]"#).expect("Invalid fragment pattern")
});

/// Payload arity of a visible text delta.
const TEXT_ARITY: usize = 2;

/// Payload arity of a tool-call invocation.
const TOOL_CALL_ARITY: usize = 11;

/// Index of the `[name, params]` pair inside a tool-call payload.
const TOOL_CALL_INDEX: usize = 10;

/// A tool invocation decoded from the stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    /// Function name.
    pub name: String,
    /// Decoded parameters.
    pub params: ToolParams,
}

/// Text, reasoning, and tool calls recovered from one scan.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EventScan {
    /// Visible text, concatenated in stream order.
    pub body: String,
    /// Hidden reasoning text, concatenated in stream order.
    pub reason: String,
    /// Tool calls in stream order.
    pub function: Vec<ToolCall>,
}

/// Cumulative view of one streamed response.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ParsedEvent {
    /// All visible text observed so far.
    pub body: String,
    /// All reasoning text observed so far.
    pub reason: String,
    /// All tool calls observed so far.
    pub function: Vec<ToolCall>,
    /// Whether the terminal chunk of the HTTP message has been seen.
    pub done: bool,
}

impl ParsedEvent {
    /// Builds an event from a scan and the message completion flag.
    pub fn from_scan(scan: EventScan, done: bool) -> Self {
        Self {
            body: scan.body,
            reason: scan.reason,
            function: scan.function,
            done,
        }
    }
}

/// Signal sent instead of a [`ParsedEvent`] when the origin answers a
/// generation request with an HTTP error status.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpstreamErrorEvent {
    /// Always `true`; lets consumers tell this apart from a parsed event.
    pub error: bool,
    /// HTTP status code from the origin.
    pub status: u16,
    /// Status code and reason phrase, e.g. `"429 Too Many Requests"`.
    pub message: String,
    /// Always `true`; the stream is over.
    pub done: bool,
}

impl UpstreamErrorEvent {
    /// Creates an error event from a status code and reason phrase.
    pub fn new(status: u16, reason: &str) -> Self {
        Self {
            error: true,
            status,
            message: format!("{} {}", status, reason),
            done: true,
        }
    }
}

/// Scans decoded response text for model fragments.
///
/// Fragments that are not valid JSON, or whose payload has an unexpected
/// shape, are skipped. A tool call whose parameter block is malformed is an
/// error, since it means the format itself has changed.
pub fn parse_events(text: &[u8]) -> Result<EventScan> {
    let mut scan = EventScan::default();

    for fragment in FRAGMENT_PATTERN.find_iter(text) {
        let Ok(json) = serde_json::from_slice::<Value>(fragment.as_bytes()) else {
            tracing::trace!("Skipping undecodable fragment at offset {}", fragment.start());
            continue;
        };
        let Some(payload) = json
            .get(0)
            .and_then(|v| v.get(0))
            .and_then(Value::as_array)
        else {
            continue;
        };

        if payload.len() == TEXT_ARITY {
            push_text(&mut scan.body, &payload[1]);
        } else if is_tool_call(payload) {
            scan.function.push(decode_tool_call(&payload[TOOL_CALL_INDEX])?);
        } else if payload.len() > TEXT_ARITY {
            push_text(&mut scan.reason, &payload[1]);
        }
    }

    Ok(scan)
}

/// Runs the full response pipeline: de-chunk, decompress, scan.
pub fn decode_response(body: &[u8]) -> Result<ParsedEvent> {
    let (dechunked, done) = decode_chunked(body);
    let decompressed = decompress_gzip(&dechunked)?;
    let scan = parse_events(&decompressed)?;
    Ok(ParsedEvent::from_scan(scan, done))
}

fn is_tool_call(payload: &[Value]) -> bool {
    payload.len() == TOOL_CALL_ARITY && payload[1].is_null() && payload[TOOL_CALL_INDEX].is_array()
}

fn push_text(target: &mut String, value: &Value) {
    if let Some(text) = value.as_str() {
        target.push_str(text);
    }
}

fn decode_tool_call(call: &Value) -> Result<ToolCall> {
    let name = call
        .get(0)
        .and_then(Value::as_str)
        .ok_or_else(|| WireError::MalformedParams("tool call has no function name".into()))?;
    let raw_params = call.get(1).ok_or_else(|| {
        WireError::MalformedParams(format!("tool call '{}' has no parameter block", name))
    })?;

    Ok(ToolCall {
        name: name.to_string(),
        params: decode_params(raw_params)?,
    })
}
