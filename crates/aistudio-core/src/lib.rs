//! AI Studio Core - decoding of the generation endpoint's streamed responses.
//!
//! The proxy taps the browser's traffic to the generation endpoint and hands
//! raw response bytes to this crate, which turns them into structured events.
//!
//! ## Pipeline
//!
//! ```text
//! raw body ─▶ decode_chunked ─▶ decompress_gzip ─▶ parse_events ─▶ ParsedEvent
//!                                                       │
//!                                                       └─▶ decode_params (tool calls)
//! ```
//!
//! Every stage accepts a body that is still arriving. The proxy re-runs the
//! pipeline over the accumulated bytes on each read, so each [`ParsedEvent`]
//! is cumulative and `done` flips once the terminal chunk is seen.

mod chunked;
mod error;
mod events;
mod gzip;
mod message;
mod params;

pub use chunked::{contains, decode_chunked, find, TERMINAL_CHUNK};
pub use error::{Result, WireError};
pub use events::{
    decode_response, parse_events, EventScan, ParsedEvent, ToolCall, UpstreamErrorEvent,
};
pub use gzip::decompress_gzip;
pub use message::{QueueMessage, READY_TOKEN};
pub use params::{decode_params, ParamValue, ToolParams};

/// Path fragments that identify the content-generation endpoint.
pub const GENERATE_CONTENT_MARKERS: &[&str] = &["GenerateContent", "generateContent"];

/// Returns true if the request path targets the content-generation endpoint.
///
/// # Examples
///
/// ```
/// use aistudio_core::should_intercept_path;
///
/// assert!(should_intercept_path("/$rpc/google.internal.alkali.applications.makersuite.v1.MakerSuiteService/GenerateContent"));
/// assert!(should_intercept_path("/v1beta/models/gemini-pro:streamGenerateContent"));
/// assert!(!should_intercept_path("/v1beta/models"));
/// ```
pub fn should_intercept_path(path: &str) -> bool {
    GENERATE_CONTENT_MARKERS
        .iter()
        .any(|marker| path.contains(marker))
}
