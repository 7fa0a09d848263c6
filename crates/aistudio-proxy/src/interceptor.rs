//! Request and response hooks for sniffed traffic.

use aistudio_core::{decode_response, ParsedEvent, WireError};

use crate::http::Headers;

/// Hooks invoked on traffic to the content-generation endpoint.
pub trait Interceptor: Send + Sync {
    /// Returns true if a request to `path` should be sniffed.
    fn should_intercept_path(&self, _host: &str, path: &str) -> bool {
        aistudio_core::should_intercept_path(path)
    }

    /// Transforms a request body before it is sent to the origin.
    ///
    /// An error makes the caller forward the original body.
    fn process_request(&self, body: &[u8], host: &str, path: &str) -> Result<Vec<u8>, WireError>;

    /// Decodes the accumulated response body into a cumulative event.
    fn process_response(
        &self,
        body: &[u8],
        host: &str,
        path: &str,
        headers: &Headers,
    ) -> Result<ParsedEvent, WireError>;
}

/// Default hooks: requests pass through untouched, responses are decoded
/// from the origin's chunked, gzipped array stream.
#[derive(Debug, Clone, Copy, Default)]
pub struct StreamInterceptor;

impl StreamInterceptor {
    pub fn new() -> Self {
        Self
    }
}

impl Interceptor for StreamInterceptor {
    fn process_request(&self, body: &[u8], host: &str, path: &str) -> Result<Vec<u8>, WireError> {
        tracing::debug!("Intercepted request: {}{} ({} bytes)", host, path, body.len());
        Ok(body.to_vec())
    }

    fn process_response(
        &self,
        body: &[u8],
        _host: &str,
        _path: &str,
        _headers: &Headers,
    ) -> Result<ParsedEvent, WireError> {
        decode_response(body)
    }
}
