//! Shared fixtures for the proxy's tests.

use std::io::Write;

use flate2::write::GzEncoder;
use flate2::Compression;
use parking_lot::Mutex;

use aistudio_core::{ParsedEvent, WireError};

use crate::http::Headers;
use crate::interceptor::{Interceptor, StreamInterceptor};

/// Default hooks that also record every request they see.
#[derive(Debug, Default)]
pub struct RecordingInterceptor {
    pub requests: Mutex<Vec<(String, String, Vec<u8>)>>,
    pub responses: Mutex<usize>,
}

impl Interceptor for RecordingInterceptor {
    fn process_request(&self, body: &[u8], host: &str, path: &str) -> Result<Vec<u8>, WireError> {
        self.requests
            .lock()
            .push((host.to_string(), path.to_string(), body.to_vec()));
        StreamInterceptor.process_request(body, host, path)
    }

    fn process_response(
        &self,
        body: &[u8],
        host: &str,
        path: &str,
        headers: &Headers,
    ) -> Result<ParsedEvent, WireError> {
        *self.responses.lock() += 1;
        StreamInterceptor.process_response(body, host, path, headers)
    }
}

/// One visible-text fragment in the origin's stream format.
pub fn text_fragment(text: &str) -> String {
    format!(r#"[[[null,{}]],"model"]"#, serde_json::json!(text))
}

/// Gzips `text` and frames it as a single chunk plus the terminal chunk.
pub fn chunked_gzip(text: &str) -> Vec<u8> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(text.as_bytes()).unwrap();
    let compressed = encoder.finish().unwrap();

    let mut body = format!("{:x}\r\n", compressed.len()).into_bytes();
    body.extend_from_slice(&compressed);
    body.extend_from_slice(b"\r\n0\r\n\r\n");
    body
}

/// A complete sniffable response carrying `text`.
pub fn generate_content_response(text: &str) -> Vec<u8> {
    let mut response = b"HTTP/1.1 200 OK\r\nContent-Type: application/json+protobuf\r\n\
Content-Encoding: gzip\r\nTransfer-Encoding: chunked\r\n\r\n"
        .to_vec();
    response.extend_from_slice(&chunked_gzip(&format!("[{}]", text_fragment(text))));
    response
}

/// A generation request with a small body.
pub fn generate_content_request(body: &str) -> Vec<u8> {
    format!(
        "POST /$rpc/MakerSuiteService/GenerateContent HTTP/1.1\r\nHost: alkalimakersuite-pa.clients6.google.com\r\nContent-Length: {}\r\n\r\n{}",
        body.len(),
        body
    )
    .into_bytes()
}
