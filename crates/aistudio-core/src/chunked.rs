//! HTTP/1.1 chunked transfer decoding over a possibly incomplete body.
//!
//! The proxy re-decodes the whole accumulated body every time new bytes
//! arrive, so the decoder must accept any prefix of a chunked stream and
//! report how far it got instead of waiting for more input.

/// Marker that terminates a chunked body (last-chunk followed by an empty
/// trailer section).
pub const TERMINAL_CHUNK: &[u8] = b"0\r\n\r\n";

const CRLF: &[u8] = b"\r\n";

/// Reason a chunk-size line could not be read.
#[derive(Debug)]
struct InvalidChunkSize;

/// Decodes a chunked body, returning the payload bytes and whether the
/// terminal chunk has been seen.
///
/// Decoding stops at the first chunk that is not fully present and returns
/// the payload decoded so far with `is_done = false`. A malformed chunk-size
/// line discards everything, including chunks decoded earlier in the call.
///
/// # Examples
///
/// ```
/// use aistudio_core::decode_chunked;
///
/// let (data, done) = decode_chunked(b"5\r\nhello\r\n0\r\n\r\n");
/// assert_eq!(data, b"hello");
/// assert!(done);
///
/// let (data, done) = decode_chunked(b"5\r\nhello\r\n3\r\nwo");
/// assert_eq!(data, b"hello");
/// assert!(!done);
/// ```
pub fn decode_chunked(body: &[u8]) -> (Vec<u8>, bool) {
    match try_decode_chunked(body) {
        Ok(decoded) => decoded,
        Err(InvalidChunkSize) => {
            tracing::debug!("Chunked body has an invalid size line, discarding decoded data");
            (Vec::new(), false)
        }
    }
}

fn try_decode_chunked(body: &[u8]) -> Result<(Vec<u8>, bool), InvalidChunkSize> {
    let mut decoded = Vec::with_capacity(body.len());
    let mut rest = body;

    loop {
        let Some(line_end) = find(rest, CRLF) else {
            break;
        };

        let size = parse_chunk_size(&rest[..line_end])?;
        let payload_start = line_end + CRLF.len();

        if size == 0 {
            let done = rest[payload_start..].starts_with(CRLF);
            return Ok((decoded, done));
        }

        let Some(payload_end) = payload_start.checked_add(size) else {
            break;
        };
        if payload_end > rest.len() {
            break;
        }
        decoded.extend_from_slice(&rest[payload_start..payload_end]);

        let next = payload_end + CRLF.len();
        if next > rest.len() {
            break;
        }
        rest = &rest[next..];
    }

    Ok((decoded, false))
}

/// Parses a hexadecimal chunk-size line, ignoring chunk extensions.
fn parse_chunk_size(line: &[u8]) -> Result<usize, InvalidChunkSize> {
    let line = std::str::from_utf8(line).map_err(|_| InvalidChunkSize)?;
    let size = line.split(';').next().unwrap_or(line).trim();
    usize::from_str_radix(size, 16).map_err(|_| InvalidChunkSize)
}

/// Returns the index of the first occurrence of `needle` in `haystack`.
pub fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || haystack.len() < needle.len() {
        return None;
    }
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

/// Returns true if `haystack` contains `needle`.
pub fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    find(haystack, needle).is_some()
}
