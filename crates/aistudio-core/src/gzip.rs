//! Single-shot decompression of (possibly truncated) gzip bodies.

use std::io::{ErrorKind, Read};

use flate2::bufread::{GzDecoder, ZlibDecoder};

use crate::error::Result;

/// Magic bytes that open every gzip member.
const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

/// Decompresses a gzip (or zlib) stream, returning everything decodable from
/// the bytes present.
///
/// A stream that is cut short mid-transfer yields the prefix decoded so far.
/// Corrupt input is an error and is returned to the caller.
///
/// # Examples
///
/// ```
/// use std::io::Write;
///
/// use aistudio_core::decompress_gzip;
/// use flate2::{write::GzEncoder, Compression};
///
/// let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
/// encoder.write_all(b"hello").unwrap();
/// let compressed = encoder.finish().unwrap();
///
/// assert_eq!(decompress_gzip(&compressed).unwrap(), b"hello");
/// ```
pub fn decompress_gzip(compressed: &[u8]) -> Result<Vec<u8>> {
    if compressed.is_empty() {
        return Ok(Vec::new());
    }

    let mut decompressed = Vec::new();
    let outcome = if compressed.starts_with(&GZIP_MAGIC) {
        GzDecoder::new(compressed).read_to_end(&mut decompressed)
    } else {
        ZlibDecoder::new(compressed).read_to_end(&mut decompressed)
    };

    match outcome {
        Ok(_) => Ok(decompressed),
        // Bytes decoded before the stream ran dry stay in the buffer.
        Err(e) if e.kind() == ErrorKind::UnexpectedEof => Ok(decompressed),
        Err(e) => Err(e.into()),
    }
}
