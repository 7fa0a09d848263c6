//! Minimal HTTP/1.1 head parsing for the forwarding loops.
//!
//! Only what the proxy needs to decide whether to sniff: request lines,
//! status lines, and header maps. Nothing here validates the message.

use std::collections::BTreeMap;

use aistudio_core::find;

use crate::error::{ProxyError, Result};

/// Blank line separating an HTTP head from its body.
pub const HEADER_TERMINATOR: &[u8] = b"\r\n\r\n";

/// Port assumed when a CONNECT target omits one.
pub const DEFAULT_CONNECT_PORT: u16 = 443;

/// Header name to value, names as sent.
pub type Headers = BTreeMap<String, String>;

/// Splits a buffer into head (terminator included) and body-so-far.
/// Returns `None` until the terminator has arrived.
pub fn split_head(buf: &[u8]) -> Option<(&[u8], &[u8])> {
    find(buf, HEADER_TERMINATOR).map(|pos| buf.split_at(pos + HEADER_TERMINATOR.len()))
}

/// An HTTP request line: `METHOD target VERSION`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestLine {
    pub method: String,
    pub target: String,
    pub version: String,
}

impl RequestLine {
    /// Parses a request line, which must split on single spaces into exactly
    /// three parts.
    pub fn parse(line: &str) -> Option<Self> {
        let mut parts = line.split(' ');
        let (Some(method), Some(target), Some(version), None) =
            (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            return None;
        };

        Some(Self {
            method: method.to_string(),
            target: target.to_string(),
            version: version.to_string(),
        })
    }

    /// Parses the first line of a request head.
    pub fn from_head(head: &[u8]) -> Option<Self> {
        Self::parse(&String::from_utf8_lossy(first_line(head)))
    }
}

/// Status code and reason phrase of a response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusLine {
    pub code: u16,
    pub reason: String,
}

impl Default for StatusLine {
    fn default() -> Self {
        Self {
            code: 200,
            reason: "OK".to_string(),
        }
    }
}

impl StatusLine {
    /// Parses `HTTP/1.1 <code> [<reason>]`. Anything unparseable reads as
    /// `200 OK`.
    pub fn parse(line: &str) -> Self {
        let mut parts = line.splitn(3, ' ');
        let _version = parts.next();
        let Some(code) = parts.next().and_then(|c| c.trim().parse().ok()) else {
            return Self::default();
        };

        Self {
            code,
            reason: parts.next().unwrap_or_default().to_string(),
        }
    }

    /// Returns true for 4xx and 5xx statuses.
    pub fn is_error(&self) -> bool {
        self.code >= 400
    }
}

/// Parsed status line and headers of a response.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResponseHead {
    pub status: StatusLine,
    pub headers: Headers,
}

impl ResponseHead {
    /// Parses a response head. Malformed header lines are skipped.
    pub fn parse(head: &[u8]) -> Self {
        let text = String::from_utf8_lossy(head);
        let mut lines = text.split("\r\n");

        let status = lines.next().map(StatusLine::parse).unwrap_or_default();
        let headers = lines
            .filter(|line| !line.is_empty())
            .filter_map(|line| line.split_once(':'))
            .map(|(name, value)| (name.trim().to_string(), value.trim().to_string()))
            .collect();

        Self { status, headers }
    }
}

/// Splits a CONNECT target into host and port.
pub fn parse_connect_target(target: &str) -> Result<(String, u16)> {
    split_host_port(target, DEFAULT_CONNECT_PORT)
        .filter(|(host, _)| !host.is_empty())
        .ok_or_else(|| ProxyError::RequestLine(format!("CONNECT {}", target)))
}

/// Splits `host[:port]`, accepting bracketed IPv6 literals.
fn split_host_port(authority: &str, default_port: u16) -> Option<(String, u16)> {
    if let Some(rest) = authority.strip_prefix('[') {
        let (host, tail) = rest.split_once(']')?;
        let port = match tail.strip_prefix(':') {
            Some(port) => port.parse().ok()?,
            None if tail.is_empty() => default_port,
            None => return None,
        };
        return Some((host.to_string(), port));
    }

    match authority.rsplit_once(':') {
        Some((host, port)) => Some((host.to_string(), port.parse().ok()?)),
        None => Some((authority.to_string(), default_port)),
    }
}

fn first_line(head: &[u8]) -> &[u8] {
    match find(head, b"\r\n") {
        Some(pos) => &head[..pos],
        None => head,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_host_port_defaults() {
        assert_eq!(
            split_host_port("example.com", 443),
            Some(("example.com".to_string(), 443))
        );
        assert_eq!(
            split_host_port("example.com:8443", 443),
            Some(("example.com".to_string(), 8443))
        );
        assert_eq!(split_host_port("[::1]", 443), Some(("::1".to_string(), 443)));
        assert_eq!(split_host_port("example.com:", 443), None);
    }

    // ==================== split_head Tests ====================

    #[test]
    fn split_head_waits_for_terminator() {
        assert!(split_head(b"POST / HTTP/1.1\r\nHost: a\r\n").is_none());

        let (head, body) = split_head(b"POST / HTTP/1.1\r\nHost: a\r\n\r\nbody").unwrap();
        assert_eq!(head, b"POST / HTTP/1.1\r\nHost: a\r\n\r\n");
        assert_eq!(body, b"body");
    }

    // ==================== RequestLine Tests ====================

    #[test]
    fn request_line_three_parts() {
        let line = RequestLine::parse("CONNECT aistudio.google.com:443 HTTP/1.1").unwrap();
        assert_eq!(line.method, "CONNECT");
        assert_eq!(line.target, "aistudio.google.com:443");
        assert_eq!(line.version, "HTTP/1.1");
    }

    #[test]
    fn request_line_wrong_arity() {
        assert!(RequestLine::parse("GET /").is_none());
        assert!(RequestLine::parse("GET / HTTP/1.1 extra").is_none());
        assert!(RequestLine::parse("").is_none());
    }

    #[test]
    fn request_line_from_head() {
        let line = RequestLine::from_head(b"POST /x:generateContent HTTP/1.1\r\nHost: a\r\n\r\n")
            .unwrap();
        assert_eq!(line.target, "/x:generateContent");
    }

    // ==================== StatusLine Tests ====================

    #[test]
    fn status_line_with_reason() {
        let status = StatusLine::parse("HTTP/1.1 429 Too Many Requests");
        assert_eq!(status.code, 429);
        assert_eq!(status.reason, "Too Many Requests");
        assert!(status.is_error());
    }

    #[test]
    fn status_line_without_reason() {
        let status = StatusLine::parse("HTTP/1.1 204");
        assert_eq!(status.code, 204);
        assert_eq!(status.reason, "");
        assert!(!status.is_error());
    }

    #[test]
    fn status_line_defaults_when_unparseable() {
        assert_eq!(StatusLine::parse("garbage"), StatusLine::default());
        assert_eq!(StatusLine::parse("HTTP/1.1 abc Nope"), StatusLine::default());
    }

    // ==================== ResponseHead Tests ====================

    #[test]
    fn response_head_skips_malformed_headers() {
        let head = ResponseHead::parse(
            b"HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nbogus\r\nX-A:  b:c \r\n\r\n",
        );
        assert_eq!(head.status.code, 200);
        assert_eq!(head.headers.len(), 2);
        assert_eq!(head.headers["Content-Type"], "application/json");
        assert_eq!(head.headers["X-A"], "b:c");
    }

    // ==================== parse_connect_target Tests ====================

    #[test]
    fn connect_target_with_port() {
        assert_eq!(
            parse_connect_target("aistudio.google.com:443").unwrap(),
            ("aistudio.google.com".to_string(), 443)
        );
    }

    #[test]
    fn connect_target_defaults_to_443() {
        assert_eq!(
            parse_connect_target("example.com").unwrap(),
            ("example.com".to_string(), 443)
        );
    }

    #[test]
    fn connect_target_rejects_bad_port() {
        assert!(matches!(
            parse_connect_target("example.com:https"),
            Err(ProxyError::RequestLine(_))
        ));
        assert!(parse_connect_target(":443").is_err());
    }
}
