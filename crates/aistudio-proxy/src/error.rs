//! Error types for the proxy.

use std::io;

use thiserror::Error;

/// Proxy error type.
#[derive(Debug, Error)]
pub enum ProxyError {
    /// Failed to bind the listening socket.
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: io::Error,
    },

    /// Certificate error.
    #[error("certificate error: {0}")]
    Cert(#[from] CaManagerError),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// TLS error.
    #[error("TLS error: {0}")]
    Tls(String),

    /// Connecting to the origin failed.
    #[error("upstream connection to {host}:{port} failed: {reason}")]
    UpstreamConnect {
        host: String,
        port: u16,
        reason: String,
    },

    /// The forwarding proxy refused or garbled the tunnel setup.
    #[error("upstream proxy error: {0}")]
    UpstreamProxy(String),

    /// The client's request line could not be parsed.
    #[error("malformed request line: {0:?}")]
    RequestLine(String),

    /// Invalid configuration.
    #[error("configuration error: {0}")]
    Config(String),

    /// The connection was cancelled. Must reach the task that owns it.
    #[error("connection cancelled")]
    Cancelled,
}

impl ProxyError {
    /// Returns true if this is a cancellation rather than a failure.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    /// Returns true for the noise a peer produces by hanging up mid-stream.
    pub fn is_disconnect(&self) -> bool {
        match self {
            Self::Io(e) => is_disconnect(e),
            _ => false,
        }
    }
}

/// Returns true for IO errors caused by the peer going away.
pub fn is_disconnect(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::BrokenPipe
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::UnexpectedEof
    )
}

/// CA manager error type.
#[derive(Debug, Error)]
pub enum CaManagerError {
    /// Failed to generate a certificate.
    #[error("Failed to generate certificate: {0}")]
    Generation(String),

    /// Failed to read a certificate or key.
    #[error("Failed to read certificate: {0}")]
    Read(#[from] io::Error),

    /// Failed to parse a certificate or key.
    #[error("Failed to parse certificate: {0}")]
    Parse(String),

    /// Failed to write a certificate or key.
    #[error("Failed to write certificate: {0}")]
    Write(String),

    /// The hostname cannot be used as a file name.
    #[error("Invalid hostname for certificate: {0:?}")]
    InvalidHost(String),
}

/// Result type for proxy operations.
pub type Result<T> = std::result::Result<T, ProxyError>;
