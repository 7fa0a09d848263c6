//! Origin connections, direct or through a forwarding proxy.
//!
//! Supports chaining through an HTTP proxy (CONNECT, optional Basic auth),
//! a SOCKS4/4a proxy (user id only), or a SOCKS5 proxy (optional
//! username/password auth, remote DNS).

use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use rustls::crypto::ring::default_provider;
use rustls::pki_types::ServerName;
use rustls::{ClientConfig, RootCertStore};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;

use aistudio_core::find;

use crate::ca::load_certs;
use crate::config::{ProxyConfig, UpstreamProxy, UpstreamScheme};
use crate::error::{ProxyError, Result};
use crate::http::HEADER_TERMINATOR;

/// Time allowed to establish an origin connection, tunnel included.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Largest response head accepted from an HTTP forwarding proxy.
const MAX_PROXY_RESPONSE_HEAD: usize = 8192;

/// A bidirectional byte stream to an origin.
pub trait AsyncStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> AsyncStream for T {}

/// Boxed origin stream, plain or TLS.
pub type BoxedStream = Box<dyn AsyncStream>;

/// Opens byte streams to origin servers.
#[async_trait]
pub trait UpstreamConnector: Send + Sync {
    /// Connects to `host:port`, wrapping the stream in TLS when `tls` is set.
    async fn connect(&self, host: &str, port: u16, tls: bool) -> Result<BoxedStream>;
}

/// Default connector: TCP, optionally tunneled through a forwarding proxy.
#[derive(Clone)]
pub struct DirectConnector {
    upstream: Option<UpstreamProxy>,
    tls: TlsConnector,
    timeout: Duration,
}

impl std::fmt::Debug for DirectConnector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DirectConnector")
            .field("upstream", &self.upstream)
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl DirectConnector {
    /// Creates a connector with the given forwarding proxy and TLS config.
    pub fn new(upstream: Option<UpstreamProxy>, tls_config: Arc<ClientConfig>) -> Self {
        Self {
            upstream,
            tls: TlsConnector::from(tls_config),
            timeout: CONNECT_TIMEOUT,
        }
    }

    /// Creates a connector from the proxy configuration.
    pub fn from_config(config: &ProxyConfig) -> Result<Self> {
        let tls_config = client_tls_config(&config.extra_root_certs)?;
        Ok(Self::new(config.upstream()?, tls_config))
    }

    /// Sets the connection timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Returns the forwarding proxy, if any.
    pub fn upstream(&self) -> Option<&UpstreamProxy> {
        self.upstream.as_ref()
    }

    async fn open_tcp(&self, host: &str, port: u16) -> Result<TcpStream> {
        let Some(proxy) = &self.upstream else {
            return Ok(TcpStream::connect((host, port)).await?);
        };

        let mut stream = TcpStream::connect(proxy.address()).await.map_err(|e| {
            ProxyError::UpstreamProxy(format!("cannot connect to {}: {}", proxy, e))
        })?;

        match proxy.scheme {
            UpstreamScheme::Http => http_connect(&mut stream, proxy, host, port).await?,
            UpstreamScheme::Socks4 => socks4_connect(&mut stream, proxy, host, port).await?,
            UpstreamScheme::Socks5 => socks5_connect(&mut stream, proxy, host, port).await?,
        }

        tracing::debug!("Tunnel to {}:{} established via {}", host, port, proxy);
        Ok(stream)
    }
}

#[async_trait]
impl UpstreamConnector for DirectConnector {
    async fn connect(&self, host: &str, port: u16, tls: bool) -> Result<BoxedStream> {
        let connect_error = |reason: String| ProxyError::UpstreamConnect {
            host: host.to_string(),
            port,
            reason,
        };

        let stream = tokio::time::timeout(self.timeout, self.open_tcp(host, port))
            .await
            .map_err(|_| connect_error(format!("timed out after {:?}", self.timeout)))?
            .map_err(|e| match e {
                ProxyError::Io(e) => connect_error(e.to_string()),
                other => other,
            })?;

        if !tls {
            return Ok(Box::new(stream));
        }

        let server_name = ServerName::try_from(host.to_string())
            .map_err(|e| ProxyError::Tls(format!("invalid server name {}: {}", host, e)))?;
        let tls_stream = self
            .tls
            .connect(server_name, stream)
            .await
            .map_err(|e| ProxyError::Tls(format!("handshake with {}:{} failed: {}", host, port, e)))?;

        Ok(Box::new(tls_stream))
    }
}

/// Builds the client TLS config for origin connections: webpki roots plus
/// any extra PEM roots.
pub fn client_tls_config(extra_roots: &[PathBuf]) -> Result<Arc<ClientConfig>> {
    let mut roots = RootCertStore::empty();
    roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

    for path in extra_roots {
        for cert in load_certs(path)? {
            roots
                .add(cert)
                .map_err(|e| ProxyError::Tls(format!("bad root in {:?}: {}", path, e)))?;
        }
    }

    let mut config = ClientConfig::builder_with_provider(Arc::new(default_provider()))
        .with_safe_default_protocol_versions()
        .map_err(|e| ProxyError::Tls(e.to_string()))?
        .with_root_certificates(roots)
        .with_no_client_auth();
    config.alpn_protocols = vec![b"http/1.1".to_vec()];

    Ok(Arc::new(config))
}

// =============================================================================
// HTTP CONNECT chaining
// =============================================================================

async fn http_connect<S>(stream: &mut S, proxy: &UpstreamProxy, host: &str, port: u16) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut request = format!(
        "CONNECT {}:{} HTTP/1.1\r\nHost: {}:{}\r\n",
        host, port, host, port
    );
    if let Some(credentials) = &proxy.credentials {
        let token = BASE64.encode(format!("{}:{}", credentials.username, credentials.password));
        request.push_str(&format!("Proxy-Authorization: Basic {}\r\n", token));
    }
    request.push_str("\r\n");

    stream.write_all(request.as_bytes()).await?;
    stream.flush().await?;

    let head = read_response_head(stream).await?;
    let status_line = String::from_utf8_lossy(&head);
    let status_line = status_line.lines().next().unwrap_or_default();
    let status = parse_status_code(status_line)?;

    if status != 200 {
        return Err(ProxyError::UpstreamProxy(format!(
            "{} rejected CONNECT to {}:{}: {}",
            proxy, host, port, status_line
        )));
    }
    Ok(())
}

/// Reads a response head byte by byte so no tunneled bytes are consumed.
async fn read_response_head<S>(stream: &mut S) -> Result<Vec<u8>>
where
    S: AsyncRead + Unpin,
{
    let mut head = Vec::with_capacity(256);
    while find(&head, HEADER_TERMINATOR).is_none() {
        if head.len() >= MAX_PROXY_RESPONSE_HEAD {
            return Err(ProxyError::UpstreamProxy(
                "response head from proxy too large".to_string(),
            ));
        }
        match stream.read_u8().await {
            Ok(byte) => head.push(byte),
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                return Err(ProxyError::UpstreamProxy(
                    "proxy closed the connection during CONNECT".to_string(),
                ))
            }
            Err(e) => return Err(e.into()),
        }
    }
    Ok(head)
}

fn parse_status_code(line: &str) -> Result<u16> {
    line.split_whitespace()
        .nth(1)
        .and_then(|code| code.parse().ok())
        .ok_or_else(|| ProxyError::UpstreamProxy(format!("malformed proxy response: {:?}", line)))
}

// =============================================================================
// SOCKS4 chaining
// =============================================================================

const SOCKS4_VERSION: u8 = 0x04;
const SOCKS4_GRANTED: u8 = 0x5a;

/// SOCKS4 for IPv4 targets, SOCKS4a (remote DNS) for hostnames. The
/// username, if any, is sent as the user id.
async fn socks4_connect<S>(stream: &mut S, proxy: &UpstreamProxy, host: &str, port: u16) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut request = vec![SOCKS4_VERSION, SOCKS_CMD_CONNECT];
    request.extend_from_slice(&port.to_be_bytes());

    let domain = match host.parse::<IpAddr>() {
        Ok(IpAddr::V4(ip)) => {
            request.extend_from_slice(&ip.octets());
            None
        }
        Ok(IpAddr::V6(_)) => {
            return Err(ProxyError::UpstreamProxy(format!(
                "{} cannot reach IPv6 target {}",
                proxy, host
            )))
        }
        // 0.0.0.x with x != 0 asks the proxy to resolve the name.
        Err(_) => {
            request.extend_from_slice(&[0, 0, 0, 1]);
            Some(host)
        }
    };

    if let Some(credentials) = &proxy.credentials {
        request.extend_from_slice(credentials.username.as_bytes());
    }
    request.push(0);
    if let Some(domain) = domain {
        request.extend_from_slice(domain.as_bytes());
        request.push(0);
    }
    stream.write_all(&request).await?;

    let mut reply = [0u8; 8];
    stream.read_exact(&mut reply).await?;
    if reply[1] != SOCKS4_GRANTED {
        return Err(ProxyError::UpstreamProxy(format!(
            "{} refused CONNECT to {}:{} (code {:#04x})",
            proxy, host, port, reply[1]
        )));
    }

    Ok(())
}

// =============================================================================
// SOCKS5 chaining
// =============================================================================

const SOCKS_VERSION: u8 = 0x05;
const SOCKS_AUTH_NONE: u8 = 0x00;
const SOCKS_AUTH_PASSWORD: u8 = 0x02;
const SOCKS_AUTH_UNACCEPTABLE: u8 = 0xff;
const SOCKS_PASSWORD_VERSION: u8 = 0x01;
const SOCKS_CMD_CONNECT: u8 = 0x01;
const SOCKS_ATYP_IPV4: u8 = 0x01;
const SOCKS_ATYP_DOMAIN: u8 = 0x03;
const SOCKS_ATYP_IPV6: u8 = 0x04;

async fn socks5_connect<S>(stream: &mut S, proxy: &UpstreamProxy, host: &str, port: u16) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let greeting: &[u8] = if proxy.credentials.is_some() {
        &[SOCKS_VERSION, 2, SOCKS_AUTH_NONE, SOCKS_AUTH_PASSWORD]
    } else {
        &[SOCKS_VERSION, 1, SOCKS_AUTH_NONE]
    };
    stream.write_all(greeting).await?;

    let mut choice = [0u8; 2];
    stream.read_exact(&mut choice).await?;
    if choice[0] != SOCKS_VERSION {
        return Err(ProxyError::UpstreamProxy(format!(
            "{} is not a SOCKS5 server (version {})",
            proxy, choice[0]
        )));
    }

    match (choice[1], &proxy.credentials) {
        (SOCKS_AUTH_NONE, _) => {}
        (SOCKS_AUTH_PASSWORD, Some(credentials)) => {
            let mut auth = vec![SOCKS_PASSWORD_VERSION];
            push_socks_string(&mut auth, &credentials.username, "username")?;
            push_socks_string(&mut auth, &credentials.password, "password")?;
            stream.write_all(&auth).await?;

            let mut reply = [0u8; 2];
            stream.read_exact(&mut reply).await?;
            if reply[1] != 0 {
                return Err(ProxyError::UpstreamProxy(format!(
                    "{} rejected the credentials",
                    proxy
                )));
            }
        }
        (SOCKS_AUTH_UNACCEPTABLE, _) => {
            return Err(ProxyError::UpstreamProxy(format!(
                "{} accepted none of the offered auth methods",
                proxy
            )))
        }
        (method, _) => {
            return Err(ProxyError::UpstreamProxy(format!(
                "{} chose unexpected auth method {}",
                proxy, method
            )))
        }
    }

    let mut request = vec![SOCKS_VERSION, SOCKS_CMD_CONNECT, 0x00];
    match host.parse::<IpAddr>() {
        Ok(IpAddr::V4(ip)) => {
            request.push(SOCKS_ATYP_IPV4);
            request.extend_from_slice(&ip.octets());
        }
        Ok(IpAddr::V6(ip)) => {
            request.push(SOCKS_ATYP_IPV6);
            request.extend_from_slice(&ip.octets());
        }
        Err(_) => {
            request.push(SOCKS_ATYP_DOMAIN);
            push_socks_string(&mut request, host, "hostname")?;
        }
    }
    request.extend_from_slice(&port.to_be_bytes());
    stream.write_all(&request).await?;

    let mut reply = [0u8; 4];
    stream.read_exact(&mut reply).await?;
    if reply[1] != 0 {
        return Err(ProxyError::UpstreamProxy(format!(
            "{} refused CONNECT to {}:{}: {}",
            proxy,
            host,
            port,
            socks_reply_message(reply[1])
        )));
    }

    // Skip the bound address.
    let addr_len = match reply[3] {
        SOCKS_ATYP_IPV4 => 4,
        SOCKS_ATYP_IPV6 => 16,
        SOCKS_ATYP_DOMAIN => stream.read_u8().await? as usize,
        other => {
            return Err(ProxyError::UpstreamProxy(format!(
                "unknown SOCKS5 address type {}",
                other
            )))
        }
    };
    let mut bound = vec![0u8; addr_len + 2];
    stream.read_exact(&mut bound).await?;

    Ok(())
}

fn push_socks_string(buf: &mut Vec<u8>, value: &str, what: &str) -> Result<()> {
    let len = u8::try_from(value.len())
        .map_err(|_| ProxyError::Config(format!("SOCKS5 {} longer than 255 bytes", what)))?;
    buf.push(len);
    buf.extend_from_slice(value.as_bytes());
    Ok(())
}

fn socks_reply_message(code: u8) -> &'static str {
    match code {
        0x01 => "general failure",
        0x02 => "connection not allowed by ruleset",
        0x03 => "network unreachable",
        0x04 => "host unreachable",
        0x05 => "connection refused",
        0x06 => "TTL expired",
        0x07 => "command not supported",
        0x08 => "address type not supported",
        _ => "unknown error",
    }
}
