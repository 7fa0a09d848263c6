//! CONNECT proxy server.
//!
//! Accepts CONNECT requests, tunnels most hosts untouched, and terminates
//! TLS for intercepted hosts so generation traffic can be sniffed.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use rustls::ServerConfig;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::ca::{CaManagerError, CertManager, CertificateProvider};
use crate::config::ProxyConfig;
use crate::connector::{DirectConnector, UpstreamConnector};
use crate::domains::InterceptRules;
use crate::error::{ProxyError, Result};
use crate::forward::{forward_intercepting, forward_plain, InterceptContext};
use crate::handoff::HandoffQueue;
use crate::http::{parse_connect_target, RequestLine};
use crate::interceptor::{Interceptor, StreamInterceptor};

/// Reply sent once a CONNECT request is accepted.
pub const CONNECTION_ESTABLISHED: &[u8] = b"HTTP/1.1 200 Connection Established\r\n\r\n";

/// Bytes discarded from the client after the CONNECT reply.
pub const CONNECT_DRAIN_SIZE: usize = 8192;

/// Longest request line accepted.
const MAX_REQUEST_LINE: u64 = 8192;

/// Handles individual client connections. Cheap to clone.
#[derive(Clone)]
pub struct ProxyService {
    rules: Arc<InterceptRules>,
    certs: Arc<dyn CertificateProvider>,
    connector: Arc<dyn UpstreamConnector>,
    interceptor: Arc<dyn Interceptor>,
    queue: Option<HandoffQueue>,
}

impl std::fmt::Debug for ProxyService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProxyService")
            .field("rules", &self.rules)
            .field("queue", &self.queue.is_some())
            .finish()
    }
}

impl ProxyService {
    /// Serves one client connection.
    ///
    /// Every failure is logged here and closes only this connection. The
    /// one error returned is [`ProxyError::Cancelled`].
    pub async fn handle_client<S>(&self, stream: S, cancel: &CancellationToken) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        match self.serve(stream, cancel).await {
            Ok(()) => Ok(()),
            Err(e) if e.is_cancelled() => Err(e),
            Err(e) if e.is_disconnect() => {
                tracing::debug!("Client disconnected: {}", e);
                Ok(())
            }
            Err(e) => {
                tracing::error!("Error handling client: {}", e);
                Ok(())
            }
        }
    }

    async fn serve<S>(&self, stream: S, cancel: &CancellationToken) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let mut client = BufReader::new(stream);

        let target = match read_connect_target(&mut client, cancel).await {
            Ok(Some(target)) => target,
            other => {
                close(client.get_mut()).await;
                return other.map(|_| ());
            }
        };

        self.handle_connect(client, target, cancel).await
    }

    async fn handle_connect<S>(
        &self,
        mut client: BufReader<S>,
        (host, port): (String, u16),
        cancel: &CancellationToken,
    ) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let intercept = self.rules.should_intercept(&host);
        tracing::debug!("CONNECT {}:{} (intercept: {})", host, port, intercept);

        if let Err(e) = or_cancel(cancel, establish(&mut client)).await {
            close(client.get_mut()).await;
            return Err(e);
        }

        if intercept {
            self.intercept(client, &host, port, cancel).await
        } else {
            self.tunnel(client, &host, port, cancel).await
        }
    }

    /// Terminates the client's TLS with a certificate for `host` and
    /// forwards to the origin over TLS, sniffing along the way.
    async fn intercept<S>(
        &self,
        mut client: BufReader<S>,
        host: &str,
        port: u16,
        cancel: &CancellationToken,
    ) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let server_config = match server_config_for(self.certs.clone(), host).await {
            Ok(config) => config,
            Err(e) => {
                close(client.get_mut()).await;
                return Err(e.into());
            }
        };

        // The buffered reader goes into the handshake so bytes it already
        // holds are not lost.
        let acceptor = TlsAcceptor::from(server_config);
        let mut client = or_cancel(cancel, async {
            acceptor
                .accept(client)
                .await
                .map_err(|e| ProxyError::Tls(format!("client handshake for {} failed: {}", host, e)))
        })
        .await?;

        let origin = match or_cancel(cancel, self.connector.connect(host, port, true)).await {
            Ok(origin) => origin,
            Err(e) => {
                close(&mut client).await;
                return Err(e);
            }
        };

        tracing::debug!("Intercepting {}:{}", host, port);
        let ctx = InterceptContext::new(host, self.interceptor.clone(), self.queue.clone());
        forward_intercepting(client, origin, &ctx, cancel).await
    }

    /// Tunnels raw bytes to the origin.
    async fn tunnel<S>(
        &self,
        mut client: BufReader<S>,
        host: &str,
        port: u16,
        cancel: &CancellationToken,
    ) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let origin = match or_cancel(cancel, self.connector.connect(host, port, false)).await {
            Ok(origin) => origin,
            Err(e) => {
                close(client.get_mut()).await;
                return Err(e);
            }
        };

        forward_plain(client, origin, cancel).await
    }
}

/// Reads the request line. Returns the CONNECT target, or `None` when the
/// peer closed or asked for something other than CONNECT.
async fn read_connect_target<S>(
    client: &mut BufReader<S>,
    cancel: &CancellationToken,
) -> Result<Option<(String, u16)>>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut line = String::new();
    or_cancel(cancel, async {
        (&mut *client)
            .take(MAX_REQUEST_LINE)
            .read_line(&mut line)
            .await
            .map_err(ProxyError::from)
    })
    .await?;

    let line = line.trim();
    if line.is_empty() {
        return Ok(None);
    }

    let request = RequestLine::parse(line).ok_or_else(|| ProxyError::RequestLine(line.to_string()))?;
    if request.method != "CONNECT" {
        tracing::debug!("Ignoring non-CONNECT request: {} {}", request.method, request.target);
        return Ok(None);
    }

    parse_connect_target(&request.target).map(Some)
}

/// Accepts the tunnel and drains what is left of the CONNECT request.
async fn establish<S>(client: &mut BufReader<S>) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    client.get_mut().write_all(CONNECTION_ESTABLISHED).await?;
    client.get_mut().flush().await?;

    let mut scratch = vec![0u8; CONNECT_DRAIN_SIZE];
    let drained = client.read(&mut scratch).await?;
    tracing::trace!("Drained {} bytes after CONNECT", drained);
    Ok(())
}

async fn or_cancel<T>(
    cancel: &CancellationToken,
    future: impl Future<Output = Result<T>>,
) -> Result<T> {
    tokio::select! {
        result = future => result,
        _ = cancel.cancelled() => Err(ProxyError::Cancelled),
    }
}

async fn close<W: AsyncWrite + Unpin>(writer: &mut W) {
    if let Err(e) = writer.shutdown().await {
        tracing::trace!("Closing client stream: {}", e);
    }
}

/// Selective MITM proxy server.
pub struct ProxyServer {
    config: ProxyConfig,
    service: ProxyService,
}

impl ProxyServer {
    /// Creates a new proxy server with the given configuration.
    ///
    /// Prepares the CA (generating it if missing) and the log directory.
    pub fn new(config: ProxyConfig) -> Result<Self> {
        config.validate()?;

        std::fs::create_dir_all(&config.log_dir)?;

        let certs = CertManager::new(&config.cert_dir);
        certs.ensure_ca()?;

        let connector = DirectConnector::from_config(&config)?;

        let service = ProxyService {
            rules: Arc::new(config.intercept_rules()?),
            certs: Arc::new(certs),
            connector: Arc::new(connector),
            interceptor: Arc::new(StreamInterceptor::new()),
            queue: None,
        };

        Ok(Self { config, service })
    }

    /// Sets the hand-off queue for decoded events.
    pub fn with_queue(mut self, queue: HandoffQueue) -> Self {
        self.service.queue = Some(queue);
        self
    }

    /// Replaces the certificate provider.
    pub fn with_certificate_provider(mut self, certs: Arc<dyn CertificateProvider>) -> Self {
        self.service.certs = certs;
        self
    }

    /// Replaces the origin connector.
    pub fn with_connector(mut self, connector: Arc<dyn UpstreamConnector>) -> Self {
        self.service.connector = connector;
        self
    }

    /// Replaces the request/response hooks.
    pub fn with_interceptor(mut self, interceptor: Arc<dyn Interceptor>) -> Self {
        self.service.interceptor = interceptor;
        self
    }

    /// Returns the configuration.
    pub fn config(&self) -> &ProxyConfig {
        &self.config
    }

    /// Returns the connection handler.
    pub fn service(&self) -> &ProxyService {
        &self.service
    }

    /// Returns the CA certificate path for user installation.
    pub fn ca_cert_path(&self) -> std::path::PathBuf {
        CertManager::new(&self.config.cert_dir).ca_cert_path()
    }

    /// Binds the listener and serves in the background.
    ///
    /// Sends the ready signal once the socket is bound.
    pub async fn start(self) -> Result<ProxyHandle> {
        let listener = TcpListener::bind(self.config.addr)
            .await
            .map_err(|source| ProxyError::Bind {
                addr: self.config.addr.to_string(),
                source,
            })?;
        let addr = listener.local_addr()?;

        tracing::info!("Proxy listening on {}", addr);
        tracing::info!("Intercepting domains: {:?}", self.config.intercept_domains);
        if let Some(upstream) = self.config.upstream()? {
            tracing::info!("Using upstream proxy: {}", upstream);
        }

        if let Some(queue) = &self.service.queue {
            if queue.push_ready() {
                tracing::debug!("Ready signal sent");
            }
        }

        let cancel = CancellationToken::new();
        let handle = tokio::spawn(accept_loop(listener, self.service, cancel.clone()));

        Ok(ProxyHandle {
            cancel,
            addr,
            handle,
        })
    }

    /// Serves in the foreground until `shutdown` resolves, then stops the
    /// proxy and waits for open connections to close.
    pub async fn run(self, shutdown: impl Future<Output = ()>) -> Result<()> {
        let handle = self.start().await?;
        shutdown.await;
        handle.stop().await;
        Ok(())
    }
}

async fn accept_loop(listener: TcpListener, service: ProxyService, cancel: CancellationToken) {
    let tasks = TaskTracker::new();

    loop {
        let accepted = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                tracing::info!("Proxy shutdown signal received");
                break;
            }
            accepted = listener.accept() => accepted,
        };

        let (stream, peer) = match accepted {
            Ok(conn) => conn,
            Err(e) => {
                tracing::warn!("Failed to accept connection: {}", e);
                continue;
            }
        };

        let service = service.clone();
        let token = cancel.child_token();
        tasks.spawn(async move {
            if let Err(e) = service.handle_client(stream, &token).await {
                tracing::debug!("Connection from {} ended: {}", peer, e);
            }
        });
    }

    tasks.close();
    tasks.wait().await;
    tracing::info!("Proxy server stopped");
}

/// Builds the TLS config for `host` on the blocking pool, since the first
/// request for a host generates and writes a certificate.
async fn server_config_for(
    certs: Arc<dyn CertificateProvider>,
    host: &str,
) -> std::result::Result<Arc<ServerConfig>, CaManagerError> {
    let host = host.to_string();
    tokio::task::spawn_blocking(move || certs.server_config(&host))
        .await
        .map_err(|e| CaManagerError::Generation(format!("certificate task failed: {}", e)))?
}

/// Handle for controlling a running proxy server.
pub struct ProxyHandle {
    cancel: CancellationToken,
    addr: SocketAddr,
    handle: JoinHandle<()>,
}

impl ProxyHandle {
    /// Returns the address the proxy is listening on.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Returns the token that shuts the proxy down when cancelled.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Signals the proxy and all live connections to shut down.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    /// Waits for the proxy and its connections to finish.
    pub async fn wait(self) {
        let _ = self.handle.await;
    }

    /// Shuts down the proxy and waits for it to finish.
    pub async fn stop(self) {
        self.shutdown();
        self.wait().await;
    }
}

#[cfg(test)]
mod tests {
    use std::path::Path;
    use std::time::Duration;

    use async_trait::async_trait;
    use parking_lot::Mutex;
    use rustls::pki_types::ServerName;
    use rustls::{ClientConfig, RootCertStore};
    use tempfile::TempDir;
    use tokio::io::{duplex, DuplexStream};
    use tokio::net::TcpStream;
    use tokio::sync::mpsc;
    use tokio_rustls::client::TlsStream;
    use tokio_rustls::TlsConnector;
    use tokio_test::io::Builder;

    use super::*;
    use crate::ca::{load_certs, CertPair};
    use crate::connector::BoxedStream;
    use crate::testing::{generate_content_request, RecordingInterceptor};
    use aistudio_core::QueueMessage;

    const INTERCEPTED_HOST: &str = "aistudio.google.com";

    fn test_config(temp_dir: &TempDir) -> ProxyConfig {
        ProxyConfig::new()
            .with_addr(SocketAddr::from(([127, 0, 0, 1], 0)))
            .with_cert_dir(temp_dir.path().join("certs"))
            .with_log_dir(temp_dir.path().join("logs"))
    }

    /// Issues real certificates and records which hosts asked.
    struct RecordingCerts {
        inner: CertManager,
        hosts: Mutex<Vec<String>>,
    }

    impl CertificateProvider for RecordingCerts {
        fn get_domain_cert(&self, host: &str) -> std::result::Result<CertPair, CaManagerError> {
            self.hosts.lock().push(host.to_string());
            self.inner.get_domain_cert(host)
        }
    }

    /// Hands out one in-memory origin stream.
    struct PipeConnector {
        origin: Mutex<Option<DuplexStream>>,
        calls: Mutex<Vec<(String, u16, bool)>>,
    }

    #[async_trait]
    impl UpstreamConnector for PipeConnector {
        async fn connect(&self, host: &str, port: u16, tls: bool) -> Result<BoxedStream> {
            self.calls.lock().push((host.to_string(), port, tls));
            let origin = self.origin.lock().take();
            match origin {
                Some(stream) => Ok(Box::new(stream)),
                None => Err(ProxyError::UpstreamConnect {
                    host: host.to_string(),
                    port,
                    reason: "no origin left".to_string(),
                }),
            }
        }
    }

    fn client_tls(cert_dir: &Path) -> TlsConnector {
        let mut roots = RootCertStore::empty();
        for cert in load_certs(&cert_dir.join("ca.crt")).unwrap() {
            roots.add(cert).unwrap();
        }
        let config = ClientConfig::builder_with_provider(Arc::new(
            rustls::crypto::ring::default_provider(),
        ))
        .with_safe_default_protocol_versions()
        .unwrap()
        .with_root_certificates(roots)
        .with_no_client_auth();
        TlsConnector::from(Arc::new(config))
    }

    async fn send_connect(addr: SocketAddr, target: &str) -> TcpStream {
        let mut stream = TcpStream::connect(addr).await.unwrap();
        let request = format!("CONNECT {} HTTP/1.1\r\nHost: {}\r\n\r\n", target, target);
        stream.write_all(request.as_bytes()).await.unwrap();

        let mut reply = vec![0u8; CONNECTION_ESTABLISHED.len()];
        stream.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply, CONNECTION_ESTABLISHED);
        stream
    }

    struct InterceptedSession {
        _temp_dir: TempDir,
        handle: ProxyHandle,
        client: TlsStream<TcpStream>,
        origin: DuplexStream,
        rx: mpsc::Receiver<QueueMessage>,
        certs: Arc<RecordingCerts>,
        connector: Arc<PipeConnector>,
        recorder: Arc<RecordingInterceptor>,
    }

    async fn intercepted_session() -> InterceptedSession {
        let temp_dir = TempDir::new().unwrap();
        let cert_dir = temp_dir.path().join("certs");
        let (proxy_side, origin) = duplex(64 * 1024);

        let certs = Arc::new(RecordingCerts {
            inner: CertManager::new(&cert_dir),
            hosts: Mutex::new(Vec::new()),
        });
        let connector = Arc::new(PipeConnector {
            origin: Mutex::new(Some(proxy_side)),
            calls: Mutex::new(Vec::new()),
        });
        let recorder = Arc::new(RecordingInterceptor::default());
        let (queue, mut rx) = HandoffQueue::channel(16);

        let handle = ProxyServer::new(test_config(&temp_dir))
            .unwrap()
            .with_certificate_provider(certs.clone())
            .with_connector(connector.clone())
            .with_interceptor(recorder.clone())
            .with_queue(queue)
            .start()
            .await
            .unwrap();
        assert_eq!(rx.recv().await, Some(QueueMessage::Ready));

        let tcp = send_connect(handle.addr(), &format!("{}:443", INTERCEPTED_HOST)).await;
        let client = client_tls(&cert_dir)
            .connect(ServerName::try_from(INTERCEPTED_HOST).unwrap(), tcp)
            .await
            .unwrap();

        InterceptedSession {
            _temp_dir: temp_dir,
            handle,
            client,
            origin,
            rx,
            certs,
            connector,
            recorder,
        }
    }

    // ==================== ProxyServer Tests ====================

    #[test]
    fn proxy_server_new_prepares_ca_and_logs() {
        let temp_dir = TempDir::new().unwrap();
        let server = ProxyServer::new(test_config(&temp_dir)).unwrap();

        assert!(server.ca_cert_path().exists());
        assert!(temp_dir.path().join("logs").is_dir());
    }

    #[test]
    fn proxy_server_rejects_bad_upstream() {
        let temp_dir = TempDir::new().unwrap();
        let config = test_config(&temp_dir).with_upstream_proxy("gopher://proxy:70");
        assert!(matches!(ProxyServer::new(config), Err(ProxyError::Config(_))));
    }

    #[tokio::test]
    async fn proxy_handle_ready_and_shutdown() {
        let temp_dir = TempDir::new().unwrap();
        let (queue, mut rx) = HandoffQueue::channel(4);

        let handle = ProxyServer::new(test_config(&temp_dir))
            .unwrap()
            .with_queue(queue)
            .start()
            .await
            .unwrap();

        assert_ne!(handle.addr().port(), 0);
        assert_eq!(rx.recv().await, Some(QueueMessage::Ready));

        tokio::time::timeout(Duration::from_secs(5), handle.stop())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn bind_failure_is_reported() {
        let temp_dir = TempDir::new().unwrap();
        let occupied = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let config = test_config(&temp_dir).with_addr(occupied.local_addr().unwrap());

        let result = ProxyServer::new(config).unwrap().start().await;
        assert!(matches!(result, Err(ProxyError::Bind { .. })));
    }

    /// Takes a while to issue each certificate, the way a first-time
    /// generation does.
    struct SlowCerts {
        inner: CertManager,
    }

    impl CertificateProvider for SlowCerts {
        fn get_domain_cert(&self, host: &str) -> std::result::Result<CertPair, CaManagerError> {
            std::thread::sleep(Duration::from_millis(200));
            self.inner.get_domain_cert(host)
        }
    }

    #[tokio::test]
    async fn certificate_generation_does_not_stall_the_runtime() {
        let temp_dir = TempDir::new().unwrap();
        let inner = CertManager::new(temp_dir.path().join("certs"));
        inner.ensure_ca().unwrap();
        let certs: Arc<dyn CertificateProvider> = Arc::new(SlowCerts { inner });

        let ticks = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let counter = ticks.clone();
        let ticker = tokio::spawn(async move {
            loop {
                tokio::time::sleep(Duration::from_millis(10)).await;
                counter.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            }
        });

        server_config_for(certs, INTERCEPTED_HOST).await.unwrap();
        ticker.abort();

        assert!(ticks.load(std::sync::atomic::Ordering::SeqCst) >= 5);
    }

    // ==================== handle_client Tests ====================

    #[tokio::test]
    async fn empty_request_closes_quietly() {
        let temp_dir = TempDir::new().unwrap();
        let server = ProxyServer::new(test_config(&temp_dir)).unwrap();

        let stream = Builder::new().build();
        let result = server.service().handle_client(stream, &CancellationToken::new()).await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn non_connect_is_not_forwarded() {
        let temp_dir = TempDir::new().unwrap();
        let server = ProxyServer::new(test_config(&temp_dir)).unwrap();

        // The mock fails the test on any write.
        let stream = Builder::new()
            .read(b"GET http://example.com/ HTTP/1.1\r\nHost: example.com\r\n\r\n")
            .build();
        let result = server.service().handle_client(stream, &CancellationToken::new()).await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn malformed_connect_target_is_rejected() {
        let temp_dir = TempDir::new().unwrap();
        let server = ProxyServer::new(test_config(&temp_dir)).unwrap();

        let stream = Builder::new()
            .read(b"CONNECT example.com:https HTTP/1.1\r\n\r\n")
            .build();
        let result = server.service().handle_client(stream, &CancellationToken::new()).await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn unreachable_origin_closes_after_reply() {
        let temp_dir = TempDir::new().unwrap();
        let connector = Arc::new(PipeConnector {
            origin: Mutex::new(None),
            calls: Mutex::new(Vec::new()),
        });
        let server = ProxyServer::new(test_config(&temp_dir))
            .unwrap()
            .with_connector(connector.clone());

        let stream = Builder::new()
            .read(b"CONNECT example.com:443 HTTP/1.1\r\nHost: example.com:443\r\n\r\n")
            .write(CONNECTION_ESTABLISHED)
            .build();
        let result = server.service().handle_client(stream, &CancellationToken::new()).await;

        assert!(result.is_ok());
        assert_eq!(
            *connector.calls.lock(),
            vec![("example.com".to_string(), 443, false)]
        );
    }

    #[tokio::test]
    async fn cancelled_before_request_line() {
        let temp_dir = TempDir::new().unwrap();
        let server = ProxyServer::new(test_config(&temp_dir)).unwrap();
        let (_client, proxy_side) = duplex(1024);

        let cancel = CancellationToken::new();
        cancel.cancel();
        let result = server.service().handle_client(proxy_side, &cancel).await;
        assert!(matches!(result, Err(ProxyError::Cancelled)));
    }

    // ==================== End-to-end Tests ====================

    #[tokio::test]
    async fn non_intercepted_host_is_tunneled_verbatim() {
        let temp_dir = TempDir::new().unwrap();
        let origin = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let origin_addr = origin.local_addr().unwrap();
        let origin_task = tokio::spawn(async move {
            let (mut stream, _) = origin.accept().await.unwrap();
            let mut buf = [0u8; 9];
            stream.read_exact(&mut buf).await.unwrap();
            stream.write_all(b"origin says hi").await.unwrap();
            buf
        });

        let (queue, mut rx) = HandoffQueue::channel(16);
        let handle = ProxyServer::new(test_config(&temp_dir))
            .unwrap()
            .with_queue(queue)
            .start()
            .await
            .unwrap();
        assert_eq!(rx.recv().await, Some(QueueMessage::Ready));

        let mut client = send_connect(handle.addr(), &origin_addr.to_string()).await;
        client.write_all(b"\x16\x03\x01opaque").await.unwrap();

        let mut reply = [0u8; 14];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(&reply, b"origin says hi");
        assert_eq!(&origin_task.await.unwrap(), b"\x16\x03\x01opaque");

        drop(client);
        handle.stop().await;
        assert!(rx.try_recv().is_err());
        assert!(!temp_dir.path().join("certs").join("127.0.0.1.crt").exists());
    }

    #[tokio::test]
    async fn intercepted_generate_content_reaches_request_hook() {
        let mut session = intercepted_session().await;

        let request = generate_content_request(r#"[["hello model"]]"#);
        session.client.write_all(&request).await.unwrap();

        let mut forwarded = vec![0u8; request.len()];
        session.origin.read_exact(&mut forwarded).await.unwrap();
        assert_eq!(forwarded, request);

        assert_eq!(*session.certs.hosts.lock(), vec![INTERCEPTED_HOST.to_string()]);
        assert_eq!(
            *session.connector.calls.lock(),
            vec![(INTERCEPTED_HOST.to_string(), 443, true)]
        );
        {
            let requests = session.recorder.requests.lock();
            assert_eq!(requests.len(), 1);
            assert_eq!(requests[0].0, INTERCEPTED_HOST);
            assert_eq!(requests[0].2, br#"[["hello model"]]"#);
        }

        session.handle.stop().await;
    }

    #[tokio::test]
    async fn intercepted_error_status_fails_fast() {
        let mut session = intercepted_session().await;

        let request = generate_content_request("{}");
        session.client.write_all(&request).await.unwrap();
        let mut forwarded = vec![0u8; request.len()];
        session.origin.read_exact(&mut forwarded).await.unwrap();

        let response = b"HTTP/1.1 429 Too Many Requests\r\nTransfer-Encoding: chunked\r\n\r\n2\r\n{}\r\n0\r\n\r\n";
        session.origin.write_all(response).await.unwrap();

        let mut received = vec![0u8; response.len()];
        session.client.read_exact(&mut received).await.unwrap();
        assert_eq!(received, response);

        match session.rx.try_recv().unwrap() {
            QueueMessage::UpstreamError(error) => {
                assert_eq!(error.status, 429);
                assert!(error.done);
            }
            other => panic!("unexpected message: {:?}", other),
        }
        assert!(session.rx.try_recv().is_err());
        assert_eq!(*session.recorder.responses.lock(), 0);

        session.handle.stop().await;
    }
}
