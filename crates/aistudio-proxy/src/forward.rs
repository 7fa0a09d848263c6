//! Bidirectional forwarding between a client and an origin.
//!
//! Each direction runs as a pump loop. The two pumps are raced: when one
//! ends, the other is dropped, and both outbound writers are shut down
//! before forwarding returns. Cancelling the connection's token does the
//! same and then reports [`ProxyError::Cancelled`].

use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;

use aistudio_core::{contains, UpstreamErrorEvent, TERMINAL_CHUNK};

use crate::error::{is_disconnect, ProxyError, Result};
use crate::handoff::HandoffQueue;
use crate::http::{split_head, RequestLine, ResponseHead};
use crate::interceptor::Interceptor;

/// Size of each read from either peer.
pub const READ_BUFFER_SIZE: usize = 8192;

/// Longest path prefix written to the logs.
const LOGGED_PATH_CHARS: usize = 60;

/// Which pump finished first.
enum Outcome {
    ToOrigin(io::Result<()>),
    ToClient(io::Result<()>),
    Cancelled,
}

/// Forwards bytes both ways without looking at them.
pub async fn forward_plain<C, O>(client: C, origin: O, cancel: &CancellationToken) -> Result<()>
where
    C: AsyncRead + AsyncWrite,
    O: AsyncRead + AsyncWrite,
{
    let (mut client_reader, mut client_writer) = tokio::io::split(client);
    let (mut origin_reader, mut origin_writer) = tokio::io::split(origin);

    let outcome = tokio::select! {
        result = pump(&mut client_reader, &mut origin_writer) => Outcome::ToOrigin(result),
        result = pump(&mut origin_reader, &mut client_writer) => Outcome::ToClient(result),
        _ = cancel.cancelled() => Outcome::Cancelled,
    };

    finish(outcome, &mut client_writer, &mut origin_writer).await
}

/// Per-connection inputs for intercepting forwarding.
#[derive(Clone)]
pub struct InterceptContext {
    /// CONNECT host of this connection.
    pub host: String,
    /// Request and response hooks.
    pub interceptor: Arc<dyn Interceptor>,
    /// Where decoded events go. `None` decodes without publishing.
    pub queue: Option<HandoffQueue>,
}

impl InterceptContext {
    pub fn new(
        host: impl Into<String>,
        interceptor: Arc<dyn Interceptor>,
        queue: Option<HandoffQueue>,
    ) -> Self {
        Self {
            host: host.into(),
            interceptor,
            queue,
        }
    }

    fn publish(&self, message: impl Into<aistudio_core::QueueMessage>) {
        if let Some(queue) = &self.queue {
            queue.push(message);
        }
    }

    /// Decodes a sniffed response head and body-so-far and publishes the
    /// result. Error statuses are reported once per message, without
    /// decoding the body.
    fn inspect_response(&self, head: &[u8], body: &[u8], path: &str, error_reported: &mut bool) {
        let head = ResponseHead::parse(head);

        if head.status.is_error() {
            if !*error_reported {
                tracing::error!("Upstream error: {} {}", head.status.code, head.status.reason);
                self.publish(UpstreamErrorEvent::new(head.status.code, &head.status.reason));
                tracing::warn!(
                    "Fail-fast error event sent for {} ({})",
                    self.host,
                    head.status.code
                );
                *error_reported = true;
            }
            return;
        }

        match self
            .interceptor
            .process_response(body, &self.host, path, &head.headers)
        {
            Ok(event) => {
                if event.done {
                    tracing::debug!(
                        "Stream complete: body={}, reason={}, function={}",
                        event.body.len(),
                        event.reason.len(),
                        event.function.len()
                    );
                }
                self.publish(event);
            }
            Err(e) => tracing::error!("Error during response interception for {}: {}", self.host, e),
        }
    }
}

impl std::fmt::Debug for InterceptContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InterceptContext")
            .field("host", &self.host)
            .field("queue", &self.queue.is_some())
            .finish()
    }
}

/// What the two intercepting pumps share: whether the current exchange
/// targets the generation endpoint, its path, and a counter bumped on every
/// request head.
#[derive(Debug, Default)]
struct SniffState {
    should_sniff: AtomicBool,
    path: Mutex<String>,
    exchange: AtomicU64,
}

impl SniffState {
    fn set(&self, sniff: bool, path: &str) {
        *self.path.lock() = path.to_string();
        self.should_sniff.store(sniff, Ordering::SeqCst);
        self.exchange.fetch_add(1, Ordering::SeqCst);
    }

    fn exchange(&self) -> u64 {
        self.exchange.load(Ordering::SeqCst)
    }

    fn is_sniffing(&self) -> bool {
        self.should_sniff.load(Ordering::SeqCst)
    }

    fn path(&self) -> String {
        self.path.lock().clone()
    }
}

/// Forwards bytes both ways, sniffing exchanges with the generation
/// endpoint. The client always receives the origin's bytes unmodified.
pub async fn forward_intercepting<C, O>(
    client: C,
    origin: O,
    ctx: &InterceptContext,
    cancel: &CancellationToken,
) -> Result<()>
where
    C: AsyncRead + AsyncWrite,
    O: AsyncRead + AsyncWrite,
{
    let (mut client_reader, mut client_writer) = tokio::io::split(client);
    let (mut origin_reader, mut origin_writer) = tokio::io::split(origin);
    let state = SniffState::default();

    let outcome = tokio::select! {
        result = pump_requests(&mut client_reader, &mut origin_writer, ctx, &state) => {
            Outcome::ToOrigin(result)
        }
        result = pump_responses(&mut origin_reader, &mut client_writer, ctx, &state) => {
            Outcome::ToClient(result)
        }
        _ = cancel.cancelled() => Outcome::Cancelled,
    };

    finish(outcome, &mut client_writer, &mut origin_writer).await
}

/// Shuts down both writers, logs the winning pump, and surfaces cancellation.
async fn finish<CW, OW>(outcome: Outcome, client_writer: &mut CW, origin_writer: &mut OW) -> Result<()>
where
    CW: AsyncWrite + Unpin,
    OW: AsyncWrite + Unpin,
{
    shutdown(origin_writer, "origin").await;
    shutdown(client_writer, "client").await;

    match outcome {
        Outcome::ToOrigin(result) => log_pump_result("client -> origin", result),
        Outcome::ToClient(result) => log_pump_result("origin -> client", result),
        Outcome::Cancelled => {
            tracing::debug!("Forwarding cancelled");
            return Err(ProxyError::Cancelled);
        }
    }
    Ok(())
}

async fn shutdown<W: AsyncWrite + Unpin>(writer: &mut W, peer: &str) {
    if let Err(e) = writer.shutdown().await {
        tracing::trace!("Shutting down {} writer: {}", peer, e);
    }
}

fn log_pump_result(direction: &str, result: io::Result<()>) {
    match result {
        Ok(()) => tracing::trace!("{} reached EOF", direction),
        // Browsers hang up on cancelled generations.
        Err(e) if is_disconnect(&e) => tracing::debug!("{} peer disconnected: {}", direction, e),
        Err(e) => tracing::error!("Error forwarding {}: {}", direction, e),
    }
}

/// Copies until EOF, flushing after every read.
async fn pump<R, W>(reader: &mut R, writer: &mut W) -> io::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut chunk = vec![0u8; READ_BUFFER_SIZE];
    loop {
        let n = reader.read(&mut chunk).await?;
        if n == 0 {
            return Ok(());
        }
        writer.write_all(&chunk[..n]).await?;
        writer.flush().await?;
    }
}

/// Client to origin. A request head must arrive within a single read to be
/// considered for sniffing; partial heads are forwarded as they come.
async fn pump_requests<R, W>(
    reader: &mut R,
    writer: &mut W,
    ctx: &InterceptContext,
    state: &SniffState,
) -> io::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buffer = Vec::with_capacity(READ_BUFFER_SIZE);
    let mut chunk = vec![0u8; READ_BUFFER_SIZE];

    loop {
        let n = reader.read(&mut chunk).await?;
        if n == 0 {
            return Ok(());
        }
        let data = &chunk[..n];
        buffer.extend_from_slice(data);

        match split_head(&buffer) {
            Some((head, body)) => match RequestLine::from_head(head) {
                None => writer.write_all(&buffer).await?,
                Some(line) if ctx.interceptor.should_intercept_path(&ctx.host, &line.target) => {
                    state.set(true, &line.target);
                    tracing::debug!(
                        "Sniffing {} {}{}",
                        line.method,
                        ctx.host,
                        line.target.chars().take(LOGGED_PATH_CHARS).collect::<String>()
                    );

                    let processed = ctx
                        .interceptor
                        .process_request(body, &ctx.host, &line.target)
                        .unwrap_or_else(|e| {
                            tracing::warn!("Request hook failed, forwarding original body: {}", e);
                            body.to_vec()
                        });
                    writer.write_all(head).await?;
                    writer.write_all(&processed).await?;
                }
                Some(line) => {
                    state.set(false, &line.target);
                    writer.write_all(&buffer).await?;
                }
            },
            None => writer.write_all(data).await?,
        }

        writer.flush().await?;
        buffer.clear();
    }
}

/// Origin to client. A sniffed response is re-decoded over everything
/// received since its head, so each published event is cumulative. Other
/// responses are not buffered.
///
/// The buffer and the error flag are reset on the terminal chunk and
/// whenever a new request head has been seen, so responses framed by
/// `Content-Length` do not leak into the next exchange.
async fn pump_responses<R, W>(
    reader: &mut R,
    writer: &mut W,
    ctx: &InterceptContext,
    state: &SniffState,
) -> io::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buffer = Vec::with_capacity(READ_BUFFER_SIZE);
    let mut chunk = vec![0u8; READ_BUFFER_SIZE];
    let mut error_reported = false;
    let mut exchange = state.exchange();

    loop {
        let n = reader.read(&mut chunk).await?;
        if n == 0 {
            return Ok(());
        }
        let data = &chunk[..n];

        let current = state.exchange();
        if current != exchange {
            exchange = current;
            buffer.clear();
            error_reported = false;
        }

        if state.is_sniffing() {
            buffer.extend_from_slice(data);
            if let Some((head, body)) = split_head(&buffer) {
                ctx.inspect_response(head, body, &state.path(), &mut error_reported);
            }
        }

        writer.write_all(data).await?;
        writer.flush().await?;

        if contains(&buffer, TERMINAL_CHUNK) {
            buffer.clear();
            error_reported = false;
        }
    }
}
