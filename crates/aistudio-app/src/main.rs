//! AI Studio proxy launcher.
//!
//! Starts the intercepting proxy and, with `--emit-events`, writes every
//! hand-off message to stdout as one line: `READY` once the listener is up,
//! then one JSON object per decoded event.

use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::Parser;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use aistudio_core::QueueMessage;
use aistudio_proxy::{HandoffQueue, ProxyConfig, ProxyServer, DEFAULT_PROXY_PORT};

/// AI Studio proxy - taps generation streams while passing traffic through
#[derive(Parser, Debug)]
#[command(name = "aistudio-proxy", version, about)]
struct Args {
    /// Address to listen on
    #[arg(long, default_value = "127.0.0.1")]
    host: IpAddr,

    /// Port to listen on
    #[arg(long, default_value_t = DEFAULT_PROXY_PORT)]
    port: u16,

    /// Host or `*.suffix` wildcard to intercept (repeatable)
    #[arg(long = "domains", default_value = "*.google.com")]
    domains: Vec<String>,

    /// Forwarding proxy for origin connections (http://, socks4:// or socks5://)
    #[arg(long)]
    proxy: Option<String>,

    /// Directory for the CA and generated host certificates
    #[arg(long, default_value = "certs")]
    cert_dir: PathBuf,

    /// Directory for log files
    #[arg(long, default_value = "logs")]
    log_dir: PathBuf,

    /// Write hand-off messages to stdout as JSON lines
    #[arg(long)]
    emit_events: bool,

    /// Enable debug logging
    #[arg(long)]
    debug: bool,

    /// Set log level (error, warn, info, debug, trace)
    #[arg(long, default_value = "info")]
    log_level: String,
}

impl Args {
    fn to_config(&self) -> ProxyConfig {
        let mut config = ProxyConfig::new()
            .with_addr(SocketAddr::new(self.host, self.port))
            .with_intercept_domains(self.domains.iter().cloned())
            .with_cert_dir(&self.cert_dir)
            .with_log_dir(&self.log_dir);

        if let Some(proxy) = &self.proxy {
            config = config.with_upstream_proxy(proxy.clone());
        }
        config
    }
}

/// Initialize console and rolling-file logging.
///
/// Console output goes to stderr so stdout stays free for emitted events.
fn init_logging(args: &Args) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let log_level = if args.debug { "debug" } else { &args.log_level };

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("aistudio={},warn", log_level)));

    if let Some(appender) = file_appender(&args.log_dir) {
        let (non_blocking, guard) = tracing_appender::non_blocking(appender);

        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt::layer().with_writer(std::io::stderr))
            .with(fmt::layer().with_writer(non_blocking).with_ansi(false))
            .init();

        tracing::info!("Logging to {:?}", args.log_dir);
        return Some(guard);
    }

    // Fallback: console logging only
    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt::layer().with_writer(std::io::stderr))
        .init();

    tracing::warn!("File logging unavailable, using console only");
    None
}

fn file_appender(log_dir: &Path) -> Option<RollingFileAppender> {
    std::fs::create_dir_all(log_dir).ok()?;

    RollingFileAppender::builder()
        .rotation(Rotation::DAILY)
        .max_log_files(5)
        .filename_prefix("aistudio-proxy")
        .filename_suffix("log")
        .build(log_dir)
        .ok()
}

/// Consumes the hand-off queue until every sender is gone.
///
/// With a writer, each message is written as one line and flushed; without
/// one, messages are discarded.
async fn emit_events<W>(mut events: mpsc::Receiver<QueueMessage>, mut out: Option<W>) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    while let Some(message) = events.recv().await {
        let Some(writer) = out.as_mut() else {
            continue;
        };

        let mut line = message.to_wire().context("Failed to encode event")?;
        line.push('\n');
        writer
            .write_all(line.as_bytes())
            .await
            .context("Failed to write event")?;
        writer.flush().await.context("Failed to flush events")?;
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Keep the guard alive so buffered log lines are flushed on exit
    let _log_guard = init_logging(&args);

    tracing::info!("Starting AI Studio proxy v{}", env!("CARGO_PKG_VERSION"));

    let config = args.to_config();
    let (queue, events) = HandoffQueue::channel(config.queue_capacity);

    let server = ProxyServer::new(config).context("Failed to prepare proxy")?;
    tracing::info!(
        "Trust {} in the browser to allow interception",
        server.ca_cert_path().display()
    );

    let stdout = args.emit_events.then(tokio::io::stdout);
    let emitter = tokio::spawn(emit_events(events, stdout));

    let handle = server
        .with_queue(queue)
        .start()
        .await
        .context("Failed to start proxy")?;

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    tracing::info!("Shutdown requested");

    handle.stop().await;

    // The server held the last sender; the emitter ends once it is dropped
    match emitter.await {
        Ok(result) => result?,
        Err(e) => tracing::error!("Event emitter panicked: {}", e),
    }

    tracing::info!("AI Studio proxy stopped");
    Ok(())
}
