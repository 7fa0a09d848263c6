//! AI Studio Proxy - selective MITM proxy for generation streams.
//!
//! Tunnels CONNECT requests. For hosts matching the intercept rules, the
//! proxy terminates TLS with a certificate from its own CA, connects to the
//! origin over TLS, and decodes responses from the content-generation
//! endpoint into events on a hand-off queue. The browser always receives
//! the origin's bytes unmodified.
//!
//! ## Example
//!
//! ```no_run
//! use aistudio_proxy::{HandoffQueue, ProxyConfig, ProxyServer};
//!
//! # async fn example() -> aistudio_proxy::Result<()> {
//! let (queue, mut events) = HandoffQueue::channel(1024);
//! let handle = ProxyServer::new(ProxyConfig::default())?
//!     .with_queue(queue)
//!     .start()
//!     .await?;
//!
//! while let Some(message) = events.recv().await {
//!     println!("{:?}", message);
//! }
//! handle.stop().await;
//! # Ok(())
//! # }
//! ```

pub mod ca;
pub mod config;
pub mod connector;
pub mod domains;
pub mod error;
pub mod forward;
pub mod handoff;
pub mod http;
pub mod interceptor;
pub mod proxy;

#[cfg(test)]
mod testing;

pub use ca::{load_server_config, CertManager, CertPair, CertificateProvider};
pub use config::{ProxyConfig, ProxyCredentials, UpstreamProxy, UpstreamScheme};
pub use connector::{client_tls_config, BoxedStream, DirectConnector, UpstreamConnector};
pub use domains::{InterceptRule, InterceptRules};
pub use error::{CaManagerError, ProxyError, Result};
pub use forward::{forward_intercepting, forward_plain, InterceptContext};
pub use handoff::HandoffQueue;
pub use interceptor::{Interceptor, StreamInterceptor};
pub use proxy::{ProxyHandle, ProxyServer, ProxyService};

/// Default proxy port.
pub const DEFAULT_PROXY_PORT: u16 = 3120;
