//! Listeners and connection handling
//!
//! Plain mode serves the router on the configured port. TLS mode serves the
//! router over TLS on :443 and the ACME challenge responder on :80, choosing a
//! certificate per connection from the SNI name before the handshake proceeds.

use crate::acme::AcmeIssuer;
use crate::certificate::{CertificateManager, RENEWAL_CHECK_INTERVAL};
use crate::challenge::{ChallengeResponder, ChallengeStore};
use crate::config::{ProxyConfig, Timeouts};
use crate::idle::{self, Activity, IdleTracked};
use crate::proxy::ProxyBody;
use crate::router::Router;
use crate::store::CertificateStore;
use crate::tls;
use anyhow::{anyhow, Context, Result};
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::{service_fn, Service};
use hyper::{Request, Response};
use hyper_util::rt::{TokioExecutor, TokioIo, TokioTimer};
use hyper_util::server::conn::auto;
use rustls::server::Acceptor;
use std::convert::Infallible;
use std::fmt::Display;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tokio_rustls::LazyConfigAcceptor;
use tracing::{debug, info, warn};

/// Port the challenge responder listens on in TLS mode
pub const CHALLENGE_PORT: u16 = 80;

/// Proxy server
pub struct ProxyServer {
    config: Arc<ProxyConfig>,
    router: Arc<Router>,
    certificates: Option<Arc<CertificateManager>>,
}

impl ProxyServer {
    /// Create a new proxy server, wiring up ACME issuance in TLS mode
    pub fn new(config: ProxyConfig) -> Result<Self> {
        let router = Arc::new(Router::new(&config)?);

        let certificates = if config.tls_enabled() {
            let store = Arc::new(
                CertificateStore::new(&config.cert_cache_dir).with_context(|| {
                    format!("cannot use certificate cache {}", config.cert_cache_dir.display())
                })?,
            );
            let issuer = Arc::new(AcmeIssuer::new(
                config.acme_directory_url.clone(),
                config.acme_email.clone(),
                store.clone(),
            ));
            info!("Certificate cache: {}", config.cert_cache_dir.display());
            Some(Arc::new(CertificateManager::new(
                config.domains.clone(),
                store,
                issuer,
                Arc::new(ChallengeStore::new()),
            )))
        } else {
            None
        };

        Ok(Self::with_components(config, router, certificates))
    }

    pub fn with_components(
        config: ProxyConfig,
        router: Arc<Router>,
        certificates: Option<Arc<CertificateManager>>,
    ) -> Self {
        Self {
            config: Arc::new(config),
            router,
            certificates,
        }
    }

    pub fn certificates(&self) -> Option<&Arc<CertificateManager>> {
        self.certificates.as_ref()
    }

    /// Bind the listeners for the configured mode and serve until one fails
    pub async fn run(self: Arc<Self>) -> Result<()> {
        let port = self.config.port;

        if !self.config.tls_enabled() {
            let listener = bind(port).await?;
            info!("Serving plain HTTP on port {}", port);
            return self.serve_plain(listener).await;
        }

        let challenge_listener = bind(CHALLENGE_PORT).await?;
        let tls_listener = bind(port).await?;
        info!(
            "Serving HTTPS on port {} for {} domain(s), ACME challenges on port {}",
            port,
            self.config.domains.len(),
            CHALLENGE_PORT
        );

        let renewal = self
            .certificates
            .as_ref()
            .map(|manager| manager.spawn_renewal(RENEWAL_CHECK_INTERVAL));

        let result = tokio::try_join!(
            self.clone().serve_challenges(challenge_listener),
            self.clone().serve_tls(tls_listener),
        );

        if let Some(task) = renewal {
            task.abort();
        }
        result.map(|_| ())
    }

    /// Serve the router without TLS
    pub async fn serve_plain(self: Arc<Self>, listener: TcpListener) -> Result<()> {
        loop {
            let (stream, remote_addr) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    warn!("Accept error: {}", e);
                    continue;
                }
            };

            let server = self.clone();
            tokio::spawn(async move {
                if let Err(e) = server.handle_connection(stream, remote_addr).await {
                    debug!("HTTP connection error from {}: {}", remote_addr, e);
                }
            });
        }
    }

    /// Serve the router over TLS with per-connection certificate selection
    pub async fn serve_tls(self: Arc<Self>, listener: TcpListener) -> Result<()> {
        if self.certificates.is_none() {
            return Err(anyhow!("TLS listener requires a certificate manager"));
        }

        loop {
            let (stream, remote_addr) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    warn!("Accept error: {}", e);
                    continue;
                }
            };

            let server = self.clone();
            tokio::spawn(async move {
                if let Err(e) = server.handle_tls_connection(stream, remote_addr).await {
                    debug!("HTTPS connection error from {}: {}", remote_addr, e);
                }
            });
        }
    }

    /// Serve ACME challenges and HTTPS redirects
    pub async fn serve_challenges(self: Arc<Self>, listener: TcpListener) -> Result<()> {
        let challenges = self
            .certificates
            .as_ref()
            .map(|manager| manager.challenges().clone())
            .ok_or_else(|| anyhow!("challenge listener requires a certificate manager"))?;
        let responder = Arc::new(ChallengeResponder::new(challenges));

        loop {
            let (stream, remote_addr) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    warn!("Accept error: {}", e);
                    continue;
                }
            };

            let responder = responder.clone();
            let timeouts = self.config.timeouts;
            tokio::spawn(async move {
                let service = service_fn(move |req: Request<Incoming>| {
                    let responder = responder.clone();
                    async move { Ok::<_, Infallible>(responder.handle(&req)) }
                });
                if let Err(e) = serve_http1(stream, timeouts, service).await {
                    debug!("Challenge connection error from {}: {}", remote_addr, e);
                }
            });
        }
    }

    async fn handle_tls_connection(&self, stream: TcpStream, remote_addr: SocketAddr) -> Result<()> {
        let manager = self
            .certificates
            .as_ref()
            .ok_or_else(|| anyhow!("no certificate manager"))?;
        let read_timeout = self.config.timeouts.read;

        let start = timeout(read_timeout, LazyConfigAcceptor::new(Acceptor::default(), stream))
            .await
            .map_err(|_| anyhow!("timed out waiting for ClientHello"))?
            .context("invalid ClientHello")?;

        let server_name = start.client_hello().server_name().map(str::to_string);
        let tls_config = match manager.server_config(server_name.as_deref()).await {
            Ok(tls_config) => tls_config,
            Err(e) => {
                warn!("Refusing TLS handshake from {}: {}", remote_addr, e);
                // Resolving no certificate makes rustls send the alert.
                let refused = timeout(read_timeout, start.into_stream(tls::refusing_config()?)).await;
                debug!("Refused handshake ended: {:?}", refused.map(|r| r.err()));
                return Ok(());
            }
        };

        let tls_stream = timeout(read_timeout, start.into_stream(tls_config))
            .await
            .map_err(|_| anyhow!("TLS handshake timed out"))?
            .context("TLS handshake failed")?;

        let router = self.router.clone();
        let service = service_fn(move |req: Request<Incoming>| {
            let router = router.clone();
            async move { Ok::<_, Infallible>(router.route(req, remote_addr).await) }
        });

        serve_auto(tls_stream, self.config.timeouts, service).await
    }

    /// Serve HTTP/1.1 requests on one accepted connection
    async fn handle_connection<IO>(&self, io: IO, remote_addr: SocketAddr) -> Result<()>
    where
        IO: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let router = self.router.clone();
        let service = service_fn(move |req: Request<Incoming>| {
            let router = router.clone();
            async move { Ok::<_, Infallible>(router.route(req, remote_addr).await) }
        });

        serve_http1(io, self.config.timeouts, service).await
    }
}

async fn bind(port: u16) -> Result<TcpListener> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {}", addr))
}

/// Drive one HTTP/1.1 connection with the read, header size and idle limits
async fn serve_http1<IO, S>(io: IO, timeouts: Timeouts, service: S) -> Result<()>
where
    IO: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    S: Service<Request<Incoming>, Response = Response<ProxyBody>, Error = Infallible> + Send + 'static,
    S::Future: Send + 'static,
{
    let activity = Activity::new();
    let io = TokioIo::new(IdleTracked::new(io, activity.clone()));

    let conn = http1::Builder::new()
        .timer(TokioTimer::new())
        .header_read_timeout(timeouts.read)
        .max_buf_size(timeouts.max_header_bytes)
        .serve_connection(io, service)
        .with_upgrades();

    close_when_idle(conn, &activity, timeouts.idle).await
}

/// Drive one TLS connection, speaking HTTP/2 or HTTP/1.1 as negotiated
async fn serve_auto<IO, S>(io: IO, timeouts: Timeouts, service: S) -> Result<()>
where
    IO: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    S: Service<Request<Incoming>, Response = Response<ProxyBody>, Error = Infallible> + Send + 'static,
    S::Future: Send + 'static,
{
    let activity = Activity::new();
    let io = TokioIo::new(IdleTracked::new(io, activity.clone()));

    let mut builder = auto::Builder::new(TokioExecutor::new());
    builder
        .http1()
        .timer(TokioTimer::new())
        .header_read_timeout(timeouts.read)
        .max_buf_size(timeouts.max_header_bytes);
    builder
        .http2()
        .timer(TokioTimer::new())
        .max_header_list_size(u32::try_from(timeouts.max_header_bytes).unwrap_or(u32::MAX));

    let conn = builder.serve_connection_with_upgrades(io, service);

    close_when_idle(conn, &activity, timeouts.idle).await
}

/// Run a connection until it finishes or carries no bytes for `limit`.
///
/// An idle connection is dropped outright rather than shut down gracefully:
/// graceful shutdown waits for in-flight responses, and a stalled upstream
/// body would then hold the connection open forever.
async fn close_when_idle<C, E>(conn: C, activity: &Activity, limit: Duration) -> Result<()>
where
    C: Future<Output = std::result::Result<(), E>>,
    E: Display,
{
    tokio::pin!(conn);

    tokio::select! {
        result = conn.as_mut() => result.map_err(|e| anyhow!("HTTP service error: {}", e)),
        _ = idle::expired(activity, limit) => {
            debug!("Closing idle connection");
            Err(anyhow!("connection idle for {:?}", limit))
        }
    }
}
