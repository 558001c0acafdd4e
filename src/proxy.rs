//! Forwarding pipeline
//! Sends every non-static request to the configured upstream
//!
//! The pipeline is assembled from three strategies: a [`Director`] that
//! rewrites the outbound request, a [`ResponseFilter`] that decides whether an
//! upstream response may be relayed, and an [`ErrorHandler`] that renders the
//! client-facing response whenever forwarding fails.
//!
//! Protocol upgrades (`Connection: upgrade`) are forwarded with their headers
//! intact. When the upstream answers 101 both sides are joined into a raw
//! byte tunnel.

use crate::config::{ProxyConfig, Upstream};
use crate::error::{ConfigError, ForwardError};
use bytes::Bytes;
use http_body_util::{combinators::BoxBody, BodyExt, Empty, Full};
use hyper::body::{Body, Incoming};
use hyper::header::{HeaderName, HeaderValue, CONNECTION, CONTENT_TYPE, HOST, LOCATION, UPGRADE};
use hyper::http::uri::{Authority, PathAndQuery, Scheme};
use hyper::http::{request, response};
use hyper::upgrade::OnUpgrade;
use hyper::{HeaderMap, Request, Response, StatusCode, Uri};
use hyper_util::rt::TokioIo;
use rustls::pki_types::ServerName;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tracing::{debug, info, warn};

/// Error carried by response bodies (upstream streams and local files)
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Body type produced by every handler
pub type ProxyBody = BoxBody<Bytes, BoxError>;

/// Body served whenever forwarding fails
pub const FALLBACK_PAGE: &str = "<html><body><p>An error occurred</p></body></html>";

static X_FORWARDED_HOST: HeaderName = HeaderName::from_static("x-forwarded-host");
static X_ORIGIN_HOST: HeaderName = HeaderName::from_static("x-origin-host");
static X_FORWARDED_FOR: HeaderName = HeaderName::from_static("x-forwarded-for");

/// Headers that only describe a single hop and are never forwarded
const HOP_HEADERS: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "proxy-connection",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Per-request forwarding context
#[derive(Debug, Clone)]
pub struct ProxyRequest {
    /// Host the client addressed
    pub original_host: String,
    /// URI as received from the client
    pub request_uri: String,
    /// Absolute upstream URL the request is sent to
    pub target: Uri,
    /// Tracing headers injected into the outbound request
    pub trace_headers: HeaderMap,
}

/// Rewrites an inbound request into the outbound upstream request
pub trait Director: Send + Sync {
    fn direct(
        &self,
        parts: &mut request::Parts,
        client_addr: SocketAddr,
    ) -> Result<ProxyRequest, ForwardError>;
}

/// Decides whether an upstream response may be relayed to the client
pub trait ResponseFilter: Send + Sync {
    fn check(&self, head: &response::Parts) -> Result<(), ForwardError>;
}

/// Produces the client response for a failed forward
pub trait ErrorHandler: Send + Sync {
    fn handle(&self, request: Option<&ProxyRequest>, error: &ForwardError) -> Response<ProxyBody>;
}

/// Director that points every request at the single configured upstream
pub struct UpstreamDirector {
    scheme: Scheme,
    authority: Authority,
}

impl UpstreamDirector {
    pub fn new(upstream: &Upstream) -> Result<Self, ConfigError> {
        let invalid = |reason: String| ConfigError::InvalidUpstream {
            host: upstream.host.clone(),
            reason,
        };

        let scheme = upstream
            .scheme
            .parse::<Scheme>()
            .map_err(|e| invalid(e.to_string()))?;
        let authority = upstream
            .host
            .parse::<Authority>()
            .map_err(|e| invalid(e.to_string()))?;

        Ok(Self { scheme, authority })
    }
}

impl Director for UpstreamDirector {
    fn direct(
        &self,
        parts: &mut request::Parts,
        client_addr: SocketAddr,
    ) -> Result<ProxyRequest, ForwardError> {
        let original_host = parts
            .headers
            .get(HOST)
            .and_then(|h| h.to_str().ok())
            .map(str::to_string)
            .or_else(|| parts.uri.authority().map(|a| a.to_string()))
            .unwrap_or_default();
        let request_uri = parts.uri.to_string();

        let upgrade = upgrade_protocol(&parts.headers);
        strip_hop_headers(&mut parts.headers);
        if let Some(protocol) = upgrade {
            parts.headers.insert(CONNECTION, HeaderValue::from_static("upgrade"));
            parts.headers.insert(UPGRADE, protocol);
        }

        let path_and_query = parts
            .uri
            .path_and_query()
            .cloned()
            .unwrap_or_else(|| PathAndQuery::from_static("/"));
        let target = Uri::builder()
            .scheme(self.scheme.clone())
            .authority(self.authority.clone())
            .path_and_query(path_and_query)
            .build()
            .map_err(|e| ForwardError::InvalidRequest(e.to_string()))?;

        let mut trace_headers = HeaderMap::new();
        if !original_host.is_empty() {
            if let Ok(value) = HeaderValue::from_str(&original_host) {
                trace_headers.insert(X_FORWARDED_HOST.clone(), value);
            }
        }
        let origin = HeaderValue::from_str(self.authority.as_str())
            .map_err(|e| ForwardError::InvalidRequest(e.to_string()))?;
        trace_headers.insert(X_ORIGIN_HOST.clone(), origin.clone());

        let client_ip = client_addr.ip().to_string();
        let forwarded_for = match parts
            .headers
            .get(&X_FORWARDED_FOR)
            .and_then(|h| h.to_str().ok())
        {
            Some(prior) if !prior.is_empty() => format!("{}, {}", prior, client_ip),
            _ => client_ip,
        };
        if let Ok(value) = HeaderValue::from_str(&forwarded_for) {
            trace_headers.insert(X_FORWARDED_FOR.clone(), value);
        }

        for (name, value) in trace_headers.iter() {
            parts.headers.insert(name.clone(), value.clone());
        }
        // The upstream sees the host the client asked for. HTTP/2 clients
        // carry it in the URI only, so it is written out for HTTP/1.1.
        if !parts.headers.contains_key(HOST) {
            let host = match HeaderValue::from_str(&original_host) {
                Ok(value) if !original_host.is_empty() => value,
                _ => origin,
            };
            parts.headers.insert(HOST, host);
        }
        parts.uri = target.clone();

        info!(uri = %request_uri, host = %original_host, "forwarding request");

        Ok(ProxyRequest {
            original_host,
            request_uri,
            target,
            trace_headers,
        })
    }
}

/// Which upstream statuses count as a forwarding failure
///
/// A deployment picks exactly one policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum StatusFilter {
    /// Any 5xx status is replaced by the fallback page
    #[default]
    ServerError,
    /// Only 404 is replaced by the fallback page
    NotFound,
}

impl StatusFilter {
    pub fn rejects(&self, status: StatusCode) -> bool {
        match self {
            StatusFilter::ServerError => status.is_server_error(),
            StatusFilter::NotFound => status == StatusCode::NOT_FOUND,
        }
    }
}

impl ResponseFilter for StatusFilter {
    fn check(&self, head: &response::Parts) -> Result<(), ForwardError> {
        if self.rejects(head.status) {
            return Err(ForwardError::RejectedStatus(head.status));
        }
        Ok(())
    }
}

/// Error handler that hides every failure behind the same HTML page
#[derive(Debug, Clone, Copy, Default)]
pub struct FallbackPage;

impl ErrorHandler for FallbackPage {
    fn handle(&self, request: Option<&ProxyRequest>, error: &ForwardError) -> Response<ProxyBody> {
        match request {
            Some(req) => warn!(uri = %req.request_uri, target = %req.target, error = %error, "forwarding failed"),
            None => warn!(error = %error, "forwarding failed"),
        }
        html_response(StatusCode::BAD_GATEWAY, FALLBACK_PAGE)
    }
}

/// Opens one upstream connection per request
pub struct UpstreamClient {
    upstream: Upstream,
    tls: Option<TlsConnector>,
}

impl UpstreamClient {
    pub fn new(upstream: Upstream) -> Self {
        let tls = upstream.is_tls().then(|| {
            let mut roots = rustls::RootCertStore::empty();
            roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
            let config = rustls::ClientConfig::builder()
                .with_root_certificates(roots)
                .with_no_client_auth();
            TlsConnector::from(Arc::new(config))
        });

        Self { upstream, tls }
    }

    /// Send a request whose URI already points at the upstream
    pub async fn send<B>(&self, mut req: Request<B>) -> Result<Response<Incoming>, ForwardError>
    where
        B: Body + Send + 'static,
        B::Data: Send,
        B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        // Origin-form on the wire; the authority travels in the Host header.
        let origin_form = req
            .uri()
            .path_and_query()
            .cloned()
            .unwrap_or_else(|| PathAndQuery::from_static("/"));
        *req.uri_mut() = Uri::from(origin_form);

        let host = self.upstream.hostname();
        let port = self.upstream.port();
        let stream = TcpStream::connect((host, port))
            .await
            .map_err(|source| ForwardError::Connect {
                addr: self.upstream.host.clone(),
                source,
            })?;

        match &self.tls {
            Some(connector) => {
                let server_name = ServerName::try_from(host)
                    .map_err(|e| ForwardError::ServerName(e.to_string()))?
                    .to_owned();
                let stream = connector
                    .connect(server_name, stream)
                    .await
                    .map_err(ForwardError::Tls)?;
                send_over(stream, req).await
            }
            None => send_over(stream, req).await,
        }
    }
}

async fn send_over<IO, B>(io: IO, req: Request<B>) -> Result<Response<Incoming>, ForwardError>
where
    IO: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    B: Body + Send + 'static,
    B::Data: Send,
    B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    let (mut sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(io)).await?;

    tokio::spawn(async move {
        if let Err(e) = conn.with_upgrades().await {
            debug!("Upstream connection error: {}", e);
        }
    });

    Ok(sender.send_request(req).await?)
}

/// Director, upstream call, response filter and error handler wired together
pub struct ForwardingPipeline {
    director: Arc<dyn Director>,
    filter: Arc<dyn ResponseFilter>,
    error_handler: Arc<dyn ErrorHandler>,
    client: UpstreamClient,
    timeout: Duration,
}

impl ForwardingPipeline {
    /// Pipeline with the default strategies for this configuration
    pub fn new(config: &ProxyConfig) -> Result<Self, ConfigError> {
        Ok(Self::with_strategies(
            Arc::new(UpstreamDirector::new(&config.upstream)?),
            Arc::new(config.response_filter),
            Arc::new(FallbackPage),
            UpstreamClient::new(config.upstream.clone()),
            config.timeouts.write,
        ))
    }

    pub fn with_strategies(
        director: Arc<dyn Director>,
        filter: Arc<dyn ResponseFilter>,
        error_handler: Arc<dyn ErrorHandler>,
        client: UpstreamClient,
        timeout: Duration,
    ) -> Self {
        Self {
            director,
            filter,
            error_handler,
            client,
            timeout,
        }
    }

    /// Forward one request; always yields exactly one response
    pub async fn forward<B>(&self, mut req: Request<B>, client_addr: SocketAddr) -> Response<ProxyBody>
    where
        B: Body + Send + 'static,
        B::Data: Send,
        B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        let client_upgrade = upgrade_protocol(req.headers()).map(|_| hyper::upgrade::on(&mut req));
        let (mut parts, body) = req.into_parts();

        let context = match self.director.direct(&mut parts, client_addr) {
            Ok(context) => context,
            Err(e) => return self.error_handler.handle(None, &e),
        };

        let outbound = Request::from_parts(parts, body);
        let result = match tokio::time::timeout(self.timeout, self.client.send(outbound)).await {
            Ok(result) => result,
            Err(_) => Err(ForwardError::Timeout(self.timeout)),
        };

        let response = match result {
            Ok(response) => response,
            Err(e) => return self.error_handler.handle(Some(&context), &e),
        };

        if response.status() == StatusCode::SWITCHING_PROTOCOLS {
            return match client_upgrade {
                Some(client) => tunnel(response, client, context.request_uri),
                None => self.error_handler.handle(
                    Some(&context),
                    &ForwardError::InvalidRequest("upstream switched protocols unasked".to_string()),
                ),
            };
        }

        let (mut head, body) = response.into_parts();
        if let Err(e) = self.filter.check(&head) {
            return self.error_handler.handle(Some(&context), &e);
        }

        strip_hop_headers(&mut head.headers);
        debug!(uri = %context.request_uri, status = %head.status, "relaying upstream response");

        Response::from_parts(head, body.map_err(|e| Box::new(e) as BoxError).boxed())
    }
}

/// Relay a 101 and splice the client and upstream connections together
fn tunnel(mut response: Response<Incoming>, client: OnUpgrade, uri: String) -> Response<ProxyBody> {
    let upstream = hyper::upgrade::on(&mut response);

    tokio::spawn(async move {
        let (client, upstream) = match tokio::try_join!(client, upstream) {
            Ok(pair) => pair,
            Err(e) => {
                warn!(uri = %uri, error = %e, "protocol upgrade failed");
                return;
            }
        };

        let mut client = TokioIo::new(client);
        let mut upstream = TokioIo::new(upstream);
        match tokio::io::copy_bidirectional(&mut client, &mut upstream).await {
            Ok((sent, received)) => debug!(uri = %uri, sent, received, "upgraded connection closed"),
            Err(e) => debug!(uri = %uri, error = %e, "upgraded connection error"),
        }
    });

    let (mut head, _) = response.into_parts();
    let protocol = head.headers.get(UPGRADE).cloned();
    strip_hop_headers(&mut head.headers);
    if let Some(protocol) = protocol {
        head.headers.insert(CONNECTION, HeaderValue::from_static("upgrade"));
        head.headers.insert(UPGRADE, protocol);
    }
    debug!(status = %head.status, "switching protocols");

    Response::from_parts(head, empty_body())
}

/// Protocol named by `Upgrade` when `Connection` asks for an upgrade
fn upgrade_protocol(headers: &HeaderMap) -> Option<HeaderValue> {
    let requested = headers
        .get_all(CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .any(|token| token.trim().eq_ignore_ascii_case("upgrade"));

    if requested {
        headers.get(UPGRADE).cloned()
    } else {
        None
    }
}

/// Remove hop-by-hop headers, including any named by `Connection`
fn strip_hop_headers(headers: &mut HeaderMap) {
    let listed: Vec<HeaderName> = headers
        .get_all(CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .filter_map(|name| HeaderName::from_bytes(name.trim().as_bytes()).ok())
        .collect();

    for name in listed {
        headers.remove(name);
    }
    for name in HOP_HEADERS {
        headers.remove(*name);
    }
}

/// Create text response
pub(crate) fn text_response(status: StatusCode, body: &str) -> Response<ProxyBody> {
    with_content_type(status, "text/plain; charset=utf-8", body)
}

/// Create HTML response
pub(crate) fn html_response(status: StatusCode, body: &str) -> Response<ProxyBody> {
    with_content_type(status, "text/html; charset=utf-8", body)
}

fn with_content_type(status: StatusCode, content_type: &'static str, body: &str) -> Response<ProxyBody> {
    let mut response = Response::new(full_body(Bytes::from(body.to_string())));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static(content_type));
    response
}

/// Create redirect response
pub(crate) fn redirect_response(status: StatusCode, location: &str) -> Response<ProxyBody> {
    let mut response = Response::new(empty_body());
    *response.status_mut() = status;
    match HeaderValue::from_str(location) {
        Ok(value) => {
            response.headers_mut().insert(LOCATION, value);
        }
        Err(_) => *response.status_mut() = StatusCode::BAD_REQUEST,
    }
    response
}

/// Create full body
pub(crate) fn full_body(bytes: Bytes) -> ProxyBody {
    Full::new(bytes).map_err(|never| match never {}).boxed()
}

/// Create empty body
pub(crate) fn empty_body() -> ProxyBody {
    Empty::<Bytes>::new().map_err(|never| match never {}).boxed()
}

#[cfg(test)]
mod tests {
    use super::*;
    use hyper::Method;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client_addr() -> SocketAddr {
        "203.0.113.7:52000".parse().unwrap()
    }

    fn request_parts(uri: &str, host: &str) -> request::Parts {
        Request::builder()
            .method(Method::POST)
            .uri(uri)
            .header(HOST, host)
            .header("connection", "keep-alive, x-hop")
            .header("x-hop", "1")
            .header("keep-alive", "timeout=5")
            .header("accept", "text/html")
            .body(())
            .unwrap()
            .into_parts()
            .0
    }

    fn director(host: &str) -> UpstreamDirector {
        UpstreamDirector::new(&Upstream::new("http", host).unwrap()).unwrap()
    }

    fn pipeline_for(addr: SocketAddr, filter: StatusFilter) -> ForwardingPipeline {
        pipeline_with(addr, Arc::new(FallbackPage), Duration::from_secs(5))
    }

    fn pipeline_with(
        addr: SocketAddr,
        error_handler: Arc<dyn ErrorHandler>,
        timeout: Duration,
    ) -> ForwardingPipeline {
        let upstream = Upstream::new("http", &addr.to_string()).unwrap();
        ForwardingPipeline::with_strategies(
            Arc::new(UpstreamDirector::new(&upstream).unwrap()),
            Arc::new(StatusFilter::ServerError),
            error_handler,
            UpstreamClient::new(upstream),
            timeout,
        )
    }

    /// Remembers every error it renders
    #[derive(Default)]
    struct RecordingHandler(parking_lot::Mutex<Vec<String>>);

    impl ErrorHandler for RecordingHandler {
        fn handle(&self, request: Option<&ProxyRequest>, error: &ForwardError) -> Response<ProxyBody> {
            let kind = match error {
                ForwardError::Timeout(_) => "timeout".to_string(),
                other => other.to_string(),
            };
            self.0.lock().push(kind);
            FallbackPage.handle(request, error)
        }
    }

    /// Upstream that accepts connections and never answers
    async fn silent_upstream() -> (SocketAddr, tokio::sync::oneshot::Receiver<()>) {
        use tokio::io::AsyncReadExt;

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (closed_tx, closed_rx) = tokio::sync::oneshot::channel();

        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 1024];
            loop {
                match socket.read(&mut buf).await {
                    Ok(0) | Err(_) => break,
                    Ok(_) => continue,
                }
            }
            let _ = closed_tx.send(());
        });

        (addr, closed_rx)
    }

    async fn body_string(response: Response<ProxyBody>) -> String {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[test]
    fn test_director_rewrites_target() {
        let mut parts = request_parts("/api/widgets?page=2", "shop.example.com");
        let context = director("api.internal:9000")
            .direct(&mut parts, client_addr())
            .unwrap();

        assert_eq!(parts.uri.scheme_str(), Some("http"));
        assert_eq!(parts.uri.authority().unwrap().as_str(), "api.internal:9000");
        assert_eq!(parts.uri.path(), "/api/widgets");
        assert_eq!(parts.uri.query(), Some("page=2"));
        assert_eq!(parts.method, Method::POST);
        assert_eq!(parts.headers[HOST], "shop.example.com");
        assert_eq!(parts.headers["x-forwarded-host"], "shop.example.com");
        assert_eq!(parts.headers["x-origin-host"], "api.internal:9000");
        assert_eq!(parts.headers["x-forwarded-for"], "203.0.113.7");
        assert_eq!(parts.headers["accept"], "text/html");

        assert_eq!(context.original_host, "shop.example.com");
        assert_eq!(context.request_uri, "/api/widgets?page=2");
        assert_eq!(context.target.to_string(), "http://api.internal:9000/api/widgets?page=2");
        assert_eq!(context.trace_headers.len(), 3);
    }

    #[test]
    fn test_director_strips_hop_headers() {
        let mut parts = request_parts("/", "example.com");
        director("api.internal:9000")
            .direct(&mut parts, client_addr())
            .unwrap();

        assert!(parts.headers.get("connection").is_none());
        assert!(parts.headers.get("keep-alive").is_none());
        assert!(parts.headers.get("x-hop").is_none());
    }

    #[test]
    fn test_director_fills_missing_host() {
        let mut parts = Request::builder()
            .uri("https://h2.example.com/feed")
            .body(())
            .unwrap()
            .into_parts()
            .0;
        director("api.internal:9000")
            .direct(&mut parts, client_addr())
            .unwrap();
        assert_eq!(parts.headers[HOST], "h2.example.com");

        let mut parts = Request::builder().uri("/").body(()).unwrap().into_parts().0;
        director("api.internal:9000")
            .direct(&mut parts, client_addr())
            .unwrap();
        assert_eq!(parts.headers[HOST], "api.internal:9000");
    }

    #[test]
    fn test_director_keeps_upgrade_headers() {
        let mut parts = Request::builder()
            .uri("/chat")
            .header(HOST, "example.com")
            .header(CONNECTION, "keep-alive, Upgrade")
            .header(UPGRADE, "websocket")
            .header("keep-alive", "timeout=5")
            .body(())
            .unwrap()
            .into_parts()
            .0;
        director("api.internal:9000")
            .direct(&mut parts, client_addr())
            .unwrap();

        assert_eq!(parts.headers[CONNECTION], "upgrade");
        assert_eq!(parts.headers[UPGRADE], "websocket");
        assert!(parts.headers.get("keep-alive").is_none());
    }

    #[test]
    fn test_upgrade_requires_connection_token() {
        let mut headers = HeaderMap::new();
        headers.insert(UPGRADE, HeaderValue::from_static("websocket"));
        assert!(upgrade_protocol(&headers).is_none());

        headers.insert(CONNECTION, HeaderValue::from_static("Upgrade"));
        assert_eq!(upgrade_protocol(&headers).unwrap(), "websocket");
    }

    #[test]
    fn test_director_appends_forwarded_for() {
        let mut parts = request_parts("/", "example.com");
        parts
            .headers
            .insert("x-forwarded-for", HeaderValue::from_static("198.51.100.1"));
        director("api.internal:9000")
            .direct(&mut parts, client_addr())
            .unwrap();

        assert_eq!(parts.headers["x-forwarded-for"], "198.51.100.1, 203.0.113.7");
    }

    #[test]
    fn test_director_overrides_client_trace_headers() {
        let mut parts = request_parts("/", "example.com");
        parts
            .headers
            .insert("x-forwarded-host", HeaderValue::from_static("spoofed.test"));
        director("api.internal:9000")
            .direct(&mut parts, client_addr())
            .unwrap();

        let values: Vec<_> = parts.headers.get_all("x-forwarded-host").iter().collect();
        assert_eq!(values, vec!["example.com"]);
    }

    #[test]
    fn test_director_https_upstream() {
        let upstream = Upstream::new("https", "secure.internal").unwrap();
        let mut parts = request_parts("/login", "example.com");
        UpstreamDirector::new(&upstream)
            .unwrap()
            .direct(&mut parts, client_addr())
            .unwrap();

        assert_eq!(parts.uri.to_string(), "https://secure.internal/login");
    }

    #[test]
    fn test_server_error_filter() {
        let filter = StatusFilter::ServerError;
        for (status, rejected) in [(200, false), (404, false), (500, true), (503, true)] {
            let head = Response::builder().status(status).body(()).unwrap().into_parts().0;
            assert_eq!(filter.check(&head).is_err(), rejected, "status {}", status);
        }
    }

    #[test]
    fn test_not_found_filter() {
        let filter = StatusFilter::NotFound;
        assert!(filter.rejects(StatusCode::NOT_FOUND));
        assert!(!filter.rejects(StatusCode::INTERNAL_SERVER_ERROR));
        assert!(!filter.rejects(StatusCode::OK));
    }

    #[tokio::test]
    async fn test_fallback_page_hides_cause() {
        let error = ForwardError::RejectedStatus(StatusCode::SERVICE_UNAVAILABLE);
        let response = FallbackPage.handle(None, &error);

        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
        assert_eq!(response.headers()[CONTENT_TYPE], "text/html; charset=utf-8");
        assert_eq!(body_string(response).await, FALLBACK_PAGE);
    }

    #[tokio::test]
    async fn test_forward_relays_success() {
        let server = MockServer::start().await;
        let upstream_host = server.address().to_string();
        Mock::given(method("GET"))
            .and(path("/api/widgets"))
            .and(header("x-origin-host", upstream_host.as_str()))
            .and(header("x-forwarded-host", "app.example.com"))
            .respond_with(ResponseTemplate::new(200).set_body_string("[\"widget\"]"))
            .expect(1)
            .mount(&server)
            .await;

        let pipeline = pipeline_for(*server.address(), StatusFilter::ServerError);
        let request = Request::builder()
            .uri("/api/widgets")
            .header(HOST, "app.example.com")
            .body(Full::new(Bytes::new()))
            .unwrap();

        let response = pipeline.forward(request, client_addr()).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_string(response).await, "[\"widget\"]");
    }

    #[tokio::test]
    async fn test_forward_replaces_server_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(503).set_body_string("stack trace: secret"))
            .mount(&server)
            .await;

        let pipeline = pipeline_for(*server.address(), StatusFilter::ServerError);
        let request = Request::builder()
            .uri("/broken")
            .header(HOST, "app.example.com")
            .body(Full::new(Bytes::new()))
            .unwrap();

        let response = pipeline.forward(request, client_addr()).await;
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
        let body = body_string(response).await;
        assert_eq!(body, FALLBACK_PAGE);
        assert!(!body.contains("secret"));
    }

    #[tokio::test]
    async fn test_forward_not_found_policy() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/missing"))
            .respond_with(ResponseTemplate::new(404).set_body_string("nope"))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/crash"))
            .respond_with(ResponseTemplate::new(500).set_body_string("crash"))
            .mount(&server)
            .await;

        let pipeline = pipeline_for(*server.address(), StatusFilter::NotFound);

        let missing = Request::builder()
            .uri("/missing")
            .body(Full::new(Bytes::new()))
            .unwrap();
        let response = pipeline.forward(missing, client_addr()).await;
        assert_eq!(body_string(response).await, FALLBACK_PAGE);

        let crash = Request::builder()
            .uri("/crash")
            .body(Full::new(Bytes::new()))
            .unwrap();
        let response = pipeline.forward(crash, client_addr()).await;
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body_string(response).await, "crash");
    }

    #[tokio::test]
    async fn test_forward_connection_refused() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let pipeline = pipeline_for(addr, StatusFilter::ServerError);
        let request = Request::builder()
            .uri("/anything")
            .body(Full::new(Bytes::new()))
            .unwrap();

        let response = pipeline.forward(request, client_addr()).await;
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
        assert_eq!(body_string(response).await, FALLBACK_PAGE);
    }

    #[tokio::test]
    async fn test_forward_preserves_method_and_body() {
        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .and(path("/items/7"))
            .and(wiremock::matchers::body_string("payload"))
            .respond_with(ResponseTemplate::new(201))
            .expect(1)
            .mount(&server)
            .await;

        let pipeline = pipeline_for(*server.address(), StatusFilter::ServerError);
        let request = Request::builder()
            .method(Method::PUT)
            .uri("/items/7")
            .body(Full::new(Bytes::from_static(b"payload")))
            .unwrap();

        let response = pipeline.forward(request, client_addr()).await;
        assert_eq!(response.status(), StatusCode::CREATED);
    }

    #[tokio::test]
    async fn test_forward_write_timeout_uses_fallback() {
        let (addr, _closed) = silent_upstream().await;
        let handler = Arc::new(RecordingHandler::default());
        let pipeline = pipeline_with(addr, handler.clone(), Duration::from_millis(200));

        let request = Request::builder()
            .uri("/slow")
            .body(Full::new(Bytes::new()))
            .unwrap();

        let started = std::time::Instant::now();
        let response = pipeline.forward(request, client_addr()).await;

        assert!(started.elapsed() < Duration::from_secs(5));
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
        assert_eq!(body_string(response).await, FALLBACK_PAGE);
        assert_eq!(*handler.0.lock(), vec!["timeout".to_string()]);
    }

    #[tokio::test]
    async fn test_dropped_forward_closes_upstream_connection() {
        let (addr, closed) = silent_upstream().await;
        let pipeline = pipeline_with(addr, Arc::new(FallbackPage), Duration::from_secs(60));

        let request = Request::builder()
            .uri("/long-poll")
            .body(Full::new(Bytes::new()))
            .unwrap();

        // The client goes away while the upstream is still thinking.
        let abandoned = tokio::time::timeout(
            Duration::from_millis(300),
            pipeline.forward(request, client_addr()),
        )
        .await;
        assert!(abandoned.is_err());

        tokio::time::timeout(Duration::from_secs(5), closed)
            .await
            .expect("upstream connection was not closed")
            .unwrap();
    }
}
