//! Request routing
//! Static prefix goes to the file handler, everything else to the upstream

use crate::config::ProxyConfig;
use crate::error::ConfigError;
use crate::proxy::{redirect_response, ForwardingPipeline, ProxyBody};
use crate::static_files::StaticFiles;
use hyper::body::Body;
use hyper::{Request, Response, StatusCode};
use std::net::SocketAddr;
use tracing::debug;

/// Dispatches requests between static files and the forwarding pipeline
pub struct Router {
    /// `/<prefix>` with no trailing slash
    mount: String,
    static_files: StaticFiles,
    pipeline: ForwardingPipeline,
}

impl Router {
    pub fn new(config: &ProxyConfig) -> Result<Self, ConfigError> {
        Ok(Self::with_parts(
            &config.static_prefix,
            StaticFiles::new(&config.static_dir),
            ForwardingPipeline::new(config)?,
        ))
    }

    pub fn with_parts(prefix: &str, static_files: StaticFiles, pipeline: ForwardingPipeline) -> Self {
        Self {
            mount: format!("/{}", prefix.trim_matches('/')),
            static_files,
            pipeline,
        }
    }

    pub async fn route<B>(&self, req: Request<B>, client_addr: SocketAddr) -> Response<ProxyBody>
    where
        B: Body + Send + 'static,
        B::Data: Send,
        B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        let path = req.uri().path();

        if path == self.mount {
            let location = match req.uri().query() {
                Some(query) => format!("{}/?{}", self.mount, query),
                None => format!("{}/", self.mount),
            };
            return redirect_response(StatusCode::MOVED_PERMANENTLY, &location);
        }

        if let Some(relative) = path
            .strip_prefix(self.mount.as_str())
            .and_then(|rest| rest.strip_prefix('/'))
        {
            debug!(path = %path, "static request");
            return self.static_files.serve(req.method(), req.headers(), relative).await;
        }

        self.pipeline.forward(req, client_addr).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Upstream;
    use crate::proxy::{FallbackPage, StatusFilter, UpstreamClient, UpstreamDirector};
    use bytes::Bytes;
    use http_body_util::{BodyExt, Full};
    use hyper::header::LOCATION;
    use std::sync::Arc;
    use std::time::Duration;
    use tempfile::tempdir;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn router(static_dir: &std::path::Path, upstream: SocketAddr) -> Router {
        let upstream = Upstream::new("http", &upstream.to_string()).unwrap();
        let pipeline = ForwardingPipeline::with_strategies(
            Arc::new(UpstreamDirector::new(&upstream).unwrap()),
            Arc::new(StatusFilter::ServerError),
            Arc::new(FallbackPage),
            UpstreamClient::new(upstream),
            Duration::from_secs(5),
        );
        Router::with_parts("static", StaticFiles::new(static_dir), pipeline)
    }

    fn get(uri: &str) -> Request<Full<Bytes>> {
        Request::builder().uri(uri).body(Full::new(Bytes::new())).unwrap()
    }

    fn client() -> SocketAddr {
        "127.0.0.1:40000".parse().unwrap()
    }

    #[tokio::test]
    async fn test_static_prefix_is_stripped() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("app.css"), "body {}").unwrap();
        let server = MockServer::start().await;

        let response = router(dir.path(), *server.address())
            .route(get("/static/app.css"), client())
            .await;

        assert_eq!(response.status(), StatusCode::OK);
        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], b"body {}");
        assert!(server.received_requests().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_bare_prefix_redirects() {
        let dir = tempdir().unwrap();
        let server = MockServer::start().await;

        let response = router(dir.path(), *server.address())
            .route(get("/static?v=2"), client())
            .await;

        assert_eq!(response.status(), StatusCode::MOVED_PERMANENTLY);
        assert_eq!(response.headers()[LOCATION], "/static/?v=2");
    }

    #[tokio::test]
    async fn test_static_subdirectory_redirects() {
        let dir = tempdir().unwrap();
        std::fs::create_dir(dir.path().join("docs")).unwrap();
        let server = MockServer::start().await;

        let response = router(dir.path(), *server.address())
            .route(get("/static/docs"), client())
            .await;

        assert_eq!(response.status(), StatusCode::MOVED_PERMANENTLY);
        assert_eq!(response.headers()[LOCATION], "docs/");
    }

    #[tokio::test]
    async fn test_similar_prefix_is_forwarded() {
        let dir = tempdir().unwrap();
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/staticky/app.css"))
            .respond_with(ResponseTemplate::new(200).set_body_string("upstream"))
            .expect(1)
            .mount(&server)
            .await;

        let response = router(dir.path(), *server.address())
            .route(get("/staticky/app.css"), client())
            .await;
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_other_paths_are_forwarded() {
        let dir = tempdir().unwrap();
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/widgets"))
            .respond_with(ResponseTemplate::new(200).set_body_string("[]"))
            .expect(1)
            .mount(&server)
            .await;

        let response = router(dir.path(), *server.address())
            .route(get("/api/widgets"), client())
            .await;
        assert_eq!(response.status(), StatusCode::OK);
    }
}
