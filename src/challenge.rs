//! HTTP-01 challenge responder
//!
//! Runs on the plaintext port while TLS mode is active. It answers ACME
//! validation requests from the token map filled in by the issuer and sends
//! every other request to the HTTPS version of the same URL.

use crate::config::split_host_port;
use crate::proxy::{redirect_response, text_response, ProxyBody};
use dashmap::DashMap;
use hyper::header::HOST;
use hyper::{Method, Request, Response, StatusCode};
use tracing::{debug, info};

/// Path prefix ACME servers fetch tokens from
pub const ACME_CHALLENGE_PREFIX: &str = "/.well-known/acme-challenge/";

/// Pending HTTP-01 tokens and their key authorizations
#[derive(Debug, Default)]
pub struct ChallengeStore {
    tokens: DashMap<String, String>,
}

impl ChallengeStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store ACME challenge token
    pub fn insert(&self, token: &str, key_authorization: &str) {
        self.tokens
            .insert(token.to_string(), key_authorization.to_string());
    }

    /// Get ACME challenge response
    pub fn get(&self, token: &str) -> Option<String> {
        self.tokens.get(token).map(|k| k.value().clone())
    }

    /// Remove ACME challenge
    pub fn remove(&self, token: &str) {
        self.tokens.remove(token);
    }

    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }
}

/// Handler for the plaintext listener in TLS mode
pub struct ChallengeResponder {
    challenges: std::sync::Arc<ChallengeStore>,
}

impl ChallengeResponder {
    pub fn new(challenges: std::sync::Arc<ChallengeStore>) -> Self {
        Self { challenges }
    }

    pub fn handle<B>(&self, req: &Request<B>) -> Response<ProxyBody> {
        let path = req.uri().path();

        if let Some(token) = path.strip_prefix(ACME_CHALLENGE_PREFIX) {
            return match self.challenges.get(token) {
                Some(key_authorization) => {
                    info!(token = %token, "answering ACME HTTP-01 challenge");
                    text_response(StatusCode::OK, &key_authorization)
                }
                None => {
                    debug!(token = %token, "unknown ACME challenge token");
                    text_response(StatusCode::NOT_FOUND, "Challenge not found")
                }
            };
        }

        if req.method() != Method::GET && req.method() != Method::HEAD {
            return text_response(StatusCode::BAD_REQUEST, "Use HTTPS");
        }

        let host = req
            .headers()
            .get(HOST)
            .and_then(|h| h.to_str().ok())
            .or_else(|| req.uri().host());
        let Some(host) = host.filter(|h| !h.is_empty()) else {
            return text_response(StatusCode::BAD_REQUEST, "Missing Host header");
        };

        let host = split_host_port(host).0;
        let path_and_query = req
            .uri()
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/");
        let location = if host.contains(':') {
            format!("https://[{}]{}", host, path_and_query)
        } else {
            format!("https://{}{}", host, path_and_query)
        };

        redirect_response(StatusCode::FOUND, &location)
    }
}
