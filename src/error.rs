//! Error types for each concern of the proxy

use hyper::StatusCode;
use std::io;
use thiserror::Error;

/// Startup configuration problems. Always fatal.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("TLS mode requires at least one domain in the DOMAINS whitelist")]
    EmptyWhitelist,

    #[error("invalid domain in whitelist: {0:?}")]
    InvalidDomain(String),

    #[error("unsupported upstream scheme {0:?} (expected http or https)")]
    InvalidScheme(String),

    #[error("invalid upstream host {host:?}: {reason}")]
    InvalidUpstream { host: String, reason: String },

    #[error("static prefix must not be empty")]
    EmptyStaticPrefix,
}

/// Failures while forwarding a request to the upstream.
///
/// None of these reach the client; the error handler renders the fallback page.
#[derive(Debug, Error)]
pub enum ForwardError {
    #[error("failed to connect to upstream {addr}: {source}")]
    Connect { addr: String, source: io::Error },

    #[error("TLS handshake with upstream failed: {0}")]
    Tls(io::Error),

    #[error("invalid upstream server name: {0}")]
    ServerName(String),

    #[error("upstream HTTP error: {0}")]
    Http(#[from] hyper::Error),

    #[error("invalid forwarded request: {0}")]
    InvalidRequest(String),

    #[error("upstream did not respond within {0:?}")]
    Timeout(std::time::Duration),

    #[error("upstream returned {0}, rejected by response filter")]
    RejectedStatus(StatusCode),
}

/// Certificate cache failures.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("invalid certificate data for {domain}: {reason}")]
    InvalidCertificate { domain: String, reason: String },

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// ACME protocol failures while issuing a certificate.
#[derive(Debug, Error)]
pub enum AcmeError {
    #[error("ACME client error: {0}")]
    Client(#[from] instant_acme::Error),

    #[error("key generation error: {0}")]
    KeyGeneration(#[from] rcgen::Error),

    #[error("storage error: {0}")]
    Storage(#[from] StoreError),

    #[error("no HTTP-01 challenge offered for {0}")]
    NoHttp01Challenge(String),

    #[error("order for {domain} became invalid: {reason}")]
    InvalidOrder { domain: String, reason: String },

    #[error("timed out: {0}")]
    Timeout(String),
}

/// Reasons a handshake could not be given a certificate.
#[derive(Debug, Error)]
pub enum CertError {
    #[error("client did not send a server name")]
    MissingServerName,

    #[error("host {0:?} is not in the domain whitelist")]
    HostNotAllowed(String),

    #[error("certificate issuance for {domain} failed: {source}")]
    Issuance { domain: String, source: AcmeError },

    #[error("certificate issuance for {0} failed while this handshake was waiting")]
    RecentFailure(String),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("TLS configuration error: {0}")]
    Tls(#[from] rustls::Error),
}
