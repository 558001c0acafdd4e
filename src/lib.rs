//! CertProxy - A single-upstream HTTP/HTTPS reverse proxy
//!
//! Provides:
//! - Static files under a configurable URL prefix
//! - Forwarding of every other request to one upstream, with failures hidden
//!   behind a fixed fallback page
//! - Automatic ACME certificates for a whitelist of domains, issued on the
//!   first TLS handshake and renewed in the background

pub mod acme;
pub mod certificate;
pub mod challenge;
pub mod config;
pub mod error;
pub mod idle;
pub mod proxy;
pub mod router;
pub mod server;
pub mod static_files;
pub mod store;
pub mod tls;

pub use acme::{AcmeIssuer, CertificateIssuer, IssuedCertificate};
pub use certificate::{CertificateManager, DomainState};
pub use challenge::{ChallengeResponder, ChallengeStore};
pub use config::{DomainWhitelist, ProxyConfig, Settings, Timeouts, Upstream};
pub use proxy::{ForwardingPipeline, StatusFilter, FALLBACK_PAGE};
pub use router::Router;
pub use server::ProxyServer;
pub use static_files::StaticFiles;
pub use store::{CertificateRecord, CertificateStore};
