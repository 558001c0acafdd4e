//! Startup configuration
//!
//! Settings come from the environment (or matching command-line flags) and are
//! validated once into an immutable [`ProxyConfig`] that every component
//! receives behind an `Arc`.

use crate::error::ConfigError;
use crate::proxy::StatusFilter;
use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;
use url::Url;

/// Port that switches the proxy into automatic-certificate mode
pub const TLS_PORT: u16 = 443;

/// Let's Encrypt production directory
pub const LETS_ENCRYPT_PRODUCTION: &str = "https://acme-v02.api.letsencrypt.org/directory";

/// Raw settings as read from the environment
#[derive(Parser, Debug, Clone)]
#[command(name = "certproxy")]
#[command(author = "CertProxy Contributors")]
#[command(version = "1.0.0")]
#[command(about = "Reverse proxy with static files and automatic ACME certificates")]
pub struct Settings {
    /// Upstream scheme (http or https)
    #[arg(long, env = "PROXY_SCHEME", default_value = "http")]
    pub proxy_scheme: String,

    /// Upstream host:port that all non-static requests are forwarded to
    #[arg(long, env = "PROXY_HOST", default_value = "localhost:8080")]
    pub proxy_host: String,

    /// Directory served under the static prefix
    #[arg(long, env = "STATIC_DIR", default_value = "static")]
    pub static_dir: PathBuf,

    /// URL prefix for static files, without slashes
    #[arg(long, env = "STATIC_PREFIX", default_value = "static")]
    pub static_prefix: String,

    /// Listen port; 443 enables automatic certificates
    #[arg(long, env = "PORT", default_value = "8888")]
    pub port: u16,

    /// Comma separated list of domains allowed to receive certificates
    #[arg(long, env = "DOMAINS", default_value = "")]
    pub domains: String,

    /// Certificate cache directory (defaults to $HOME/letsencrypt)
    #[arg(long, env = "CERT_CACHE_DIR")]
    pub cert_cache_dir: Option<PathBuf>,

    /// ACME directory URL
    #[arg(long, env = "ACME_DIRECTORY_URL", default_value = LETS_ENCRYPT_PRODUCTION)]
    pub acme_directory_url: String,

    /// Contact e-mail for the ACME account
    #[arg(long, env = "ACME_EMAIL")]
    pub acme_email: Option<String>,

    /// Which upstream statuses are replaced by the fallback page
    #[arg(long, env = "RESPONSE_FILTER", value_enum, default_value = "server-error")]
    pub response_filter: StatusFilter,

    /// Log level
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    pub log_level: String,
}

/// Connection limits applied to every listener
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timeouts {
    /// Time allowed to receive a complete request head
    pub read: Duration,
    /// Time allowed to produce a response head
    pub write: Duration,
    /// Time a connection may stay without any traffic
    pub idle: Duration,
    /// Largest request head accepted
    pub max_header_bytes: usize,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            read: Duration::from_secs(10),
            write: Duration::from_secs(10),
            idle: Duration::from_secs(120),
            max_header_bytes: 1 << 20,
        }
    }
}

/// Host names allowed to receive certificates
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DomainWhitelist {
    domains: Vec<String>,
}

impl DomainWhitelist {
    /// Parse a comma separated list. Blank entries are skipped.
    pub fn parse(list: &str) -> Result<Self, ConfigError> {
        let mut domains: Vec<String> = Vec::new();

        for entry in list.split(',') {
            let entry = entry.trim();
            if entry.is_empty() {
                continue;
            }

            let domain = entry.trim_end_matches('.').to_ascii_lowercase();
            if !is_valid_domain(&domain) {
                return Err(ConfigError::InvalidDomain(entry.to_string()));
            }
            if !domains.contains(&domain) {
                domains.push(domain);
            }
        }

        Ok(Self { domains })
    }

    pub fn contains(&self, host: &str) -> bool {
        let host = host.trim_end_matches('.');
        self.domains.iter().any(|d| d.eq_ignore_ascii_case(host))
    }

    pub fn is_empty(&self) -> bool {
        self.domains.is_empty()
    }

    pub fn len(&self) -> usize {
        self.domains.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.domains.iter().map(String::as_str)
    }
}

fn is_valid_domain(domain: &str) -> bool {
    if domain.is_empty() || domain.len() > 253 {
        return false;
    }

    domain.split('.').all(|label| {
        !label.is_empty()
            && label.len() <= 63
            && !label.starts_with('-')
            && !label.ends_with('-')
            && label.chars().all(|c| c.is_ascii_alphanumeric() || c == '-')
    })
}

/// Upstream origin that receives all non-static requests
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Upstream {
    /// `http` or `https`
    pub scheme: String,
    /// `host:port` (port optional)
    pub host: String,
}

impl Upstream {
    pub fn new(scheme: &str, host: &str) -> Result<Self, ConfigError> {
        let scheme = scheme.trim().to_ascii_lowercase();
        if scheme != "http" && scheme != "https" {
            return Err(ConfigError::InvalidScheme(scheme));
        }

        let host = host.trim().to_string();
        let url = Url::parse(&format!("{}://{}", scheme, host)).map_err(|e| {
            ConfigError::InvalidUpstream {
                host: host.clone(),
                reason: e.to_string(),
            }
        })?;

        if url.host_str().is_none() || url.path() != "/" || url.query().is_some() {
            return Err(ConfigError::InvalidUpstream {
                host,
                reason: "expected host[:port] only".to_string(),
            });
        }

        Ok(Self { scheme, host })
    }

    pub fn is_tls(&self) -> bool {
        self.scheme == "https"
    }

    /// Host name without the port
    pub fn hostname(&self) -> &str {
        split_host_port(&self.host).0
    }

    /// Port, falling back to the scheme default
    pub fn port(&self) -> u16 {
        split_host_port(&self.host)
            .1
            .unwrap_or(if self.is_tls() { 443 } else { 80 })
    }
}

/// Split `host[:port]`, keeping bracketed IPv6 literals intact
pub(crate) fn split_host_port(authority: &str) -> (&str, Option<u16>) {
    if let Some(rest) = authority.strip_prefix('[') {
        if let Some(end) = rest.find(']') {
            let host = &rest[..end];
            let port = rest[end + 1..]
                .strip_prefix(':')
                .and_then(|p| p.parse().ok());
            return (host, port);
        }
    }

    match authority.rsplit_once(':') {
        Some((host, port)) if !host.contains(':') => match port.parse() {
            Ok(port) => (host, Some(port)),
            Err(_) => (authority, None),
        },
        _ => (authority, None),
    }
}

/// Immutable proxy configuration, built once at startup
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    pub upstream: Upstream,
    pub static_dir: PathBuf,
    /// Static URL prefix without leading or trailing slashes
    pub static_prefix: String,
    pub port: u16,
    pub domains: DomainWhitelist,
    pub cert_cache_dir: PathBuf,
    pub acme_directory_url: String,
    pub acme_email: Option<String>,
    pub response_filter: StatusFilter,
    pub timeouts: Timeouts,
}

impl ProxyConfig {
    pub fn from_settings(settings: Settings) -> Result<Self, ConfigError> {
        let upstream = Upstream::new(&settings.proxy_scheme, &settings.proxy_host)?;

        let static_prefix = settings.static_prefix.trim_matches('/').to_string();
        if static_prefix.is_empty() {
            return Err(ConfigError::EmptyStaticPrefix);
        }

        let domains = DomainWhitelist::parse(&settings.domains)?;
        if settings.port == TLS_PORT && domains.is_empty() {
            return Err(ConfigError::EmptyWhitelist);
        }

        let cert_cache_dir = settings.cert_cache_dir.unwrap_or_else(default_cache_dir);

        Ok(Self {
            upstream,
            static_dir: settings.static_dir,
            static_prefix,
            port: settings.port,
            domains,
            cert_cache_dir,
            acme_directory_url: settings.acme_directory_url,
            acme_email: settings.acme_email.filter(|e| !e.trim().is_empty()),
            response_filter: settings.response_filter,
            timeouts: Timeouts::default(),
        })
    }

    /// Whether the proxy manages certificates and terminates TLS
    pub fn tls_enabled(&self) -> bool {
        self.port == TLS_PORT
    }
}

fn default_cache_dir() -> PathBuf {
    let home = std::env::var_os("HOME").unwrap_or_else(|| "/home/certproxy".into());
    PathBuf::from(home).join("letsencrypt")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings(args: &[&str]) -> Settings {
        let mut argv = vec!["certproxy"];
        argv.extend_from_slice(args);
        Settings::try_parse_from(argv).unwrap()
    }

    #[test]
    fn test_whitelist_parsing() {
        let list = DomainWhitelist::parse(" Example.com, www.example.com,,example.com ").unwrap();
        assert_eq!(list.len(), 2);
        assert!(list.contains("example.com"));
        assert!(list.contains("WWW.EXAMPLE.COM"));
        assert!(list.contains("example.com."));
        assert!(!list.contains("evil.com"));
    }

    #[test]
    fn test_whitelist_deduplicates_equivalent_names() {
        let list = DomainWhitelist::parse("Example.com.,example.com,EXAMPLE.COM").unwrap();
        assert_eq!(list.len(), 1);
        assert_eq!(list.iter().collect::<Vec<_>>(), vec!["example.com"]);
        assert!(DomainWhitelist::default().is_empty());
    }

    #[test]
    fn test_whitelist_rejects_malformed_entries() {
        assert!(matches!(
            DomainWhitelist::parse("example.com,bad domain"),
            Err(ConfigError::InvalidDomain(_))
        ));
        assert!(DomainWhitelist::parse("example.com:443").is_err());
        assert!(DomainWhitelist::parse("-lead.example.com").is_err());
        assert!(DomainWhitelist::parse("a..b").is_err());
    }

    #[test]
    fn test_tls_mode_requires_whitelist() {
        let result = ProxyConfig::from_settings(settings(&["--port", "443", "--domains", ""]));
        assert!(matches!(result, Err(ConfigError::EmptyWhitelist)));

        let result = ProxyConfig::from_settings(settings(&["--port", "443", "--domains", " , "]));
        assert!(matches!(result, Err(ConfigError::EmptyWhitelist)));
    }

    #[test]
    fn test_plain_mode_allows_empty_whitelist() {
        let config = ProxyConfig::from_settings(settings(&["--port", "8080", "--domains", ""])).unwrap();
        assert!(!config.tls_enabled());
        assert!(config.domains.is_empty());
    }

    #[test]
    fn test_tls_mode_config() {
        let config = ProxyConfig::from_settings(settings(&[
            "--port",
            "443",
            "--domains",
            "example.com,api.example.com,third.example.com",
            "--proxy-host",
            "api.internal:9000",
            "--static-prefix",
            "/assets/",
            "--cert-cache-dir",
            "/tmp/certs",
        ]))
        .unwrap();

        assert!(config.tls_enabled());
        assert_eq!(config.domains.len(), 3);
        assert_eq!(config.static_prefix, "assets");
        assert_eq!(config.upstream.host, "api.internal:9000");
        assert_eq!(config.upstream.port(), 9000);
        assert_eq!(config.cert_cache_dir, PathBuf::from("/tmp/certs"));
    }

    #[test]
    fn test_upstream_validation() {
        assert!(matches!(
            Upstream::new("ftp", "example.com"),
            Err(ConfigError::InvalidScheme(_))
        ));
        assert!(Upstream::new("http", "example.com/path").is_err());
        assert!(Upstream::new("http", "").is_err());

        let upstream = Upstream::new("HTTPS", "secure.internal").unwrap();
        assert!(upstream.is_tls());
        assert_eq!(upstream.port(), 443);
        assert_eq!(upstream.hostname(), "secure.internal");
    }

    #[test]
    fn test_empty_static_prefix_rejected() {
        let result = ProxyConfig::from_settings(settings(&["--static-prefix", "/"]));
        assert!(matches!(result, Err(ConfigError::EmptyStaticPrefix)));
    }

    #[test]
    fn test_split_host_port() {
        assert_eq!(split_host_port("example.com:8080"), ("example.com", Some(8080)));
        assert_eq!(split_host_port("example.com"), ("example.com", None));
        assert_eq!(split_host_port("[::1]:9000"), ("::1", Some(9000)));
        assert_eq!(split_host_port("[::1]"), ("::1", None));
    }

    #[test]
    fn test_default_timeouts() {
        let timeouts = Timeouts::default();
        assert_eq!(timeouts.read, Duration::from_secs(10));
        assert_eq!(timeouts.write, Duration::from_secs(10));
        assert_eq!(timeouts.idle, Duration::from_secs(120));
        assert_eq!(timeouts.max_header_bytes, 1 << 20);
    }
}
