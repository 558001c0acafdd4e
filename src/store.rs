//! Certificate cache on disk
//!
//! Each domain is one PEM file holding the private key followed by the
//! certificate chain. Writes go to a uniquely named temporary file in the same
//! directory which is then renamed over the target, so a reader sees either the
//! previous record or the new one.

use crate::error::StoreError;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::sign::CertifiedKey;
use std::io::Cursor;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs;
use tracing::{debug, info};
use uuid::Uuid;
use x509_parser::prelude::*;

const ACCOUNT_FILE: &str = "acme_account.json";

/// An issued certificate for one domain
#[derive(Clone)]
pub struct CertificateRecord {
    pub domain: String,
    pub certificate_pem: String,
    pub private_key_pem: String,
    /// `notAfter` of the leaf certificate
    pub expires_at: DateTime<Utc>,
    chain: Vec<CertificateDer<'static>>,
    key: Arc<PrivateKeyDer<'static>>,
}

impl std::fmt::Debug for CertificateRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CertificateRecord")
            .field("domain", &self.domain)
            .field("expires_at", &self.expires_at)
            .field("chain_len", &self.chain.len())
            .finish()
    }
}

impl CertificateRecord {
    /// Parse and validate PEM material for `domain`
    pub fn from_pem(
        domain: &str,
        certificate_pem: &str,
        private_key_pem: &str,
    ) -> Result<Self, StoreError> {
        let invalid = |reason: String| StoreError::InvalidCertificate {
            domain: domain.to_string(),
            reason,
        };

        let chain = rustls_pemfile::certs(&mut Cursor::new(certificate_pem.as_bytes()))
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| invalid(format!("unreadable certificate PEM: {}", e)))?;
        let leaf = chain
            .first()
            .ok_or_else(|| invalid("certificate chain is empty".to_string()))?;

        let key = rustls_pemfile::private_key(&mut Cursor::new(private_key_pem.as_bytes()))
            .map_err(|e| invalid(format!("unreadable private key PEM: {}", e)))?
            .ok_or_else(|| invalid("no private key found".to_string()))?;

        let (_, cert) = X509Certificate::from_der(leaf.as_ref())
            .map_err(|e| invalid(format!("invalid leaf certificate: {}", e)))?;
        let not_after = cert.validity().not_after.timestamp();
        let expires_at = DateTime::<Utc>::from_timestamp(not_after, 0)
            .ok_or_else(|| invalid("certificate expiry out of range".to_string()))?;

        Ok(Self {
            domain: domain.to_string(),
            certificate_pem: certificate_pem.to_string(),
            private_key_pem: private_key_pem.to_string(),
            expires_at,
            chain,
            key: Arc::new(key),
        })
    }

    /// DER chain, leaf first
    pub fn chain(&self) -> &[CertificateDer<'static>] {
        &self.chain
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    /// Remaining validity is below `margin`
    pub fn needs_renewal(&self, now: DateTime<Utc>, margin: ChronoDuration) -> bool {
        now + margin >= self.expires_at
    }

    /// Signing material for the TLS handshake
    pub fn certified_key(&self) -> Result<Arc<CertifiedKey>, rustls::Error> {
        let signing_key = rustls::crypto::ring::sign::any_supported_type(&self.key)?;
        Ok(Arc::new(CertifiedKey::new(self.chain.clone(), signing_key)))
    }

    /// The single-file cache representation: key first, then the chain
    fn to_cache_file(&self) -> String {
        let mut contents = self.private_key_pem.trim_end().to_string();
        contents.push('\n');
        contents.push_str(self.certificate_pem.trim_end());
        contents.push('\n');
        contents
    }
}

/// Durable certificate cache keyed by domain
#[derive(Debug, Clone)]
pub struct CertificateStore {
    dir: PathBuf,
}

impl CertificateStore {
    /// Open (and create if needed) the cache directory
    pub fn new<P: AsRef<Path>>(dir: P) -> Result<Self, StoreError> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir)?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&dir, std::fs::Permissions::from_mode(0o700))?;
        }

        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Sanitize domain name for filesystem
    fn sanitize_domain(domain: &str) -> String {
        domain
            .to_ascii_lowercase()
            .replace('*', "wildcard")
            .replace(['/', '\\'], "_")
    }

    fn record_path(&self, domain: &str) -> PathBuf {
        self.dir.join(format!("{}.pem", Self::sanitize_domain(domain)))
    }

    /// Read the record for `domain`, if one is cached
    pub async fn load(&self, domain: &str) -> Result<Option<CertificateRecord>, StoreError> {
        let path = self.record_path(domain);
        let contents = match fs::read_to_string(&path).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let (key_pem, certificate_pem) = split_cache_file(&contents);
        let record = CertificateRecord::from_pem(domain, &certificate_pem, &key_pem)?;
        debug!(domain = %domain, expires = %record.expires_at, "loaded cached certificate");
        Ok(Some(record))
    }

    /// Persist `record`, replacing any previous one atomically
    pub async fn save(&self, record: &CertificateRecord) -> Result<(), StoreError> {
        let path = self.record_path(&record.domain);
        self.write_atomic(&path, record.to_cache_file().as_bytes()).await?;
        info!(domain = %record.domain, path = %path.display(), "stored certificate");
        Ok(())
    }

    /// Serialized ACME account, if one was saved
    pub async fn load_account(&self) -> Result<Option<String>, StoreError> {
        match fs::read_to_string(self.dir.join(ACCOUNT_FILE)).await {
            Ok(contents) => Ok(Some(contents)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn save_account(&self, json: &str) -> Result<(), StoreError> {
        self.write_atomic(&self.dir.join(ACCOUNT_FILE), json.as_bytes())
            .await
    }

    async fn write_atomic(&self, path: &Path, contents: &[u8]) -> Result<(), StoreError> {
        let tmp = self.dir.join(format!(".tmp-{}", Uuid::new_v4()));

        let result = async {
            fs::write(&tmp, contents).await?;
            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                fs::set_permissions(&tmp, std::fs::Permissions::from_mode(0o600)).await?;
            }
            fs::rename(&tmp, path).await
        }
        .await;

        if result.is_err() {
            let _ = fs::remove_file(&tmp).await;
        }
        Ok(result?)
    }
}

/// Separate the private key block from the certificate blocks
fn split_cache_file(contents: &str) -> (String, String) {
    let mut key = String::new();
    let mut certificates = String::new();
    let mut in_key = false;

    for line in contents.lines() {
        if line.starts_with("-----BEGIN ") {
            in_key = line.contains("PRIVATE KEY");
        }
        let target = if in_key { &mut key } else { &mut certificates };
        target.push_str(line);
        target.push('\n');
    }

    (key, certificates)
}
