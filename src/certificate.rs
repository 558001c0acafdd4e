//! Certificate manager
//!
//! Owns the per-domain certificate lifecycle: whitelist enforcement, cache
//! lookup, on-demand issuance during the TLS handshake and background renewal.
//!
//! ```text
//! Unissued -> PendingIssuance -> Valid -> Renewing -> Valid
//!                   |                         |
//!                   +----> IssuanceFailed <---+   (retried on the next attempt)
//! ```
//!
//! At most one issuance or renewal runs per domain: every attempt holds that
//! domain's mutex from the first cache re-check until the store write.

use crate::acme::CertificateIssuer;
use crate::challenge::ChallengeStore;
use crate::config::DomainWhitelist;
use crate::error::{AcmeError, CertError};
use crate::store::{CertificateRecord, CertificateStore};
use crate::tls;
use chrono::{Duration as ChronoDuration, Utc};
use dashmap::DashMap;
use rustls::sign::CertifiedKey;
use rustls::ServerConfig;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex as TokioMutex;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Renew once less than this much validity remains
pub const RENEWAL_MARGIN_DAYS: i64 = 30;

/// How often the background task looks for certificates to renew
pub const RENEWAL_CHECK_INTERVAL: Duration = Duration::from_secs(60 * 60);

/// Lifecycle state of one domain
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DomainState {
    Unissued,
    PendingIssuance,
    Valid,
    Renewing,
    IssuanceFailed,
}

/// A certificate ready to be presented in handshakes
pub struct ManagedCertificate {
    record: CertificateRecord,
    certified_key: Arc<CertifiedKey>,
    tls_config: Arc<ServerConfig>,
}

impl ManagedCertificate {
    fn new(record: CertificateRecord) -> Result<Self, rustls::Error> {
        let certified_key = record.certified_key()?;
        let tls_config = tls::server_config(certified_key.clone())?;
        Ok(Self {
            record,
            certified_key,
            tls_config,
        })
    }

    pub fn record(&self) -> &CertificateRecord {
        &self.record
    }

    pub fn certified_key(&self) -> &Arc<CertifiedKey> {
        &self.certified_key
    }

    pub fn tls_config(&self) -> &Arc<ServerConfig> {
        &self.tls_config
    }
}

/// Certificate manager for the whitelisted domains
pub struct CertificateManager {
    whitelist: DomainWhitelist,
    store: Arc<CertificateStore>,
    issuer: Arc<dyn CertificateIssuer>,
    challenges: Arc<ChallengeStore>,
    active: DashMap<String, Arc<ManagedCertificate>>,
    states: DashMap<String, (DomainState, Instant)>,
    locks: DashMap<String, Arc<TokioMutex<()>>>,
    renewal_margin: ChronoDuration,
}

impl CertificateManager {
    /// Create a new certificate manager
    pub fn new(
        whitelist: DomainWhitelist,
        store: Arc<CertificateStore>,
        issuer: Arc<dyn CertificateIssuer>,
        challenges: Arc<ChallengeStore>,
    ) -> Self {
        Self {
            whitelist,
            store,
            issuer,
            challenges,
            active: DashMap::new(),
            states: DashMap::new(),
            locks: DashMap::new(),
            renewal_margin: ChronoDuration::days(RENEWAL_MARGIN_DAYS),
        }
    }

    pub fn with_renewal_margin(mut self, margin: ChronoDuration) -> Self {
        self.renewal_margin = margin;
        self
    }

    /// Tokens the challenge responder answers from
    pub fn challenges(&self) -> &Arc<ChallengeStore> {
        &self.challenges
    }

    pub fn state(&self, domain: &str) -> DomainState {
        self.states
            .get(&domain.to_ascii_lowercase())
            .map(|s| s.0)
            .unwrap_or(DomainState::Unissued)
    }

    fn set_state(&self, domain: &str, state: DomainState) {
        debug!(domain = %domain, state = ?state, "certificate state change");
        self.states
            .insert(domain.to_string(), (state, Instant::now()));
    }

    /// Normalize the SNI name and check it against the whitelist
    pub fn check_host(&self, server_name: Option<&str>) -> Result<String, CertError> {
        let name = server_name
            .map(|n| n.trim_end_matches('.').to_ascii_lowercase())
            .filter(|n| !n.is_empty())
            .ok_or(CertError::MissingServerName)?;

        if !self.whitelist.contains(&name) {
            return Err(CertError::HostNotAllowed(name));
        }
        Ok(name)
    }

    /// TLS configuration for a handshake that asked for `server_name`
    pub async fn server_config(&self, server_name: Option<&str>) -> Result<Arc<ServerConfig>, CertError> {
        let domain = self.check_host(server_name)?;
        let certificate = self.certificate(&domain).await?;
        Ok(certificate.tls_config.clone())
    }

    /// Current certificate for a whitelisted domain, issuing one if needed
    pub async fn certificate(&self, domain: &str) -> Result<Arc<ManagedCertificate>, CertError> {
        let domain = self.check_host(Some(domain))?;

        if let Some(certificate) = self.cached(&domain) {
            return Ok(certificate);
        }

        let waiting_since = Instant::now();
        let lock = self.lock_for(&domain);
        let _guard = lock.lock().await;

        // Another handshake may have finished issuance while we waited.
        if let Some(certificate) = self.cached(&domain) {
            return Ok(certificate);
        }
        if let Some(state) = self.states.get(&domain) {
            if state.0 == DomainState::IssuanceFailed && state.1 >= waiting_since {
                return Err(CertError::RecentFailure(domain));
            }
        }

        match self.store.load(&domain).await {
            Ok(Some(record)) if !record.is_expired(Utc::now()) => {
                let certificate = Arc::new(ManagedCertificate::new(record)?);
                self.active.insert(domain.clone(), certificate.clone());
                self.set_state(&domain, DomainState::Valid);
                info!(domain = %domain, expires = %certificate.record.expires_at, "using cached certificate");
                return Ok(certificate);
            }
            Ok(Some(_)) => debug!(domain = %domain, "cached certificate expired"),
            Ok(None) => {}
            Err(e) => warn!(domain = %domain, error = %e, "ignoring unreadable cached certificate"),
        }

        self.issue_locked(&domain, DomainState::PendingIssuance).await
    }

    /// Renew `domain` if it is within the renewal margin
    pub async fn renew(&self, domain: &str) -> Result<(), CertError> {
        let domain = self.check_host(Some(domain))?;
        let lock = self.lock_for(&domain);
        let _guard = lock.lock().await;

        if let Some(current) = self.active.get(&domain) {
            if !current.record.needs_renewal(Utc::now(), self.renewal_margin) {
                return Ok(());
            }
        }

        self.issue_locked(&domain, DomainState::Renewing).await?;
        Ok(())
    }

    /// Renew every active certificate that is close to expiry
    pub async fn renew_due(&self) {
        let now = Utc::now();
        let due: Vec<String> = self
            .active
            .iter()
            .filter(|entry| entry.value().record.needs_renewal(now, self.renewal_margin))
            .map(|entry| entry.key().clone())
            .collect();

        for domain in due {
            info!(domain = %domain, "renewing certificate");
            if let Err(e) = self.renew(&domain).await {
                error!(domain = %domain, error = %e, "certificate renewal failed");
            }
        }
    }

    /// Run [`Self::renew_due`] every `interval`
    pub fn spawn_renewal(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let manager = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                manager.renew_due().await;
            }
        })
    }

    fn cached(&self, domain: &str) -> Option<Arc<ManagedCertificate>> {
        self.active
            .get(domain)
            .filter(|c| !c.record.is_expired(Utc::now()))
            .map(|c| c.value().clone())
    }

    fn lock_for(&self, domain: &str) -> Arc<TokioMutex<()>> {
        self.locks
            .entry(domain.to_string())
            .or_insert_with(|| Arc::new(TokioMutex::new(())))
            .clone()
    }

    /// Issue, persist and publish a certificate. Caller holds the domain lock.
    async fn issue_locked(
        &self,
        domain: &str,
        phase: DomainState,
    ) -> Result<Arc<ManagedCertificate>, CertError> {
        self.set_state(domain, phase);

        match self.obtain(domain).await {
            Ok(certificate) => {
                if let Err(e) = self.store.save(&certificate.record).await {
                    warn!(domain = %domain, error = %e, "failed to cache certificate");
                }
                self.active.insert(domain.to_string(), certificate.clone());
                self.set_state(domain, DomainState::Valid);
                info!(domain = %domain, expires = %certificate.record.expires_at, "certificate issued");
                Ok(certificate)
            }
            Err(e) => {
                self.set_state(domain, DomainState::IssuanceFailed);
                error!(domain = %domain, error = %e, "certificate issuance failed");
                Err(e)
            }
        }
    }

    async fn obtain(&self, domain: &str) -> Result<Arc<ManagedCertificate>, CertError> {
        let issuance = |source: AcmeError| CertError::Issuance {
            domain: domain.to_string(),
            source,
        };

        let issued = self
            .issuer
            .issue(domain, &self.challenges)
            .await
            .map_err(issuance)?;
        let record = CertificateRecord::from_pem(domain, &issued.certificate_pem, &issued.private_key_pem)
            .map_err(|e| issuance(AcmeError::Storage(e)))?;

        Ok(Arc::new(ManagedCertificate::new(record)?))
    }
}
