//! ACME issuance built on `instant-acme`
//!
//! [`CertificateIssuer`] is the seam the certificate manager drives; the
//! production implementation, [`AcmeIssuer`], performs one HTTP-01 order per
//! call and publishes challenge tokens through the shared [`ChallengeStore`].

use crate::challenge::ChallengeStore;
use crate::error::AcmeError;
use crate::store::CertificateStore;
use async_trait::async_trait;
use instant_acme::{
    Account, AccountCredentials, AuthorizationStatus, ChallengeType, Identifier, NewAccount,
    NewOrder, Order, OrderStatus,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex as TokioMutex;
use tokio::time::{sleep, Instant};
use tracing::{debug, info, warn};

/// Maximum time to wait for the ACME server to validate challenges
const VALIDATION_TIMEOUT: Duration = Duration::from_secs(120);

/// Maximum time to wait for the certificate after finalizing
const CERTIFICATE_TIMEOUT: Duration = Duration::from_secs(60);

/// PEM material returned by a successful issuance
#[derive(Debug, Clone)]
pub struct IssuedCertificate {
    pub certificate_pem: String,
    pub private_key_pem: String,
}

/// Obtains a certificate for one domain
#[async_trait]
pub trait CertificateIssuer: Send + Sync {
    async fn issue(
        &self,
        domain: &str,
        challenges: &ChallengeStore,
    ) -> Result<IssuedCertificate, AcmeError>;
}

/// Account credentials together with the directory they belong to
#[derive(Serialize, Deserialize)]
struct CachedAccount {
    directory_url: String,
    credentials: AccountCredentials,
}

/// Outcome of reading the persisted account file
enum CachedAccountLookup {
    Restored(AccountCredentials),
    OtherDirectory(String),
    Unreadable(String),
}

fn parse_cached_account(json: &str, directory_url: &str) -> CachedAccountLookup {
    let value: serde_json::Value = match serde_json::from_str(json) {
        Ok(value) => value,
        Err(e) => return CachedAccountLookup::Unreadable(e.to_string()),
    };

    match value.get("directory_url").and_then(|v| v.as_str()) {
        Some(url) if url == directory_url => {}
        Some(url) => return CachedAccountLookup::OtherDirectory(url.to_string()),
        None => return CachedAccountLookup::Unreadable("missing directory_url".to_string()),
    }

    match serde_json::from_value::<CachedAccount>(value) {
        Ok(saved) => CachedAccountLookup::Restored(saved.credentials),
        Err(e) => CachedAccountLookup::Unreadable(e.to_string()),
    }
}

/// Doubling poll delay with an overall deadline
struct Backoff {
    delay: Duration,
    max_delay: Duration,
    deadline: Instant,
}

impl Backoff {
    fn new(initial: Duration, max_delay: Duration, timeout: Duration) -> Self {
        Self {
            delay: initial,
            max_delay,
            deadline: Instant::now() + timeout,
        }
    }

    /// Sleep for the current delay; false once the deadline has passed
    async fn wait(&mut self) -> bool {
        if Instant::now() >= self.deadline {
            return false;
        }
        sleep(self.delay).await;
        self.delay = (self.delay * 2).min(self.max_delay);
        true
    }
}

/// Issuer talking to a real ACME directory
pub struct AcmeIssuer {
    directory_url: String,
    contact: Option<String>,
    store: Arc<CertificateStore>,
    account: TokioMutex<Option<Account>>,
}

impl AcmeIssuer {
    pub fn new(directory_url: String, contact: Option<String>, store: Arc<CertificateStore>) -> Self {
        Self {
            directory_url,
            contact,
            store,
            account: TokioMutex::new(None),
        }
    }

    /// Load the persisted account or register a new one
    async fn account(&self) -> Result<Account, AcmeError> {
        let mut cached = self.account.lock().await;
        if let Some(account) = cached.as_ref() {
            return Ok(account.clone());
        }

        if let Some(json) = self.store.load_account().await? {
            match parse_cached_account(&json, &self.directory_url) {
                CachedAccountLookup::Restored(credentials) => {
                    let account = Account::from_credentials(credentials).await?;
                    debug!(directory = %self.directory_url, "restored ACME account");
                    *cached = Some(account.clone());
                    return Ok(account);
                }
                CachedAccountLookup::OtherDirectory(other) => {
                    info!(directory = %self.directory_url, cached = %other, "cached ACME account belongs to another directory")
                }
                CachedAccountLookup::Unreadable(e) => warn!(error = %e, "ignoring unreadable ACME account cache"),
            }
        }

        let contact: Vec<String> = self
            .contact
            .iter()
            .map(|email| format!("mailto:{}", email))
            .collect();
        let contact_refs: Vec<&str> = contact.iter().map(String::as_str).collect();

        info!(directory = %self.directory_url, "registering ACME account");
        let (account, credentials) = Account::create(
            &NewAccount {
                contact: &contact_refs,
                terms_of_service_agreed: true,
                only_return_existing: false,
            },
            &self.directory_url,
            None,
        )
        .await?;

        let saved = CachedAccount {
            directory_url: self.directory_url.clone(),
            credentials,
        };
        self.store
            .save_account(&serde_json::to_string_pretty(&saved).map_err(crate::error::StoreError::from)?)
            .await?;

        *cached = Some(account.clone());
        Ok(account)
    }

    async fn run_order(
        &self,
        domain: &str,
        challenges: &ChallengeStore,
        tokens: &mut Vec<String>,
    ) -> Result<IssuedCertificate, AcmeError> {
        let account = self.account().await?;

        let identifiers = [Identifier::Dns(domain.to_string())];
        let mut order = account
            .new_order(&NewOrder {
                identifiers: &identifiers,
            })
            .await?;
        debug!(domain = %domain, "created ACME order");

        let authorizations = order.authorizations().await?;
        for authorization in authorizations {
            if matches!(authorization.status, AuthorizationStatus::Valid) {
                continue;
            }

            let challenge = authorization
                .challenges
                .iter()
                .find(|c| matches!(c.r#type, ChallengeType::Http01))
                .ok_or_else(|| AcmeError::NoHttp01Challenge(domain.to_string()))?;

            let key_authorization = order.key_authorization(challenge);
            challenges.insert(&challenge.token, key_authorization.as_str());
            tokens.push(challenge.token.clone());

            debug!(domain = %domain, token = %challenge.token, "HTTP-01 challenge ready");
            order.set_challenge_ready(&challenge.url).await?;
        }

        wait_for_ready(domain, &mut order).await?;

        let mut params = rcgen::CertificateParams::new(vec![domain.to_string()]);
        params.distinguished_name = rcgen::DistinguishedName::new();
        params.alg = &rcgen::PKCS_ECDSA_P256_SHA256;
        let certificate = rcgen::Certificate::from_params(params)?;
        let csr = certificate.serialize_request_der()?;

        if !matches!(order.state().status, OrderStatus::Valid) {
            order.finalize(&csr).await?;
        }

        let certificate_pem = fetch_certificate(domain, &mut order).await?;

        Ok(IssuedCertificate {
            certificate_pem,
            private_key_pem: certificate.serialize_private_key_pem(),
        })
    }
}

#[async_trait]
impl CertificateIssuer for AcmeIssuer {
    async fn issue(
        &self,
        domain: &str,
        challenges: &ChallengeStore,
    ) -> Result<IssuedCertificate, AcmeError> {
        info!(domain = %domain, "starting ACME issuance");

        let mut tokens = Vec::new();
        let result = self.run_order(domain, challenges, &mut tokens).await;

        for token in &tokens {
            challenges.remove(token);
        }

        match &result {
            Ok(_) => info!(domain = %domain, "ACME issuance complete"),
            Err(e) => warn!(domain = %domain, error = %e, "ACME issuance failed"),
        }
        result
    }
}

async fn wait_for_ready(domain: &str, order: &mut Order) -> Result<(), AcmeError> {
    let mut backoff = Backoff::new(Duration::from_millis(250), Duration::from_secs(8), VALIDATION_TIMEOUT);

    while backoff.wait().await {
        let state = order.refresh().await?;
        debug!(domain = %domain, status = ?state.status, "polled order status");

        match state.status {
            OrderStatus::Ready | OrderStatus::Valid => return Ok(()),
            OrderStatus::Invalid => {
                let reason = state
                    .error
                    .as_ref()
                    .map(|e| format!("{:?}", e))
                    .unwrap_or_else(|| "challenge validation failed".to_string());
                return Err(AcmeError::InvalidOrder {
                    domain: domain.to_string(),
                    reason,
                });
            }
            OrderStatus::Pending | OrderStatus::Processing => {}
        }
    }

    Err(AcmeError::Timeout(format!(
        "validation of {} did not complete; check that http://{}/.well-known/acme-challenge/ reaches this server",
        domain, domain
    )))
}

async fn fetch_certificate(domain: &str, order: &mut Order) -> Result<String, AcmeError> {
    let mut backoff = Backoff::new(Duration::from_secs(1), Duration::from_secs(1), CERTIFICATE_TIMEOUT);

    loop {
        if let Some(chain) = order.certificate().await? {
            return Ok(chain);
        }
        debug!(domain = %domain, "certificate not ready yet");

        if !backoff.wait().await {
            return Err(AcmeError::Timeout(format!(
                "certificate for {} was not issued in time",
                domain
            )));
        }
    }
}
