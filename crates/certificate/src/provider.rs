//! Certificate custody: acquisition, validation, caching and signing.

use chrono::Utc;
use nfe_core::error::{NfeError, NfeResult};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

use crate::chain::{evaluate_chain, ChainPolicy, TrustAnchors};
use crate::handle::CertificateHandle;
use crate::material::SigningCertificate;
use crate::source::CertificateSource;
use crate::xmldsig::XmlSigner;

const ICP_BRASIL_MARKER: &str = "ICP-Brasil";

#[derive(Debug, Clone)]
pub struct ProviderSettings {
    pub cache_ttl: Duration,
    pub production: bool,
    /// Honoured only when built with the `relaxed-validation` feature.
    pub relax_validation: bool,
    pub trust_anchors: TrustAnchors,
    pub signer: XmlSigner,
}

impl Default for ProviderSettings {
    fn default() -> Self {
        Self {
            cache_ttl: Duration::from_secs(3600),
            production: true,
            relax_validation: false,
            trust_anchors: TrustAnchors::default(),
            signer: XmlSigner::default(),
        }
    }
}

struct CacheSlot {
    certificate: Arc<SigningCertificate>,
    loaded_at: Instant,
}

pub struct CertificateProvider {
    source: Arc<dyn CertificateSource>,
    policy: ChainPolicy,
    production: bool,
    anchors: TrustAnchors,
    cache_ttl: Duration,
    signer: XmlSigner,
    cache: Mutex<Option<CacheSlot>>,
}

fn relaxation_allowed(requested: bool) -> bool {
    if !requested {
        return false;
    }
    if cfg!(feature = "relaxed-validation") {
        tracing::warn!("certificate validation relaxed to non-production rules");
        true
    } else {
        tracing::error!(
            "relax_validation is set but this build lacks the relaxed-validation feature; ignoring"
        );
        false
    }
}

impl CertificateProvider {
    pub fn new(source: Arc<dyn CertificateSource>, settings: ProviderSettings) -> Self {
        let relaxed = settings.production && relaxation_allowed(settings.relax_validation);
        Self {
            source,
            policy: ChainPolicy {
                production: settings.production && !relaxed,
            },
            production: settings.production,
            anchors: settings.trust_anchors,
            cache_ttl: settings.cache_ttl,
            signer: settings.signer,
            cache: Mutex::new(None),
        }
    }

    pub fn source_name(&self) -> &'static str {
        self.source.name()
    }

    /// Runs the internal checks, in order: validity window, private key, chain.
    fn check(&self, cert: &SigningCertificate) -> Result<(), String> {
        let handle = cert.handle();
        let now = Utc::now();
        if !handle.is_valid_at(now) {
            return Err(format!(
                "certificate {} is outside its validity window ({} to {})",
                handle.thumbprint, handle.not_before, handle.not_after
            ));
        }
        if !cert.has_private_key() {
            return Err(format!("certificate {} has no private key", handle.thumbprint));
        }
        if !cert.key_matches_certificate() {
            return Err(format!(
                "private key does not belong to certificate {}",
                handle.thumbprint
            ));
        }

        let statuses = evaluate_chain(cert.certificate_der(), cert.chain_der(), &self.anchors);
        let violations = self.policy.violations(&statuses);
        if !violations.is_empty() {
            let reasons: Vec<String> = violations.iter().map(ToString::to_string).collect();
            return Err(format!("chain validation failed: {}", reasons.join("; ")));
        }
        for status in statuses {
            tracing::debug!(%status, "tolerated chain status");
        }
        tracing::debug!("revocation status not checked (no online CRL/OCSP)");

        if self.production && !handle.issuer.contains(ICP_BRASIL_MARKER) {
            tracing::warn!(
                issuer = %handle.issuer,
                "certificate issuer is not an ICP-Brasil authority"
            );
        }
        if handle.is_expiring_soon_at(now) {
            tracing::warn!(
                thumbprint = %handle.thumbprint,
                days = handle.days_until_expiry_at(now),
                "certificate expires soon"
            );
        }
        Ok(())
    }

    /// Current certificate. Served from cache while younger than the TTL and still valid;
    /// otherwise reloaded from the source. Two consecutive validation failures give
    /// `CertificateUnavailable`.
    pub async fn acquire(&self) -> NfeResult<Arc<SigningCertificate>> {
        let mut slot = self.cache.lock().await;

        if let Some(cached) = slot.as_ref() {
            if cached.loaded_at.elapsed() < self.cache_ttl {
                match self.check(&cached.certificate) {
                    Ok(()) => return Ok(cached.certificate.clone()),
                    Err(reason) => {
                        tracing::warn!(%reason, "cached certificate failed validation; reloading")
                    }
                }
            }
        }
        *slot = None;

        let mut last_failure = String::new();
        for attempt in 1..=2 {
            let cert = self.source.load().await?;
            match self.check(&cert) {
                Ok(()) => {
                    let certificate = Arc::new(cert);
                    tracing::info!(
                        source = self.source.name(),
                        thumbprint = %certificate.handle().thumbprint,
                        not_after = %certificate.handle().not_after,
                        "certificate acquired"
                    );
                    *slot = Some(CacheSlot {
                        certificate: certificate.clone(),
                        loaded_at: Instant::now(),
                    });
                    return Ok(certificate);
                }
                Err(reason) => {
                    tracing::warn!(attempt, %reason, "certificate failed validation");
                    last_failure = reason;
                }
            }
        }

        Err(NfeError::CertificateUnavailable(last_failure))
    }

    /// Re-runs validation on the cached certificate, acquiring one if none is cached.
    /// Never fails.
    pub async fn validate(&self) -> bool {
        let cached = self
            .cache
            .lock()
            .await
            .as_ref()
            .map(|slot| slot.certificate.clone());

        match cached {
            Some(cert) => match self.check(&cert) {
                Ok(()) => true,
                Err(reason) => {
                    tracing::warn!(%reason, "certificate validation failed");
                    false
                }
            },
            None => match self.acquire().await {
                Ok(_) => true,
                Err(e) => {
                    tracing::warn!(error = %e, "certificate validation failed");
                    false
                }
            },
        }
    }

    pub async fn invalidate_cache(&self) {
        *self.cache.lock().await = None;
        tracing::info!("certificate cache invalidated");
    }

    /// Drops the cached certificate and loads a fresh one.
    pub async fn renew(&self) -> NfeResult<CertificateHandle> {
        self.invalidate_cache().await;
        Ok(self.acquire().await?.handle().clone())
    }

    pub async fn handle(&self) -> NfeResult<CertificateHandle> {
        Ok(self.acquire().await?.handle().clone())
    }

    pub async fn thumbprint(&self) -> NfeResult<String> {
        Ok(self.acquire().await?.handle().thumbprint.clone())
    }

    /// Signs `document` with the current certificate.
    pub async fn sign(&self, document: &str) -> NfeResult<Vec<u8>> {
        if document.trim().is_empty() {
            return Err(NfeError::InvalidArgument("document to sign is empty".into()));
        }
        let cert = self.acquire().await?;
        if !cert.has_private_key() {
            return Err(NfeError::SigningFailed("certificate has no private key".into()));
        }
        self.signer.sign(document, &cert)
    }

    pub fn verify(&self, signed: &str) -> NfeResult<crate::xmldsig::VerifiedSignature> {
        self.signer.verify(signed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use crate::self_signed;

    /// Hands out clones of one pre-generated certificate and counts loads.
    struct FixedSource {
        der: Vec<u8>,
        key_pem: String,
        with_key: bool,
        loads: AtomicUsize,
    }

    impl FixedSource {
        fn new(with_key: bool) -> Self {
            let cert = self_signed::generate("CN=Provider Test", 30).unwrap();
            Self {
                der: cert.certificate_der().to_vec(),
                key_pem: cert.private_key_pem().unwrap(),
                with_key,
                loads: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl CertificateSource for FixedSource {
        fn name(&self) -> &'static str {
            "fixed"
        }

        async fn load(&self) -> NfeResult<SigningCertificate> {
            use rsa::pkcs8::DecodePrivateKey;
            self.loads.fetch_add(1, Ordering::SeqCst);
            let key = if self.with_key {
                Some(rsa::RsaPrivateKey::from_pkcs8_pem(&self.key_pem).unwrap())
            } else {
                None
            };
            SigningCertificate::from_parts(self.der.clone(), key, Vec::new())
        }
    }

    fn non_production() -> ProviderSettings {
        ProviderSettings {
            production: false,
            ..ProviderSettings::default()
        }
    }

    #[tokio::test]
    async fn cached_certificate_is_reused_until_invalidated() {
        let source = Arc::new(FixedSource::new(true));
        let provider = CertificateProvider::new(source.clone(), non_production());

        let a = provider.thumbprint().await.unwrap();
        let b = provider.thumbprint().await.unwrap();
        assert_eq!(a, b);
        assert_eq!(source.loads.load(Ordering::SeqCst), 1);

        provider.invalidate_cache().await;
        provider.acquire().await.unwrap();
        assert_eq!(source.loads.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn expired_cache_entry_is_reloaded() {
        let source = Arc::new(FixedSource::new(true));
        let settings = ProviderSettings {
            cache_ttl: Duration::ZERO,
            ..non_production()
        };
        let provider = CertificateProvider::new(source.clone(), settings);
        provider.acquire().await.unwrap();
        provider.acquire().await.unwrap();
        assert_eq!(source.loads.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn concurrent_acquires_share_one_load() {
        let source = Arc::new(FixedSource::new(true));
        let provider = Arc::new(CertificateProvider::new(source.clone(), non_production()));

        let mut tasks = tokio::task::JoinSet::new();
        for _ in 0..8 {
            let p = provider.clone();
            tasks.spawn(async move { p.thumbprint().await });
        }
        while let Some(res) = tasks.join_next().await {
            res.unwrap().unwrap();
        }
        assert_eq!(source.loads.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn missing_private_key_fails_twice_then_gives_up() {
        let source = Arc::new(FixedSource::new(false));
        let provider = CertificateProvider::new(source.clone(), non_production());

        let err = provider.acquire().await.unwrap_err();
        assert!(matches!(err, NfeError::CertificateUnavailable(_)));
        assert_eq!(source.loads.load(Ordering::SeqCst), 2);
        assert!(!provider.validate().await);
    }

    #[tokio::test]
    async fn production_rejects_untrusted_self_signed_chain() {
        let source = Arc::new(FixedSource::new(true));
        let provider = CertificateProvider::new(source, ProviderSettings::default());
        let err = provider.acquire().await.unwrap_err();
        assert!(err.to_string().contains("untrusted root"), "{err}");
    }

    #[tokio::test]
    async fn production_accepts_anchored_root() {
        let source = Arc::new(FixedSource::new(true));
        let settings = ProviderSettings {
            trust_anchors: TrustAnchors::new(vec![source.der.clone()]),
            ..ProviderSettings::default()
        };
        let provider = CertificateProvider::new(source, settings);
        assert!(provider.validate().await);
    }

    #[tokio::test]
    async fn sign_rejects_empty_documents() {
        let provider = CertificateProvider::new(Arc::new(FixedSource::new(true)), non_production());
        assert!(matches!(
            provider.sign("").await,
            Err(NfeError::InvalidArgument(_))
        ));
        let signed = provider.sign("<a>1</a>").await.unwrap();
        let signed = String::from_utf8(signed).unwrap();
        assert!(signed.contains("<Signature xmlns=\"http://www.w3.org/2000/09/xmldsig#\">"));
        assert!(provider.verify(&signed).is_ok());
    }

    #[tokio::test]
    async fn relax_flag_is_ignored_without_feature() {
        let source = Arc::new(FixedSource::new(true));
        let settings = ProviderSettings {
            relax_validation: true,
            ..ProviderSettings::default()
        };
        let provider = CertificateProvider::new(source, settings);
        assert_eq!(provider.validate().await, cfg!(feature = "relaxed-validation"));
    }
}
