use async_trait::async_trait;
use config::{AppConfig, CertificateSourceKind, Deployment, SecretStore, SecretValue};
use nfe_core::error::{NfeError, NfeResult};
use std::sync::Arc;

use crate::material::SigningCertificate;
use crate::self_signed;

/// Where certificate material comes from. Chosen once, at construction.
#[async_trait]
pub trait CertificateSource: Send + Sync {
    fn name(&self) -> &'static str;
    async fn load(&self) -> NfeResult<SigningCertificate>;
}

/// PKCS#12 bundle plus password kept in a secret store.
pub struct SecretStoreSource {
    store: Arc<dyn SecretStore>,
    pfx_secret: String,
    password_secret: String,
}

impl SecretStoreSource {
    pub fn new(
        store: Arc<dyn SecretStore>,
        pfx_secret: impl Into<String>,
        password_secret: impl Into<String>,
    ) -> Self {
        Self {
            store,
            pfx_secret: pfx_secret.into(),
            password_secret: password_secret.into(),
        }
    }

    async fn fetch(&self, name: &str) -> NfeResult<SecretValue> {
        let value = self.store.get_secret(name).await.map_err(|e| {
            NfeError::CertificateUnavailable(format!("secret store lookup for {name} failed: {e:#}"))
        })?;
        match value {
            Some(v) if !v.is_empty() => Ok(v),
            _ => Err(NfeError::CertificateUnavailable(format!(
                "secret {name} is missing or empty"
            ))),
        }
    }
}

#[async_trait]
impl CertificateSource for SecretStoreSource {
    fn name(&self) -> &'static str {
        "secret_store"
    }

    async fn load(&self) -> NfeResult<SigningCertificate> {
        let pfx = self.fetch(&self.pfx_secret).await?;
        let password = self.fetch(&self.password_secret).await?;
        let password = password.as_text().ok_or_else(|| {
            NfeError::CertificateUnavailable(format!(
                "secret {} is not valid UTF-8",
                self.password_secret
            ))
        })?;

        let cert = SigningCertificate::from_pfx(pfx.as_bytes(), password)?;
        tracing::info!(
            thumbprint = %cert.handle().thumbprint,
            subject = %cert.handle().subject,
            "loaded certificate from secret store"
        );
        Ok(cert)
    }
}

/// Generates a fresh self-signed certificate on every load. Never available in production.
#[derive(Debug)]
pub struct SelfSignedSource {
    subject: String,
    validity_days: i64,
}

impl SelfSignedSource {
    pub fn new(subject: impl Into<String>, deployment: Deployment) -> NfeResult<Self> {
        if deployment.is_production() {
            return Err(NfeError::CertificateUnavailable(
                "self-signed certificates are not available in a production deployment".into(),
            ));
        }
        let subject = subject.into();
        self_signed::parse_subject(&subject)?;
        Ok(Self {
            subject,
            validity_days: self_signed::DEFAULT_VALIDITY_DAYS,
        })
    }
}

#[async_trait]
impl CertificateSource for SelfSignedSource {
    fn name(&self) -> &'static str {
        "self_signed"
    }

    async fn load(&self) -> NfeResult<SigningCertificate> {
        let subject = self.subject.clone();
        let days = self.validity_days;
        let cert = tokio::task::spawn_blocking(move || self_signed::generate(&subject, days))
            .await
            .map_err(|e| NfeError::InternalError(format!("certificate generation task: {e}")))??;
        tracing::warn!(
            thumbprint = %cert.handle().thumbprint,
            "generated self-signed certificate; documents signed with it have no fiscal value"
        );
        Ok(cert)
    }
}

/// Builds the configured source. There is no fallback: an unset source is an error.
pub fn select_source(
    cfg: &AppConfig,
    store: Arc<dyn SecretStore>,
) -> NfeResult<Arc<dyn CertificateSource>> {
    match cfg.certificate.source {
        CertificateSourceKind::Unconfigured => Err(NfeError::CertificateUnavailable(
            "certificate.source is not configured".into(),
        )),
        CertificateSourceKind::SecretStore => Ok(Arc::new(SecretStoreSource::new(
            store,
            cfg.certificate.pfx_secret.clone(),
            cfg.certificate.password_secret.clone(),
        ))),
        CertificateSourceKind::SelfSigned => Ok(Arc::new(SelfSignedSource::new(
            cfg.certificate.self_signed_subject.clone(),
            cfg.deployment,
        )?)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use config::MemorySecretStore;

    #[test]
    fn self_signed_is_refused_in_production() {
        assert!(SelfSignedSource::new("CN=X", Deployment::Production).is_err());
        assert!(SelfSignedSource::new("CN=X", Deployment::NonProduction).is_ok());
    }

    #[test]
    fn unconfigured_source_is_an_error() {
        let cfg = AppConfig::default();
        let store: Arc<dyn SecretStore> = Arc::new(MemorySecretStore::new());
        assert!(matches!(
            select_source(&cfg, store),
            Err(NfeError::CertificateUnavailable(_))
        ));
    }

    #[test]
    fn self_signed_selection_respects_deployment() {
        let mut cfg = AppConfig::default();
        cfg.certificate.source = CertificateSourceKind::SelfSigned;
        let store: Arc<dyn SecretStore> = Arc::new(MemorySecretStore::new());
        assert!(select_source(&cfg, store.clone()).is_err());

        cfg.deployment = Deployment::NonProduction;
        let source = select_source(&cfg, store).unwrap();
        assert_eq!(source.name(), "self_signed");
    }

    #[tokio::test]
    async fn missing_password_is_unavailable() {
        let store = MemorySecretStore::new();
        store.insert("pfx", SecretValue::Binary(vec![1, 2, 3]));
        let source = SecretStoreSource::new(Arc::new(store), "pfx", "pwd");
        let err = source.load().await.unwrap_err();
        assert!(err.to_string().contains("pwd"), "{err}");
    }

    #[tokio::test]
    async fn empty_pfx_is_unavailable() {
        let store = MemorySecretStore::new();
        store.insert("pfx", SecretValue::Binary(Vec::new()));
        store.insert("pwd", SecretValue::Text("secret".into()));
        let source = SecretStoreSource::new(Arc::new(store), "pfx", "pwd");
        assert!(matches!(
            source.load().await,
            Err(NfeError::CertificateUnavailable(_))
        ));
    }
}
