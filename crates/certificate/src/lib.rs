pub mod c14n;
pub mod chain;
pub mod handle;
pub mod material;
pub mod provider;
pub mod self_signed;
pub mod source;
pub mod xmldsig;

use anyhow::{Context, Result};
use config::{AppConfig, SecretStore, SignatureReference};
use std::sync::Arc;
use std::time::Duration;

pub use chain::{ChainPolicy, ChainStatus, TrustAnchors};
pub use handle::CertificateHandle;
pub use material::SigningCertificate;
pub use provider::{CertificateProvider, ProviderSettings};
pub use source::{select_source, CertificateSource, SecretStoreSource, SelfSignedSource};
pub use xmldsig::{ReferenceScope, VerifiedSignature, XmlSigner};

/// Wires a provider from configuration: source selection, trust anchors, cache TTL.
pub fn provider_from_config(
    cfg: &AppConfig,
    store: Arc<dyn SecretStore>,
) -> Result<CertificateProvider> {
    let scope = match cfg.certificate.reference {
        SignatureReference::WholeDocument => ReferenceScope::WholeDocument,
        SignatureReference::IdentifiedElement => ReferenceScope::IdentifiedElement,
    };
    let source = select_source(cfg, store).context("Failed to select certificate source")?;
    let trust_anchors = TrustAnchors::from_pem_files(&cfg.certificate.trust_anchors)?;

    tracing::info!(
        source = source.name(),
        anchors = trust_anchors.len(),
        production = cfg.deployment.is_production(),
        "certificate provider configured"
    );

    Ok(CertificateProvider::new(
        source,
        ProviderSettings {
            cache_ttl: Duration::from_secs(cfg.certificate.cache_ttl_secs),
            production: cfg.deployment.is_production(),
            relax_validation: cfg.certificate.relax_validation,
            trust_anchors,
            signer: XmlSigner::new(scope),
        },
    ))
}
