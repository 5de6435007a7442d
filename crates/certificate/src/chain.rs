//! Offline chain building against bundled intermediates and configured trust anchors.

use anyhow::{Context, Result};
use chrono::Utc;
use std::fmt;
use std::path::Path;
use x509_parser::pem::Pem;
use x509_parser::prelude::{FromDer, X509Certificate};

const MAX_DEPTH: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChainStatus {
    NotTimeValid,
    NotSignatureValid,
    UntrustedRoot,
    PartialChain,
    Malformed,
}

impl fmt::Display for ChainStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ChainStatus::NotTimeValid => "a certificate in the chain is outside its validity",
            ChainStatus::NotSignatureValid => "a chain signature does not verify",
            ChainStatus::UntrustedRoot => "the chain ends in an untrusted root",
            ChainStatus::PartialChain => "the chain could not be completed",
            ChainStatus::Malformed => "a certificate in the chain is malformed",
        };
        f.write_str(s)
    }
}

/// Which chain statuses are tolerated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChainPolicy {
    pub production: bool,
}

impl ChainPolicy {
    pub fn acceptable(&self, status: ChainStatus) -> bool {
        !self.production
            && matches!(status, ChainStatus::UntrustedRoot | ChainStatus::PartialChain)
    }

    pub fn violations(&self, statuses: &[ChainStatus]) -> Vec<ChainStatus> {
        statuses
            .iter()
            .copied()
            .filter(|s| !self.acceptable(*s))
            .collect()
    }
}

/// DER-encoded root certificates considered trusted.
#[derive(Debug, Clone, Default)]
pub struct TrustAnchors {
    roots: Vec<Vec<u8>>,
}

impl TrustAnchors {
    pub fn new(roots: Vec<Vec<u8>>) -> Self {
        Self { roots }
    }

    /// Loads every CERTIFICATE block from each PEM file.
    pub fn from_pem_files<P: AsRef<Path>>(paths: &[P]) -> Result<Self> {
        let mut roots = Vec::new();
        for path in paths {
            let path = path.as_ref();
            let data = std::fs::read(path)
                .with_context(|| format!("Failed to read trust anchor {}", path.display()))?;
            for pem in Pem::iter_from_buffer(&data) {
                let pem =
                    pem.with_context(|| format!("Invalid PEM in {}", path.display()))?;
                if pem.label == "CERTIFICATE" {
                    roots.push(pem.contents);
                }
            }
        }
        tracing::debug!(count = roots.len(), "loaded trust anchors");
        Ok(Self { roots })
    }

    pub fn len(&self) -> usize {
        self.roots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.roots.is_empty()
    }

    fn contains(&self, der: &[u8]) -> bool {
        self.roots.iter().any(|r| r.as_slice() == der)
    }
}

/// Walks issuer links from `leaf` through `intermediates` and `anchors`, collecting every
/// problem found. An empty result means the chain ends in a trusted root.
pub fn evaluate_chain(
    leaf: &[u8],
    intermediates: &[Vec<u8>],
    anchors: &TrustAnchors,
) -> Vec<ChainStatus> {
    let mut statuses = Vec::new();
    let push = |s: ChainStatus, statuses: &mut Vec<ChainStatus>| {
        if !statuses.contains(&s) {
            statuses.push(s);
        }
    };

    let pool: Vec<&[u8]> = intermediates
        .iter()
        .chain(anchors.roots.iter())
        .map(Vec::as_slice)
        .collect();
    let now = Utc::now().timestamp();

    let mut current_der = leaf;
    for _ in 0..MAX_DEPTH {
        let current = match X509Certificate::from_der(current_der) {
            Ok((_, c)) => c,
            Err(_) => {
                push(ChainStatus::Malformed, &mut statuses);
                return statuses;
            }
        };

        let validity = current.validity();
        if now < validity.not_before.timestamp() || now > validity.not_after.timestamp() {
            push(ChainStatus::NotTimeValid, &mut statuses);
        }

        if current.subject().as_raw() == current.issuer().as_raw() {
            if current.verify_signature(None).is_err() {
                push(ChainStatus::NotSignatureValid, &mut statuses);
            }
            if !anchors.contains(current_der) {
                push(ChainStatus::UntrustedRoot, &mut statuses);
            }
            return statuses;
        }

        let issuer = pool.iter().copied().find_map(|der| {
            X509Certificate::from_der(der)
                .ok()
                .filter(|(_, c)| c.subject().as_raw() == current.issuer().as_raw())
                .map(|(_, c)| (der, c))
        });

        match issuer {
            Some((issuer_der, issuer_cert)) => {
                if current
                    .verify_signature(Some(issuer_cert.public_key()))
                    .is_err()
                {
                    push(ChainStatus::NotSignatureValid, &mut statuses);
                }
                if anchors.contains(issuer_der) {
                    let v = issuer_cert.validity();
                    if now < v.not_before.timestamp() || now > v.not_after.timestamp() {
                        push(ChainStatus::NotTimeValid, &mut statuses);
                    }
                    return statuses;
                }
                current_der = issuer_der;
            }
            None => {
                push(ChainStatus::PartialChain, &mut statuses);
                return statuses;
            }
        }
    }

    push(ChainStatus::PartialChain, &mut statuses);
    statuses
}
