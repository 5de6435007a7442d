//! Certificate plus private key, loaded from PKCS#12 or assembled from DER parts.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use chrono::{DateTime, TimeZone, Utc};
use nfe_core::error::{NfeError, NfeResult};
use rsa::pkcs1v15::{Signature, SigningKey, VerifyingKey};
use rsa::pkcs8::{DecodePrivateKey, DecodePublicKey, EncodePrivateKey, LineEnding};
use rsa::signature::{SignatureEncoding, Signer, Verifier};
use rsa::{RsaPrivateKey, RsaPublicKey};
use sha2::{Digest, Sha256};
use std::fmt;
use x509_parser::prelude::{FromDer, X509Certificate};

use crate::handle::CertificateHandle;

fn unavailable(msg: impl fmt::Display) -> NfeError {
    NfeError::CertificateUnavailable(msg.to_string())
}

fn asn1_time(ts: i64) -> NfeResult<DateTime<Utc>> {
    Utc.timestamp_opt(ts, 0)
        .single()
        .ok_or_else(|| unavailable(format!("certificate timestamp {ts} out of range")))
}

pub fn thumbprint(der: &[u8]) -> String {
    hex::encode_upper(Sha256::digest(der))
}

/// Reads the public attributes of a DER certificate.
pub fn describe(der: &[u8]) -> NfeResult<CertificateHandle> {
    let (_, cert) = X509Certificate::from_der(der)
        .map_err(|e| unavailable(format!("unreadable X.509 certificate: {e}")))?;
    let validity = cert.validity();

    Ok(CertificateHandle {
        thumbprint: thumbprint(der),
        subject: cert.subject().to_string(),
        issuer: cert.issuer().to_string(),
        not_before: asn1_time(validity.not_before.timestamp())?,
        not_after: asn1_time(validity.not_after.timestamp())?,
        serial_number: hex::encode_upper(cert.raw_serial()),
    })
}

pub fn public_key_of(der: &[u8]) -> NfeResult<RsaPublicKey> {
    let (_, cert) = X509Certificate::from_der(der)
        .map_err(|e| unavailable(format!("unreadable X.509 certificate: {e}")))?;
    RsaPublicKey::from_public_key_der(cert.public_key().raw)
        .map_err(|e| unavailable(format!("certificate key is not RSA: {e}")))
}

pub fn pem_encode(label: &str, der: &[u8]) -> String {
    let b64 = STANDARD.encode(der);
    let mut out = format!("-----BEGIN {label}-----\n");
    for line in b64.as_bytes().chunks(64) {
        out.push_str(&String::from_utf8_lossy(line));
        out.push('\n');
    }
    out.push_str(&format!("-----END {label}-----\n"));
    out
}

/// Signing certificate held by the provider. The private key never leaves this type
/// except through explicit export.
pub struct SigningCertificate {
    handle: CertificateHandle,
    certificate_der: Vec<u8>,
    chain_der: Vec<Vec<u8>>,
    private_key: Option<RsaPrivateKey>,
}

impl fmt::Debug for SigningCertificate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SigningCertificate")
            .field("handle", &self.handle)
            .field("chain_len", &self.chain_der.len())
            .field("has_private_key", &self.private_key.is_some())
            .finish()
    }
}

impl SigningCertificate {
    pub fn from_parts(
        certificate_der: Vec<u8>,
        private_key: Option<RsaPrivateKey>,
        chain_der: Vec<Vec<u8>>,
    ) -> NfeResult<Self> {
        let handle = describe(&certificate_der)?;
        Ok(Self {
            handle,
            certificate_der,
            chain_der,
            private_key,
        })
    }

    /// Opens a PKCS#12 (PFX) bundle. The certificate whose public key matches the bundled
    /// private key becomes the signing certificate; the rest are kept as chain candidates.
    pub fn from_pfx(pfx: &[u8], password: &str) -> NfeResult<Self> {
        let bundle =
            p12::PFX::parse(pfx).map_err(|e| unavailable(format!("invalid PFX data: {e:?}")))?;
        if !bundle.verify_mac(password) {
            return Err(unavailable("PFX password is incorrect"));
        }

        let keys = bundle
            .key_bags(password)
            .map_err(|e| unavailable(format!("cannot decrypt PFX key: {e:?}")))?;
        let certs = bundle
            .cert_x509_bags(password)
            .map_err(|e| unavailable(format!("cannot decrypt PFX certificates: {e:?}")))?;
        if certs.is_empty() {
            return Err(unavailable("PFX contains no certificate"));
        }

        let private_key = match keys.first() {
            Some(der) => Some(
                RsaPrivateKey::from_pkcs8_der(der)
                    .map_err(|e| unavailable(format!("PFX key is not an RSA PKCS#8 key: {e}")))?,
            ),
            None => None,
        };

        let leaf_index = private_key
            .as_ref()
            .and_then(|key| {
                let public = RsaPublicKey::from(key);
                certs
                    .iter()
                    .position(|der| public_key_of(der).map(|p| p == public).unwrap_or(false))
            })
            .unwrap_or(0);

        let mut chain = certs;
        let leaf = chain.remove(leaf_index);
        Self::from_parts(leaf, private_key, chain)
    }

    /// Exports certificate and key as a password-protected PKCS#12 bundle.
    pub fn to_pfx(&self, password: &str, friendly_name: &str) -> NfeResult<Vec<u8>> {
        let key = self
            .private_key
            .as_ref()
            .ok_or_else(|| NfeError::SigningFailed("certificate has no private key".into()))?;
        let key_der = key
            .to_pkcs8_der()
            .map_err(|e| NfeError::InternalError(format!("cannot encode private key: {e}")))?;
        let pfx = p12::PFX::new(
            &self.certificate_der,
            key_der.as_bytes(),
            None,
            password,
            friendly_name,
        )
        .ok_or_else(|| NfeError::InternalError("cannot build PFX bundle".into()))?;
        Ok(pfx.to_der())
    }

    pub fn handle(&self) -> &CertificateHandle {
        &self.handle
    }

    pub fn certificate_der(&self) -> &[u8] {
        &self.certificate_der
    }

    pub fn chain_der(&self) -> &[Vec<u8>] {
        &self.chain_der
    }

    pub fn certificate_base64(&self) -> String {
        STANDARD.encode(&self.certificate_der)
    }

    pub fn certificate_pem(&self) -> String {
        pem_encode("CERTIFICATE", &self.certificate_der)
    }

    pub fn private_key_pem(&self) -> NfeResult<String> {
        let key = self
            .private_key
            .as_ref()
            .ok_or_else(|| NfeError::SigningFailed("certificate has no private key".into()))?;
        let pem = key
            .to_pkcs8_pem(LineEnding::LF)
            .map_err(|e| NfeError::InternalError(format!("cannot encode private key: {e}")))?;
        Ok(pem.to_string())
    }

    pub fn has_private_key(&self) -> bool {
        self.private_key.is_some()
    }

    /// True when a private key is present and belongs to the certificate.
    pub fn key_matches_certificate(&self) -> bool {
        match (&self.private_key, public_key_of(&self.certificate_der)) {
            (Some(key), Ok(public)) => RsaPublicKey::from(key) == public,
            _ => false,
        }
    }

    /// RSASSA-PKCS1-v1_5 with SHA-256.
    pub fn sign_sha256(&self, data: &[u8]) -> NfeResult<Vec<u8>> {
        let key = self
            .private_key
            .as_ref()
            .ok_or_else(|| NfeError::SigningFailed("certificate has no private key".into()))?;
        let signing_key = SigningKey::<Sha256>::new(key.clone());
        let signature = signing_key
            .try_sign(data)
            .map_err(|e| NfeError::SigningFailed(format!("RSA signature failed: {e}")))?;
        Ok(signature.to_vec())
    }
}

/// Checks an RSA-SHA256 signature made by the holder of `certificate_der`.
pub fn verify_sha256(certificate_der: &[u8], data: &[u8], signature: &[u8]) -> NfeResult<()> {
    let public = public_key_of(certificate_der)?;
    let verifying_key = VerifyingKey::<Sha256>::new(public);
    let signature = Signature::try_from(signature)
        .map_err(|e| NfeError::SigningFailed(format!("malformed signature value: {e}")))?;
    verifying_key
        .verify(data, &signature)
        .map_err(|_| NfeError::SigningFailed("signature does not match".into()))
}
