//! Throwaway self-signed certificate for non-production runs.

use nfe_core::error::{NfeError, NfeResult};
use rand::RngCore;
use rcgen::{
    CertificateParams, DistinguishedName, DnType, ExtendedKeyUsagePurpose, IsCa, KeyPair,
    KeyUsagePurpose, SerialNumber, PKCS_RSA_SHA256,
};
use rsa::pkcs8::{EncodePrivateKey, LineEnding};
use rsa::RsaPrivateKey;

use crate::material::SigningCertificate;

pub const RSA_BITS: usize = 2048;
pub const DEFAULT_VALIDITY_DAYS: i64 = 365;

/// id-kp-documentSigning
const DOCUMENT_SIGNING_OID: [u64; 9] = [1, 3, 6, 1, 5, 5, 7, 3, 36];

fn failed(msg: impl std::fmt::Display) -> NfeError {
    NfeError::CertificateUnavailable(format!("self-signed certificate generation failed: {msg}"))
}

/// Parses `CN=..., O=..., C=BR` into a distinguished name.
pub fn parse_subject(subject: &str) -> NfeResult<DistinguishedName> {
    let mut dn = DistinguishedName::new();
    for part in subject.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        let (attr, value) = part
            .split_once('=')
            .ok_or_else(|| NfeError::InvalidArgument(format!("bad subject component: {part}")))?;
        let ty = match attr.trim().to_ascii_uppercase().as_str() {
            "CN" => DnType::CommonName,
            "O" => DnType::OrganizationName,
            "OU" => DnType::OrganizationalUnitName,
            "C" => DnType::CountryName,
            "ST" => DnType::StateOrProvinceName,
            "L" => DnType::LocalityName,
            other => {
                return Err(NfeError::InvalidArgument(format!(
                    "unsupported subject attribute: {other}"
                )))
            }
        };
        dn.push(ty, value.trim());
    }
    if dn.iter().next().is_none() {
        return Err(NfeError::InvalidArgument("subject is empty".into()));
    }
    Ok(dn)
}

/// RSA-2048 / SHA-256, digital signature key usage, document signing and client
/// authentication EKUs, not a CA. Blocking: key generation takes a noticeable while.
pub fn generate(subject: &str, validity_days: i64) -> NfeResult<SigningCertificate> {
    let distinguished_name = parse_subject(subject)?;

    let mut rng = rand::thread_rng();
    let private_key = RsaPrivateKey::new(&mut rng, RSA_BITS).map_err(failed)?;
    let pem = private_key.to_pkcs8_pem(LineEnding::LF).map_err(failed)?;
    let key_pair = KeyPair::from_pem_and_sign_algo(&pem, &PKCS_RSA_SHA256).map_err(failed)?;

    let mut serial = [0u8; 16];
    rng.fill_bytes(&mut serial);
    serial[0] &= 0x7f;

    let now = time::OffsetDateTime::now_utc();
    let mut params = CertificateParams::new(Vec::<String>::new()).map_err(failed)?;
    params.distinguished_name = distinguished_name;
    params.not_before = now - time::Duration::minutes(5);
    params.not_after = now + time::Duration::days(validity_days);
    params.serial_number = Some(SerialNumber::from(serial.to_vec()));
    params.is_ca = IsCa::ExplicitNoCa;
    params.key_usages = vec![KeyUsagePurpose::DigitalSignature];
    params.extended_key_usages = vec![
        ExtendedKeyUsagePurpose::Other(DOCUMENT_SIGNING_OID.to_vec()),
        ExtendedKeyUsagePurpose::ClientAuth,
    ];

    let cert = params.self_signed(&key_pair).map_err(failed)?;
    SigningCertificate::from_parts(cert.der().to_vec(), Some(private_key), Vec::new())
}
