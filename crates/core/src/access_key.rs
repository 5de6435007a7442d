//! 44-digit NFe access key (chave de acesso).
//!
//! Layout: `cUF(2) AAMM(4) CNPJ(14) mod(2) serie(3) nNF(9) tpEmis(1) cNF(8) cDV(1)`.

use chrono::{DateTime, Datelike, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::error::{NfeError, NfeResult};
use crate::models::{IssuerProfile, Sale};

pub const ACCESS_KEY_LEN: usize = 44;
pub const MODEL_NFE: u8 = 55;
pub const EMISSION_NORMAL: u8 = 1;

const WEIGHTS: [u32; 43] = [
    4, 3, 2, 9, 8, 7, 6, 5, 4, 3, 2, 9, 8, 7, 6, 5, 4, 3, 2, 9, 8, 7, 6, 5, 4, 3, 2, 9, 8, 7, 6, 5,
    4, 3, 2, 9, 8, 7, 6, 5, 4, 3, 2,
];

/// IBGE code of a Brazilian state, used as the first two digits of the key.
pub fn region_code(uf: &str) -> Option<u8> {
    let code = match uf.trim().to_ascii_uppercase().as_str() {
        "RO" => 11,
        "AC" => 12,
        "AM" => 13,
        "RR" => 14,
        "PA" => 15,
        "AP" => 16,
        "TO" => 17,
        "MA" => 21,
        "PI" => 22,
        "CE" => 23,
        "RN" => 24,
        "PB" => 25,
        "PE" => 26,
        "AL" => 27,
        "SE" => 28,
        "BA" => 29,
        "MG" => 31,
        "ES" => 32,
        "RJ" => 33,
        "SP" => 35,
        "PR" => 41,
        "SC" => 42,
        "RS" => 43,
        "MS" => 50,
        "MT" => 51,
        "GO" => 52,
        "DF" => 53,
        _ => return None,
    };
    Some(code)
}

/// Strips everything but ASCII digits (CNPJ, CPF, CEP, NCM).
pub fn digits_only(value: &str) -> String {
    value.chars().filter(char::is_ascii_digit).collect()
}

/// Mod-11 check digit over exactly 43 digits.
pub fn calculate_check_digit(digits: &str) -> NfeResult<u8> {
    if digits.len() != ACCESS_KEY_LEN - 1 || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return Err(NfeError::InvalidArgument(format!(
            "check digit needs 43 numeric digits, got {:?}",
            digits
        )));
    }

    let sum: u32 = digits
        .bytes()
        .zip(WEIGHTS.iter())
        .map(|(b, w)| u32::from(b - b'0') * w)
        .sum();

    let remainder = sum % 11;
    Ok(if remainder < 2 { 0 } else { (11 - remainder) as u8 })
}

/// Inputs for one access key. All fields are already numeric; padding happens on derivation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyInputs {
    pub region_code: u8,
    pub issued_at: DateTime<Utc>,
    pub cnpj: String,
    pub model: u8,
    pub series: u16,
    pub number: u32,
    pub emission_type: u8,
    pub numeric_code: u32,
}

impl KeyInputs {
    /// Collects key inputs for `sale` using the issuer profile and an allocated document number.
    pub fn for_sale(sale: &Sale, issuer: &IssuerProfile, number: u32) -> NfeResult<Self> {
        let region_code = region_code(&issuer.uf).ok_or_else(|| {
            NfeError::InvalidArgument(format!("unknown issuer state code: {}", issuer.uf))
        })?;

        Ok(Self {
            region_code,
            issued_at: sale.sold_at,
            cnpj: issuer.cnpj.clone(),
            model: MODEL_NFE,
            series: sale.series.unwrap_or(issuer.series),
            number,
            emission_type: EMISSION_NORMAL,
            numeric_code: numeric_code_for(&sale.id),
        })
    }
}

/// Deterministic 8-digit `cNF` derived from the sale id.
pub fn numeric_code_for(sale_id: &Uuid) -> u32 {
    let digest = Sha256::digest(sale_id.as_bytes());
    let mut head = [0u8; 8];
    head.copy_from_slice(&digest[..8]);
    (u64::from_be_bytes(head) % 100_000_000) as u32
}

/// Builds the 43 key digits and appends the check digit.
pub fn derive_access_key(inputs: &KeyInputs) -> NfeResult<AccessKey> {
    let cnpj = digits_only(&inputs.cnpj);
    if cnpj.is_empty() || cnpj.len() > 14 {
        return Err(NfeError::InvalidArgument(format!(
            "issuer CNPJ must have 1 to 14 digits, got {:?}",
            inputs.cnpj
        )));
    }
    if inputs.series > 999 {
        return Err(NfeError::InvalidArgument(format!(
            "series {} does not fit in 3 digits",
            inputs.series
        )));
    }
    if inputs.number == 0 || inputs.number > 999_999_999 {
        return Err(NfeError::InvalidArgument(format!(
            "document number {} must be between 1 and 999999999",
            inputs.number
        )));
    }
    if inputs.numeric_code > 99_999_999 {
        return Err(NfeError::InvalidArgument(format!(
            "numeric code {} does not fit in 8 digits",
            inputs.numeric_code
        )));
    }

    let body = format!(
        "{:02}{:02}{:02}{:0>14}{:02}{:03}{:09}{:01}{:08}",
        inputs.region_code,
        inputs.issued_at.year() % 100,
        inputs.issued_at.month(),
        cnpj,
        inputs.model,
        inputs.series,
        inputs.number,
        inputs.emission_type,
        inputs.numeric_code,
    );
    if body.len() != ACCESS_KEY_LEN - 1 {
        return Err(NfeError::InvalidArgument(format!(
            "key inputs produced {} digits instead of 43",
            body.len()
        )));
    }

    let check = calculate_check_digit(&body)?;
    Ok(AccessKey(format!("{body}{check}")))
}

/// Length, charset and check digit of a full key.
pub fn validate_access_key(key: &str) -> NfeResult<()> {
    if key.len() != ACCESS_KEY_LEN {
        return Err(NfeError::InvalidArgument(format!(
            "access key must have 44 digits, got {}",
            key.len()
        )));
    }
    if !key.bytes().all(|b| b.is_ascii_digit()) {
        return Err(NfeError::InvalidArgument(
            "access key must contain only digits".to_string(),
        ));
    }
    let expected = calculate_check_digit(&key[..ACCESS_KEY_LEN - 1])?;
    let actual = key.as_bytes()[ACCESS_KEY_LEN - 1];
    if !actual.is_ascii_digit() || actual - b'0' != expected {
        return Err(NfeError::InvalidArgument(format!(
            "access key check digit mismatch: expected {expected}"
        )));
    }
    Ok(())
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct AccessKey(String);

impl AccessKey {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn region_code(&self) -> &str {
        &self.0[0..2]
    }

    pub fn year_month(&self) -> &str {
        &self.0[2..6]
    }

    pub fn cnpj(&self) -> &str {
        &self.0[6..20]
    }

    pub fn model(&self) -> &str {
        &self.0[20..22]
    }

    pub fn series(&self) -> &str {
        &self.0[22..25]
    }

    pub fn number(&self) -> &str {
        &self.0[25..34]
    }

    pub fn emission_type(&self) -> &str {
        &self.0[34..35]
    }

    pub fn numeric_code(&self) -> &str {
        &self.0[35..43]
    }

    pub fn check_digit(&self) -> u8 {
        self.0.as_bytes()[43] - b'0'
    }
}

impl FromStr for AccessKey {
    type Err = NfeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        validate_access_key(s)?;
        Ok(AccessKey(s.to_string()))
    }
}

impl TryFrom<String> for AccessKey {
    type Error = NfeError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        validate_access_key(&value)?;
        Ok(AccessKey(value))
    }
}

impl From<AccessKey> for String {
    fn from(key: AccessKey) -> Self {
        key.0
    }
}

impl fmt::Display for AccessKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn inputs() -> KeyInputs {
        KeyInputs {
            region_code: 35,
            issued_at: Utc.with_ymd_and_hms(2024, 6, 15, 10, 30, 0).unwrap(),
            cnpj: "12.345.678/0001-95".into(),
            model: MODEL_NFE,
            series: 1,
            number: 1,
            emission_type: EMISSION_NORMAL,
            numeric_code: 12_345_678,
        }
    }

    #[test]
    fn check_digit_matches_reference_values() {
        assert_eq!(calculate_check_digit(&"0".repeat(43)).unwrap(), 0);
        assert_eq!(
            calculate_check_digit(&format!("1{}", "0".repeat(42))).unwrap(),
            7
        );
        assert_eq!(
            calculate_check_digit(&format!("{}1", "0".repeat(42))).unwrap(),
            9
        );
        // remainder 1 maps to zero
        assert_eq!(
            calculate_check_digit(&format!("{}300", "0".repeat(40))).unwrap(),
            0
        );
        assert_eq!(
            calculate_check_digit("4317071234567800019555001000000042187654321").unwrap(),
            6
        );
    }

    #[test]
    fn check_digit_rejects_bad_input() {
        assert!(calculate_check_digit("123").is_err());
        assert!(calculate_check_digit(&"a".repeat(43)).is_err());
    }

    #[test]
    fn derives_official_layout() {
        let key = derive_access_key(&inputs()).unwrap();
        assert_eq!(key.as_str(), "35240612345678000195550010000000011123456787");
        assert_eq!(key.region_code(), "35");
        assert_eq!(key.year_month(), "2406");
        assert_eq!(key.cnpj(), "12345678000195");
        assert_eq!(key.model(), "55");
        assert_eq!(key.series(), "001");
        assert_eq!(key.number(), "000000001");
        assert_eq!(key.emission_type(), "1");
        assert_eq!(key.numeric_code(), "12345678");
        assert_eq!(key.check_digit(), 7);
    }

    #[test]
    fn short_cnpj_is_zero_padded() {
        let mut i = inputs();
        i.cnpj = "191".into();
        let key = derive_access_key(&i).unwrap();
        assert_eq!(key.cnpj(), "00000000000191");
    }

    #[test]
    fn derivation_is_idempotent() {
        assert_eq!(
            derive_access_key(&inputs()).unwrap(),
            derive_access_key(&inputs()).unwrap()
        );
    }

    #[test]
    fn out_of_range_inputs_fail() {
        let mut i = inputs();
        i.number = 0;
        assert!(derive_access_key(&i).is_err());

        let mut i = inputs();
        i.series = 1000;
        assert!(derive_access_key(&i).is_err());

        let mut i = inputs();
        i.cnpj = "".into();
        assert!(derive_access_key(&i).is_err());
    }

    #[test]
    fn validates_full_keys() {
        assert!(validate_access_key("35240612345678000195550010000000011123456787").is_ok());
        assert!(validate_access_key("35240612345678000195550010000000011123456788").is_err());
        assert!(validate_access_key("3524").is_err());
        assert!(validate_access_key("3524061234567800019555001000000001112345678A").is_err());
        assert!("35240612345678000195550010000000011123456787"
            .parse::<AccessKey>()
            .is_ok());
    }

    #[test]
    fn multibyte_keys_are_rejected_without_panicking() {
        let key = format!("{}é", "3".repeat(42));
        assert_eq!(key.len(), ACCESS_KEY_LEN);
        assert!(validate_access_key(&key).is_err());
        assert!(key.parse::<AccessKey>().is_err());
    }

    #[test]
    fn region_codes() {
        assert_eq!(region_code("sp"), Some(35));
        assert_eq!(region_code("PB"), Some(25));
        assert_eq!(region_code("MA"), Some(21));
        assert_eq!(region_code("XX"), None);
    }

    #[test]
    fn numeric_code_is_stable_and_eight_digits() {
        let id = Uuid::new_v4();
        assert_eq!(numeric_code_for(&id), numeric_code_for(&id));
        assert!(numeric_code_for(&id) < 100_000_000);
    }
}
