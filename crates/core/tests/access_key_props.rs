//! Property tests for access key derivation and check digits.

use chrono::{TimeZone, Utc};
use nfe_core::access_key::{
    calculate_check_digit, derive_access_key, validate_access_key, KeyInputs, ACCESS_KEY_LEN,
    EMISSION_NORMAL, MODEL_NFE,
};
use nfe_core::models::{IssuerProfile, LineItem, Sale};
use nfe_core::validation::validate_sale_for_issuance;
use proptest::prelude::*;
use rust_decimal_macros::dec;

fn arb_inputs() -> impl Strategy<Value = KeyInputs> {
    (
        prop::sample::select(vec![11u8, 24, 25, 29, 33, 35, 41, 43, 53]),
        2000i32..2099,
        1u32..=12,
        "[0-9]{14}",
        0u16..=999,
        1u32..=999_999_999,
        0u32..=99_999_999,
    )
        .prop_map(|(region_code, year, month, cnpj, series, number, numeric_code)| KeyInputs {
            region_code,
            issued_at: Utc.with_ymd_and_hms(year, month, 1, 12, 0, 0).unwrap(),
            cnpj,
            model: MODEL_NFE,
            series,
            number,
            emission_type: EMISSION_NORMAL,
            numeric_code,
        })
}

proptest! {
    /// Same 43 digits always yield the same single digit.
    #[test]
    fn check_digit_is_deterministic(digits in "[0-9]{43}") {
        let a = calculate_check_digit(&digits).unwrap();
        let b = calculate_check_digit(&digits).unwrap();
        prop_assert_eq!(a, b);
        prop_assert!(a <= 9);
    }

    /// Derived keys are 44 ASCII digits, validate, and re-derive identically.
    #[test]
    fn derived_keys_are_well_formed(inputs in arb_inputs()) {
        let key = derive_access_key(&inputs).unwrap();
        prop_assert_eq!(key.as_str().len(), ACCESS_KEY_LEN);
        prop_assert!(key.as_str().bytes().all(|b| b.is_ascii_digit()));
        prop_assert!(validate_access_key(key.as_str()).is_ok());
        prop_assert_eq!(derive_access_key(&inputs).unwrap(), key);
    }

    /// Any other trailing digit is rejected.
    #[test]
    fn wrong_check_digit_is_rejected(inputs in arb_inputs(), delta in 1u8..10) {
        let key = derive_access_key(&inputs).unwrap();
        let wrong = (key.check_digit() + delta) % 10;
        let tampered = format!("{}{}", &key.as_str()[..43], wrong);
        prop_assert!(validate_access_key(&tampered).is_err());
    }
}

#[test]
fn sale_with_missing_name_and_no_items_reports_both() {
    let sale = Sale::new("", "12345678909", "Rua A, 1");
    let issuer = IssuerProfile {
        cnpj: "12345678000195".into(),
        legal_name: "Loja".into(),
        ..IssuerProfile::default()
    };
    let errs = validate_sale_for_issuance(&sale, &issuer);
    assert_eq!(errs.len(), 2, "{errs:?}");

    let ok = Sale::new("Maria", "12345678909", "Rua A, 1")
        .with_item(LineItem::new("P1", "Caneta", 1, dec!(100.00)).ncm("96081000"));
    assert!(validate_sale_for_issuance(&ok, &issuer).is_empty());
}
