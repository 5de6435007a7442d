use crate::models::{IssuerProfile, Sale};

mod rules;

/// Every business-rule violation that blocks issuing a document for `sale`.
/// An empty list means the sale can be issued.
pub fn validate_sale_for_issuance(sale: &Sale, issuer: &IssuerProfile) -> Vec<String> {
    let mut errs = Vec::new();
    rules::client_checks(sale, &mut errs);
    rules::item_checks(sale, &mut errs);
    rules::issuer_checks(issuer, &mut errs);
    errs
}

pub fn validate(sale: &Sale, issuer: &IssuerProfile) -> Result<(), Vec<String>> {
    let errs = validate_sale_for_issuance(sale, issuer);
    if errs.is_empty() {
        Ok(())
    } else {
        Err(errs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::LineItem;
    use rust_decimal_macros::dec;

    fn issuer() -> IssuerProfile {
        IssuerProfile {
            cnpj: "12345678000195".into(),
            legal_name: "Loja Exemplo LTDA".into(),
            ..IssuerProfile::default()
        }
    }

    fn valid_sale() -> Sale {
        Sale::new("Maria Silva", "12345678909", "Rua das Flores, 10").with_item(
            LineItem::new("P1", "Caneta", 1, dec!(100.00)).ncm("96081000"),
        )
    }

    #[test]
    fn valid_sale_has_no_violations() {
        assert!(validate(&valid_sale(), &issuer()).is_ok());
    }

    #[test]
    fn every_violation_is_reported() {
        let mut sale = valid_sale();
        sale.client_name.clear();
        sale.items.clear();
        let errs = validate_sale_for_issuance(&sale, &issuer());
        assert!(errs.len() >= 2, "{errs:?}");
        assert!(errs.iter().any(|e| e.contains("Client name")));
        assert!(errs.iter().any(|e| e.contains("line item")));
    }

    #[test]
    fn item_fields_are_checked() {
        let sale = Sale::new("Maria", "123", "Rua A")
            .with_item(LineItem::new("P1", "", 0, dec!(0)).cfop(""));
        let errs = validate_sale_for_issuance(&sale, &issuer());
        assert_eq!(
            errs,
            vec![
                "Item 1: description is mandatory",
                "Item 1: NCM is mandatory",
                "Item 1: CFOP is mandatory",
                "Item 1: quantity must be greater than zero",
                "Item 1: unit price must be greater than zero",
            ]
        );
    }

    #[test]
    fn missing_ncm_is_flagged() {
        let sale = Sale::new("Maria", "123", "Rua A")
            .with_item(LineItem::new("P1", "Caneta", 1, dec!(100.00)));
        let errs = validate_sale_for_issuance(&sale, &issuer());
        assert_eq!(errs, vec!["Item 1: NCM is mandatory"]);
    }

    #[test]
    fn unit_price_is_limited_to_cents() {
        let sale = Sale::new("Maria", "123", "Rua A")
            .with_item(LineItem::new("P1", "Caneta", 1, dec!(1.005)).ncm("96081000"))
            .with_item(LineItem::new("P2", "Lapis", 1, dec!(1.500)).ncm("96091000"));
        let errs = validate_sale_for_issuance(&sale, &issuer());
        assert_eq!(
            errs,
            vec!["Item 1: unit price must have at most two decimal places"]
        );
    }

    #[test]
    fn issuer_configuration_is_required() {
        let errs = validate_sale_for_issuance(&valid_sale(), &IssuerProfile::default());
        assert!(errs.contains(&"Issuer CNPJ is not configured".to_string()));
        assert!(errs.contains(&"Issuer legal name is not configured".to_string()));
    }
}
