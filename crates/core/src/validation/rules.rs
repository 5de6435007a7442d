use rust_decimal::Decimal;

use crate::access_key::{digits_only, region_code};
use crate::models::{IssuerProfile, LineItem, Sale};

pub fn client_checks(sale: &Sale, errs: &mut Vec<String>) {
    if sale.client_name.trim().is_empty() {
        errs.push("Client name is mandatory".to_string());
    }
    if sale.client_document.trim().is_empty() {
        errs.push("Client document (CPF/CNPJ) is mandatory".to_string());
    }
    if sale.client_address.trim().is_empty() {
        errs.push("Client address is mandatory".to_string());
    }
}

pub fn item_checks(sale: &Sale, errs: &mut Vec<String>) {
    if sale.items.is_empty() {
        errs.push("At least one line item is mandatory".to_string());
        return;
    }

    for (idx, item) in sale.items.iter().enumerate() {
        check_item(idx + 1, item, errs);
    }
}

fn check_item(position: usize, item: &LineItem, errs: &mut Vec<String>) {
    if item.description.trim().is_empty() {
        errs.push(format!("Item {position}: description is mandatory"));
    }
    if item.ncm.trim().is_empty() {
        errs.push(format!("Item {position}: NCM is mandatory"));
    }
    if item.cfop.trim().is_empty() {
        errs.push(format!("Item {position}: CFOP is mandatory"));
    }
    if item.quantity == 0 {
        errs.push(format!("Item {position}: quantity must be greater than zero"));
    }
    if item.unit_price <= Decimal::ZERO {
        errs.push(format!("Item {position}: unit price must be greater than zero"));
    }
    if item.unit_price.normalize().scale() > 2 {
        errs.push(format!(
            "Item {position}: unit price must have at most two decimal places"
        ));
    }
}

pub fn issuer_checks(issuer: &IssuerProfile, errs: &mut Vec<String>) {
    if digits_only(&issuer.cnpj).is_empty() {
        errs.push("Issuer CNPJ is not configured".to_string());
    } else if digits_only(&issuer.cnpj).len() > 14 {
        errs.push("Issuer CNPJ has more than 14 digits".to_string());
    }
    if issuer.legal_name.trim().is_empty() {
        errs.push("Issuer legal name is not configured".to_string());
    }
    if region_code(&issuer.uf).is_none() {
        errs.push(format!("Issuer state '{}' is not a known UF", issuer.uf));
    }
}
