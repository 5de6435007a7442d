use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SaleStatus {
    Pending,
    Processing,
    Authorized,
    Rejected,
    Error,
}

impl SaleStatus {
    /// Authorized, Rejected and Error are never left automatically.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            SaleStatus::Authorized | SaleStatus::Rejected | SaleStatus::Error
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            SaleStatus::Pending => "pending",
            SaleStatus::Processing => "processing",
            SaleStatus::Authorized => "authorized",
            SaleStatus::Rejected => "rejected",
            SaleStatus::Error => "error",
        }
    }
}

impl fmt::Display for SaleStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LineItem {
    pub code: String,
    pub description: String,
    pub quantity: u32,
    pub unit_price: Decimal,
    pub ncm: String,
    pub cfop: String,
    #[serde(default = "default_unit")]
    pub unit: String,
}

fn default_unit() -> String {
    "UN".to_string()
}

impl LineItem {
    pub fn new(
        code: impl Into<String>,
        description: impl Into<String>,
        quantity: u32,
        unit_price: Decimal,
    ) -> Self {
        Self {
            code: code.into(),
            description: description.into(),
            quantity,
            unit_price,
            ncm: String::new(),
            cfop: "5102".to_string(),
            unit: default_unit(),
        }
    }

    pub fn ncm(mut self, ncm: impl Into<String>) -> Self {
        self.ncm = ncm.into();
        self
    }

    pub fn cfop(mut self, cfop: impl Into<String>) -> Self {
        self.cfop = cfop.into();
        self
    }

    pub fn unit(mut self, unit: impl Into<String>) -> Self {
        self.unit = unit.into();
        self
    }

    /// Always recomputed from quantity and unit price.
    pub fn total(&self) -> Decimal {
        Decimal::from(self.quantity) * self.unit_price
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Sale {
    pub id: Uuid,
    pub client_name: String,
    pub client_document: String,
    pub client_address: String,
    pub items: Vec<LineItem>,
    pub sold_at: DateTime<Utc>,
    pub status: SaleStatus,
    pub access_key: Option<String>,
    pub document_number: Option<u32>,
    pub series: Option<u16>,
    #[serde(default)]
    pub notes: String,
}

impl Sale {
    pub fn new(
        client_name: impl Into<String>,
        client_document: impl Into<String>,
        client_address: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            client_name: client_name.into(),
            client_document: client_document.into(),
            client_address: client_address.into(),
            items: Vec::new(),
            sold_at: Utc::now(),
            status: SaleStatus::Pending,
            access_key: None,
            document_number: None,
            series: None,
            notes: String::new(),
        }
    }

    pub fn with_item(mut self, item: LineItem) -> Self {
        self.items.push(item);
        self
    }

    pub fn with_notes(mut self, notes: impl Into<String>) -> Self {
        self.notes = notes.into();
        self
    }

    pub fn sold_at(mut self, sold_at: DateTime<Utc>) -> Self {
        self.sold_at = sold_at;
        self
    }

    pub fn total(&self) -> Decimal {
        self.items.iter().map(LineItem::total).sum()
    }

    /// Records the access key. A key that is already set is never replaced.
    pub fn assign_access_key(&mut self, key: &str) -> bool {
        match &self.access_key {
            Some(existing) => existing == key,
            None => {
                self.access_key = Some(key.to_string());
                true
            }
        }
    }
}

/// Immutable record of one terminal processing outcome.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Protocol {
    pub id: Uuid,
    pub sale_id: Uuid,
    pub access_key: String,
    pub protocol_number: String,
    pub status: SaleStatus,
    pub message: String,
    pub status_code: u16,
    pub recorded_at: DateTime<Utc>,
    pub signed_document: String,
    pub response_document: String,
}

impl Protocol {
    pub fn new(sale_id: Uuid, status: SaleStatus, message: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            sale_id,
            access_key: String::new(),
            protocol_number: String::new(),
            status,
            message: message.into(),
            status_code: 0,
            recorded_at: Utc::now(),
            signed_document: String::new(),
            response_document: String::new(),
        }
    }
}

/// SEFAZ environment (`tpAmb`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Environment {
    Production,
    #[default]
    Homologation,
}

impl Environment {
    pub fn code(self) -> u8 {
        match self {
            Environment::Production => 1,
            Environment::Homologation => 2,
        }
    }
}

/// Issuer (emitente) data used for key derivation and document building.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct IssuerProfile {
    pub cnpj: String,
    pub legal_name: String,
    pub trade_name: String,
    pub state_registration: String,
    pub uf: String,
    pub municipality_code: u32,
    pub municipality_name: String,
    pub address: String,
    pub address_number: String,
    pub district: String,
    pub postal_code: String,
    pub series: u16,
    /// 1 = Simples Nacional, 2 = Simples Nacional (excess), 3 = normal regime.
    pub tax_regime: u8,
    pub environment: Environment,
}

impl Default for IssuerProfile {
    fn default() -> Self {
        Self {
            cnpj: String::new(),
            legal_name: String::new(),
            trade_name: String::new(),
            state_registration: String::new(),
            uf: "SP".to_string(),
            municipality_code: 3550308,
            municipality_name: "São Paulo".to_string(),
            address: String::new(),
            address_number: "S/N".to_string(),
            district: String::new(),
            postal_code: String::new(),
            series: 1,
            tax_regime: 3,
            environment: Environment::Homologation,
        }
    }
}
