pub mod access_key;
pub mod document;
pub mod error;
pub mod models;
pub mod parsing;
pub mod validation;

pub use access_key::{
    calculate_check_digit, derive_access_key, validate_access_key, AccessKey, KeyInputs,
};
pub use document::{DocumentBuilder, NfeXmlBuilder};
pub use error::{NfeError, NfeResult};
pub use models::{Environment, IssuerProfile, LineItem, Protocol, Sale, SaleStatus};
pub use validation::validate_sale_for_issuance;
