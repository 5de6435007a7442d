pub mod audit;
pub mod memory;
pub mod orchestrator;
pub mod sled_store;
pub mod store;
pub mod sweep;

pub use audit::{AuditEvent, AuditLog};
pub use memory::MemoryStore;
pub use orchestrator::{DocumentSigner, SaleProcessor};
pub use sled_store::SledStore;
pub use store::{ProtocolStore, SaleStore};
pub use sweep::Sweeper;
