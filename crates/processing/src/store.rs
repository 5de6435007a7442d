use anyhow::Result;
use nfe_core::{Protocol, Sale, SaleStatus};
use uuid::Uuid;

/// Sale persistence. `claim` is the only way a sale enters `Processing`.
pub trait SaleStore: Send + Sync {
    fn get_by_id(&self, id: Uuid) -> Result<Option<Sale>>;
    /// Pending sales, oldest first.
    fn get_pending(&self) -> Result<Vec<Sale>>;
    fn get_by_status(&self, status: SaleStatus) -> Result<Vec<Sale>>;
    fn get_all(&self) -> Result<Vec<Sale>>;
    /// Fails if a sale with the same id already exists.
    fn add(&self, sale: &Sale) -> Result<()>;
    /// Fails if the sale does not exist.
    fn update(&self, sale: &Sale) -> Result<()>;
    /// Atomically moves a Pending sale to Processing and returns it. `None` when the
    /// sale is missing or not Pending.
    fn claim(&self, id: Uuid) -> Result<Option<Sale>>;
    /// Next document number for `series`, starting at 1. Never hands out a number twice.
    fn next_document_number(&self, series: u16) -> Result<u32>;
}

/// Append-only protocol history.
pub trait ProtocolStore: Send + Sync {
    fn add(&self, protocol: &Protocol) -> Result<()>;
    fn get_by_id(&self, id: Uuid) -> Result<Option<Protocol>>;
    /// Latest protocol recorded for the access key.
    fn get_by_access_key(&self, access_key: &str) -> Result<Option<Protocol>>;
    /// Every protocol for the sale, oldest first.
    fn get_by_sale_id(&self, sale_id: Uuid) -> Result<Vec<Protocol>>;
    fn get_latest_for_sale(&self, sale_id: Uuid) -> Result<Option<Protocol>> {
        Ok(self.get_by_sale_id(sale_id)?.pop())
    }
    /// Newest first.
    fn get_all(&self) -> Result<Vec<Protocol>>;
}

pub(crate) fn sort_pending(mut sales: Vec<Sale>) -> Vec<Sale> {
    sales.retain(|s| s.status == SaleStatus::Pending);
    sales.sort_by_key(|s| s.sold_at);
    sales
}
