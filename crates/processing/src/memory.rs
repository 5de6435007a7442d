//! In-process store for tests and throwaway runs.

use anyhow::{anyhow, bail, Result};
use nfe_core::{Protocol, Sale, SaleStatus};
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use uuid::Uuid;

use crate::store::{sort_pending, ProtocolStore, SaleStore};

#[derive(Default)]
struct Inner {
    sales: HashMap<Uuid, Sale>,
    protocols: Vec<Protocol>,
    sequences: HashMap<u16, u32>,
}

#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, Inner>> {
        self.inner.lock().map_err(|_| anyhow!("memory store lock poisoned"))
    }
}

impl SaleStore for MemoryStore {
    fn get_by_id(&self, id: Uuid) -> Result<Option<Sale>> {
        Ok(self.lock()?.sales.get(&id).cloned())
    }

    fn get_pending(&self) -> Result<Vec<Sale>> {
        Ok(sort_pending(self.lock()?.sales.values().cloned().collect()))
    }

    fn get_by_status(&self, status: SaleStatus) -> Result<Vec<Sale>> {
        let mut out: Vec<Sale> = self
            .lock()?
            .sales
            .values()
            .filter(|s| s.status == status)
            .cloned()
            .collect();
        out.sort_by_key(|s| s.sold_at);
        Ok(out)
    }

    fn get_all(&self) -> Result<Vec<Sale>> {
        let mut out: Vec<Sale> = self.lock()?.sales.values().cloned().collect();
        out.sort_by_key(|s| s.sold_at);
        Ok(out)
    }

    fn add(&self, sale: &Sale) -> Result<()> {
        let mut inner = self.lock()?;
        if inner.sales.contains_key(&sale.id) {
            bail!("sale {} already exists", sale.id);
        }
        inner.sales.insert(sale.id, sale.clone());
        Ok(())
    }

    fn update(&self, sale: &Sale) -> Result<()> {
        let mut inner = self.lock()?;
        let slot = inner
            .sales
            .get_mut(&sale.id)
            .ok_or_else(|| anyhow!("sale not found: {}", sale.id))?;
        *slot = sale.clone();
        Ok(())
    }

    fn claim(&self, id: Uuid) -> Result<Option<Sale>> {
        let mut inner = self.lock()?;
        match inner.sales.get_mut(&id) {
            Some(sale) if sale.status == SaleStatus::Pending => {
                sale.status = SaleStatus::Processing;
                Ok(Some(sale.clone()))
            }
            _ => Ok(None),
        }
    }

    fn next_document_number(&self, series: u16) -> Result<u32> {
        let mut inner = self.lock()?;
        let counter = inner.sequences.entry(series).or_insert(0);
        *counter += 1;
        Ok(*counter)
    }
}

impl ProtocolStore for MemoryStore {
    fn add(&self, protocol: &Protocol) -> Result<()> {
        self.lock()?.protocols.push(protocol.clone());
        Ok(())
    }

    fn get_by_id(&self, id: Uuid) -> Result<Option<Protocol>> {
        Ok(self.lock()?.protocols.iter().find(|p| p.id == id).cloned())
    }

    fn get_by_access_key(&self, access_key: &str) -> Result<Option<Protocol>> {
        Ok(self
            .lock()?
            .protocols
            .iter()
            .rev()
            .find(|p| p.access_key == access_key)
            .cloned())
    }

    fn get_by_sale_id(&self, sale_id: Uuid) -> Result<Vec<Protocol>> {
        Ok(self
            .lock()?
            .protocols
            .iter()
            .filter(|p| p.sale_id == sale_id)
            .cloned()
            .collect())
    }

    fn get_all(&self) -> Result<Vec<Protocol>> {
        Ok(self.lock()?.protocols.iter().rev().cloned().collect())
    }
}
