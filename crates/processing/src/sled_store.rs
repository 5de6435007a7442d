use anyhow::{anyhow, bail, Context, Result};
use nfe_core::{Protocol, Sale, SaleStatus};
use sled::{Db, Tree};
use std::path::Path;
use uuid::Uuid;

use crate::store::{sort_pending, ProtocolStore, SaleStore};

/// Durable store on sled. Trees: `sales` (by id), `protocols` (by sale id, then
/// recording time) and `sequences` (document number per series).
#[derive(Clone)]
pub struct SledStore {
    db: Db,
}

impl SledStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let db = sled::open(path)
            .with_context(|| format!("Failed to open sale database at {}", path.display()))?;
        Ok(Self { db })
    }

    /// Database removed when dropped.
    pub fn temporary() -> Result<Self> {
        let db = sled::Config::new().temporary(true).open()?;
        Ok(Self { db })
    }

    fn sales_tree(&self) -> Result<Tree> {
        Ok(self.db.open_tree("sales")?)
    }

    fn protocols_tree(&self) -> Result<Tree> {
        Ok(self.db.open_tree("protocols")?)
    }

    fn sequences_tree(&self) -> Result<Tree> {
        Ok(self.db.open_tree("sequences")?)
    }

    pub fn flush(&self) -> Result<()> {
        self.db.flush()?;
        Ok(())
    }

    fn scan_sales(&self) -> Result<Vec<Sale>> {
        let mut out = Vec::new();
        for item in self.sales_tree()?.iter() {
            let (_k, v) = item?;
            out.push(serde_json::from_slice(&v)?);
        }
        Ok(out)
    }

    fn scan_protocols(&self) -> Result<Vec<Protocol>> {
        let mut out = Vec::new();
        for item in self.protocols_tree()?.iter() {
            let (_k, v) = item?;
            out.push(serde_json::from_slice(&v)?);
        }
        Ok(out)
    }
}

fn protocol_key(protocol: &Protocol) -> Vec<u8> {
    let mut key = Vec::with_capacity(40);
    key.extend_from_slice(protocol.sale_id.as_bytes());
    key.extend_from_slice(&protocol.recorded_at.timestamp_micros().to_be_bytes());
    key.extend_from_slice(protocol.id.as_bytes());
    key
}

impl SaleStore for SledStore {
    fn get_by_id(&self, id: Uuid) -> Result<Option<Sale>> {
        match self.sales_tree()?.get(id.as_bytes())? {
            Some(v) => Ok(Some(serde_json::from_slice(&v)?)),
            None => Ok(None),
        }
    }

    fn get_pending(&self) -> Result<Vec<Sale>> {
        Ok(sort_pending(self.scan_sales()?))
    }

    fn get_by_status(&self, status: SaleStatus) -> Result<Vec<Sale>> {
        let mut out: Vec<Sale> = self
            .scan_sales()?
            .into_iter()
            .filter(|s| s.status == status)
            .collect();
        out.sort_by_key(|s| s.sold_at);
        Ok(out)
    }

    fn get_all(&self) -> Result<Vec<Sale>> {
        let mut out = self.scan_sales()?;
        out.sort_by_key(|s| s.sold_at);
        Ok(out)
    }

    fn add(&self, sale: &Sale) -> Result<()> {
        let value = serde_json::to_vec(sale)?;
        let inserted = self
            .sales_tree()?
            .compare_and_swap(sale.id.as_bytes(), None as Option<&[u8]>, Some(value))?;
        if inserted.is_err() {
            bail!("sale {} already exists", sale.id);
        }
        Ok(())
    }

    fn update(&self, sale: &Sale) -> Result<()> {
        let value = serde_json::to_vec(sale)?;
        // only replaces an existing record; a missing one stays missing
        let previous = self
            .sales_tree()?
            .fetch_and_update(sale.id.as_bytes(), |old| old.map(|_| value.clone()))?;
        if previous.is_none() {
            bail!("sale not found: {}", sale.id);
        }
        Ok(())
    }

    fn claim(&self, id: Uuid) -> Result<Option<Sale>> {
        let sales = self.sales_tree()?;
        loop {
            let Some(current) = sales.get(id.as_bytes())? else {
                return Ok(None);
            };
            let mut sale: Sale = serde_json::from_slice(&current)?;
            if sale.status != SaleStatus::Pending {
                return Ok(None);
            }
            sale.status = SaleStatus::Processing;
            let next = serde_json::to_vec(&sale)?;
            match sales.compare_and_swap(id.as_bytes(), Some(current), Some(next))? {
                Ok(()) => {
                    sales.flush()?;
                    return Ok(Some(sale));
                }
                // lost a race; re-read and decide again
                Err(_) => continue,
            }
        }
    }

    fn next_document_number(&self, series: u16) -> Result<u32> {
        let sequences = self.sequences_tree()?;
        let value = sequences
            .update_and_fetch(series.to_be_bytes(), |old| {
                let current = old
                    .and_then(|b| <[u8; 4]>::try_from(b).ok())
                    .map(u32::from_be_bytes)
                    .unwrap_or(0);
                Some(current.saturating_add(1).to_be_bytes().to_vec())
            })?
            .ok_or_else(|| anyhow!("sequence for series {series} vanished"))?;
        let bytes = <[u8; 4]>::try_from(value.as_ref())
            .map_err(|_| anyhow!("corrupt sequence for series {series}"))?;
        sequences.flush()?;
        Ok(u32::from_be_bytes(bytes))
    }
}

impl ProtocolStore for SledStore {
    fn add(&self, protocol: &Protocol) -> Result<()> {
        self.protocols_tree()?
            .insert(protocol_key(protocol), serde_json::to_vec(protocol)?)?;
        Ok(())
    }

    fn get_by_id(&self, id: Uuid) -> Result<Option<Protocol>> {
        Ok(self.scan_protocols()?.into_iter().find(|p| p.id == id))
    }

    fn get_by_access_key(&self, access_key: &str) -> Result<Option<Protocol>> {
        Ok(self
            .scan_protocols()?
            .into_iter()
            .filter(|p| p.access_key == access_key)
            .max_by_key(|p| p.recorded_at))
    }

    fn get_by_sale_id(&self, sale_id: Uuid) -> Result<Vec<Protocol>> {
        let mut out = Vec::new();
        for item in self.protocols_tree()?.scan_prefix(sale_id.as_bytes()) {
            let (_k, v) = item?;
            out.push(serde_json::from_slice(&v)?);
        }
        Ok(out)
    }

    fn get_all(&self) -> Result<Vec<Protocol>> {
        let mut out = self.scan_protocols()?;
        out.sort_by_key(|p| std::cmp::Reverse(p.recorded_at));
        Ok(out)
    }
}
