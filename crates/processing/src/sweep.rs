use anyhow::Result;
use std::sync::Arc;
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinSet;
use tokio::time::{sleep, Duration};

use crate::orchestrator::SaleProcessor;

/// Periodically processes every Pending sale with bounded parallelism.
pub struct Sweeper {
    processor: Arc<SaleProcessor>,
    interval: Duration,
    max_parallel: usize,
}

impl Sweeper {
    pub fn new(processor: Arc<SaleProcessor>, interval: Duration, max_parallel: usize) -> Self {
        Self {
            processor,
            interval,
            max_parallel: max_parallel.max(1),
        }
    }

    /// Sweeps until `shutdown` turns true. Sales already started run to completion;
    /// no new sale is started after the signal.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        tracing::info!(
            interval_secs = self.interval.as_secs(),
            max_parallel = self.max_parallel,
            "sweeper started"
        );
        loop {
            if *shutdown.borrow() {
                break;
            }
            match self.sweep_once(&shutdown).await {
                Ok(0) => tracing::debug!("no pending sales"),
                Ok(n) => tracing::info!(processed = n, "sweep finished"),
                Err(e) => tracing::error!(error = %e, "sweep failed"),
            }

            tokio::select! {
                _ = sleep(self.interval) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }
        tracing::info!("sweeper stopped");
        Ok(())
    }

    /// One pass over the Pending sales. Returns how many this pass moved to a terminal
    /// status.
    pub async fn sweep_once(&self, shutdown: &watch::Receiver<bool>) -> Result<usize> {
        let pending = self.processor.sales().get_pending()?;
        let permits = Arc::new(Semaphore::new(self.max_parallel));
        let mut tasks = JoinSet::new();

        for sale in pending {
            if *shutdown.borrow() {
                tracing::info!("shutdown requested; not starting further sales");
                break;
            }
            let permit = permits.clone().acquire_owned().await?;
            if *shutdown.borrow() {
                tracing::info!("shutdown requested while waiting for a slot");
                break;
            }
            let processor = self.processor.clone();
            tasks.spawn(async move {
                let _permit = permit;
                match processor.process_sale(sale.id).await {
                    Ok(status) => status.is_some(),
                    Err(e) => {
                        tracing::error!(sale_id = %sale.id, error = %e, "claim failed");
                        false
                    }
                }
            });
        }

        let mut processed = 0;
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(true) => processed += 1,
                Ok(false) => {}
                Err(e) => tracing::error!(error = %e, "sale task panicked"),
            }
        }
        Ok(processed)
    }
}
