// Seed sync: walk the upstream category tree and mirror every product.
//
// Three phases, as the upstream only exposes EANs on the detail endpoint:
//   1. category tree -> subcategory ids
//   2. subcategory pages -> unique product ids
//   3. product details -> store
// Only phase 1 failing aborts the run; everything else is logged and skipped.

use crate::config::SyncConfig;
use crate::database_ops::store::CatalogStore;
use crate::database_ops::upstream::CatalogUpstream;
use crate::error::{CatalogError, CatalogResult};
use crate::util::clock::Clock;
use futures::{stream, StreamExt};
use rand::Rng;
use serde::Serialize;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, warn};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SyncReport {
    pub categories: usize,
    pub categories_failed: usize,
    pub products_listed: usize,
    pub products_written: usize,
    pub products_failed: usize,
    pub conflicts: usize,
    pub elapsed_ms: u64,
}

pub struct SeedSync {
    store: CatalogStore,
    upstream: Arc<dyn CatalogUpstream>,
    clock: Arc<dyn Clock>,
    config: SyncConfig,
}

impl SeedSync {
    pub fn new(
        store: CatalogStore,
        upstream: Arc<dyn CatalogUpstream>,
        clock: Arc<dyn Clock>,
        config: SyncConfig,
    ) -> Self {
        Self {
            store,
            upstream,
            clock,
            config,
        }
    }

    /// Spread requests out so the upstream does not rate-limit us.
    async fn pace(&self) {
        let (lo, hi) = (self.config.jitter_min_ms, self.config.jitter_max_ms);
        if hi == 0 {
            return;
        }
        let ms = if lo >= hi {
            hi
        } else {
            rand::thread_rng().gen_range(lo..=hi)
        };
        tokio::time::sleep(Duration::from_millis(ms)).await;
    }

    pub async fn run(&self) -> CatalogResult<SyncReport> {
        let started = Instant::now();
        let mut report = SyncReport::default();
        let concurrency = self.config.concurrency.max(1);

        info!("sync: phase 1, listing categories");
        let categories = self.upstream.list_categories().await?;
        let subcategory_ids: Vec<i64> = categories
            .iter()
            .flat_map(|c| c.subcategories.iter().map(|s| s.id))
            .collect();
        report.categories = subcategory_ids.len();
        info!(subcategories = report.categories, "sync: phase 1 complete");

        let listings: Vec<Result<Vec<String>, i64>> = stream::iter(subcategory_ids)
            .map(|category_id| async move {
                self.pace().await;
                match self.upstream.category_detail(category_id).await {
                    Ok(detail) => Ok(detail.product_ids().map(str::to_string).collect()),
                    Err(e) => {
                        warn!(category_id, error = %e, "sync: skipping category");
                        Err(category_id)
                    }
                }
            })
            .buffer_unordered(concurrency)
            .collect()
            .await;

        let mut product_ids = BTreeSet::new();
        for listing in listings {
            match listing {
                Ok(ids) => product_ids.extend(ids),
                Err(_) => report.categories_failed += 1,
            }
        }
        report.products_listed = product_ids.len();
        info!(products = report.products_listed, "sync: phase 2 complete");

        let written: Vec<Result<(), CatalogError>> = stream::iter(product_ids)
            .map(|id| async move {
                self.pace().await;
                let product = self.upstream.fetch_by_id(&id).await.map_err(|e| {
                    warn!(product_id = %id, error = %e, "sync: skipping product detail");
                    e
                })?;
                let product = product.refreshed_at(self.clock.now());
                self.store.upsert(&product).await.map_err(|e| {
                    warn!(product_id = %id, error = %e, "sync: could not store product");
                    e
                })
            })
            .buffer_unordered(concurrency)
            .collect()
            .await;

        for result in written {
            match result {
                Ok(()) => report.products_written += 1,
                Err(CatalogError::Conflict { .. }) => report.conflicts += 1,
                Err(_) => report.products_failed += 1,
            }
        }
        report.elapsed_ms = started.elapsed().as_millis() as u64;

        info!(
            written = report.products_written,
            failed = report.products_failed,
            conflicts = report.conflicts,
            categories_failed = report.categories_failed,
            elapsed_ms = report.elapsed_ms,
            "sync: complete"
        );
        Ok(report)
    }
}
