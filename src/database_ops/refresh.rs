// Background refresher: re-fetches stale mirror rows on a timer.

use crate::config::RefreshConfig;
use crate::database_ops::product::Product;
use crate::database_ops::store::CatalogStore;
use crate::database_ops::upstream::CatalogUpstream;
use crate::error::CatalogError;
use crate::util::clock::Clock;
use futures::{stream, StreamExt};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, info_span, warn, Instrument};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RefreshReport {
    pub examined: usize,
    pub refreshed: usize,
    pub not_found: usize,
    pub unavailable: usize,
    pub rejected: usize,
    pub conflicts: usize,
    pub failed: usize,
    pub elapsed_ms: u64,
}

impl RefreshReport {
    fn record(&mut self, outcome: ItemOutcome) {
        match outcome {
            ItemOutcome::Refreshed => self.refreshed += 1,
            ItemOutcome::NotFound => self.not_found += 1,
            ItemOutcome::Unavailable => self.unavailable += 1,
            ItemOutcome::Rejected => self.rejected += 1,
            ItemOutcome::Conflict => self.conflicts += 1,
            ItemOutcome::Failed => self.failed += 1,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum TickOutcome {
    /// Another tick was still running.
    Skipped,
    Completed(RefreshReport),
    /// The stale scan itself failed; nothing was refreshed.
    Failed { reason: String },
}

#[derive(Debug, Clone, Copy)]
enum ItemOutcome {
    Refreshed,
    NotFound,
    Unavailable,
    Rejected,
    Conflict,
    Failed,
}

/// Clears the running flag on drop, including when a tick is cancelled.
struct TickGuard<'a>(&'a AtomicBool);

impl<'a> TickGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self(flag))
    }
}

impl Drop for TickGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

pub struct RefreshScheduler {
    store: CatalogStore,
    upstream: Arc<dyn CatalogUpstream>,
    clock: Arc<dyn Clock>,
    config: RefreshConfig,
    running: AtomicBool,
}

impl RefreshScheduler {
    pub fn new(
        store: CatalogStore,
        upstream: Arc<dyn CatalogUpstream>,
        clock: Arc<dyn Clock>,
        config: RefreshConfig,
    ) -> Self {
        Self {
            store,
            upstream,
            clock,
            config,
            running: AtomicBool::new(false),
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// One refresh batch. Never queues: returns `Skipped` if a tick is in flight.
    pub async fn tick(&self) -> TickOutcome {
        let Some(_guard) = TickGuard::acquire(&self.running) else {
            info!("refresh: previous tick still running; skipping");
            return TickOutcome::Skipped;
        };

        let started = Instant::now();
        let now = self.clock.now();
        let stale = match self
            .store
            .list_stale(self.config.stale_after, now, self.config.batch_limit)
            .await
        {
            Ok(rows) => rows,
            Err(e) => {
                error!(error = %e, "refresh: stale scan failed");
                return TickOutcome::Failed {
                    reason: e.to_string(),
                };
            }
        };

        let mut report = RefreshReport {
            examined: stale.len(),
            ..RefreshReport::default()
        };
        if stale.is_empty() {
            debug!("refresh: nothing stale");
            return TickOutcome::Completed(report);
        }

        let outcomes: Vec<ItemOutcome> = stream::iter(stale)
            .map(|product| self.refresh_one(product))
            .buffer_unordered(self.config.concurrency.max(1))
            .collect()
            .await;
        for outcome in outcomes {
            report.record(outcome);
        }
        report.elapsed_ms = started.elapsed().as_millis() as u64;

        info!(
            examined = report.examined,
            refreshed = report.refreshed,
            not_found = report.not_found,
            unavailable = report.unavailable,
            rejected = report.rejected,
            conflicts = report.conflicts,
            failed = report.failed,
            elapsed_ms = report.elapsed_ms,
            "refresh: tick complete"
        );
        TickOutcome::Completed(report)
    }

    /// Failed items are marked as attempted so a backlog of rows that keep
    /// failing cannot fill every batch.
    async fn refresh_one(&self, stale: Product) -> ItemOutcome {
        let outcome = self.try_refresh(&stale).await;
        if !matches!(outcome, ItemOutcome::Refreshed) {
            if let Err(e) = self.store.mark_attempted(&stale.id, self.clock.now()).await {
                warn!(id = %stale.id, error = %e, "refresh: could not record attempt");
            }
        }
        outcome
    }

    async fn try_refresh(&self, stale: &Product) -> ItemOutcome {
        let fresh = match self.upstream.fetch_by_id(&stale.id).await {
            Ok(p) => p.refreshed_at(self.clock.now()),
            Err(CatalogError::NotFound(_)) => {
                // kept as is; the mirror never evicts
                debug!(id = %stale.id, "refresh: upstream no longer lists product");
                return ItemOutcome::NotFound;
            }
            Err(CatalogError::UpstreamUnavailable(reason)) => {
                warn!(id = %stale.id, %reason, "refresh: upstream unavailable");
                return ItemOutcome::Unavailable;
            }
            Err(CatalogError::Schema(e)) => {
                warn!(id = %stale.id, error = %e, "refresh: upstream payload rejected");
                return ItemOutcome::Rejected;
            }
            Err(e) => {
                error!(id = %stale.id, error = %e, "refresh: fetch failed");
                return ItemOutcome::Failed;
            }
        };

        match self.store.upsert(&fresh).await {
            Ok(()) => ItemOutcome::Refreshed,
            Err(e @ CatalogError::Conflict { .. }) => {
                warn!(id = %fresh.id, error = %e, "refresh: ean conflict; skipping");
                ItemOutcome::Conflict
            }
            Err(e) => {
                error!(id = %fresh.id, error = %e, "refresh: write failed");
                ItemOutcome::Failed
            }
        }
    }

    /// Timer loop until `shutdown` flips to true. Each tick runs on its own
    /// task so a slow batch makes the next tick skip rather than pile up.
    pub async fn run(self: Arc<Self>, interval: Duration, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        info!(
            interval_secs = interval.as_secs(),
            stale_after_secs = self.config.stale_after.num_seconds(),
            batch_limit = self.config.batch_limit,
            "refresh: scheduler started"
        );

        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("refresh: shutdown");
                        break;
                    }
                }
                _ = ticker.tick() => {
                    let me = self.clone();
                    tokio::spawn(
                        async move {
                            me.tick().await;
                        }
                        .instrument(info_span!("refresh.tick")),
                    );
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database_ops::db::Db;
    use crate::database_ops::product::fixtures::{product, t0};
    use crate::database_ops::upstream::fake::{Scripted, ScriptedUpstream};
    use crate::util::clock::ManualClock;

    struct Harness {
        scheduler: Arc<RefreshScheduler>,
        store: CatalogStore,
        upstream: Arc<ScriptedUpstream>,
        clock: Arc<ManualClock>,
    }

    async fn harness() -> Harness {
        harness_with_limit(100).await
    }

    async fn harness_with_limit(batch_limit: i64) -> Harness {
        let store = CatalogStore::new(Db::connect_in_memory().await.unwrap());
        let upstream = Arc::new(ScriptedUpstream::new());
        let clock = Arc::new(ManualClock::new(t0()));
        let config = RefreshConfig {
            stale_after: chrono::Duration::hours(1),
            interval: Duration::from_secs(3600),
            batch_limit,
            concurrency: 2,
        };
        let scheduler = Arc::new(RefreshScheduler::new(
            store.clone(),
            upstream.clone(),
            clock.clone(),
            config,
        ));
        Harness {
            scheduler,
            store,
            upstream,
            clock,
        }
    }

    #[tokio::test]
    async fn one_failing_item_does_not_abort_the_batch() {
        let h = harness().await;
        for id in ["a", "b", "c", "d"] {
            h.store.upsert(&product(id, None, "Old")).await.unwrap();
        }
        h.clock.advance(chrono::Duration::hours(2));
        h.upstream.found(product("a", None, "New a"));
        h.upstream.script("b", Scripted::Down);
        h.upstream.found(product("c", None, "New c"));
        h.upstream.script("d", Scripted::Missing);

        let outcome = h.scheduler.tick().await;
        let TickOutcome::Completed(report) = outcome else {
            panic!("expected a completed tick, got {outcome:?}");
        };
        assert_eq!(report.examined, 4);
        assert_eq!(report.refreshed, 2);
        assert_eq!(report.unavailable, 1);
        assert_eq!(report.not_found, 1);

        let now = t0() + chrono::Duration::hours(2);
        for id in ["a", "c"] {
            let p = h.store.get_by_id(id).await.unwrap().unwrap();
            assert_eq!(p.name, format!("New {id}"));
            assert_eq!(p.last_refreshed, now);
        }
        for id in ["b", "d"] {
            let p = h.store.get_by_id(id).await.unwrap().unwrap();
            assert_eq!(p.name, "Old");
            assert_eq!(p.last_refreshed, t0());
        }
    }

    #[tokio::test]
    async fn items_that_keep_failing_do_not_starve_the_rest() {
        let h = harness_with_limit(2).await;
        h.store.upsert(&product("gone-1", None, "Old")).await.unwrap();
        h.store.upsert(&product("gone-2", None, "Old")).await.unwrap();
        h.store
            .upsert(&product("live", None, "Old").refreshed_at(t0() + chrono::Duration::minutes(1)))
            .await
            .unwrap();
        h.clock.advance(chrono::Duration::hours(3));
        h.upstream.script("gone-1", Scripted::Missing);
        h.upstream.script("gone-2", Scripted::Missing);
        h.upstream.found(product("live", None, "New"));

        let TickOutcome::Completed(first) = h.scheduler.tick().await else {
            panic!("first tick did not complete");
        };
        assert_eq!(first.examined, 2);
        assert_eq!(first.not_found, 2);

        h.clock.advance(chrono::Duration::minutes(1));
        let TickOutcome::Completed(second) = h.scheduler.tick().await else {
            panic!("second tick did not complete");
        };
        assert_eq!(second.refreshed, 1);
        assert_eq!(h.store.get_by_id("live").await.unwrap().unwrap().name, "New");

        // delisted rows stay mirrored and keep being retried
        let gone = h.store.get_by_id("gone-1").await.unwrap().unwrap();
        assert_eq!(gone.last_refreshed, t0());
        let stale = h
            .store
            .list_stale(chrono::Duration::hours(1), h.clock.now(), 10)
            .await
            .unwrap();
        assert_eq!(stale.len(), 2);
    }

    #[tokio::test]
    async fn rejected_payload_keeps_the_stored_copy() {
        let h = harness().await;
        let original = product("a", Some("8410000000017"), "Tomate frito");
        h.store.upsert(&original).await.unwrap();
        h.clock.advance(chrono::Duration::hours(2));
        h.upstream.script("a", Scripted::Invalid);

        let TickOutcome::Completed(report) = h.scheduler.tick().await else {
            panic!("tick did not complete");
        };
        assert_eq!(report.rejected, 1);
        assert_eq!(report.refreshed, 0);
        assert_eq!(h.store.get_by_id("a").await.unwrap(), Some(original));
    }

    #[tokio::test]
    async fn fresh_rows_are_left_alone() {
        let h = harness().await;
        h.store.upsert(&product("a", None, "Old")).await.unwrap();
        h.clock.advance(chrono::Duration::minutes(30));

        let outcome = h.scheduler.tick().await;
        assert_eq!(outcome, TickOutcome::Completed(RefreshReport::default()));
        assert_eq!(h.upstream.fetches(), 0);
    }

    #[tokio::test]
    async fn conflicts_are_counted_and_skipped() {
        let h = harness().await;
        h.store.upsert(&product("a", Some("1"), "A")).await.unwrap();
        h.store.upsert(&product("b", Some("2"), "B")).await.unwrap();
        h.clock.advance(chrono::Duration::hours(2));
        // upstream moved ean 2 onto product a
        h.upstream.found(product("a", Some("2"), "A"));
        h.upstream.found(product("b", Some("2"), "B"));

        let TickOutcome::Completed(report) = h.scheduler.tick().await else {
            panic!("tick did not complete");
        };
        assert_eq!(report.conflicts, 1);
        assert_eq!(report.refreshed, 1);
        assert_eq!(h.store.get_by_ean("2").await.unwrap().unwrap().id, "b");
    }

    #[tokio::test]
    async fn overlapping_tick_is_skipped_not_queued() {
        let h = harness().await;
        h.store.upsert(&product("a", None, "Old")).await.unwrap();
        h.clock.advance(chrono::Duration::hours(2));
        h.upstream.found(product("a", None, "New"));
        let (entered, release) = h.upstream.hold_fetches();

        let first = {
            let scheduler = h.scheduler.clone();
            tokio::spawn(async move { scheduler.tick().await })
        };
        entered.notified().await;
        assert!(h.scheduler.is_running());

        assert_eq!(h.scheduler.tick().await, TickOutcome::Skipped);

        release.notify_one();
        let TickOutcome::Completed(report) = first.await.unwrap() else {
            panic!("first tick did not complete");
        };
        assert_eq!(report.refreshed, 1);
        assert!(!h.scheduler.is_running());
        assert_eq!(h.upstream.fetches(), 1);
    }

    #[tokio::test]
    async fn run_loop_stops_on_shutdown() {
        let h = harness().await;
        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(h.scheduler.clone().run(Duration::from_secs(3600), rx));
        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("scheduler did not stop")
            .unwrap();
    }
}
