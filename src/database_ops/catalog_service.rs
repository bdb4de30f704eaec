//! Read path used by request handlers.
//!
//! Lookup order for every query:
//! 1. local store; a fresh hit is returned as is
//! 2. on a miss or a stale hit, the upstream, synchronously
//! 3. upstream success is written back and returned
//! 4. upstream `NotFound` / unavailability / a rejected payload falls back to
//!    the stale local copy when there is one, otherwise the error propagates
//!
//! Stale copies are never removed on upstream `NotFound`; the store is a mirror.

use crate::database_ops::product::{CatalogQuery, Product};
use crate::database_ops::store::CatalogStore;
use crate::database_ops::upstream::{CatalogUpstream, Category, CategoryDetail};
use crate::error::{CatalogError, CatalogResult};
use crate::util::clock::Clock;
use chrono::Duration;
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolveOrigin {
    /// Fresh local hit, no upstream call.
    Local,
    /// Fetched upstream and written back.
    Upstream,
    /// Upstream failed; serving the stale local copy.
    StaleFallback,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Resolved {
    pub product: Product,
    pub origin: ResolveOrigin,
}

pub struct CatalogService {
    store: CatalogStore,
    upstream: Arc<dyn CatalogUpstream>,
    clock: Arc<dyn Clock>,
    stale_after: Duration,
    search_limit: i64,
}

impl CatalogService {
    pub fn new(
        store: CatalogStore,
        upstream: Arc<dyn CatalogUpstream>,
        clock: Arc<dyn Clock>,
        stale_after: Duration,
    ) -> Self {
        Self {
            store,
            upstream,
            clock,
            stale_after,
            search_limit: 100,
        }
    }

    pub fn with_search_limit(mut self, limit: i64) -> Self {
        self.search_limit = limit.max(1);
        self
    }

    pub fn store(&self) -> &CatalogStore {
        &self.store
    }

    pub async fn resolve(&self, query: CatalogQuery) -> CatalogResult<Resolved> {
        let query = match query {
            CatalogQuery::ById(v) => CatalogQuery::ById(v.trim().to_string()),
            CatalogQuery::ByEan(v) => CatalogQuery::ByEan(v.trim().to_string()),
            CatalogQuery::ByName(v) => CatalogQuery::ByName(v.trim().to_string()),
        };
        if query.key().is_empty() {
            return Err(CatalogError::NotFound(format!("empty {} query", query.kind())));
        }

        let mut local = self.lookup_local(&query).await?;
        if let Some(hit) = &local {
            if !hit.is_stale(self.clock.now(), self.stale_after) {
                debug!(kind = query.kind(), key = query.key(), id = %hit.id, "local hit");
                return Ok(Resolved {
                    product: hit.clone(),
                    origin: ResolveOrigin::Local,
                });
            }
        }

        match self.fetch_upstream(&query, &mut local).await {
            Ok(fresh) => {
                let fresh = fresh.refreshed_at(self.clock.now());
                self.store.upsert(&fresh).await?;
                info!(kind = query.kind(), key = query.key(), id = %fresh.id, "mirrored from upstream");
                Ok(Resolved {
                    product: fresh,
                    origin: ResolveOrigin::Upstream,
                })
            }
            Err(err) if err.is_degradable() => match local {
                Some(stale) => {
                    warn!(
                        kind = query.kind(),
                        key = query.key(),
                        id = %stale.id,
                        error = %err,
                        "upstream failed; serving stale copy"
                    );
                    Ok(Resolved {
                        product: stale,
                        origin: ResolveOrigin::StaleFallback,
                    })
                }
                None => Err(err),
            },
            Err(err) => Err(err),
        }
    }

    async fn lookup_local(&self, query: &CatalogQuery) -> CatalogResult<Option<Product>> {
        match query {
            CatalogQuery::ById(id) => self.store.get_by_id(id).await,
            CatalogQuery::ByEan(ean) => self.store.get_by_ean(ean).await,
            CatalogQuery::ByName(text) => {
                Ok(self.store.search_by_name(text, 1).await?.into_iter().next())
            }
        }
    }

    /// Clears `local` when the stale copy turns out to no longer answer the
    /// query, so the caller does not fall back to it.
    async fn fetch_upstream(
        &self,
        query: &CatalogQuery,
        local: &mut Option<Product>,
    ) -> CatalogResult<Product> {
        match query {
            CatalogQuery::ById(id) => self.upstream.fetch_by_id(id).await,
            CatalogQuery::ByEan(ean) => {
                let Some(stale_id) = local.as_ref().map(|p| p.id.clone()) else {
                    return self.fetch_by_ean(ean).await;
                };
                // a known id is the precise way back to the same record
                let fresh = self.upstream.fetch_by_id(&stale_id).await?;
                if fresh.ean.as_deref() == Some(ean.as_str()) {
                    return Ok(fresh);
                }
                warn!(
                    ean = %ean,
                    id = %stale_id,
                    current_ean = ?fresh.ean,
                    "upstream moved the ean off the stored product"
                );
                *local = None;
                self.mirror_all(vec![fresh]).await;
                self.fetch_by_ean(ean).await
            }
            CatalogQuery::ByName(text) => self.fetch_by_name(text).await,
        }
    }

    /// Upstream search filtered to an exact EAN match.
    async fn fetch_by_ean(&self, ean: &str) -> CatalogResult<Product> {
        let page = self.upstream.search(ean).await?;
        for item in page {
            match item {
                Ok(p) if p.ean.as_deref() == Some(ean) => return Ok(p),
                Ok(_) => {}
                Err(e) => debug!(ean = %ean, error = %e, "skipping invalid search item"),
            }
        }
        Err(CatalogError::NotFound(format!("ean {ean}")))
    }

    /// Upstream name search. Every valid hit is mirrored; the first whose
    /// name contains `text` (case-insensitive) is returned, else the first hit.
    async fn fetch_by_name(&self, text: &str) -> CatalogResult<Product> {
        let page = self.upstream.search(text).await?;
        let needle = text.to_lowercase();
        let mut hits: Vec<Product> = Vec::new();
        for item in page {
            match item {
                Ok(p) => hits.push(p),
                Err(e) => debug!(query = %text, error = %e, "skipping invalid search item"),
            }
        }
        let chosen = hits
            .iter()
            .position(|p| p.name.to_lowercase().contains(&needle))
            .or(if hits.is_empty() { None } else { Some(0) })
            .ok_or_else(|| CatalogError::NotFound(format!("name {text}")))?;

        let chosen = hits.swap_remove(chosen);
        self.mirror_all(hits).await;
        Ok(chosen)
    }

    /// Best-effort write-back of secondary search hits; conflicts are logged.
    async fn mirror_all(&self, products: Vec<Product>) -> usize {
        let now = self.clock.now();
        let mut written = 0;
        for p in products {
            let p = p.refreshed_at(now);
            match self.store.upsert(&p).await {
                Ok(()) => written += 1,
                Err(e) => warn!(id = %p.id, error = %e, "could not mirror search hit"),
            }
        }
        written
    }

    /// Multi-word search over the mirror. When nothing matches locally the
    /// upstream is searched once, its hits mirrored, and the local search rerun.
    pub async fn search(&self, query: &str) -> CatalogResult<Vec<Product>> {
        let query = query.trim();
        if query.is_empty() {
            return Ok(Vec::new());
        }
        let local = self.store.search(query, self.search_limit).await?;
        if !local.is_empty() {
            return Ok(local);
        }

        let page = match self.upstream.search(query).await {
            Ok(page) => page,
            Err(e) if e.is_degradable() => {
                warn!(query, error = %e, "upstream search failed; returning local results only");
                return Ok(local);
            }
            Err(e) => return Err(e),
        };
        let hits: Vec<Product> = page
            .filter_map(|item| match item {
                Ok(p) => Some(p),
                Err(e) => {
                    debug!(query, error = %e, "skipping invalid search item");
                    None
                }
            })
            .collect();
        let written = self.mirror_all(hits).await;
        info!(query, written, "mirrored upstream search hits");
        self.store.search(query, self.search_limit).await
    }

    /// Category tree straight from the upstream (not mirrored).
    pub async fn categories(&self) -> CatalogResult<Vec<Category>> {
        self.upstream.list_categories().await
    }

    pub async fn category(&self, id: i64) -> CatalogResult<CategoryDetail> {
        self.upstream.category_detail(id).await
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
        service: CatalogService,
        upstream: Arc<ScriptedUpstream>,
        clock: Arc<ManualClock>,
    }

    async fn harness() -> Harness {
        let store = CatalogStore::new(Db::connect_in_memory().await.unwrap());
        let upstream = Arc::new(ScriptedUpstream::new());
        let clock = Arc::new(ManualClock::new(t0()));
        let service = CatalogService::new(
            store,
            upstream.clone(),
            clock.clone(),
            Duration::hours(24),
        );
        Harness {
            service,
            upstream,
            clock,
        }
    }

    #[tokio::test]
    async fn miss_fetches_upstream_and_stores_it() {
        let h = harness().await;
        h.clock.advance(Duration::minutes(5));
        h.upstream.found(product("42", Some("8410"), "Aceite de oliva"));

        let got = h.service.resolve(CatalogQuery::ById("42".into())).await.unwrap();
        assert_eq!(got.origin, ResolveOrigin::Upstream);
        assert_eq!(got.product.last_refreshed, t0() + Duration::minutes(5));

        let stored = h.service.store().get_by_id("42").await.unwrap().unwrap();
        assert_eq!(stored, got.product);
    }

    #[tokio::test]
    async fn fresh_hit_skips_upstream() {
        let h = harness().await;
        h.service
            .store()
            .upsert(&product("42", None, "Aceite"))
            .await
            .unwrap();
        h.clock.advance(Duration::hours(23));

        let got = h.service.resolve(CatalogQuery::ById("42".into())).await.unwrap();
        assert_eq!(got.origin, ResolveOrigin::Local);
        assert_eq!(h.upstream.fetches(), 0);
    }

    #[tokio::test]
    async fn stale_hit_survives_upstream_outage() {
        let h = harness().await;
        let stale = product("42", None, "Aceite");
        h.service.store().upsert(&stale).await.unwrap();
        h.clock.advance(Duration::days(2));
        h.upstream.script("42", Scripted::Down);

        let got = h.service.resolve(CatalogQuery::ById("42".into())).await.unwrap();
        assert_eq!(got.origin, ResolveOrigin::StaleFallback);
        assert_eq!(got.product, stale);
        assert_eq!(h.upstream.fetches(), 1);
    }

    #[tokio::test]
    async fn stale_hit_is_kept_when_upstream_forgets_it() {
        let h = harness().await;
        let stale = product("42", None, "Aceite");
        h.service.store().upsert(&stale).await.unwrap();
        h.clock.advance(Duration::days(2));
        h.upstream.script("42", Scripted::Missing);

        let got = h.service.resolve(CatalogQuery::ById("42".into())).await.unwrap();
        assert_eq!(got.origin, ResolveOrigin::StaleFallback);
        assert_eq!(h.service.store().get_by_id("42").await.unwrap(), Some(stale));
    }

    #[tokio::test]
    async fn stale_hit_is_refreshed_when_upstream_answers() {
        let h = harness().await;
        h.service
            .store()
            .upsert(&product("42", None, "Aceite"))
            .await
            .unwrap();
        h.clock.advance(Duration::days(2));
        let mut newer = product("42", None, "Aceite de oliva virgen");
        newer.category = Some("Aceites".into());
        h.upstream.found(newer);

        let got = h.service.resolve(CatalogQuery::ById("42".into())).await.unwrap();
        assert_eq!(got.origin, ResolveOrigin::Upstream);
        let stored = h.service.store().get_by_id("42").await.unwrap().unwrap();
        assert_eq!(stored.name, "Aceite de oliva virgen");
        assert_eq!(stored.last_refreshed, t0() + Duration::days(2));
    }

    #[tokio::test]
    async fn absent_everywhere_is_not_found() {
        let h = harness().await;
        let err = h
            .service
            .resolve(CatalogQuery::ById("missing".into()))
            .await
            .unwrap_err();
        assert!(err.is_not_found());

        h.upstream.script("down", Scripted::Down);
        let err = h
            .service
            .resolve(CatalogQuery::ById("down".into()))
            .await
            .unwrap_err();
        assert!(matches!(err, CatalogError::UpstreamUnavailable(_)));
        assert_eq!(h.service.store().count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn blank_query_is_not_found_without_io() {
        let h = harness().await;
        let err = h
            .service
            .resolve(CatalogQuery::ByEan("   ".into()))
            .await
            .unwrap_err();
        assert!(err.is_not_found());
        assert_eq!(h.upstream.fetches(), 0);
    }

    #[tokio::test]
    async fn ean_miss_is_found_through_upstream_search() {
        let h = harness().await;
        h.upstream.search_results(
            "8480000103819",
            vec![
                product("1", Some("1111"), "Leche entera"),
                product("2", Some("8480000103819"), "Leche semidesnatada"),
            ],
        );

        let got = h
            .service
            .resolve(CatalogQuery::ByEan("8480000103819".into()))
            .await
            .unwrap();
        assert_eq!(got.product.id, "2");
        assert!(h
            .service
            .store()
            .get_by_ean("8480000103819")
            .await
            .unwrap()
            .is_some());

        let err = h
            .service
            .resolve(CatalogQuery::ByEan("0000".into()))
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn stale_ean_hit_refreshes_by_id() {
        let h = harness().await;
        h.service
            .store()
            .upsert(&product("2", Some("848"), "Leche"))
            .await
            .unwrap();
        h.clock.advance(Duration::days(3));
        h.upstream.found(product("2", Some("848"), "Leche fresca"));

        let got = h
            .service
            .resolve(CatalogQuery::ByEan("848".into()))
            .await
            .unwrap();
        assert_eq!(got.product.name, "Leche fresca");
        assert_eq!(h.upstream.fetches(), 1);
    }

    #[tokio::test]
    async fn stale_ean_moved_upstream_resolves_to_new_owner() {
        let h = harness().await;
        let store = h.service.store();
        store.upsert(&product("2", Some("848"), "Leche")).await.unwrap();
        h.clock.advance(Duration::days(3));
        h.upstream.found(product("2", None, "Leche sin código"));
        h.upstream
            .search_results("848", vec![product("9", Some("848"), "Leche nueva")]);

        let got = h
            .service
            .resolve(CatalogQuery::ByEan("848".into()))
            .await
            .unwrap();
        assert_eq!(got.origin, ResolveOrigin::Upstream);
        assert_eq!(got.product.id, "9");
        assert_eq!(store.get_by_ean("848").await.unwrap().unwrap().id, "9");
        assert_eq!(store.get_by_id("2").await.unwrap().unwrap().ean, None);
    }

    #[tokio::test]
    async fn stale_ean_moved_upstream_without_new_owner_is_not_found() {
        let h = harness().await;
        let store = h.service.store();
        store.upsert(&product("2", Some("848"), "Leche")).await.unwrap();
        h.clock.advance(Duration::days(3));
        h.upstream.found(product("2", Some("111"), "Leche"));

        let err = h
            .service
            .resolve(CatalogQuery::ByEan("848".into()))
            .await
            .unwrap_err();
        assert!(err.is_not_found(), "{err:?}");
        assert_eq!(store.get_by_ean("848").await.unwrap(), None);
    }

    #[tokio::test]
    async fn resolved_product_matches_stored_copy_at_sub_millisecond_time() {
        let store = CatalogStore::new(Db::connect_in_memory().await.unwrap());
        let upstream = Arc::new(ScriptedUpstream::new());
        let clock = Arc::new(ManualClock::new(t0() + Duration::nanoseconds(987_654_321)));
        let service = CatalogService::new(store, upstream.clone(), clock, Duration::hours(24));
        upstream.found(product("42", None, "Aceite de oliva"));

        let got = service.resolve(CatalogQuery::ById("42".into())).await.unwrap();
        let stored = service.store().get_by_id("42").await.unwrap().unwrap();
        assert_eq!(stored, got.product);
        assert_eq!(stored.last_refreshed, t0() + Duration::milliseconds(987));
    }

    #[tokio::test]
    async fn name_miss_mirrors_every_search_hit() {
        let h = harness().await;
        h.upstream.search_results(
            "yogur",
            vec![
                product("7", None, "Postre de chocolate"),
                product("8", None, "Yogur griego"),
                product("9", None, "Yogur natural"),
            ],
        );

        let got = h
            .service
            .resolve(CatalogQuery::ByName("yogur".into()))
            .await
            .unwrap();
        assert_eq!(got.product.id, "8");
        assert_eq!(h.service.store().count().await.unwrap(), 3);

        let again = h
            .service
            .resolve(CatalogQuery::ByName("yogur".into()))
            .await
            .unwrap();
        assert_eq!(again.origin, ResolveOrigin::Local);
        assert_eq!(again.product.id, "8");
    }

    #[tokio::test]
    async fn write_back_conflict_propagates() {
        let h = harness().await;
        h.service
            .store()
            .upsert(&product("1", Some("999"), "Galletas"))
            .await
            .unwrap();
        h.upstream.found(product("2", Some("999"), "Galletas María"));

        let err = h
            .service
            .resolve(CatalogQuery::ById("2".into()))
            .await
            .unwrap_err();
        assert!(matches!(err, CatalogError::Conflict { .. }), "{err:?}");
        assert_eq!(h.service.store().get_by_id("2").await.unwrap(), None);
    }

    #[tokio::test]
    async fn search_falls_back_to_upstream_when_local_is_empty() {
        let h = harness().await;
        h.upstream.search_results(
            "queso curado",
            vec![
                product("5", None, "Queso curado mezcla"),
                product("6", None, "Queso fresco"),
            ],
        );

        let hits = h.service.search("queso curado").await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].id, "5");
        assert_eq!(h.service.store().count().await.unwrap(), 2);

        h.upstream.set_search_down(true);
        assert!(h.service.search("jamón").await.unwrap().is_empty());
    }
}
