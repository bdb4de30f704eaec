// HTTP API server binary for the catalog mirror
// Serves lookups for the mobile client and runs the background refresher

use actix_web::web;
use anyhow::{Context, Result};
use grocery_mirror::api::{ApiServer, AppState};
use grocery_mirror::config::MirrorConfig;
use grocery_mirror::database_ops::db::Db;
use grocery_mirror::database_ops::mercadona::MercadonaClient;
use grocery_mirror::database_ops::{
    CatalogService, CatalogStore, CatalogUpstream, RefreshScheduler, SeedSync,
};
use grocery_mirror::logging::{init_tracing, DEFAULT_FILTER};
use grocery_mirror::util::clock::{Clock, SystemClock};
use grocery_mirror::util::env as env_util;
use std::sync::Arc;
use tokio::sync::watch;

#[actix_web::main]
async fn main() -> Result<()> {
    // Load dotenv/env once (safe to call multiple times)
    env_util::init_env();
    init_tracing(DEFAULT_FILTER)?;

    tracing::info!("Initializing catalog mirror API server");

    let config = MirrorConfig::from_env();
    let server = ApiServer::from_env()?;

    let db = Db::connect(&config.database_url, config.max_connections)
        .await
        .with_context(|| format!("opening {}", config.database_url))?;
    tracing::info!("Database connected successfully");

    let store = CatalogStore::new(db);
    let upstream: Arc<dyn CatalogUpstream> = Arc::new(MercadonaClient::new(&config.upstream)?);
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);

    let service = CatalogService::new(
        store.clone(),
        upstream.clone(),
        clock.clone(),
        config.refresh.stale_after,
    );
    let scheduler = RefreshScheduler::new(
        store.clone(),
        upstream.clone(),
        clock.clone(),
        config.refresh.clone(),
    );
    let sync = SeedSync::new(store.clone(), upstream, clock, config.sync.clone());
    let state = web::Data::new(AppState::new(service, scheduler, sync));

    if config.sync.on_empty && store.count().await? == 0 {
        tracing::info!("store is empty; starting seed sync in the background");
        state.spawn_sync("startup");
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let refresher = tokio::spawn(
        state
            .scheduler
            .clone()
            .run(config.refresh.interval, shutdown_rx),
    );

    let served = server.run(state).await;

    // stop the refresher whether the server exited cleanly or not
    let _ = shutdown_tx.send(true);
    if let Err(e) = refresher.await {
        tracing::warn!(error = %e, "refresh loop ended abnormally");
    }
    tracing::info!("API server stopped");

    served
}
