// Admin CLI for the catalog mirror: seed, refresh and inspect the local store.

use anyhow::{bail, Context, Result};
use clap::{ArgGroup, Parser, Subcommand};
use grocery_mirror::config::{stale_after_from_secs, MirrorConfig};
use grocery_mirror::database_ops::db::Db;
use grocery_mirror::database_ops::mercadona::MercadonaClient;
use grocery_mirror::database_ops::{
    CatalogQuery, CatalogService, CatalogStore, CatalogUpstream, RefreshScheduler, SeedSync,
    TickOutcome,
};
use grocery_mirror::logging::{init_tracing, DEFAULT_FILTER};
use grocery_mirror::util::clock::{Clock, SystemClock};
use grocery_mirror::util::env;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{info, info_span, Instrument};

#[derive(Parser, Debug)]
#[command(name = "grocery-mirror", version, about = "Grocery catalog mirror admin CLI")]
struct Cli {
    /// Optional override for the database URL
    #[arg(long, global = true)]
    db_url: Option<String>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
#[command(rename_all = "kebab-case")]
enum Commands {
    /// Walk the upstream category tree and mirror every product
    Sync {
        /// Override SYNC_CONCURRENCY
        #[arg(long)]
        concurrency: Option<usize>,
        /// Skip the per-request random delay
        #[arg(long, default_value_t = false)]
        no_jitter: bool,
    },
    /// Refresh stale products once, or keep refreshing on a timer
    Refresh {
        /// Override STALE_AFTER_SECS
        #[arg(long)]
        stale_after_secs: Option<i64>,
        /// Override REFRESH_BATCH_LIMIT
        #[arg(long)]
        limit: Option<i64>,
        /// Keep running on REFRESH_INTERVAL_SECS until Ctrl-C
        #[arg(long, default_value_t = false)]
        watch: bool,
    },
    /// Resolve one product (local first, upstream on miss or staleness)
    #[command(group(ArgGroup::new("key").required(true).args(["id", "ean", "name"])))]
    Lookup {
        #[arg(long)]
        id: Option<String>,
        #[arg(long)]
        ean: Option<String>,
        #[arg(long)]
        name: Option<String>,
    },
    /// Multi-word product search
    Search {
        query: String,
    },
    /// Print row count and refresh age of the mirror
    Stats,
}

/// Store, upstream client and clock wired from config.
struct Mirror {
    store: CatalogStore,
    upstream: Arc<dyn CatalogUpstream>,
    clock: Arc<dyn Clock>,
}

impl Mirror {
    async fn open(config: &MirrorConfig) -> Result<Self> {
        info!(url = %config.database_url, "connecting");
        let db = Db::connect(&config.database_url, config.max_connections)
            .await
            .with_context(|| format!("opening {}", config.database_url))?;
        Ok(Self {
            store: CatalogStore::new(db),
            upstream: Arc::new(MercadonaClient::new(&config.upstream)?),
            clock: Arc::new(SystemClock),
        })
    }

    fn service(&self, config: &MirrorConfig) -> CatalogService {
        CatalogService::new(
            self.store.clone(),
            self.upstream.clone(),
            self.clock.clone(),
            config.refresh.stale_after,
        )
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[derive(Serialize)]
struct Stats {
    products: i64,
    oldest_refresh: Option<chrono::DateTime<chrono::Utc>>,
    stale_after_secs: i64,
}

#[tokio::main]
async fn main() -> Result<()> {
    env::init_env();
    init_tracing(DEFAULT_FILTER)?;

    let cli = Cli::parse();
    let mut config = MirrorConfig::from_env();
    if let Some(url) = cli.db_url {
        config.database_url = url;
    }

    match cli.command {
        Commands::Sync {
            concurrency,
            no_jitter,
        } => {
            if let Some(n) = concurrency {
                config.sync.concurrency = n.max(1);
            }
            if no_jitter {
                config.sync.jitter_min_ms = 0;
                config.sync.jitter_max_ms = 0;
            }
            let mirror = Mirror::open(&config).await?;
            let sync = SeedSync::new(mirror.store, mirror.upstream, mirror.clock, config.sync);
            let report = sync.run().instrument(info_span!("sync")).await?;
            print_json(&report)?;
        }
        Commands::Refresh {
            stale_after_secs,
            limit,
            watch: keep_running,
        } => {
            if let Some(secs) = stale_after_secs {
                config.refresh.stale_after = stale_after_from_secs(secs);
            }
            if let Some(limit) = limit {
                config.refresh.batch_limit = limit.max(1);
            }
            let interval = config.refresh.interval;
            let mirror = Mirror::open(&config).await?;
            let scheduler = Arc::new(RefreshScheduler::new(
                mirror.store,
                mirror.upstream,
                mirror.clock,
                config.refresh,
            ));

            if keep_running {
                let (tx, rx) = watch::channel(false);
                let handle = tokio::spawn(scheduler.run(interval, rx));
                tokio::signal::ctrl_c().await.context("waiting for Ctrl-C")?;
                info!("refresh: Ctrl-C received, stopping");
                let _ = tx.send(true);
                handle.await.context("refresh loop panicked")?;
            } else {
                match scheduler.tick().instrument(info_span!("refresh.tick")).await {
                    TickOutcome::Failed { reason } => bail!("refresh failed: {reason}"),
                    outcome => print_json(&outcome)?,
                }
            }
        }
        Commands::Lookup { id, ean, name } => {
            let query = match (id, ean, name) {
                (Some(id), _, _) => CatalogQuery::ById(id),
                (_, Some(ean), _) => CatalogQuery::ByEan(ean),
                (_, _, Some(name)) => CatalogQuery::ByName(name),
                _ => bail!("one of --id, --ean or --name is required"),
            };
            let mirror = Mirror::open(&config).await?;
            let resolved = mirror.service(&config).resolve(query).await?;
            print_json(&resolved)?;
        }
        Commands::Search { query } => {
            let mirror = Mirror::open(&config).await?;
            let results = mirror.service(&config).search(&query).await?;
            info!(query = %query, hits = results.len(), "search: done");
            print_json(&results)?;
        }
        Commands::Stats => {
            let mirror = Mirror::open(&config).await?;
            print_json(&Stats {
                products: mirror.store.count().await?,
                oldest_refresh: mirror.store.oldest_refresh().await?,
                stale_after_secs: config.refresh.stale_after.num_seconds(),
            })?;
        }
    }

    Ok(())
}
