// Runtime configuration collected from the environment (.env supported)

use crate::util::env::{db_url, env_flag, env_opt, env_parse};
use std::time::Duration;

pub const DEFAULT_UPSTREAM_BASE_URL: &str = "https://tienda.mercadona.es/api";
// The upstream blocks obviously scripted clients.
/// Upper bound for `STALE_AFTER_SECS` (100 years); larger values overflow date math.
pub const MAX_STALE_AFTER_SECS: i64 = 100 * 365 * 86_400;
pub const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/123.0.0.0 Safari/537.36";

#[derive(Debug, Clone)]
pub struct UpstreamConfig {
    pub base_url: String,
    /// Full search endpoint; defaults to `{base_url}/search/`.
    pub search_url: Option<String>,
    pub timeout: Duration,
    pub user_agent: String,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_UPSTREAM_BASE_URL.to_string(),
            search_url: None,
            timeout: Duration::from_secs(20),
            user_agent: DEFAULT_USER_AGENT.to_string(),
        }
    }
}

pub fn stale_after_from_secs(secs: i64) -> chrono::Duration {
    chrono::Duration::seconds(secs.clamp(0, MAX_STALE_AFTER_SECS))
}

#[derive(Debug, Clone)]
pub struct RefreshConfig {
    /// A record is stale once `now - last_refreshed` exceeds this.
    pub stale_after: chrono::Duration,
    pub interval: Duration,
    pub batch_limit: i64,
    pub concurrency: usize,
}

impl Default for RefreshConfig {
    fn default() -> Self {
        Self {
            stale_after: chrono::Duration::hours(24),
            interval: Duration::from_secs(3600),
            batch_limit: 500,
            concurrency: 5,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub concurrency: usize,
    pub jitter_min_ms: u64,
    pub jitter_max_ms: u64,
    /// Run a seed sync at startup when the store holds no products.
    pub on_empty: bool,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            concurrency: 5,
            jitter_min_ms: 500,
            jitter_max_ms: 1500,
            on_empty: true,
        }
    }
}

#[derive(Debug, Clone)]
pub struct MirrorConfig {
    pub database_url: String,
    pub max_connections: u32,
    pub upstream: UpstreamConfig,
    pub refresh: RefreshConfig,
    pub sync: SyncConfig,
}

impl MirrorConfig {
    pub fn from_env() -> Self {
        let upstream_defaults = UpstreamConfig::default();
        let refresh_defaults = RefreshConfig::default();
        let sync_defaults = SyncConfig::default();

        let stale_secs: i64 = env_parse(
            "STALE_AFTER_SECS",
            refresh_defaults.stale_after.num_seconds(),
        );
        let jitter_min_ms = env_parse("SYNC_JITTER_MIN_MS", sync_defaults.jitter_min_ms);
        let jitter_max_ms = env_parse("SYNC_JITTER_MAX_MS", sync_defaults.jitter_max_ms);

        Self {
            database_url: db_url(),
            max_connections: env_parse("DB_MAX_CONNS", 5u32).max(1),
            upstream: UpstreamConfig {
                base_url: env_opt("UPSTREAM_BASE_URL").unwrap_or(upstream_defaults.base_url),
                search_url: env_opt("UPSTREAM_SEARCH_URL"),
                timeout: Duration::from_secs(
                    env_parse("UPSTREAM_TIMEOUT_SECS", upstream_defaults.timeout.as_secs()).max(1),
                ),
                user_agent: env_opt("UPSTREAM_USER_AGENT").unwrap_or(upstream_defaults.user_agent),
            },
            refresh: RefreshConfig {
                stale_after: stale_after_from_secs(stale_secs),
                interval: Duration::from_secs(
                    env_parse("REFRESH_INTERVAL_SECS", refresh_defaults.interval.as_secs()).max(1),
                ),
                batch_limit: env_parse("REFRESH_BATCH_LIMIT", refresh_defaults.batch_limit).max(1),
                concurrency: env_parse("REFRESH_CONCURRENCY", refresh_defaults.concurrency).max(1),
            },
            sync: SyncConfig {
                concurrency: env_parse("SYNC_CONCURRENCY", sync_defaults.concurrency).max(1),
                jitter_min_ms: jitter_min_ms.min(jitter_max_ms),
                jitter_max_ms: jitter_max_ms.max(jitter_min_ms),
                on_empty: env_flag("SYNC_ON_EMPTY", sync_defaults.on_empty),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_documented_values() {
        let refresh = RefreshConfig::default();
        assert_eq!(refresh.stale_after, chrono::Duration::hours(24));
        assert_eq!(refresh.interval, Duration::from_secs(3600));
        let upstream = UpstreamConfig::default();
        assert_eq!(upstream.timeout, Duration::from_secs(20));
        assert!(upstream.base_url.starts_with("https://"));
    }

    #[test]
    fn stale_threshold_is_clamped() {
        assert_eq!(stale_after_from_secs(-5), chrono::Duration::zero());
        assert_eq!(stale_after_from_secs(3600), chrono::Duration::hours(1));
        assert_eq!(
            stale_after_from_secs(1_000_000_000_000_000),
            chrono::Duration::seconds(MAX_STALE_AFTER_SECS)
        );
    }
}
