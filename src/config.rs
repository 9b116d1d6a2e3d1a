use serde::Deserialize;
use std::time::Duration;

/// Application configuration loaded from environment variables
#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    /// Redis connection URL (durable document store)
    #[serde(default = "default_redis_url")]
    pub redis_url: String,

    /// Catalog API key (TMDB v3)
    pub tmdb_api_key: String,

    /// Catalog API base URL
    #[serde(default = "default_tmdb_api_url")]
    pub tmdb_api_url: String,

    /// Critic score API key (OMDb). Enrichment of critic scores is skipped without it.
    #[serde(default)]
    pub omdb_api_key: Option<String>,

    /// Critic score API base URL
    #[serde(default = "default_omdb_api_url")]
    pub omdb_api_url: String,

    /// Server host address
    #[serde(default = "default_host")]
    pub host: String,

    /// Server port
    #[serde(default = "default_port")]
    pub port: u16,

    /// Identity under which discovery cursors are persisted remotely.
    /// Cursors stay process-local when unset.
    #[serde(default)]
    pub feed_user_id: Option<String>,

    /// Report cache misses instead of serving the in-process fallback
    #[serde(default)]
    pub require_durable_cache: bool,

    #[serde(default = "default_fallback_cache_capacity")]
    pub fallback_cache_capacity: usize,

    #[serde(default = "default_cache_retention_secs")]
    pub cache_retention_secs: u64,

    #[serde(default = "default_upstream_page_ttl_secs")]
    pub upstream_page_ttl_secs: u64,

    #[serde(default = "default_enrichment_ttl_secs")]
    pub enrichment_ttl_secs: u64,

    #[serde(default = "default_snapshot_ttl_secs")]
    pub snapshot_ttl_secs: u64,

    /// Upstream pages pulled into each catalog snapshot refresh
    #[serde(default = "default_snapshot_pages")]
    pub snapshot_pages: u32,

    #[serde(default = "default_new_release_window_days")]
    pub new_release_window_days: i64,

    #[serde(default = "default_initial_page_ceiling")]
    pub initial_page_ceiling: u32,

    #[serde(default = "default_page_ceiling_increment")]
    pub page_ceiling_increment: u32,

    #[serde(default = "default_absolute_page_ceiling")]
    pub absolute_page_ceiling: u32,

    #[serde(default = "default_cursor_history_cap")]
    pub cursor_history_cap: usize,

    #[serde(default = "default_cursor_debounce_ms")]
    pub cursor_debounce_ms: u64,

    #[serde(default = "default_enrichment_concurrency")]
    pub enrichment_concurrency: usize,

    #[serde(default = "default_enrichment_batch_cap")]
    pub enrichment_batch_cap: usize,

    #[serde(default = "default_rate_limit_backoff_secs")]
    pub rate_limit_backoff_secs: u64,

    #[serde(default = "default_feed_size")]
    pub default_feed_size: usize,
}

fn default_redis_url() -> String {
    "redis://localhost:6379".to_string()
}

fn default_tmdb_api_url() -> String {
    "https://api.themoviedb.org/3".to_string()
}

fn default_omdb_api_url() -> String {
    "https://www.omdbapi.com".to_string()
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    3000
}

fn default_fallback_cache_capacity() -> usize {
    500
}

fn default_cache_retention_secs() -> u64 {
    30 * 24 * 3600
}

fn default_upstream_page_ttl_secs() -> u64 {
    6 * 3600
}

fn default_enrichment_ttl_secs() -> u64 {
    7 * 24 * 3600
}

fn default_snapshot_ttl_secs() -> u64 {
    24 * 3600
}

fn default_snapshot_pages() -> u32 {
    5
}

fn default_new_release_window_days() -> i64 {
    60
}

fn default_initial_page_ceiling() -> u32 {
    5
}

fn default_page_ceiling_increment() -> u32 {
    5
}

fn default_absolute_page_ceiling() -> u32 {
    40
}

fn default_cursor_history_cap() -> usize {
    50
}

fn default_cursor_debounce_ms() -> u64 {
    1500
}

fn default_enrichment_concurrency() -> usize {
    4
}

fn default_enrichment_batch_cap() -> usize {
    20
}

fn default_rate_limit_backoff_secs() -> u64 {
    60
}

fn default_feed_size() -> usize {
    12
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();
        envy::from_env::<Config>().map_err(|e| anyhow::anyhow!("Failed to load config: {}", e))
    }

    pub fn cache(&self) -> CacheSettings {
        CacheSettings {
            require_durable: self.require_durable_cache,
            fallback_capacity: self.fallback_cache_capacity,
            retention_secs: self.cache_retention_secs,
            upstream_ttl_secs: self.upstream_page_ttl_secs,
            enrichment_ttl_secs: self.enrichment_ttl_secs,
        }
    }

    pub fn catalog(&self) -> CatalogSettings {
        CatalogSettings {
            snapshot_ttl_secs: self.snapshot_ttl_secs,
            snapshot_pages: self.snapshot_pages,
            new_release_window_days: self.new_release_window_days,
        }
    }

    pub fn discovery(&self) -> DiscoverySettings {
        DiscoverySettings {
            initial_page_ceiling: self.initial_page_ceiling,
            page_ceiling_increment: self.page_ceiling_increment,
            absolute_page_ceiling: self.absolute_page_ceiling,
            history_cap: self.cursor_history_cap,
            debounce: Duration::from_millis(self.cursor_debounce_ms),
            rate_limit_backoff_secs: self.rate_limit_backoff_secs,
            user_id: self.feed_user_id.clone(),
        }
    }

    pub fn enrichment(&self) -> EnrichmentSettings {
        EnrichmentSettings {
            concurrency: self.enrichment_concurrency,
            batch_cap: self.enrichment_batch_cap,
            rate_limit_backoff_secs: self.rate_limit_backoff_secs,
        }
    }
}

/// Tiered response cache tuning
#[derive(Debug, Clone)]
pub struct CacheSettings {
    pub require_durable: bool,
    pub fallback_capacity: usize,
    /// Expiry applied to durable documents; reads apply their own, shorter TTL
    pub retention_secs: u64,
    pub upstream_ttl_secs: u64,
    pub enrichment_ttl_secs: u64,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            require_durable: false,
            fallback_capacity: default_fallback_cache_capacity(),
            retention_secs: default_cache_retention_secs(),
            upstream_ttl_secs: default_upstream_page_ttl_secs(),
            enrichment_ttl_secs: default_enrichment_ttl_secs(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CatalogSettings {
    pub snapshot_ttl_secs: u64,
    pub snapshot_pages: u32,
    pub new_release_window_days: i64,
}

impl Default for CatalogSettings {
    fn default() -> Self {
        Self {
            snapshot_ttl_secs: default_snapshot_ttl_secs(),
            snapshot_pages: default_snapshot_pages(),
            new_release_window_days: default_new_release_window_days(),
        }
    }
}

/// Discovery cursor tuning. The ceiling constants are heuristics, not contract.
#[derive(Debug, Clone)]
pub struct DiscoverySettings {
    pub initial_page_ceiling: u32,
    pub page_ceiling_increment: u32,
    pub absolute_page_ceiling: u32,
    pub history_cap: usize,
    pub debounce: Duration,
    pub rate_limit_backoff_secs: u64,
    pub user_id: Option<String>,
}

impl Default for DiscoverySettings {
    fn default() -> Self {
        Self {
            initial_page_ceiling: default_initial_page_ceiling(),
            page_ceiling_increment: default_page_ceiling_increment(),
            absolute_page_ceiling: default_absolute_page_ceiling(),
            history_cap: default_cursor_history_cap(),
            debounce: Duration::from_millis(default_cursor_debounce_ms()),
            rate_limit_backoff_secs: default_rate_limit_backoff_secs(),
            user_id: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct EnrichmentSettings {
    pub concurrency: usize,
    pub batch_cap: usize,
    pub rate_limit_backoff_secs: u64,
}

impl Default for EnrichmentSettings {
    fn default() -> Self {
        Self {
            concurrency: default_enrichment_concurrency(),
            batch_cap: default_enrichment_batch_cap(),
            rate_limit_backoff_secs: default_rate_limit_backoff_secs(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_applied_when_only_api_key_set() {
        let vars = vec![("TMDB_API_KEY".to_string(), "secret".to_string())];
        let config: Config = envy::from_iter(vars).unwrap();

        assert_eq!(config.tmdb_api_key, "secret");
        assert_eq!(config.port, 3000);
        assert!(!config.require_durable_cache);
        assert_eq!(config.omdb_api_key, None);
        assert_eq!(config.discovery().absolute_page_ceiling, 40);
        assert_eq!(config.enrichment().concurrency, 4);
    }

    #[test]
    fn test_overrides_flow_into_component_settings() {
        let vars = vec![
            ("TMDB_API_KEY".to_string(), "secret".to_string()),
            ("REQUIRE_DURABLE_CACHE".to_string(), "true".to_string()),
            ("PAGE_CEILING_INCREMENT".to_string(), "3".to_string()),
            ("CURSOR_DEBOUNCE_MS".to_string(), "250".to_string()),
            ("FEED_USER_ID".to_string(), "alice".to_string()),
        ];
        let config: Config = envy::from_iter(vars).unwrap();

        assert!(config.cache().require_durable);
        let discovery = config.discovery();
        assert_eq!(discovery.page_ceiling_increment, 3);
        assert_eq!(discovery.debounce, Duration::from_millis(250));
        assert_eq!(discovery.user_id.as_deref(), Some("alice"));
    }
}
