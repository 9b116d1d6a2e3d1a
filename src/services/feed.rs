use serde::Serialize;
use std::collections::HashSet;
use std::sync::Arc;

use crate::{
    config::{CatalogSettings, Config, DiscoverySettings, EnrichmentSettings},
    db::TieredCache,
    error::{AppError, AppResult},
    models::{CatalogItem, DiscoveryQuery},
    services::{
        catalog::{CatalogMetadata, CatalogStore},
        cursor::CursorStore,
        discovery::{DiscoveryEngine, StopReason},
        enrichment::EnrichmentQueue,
        providers::{CatalogProvider, CriticScoreProvider},
        ranking::{count_quality, merge_by_id, rank, select_candidates},
    },
};

#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub catalog: CatalogSettings,
    pub discovery: DiscoverySettings,
    pub enrichment: EnrichmentSettings,
    pub default_page_size: usize,
}

impl EngineSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            catalog: config.catalog(),
            discovery: config.discovery(),
            enrichment: config.enrichment(),
            default_page_size: config.default_feed_size,
        }
    }
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            catalog: CatalogSettings::default(),
            discovery: DiscoverySettings::default(),
            enrichment: EnrichmentSettings::default(),
            default_page_size: 12,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct FeedRequest {
    pub query: DiscoveryQuery,
    /// 1-based
    pub page: usize,
    /// 0 means the configured default
    pub page_size: usize,
    pub exclude_ids: HashSet<u64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct DiscoverySummary {
    pub signature: String,
    pub next_page: u32,
    pub total_pages: Option<u32>,
    pub exhausted: bool,
    pub pages_fetched: u32,
    pub stop: StopReason,
}

#[derive(Debug, Clone, Serialize)]
pub struct FeedPage {
    pub items: Vec<CatalogItem>,
    pub page: usize,
    pub page_size: usize,
    pub total_candidates: usize,
    pub has_more: bool,
    pub discovery: Option<DiscoverySummary>,
    pub catalog: CatalogMetadata,
}

/// Owns every piece of mutable discovery state for one process
pub struct FeedEngine {
    catalog: CatalogStore,
    discovery: DiscoveryEngine,
    enrichment: EnrichmentQueue,
    default_page_size: usize,
}

impl FeedEngine {
    /// Discovery cursors live in the cache's durable store, under the
    /// configured user's document or a shared local one
    pub fn new(
        catalog_provider: Arc<dyn CatalogProvider>,
        critic_provider: Arc<dyn CriticScoreProvider>,
        cache: Arc<TieredCache>,
        settings: EngineSettings,
    ) -> Self {
        let cursors = CursorStore::new(
            cache.store(),
            settings.discovery.user_id.as_deref(),
            settings.discovery.history_cap,
            settings.discovery.debounce,
        );

        Self {
            catalog: CatalogStore::new(catalog_provider.clone(), cache.clone(), settings.catalog),
            discovery: DiscoveryEngine::new(catalog_provider.clone(), cache, cursors, settings.discovery),
            enrichment: EnrichmentQueue::new(catalog_provider, critic_provider, settings.enrichment),
            default_page_size: settings.default_page_size.max(1),
        }
    }

    pub fn catalog(&self) -> &CatalogStore {
        &self.catalog
    }

    pub fn discovery(&self) -> &DiscoveryEngine {
        &self.discovery
    }

    pub fn enrichment(&self) -> &EnrichmentQueue {
        &self.enrichment
    }

    /// One page of the ranked feed
    ///
    /// Starts from the catalog snapshot and only pages through discovery when
    /// the snapshot cannot fill every page up to the requested one.
    pub async fn movies(&self, request: FeedRequest) -> AppResult<FeedPage> {
        let page = request.page.max(1);
        let page_size = match request.page_size {
            0 => self.default_page_size,
            size => size,
        };
        let needed = page.checked_mul(page_size).ok_or_else(|| {
            AppError::InvalidInput(format!("page {} of size {} is out of range", page, page_size))
        })?;

        let snapshot = match self.catalog.ensure_catalog(false, true, false).await {
            Ok(snapshot) => snapshot,
            Err(e) => {
                tracing::warn!(error = %e, "Catalog unavailable, continuing with cached snapshot");
                self.catalog.ensure_catalog(false, false, true).await?
            }
        };
        let catalog_metadata = snapshot.metadata.clone();

        let mut candidates: Vec<CatalogItem> = snapshot
            .items
            .into_iter()
            .filter(|item| request.query.matches(item) && !request.exclude_ids.contains(&item.id))
            .collect();

        let snapshot_quality = count_quality(&candidates);
        let discovery = if snapshot_quality < needed {
            tracing::debug!(snapshot_quality, needed, "Snapshot short, running discovery");
            let outcome = self
                .discovery
                .fetch_until_enough(&request.query, needed, &request.exclude_ids)
                .await;
            candidates.extend(outcome.items);
            Some(DiscoverySummary {
                signature: outcome.signature,
                next_page: outcome.cursor.next_page,
                total_pages: outcome.cursor.total_pages,
                exhausted: outcome.cursor.exhausted,
                pages_fetched: outcome.pages_fetched,
                stop: outcome.stop,
            })
        } else {
            None
        };

        let merged = self.enrichment.apply(merge_by_id(candidates));
        let ranked = rank(select_candidates(&merged, needed));
        let total_candidates = ranked.len();

        let items: Vec<CatalogItem> = ranked
            .into_iter()
            .skip(needed - page_size)
            .take(page_size)
            .collect();
        let queued = self.enrichment.enqueue(&items);

        tracing::info!(
            signature = %request.query.signature(),
            page,
            page_size,
            returned = items.len(),
            total_candidates,
            enrichment_queued = queued,
            "Feed page built"
        );

        Ok(FeedPage {
            has_more: total_candidates > needed,
            items,
            page,
            page_size,
            total_candidates,
            discovery,
            catalog: catalog_metadata,
        })
    }

    /// Flush pending cursor writes
    pub async fn shutdown(&self) {
        match self.discovery.cursors().flush().await {
            Ok(()) => tracing::info!("Discovery cursors flushed"),
            Err(e) => tracing::error!(error = %e, "Failed to flush discovery cursors on shutdown"),
        }
    }
}
