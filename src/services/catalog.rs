use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};

use crate::{
    config::CatalogSettings,
    db::{CacheEntry, Collection, KeyPart, TieredCache},
    error::AppResult,
    models::{enrichment::normalize_title, CatalogItem, DiscoveryQuery},
    services::{
        providers::CatalogProvider,
        ranking::{merge_by_id, rank},
    },
};

/// Where a snapshot handed to a caller came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SnapshotSource {
    Memory,
    Cache,
    Upstream,
    Empty,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CatalogMetadata {
    pub refreshed_at: Option<DateTime<Utc>>,
    pub item_count: usize,
    pub total_pages: Option<u32>,
    pub stale: bool,
    /// A background refresh is running
    pub refreshing: bool,
    pub source: SnapshotSource,
}

#[derive(Debug, Clone, Serialize)]
pub struct CatalogSnapshot {
    pub items: Vec<CatalogItem>,
    pub metadata: CatalogMetadata,
}

#[derive(Debug, Clone, Serialize)]
pub struct SearchResults {
    pub results: Vec<CatalogItem>,
    /// Matches before truncation, for "N of M" messages
    pub total_matches: usize,
}

/// Persisted form of a snapshot
#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredSnapshot {
    items: Vec<CatalogItem>,
    refreshed_at: DateTime<Utc>,
    total_pages: Option<u32>,
}

impl StoredSnapshot {
    fn is_fresh(&self, ttl_secs: u64) -> bool {
        let age = Utc::now().signed_duration_since(self.refreshed_at).num_seconds();
        age <= i64::try_from(ttl_secs).unwrap_or(i64::MAX)
    }
}

struct CatalogInner {
    provider: Arc<dyn CatalogProvider>,
    cache: Arc<TieredCache>,
    settings: CatalogSettings,
    snapshot: RwLock<Option<Arc<StoredSnapshot>>>,
    /// Serializes refreshes so concurrent callers share one upstream pass
    refresh_lock: Mutex<()>,
    refreshing: AtomicBool,
}

/// Local snapshot of the catalog
///
/// Holds one full snapshot in memory, persisted through the tiered cache so a
/// restart can reload it without touching upstream. Cheap to clone.
#[derive(Clone)]
pub struct CatalogStore {
    inner: Arc<CatalogInner>,
}

fn snapshot_key() -> Vec<KeyPart> {
    vec!["snapshot".into(), DiscoveryQuery::default().signature().into()]
}

impl CatalogStore {
    pub fn new(
        provider: Arc<dyn CatalogProvider>,
        cache: Arc<TieredCache>,
        settings: CatalogSettings,
    ) -> Self {
        Self {
            inner: Arc::new(CatalogInner {
                provider,
                cache,
                settings,
                snapshot: RwLock::new(None),
                refresh_lock: Mutex::new(()),
                refreshing: AtomicBool::new(false),
            }),
        }
    }

    /// Return the catalog, refreshing from upstream when needed
    ///
    /// * `force_refresh` skips every freshness check.
    /// * `allow_stale` serves an expired snapshot immediately and refreshes in
    ///   the background.
    /// * `cache_only` never calls upstream; the result may be empty.
    pub async fn ensure_catalog(
        &self,
        force_refresh: bool,
        allow_stale: bool,
        cache_only: bool,
    ) -> AppResult<CatalogSnapshot> {
        let ttl = self.inner.settings.snapshot_ttl_secs;
        let mut current = self.inner.snapshot.read().await.clone();

        if cache_only {
            if current.is_none() {
                current = self.load_persisted().await;
            }
            return Ok(match current {
                Some(snapshot) => {
                    let stale = !snapshot.is_fresh(ttl);
                    self.view(snapshot, SnapshotSource::Memory, stale)
                }
                None => self.empty_view(),
            });
        }

        if !force_refresh {
            if let Some(snapshot) = current.as_ref().filter(|s| s.is_fresh(ttl)) {
                return Ok(self.view(snapshot.clone(), SnapshotSource::Memory, false));
            }

            if let Some(persisted) = self.load_persisted().await {
                if persisted.is_fresh(ttl) {
                    return Ok(self.view(persisted, SnapshotSource::Cache, false));
                }
                current = Some(persisted);
            }

            if allow_stale {
                if let Some(stale) = current.clone() {
                    self.spawn_background_refresh();
                    return Ok(self.view(stale, SnapshotSource::Memory, true));
                }
            }
        }

        match self.refresh(force_refresh).await {
            Ok(snapshot) => Ok(self.view(snapshot, SnapshotSource::Upstream, false)),
            Err(e) => match current {
                Some(stale) => {
                    tracing::warn!(error = %e, "Catalog refresh failed, serving stale snapshot");
                    Ok(self.view(stale, SnapshotSource::Memory, true))
                }
                None => Err(e),
            },
        }
    }

    /// Substring search over titles with a rating floor and id exclusion
    pub async fn search(
        &self,
        query: &str,
        limit: usize,
        min_score: Option<f64>,
        exclude_ids: &HashSet<u64>,
    ) -> AppResult<SearchResults> {
        let snapshot = self.ensure_catalog(false, true, false).await?;
        let needle = normalize_title(query);

        let matches: Vec<CatalogItem> = snapshot
            .items
            .into_iter()
            .filter(|item| !exclude_ids.contains(&item.id))
            .filter(|item| match min_score {
                Some(floor) => item.rating.is_some_and(|rating| rating >= floor),
                None => true,
            })
            .filter(|item| title_matches(item, &needle))
            .collect();

        let total_matches = matches.len();
        let mut results = rank(matches);
        results.truncate(limit);

        tracing::debug!(query = %query, total_matches, returned = results.len(), "Catalog search");

        Ok(SearchResults {
            results,
            total_matches,
        })
    }

    /// Recently released titles, newest first
    ///
    /// Served from the snapshot; topped up with one upstream page sorted by
    /// release date when the snapshot alone falls short of `limit`.
    pub async fn fetch_new_releases(
        &self,
        query: Option<&str>,
        limit: usize,
        exclude_ids: &HashSet<u64>,
    ) -> AppResult<Vec<CatalogItem>> {
        let today = Utc::now().date_naive();
        let window_start = today - Duration::days(self.inner.settings.new_release_window_days);
        let needle = query.map(normalize_title).unwrap_or_default();

        let is_new_release = |item: &CatalogItem| {
            !exclude_ids.contains(&item.id)
                && item
                    .release_date
                    .is_some_and(|date| date >= window_start && date <= today)
                && title_matches(item, &needle)
        };

        let snapshot = self.ensure_catalog(false, true, false).await?;
        let mut releases: Vec<CatalogItem> =
            snapshot.items.into_iter().filter(|i| is_new_release(i)).collect();

        if releases.len() < limit {
            let recent = DiscoveryQuery {
                sort_by: "primary_release_date.desc".to_string(),
                min_vote_count: Some(10),
                released_before: Some(today.format("%Y-%m-%d").to_string()),
                ..DiscoveryQuery::default()
            };
            match self.inner.provider.discover_page(&recent, 1).await {
                Ok(page) => {
                    releases.extend(page.results.into_iter().filter(|i| is_new_release(i)));
                    releases = merge_by_id(releases);
                }
                Err(e) => {
                    tracing::warn!(error = %e, "New release top-up failed, using snapshot only");
                }
            }
        }

        releases.sort_by(|a, b| b.release_date.cmp(&a.release_date));
        releases.truncate(limit);
        Ok(releases)
    }

    /// Pull a new snapshot from upstream
    async fn refresh(&self, force: bool) -> AppResult<Arc<StoredSnapshot>> {
        let _guard = self.inner.refresh_lock.lock().await;

        // Another caller may have refreshed while we waited
        if !force {
            let current = self.inner.snapshot.read().await.clone();
            if let Some(snapshot) = current.filter(|s| s.is_fresh(self.inner.settings.snapshot_ttl_secs)) {
                return Ok(snapshot);
            }
        }

        let query = DiscoveryQuery::default();
        let mut items = Vec::new();
        let mut total_pages = None;

        // Cached discover pages may be older than the snapshot being replaced
        for page in 1..=self.inner.settings.snapshot_pages.max(1) {
            match self.inner.provider.refresh_discover_page(&query, page).await {
                Ok(catalog_page) => {
                    total_pages = catalog_page.total_pages;
                    let empty = catalog_page.results.is_empty();
                    items.extend(catalog_page.results);
                    if empty || total_pages.is_some_and(|total| page >= total) {
                        break;
                    }
                }
                Err(e) if page == 1 => {
                    tracing::error!(error = %e, "Catalog refresh failed on first page");
                    return Err(e);
                }
                Err(e) => {
                    tracing::warn!(page, error = %e, "Catalog refresh stopped early");
                    break;
                }
            }
        }

        let snapshot = Arc::new(StoredSnapshot {
            items: merge_by_id(items),
            refreshed_at: Utc::now(),
            total_pages,
        });

        *self.inner.snapshot.write().await = Some(snapshot.clone());
        self.persist(&snapshot).await;

        tracing::info!(
            items = snapshot.items.len(),
            total_pages = ?snapshot.total_pages,
            provider = self.inner.provider.name(),
            "Catalog snapshot refreshed"
        );

        Ok(snapshot)
    }

    fn spawn_background_refresh(&self) {
        if self.inner.refreshing.swap(true, Ordering::AcqRel) {
            return;
        }

        let store = self.clone();
        tokio::spawn(async move {
            let _flag = RefreshingFlag(store.inner.clone());
            if let Err(e) = store.refresh(false).await {
                tracing::warn!(error = %e, "Background catalog refresh failed");
            }
        });
    }

    /// Load the persisted snapshot regardless of age and adopt it if it is
    /// newer than the in-memory one
    async fn load_persisted(&self) -> Option<Arc<StoredSnapshot>> {
        let entry = self
            .inner
            .cache
            .read(Collection::Catalog, &snapshot_key(), u64::MAX)
            .await?;

        let persisted: StoredSnapshot = match serde_json::from_str(&entry.body) {
            Ok(snapshot) => snapshot,
            Err(e) => {
                tracing::warn!(error = %e, "Discarding unreadable catalog snapshot");
                return None;
            }
        };
        let persisted = Arc::new(persisted);

        let mut slot = self.inner.snapshot.write().await;
        match slot.as_ref() {
            Some(existing) if existing.refreshed_at >= persisted.refreshed_at => Some(existing.clone()),
            _ => {
                *slot = Some(persisted.clone());
                Some(persisted)
            }
        }
    }

    async fn persist(&self, snapshot: &StoredSnapshot) {
        match serde_json::to_string(snapshot) {
            Ok(body) => {
                let entry = CacheEntry {
                    fetched_at: snapshot.refreshed_at,
                    ..CacheEntry::json(body)
                };
                self.inner
                    .cache
                    .write(Collection::Catalog, &snapshot_key(), entry)
                    .await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Catalog snapshot serialization failed");
            }
        }
    }

    fn view(&self, snapshot: Arc<StoredSnapshot>, source: SnapshotSource, stale: bool) -> CatalogSnapshot {
        CatalogSnapshot {
            metadata: CatalogMetadata {
                refreshed_at: Some(snapshot.refreshed_at),
                item_count: snapshot.items.len(),
                total_pages: snapshot.total_pages,
                stale,
                refreshing: self.inner.refreshing.load(Ordering::Acquire),
                source,
            },
            items: snapshot.items.clone(),
        }
    }

    fn empty_view(&self) -> CatalogSnapshot {
        CatalogSnapshot {
            items: Vec::new(),
            metadata: CatalogMetadata {
                refreshed_at: None,
                item_count: 0,
                total_pages: None,
                stale: false,
                refreshing: self.inner.refreshing.load(Ordering::Acquire),
                source: SnapshotSource::Empty,
            },
        }
    }
}

/// Clears `refreshing` when the background task ends, including by panic
struct RefreshingFlag(Arc<CatalogInner>);

impl Drop for RefreshingFlag {
    fn drop(&mut self) {
        self.0.refreshing.store(false, Ordering::Release);
    }
}

fn title_matches(item: &CatalogItem, needle: &str) -> bool {
    if needle.is_empty() {
        return true;
    }
    normalize_title(&item.title).contains(needle)
        || item
            .original_title
            .as_deref()
            .is_some_and(|original| normalize_title(original).contains(needle))
}
