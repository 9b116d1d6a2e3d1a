use chrono::{Duration as ChronoDuration, Utc};
use serde::Serialize;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};

use crate::{
    config::DiscoverySettings,
    db::{CacheEntry, Collection, KeyPart, TieredCache},
    error::AppError,
    models::{CatalogItem, DiscoveryCursorState, DiscoveryQuery},
    services::{
        cursor::CursorStore,
        providers::CatalogProvider,
        ranking::{count_quality, merge_by_id, rank},
    },
};

/// Why a discovery run stopped paging
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    /// Enough quality candidates accumulated
    Satisfied,
    /// Upstream has no further pages
    Exhausted,
    /// Page ceiling hit; the next run may go deeper
    CeilingReached,
    RateLimited,
    /// Upstream failed mid-run; results are partial
    Unavailable,
}

#[derive(Debug, Clone, Serialize)]
pub struct DiscoveryOutcome {
    pub signature: String,
    /// Ranked accumulated candidates, exclusions removed
    pub items: Vec<CatalogItem>,
    pub cursor: DiscoveryCursorState,
    pub pages_fetched: u32,
    pub stop: StopReason,
}

#[derive(Default)]
struct CandidateCache {
    by_signature: HashMap<String, Vec<CatalogItem>>,
    order: VecDeque<String>,
}

impl CandidateCache {
    fn get(&self, signature: &str) -> Option<Vec<CatalogItem>> {
        self.by_signature.get(signature).cloned()
    }

    fn put(&mut self, signature: &str, items: Vec<CatalogItem>, cap: usize) {
        if self.by_signature.insert(signature.to_string(), items).is_none() {
            self.order.push_back(signature.to_string());
        }
        while self.order.len() > cap {
            if let Some(oldest) = self.order.pop_front() {
                self.by_signature.remove(&oldest);
            }
        }
    }
}

/// Pages through upstream discover results until enough quality candidates
/// exist, resuming where the previous run for the same query stopped
///
/// Accumulated candidates are kept in memory and persisted per signature
/// through the tiered cache, so a restarted process picks up the set that
/// matches its cursor instead of starting from an empty one.
pub struct DiscoveryEngine {
    provider: Arc<dyn CatalogProvider>,
    cache: Arc<TieredCache>,
    cursors: CursorStore,
    settings: DiscoverySettings,
    candidates: Mutex<CandidateCache>,
    signature_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

fn candidates_key(signature: &str) -> Vec<KeyPart> {
    vec!["candidates".into(), signature.into()]
}

fn quality_count(items: &[CatalogItem], exclude_ids: &HashSet<u64>) -> usize {
    if exclude_ids.is_empty() {
        return count_quality(items);
    }
    let kept: Vec<CatalogItem> = items
        .iter()
        .filter(|item| !exclude_ids.contains(&item.id))
        .cloned()
        .collect();
    count_quality(&kept)
}

impl DiscoveryEngine {
    pub fn new(
        provider: Arc<dyn CatalogProvider>,
        cache: Arc<TieredCache>,
        cursors: CursorStore,
        settings: DiscoverySettings,
    ) -> Self {
        Self {
            provider,
            cache,
            cursors,
            settings,
            candidates: Mutex::new(CandidateCache::default()),
            signature_locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn cursors(&self) -> &CursorStore {
        &self.cursors
    }

    pub async fn cursor(&self, signature: &str) -> Option<DiscoveryCursorState> {
        self.cursors.read(signature).await
    }

    /// Fetch pages sequentially until `min_count` strict-quality candidates
    /// (ignoring `exclude_ids`) have accumulated for `query`
    ///
    /// Never fails: upstream errors end the run and whatever was accumulated
    /// so far is returned.
    pub async fn fetch_until_enough(
        &self,
        query: &DiscoveryQuery,
        min_count: usize,
        exclude_ids: &HashSet<u64>,
    ) -> DiscoveryOutcome {
        let signature = query.signature();
        let lock = self.lock_for(&signature);
        let _guard = lock.lock().await;

        let now = Utc::now();
        let mut state = self
            .cursors
            .read(&signature)
            .await
            .unwrap_or_else(|| DiscoveryCursorState::new(self.settings.initial_page_ceiling));
        let mut accumulated = match self.load_candidates(&signature).await {
            Some(items) => items,
            None if state.next_page > 1 && !state.is_rate_limited(now) => {
                self.rebuild_candidates(query, &signature, &state).await
            }
            None => Vec::new(),
        };
        let mut pages_fetched = 0;

        if state.exhausted {
            tracing::debug!(signature = %signature, next_page = state.next_page, "Cursor exhausted, skipping upstream");
            return self.outcome(signature, accumulated, state, 0, StopReason::Exhausted, exclude_ids);
        }
        if state.is_rate_limited(now) {
            tracing::info!(signature = %signature, until = ?state.rate_limited_until, "Discovery backing off");
            return self.outcome(signature, accumulated, state, 0, StopReason::RateLimited, exclude_ids);
        }
        state.rate_limited_until = None;

        if quality_count(&accumulated, exclude_ids) >= min_count {
            return self.outcome(signature, accumulated, state, 0, StopReason::Satisfied, exclude_ids);
        }

        let stop = loop {
            if state.next_page > state.page_ceiling {
                let grown = state
                    .page_ceiling
                    .saturating_add(self.settings.page_ceiling_increment)
                    .min(self.settings.absolute_page_ceiling);
                if grown <= state.page_ceiling {
                    // Absolute ceiling reached. Upstream may still have pages,
                    // so the cursor is not exhausted.
                    tracing::debug!(signature = %signature, page_ceiling = state.page_ceiling, "Absolute page ceiling reached");
                    break StopReason::CeilingReached;
                }
                state.page_ceiling = grown;
                tracing::info!(signature = %signature, page_ceiling = grown, "Page ceiling raised for next run");
                break StopReason::CeilingReached;
            }

            let page = state.next_page;
            match self.provider.discover_page(query, page).await {
                Ok(catalog_page) => {
                    pages_fetched += 1;
                    state.next_page = page + 1;
                    // Upstream totals drift; the latest report wins
                    state.total_pages = catalog_page.total_pages;

                    let empty = catalog_page.results.is_empty();
                    accumulated.extend(catalog_page.results);
                    accumulated = merge_by_id(accumulated);

                    if empty || catalog_page.total_pages.is_some_and(|total| page >= total) {
                        state.exhausted = true;
                    }
                    if quality_count(&accumulated, exclude_ids) >= min_count {
                        break StopReason::Satisfied;
                    }
                    if state.exhausted {
                        break StopReason::Exhausted;
                    }
                }
                Err(AppError::InvalidResponseShape(e)) => {
                    tracing::warn!(signature = %signature, page, error = %e, "Malformed page treated as empty");
                    pages_fetched += 1;
                    state.next_page = page + 1;
                }
                Err(AppError::UpstreamRateLimited { retry_after_secs }) => {
                    let backoff = retry_after_secs.unwrap_or(self.settings.rate_limit_backoff_secs);
                    state.rate_limited_until =
                        Some(Utc::now() + ChronoDuration::seconds(backoff.min(u64::from(u32::MAX)) as i64));
                    tracing::warn!(signature = %signature, page, backoff_secs = backoff, "Discovery rate limited");
                    break StopReason::RateLimited;
                }
                Err(e) => {
                    tracing::warn!(signature = %signature, page, error = %e, "Discovery aborted with partial results");
                    break StopReason::Unavailable;
                }
            }
        };

        if pages_fetched > 0 {
            self.store_candidates(&signature, &accumulated).await;
        }
        let state = self.cursors.write(&signature, state).await;

        tracing::info!(
            signature = %signature,
            pages_fetched,
            next_page = state.next_page,
            total_pages = ?state.total_pages,
            exhausted = state.exhausted,
            candidates = accumulated.len(),
            stop = ?stop,
            "Discovery run finished"
        );

        self.outcome(signature, accumulated, state, pages_fetched, stop, exclude_ids)
    }

    fn outcome(
        &self,
        signature: String,
        accumulated: Vec<CatalogItem>,
        cursor: DiscoveryCursorState,
        pages_fetched: u32,
        stop: StopReason,
        exclude_ids: &HashSet<u64>,
    ) -> DiscoveryOutcome {
        let items = rank(
            accumulated
                .into_iter()
                .filter(|item| !exclude_ids.contains(&item.id))
                .collect(),
        );
        DiscoveryOutcome {
            signature,
            items,
            cursor,
            pages_fetched,
            stop,
        }
    }

    fn lock_for(&self, signature: &str) -> Arc<tokio::sync::Mutex<()>> {
        match self.signature_locks.lock() {
            Ok(mut locks) => locks
                .entry(signature.to_string())
                .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
                .clone(),
            // A fresh lock still lets the run proceed
            Err(_) => Arc::new(tokio::sync::Mutex::new(())),
        }
    }

    /// Candidates from memory, falling back to the persisted set
    async fn load_candidates(&self, signature: &str) -> Option<Vec<CatalogItem>> {
        let remembered = self.candidates.lock().ok().and_then(|cache| cache.get(signature));
        if remembered.is_some() {
            return remembered;
        }

        let entry = self
            .cache
            .read(Collection::Discovery, &candidates_key(signature), u64::MAX)
            .await?;
        let items: Vec<CatalogItem> = match serde_json::from_str(&entry.body) {
            Ok(items) => items,
            Err(e) => {
                tracing::warn!(signature = %signature, error = %e, "Discarding unreadable candidate set");
                return None;
            }
        };

        tracing::debug!(signature = %signature, candidates = items.len(), "Candidate set restored");
        self.remember_candidates(signature, items.clone());
        Some(items)
    }

    /// Re-read the pages a cursor has already covered
    ///
    /// Used when the cursor outlived its candidate set. Pages come through the
    /// provider's read-through cache, so upstream is only hit for pages that
    /// were evicted. The cursor itself is left untouched.
    async fn rebuild_candidates(
        &self,
        query: &DiscoveryQuery,
        signature: &str,
        state: &DiscoveryCursorState,
    ) -> Vec<CatalogItem> {
        let mut items = Vec::new();
        for page in 1..state.next_page {
            match self.provider.discover_page(query, page).await {
                Ok(catalog_page) => items.extend(catalog_page.results),
                Err(AppError::InvalidResponseShape(_)) => continue,
                Err(e) => {
                    tracing::warn!(signature = %signature, page, error = %e, "Candidate rebuild stopped early");
                    break;
                }
            }
        }

        let items = merge_by_id(items);
        tracing::info!(signature = %signature, pages = state.next_page - 1, candidates = items.len(), "Candidate set rebuilt");
        self.store_candidates(signature, &items).await;
        items
    }

    async fn store_candidates(&self, signature: &str, items: &[CatalogItem]) {
        self.remember_candidates(signature, items.to_vec());

        match serde_json::to_string(items) {
            Ok(body) => {
                self.cache
                    .write(Collection::Discovery, &candidates_key(signature), CacheEntry::json(body))
                    .await;
            }
            Err(e) => {
                tracing::error!(signature = %signature, error = %e, "Candidate set serialization failed");
            }
        }
    }

    fn remember_candidates(&self, signature: &str, items: Vec<CatalogItem>) {
        if let Ok(mut cache) = self.candidates.lock() {
            cache.put(signature, items, self.settings.history_cap.max(1));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CacheSettings;
    use crate::db::MemoryStore;
    use crate::models::CatalogPage;
    use crate::services::providers::MockCatalogProvider;
    use std::time::Duration;

    fn quality_item(id: u64) -> CatalogItem {
        CatalogItem {
            rating: Some(7.5),
            vote_count: Some(100),
            ..CatalogItem::new(id, format!("Movie {}", id))
        }
    }

    fn weak_item(id: u64) -> CatalogItem {
        CatalogItem {
            rating: Some(5.0),
            vote_count: Some(10),
            ..CatalogItem::new(id, format!("Movie {}", id))
        }
    }

    /// Page `n` holds ids `(n-1)*20+1 ..= n*20`; the first `quality` of them clear the bar
    fn page_of(page: u32, quality: usize, total_pages: u32) -> CatalogPage {
        let start = u64::from(page - 1) * 20 + 1;
        let results = (0..20u64)
            .map(|offset| {
                if (offset as usize) < quality {
                    quality_item(start + offset)
                } else {
                    weak_item(start + offset)
                }
            })
            .collect();
        CatalogPage {
            page,
            results,
            total_pages: Some(total_pages),
        }
    }

    fn settings() -> DiscoverySettings {
        DiscoverySettings {
            initial_page_ceiling: 5,
            page_ceiling_increment: 5,
            absolute_page_ceiling: 10,
            debounce: Duration::from_secs(60),
            ..DiscoverySettings::default()
        }
    }

    fn create_cache() -> Arc<TieredCache> {
        Arc::new(TieredCache::new(
            Arc::new(MemoryStore::new()),
            &CacheSettings::default(),
        ))
    }

    fn engine_over(
        provider: MockCatalogProvider,
        cache: Arc<TieredCache>,
        cursor_store: Arc<MemoryStore>,
    ) -> DiscoveryEngine {
        let cursors = CursorStore::new(cursor_store, None, 10, Duration::from_secs(60));
        DiscoveryEngine::new(Arc::new(provider), cache, cursors, settings())
    }

    fn engine(provider: MockCatalogProvider) -> DiscoveryEngine {
        engine_over(provider, create_cache(), Arc::new(MemoryStore::new()))
    }

    #[tokio::test]
    async fn test_stops_once_enough_candidates() {
        let mut provider = MockCatalogProvider::new();
        provider
            .expect_discover_page()
            .times(2)
            .returning(|_, page| Ok(page_of(page, 8, 3)));
        let engine = engine(provider);

        let outcome = engine
            .fetch_until_enough(&DiscoveryQuery::default(), 12, &HashSet::new())
            .await;

        assert_eq!(outcome.stop, StopReason::Satisfied);
        assert_eq!(outcome.pages_fetched, 2);
        assert_eq!(outcome.cursor.next_page, 3);
        assert_eq!(outcome.cursor.last_fetched_page(), Some(2));
        assert!(!outcome.cursor.exhausted);
    }

    #[tokio::test]
    async fn test_single_page_suffices() {
        let mut provider = MockCatalogProvider::new();
        provider
            .expect_discover_page()
            .times(1)
            .returning(|_, page| Ok(page_of(page, 15, 3)));
        let engine = engine(provider);

        let outcome = engine
            .fetch_until_enough(&DiscoveryQuery::default(), 12, &HashSet::new())
            .await;

        assert_eq!(outcome.stop, StopReason::Satisfied);
        assert_eq!(outcome.cursor.next_page, 2);
        assert_eq!(outcome.items.len(), 20);
    }

    #[tokio::test]
    async fn test_exhausted_cursor_skips_upstream() {
        let mut provider = MockCatalogProvider::new();
        provider
            .expect_discover_page()
            .times(3)
            .returning(|_, page| Ok(page_of(page, 20, 3)));
        let engine = engine(provider);
        let query = DiscoveryQuery::default();

        let first = engine.fetch_until_enough(&query, 100, &HashSet::new()).await;
        assert_eq!(first.stop, StopReason::Exhausted);
        assert!(first.cursor.exhausted);
        assert_eq!(first.cursor.next_page, 4);
        assert_eq!(first.items.len(), 60);

        // No further upstream calls: the mock allows exactly three
        let second = engine.fetch_until_enough(&query, 100, &HashSet::new()).await;
        assert_eq!(second.stop, StopReason::Exhausted);
        assert_eq!(second.pages_fetched, 0);
        assert_eq!(second.items.len(), 60);
    }

    #[tokio::test]
    async fn test_resumes_from_cursor() {
        let mut provider = MockCatalogProvider::new();
        let mut seq = mockall::Sequence::new();
        for expected in 1..=3u32 {
            provider
                .expect_discover_page()
                .withf(move |_, page| *page == expected)
                .times(1)
                .in_sequence(&mut seq)
                .returning(|_, page| Ok(page_of(page, 5, 50)));
        }
        let engine = engine(provider);
        let query = DiscoveryQuery::default();

        let first = engine.fetch_until_enough(&query, 10, &HashSet::new()).await;
        assert_eq!(first.cursor.next_page, 3);

        let second = engine.fetch_until_enough(&query, 15, &HashSet::new()).await;
        assert_eq!(second.pages_fetched, 1);
        assert_eq!(second.cursor.next_page, 4);
        assert_eq!(second.items.len(), 60);
    }

    #[tokio::test]
    async fn test_latest_total_pages_wins() {
        let mut provider = MockCatalogProvider::new();
        provider
            .expect_discover_page()
            .withf(|_, page| *page == 1)
            .returning(|_, page| Ok(page_of(page, 0, 10)));
        provider
            .expect_discover_page()
            .withf(|_, page| *page == 2)
            .returning(|_, page| Ok(page_of(page, 0, 2)));
        let engine = engine(provider);

        let outcome = engine
            .fetch_until_enough(&DiscoveryQuery::default(), 50, &HashSet::new())
            .await;

        assert_eq!(outcome.cursor.total_pages, Some(2));
        assert!(outcome.cursor.exhausted);
    }

    #[tokio::test]
    async fn test_ceiling_grows_between_runs() {
        let mut provider = MockCatalogProvider::new();
        provider
            .expect_discover_page()
            .times(10)
            .returning(|_, page| Ok(page_of(page, 0, 100)));
        let engine = engine(provider);
        let query = DiscoveryQuery::default();

        let first = engine.fetch_until_enough(&query, 5, &HashSet::new()).await;
        assert_eq!(first.stop, StopReason::CeilingReached);
        assert_eq!(first.pages_fetched, 5);
        assert_eq!(first.cursor.page_ceiling, 10);

        let second = engine.fetch_until_enough(&query, 5, &HashSet::new()).await;
        assert_eq!(second.pages_fetched, 5);
        assert_eq!(second.stop, StopReason::CeilingReached);
        assert_eq!(second.cursor.page_ceiling, 10);

        // Upstream still reports 100 pages, so the cursor is capped, not exhausted
        assert!(!second.cursor.exhausted);
        let third = engine.fetch_until_enough(&query, 5, &HashSet::new()).await;
        assert_eq!(third.stop, StopReason::CeilingReached);
        assert_eq!(third.pages_fetched, 0);
        assert!(!third.cursor.exhausted);
    }

    #[tokio::test]
    async fn test_candidates_survive_restart() {
        let cache = create_cache();
        let cursor_store = Arc::new(MemoryStore::new());
        let query = DiscoveryQuery::default();

        let mut provider = MockCatalogProvider::new();
        provider
            .expect_discover_page()
            .times(3)
            .returning(|_, page| Ok(page_of(page, 20, 3)));
        let first = engine_over(provider, cache.clone(), cursor_store.clone());
        let outcome = first.fetch_until_enough(&query, 100, &HashSet::new()).await;
        assert_eq!(outcome.items.len(), 60);
        first.cursors().flush().await.unwrap();

        let mut offline = MockCatalogProvider::new();
        offline.expect_discover_page().times(0);
        let second = engine_over(offline, cache, cursor_store);
        let restored = second.fetch_until_enough(&query, 100, &HashSet::new()).await;

        assert_eq!(restored.stop, StopReason::Exhausted);
        assert_eq!(restored.pages_fetched, 0);
        assert_eq!(restored.items.len(), 60);
    }

    #[tokio::test]
    async fn test_lost_candidates_rebuilt_from_covered_pages() {
        let cursor_store = Arc::new(MemoryStore::new());
        let query = DiscoveryQuery::default();

        let mut provider = MockCatalogProvider::new();
        provider
            .expect_discover_page()
            .times(2)
            .returning(|_, page| Ok(page_of(page, 5, 50)));
        let first = engine_over(provider, create_cache(), cursor_store.clone());
        let outcome = first.fetch_until_enough(&query, 10, &HashSet::new()).await;
        assert_eq!(outcome.cursor.next_page, 3);
        first.cursors().flush().await.unwrap();

        // Fresh cache: only the cursor survived, so pages 1 and 2 are re-read
        let mut provider = MockCatalogProvider::new();
        provider
            .expect_discover_page()
            .withf(|_, page| *page <= 2)
            .times(2)
            .returning(|_, page| Ok(page_of(page, 5, 50)));
        let second = engine_over(provider, create_cache(), cursor_store);
        let resumed = second.fetch_until_enough(&query, 10, &HashSet::new()).await;

        assert_eq!(resumed.stop, StopReason::Satisfied);
        assert_eq!(resumed.pages_fetched, 0);
        assert_eq!(resumed.items.len(), 40);
        assert_eq!(resumed.cursor.next_page, 3);
    }

    #[tokio::test]
    async fn test_rate_limit_records_backoff() {
        let mut provider = MockCatalogProvider::new();
        provider
            .expect_discover_page()
            .times(1)
            .returning(|_, _| Err(AppError::UpstreamRateLimited { retry_after_secs: Some(30) }));
        let engine = engine(provider);
        let query = DiscoveryQuery::default();

        let first = engine.fetch_until_enough(&query, 5, &HashSet::new()).await;
        assert_eq!(first.stop, StopReason::RateLimited);
        assert!(first.cursor.is_rate_limited(Utc::now()));

        let second = engine.fetch_until_enough(&query, 5, &HashSet::new()).await;
        assert_eq!(second.stop, StopReason::RateLimited);
        assert_eq!(second.pages_fetched, 0);
    }

    #[tokio::test]
    async fn test_unavailable_returns_partial_results() {
        let mut provider = MockCatalogProvider::new();
        provider
            .expect_discover_page()
            .withf(|_, page| *page == 1)
            .returning(|_, page| Ok(page_of(page, 3, 10)));
        provider
            .expect_discover_page()
            .withf(|_, page| *page == 2)
            .returning(|_, _| Err(AppError::UpstreamUnavailable("503".to_string())));
        let engine = engine(provider);

        let outcome = engine
            .fetch_until_enough(&DiscoveryQuery::default(), 10, &HashSet::new())
            .await;

        assert_eq!(outcome.stop, StopReason::Unavailable);
        assert_eq!(outcome.items.len(), 20);
        assert_eq!(outcome.cursor.next_page, 2);
        assert!(!outcome.cursor.exhausted);
    }

    #[tokio::test]
    async fn test_malformed_page_counts_as_empty_without_exhausting() {
        let mut provider = MockCatalogProvider::new();
        provider
            .expect_discover_page()
            .withf(|_, page| *page == 1)
            .returning(|_, _| Err(AppError::InvalidResponseShape("missing results".to_string())));
        provider
            .expect_discover_page()
            .withf(|_, page| *page == 2)
            .returning(|_, page| Ok(page_of(page, 20, 10)));
        let engine = engine(provider);

        let outcome = engine
            .fetch_until_enough(&DiscoveryQuery::default(), 10, &HashSet::new())
            .await;

        assert_eq!(outcome.stop, StopReason::Satisfied);
        assert_eq!(outcome.pages_fetched, 2);
        assert!(!outcome.cursor.exhausted);
    }

    #[tokio::test]
    async fn test_exclusions_do_not_count_toward_threshold() {
        let mut provider = MockCatalogProvider::new();
        provider
            .expect_discover_page()
            .times(2)
            .returning(|_, page| Ok(page_of(page, 10, 5)));
        let engine = engine(provider);
        let exclude: HashSet<u64> = (1..=5).collect();

        let outcome = engine
            .fetch_until_enough(&DiscoveryQuery::default(), 10, &exclude)
            .await;

        assert_eq!(outcome.pages_fetched, 2);
        assert!(outcome.items.iter().all(|item| item.id > 5));
    }
}
