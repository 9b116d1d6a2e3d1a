use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::watch;

use crate::{
    config::EnrichmentSettings,
    error::{AppError, AppResult},
    models::{CatalogItem, CriticLookup, CriticScoreState, CriticScores, EnrichmentKey, ItemDetails},
    services::providers::{CatalogProvider, CriticScoreProvider},
};

#[derive(Default)]
struct QueueState {
    states: HashMap<EnrichmentKey, CriticScoreState>,
    details: HashMap<EnrichmentKey, ItemDetails>,
    pending: VecDeque<(EnrichmentKey, CatalogItem)>,
    queued: HashSet<EnrichmentKey>,
    in_flight: HashSet<EnrichmentKey>,
    backoff_until: Option<DateTime<Utc>>,
    /// Bumped by `clear`; completions from an older generation are dropped
    generation: u64,
}

impl QueueState {
    fn state_of(&self, key: &EnrichmentKey) -> CriticScoreState {
        self.states.get(key).cloned().unwrap_or_default()
    }

    fn is_backing_off(&self, now: DateTime<Utc>) -> bool {
        self.backoff_until.is_some_and(|until| until > now)
    }

    fn is_drained(&self) -> bool {
        self.pending.is_empty() && self.in_flight.is_empty()
    }
}

struct QueueInner {
    catalog: Arc<dyn CatalogProvider>,
    critics: Arc<dyn CriticScoreProvider>,
    settings: EnrichmentSettings,
    state: Mutex<QueueState>,
    completed: AtomicU64,
    drained: watch::Sender<u64>,
}

/// Lazy critic score and credits enrichment for displayed items
///
/// Items are admitted only when idle and not already queued or running. At
/// most `concurrency` fetches run at once; each completion pulls the next
/// queued item. Subscribers are signalled once every time the queue fully
/// drains.
#[derive(Clone)]
pub struct EnrichmentQueue {
    inner: Arc<QueueInner>,
}

impl EnrichmentQueue {
    pub fn new(
        catalog: Arc<dyn CatalogProvider>,
        critics: Arc<dyn CriticScoreProvider>,
        settings: EnrichmentSettings,
    ) -> Self {
        let (drained, _) = watch::channel(0);
        Self {
            inner: Arc::new(QueueInner {
                catalog,
                critics,
                settings,
                state: Mutex::new(QueueState::default()),
                completed: AtomicU64::new(0),
                drained,
            }),
        }
    }

    /// Queue items for enrichment. Returns how many were admitted.
    pub fn enqueue(&self, items: &[CatalogItem]) -> usize {
        let Ok(mut state) = self.inner.lock_state() else {
            return 0;
        };

        if state.is_backing_off(Utc::now()) {
            tracing::debug!(until = ?state.backoff_until, "Enrichment paused, nothing admitted");
            return 0;
        }

        let batch = &items[..items.len().min(self.inner.settings.batch_cap)];
        let mut admitted = 0;
        for item in batch {
            let key = EnrichmentKey::for_item(item);
            if state.queued.contains(&key)
                || state.in_flight.contains(&key)
                || !state.state_of(&key).can_begin(false)
            {
                continue;
            }
            state.queued.insert(key.clone());
            state.pending.push_back((key, item.clone()));
            admitted += 1;
        }

        if admitted > 0 {
            tracing::debug!(admitted, requested = items.len(), "Enrichment queued");
        }
        self.inner.pump(&mut state);
        admitted
    }

    /// Force a re-fetch regardless of the current state
    ///
    /// Returns `false` when a fetch for the item is already running.
    pub fn refresh(&self, item: &CatalogItem) -> bool {
        let Ok(mut state) = self.inner.lock_state() else {
            return false;
        };
        let key = EnrichmentKey::for_item(item);

        if state.in_flight.contains(&key) || !state.state_of(&key).can_begin(true) {
            return false;
        }
        if state.queued.remove(&key) {
            state.pending.retain(|(queued, _)| queued != &key);
        }

        tracing::info!(key = %key, "Forced enrichment refresh");
        state.queued.insert(key.clone());
        state.pending.push_front((key, item.clone()));
        self.inner.pump(&mut state);
        true
    }

    pub fn state(&self, key: &EnrichmentKey) -> CriticScoreState {
        self.inner
            .lock_state()
            .map(|state| state.state_of(key))
            .unwrap_or_default()
    }

    pub fn details(&self, key: &EnrichmentKey) -> Option<ItemDetails> {
        self.inner
            .lock_state()
            .ok()
            .and_then(|state| state.details.get(key).cloned())
    }

    /// Fill whatever enrichment has landed into `items`
    pub fn apply(&self, mut items: Vec<CatalogItem>) -> Vec<CatalogItem> {
        let Ok(state) = self.inner.lock_state() else {
            return items;
        };
        for item in items.iter_mut() {
            let key = EnrichmentKey::for_item(item);
            if let Some(details) = state.details.get(&key) {
                item.apply_details(details);
            }
            if let Some(scores) = state.states.get(&key).and_then(CriticScoreState::scores) {
                item.apply_critic_scores(scores);
            }
        }
        items
    }

    /// Receiver bumped once per full drain
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.inner.drained.subscribe()
    }

    /// Number of fetches that have finished, successful or not
    pub fn completed(&self) -> u64 {
        self.inner.completed.load(Ordering::Acquire)
    }

    pub fn in_flight(&self) -> usize {
        self.inner
            .lock_state()
            .map(|state| state.in_flight.len())
            .unwrap_or(0)
    }

    /// Drop all state. Fetches still running finish as no-ops.
    pub fn clear(&self) {
        if let Ok(mut state) = self.inner.lock_state() {
            let generation = state.generation + 1;
            *state = QueueState {
                generation,
                ..QueueState::default()
            };
            tracing::info!(generation, "Enrichment state cleared");
        }
    }
}

impl QueueInner {
    fn lock_state(&self) -> AppResult<MutexGuard<'_, QueueState>> {
        self.state
            .lock()
            .map_err(|e| AppError::Internal(format!("enrichment lock poisoned: {}", e)))
    }

    /// Start queued fetches up to the concurrency cap
    fn pump(self: &Arc<Self>, state: &mut QueueState) {
        let cap = self.settings.concurrency.max(1);
        while state.in_flight.len() < cap {
            let Some((key, item)) = state.pending.pop_front() else {
                break;
            };
            state.queued.remove(&key);
            state.states.insert(key.clone(), CriticScoreState::Loading);
            state.in_flight.insert(key.clone());

            let inner = self.clone();
            let generation = state.generation;
            tokio::spawn(async move {
                // The fetch runs as its own task so a panic still releases the slot
                let fetcher = inner.clone();
                let fetch = tokio::spawn(async move { fetcher.fetch(&item).await });
                let (details, result) = match fetch.await {
                    Ok(fetched) => fetched,
                    Err(e) => {
                        tracing::error!(key = %key, error = %e, "Enrichment task failed");
                        (None, Err(AppError::Internal(format!("enrichment task failed: {}", e))))
                    }
                };
                inner.complete(key, generation, details, result);
            });
        }
    }

    async fn fetch(&self, item: &CatalogItem) -> (Option<ItemDetails>, AppResult<CriticScores>) {
        let mut item = item.clone();

        // Details are best-effort; they mostly supply the IMDb id for the lookup
        let details = if item.id > 0 {
            match self.catalog.fetch_details(item.id).await {
                Ok(details) => {
                    item.apply_details(&details);
                    Some(details)
                }
                Err(e) => {
                    tracing::debug!(id = item.id, error = %e, "Details unavailable");
                    None
                }
            }
        } else {
            None
        };

        let lookup = CriticLookup::for_item(&item);
        (details, self.critics.fetch_scores(&lookup).await)
    }

    fn complete(
        self: &Arc<Self>,
        key: EnrichmentKey,
        generation: u64,
        details: Option<ItemDetails>,
        result: AppResult<CriticScores>,
    ) {
        let Ok(mut state) = self.lock_state() else {
            return;
        };
        if state.generation != generation || !state.in_flight.remove(&key) {
            tracing::debug!(key = %key, "Dropping stale enrichment result");
            return;
        }

        if let Some(details) = details {
            state.details.insert(key.clone(), details);
        }

        let next = match result {
            Ok(scores) => CriticScoreState::Loaded(scores),
            Err(AppError::UpstreamRateLimited { retry_after_secs }) => {
                let backoff = retry_after_secs.unwrap_or(self.settings.rate_limit_backoff_secs);
                state.backoff_until =
                    Some(Utc::now() + ChronoDuration::seconds(backoff.min(u64::from(u32::MAX)) as i64));
                let dropped = state.pending.len();
                state.pending.clear();
                state.queued.clear();
                tracing::warn!(key = %key, backoff_secs = backoff, dropped, "Critic scores rate limited, pausing enrichment");
                // Not the item's fault; it may be queued again after the backoff
                CriticScoreState::Idle
            }
            Err(e) => {
                tracing::debug!(key = %key, error = %e, "Enrichment failed");
                CriticScoreState::Error(e.to_string())
            }
        };
        state.states.insert(key, next);
        self.completed.fetch_add(1, Ordering::AcqRel);

        self.pump(&mut state);
        if state.is_drained() {
            self.drained.send_modify(|drains| *drains += 1);
            tracing::debug!(completed = self.completed.load(Ordering::Acquire), "Enrichment queue drained");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::DiscoveryQuery;
    use crate::models::CatalogPage;
    use crate::services::providers::{MockCatalogProvider, MockCriticScoreProvider};
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    fn movie(id: u64) -> CatalogItem {
        CatalogItem::new(id, format!("Movie {}", id))
    }

    fn details_for(id: u64) -> ItemDetails {
        ItemDetails {
            imdb_id: Some(format!("tt{:07}", id)),
            directors: vec!["Someone".to_string()],
            cast: Vec::new(),
        }
    }

    fn catalog_with_details() -> MockCatalogProvider {
        let mut catalog = MockCatalogProvider::new();
        catalog
            .expect_fetch_details()
            .returning(|id| Ok(details_for(id)));
        catalog
    }

    fn scores() -> CriticScores {
        CriticScores {
            rotten_tomatoes: Some(91),
            metacritic: Some(80),
            imdb: Some(8.1),
        }
    }

    async fn wait_for_drain(rx: &mut watch::Receiver<u64>) {
        tokio::time::timeout(Duration::from_secs(2), rx.changed())
            .await
            .expect("queue never drained")
            .expect("sender dropped");
    }

    #[tokio::test]
    async fn test_enqueue_twice_fetches_once() {
        let mut critics = MockCriticScoreProvider::new();
        critics.expect_fetch_scores().times(1).returning(|_| Ok(scores()));
        let mut catalog = MockCatalogProvider::new();
        catalog
            .expect_fetch_details()
            .times(1)
            .returning(|id| Ok(details_for(id)));

        let queue = EnrichmentQueue::new(Arc::new(catalog), Arc::new(critics), EnrichmentSettings::default());
        let mut rx = queue.subscribe();

        assert_eq!(queue.enqueue(&[movie(1)]), 1);
        assert_eq!(queue.enqueue(&[movie(1)]), 0);
        wait_for_drain(&mut rx).await;

        // Loaded items are not admitted again
        assert_eq!(queue.enqueue(&[movie(1)]), 0);
        let key = EnrichmentKey::for_item(&movie(1));
        assert_eq!(queue.state(&key), CriticScoreState::Loaded(scores()));
        assert_eq!(queue.completed(), 1);
    }

    #[tokio::test]
    async fn test_lookup_uses_external_id_from_details() {
        let mut critics = MockCriticScoreProvider::new();
        critics
            .expect_fetch_scores()
            .withf(|lookup| *lookup == CriticLookup::ExternalId("tt0000007".to_string()))
            .times(1)
            .returning(|_| Ok(scores()));

        let queue = EnrichmentQueue::new(
            Arc::new(catalog_with_details()),
            Arc::new(critics),
            EnrichmentSettings::default(),
        );
        let mut rx = queue.subscribe();
        queue.enqueue(&[movie(7)]);
        wait_for_drain(&mut rx).await;

        let applied = queue.apply(vec![movie(7)]);
        assert_eq!(applied[0].imdb_id.as_deref(), Some("tt0000007"));
        assert_eq!(applied[0].critic_scores, Some(scores()));
        assert_eq!(applied[0].directors, vec!["Someone".to_string()]);
    }

    #[tokio::test]
    async fn test_failure_is_terminal_until_forced() {
        let mut critics = MockCriticScoreProvider::new();
        let mut seq = mockall::Sequence::new();
        critics
            .expect_fetch_scores()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Err(AppError::EnrichmentNotFound("Movie 3".to_string())));
        critics
            .expect_fetch_scores()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(scores()));

        let queue = EnrichmentQueue::new(
            Arc::new(catalog_with_details()),
            Arc::new(critics),
            EnrichmentSettings::default(),
        );
        let mut rx = queue.subscribe();
        let key = EnrichmentKey::for_item(&movie(3));

        queue.enqueue(&[movie(3)]);
        wait_for_drain(&mut rx).await;
        assert!(matches!(queue.state(&key), CriticScoreState::Error(_)));

        assert_eq!(queue.enqueue(&[movie(3)]), 0);

        assert!(queue.refresh(&movie(3)));
        wait_for_drain(&mut rx).await;
        assert_eq!(queue.state(&key), CriticScoreState::Loaded(scores()));
    }

    #[tokio::test]
    async fn test_batch_cap_truncates() {
        let mut critics = MockCriticScoreProvider::new();
        critics.expect_fetch_scores().times(2).returning(|_| Ok(scores()));

        let queue = EnrichmentQueue::new(
            Arc::new(catalog_with_details()),
            Arc::new(critics),
            EnrichmentSettings {
                batch_cap: 2,
                ..EnrichmentSettings::default()
            },
        );
        let mut rx = queue.subscribe();

        let items: Vec<CatalogItem> = (1..=5).map(movie).collect();
        assert_eq!(queue.enqueue(&items), 2);
        wait_for_drain(&mut rx).await;
        assert_eq!(queue.state(&EnrichmentKey::for_item(&movie(5))), CriticScoreState::Idle);
    }

    #[tokio::test]
    async fn test_rate_limit_pauses_admission() {
        let mut critics = MockCriticScoreProvider::new();
        critics
            .expect_fetch_scores()
            .times(1)
            .returning(|_| Err(AppError::UpstreamRateLimited { retry_after_secs: None }));

        let queue = EnrichmentQueue::new(
            Arc::new(catalog_with_details()),
            Arc::new(critics),
            EnrichmentSettings {
                concurrency: 1,
                ..EnrichmentSettings::default()
            },
        );
        let mut rx = queue.subscribe();

        assert_eq!(queue.enqueue(&[movie(1), movie(2), movie(3)]), 3);
        wait_for_drain(&mut rx).await;

        for id in 1..=3 {
            assert_eq!(queue.state(&EnrichmentKey::for_item(&movie(id))), CriticScoreState::Idle);
        }
        assert_eq!(queue.enqueue(&[movie(4)]), 0);
    }

    #[tokio::test]
    async fn test_clear_makes_late_completions_noops() {
        let mut critics = MockCriticScoreProvider::new();
        critics.expect_fetch_scores().returning(|_| Ok(scores()));

        let queue = EnrichmentQueue::new(
            Arc::new(catalog_with_details()),
            Arc::new(critics),
            EnrichmentSettings::default(),
        );
        queue.enqueue(&[movie(1)]);
        assert_eq!(queue.in_flight(), 1);
        queue.clear();

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(queue.state(&EnrichmentKey::for_item(&movie(1))), CriticScoreState::Idle);
        assert_eq!(queue.completed(), 0);
    }

    /// Critic provider that records how many lookups overlap
    struct SlowCritics {
        running: AtomicUsize,
        peak: AtomicUsize,
    }

    #[async_trait::async_trait]
    impl CriticScoreProvider for SlowCritics {
        async fn fetch_scores(&self, _lookup: &CriticLookup) -> AppResult<CriticScores> {
            let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(20)).await;
            self.running.fetch_sub(1, Ordering::SeqCst);
            Ok(CriticScores::default())
        }

        fn name(&self) -> &'static str {
            "slow"
        }
    }

    /// Catalog whose details lookups always miss
    struct NoDetails;

    #[async_trait::async_trait]
    impl CatalogProvider for NoDetails {
        async fn discover_page(&self, _query: &DiscoveryQuery, page: u32) -> AppResult<CatalogPage> {
            Ok(CatalogPage {
                page,
                ..CatalogPage::default()
            })
        }

        async fn refresh_discover_page(&self, query: &DiscoveryQuery, page: u32) -> AppResult<CatalogPage> {
            self.discover_page(query, page).await
        }

        async fn fetch_details(&self, id: u64) -> AppResult<ItemDetails> {
            Err(AppError::NotFound(format!("movie {}", id)))
        }

        fn name(&self) -> &'static str {
            "none"
        }
    }

    #[tokio::test]
    async fn test_concurrency_cap_and_single_drain_signal() {
        let critics = Arc::new(SlowCritics {
            running: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        });
        let queue = EnrichmentQueue::new(
            Arc::new(NoDetails),
            critics.clone(),
            EnrichmentSettings {
                concurrency: 2,
                ..EnrichmentSettings::default()
            },
        );
        let mut rx = queue.subscribe();

        let items: Vec<CatalogItem> = (1..=6).map(movie).collect();
        assert_eq!(queue.enqueue(&items), 6);
        assert_eq!(queue.in_flight(), 2);

        wait_for_drain(&mut rx).await;
        assert_eq!(queue.completed(), 6);
        assert_eq!(critics.peak.load(Ordering::SeqCst), 2);
        assert_eq!(*rx.borrow_and_update(), 1);
    }

    /// Critic provider whose client blows up mid-request
    struct CrashingCritics;

    #[async_trait::async_trait]
    impl CriticScoreProvider for CrashingCritics {
        async fn fetch_scores(&self, _lookup: &CriticLookup) -> AppResult<CriticScores> {
            panic!("critic client crashed");
        }

        fn name(&self) -> &'static str {
            "crashing"
        }
    }

    #[tokio::test]
    async fn test_panicking_fetch_releases_its_slot() {
        let queue = EnrichmentQueue::new(
            Arc::new(NoDetails),
            Arc::new(CrashingCritics),
            EnrichmentSettings {
                concurrency: 1,
                ..EnrichmentSettings::default()
            },
        );
        let mut rx = queue.subscribe();

        assert_eq!(queue.enqueue(&[movie(1), movie(2)]), 2);
        wait_for_drain(&mut rx).await;

        assert_eq!(queue.in_flight(), 0);
        assert_eq!(queue.completed(), 2);
        for id in 1..=2 {
            assert!(matches!(
                queue.state(&EnrichmentKey::for_item(&movie(id))),
                CriticScoreState::Error(_)
            ));
        }
    }
}
