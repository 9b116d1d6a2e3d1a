use chrono::Utc;
use serde_json::Map;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::OnceCell;
use tokio::task::JoinHandle;

use crate::{
    db::{Collection, DocumentStore},
    error::{AppError, AppResult},
    models::DiscoveryCursorState,
};

const CURSOR_FIELD: &str = "discovery_cursors";

#[derive(Default)]
struct CursorMap {
    states: HashMap<String, DiscoveryCursorState>,
    /// Bumped on every write
    version: u64,
    /// Highest version known to be in the durable store
    persisted_version: u64,
}

impl CursorMap {
    fn is_dirty(&self) -> bool {
        self.version > self.persisted_version
    }

    fn evict_oldest(&mut self, cap: usize) {
        while self.states.len() > cap {
            let oldest = self
                .states
                .iter()
                .min_by_key(|(_, state)| state.updated_at)
                .map(|(signature, _)| signature.clone());
            match oldest {
                Some(signature) => {
                    tracing::debug!(signature = %signature, "Evicting discovery cursor");
                    self.states.remove(&signature);
                }
                None => break,
            }
        }
    }
}

struct CursorInner {
    store: Arc<dyn DocumentStore>,
    document_key: String,
    history_cap: usize,
    debounce: Duration,
    cursors: Mutex<CursorMap>,
    hydrated: OnceCell<()>,
    pending_flush: Mutex<Option<JoinHandle<()>>>,
}

/// Per-signature discovery progress with debounced persistence
///
/// All cursors for one identity live in a single document under the
/// `discovery_cursors` field, written with a partial merge so other fields on
/// the same document are left alone.
#[derive(Clone)]
pub struct CursorStore {
    inner: Arc<CursorInner>,
}

impl CursorStore {
    /// `user_id` picks the durable document; without one the cursors share a
    /// single local document in whatever store is passed
    pub fn new(
        store: Arc<dyn DocumentStore>,
        user_id: Option<&str>,
        history_cap: usize,
        debounce: Duration,
    ) -> Self {
        let document_key = match user_id {
            Some(id) => format!("user:{}", id),
            None => format!("{}:local", Collection::Cursors),
        };

        Self {
            inner: Arc::new(CursorInner {
                store,
                document_key,
                history_cap: history_cap.max(1),
                debounce,
                cursors: Mutex::new(CursorMap::default()),
                hydrated: OnceCell::new(),
                pending_flush: Mutex::new(None),
            }),
        }
    }

    pub fn document_key(&self) -> &str {
        &self.inner.document_key
    }

    pub async fn read(&self, signature: &str) -> Option<DiscoveryCursorState> {
        self.hydrate().await;
        self.lock_cursors()
            .ok()
            .and_then(|cursors| cursors.states.get(signature).cloned())
    }

    /// Record progress for `signature`
    ///
    /// `next_page` never moves backwards. The local map is updated immediately;
    /// the durable write happens after the debounce window.
    pub async fn write(&self, signature: &str, mut state: DiscoveryCursorState) -> DiscoveryCursorState {
        self.hydrate().await;

        let stored = match self.lock_cursors() {
            Ok(mut cursors) => {
                if let Some(existing) = cursors.states.get(signature) {
                    state.next_page = state.next_page.max(existing.next_page);
                    state.created_at = existing.created_at;
                }
                state.updated_at = Utc::now();

                cursors.states.insert(signature.to_string(), state.clone());
                cursors.version += 1;
                cursors.evict_oldest(self.inner.history_cap);
                state
            }
            Err(e) => {
                tracing::error!(error = %e, "Cursor map unavailable");
                return state;
            }
        };

        self.schedule_flush();
        stored
    }

    /// Persist immediately, cancelling any pending debounced write
    pub async fn flush(&self) -> AppResult<()> {
        if let Ok(mut pending) = self.inner.pending_flush.lock() {
            if let Some(handle) = pending.take() {
                handle.abort();
            }
        }
        self.inner.persist().await
    }

    pub fn len(&self) -> usize {
        self.lock_cursors().map(|c| c.states.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock_cursors(&self) -> AppResult<std::sync::MutexGuard<'_, CursorMap>> {
        self.inner
            .cursors
            .lock()
            .map_err(|e| AppError::Internal(format!("cursor lock poisoned: {}", e)))
    }

    fn schedule_flush(&self) {
        let inner = self.inner.clone();
        let debounce = self.inner.debounce;

        let Ok(mut pending) = self.inner.pending_flush.lock() else {
            return;
        };
        if let Some(handle) = pending.take() {
            handle.abort();
        }
        *pending = Some(tokio::spawn(async move {
            tokio::time::sleep(debounce).await;
            if let Err(e) = inner.persist().await {
                tracing::warn!(error = %e, "Debounced cursor write failed");
            }
        }));
    }

    /// Load remote cursors once and fold them into the local map
    async fn hydrate(&self) {
        self.inner
            .hydrated
            .get_or_init(|| async {
                let remote = match self.inner.store.get(&self.inner.document_key).await {
                    Ok(Some(document)) => document,
                    Ok(None) => return,
                    Err(e) => {
                        tracing::warn!(error = %e, key = %self.inner.document_key, "Cursor hydrate failed");
                        return;
                    }
                };

                let Some(value) = remote.get(CURSOR_FIELD).cloned() else {
                    return;
                };
                let states: HashMap<String, DiscoveryCursorState> =
                    match serde_json::from_value(value) {
                        Ok(states) => states,
                        Err(e) => {
                            tracing::warn!(error = %e, "Ignoring unreadable cursor document");
                            return;
                        }
                    };

                if let Ok(mut cursors) = self.lock_cursors() {
                    let count = states.len();
                    for (signature, remote_state) in states {
                        let newer = cursors
                            .states
                            .get(&signature)
                            .map_or(true, |local| remote_state.next_page > local.next_page);
                        if newer {
                            cursors.states.insert(signature, remote_state);
                        }
                    }
                    cursors.evict_oldest(self.inner.history_cap);
                    tracing::info!(cursors = count, key = %self.inner.document_key, "Discovery cursors hydrated");
                }
            })
            .await;
    }
}

impl CursorInner {
    async fn persist(&self) -> AppResult<()> {
        // Capture what to write before awaiting the store
        let (version, value) = {
            let cursors = self
                .cursors
                .lock()
                .map_err(|e| AppError::Internal(format!("cursor lock poisoned: {}", e)))?;
            if !cursors.is_dirty() {
                return Ok(());
            }
            (cursors.version, serde_json::to_value(&cursors.states)?)
        };

        let mut fields = Map::new();
        fields.insert(CURSOR_FIELD.to_string(), value);
        self.store.merge(&self.document_key, fields).await?;

        if let Ok(mut cursors) = self.cursors.lock() {
            cursors.persisted_version = cursors.persisted_version.max(version);
        }
        tracing::debug!(key = %self.document_key, version, store = self.store.name(), "Discovery cursors persisted");
        Ok(())
    }
}
