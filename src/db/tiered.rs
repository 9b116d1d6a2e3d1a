use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use crate::config::CacheSettings;
use crate::db::key::{derive_key, Collection, KeyPart};
use crate::db::store::{Document, DocumentStore};

/// A cached upstream response
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CacheEntry {
    pub status: u16,
    pub content_type: String,
    /// Opaque response body
    pub body: String,
    #[serde(default)]
    pub metadata: Value,
    pub fetched_at: DateTime<Utc>,
}

impl CacheEntry {
    /// A 200 JSON entry fetched now
    pub fn json(body: impl Into<String>) -> Self {
        Self {
            status: 200,
            content_type: "application/json".to_string(),
            body: body.into(),
            metadata: Value::Null,
            fetched_at: Utc::now(),
        }
    }

    /// Fresh while `age <= ttl_secs`
    pub fn is_fresh(&self, ttl_secs: u64, now: DateTime<Utc>) -> bool {
        let age = now.signed_duration_since(self.fetched_at).num_seconds();
        age <= i64::try_from(ttl_secs).unwrap_or(i64::MAX)
    }

    /// Only successful, non-empty responses are worth keeping
    pub fn is_cacheable(&self) -> bool {
        (200..300).contains(&self.status) && !self.body.trim().is_empty()
    }

    fn to_document(&self) -> Option<Document> {
        match serde_json::to_value(self) {
            Ok(Value::Object(map)) => Some(map),
            _ => None,
        }
    }

    fn from_document(document: Document) -> Result<Self, serde_json::Error> {
        serde_json::from_value(Value::Object(document))
    }
}

/// Bounded in-process map with oldest-inserted eviction
struct FallbackCache {
    entries: HashMap<String, CacheEntry>,
    order: VecDeque<String>,
    capacity: usize,
}

impl FallbackCache {
    fn new(capacity: usize) -> Self {
        Self {
            entries: HashMap::new(),
            order: VecDeque::new(),
            capacity,
        }
    }

    fn get(&self, key: &str, ttl_secs: u64) -> Option<CacheEntry> {
        self.entries
            .get(key)
            .filter(|entry| entry.is_fresh(ttl_secs, Utc::now()))
            .cloned()
    }

    fn insert(&mut self, key: String, entry: CacheEntry) {
        if self.capacity == 0 {
            return;
        }
        // Overwrites keep their original insertion slot
        if self.entries.insert(key.clone(), entry).is_none() {
            self.order.push_back(key);
        }
        while self.entries.len() > self.capacity {
            match self.order.pop_front() {
                Some(oldest) => {
                    self.entries.remove(&oldest);
                }
                None => break,
            }
        }
    }

    fn len(&self) -> usize {
        self.entries.len()
    }
}

/// Durable-first response cache with an in-process fallback
///
/// The durable store is authoritative. The fallback map is populated on every
/// successful durable read or write and answers reads first, so it doubles as
/// an accelerator and as the only tier while the durable store is down. With
/// `require_durable` the fallback is disabled entirely and backend outages are
/// reported as misses.
///
/// Nothing here ever returns an error: backend failures are logged and
/// treated as misses.
pub struct TieredCache {
    store: Arc<dyn DocumentStore>,
    fallback: Mutex<FallbackCache>,
    require_durable: bool,
    retention_secs: u64,
}

impl TieredCache {
    pub fn new(store: Arc<dyn DocumentStore>, settings: &CacheSettings) -> Self {
        Self {
            store,
            fallback: Mutex::new(FallbackCache::new(settings.fallback_capacity)),
            require_durable: settings.require_durable,
            retention_secs: settings.retention_secs,
        }
    }

    /// Look up a fresh entry. `None` on miss, expiry, or backend failure.
    pub async fn read(
        &self,
        collection: Collection,
        parts: &[KeyPart],
        ttl_secs: u64,
    ) -> Option<CacheEntry> {
        let key = derive_key(collection, parts);

        if !self.require_durable {
            if let Some(entry) = self.fallback_get(&key, ttl_secs) {
                tracing::debug!(collection = %collection, key = %key, "Fallback cache hit");
                return Some(entry);
            }
        }

        match self.store.get(&key).await {
            Ok(Some(document)) => match CacheEntry::from_document(document) {
                Ok(entry) if entry.is_fresh(ttl_secs, Utc::now()) => {
                    tracing::debug!(collection = %collection, key = %key, "Durable cache hit");
                    self.fallback_insert(&key, &entry);
                    Some(entry)
                }
                Ok(_) => {
                    tracing::debug!(collection = %collection, key = %key, "Durable cache entry expired");
                    None
                }
                Err(e) => {
                    tracing::warn!(collection = %collection, key = %key, error = %e, "Discarding malformed cache entry");
                    None
                }
            },
            Ok(None) => {
                tracing::debug!(collection = %collection, key = %key, "Cache miss");
                None
            }
            Err(e) => {
                tracing::warn!(
                    collection = %collection,
                    backend = self.store.name(),
                    error = %e,
                    "Durable cache read failed, treating as miss"
                );
                None
            }
        }
    }

    /// Store `entry`, replacing whatever was there. Empty or failed responses are skipped.
    pub async fn write(&self, collection: Collection, parts: &[KeyPart], entry: CacheEntry) {
        if !entry.is_cacheable() {
            tracing::debug!(collection = %collection, status = entry.status, "Skipping uncacheable entry");
            return;
        }

        let key = derive_key(collection, parts);
        self.fallback_insert(&key, &entry);

        let Some(document) = entry.to_document() else {
            tracing::error!(collection = %collection, key = %key, "Cache entry serialization failed");
            return;
        };

        if let Err(e) = self
            .store
            .put(&key, document, Some(self.retention_secs))
            .await
        {
            tracing::warn!(
                collection = %collection,
                backend = self.store.name(),
                error = %e,
                "Durable cache write failed"
            );
        }
    }

    /// The durable backend behind this cache
    pub fn store(&self) -> Arc<dyn DocumentStore> {
        self.store.clone()
    }

    /// Entries currently held in the fallback tier
    pub fn fallback_len(&self) -> usize {
        self.fallback.lock().map(|f| f.len()).unwrap_or(0)
    }

    fn fallback_get(&self, key: &str, ttl_secs: u64) -> Option<CacheEntry> {
        self.fallback
            .lock()
            .ok()
            .and_then(|fallback| fallback.get(key, ttl_secs))
    }

    fn fallback_insert(&self, key: &str, entry: &CacheEntry) {
        if self.require_durable {
            return;
        }
        if let Ok(mut fallback) = self.fallback.lock() {
            fallback.insert(key.to_string(), entry.clone());
        }
    }
}
