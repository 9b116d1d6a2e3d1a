use serde_json::{Map, Value};
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;

use crate::error::AppResult;

/// A JSON document: top-level field name → value
pub type Document = Map<String, Value>;

/// Durable key → document storage
///
/// Documents are written either wholesale (`put`) or field-by-field (`merge`).
/// A merge only touches the fields it names, so independent writers can share
/// one key without clobbering each other.
#[async_trait::async_trait]
pub trait DocumentStore: Send + Sync {
    /// Fetch the whole document at `key`
    async fn get(&self, key: &str) -> AppResult<Option<Document>>;

    /// Replace the document at `key`. `ttl_secs` sets an expiry on the key.
    async fn put(&self, key: &str, document: Document, ttl_secs: Option<u64>) -> AppResult<()>;

    /// Write the given fields into the document at `key`, keeping the others
    async fn merge(&self, key: &str, fields: Document) -> AppResult<()>;

    /// Backend name for logging
    fn name(&self) -> &'static str;
}

struct StoredDocument {
    fields: Document,
    expires_at: Option<Instant>,
}

impl StoredDocument {
    fn is_expired(&self) -> bool {
        self.expires_at
            .map(|deadline| Instant::now() >= deadline)
            .unwrap_or(false)
    }
}

/// Process-local document store
///
/// Backs discovery cursors when no user identity is configured and stands in
/// for Redis in tests.
#[derive(Default)]
pub struct MemoryStore {
    documents: RwLock<HashMap<String, StoredDocument>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.documents
            .read()
            .await
            .values()
            .filter(|doc| !doc.is_expired())
            .count()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[async_trait::async_trait]
impl DocumentStore for MemoryStore {
    async fn get(&self, key: &str) -> AppResult<Option<Document>> {
        let documents = self.documents.read().await;
        Ok(documents
            .get(key)
            .filter(|doc| !doc.is_expired())
            .map(|doc| doc.fields.clone()))
    }

    async fn put(&self, key: &str, document: Document, ttl_secs: Option<u64>) -> AppResult<()> {
        let expires_at = ttl_secs.map(|secs| Instant::now() + Duration::from_secs(secs));
        self.documents.write().await.insert(
            key.to_string(),
            StoredDocument {
                fields: document,
                expires_at,
            },
        );
        Ok(())
    }

    async fn merge(&self, key: &str, fields: Document) -> AppResult<()> {
        let mut documents = self.documents.write().await;
        let entry = documents
            .entry(key.to_string())
            .or_insert_with(|| StoredDocument {
                fields: Document::new(),
                expires_at: None,
            });
        if entry.is_expired() {
            entry.fields.clear();
            entry.expires_at = None;
        }
        entry.fields.extend(fields);
        Ok(())
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}
