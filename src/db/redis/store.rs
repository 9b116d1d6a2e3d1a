use redis::AsyncCommands;
use redis::Client;
use serde_json::Value;
use std::collections::HashMap;

use crate::db::store::{Document, DocumentStore};
use crate::error::{AppError, AppResult};

/// Creates a Redis client for the durable store
///
/// The client connects lazily; an unreachable server surfaces as
/// `CacheBackendUnavailable` on the first command.
pub fn create_redis_client(redis_url: &str) -> anyhow::Result<Client> {
    let client = Client::open(redis_url)?;
    Ok(client)
}

/// Redis-backed document store
///
/// Each document is a Redis hash with one JSON-encoded value per top-level
/// field. That makes `merge` a plain `HSET` of the named fields.
#[derive(Clone)]
pub struct RedisStore {
    redis_client: Client,
}

impl RedisStore {
    pub fn new(redis_client: Client) -> Self {
        Self { redis_client }
    }

    fn encode_fields(document: &Document) -> AppResult<Vec<(String, String)>> {
        document
            .iter()
            .map(|(field, value)| {
                serde_json::to_string(value)
                    .map(|json| (field.clone(), json))
                    .map_err(|e| AppError::Internal(format!("Document serialization error: {}", e)))
            })
            .collect()
    }

    fn decode_fields(key: &str, raw: HashMap<String, String>) -> Document {
        let mut document = Document::new();
        for (field, json) in raw {
            match serde_json::from_str::<Value>(&json) {
                Ok(value) => {
                    document.insert(field, value);
                }
                Err(e) => {
                    tracing::warn!(key = %key, field = %field, error = %e, "Skipping undecodable document field");
                }
            }
        }
        document
    }
}

#[async_trait::async_trait]
impl DocumentStore for RedisStore {
    async fn get(&self, key: &str) -> AppResult<Option<Document>> {
        let mut conn = self.redis_client.get_multiplexed_async_connection().await?;
        let raw: HashMap<String, String> = conn.hgetall(key).await?;

        if raw.is_empty() {
            return Ok(None);
        }

        Ok(Some(Self::decode_fields(key, raw)))
    }

    async fn put(&self, key: &str, document: Document, ttl_secs: Option<u64>) -> AppResult<()> {
        let fields = Self::encode_fields(&document)?;
        let mut conn = self.redis_client.get_multiplexed_async_connection().await?;

        let mut pipe = redis::pipe();
        pipe.atomic().del(key).ignore();
        if !fields.is_empty() {
            pipe.hset_multiple(key, fields.as_slice()).ignore();
            if let Some(ttl) = ttl_secs {
                pipe.expire(key, i64::try_from(ttl).unwrap_or(i64::MAX)).ignore();
            }
        }
        let _: () = pipe.query_async(&mut conn).await?;

        tracing::debug!(key = %key, fields = fields.len(), ttl = ?ttl_secs, "Stored document");
        Ok(())
    }

    async fn merge(&self, key: &str, fields: Document) -> AppResult<()> {
        let fields = Self::encode_fields(&fields)?;
        if fields.is_empty() {
            return Ok(());
        }

        let mut conn = self.redis_client.get_multiplexed_async_connection().await?;
        let _: () = conn.hset_multiple(key, fields.as_slice()).await?;

        tracing::debug!(key = %key, fields = fields.len(), "Merged document fields");
        Ok(())
    }

    fn name(&self) -> &'static str {
        "redis"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_encode_fields_json_encodes_each_value() {
        let mut document = Document::new();
        document.insert("status".to_string(), json!(200));
        document.insert("body".to_string(), json!("{\"page\":1}"));

        let mut fields = RedisStore::encode_fields(&document).unwrap();
        fields.sort();

        assert_eq!(
            fields,
            vec![
                ("body".to_string(), "\"{\\\"page\\\":1}\"".to_string()),
                ("status".to_string(), "200".to_string()),
            ]
        );
    }

    #[test]
    fn test_decode_fields_skips_garbage() {
        let mut raw = HashMap::new();
        raw.insert("ok".to_string(), "{\"a\":1}".to_string());
        raw.insert("bad".to_string(), "{oops".to_string());

        let document = RedisStore::decode_fields("k", raw);
        assert_eq!(document.len(), 1);
        assert_eq!(document["ok"], json!({"a": 1}));
    }

    #[tokio::test]
    async fn test_unreachable_server_reports_backend_unavailable() {
        // Nothing listens on port 1
        let client = create_redis_client("redis://127.0.0.1:1").unwrap();
        let store = RedisStore::new(client);

        let result = store.get("missing").await;
        assert!(matches!(result, Err(AppError::CacheBackendUnavailable(_))));
    }
}
