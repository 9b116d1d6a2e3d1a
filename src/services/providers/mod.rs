/// Upstream data providers
///
/// The engine talks to two external APIs: a paginated catalog (discover pages,
/// per-movie details with credits) and a secondary critic score service. Both
/// sit behind traits so the engine can be exercised against fakes, and both
/// normalize raw payloads into the crate's models before returning.
use chrono::Utc;
use reqwest::{header, Client as HttpClient, StatusCode};
use serde_json::json;

use crate::{
    db::CacheEntry,
    error::{AppError, AppResult},
    models::{CatalogPage, CriticLookup, CriticScores, DiscoveryQuery, ItemDetails},
};

pub mod omdb;
pub mod tmdb;

pub use omdb::OmdbProvider;
pub use tmdb::TmdbProvider;

/// Paginated movie catalog
#[cfg_attr(test, mockall::automock)]
#[async_trait::async_trait]
pub trait CatalogProvider: Send + Sync {
    /// Fetch one page of discover results for `query`
    ///
    /// The reported total page count may change between calls.
    async fn discover_page(&self, query: &DiscoveryQuery, page: u32) -> AppResult<CatalogPage>;

    /// Like `discover_page`, but never answered from cache. A successful
    /// response still replaces the cached copy.
    async fn refresh_discover_page(&self, query: &DiscoveryQuery, page: u32) -> AppResult<CatalogPage>;

    /// Fetch the external id and credits for one movie
    async fn fetch_details(&self, id: u64) -> AppResult<ItemDetails>;

    /// Provider name for logging and debugging
    fn name(&self) -> &'static str;
}

/// Secondary critic score source
#[cfg_attr(test, mockall::automock)]
#[async_trait::async_trait]
pub trait CriticScoreProvider: Send + Sync {
    /// Look up scores by external id or by title and year
    ///
    /// Returns `EnrichmentNotFound` when the service has no record and
    /// `UpstreamRateLimited` when the key's quota is exhausted.
    async fn fetch_scores(&self, lookup: &CriticLookup) -> AppResult<CriticScores>;

    fn name(&self) -> &'static str;
}

/// Critic provider used when no API key is configured
pub struct DisabledCriticScores;

#[async_trait::async_trait]
impl CriticScoreProvider for DisabledCriticScores {
    async fn fetch_scores(&self, lookup: &CriticLookup) -> AppResult<CriticScores> {
        Err(AppError::EnrichmentNotFound(format!(
            "critic scores disabled ({:?})",
            lookup
        )))
    }

    fn name(&self) -> &'static str {
        "disabled"
    }
}

/// Issue a GET and capture the response as a cache entry
///
/// 429 and 5xx responses become errors here; any other status is returned so
/// the caller can interpret provider-specific error bodies.
pub(crate) async fn fetch_entry(
    http_client: &HttpClient,
    provider: &'static str,
    url: &str,
    params: &[(String, String)],
) -> AppResult<CacheEntry> {
    let response = http_client.get(url).query(params).send().await?;
    let status = response.status();

    if status == StatusCode::TOO_MANY_REQUESTS {
        let retry_after_secs = response
            .headers()
            .get(header::RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<u64>().ok());
        tracing::warn!(provider, retry_after = ?retry_after_secs, "Upstream rate limit hit");
        return Err(AppError::UpstreamRateLimited { retry_after_secs });
    }

    if status.is_server_error() {
        tracing::error!(provider, status = %status, "Upstream server error");
        return Err(AppError::UpstreamUnavailable(format!(
            "{} returned status {}",
            provider, status
        )));
    }

    let content_type = response
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("application/octet-stream")
        .to_string();
    let body = response.text().await?;

    Ok(CacheEntry {
        status: status.as_u16(),
        content_type,
        body,
        metadata: json!({ "provider": provider, "url": url }),
        fetched_at: Utc::now(),
    })
}

/// Reject non-2xx entries that the provider has no special handling for
pub(crate) fn ensure_success(provider: &'static str, entry: &CacheEntry) -> AppResult<()> {
    match entry.status {
        200..=299 => Ok(()),
        404 => Err(AppError::NotFound(format!("{} returned 404", provider))),
        status => {
            let snippet: String = entry.body.chars().take(200).collect();
            Err(AppError::UpstreamUnavailable(format!(
                "{} returned status {}: {}",
                provider, status, snippet
            )))
        }
    }
}
