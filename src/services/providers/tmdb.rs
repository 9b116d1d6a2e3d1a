/// TMDB catalog provider
///
/// API Flow:
/// 1. Discovery: /discover/movie?sort_by=..&with_genres=..&page=N → paginated results
/// 2. Details: /movie/{id}?append_to_response=credits → IMDb id, cast and crew
///
/// Every response passes through the tiered cache. The API key travels as a
/// query parameter but is excluded from cache keys.
use crate::{
    cached,
    config::CacheSettings,
    db::{CacheEntry, Collection, KeyPart, TieredCache},
    error::{AppError, AppResult},
    models::{
        tmdb::{parse_discover_page, parse_movie_details},
        CatalogPage, DiscoveryQuery, ItemDetails,
    },
    services::providers::{ensure_success, fetch_entry, CatalogProvider},
};
use reqwest::Client as HttpClient;
use std::sync::Arc;

const PROVIDER: &str = "tmdb";

#[derive(Clone)]
pub struct TmdbProvider {
    http_client: HttpClient,
    api_key: String,
    api_url: String,
    cache: Arc<TieredCache>,
    page_ttl_secs: u64,
    details_ttl_secs: u64,
}

impl TmdbProvider {
    pub fn new(
        cache: Arc<TieredCache>,
        settings: &CacheSettings,
        api_key: String,
        api_url: String,
    ) -> Self {
        Self {
            http_client: HttpClient::new(),
            api_key,
            api_url: api_url.trim_end_matches('/').to_string(),
            cache,
            page_ttl_secs: settings.upstream_ttl_secs,
            details_ttl_secs: settings.enrichment_ttl_secs,
        }
    }

    fn with_credentials(&self, mut params: Vec<(String, String)>) -> Vec<(String, String)> {
        params.push(("api_key".to_string(), self.api_key.clone()));
        params
    }

    fn discover_key(params: &[(String, String)]) -> Vec<KeyPart> {
        vec!["discover/movie".into(), KeyPart::Params(params.to_vec())]
    }

    fn details_key(id: u64) -> Vec<KeyPart> {
        vec!["movie".into(), id.into(), "credits".into()]
    }

    /// GET one discover page and validate it before anyone caches it
    async fn fetch_discover_entry(&self, params: &[(String, String)], page: u32) -> AppResult<CacheEntry> {
        let url = format!("{}/discover/movie", self.api_url);
        let entry = fetch_entry(&self.http_client, PROVIDER, &url, params).await?;
        ensure_success(PROVIDER, &entry)?;
        parse_discover_page(page, &entry.body)?;
        Ok(entry)
    }

    fn parse_page(query: &DiscoveryQuery, page: u32, entry: &CacheEntry) -> AppResult<CatalogPage> {
        let catalog_page = parse_discover_page(page, &entry.body)?;

        tracing::info!(
            signature = %query.signature(),
            page,
            results = catalog_page.results.len(),
            total_pages = ?catalog_page.total_pages,
            provider = PROVIDER,
            "Discover page loaded"
        );

        Ok(catalog_page)
    }
}

#[async_trait::async_trait]
impl CatalogProvider for TmdbProvider {
    async fn discover_page(&self, query: &DiscoveryQuery, page: u32) -> AppResult<CatalogPage> {
        let params = self.with_credentials(query.to_params(page));

        let entry = cached!(
            self.cache,
            Collection::Upstream,
            Self::discover_key(&params),
            self.page_ttl_secs,
            self.fetch_discover_entry(&params, page)
        )?;

        Self::parse_page(query, page, &entry)
    }

    async fn refresh_discover_page(&self, query: &DiscoveryQuery, page: u32) -> AppResult<CatalogPage> {
        let params = self.with_credentials(query.to_params(page));

        let entry = self.fetch_discover_entry(&params, page).await?;
        self.cache
            .write(Collection::Upstream, &Self::discover_key(&params), entry.clone())
            .await;

        Self::parse_page(query, page, &entry)
    }

    async fn fetch_details(&self, id: u64) -> AppResult<ItemDetails> {
        let params = self.with_credentials(vec![(
            "append_to_response".to_string(),
            "credits".to_string(),
        )]);
        let url = format!("{}/movie/{}", self.api_url, id);

        let entry = cached!(
            self.cache,
            Collection::Enrichment,
            Self::details_key(id),
            self.details_ttl_secs,
            async {
                let entry = fetch_entry(&self.http_client, PROVIDER, &url, &params).await?;
                ensure_success(PROVIDER, &entry)?;
                parse_movie_details(&entry.body)?;
                Ok::<_, AppError>(entry)
            }
        )?;

        let details = parse_movie_details(&entry.body)?;

        tracing::debug!(
            id,
            directors = details.directors.len(),
            cast = details.cast.len(),
            provider = PROVIDER,
            "Movie details loaded"
        );

        Ok(details)
    }

    fn name(&self) -> &'static str {
        PROVIDER
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::MemoryStore;

    fn create_test_provider(cache: Arc<TieredCache>) -> TmdbProvider {
        // Nothing listens on port 1, so any upstream call fails fast
        TmdbProvider::new(
            cache,
            &CacheSettings::default(),
            "test_key".to_string(),
            "http://127.0.0.1:1/3/".to_string(),
        )
    }

    fn create_cache() -> Arc<TieredCache> {
        Arc::new(TieredCache::new(
            Arc::new(MemoryStore::new()),
            &CacheSettings::default(),
        ))
    }

    #[test]
    fn test_api_url_trailing_slash_trimmed() {
        let provider = create_test_provider(create_cache());
        assert_eq!(provider.api_url, "http://127.0.0.1:1/3");
    }

    #[test]
    fn test_discover_key_ignores_api_key() {
        let query = DiscoveryQuery::default();
        let a = create_test_provider(create_cache()).with_credentials(query.to_params(1));
        let mut other = create_test_provider(create_cache());
        other.api_key = "different".to_string();
        let b = other.with_credentials(query.to_params(1));

        assert_ne!(a, b);
        assert_eq!(
            crate::db::derive_key(Collection::Upstream, &TmdbProvider::discover_key(&a)),
            crate::db::derive_key(Collection::Upstream, &TmdbProvider::discover_key(&b)),
        );
    }

    #[tokio::test]
    async fn test_discover_page_served_from_cache() {
        let cache = create_cache();
        let provider = create_test_provider(cache.clone());
        let query = DiscoveryQuery::default();
        let params = provider.with_credentials(query.to_params(1));

        let body = r#"{"page":1,"total_pages":3,"results":[{"id":603,"title":"The Matrix","vote_average":8.2,"vote_count":25000}]}"#;
        cache
            .write(
                Collection::Upstream,
                &TmdbProvider::discover_key(&params),
                CacheEntry::json(body),
            )
            .await;

        let page = provider.discover_page(&query, 1).await.unwrap();
        assert_eq!(page.total_pages, Some(3));
        assert_eq!(page.results[0].title, "The Matrix");
    }

    #[tokio::test]
    async fn test_refresh_discover_page_skips_cached_copy() {
        let cache = create_cache();
        let provider = create_test_provider(cache.clone());
        let query = DiscoveryQuery::default();
        let params = provider.with_credentials(query.to_params(1));

        let body = r#"{"page":1,"total_pages":1,"results":[{"id":603,"title":"The Matrix"}]}"#;
        cache
            .write(
                Collection::Upstream,
                &TmdbProvider::discover_key(&params),
                CacheEntry::json(body),
            )
            .await;

        // The cached copy answers a normal read, a refresh goes to the network
        assert!(provider.discover_page(&query, 1).await.is_ok());
        let refreshed = provider.refresh_discover_page(&query, 1).await;
        assert!(matches!(refreshed, Err(AppError::UpstreamUnavailable(_))));
    }

    #[tokio::test]
    async fn test_discover_page_network_failure_is_unavailable() {
        let provider = create_test_provider(create_cache());
        let result = provider.discover_page(&DiscoveryQuery::default(), 1).await;
        assert!(matches!(result, Err(AppError::UpstreamUnavailable(_))));
    }
}
