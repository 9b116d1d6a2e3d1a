use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashSet;
use std::str::FromStr;

use crate::error::{AppError, AppResult};
use crate::models::{
    CatalogItem, CriticScoreState, DiscoveryCursorState, DiscoveryQuery, EnrichmentKey, ItemDetails,
};
use crate::services::{catalog::CatalogMetadata, FeedPage, FeedRequest, SearchResults};

use super::AppState;

const DEFAULT_LIST_LIMIT: usize = 20;
const MAX_LIST_LIMIT: usize = 100;
const MAX_FEED_PAGE: usize = 500;

// Request/Response types

#[derive(Debug, Default, Deserialize)]
pub struct FeedParams {
    pub sort_by: Option<String>,
    /// Comma-separated genre ids
    pub with_genres: Option<String>,
    pub without_genres: Option<String>,
    pub page: Option<usize>,
    pub page_size: Option<usize>,
    /// Comma-separated item ids to leave out
    pub exclude: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct SearchParams {
    #[serde(default)]
    pub q: String,
    pub limit: Option<usize>,
    pub min_score: Option<f64>,
    pub exclude: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct NewReleaseParams {
    pub q: Option<String>,
    pub limit: Option<usize>,
    pub exclude: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct EnrichmentResponse {
    pub key: String,
    pub state: CriticScoreState,
    pub details: Option<ItemDetails>,
}

#[derive(Debug, Serialize)]
pub struct RefreshResponse {
    pub key: String,
    pub started: bool,
    pub state: CriticScoreState,
}

/// Parse a comma-separated list, ignoring blanks
fn parse_list<T: FromStr>(raw: Option<&str>, field: &str) -> AppResult<Vec<T>> {
    let Some(raw) = raw else {
        return Ok(Vec::new());
    };
    raw.split(',')
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .map(|part| {
            part.parse::<T>()
                .map_err(|_| AppError::InvalidInput(format!("{}: '{}' is not a valid id", field, part)))
        })
        .collect()
}

fn parse_exclusions(raw: Option<&str>) -> AppResult<HashSet<u64>> {
    Ok(parse_list::<u64>(raw, "exclude")?.into_iter().collect())
}

fn list_limit(limit: Option<usize>) -> AppResult<usize> {
    match limit.unwrap_or(DEFAULT_LIST_LIMIT) {
        0 => Err(AppError::InvalidInput("limit must be positive".to_string())),
        limit => Ok(limit.min(MAX_LIST_LIMIT)),
    }
}

// Handlers

/// Health check endpoint
pub async fn health_check() -> (StatusCode, Json<Value>) {
    (StatusCode::OK, Json(json!({ "status": "healthy" })))
}

/// Ranked feed page for a discovery query
pub async fn movies(
    State(state): State<AppState>,
    Query(params): Query<FeedParams>,
) -> AppResult<Json<FeedPage>> {
    let mut query = DiscoveryQuery {
        with_genres: parse_list(params.with_genres.as_deref(), "with_genres")?,
        without_genres: parse_list(params.without_genres.as_deref(), "without_genres")?,
        ..DiscoveryQuery::default()
    };
    if let Some(sort_by) = params.sort_by.filter(|s| !s.trim().is_empty()) {
        query.sort_by = sort_by;
    }

    let page = params.page.unwrap_or(1);
    if page > MAX_FEED_PAGE {
        return Err(AppError::InvalidInput(format!(
            "page must be at most {}",
            MAX_FEED_PAGE
        )));
    }

    let request = FeedRequest {
        query,
        page,
        page_size: params.page_size.unwrap_or(0).min(MAX_LIST_LIMIT),
        exclude_ids: parse_exclusions(params.exclude.as_deref())?,
    };

    let page = state.engine.movies(request).await?;
    Ok(Json(page))
}

/// Title search over the catalog snapshot
pub async fn search_catalog(
    State(state): State<AppState>,
    Query(params): Query<SearchParams>,
) -> AppResult<Json<SearchResults>> {
    let limit = list_limit(params.limit)?;
    let exclude = parse_exclusions(params.exclude.as_deref())?;

    let results = state
        .engine
        .catalog()
        .search(&params.q, limit, params.min_score, &exclude)
        .await?;
    Ok(Json(results))
}

/// Recently released titles, newest first
pub async fn new_releases(
    State(state): State<AppState>,
    Query(params): Query<NewReleaseParams>,
) -> AppResult<Json<Vec<CatalogItem>>> {
    let limit = list_limit(params.limit)?;
    let exclude = parse_exclusions(params.exclude.as_deref())?;

    let releases = state
        .engine
        .catalog()
        .fetch_new_releases(params.q.as_deref(), limit, &exclude)
        .await?;
    Ok(Json(releases))
}

/// Force a snapshot refresh from upstream
pub async fn refresh_catalog(State(state): State<AppState>) -> AppResult<Json<CatalogMetadata>> {
    let snapshot = state.engine.catalog().ensure_catalog(true, false, false).await?;
    Ok(Json(snapshot.metadata))
}

/// Critic score state for one enrichment key
pub async fn enrichment_state(
    State(state): State<AppState>,
    Path(key): Path<String>,
) -> Json<EnrichmentResponse> {
    let key = EnrichmentKey::from(key);
    let enrichment = state.engine.enrichment();

    Json(EnrichmentResponse {
        state: enrichment.state(&key),
        details: enrichment.details(&key),
        key: key.to_string(),
    })
}

/// Re-fetch enrichment for an item regardless of its current state
pub async fn refresh_enrichment(
    State(state): State<AppState>,
    Json(item): Json<CatalogItem>,
) -> AppResult<(StatusCode, Json<RefreshResponse>)> {
    if item.id == 0 && item.imdb_id.is_none() && item.title.trim().is_empty() {
        return Err(AppError::InvalidInput(
            "item needs an id, an imdb_id or a title".to_string(),
        ));
    }

    let key = EnrichmentKey::for_item(&item);
    let enrichment = state.engine.enrichment();
    let started = enrichment.refresh(&item);

    Ok((
        StatusCode::ACCEPTED,
        Json(RefreshResponse {
            state: enrichment.state(&key),
            key: key.to_string(),
            started,
        }),
    ))
}

/// Stored paging progress for a query signature
pub async fn discovery_cursor(
    State(state): State<AppState>,
    Path(signature): Path<String>,
) -> AppResult<Json<DiscoveryCursorState>> {
    state
        .engine
        .discovery()
        .cursor(&signature)
        .await
        .map(Json)
        .ok_or_else(|| AppError::NotFound(format!("No discovery cursor for '{}'", signature)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_list_skips_blanks() {
        let ids: Vec<u32> = parse_list(Some("18, 35,,"), "with_genres").unwrap();
        assert_eq!(ids, vec![18, 35]);
    }

    #[test]
    fn test_parse_list_rejects_garbage() {
        let result = parse_list::<u32>(Some("18,drama"), "with_genres");
        assert!(matches!(result, Err(AppError::InvalidInput(_))));
    }

    #[test]
    fn test_list_limit_bounds() {
        assert_eq!(list_limit(None).unwrap(), DEFAULT_LIST_LIMIT);
        assert_eq!(list_limit(Some(500)).unwrap(), MAX_LIST_LIMIT);
        assert!(list_limit(Some(0)).is_err());
    }
}
