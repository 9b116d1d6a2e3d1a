use chrono::NaiveDate;
use serde::Deserialize;
use serde_json::Value;

use super::{CatalogItem, CatalogPage, ItemDetails};
use crate::error::{AppError, AppResult};

/// Cast members kept per item
const MAX_CAST: usize = 10;

// ============================================================================
// TMDB API Types
// ============================================================================

/// Raw movie from `/discover/movie`
#[derive(Debug, Clone, Deserialize)]
pub struct TmdbMovie {
    pub id: u64,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub original_title: Option<String>,
    #[serde(default)]
    pub overview: Option<String>,
    #[serde(default)]
    pub release_date: Option<String>,
    #[serde(default)]
    pub vote_average: Option<f64>,
    #[serde(default)]
    pub vote_count: Option<u32>,
    #[serde(default)]
    pub popularity: Option<f64>,
    #[serde(default)]
    pub genre_ids: Vec<u32>,
    #[serde(default)]
    pub poster_path: Option<String>,
    #[serde(default)]
    pub backdrop_path: Option<String>,
}

fn non_blank(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

impl TmdbMovie {
    /// Normalize into a `CatalogItem`. Items without a usable title are dropped.
    pub fn into_item(self) -> Option<CatalogItem> {
        let title = non_blank(self.title).or_else(|| non_blank(self.original_title.clone()))?;
        if self.id == 0 {
            return None;
        }

        let mut genre_ids = self.genre_ids;
        genre_ids.sort_unstable();
        genre_ids.dedup();

        Some(CatalogItem {
            id: self.id,
            title,
            original_title: non_blank(self.original_title),
            overview: non_blank(self.overview),
            release_date: self
                .release_date
                .as_deref()
                .and_then(|d| NaiveDate::parse_from_str(d, "%Y-%m-%d").ok()),
            rating: self.vote_average.map(|r| r.clamp(0.0, 10.0)),
            vote_count: self.vote_count,
            popularity: self.popularity,
            genre_ids,
            poster_path: non_blank(self.poster_path),
            backdrop_path: non_blank(self.backdrop_path),
            imdb_id: None,
            critic_scores: None,
            directors: Vec::new(),
            cast: Vec::new(),
        })
    }
}

/// Parse a discover page body.
///
/// A body without a `results` array is an `InvalidResponseShape`; individual
/// malformed items are skipped.
pub fn parse_discover_page(page: u32, body: &str) -> AppResult<CatalogPage> {
    let json: Value = serde_json::from_str(body)?;
    let results = json["results"].as_array().ok_or_else(|| {
        AppError::InvalidResponseShape("discover response has no results array".to_string())
    })?;

    let items: Vec<CatalogItem> = results
        .iter()
        .filter_map(|result| {
            serde_json::from_value::<TmdbMovie>(result.clone())
                .ok()
                .and_then(TmdbMovie::into_item)
        })
        .collect();

    let total_pages = json["total_pages"].as_u64().map(|p| p.min(u32::MAX as u64) as u32);

    Ok(CatalogPage {
        page,
        results: items,
        total_pages,
    })
}

#[derive(Debug, Deserialize)]
struct TmdbCastMember {
    name: String,
    #[serde(default)]
    order: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct TmdbCrewMember {
    name: String,
    #[serde(default)]
    job: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct TmdbCredits {
    #[serde(default)]
    cast: Vec<TmdbCastMember>,
    #[serde(default)]
    crew: Vec<TmdbCrewMember>,
}

/// `/movie/{id}?append_to_response=credits`
#[derive(Debug, Deserialize)]
struct TmdbMovieDetails {
    #[serde(default)]
    imdb_id: Option<String>,
    #[serde(default)]
    credits: TmdbCredits,
}

pub fn parse_movie_details(body: &str) -> AppResult<ItemDetails> {
    let details: TmdbMovieDetails = serde_json::from_str(body)?;

    let mut cast = details.credits.cast;
    cast.sort_by_key(|member| member.order.unwrap_or(u32::MAX));

    let mut directors: Vec<String> = Vec::new();
    for member in details.credits.crew {
        if member.job.as_deref() == Some("Director") && !directors.contains(&member.name) {
            directors.push(member.name);
        }
    }

    Ok(ItemDetails {
        imdb_id: non_blank(details.imdb_id),
        directors,
        cast: cast.into_iter().take(MAX_CAST).map(|m| m.name).collect(),
    })
}
