use chrono::{Datelike, NaiveDate};
use serde::{Deserialize, Serialize};

/// Critic score bundle from the secondary ratings API
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct CriticScores {
    /// Percentage of positive reviews (0–100)
    pub rotten_tomatoes: Option<u8>,
    /// Weighted critic average (0–100)
    pub metacritic: Option<u8>,
    /// Audience rating (0–10)
    pub imdb: Option<f64>,
}

impl CriticScores {
    pub fn is_empty(&self) -> bool {
        self.rotten_tomatoes.is_none() && self.metacritic.is_none() && self.imdb.is_none()
    }
}

/// Per-item details fetched lazily from the catalog API
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ItemDetails {
    pub imdb_id: Option<String>,
    pub directors: Vec<String>,
    pub cast: Vec<String>,
}

/// A movie in the catalog, normalized from the upstream payload
///
/// Fields fetched with the item are immutable. Enrichment fields (`imdb_id`,
/// `critic_scores`, `directors`, `cast`) may only be filled in, never cleared.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CatalogItem {
    /// Upstream-assigned id, unique within a snapshot
    pub id: u64,
    pub title: String,
    #[serde(default)]
    pub original_title: Option<String>,
    #[serde(default)]
    pub overview: Option<String>,
    #[serde(default)]
    pub release_date: Option<NaiveDate>,
    /// Average rating, 0–10
    #[serde(default)]
    pub rating: Option<f64>,
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
    #[serde(default)]
    pub imdb_id: Option<String>,
    #[serde(default)]
    pub critic_scores: Option<CriticScores>,
    #[serde(default)]
    pub directors: Vec<String>,
    #[serde(default)]
    pub cast: Vec<String>,
}

impl CatalogItem {
    pub fn new(id: u64, title: impl Into<String>) -> Self {
        Self {
            id,
            title: title.into(),
            original_title: None,
            overview: None,
            release_date: None,
            rating: None,
            vote_count: None,
            popularity: None,
            genre_ids: Vec::new(),
            poster_path: None,
            backdrop_path: None,
            imdb_id: None,
            critic_scores: None,
            directors: Vec::new(),
            cast: Vec::new(),
        }
    }

    pub fn release_year(&self) -> Option<i32> {
        self.release_date.map(|date| date.year())
    }

    /// Count of populated informative fields, used to pick between duplicates
    pub fn completeness_score(&self) -> u32 {
        [
            self.poster_path.is_some(),
            self.overview.as_deref().is_some_and(|o| !o.trim().is_empty()),
            self.rating.is_some(),
            self.vote_count.is_some(),
            self.release_date.is_some(),
            self.critic_scores.is_some(),
            !self.directors.is_empty(),
            !self.cast.is_empty(),
            !self.genre_ids.is_empty(),
        ]
        .into_iter()
        .filter(|present| *present)
        .count() as u32
    }

    pub fn has_genres(&self, required: &[u32]) -> bool {
        required.iter().all(|genre| self.genre_ids.contains(genre))
    }

    pub fn has_any_genre(&self, excluded: &[u32]) -> bool {
        excluded.iter().any(|genre| self.genre_ids.contains(genre))
    }

    /// Fill empty enrichment fields from `other`. Populated fields are kept.
    pub fn absorb(&mut self, other: &CatalogItem) {
        if self.imdb_id.is_none() {
            self.imdb_id = other.imdb_id.clone();
        }
        if self.critic_scores.is_none() {
            self.critic_scores = other.critic_scores.clone();
        }
        if self.directors.is_empty() {
            self.directors = other.directors.clone();
        }
        if self.cast.is_empty() {
            self.cast = other.cast.clone();
        }
    }

    pub fn apply_details(&mut self, details: &ItemDetails) {
        if self.imdb_id.is_none() {
            self.imdb_id = details.imdb_id.clone();
        }
        if self.directors.is_empty() {
            self.directors = details.directors.clone();
        }
        if self.cast.is_empty() {
            self.cast = details.cast.clone();
        }
    }

    pub fn apply_critic_scores(&mut self, scores: &CriticScores) {
        if self.critic_scores.is_none() {
            self.critic_scores = Some(scores.clone());
        }
    }
}
