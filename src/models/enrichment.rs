use serde::{Deserialize, Serialize};
use std::fmt::Display;

use super::{CatalogItem, CriticScores};

/// Fetch state of an item's critic scores
///
/// `Idle → Loading → Loaded | Error` is the only automatic path. `Loaded` and
/// `Error` go back to `Loading` only through a forced refresh.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", content = "data", rename_all = "snake_case")]
pub enum CriticScoreState {
    #[default]
    Idle,
    Loading,
    Loaded(CriticScores),
    Error(String),
}

impl CriticScoreState {
    /// Whether a fetch may start from this state
    pub fn can_begin(&self, forced: bool) -> bool {
        match self {
            CriticScoreState::Idle => true,
            CriticScoreState::Loading => false,
            CriticScoreState::Loaded(_) | CriticScoreState::Error(_) => forced,
        }
    }

    pub fn scores(&self) -> Option<&CriticScores> {
        match self {
            CriticScoreState::Loaded(scores) => Some(scores),
            _ => None,
        }
    }
}

/// Content-derived key for enrichment state
///
/// Prefers the upstream id, then the external (IMDb) id, then normalized
/// title plus year, so restored or re-fetched copies of an item share state.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EnrichmentKey(String);

/// Lowercase, alphanumerics only, single spaces
pub fn normalize_title(title: &str) -> String {
    title
        .to_lowercase()
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { ' ' })
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

impl EnrichmentKey {
    pub fn derive(id: Option<u64>, imdb_id: Option<&str>, title: &str, year: Option<i32>) -> Self {
        if let Some(id) = id.filter(|id| *id > 0) {
            return Self(format!("tmdb:{}", id));
        }
        if let Some(imdb) = imdb_id.map(str::trim).filter(|imdb| !imdb.is_empty()) {
            return Self(format!("imdb:{}", imdb.to_lowercase()));
        }
        let year = year.map(|y| y.to_string()).unwrap_or_default();
        Self(format!("title:{}:{}", normalize_title(title), year))
    }

    /// Upstream ids are never 0, so 0 marks a record restored without one
    pub fn for_item(item: &CatalogItem) -> Self {
        Self::derive(
            Some(item.id),
            item.imdb_id.as_deref(),
            &item.title,
            item.release_year(),
        )
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for EnrichmentKey {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl Display for EnrichmentKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// What the critic score API is asked for
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CriticLookup {
    ExternalId(String),
    TitleYear { title: String, year: Option<i32> },
}

impl CriticLookup {
    pub fn for_item(item: &CatalogItem) -> Self {
        match item.imdb_id.as_deref().filter(|id| !id.is_empty()) {
            Some(imdb) => CriticLookup::ExternalId(imdb.to_string()),
            None => CriticLookup::TitleYear {
                title: item.title.clone(),
                year: item.release_year(),
            },
        }
    }
}
