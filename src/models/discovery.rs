use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::CatalogItem;

pub const DEFAULT_SORT: &str = "popularity.desc";

/// Filter/sort parameters for the upstream discover endpoint
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiscoveryQuery {
    pub sort_by: String,
    #[serde(default)]
    pub with_genres: Vec<u32>,
    #[serde(default)]
    pub without_genres: Vec<u32>,
    #[serde(default)]
    pub min_vote_count: Option<u32>,
    #[serde(default)]
    pub language: Option<String>,
    /// Upper bound on release date, `YYYY-MM-DD`
    #[serde(default)]
    pub released_before: Option<String>,
}

impl Default for DiscoveryQuery {
    fn default() -> Self {
        Self {
            sort_by: DEFAULT_SORT.to_string(),
            with_genres: Vec::new(),
            without_genres: Vec::new(),
            min_vote_count: None,
            language: None,
            released_before: None,
        }
    }
}

fn join_sorted(ids: &[u32]) -> String {
    let mut ids = ids.to_vec();
    ids.sort_unstable();
    ids.dedup();
    ids.iter()
        .map(|id| id.to_string())
        .collect::<Vec<_>>()
        .join(",")
}

impl DiscoveryQuery {
    /// Canonical string keying resumable discovery state.
    ///
    /// Genre lists are sorted and deduplicated and empty filters are omitted,
    /// so the same logical query always maps to the same signature.
    pub fn signature(&self) -> String {
        let mut parts = vec![format!("sort={}", self.sort_by.trim().to_lowercase())];
        if !self.with_genres.is_empty() {
            parts.push(format!("with={}", join_sorted(&self.with_genres)));
        }
        if !self.without_genres.is_empty() {
            parts.push(format!("without={}", join_sorted(&self.without_genres)));
        }
        if let Some(votes) = self.min_vote_count {
            parts.push(format!("votes>={}", votes));
        }
        if let Some(language) = &self.language {
            parts.push(format!("lang={}", language.trim().to_lowercase()));
        }
        if let Some(before) = &self.released_before {
            parts.push(format!("before={}", before));
        }
        parts.join("|")
    }

    /// Query parameters for one upstream page, excluding credentials
    pub fn to_params(&self, page: u32) -> Vec<(String, String)> {
        let mut params = vec![
            ("sort_by".to_string(), self.sort_by.clone()),
            ("page".to_string(), page.to_string()),
            ("include_adult".to_string(), "false".to_string()),
        ];
        if !self.with_genres.is_empty() {
            params.push(("with_genres".to_string(), join_sorted(&self.with_genres)));
        }
        if !self.without_genres.is_empty() {
            params.push(("without_genres".to_string(), join_sorted(&self.without_genres)));
        }
        if let Some(votes) = self.min_vote_count {
            params.push(("vote_count.gte".to_string(), votes.to_string()));
        }
        if let Some(language) = &self.language {
            params.push(("with_original_language".to_string(), language.clone()));
        }
        if let Some(before) = &self.released_before {
            params.push(("primary_release_date.lte".to_string(), before.clone()));
        }
        params
    }

    /// Whether a snapshot item satisfies this query's genre filters
    pub fn matches(&self, item: &CatalogItem) -> bool {
        item.has_genres(&self.with_genres) && !item.has_any_genre(&self.without_genres)
    }
}

/// One page of upstream results, already normalized
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CatalogPage {
    pub page: u32,
    pub results: Vec<CatalogItem>,
    /// Total page count as reported by upstream on this call
    pub total_pages: Option<u32>,
}

/// Resumable paging progress for one query signature
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiscoveryCursorState {
    /// Next upstream page to fetch (1-based)
    pub next_page: u32,
    /// Highest page this signature may reach before the ceiling grows again
    pub page_ceiling: u32,
    /// Most recently reported upstream total; always overwritten by the latest fetch
    pub total_pages: Option<u32>,
    pub exhausted: bool,
    /// Set after a rate-limit response; discovery stays offline until then
    #[serde(default)]
    pub rate_limited_until: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl DiscoveryCursorState {
    pub fn new(page_ceiling: u32) -> Self {
        let now = Utc::now();
        Self {
            next_page: 1,
            page_ceiling,
            total_pages: None,
            exhausted: false,
            rate_limited_until: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn last_fetched_page(&self) -> Option<u32> {
        self.next_page.checked_sub(1).filter(|page| *page > 0)
    }

    pub fn is_rate_limited(&self, now: DateTime<Utc>) -> bool {
        self.rate_limited_until.is_some_and(|until| until > now)
    }
}
