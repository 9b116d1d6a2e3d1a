#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use reelfeed::error::{AppError, AppResult};
use reelfeed::models::{
    CatalogItem, CatalogPage, CriticLookup, CriticScores, DiscoveryQuery, ItemDetails,
};
use reelfeed::services::{CatalogProvider, CriticScoreProvider};

const TITLES: [&str; 12] = [
    "Harbor Lights",
    "Glass Orchard",
    "Night Train",
    "Paper Comets",
    "Salt Road",
    "Quiet Engines",
    "The Night Watch",
    "Amber Coast",
    "Iron Meadow",
    "Lantern Hill",
    "Cold Summit",
    "Velvet Static",
];

pub fn drama(id: u64) -> CatalogItem {
    CatalogItem {
        rating: Some(7.0 + id as f64 * 0.1),
        vote_count: Some(100 * id as u32),
        genre_ids: vec![18],
        ..CatalogItem::new(id, TITLES[(id as usize - 1) % TITLES.len()])
    }
}

pub fn horror(id: u64) -> CatalogItem {
    CatalogItem {
        rating: Some(7.4),
        vote_count: Some(300),
        genre_ids: vec![27],
        ..CatalogItem::new(id, format!("Fright {}", id))
    }
}

/// Catalog with two pages of dramas for the default query and one page of
/// horror for `with_genres=27`
pub struct FakeCatalog {
    offline: bool,
    pub page_calls: Arc<AtomicUsize>,
}

impl FakeCatalog {
    pub fn standard() -> Self {
        Self {
            offline: false,
            page_calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn offline() -> Self {
        Self {
            offline: true,
            page_calls: Arc::new(AtomicUsize::new(0)),
        }
    }
}

#[async_trait::async_trait]
impl CatalogProvider for FakeCatalog {
    async fn discover_page(&self, query: &DiscoveryQuery, page: u32) -> AppResult<CatalogPage> {
        self.page_calls.fetch_add(1, Ordering::SeqCst);
        if self.offline {
            return Err(AppError::UpstreamUnavailable("connection refused".to_string()));
        }

        if query.with_genres.contains(&27) {
            let results = if page == 1 { (200..203).map(horror).collect() } else { Vec::new() };
            return Ok(CatalogPage {
                page,
                results,
                total_pages: Some(1),
            });
        }

        let results = match page {
            1 => (1..=6).map(drama).collect(),
            2 => (7..=12).map(drama).collect(),
            _ => Vec::new(),
        };
        Ok(CatalogPage {
            page,
            results,
            total_pages: Some(2),
        })
    }

    async fn refresh_discover_page(&self, query: &DiscoveryQuery, page: u32) -> AppResult<CatalogPage> {
        self.discover_page(query, page).await
    }

    async fn fetch_details(&self, id: u64) -> AppResult<ItemDetails> {
        Ok(ItemDetails {
            imdb_id: Some(format!("tt{:07}", id)),
            directors: vec!["A. Director".to_string()],
            cast: vec!["Lead".to_string(), "Support".to_string()],
        })
    }

    fn name(&self) -> &'static str {
        "fake-catalog"
    }
}

pub struct FakeCritics;

#[async_trait::async_trait]
impl CriticScoreProvider for FakeCritics {
    async fn fetch_scores(&self, lookup: &CriticLookup) -> AppResult<CriticScores> {
        match lookup {
            CriticLookup::ExternalId(_) => Ok(CriticScores {
                rotten_tomatoes: Some(90),
                metacritic: Some(75),
                imdb: Some(7.9),
            }),
            CriticLookup::TitleYear { title, .. } => {
                Err(AppError::EnrichmentNotFound(title.clone()))
            }
        }
    }

    fn name(&self) -> &'static str {
        "fake-critics"
    }
}
