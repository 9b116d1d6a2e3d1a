pub mod catalog;
pub mod discovery;
pub mod enrichment;
pub mod omdb;
pub mod tmdb;

pub use catalog::{CatalogItem, CriticScores, ItemDetails};
pub use discovery::{CatalogPage, DiscoveryCursorState, DiscoveryQuery};
pub use enrichment::{CriticLookup, CriticScoreState, EnrichmentKey};
