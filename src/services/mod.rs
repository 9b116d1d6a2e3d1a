pub mod catalog;
pub mod cursor;
pub mod discovery;
pub mod enrichment;
pub mod feed;
pub mod providers;
pub mod ranking;

pub use catalog::{CatalogSnapshot, CatalogStore, SearchResults};
pub use cursor::CursorStore;
pub use discovery::{DiscoveryEngine, DiscoveryOutcome, StopReason};
pub use enrichment::EnrichmentQueue;
pub use feed::{EngineSettings, FeedEngine, FeedPage, FeedRequest};
pub use providers::{CatalogProvider, CriticScoreProvider, OmdbProvider, TmdbProvider};
