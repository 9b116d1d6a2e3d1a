/// OMDb critic score provider
///
/// Looked up by IMDb id when known (`?i=tt...`), otherwise by title and year
/// (`?t=...&y=...`). Only positive answers are cached; "not found" and quota
/// errors are returned without touching the cache.
use crate::{
    cached,
    config::CacheSettings,
    db::{Collection, KeyPart, TieredCache},
    error::{AppError, AppResult},
    models::{enrichment::normalize_title, omdb::parse_critic_scores, CriticLookup, CriticScores},
    services::providers::{fetch_entry, CriticScoreProvider},
};
use reqwest::Client as HttpClient;
use std::sync::Arc;

const PROVIDER: &str = "omdb";

#[derive(Clone)]
pub struct OmdbProvider {
    http_client: HttpClient,
    api_key: String,
    api_url: String,
    cache: Arc<TieredCache>,
    ttl_secs: u64,
}

impl OmdbProvider {
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
            ttl_secs: settings.enrichment_ttl_secs,
        }
    }

    fn lookup_params(&self, lookup: &CriticLookup) -> Vec<(String, String)> {
        let mut params = vec![("apikey".to_string(), self.api_key.clone())];
        match lookup {
            CriticLookup::ExternalId(imdb_id) => {
                params.push(("i".to_string(), imdb_id.clone()));
            }
            CriticLookup::TitleYear { title, year } => {
                params.push(("t".to_string(), title.clone()));
                params.push(("type".to_string(), "movie".to_string()));
                if let Some(year) = year {
                    params.push(("y".to_string(), year.to_string()));
                }
            }
        }
        params
    }

    fn lookup_key(lookup: &CriticLookup) -> Vec<KeyPart> {
        match lookup {
            CriticLookup::ExternalId(imdb_id) => {
                vec!["critic".into(), "imdb".into(), imdb_id.to_lowercase().into()]
            }
            CriticLookup::TitleYear { title, year } => vec![
                "critic".into(),
                "title".into(),
                normalize_title(title).into(),
                i64::from(year.unwrap_or(0)).into(),
            ],
        }
    }

    fn lookup_label(lookup: &CriticLookup) -> String {
        match lookup {
            CriticLookup::ExternalId(imdb_id) => imdb_id.clone(),
            CriticLookup::TitleYear { title, year: Some(year) } => format!("{} ({})", title, year),
            CriticLookup::TitleYear { title, year: None } => title.clone(),
        }
    }
}

#[async_trait::async_trait]
impl CriticScoreProvider for OmdbProvider {
    async fn fetch_scores(&self, lookup: &CriticLookup) -> AppResult<CriticScores> {
        let params = self.lookup_params(lookup);
        let label = Self::lookup_label(lookup);
        let url = format!("{}/", self.api_url);

        let entry = cached!(
            self.cache,
            Collection::Enrichment,
            Self::lookup_key(lookup),
            self.ttl_secs,
            async {
                let entry = fetch_entry(&self.http_client, PROVIDER, &url, &params).await?;
                // OMDb reports quota and not-found errors in the body, often with a 401
                parse_critic_scores(&label, &entry.body)?;
                Ok::<_, AppError>(entry)
            }
        )?;

        let scores = parse_critic_scores(&label, &entry.body)?;

        tracing::info!(
            lookup = %label,
            rotten_tomatoes = ?scores.rotten_tomatoes,
            metacritic = ?scores.metacritic,
            provider = PROVIDER,
            "Critic scores fetched"
        );

        Ok(scores)
    }

    fn name(&self) -> &'static str {
        PROVIDER
    }
}
