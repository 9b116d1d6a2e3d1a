use serde::Deserialize;

use super::CriticScores;
use crate::error::{AppError, AppResult};

// ============================================================================
// OMDb API Types
// ============================================================================

#[derive(Debug, Deserialize)]
struct OmdbRating {
    #[serde(rename = "Source")]
    source: String,
    #[serde(rename = "Value")]
    value: String,
}

/// Raw `/?i=` or `/?t=&y=` response
#[derive(Debug, Deserialize)]
struct OmdbResponse {
    #[serde(rename = "Response")]
    response: Option<String>,
    #[serde(rename = "Error")]
    error: Option<String>,
    #[serde(rename = "Ratings", default)]
    ratings: Vec<OmdbRating>,
    #[serde(rename = "Metascore")]
    metascore: Option<String>,
    #[serde(rename = "imdbRating")]
    imdb_rating: Option<String>,
}

/// "87%" → 87
fn parse_percentage(value: &str) -> Option<u8> {
    value.trim().trim_end_matches('%').parse::<u8>().ok().filter(|v| *v <= 100)
}

/// "74/100" or "74" → 74
fn parse_hundred(value: &str) -> Option<u8> {
    value
        .trim()
        .split('/')
        .next()
        .and_then(|v| v.trim().parse::<u8>().ok())
        .filter(|v| *v <= 100)
}

/// "8.1/10" or "8.1" → 8.1
fn parse_ten(value: &str) -> Option<f64> {
    value
        .trim()
        .split('/')
        .next()
        .and_then(|v| v.trim().parse::<f64>().ok())
        .filter(|v| (0.0..=10.0).contains(v))
}

/// Whether an OMDb error message means the key's quota is used up
pub fn is_rate_limit_message(message: &str) -> bool {
    message.to_lowercase().contains("limit")
}

/// Parse an OMDb body into critic scores.
///
/// `"Response": "False"` becomes `EnrichmentNotFound`, or
/// `UpstreamRateLimited` when the message is about request limits.
pub fn parse_critic_scores(lookup_label: &str, body: &str) -> AppResult<CriticScores> {
    let response: OmdbResponse = serde_json::from_str(body)?;

    if response.response.as_deref() != Some("True") {
        let message = response
            .error
            .unwrap_or_else(|| "no result".to_string());
        if is_rate_limit_message(&message) {
            return Err(AppError::UpstreamRateLimited {
                retry_after_secs: None,
            });
        }
        return Err(AppError::EnrichmentNotFound(format!(
            "{}: {}",
            lookup_label, message
        )));
    }

    let mut scores = CriticScores::default();
    for rating in &response.ratings {
        match rating.source.as_str() {
            "Rotten Tomatoes" => scores.rotten_tomatoes = parse_percentage(&rating.value),
            "Metacritic" => scores.metacritic = parse_hundred(&rating.value),
            "Internet Movie Database" => scores.imdb = parse_ten(&rating.value),
            _ => {}
        }
    }
    if scores.metacritic.is_none() {
        scores.metacritic = response.metascore.as_deref().and_then(parse_hundred);
    }
    if scores.imdb.is_none() {
        scores.imdb = response.imdb_rating.as_deref().and_then(parse_ten);
    }

    if scores.is_empty() {
        return Err(AppError::EnrichmentNotFound(format!(
            "{}: no ratings published",
            lookup_label
        )));
    }

    Ok(scores)
}
