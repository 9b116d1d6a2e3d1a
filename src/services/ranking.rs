use chrono::{NaiveDate, Utc};
use std::collections::HashMap;

use crate::models::CatalogItem;

/// Quality bars tried in order, strictest first: (min rating, min votes)
pub const QUALITY_THRESHOLDS: [(f64, u32); 3] = [(7.0, 50), (6.5, 25), (6.0, 10)];

/// Rating that low-vote items regress toward, on the 0–1 scale
pub const NEUTRAL_PRIOR: f64 = 0.6;

/// Votes at which a rating is taken at face value
pub const CONFIDENCE_VOTES: f64 = 150.0;

const RATING_WEIGHT: f64 = 0.3;
const VOLUME_WEIGHT: f64 = 0.5;
const RECENCY_WEIGHT: f64 = 0.2;

/// Whether `item` clears the given bar
pub fn meets_threshold(item: &CatalogItem, (min_rating, min_votes): (f64, u32)) -> bool {
    match (item.rating, item.vote_count) {
        (Some(rating), Some(votes)) => rating >= min_rating && votes >= min_votes,
        _ => false,
    }
}

/// Number of items that clear the strictest quality bar
pub fn count_quality(items: &[CatalogItem]) -> usize {
    items
        .iter()
        .filter(|item| meets_threshold(item, QUALITY_THRESHOLDS[0]))
        .count()
}

/// Pick candidates using successively looser quality bars
///
/// Stops at the first bar that yields at least `min_count` items. If none
/// does, every item with both a rating and a vote count is returned.
pub fn select_candidates(items: &[CatalogItem], min_count: usize) -> Vec<CatalogItem> {
    for threshold in QUALITY_THRESHOLDS {
        let selected: Vec<CatalogItem> = items
            .iter()
            .filter(|item| meets_threshold(item, threshold))
            .cloned()
            .collect();
        if selected.len() >= min_count {
            tracing::debug!(
                min_rating = threshold.0,
                min_votes = threshold.1,
                selected = selected.len(),
                "Quality threshold satisfied"
            );
            return selected;
        }
    }

    items
        .iter()
        .filter(|item| item.rating.is_some() && item.vote_count.is_some())
        .cloned()
        .collect()
}

/// Rating on a 0–1 scale, pulled toward the neutral prior when votes are few
pub fn confidence_adjusted_rating(rating: f64, votes: u32) -> f64 {
    let normalized = (rating / 10.0).clamp(0.0, 1.0);
    let weight = (votes as f64 / CONFIDENCE_VOTES).min(1.0);
    weight * normalized + (1.0 - weight) * NEUTRAL_PRIOR
}

/// `log10(votes + 1) / log10(max_votes + 1)`, 0 when the set has no votes
pub fn normalized_vote_volume(votes: u32, max_votes: u32) -> f64 {
    if max_votes == 0 {
        return 0.0;
    }
    ((votes as f64 + 1.0).log10() / (max_votes as f64 + 1.0).log10()).clamp(0.0, 1.0)
}

/// 1.0 for today or future releases, linearly down to 0.0 at one year old.
/// Unknown release dates score a flat 0.5.
pub fn recency(release_date: Option<NaiveDate>, today: NaiveDate) -> f64 {
    match release_date {
        None => 0.5,
        Some(date) => {
            let age_days = (today - date).num_days();
            if age_days <= 0 {
                1.0
            } else {
                (1.0 - age_days as f64 / 365.0).max(0.0)
            }
        }
    }
}

/// Composite ranking score for one item within a set whose largest vote count is `max_votes`
pub fn composite_score(item: &CatalogItem, max_votes: u32, today: NaiveDate) -> f64 {
    let votes = item.vote_count.unwrap_or(0);
    let rating = match item.rating {
        Some(rating) => confidence_adjusted_rating(rating, votes),
        None => NEUTRAL_PRIOR,
    };
    let volume = normalized_vote_volume(votes, max_votes);

    RATING_WEIGHT * rating
        + VOLUME_WEIGHT * volume.sqrt()
        + RECENCY_WEIGHT * recency(item.release_date, today)
}

/// Order items by descending composite score, as of today
pub fn rank(items: Vec<CatalogItem>) -> Vec<CatalogItem> {
    rank_at(items, Utc::now().date_naive())
}

/// Order items by descending composite score. Equal scores keep their input order.
pub fn rank_at(items: Vec<CatalogItem>, today: NaiveDate) -> Vec<CatalogItem> {
    let max_votes = items
        .iter()
        .filter_map(|item| item.vote_count)
        .max()
        .unwrap_or(0);

    let mut scored: Vec<(f64, CatalogItem)> = items
        .into_iter()
        .map(|item| (composite_score(&item, max_votes, today), item))
        .collect();

    // Vec::sort_by is stable
    scored.sort_by(|(a, _), (b, _)| b.total_cmp(a));
    scored.into_iter().map(|(_, item)| item).collect()
}

/// Collapse duplicate ids, keeping the most complete record
///
/// Output order follows each id's first appearance. On a completeness tie the
/// earlier record wins, so merging is idempotent.
pub fn merge_by_id(items: Vec<CatalogItem>) -> Vec<CatalogItem> {
    let mut positions: HashMap<u64, usize> = HashMap::with_capacity(items.len());
    let mut merged: Vec<CatalogItem> = Vec::with_capacity(items.len());

    for item in items {
        match positions.get(&item.id) {
            Some(&index) => {
                if item.completeness_score() > merged[index].completeness_score() {
                    merged[index] = item;
                }
            }
            None => {
                positions.insert(item.id, merged.len());
                merged.push(item);
            }
        }
    }

    merged
}
