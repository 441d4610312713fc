use std::collections::BTreeMap;
use std::sync::LazyLock;

use chrono::{DateTime, Duration, NaiveDate, Utc};
use regex::Regex;
use serde::Serialize;

use crate::db::ListingRecord;
use crate::enrich::schema::{format_label_counts, EnrichmentResult};
use crate::source::{Candidate, RawListing, RawReview};

static COUNT_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\d[\d,.]*").unwrap());
static DECIMAL_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\d+(?:[.,]\d+)?").unwrap());
static COORDS_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"lat=([-+]?\d*\.?\d+)&lng=([-+]?\d*\.?\d+)").unwrap());

pub const UNKNOWN_TYPE: &str = "Unknown";
pub const NOT_AVAILABLE: &str = "N/A";

#[derive(Debug, thiserror::Error)]
pub enum ExtractionError {
    #[error(transparent)]
    Source(#[from] crate::source::SourceError),
    #[error("required field `{0}` missing from page")]
    MissingField(&'static str),
}

/// Parsed view of one detail page. Every field except the title has a
/// typed default, so one bad element never sinks the record.
#[derive(Debug, Clone)]
pub struct RawFacts {
    pub external_id: String,
    pub url: String,
    pub title: String,
    pub feedback_count: u32,
    pub avg_rating: f64,
    pub latitude: f64,
    pub longitude: f64,
    pub location_type: String,
    pub places_count: u32,
    pub parking_cost: String,
    pub recent_reviews: Vec<String>,
    pub seasonality: BTreeMap<String, u32>,
}

/// What the model sees for one listing.
#[derive(Debug, Serialize)]
pub struct EnrichmentPayload<'a> {
    pub places_count: u32,
    pub parking_cost: &'a str,
    pub all_reviews: &'a [String],
}

impl RawFacts {
    pub fn from_raw(
        candidate: &Candidate,
        raw: RawListing,
        now: DateTime<Utc>,
        review_window: Duration,
    ) -> Result<Self, ExtractionError> {
        let title = raw
            .title
            .as_deref()
            .and_then(|t| t.lines().next())
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .ok_or(ExtractionError::MissingField("title"))?
            .to_string();

        let (latitude, longitude) = parse_coordinates(raw.coordinates_link.as_deref()).unwrap_or((0.0, 0.0));
        let cutoff = (now - review_window).date_naive();
        let (recent_reviews, seasonality) = recent_reviews(&raw.reviews, cutoff);

        Ok(RawFacts {
            external_id: candidate.external_id.clone(),
            url: candidate.detail_locator.clone(),
            title,
            feedback_count: parse_count(raw.feedback_count.as_deref()).unwrap_or(0),
            avg_rating: parse_rating(raw.rating.as_deref()).unwrap_or(0.0),
            latitude,
            longitude,
            location_type: non_empty(raw.location_type.as_deref()).unwrap_or_else(|| UNKNOWN_TYPE.into()),
            places_count: parse_places(raw.places_count.as_deref()).unwrap_or(0),
            parking_cost: non_empty(raw.parking_cost.as_deref()).unwrap_or_else(|| NOT_AVAILABLE.into()),
            recent_reviews,
            seasonality,
        })
    }

    pub fn payload(&self) -> EnrichmentPayload<'_> {
        EnrichmentPayload {
            places_count: self.places_count,
            parking_cost: &self.parking_cost,
            all_reviews: &self.recent_reviews,
        }
    }

    /// The record is always built from a complete fact set; an empty
    /// enrichment only leaves the model-derived columns blank.
    pub fn into_record(self, ai: EnrichmentResult, fetched_at: DateTime<Utc>) -> ListingRecord {
        ListingRecord {
            review_seasonality: serde_json::to_string(&self.seasonality).unwrap_or_else(|_| "{}".into()),
            external_id: self.external_id,
            title: self.title,
            url: self.url,
            latitude: self.latitude,
            longitude: self.longitude,
            location_type: self.location_type,
            num_places: ai.num_places,
            total_reviews: self.feedback_count,
            avg_rating: self.avg_rating,
            parking_min_eur: ai.parking_min,
            parking_max_eur: ai.parking_max,
            electricity_eur: ai.electricity_eur,
            top_languages: format_label_counts(&ai.top_languages),
            ai_pros: format_label_counts(&ai.pros),
            ai_cons: format_label_counts(&ai.cons),
            last_fetched: Some(fetched_at),
        }
    }
}

// ── Field accessors ──

/// First number, grouping separators dropped, e.g. "(1,234 reviews)" → 1234.
pub fn parse_count(text: Option<&str>) -> Option<u32> {
    let digits: String = COUNT_RE
        .find(text?)?
        .as_str()
        .chars()
        .filter(char::is_ascii_digit)
        .collect();
    digits.parse().ok()
}

/// First decimal, comma or dot separated, e.g. "4,5/5" → 4.5.
pub fn parse_rating(text: Option<&str>) -> Option<f64> {
    DECIMAL_RE
        .find(text?)?
        .as_str()
        .replace(',', ".")
        .parse()
        .ok()
}

pub fn parse_coordinates(link: Option<&str>) -> Option<(f64, f64)> {
    let caps = COORDS_RE.captures(link?)?;
    let lat: f64 = caps[1].parse().ok()?;
    let lon: f64 = caps[2].parse().ok()?;
    ((-90.0..=90.0).contains(&lat) && (-180.0..=180.0).contains(&lon)).then_some((lat, lon))
}

/// Only an all-digit value counts; "approx. 20" is not a number of places.
pub fn parse_places(text: Option<&str>) -> Option<u32> {
    let t = text?.trim();
    if t.is_empty() || !t.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    t.parse().ok()
}

/// `dd/mm/yyyy` as printed on review cards.
pub fn parse_review_date(text: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(text.trim(), "%d/%m/%Y").ok()
}

fn non_empty(text: Option<&str>) -> Option<String> {
    text.map(str::trim).filter(|t| !t.is_empty()).map(str::to_string)
}

/// Reviews on or after `cutoff`, formatted `[YYYY-MM-DD]: text`, plus a
/// per-month (`YYYY-MM`) count. Cards with no date or body are skipped.
fn recent_reviews(reviews: &[RawReview], cutoff: NaiveDate) -> (Vec<String>, BTreeMap<String, u32>) {
    let mut formatted = Vec::new();
    let mut seasonality = BTreeMap::new();
    for review in reviews {
        let Some(date) = review.date.as_deref().and_then(parse_review_date) else {
            continue;
        };
        let Some(body) = non_empty(review.body.as_deref()) else {
            continue;
        };
        if date < cutoff {
            continue;
        }
        *seasonality.entry(date.format("%Y-%m").to_string()).or_insert(0) += 1;
        formatted.push(format!("[{}]: {}", date.format("%Y-%m-%d"), body));
    }
    (formatted, seasonality)
}
