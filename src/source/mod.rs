pub mod markdown;
pub mod spider;

use std::collections::HashSet;
use std::sync::LazyLock;

use async_trait::async_trait;
use regex::Regex;

static PLACE_ID_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"/place/(\d+)").unwrap());

/// A detail page found during discovery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
    pub external_id: String,
    pub detail_locator: String,
}

impl Candidate {
    /// The external id is the numeric place id when the path has one
    /// (`/place/101424-praia-do-amado` → `101424`), otherwise the last
    /// non-empty path segment.
    pub fn from_locator(locator: &str) -> Option<Self> {
        let locator = locator.trim();
        let path = locator
            .split(['?', '#'])
            .next()
            .unwrap_or(locator);
        let id = match PLACE_ID_RE.captures(path) {
            Some(caps) => caps.get(1)?.as_str(),
            None => path.rsplit('/').find(|s| !s.is_empty())?,
        };
        if id.contains(':') {
            return None;
        }
        Some(Candidate {
            external_id: id.to_string(),
            detail_locator: locator.to_string(),
        })
    }
}

/// Drop repeated external ids, keeping the first occurrence.
pub fn dedup_candidates(candidates: Vec<Candidate>) -> Vec<Candidate> {
    let mut seen = HashSet::new();
    candidates
        .into_iter()
        .filter(|c| seen.insert(c.external_id.clone()))
        .collect()
}

/// Raw strings pulled off a detail page, before any parsing.
#[derive(Debug, Clone, Default)]
pub struct RawListing {
    pub title: Option<String>,
    pub feedback_count: Option<String>,
    pub rating: Option<String>,
    pub coordinates_link: Option<String>,
    pub location_type: Option<String>,
    pub places_count: Option<String>,
    pub parking_cost: Option<String>,
    pub reviews: Vec<RawReview>,
}

#[derive(Debug, Clone, Default)]
pub struct RawReview {
    pub date: Option<String>,
    pub body: Option<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum SourceError {
    #[error("fetch failed for {url}: {message}")]
    Fetch { url: String, message: String },
    #[error("no content returned for {0}")]
    Empty(String),
    #[error("page source unavailable: {0}")]
    Unavailable(String),
}

/// Page fetch + field extraction capability.
#[async_trait]
pub trait PageSource: Send + Sync {
    /// Candidates listed on one partition (search/list) page.
    async fn discover(&self, partition_url: &str) -> Result<Vec<Candidate>, SourceError>;

    async fn fetch_listing(&self, candidate: &Candidate) -> Result<RawListing, SourceError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn candidate_id_from_locator() {
        let c = Candidate::from_locator("https://park4night.com/en/place/12345").unwrap();
        assert_eq!(c.external_id, "12345");

        let c = Candidate::from_locator("https://park4night.com/en/place/77/?ref=search#top").unwrap();
        assert_eq!(c.external_id, "77");
        assert_eq!(c.detail_locator, "https://park4night.com/en/place/77/?ref=search#top");

        let c = Candidate::from_locator("https://park4night.com/en/place/101424-praia-do-amado?ref=map").unwrap();
        assert_eq!(c.external_id, "101424");
        assert_eq!(c.detail_locator, "https://park4night.com/en/place/101424-praia-do-amado?ref=map");

        let c = Candidate::from_locator("https://a.test/spots/beach-north/").unwrap();
        assert_eq!(c.external_id, "beach-north");

        assert!(Candidate::from_locator("https://").is_none());
        assert!(Candidate::from_locator("").is_none());
    }

    #[test]
    fn dedup_keeps_first() {
        let list = vec![
            Candidate::from_locator("https://a.test/place/1").unwrap(),
            Candidate::from_locator("https://a.test/place/2").unwrap(),
            Candidate::from_locator("https://b.test/place/1?x=y").unwrap(),
        ];
        let deduped = dedup_candidates(list);
        assert_eq!(deduped.len(), 2);
        assert_eq!(deduped[0].detail_locator, "https://a.test/place/1");
    }
}
