use std::sync::LazyLock;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use regex::Regex;
use spider_client::shapes::request::{ReturnFormat, ReturnFormatHandling};
use spider_client::{RequestParams, Spider};
use tracing::{debug, warn};

use super::{markdown, Candidate, PageSource, RawListing, SourceError};

const MAX_RETRIES: u32 = 3;
const BASE_BACKOFF_MS: u64 = 2000;

static IMAGE_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"!\[[^\]]*\]\([^)]*\)").unwrap());
static BLANKS_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\n{3,}").unwrap());

/// Pages rendered to markdown by spider.cloud.
pub struct SpiderSource {
    spider: Spider,
    base_url: String,
}

impl SpiderSource {
    pub fn new(api_key: String, base_url: &str) -> Result<Self, SourceError> {
        let spider = Spider::new(Some(api_key))
            .map_err(|e| SourceError::Unavailable(format!("failed to create Spider client: {}", e)))?;
        Ok(SpiderSource {
            spider,
            base_url: base_url.to_string(),
        })
    }

    async fn scrape_with_retry(&self, url: &str) -> Result<String, SourceError> {
        let mut attempt = 0;
        loop {
            match self.scrape_markdown(url).await {
                Ok(md) => return Ok(md),
                Err(SourceError::Fetch { message, .. })
                    if is_retryable(&message) && attempt < MAX_RETRIES =>
                {
                    let backoff = Duration::from_millis(BASE_BACKOFF_MS * 2u64.pow(attempt));
                    warn!(
                        "Rate limited on {} (attempt {}/{}), backing off {:.1}s",
                        url,
                        attempt + 1,
                        MAX_RETRIES,
                        backoff.as_secs_f64()
                    );
                    tokio::time::sleep(backoff).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn scrape_markdown(&self, url: &str) -> Result<String, SourceError> {
        let params = RequestParams {
            return_format: Some(ReturnFormatHandling::Single(ReturnFormat::Markdown)),
            ..Default::default()
        };

        let start = Instant::now();
        let response = self
            .spider
            .scrape_url(url, Some(params), "application/json")
            .await
            .map_err(|e| SourceError::Fetch {
                url: url.to_string(),
                message: e.to_string(),
            })?;
        debug!(url, latency_ms = start.elapsed().as_millis() as u64, "Page scraped");

        let parsed: serde_json::Value = match response.as_str() {
            Some(s) => serde_json::from_str(s).unwrap_or(response.clone()),
            None => response,
        };
        let first = parsed.as_array().and_then(|arr| arr.first());

        if let Some(status) = first.and_then(|o| o.get("status")).and_then(|s| s.as_i64()) {
            if status >= 400 {
                return Err(SourceError::Fetch {
                    url: url.to_string(),
                    message: format!("upstream status {}", status),
                });
            }
        }

        first
            .and_then(|obj| obj.get("content"))
            .and_then(|c| c.as_str())
            .map(strip_images)
            .filter(|md| !md.trim().is_empty())
            .ok_or_else(|| SourceError::Empty(url.to_string()))
    }
}

#[async_trait]
impl PageSource for SpiderSource {
    async fn discover(&self, partition_url: &str) -> Result<Vec<Candidate>, SourceError> {
        let md = self.scrape_with_retry(partition_url).await?;
        Ok(markdown::discover_links(&md, &self.base_url))
    }

    async fn fetch_listing(&self, candidate: &Candidate) -> Result<RawListing, SourceError> {
        let md = self.scrape_with_retry(&candidate.detail_locator).await?;
        Ok(markdown::parse_listing(&md))
    }
}

fn is_retryable(message: &str) -> bool {
    let m = message.to_ascii_lowercase();
    ["429", "rate", "500", "502", "503"].iter().any(|sig| m.contains(sig))
}

/// Remove markdown image syntax: ![alt](url)
fn strip_images(md: &str) -> String {
    let cleaned = IMAGE_RE.replace_all(md, "");
    BLANKS_RE.replace_all(&cleaned, "\n\n").to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn images_are_removed() {
        let md = "Intro\n![photo](https://cdn.test/a.jpg)\n\n\n\nBody";
        assert_eq!(strip_images(md), "Intro\n\nBody");
    }

    #[test]
    fn retry_signatures() {
        assert!(is_retryable("upstream status 503"));
        assert!(is_retryable("HTTP 429 Too Many Requests"));
        assert!(!is_retryable("upstream status 404"));
    }
}
