//! Field extraction from pages rendered to markdown.
//!
//! Every accessor is optional: a field that is not on the page comes back as
//! `None` and the fact builder decides the default.

use std::sync::LazyLock;

use regex::Regex;

use super::{dedup_candidates, Candidate, RawListing, RawReview};

static LINK_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\[([^\]]*)\]\(([^)\s]+)[^)]*\)").unwrap());
static PLACE_PATH_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(?:https?://[^/]+)?/(?:[a-z]{2}/)?place/\d+").unwrap());
static TITLE_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^#\s+(.+)$").unwrap());
static FEEDBACK_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\b(\d[\d,.]*)\s*(?:reviews?|comments?|feedbacks?)\b").unwrap());
static RATING_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(\d+(?:[.,]\d+)?)\s*/\s*5\b").unwrap());
static REVIEW_DATE_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^(\d{2}/\d{2}/\d{4})\s*(.*)$").unwrap());
static TYPE_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?i)^type\s*:\s*(.+)$").unwrap());

/// Detail-page candidates linked from a search or list page.
pub fn discover_links(markdown: &str, base_url: &str) -> Vec<Candidate> {
    let base = base_url.trim_end_matches('/');
    let found = LINK_RE
        .captures_iter(markdown)
        .filter_map(|caps| {
            let url = caps.get(2)?.as_str();
            if !PLACE_PATH_RE.is_match(url) {
                return None;
            }
            let absolute = if url.starts_with('/') {
                format!("{}{}", base, url)
            } else {
                url.to_string()
            };
            Candidate::from_locator(&absolute)
        })
        .collect();
    dedup_candidates(found)
}

pub fn parse_listing(markdown: &str) -> RawListing {
    let lines: Vec<&str> = markdown.lines().map(str::trim).collect();

    RawListing {
        title: lines
            .iter()
            .find_map(|l| TITLE_RE.captures(l).map(|c| strip_links(&c[1])))
            .filter(|t| !t.is_empty()),
        feedback_count: FEEDBACK_RE.find(markdown).map(|m| m.as_str().to_string()),
        rating: RATING_RE.find(markdown).map(|m| m.as_str().to_string()),
        coordinates_link: LINK_RE.captures_iter(markdown).find_map(|c| {
            let url = c.get(2)?.as_str();
            (url.contains("lat=") && url.contains("lng=")).then(|| url.to_string())
        }),
        location_type: lines
            .iter()
            .find_map(|l| TYPE_RE.captures(&clean_line(l)).map(|c| c[1].trim().to_string())),
        places_count: labeled_value(&lines, "Number of places"),
        parking_cost: labeled_value(&lines, "Parking cost"),
        reviews: collect_reviews(&lines),
    }
}

/// Value next to a label: `Label: value`, `| Label | value |`, or the label
/// alone on a line with the value on the next non-empty line.
fn labeled_value(lines: &[&str], label: &str) -> Option<String> {
    let label_lc = label.to_ascii_lowercase();
    for (i, line) in lines.iter().enumerate() {
        let cleaned = clean_line(line);
        if !cleaned.to_ascii_lowercase().starts_with(&label_lc) {
            continue;
        }
        let rest = cleaned[label.len()..].trim_start_matches([':', ' ']).trim();
        if !rest.is_empty() {
            return Some(rest.to_string());
        }
        return lines[i + 1..]
            .iter()
            .map(|l| clean_line(l))
            .find(|l| !l.is_empty());
    }
    None
}

fn collect_reviews(lines: &[&str]) -> Vec<RawReview> {
    let mut reviews = Vec::new();
    for (i, line) in lines.iter().enumerate() {
        let Some(caps) = REVIEW_DATE_RE.captures(line) else {
            continue;
        };
        let inline = caps[2].trim();
        let body = if inline.is_empty() {
            lines[i + 1..]
                .iter()
                .take_while(|l| !REVIEW_DATE_RE.is_match(l))
                .find(|l| !l.is_empty())
                .map(|l| l.to_string())
        } else {
            Some(inline.to_string())
        };
        reviews.push(RawReview {
            date: Some(caps[1].to_string()),
            body,
        });
    }
    reviews
}

fn clean_line(line: &str) -> String {
    line.replace(['|', '*'], " ").trim().to_string()
}

fn strip_links(text: &str) -> String {
    LINK_RE.replace_all(text, "$1").trim().to_string()
}
