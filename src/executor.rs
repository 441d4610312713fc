use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use indicatif::{ProgressBar, ProgressStyle};
use serde_json::json;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinSet;
use tracing::{info, warn};

use crate::db::ListingRecord;
use crate::enrich::EnrichmentClient;
use crate::events::{EventLog, EventType};
use crate::facts::{ExtractionError, RawFacts};
use crate::source::{Candidate, PageSource};

#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    pub concurrency: usize,
    pub min_reviews: u32,
    pub review_window: Duration,
    /// Stop scheduling once this many records are stored (sample mode).
    pub success_limit: Option<usize>,
    pub show_progress: bool,
}

#[derive(Debug)]
enum ItemOutcome {
    Stored(ListingRecord),
    LowSignal { url: String, reviews: u32 },
    Failed { url: String, error: String },
}

/// A batch of records in completion order plus what was dropped on the way.
#[derive(Debug, Default)]
pub struct ExtractionReport {
    pub records: Vec<ListingRecord>,
    pub low_signal: usize,
    pub errors: usize,
    pub not_scheduled: usize,
}

pub struct ExtractionExecutor {
    source: Arc<dyn PageSource>,
    enricher: Arc<EnrichmentClient>,
    events: Arc<EventLog>,
    config: ExecutorConfig,
}

impl ExtractionExecutor {
    pub fn new(
        source: Arc<dyn PageSource>,
        enricher: Arc<EnrichmentClient>,
        events: Arc<EventLog>,
        config: ExecutorConfig,
    ) -> Self {
        ExtractionExecutor {
            source,
            enricher,
            events,
            config,
        }
    }

    /// Extract, gate, and enrich every candidate with at most `concurrency`
    /// items in flight. One item failing never affects the others.
    pub async fn run(&self, candidates: Vec<Candidate>, now: DateTime<Utc>) -> ExtractionReport {
        let total = candidates.len();
        let width = self.config.concurrency.max(1);
        let semaphore = Arc::new(Semaphore::new(width));
        let stored = Arc::new(AtomicUsize::new(0));

        let pb = if self.config.show_progress {
            ProgressBar::new(total as u64)
        } else {
            ProgressBar::hidden()
        };
        if let Ok(style) = ProgressStyle::default_bar()
            .template("[{elapsed_precise}] {bar:40} {pos}/{len} ({per_sec}, eta {eta})")
        {
            pb.set_style(style.progress_chars("=> "));
        }

        let (tx, mut rx) = mpsc::channel::<ItemOutcome>(width * 2);
        let mut report = ExtractionReport::default();
        let mut tasks = JoinSet::new();

        for (i, candidate) in candidates.into_iter().enumerate() {
            let Ok(permit) = Arc::clone(&semaphore).acquire_owned().await else {
                break;
            };
            if let Some(limit) = self.config.success_limit {
                if stored.load(Ordering::SeqCst) >= limit {
                    report.not_scheduled = total - i;
                    info!("Sample limit of {} reached, {} candidates left unscheduled", limit, total - i);
                    break;
                }
            }

            let source = Arc::clone(&self.source);
            let enricher = Arc::clone(&self.enricher);
            let events = Arc::clone(&self.events);
            let stored = Arc::clone(&stored);
            let tx = tx.clone();
            let min_reviews = self.config.min_reviews;
            let window = self.config.review_window;

            tasks.spawn(async move {
                let outcome = process_item(
                    source.as_ref(),
                    &enricher,
                    &events,
                    candidate,
                    now,
                    window,
                    min_reviews,
                )
                .await;
                if matches!(outcome, ItemOutcome::Stored(_)) {
                    stored.fetch_add(1, Ordering::SeqCst);
                }
                drop(permit);
                let _ = tx.send(outcome).await;
            });
        }

        // rx closes once every spawned task has sent its outcome
        drop(tx);

        while let Some(outcome) = rx.recv().await {
            match outcome {
                ItemOutcome::Stored(record) => report.records.push(record),
                ItemOutcome::LowSignal { url, reviews } => {
                    info!("Skipping {} ({} reviews)", url, reviews);
                    report.low_signal += 1;
                }
                ItemOutcome::Failed { url, error } => {
                    warn!("Extraction failed for {}: {}", url, error);
                    report.errors += 1;
                }
            }
            pb.inc(1);
        }

        // A task that died before sending has no outcome on the channel.
        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                warn!("Extraction task died: {}", e);
                self.events.log(EventType::ExtractionError, json!({ "error": e.to_string() }));
                report.errors += 1;
                pb.inc(1);
            }
        }

        pb.finish_and_clear();
        report
    }
}

/// Fetch the page and build its fact set. Any error leaves nothing behind.
pub async fn extract(
    source: &dyn PageSource,
    candidate: &Candidate,
    now: DateTime<Utc>,
    review_window: Duration,
) -> Result<RawFacts, ExtractionError> {
    let raw = source.fetch_listing(candidate).await?;
    RawFacts::from_raw(candidate, raw, now, review_window)
}

async fn process_item(
    source: &dyn PageSource,
    enricher: &EnrichmentClient,
    events: &EventLog,
    candidate: Candidate,
    now: DateTime<Utc>,
    review_window: Duration,
    min_reviews: u32,
) -> ItemOutcome {
    let url = candidate.detail_locator.clone();
    events.log(
        EventType::ItemStart,
        json!({ "url": url, "external_id": candidate.external_id }),
    );

    let facts = match extract(source, &candidate, now, review_window).await {
        Ok(facts) => facts,
        Err(e) => {
            events.log(EventType::ExtractionError, json!({ "url": url, "error": e.to_string() }));
            return ItemOutcome::Failed {
                url,
                error: e.to_string(),
            };
        }
    };

    if facts.feedback_count < min_reviews {
        events.log(
            EventType::ItemSkipLowSignal,
            json!({ "url": url, "reviews": facts.feedback_count, "min_reviews": min_reviews }),
        );
        return ItemOutcome::LowSignal {
            url,
            reviews: facts.feedback_count,
        };
    }

    let enrichment = enricher.enrich(&facts).await;
    let record = facts.into_record(enrichment, now);
    events.log(
        EventType::RowStored,
        json!({ "url": url, "external_id": record.external_id, "title": record.title }),
    );
    ItemOutcome::Stored(record)
}

#[cfg(test)]
pub(crate) mod testing {
    use std::collections::{HashMap, HashSet};
    use std::sync::Mutex;

    use async_trait::async_trait;

    use crate::source::{RawListing, SourceError};

    use super::*;

    /// In-memory site: search pages map to candidate lists, listings map to
    /// their review count. Unknown listings fail to fetch; listings in
    /// `crashing` panic mid-fetch.
    #[derive(Default)]
    pub struct FakeSource {
        pub search: HashMap<String, Vec<String>>,
        pub listings: HashMap<String, u32>,
        pub crashing: HashSet<String>,
        pub discover_calls: AtomicUsize,
        pub fetched: Mutex<Vec<String>>,
    }

    impl FakeSource {
        pub fn with_listing(mut self, id: &str, reviews: u32) -> Self {
            self.listings.insert(id.to_string(), reviews);
            self
        }

        pub fn with_crash(mut self, id: &str) -> Self {
            self.crashing.insert(id.to_string());
            self
        }

        pub fn with_search(mut self, url: &str, ids: &[&str]) -> Self {
            self.search.insert(
                url.to_string(),
                ids.iter().map(|id| format!("https://park4night.com/en/place/{}", id)).collect(),
            );
            self
        }

        pub fn fetch_count(&self) -> usize {
            self.fetched.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl PageSource for FakeSource {
        async fn discover(&self, partition_url: &str) -> Result<Vec<Candidate>, SourceError> {
            self.discover_calls.fetch_add(1, Ordering::SeqCst);
            self.search
                .get(partition_url)
                .map(|links| links.iter().filter_map(|l| Candidate::from_locator(l)).collect())
                .ok_or_else(|| SourceError::Fetch {
                    url: partition_url.to_string(),
                    message: "upstream status 404".into(),
                })
        }

        async fn fetch_listing(&self, candidate: &Candidate) -> Result<RawListing, SourceError> {
            self.fetched.lock().unwrap().push(candidate.external_id.clone());
            if self.crashing.contains(&candidate.external_id) {
                panic!("parser blew up on {}", candidate.detail_locator);
            }
            let reviews = self
                .listings
                .get(&candidate.external_id)
                .ok_or_else(|| SourceError::Empty(candidate.detail_locator.clone()))?;
            Ok(RawListing {
                title: Some(format!("Place {}", candidate.external_id)),
                feedback_count: Some(format!("{} reviews", reviews)),
                rating: Some("4.2/5".into()),
                ..Default::default()
            })
        }
    }

    pub fn candidate(id: &str) -> Candidate {
        Candidate::from_locator(&format!("https://park4night.com/en/place/{}", id)).unwrap()
    }
}
