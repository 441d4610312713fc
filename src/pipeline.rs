use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::json;
use tracing::{debug, info, warn};

use crate::cursor::{CursorError, PartitionCursor, PartitionState};
use crate::enrich::gemini::GeminiBackend;
use crate::enrich::prompt::{self, PromptError};
use crate::enrich::{EnrichmentClient, EnrichmentPolicy, EnrichmentStats};
use crate::events::{EventLog, EventType};
use crate::executor::{ExecutorConfig, ExtractionExecutor};
use crate::settings::{credential, MissingCredential, Settings, GEMINI_KEY_VAR, SPIDER_KEY_VAR};
use crate::source::spider::SpiderSource;
use crate::source::{dedup_candidates, Candidate, PageSource, SourceError};
use crate::staleness::is_stale;
use crate::store::{Dataset, MergeUpsertStore, SqliteDataset, StoreError, UpsertOutcome};

/// What a cycle crawls.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    /// The next `batch_size` partitions from the URL list.
    Queue { batch_size: usize },
    /// One search/list page, outside the rotation.
    SearchPage(String),
    /// One detail page, no discovery.
    Listing(String),
}

#[derive(Debug, Clone)]
pub struct RunOptions {
    pub target: Target,
    pub force: bool,
    pub sample: bool,
    pub now: DateTime<Utc>,
    pub show_progress: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    PartitionLoaded,
    Discovering,
    Filtering,
    Extracting,
    Merged,
    CursorAdvanced,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Phase::Idle => "idle",
            Phase::PartitionLoaded => "partition-loaded",
            Phase::Discovering => "discovering",
            Phase::Filtering => "filtering",
            Phase::Extracting => "extracting",
            Phase::Merged => "merged",
            Phase::CursorAdvanced => "cursor-advanced",
        };
        f.write_str(name)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error(transparent)]
    Config(#[from] CursorError),
    #[error(transparent)]
    Credential(#[from] MissingCredential),
    #[error(transparent)]
    Prompt(#[from] PromptError),
    #[error(transparent)]
    Source(#[from] SourceError),
    #[error("failed to open dataset: {0}")]
    Store(#[from] StoreError),
    #[error("not a listing URL: {0}")]
    InvalidTarget(String),
    #[error("{rows} extracted rows could not be saved: {source}")]
    Persistence {
        rows: usize,
        #[source]
        source: StoreError,
    },
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct RunSummary {
    pub partitions: Vec<String>,
    pub candidates: usize,
    pub processed: usize,
    pub discarded_fresh: usize,
    pub discarded_low_signal: usize,
    pub extraction_errors: usize,
    pub discovery_errors: usize,
    pub not_scheduled: usize,
    pub enrichment: EnrichmentStats,
    pub high_tier_model: String,
    pub low_tier_model: String,
    pub fallback_used: bool,
    pub cursor: Option<PartitionState>,
}

impl RunSummary {
    pub fn log(&self) {
        info!(
            "Cycle summary: {} processed, {} fresh skipped, {} low-signal skipped, {} extraction errors; {}",
            self.processed,
            self.discarded_fresh,
            self.discarded_low_signal,
            self.extraction_errors,
            self.enrichment_line(),
        );
    }

    /// Calls per tier, labeled with the configured model names.
    pub fn enrichment_line(&self) -> String {
        format!(
            "{} call(s) to {}, {} call(s) to {}, {} enrichment error(s)",
            self.enrichment.high_tier_calls,
            tier_label(&self.high_tier_model, "high tier"),
            self.enrichment.low_tier_calls,
            tier_label(&self.low_tier_model, "low tier"),
            self.enrichment.errors,
        )
    }

    fn to_event(&self) -> serde_json::Value {
        json!({
            "partitions": self.partitions,
            "candidates": self.candidates,
            "processed": self.processed,
            "discarded_fresh": self.discarded_fresh,
            "discarded_low_signal": self.discarded_low_signal,
            "extraction_errors": self.extraction_errors,
            "discovery_errors": self.discovery_errors,
            "not_scheduled": self.not_scheduled,
            "high_tier_calls": self.enrichment.high_tier_calls,
            "low_tier_calls": self.enrichment.low_tier_calls,
            "high_tier_model": self.high_tier_model,
            "low_tier_model": self.low_tier_model,
            "enrichment_errors": self.enrichment.errors,
            "fallback_used": self.fallback_used,
            "cursor": self.cursor.map(|c| c.cursor),
        })
    }
}

fn tier_label<'a>(model: &'a str, fallback: &'a str) -> &'a str {
    if model.trim().is_empty() {
        fallback
    } else {
        model
    }
}

/// One crawl cycle end to end: partition, discovery, staleness filter,
/// extraction with enrichment, merge, cursor advance.
pub struct Pipeline<D> {
    settings: Settings,
    cursor: PartitionCursor,
    source: Arc<dyn PageSource>,
    enricher: Arc<EnrichmentClient>,
    events: Arc<EventLog>,
    store: MergeUpsertStore<D>,
    phase: Phase,
}

impl Pipeline<SqliteDataset> {
    /// Wire the production adapters. Credentials and prompt files are checked
    /// here, before any page is fetched.
    pub fn from_settings(settings: Settings, sample: bool, events: Arc<EventLog>) -> Result<Self, PipelineError> {
        let gemini_key = credential(GEMINI_KEY_VAR)?;
        let spider_key = credential(SPIDER_KEY_VAR)?;
        let instruction = prompt::load_instruction(settings.prompt_path.as_deref(), &settings.taxonomy_path)?;

        let mut backend = GeminiBackend::new(&gemini_key);
        if let Some(url) = &settings.gemini_base_url {
            backend = backend.with_base_url(url);
        }
        let enricher = EnrichmentClient::new(
            Arc::new(backend),
            instruction,
            policy_from(&settings),
            Arc::clone(&events),
        );
        let source = SpiderSource::new(spider_key, &settings.site_base_url)?;
        let dataset = SqliteDataset::open(settings.dataset_for(sample))?;

        Ok(Pipeline::new(
            settings,
            Arc::new(source),
            Arc::new(enricher),
            events,
            MergeUpsertStore::open(dataset),
        ))
    }
}

pub fn policy_from(settings: &Settings) -> EnrichmentPolicy {
    EnrichmentPolicy {
        high_tier_model: settings.high_tier_model.clone(),
        low_tier_model: settings.low_tier_model.clone(),
        tier_threshold: settings.tier_threshold,
        max_attempts: settings.max_enrichment_attempts,
        delay: settings.ai_delay(),
    }
}

impl<D: Dataset> Pipeline<D> {
    pub fn new(
        settings: Settings,
        source: Arc<dyn PageSource>,
        enricher: Arc<EnrichmentClient>,
        events: Arc<EventLog>,
        store: MergeUpsertStore<D>,
    ) -> Self {
        let cursor = PartitionCursor::new(settings.url_list_path.clone(), settings.state_path.clone());
        Pipeline {
            settings,
            cursor,
            source,
            enricher,
            events,
            store,
            phase: Phase::Idle,
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    fn enter(&mut self, phase: Phase) {
        debug!(from = %self.phase, to = %phase, "Pipeline phase");
        self.phase = phase;
    }

    pub async fn run_cycle(&mut self, opts: &RunOptions) -> Result<RunSummary, PipelineError> {
        let result = self.run_inner(opts).await;
        self.enter(Phase::Idle);
        result
    }

    async fn run_inner(&mut self, opts: &RunOptions) -> Result<RunSummary, PipelineError> {
        let mut summary = RunSummary {
            high_tier_model: self.settings.high_tier_model.clone(),
            low_tier_model: self.settings.low_tier_model.clone(),
            ..RunSummary::default()
        };
        let stats_before = self.enricher.stats();

        // Resolve the target; configuration errors stop here.
        let (partition_urls, direct) = match &opts.target {
            Target::Queue { batch_size } => {
                let partition = self.cursor.next_partition(*batch_size)?;
                info!(
                    "Partition {}/{}: {} URL(s)",
                    partition.position + 1,
                    partition.total,
                    partition.urls.len()
                );
                (partition.urls, Vec::new())
            }
            Target::SearchPage(url) => (vec![url.clone()], Vec::new()),
            Target::Listing(url) => {
                let candidate =
                    Candidate::from_locator(url).ok_or_else(|| PipelineError::InvalidTarget(url.clone()))?;
                (Vec::new(), vec![candidate])
            }
        };
        self.enter(Phase::PartitionLoaded);
        summary.partitions = partition_urls.clone();
        self.events.log(
            EventType::CycleStart,
            json!({
                "partitions": partition_urls,
                "force": opts.force,
                "sample": opts.sample,
                "now": opts.now.to_rfc3339(),
            }),
        );

        self.enter(Phase::Discovering);
        let mut found = direct;
        for url in &partition_urls {
            match self.source.discover(url).await {
                Ok(candidates) => {
                    info!("Discovered {} listings on {}", candidates.len(), url);
                    found.extend(candidates);
                }
                Err(e) => {
                    warn!("Discovery failed for {}: {}", url, e);
                    summary.discovery_errors += 1;
                    self.events
                        .log(EventType::DiscoveryError, json!({ "url": url, "error": e.to_string() }));
                }
            }
        }
        let candidates = dedup_candidates(found);
        summary.candidates = candidates.len();

        self.enter(Phase::Filtering);
        let index = self.store.freshness_index();
        if index.is_empty() {
            info!("No stored listings yet, every candidate is stale");
        }
        let ttl = self.settings.ttl();
        let mut stale = Vec::with_capacity(candidates.len());
        for candidate in candidates {
            if is_stale(&candidate.external_id, &index, opts.now, ttl, opts.force) {
                stale.push(candidate);
            } else {
                summary.discarded_fresh += 1;
                self.events.log(
                    EventType::ItemSkipFresh,
                    json!({ "url": candidate.detail_locator, "external_id": candidate.external_id }),
                );
            }
        }
        info!("{} to extract, {} still fresh", stale.len(), summary.discarded_fresh);

        self.enter(Phase::Extracting);
        let executor = ExtractionExecutor::new(
            Arc::clone(&self.source),
            Arc::clone(&self.enricher),
            Arc::clone(&self.events),
            self.executor_config(opts),
        );
        let report = executor.run(stale, opts.now).await;
        summary.processed = report.records.len();
        summary.discarded_low_signal = report.low_signal;
        summary.extraction_errors = report.errors;
        summary.not_scheduled = report.not_scheduled;
        summary.enrichment = stats_delta(stats_before, self.enricher.stats());

        let rows = report.records.len();
        match self.store.upsert(report.records) {
            Ok(UpsertOutcome::Appended { rows, primary_error }) => {
                summary.fallback_used = true;
                self.events
                    .log(EventType::SaveError, json!({ "rows": rows, "error": primary_error }));
            }
            Ok(UpsertOutcome::Merged { rows }) => debug!(rows, "Dataset merged"),
            Ok(UpsertOutcome::Nothing) => {}
            Err(e) => {
                self.events
                    .log(EventType::SaveFallbackError, json!({ "rows": rows, "error": e.to_string() }));
                summary.log();
                self.events.log(EventType::CycleSummary, summary.to_event());
                return Err(PipelineError::Persistence { rows, source: e });
            }
        }
        self.enter(Phase::Merged);

        if let (Target::Queue { batch_size }, false) = (&opts.target, opts.sample) {
            match self.cursor.advance(*batch_size) {
                Ok(state) => {
                    summary.cursor = Some(state);
                    self.enter(Phase::CursorAdvanced);
                }
                Err(e) => warn!("Cursor not advanced: {}", e),
            }
        }

        summary.log();
        self.events.log(EventType::CycleSummary, summary.to_event());
        Ok(summary)
    }

    fn executor_config(&self, opts: &RunOptions) -> ExecutorConfig {
        ExecutorConfig {
            concurrency: if opts.sample { 1 } else { self.settings.concurrency },
            min_reviews: self.settings.min_reviews,
            review_window: self.settings.review_window(),
            success_limit: opts.sample.then_some(self.settings.dev_limit),
            show_progress: opts.show_progress,
        }
    }
}

fn stats_delta(before: EnrichmentStats, after: EnrichmentStats) -> EnrichmentStats {
    EnrichmentStats {
        high_tier_calls: after.high_tier_calls - before.high_tier_calls,
        low_tier_calls: after.low_tier_calls - before.low_tier_calls,
        errors: after.errors - before.errors,
    }
}
