use std::path::PathBuf;
use std::time::Duration;

use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;

const CONFIG_FILE: &str = "harvester";
const ENV_PREFIX: &str = "HARVEST";

pub const GEMINI_KEY_VAR: &str = "GOOGLE_API_KEY";
pub const SPIDER_KEY_VAR: &str = "SPIDER_API_KEY";

/// Runtime settings: built-in defaults, then `harvester.toml` (optional),
/// then `HARVEST_*` environment variables.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub url_list_path: PathBuf,
    pub state_path: PathBuf,
    pub dataset_path: PathBuf,
    pub dev_dataset_path: PathBuf,
    pub event_log_path: PathBuf,
    pub taxonomy_path: PathBuf,
    pub prompt_path: Option<PathBuf>,
    pub site_base_url: String,
    pub gemini_base_url: Option<String>,

    pub concurrency: usize,
    pub staleness_days: i64,
    pub min_reviews: u32,
    pub dev_limit: usize,
    pub review_years: i64,

    pub tier_threshold: usize,
    pub high_tier_model: String,
    pub low_tier_model: String,
    pub max_enrichment_attempts: u32,
    pub ai_delay_ms: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            url_list_path: "url_list.txt".into(),
            state_path: "queue_state.json".into(),
            dataset_path: "data/listings.sqlite".into(),
            dev_dataset_path: "data/listings_dev.sqlite".into(),
            event_log_path: "pipeline_execution.log".into(),
            taxonomy_path: "taxonomy.json".into(),
            prompt_path: None,
            site_base_url: "https://park4night.com".into(),
            gemini_base_url: None,
            concurrency: 3,
            staleness_days: 30,
            min_reviews: 5,
            dev_limit: 1,
            review_years: 2,
            tier_threshold: 100,
            high_tier_model: "gemini-2.5-flash".into(),
            low_tier_model: "gemini-2.5-flash-lite".into(),
            max_enrichment_attempts: 3,
            ai_delay_ms: 1000,
        }
    }
}

impl Settings {
    pub fn load() -> Result<Self, ConfigError> {
        Config::builder()
            .add_source(File::with_name(CONFIG_FILE).required(false))
            .add_source(Environment::with_prefix(ENV_PREFIX).try_parsing(true))
            .build()?
            .try_deserialize()
    }

    pub fn ttl(&self) -> chrono::Duration {
        chrono::Duration::days(self.staleness_days)
    }

    /// Reviews older than this are ignored when building facts.
    pub fn review_window(&self) -> chrono::Duration {
        chrono::Duration::days(self.review_years * 365)
    }

    pub fn ai_delay(&self) -> Duration {
        Duration::from_millis(self.ai_delay_ms)
    }

    pub fn dataset_for(&self, sample: bool) -> &PathBuf {
        if sample {
            &self.dev_dataset_path
        } else {
            &self.dataset_path
        }
    }
}

#[derive(Debug, thiserror::Error)]
#[error("missing credential: set the {0} environment variable")]
pub struct MissingCredential(pub &'static str);

pub fn credential(var: &'static str) -> Result<String, MissingCredential> {
    std::env::var(var)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .ok_or(MissingCredential(var))
}
