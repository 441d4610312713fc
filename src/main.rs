mod cursor;
mod db;
mod enrich;
mod events;
mod executor;
mod export;
mod facts;
mod pipeline;
mod settings;
mod source;
mod staleness;
mod store;

use std::io::IsTerminal;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use clap::builder::RangedU64ValueParser;
use clap::{Parser, Subcommand};

use crate::cursor::PartitionCursor;
use crate::db::ListingRecord;
use crate::events::{EventLog, EventType};
use crate::pipeline::{Pipeline, RunOptions, Target};
use crate::settings::Settings;
use crate::staleness::{is_stale, FreshnessIndex};
use crate::store::{MergeUpsertStore, SqliteDataset};

#[derive(Parser)]
#[command(name = "listing_harvester", about = "Incremental listing crawler with review enrichment")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Crawl the next partition(s), or a single search page / listing
    Run {
        /// Re-extract listings even if they are still fresh
        #[arg(long)]
        force: bool,
        /// Sample mode: dev dataset, one worker, stop after the configured number of rows
        #[arg(long)]
        dev: bool,
        /// Partition URLs to crawl this cycle
        #[arg(
            short = 'b',
            long,
            default_value = "1",
            value_parser = RangedU64ValueParser::<usize>::new().range(1..)
        )]
        batch_size: usize,
        /// Crawl a single listing page
        #[arg(long, conflicts_with = "search_url")]
        url: Option<String>,
        /// Crawl a single search page instead of the queue
        #[arg(long)]
        search_url: Option<String>,
    },
    /// Show dataset and cursor statistics
    Stats {
        /// Read the dev dataset
        #[arg(long)]
        dev: bool,
    },
    /// Best-rated listings table
    Overview {
        /// Filter by location type (substring, case-insensitive)
        #[arg(short = 't', long = "type")]
        location_type: Option<String>,
        /// Max rows to display
        #[arg(short = 'n', long, default_value = "50")]
        limit: usize,
        /// Read the dev dataset
        #[arg(long)]
        dev: bool,
    },
    /// Write the dataset as CSV
    Export {
        /// Output file
        #[arg(short, long)]
        out: PathBuf,
        /// Read the dev dataset
        #[arg(long)]
        dev: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let t0 = Instant::now();
    let cli = Cli::parse();
    let settings = Settings::load()?;

    let result = match cli.command {
        Commands::Run {
            force,
            dev,
            batch_size,
            url,
            search_url,
        } => {
            let target = match (url, search_url) {
                (Some(u), _) => Target::Listing(clean_url_arg(&u)),
                (None, Some(u)) => Target::SearchPage(clean_url_arg(&u)),
                (None, None) => Target::Queue { batch_size },
            };
            if dev {
                println!("Sample mode: writing to {}", settings.dev_dataset_path.display());
            }

            let events = Arc::new(EventLog::create(&settings.event_log_path));
            let mut pipeline = Pipeline::from_settings(settings, dev, events)?;
            let opts = RunOptions {
                target,
                force,
                sample: dev,
                now: Utc::now(),
                show_progress: std::io::stderr().is_terminal(),
            };
            let summary = pipeline.run_cycle(&opts).await?;

            println!(
                "Done: {} stored, {} fresh skipped, {} low-signal skipped, {} extraction errors.",
                summary.processed, summary.discarded_fresh, summary.discarded_low_signal, summary.extraction_errors
            );
            println!("Enrichment: {}.", summary.enrichment_line());
            if summary.fallback_used {
                println!("Warning: merge failed, new rows were appended (will be deduplicated on next run).");
            }
            if let Some(state) = summary.cursor {
                println!("Next partition: {}/{}", state.cursor + 1, state.total_partitions);
            }
            Ok(())
        }
        Commands::Stats { dev } => {
            let rows = load_rows(&settings, dev)?;
            let index = FreshnessIndex::from_records(&rows);
            let now = Utc::now();
            let ttl = settings.ttl();
            let undated = rows.iter().filter(|r| r.last_fetched.is_none()).count();
            let stale = rows
                .iter()
                .filter(|r| r.last_fetched.is_some() && is_stale(&r.external_id, &index, now, ttl, false))
                .count();
            let located = rows.iter().filter(|r| r.has_coordinates()).count();

            println!("Listings:  {}", index.len());
            println!("Fresh:     {}", rows.len() - stale - undated);
            println!("Stale:     {}", stale);
            println!("Undated:   {}", undated);
            println!("Located:   {}", located);
            match PartitionCursor::new(settings.url_list_path.clone(), settings.state_path.clone()).state() {
                Ok(state) => println!("Cursor:    {}/{}", state.cursor + 1, state.total_partitions),
                Err(e) => println!("Cursor:    - ({})", e),
            }
            if let Ok(log) = events::read_events(&settings.event_log_path) {
                let problems = log
                    .iter()
                    .filter(|e| {
                        matches!(
                            e.event_type,
                            EventType::ExtractionError
                                | EventType::EnrichmentError
                                | EventType::SaveError
                                | EventType::SaveFallbackError
                        )
                    })
                    .count();
                println!("Last run:  {} events, {} errors", log.len(), problems);
            }
            Ok(())
        }
        Commands::Overview {
            location_type,
            limit,
            dev,
        } => {
            let rows = load_rows(&settings, dev)?;
            let rows = best_rated(rows, location_type.as_deref(), limit);
            if rows.is_empty() {
                println!("No listings found.");
                return Ok(());
            }

            println!(
                "{:>3} | {:<28} | {:<20} | {:>6} | {:>7} | {:>6} | {:<24}",
                "#", "Listing", "Type", "Rating", "Reviews", "Places", "Pros"
            );
            println!("{}", "-".repeat(110));

            for (i, r) in rows.iter().enumerate() {
                let places = r.num_places.map(|p| p.to_string()).unwrap_or_else(|| "-".into());
                println!(
                    "{:>3} | {:<28} | {:<20} | {:>6.2} | {:>7} | {:>6} | {:<24}",
                    i + 1,
                    truncate(&r.title, 28),
                    truncate(&r.location_type, 20),
                    r.avg_rating,
                    r.total_reviews,
                    places,
                    truncate(&r.ai_pros, 24)
                );
            }

            println!("\n{} listings", rows.len());
            Ok(())
        }
        Commands::Export { out, dev } => {
            let rows = load_rows(&settings, dev)?;
            let written = export::write_csv(&out, &rows)?;
            println!("Exported {} listings to {}", written, out.display());
            Ok(())
        }
    };

    let elapsed = t0.elapsed();
    if elapsed.as_secs() >= 1 {
        println!("\nDone in {}", format_duration(elapsed));
    }

    result
}

fn load_rows(settings: &Settings, dev: bool) -> anyhow::Result<Vec<ListingRecord>> {
    let dataset = SqliteDataset::open(settings.dataset_for(dev))?;
    Ok(MergeUpsertStore::open(dataset).snapshot().to_vec())
}

/// Highest rating first, then most reviews.
fn best_rated(mut rows: Vec<ListingRecord>, location_type: Option<&str>, limit: usize) -> Vec<ListingRecord> {
    if let Some(t) = location_type {
        let t = t.to_lowercase();
        rows.retain(|r| r.location_type.to_lowercase().contains(&t));
    }
    rows.sort_by(|a, b| {
        b.avg_rating
            .total_cmp(&a.avg_rating)
            .then(b.total_reviews.cmp(&a.total_reviews))
    });
    rows.truncate(limit);
    rows
}

/// Shells and copy-paste often leave the URL wrapped in quotes.
fn clean_url_arg(raw: &str) -> String {
    raw.trim().trim_matches(|c| c == '"' || c == '\'').trim().to_string()
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let truncated: String = s.chars().take(max).collect();
        format!("{}...", truncated)
    }
}

fn format_duration(d: std::time::Duration) -> String {
    let secs = d.as_secs();
    if secs < 60 {
        format!("{:.1}s", d.as_secs_f64())
    } else if secs < 3600 {
        format!("{}m {}s", secs / 60, secs % 60)
    } else {
        format!("{}h {}m {}s", secs / 3600, (secs % 3600) / 60, secs % 60)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_record;

    #[test]
    fn quoted_urls_are_unwrapped() {
        assert_eq!(clean_url_arg("\"https://a.test/x\""), "https://a.test/x");
        assert_eq!(clean_url_arg(" 'https://a.test/x' "), "https://a.test/x");
        assert_eq!(clean_url_arg("https://a.test/x"), "https://a.test/x");
    }

    #[test]
    fn batch_size_must_be_positive() {
        assert!(Cli::try_parse_from(["listing_harvester", "run", "--batch-size", "0"]).is_err());
        match Cli::try_parse_from(["listing_harvester", "run", "-b", "3"]).unwrap().command {
            Commands::Run { batch_size, .. } => assert_eq!(batch_size, 3),
            _ => panic!("expected run"),
        }
    }

    #[test]
    fn overview_ordering_and_filter() {
        let mut a = test_record("1", "A", None);
        a.avg_rating = 4.0;
        a.location_type = "Parking lot".into();
        let mut b = test_record("2", "B", None);
        b.avg_rating = 4.8;
        b.location_type = "Camping".into();
        let mut c = test_record("3", "C", None);
        c.avg_rating = 4.0;
        c.total_reviews = 90;
        c.location_type = "Free parking".into();

        let all = best_rated(vec![a.clone(), b.clone(), c.clone()], None, 10);
        let ids: Vec<_> = all.iter().map(|r| r.external_id.as_str()).collect();
        assert_eq!(ids, vec!["2", "3", "1"]);

        let parking = best_rated(vec![a, b, c], Some("PARKING"), 1);
        assert_eq!(parking.len(), 1);
        assert_eq!(parking[0].external_id, "3");
    }

    #[test]
    fn durations() {
        assert_eq!(format_duration(std::time::Duration::from_secs(75)), "1m 15s");
        assert_eq!(truncate("abcdef", 3), "abc...");
    }
}
