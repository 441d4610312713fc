use std::fs::File;
use std::io::{BufRead, BufReader, Write};
use std::path::Path;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EventType {
    CycleStart,
    ItemStart,
    ItemSkipFresh,
    ItemSkipLowSignal,
    DiscoveryError,
    ExtractionError,
    EnrichmentRequest,
    EnrichmentResponse,
    EnrichmentError,
    RowStored,
    SaveError,
    SaveFallbackError,
    CycleSummary,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunEvent {
    pub timestamp: DateTime<Utc>,
    #[serde(rename = "type")]
    pub event_type: EventType,
    pub content: Value,
}

/// Append-only JSON-lines sink for lifecycle events.
///
/// The target file is truncated once, when the handle is created; every
/// `log` call after that appends a line. Failures never reach the caller.
pub struct EventLog {
    sink: Option<Mutex<File>>,
}

impl EventLog {
    pub fn create(path: &Path) -> Self {
        match File::create(path) {
            Ok(file) => EventLog {
                sink: Some(Mutex::new(file)),
            },
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Event log unavailable, continuing without it");
                EventLog::disabled()
            }
        }
    }

    pub fn disabled() -> Self {
        EventLog { sink: None }
    }

    pub fn log(&self, event_type: EventType, payload: Value) {
        let Some(sink) = &self.sink else {
            return;
        };

        let event = RunEvent {
            timestamp: Utc::now(),
            event_type,
            content: reparse_embedded_json(payload),
        };
        let line = match serde_json::to_string(&event) {
            Ok(line) => line,
            Err(e) => {
                debug!(error = %e, "Event serialization failed");
                return;
            }
        };

        let Ok(mut file) = sink.lock() else {
            return;
        };
        if let Err(e) = writeln!(file, "{}", line) {
            debug!(error = %e, "Event log write failed");
        }
    }
}

/// Read a log back, skipping lines that are not valid events.
pub fn read_events(path: &Path) -> std::io::Result<Vec<RunEvent>> {
    let reader = BufReader::new(File::open(path)?);
    let mut events = Vec::new();
    for line in reader.lines() {
        let line = line?;
        if let Ok(event) = serde_json::from_str(&line) {
            events.push(event);
        }
    }
    Ok(events)
}

fn reparse_embedded_json(payload: Value) -> Value {
    match payload {
        Value::Object(map) => Value::Object(
            map.into_iter()
                .map(|(k, v)| (k, reparse_value(v)))
                .collect(),
        ),
        other => reparse_value(other),
    }
}

fn reparse_value(value: Value) -> Value {
    match value {
        Value::String(s) => {
            let trimmed = s.trim_start();
            if trimmed.starts_with('{') || trimmed.starts_with('[') {
                serde_json::from_str(&s).unwrap_or(Value::String(s))
            } else {
                Value::String(s)
            }
        }
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn first_write_truncates_then_appends() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run.log");
        std::fs::write(&path, "stale content from a previous process\n").unwrap();

        let log = EventLog::create(&path);
        log.log(EventType::CycleStart, json!({ "urls": 1 }));
        log.log(EventType::CycleSummary, json!({ "processed": 0 }));

        let events = read_events(&path).unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].event_type, EventType::CycleStart);
        assert_eq!(events[1].event_type, EventType::CycleSummary);

        let raw = std::fs::read_to_string(&path).unwrap();
        assert!(!raw.contains("stale content"));
        assert!(raw.contains("\"type\":\"cycle-summary\""));
    }

    #[test]
    fn embedded_json_strings_are_reparsed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run.log");
        let log = EventLog::create(&path);
        log.log(
            EventType::RowStored,
            json!({
                "review_seasonality": "{\"2025-07\": 3}",
                "broken": "[not json",
                "title": "Plain title",
            }),
        );

        let events = read_events(&path).unwrap();
        let content = &events[0].content;
        assert_eq!(content["review_seasonality"]["2025-07"], 3);
        assert_eq!(content["broken"], "[not json");
        assert_eq!(content["title"], "Plain title");
    }

    #[test]
    fn unwritable_target_is_a_silent_no_op() {
        let dir = tempfile::tempdir().unwrap();
        let log = EventLog::create(&dir.path().join("missing").join("run.log"));
        log.log(EventType::SaveError, json!({ "error": "boom" }));
        EventLog::disabled().log(EventType::CycleStart, json!({}));
    }
}
