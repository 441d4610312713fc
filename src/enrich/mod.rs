//! Review aggregation through a hosted language model.
//!
//! The client picks a model tier per listing, sends the fixed system
//! instruction plus the listing payload, and turns whatever comes back into
//! a validated [`EnrichmentResult`]. Failures never propagate: after the
//! retry budget is spent the caller gets the empty result.

pub mod gemini;
pub mod prompt;
pub mod schema;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::events::{EventLog, EventType};
use crate::facts::RawFacts;
use gemini::{BackendError, ModelBackend, ModelRequest};
use schema::{parse_response, response_schema, EnrichmentResult, ResponseError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tier {
    High,
    Low,
}

#[derive(Debug, Clone)]
pub struct EnrichmentPolicy {
    pub high_tier_model: String,
    pub low_tier_model: String,
    pub tier_threshold: usize,
    pub max_attempts: u32,
    pub delay: Duration,
}

impl EnrichmentPolicy {
    /// More recent reviews than the threshold earns the stronger model.
    pub fn select_tier(&self, recent_reviews: usize) -> Tier {
        if recent_reviews > self.tier_threshold {
            Tier::High
        } else {
            Tier::Low
        }
    }

    pub fn model_for(&self, tier: Tier) -> &str {
        match tier {
            Tier::High => &self.high_tier_model,
            Tier::Low => &self.low_tier_model,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum EnrichError {
    #[error(transparent)]
    Backend(#[from] BackendError),
    #[error(transparent)]
    Response(#[from] ResponseError),
}

impl EnrichError {
    /// Transient API failures and unusable responses are worth another try.
    /// A reply with no text at all counts as unusable.
    pub fn is_retryable(&self) -> bool {
        match self {
            EnrichError::Backend(BackendError::Empty) => true,
            EnrichError::Backend(e) => e.is_transient(),
            EnrichError::Response(_) => true,
        }
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct EnrichmentStats {
    pub high_tier_calls: usize,
    pub low_tier_calls: usize,
    pub errors: usize,
}

pub struct EnrichmentClient {
    backend: Arc<dyn ModelBackend>,
    instruction: String,
    schema: Value,
    policy: EnrichmentPolicy,
    events: Arc<EventLog>,
    high_calls: AtomicUsize,
    low_calls: AtomicUsize,
    errors: AtomicUsize,
}

impl EnrichmentClient {
    pub fn new(
        backend: Arc<dyn ModelBackend>,
        instruction: String,
        policy: EnrichmentPolicy,
        events: Arc<EventLog>,
    ) -> Self {
        let policy = EnrichmentPolicy {
            max_attempts: policy.max_attempts.max(1),
            ..policy
        };
        EnrichmentClient {
            backend,
            instruction,
            schema: response_schema(),
            policy,
            events,
            high_calls: AtomicUsize::new(0),
            low_calls: AtomicUsize::new(0),
            errors: AtomicUsize::new(0),
        }
    }

    pub async fn enrich(&self, facts: &RawFacts) -> EnrichmentResult {
        let tier = self.policy.select_tier(facts.recent_reviews.len());
        let model = self.policy.model_for(tier);
        match tier {
            Tier::High => self.high_calls.fetch_add(1, Ordering::Relaxed),
            Tier::Low => self.low_calls.fetch_add(1, Ordering::Relaxed),
        };

        let payload = facts.payload();
        let user = match serde_json::to_string(&payload) {
            Ok(json) => format!("ANALYZE:\n{}", json),
            Err(e) => return self.give_up(facts, model, &e.to_string()),
        };
        self.events.log(
            EventType::EnrichmentRequest,
            json!({ "url": facts.url, "model": model, "payload": payload }),
        );

        let request = ModelRequest {
            model,
            system: &self.instruction,
            user: &user,
            response_schema: &self.schema,
            temperature: 0.0,
        };

        let max = self.policy.max_attempts;
        for attempt in 0..max {
            tokio::time::sleep(self.policy.delay * (attempt + 1)).await;

            let outcome = match self.backend.generate(&request).await {
                Ok(text) => parse_response(&text).map_err(EnrichError::from),
                Err(e) => Err(EnrichError::from(e)),
            };

            match outcome {
                Ok(result) => {
                    debug!(url = %facts.url, model, attempt, empty = result.is_empty(), "Enrichment ok");
                    self.events.log(
                        EventType::EnrichmentResponse,
                        json!({ "url": facts.url, "model": model, "response": result }),
                    );
                    return result;
                }
                Err(e) if e.is_retryable() && attempt + 1 < max => {
                    warn!("Enrichment retry {}/{} for {}: {}", attempt + 1, max, facts.url, e);
                }
                Err(e) => return self.give_up(facts, model, &e.to_string()),
            }
        }
        self.give_up(facts, model, "no attempts made")
    }

    fn give_up(&self, facts: &RawFacts, model: &str, error: &str) -> EnrichmentResult {
        warn!("Enrichment failed for {}: {}", facts.url, error);
        self.errors.fetch_add(1, Ordering::Relaxed);
        self.events.log(
            EventType::EnrichmentError,
            json!({ "url": facts.url, "model": model, "error": error }),
        );
        EnrichmentResult::default()
    }

    pub fn stats(&self) -> EnrichmentStats {
        EnrichmentStats {
            high_tier_calls: self.high_calls.load(Ordering::Relaxed),
            low_tier_calls: self.low_calls.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
        }
    }
}


#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::testing::{client, policy, ScriptedBackend};
    use super::*;

    const GOOD: &str = r#"{"num_places": 20, "parking_min": 5, "parking_max": 8, "pros": [{"label": "quiet", "count": 2}]}"#;

    fn facts(reviews: usize) -> RawFacts {
        RawFacts {
            external_id: "1".into(),
            url: "https://park4night.com/en/place/1".into(),
            title: "Spot".into(),
            feedback_count: reviews as u32,
            avg_rating: 4.0,
            latitude: 0.0,
            longitude: 0.0,
            location_type: "Unknown".into(),
            places_count: 0,
            parking_cost: "N/A".into(),
            recent_reviews: (0..reviews).map(|i| format!("[2025-01-01]: review {}", i)).collect(),
            seasonality: BTreeMap::new(),
        }
    }

    #[test]
    fn tier_boundary() {
        let p = policy();
        assert_eq!(p.select_tier(100), Tier::Low);
        assert_eq!(p.select_tier(101), Tier::High);
        assert_eq!(p.select_tier(0), Tier::Low);
    }

    #[tokio::test]
    async fn success_first_try() {
        let backend = Arc::new(ScriptedBackend::always(GOOD));
        let c = client(backend.clone());
        let r = c.enrich(&facts(3)).await;
        assert_eq!(r.num_places, Some(20));
        assert_eq!(backend.calls.load(Ordering::SeqCst), 1);
        assert_eq!(backend.models.lock().unwrap()[0], "low");
        assert_eq!(
            c.stats(),
            EnrichmentStats {
                high_tier_calls: 0,
                low_tier_calls: 1,
                errors: 0
            }
        );
    }

    #[tokio::test]
    async fn always_invalid_stops_at_attempt_limit() {
        let backend = Arc::new(ScriptedBackend::always("definitely not json"));
        let c = client(backend.clone());
        let r = c.enrich(&facts(150)).await;
        assert!(r.is_empty());
        assert_eq!(backend.calls.load(Ordering::SeqCst), 3);
        assert_eq!(backend.models.lock().unwrap()[0], "high");
        assert_eq!(c.stats().errors, 1);
        assert_eq!(c.stats().high_tier_calls, 1);
    }

    #[tokio::test]
    async fn transient_then_success() {
        let backend = Arc::new(ScriptedBackend::new(vec![
            Err((503, "UNAVAILABLE")),
            Ok("```json\n{\"parking_min\": 0}\n```"),
        ]));
        let c = client(backend.clone());
        let r = c.enrich(&facts(1)).await;
        assert_eq!(r.parking_min, Some(0.0));
        assert_eq!(backend.calls.load(Ordering::SeqCst), 2);
        assert_eq!(c.stats().errors, 0);
    }

    #[tokio::test]
    async fn textless_reply_is_retried() {
        let backend = Arc::new(ScriptedBackend::new(vec![Err((0, "")), Ok(GOOD)]));
        let c = client(backend.clone());
        let r = c.enrich(&facts(1)).await;
        assert_eq!(r.num_places, Some(20));
        assert_eq!(backend.calls.load(Ordering::SeqCst), 2);
        assert_eq!(c.stats().errors, 0);
    }

    #[test]
    fn retry_classification() {
        assert!(EnrichError::from(BackendError::Empty).is_retryable());
        let status = |status: u16, body: &str| {
            EnrichError::from(BackendError::Status {
                status,
                body: body.to_string(),
            })
        };
        assert!(status(503, "").is_retryable());
        assert!(!status(400, "API key not valid").is_retryable());
    }

    #[tokio::test]
    async fn permanent_error_is_not_retried() {
        let backend = Arc::new(ScriptedBackend::new(vec![Err((400, "API key not valid")), Ok(GOOD)]));
        let c = client(backend.clone());
        let r = c.enrich(&facts(1)).await;
        assert!(r.is_empty());
        assert_eq!(backend.calls.load(Ordering::SeqCst), 1);
        assert_eq!(c.stats().errors, 1);
    }

    #[tokio::test]
    async fn zero_attempts_still_tries_once() {
        let backend = Arc::new(ScriptedBackend::always(GOOD));
        let c = EnrichmentClient::new(
            backend.clone(),
            "instruction".into(),
            EnrichmentPolicy {
                max_attempts: 0,
                ..policy()
            },
            Arc::new(EventLog::disabled()),
        );
        assert!(!c.enrich(&facts(1)).await.is_empty());
        assert_eq!(backend.calls.load(Ordering::SeqCst), 1);
    }
}
