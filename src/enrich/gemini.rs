use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, CONTENT_TYPE};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

const GEMINI_API_URL: &str = "https://generativelanguage.googleapis.com/v1beta";

const TRANSIENT_SIGNATURES: [&str; 7] = [
    "503",
    "429",
    "overloaded",
    "unavailable",
    "deadline",
    "timeout",
    "timed out",
];

pub struct ModelRequest<'a> {
    pub model: &'a str,
    pub system: &'a str,
    pub user: &'a str,
    pub response_schema: &'a Value,
    pub temperature: f32,
}

#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    #[error("model API error ({status}): {body}")]
    Status { status: u16, body: String },
    #[error("request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("invalid API key header: {0}")]
    Header(#[from] reqwest::header::InvalidHeaderValue),
    #[error("no text in model response")]
    Empty,
}

impl BackendError {
    /// Failures likely to succeed on retry, by status or message signature.
    pub fn is_transient(&self) -> bool {
        match self {
            BackendError::Status { status, .. } if *status == 429 || *status >= 500 => true,
            BackendError::Transport(e) if e.is_timeout() || e.is_connect() => true,
            _ => {
                let msg = self.to_string().to_ascii_lowercase();
                TRANSIENT_SIGNATURES.iter().any(|sig| msg.contains(sig))
            }
        }
    }
}

/// Text generation with a structured JSON response.
#[async_trait]
pub trait ModelBackend: Send + Sync {
    async fn generate(&self, request: &ModelRequest<'_>) -> Result<String, BackendError>;
}

pub struct GeminiBackend {
    api_key: String,
    http: reqwest::Client,
    base_url: String,
}

impl GeminiBackend {
    pub fn new(api_key: &str) -> Self {
        Self {
            api_key: api_key.to_string(),
            http: reqwest::Client::new(),
            base_url: GEMINI_API_URL.to_string(),
        }
    }

    pub fn with_base_url(mut self, url: &str) -> Self {
        self.base_url = url.trim_end_matches('/').to_string();
        self
    }

    fn headers(&self) -> Result<HeaderMap, BackendError> {
        let mut headers = HeaderMap::new();
        headers.insert("x-goog-api-key", HeaderValue::from_str(&self.api_key)?);
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        Ok(headers)
    }
}

// ── Wire types ──

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerateRequest<'a> {
    system_instruction: Content<'a>,
    contents: Vec<Content<'a>>,
    generation_config: GenerationConfig<'a>,
}

#[derive(Serialize)]
struct Content<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    role: Option<&'a str>,
    parts: Vec<Part<'a>>,
}

#[derive(Serialize)]
struct Part<'a> {
    text: &'a str,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerationConfig<'a> {
    temperature: f32,
    response_mime_type: &'a str,
    response_json_schema: &'a Value,
}

#[derive(Deserialize)]
struct GenerateResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
}

#[derive(Deserialize)]
struct Candidate {
    content: Option<CandidateContent>,
}

#[derive(Deserialize)]
struct CandidateContent {
    #[serde(default)]
    parts: Vec<CandidatePart>,
}

#[derive(Deserialize)]
struct CandidatePart {
    text: Option<String>,
}

#[async_trait]
impl ModelBackend for GeminiBackend {
    async fn generate(&self, request: &ModelRequest<'_>) -> Result<String, BackendError> {
        let url = format!("{}/models/{}:generateContent", self.base_url, request.model);
        let body = GenerateRequest {
            system_instruction: Content {
                role: None,
                parts: vec![Part { text: request.system }],
            },
            contents: vec![Content {
                role: Some("user"),
                parts: vec![Part { text: request.user }],
            }],
            generation_config: GenerationConfig {
                temperature: request.temperature,
                response_mime_type: "application/json",
                response_json_schema: request.response_schema,
            },
        };

        debug!(model = request.model, "Gemini generateContent request");

        let response = self
            .http
            .post(&url)
            .headers(self.headers()?)
            .json(&body)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await?;
            return Err(BackendError::Status { status, body });
        }

        let parsed: GenerateResponse = response.json().await?;
        let text: String = parsed
            .candidates
            .into_iter()
            .next()
            .and_then(|c| c.content)
            .map(|c| c.parts.into_iter().filter_map(|p| p.text).collect())
            .unwrap_or_default();

        if text.trim().is_empty() {
            return Err(BackendError::Empty);
        }
        Ok(text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn status(code: u16, body: &str) -> BackendError {
        BackendError::Status {
            status: code,
            body: body.into(),
        }
    }

    #[test]
    fn transient_classification() {
        assert!(status(503, "").is_transient());
        assert!(status(429, "quota").is_transient());
        assert!(status(400, "The model is overloaded").is_transient());
        assert!(status(400, "Deadline exceeded").is_transient());
        assert!(!status(400, "API key not valid").is_transient());
        assert!(!status(404, "model not found").is_transient());
        assert!(!BackendError::Empty.is_transient());
    }

    #[test]
    fn request_body_shape() {
        let schema = serde_json::json!({"type": "object"});
        let body = GenerateRequest {
            system_instruction: Content {
                role: None,
                parts: vec![Part { text: "sys" }],
            },
            contents: vec![Content {
                role: Some("user"),
                parts: vec![Part { text: "ANALYZE:\n{}" }],
            }],
            generation_config: GenerationConfig {
                temperature: 0.0,
                response_mime_type: "application/json",
                response_json_schema: &schema,
            },
        };
        let v = serde_json::to_value(&body).unwrap();
        assert_eq!(v["systemInstruction"]["parts"][0]["text"], "sys");
        assert!(v["systemInstruction"].get("role").is_none());
        assert_eq!(v["contents"][0]["role"], "user");
        assert_eq!(v["generationConfig"]["responseMimeType"], "application/json");
        assert_eq!(v["generationConfig"]["responseJsonSchema"]["type"], "object");
    }

    #[test]
    fn response_text_joined() {
        let parsed: GenerateResponse = serde_json::from_str(
            r#"{"candidates": [{"content": {"parts": [{"text": "{\"a\""}, {"text": ": 1}"}]}}]}"#,
        )
        .unwrap();
        let text: String = parsed.candidates[0]
            .content
            .as_ref()
            .unwrap()
            .parts
            .iter()
            .filter_map(|p| p.text.clone())
            .collect();
        assert_eq!(text, "{\"a\": 1}");
    }
}
