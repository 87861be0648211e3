// HTTP client for the Gemini `generateContent` API.

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use factory_sentinel::core_modules::classifier::{Classifier, PROBE_PROMPT};
use factory_sentinel::error::BackendError;
use futures::future::BoxFuture;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use tracing::debug;

pub const DEFAULT_ENDPOINT: &str = "https://generativelanguage.googleapis.com/v1beta";

pub struct GeminiClassifier {
    client: Client,
    endpoint: String,
    api_key: String,
}

#[derive(Debug, Serialize)]
struct GenerateRequest<'a> {
    contents: [Content<'a>; 1],
}

#[derive(Debug, Serialize)]
struct Content<'a> {
    role: &'static str,
    parts: Vec<Part<'a>>,
}

#[derive(Debug, Serialize)]
#[serde(untagged)]
enum Part<'a> {
    Image { inline_data: InlineData },
    Text { text: &'a str },
}

#[derive(Debug, Serialize)]
struct InlineData {
    mime_type: &'static str,
    data: String,
}

#[derive(Debug, Default, Deserialize)]
struct GenerateResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
}

#[derive(Debug, Deserialize)]
struct Candidate {
    content: Option<CandidateContent>,
}

#[derive(Debug, Deserialize)]
struct CandidateContent {
    #[serde(default)]
    parts: Vec<ReplyPart>,
}

#[derive(Debug, Deserialize)]
struct ReplyPart {
    text: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct ModelList {
    #[serde(default)]
    models: Vec<ModelInfo>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ModelInfo {
    name: String,
    #[serde(default)]
    supported_generation_methods: Vec<String>,
}

impl GeminiClassifier {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self::with_endpoint(api_key, DEFAULT_ENDPOINT)
    }

    pub fn with_endpoint(api_key: impl Into<String>, endpoint: impl Into<String>) -> Self {
        Self {
            client: Client::new(),
            endpoint: endpoint.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
        }
    }

    async fn generate(&self, backend: &str, parts: Vec<Part<'_>>) -> Result<String, BackendError> {
        let model = backend.strip_prefix("models/").unwrap_or(backend);
        let url = format!("{}/models/{model}:generateContent", self.endpoint);
        let request = GenerateRequest {
            contents: [Content { role: "user", parts }],
        };

        let response = self
            .client
            .post(&url)
            .query(&[("key", self.api_key.as_str())])
            .json(&request)
            .send()
            .await
            .map_err(transport)?;
        let status = response.status();
        let body = response.text().await.map_err(transport)?;
        if !status.is_success() {
            return Err(status_error(status, body));
        }

        debug!(backend = %model, bytes = body.len(), "generateContent reply");
        reply_text(&body)
    }
}

impl Classifier for GeminiClassifier {
    fn classify<'a>(
        &'a self,
        backend: &'a str,
        image_jpeg: &'a [u8],
        prompt: &'a str,
    ) -> BoxFuture<'a, Result<String, BackendError>> {
        Box::pin(async move {
            let parts = vec![
                Part::Image {
                    inline_data: InlineData {
                        mime_type: "image/jpeg",
                        data: BASE64.encode(image_jpeg),
                    },
                },
                Part::Text { text: prompt },
            ];
            self.generate(backend, parts).await
        })
    }

    fn probe<'a>(&'a self, backend: &'a str) -> BoxFuture<'a, Result<(), BackendError>> {
        Box::pin(async move {
            self.generate(backend, vec![Part::Text { text: PROBE_PROMPT }])
                .await
                .map(|_| ())
        })
    }

    fn list_backends(&self) -> BoxFuture<'_, Result<Vec<String>, BackendError>> {
        Box::pin(async move {
            let url = format!("{}/models", self.endpoint);
            let response = self
                .client
                .get(&url)
                .query(&[("key", self.api_key.as_str())])
                .send()
                .await
                .map_err(transport)?;
            let status = response.status();
            let body = response.text().await.map_err(transport)?;
            if !status.is_success() {
                return Err(status_error(status, body));
            }
            model_names(&body)
        })
    }
}

fn transport(e: reqwest::Error) -> BackendError {
    BackendError::Transport(e.to_string())
}

/// Maps a non-success HTTP status onto the backend error taxonomy.
fn status_error(status: StatusCode, body: String) -> BackendError {
    match status {
        StatusCode::TOO_MANY_REQUESTS => BackendError::Quota(body),
        StatusCode::NOT_FOUND => BackendError::NotFound(body),
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => BackendError::Auth(body),
        other => BackendError::Rejected {
            status: other.as_u16(),
            body,
        },
    }
}

/// Concatenates the text parts of the first candidate.
fn reply_text(body: &str) -> Result<String, BackendError> {
    let response: GenerateResponse =
        serde_json::from_str(body).map_err(|e| BackendError::Transport(format!("malformed reply envelope: {e}")))?;
    let text: String = response
        .candidates
        .into_iter()
        .next()
        .and_then(|c| c.content)
        .map(|c| c.parts.into_iter().filter_map(|p| p.text).collect())
        .unwrap_or_default();
    if text.trim().is_empty() {
        return Err(BackendError::EmptyReply);
    }
    Ok(text)
}

/// Names of the models that accept `generateContent`.
fn model_names(body: &str) -> Result<Vec<String>, BackendError> {
    let list: ModelList =
        serde_json::from_str(body).map_err(|e| BackendError::Transport(format!("malformed model list: {e}")))?;
    Ok(list
        .models
        .into_iter()
        .filter(|m| m.supported_generation_methods.iter().any(|g| g == "generateContent"))
        .map(|m| m.name)
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_body_matches_wire_shape() {
        let request = GenerateRequest {
            contents: [Content {
                role: "user",
                parts: vec![
                    Part::Image {
                        inline_data: InlineData {
                            mime_type: "image/jpeg",
                            data: BASE64.encode([0xFF, 0xD8]),
                        },
                    },
                    Part::Text { text: "look" },
                ],
            }],
        };
        let value = serde_json::to_value(&request).unwrap();
        assert_eq!(
            value,
            serde_json::json!({
                "contents": [{
                    "role": "user",
                    "parts": [
                        {"inline_data": {"mime_type": "image/jpeg", "data": "/9g="}},
                        {"text": "look"}
                    ]
                }]
            })
        );
    }

    #[test]
    fn reply_text_joins_parts_of_first_candidate() {
        let body = r#"{"candidates":[
            {"content":{"parts":[{"text":"```json\n{\"status\":"},{"text":"\"SAFE\"}\n```"}]}},
            {"content":{"parts":[{"text":"ignored"}]}}
        ]}"#;
        assert_eq!(reply_text(body).unwrap(), "```json\n{\"status\":\"SAFE\"}\n```");
    }

    #[test]
    fn blank_or_missing_reply_is_empty() {
        assert!(matches!(reply_text(r#"{"candidates":[]}"#), Err(BackendError::EmptyReply)));
        assert!(matches!(reply_text("{}"), Err(BackendError::EmptyReply)));
        assert!(matches!(
            reply_text(r#"{"candidates":[{"content":{"parts":[{"text":"  "}]}}]}"#),
            Err(BackendError::EmptyReply)
        ));
        assert!(matches!(reply_text("<html>"), Err(BackendError::Transport(_))));
    }

    #[test]
    fn http_statuses_map_to_backend_errors() {
        assert!(matches!(
            status_error(StatusCode::TOO_MANY_REQUESTS, String::new()),
            BackendError::Quota(_)
        ));
        assert!(matches!(status_error(StatusCode::NOT_FOUND, String::new()), BackendError::NotFound(_)));
        assert!(matches!(status_error(StatusCode::FORBIDDEN, String::new()), BackendError::Auth(_)));
        assert!(matches!(
            status_error(StatusCode::SERVICE_UNAVAILABLE, "busy".into()),
            BackendError::Rejected { status: 503, .. }
        ));
    }

    #[test]
    fn model_list_keeps_generate_capable_models() {
        let body = r#"{"models":[
            {"name":"models/gemini-2.0-flash","supportedGenerationMethods":["generateContent","countTokens"]},
            {"name":"models/text-embedding-004","supportedGenerationMethods":["embedContent"]},
            {"name":"models/legacy"}
        ]}"#;
        assert_eq!(model_names(body).unwrap(), vec!["models/gemini-2.0-flash"]);
    }
}
