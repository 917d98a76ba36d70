//! Inference service client
//!
//! One chat-completions call per transaction. The client never retries;
//! every failure is returned to the caller, which degrades that transaction
//! alone.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::num::NonZeroU32;
use std::time::Duration;
use thiserror::Error;

use mta_common::config::InferenceConfig;

use crate::models::Usage;
use crate::services::object_signer::ObjectRef;

const USER_AGENT: &str = concat!("mta-audit/", env!("CARGO_PKG_VERSION"));

/// Inference client errors
#[derive(Debug, Error)]
pub enum InferenceError {
    #[error("Inference credential not configured")]
    MissingCredential,

    #[error("Request timed out after {0:?}")]
    Timeout(Duration),

    #[error("Network error: {0}")]
    Network(String),

    #[error("API error {0}: {1}")]
    Api(u16, String),

    #[error("Malformed response body: {0}")]
    Malformed(String),

    #[error("Response contained no content")]
    EmptyContent,
}

/// One evaluation request
#[derive(Debug, Clone)]
pub struct InferenceRequest {
    pub transaction_id: i64,
    /// Instructions plus the compact rule listing
    pub instructions: String,
    /// Compact payload text
    pub content: String,
    pub object_refs: Vec<ObjectRef>,
}

/// Raw model output plus usage counters
#[derive(Debug, Clone, PartialEq)]
pub struct InferenceResponse {
    pub text: String,
    pub usage: Usage,
}

/// External inference service
#[async_trait]
pub trait InferenceClient: Send + Sync {
    async fn evaluate(&self, request: &InferenceRequest) -> Result<InferenceResponse, InferenceError>;

    /// Whether a credential is available; batches fail up front without one
    fn is_configured(&self) -> bool {
        true
    }
}

#[derive(Debug, Deserialize)]
struct CompletionBody {
    #[serde(default)]
    choices: Vec<CompletionChoice>,
    #[serde(default)]
    usage: Option<CompletionUsage>,
}

#[derive(Debug, Deserialize)]
struct CompletionChoice {
    message: CompletionMessage,
}

#[derive(Debug, Deserialize)]
struct CompletionMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Default, Deserialize, Serialize)]
struct CompletionUsage {
    #[serde(default)]
    prompt_tokens: i64,
    #[serde(default)]
    completion_tokens: i64,
    #[serde(default)]
    total_tokens: i64,
}

impl From<CompletionUsage> for Usage {
    fn from(usage: CompletionUsage) -> Self {
        let total = if usage.total_tokens > 0 {
            usage.total_tokens
        } else {
            usage.prompt_tokens + usage.completion_tokens
        };
        Usage {
            input_units: usage.prompt_tokens,
            output_units: usage.completion_tokens,
            total_units: total,
        }
    }
}

/// HTTP chat-completions client
pub struct HttpInferenceClient {
    http_client: reqwest::Client,
    endpoint: String,
    model: String,
    api_key: Option<String>,
    max_output_tokens: u32,
    timeout: Duration,
    rate_limiter: Option<
        governor::RateLimiter<
            governor::state::NotKeyed,
            governor::state::InMemoryState,
            governor::clock::DefaultClock,
        >,
    >,
}

impl HttpInferenceClient {
    pub fn new(config: &InferenceConfig, api_key: Option<String>) -> Result<Self, InferenceError> {
        let timeout = Duration::from_secs(config.timeout_secs);
        let http_client = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .timeout(timeout)
            .build()
            .map_err(|e| InferenceError::Network(e.to_string()))?;

        let rate_limiter = NonZeroU32::new(config.requests_per_second)
            .map(|rps| governor::RateLimiter::direct(governor::Quota::per_second(rps)));

        Ok(Self {
            http_client,
            endpoint: config.endpoint.clone(),
            model: config.model.clone(),
            api_key: api_key.filter(|k| mta_common::config::is_valid_key(k)),
            max_output_tokens: config.max_output_tokens,
            timeout,
            rate_limiter,
        })
    }

    fn request_body(&self, request: &InferenceRequest) -> serde_json::Value {
        let mut user_parts = vec![json!({ "type": "text", "text": request.content })];
        user_parts.extend(request.object_refs.iter().map(|object| {
            json!({ "type": "image_url", "image_url": { "url": object.url, "detail": "low" } })
        }));

        json!({
            "model": self.model,
            "temperature": 0,
            "max_tokens": self.max_output_tokens,
            "response_format": { "type": "json_object" },
            "messages": [
                { "role": "system", "content": request.instructions },
                { "role": "user", "content": user_parts },
            ],
        })
    }
}

#[async_trait]
impl InferenceClient for HttpInferenceClient {
    async fn evaluate(&self, request: &InferenceRequest) -> Result<InferenceResponse, InferenceError> {
        let api_key = self.api_key.as_deref().ok_or(InferenceError::MissingCredential)?;

        if let Some(limiter) = &self.rate_limiter {
            limiter.until_ready().await;
        }

        tracing::debug!(
            transaction_id = request.transaction_id,
            images = request.object_refs.len(),
            "Sending inference request"
        );

        let response = self
            .http_client
            .post(&self.endpoint)
            .bearer_auth(api_key)
            .json(&self.request_body(request))
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    InferenceError::Timeout(self.timeout)
                } else {
                    InferenceError::Network(e.to_string())
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response.text().await.unwrap_or_default();
            return Err(InferenceError::Api(status.as_u16(), error_text));
        }

        let body: CompletionBody = response.json().await.map_err(|e| {
            if e.is_timeout() {
                InferenceError::Timeout(self.timeout)
            } else {
                InferenceError::Malformed(e.to_string())
            }
        })?;

        extract_response(body)
    }

    fn is_configured(&self) -> bool {
        self.api_key.is_some()
    }
}

fn extract_response(body: CompletionBody) -> Result<InferenceResponse, InferenceError> {
    let usage = body.usage.map(Usage::from).unwrap_or_default();
    let text = body
        .choices
        .into_iter()
        .next()
        .and_then(|choice| choice.message.content)
        .filter(|text| !text.trim().is_empty())
        .ok_or(InferenceError::EmptyContent)?;
    Ok(InferenceResponse { text, usage })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn config() -> InferenceConfig {
        InferenceConfig {
            requests_per_second: 0,
            ..InferenceConfig::default()
        }
    }

    #[test]
    fn test_extract_content_and_usage() {
        let body: CompletionBody = serde_json::from_str(
            r#"{
                "choices": [{"message": {"role": "assistant", "content": "{\"v\":1,\"r\":[]}"}}],
                "usage": {"prompt_tokens": 120, "completion_tokens": 8, "total_tokens": 128}
            }"#,
        )
        .unwrap();
        let response = extract_response(body).unwrap();
        assert_eq!(response.text, "{\"v\":1,\"r\":[]}");
        assert_eq!(
            response.usage,
            Usage { input_units: 120, output_units: 8, total_units: 128 }
        );
    }

    #[test]
    fn test_missing_total_is_derived() {
        let usage = Usage::from(CompletionUsage {
            prompt_tokens: 10,
            completion_tokens: 5,
            total_tokens: 0,
        });
        assert_eq!(usage.total_units, 15);
    }

    #[test]
    fn test_empty_content_is_an_error() {
        let body: CompletionBody =
            serde_json::from_str(r#"{"choices": [{"message": {"content": "  "}}]}"#).unwrap();
        assert!(matches!(extract_response(body), Err(InferenceError::EmptyContent)));

        let body: CompletionBody = serde_json::from_str(r#"{"choices": []}"#).unwrap();
        assert!(matches!(extract_response(body), Err(InferenceError::EmptyContent)));
    }

    #[test]
    fn test_request_body_carries_image_parts() {
        let client = HttpInferenceClient::new(&config(), Some("sk-test-key".to_string())).unwrap();
        let request = InferenceRequest {
            transaction_id: 7,
            instructions: "audit".to_string(),
            content: "{\"t\":7}".to_string(),
            object_refs: vec![ObjectRef {
                url: "https://objects.example/a.jpg?expires=1&signature=x".to_string(),
                content_type: "image/jpeg".to_string(),
                expires_at: Utc::now(),
            }],
        };
        let body = client.request_body(&request);
        assert_eq!(body["messages"][0]["role"], "system");
        let parts = body["messages"][1]["content"].as_array().unwrap();
        assert_eq!(parts.len(), 2);
        assert_eq!(parts[1]["type"], "image_url");
    }

    #[tokio::test]
    async fn test_missing_credential_fails_without_network() {
        let client = HttpInferenceClient::new(&config(), None).unwrap();
        assert!(!client.is_configured());
        let request = InferenceRequest {
            transaction_id: 1,
            instructions: String::new(),
            content: String::new(),
            object_refs: Vec::new(),
        };
        assert!(matches!(
            client.evaluate(&request).await,
            Err(InferenceError::MissingCredential)
        ));
    }
}
