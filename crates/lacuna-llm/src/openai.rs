use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::LlmError;
use crate::provider::{LlmProvider, Message};

const SAFETY_MARKERS: &[&str] = &["content_filter", "safety", "blocked", "prohibited_content"];

/// Client for any OpenAI-compatible `/chat/completions` endpoint (OpenAI,
/// Gemini's OpenAI surface, vLLM, llama.cpp server).
#[derive(Clone)]
pub struct OpenAiProvider {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
    model: String,
    max_tokens: u32,
    temperature: f32,
    json_mode: bool,
}

impl fmt::Debug for OpenAiProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OpenAiProvider")
            .field("client", &"<reqwest::Client>")
            .field("api_key", &"<redacted>")
            .field("base_url", &self.base_url)
            .field("model", &self.model)
            .field("max_tokens", &self.max_tokens)
            .field("temperature", &self.temperature)
            .field("json_mode", &self.json_mode)
            .finish()
    }
}

impl OpenAiProvider {
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be constructed.
    pub fn new(
        api_key: String,
        mut base_url: String,
        model: String,
        max_tokens: u32,
        temperature: f32,
        timeout: Duration,
    ) -> Result<Self, LlmError> {
        while base_url.ends_with('/') {
            base_url.pop();
        }
        Ok(Self {
            client: crate::http::default_client(timeout)?,
            api_key,
            base_url,
            model,
            max_tokens,
            temperature,
            json_mode: false,
        })
    }

    /// Ask the endpoint for a JSON object response (`response_format`).
    #[must_use]
    pub fn with_json_mode(mut self, enabled: bool) -> Self {
        self.json_mode = enabled;
        self
    }

    #[must_use]
    pub fn with_client(mut self, client: reqwest::Client) -> Self {
        self.client = client;
        self
    }

    async fn send_request(&self, messages: &[Message]) -> Result<String, LlmError> {
        let body = ChatRequest {
            model: &self.model,
            messages,
            max_tokens: self.max_tokens,
            temperature: self.temperature,
            response_format: self.json_mode.then_some(ResponseFormat {
                kind: "json_object",
            }),
        };

        let response = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        let text = response.text().await.map_err(LlmError::Http)?;

        if let Some(err) = self.classify_status(status, &text) {
            return Err(err);
        }

        let resp: ChatResponse = serde_json::from_str(&text)?;
        let choice = resp.choices.into_iter().next().ok_or(LlmError::EmptyResponse {
            provider: "openai".into(),
        })?;

        if choice
            .finish_reason
            .as_deref()
            .is_some_and(is_safety_marker)
        {
            return Err(LlmError::SafetyBlocked {
                model: self.model.clone(),
                reason: choice.finish_reason.unwrap_or_default(),
            });
        }

        match choice.message.content {
            Some(content) if !content.trim().is_empty() => Ok(content),
            _ => Err(LlmError::EmptyResponse {
                provider: "openai".into(),
            }),
        }
    }

    fn classify_status(&self, status: reqwest::StatusCode, body: &str) -> Option<LlmError> {
        if status.is_success() {
            return None;
        }
        tracing::debug!(model = %self.model, %status, "OpenAI-compatible API error body: {body}");
        let err = match status {
            reqwest::StatusCode::TOO_MANY_REQUESTS => LlmError::RateLimited,
            reqwest::StatusCode::NOT_FOUND => LlmError::ModelNotFound {
                model: self.model.clone(),
            },
            s if s.is_server_error() => LlmError::Unavailable(format!("{} returned {s}", self.model)),
            reqwest::StatusCode::BAD_REQUEST if is_safety_marker(body) => LlmError::SafetyBlocked {
                model: self.model.clone(),
                reason: "request rejected by safety filter".into(),
            },
            s => LlmError::Other(format!("OpenAI-compatible request failed (status {s})")),
        };
        Some(err)
    }
}

fn is_safety_marker(text: &str) -> bool {
    let lower = text.to_ascii_lowercase();
    SAFETY_MARKERS.iter().any(|m| lower.contains(m))
}

impl LlmProvider for OpenAiProvider {
    async fn chat(&self, messages: &[Message]) -> Result<String, LlmError> {
        self.send_request(messages).await
    }

    async fn list_models(&self) -> Result<Vec<String>, LlmError> {
        let response = self
            .client
            .get(format!("{}/models", self.base_url))
            .header("Authorization", format!("Bearer {}", self.api_key))
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            return Err(LlmError::Unavailable(format!(
                "model catalog request failed (status {status})"
            )));
        }
        let catalog: ModelList = response.json().await?;
        Ok(catalog.data.into_iter().map(|m| m.id).collect())
    }

    fn for_model(&self, model: &str) -> Self {
        Self {
            model: model.to_owned(),
            ..self.clone()
        }
    }

    fn model(&self) -> &str {
        &self.model
    }

    #[allow(clippy::unnecessary_literal_bound)]
    fn name(&self) -> &str {
        "openai"
    }
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: &'a [Message],
    max_tokens: u32,
    temperature: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_format: Option<ResponseFormat>,
}

#[derive(Serialize)]
struct ResponseFormat {
    #[serde(rename = "type")]
    kind: &'static str,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatMessage,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Deserialize)]
struct ChatMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Deserialize)]
struct ModelList {
    data: Vec<ModelEntry>,
}

#[derive(Deserialize)]
struct ModelEntry {
    id: String,
}

#[cfg(test)]
mod tests {
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;

    fn provider(server: &MockServer) -> OpenAiProvider {
        OpenAiProvider::new(
            "sk-test".into(),
            format!("{}/v1/", server.uri()),
            "gemini-2.0-flash".into(),
            256,
            0.3,
            Duration::from_secs(5),
        )
        .unwrap()
    }

    fn completion(content: &str, finish_reason: &str) -> serde_json::Value {
        serde_json::json!({
            "choices": [{
                "message": {"role": "assistant", "content": content},
                "finish_reason": finish_reason
            }]
        })
    }

    #[test]
    fn debug_redacts_api_key() {
        let p = OpenAiProvider::new(
            "sk-secret".into(),
            "http://localhost".into(),
            "m".into(),
            1,
            0.0,
            Duration::from_secs(1),
        )
        .unwrap();
        let dbg = format!("{p:?}");
        assert!(!dbg.contains("sk-secret"));
        assert!(dbg.contains("<redacted>"));
    }

    #[test]
    fn for_model_keeps_endpoint() {
        let p = OpenAiProvider::new(
            "k".into(),
            "http://host/v1".into(),
            "a".into(),
            1,
            0.0,
            Duration::from_secs(1),
        )
        .unwrap();
        let q = p.for_model("b");
        assert_eq!(q.model(), "b");
        assert_eq!(q.base_url, "http://host/v1");
    }

    #[tokio::test]
    async fn chat_returns_content() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .and(header("Authorization", "Bearer sk-test"))
            .respond_with(ResponseTemplate::new(200).set_body_json(completion("hello", "stop")))
            .mount(&server)
            .await;

        let out = provider(&server).chat(&[Message::user("hi")]).await.unwrap();
        assert_eq!(out, "hello");
    }

    #[tokio::test]
    async fn not_found_maps_to_model_not_found() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .respond_with(ResponseTemplate::new(404).set_body_string("no such model"))
            .mount(&server)
            .await;

        let err = provider(&server).chat(&[Message::user("hi")]).await.unwrap_err();
        assert!(matches!(err, LlmError::ModelNotFound { ref model } if model == "gemini-2.0-flash"));
    }

    #[tokio::test]
    async fn too_many_requests_maps_to_rate_limited() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(429))
            .mount(&server)
            .await;

        let err = provider(&server).chat(&[Message::user("hi")]).await.unwrap_err();
        assert!(matches!(err, LlmError::RateLimited));
    }

    #[tokio::test]
    async fn server_error_maps_to_unavailable() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let err = provider(&server).chat(&[Message::user("hi")]).await.unwrap_err();
        assert!(matches!(err, LlmError::Unavailable(_)));
    }

    #[tokio::test]
    async fn content_filter_finish_reason_is_safety_block() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(completion("", "content_filter")))
            .mount(&server)
            .await;

        let err = provider(&server).chat(&[Message::user("hi")]).await.unwrap_err();
        assert!(err.is_safety_block(), "got {err:?}");
    }

    #[tokio::test]
    async fn blank_content_is_empty_response() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(completion("  ", "stop")))
            .mount(&server)
            .await;

        let err = provider(&server).chat(&[Message::user("hi")]).await.unwrap_err();
        assert!(matches!(err, LlmError::EmptyResponse { .. }));
    }

    #[tokio::test]
    async fn list_models_reads_catalog() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/models"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "data": [{"id": "gemini-2.0-flash"}, {"id": "gemini-1.5-pro"}]
            })))
            .mount(&server)
            .await;

        let models = provider(&server).list_models().await.unwrap();
        assert_eq!(models, vec!["gemini-2.0-flash", "gemini-1.5-pro"]);
    }
}
