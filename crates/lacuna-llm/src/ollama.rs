use ollama_rs::Ollama;
use ollama_rs::generation::chat::ChatMessage;
use ollama_rs::generation::chat::request::ChatMessageRequest;

use crate::error::LlmError;
use crate::provider::{LlmProvider, Message, Role};

#[derive(Debug, Clone)]
pub struct OllamaProvider {
    client: Ollama,
    model: String,
}

impl OllamaProvider {
    #[must_use]
    pub fn new(base_url: &str, model: String) -> Self {
        Self {
            client: client_for(base_url),
            model,
        }
    }

    /// Check if Ollama is reachable.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection to Ollama fails.
    pub async fn health_check(&self) -> Result<(), LlmError> {
        self.client.list_local_models().await.map_err(|e| {
            LlmError::Unavailable(format!("failed to connect to Ollama, is it running? {e}"))
        })?;
        Ok(())
    }
}

impl LlmProvider for OllamaProvider {
    async fn chat(&self, messages: &[Message]) -> Result<String, LlmError> {
        let ollama_messages: Vec<ChatMessage> = messages.iter().map(convert_message).collect();
        let request = ChatMessageRequest::new(self.model.clone(), ollama_messages);

        let response = self
            .client
            .send_chat_messages(request)
            .await
            .map_err(|e| map_error(&self.model, &e.to_string()))?;

        if response.message.content.trim().is_empty() {
            return Err(LlmError::EmptyResponse {
                provider: "ollama".into(),
            });
        }
        Ok(response.message.content)
    }

    async fn list_models(&self) -> Result<Vec<String>, LlmError> {
        let models = self
            .client
            .list_local_models()
            .await
            .map_err(|e| LlmError::Unavailable(format!("Ollama model list failed: {e}")))?;
        Ok(models.into_iter().map(|m| m.name).collect())
    }

    fn for_model(&self, model: &str) -> Self {
        Self {
            client: self.client.clone(),
            model: model.to_owned(),
        }
    }

    fn model(&self) -> &str {
        &self.model
    }

    #[allow(clippy::unnecessary_literal_bound)]
    fn name(&self) -> &str {
        "ollama"
    }
}

pub(crate) fn client_for(base_url: &str) -> Ollama {
    let (host, port) = parse_host_port(base_url);
    Ollama::new(host, port)
}

fn convert_message(msg: &Message) -> ChatMessage {
    match msg.role {
        Role::System => ChatMessage::system(msg.content.clone()),
        Role::User => ChatMessage::user(msg.content.clone()),
        Role::Assistant => ChatMessage::assistant(msg.content.clone()),
    }
}

fn map_error(model: &str, message: &str) -> LlmError {
    let lower = message.to_ascii_lowercase();
    if lower.contains("not found") {
        LlmError::ModelNotFound {
            model: model.to_owned(),
        }
    } else if lower.contains("connection") || lower.contains("timed out") {
        LlmError::Unavailable(format!("Ollama chat request failed: {message}"))
    } else {
        LlmError::Other(format!("Ollama chat request failed: {message}"))
    }
}

fn parse_host_port(url: &str) -> (String, u16) {
    let url = url.trim_end_matches('/');
    if let Some(colon_pos) = url.rfind(':') {
        let port_str = &url[colon_pos + 1..];
        if let Ok(port) = port_str.parse::<u16>() {
            let host = url[..colon_pos].to_string();
            return (host, port);
        }
    }
    (url.to_string(), 11434)
}
