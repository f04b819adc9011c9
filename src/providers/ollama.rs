use std::{env, time::Duration};

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};

use crate::{
    error::LLMError,
    providers::{status_error, LLMProvider},
    types::{CompletionRequest, CompletionResponse, MessageRole},
};

const DEFAULT_BASE_URL: &str = "http://localhost:11434";

#[derive(Debug, Clone)]
pub struct OllamaConfig {
    pub base_url: String,
    pub request_timeout: Duration,
}

impl Default for OllamaConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            request_timeout: Duration::from_secs(60),
        }
    }
}

impl OllamaConfig {
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    pub fn with_timeout(mut self, request_timeout: Duration) -> Self {
        self.request_timeout = request_timeout;
        self
    }
}

/// Local models served by Ollama through the non-streaming generate endpoint.
#[derive(Debug, Clone)]
pub struct Ollama {
    client: Client,
    config: OllamaConfig,
}

impl Ollama {
    pub fn from_env() -> Result<Self, LLMError> {
        let mut config = OllamaConfig::default();
        if let Ok(base_url) = env::var("OLLAMA_BASE_URL") {
            config.base_url = base_url;
        }
        Self::from_config(config)
    }

    pub fn from_config(config: OllamaConfig) -> Result<Self, LLMError> {
        let client = Client::builder()
            .timeout(config.request_timeout)
            .build()?;

        Ok(Self { client, config })
    }

    fn endpoint(&self) -> String {
        format!("{}/api/generate", self.config.base_url.trim_end_matches('/'))
    }
}

#[derive(Debug, Serialize)]
struct GenerateRequestBody {
    model: String,
    prompt: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<String>,
    stream: bool,
    options: GenerateOptions,
}

#[derive(Debug, Serialize)]
struct GenerateOptions {
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    num_predict: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct GenerateResponseBody {
    response: String,
}

#[async_trait]
impl LLMProvider for Ollama {
    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, LLMError> {
        let system = request.system_prompt();
        let prompt = request
            .messages
            .iter()
            .filter(|message| message.role != MessageRole::System)
            .filter_map(|message| message.text())
            .collect::<Vec<_>>()
            .join("\n\n");

        let body = GenerateRequestBody {
            // "local-" is only a routing prefix, Ollama knows the bare name.
            model: request
                .model
                .strip_prefix("local-")
                .unwrap_or(&request.model)
                .to_string(),
            prompt,
            system,
            stream: false,
            options: GenerateOptions {
                temperature: request.temperature,
                num_predict: request.max_tokens,
            },
        };

        let response = self.client.post(self.endpoint()).json(&body).send().await?;
        let status = response.status();

        if !status.is_success() {
            let text = response.text().await?;
            return Err(status_error(status, text));
        }

        let parsed: GenerateResponseBody = response.json().await?;
        Ok(CompletionResponse::assistant(parsed.response))
    }

    fn name(&self) -> &'static str {
        "ollama"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ChatMessage;

    #[tokio::test]
    async fn strips_local_prefix_from_model() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("POST", "/api/generate")
            .match_body(mockito::Matcher::PartialJson(serde_json::json!({
                "model": "llama3",
                "stream": false
            })))
            .with_status(200)
            .with_body(r#"{"response":"{\"decision\":\"YES\",\"reasoning\":\"ok\"}","done":true}"#)
            .create_async()
            .await;

        let provider = Ollama::from_config(OllamaConfig::default().with_base_url(server.url()))
            .expect("client should build");
        let response = provider
            .complete(CompletionRequest::new("local-llama3", vec![ChatMessage::user("judge")]))
            .await
            .expect("completion should succeed");

        assert!(response.message.text().unwrap_or_default().contains("YES"));
    }

    #[tokio::test]
    async fn invalid_json_is_an_error() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("POST", "/api/generate")
            .with_status(200)
            .with_body("not valid json")
            .create_async()
            .await;

        let provider = Ollama::from_config(OllamaConfig::default().with_base_url(server.url()))
            .expect("client should build");
        let result = provider
            .complete(CompletionRequest::new("llama3", vec![ChatMessage::user("judge")]))
            .await;

        assert!(result.is_err());
    }
}
