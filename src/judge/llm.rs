use std::sync::Arc;

use async_trait::async_trait;
use tracing::warn;

use super::{prompt, JudgeBackend, JudgeRequest, Verdict};
use crate::{
    error::{BackendErrorKind, JudgeError},
    providers::LLMProvider,
    types::{ChatMessage, CompletionRequest},
};

const JUDGE_TEMPERATURE: f32 = 0.1;
const JUDGE_MAX_TOKENS: u32 = 200;

/// A chat-completion model acting as a judge.
#[derive(Clone)]
pub struct LlmJudge {
    key: String,
    model: String,
    provider: Arc<dyn LLMProvider>,
    template: String,
    temperature: f32,
    max_tokens: u32,
}

impl LlmJudge {
    /// `key` doubles as the model name; use `with_model` when they differ.
    pub fn new(key: impl Into<String>, provider: Arc<dyn LLMProvider>) -> Self {
        let key = key.into();
        Self {
            model: key.clone(),
            key,
            provider,
            template: prompt::DEFAULT_TEMPLATE.to_string(),
            temperature: JUDGE_TEMPERATURE,
            max_tokens: JUDGE_MAX_TOKENS,
        }
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    /// Handlebars template with `input`, `response`, `criterion` and
    /// optional `description` in scope.
    pub fn with_template(mut self, template: impl Into<String>) -> Self {
        self.template = template.into();
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    pub fn model(&self) -> &str {
        &self.model
    }
}

#[async_trait]
impl JudgeBackend for LlmJudge {
    fn key(&self) -> &str {
        &self.key
    }

    async fn judge(&self, request: &JudgeRequest<'_>) -> Result<Verdict, JudgeError> {
        let rendered = prompt::render(&self.template, request)
            .map_err(|message| JudgeError::backend(&self.key, BackendErrorKind::InvalidRequest, message))?;

        let completion = CompletionRequest::new(self.model.clone(), vec![ChatMessage::user(rendered)])
            .with_temperature(self.temperature)
            .with_max_tokens(self.max_tokens);

        let response = self
            .provider
            .complete(completion)
            .await
            .map_err(|err| JudgeError::from_llm(&self.key, err))?;

        let reply = response.message.text().unwrap_or_default();
        prompt::parse_reply(reply).map_err(|message| {
            warn!(backend = %self.key, reason = %message, "judge reply rejected");
            JudgeError::backend(&self.key, BackendErrorKind::MalformedReply, message)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::scripted::ScriptedProvider;

    #[tokio::test]
    async fn yes_reply_becomes_satisfied_verdict() {
        let provider = Arc::new(ScriptedProvider::from_replies([
            r#"{"decision": "YES", "reasoning": "Friendly and on topic"}"#,
        ]));
        let judge = LlmJudge::new("claude-sonnet-4", provider.clone());

        let verdict = judge
            .judge(&JudgeRequest::new("Hello", "Hi! How can I help?", "Greets the user"))
            .await
            .unwrap();

        assert!(verdict.satisfied);
        let requests = provider.requests();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].model, "claude-sonnet-4");
        assert_eq!(requests[0].temperature, Some(JUDGE_TEMPERATURE));
        assert!(requests[0].messages[0].text().unwrap().contains("Greets the user"));
    }

    #[tokio::test]
    async fn unparsable_reply_is_malformed_not_a_panic() {
        let provider = Arc::new(ScriptedProvider::from_replies(["I think it is probably fine"]));
        let judge = LlmJudge::new("gpt-4o", provider);

        let error = judge
            .judge(&JudgeRequest::new("Hello", "Hi", "Greets the user"))
            .await
            .unwrap_err();

        assert!(matches!(
            error,
            JudgeError::Backend { kind: BackendErrorKind::MalformedReply, ref backend, .. } if backend == "gpt-4o"
        ));
        assert!(error.is_retryable());
    }

    #[tokio::test]
    async fn provider_failure_is_classified() {
        let provider = Arc::new(ScriptedProvider::new());
        provider.push_failure("overloaded");
        let judge = LlmJudge::new("local-llama3", provider).with_model("llama3");

        let error = judge
            .judge(&JudgeRequest::new("Hello", "Hi", "Greets the user"))
            .await
            .unwrap_err();

        assert!(matches!(error, JudgeError::Backend { kind: BackendErrorKind::Provider, .. }));
    }

    #[tokio::test]
    async fn custom_template_is_used() {
        let provider = Arc::new(ScriptedProvider::from_replies([r#"{"decision":"NO"}"#]));
        let judge = LlmJudge::new("gpt-4o", provider.clone()).with_template("Criterion: {{criterion}}");

        let verdict = judge
            .judge(&JudgeRequest::new("Hello", "Go away", "Is polite"))
            .await
            .unwrap();

        assert!(!verdict.satisfied);
        assert_eq!(provider.requests()[0].messages[0].text(), Some("Criterion: Is polite"));
    }
}
