//! The agent under test, seen as `(input, context) -> text`.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use async_trait::async_trait;
use chrono::Utc;
use futures_util::{future::BoxFuture, FutureExt};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::{
    error::AgentError,
    history::{ContextTurn, ConversationContext},
    providers::LLMProvider,
    types::{ChatMessage, CompletionRequest},
};

#[async_trait]
pub trait AgentUnderTest: Send + Sync {
    /// One exchange. `context` carries the prior turns the caller wants the
    /// agent to see; `None` means a fresh conversation.
    async fn send(&self, input: &str, context: Option<&ConversationContext>) -> Result<String, AgentError>;

    /// Clears internal state between independent conversations.
    async fn reset(&self) -> Result<(), AgentError> {
        Ok(())
    }

    /// Tool names used during the most recent `send`.
    fn observed_tools(&self) -> Vec<String> {
        Vec::new()
    }

    fn name(&self) -> &str;
}

static SESSION_COUNTER: AtomicU64 = AtomicU64::new(0);

fn new_session_id() -> String {
    format!(
        "urteil-{}-{}",
        Utc::now().timestamp_millis(),
        SESSION_COUNTER.fetch_add(1, Ordering::Relaxed)
    )
}

#[derive(Debug, Clone)]
pub struct HttpAgentConfig {
    pub endpoint: String,
    pub headers: HashMap<String, String>,
    pub timeout: Duration,
}

impl HttpAgentConfig {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            headers: HashMap::new(),
            timeout: Duration::from_secs(30),
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

#[derive(Debug, Serialize)]
struct AgentRequestBody<'a> {
    message: &'a str,
    session_id: String,
    context: &'a [ContextTurn],
}

#[derive(Debug, Deserialize)]
struct AgentResponseBody {
    #[serde(default)]
    response: Option<String>,
    #[serde(default)]
    tool_calls: Vec<Value>,
}

/// Agent reachable over HTTP. Posts `{message, session_id, context}` and
/// reads `response` plus optional `tool_calls[].name`.
pub struct HttpAgent {
    client: Client,
    config: HttpAgentConfig,
    session_id: Mutex<String>,
    tools: Mutex<Vec<String>>,
}

impl HttpAgent {
    pub fn new(endpoint: impl Into<String>) -> Result<Self, AgentError> {
        Self::from_config(HttpAgentConfig::new(endpoint))
    }

    pub fn from_config(config: HttpAgentConfig) -> Result<Self, AgentError> {
        let client = Client::builder().timeout(config.timeout).build()?;
        Ok(Self {
            client,
            config,
            session_id: Mutex::new(new_session_id()),
            tools: Mutex::new(Vec::new()),
        })
    }

    pub fn session_id(&self) -> String {
        self.session_id
            .lock()
            .map(|guard| guard.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl AgentUnderTest for HttpAgent {
    async fn send(&self, input: &str, context: Option<&ConversationContext>) -> Result<String, AgentError> {
        let body = AgentRequestBody {
            message: input,
            session_id: self.session_id(),
            context: context.map(ConversationContext::turns).unwrap_or_default(),
        };

        let mut builder = self.client.post(&self.config.endpoint).json(&body);
        for (name, value) in &self.config.headers {
            builder = builder.header(name, value);
        }

        let response = builder.send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(AgentError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let text = response.text().await?;
        let parsed: AgentResponseBody =
            serde_json::from_str(&text).map_err(|err| AgentError::Decode(err.to_string()))?;
        let reply = parsed
            .response
            .ok_or_else(|| AgentError::Decode("reply has no `response` field".to_string()))?;

        let tools: Vec<String> = parsed
            .tool_calls
            .iter()
            .filter_map(|call| {
                call.get("name")
                    .or_else(|| call.get("function").and_then(|function| function.get("name")))
                    .and_then(Value::as_str)
                    .map(str::to_string)
            })
            .collect();
        debug!(agent = %self.config.endpoint, tools = ?tools, "agent replied");
        if let Ok(mut guard) = self.tools.lock() {
            *guard = tools;
        }

        Ok(reply)
    }

    async fn reset(&self) -> Result<(), AgentError> {
        if let Ok(mut guard) = self.tools.lock() {
            guard.clear();
        }
        if let Ok(mut guard) = self.session_id.lock() {
            *guard = new_session_id();
        }
        Ok(())
    }

    fn observed_tools(&self) -> Vec<String> {
        self.tools
            .lock()
            .map(|guard| guard.clone())
            .unwrap_or_default()
    }

    fn name(&self) -> &str {
        &self.config.endpoint
    }
}

/// A chat model standing in as the agent, with the context replayed as
/// chat history.
pub struct ModelAgent {
    provider: Arc<dyn LLMProvider>,
    model: String,
    system_prompt: Option<String>,
    temperature: Option<f32>,
}

impl ModelAgent {
    pub fn new(provider: Arc<dyn LLMProvider>, model: impl Into<String>) -> Self {
        Self {
            provider,
            model: model.into(),
            system_prompt: None,
            temperature: None,
        }
    }

    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = Some(prompt.into());
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }
}

#[async_trait]
impl AgentUnderTest for ModelAgent {
    async fn send(&self, input: &str, context: Option<&ConversationContext>) -> Result<String, AgentError> {
        let mut messages = Vec::new();
        if let Some(prompt) = &self.system_prompt {
            messages.push(ChatMessage::system(prompt));
        }
        if let Some(context) = context {
            messages.extend(context.to_messages());
        }
        messages.push(ChatMessage::user(input));

        let mut request = CompletionRequest::new(self.model.clone(), messages);
        if let Some(temperature) = self.temperature {
            request = request.with_temperature(temperature);
        }

        let response = self.provider.complete(request).await?;
        response
            .message
            .content
            .ok_or_else(|| AgentError::Decode("model returned no text".to_string()))
    }

    fn name(&self) -> &str {
        &self.model
    }
}

type AgentFn =
    dyn for<'a> Fn(&'a str, Option<&'a ConversationContext>) -> BoxFuture<'a, Result<String, AgentError>> + Send + Sync;

/// In-process agent backed by a closure.
pub struct FnAgent {
    name: String,
    handler: Box<AgentFn>,
}

impl FnAgent {
    pub fn new<F>(name: impl Into<String>, handler: F) -> Self
    where
        F: for<'a> Fn(&'a str, Option<&'a ConversationContext>) -> BoxFuture<'a, Result<String, AgentError>>
            + Send
            + Sync
            + 'static,
    {
        Self {
            name: name.into(),
            handler: Box::new(handler),
        }
    }

    /// Wraps a synchronous function.
    pub fn from_sync<F>(name: impl Into<String>, handler: F) -> Self
    where
        F: Fn(&str, Option<&ConversationContext>) -> Result<String, AgentError> + Send + Sync + 'static,
    {
        Self::new(name, move |input, context| {
            let result = handler(input, context);
            async move { result }.boxed()
        })
    }
}

#[async_trait]
impl AgentUnderTest for FnAgent {
    async fn send(&self, input: &str, context: Option<&ConversationContext>) -> Result<String, AgentError> {
        (self.handler)(input, context).await
    }

    fn name(&self) -> &str {
        &self.name
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::scripted::ScriptedProvider;

    #[tokio::test]
    async fn http_agent_posts_message_and_context() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/chat")
            .match_header("x-api-key", "secret")
            .match_body(mockito::Matcher::PartialJson(serde_json::json!({
                "message": "And my name?",
                "context": [{"input": "I'm Ada", "response": "Hi Ada"}]
            })))
            .with_status(200)
            .with_body(r#"{"response":"Your name is Ada","tool_calls":[{"name":"lookup_profile"}]}"#)
            .create_async()
            .await;

        let agent = HttpAgent::from_config(
            HttpAgentConfig::new(format!("{}/chat", server.url())).with_header("x-api-key", "secret"),
        )
        .unwrap();
        let mut context = ConversationContext::new();
        context.push("I'm Ada", "Hi Ada");

        let reply = agent.send("And my name?", Some(&context)).await.unwrap();

        mock.assert_async().await;
        assert_eq!(reply, "Your name is Ada");
        assert_eq!(agent.observed_tools(), vec!["lookup_profile".to_string()]);
    }

    #[tokio::test]
    async fn http_agent_surfaces_status_errors() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("POST", "/chat")
            .with_status(503)
            .with_body("down for maintenance")
            .create_async()
            .await;

        let agent = HttpAgent::new(format!("{}/chat", server.url())).unwrap();
        let error = agent.send("hello", None).await.unwrap_err();

        assert!(matches!(error, AgentError::Status { status: 503, ref body } if body.contains("maintenance")));
    }

    #[tokio::test]
    async fn http_agent_reset_rolls_session() {
        let agent = HttpAgent::new("http://127.0.0.1:9/chat").unwrap();
        let before = agent.session_id();
        agent.reset().await.unwrap();

        assert_ne!(agent.session_id(), before);
        assert!(agent.observed_tools().is_empty());
    }

    #[tokio::test]
    async fn model_agent_replays_context() {
        let provider = Arc::new(ScriptedProvider::from_replies(["You said Ada"]));
        let agent = ModelAgent::new(provider.clone(), "gpt-4o-mini").with_system_prompt("Be brief");
        let mut context = ConversationContext::new();
        context.push("I'm Ada", "Hi Ada");

        let reply = agent.send("Who am I?", Some(&context)).await.unwrap();

        assert_eq!(reply, "You said Ada");
        let request = &provider.requests()[0];
        assert_eq!(request.messages.len(), 4);
        assert_eq!(request.messages[3].text(), Some("Who am I?"));
    }

    #[tokio::test]
    async fn fn_agent_sees_context() {
        let agent = FnAgent::from_sync("echo", |input, context| {
            Ok(format!("{input} after {} turns", context.map(ConversationContext::len).unwrap_or(0)))
        });

        assert_eq!(agent.send("hi", None).await.unwrap(), "hi after 0 turns");
    }
}
