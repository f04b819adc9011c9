use async_trait::async_trait;

use crate::types::{CompletionRequest, CompletionResponse};
use crate::LLMError;

pub mod anthropic;
pub mod ollama;
pub mod openai;
pub mod scripted;

#[async_trait]
pub trait LLMProvider: Send + Sync {
    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, LLMError>;

    fn name(&self) -> &'static str;
}

/// Maps a non-success HTTP status to a provider error, preferring the
/// provider's own error message when the body carries one.
pub(crate) fn status_error(status: reqwest::StatusCode, message: String) -> LLMError {
    if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
        LLMError::Unauthorized(message)
    } else {
        LLMError::Provider(format!("unexpected status {status}: {message}"))
    }
}
