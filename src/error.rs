use std::{fmt, time::Duration};

use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum LLMError {
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("provider error: {0}")]
    Provider(String),

    #[error("provider rejected credentials: {0}")]
    Unauthorized(String),

    #[error("missing API key: set the {0} environment variable")]
    MissingApiKey(&'static str),

    #[error("invalid response from provider: {0}")]
    InvalidResponse(&'static str),
}

/// Coarse classification of a single failed judge call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendErrorKind {
    Transport,
    Auth,
    MalformedReply,
    InvalidRequest,
    Provider,
}

impl fmt::Display for BackendErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Transport => "transport",
            Self::Auth => "auth",
            Self::MalformedReply => "malformed reply",
            Self::InvalidRequest => "invalid request",
            Self::Provider => "provider",
        };
        f.write_str(label)
    }
}

/// One backend's failure, kept for diagnostics.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BackendFailure {
    pub backend: String,
    pub reason: String,
    pub timed_out: bool,
}

#[derive(Debug, Clone, Error)]
pub enum JudgeError {
    #[error("judge backend `{backend}` failed ({kind}): {message}")]
    Backend {
        backend: String,
        kind: BackendErrorKind,
        message: String,
    },

    #[error("judge backend `{backend}` timed out after {timeout:?}")]
    Timeout { backend: String, timeout: Duration },

    #[error("all {} judge backend(s) unavailable", failures.len())]
    AllBackendsUnavailable { failures: Vec<BackendFailure> },
}

impl JudgeError {
    pub fn backend(backend: impl Into<String>, kind: BackendErrorKind, message: impl Into<String>) -> Self {
        Self::Backend {
            backend: backend.into(),
            kind,
            message: message.into(),
        }
    }

    /// Whether the same backend may be asked again.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Backend { kind, .. } => matches!(
                kind,
                BackendErrorKind::Transport | BackendErrorKind::MalformedReply | BackendErrorKind::Provider
            ),
            Self::Timeout { .. } => true,
            Self::AllBackendsUnavailable { .. } => false,
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }

    pub fn to_failure(&self, backend: &str) -> BackendFailure {
        BackendFailure {
            backend: backend.to_string(),
            reason: self.to_string(),
            timed_out: self.is_timeout(),
        }
    }

    pub(crate) fn from_llm(backend: &str, error: LLMError) -> Self {
        let kind = match &error {
            LLMError::Http(_) => BackendErrorKind::Transport,
            LLMError::Unauthorized(_) | LLMError::MissingApiKey(_) => BackendErrorKind::Auth,
            LLMError::Serialization(_) | LLMError::InvalidResponse(_) => BackendErrorKind::MalformedReply,
            LLMError::Provider(_) => BackendErrorKind::Provider,
        };
        Self::backend(backend, kind, error.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConfigError {
    #[error("unknown evaluation mode: {0}")]
    UnknownMode(String),

    #[error("invalid evaluation configuration: {0}")]
    InvalidConfiguration(String),

    #[error("no judge backend registered for `{0}`")]
    UnknownBackend(String),
}

#[derive(Debug, Error)]
pub enum AgentError {
    #[error("agent http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("agent returned status {status}: {body}")]
    Status { status: u16, body: String },

    #[error("agent reply could not be decoded: {0}")]
    Decode(String),

    #[error(transparent)]
    Provider(#[from] LLMError),

    #[error("{0}")]
    Custom(String),
}

impl AgentError {
    pub fn custom(message: impl Into<String>) -> Self {
        Self::Custom(message.into())
    }
}

#[derive(Debug, Error)]
pub enum FlowError {
    #[error("agent failed at turn {turn}: {message}")]
    AgentFatal { turn: usize, message: String },

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("invalid scenario definition: {0}")]
    Definition(String),
}
