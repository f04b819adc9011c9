use std::{collections::HashMap, fmt, sync::Arc};

use tracing::debug;

use super::{JudgeBackend, LlmJudge};
use crate::{
    error::{ConfigError, LLMError},
    providers::{anthropic::Anthropic, ollama::Ollama, openai::OpenAI, LLMProvider},
};

/// Provider family a backend key routes to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProviderFamily {
    OpenAI,
    Anthropic,
    Ollama,
}

impl ProviderFamily {
    /// Guesses the family from a backend key such as `gpt-4o`,
    /// `claude-sonnet-4` or `local-llama3`.
    pub fn detect(key: &str) -> Option<Self> {
        let key = key.to_ascii_lowercase();
        let has_prefix = |prefixes: &[&str]| prefixes.iter().any(|prefix| key.starts_with(prefix));
        if has_prefix(&["gpt-", "o1-", "o3-"]) {
            Some(Self::OpenAI)
        } else if has_prefix(&["claude-", "sonnet", "haiku", "opus"]) {
            Some(Self::Anthropic)
        } else if has_prefix(&["local-", "llama", "mistral"]) {
            Some(Self::Ollama)
        } else {
            None
        }
    }

    fn connect(self) -> Result<Arc<dyn LLMProvider>, LLMError> {
        Ok(match self {
            Self::OpenAI => Arc::new(OpenAI::from_env()?),
            Self::Anthropic => Arc::new(Anthropic::from_env()?),
            Self::Ollama => Arc::new(Ollama::from_env()?),
        })
    }
}

/// Backend key to judge lookup.
#[derive(Default, Clone)]
pub struct JudgeRegistry {
    backends: HashMap<String, Arc<dyn JudgeBackend>>,
}

impl JudgeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds `LlmJudge`s for `keys`, one shared provider client per family.
    pub fn from_env<S: AsRef<str>>(keys: &[S]) -> Result<Self, ConfigError> {
        let mut registry = Self::new();
        let mut providers: HashMap<ProviderFamily, Arc<dyn LLMProvider>> = HashMap::new();

        for key in keys {
            let key = key.as_ref();
            let family = ProviderFamily::detect(key).ok_or_else(|| ConfigError::UnknownBackend(key.to_string()))?;

            let provider = match providers.get(&family) {
                Some(provider) => provider.clone(),
                None => {
                    let provider = family.connect().map_err(|err| {
                        ConfigError::InvalidConfiguration(format!("backend `{key}` cannot be constructed: {err}"))
                    })?;
                    providers.insert(family, provider.clone());
                    provider
                }
            };

            debug!(backend = key, family = ?family, "registered judge backend");
            registry.register(Arc::new(LlmJudge::new(key, provider)));
        }

        Ok(registry)
    }

    /// Registers under the backend's own key, replacing any previous entry.
    pub fn register(&mut self, backend: Arc<dyn JudgeBackend>) -> &mut Self {
        self.backends.insert(backend.key().to_string(), backend);
        self
    }

    pub fn with(mut self, backend: Arc<dyn JudgeBackend>) -> Self {
        self.register(backend);
        self
    }

    pub fn get(&self, key: &str) -> Option<Arc<dyn JudgeBackend>> {
        self.backends.get(key).cloned()
    }

    /// Looks up `keys` in order. Any missing key fails the whole lookup.
    pub fn resolve<S: AsRef<str>>(&self, keys: &[S]) -> Result<Vec<Arc<dyn JudgeBackend>>, ConfigError> {
        keys.iter()
            .map(|key| {
                self.get(key.as_ref())
                    .ok_or_else(|| ConfigError::UnknownBackend(key.as_ref().to_string()))
            })
            .collect()
    }

    pub fn keys(&self) -> Vec<&str> {
        let mut keys: Vec<&str> = self.backends.keys().map(String::as_str).collect();
        keys.sort_unstable();
        keys
    }
}

impl fmt::Debug for JudgeRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JudgeRegistry").field("backends", &self.keys()).finish()
    }
}
