//! Evaluation modes and the resolver that turns a mode name plus overrides
//! into an immutable `EvaluationConfig`.

use std::{collections::BTreeMap, env, fmt, str::FromStr, time::Duration};

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// How calls to several backends for one criterion are scheduled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStrategy {
    Parallel,
    Sequential,
}

/// Which backends vote on a criterion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum PanelStrategy {
    /// Every configured backend votes.
    Corroborate,
    /// One vote: primary first, the next backend only when the previous failed.
    Fallback,
}

/// Which failed criteria fail a case outright, whatever the weighted score.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum HardFailPolicy {
    Off,
    /// Only criteria marked `hard`.
    Marked,
    AllCriteria,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum EvaluationMode {
    Fast,
    Thorough,
    Production,
}

impl EvaluationMode {
    pub const ALL: [EvaluationMode; 3] = [Self::Fast, Self::Thorough, Self::Production];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Fast => "fast",
            Self::Thorough => "thorough",
            Self::Production => "production",
        }
    }

    pub fn preset(self) -> EvaluationConfig {
        let base = EvaluationConfig {
            mode: Some(self),
            backends: vec!["claude-sonnet-4".to_string()],
            iterations: 1,
            consensus_threshold: 0.67,
            iteration_consensus_threshold: 1.0,
            pass_threshold: 0.67,
            timeout: Duration::from_secs(15),
            execution: ExecutionStrategy::Sequential,
            panel: PanelStrategy::Fallback,
            retry_count: 1,
            retry_backoff: Duration::from_millis(500),
            hard_fail: HardFailPolicy::AllCriteria,
            backend_weights: BTreeMap::new(),
        };

        match self {
            Self::Fast => base,
            Self::Thorough => EvaluationConfig {
                backends: vec![
                    "claude-sonnet-4".to_string(),
                    "gpt-4o".to_string(),
                    "local-llama3".to_string(),
                ],
                iterations: 3,
                iteration_consensus_threshold: 0.67,
                timeout: Duration::from_secs(30),
                execution: ExecutionStrategy::Parallel,
                panel: PanelStrategy::Corroborate,
                retry_count: 2,
                ..base
            },
            Self::Production => EvaluationConfig {
                backends: vec!["claude-sonnet-4".to_string(), "gpt-4o".to_string()],
                iterations: 3,
                consensus_threshold: 0.75,
                pass_threshold: 0.75,
                timeout: Duration::from_secs(30),
                execution: ExecutionStrategy::Parallel,
                retry_count: 2,
                ..base
            },
        }
    }
}

impl fmt::Display for EvaluationMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EvaluationMode {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|mode| mode.as_str().eq_ignore_ascii_case(value.trim()))
            .ok_or_else(|| ConfigError::UnknownMode(value.to_string()))
    }
}

/// Resolved evaluation parameters. Immutable once resolved; share it as
/// `Arc<EvaluationConfig>` between concurrently running tests.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EvaluationConfig {
    pub mode: Option<EvaluationMode>,
    /// Ordered backend keys; the first is the primary.
    pub backends: Vec<String>,
    pub iterations: u32,
    pub consensus_threshold: f64,
    pub iteration_consensus_threshold: f64,
    pub pass_threshold: f64,
    pub timeout: Duration,
    pub execution: ExecutionStrategy,
    pub panel: PanelStrategy,
    pub retry_count: u32,
    pub retry_backoff: Duration,
    pub hard_fail: HardFailPolicy,
    /// Trust weight per backend key; missing keys weigh 1.0.
    pub backend_weights: BTreeMap<String, f64>,
}

impl Default for EvaluationConfig {
    fn default() -> Self {
        EvaluationMode::Fast.preset()
    }
}

impl EvaluationConfig {
    pub fn weight_of(&self, backend: &str) -> f64 {
        self.backend_weights.get(backend).copied().unwrap_or(1.0)
    }

    /// Default preset adjusted by `URTEIL_MODE`, `URTEIL_ITERATIONS`,
    /// `URTEIL_TIMEOUT_MS` and `URTEIL_BACKENDS` (comma separated).
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub(crate) fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mode = lookup("URTEIL_MODE");
        let mut overrides = ConfigOverrides::default();

        if let Some(iterations) = lookup("URTEIL_ITERATIONS") {
            overrides.iterations = Some(iterations.trim().parse().map_err(|_| {
                ConfigError::InvalidConfiguration(format!("URTEIL_ITERATIONS is not a number: {iterations}"))
            })?);
        }
        if let Some(timeout_ms) = lookup("URTEIL_TIMEOUT_MS") {
            overrides.timeout_ms = Some(timeout_ms.trim().parse().map_err(|_| {
                ConfigError::InvalidConfiguration(format!("URTEIL_TIMEOUT_MS is not a number: {timeout_ms}"))
            })?);
        }
        if let Some(backends) = lookup("URTEIL_BACKENDS") {
            overrides.backends = Some(split_backends(&backends));
        }

        resolve(&ConfigRequest { mode, overrides })
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |message: String| Err(ConfigError::InvalidConfiguration(message));

        if !in_unit_interval_open_low(self.consensus_threshold) {
            return invalid(format!(
                "consensus_threshold must be in (0, 1], got {}",
                self.consensus_threshold
            ));
        }
        if !in_unit_interval_open_low(self.iteration_consensus_threshold) {
            return invalid(format!(
                "iteration_consensus_threshold must be in (0, 1], got {}",
                self.iteration_consensus_threshold
            ));
        }
        if !(0.0..=1.0).contains(&self.pass_threshold) {
            return invalid(format!("pass_threshold must be in [0, 1], got {}", self.pass_threshold));
        }
        if self.iterations < 1 {
            return invalid("iterations must be at least 1".to_string());
        }
        if self.backends.is_empty() {
            return invalid("at least one judge backend is required".to_string());
        }
        if let Some(blank) = self.backends.iter().find(|key| key.trim().is_empty()) {
            return invalid(format!("backend key must not be blank: {blank:?}"));
        }
        if self.timeout.is_zero() {
            return invalid("timeout must be positive".to_string());
        }
        if let Some((key, weight)) = self
            .backend_weights
            .iter()
            .find(|(_, weight)| !weight.is_finite() || **weight <= 0.0)
        {
            return invalid(format!("backend weight for `{key}` must be positive, got {weight}"));
        }

        Ok(())
    }
}

fn in_unit_interval_open_low(value: f64) -> bool {
    value > 0.0 && value <= 1.0
}

pub(crate) fn split_backends(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|key| !key.is_empty())
        .map(str::to_string)
        .collect()
}

/// Field-by-field replacements for a preset. Absent fields keep the preset value.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct ConfigOverrides {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backends: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iterations: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub consensus_threshold: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iteration_consensus_threshold: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pass_threshold: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execution: Option<ExecutionStrategy>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub panel: Option<PanelStrategy>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_count: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_backoff_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hard_fail: Option<HardFailPolicy>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backend_weights: Option<BTreeMap<String, f64>>,
}

impl ConfigOverrides {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    /// Applies every present field on top of `config`.
    pub fn apply(&self, mut config: EvaluationConfig) -> EvaluationConfig {
        if let Some(backends) = &self.backends {
            config.backends = backends.clone();
        }
        if let Some(iterations) = self.iterations {
            config.iterations = iterations;
        }
        if let Some(threshold) = self.consensus_threshold {
            config.consensus_threshold = threshold;
        }
        if let Some(threshold) = self.iteration_consensus_threshold {
            config.iteration_consensus_threshold = threshold;
        }
        if let Some(threshold) = self.pass_threshold {
            config.pass_threshold = threshold;
        }
        if let Some(ms) = self.timeout_ms {
            config.timeout = Duration::from_millis(ms);
        }
        if let Some(execution) = self.execution {
            config.execution = execution;
        }
        if let Some(panel) = self.panel {
            config.panel = panel;
        }
        if let Some(retries) = self.retry_count {
            config.retry_count = retries;
        }
        if let Some(ms) = self.retry_backoff_ms {
            config.retry_backoff = Duration::from_millis(ms);
        }
        if let Some(policy) = self.hard_fail {
            config.hard_fail = policy;
        }
        if let Some(weights) = &self.backend_weights {
            config.backend_weights = weights.clone();
        }
        config
    }
}

/// Input to the resolver: an optional mode name plus overrides. In YAML the
/// overrides sit next to `mode`, e.g. `{ mode: thorough, iterations: 5 }`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct ConfigRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<String>,
    #[serde(flatten)]
    pub overrides: ConfigOverrides,
}

impl ConfigRequest {
    pub fn mode(mode: impl Into<String>) -> Self {
        Self {
            mode: Some(mode.into()),
            overrides: ConfigOverrides::default(),
        }
    }

    pub fn with_overrides(mut self, overrides: ConfigOverrides) -> Self {
        self.overrides = overrides;
        self
    }

    pub fn is_empty(&self) -> bool {
        self.mode.is_none() && self.overrides.is_empty()
    }
}

/// Resolves against the default (`fast`) preset when no mode is named.
pub fn resolve(request: &ConfigRequest) -> Result<EvaluationConfig, ConfigError> {
    resolve_on(&EvaluationConfig::default(), request)
}

pub fn resolve_mode(name: &str) -> Result<EvaluationConfig, ConfigError> {
    resolve(&ConfigRequest::mode(name))
}

/// Like `resolve`, but an unnamed mode means "keep `base`" rather than the
/// default preset. Used for per-scenario and per-step overrides.
pub fn resolve_on(base: &EvaluationConfig, request: &ConfigRequest) -> Result<EvaluationConfig, ConfigError> {
    let preset = match request.mode.as_deref() {
        Some(name) => name.parse::<EvaluationMode>()?.preset(),
        None => base.clone(),
    };

    let config = request.overrides.apply(preset);
    config.validate()?;
    Ok(config)
}
