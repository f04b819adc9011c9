use std::{fmt, sync::Arc};

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::{
    config::EvaluationConfig,
    consensus::{aggregate_criterion, Vote},
    error::{BackendFailure, ConfigError, JudgeError},
    judge::{JudgePanel, JudgeRegistry, JudgeRequest},
};

/// Flow scoring bucket a criterion counts towards.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum Dimension {
    #[default]
    General,
    ContextRetention,
    BusinessLogic,
    ToolUsage,
}

impl fmt::Display for Dimension {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::General => "general",
            Self::ContextRetention => "context_retention",
            Self::BusinessLogic => "business_logic",
            Self::ToolUsage => "tool_usage",
        };
        f.write_str(label)
    }
}

/// A natural-language property the response is judged against.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Criterion {
    pub text: String,
    pub weight: f64,
    /// Extra context for the judge; never evaluated on its own.
    pub description: Option<String>,
    pub dimension: Dimension,
    /// Fails the whole case when unmet under `HardFailPolicy::Marked`.
    pub hard: bool,
}

impl Criterion {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            weight: 1.0,
            description: None,
            dimension: Dimension::General,
            hard: false,
        }
    }

    pub fn with_weight(mut self, weight: f64) -> Self {
        self.weight = weight;
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_dimension(mut self, dimension: Dimension) -> Self {
        self.dimension = dimension;
        self
    }

    pub fn hard(mut self) -> Self {
        self.hard = true;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.text.trim().is_empty() {
            return Err(ConfigError::InvalidConfiguration("criterion text must not be empty".to_string()));
        }
        if !self.weight.is_finite() || self.weight <= 0.0 {
            return Err(ConfigError::InvalidConfiguration(format!(
                "criterion `{}` has non-positive weight {}",
                self.text, self.weight
            )));
        }
        Ok(())
    }
}

impl From<&str> for Criterion {
    fn from(text: &str) -> Self {
        Self::new(text)
    }
}

impl From<String> for Criterion {
    fn from(text: String) -> Self {
        Self::new(text)
    }
}

/// Something worth showing next to a result; none of these abort evaluation.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Diagnostic {
    BackendFailed {
        criterion: String,
        backend: String,
        reason: String,
        timed_out: bool,
        attempts: u32,
    },
    BackendSubstituted {
        criterion: String,
        primary: String,
        substitute: String,
    },
    InconclusiveCriterion {
        criterion: String,
        failures: Vec<BackendFailure>,
    },
}

/// One counted vote, kept for reporting.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BackendVerdict {
    pub backend: String,
    pub satisfied: bool,
    pub confidence: f64,
    pub weight: f64,
    pub rationale: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CriterionResult {
    pub criterion: String,
    pub dimension: Dimension,
    pub weight: f64,
    pub hard: bool,
    pub passed: bool,
    pub score: f64,
    pub inconclusive: bool,
    pub verdicts: Vec<BackendVerdict>,
    pub diagnostics: Vec<Diagnostic>,
}

/// Judges one criterion against one response through a `JudgePanel`.
#[derive(Clone)]
pub struct CriterionEvaluator {
    panel: JudgePanel,
}

impl CriterionEvaluator {
    pub fn new(panel: JudgePanel) -> Self {
        Self { panel }
    }

    /// Looks up the config's backends in `registry`.
    pub fn from_registry(registry: &JudgeRegistry, config: Arc<EvaluationConfig>) -> Result<Self, ConfigError> {
        let backends = registry.resolve(config.backends.as_slice())?;
        Ok(Self::new(JudgePanel::new(backends, config)))
    }

    pub fn config(&self) -> &EvaluationConfig {
        self.panel.config()
    }

    pub async fn evaluate(&self, input: &str, response: &str, criterion: &Criterion) -> CriterionResult {
        let config = self.panel.config();
        let request = JudgeRequest::new(input, response, &criterion.text)
            .with_description(criterion.description.as_deref());

        let outcomes = self.panel.consult(&request).await;

        let mut votes = Vec::new();
        let mut verdicts = Vec::new();
        let mut failures = Vec::new();
        let mut diagnostics = Vec::new();

        for outcome in outcomes {
            match outcome.result {
                Ok(verdict) => {
                    let weight = config.weight_of(&outcome.backend);
                    if let Some(primary) = outcome.substituted_for {
                        diagnostics.push(Diagnostic::BackendSubstituted {
                            criterion: criterion.text.clone(),
                            primary,
                            substitute: outcome.backend.clone(),
                        });
                    }
                    votes.push(Vote::new(outcome.backend.clone(), verdict.satisfied, weight));
                    verdicts.push(BackendVerdict {
                        backend: outcome.backend,
                        satisfied: verdict.satisfied,
                        confidence: verdict.confidence,
                        weight,
                        rationale: verdict.rationale,
                    });
                }
                Err(err) => {
                    let failure = err.to_failure(&outcome.backend);
                    diagnostics.push(Diagnostic::BackendFailed {
                        criterion: criterion.text.clone(),
                        backend: failure.backend.clone(),
                        reason: failure.reason.clone(),
                        timed_out: failure.timed_out,
                        attempts: outcome.attempts,
                    });
                    failures.push(failure);
                }
            }
        }

        let aggregate = aggregate_criterion(&votes, config.consensus_threshold);

        if aggregate.inconclusive {
            let error = JudgeError::AllBackendsUnavailable {
                failures: failures.clone(),
            };
            warn!(criterion = %criterion.text, error = %error, "criterion inconclusive");
            diagnostics.push(Diagnostic::InconclusiveCriterion {
                criterion: criterion.text.clone(),
                failures,
            });
        } else {
            debug!(
                criterion = %criterion.text,
                votes = votes.len(),
                score = aggregate.score,
                passed = aggregate.passed,
                "criterion judged"
            );
        }

        CriterionResult {
            criterion: criterion.text.clone(),
            dimension: criterion.dimension,
            weight: criterion.weight,
            hard: criterion.hard,
            passed: aggregate.passed,
            score: aggregate.score,
            inconclusive: aggregate.inconclusive,
            verdicts,
            diagnostics,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::{resolve, ConfigOverrides, ConfigRequest, PanelStrategy},
        error::BackendErrorKind,
        judge::{
            testing::{Step, StubJudge},
            JudgeBackend,
        },
    };

    fn evaluator(judges: Vec<StubJudge>, overrides: ConfigOverrides) -> CriterionEvaluator {
        let keys: Vec<String> = judges.iter().map(|judge| judge.key().to_string()).collect();
        let registry = judges
            .into_iter()
            .fold(JudgeRegistry::new(), |registry, judge| registry.with(Arc::new(judge)));
        let config = resolve(&ConfigRequest::default().with_overrides(ConfigOverrides {
            backends: Some(keys),
            ..overrides
        }))
        .unwrap();
        CriterionEvaluator::from_registry(&registry, Arc::new(config)).unwrap()
    }

    fn corroborate() -> ConfigOverrides {
        ConfigOverrides {
            panel: Some(PanelStrategy::Corroborate),
            retry_count: Some(0),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn two_of_three_votes_pass_at_067() {
        let evaluator = evaluator(
            vec![
                StubJudge::always("a", Step::Vote(true)),
                StubJudge::always("b", Step::Vote(true)),
                StubJudge::always("c", Step::Vote(false)),
            ],
            corroborate(),
        );

        let result = evaluator
            .evaluate("Hello", "Hi there!", &Criterion::new("Greets the user"))
            .await;

        assert!(result.passed);
        assert!(!result.inconclusive);
        assert_eq!(result.verdicts.len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn all_backends_failing_is_inconclusive() {
        let evaluator = evaluator(
            vec![
                StubJudge::always("a", Step::Fail(BackendErrorKind::Transport)),
                StubJudge::always("b", Step::Hang),
            ],
            corroborate(),
        );

        let result = evaluator
            .evaluate("Hello", "Hi there!", &Criterion::new("Greets the user"))
            .await;

        assert!(!result.passed);
        assert!(result.inconclusive);
        assert_eq!(result.score, 0.0);
        assert!(result.diagnostics.iter().any(|diagnostic| matches!(
            diagnostic,
            Diagnostic::InconclusiveCriterion { failures, .. } if failures.len() == 2
        )));
    }

    #[tokio::test(start_paused = true)]
    async fn timed_out_primary_leaves_only_secondary_votes() {
        let evaluator = evaluator(
            vec![
                StubJudge::always("primary", Step::Hang),
                StubJudge::always("secondary", Step::Vote(true)),
            ],
            corroborate(),
        );

        let result = evaluator
            .evaluate("Hello", "Hi there!", &Criterion::new("Greets the user"))
            .await;

        assert!(result.passed);
        assert_eq!(result.score, 1.0);
        assert_eq!(result.verdicts.len(), 1);
        assert_eq!(result.verdicts[0].backend, "secondary");
        assert!(result.diagnostics.iter().any(|diagnostic| matches!(
            diagnostic,
            Diagnostic::BackendFailed { backend, timed_out: true, .. } if backend == "primary"
        )));
    }

    #[tokio::test(start_paused = true)]
    async fn fallback_records_substitution() {
        let evaluator = evaluator(
            vec![
                StubJudge::always("primary", Step::Fail(BackendErrorKind::Auth)),
                StubJudge::always("secondary", Step::Vote(false)),
            ],
            ConfigOverrides {
                panel: Some(PanelStrategy::Fallback),
                ..Default::default()
            },
        );

        let result = evaluator
            .evaluate("Hello", "Go away", &Criterion::new("Is polite"))
            .await;

        assert!(!result.passed);
        assert!(!result.inconclusive);
        assert!(result.diagnostics.contains(&Diagnostic::BackendSubstituted {
            criterion: "Is polite".to_string(),
            primary: "primary".to_string(),
            substitute: "secondary".to_string(),
        }));
    }

    #[tokio::test]
    async fn trust_weights_apply() {
        let evaluator = evaluator(
            vec![
                StubJudge::always("heavy", Step::Vote(false)),
                StubJudge::always("light", Step::Vote(true)),
            ],
            ConfigOverrides {
                backend_weights: Some([("heavy".to_string(), 3.0)].into_iter().collect()),
                ..corroborate()
            },
        );

        let result = evaluator
            .evaluate("Hello", "Hi", &Criterion::new("Greets the user"))
            .await;

        assert_eq!(result.score, 0.25);
        assert!(!result.passed);
    }

    #[test]
    fn rejects_non_positive_weight() {
        assert!(Criterion::new("ok").with_weight(0.0).validate().is_err());
        assert!(Criterion::new("  ").validate().is_err());
        assert!(Criterion::new("ok").with_weight(0.5).validate().is_ok());
    }
}
