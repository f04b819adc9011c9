use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, warn};

use crate::{
    config::{EvaluationConfig, HardFailPolicy},
    consensus::{iteration_consensus, mean, meets_threshold, weighted_case_score, ScoreDistribution},
    criterion::{Criterion, CriterionEvaluator, CriterionResult, Diagnostic, Dimension},
    error::ConfigError,
    judge::JudgeRegistry,
};

/// One user input and the criteria its response must meet.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Case {
    pub input: String,
    pub criteria: Vec<Criterion>,
}

impl Case {
    pub fn new<I, C>(input: impl Into<String>, criteria: I) -> Self
    where
        I: IntoIterator<Item = C>,
        C: Into<Criterion>,
    {
        Self {
            input: input.into(),
            criteria: criteria.into_iter().map(Into::into).collect(),
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.input.trim().is_empty() {
            return Err(ConfigError::InvalidConfiguration("case input must not be empty".to_string()));
        }
        self.criteria.iter().try_for_each(Criterion::validate)
    }
}

/// One pass over every criterion against the response.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IterationResult {
    /// 1-based.
    pub iteration: u32,
    pub passed: bool,
    pub score: f64,
    /// Every criterion was inconclusive.
    pub inconclusive: bool,
    /// Criteria that failed the case under the hard-fail policy.
    pub hard_failures: Vec<String>,
    pub criteria: Vec<CriterionResult>,
}

/// A criterion's results folded across iterations.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CriterionSummary {
    pub criterion: String,
    pub dimension: Dimension,
    pub weight: f64,
    pub mean_score: f64,
    pub pass_rate: f64,
    pub inconclusive_iterations: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CaseResult {
    pub passed: bool,
    /// Mean case score across iterations.
    pub score: f64,
    pub iteration_pass_rate: f64,
    pub distribution: ScoreDistribution,
    pub iterations: Vec<IterationResult>,
    pub criteria: Vec<CriterionSummary>,
    pub diagnostics: Vec<Diagnostic>,
}

impl CaseResult {
    pub fn failed_criteria(&self) -> Vec<&str> {
        self.criteria
            .iter()
            .filter(|summary| summary.pass_rate < 1.0)
            .map(|summary| summary.criterion.as_str())
            .collect()
    }

    pub fn is_inconclusive(&self) -> bool {
        !self.iterations.is_empty() && self.iterations.iter().all(|iteration| iteration.inconclusive)
    }
}

/// Evaluates a fixed response `iterations` times to expose judge variance.
#[derive(Clone)]
pub struct CaseEvaluator {
    criteria: CriterionEvaluator,
}

impl CaseEvaluator {
    pub fn new(criteria: CriterionEvaluator) -> Self {
        Self { criteria }
    }

    pub fn from_registry(registry: &JudgeRegistry, config: Arc<EvaluationConfig>) -> Result<Self, ConfigError> {
        CriterionEvaluator::from_registry(registry, config).map(Self::new)
    }

    pub fn config(&self) -> &EvaluationConfig {
        self.criteria.config()
    }

    /// Rejects an invalid case (empty input, bad weight) before any judge
    /// is called.
    pub async fn evaluate(&self, case: &Case, response: &str) -> Result<CaseResult, ConfigError> {
        case.validate()?;
        let config = self.criteria.config();
        let mut iterations = Vec::with_capacity(config.iterations as usize);

        for iteration in 1..=config.iterations {
            let result = self.run_iteration(iteration, case, response).await;
            debug!(
                iteration,
                score = result.score,
                passed = result.passed,
                "case iteration finished"
            );
            iterations.push(result);
        }

        let passes: Vec<bool> = iterations.iter().map(|iteration| iteration.passed).collect();
        let scores: Vec<f64> = iterations.iter().map(|iteration| iteration.score).collect();
        let (passed, iteration_pass_rate) = iteration_consensus(&passes, config.iteration_consensus_threshold);
        let distribution = ScoreDistribution::from_scores(&scores).unwrap_or(ScoreDistribution {
            min: 0.0,
            max: 0.0,
            mean: 0.0,
        });

        if !passed && iteration_pass_rate > 0.0 {
            warn!(
                pass_rate = iteration_pass_rate,
                min = distribution.min,
                max = distribution.max,
                "flaky case: iterations disagree"
            );
        }

        Ok(CaseResult {
            passed,
            score: distribution.mean,
            iteration_pass_rate,
            distribution,
            criteria: summarize(case, &iterations),
            diagnostics: iterations
                .iter()
                .flat_map(|iteration| iteration.criteria.iter())
                .flat_map(|result| result.diagnostics.iter().cloned())
                .collect(),
            iterations,
        })
    }

    async fn run_iteration(&self, iteration: u32, case: &Case, response: &str) -> IterationResult {
        let config = self.criteria.config();

        // Criteria run one at a time so diagnostics keep a stable order.
        let mut results = Vec::with_capacity(case.criteria.len());
        for criterion in &case.criteria {
            results.push(self.criteria.evaluate(&case.input, response, criterion).await);
        }

        let score = weighted_case_score(
            &results
                .iter()
                .map(|result| (result.weight, result.score))
                .collect::<Vec<_>>(),
        );
        let inconclusive = !results.is_empty() && results.iter().all(|result| result.inconclusive);
        let hard_failures: Vec<String> = results
            .iter()
            .filter(|result| !result.passed)
            .filter(|result| match config.hard_fail {
                HardFailPolicy::Off => false,
                HardFailPolicy::Marked => result.hard,
                HardFailPolicy::AllCriteria => true,
            })
            .map(|result| result.criterion.clone())
            .collect();

        IterationResult {
            iteration,
            passed: !inconclusive && hard_failures.is_empty() && meets_threshold(score, config.pass_threshold),
            score,
            inconclusive,
            hard_failures,
            criteria: results,
        }
    }
}

fn summarize(case: &Case, iterations: &[IterationResult]) -> Vec<CriterionSummary> {
    case.criteria
        .iter()
        .enumerate()
        .map(|(idx, criterion)| {
            let results: Vec<&CriterionResult> = iterations
                .iter()
                .filter_map(|iteration| iteration.criteria.get(idx))
                .collect();
            let scores: Vec<f64> = results.iter().map(|result| result.score).collect();
            let passes = results.iter().filter(|result| result.passed).count();

            CriterionSummary {
                criterion: criterion.text.clone(),
                dimension: criterion.dimension,
                weight: criterion.weight,
                mean_score: mean(&scores).unwrap_or(0.0),
                pass_rate: if results.is_empty() {
                    0.0
                } else {
                    passes as f64 / results.len() as f64
                },
                inconclusive_iterations: results.iter().filter(|result| result.inconclusive).count() as u32,
            }
        })
        .collect()
}
