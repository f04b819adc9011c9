use serde::Serialize;

use crate::{
    criterion::Diagnostic,
    flow::DimensionScores,
    scenario::{OutcomeDetail, ScenarioOutcome, ScenarioStatus},
};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SuiteReport {
    pub total: usize,
    pub passed: usize,
    pub failed: usize,
    pub errored: usize,
    pub scenarios: Vec<ScenarioReport>,
}

/// A diagnostic located by the flow turn it came from (`None` for single
/// turns).
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LocatedDiagnostic {
    pub turn: Option<usize>,
    #[serde(flatten)]
    pub diagnostic: Diagnostic,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScenarioReport {
    pub id: String,
    pub status: ScenarioStatus,
    pub score: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dimensions: Option<DimensionScores>,
    pub failures: Vec<String>,
    pub errors: Vec<String>,
    pub diagnostics: Vec<LocatedDiagnostic>,
    pub elapsed_ms: u64,
}

impl ScenarioReport {
    pub fn from_outcome(outcome: &ScenarioOutcome) -> Self {
        let mut failures = Vec::new();
        let mut diagnostics = Vec::new();
        let mut dimensions = None;

        match &outcome.detail {
            Some(OutcomeDetail::SingleTurn(single)) => {
                failures.extend(
                    single
                        .result
                        .failed_criteria()
                        .into_iter()
                        .map(|criterion| format!("criterion not met: {criterion}")),
                );
                diagnostics.extend(single.result.diagnostics.iter().cloned().map(|diagnostic| LocatedDiagnostic {
                    turn: None,
                    diagnostic,
                }));
            }
            Some(OutcomeDetail::Flow(flow)) => {
                dimensions = Some(flow.dimensions);
                for turn in &flow.turns {
                    failures.extend(
                        turn.result
                            .failed_criteria()
                            .into_iter()
                            .map(|criterion| format!("turn {}: criterion not met: {criterion}", turn.turn)),
                    );
                    if !turn.missing_tools.is_empty() {
                        failures.push(format!(
                            "turn {}: expected tools not used: {}",
                            turn.turn,
                            turn.missing_tools.join(", ")
                        ));
                    }
                    diagnostics.extend(turn.result.diagnostics.iter().cloned().map(|diagnostic| {
                        LocatedDiagnostic {
                            turn: Some(turn.turn),
                            diagnostic,
                        }
                    }));
                }
            }
            None => {}
        }

        Self {
            id: outcome.id.clone(),
            status: outcome.status,
            score: outcome.score(),
            dimensions,
            failures,
            errors: outcome.error.iter().cloned().collect(),
            diagnostics,
            elapsed_ms: outcome.elapsed.as_millis() as u64,
        }
    }
}

impl SuiteReport {
    pub fn from_outcomes(outcomes: &[ScenarioOutcome]) -> Self {
        let scenarios: Vec<ScenarioReport> = outcomes.iter().map(ScenarioReport::from_outcome).collect();
        let count = |status: ScenarioStatus| scenarios.iter().filter(|report| report.status == status).count();

        Self {
            total: scenarios.len(),
            passed: count(ScenarioStatus::Passed),
            failed: count(ScenarioStatus::Failed),
            errored: count(ScenarioStatus::Errored),
            scenarios,
        }
    }

    pub fn all_passed(&self) -> bool {
        self.total > 0 && self.passed == self.total
    }
}
