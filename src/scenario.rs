//! Declarative scenario definitions and the runner that executes them against
//! an agent.

use std::{
    fs,
    path::Path,
    sync::Arc,
    time::{Duration, Instant},
};

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::{
    agent::AgentUnderTest,
    case::{Case, CaseEvaluator, CaseResult},
    config::{resolve_on, ConfigRequest, EvaluationConfig},
    criterion::{Criterion, Dimension},
    error::FlowError,
    flow::{ConversationFlow, FlowController, FlowResult, FlowStatus, FlowStep, StepKind},
    judge::JudgeRegistry,
};

fn default_weight() -> f64 {
    1.0
}

/// A criterion as written in a definition file: either the bare text or
/// an object with the optional fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(untagged)]
pub enum CriterionSpec {
    Text(String),
    Detailed {
        criterion: String,
        #[serde(default = "default_weight")]
        weight: f64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        description: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        dimension: Option<Dimension>,
        #[serde(default)]
        hard: bool,
    },
}

impl CriterionSpec {
    fn to_criterion(&self, step_dimension: Option<Dimension>) -> Criterion {
        match self {
            Self::Text(text) => Criterion::new(text.clone()).with_dimension(step_dimension.unwrap_or_default()),
            Self::Detailed {
                criterion,
                weight,
                description,
                dimension,
                hard,
            } => {
                let mut out = Criterion::new(criterion.clone())
                    .with_weight(*weight)
                    .with_dimension(dimension.or(step_dimension).unwrap_or_default());
                if let Some(description) = description {
                    out = out.with_description(description.clone());
                }
                if *hard {
                    out = out.hard();
                }
                out
            }
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum StepKindName {
    #[default]
    Step,
    ContextCheck,
    BusinessLogicCheck,
    ToolUsageCheck,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct StepDefinition {
    pub input: String,
    #[serde(default)]
    pub criteria: Vec<CriterionSpec>,
    #[serde(default)]
    pub kind: StepKindName,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub business_rules: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub expected_tools: Vec<String>,
    /// Default dimension for criteria that do not name one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dimension: Option<Dimension>,
    #[serde(default)]
    pub reset_context: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub evaluation: Option<ConfigRequest>,
}

impl StepDefinition {
    pub fn to_step(&self) -> FlowStep {
        let kind = match self.kind {
            StepKindName::Step => StepKind::Standard,
            StepKindName::ContextCheck => StepKind::ContextCheck,
            StepKindName::BusinessLogicCheck => StepKind::BusinessLogicCheck {
                rules: self.business_rules.clone(),
            },
            StepKindName::ToolUsageCheck => StepKind::ToolUsageCheck {
                expected_tools: self.expected_tools.clone(),
            },
        };

        let mut step = FlowStep::new(
            self.input.clone(),
            self.criteria.iter().map(|spec| spec.to_criterion(self.dimension)),
        )
        .with_kind(kind);
        step.reset_context = self.reset_context;
        step.evaluation = self.evaluation.clone();
        step
    }
}

/// One test scenario as authored in YAML or JSON.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct ScenarioDefinition {
    pub id: String,
    #[serde(default)]
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub evaluation: Option<ConfigRequest>,
    pub steps: Vec<StepDefinition>,
}

impl ScenarioDefinition {
    pub fn to_flow(&self) -> Result<ConversationFlow, FlowError> {
        let mut flow = ConversationFlow::new(self.id.clone()).with_description(self.description.clone());
        flow.evaluation = self.evaluation.clone();
        for step in &self.steps {
            flow = flow.step_with(step.to_step());
        }
        flow.validate()?;
        Ok(flow)
    }

    pub fn json_schema() -> serde_json::Value {
        serde_json::to_value(schemars::schema_for!(ScenarioDefinition)).unwrap_or_default()
    }
}

fn parse_definition(path: &Path, bytes: &[u8]) -> Result<ScenarioDefinition, std::io::Error> {
    let ext = path.extension().and_then(|s| s.to_str()).unwrap_or("");
    let parsed = if ext == "json" {
        serde_json::from_slice(bytes).map_err(|e| e.to_string())
    } else {
        serde_yaml::from_slice(bytes).map_err(|e| e.to_string())
    };
    parsed.map_err(|message| {
        std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("{}: {message}", path.display()),
        )
    })
}

/// Loads one definition file, or every `.yaml`/`.yml`/`.json` file in a
/// directory sorted by scenario id.
pub fn load_definitions(path: impl AsRef<Path>) -> Result<Vec<ScenarioDefinition>, std::io::Error> {
    let path = path.as_ref();
    if !path.is_dir() {
        let bytes = fs::read(path)?;
        return Ok(vec![parse_definition(path, &bytes)?]);
    }

    let mut definitions = Vec::new();
    for entry in fs::read_dir(path)? {
        let p = entry?.path();
        let ext = p.extension().and_then(|s| s.to_str()).unwrap_or("");
        if !matches!(ext, "yaml" | "yml" | "json") {
            continue;
        }
        let bytes = fs::read(&p)?;
        definitions.push(parse_definition(&p, &bytes)?);
    }
    definitions.sort_by(|a, b| a.id.cmp(&b.id));
    Ok(definitions)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ScenarioStatus {
    Passed,
    Failed,
    /// Configuration or agent failure kept the scenario from being judged.
    Errored,
}

impl From<FlowStatus> for ScenarioStatus {
    fn from(status: FlowStatus) -> Self {
        match status {
            FlowStatus::Passed => Self::Passed,
            FlowStatus::Failed => Self::Failed,
            FlowStatus::Errored => Self::Errored,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SingleTurnResult {
    pub input: String,
    pub response: String,
    pub observed_tools: Vec<String>,
    pub result: CaseResult,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutcomeDetail {
    SingleTurn(SingleTurnResult),
    Flow(FlowResult),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScenarioOutcome {
    pub id: String,
    pub description: String,
    pub status: ScenarioStatus,
    pub detail: Option<OutcomeDetail>,
    pub error: Option<String>,
    pub elapsed: Duration,
}

impl ScenarioOutcome {
    fn errored(id: &str, description: &str, error: impl ToString, started: Instant) -> Self {
        let error = error.to_string();
        warn!(scenario = id, error = %error, "scenario errored");
        Self {
            id: id.to_string(),
            description: description.to_string(),
            status: ScenarioStatus::Errored,
            detail: None,
            error: Some(error),
            elapsed: started.elapsed(),
        }
    }

    pub fn passed(&self) -> bool {
        self.status == ScenarioStatus::Passed
    }

    /// Case score for single turns, overall score for flows.
    pub fn score(&self) -> Option<f64> {
        match &self.detail {
            Some(OutcomeDetail::SingleTurn(single)) => Some(single.result.score),
            Some(OutcomeDetail::Flow(flow)) => Some(flow.overall_score),
            None => None,
        }
    }
}

/// Runs scenarios against an agent with a shared registry and base config.
#[derive(Clone)]
pub struct ScenarioRunner {
    registry: Arc<JudgeRegistry>,
    config: Arc<EvaluationConfig>,
}

impl ScenarioRunner {
    pub fn new(registry: Arc<JudgeRegistry>, config: Arc<EvaluationConfig>) -> Self {
        Self { registry, config }
    }

    pub fn config(&self) -> &EvaluationConfig {
        &self.config
    }

    /// Sends one input with no prior context and judges the reply. The
    /// outcome is identified by the input text.
    pub async fn run_single<I, C>(&self, agent: &dyn AgentUnderTest, input: &str, criteria: I) -> ScenarioOutcome
    where
        I: IntoIterator<Item = C>,
        C: Into<Criterion>,
    {
        let started = Instant::now();
        let case = Case::new(input, criteria);
        let evaluator = match case
            .validate()
            .and_then(|_| CaseEvaluator::from_registry(&self.registry, self.config.clone()))
        {
            Ok(evaluator) => evaluator,
            Err(err) => return ScenarioOutcome::errored(input, "", err, started),
        };
        self.single_turn(input, "", agent, &case, &evaluator, started).await
    }

    /// One-step definitions run as a single turn, longer ones as a flow.
    pub async fn run(&self, agent: &dyn AgentUnderTest, definition: &ScenarioDefinition) -> ScenarioOutcome {
        let started = Instant::now();
        let id = definition.id.as_str();
        let description = definition.description.as_str();

        let flow = match definition.to_flow() {
            Ok(flow) => flow,
            Err(err) => return ScenarioOutcome::errored(id, description, err, started),
        };

        if let [step] = flow.steps.as_slice() {
            let evaluator = match self.single_step_evaluator(&flow, step) {
                Ok(evaluator) => evaluator,
                Err(err) => return ScenarioOutcome::errored(id, description, err, started),
            };
            let case = Case {
                input: step.input.clone(),
                criteria: step.effective_criteria(),
            };
            return self.single_turn(id, description, agent, &case, &evaluator, started).await;
        }

        let controller = FlowController::new(self.registry.clone(), self.config.clone());
        match controller.execute(&flow, agent).await {
            Ok(result) => {
                let status = ScenarioStatus::from(result.status);
                let error = result.fatal.as_ref().map(|fatal| format!("turn {}: {}", fatal.turn, fatal.message));
                ScenarioOutcome {
                    id: id.to_string(),
                    description: description.to_string(),
                    status,
                    detail: Some(OutcomeDetail::Flow(result)),
                    error,
                    elapsed: started.elapsed(),
                }
            }
            Err(err) => ScenarioOutcome::errored(id, description, err, started),
        }
    }

    /// Runs definitions in order. With `fail_fast`, stops after the first
    /// scenario that did not pass.
    pub async fn run_all(
        &self,
        agent: &dyn AgentUnderTest,
        definitions: &[ScenarioDefinition],
        fail_fast: bool,
    ) -> Vec<ScenarioOutcome> {
        let mut outcomes = Vec::with_capacity(definitions.len());
        for definition in definitions {
            let outcome = self.run(agent, definition).await;
            info!(
                scenario = %outcome.id,
                status = ?outcome.status,
                score = ?outcome.score(),
                elapsed_ms = outcome.elapsed.as_millis() as u64,
                "scenario finished"
            );
            let stop = fail_fast && !outcome.passed();
            outcomes.push(outcome);
            if stop {
                break;
            }
        }
        outcomes
    }

    fn single_step_evaluator(&self, flow: &ConversationFlow, step: &FlowStep) -> Result<CaseEvaluator, FlowError> {
        let mut config = self.config.clone();
        for request in [&flow.evaluation, &step.evaluation].into_iter().flatten() {
            config = Arc::new(resolve_on(&config, request)?);
        }
        Ok(CaseEvaluator::from_registry(&self.registry, config)?)
    }

    async fn single_turn(
        &self,
        id: &str,
        description: &str,
        agent: &dyn AgentUnderTest,
        case: &Case,
        evaluator: &CaseEvaluator,
        started: Instant,
    ) -> ScenarioOutcome {
        if let Err(err) = agent.reset().await {
            return ScenarioOutcome::errored(id, description, err, started);
        }
        let response = match agent.send(&case.input, None).await {
            Ok(response) => response,
            Err(err) => return ScenarioOutcome::errored(id, description, err, started),
        };
        let observed_tools = agent.observed_tools();
        let result = match evaluator.evaluate(case, &response).await {
            Ok(result) => result,
            Err(err) => return ScenarioOutcome::errored(id, description, err, started),
        };

        ScenarioOutcome {
            id: id.to_string(),
            description: description.to_string(),
            status: if result.passed {
                ScenarioStatus::Passed
            } else {
                ScenarioStatus::Failed
            },
            detail: Some(OutcomeDetail::SingleTurn(SingleTurnResult {
                input: case.input.clone(),
                response,
                observed_tools,
                result,
            })),
            error: None,
            elapsed: started.elapsed(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        agent::FnAgent,
        config::{resolve, ConfigOverrides},
        error::AgentError,
        judge::{
            testing::{Step, StubJudge},
            JudgeBackend,
        },
    };

    const SUPPORT_YAML: &str = r#"
id: support-refund
description: Refund policy is enforced
evaluation:
  iterations: 2
steps:
  - input: "Hi, I bought a laptop 45 days ago"
    criteria:
      - "Acknowledges the purchase"
  - input: "Can I get a refund?"
    kind: business_logic_check
    business_rules: [refund_window_30_days]
    criteria:
      - criterion: "Declines the refund politely"
        weight: 2.0
        hard: true
      - "Mentions the 30 day window"
"#;

    fn runner(judge: StubJudge) -> ScenarioRunner {
        let key = judge.key().to_string();
        let registry = JudgeRegistry::new().with(Arc::new(judge));
        let config = resolve(&ConfigRequest::default().with_overrides(ConfigOverrides {
            backends: Some(vec![key]),
            retry_count: Some(0),
            ..Default::default()
        }))
        .unwrap();
        ScenarioRunner::new(Arc::new(registry), Arc::new(config))
    }

    #[test]
    fn parses_mixed_criterion_forms() {
        let definition: ScenarioDefinition = serde_yaml::from_str(SUPPORT_YAML).unwrap();
        let flow = definition.to_flow().unwrap();

        assert_eq!(flow.steps.len(), 2);
        let criteria = flow.steps[1].effective_criteria();
        assert_eq!(criteria[0].weight, 2.0);
        assert!(criteria[0].hard);
        assert_eq!(criteria[1].dimension, Dimension::BusinessLogic);
        assert_eq!(
            flow.steps[1].kind,
            StepKind::BusinessLogicCheck {
                rules: vec!["refund_window_30_days".to_string()]
            }
        );
        assert_eq!(flow.evaluation.as_ref().and_then(|request| request.overrides.iterations), Some(2));
    }

    #[test]
    fn step_dimension_applies_to_untagged_criteria() {
        let step: StepDefinition = serde_yaml::from_str(
            "input: hi\ndimension: tool_usage\ncriteria:\n  - plain\n  - criterion: tagged\n    dimension: business_logic\n",
        )
        .unwrap();
        let criteria = step.to_step().effective_criteria();

        assert_eq!(criteria[0].dimension, Dimension::ToolUsage);
        assert_eq!(criteria[1].dimension, Dimension::BusinessLogic);
    }

    #[test]
    fn schema_names_the_step_fields() {
        let schema = ScenarioDefinition::json_schema().to_string();
        assert!(schema.contains("expected_tools"));
        assert!(schema.contains("business_rules"));
    }

    #[tokio::test]
    async fn multi_step_definition_runs_as_flow() {
        let runner = runner(StubJudge::always("judge", Step::Vote(true)));
        let agent = FnAgent::from_sync("support", |_, _| Ok("Sorry, refunds close after 30 days.".to_string()));
        let definition: ScenarioDefinition = serde_yaml::from_str(SUPPORT_YAML).unwrap();

        let outcome = runner.run(&agent, &definition).await;

        assert_eq!(outcome.status, ScenarioStatus::Passed);
        match outcome.detail {
            Some(OutcomeDetail::Flow(flow)) => {
                assert_eq!(flow.steps_executed, 2);
                assert_eq!(flow.dimensions.business_logic, Some(1.0));
                assert_eq!(flow.turns[0].result.iterations.len(), 2);
            }
            other => panic!("expected flow detail, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn single_step_definition_runs_single_turn() {
        let runner = runner(StubJudge::always("judge", Step::Vote(false)));
        let agent = FnAgent::from_sync("rude", |_, _| Ok("Go away.".to_string()));
        let definition: ScenarioDefinition =
            serde_yaml::from_str("id: greet\nsteps:\n  - input: Hello\n    criteria: [\"Greets the user\"]\n").unwrap();

        let outcome = runner.run(&agent, &definition).await;

        assert_eq!(outcome.status, ScenarioStatus::Failed);
        assert!(matches!(outcome.detail, Some(OutcomeDetail::SingleTurn(_))));
        assert_eq!(outcome.score(), Some(0.0));
    }

    #[tokio::test]
    async fn agent_failure_is_errored_not_failed() {
        let runner = runner(StubJudge::always("judge", Step::Vote(true)));
        let agent = FnAgent::from_sync("broken", |_, _| Err(AgentError::custom("503 from upstream")));

        let outcome = runner.run_single(&agent, "Hello", ["Greets the user"]).await;

        assert_eq!(outcome.status, ScenarioStatus::Errored);
        assert!(outcome.error.as_deref().unwrap_or_default().contains("503"));
    }

    #[tokio::test]
    async fn unknown_backend_in_override_is_errored() {
        let runner = runner(StubJudge::always("judge", Step::Vote(true)));
        let agent = FnAgent::from_sync("echo", |input, _| Ok(input.to_string()));
        let definition: ScenarioDefinition = serde_yaml::from_str(
            "id: odd\nevaluation:\n  backends: [gemini-pro]\nsteps:\n  - input: Hello\n    criteria: [ok]\n",
        )
        .unwrap();

        let outcome = runner.run(&agent, &definition).await;
        assert_eq!(outcome.status, ScenarioStatus::Errored);
    }

    #[tokio::test]
    async fn fail_fast_stops_after_first_failure() {
        let runner = runner(StubJudge::always("judge", Step::Vote(false)));
        let agent = FnAgent::from_sync("echo", |input, _| Ok(input.to_string()));
        let definitions: Vec<ScenarioDefinition> = ["a", "b"]
            .iter()
            .map(|id| serde_yaml::from_str(&format!("id: {id}\nsteps:\n  - input: hi\n    criteria: [ok]\n")).unwrap())
            .collect();

        assert_eq!(runner.run_all(&agent, &definitions, true).await.len(), 1);
        assert_eq!(runner.run_all(&agent, &definitions, false).await.len(), 2);
    }
}
