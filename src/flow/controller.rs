use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use serde::Serialize;
use tracing::{debug, info, warn};

use super::{ConversationFlow, StepKind};
use crate::{
    agent::AgentUnderTest,
    case::{Case, CaseEvaluator, CaseResult},
    config::{resolve_on, EvaluationConfig},
    consensus::mean,
    criterion::Dimension,
    error::FlowError,
    history::{ContextTurn, ConversationContext},
    judge::JudgeRegistry,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FlowStatus {
    Passed,
    Failed,
    /// The agent failed; remaining steps never ran.
    Errored,
}

/// Continuous [0, 1] scores per dimension. `None` when no criterion in the
/// flow carried that dimension.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct DimensionScores {
    pub context_retention: Option<f64>,
    pub business_logic: Option<f64>,
    pub tool_usage: Option<f64>,
}

impl DimensionScores {
    pub fn get(&self, dimension: Dimension) -> Option<f64> {
        match dimension {
            Dimension::General => None,
            Dimension::ContextRetention => self.context_retention,
            Dimension::BusinessLogic => self.business_logic,
            Dimension::ToolUsage => self.tool_usage,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FlowTurn {
    /// 1-based.
    pub turn: usize,
    pub kind: StepKind,
    pub input: String,
    pub response: String,
    /// Prior turns the agent was given with this input.
    pub context: Vec<ContextTurn>,
    pub reset: bool,
    pub observed_tools: Vec<String>,
    /// Expected tools the agent did not report using.
    pub missing_tools: Vec<String>,
    pub result: CaseResult,
}

impl FlowTurn {
    pub fn passed(&self) -> bool {
        self.result.passed
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FatalFailure {
    pub turn: usize,
    pub message: String,
}

/// State of one flow execution. Never shared between flows.
#[derive(Debug, Default)]
pub struct FlowState {
    turns: Vec<FlowTurn>,
    context: ConversationContext,
    context_retention: Vec<f64>,
    business_logic: Vec<f64>,
    tool_usage: Vec<f64>,
}

impl FlowState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn context(&self) -> &ConversationContext {
        &self.context
    }

    pub fn turns(&self) -> &[FlowTurn] {
        &self.turns
    }

    pub fn reset_context(&mut self) {
        self.context.clear();
    }

    pub fn record(&mut self, turn: FlowTurn) {
        for summary in &turn.result.criteria {
            let bucket = match summary.dimension {
                Dimension::General => continue,
                Dimension::ContextRetention => &mut self.context_retention,
                Dimension::BusinessLogic => &mut self.business_logic,
                Dimension::ToolUsage => &mut self.tool_usage,
            };
            bucket.push(summary.mean_score);
        }
        self.context.push(turn.input.clone(), turn.response.clone());
        self.turns.push(turn);
    }

    pub fn dimensions(&self) -> DimensionScores {
        DimensionScores {
            context_retention: mean(&self.context_retention),
            business_logic: mean(&self.business_logic),
            tool_usage: mean(&self.tool_usage),
        }
    }

    fn into_result(self, flow: &ConversationFlow, fatal: Option<FatalFailure>, elapsed: Duration) -> FlowResult {
        let dimensions = self.dimensions();
        let scores: Vec<f64> = self.turns.iter().map(|turn| turn.result.score).collect();
        let status = if fatal.is_some() {
            FlowStatus::Errored
        } else if self.turns.len() == flow.steps.len() && self.turns.iter().all(FlowTurn::passed) {
            FlowStatus::Passed
        } else {
            FlowStatus::Failed
        };

        FlowResult {
            flow_id: flow.id.clone(),
            status,
            steps_executed: self.turns.len(),
            overall_score: mean(&scores).unwrap_or(0.0),
            dimensions,
            turns: self.turns,
            fatal,
            elapsed,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FlowResult {
    pub flow_id: String,
    pub status: FlowStatus,
    pub turns: Vec<FlowTurn>,
    pub steps_executed: usize,
    /// Mean of the turn case scores.
    pub overall_score: f64,
    pub dimensions: DimensionScores,
    pub fatal: Option<FatalFailure>,
    pub elapsed: Duration,
}

impl FlowResult {
    pub fn passed(&self) -> bool {
        self.status == FlowStatus::Passed
    }

    /// The fatal agent failure as an error, when the flow errored.
    pub fn error(&self) -> Option<FlowError> {
        self.fatal.as_ref().map(|fatal| FlowError::AgentFatal {
            turn: fatal.turn,
            message: fatal.message.clone(),
        })
    }
}

/// Drives an agent through a `ConversationFlow`, one turn at a time.
#[derive(Clone)]
pub struct FlowController {
    registry: Arc<JudgeRegistry>,
    config: Arc<EvaluationConfig>,
}

impl FlowController {
    pub fn new(registry: Arc<JudgeRegistry>, config: Arc<EvaluationConfig>) -> Self {
        Self { registry, config }
    }

    /// Configuration problems are returned as `Err` before the agent is
    /// contacted. Agent failures end the flow early with
    /// `FlowStatus::Errored` and whatever turns completed.
    pub async fn execute(&self, flow: &ConversationFlow, agent: &dyn AgentUnderTest) -> Result<FlowResult, FlowError> {
        flow.validate()?;
        let evaluators = self.step_evaluators(flow)?;

        info!(flow = %flow.id, steps = flow.steps.len(), agent = agent.name(), "starting flow");
        let started = Instant::now();
        let mut state = FlowState::new();

        if let Err(err) = agent.reset().await {
            return Ok(self.abort(flow, state, 1, err.to_string(), started));
        }

        for (idx, (step, evaluator)) in flow.steps.iter().zip(&evaluators).enumerate() {
            let turn = idx + 1;

            if step.reset_context && turn > 1 {
                state.reset_context();
                if let Err(err) = agent.reset().await {
                    return Ok(self.abort(flow, state, turn, err.to_string(), started));
                }
            }

            let context = state.context().clone();
            let response = match agent.send(&step.input, Some(&context)).await {
                Ok(response) => response,
                Err(err) => return Ok(self.abort(flow, state, turn, err.to_string(), started)),
            };
            let observed_tools = agent.observed_tools();

            let case = Case {
                input: step.input.clone(),
                criteria: step.effective_criteria(),
            };
            let result = evaluator.evaluate(&case, &response).await?;

            let missing_tools = match &step.kind {
                StepKind::ToolUsageCheck { expected_tools } => expected_tools
                    .iter()
                    .filter(|tool| !observed_tools.contains(tool))
                    .cloned()
                    .collect(),
                _ => Vec::new(),
            };
            if !missing_tools.is_empty() {
                warn!(flow = %flow.id, turn, missing = ?missing_tools, "expected tools were not used");
            }

            debug!(
                flow = %flow.id,
                turn,
                kind = step.kind.label(),
                context_turns = context.len(),
                score = result.score,
                passed = result.passed,
                "turn evaluated"
            );

            state.record(FlowTurn {
                turn,
                kind: step.kind.clone(),
                input: step.input.clone(),
                response,
                context: context.turns().to_vec(),
                reset: step.reset_context,
                observed_tools,
                missing_tools,
                result,
            });
        }

        let result = state.into_result(flow, None, started.elapsed());
        info!(
            flow = %flow.id,
            status = ?result.status,
            score = result.overall_score,
            elapsed_ms = result.elapsed.as_millis() as u64,
            "flow finished"
        );
        Ok(result)
    }

    /// Resolves every step's evaluation config up front.
    fn step_evaluators(&self, flow: &ConversationFlow) -> Result<Vec<CaseEvaluator>, FlowError> {
        let flow_config = match &flow.evaluation {
            Some(request) => Arc::new(resolve_on(&self.config, request)?),
            None => self.config.clone(),
        };

        flow.steps
            .iter()
            .map(|step| -> Result<CaseEvaluator, FlowError> {
                let config = match &step.evaluation {
                    Some(request) => Arc::new(resolve_on(&flow_config, request)?),
                    None => flow_config.clone(),
                };
                Ok(CaseEvaluator::from_registry(&self.registry, config)?)
            })
            .collect()
    }

    fn abort(
        &self,
        flow: &ConversationFlow,
        state: FlowState,
        turn: usize,
        message: String,
        started: Instant,
    ) -> FlowResult {
        warn!(flow = %flow.id, turn, error = %message, "agent failed, aborting flow");
        state.into_result(flow, Some(FatalFailure { turn, message }), started.elapsed())
    }
}
