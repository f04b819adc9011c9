//! Multi-turn conversation flows: what each step sends and how its criteria
//! count towards the flow's dimension scores.

use serde::Serialize;

use crate::{
    config::ConfigRequest,
    criterion::{Criterion, Dimension},
    error::FlowError,
};

pub mod controller;

pub use controller::{DimensionScores, FatalFailure, FlowController, FlowResult, FlowState, FlowStatus, FlowTurn};

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StepKind {
    Standard,
    /// Re-asks about earlier turns to check memory.
    ContextCheck,
    /// Rule identifiers are opaque and only reported.
    BusinessLogicCheck { rules: Vec<String> },
    /// Expected tools are compared with what the agent reports using.
    ToolUsageCheck { expected_tools: Vec<String> },
}

impl StepKind {
    /// Dimension forced onto every criterion of this step, if any.
    pub fn forced_dimension(&self) -> Option<Dimension> {
        match self {
            Self::Standard => None,
            Self::ContextCheck => Some(Dimension::ContextRetention),
            Self::BusinessLogicCheck { .. } => Some(Dimension::BusinessLogic),
            Self::ToolUsageCheck { .. } => Some(Dimension::ToolUsage),
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::Standard => "step",
            Self::ContextCheck => "context_check",
            Self::BusinessLogicCheck { .. } => "business_logic_check",
            Self::ToolUsageCheck { .. } => "tool_usage_check",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FlowStep {
    pub input: String,
    pub criteria: Vec<Criterion>,
    pub kind: StepKind,
    /// Start a fresh context here and reset the agent first.
    pub reset_context: bool,
    /// Tag untagged criteria of a standard step as context retention.
    pub expect_context_retention: bool,
    pub evaluation: Option<ConfigRequest>,
}

impl FlowStep {
    pub fn new<I, C>(input: impl Into<String>, criteria: I) -> Self
    where
        I: IntoIterator<Item = C>,
        C: Into<Criterion>,
    {
        Self {
            input: input.into(),
            criteria: criteria.into_iter().map(Into::into).collect(),
            kind: StepKind::Standard,
            reset_context: false,
            expect_context_retention: false,
            evaluation: None,
        }
    }

    pub fn context_check<I, C>(input: impl Into<String>, criteria: I) -> Self
    where
        I: IntoIterator<Item = C>,
        C: Into<Criterion>,
    {
        Self::new(input, criteria).with_kind(StepKind::ContextCheck)
    }

    pub fn business_logic_check<I, C, R, S>(input: impl Into<String>, rules: R, criteria: I) -> Self
    where
        I: IntoIterator<Item = C>,
        C: Into<Criterion>,
        R: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::new(input, criteria).with_kind(StepKind::BusinessLogicCheck {
            rules: rules.into_iter().map(Into::into).collect(),
        })
    }

    pub fn tool_usage_check<I, C, T, S>(input: impl Into<String>, tools: T, criteria: I) -> Self
    where
        I: IntoIterator<Item = C>,
        C: Into<Criterion>,
        T: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::new(input, criteria).with_kind(StepKind::ToolUsageCheck {
            expected_tools: tools.into_iter().map(Into::into).collect(),
        })
    }

    pub fn with_kind(mut self, kind: StepKind) -> Self {
        self.kind = kind;
        self
    }

    pub fn expect_context_retention(mut self) -> Self {
        self.expect_context_retention = true;
        self
    }

    pub fn reset_context(mut self) -> Self {
        self.reset_context = true;
        self
    }

    pub fn with_evaluation(mut self, request: ConfigRequest) -> Self {
        self.evaluation = Some(request);
        self
    }

    /// Criteria with the step's dimension tagging applied.
    pub fn effective_criteria(&self) -> Vec<Criterion> {
        let forced = self.kind.forced_dimension();
        self.criteria
            .iter()
            .cloned()
            .map(|criterion| match forced {
                Some(dimension) => criterion.with_dimension(dimension),
                None if self.expect_context_retention && criterion.dimension == Dimension::General => {
                    criterion.with_dimension(Dimension::ContextRetention)
                }
                None => criterion,
            })
            .collect()
    }
}

/// An ordered multi-turn scenario.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConversationFlow {
    pub id: String,
    pub description: String,
    pub steps: Vec<FlowStep>,
    /// Applied on top of the controller's config for every step.
    pub evaluation: Option<ConfigRequest>,
}

impl ConversationFlow {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            description: String::new(),
            steps: Vec::new(),
            evaluation: None,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_evaluation(mut self, request: ConfigRequest) -> Self {
        self.evaluation = Some(request);
        self
    }

    pub fn step<I, C>(self, input: impl Into<String>, criteria: I) -> Self
    where
        I: IntoIterator<Item = C>,
        C: Into<Criterion>,
    {
        self.step_with(FlowStep::new(input, criteria))
    }

    pub fn step_with(mut self, step: FlowStep) -> Self {
        self.steps.push(step);
        self
    }

    pub fn context_check<I, C>(self, input: impl Into<String>, criteria: I) -> Self
    where
        I: IntoIterator<Item = C>,
        C: Into<Criterion>,
    {
        self.step_with(FlowStep::context_check(input, criteria))
    }

    pub fn business_logic_check<I, C, R, S>(self, input: impl Into<String>, rules: R, criteria: I) -> Self
    where
        I: IntoIterator<Item = C>,
        C: Into<Criterion>,
        R: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.step_with(FlowStep::business_logic_check(input, rules, criteria))
    }

    pub fn tool_usage_check<I, C, T, S>(self, input: impl Into<String>, tools: T, criteria: I) -> Self
    where
        I: IntoIterator<Item = C>,
        C: Into<Criterion>,
        T: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.step_with(FlowStep::tool_usage_check(input, tools, criteria))
    }

    pub fn validate(&self) -> Result<(), FlowError> {
        if self.id.trim().is_empty() {
            return Err(FlowError::Definition("flow id must not be empty".to_string()));
        }
        if self.steps.is_empty() {
            return Err(FlowError::Definition(format!("flow `{}` has no steps", self.id)));
        }
        for (idx, step) in self.steps.iter().enumerate() {
            if step.input.trim().is_empty() {
                return Err(FlowError::Definition(format!(
                    "flow `{}` step {} has empty input",
                    self.id,
                    idx + 1
                )));
            }
            for criterion in &step.criteria {
                criterion.validate()?;
            }
        }
        Ok(())
    }
}
