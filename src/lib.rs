pub mod agent;
pub mod case;
pub mod config;
pub mod consensus;
pub mod criterion;
pub mod error;
pub mod flow;
pub mod history;
pub mod judge;
pub mod providers;
pub mod report;
pub mod scenario;
pub mod types;

pub use agent::{AgentUnderTest, FnAgent, HttpAgent, HttpAgentConfig, ModelAgent};
pub use case::{Case, CaseEvaluator, CaseResult, CriterionSummary, IterationResult};
pub use config::{
    resolve, resolve_mode, resolve_on, ConfigOverrides, ConfigRequest, EvaluationConfig, EvaluationMode,
    ExecutionStrategy, HardFailPolicy, PanelStrategy,
};
pub use consensus::{meets_threshold, ScoreDistribution};
pub use criterion::{BackendVerdict, Criterion, CriterionEvaluator, CriterionResult, Diagnostic, Dimension};
pub use error::{AgentError, BackendErrorKind, BackendFailure, ConfigError, FlowError, JudgeError, LLMError};
pub use flow::{
    ConversationFlow, DimensionScores, FatalFailure, FlowController, FlowResult, FlowState, FlowStatus, FlowStep,
    FlowTurn, StepKind,
};
pub use history::{ContextTurn, ConversationContext};
pub use judge::{JudgeBackend, JudgeRegistry, JudgeRequest, LlmJudge, Verdict};
pub use providers::LLMProvider;
pub use report::{ScenarioReport, SuiteReport};
pub use scenario::{load_definitions, ScenarioDefinition, ScenarioOutcome, ScenarioRunner, ScenarioStatus};
pub use types::{ChatMessage, CompletionRequest, CompletionResponse, MessageRole, TokenUsage};
pub use schemars::JsonSchema;
