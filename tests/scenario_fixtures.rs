use std::{path::PathBuf, sync::Arc, sync::Mutex};

use async_trait::async_trait;
use urteil::{
    resolve, AgentError, AgentUnderTest, ConfigOverrides, ConfigRequest, ConversationContext, HttpAgent,
    JudgeBackend, JudgeError, JudgeRegistry, JudgeRequest, ScenarioDefinition, ScenarioRunner, ScenarioStatus,
    SuiteReport, Verdict,
};
use urteil::scenario::{load_definitions, OutcomeDetail};

fn fixtures() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("tests/fixtures")
}

/// Satisfied when the response contains the word after "mentions ";
/// any other criterion is satisfied outright.
struct KeywordJudge {
    key: String,
}

#[async_trait]
impl JudgeBackend for KeywordJudge {
    fn key(&self) -> &str {
        &self.key
    }

    async fn judge(&self, request: &JudgeRequest<'_>) -> Result<Verdict, JudgeError> {
        match request.criterion.strip_prefix("mentions ") {
            Some(word) if request.response.to_lowercase().contains(&word.to_lowercase()) => {
                Ok(Verdict::satisfied(format!("found `{word}`")))
            }
            Some(word) => Ok(Verdict::not_satisfied(format!("no `{word}`"))),
            None => Ok(Verdict::satisfied("no keyword to check")),
        }
    }
}

struct ShopAgent {
    remembers: bool,
    tools: Mutex<Vec<String>>,
}

impl ShopAgent {
    fn new(remembers: bool) -> Self {
        Self {
            remembers,
            tools: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl AgentUnderTest for ShopAgent {
    async fn send(&self, input: &str, context: Option<&ConversationContext>) -> Result<String, AgentError> {
        self.tools.lock().unwrap().clear();
        let knows_name = context
            .map(|context| context.turns().iter().any(|turn| turn.input.contains("Ada")))
            .unwrap_or(false);

        let reply = if input.contains("my name is Ada") {
            "Hello Ada, thanks for your order."
        } else if input.contains("name again") {
            if self.remembers && knows_name {
                "You are Ada."
            } else {
                "Sorry, I don't know."
            }
        } else if input.contains("lamp?") {
            self.tools.lock().unwrap().push("order_lookup".to_string());
            "Your lamp has shipped."
        } else {
            "Hello! How can I help?"
        };
        Ok(reply.to_string())
    }

    fn observed_tools(&self) -> Vec<String> {
        self.tools.lock().unwrap().clone()
    }

    fn name(&self) -> &str {
        "shop"
    }
}

fn runner() -> ScenarioRunner {
    let registry = JudgeRegistry::new()
        .with(Arc::new(KeywordJudge {
            key: "keyword-a".to_string(),
        }))
        .with(Arc::new(KeywordJudge {
            key: "keyword-b".to_string(),
        }));
    let config = resolve(&ConfigRequest::default().with_overrides(ConfigOverrides {
        backends: Some(vec!["keyword-a".to_string()]),
        retry_count: Some(0),
        ..Default::default()
    }))
    .unwrap();
    ScenarioRunner::new(Arc::new(registry), Arc::new(config))
}

#[test]
fn loads_fixture_directory_sorted_by_id() {
    let definitions = load_definitions(fixtures()).unwrap();
    let ids: Vec<&str> = definitions.iter().map(|d| d.id.as_str()).collect();

    assert_eq!(ids, vec!["greeting", "support-memory"]);
    assert_eq!(definitions[1].steps.len(), 3);
}

#[test]
fn loads_single_file() {
    let definitions = load_definitions(fixtures().join("greeting.json")).unwrap();
    assert_eq!(definitions.len(), 1);
    assert_eq!(definitions[0].steps[0].criteria.len(), 2);
}

#[tokio::test]
async fn remembering_agent_passes_every_scenario() {
    let definitions = load_definitions(fixtures()).unwrap();
    let outcomes = runner().run_all(&ShopAgent::new(true), &definitions, false).await;
    let report = SuiteReport::from_outcomes(&outcomes);

    assert!(report.all_passed(), "{report:#?}");
    match &outcomes[1].detail {
        Some(OutcomeDetail::Flow(flow)) => {
            assert_eq!(flow.dimensions.context_retention, Some(1.0));
            assert_eq!(flow.dimensions.tool_usage, Some(1.0));
            assert_eq!(flow.dimensions.business_logic, None);
            assert!(flow.turns[2].missing_tools.is_empty());
        }
        other => panic!("expected a flow, got {other:?}"),
    }
}

#[tokio::test]
async fn forgetful_agent_fails_the_context_check() {
    let definitions = load_definitions(fixtures().join("support_flow.yaml")).unwrap();
    let outcome = runner().run(&ShopAgent::new(false), &definitions[0]).await;

    assert_eq!(outcome.status, ScenarioStatus::Failed);
    let flow = match &outcome.detail {
        Some(OutcomeDetail::Flow(flow)) => flow,
        other => panic!("expected a flow, got {other:?}"),
    };
    assert_eq!(flow.steps_executed, 3);
    assert_eq!(flow.dimensions.context_retention, Some(0.0));
    assert!((flow.overall_score - 2.0 / 3.0).abs() < 1e-9);

    // The scenario asks for a corroborating panel, so both judges vote.
    let context_check = &flow.turns[1].result.iterations[0].criteria[0];
    assert_eq!(context_check.verdicts.len(), 2);

    let report = SuiteReport::from_outcomes(std::slice::from_ref(&outcome));
    assert_eq!(report.failed, 1);
    assert!(report.scenarios[0].failures[0].starts_with("turn 2"));
}

#[tokio::test]
async fn http_agent_runs_single_turn_definition() {
    let mut server = mockito::Server::new_async().await;
    let mock = server
        .mock("POST", "/agent")
        .match_body(mockito::Matcher::PartialJson(serde_json::json!({
            "message": "Hello there",
            "context": []
        })))
        .with_status(200)
        .with_body(r#"{"response":"Hello! Nice to meet you."}"#)
        .expect(1)
        .create_async()
        .await;

    let agent = HttpAgent::new(format!("{}/agent", server.url())).unwrap();
    let definition: ScenarioDefinition =
        serde_json::from_slice(&std::fs::read(fixtures().join("greeting.json")).unwrap()).unwrap();

    let outcome = runner().run(&agent, &definition).await;

    mock.assert_async().await;
    assert_eq!(outcome.status, ScenarioStatus::Passed);
    assert!(matches!(outcome.detail, Some(OutcomeDetail::SingleTurn(_))));
}
