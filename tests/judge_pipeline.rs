use std::sync::Arc;

use urteil::{
    providers::scripted::ScriptedProvider, resolve, Case, CaseEvaluator, ConfigOverrides, ConfigRequest,
    Diagnostic, JudgeRegistry, LlmJudge,
};

fn evaluator(provider: Arc<ScriptedProvider>, overrides: ConfigOverrides) -> CaseEvaluator {
    let registry = JudgeRegistry::new().with(Arc::new(LlmJudge::new("claude-sonnet-4", provider)));
    let config = resolve(&ConfigRequest::mode("fast").with_overrides(overrides)).unwrap();
    CaseEvaluator::from_registry(&registry, Arc::new(config)).unwrap()
}

#[tokio::test]
async fn scripted_judge_replies_drive_the_case_result() {
    let provider = Arc::new(ScriptedProvider::from_replies([
        "Sure.\n```json\n{\"decision\": \"YES\", \"reasoning\": \"Greets by name\", \"confidence\": 0.9}\n```",
        "{\"decision\": \"no\", \"reasoning\": \"Never offers help\"}",
    ]));
    let case = Case::new("Hi, I'm Ada", ["Greets the user by name", "Offers further help"]);

    let result = evaluator(provider.clone(), ConfigOverrides::default())
        .evaluate(&case, "Hello Ada.")
        .await
        .unwrap();

    assert!(!result.passed);
    assert!((result.score - 0.5).abs() < 1e-9);
    assert_eq!(result.failed_criteria(), vec!["Offers further help"]);

    let verdicts = &result.iterations[0].criteria[0].verdicts;
    assert_eq!(verdicts[0].confidence, 0.9);
    assert_eq!(verdicts[0].rationale, "Greets by name");

    let requests = provider.requests();
    assert_eq!(requests.len(), 2);
    let prompt = requests[0].messages.last().and_then(|m| m.text()).unwrap_or_default();
    assert!(prompt.contains("Greets the user by name"));
    assert!(prompt.contains("Hello Ada."));
}

#[tokio::test]
async fn unparsable_reply_leaves_the_criterion_inconclusive() {
    let provider = Arc::new(ScriptedProvider::from_replies(["I think it is fine."]));
    let case = Case::new("Hi", ["Greets the user"]);

    let result = evaluator(
        provider,
        ConfigOverrides {
            retry_count: Some(0),
            ..Default::default()
        },
    )
    .evaluate(&case, "Hello!")
    .await
    .unwrap();

    assert!(!result.passed);
    assert!(result.is_inconclusive());
    assert!(result
        .diagnostics
        .iter()
        .any(|d| matches!(d, Diagnostic::InconclusiveCriterion { criterion, .. } if criterion == "Greets the user")));
}
