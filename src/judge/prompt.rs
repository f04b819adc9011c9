use handlebars::Handlebars;
use jsonschema::{Draft, JSONSchema};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;
use serde_json::{json, Value};

use super::{JudgeRequest, Verdict};

pub const DEFAULT_TEMPLATE: &str = r#"You are an expert evaluator assessing AI agent responses.

USER INPUT: "{{input}}"
AGENT RESPONSE: "{{response}}"
EVALUATION CRITERION: "{{criterion}}"
{{#if description}}
CRITERION DETAILS: {{description}}
{{/if}}
Evaluate whether the agent response meets the criterion. Consider:
- Semantic meaning, not just exact words
- Overall intent and appropriateness
- Context and tone

Respond in this exact JSON format:
{
    "decision": "YES|NO",
    "reasoning": "Brief explanation of your evaluation"
}

Decision guide:
- YES: The response meets the criterion
- NO: The response does not meet the criterion

You must choose either YES or NO. Be precise and objective in your evaluation."#;

static FENCED_JSON: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)```(?:json)?\s*(\{.*?\})\s*```").expect("fenced json pattern is valid"));

static REPLY_SCHEMA: Lazy<JSONSchema> = Lazy::new(|| {
    let schema = json!({
        "type": "object",
        "required": ["decision"],
        "properties": {
            "decision": { "type": "string", "pattern": "^\\s*([Yy][Ee][Ss]|[Nn][Oo])\\s*$" },
            "reasoning": { "type": "string" },
            "confidence": { "type": "number", "minimum": 0, "maximum": 1 }
        }
    });
    JSONSchema::options()
        .with_draft(Draft::Draft7)
        .compile(&schema)
        .expect("judge reply schema is valid")
});

#[derive(Serialize)]
struct PromptData<'a> {
    input: &'a str,
    response: &'a str,
    criterion: &'a str,
    description: Option<&'a str>,
}

/// Renders the judge prompt. Values are inserted verbatim, not HTML-escaped.
pub fn render(template: &str, request: &JudgeRequest<'_>) -> Result<String, String> {
    let mut hb = Handlebars::new();
    hb.register_escape_fn(handlebars::no_escape);

    let data = PromptData {
        input: request.input,
        response: request.response,
        criterion: request.criterion,
        description: request.description,
    };

    hb.render_template(template, &data).map_err(|err| err.to_string())
}

/// Turns a raw judge reply into a `Verdict`. The error is a human-readable
/// reason the reply was rejected.
pub fn parse_reply(reply: &str) -> Result<Verdict, String> {
    let candidate = extract_json(reply).ok_or_else(|| "reply contains no JSON object".to_string())?;
    let value: Value = serde_json::from_str(&candidate).map_err(|err| format!("reply JSON is invalid: {err}"))?;

    if let Err(errors) = REPLY_SCHEMA.validate(&value) {
        let details: Vec<String> = errors.map(|err| err.to_string()).collect();
        return Err(format!("reply does not match schema: {}", details.join("; ")));
    }

    let satisfied = value["decision"]
        .as_str()
        .map(|decision| decision.trim().eq_ignore_ascii_case("yes"))
        .unwrap_or(false);
    let confidence = value["confidence"].as_f64().unwrap_or(1.0);
    let rationale = value["reasoning"]
        .as_str()
        .unwrap_or("No reasoning provided")
        .to_string();

    Ok(Verdict::new(satisfied, confidence, rationale))
}

fn extract_json(reply: &str) -> Option<String> {
    if let Some(captures) = FENCED_JSON.captures(reply) {
        return captures.get(1).map(|m| m.as_str().to_string());
    }
    first_json_object(reply)
}

// Quote/escape-aware scan for the first complete top-level object.
fn first_json_object(content: &str) -> Option<String> {
    let mut start = None;
    let mut depth: i32 = 0;
    let mut in_str = false;
    let mut escaped = false;

    for (i, b) in content.bytes().enumerate() {
        if in_str {
            if escaped {
                escaped = false;
            } else if b == b'\\' {
                escaped = true;
            } else if b == b'"' {
                in_str = false;
            }
            continue;
        }

        match b {
            b'"' if depth > 0 => in_str = true,
            b'{' => {
                if depth == 0 {
                    start = Some(i);
                }
                depth += 1;
            }
            b'}' if depth > 0 => {
                depth -= 1;
                if depth == 0 {
                    return start.map(|s| content[s..=i].to_string());
                }
            }
            _ => {}
        }
    }

    None
}
