//! Judge backends: the uniform contract every evaluator provider is driven
//! through, plus the caller-side panel that applies retries, fallback and
//! fan-out across an ordered list of backends.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::Serialize;
use tracing::debug;

use crate::error::{BackendErrorKind, JudgeError};

pub mod llm;
pub mod panel;
pub mod prompt;
pub mod registry;

pub use llm::LlmJudge;
pub use panel::{JudgeOutcome, JudgePanel};
pub use registry::JudgeRegistry;

/// One judge's opinion on one criterion.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Verdict {
    pub satisfied: bool,
    /// Agreement/confidence reported by the judge, clamped to [0, 1].
    pub confidence: f64,
    pub rationale: String,
}

impl Verdict {
    pub fn new(satisfied: bool, confidence: f64, rationale: impl Into<String>) -> Self {
        Self {
            satisfied,
            confidence: if confidence.is_finite() { confidence.clamp(0.0, 1.0) } else { 0.0 },
            rationale: rationale.into(),
        }
    }

    pub fn satisfied(rationale: impl Into<String>) -> Self {
        Self::new(true, 1.0, rationale)
    }

    pub fn not_satisfied(rationale: impl Into<String>) -> Self {
        Self::new(false, 1.0, rationale)
    }
}

/// Everything a judge sees for a single call.
#[derive(Debug, Clone, Copy)]
pub struct JudgeRequest<'a> {
    pub input: &'a str,
    pub response: &'a str,
    pub criterion: &'a str,
    pub description: Option<&'a str>,
}

impl<'a> JudgeRequest<'a> {
    pub fn new(input: &'a str, response: &'a str, criterion: &'a str) -> Self {
        Self {
            input,
            response,
            criterion,
            description: None,
        }
    }

    pub fn with_description(mut self, description: Option<&'a str>) -> Self {
        self.description = description;
        self
    }
}

#[async_trait]
pub trait JudgeBackend: Send + Sync {
    /// Registry key, also used in diagnostics.
    fn key(&self) -> &str;

    /// One call to the external judge. Implementations convert unparsable
    /// replies into `JudgeError::Backend` instead of panicking.
    async fn judge(&self, request: &JudgeRequest<'_>) -> Result<Verdict, JudgeError>;
}

/// Runs one judge call bounded by `timeout`. No retries happen here.
pub async fn evaluate(
    backend: &dyn JudgeBackend,
    request: &JudgeRequest<'_>,
    timeout: Duration,
) -> Result<Verdict, JudgeError> {
    validate_request(backend.key(), request, timeout)?;

    let started = Instant::now();
    let result = match tokio::time::timeout(timeout, backend.judge(request)).await {
        Ok(result) => result,
        Err(_) => Err(JudgeError::Timeout {
            backend: backend.key().to_string(),
            timeout,
        }),
    };

    debug!(
        backend = backend.key(),
        criterion = request.criterion,
        elapsed_ms = started.elapsed().as_millis() as u64,
        ok = result.is_ok(),
        "judge call finished"
    );

    result
}

fn validate_request(backend: &str, request: &JudgeRequest<'_>, timeout: Duration) -> Result<(), JudgeError> {
    let problem = if request.input.trim().is_empty() {
        Some("input text is empty")
    } else if request.response.trim().is_empty() {
        Some("response text is empty")
    } else if request.criterion.trim().is_empty() {
        Some("criterion text is empty")
    } else if timeout.is_zero() {
        Some("timeout must be positive")
    } else {
        None
    };

    match problem {
        Some(message) => Err(JudgeError::backend(backend, BackendErrorKind::InvalidRequest, message)),
        None => Ok(()),
    }
}


#[cfg(test)]
mod tests {
    use super::testing::{Step, StubJudge};
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn hung_backend_times_out() {
        let judge = StubJudge::always("slow", Step::Hang);
        let request = JudgeRequest::new("hi", "hello there", "Response is friendly");

        let error = evaluate(&judge, &request, Duration::from_secs(5)).await.unwrap_err();
        assert!(matches!(error, JudgeError::Timeout { ref backend, .. } if backend == "slow"));
    }

    #[tokio::test]
    async fn empty_response_is_rejected_before_calling() {
        let judge = StubJudge::always("fast", Step::Vote(true));
        let request = JudgeRequest::new("hi", "   ", "Response is friendly");

        let error = evaluate(&judge, &request, Duration::from_secs(5)).await.unwrap_err();
        assert!(matches!(
            error,
            JudgeError::Backend { kind: BackendErrorKind::InvalidRequest, .. }
        ));
        assert_eq!(judge.calls(), 0);
    }

    #[tokio::test]
    async fn zero_timeout_is_rejected() {
        let judge = StubJudge::always("fast", Step::Vote(true));
        let request = JudgeRequest::new("hi", "hello", "Response is friendly");

        assert!(evaluate(&judge, &request, Duration::ZERO).await.is_err());
    }

    #[test]
    fn verdict_confidence_is_clamped() {
        assert_eq!(Verdict::new(true, 1.7, "").confidence, 1.0);
        assert_eq!(Verdict::new(true, f64::NAN, "").confidence, 0.0);
    }
}
