use std::sync::Arc;

use futures_util::future::join_all;
use tracing::{debug, warn};

use super::{evaluate, JudgeBackend, JudgeRequest, Verdict};
use crate::{
    config::{EvaluationConfig, ExecutionStrategy, PanelStrategy},
    error::JudgeError,
};

/// What one backend contributed to one criterion call.
#[derive(Debug, Clone)]
pub struct JudgeOutcome {
    pub backend: String,
    pub result: Result<Verdict, JudgeError>,
    pub attempts: u32,
    /// Set when this backend stood in for a failed primary.
    pub substituted_for: Option<String>,
}

/// The ordered backends of one evaluation config, with its retry, timeout,
/// panel and execution policy applied.
#[derive(Clone)]
pub struct JudgePanel {
    backends: Vec<Arc<dyn JudgeBackend>>,
    config: Arc<EvaluationConfig>,
}

impl JudgePanel {
    pub fn new(backends: Vec<Arc<dyn JudgeBackend>>, config: Arc<EvaluationConfig>) -> Self {
        Self { backends, config }
    }

    pub fn config(&self) -> &EvaluationConfig {
        &self.config
    }

    /// Asks the panel about one criterion. Failures are returned as outcomes,
    /// never as an error.
    pub async fn consult(&self, request: &JudgeRequest<'_>) -> Vec<JudgeOutcome> {
        match self.config.panel {
            PanelStrategy::Fallback => self.fallback(request).await,
            PanelStrategy::Corroborate => self.corroborate(request).await,
        }
    }

    async fn fallback(&self, request: &JudgeRequest<'_>) -> Vec<JudgeOutcome> {
        let mut outcomes = Vec::new();
        let primary = self.backends.first().map(|backend| backend.key().to_string());

        for (idx, backend) in self.backends.iter().enumerate() {
            let mut outcome = self.call(backend.as_ref(), request).await;
            let succeeded = outcome.result.is_ok();

            if succeeded && idx > 0 {
                outcome.substituted_for = primary.clone();
            }
            if let Err(err) = &outcome.result {
                if let Some(next) = self.backends.get(idx + 1) {
                    warn!(
                        backend = backend.key(),
                        next = next.key(),
                        criterion = request.criterion,
                        error = %err,
                        "judge backend failed, falling back"
                    );
                }
            }

            outcomes.push(outcome);
            if succeeded {
                break;
            }
        }

        outcomes
    }

    async fn corroborate(&self, request: &JudgeRequest<'_>) -> Vec<JudgeOutcome> {
        match self.config.execution {
            ExecutionStrategy::Parallel => {
                join_all(self.backends.iter().map(|backend| self.call(backend.as_ref(), request))).await
            }
            ExecutionStrategy::Sequential => {
                let mut outcomes = Vec::with_capacity(self.backends.len());
                for backend in &self.backends {
                    outcomes.push(self.call(backend.as_ref(), request).await);
                }
                outcomes
            }
        }
    }

    /// One backend, retried on retryable failures with exponential backoff.
    async fn call(&self, backend: &dyn JudgeBackend, request: &JudgeRequest<'_>) -> JudgeOutcome {
        let mut attempts = 0u32;

        let result = loop {
            attempts += 1;
            match evaluate(backend, request, self.config.timeout).await {
                Ok(verdict) => break Ok(verdict),
                Err(err) if err.is_retryable() && attempts <= self.config.retry_count => {
                    let delay = self
                        .config
                        .retry_backoff
                        .saturating_mul(2u32.saturating_pow(attempts - 1));
                    debug!(
                        backend = backend.key(),
                        attempt = attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "retrying judge call"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(err) => break Err(err),
            }
        };

        JudgeOutcome {
            backend: backend.key().to_string(),
            result,
            attempts,
            substituted_for: None,
        }
    }
}
