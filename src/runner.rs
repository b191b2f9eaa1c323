use std::collections::VecDeque;
use std::sync::Arc;

use crate::config::ErrorPolicy;
use crate::dispatch::{Adapter, Registry, TextStream};
use crate::error::QuillError;
use crate::logging::InvocationLogger;
use crate::routing::PollingRouter;

/// Result of a step that produced text.
#[derive(Debug, Clone, PartialEq)]
pub struct StepOutcome {
    pub text: String,
    pub backend: String,
    /// Attempts made, including the successful one.
    pub attempts: u32,
}

/// Caller-side retry and failover around the router and the adapters.
///
/// Each attempt resolves a backend (or takes the next entry from the failed
/// backend's failover list), builds a fresh adapter, calls it and closes it.
/// Transient and configuration failures move on to the next attempt; other
/// failures end the step. Attempts are capped by `ErrorPolicy`.
pub struct StepRunner {
    registry: Arc<Registry>,
    router: Arc<PollingRouter>,
    policy: ErrorPolicy,
    logger: Option<Arc<InvocationLogger>>,
}

impl StepRunner {
    pub fn new(registry: Arc<Registry>, router: Arc<PollingRouter>, policy: ErrorPolicy) -> Self {
        Self {
            registry,
            router,
            policy,
            logger: None,
        }
    }

    /// Record calls through `logger`. Ignored when the policy disables logging.
    pub fn with_logger(mut self, logger: Arc<InvocationLogger>) -> Self {
        if self.policy.enable_logging {
            self.logger = Some(logger);
        }
        self
    }

    fn adapter_for(&self, backend: &str, step: &str) -> Result<Adapter, QuillError> {
        let adapter = self.registry.get_adapter_for_step(backend, step)?;
        Ok(match &self.logger {
            Some(logger) => adapter.with_logger(Arc::clone(logger)),
            None => adapter,
        })
    }

    /// Run one non-streaming step.
    pub async fn run_step(&self, step: &str, prompt: &str) -> Result<StepOutcome, QuillError> {
        let mut attempts = Attempts::new(&self.policy);
        loop {
            let Some(backend) = attempts.next_backend(&self.router, step).await? else {
                return Err(attempts.exhausted(step));
            };
            let result = match self.adapter_for(&backend, step) {
                Ok(adapter) => {
                    let result = adapter.invoke(prompt).await;
                    adapter.close();
                    result
                }
                Err(e) => Err(e),
            };
            match result {
                Ok(text) => {
                    return Ok(StepOutcome {
                        text,
                        backend,
                        attempts: attempts.made,
                    });
                }
                Err(e) => attempts.record_failure(step, &backend, e, &self.policy)?,
            }
        }
    }

    /// Open a streaming step. Retries cover opening the stream only; once
    /// fragments flow, a mid-stream failure reaches the consumer as an `Err`
    /// item and the caller decides what to do with the partial text.
    pub async fn stream_step(
        &self,
        step: &str,
        prompt: &str,
    ) -> Result<(String, TextStream), QuillError> {
        let mut attempts = Attempts::new(&self.policy);
        loop {
            let Some(backend) = attempts.next_backend(&self.router, step).await? else {
                return Err(attempts.exhausted(step));
            };
            let result = match self.adapter_for(&backend, step) {
                Ok(adapter) => {
                    // The open stream keeps its own handle on the client.
                    let result = adapter.invoke_stream(prompt).await;
                    adapter.close();
                    result
                }
                Err(e) => Err(e),
            };
            match result {
                Ok(stream) => return Ok((backend, stream)),
                Err(e) => attempts.record_failure(step, &backend, e, &self.policy)?,
            }
        }
    }
}

/// Attempt bookkeeping shared by `run_step` and `stream_step`.
struct Attempts {
    max: u32,
    made: u32,
    failover: VecDeque<String>,
    last_error: Option<QuillError>,
}

impl Attempts {
    fn new(policy: &ErrorPolicy) -> Self {
        Self {
            max: policy.max_attempts(),
            made: 0,
            failover: VecDeque::new(),
            last_error: None,
        }
    }

    /// Next backend to try, or `Ok(None)` once attempts are used up.
    /// `Err` when the router has no candidate at all.
    async fn next_backend(
        &mut self,
        router: &PollingRouter,
        step: &str,
    ) -> Result<Option<String>, QuillError> {
        if self.made >= self.max {
            return Ok(None);
        }
        let backend = match self.failover.pop_front() {
            Some(backend) => backend,
            None => match router.resolve_backend(step).await {
                Some(backend) => backend,
                None => {
                    return Err(self.last_error.take().unwrap_or_else(|| {
                        QuillError::NoBackendAvailable {
                            step: step.to_string(),
                        }
                    }));
                }
            },
        };
        self.made += 1;
        Ok(Some(backend))
    }

    /// Decide whether a failure ends the step. Returns `Err` to stop.
    fn record_failure(
        &mut self,
        step: &str,
        backend: &str,
        err: QuillError,
        policy: &ErrorPolicy,
    ) -> Result<(), QuillError> {
        if !(err.is_retryable() || err.is_configuration()) {
            tracing::warn!(step, backend, "step failed, not retrying: {err}");
            return Err(err);
        }
        tracing::warn!(
            step,
            backend,
            attempt = self.made,
            max = self.max,
            "attempt failed: {err}"
        );
        if self.failover.is_empty()
            && let Some(alternatives) = policy.failover.get(backend)
        {
            self.failover
                .extend(alternatives.iter().filter(|b| b.as_str() != backend).cloned());
        }
        self.last_error = Some(err);
        Ok(())
    }

    fn exhausted(&mut self, step: &str) -> QuillError {
        tracing::error!(step, attempts = self.made, "giving up on step");
        self.last_error
            .take()
            .unwrap_or_else(|| QuillError::NoBackendAvailable {
                step: step.to_string(),
            })
    }
}
