//! Backend failover with per-backend circuit breakers.
//!
//! Backends are tried in priority order. A backend whose breaker is open is
//! skipped until its recovery timeout elapses, after which a single probe
//! call decides whether it closes again.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, warn};

use super::{AnalysisBackend, AnalysisRequest, ContractAnalysis};
use crate::error::AnalysisError;

// ---------------------------------------------------------------------------
// Circuit Breaker
// ---------------------------------------------------------------------------

/// State of a circuit breaker.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum CircuitState {
    /// Calls are permitted.
    Closed,
    /// Too many consecutive failures; calls are blocked.
    Open { since: Instant },
    /// One probe call is permitted.
    HalfOpen,
}

/// Trips after `failure_threshold` consecutive failures and half-opens
/// after `recovery_timeout`.
#[derive(Debug)]
pub struct CircuitBreaker {
    state: CircuitState,
    failure_count: usize,
    failure_threshold: usize,
    recovery_timeout: Duration,
}

impl CircuitBreaker {
    pub fn new(failure_threshold: usize, recovery_timeout: Duration) -> Self {
        Self {
            state: CircuitState::Closed,
            failure_count: 0,
            failure_threshold: failure_threshold.max(1),
            recovery_timeout,
        }
    }

    /// Whether a call is currently permitted. An open breaker whose timeout
    /// has elapsed moves to half-open and permits the call.
    pub fn is_call_permitted(&mut self) -> bool {
        match self.state {
            CircuitState::Closed | CircuitState::HalfOpen => true,
            CircuitState::Open { since } => {
                if since.elapsed() >= self.recovery_timeout {
                    debug!("Circuit breaker transitioning to half-open");
                    self.state = CircuitState::HalfOpen;
                    true
                } else {
                    false
                }
            }
        }
    }

    pub fn record_success(&mut self) {
        self.failure_count = 0;
        if self.state == CircuitState::HalfOpen {
            debug!("Circuit breaker closing after successful probe");
        }
        self.state = CircuitState::Closed;
    }

    pub fn record_failure(&mut self) {
        self.failure_count += 1;
        // A failed probe reopens immediately.
        if self.state == CircuitState::HalfOpen || self.failure_count >= self.failure_threshold {
            warn!(
                failures = self.failure_count,
                threshold = self.failure_threshold,
                "Circuit breaker opening"
            );
            self.state = CircuitState::Open {
                since: Instant::now(),
            };
        }
    }

    pub fn state(&self) -> CircuitState {
        self.state
    }

    pub fn failure_count(&self) -> usize {
        self.failure_count
    }
}

// ---------------------------------------------------------------------------
// FallbackAnalyzer
// ---------------------------------------------------------------------------

struct BackendEntry {
    backend: Arc<dyn AnalysisBackend>,
    breaker: Mutex<CircuitBreaker>,
}

/// An analysis backend that delegates to several backends in priority
/// order, skipping those with open breakers.
pub struct FallbackAnalyzer {
    backends: Vec<BackendEntry>,
}

impl FallbackAnalyzer {
    /// Backends are tried in the order given; the first is the primary.
    pub fn new(
        backends: Vec<Arc<dyn AnalysisBackend>>,
        failure_threshold: usize,
        recovery_timeout: Duration,
    ) -> Self {
        let backends = backends
            .into_iter()
            .map(|backend| BackendEntry {
                backend,
                breaker: Mutex::new(CircuitBreaker::new(failure_threshold, recovery_timeout)),
            })
            .collect();
        Self { backends }
    }

    /// Breaker state per backend, in priority order.
    pub async fn circuit_states(&self) -> Vec<(String, CircuitState)> {
        let mut states = Vec::with_capacity(self.backends.len());
        for entry in &self.backends {
            let state = entry.breaker.lock().await.state();
            states.push((entry.backend.name().to_string(), state));
        }
        states
    }
}

#[async_trait]
impl AnalysisBackend for FallbackAnalyzer {
    fn name(&self) -> &str {
        "fallback"
    }

    async fn analyze(&self, request: &AnalysisRequest) -> Result<ContractAnalysis, AnalysisError> {
        let mut last_error = None;

        for (i, entry) in self.backends.iter().enumerate() {
            if !entry.breaker.lock().await.is_call_permitted() {
                debug!(
                    backend_index = i,
                    backend = entry.backend.name(),
                    "Skipping backend, circuit open"
                );
                continue;
            }

            match entry.backend.analyze(request).await {
                Ok(analysis) => {
                    entry.breaker.lock().await.record_success();
                    return Ok(analysis);
                }
                Err(e) => {
                    warn!(
                        backend_index = i,
                        backend = entry.backend.name(),
                        error = %e,
                        "Backend failed, trying next"
                    );
                    entry.breaker.lock().await.record_failure();
                    last_error = Some(e);
                }
            }
        }

        Err(last_error.unwrap_or(AnalysisError::NoBackend {
            message: "all backends failed or circuits open".into(),
        }))
    }
}
