//! In-memory model used by tests and `clausegate simulate`.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;

use super::{AnalysisBackend, AnalysisRequest, ContractAnalysis};
use crate::error::{AnalysisError, ModelError};
use crate::governor::ModelManager;

/// A fake model with a settable memory gauge.
///
/// Each analysis grows the gauge by `growth_per_request_mb`; each
/// `optimize_memory` call releases `release_fraction` of it.
#[derive(Debug)]
pub struct SimulatedModel {
    name: String,
    memory_mb: Mutex<f64>,
    latency: Duration,
    growth_per_request_mb: f64,
    release_fraction: f64,
    failing: AtomicBool,
    analyze_calls: AtomicUsize,
    optimize_calls: AtomicUsize,
}

impl SimulatedModel {
    pub fn new(name: impl Into<String>, memory_mb: f64) -> Self {
        Self {
            name: name.into(),
            memory_mb: Mutex::new(memory_mb),
            latency: Duration::ZERO,
            growth_per_request_mb: 0.0,
            release_fraction: 0.0,
            failing: AtomicBool::new(false),
            analyze_calls: AtomicUsize::new(0),
            optimize_calls: AtomicUsize::new(0),
        }
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    pub fn with_growth_per_request(mut self, mb: f64) -> Self {
        self.growth_per_request_mb = mb;
        self
    }

    /// Fraction of the gauge released per optimization, clamped to [0, 1].
    pub fn with_release_fraction(mut self, fraction: f64) -> Self {
        self.release_fraction = fraction.clamp(0.0, 1.0);
        self
    }

    pub fn set_memory_usage(&self, mb: f64) {
        *self.memory_mb.lock().unwrap_or_else(PoisonError::into_inner) = mb;
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn analyze_calls(&self) -> usize {
        self.analyze_calls.load(Ordering::SeqCst)
    }

    pub fn optimize_calls(&self) -> usize {
        self.optimize_calls.load(Ordering::SeqCst)
    }

    fn gauge(&self) -> f64 {
        *self.memory_mb.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl ModelManager for SimulatedModel {
    fn name(&self) -> &str {
        &self.name
    }

    fn memory_usage(&self) -> f64 {
        self.gauge()
    }

    async fn optimize_memory(&self) -> Result<(), ModelError> {
        self.optimize_calls.fetch_add(1, Ordering::SeqCst);
        let mut memory = self.memory_mb.lock().unwrap_or_else(PoisonError::into_inner);
        *memory *= 1.0 - self.release_fraction;
        Ok(())
    }
}

#[async_trait]
impl AnalysisBackend for SimulatedModel {
    fn name(&self) -> &str {
        &self.name
    }

    async fn analyze(&self, request: &AnalysisRequest) -> Result<ContractAnalysis, AnalysisError> {
        self.analyze_calls.fetch_add(1, Ordering::SeqCst);
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        if self.failing.load(Ordering::SeqCst) {
            return Err(AnalysisError::Backend {
                backend: self.name.clone(),
                message: "simulated inference failure".into(),
            });
        }

        {
            let mut memory = self.memory_mb.lock().unwrap_or_else(PoisonError::into_inner);
            *memory += self.growth_per_request_mb;
        }

        let word_count = request.word_count();
        Ok(ContractAnalysis {
            document_id: request.document_id.clone(),
            backend: self.name.clone(),
            summary: format!("{word_count} words reviewed by {}", self.name),
            word_count,
            findings: Vec::new(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_optimize_releases_fraction_of_gauge() {
        let model = SimulatedModel::new("local", 800.0).with_release_fraction(0.25);
        model.optimize_memory().await.unwrap();
        assert_eq!(model.memory_usage(), 600.0);
        assert_eq!(model.optimize_calls(), 1);
    }

    #[tokio::test]
    async fn test_release_fraction_is_clamped() {
        let model = SimulatedModel::new("local", 100.0).with_release_fraction(3.0);
        model.optimize_memory().await.unwrap();
        assert_eq!(model.memory_usage(), 0.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_analysis_grows_gauge_and_honors_latency() {
        let model = SimulatedModel::new("local", 100.0)
            .with_latency(Duration::from_millis(250))
            .with_growth_per_request(50.0);
        let started = tokio::time::Instant::now();
        let analysis = model
            .analyze(&AnalysisRequest::new("doc", "Payment due in thirty days."))
            .await
            .unwrap();

        assert!(started.elapsed() >= Duration::from_millis(250));
        assert_eq!(analysis.word_count, 5);
        assert_eq!(analysis.summary, "5 words reviewed by local");
        assert_eq!(model.memory_usage(), 150.0);
    }

    #[tokio::test]
    async fn test_failing_switch() {
        let model = SimulatedModel::new("local", 100.0);
        model.set_failing(true);
        let err = model
            .analyze(&AnalysisRequest::new("doc", "text"))
            .await
            .unwrap_err();
        assert!(matches!(err, AnalysisError::Backend { .. }));
        assert_eq!(model.memory_usage(), 100.0);

        model.set_failing(false);
        model.set_memory_usage(42.0);
        assert!(model.analyze(&AnalysisRequest::new("doc", "text")).await.is_ok());
        assert_eq!(model.memory_usage(), 42.0);
        assert_eq!(model.analyze_calls(), 2);
    }
}
