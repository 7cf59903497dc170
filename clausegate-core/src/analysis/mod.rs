//! Contract analysis routed through the resource governor.
//!
//! The inference call itself lives behind [`AnalysisBackend`]. A
//! [`DocumentAnalyzer`] validates each request and runs the backend call as
//! a governed work unit; [`FallbackAnalyzer`] chains backends (local model
//! first, remote API second) behind per-backend circuit breakers.

pub mod failover;
pub mod simulated;

pub use failover::{CircuitBreaker, CircuitState, FallbackAnalyzer};
pub use simulated::SimulatedModel;

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::{AnalysisError, GovernorError};
use crate::governor::ResourceManager;

/// A contract document submitted for analysis.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisRequest {
    pub document_id: String,
    pub text: String,
}

impl AnalysisRequest {
    pub fn new(document_id: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            document_id: document_id.into(),
            text: text.into(),
        }
    }

    pub fn word_count(&self) -> usize {
        self.text.split_whitespace().count()
    }
}

/// What a backend returned for one document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContractAnalysis {
    pub document_id: String,
    /// Name of the backend that produced this analysis.
    pub backend: String,
    pub summary: String,
    pub word_count: usize,
    #[serde(default)]
    pub findings: Vec<String>,
}

/// An inference backend: a local model or a remote API.
#[async_trait]
pub trait AnalysisBackend: Send + Sync {
    fn name(&self) -> &str;

    async fn analyze(&self, request: &AnalysisRequest) -> Result<ContractAnalysis, AnalysisError>;
}

/// Runs analyses as governed work units.
#[derive(Clone)]
pub struct DocumentAnalyzer {
    manager: ResourceManager,
    backend: Arc<dyn AnalysisBackend>,
}

impl DocumentAnalyzer {
    pub fn new(manager: ResourceManager, backend: Arc<dyn AnalysisBackend>) -> Self {
        Self { manager, backend }
    }

    /// Analyze one document.
    ///
    /// Empty documents are rejected before admission and never reach the
    /// queue or the performance monitor.
    pub async fn analyze(
        &self,
        request: AnalysisRequest,
    ) -> Result<ContractAnalysis, GovernorError> {
        if request.text.trim().is_empty() {
            return Err(GovernorError::InvalidRequest {
                reason: format!("document '{}' has no text", request.document_id),
            });
        }

        let backend = Arc::clone(&self.backend);
        self.manager
            .process_request(move || async move {
                backend
                    .analyze(&request)
                    .await
                    .map_err(GovernorError::from)
            })
            .await
    }

    pub fn manager(&self) -> &ResourceManager {
        &self.manager
    }

    pub fn backend_name(&self) -> &str {
        self.backend.name()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GovernorConfig;
    use crate::events::NoopSink;

    fn analyzer(model: Arc<SimulatedModel>) -> DocumentAnalyzer {
        let manager = ResourceManager::builder(GovernorConfig::default())
            .sink(Arc::new(NoopSink))
            .build()
            .unwrap();
        manager.register_model_manager(model.clone());
        DocumentAnalyzer::new(manager, model)
    }

    #[tokio::test]
    async fn test_empty_document_is_an_admission_error() {
        let model = Arc::new(SimulatedModel::new("local", 100.0));
        let analyzer = analyzer(model.clone());

        let err = analyzer
            .analyze(AnalysisRequest::new("nda-1", "   \n"))
            .await
            .unwrap_err();
        assert!(matches!(err, GovernorError::InvalidRequest { .. }));
        assert_eq!(model.analyze_calls(), 0);
        assert_eq!(analyzer.manager().monitor().get_metrics().total_requests, 0);
        assert_eq!(analyzer.manager().queue().stats().total_enqueued, 0);
    }

    #[tokio::test]
    async fn test_analysis_runs_through_the_governor() {
        let model = Arc::new(SimulatedModel::new("local", 100.0));
        let analyzer = analyzer(model.clone());

        let analysis = analyzer
            .analyze(AnalysisRequest::new(
                "lease-7",
                "The tenant shall pay rent monthly.",
            ))
            .await
            .unwrap();
        assert_eq!(analysis.document_id, "lease-7");
        assert_eq!(analysis.backend, "local");
        assert_eq!(analysis.word_count, 6);
        assert_eq!(analyzer.backend_name(), "local");

        let metrics = analyzer.manager().monitor().get_metrics();
        assert_eq!(metrics.completed_requests, 1);
        assert_eq!(analyzer.manager().queue().stats().completed, 1);
    }

    #[tokio::test]
    async fn test_backend_failure_surfaces_as_analysis_error() {
        let model = Arc::new(SimulatedModel::new("local", 100.0));
        model.set_failing(true);
        let analyzer = analyzer(model.clone());

        let err = analyzer
            .analyze(AnalysisRequest::new("msa-3", "Governing law: Delaware."))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            GovernorError::Analysis(AnalysisError::Backend { .. })
        ));
        // The failure path runs an optimization pass over the model.
        assert_eq!(model.optimize_calls(), 1);
    }
}
