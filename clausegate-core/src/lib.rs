//! # ClauseGate Core
//!
//! Resource governance for contract analysis: a bounded-concurrency request
//! queue, a performance monitor, and a resource manager that reacts to
//! memory pressure by optimizing model managers and degrading gracefully.

pub mod analysis;
pub mod config;
pub mod error;
pub mod events;
pub mod governor;

pub use analysis::{
    AnalysisBackend, AnalysisRequest, ContractAnalysis, DocumentAnalyzer, FallbackAnalyzer,
    SimulatedModel,
};
pub use config::{GovernorConfig, MonitoringConfig, ResourceConfig};
pub use error::{AnalysisError, ConfigError, GovernorError, ModelError, Result};
pub use events::{CapturingSink, EventSink, GovernorEvent, NoopSink, TracingSink};
pub use governor::{
    AggregateMetrics, ModelManager, PerformanceMonitor, QueueStats, RequestQueue,
    ResourceLimitsUpdate, ResourceManager, ResourceStatus,
};
