//! The resource governor: admission queue, performance monitor, and the
//! resource manager that ties them to registered model managers.

pub mod manager;
pub mod model;
pub mod monitor;
pub mod queue;

pub use manager::{
    DegradationStatus, GcHook, OptimizationReport, ResourceLimits, ResourceLimitsUpdate,
    ResourceManager, ResourceManagerBuilder, ResourceStatus,
};
pub use model::ModelManager;
pub use monitor::{
    AggregateMetrics, Alert, PerformanceMonitor, PerformanceSummary, RequestRecord, percentile,
};
pub use queue::{QueueItem, QueueStats, QueueTicket, RequestQueue, RequestQueueBuilder};
