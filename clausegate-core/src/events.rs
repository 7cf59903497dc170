//! Structured governor events and the sinks that receive them.
//!
//! Components hold an `Arc<dyn EventSink>` handed to them at construction
//! instead of logging through a process-wide logger. The default
//! [`TracingSink`] forwards to `tracing`; tests substitute [`NoopSink`] or
//! [`CapturingSink`].

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tracing::{debug, info, warn};

/// An observable event emitted by the queue, monitor, or resource manager.
#[derive(Debug, Clone, PartialEq)]
pub enum GovernorEvent {
    RequestQueued {
        request_id: String,
        queued: usize,
    },
    RequestStarted {
        request_id: String,
        waited: Duration,
    },
    RequestCompleted {
        request_id: String,
        elapsed: Duration,
    },
    RequestFailed {
        request_id: String,
        elapsed: Duration,
    },
    RequestTimedOut {
        request_id: String,
        timeout: Duration,
    },
    ConcurrencyChanged {
        from: usize,
        to: usize,
    },
    HistoryCleared {
        completed: usize,
        failed: usize,
    },
    MonitoringStarted {
        interval: Duration,
    },
    MonitoringStopped,
    ErrorRateAlert {
        error_rate: f64,
        threshold: f64,
    },
    SlowResponseAlert {
        average_ms: f64,
        limit_ms: f64,
    },
    ResourcePressure {
        usage_mb: f64,
        utilization: f64,
    },
    OptimizationStarted {
        model_managers: usize,
    },
    OptimizationSkipped,
    OptimizationCompleted {
        optimized: usize,
        failed: usize,
        elapsed: Duration,
    },
    ModelOptimizationFailed {
        model: String,
        error: String,
    },
    DegradationEnabled {
        utilization: f64,
        max_concurrent: usize,
    },
    DegradationPersisting {
        utilization: f64,
    },
    DegradationDisabled {
        utilization: f64,
        max_concurrent: usize,
    },
    LimitsUpdated {
        memory_limit_mb: f64,
        max_concurrent: usize,
        max_processing_time: Duration,
    },
    ManagerStarted,
    ManagerStopped,
}

impl GovernorEvent {
    /// Short stable name, handy for filtering captured events.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::RequestQueued { .. } => "request_queued",
            Self::RequestStarted { .. } => "request_started",
            Self::RequestCompleted { .. } => "request_completed",
            Self::RequestFailed { .. } => "request_failed",
            Self::RequestTimedOut { .. } => "request_timed_out",
            Self::ConcurrencyChanged { .. } => "concurrency_changed",
            Self::HistoryCleared { .. } => "history_cleared",
            Self::MonitoringStarted { .. } => "monitoring_started",
            Self::MonitoringStopped => "monitoring_stopped",
            Self::ErrorRateAlert { .. } => "error_rate_alert",
            Self::SlowResponseAlert { .. } => "slow_response_alert",
            Self::ResourcePressure { .. } => "resource_pressure",
            Self::OptimizationStarted { .. } => "optimization_started",
            Self::OptimizationSkipped => "optimization_skipped",
            Self::OptimizationCompleted { .. } => "optimization_completed",
            Self::ModelOptimizationFailed { .. } => "model_optimization_failed",
            Self::DegradationEnabled { .. } => "degradation_enabled",
            Self::DegradationPersisting { .. } => "degradation_persisting",
            Self::DegradationDisabled { .. } => "degradation_disabled",
            Self::LimitsUpdated { .. } => "limits_updated",
            Self::ManagerStarted => "manager_started",
            Self::ManagerStopped => "manager_stopped",
        }
    }
}

/// Receives governor events. Implementations must not block or panic.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: GovernorEvent);
}

/// Forwards events to `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl EventSink for TracingSink {
    fn emit(&self, event: GovernorEvent) {
        match event {
            GovernorEvent::RequestQueued { request_id, queued } => {
                debug!(%request_id, queued, "Request queued");
            }
            GovernorEvent::RequestStarted { request_id, waited } => {
                debug!(%request_id, waited_ms = waited.as_millis() as u64, "Request started");
            }
            GovernorEvent::RequestCompleted {
                request_id,
                elapsed,
            } => {
                debug!(%request_id, elapsed_ms = elapsed.as_millis() as u64, "Request completed");
            }
            GovernorEvent::RequestFailed {
                request_id,
                elapsed,
            } => {
                debug!(%request_id, elapsed_ms = elapsed.as_millis() as u64, "Request failed");
            }
            GovernorEvent::RequestTimedOut {
                request_id,
                timeout,
            } => {
                warn!(%request_id, timeout_ms = timeout.as_millis() as u64, "Request timed out");
            }
            GovernorEvent::ConcurrencyChanged { from, to } => {
                info!(from, to, "Concurrency ceiling changed");
            }
            GovernorEvent::HistoryCleared { completed, failed } => {
                debug!(completed, failed, "Queue history cleared");
            }
            GovernorEvent::MonitoringStarted { interval } => {
                info!(interval_ms = interval.as_millis() as u64, "Performance monitoring started");
            }
            GovernorEvent::MonitoringStopped => info!("Performance monitoring stopped"),
            GovernorEvent::ErrorRateAlert {
                error_rate,
                threshold,
            } => {
                warn!(error_rate, threshold, "High error rate detected");
            }
            GovernorEvent::SlowResponseAlert {
                average_ms,
                limit_ms,
            } => {
                warn!(average_ms, limit_ms, "Slow response times detected");
            }
            GovernorEvent::ResourcePressure {
                usage_mb,
                utilization,
            } => {
                debug!(usage_mb, utilization, "Resource pressure check");
            }
            GovernorEvent::OptimizationStarted { model_managers } => {
                info!(model_managers, "Resource optimization started");
            }
            GovernorEvent::OptimizationSkipped => {
                debug!("Optimization already in progress, skipping");
            }
            GovernorEvent::OptimizationCompleted {
                optimized,
                failed,
                elapsed,
            } => {
                info!(
                    optimized,
                    failed,
                    elapsed_ms = elapsed.as_millis() as u64,
                    "Resource optimization completed"
                );
            }
            GovernorEvent::ModelOptimizationFailed { model, error } => {
                warn!(%model, %error, "Model memory optimization failed");
            }
            GovernorEvent::DegradationEnabled {
                utilization,
                max_concurrent,
            } => {
                warn!(utilization, max_concurrent, "Graceful degradation enabled");
            }
            GovernorEvent::DegradationPersisting { utilization } => {
                info!(utilization, "Resource pressure persists, staying degraded");
            }
            GovernorEvent::DegradationDisabled {
                utilization,
                max_concurrent,
            } => {
                info!(utilization, max_concurrent, "Graceful degradation disabled");
            }
            GovernorEvent::LimitsUpdated {
                memory_limit_mb,
                max_concurrent,
                max_processing_time,
            } => {
                info!(
                    memory_limit_mb,
                    max_concurrent,
                    max_processing_time_ms = max_processing_time.as_millis() as u64,
                    "Resource limits updated"
                );
            }
            GovernorEvent::ManagerStarted => info!("Resource manager started"),
            GovernorEvent::ManagerStopped => info!("Resource manager stopped"),
        }
    }
}

/// Discards every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopSink;

impl EventSink for NoopSink {
    fn emit(&self, _event: GovernorEvent) {}
}

/// Records events in memory, in emission order.
#[derive(Debug, Default)]
pub struct CapturingSink {
    events: Mutex<Vec<GovernorEvent>>,
}

impl CapturingSink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Snapshot of all captured events.
    pub fn events(&self) -> Vec<GovernorEvent> {
        self.events.lock().map(|e| e.clone()).unwrap_or_default()
    }

    /// Kinds of all captured events, in order.
    pub fn kinds(&self) -> Vec<&'static str> {
        self.events
            .lock()
            .map(|e| e.iter().map(GovernorEvent::kind).collect())
            .unwrap_or_default()
    }

    /// Number of captured events of the given kind.
    pub fn count(&self, kind: &str) -> usize {
        self.kinds().into_iter().filter(|k| *k == kind).count()
    }

    pub fn clear(&self) {
        if let Ok(mut events) = self.events.lock() {
            events.clear();
        }
    }
}

impl EventSink for CapturingSink {
    fn emit(&self, event: GovernorEvent) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event);
        }
    }
}

/// The sink used when none is supplied.
pub fn default_sink() -> Arc<dyn EventSink> {
    Arc::new(TracingSink)
}
