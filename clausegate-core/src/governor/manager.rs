//! Memory-pressure control loop around the request queue.
//!
//! Every request passes a pressure check before admission: utilization above
//! the optimization threshold triggers an optimization pass over all
//! registered model managers, and utilization above the degradation
//! threshold halves the queue's concurrency ceiling until a recovery check
//! finds utilization back below the optimization threshold. The reading
//! taken after each request counts as such a check.
//!
//! Recovery checks run on a task owned by the manager's lifecycle: spawned
//! by [`ResourceManager::start`], cancelled by [`ResourceManager::stop`].

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::FutureExt;
use futures::future::join_all;
use serde::Serialize;
use tokio::sync::Notify;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::model::{ModelManager, same_manager};
use super::monitor::{AggregateMetrics, PerformanceMonitor};
use super::queue::{QueueStats, RequestQueue};
use crate::config::GovernorConfig;
use crate::error::{ConfigError, GovernorError};
use crate::events::{EventSink, GovernorEvent, default_sink};

/// Hook invoked after model managers have been optimized, for runtimes
/// that can force a collection (allocator trim, cache flush, ...).
pub type GcHook = Arc<dyn Fn() + Send + Sync>;

/// Degradation state machine: `Normal <-> Degraded`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DegradationStatus {
    Normal,
    Degraded,
}

/// Limits currently enforced by the manager.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResourceLimits {
    pub memory_limit_mb: f64,
    /// The configured ceiling. While degraded the queue runs at half of it.
    pub max_concurrent: usize,
    pub max_processing_time_ms: u64,
}

impl ResourceLimits {
    pub fn max_processing_time(&self) -> Duration {
        Duration::from_millis(self.max_processing_time_ms)
    }
}

/// A partial update to [`ResourceLimits`]; `None` fields are left alone.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResourceLimitsUpdate {
    pub memory_limit_mb: Option<f64>,
    pub max_concurrent: Option<usize>,
    pub max_processing_time: Option<Duration>,
}

/// Outcome of one optimization pass.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OptimizationReport {
    pub optimized: usize,
    pub failed: usize,
    pub elapsed_ms: u64,
}

/// Read-only status snapshot for dashboards and logs.
#[derive(Debug, Clone, Serialize)]
pub struct ResourceStatus {
    pub running: bool,
    pub memory_usage_mb: f64,
    pub memory_utilization: f64,
    pub limits: ResourceLimits,
    pub optimization_threshold: f64,
    pub degradation_threshold: f64,
    pub is_optimizing: bool,
    pub is_degraded: bool,
    pub degradation: DegradationStatus,
    pub last_optimization: Option<DateTime<Utc>>,
    pub queue: QueueStats,
    pub performance: AggregateMetrics,
    pub model_managers: usize,
}

struct ManagerState {
    limits: ResourceLimits,
    degraded: bool,
    memory_usage_mb: f64,
    last_optimization: Option<DateTime<Utc>>,
    model_managers: Vec<Arc<dyn ModelManager>>,
}

struct ManagerInner {
    optimization_threshold: f64,
    degradation_threshold: f64,
    recovery_interval: Duration,
    state: Mutex<ManagerState>,
    optimizing: AtomicBool,
    queue: RequestQueue,
    monitor: PerformanceMonitor,
    recovery_signal: Arc<Notify>,
    lifecycle: Mutex<Option<CancellationToken>>,
    gc_hook: Option<GcHook>,
    sink: Arc<dyn EventSink>,
}

impl ManagerInner {
    fn lock(&self) -> MutexGuard<'_, ManagerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lifecycle(&self) -> MutexGuard<'_, Option<CancellationToken>> {
        self.lifecycle.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Clears the optimizing flag however the pass ends.
struct OptimizingGuard<'a>(&'a AtomicBool);

impl Drop for OptimizingGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Governs admission of work units under memory pressure.
///
/// Cloning is cheap and yields a handle to the same manager.
#[derive(Clone)]
pub struct ResourceManager {
    inner: Arc<ManagerInner>,
}

impl ResourceManager {
    pub fn new(config: GovernorConfig) -> Result<Self, GovernorError> {
        Self::builder(config).build()
    }

    pub fn builder(config: GovernorConfig) -> ResourceManagerBuilder {
        ResourceManagerBuilder {
            config,
            sink: None,
            gc_hook: None,
        }
    }

    // -----------------------------------------------------------------
    // Lifecycle
    // -----------------------------------------------------------------

    /// Start performance monitoring and the recovery-check task.
    /// No-op if already running. Must be called from within a Tokio runtime.
    pub fn start(&self) {
        let mut lifecycle = self.inner.lifecycle();
        if lifecycle.is_some() {
            return;
        }
        let token = CancellationToken::new();
        tokio::spawn(recovery_loop(
            Arc::downgrade(&self.inner),
            Arc::clone(&self.inner.recovery_signal),
            self.inner.recovery_interval,
            token.clone(),
        ));
        *lifecycle = Some(token);
        drop(lifecycle);

        self.inner.monitor.start_monitoring();
        if self.is_degraded() {
            self.inner.recovery_signal.notify_one();
        }
        self.inner.sink.emit(GovernorEvent::ManagerStarted);
    }

    /// Stop monitoring and cancel any pending recovery check.
    /// No-op if not running.
    pub fn stop(&self) {
        let Some(token) = self.inner.lifecycle().take() else {
            return;
        };
        token.cancel();
        self.inner.monitor.stop_monitoring();
        self.inner.sink.emit(GovernorEvent::ManagerStopped);
    }

    pub fn is_running(&self) -> bool {
        self.inner.lifecycle().is_some()
    }

    // -----------------------------------------------------------------
    // Collaborators
    // -----------------------------------------------------------------

    /// Register a model manager. Returns `false` if this exact instance is
    /// already registered.
    pub fn register_model_manager(&self, manager: Arc<dyn ModelManager>) -> bool {
        let mut state = self.inner.lock();
        if state
            .model_managers
            .iter()
            .any(|m| same_manager(m, &manager))
        {
            return false;
        }
        state.model_managers.push(manager);
        true
    }

    /// Unregister a model manager. Returns `false` if it was not registered.
    pub fn unregister_model_manager(&self, manager: &Arc<dyn ModelManager>) -> bool {
        let mut state = self.inner.lock();
        let before = state.model_managers.len();
        state.model_managers.retain(|m| !same_manager(m, manager));
        state.model_managers.len() != before
    }

    pub fn model_manager_count(&self) -> usize {
        self.inner.lock().model_managers.len()
    }

    fn model_managers(&self) -> Vec<Arc<dyn ModelManager>> {
        self.inner.lock().model_managers.clone()
    }

    // -----------------------------------------------------------------
    // Request path
    // -----------------------------------------------------------------

    /// Run a work unit under resource governance.
    ///
    /// Records the request with the performance monitor, checks memory
    /// pressure, and submits the work unit to the queue. A failing work unit
    /// triggers an optimization pass before its error is returned unchanged.
    pub async fn process_request<T, E, F, Fut>(&self, work: F) -> Result<T, E>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
        T: Send + 'static,
        E: From<GovernorError> + Send + 'static,
    {
        let record = self
            .inner
            .monitor
            .record_request_start(Uuid::new_v4().to_string());

        self.check_resource_pressure().await;

        let manager = self.clone();
        let result = self
            .inner
            .queue
            .enqueue(move || async move {
                let outcome = work().await;
                if outcome.is_err() {
                    manager.optimize_resources().await;
                }
                outcome
            })
            .await;

        self.inner.monitor.record_request_end(record, result.is_ok());
        self.settle_after_request();
        result
    }

    /// Post-request reading: a degraded manager whose pressure has already
    /// dropped below the optimization threshold recovers without waiting
    /// for the next scheduled check.
    fn settle_after_request(&self) {
        let utilization = self.current_utilization();
        if self.is_degraded() && utilization < self.inner.optimization_threshold {
            self.disable_graceful_degradation();
        }
    }

    /// React to current memory utilization; returns the utilization read.
    pub async fn check_resource_pressure(&self) -> f64 {
        let usage = self.get_current_memory_usage();
        let utilization = self.utilization_of(usage);
        self.inner.sink.emit(GovernorEvent::ResourcePressure {
            usage_mb: usage,
            utilization,
        });

        if utilization > self.inner.optimization_threshold {
            self.optimize_resources().await;
        }
        if utilization > self.inner.degradation_threshold {
            self.enable_graceful_degradation().await;
        }
        utilization
    }

    // -----------------------------------------------------------------
    // Optimization and degradation
    // -----------------------------------------------------------------

    /// Ask every model manager to shed memory, run the GC hook, and drop
    /// queue history. Returns `None` if a pass is already running.
    pub async fn optimize_resources(&self) -> Option<OptimizationReport> {
        if self
            .inner
            .optimizing
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            self.inner.sink.emit(GovernorEvent::OptimizationSkipped);
            return None;
        }
        let _guard = OptimizingGuard(&self.inner.optimizing);

        let started = Instant::now();
        let managers = self.model_managers();
        self.inner.sink.emit(GovernorEvent::OptimizationStarted {
            model_managers: managers.len(),
        });

        let results = join_all(managers.iter().map(|manager| async move {
            let outcome = AssertUnwindSafe(manager.optimize_memory())
                .catch_unwind()
                .await;
            let error = match outcome {
                Ok(Ok(())) => None,
                Ok(Err(err)) => Some(err.to_string()),
                Err(_) => Some("optimize_memory panicked".to_string()),
            };
            (manager.name().to_string(), error)
        }))
        .await;

        let mut optimized = 0;
        let mut failed = 0;
        for (model, error) in results {
            match error {
                None => optimized += 1,
                Some(error) => {
                    failed += 1;
                    self.inner
                        .sink
                        .emit(GovernorEvent::ModelOptimizationFailed { model, error });
                }
            }
        }

        if let Some(hook) = &self.inner.gc_hook {
            hook();
        }
        self.inner.queue.clear_history();
        self.inner.lock().last_optimization = Some(Utc::now());

        let elapsed = started.elapsed();
        self.inner.sink.emit(GovernorEvent::OptimizationCompleted {
            optimized,
            failed,
            elapsed,
        });
        Some(OptimizationReport {
            optimized,
            failed,
            elapsed_ms: elapsed.as_millis() as u64,
        })
    }

    /// Enter degraded mode: halve the concurrency ceiling (floor 1), run an
    /// optimization pass, and schedule a recovery check. Returns `false` if
    /// already degraded.
    pub async fn enable_graceful_degradation(&self) -> bool {
        let utilization = self.current_utilization();
        let reduced = {
            let mut state = self.inner.lock();
            if state.degraded {
                return false;
            }
            state.degraded = true;
            (state.limits.max_concurrent / 2).max(1)
        };
        self.inner.queue.set_max_concurrent(reduced);
        self.inner.sink.emit(GovernorEvent::DegradationEnabled {
            utilization,
            max_concurrent: reduced,
        });

        self.optimize_resources().await;
        self.inner.recovery_signal.notify_one();
        true
    }

    /// Leave degraded mode and restore the configured ceiling. Returns
    /// `false` if not degraded.
    pub fn disable_graceful_degradation(&self) -> bool {
        let utilization = self.current_utilization();
        let restored = {
            let mut state = self.inner.lock();
            if !state.degraded {
                return false;
            }
            state.degraded = false;
            state.limits.max_concurrent
        };
        self.inner.queue.set_max_concurrent(restored);
        self.inner.sink.emit(GovernorEvent::DegradationDisabled {
            utilization,
            max_concurrent: restored,
        });
        true
    }

    /// Leave degraded mode if utilization has fallen below the optimization
    /// threshold. Returns `true` when the manager is no longer degraded.
    pub fn check_degradation_recovery(&self) -> bool {
        if !self.is_degraded() {
            return true;
        }
        let utilization = self.current_utilization();
        if utilization < self.inner.optimization_threshold {
            self.disable_graceful_degradation();
            true
        } else {
            self.inner
                .sink
                .emit(GovernorEvent::DegradationPersisting { utilization });
            false
        }
    }

    // -----------------------------------------------------------------
    // Limits and inspection
    // -----------------------------------------------------------------

    /// Apply a partial limits update. A new concurrency ceiling reaches the
    /// queue immediately unless degraded, in which case it applies on
    /// recovery.
    pub fn update_resource_limits(
        &self,
        update: ResourceLimitsUpdate,
    ) -> Result<ResourceLimits, GovernorError> {
        let mut problems = Vec::new();
        if let Some(mb) = update.memory_limit_mb {
            if !(mb.is_finite() && mb > 0.0) {
                problems.push(format!("memory_limit_mb must be positive (got {mb})"));
            }
        }
        if update.max_concurrent == Some(0) {
            problems.push("max_concurrent must be at least 1".to_string());
        }
        if update.max_processing_time == Some(Duration::ZERO) {
            problems.push("max_processing_time must be positive".to_string());
        }
        if !problems.is_empty() {
            return Err(ConfigError::Invalid { problems }.into());
        }

        let (limits, apply_ceiling) = {
            let mut state = self.inner.lock();
            if let Some(mb) = update.memory_limit_mb {
                state.limits.memory_limit_mb = mb;
            }
            if let Some(max) = update.max_concurrent {
                state.limits.max_concurrent = max;
            }
            if let Some(time) = update.max_processing_time {
                state.limits.max_processing_time_ms = time.as_millis() as u64;
            }
            let apply = update.max_concurrent.filter(|_| !state.degraded);
            (state.limits.clone(), apply)
        };

        if let Some(max) = apply_ceiling {
            self.inner.queue.set_max_concurrent(max);
        }
        if let Some(time) = update.max_processing_time {
            self.inner.monitor.set_max_processing_time(time);
        }
        self.inner.sink.emit(GovernorEvent::LimitsUpdated {
            memory_limit_mb: limits.memory_limit_mb,
            max_concurrent: limits.max_concurrent,
            max_processing_time: limits.max_processing_time(),
        });
        Ok(limits)
    }

    /// Sum of all model managers' memory gauges, in megabytes.
    pub fn get_current_memory_usage(&self) -> f64 {
        let usage: f64 = self
            .model_managers()
            .iter()
            .map(|m| m.memory_usage())
            .sum();
        self.inner.lock().memory_usage_mb = usage;
        usage
    }

    fn utilization_of(&self, usage_mb: f64) -> f64 {
        let limit = self.inner.lock().limits.memory_limit_mb;
        if limit > 0.0 { usage_mb / limit } else { 0.0 }
    }

    /// Current memory usage divided by the memory limit.
    pub fn current_utilization(&self) -> f64 {
        let usage = self.get_current_memory_usage();
        self.utilization_of(usage)
    }

    /// Below the degradation threshold, monitor healthy, and not degraded.
    pub fn is_healthy(&self) -> bool {
        self.current_utilization() < self.inner.degradation_threshold
            && self.inner.monitor.is_system_healthy()
            && !self.is_degraded()
    }

    pub fn is_degraded(&self) -> bool {
        self.inner.lock().degraded
    }

    pub fn degradation_status(&self) -> DegradationStatus {
        if self.is_degraded() {
            DegradationStatus::Degraded
        } else {
            DegradationStatus::Normal
        }
    }

    pub fn is_optimizing(&self) -> bool {
        self.inner.optimizing.load(Ordering::SeqCst)
    }

    pub fn last_optimization(&self) -> Option<DateTime<Utc>> {
        self.inner.lock().last_optimization
    }

    pub fn limits(&self) -> ResourceLimits {
        self.inner.lock().limits.clone()
    }

    pub fn queue(&self) -> &RequestQueue {
        &self.inner.queue
    }

    pub fn monitor(&self) -> &PerformanceMonitor {
        &self.inner.monitor
    }

    pub fn get_status(&self) -> ResourceStatus {
        let usage = self.get_current_memory_usage();
        let memory_utilization = self.utilization_of(usage);
        let (limits, degraded, last_optimization, model_managers) = {
            let state = self.inner.lock();
            (
                state.limits.clone(),
                state.degraded,
                state.last_optimization,
                state.model_managers.len(),
            )
        };
        ResourceStatus {
            running: self.is_running(),
            memory_usage_mb: usage,
            memory_utilization,
            limits,
            optimization_threshold: self.inner.optimization_threshold,
            degradation_threshold: self.inner.degradation_threshold,
            is_optimizing: self.is_optimizing(),
            is_degraded: degraded,
            degradation: if degraded {
                DegradationStatus::Degraded
            } else {
                DegradationStatus::Normal
            },
            last_optimization,
            queue: self.inner.queue.stats(),
            performance: self.inner.monitor.get_metrics(),
            model_managers,
        }
    }
}

/// Waits for a degradation signal, then re-checks utilization every
/// `interval` until the manager recovers.
async fn recovery_loop(
    inner: Weak<ManagerInner>,
    signal: Arc<Notify>,
    interval: Duration,
    token: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = token.cancelled() => return,
            _ = signal.notified() => {}
        }
        loop {
            tokio::select! {
                _ = token.cancelled() => return,
                _ = tokio::time::sleep(interval) => {}
            }
            let Some(inner) = inner.upgrade() else {
                return;
            };
            if (ResourceManager { inner }).check_degradation_recovery() {
                break;
            }
        }
    }
}

pub struct ResourceManagerBuilder {
    config: GovernorConfig,
    sink: Option<Arc<dyn EventSink>>,
    gc_hook: Option<GcHook>,
}

impl ResourceManagerBuilder {
    pub fn sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn gc_hook(mut self, hook: impl Fn() + Send + Sync + 'static) -> Self {
        self.gc_hook = Some(Arc::new(hook));
        self
    }

    pub fn build(self) -> Result<ResourceManager, GovernorError> {
        self.config.ensure_valid()?;
        let resources = &self.config.resources;
        let sink = self.sink.unwrap_or_else(default_sink);

        let queue = RequestQueue::builder(resources.max_concurrent)
            .request_timeout(resources.request_timeout())
            .max_queue_size(resources.max_queue_size)
            .sink(Arc::clone(&sink))
            .build();
        let monitor = PerformanceMonitor::with_sink(
            self.config.monitoring.clone(),
            resources.max_processing_time(),
            Arc::clone(&sink),
        );

        Ok(ResourceManager {
            inner: Arc::new(ManagerInner {
                optimization_threshold: resources.optimization_threshold,
                degradation_threshold: resources.degradation_threshold,
                recovery_interval: resources.recovery_check_interval(),
                state: Mutex::new(ManagerState {
                    limits: ResourceLimits {
                        memory_limit_mb: resources.memory_limit_mb,
                        max_concurrent: resources.max_concurrent,
                        max_processing_time_ms: resources.max_processing_time_ms,
                    },
                    degraded: false,
                    memory_usage_mb: 0.0,
                    last_optimization: None,
                    model_managers: Vec::new(),
                }),
                optimizing: AtomicBool::new(false),
                queue,
                monitor,
                recovery_signal: Arc::new(Notify::new()),
                lifecycle: Mutex::new(None),
                gc_hook: self.gc_hook,
                sink,
            }),
        })
    }
}
