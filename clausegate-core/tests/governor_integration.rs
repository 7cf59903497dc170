//! End-to-end behavior of the queue, monitor, and resource manager.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

use async_trait::async_trait;
use clausegate_core::config::{GovernorConfig, MonitoringConfig};
use clausegate_core::governor::{ModelManager, PerformanceMonitor, RequestQueue, ResourceManager};
use clausegate_core::{CapturingSink, GovernorError, ModelError, NoopSink, SimulatedModel};
use futures::future::join_all;
use pretty_assertions::assert_eq;

fn config(memory_limit_mb: f64, max_concurrent: usize) -> GovernorConfig {
    let mut config = GovernorConfig::default();
    config.resources.memory_limit_mb = memory_limit_mb;
    config.resources.max_concurrent = max_concurrent;
    config.resources.optimization_threshold = 0.8;
    config.resources.degradation_threshold = 0.9;
    config
}

fn quiet_manager(config: GovernorConfig) -> ResourceManager {
    ResourceManager::builder(config)
        .sink(Arc::new(NoopSink))
        .build()
        .unwrap()
}

// ---------------------------------------------------------------------------
// Queue ordering and bounds
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn fifo_completion_with_single_slot() {
    let queue = RequestQueue::new(1);
    let completions = Arc::new(Mutex::new(Vec::new()));

    let tickets: Vec<_> = (0..10u64)
        .map(|i| {
            let completions = Arc::clone(&completions);
            queue
                .submit(move || async move {
                    // Reverse latencies: without FIFO the last would finish first.
                    tokio::time::sleep(Duration::from_millis(100 - i * 10)).await;
                    completions.lock().unwrap().push(i);
                    Ok::<_, GovernorError>(i)
                })
                .unwrap()
        })
        .collect();

    for ticket in tickets {
        ticket.wait().await.unwrap();
    }
    assert_eq!(*completions.lock().unwrap(), (0..10).collect::<Vec<_>>());
}

#[tokio::test(start_paused = true)]
async fn two_slots_five_staggered_units() {
    let queue = RequestQueue::new(2);
    let active = Arc::new(AtomicUsize::new(0));
    let overlap = Arc::new(AtomicUsize::new(0));

    let units = [10u64, 20, 30, 40, 50].into_iter().map(|delay| {
        let queue = queue.clone();
        let active = Arc::clone(&active);
        let overlap = Arc::clone(&overlap);
        async move {
            queue
                .enqueue(move || async move {
                    let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                    overlap.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(delay)).await;
                    active.fetch_sub(1, Ordering::SeqCst);
                    Ok::<_, GovernorError>(delay)
                })
                .await
        }
    });

    let values: Vec<u64> = join_all(units)
        .await
        .into_iter()
        .map(Result::unwrap)
        .collect();

    assert_eq!(values, vec![10, 20, 30, 40, 50]);
    assert_eq!(overlap.load(Ordering::SeqCst), 2);
    assert_eq!(queue.stats().peak_processing, 2);
    assert_eq!(queue.stats().completed, 5);
}

// ---------------------------------------------------------------------------
// Monitor accounting
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn monitor_reference_scenario() {
    let monitor = PerformanceMonitor::with_sink(
        MonitoringConfig::default(),
        Duration::from_secs(30),
        Arc::new(NoopSink),
    );

    for (ms, success) in [(100, true), (200, true), (300, true), (50, false)] {
        let record = monitor.record_request_start(format!("r{ms}"));
        tokio::time::advance(Duration::from_millis(ms)).await;
        monitor.record_request_end(record, success);
    }

    let metrics = monitor.get_metrics();
    assert_eq!(metrics.error_rate, 0.25);
    assert_eq!(metrics.average_response_time_ms, 162.5);
    assert_eq!(metrics.total_requests, 4);
    assert_eq!(metrics.in_progress_requests, 0);
}

#[tokio::test(start_paused = true)]
async fn monitor_counters_conserved_while_requests_in_flight() {
    let manager = quiet_manager(config(1000.0, 2));

    let handles: Vec<_> = (0..4)
        .map(|i| {
            let manager = manager.clone();
            tokio::spawn(async move {
                manager
                    .process_request(move || async move {
                        tokio::time::sleep(Duration::from_millis(100)).await;
                        if i == 3 {
                            Err(GovernorError::InvalidRequest {
                                reason: "unreadable scan".into(),
                            })
                        } else {
                            Ok(i)
                        }
                    })
                    .await
            })
        })
        .collect();

    tokio::time::sleep(Duration::from_millis(10)).await;
    let metrics = manager.monitor().get_metrics();
    assert_eq!(metrics.total_requests, 4);
    assert_eq!(
        metrics.total_requests,
        metrics.completed_requests + metrics.failed_requests + metrics.in_progress_requests
    );
    let stats = manager.queue().stats();
    assert_eq!(stats.processing, 2);
    assert_eq!(stats.queued, 2);

    for handle in handles {
        let _ = handle.await.unwrap();
    }
    let metrics = manager.monitor().get_metrics();
    assert_eq!(metrics.completed_requests, 3);
    assert_eq!(metrics.failed_requests, 1);
    assert_eq!(metrics.in_progress_requests, 0);
}

#[tokio::test]
async fn monitoring_start_stop_is_idempotent() {
    let sink = CapturingSink::new();
    let monitor =
        PerformanceMonitor::with_sink(MonitoringConfig::default(), Duration::from_secs(30), sink.clone());

    monitor.stop_monitoring();
    assert!(sink.events().is_empty());

    monitor.start_monitoring();
    monitor.start_monitoring();
    assert!(monitor.is_monitoring());
    assert_eq!(sink.count("monitoring_started"), 1);

    monitor.stop_monitoring();
    monitor.stop_monitoring();
    assert!(!monitor.is_monitoring());
    assert_eq!(sink.count("monitoring_stopped"), 1);
}

// ---------------------------------------------------------------------------
// Resource manager control loop
// ---------------------------------------------------------------------------

/// Observes the manager's optimizing flag from inside `optimize_memory`.
struct FlagProbe {
    manager: OnceLock<ResourceManager>,
    saw_optimizing: AtomicBool,
}

#[async_trait]
impl ModelManager for FlagProbe {
    fn name(&self) -> &str {
        "probe"
    }

    fn memory_usage(&self) -> f64 {
        950.0
    }

    async fn optimize_memory(&self) -> Result<(), ModelError> {
        if let Some(manager) = self.manager.get() {
            if manager.is_optimizing() {
                self.saw_optimizing.store(true, Ordering::SeqCst);
            }
        }
        Ok(())
    }
}

#[tokio::test]
async fn critical_pressure_optimizes_then_degrades() {
    let manager = quiet_manager(config(1000.0, 4));
    let probe = Arc::new(FlagProbe {
        manager: OnceLock::new(),
        saw_optimizing: AtomicBool::new(false),
    });
    let _ = probe.manager.set(manager.clone());
    manager.register_model_manager(probe.clone());

    let result: Result<&str, GovernorError> =
        manager.process_request(|| async { Ok("done") }).await;

    assert_eq!(result.unwrap(), "done");
    assert!(probe.saw_optimizing.load(Ordering::SeqCst));
    assert!(!manager.is_optimizing());
    assert!(manager.is_degraded());
    assert_eq!(manager.queue().max_concurrent(), 2);
    assert!(manager.last_optimization().is_some());
}

#[tokio::test(start_paused = true)]
async fn degradation_hysteresis_restores_ceiling() {
    let mut cfg = config(1000.0, 6);
    cfg.resources.recovery_check_interval_ms = 30_000;
    let sink = CapturingSink::new();
    let manager = ResourceManager::builder(cfg)
        .sink(sink.clone())
        .build()
        .unwrap();
    let model = Arc::new(SimulatedModel::new("local", 920.0));
    manager.register_model_manager(model.clone());
    manager.start();

    let _: Result<(), GovernorError> = manager.process_request(|| async { Ok(()) }).await;
    assert!(manager.is_degraded());
    assert_eq!(manager.queue().max_concurrent(), 3);

    // 850 is under the degradation threshold but still above optimization.
    model.set_memory_usage(850.0);
    tokio::time::sleep(Duration::from_secs(31)).await;
    assert!(manager.is_degraded());
    assert_eq!(manager.queue().max_concurrent(), 3);

    model.set_memory_usage(400.0);
    tokio::time::sleep(Duration::from_secs(30)).await;
    assert!(!manager.is_degraded());
    assert_eq!(manager.queue().max_concurrent(), 6);
    assert_eq!(sink.count("degradation_persisting"), 1);
    assert_eq!(sink.count("degradation_disabled"), 1);

    // A second episode is picked up by the same recovery task.
    model.set_memory_usage(990.0);
    let _: Result<(), GovernorError> = manager.process_request(|| async { Ok(()) }).await;
    assert!(manager.is_degraded());
    model.set_memory_usage(100.0);
    tokio::time::sleep(Duration::from_secs(31)).await;
    assert!(!manager.is_degraded());

    manager.stop();
}

struct BrokenModel {
    calls: AtomicUsize,
    panics: bool,
}

#[async_trait]
impl ModelManager for BrokenModel {
    fn name(&self) -> &str {
        "broken"
    }

    fn memory_usage(&self) -> f64 {
        0.0
    }

    async fn optimize_memory(&self) -> Result<(), ModelError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.panics {
            panic!("allocator poisoned");
        }
        Err(ModelError::NotLoaded {
            model: "broken".into(),
        })
    }
}

#[tokio::test]
async fn collaborator_failures_are_isolated() {
    let sink = CapturingSink::new();
    let manager = ResourceManager::builder(config(1000.0, 2))
        .sink(sink.clone())
        .build()
        .unwrap();
    let erroring = Arc::new(BrokenModel {
        calls: AtomicUsize::new(0),
        panics: false,
    });
    let panicking = Arc::new(BrokenModel {
        calls: AtomicUsize::new(0),
        panics: true,
    });
    let healthy = Arc::new(SimulatedModel::new("healthy", 10.0));
    manager.register_model_manager(erroring.clone());
    manager.register_model_manager(panicking.clone());
    manager.register_model_manager(healthy.clone());

    let report = manager.optimize_resources().await.unwrap();

    assert_eq!(report.optimized, 1);
    assert_eq!(report.failed, 2);
    assert_eq!(erroring.calls.load(Ordering::SeqCst), 1);
    assert_eq!(panicking.calls.load(Ordering::SeqCst), 1);
    assert_eq!(healthy.optimize_calls(), 1);
    assert_eq!(sink.count("model_optimization_failed"), 2);
    assert!(!manager.is_optimizing());
}

struct SlowModel;

#[async_trait]
impl ModelManager for SlowModel {
    fn memory_usage(&self) -> f64 {
        0.0
    }

    async fn optimize_memory(&self) -> Result<(), ModelError> {
        tokio::time::sleep(Duration::from_millis(100)).await;
        Ok(())
    }
}

#[tokio::test(start_paused = true)]
async fn concurrent_optimization_is_skipped() {
    let sink = CapturingSink::new();
    let manager = ResourceManager::builder(config(1000.0, 2))
        .sink(sink.clone())
        .build()
        .unwrap();
    manager.register_model_manager(Arc::new(SlowModel));

    let (first, second) = tokio::join!(manager.optimize_resources(), manager.optimize_resources());

    assert!(first.is_some());
    assert!(second.is_none());
    assert_eq!(sink.count("optimization_skipped"), 1);
    assert_eq!(sink.count("optimization_completed"), 1);
    assert!(manager.optimize_resources().await.is_some());
}

#[tokio::test(start_paused = true)]
async fn request_deadline_fails_stuck_work_units() {
    let mut cfg = config(1000.0, 1);
    cfg.resources.request_timeout_ms = Some(500);
    let manager = quiet_manager(cfg);

    let stuck: Result<(), GovernorError> = manager
        .process_request(|| async {
            std::future::pending::<()>().await;
            Ok(())
        })
        .await;
    assert!(matches!(stuck, Err(GovernorError::Timeout { timeout_ms: 500 })));

    // The slot was released.
    let next: Result<u8, GovernorError> = manager.process_request(|| async { Ok(1) }).await;
    assert_eq!(next.unwrap(), 1);

    let metrics = manager.monitor().get_metrics();
    assert_eq!(metrics.failed_requests, 1);
    assert_eq!(metrics.completed_requests, 1);
}

#[tokio::test]
async fn queue_bound_rejects_before_admission() {
    let mut cfg = config(1000.0, 1);
    cfg.resources.max_queue_size = Some(1);
    let manager = quiet_manager(cfg);
    let gate = Arc::new(tokio::sync::Notify::new());

    let running = {
        let manager = manager.clone();
        let gate = Arc::clone(&gate);
        tokio::spawn(async move {
            manager
                .process_request(move || async move {
                    gate.notified().await;
                    Ok::<_, GovernorError>(())
                })
                .await
        })
    };
    let waiting = {
        let manager = manager.clone();
        tokio::spawn(async move {
            manager
                .process_request(|| async { Ok::<_, GovernorError>(()) })
                .await
        })
    };
    while manager.queue().stats().queued < 1 {
        tokio::task::yield_now().await;
    }

    let rejected: Result<(), GovernorError> = manager.process_request(|| async { Ok(()) }).await;
    assert!(matches!(rejected, Err(GovernorError::QueueFull { capacity: 1 })));

    gate.notify_one();
    running.await.unwrap().unwrap();
    waiting.await.unwrap().unwrap();
    assert_eq!(manager.queue().stats().total_enqueued, 2);
}

#[tokio::test]
async fn is_healthy_reflects_utilization_and_degradation() {
    let manager = quiet_manager(config(1000.0, 4));
    let model = Arc::new(SimulatedModel::new("local", 100.0));
    manager.register_model_manager(model.clone());
    assert!(manager.is_healthy());

    model.set_memory_usage(910.0);
    assert!(!manager.is_healthy());

    model.set_memory_usage(100.0);
    manager.enable_graceful_degradation().await;
    assert!(!manager.is_healthy(), "degraded is never healthy");

    manager.check_degradation_recovery();
    assert!(manager.is_healthy());
}

// ---------------------------------------------------------------------------
// Build profiles
// ---------------------------------------------------------------------------

#[test]
fn shipped_profiles_unwind_so_panics_stay_contained() {
    let path = std::path::Path::new(env!("CARGO_MANIFEST_DIR")).join("../Cargo.toml");
    let manifest: toml::Value = toml::from_str(&std::fs::read_to_string(path).unwrap()).unwrap();
    for profile in ["release", "small"] {
        let strategy = manifest
            .get("profile")
            .and_then(|p| p.get(profile))
            .and_then(|p| p.get("panic"))
            .and_then(|v| v.as_str());
        assert_ne!(strategy, Some("abort"), "profile.{profile} aborts on panic");
    }
}
