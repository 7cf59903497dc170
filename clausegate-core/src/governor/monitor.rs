//! Request latency, outcome counters and alerting.
//!
//! Latency samples live in a bounded rolling window so percentile and
//! average computation stay cheap regardless of uptime. A periodic tick
//! (only while monitoring is started) recomputes metrics and emits alert
//! events; alerts are observations and never change queue or resource
//! state.

use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::config::MonitoringConfig;
use crate::events::{EventSink, GovernorEvent, default_sink};

/// Tracks one request from start to end.
///
/// Handed out by [`PerformanceMonitor::record_request_start`] and finished by
/// [`PerformanceMonitor::record_request_end`]. The outcome is written once;
/// ending an already finished record leaves the metrics untouched.
#[derive(Debug)]
pub struct RequestRecord {
    id: String,
    start_time: Instant,
    end_time: Option<Instant>,
    success: Option<bool>,
}

impl RequestRecord {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn start_time(&self) -> Instant {
        self.start_time
    }

    pub fn end_time(&self) -> Option<Instant> {
        self.end_time
    }

    pub fn duration(&self) -> Option<Duration> {
        self.end_time
            .map(|end| end.saturating_duration_since(self.start_time))
    }

    pub fn success(&self) -> Option<bool> {
        self.success
    }

    pub fn is_finished(&self) -> bool {
        self.end_time.is_some()
    }
}

/// Process-wide request metrics.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct AggregateMetrics {
    pub total_requests: u64,
    pub completed_requests: u64,
    pub failed_requests: u64,
    pub in_progress_requests: u64,
    pub average_response_time_ms: f64,
    pub p95_response_time_ms: f64,
    /// Completed requests per second since the monitor started.
    pub throughput: f64,
    pub error_rate: f64,
    pub uptime_secs: f64,
}

/// Human-oriented digest of [`AggregateMetrics`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PerformanceSummary {
    pub total_requests: u64,
    pub success_rate: f64,
    pub error_rate: f64,
    pub average_response_time_ms: f64,
    pub p95_response_time_ms: f64,
    pub throughput: f64,
    pub in_progress_requests: u64,
    pub uptime_secs: f64,
    pub healthy: bool,
}

impl fmt::Display for PerformanceSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} requests ({:.1}% ok, {} in flight), avg {:.1}ms, p95 {:.1}ms, {:.2} req/s, uptime {:.0}s, {}",
            self.total_requests,
            self.success_rate * 100.0,
            self.in_progress_requests,
            self.average_response_time_ms,
            self.p95_response_time_ms,
            self.throughput,
            self.uptime_secs,
            if self.healthy { "healthy" } else { "unhealthy" }
        )
    }
}

/// A threshold breach found by the alerting tick.
#[derive(Debug, Clone, PartialEq)]
pub enum Alert {
    HighErrorRate { error_rate: f64, threshold: f64 },
    SlowResponses { average_ms: f64, limit_ms: f64 },
}

impl From<&Alert> for GovernorEvent {
    fn from(alert: &Alert) -> Self {
        match *alert {
            Alert::HighErrorRate {
                error_rate,
                threshold,
            } => GovernorEvent::ErrorRateAlert {
                error_rate,
                threshold,
            },
            Alert::SlowResponses {
                average_ms,
                limit_ms,
            } => GovernorEvent::SlowResponseAlert {
                average_ms,
                limit_ms,
            },
        }
    }
}

/// Nearest-rank percentile over an ascending slice.
pub fn percentile(sorted: &[f64], p: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    let rank = (p / 100.0 * sorted.len() as f64).ceil() as usize;
    sorted[rank.clamp(1, sorted.len()) - 1]
}

struct MonitorState {
    metrics: AggregateMetrics,
    samples: VecDeque<f64>,
    started_at: Instant,
    max_processing_time: Duration,
}

impl MonitorState {
    fn recompute(&mut self) {
        let m = &mut self.metrics;
        m.in_progress_requests = m
            .total_requests
            .saturating_sub(m.completed_requests + m.failed_requests);

        if self.samples.is_empty() {
            m.average_response_time_ms = 0.0;
            m.p95_response_time_ms = 0.0;
        } else {
            let sum: f64 = self.samples.iter().sum();
            m.average_response_time_ms = sum / self.samples.len() as f64;
            let mut sorted: Vec<f64> = self.samples.iter().copied().collect();
            sorted.sort_by(f64::total_cmp);
            m.p95_response_time_ms = percentile(&sorted, 95.0);
        }

        let uptime = self.started_at.elapsed().as_secs_f64();
        m.uptime_secs = uptime;
        m.throughput = if uptime > 0.0 {
            m.completed_requests as f64 / uptime
        } else {
            0.0
        };
        m.error_rate = if m.total_requests == 0 {
            0.0
        } else {
            m.failed_requests as f64 / m.total_requests as f64
        };
    }
}

struct MonitorInner {
    config: MonitoringConfig,
    state: Mutex<MonitorState>,
    ticker: Mutex<Option<CancellationToken>>,
    sink: Arc<dyn EventSink>,
}

impl MonitorInner {
    fn lock(&self) -> MutexGuard<'_, MonitorState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn response_time_limit_ms(&self, state: &MonitorState) -> f64 {
        state.max_processing_time.as_secs_f64() * 1000.0 * self.config.response_time_ratio
    }

    fn check_alerts(&self) -> Vec<Alert> {
        let mut alerts = Vec::new();
        {
            let mut state = self.lock();
            state.recompute();
            let metrics = &state.metrics;
            if metrics.total_requests > 0 && metrics.error_rate > self.config.error_rate_threshold
            {
                alerts.push(Alert::HighErrorRate {
                    error_rate: metrics.error_rate,
                    threshold: self.config.error_rate_threshold,
                });
            }
            let limit_ms = self.response_time_limit_ms(&state);
            if state.metrics.average_response_time_ms > limit_ms {
                alerts.push(Alert::SlowResponses {
                    average_ms: state.metrics.average_response_time_ms,
                    limit_ms,
                });
            }
        }
        for alert in &alerts {
            self.sink.emit(alert.into());
        }
        alerts
    }
}

/// Tracks request latency and outcomes and raises threshold alerts.
///
/// Cloning is cheap and yields a handle to the same monitor.
#[derive(Clone)]
pub struct PerformanceMonitor {
    inner: Arc<MonitorInner>,
}

impl PerformanceMonitor {
    pub fn new(config: MonitoringConfig, max_processing_time: Duration) -> Self {
        Self::with_sink(config, max_processing_time, default_sink())
    }

    pub fn with_sink(
        config: MonitoringConfig,
        max_processing_time: Duration,
        sink: Arc<dyn EventSink>,
    ) -> Self {
        let capacity = config.sample_window.max(1);
        Self {
            inner: Arc::new(MonitorInner {
                config,
                state: Mutex::new(MonitorState {
                    metrics: AggregateMetrics::default(),
                    samples: VecDeque::with_capacity(capacity),
                    started_at: Instant::now(),
                    max_processing_time,
                }),
                ticker: Mutex::new(None),
                sink,
            }),
        }
    }

    /// Count a new in-flight request and stamp its start time.
    pub fn record_request_start(&self, id: impl Into<String>) -> RequestRecord {
        let record = RequestRecord {
            id: id.into(),
            start_time: Instant::now(),
            end_time: None,
            success: None,
        };
        let mut state = self.inner.lock();
        state.metrics.total_requests += 1;
        state.metrics.in_progress_requests += 1;
        record
    }

    /// Finish a request and fold its duration into the metrics.
    ///
    /// A record that is already finished is returned unchanged.
    pub fn record_request_end(&self, mut record: RequestRecord, success: bool) -> RequestRecord {
        if record.is_finished() {
            return record;
        }
        let end = Instant::now();
        record.end_time = Some(end);
        record.success = Some(success);
        let duration_ms = end.saturating_duration_since(record.start_time).as_secs_f64() * 1000.0;

        let mut state = self.inner.lock();
        if success {
            state.metrics.completed_requests += 1;
        } else {
            state.metrics.failed_requests += 1;
        }
        if state.samples.len() >= self.inner.config.sample_window.max(1) {
            state.samples.pop_front();
        }
        state.samples.push_back(duration_ms);
        state.recompute();
        record
    }

    /// Current metrics, recomputed on read.
    pub fn get_metrics(&self) -> AggregateMetrics {
        let mut state = self.inner.lock();
        state.recompute();
        state.metrics.clone()
    }

    pub fn get_summary(&self) -> PerformanceSummary {
        let metrics = self.get_metrics();
        let settled = metrics.completed_requests + metrics.failed_requests;
        let success_rate = if settled == 0 {
            1.0
        } else {
            metrics.completed_requests as f64 / settled as f64
        };
        PerformanceSummary {
            total_requests: metrics.total_requests,
            success_rate,
            error_rate: metrics.error_rate,
            average_response_time_ms: metrics.average_response_time_ms,
            p95_response_time_ms: metrics.p95_response_time_ms,
            throughput: metrics.throughput,
            in_progress_requests: metrics.in_progress_requests,
            uptime_secs: metrics.uptime_secs,
            healthy: self.is_system_healthy(),
        }
    }

    /// Error rate and average latency are both within their thresholds.
    pub fn is_system_healthy(&self) -> bool {
        let mut state = self.inner.lock();
        state.recompute();
        let limit_ms = self.inner.response_time_limit_ms(&state);
        state.metrics.error_rate <= self.inner.config.error_rate_threshold
            && state.metrics.average_response_time_ms <= limit_ms
    }

    /// Recompute metrics and emit alerts for breached thresholds.
    pub fn check_alerts(&self) -> Vec<Alert> {
        self.inner.check_alerts()
    }

    pub fn set_max_processing_time(&self, max_processing_time: Duration) {
        self.inner.lock().max_processing_time = max_processing_time;
    }

    pub fn max_processing_time(&self) -> Duration {
        self.inner.lock().max_processing_time
    }

    /// Clear counters and samples. In-flight requests stay counted so they
    /// can still be finished.
    pub fn reset(&self) {
        let mut state = self.inner.lock();
        let in_flight = state.metrics.in_progress_requests;
        state.metrics = AggregateMetrics {
            total_requests: in_flight,
            in_progress_requests: in_flight,
            ..Default::default()
        };
        state.samples.clear();
        state.started_at = Instant::now();
    }

    /// Start the periodic alerting tick. No-op if already running.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn start_monitoring(&self) {
        let mut ticker = self
            .inner
            .ticker
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if ticker.is_some() {
            return;
        }

        let token = CancellationToken::new();
        let period = self.inner.config.interval();
        tokio::spawn(tick_loop(
            Arc::downgrade(&self.inner),
            period,
            token.clone(),
        ));
        *ticker = Some(token);
        drop(ticker);

        self.inner
            .sink
            .emit(GovernorEvent::MonitoringStarted { interval: period });
    }

    /// Stop the alerting tick. No-op if not running.
    pub fn stop_monitoring(&self) {
        let token = self
            .inner
            .ticker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(token) = token {
            token.cancel();
            self.inner.sink.emit(GovernorEvent::MonitoringStopped);
        }
    }

    pub fn is_monitoring(&self) -> bool {
        self.inner
            .ticker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }
}

async fn tick_loop(inner: Weak<MonitorInner>, period: Duration, token: CancellationToken) {
    let mut interval = tokio::time::interval_at(Instant::now() + period, period);
    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            _ = interval.tick() => {
                let Some(inner) = inner.upgrade() else { break };
                inner.check_alerts();
            }
        }
    }
}
