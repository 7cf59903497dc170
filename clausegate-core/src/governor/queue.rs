//! Bounded-concurrency FIFO request queue.
//!
//! Work units wait in a FIFO list until a processing slot is free. Every
//! settlement releases its slot and re-runs dispatch, so the queue drains
//! itself without an external pump.

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use futures::FutureExt;
use futures::future::BoxFuture;
use serde::Serialize;
use tokio::sync::oneshot;
use tokio::time::Instant;
use uuid::Uuid;

use crate::error::GovernorError;
use crate::events::{EventSink, GovernorEvent, default_sink};

/// How a dispatched work unit settled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Succeeded,
    Failed,
    TimedOut,
}

/// Hands the settled result to the waiting caller.
type Deliver = Box<dyn FnOnce() + Send>;

/// A type-erased work unit ready to run.
type Job = Box<dyn FnOnce() -> BoxFuture<'static, (Outcome, Deliver)> + Send>;

/// One admitted unit of work and its lifecycle timestamps.
#[derive(Debug, Clone)]
pub struct QueueItem {
    id: String,
    enqueued_at: Instant,
    started_at: Option<Instant>,
    completed_at: Option<Instant>,
}

impl QueueItem {
    fn new(id: String) -> Self {
        Self {
            id,
            enqueued_at: Instant::now(),
            started_at: None,
            completed_at: None,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn enqueued_at(&self) -> Instant {
        self.enqueued_at
    }

    pub fn started_at(&self) -> Option<Instant> {
        self.started_at
    }

    pub fn completed_at(&self) -> Option<Instant> {
        self.completed_at
    }

    /// Time spent in the wait list, once dispatched.
    pub fn wait_time(&self) -> Option<Duration> {
        self.started_at
            .map(|started| started.duration_since(self.enqueued_at))
    }

    /// Time spent processing, once settled.
    pub fn processing_time(&self) -> Option<Duration> {
        match (self.started_at, self.completed_at) {
            (Some(started), Some(completed)) => Some(completed.duration_since(started)),
            _ => None,
        }
    }
}

struct Pending {
    item: QueueItem,
    job: Job,
}

struct QueueState {
    waiting: VecDeque<Pending>,
    processing: HashMap<String, QueueItem>,
    completed: Vec<QueueItem>,
    failed: Vec<QueueItem>,
    max_concurrent: usize,
    total_enqueued: usize,
    total_wait: Duration,
    total_processing: Duration,
    peak_processing: usize,
}

impl QueueState {
    fn history_len(&self) -> usize {
        self.completed.len() + self.failed.len()
    }

    fn average(&self, total: Duration) -> f64 {
        let settled = self.history_len();
        if settled == 0 {
            0.0
        } else {
            total.as_secs_f64() * 1000.0 / settled as f64
        }
    }
}

struct QueueInner {
    state: Mutex<QueueState>,
    request_timeout: Option<Duration>,
    max_queue_size: Option<usize>,
    sink: Arc<dyn EventSink>,
}

impl QueueInner {
    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Move a settled item from processing into history.
    fn finish(&self, id: &str, outcome: Outcome) {
        let event = {
            let mut state = self.lock();
            let Some(mut item) = state.processing.remove(id) else {
                return;
            };
            let now = Instant::now();
            item.completed_at = Some(now);
            let wait = item.wait_time().unwrap_or_default();
            let elapsed = item.processing_time().unwrap_or_default();
            state.total_wait += wait;
            state.total_processing += elapsed;

            let request_id = item.id.clone();
            match outcome {
                Outcome::Succeeded => {
                    state.completed.push(item);
                    GovernorEvent::RequestCompleted {
                        request_id,
                        elapsed,
                    }
                }
                Outcome::Failed => {
                    state.failed.push(item);
                    GovernorEvent::RequestFailed {
                        request_id,
                        elapsed,
                    }
                }
                Outcome::TimedOut => {
                    state.failed.push(item);
                    GovernorEvent::RequestTimedOut {
                        request_id,
                        timeout: self.request_timeout.unwrap_or(elapsed),
                    }
                }
            }
        };
        self.sink.emit(event);
    }
}

/// Snapshot of queue counters and timing metrics.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueueStats {
    pub queued: usize,
    pub processing: usize,
    pub completed: usize,
    pub failed: usize,
    pub total_enqueued: usize,
    pub max_concurrent: usize,
    pub peak_processing: usize,
    pub average_wait_ms: f64,
    pub average_processing_ms: f64,
}

/// A submitted work unit's pending result.
pub struct QueueTicket<T, E> {
    id: String,
    rx: oneshot::Receiver<Result<T, E>>,
}

impl<T, E> QueueTicket<T, E>
where
    E: From<GovernorError>,
{
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Wait for the work unit to settle.
    pub async fn wait(self) -> Result<T, E> {
        match self.rx.await {
            Ok(result) => result,
            Err(_) => Err(E::from(GovernorError::WorkUnitDropped {
                request_id: self.id,
            })),
        }
    }
}

/// Bounded-concurrency admission queue with FIFO dispatch.
///
/// Cloning is cheap and yields a handle to the same queue.
#[derive(Clone)]
pub struct RequestQueue {
    inner: Arc<QueueInner>,
}

impl RequestQueue {
    /// Create a queue that runs at most `max_concurrent` work units at once.
    pub fn new(max_concurrent: usize) -> Self {
        Self::builder(max_concurrent).build()
    }

    pub fn builder(max_concurrent: usize) -> RequestQueueBuilder {
        RequestQueueBuilder {
            max_concurrent,
            request_timeout: None,
            max_queue_size: None,
            sink: None,
        }
    }

    /// Admit a work unit and wait for its outcome.
    ///
    /// A failing work unit rejects with its own error. Queue-internal
    /// failures (admission, deadline, panic) are converted into `E`.
    pub async fn enqueue<T, E, F, Fut>(&self, work: F) -> Result<T, E>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
        T: Send + 'static,
        E: From<GovernorError> + Send + 'static,
    {
        let ticket = self.submit(work).map_err(E::from)?;
        ticket.wait().await
    }

    /// Admit a work unit without waiting for it.
    ///
    /// Must be called from within a Tokio runtime; dispatched work units run
    /// as spawned tasks.
    pub fn submit<T, E, F, Fut>(&self, work: F) -> Result<QueueTicket<T, E>, GovernorError>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
        T: Send + 'static,
        E: From<GovernorError> + Send + 'static,
    {
        let id = Uuid::new_v4().to_string();
        let (tx, rx) = oneshot::channel();
        let job = Self::erase(id.clone(), work, tx, self.inner.request_timeout);

        let queued = {
            let mut state = self.inner.lock();
            if let Some(capacity) = self.inner.max_queue_size {
                let slot_free = state.processing.len() < state.max_concurrent;
                if !slot_free && state.waiting.len() >= capacity {
                    return Err(GovernorError::QueueFull { capacity });
                }
            }
            state.waiting.push_back(Pending {
                item: QueueItem::new(id.clone()),
                job,
            });
            state.total_enqueued += 1;
            state.waiting.len()
        };
        self.inner.sink.emit(GovernorEvent::RequestQueued {
            request_id: id.clone(),
            queued,
        });

        Self::dispatch(&self.inner);
        Ok(QueueTicket { id, rx })
    }

    /// Wrap a typed work unit into a job that reports its outcome and
    /// delivers the result separately, after bookkeeping.
    fn erase<T, E, F, Fut>(
        request_id: String,
        work: F,
        tx: oneshot::Sender<Result<T, E>>,
        timeout: Option<Duration>,
    ) -> Job
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
        T: Send + 'static,
        E: From<GovernorError> + Send + 'static,
    {
        Box::new(move || {
            async move {
                let guarded = AssertUnwindSafe(async move {
                    match timeout {
                        Some(limit) => tokio::time::timeout(limit, work()).await.ok(),
                        None => Some(work().await),
                    }
                })
                .catch_unwind()
                .await;

                let (outcome, result) = match guarded {
                    Ok(Some(Ok(value))) => (Outcome::Succeeded, Ok(value)),
                    Ok(Some(Err(err))) => (Outcome::Failed, Err(err)),
                    Ok(None) => (
                        Outcome::TimedOut,
                        Err(E::from(GovernorError::Timeout {
                            timeout_ms: timeout.map_or(0, |t| t.as_millis() as u64),
                        })),
                    ),
                    Err(_) => (
                        Outcome::Failed,
                        Err(E::from(GovernorError::WorkUnitPanicked { request_id })),
                    ),
                };

                let deliver: Deliver = Box::new(move || {
                    // The caller may have stopped waiting.
                    let _ = tx.send(result);
                });
                (outcome, deliver)
            }
            .boxed()
        })
    }

    /// Start waiting items, head first, while slots are free.
    fn dispatch(inner: &Arc<QueueInner>) {
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            return;
        };

        let (ready, started) = {
            let mut state = inner.lock();
            let mut ready = Vec::new();
            let mut started = Vec::new();
            while state.processing.len() < state.max_concurrent {
                let Some(Pending { mut item, job }) = state.waiting.pop_front() else {
                    break;
                };
                item.started_at = Some(Instant::now());
                started.push(GovernorEvent::RequestStarted {
                    request_id: item.id.clone(),
                    waited: item.wait_time().unwrap_or_default(),
                });
                ready.push((item.id.clone(), job));
                state.processing.insert(item.id.clone(), item);
            }
            state.peak_processing = state.peak_processing.max(state.processing.len());
            (ready, started)
        };

        for event in started {
            inner.sink.emit(event);
        }

        for (id, job) in ready {
            let inner = Arc::clone(inner);
            handle.spawn(async move {
                let (outcome, deliver) = job().await;
                inner.finish(&id, outcome);
                deliver();
                Self::dispatch(&inner);
            });
        }
    }

    /// Change the concurrency ceiling (floored at 1). Raising it dispatches
    /// waiting items immediately.
    pub fn set_max_concurrent(&self, max_concurrent: usize) {
        let max_concurrent = max_concurrent.max(1);
        let previous = {
            let mut state = self.inner.lock();
            std::mem::replace(&mut state.max_concurrent, max_concurrent)
        };
        if previous != max_concurrent {
            self.inner.sink.emit(GovernorEvent::ConcurrencyChanged {
                from: previous,
                to: max_concurrent,
            });
        }
        Self::dispatch(&self.inner);
    }

    pub fn max_concurrent(&self) -> usize {
        self.inner.lock().max_concurrent
    }

    /// Drop completed and failed history. Waiting and in-flight items are
    /// untouched; counters restart from what is still live.
    pub fn clear_history(&self) {
        let (completed, failed) = {
            let mut state = self.inner.lock();
            let completed = state.completed.len();
            let failed = state.failed.len();
            state.completed.clear();
            state.failed.clear();
            state.total_wait = Duration::ZERO;
            state.total_processing = Duration::ZERO;
            state.total_enqueued = state.processing.len() + state.waiting.len();
            (completed, failed)
        };
        self.inner
            .sink
            .emit(GovernorEvent::HistoryCleared { completed, failed });
    }

    pub fn stats(&self) -> QueueStats {
        let state = self.inner.lock();
        QueueStats {
            queued: state.waiting.len(),
            processing: state.processing.len(),
            completed: state.completed.len(),
            failed: state.failed.len(),
            total_enqueued: state.total_enqueued,
            max_concurrent: state.max_concurrent,
            peak_processing: state.peak_processing,
            average_wait_ms: state.average(state.total_wait),
            average_processing_ms: state.average(state.total_processing),
        }
    }

    /// Completed items in settlement order.
    pub fn completed_items(&self) -> Vec<QueueItem> {
        self.inner.lock().completed.clone()
    }

    /// Failed items in settlement order.
    pub fn failed_items(&self) -> Vec<QueueItem> {
        self.inner.lock().failed.clone()
    }

    /// Whether nothing is waiting or processing.
    pub fn is_idle(&self) -> bool {
        let state = self.inner.lock();
        state.waiting.is_empty() && state.processing.is_empty()
    }
}

pub struct RequestQueueBuilder {
    max_concurrent: usize,
    request_timeout: Option<Duration>,
    max_queue_size: Option<usize>,
    sink: Option<Arc<dyn EventSink>>,
}

impl RequestQueueBuilder {
    /// Fail work units that run longer than `timeout`.
    pub fn request_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Reject admissions once this many items are waiting.
    pub fn max_queue_size(mut self, size: Option<usize>) -> Self {
        self.max_queue_size = size;
        self
    }

    pub fn sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn build(self) -> RequestQueue {
        RequestQueue {
            inner: Arc::new(QueueInner {
                state: Mutex::new(QueueState {
                    waiting: VecDeque::new(),
                    processing: HashMap::new(),
                    completed: Vec::new(),
                    failed: Vec::new(),
                    max_concurrent: self.max_concurrent.max(1),
                    total_enqueued: 0,
                    total_wait: Duration::ZERO,
                    total_processing: Duration::ZERO,
                    peak_processing: 0,
                }),
                request_timeout: self.request_timeout,
                max_queue_size: self.max_queue_size,
                sink: self.sink.unwrap_or_else(default_sink),
            }),
        }
    }
}
