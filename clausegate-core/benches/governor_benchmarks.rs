use std::sync::Arc;
use std::time::Duration;

use clausegate_core::NoopSink;
use clausegate_core::config::MonitoringConfig;
use clausegate_core::governor::{PerformanceMonitor, RequestQueue, percentile};
use clausegate_core::GovernorError;
use criterion::{black_box, criterion_group, criterion_main, Criterion};

fn quiet_monitor(sample_window: usize) -> PerformanceMonitor {
    let config = MonitoringConfig {
        sample_window,
        ..Default::default()
    };
    PerformanceMonitor::with_sink(config, Duration::from_secs(30), Arc::new(NoopSink))
}

fn bench_monitor(c: &mut Criterion) {
    c.bench_function("monitor_record_full_window", |b| {
        let monitor = quiet_monitor(1000);
        for i in 0..1000 {
            let record = monitor.record_request_start(format!("warm-{i}"));
            monitor.record_request_end(record, true);
        }
        b.iter(|| {
            let record = monitor.record_request_start(black_box("req"));
            monitor.record_request_end(record, black_box(true))
        })
    });

    c.bench_function("monitor_get_metrics", |b| {
        let monitor = quiet_monitor(1000);
        for i in 0..1000 {
            let record = monitor.record_request_start(format!("warm-{i}"));
            monitor.record_request_end(record, i % 10 != 0);
        }
        b.iter(|| black_box(monitor.get_metrics()))
    });

    let samples: Vec<f64> = (0..1000).map(|i| (i * 7919 % 1000) as f64).collect();
    c.bench_function("percentile_sort_1000", |b| {
        b.iter(|| {
            let mut sorted = black_box(samples.clone());
            sorted.sort_by(f64::total_cmp);
            percentile(&sorted, 95.0)
        })
    });
}

fn bench_queue(c: &mut Criterion) {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_time()
        .build()
        .unwrap();

    c.bench_function("queue_enqueue_100_immediate", |b| {
        let queue = RequestQueue::builder(4).sink(Arc::new(NoopSink)).build();
        b.iter(|| {
            runtime.block_on(async {
                let tickets: Vec<_> = (0..100u32)
                    .map(|i| {
                        queue
                            .submit(move || async move { Ok::<_, GovernorError>(i) })
                            .unwrap()
                    })
                    .collect();
                for ticket in tickets {
                    black_box(ticket.wait().await.unwrap());
                }
                queue.clear_history();
            })
        })
    });
}

criterion_group!(benches, bench_monitor, bench_queue);
criterion_main!(benches);
