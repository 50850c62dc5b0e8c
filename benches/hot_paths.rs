use std::sync::Arc;

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use framegov::clock::{Clock, ManualClock, NSEC_PER_SEC};
use framegov::config::EngineConfig;
use framegov::engine::Engine;
use framegov::estimator::{
    FrameWindows, NoopCapacityController, RuntimeEstimator, SchedRuntimeEstimator,
};
use framegov::events::{EventKind, TraceEvent, TraceRing};
use framegov::metrics::EngineMetrics;
use framegov::task::{FakeTaskSource, TaskSource};

fn build_engine() -> (Engine, Arc<FakeTaskSource>, Arc<ManualClock>) {
    let tasks = Arc::new(FakeTaskSource::new());
    tasks.add_task(10, 10, "com.game.app");
    tasks.add_task(100, 10, "MainRender");
    tasks.add_task(101, 10, "RenderThread");
    for i in 0..16 {
        tasks.add_task(200 + i, 10, &format!("Worker-{i}"));
    }

    let clock = Arc::new(ManualClock::new(2 * NSEC_PER_SEC));
    let metrics = Arc::new(EngineMetrics::new().unwrap());
    let engine = Engine::new(
        EngineConfig::default(),
        Arc::clone(&tasks) as Arc<dyn TaskSource>,
        Arc::new(NoopCapacityController),
        Arc::clone(&clock) as Arc<dyn Clock>,
        metrics,
    );
    let estimator = SchedRuntimeEstimator::new(Arc::clone(&tasks) as Arc<dyn TaskSource>);
    engine.set_estimator(Arc::new(estimator) as Arc<dyn RuntimeEstimator>);

    (engine, tasks, clock)
}

fn windows(cur: u64) -> FrameWindows {
    FrameWindows {
        dequeue_start: cur - 400_000,
        dequeue_end: cur - 300_000,
        enqueue_start: cur - 200_000,
        enqueue_end: cur,
        prev_frame_end: 0,
        cur_frame_end: cur,
    }
}

fn bench_notify(c: &mut Criterion) {
    let (engine, tasks, clock) = build_engine();

    // warm up the record so the steady-state path is measured
    engine.notify(100, 0xABCD, windows(clock.now_ns())).unwrap();

    let mut cur = clock.now_ns();
    c.bench_function("notify_steady_state", |b| {
        b.iter(|| {
            cur += 16_666_000;
            tasks.advance_runtime(100, 4_000_000);
            tasks.advance_runtime(101, 2_000_000);
            black_box(engine.notify(100, 0xABCD, windows(cur)).unwrap());
        })
    });
}

fn bench_dependency_export(c: &mut Criterion) {
    let (engine, _tasks, clock) = build_engine();
    engine.notify(100, 0xABCD, windows(clock.now_ns())).unwrap();
    let deps: Vec<_> = (0..16).map(|i| 200 + i).collect();
    engine.set_override_dependencies(10, &deps).unwrap();
    engine
        .notify(100, 0xABCD, windows(clock.now_ns() + 16_666_000))
        .unwrap();

    c.bench_function("dependency_list_16_tasks", |b| {
        b.iter(|| black_box(engine.dependency_list(100, 0xABCD)))
    });
}

fn bench_ring_record(c: &mut Criterion) {
    let ring = TraceRing::new(8192, num_cpus::get());

    let mut ts = 0u64;
    c.bench_function("trace_ring_record", |b| {
        b.iter(|| {
            ts += 1;
            let ev = TraceEvent::new(EventKind::SchedSwitch, ts, 0, 1337);
            black_box(ring.record(&ev));
        })
    });
}

criterion_group!(
    benches,
    bench_notify,
    bench_dependency_export,
    bench_ring_record
);
criterion_main!(benches);
