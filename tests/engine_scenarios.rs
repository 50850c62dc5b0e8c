use std::sync::Arc;

use parking_lot::Mutex;

use framegov::clock::{Clock, ManualClock, NSEC_PER_SEC};
use framegov::config::EngineConfig;
use framegov::engine::dep::DepAction;
use framegov::engine::policy::PolicyField;
use framegov::engine::recycle::SweepOutcome;
use framegov::engine::Engine;
use framegov::error::EngineError;
use framegov::estimator::{
    Estimate, EstimateRequest, EstimatorError, FrameWindows, NoopCapacityController,
    RuntimeEstimator,
};
use framegov::metrics::EngineMetrics;
use framegov::task::{FakeTaskSource, SchedClass, TaskSource, Tid};

/// Estimator that records every request and replies from a template. An
/// empty template dependency set echoes owner + primary + overrides back.
struct ScriptedEstimator {
    reply: Mutex<Estimate>,
    requests: Mutex<Vec<EstimateRequest>>,
    forgotten: Mutex<Vec<(Tid, u64)>>,
}

impl ScriptedEstimator {
    fn new() -> Self {
        Self {
            reply: Mutex::new(Estimate::default()),
            requests: Mutex::new(Vec::new()),
            forgotten: Mutex::new(Vec::new()),
        }
    }

    fn set_reply(&self, reply: Estimate) {
        *self.reply.lock() = reply;
    }

    fn last_request(&self) -> EstimateRequest {
        self.requests.lock().last().cloned().expect("no requests")
    }
}

impl RuntimeEstimator for ScriptedEstimator {
    fn estimate(&self, req: &EstimateRequest) -> Result<Estimate, EstimatorError> {
        self.requests.lock().push(req.clone());

        let mut est = self.reply.lock().clone();
        if est.dependencies.is_empty() {
            est.dependencies.push(req.owner);
            for &tid in req.primary.iter().chain(req.overrides.iter()) {
                if !est.dependencies.contains(&tid) {
                    est.dependencies.push(tid);
                }
            }
        }
        Ok(est)
    }

    fn forget(&self, owner: Tid, buffer: u64) {
        self.forgotten.lock().push((owner, buffer));
    }
}

struct Harness {
    engine: Engine,
    tasks: Arc<FakeTaskSource>,
    clock: Arc<ManualClock>,
    estimator: Arc<ScriptedEstimator>,
}

const T0: u64 = 2 * NSEC_PER_SEC;

fn harness() -> Harness {
    harness_with(EngineConfig::default())
}

fn harness_with(cfg: EngineConfig) -> Harness {
    let tasks = Arc::new(FakeTaskSource::new());
    // a small game process: main thread, render owner, helper, worker
    tasks.add_task(10, 10, "com.game.app");
    tasks.add_task(100, 10, "MainRender");
    tasks.add_task(101, 10, "RenderThread");
    tasks.add_task(102, 10, "Worker-1");

    let clock = Arc::new(ManualClock::new(T0));
    let estimator = Arc::new(ScriptedEstimator::new());
    let metrics = Arc::new(EngineMetrics::new().unwrap());

    let engine = Engine::new(
        cfg,
        Arc::clone(&tasks) as Arc<dyn TaskSource>,
        Arc::new(NoopCapacityController),
        Arc::clone(&clock) as Arc<dyn Clock>,
        metrics,
    );
    engine.set_estimator(Arc::clone(&estimator) as Arc<dyn RuntimeEstimator>);

    Harness {
        engine,
        tasks,
        clock,
        estimator,
    }
}

fn win(cur: u64) -> FrameWindows {
    FrameWindows {
        dequeue_start: cur - 400,
        dequeue_end: cur - 300,
        enqueue_start: cur - 200,
        enqueue_end: cur,
        prev_frame_end: 0,
        cur_frame_end: cur,
    }
}

#[test]
fn notify_creates_one_record_per_key() {
    let h = harness();

    h.engine.notify(100, 0xABCD, win(T0)).unwrap();
    h.engine.notify(100, 0xABCD, win(T0 + 16_000_000)).unwrap();
    h.engine.notify(100, 0xBEEF, win(T0 + 16_000_000)).unwrap();

    assert_eq!(h.engine.render_count(), 2);

    let rec = h.engine.render_snapshot(100, 0xABCD).unwrap();
    assert_eq!(rec.cur_frame_end_ts, T0 + 16_000_000);
    assert_eq!(rec.prev_frame_end_ts, T0);
}

#[test]
fn notify_stores_the_estimate_and_replaces_dependencies() {
    let h = harness();
    h.estimator.set_reply(Estimate {
        raw_cpu_ns: 4_000_000,
        ema_cpu_ns: 3_500_000,
        dequeue_cpu_ns: 0,
        enqueue_cpu_ns: 4_000_000,
        dependencies: vec![101, 102],
    });

    let out = h.engine.notify(100, 0xABCD, win(T0)).unwrap();
    assert_eq!(out.raw_cpu_ns, 4_000_000);
    assert_eq!(out.ema_cpu_ns, 3_500_000);

    let rec = h.engine.render_snapshot(100, 0xABCD).unwrap();
    assert_eq!(rec.raw_cpu_ns, 4_000_000);
    assert_eq!(rec.primary.ids(), vec![101, 102]);
}

#[test]
fn invalid_notify_rejects_before_any_mutation() {
    let h = harness();

    let mut bad = win(T0);
    bad.dequeue_end = bad.enqueue_start + 1;
    assert_eq!(
        h.engine.notify(100, 0xABCD, bad),
        Err(EngineError::InvalidParameter("dequeue overlaps enqueue"))
    );

    let mut regressed = win(T0);
    regressed.prev_frame_end = T0 + 1;
    assert!(h.engine.notify(100, 0xABCD, regressed).is_err());

    assert_eq!(h.engine.notify(0, 0xABCD, win(T0)).unwrap_err(),
        EngineError::InvalidParameter("owner tid must be positive"));
    assert_eq!(h.engine.notify(100, 0, win(T0)).unwrap_err(),
        EngineError::InvalidParameter("buffer id must be nonzero"));

    assert_eq!(h.engine.render_count(), 0);
    assert!(h.estimator.requests.lock().is_empty());
}

#[test]
fn notify_without_estimator_keeps_bookkeeping() {
    let h = harness();
    h.engine.clear_estimator();

    assert_eq!(
        h.engine.notify(100, 0xABCD, win(T0)),
        Err(EngineError::EstimatorUnavailable)
    );
    // the render record and its frame window were still updated
    assert_eq!(h.engine.render_count(), 1);
    assert_eq!(
        h.engine.render_snapshot(100, 0xABCD).unwrap().cur_frame_end_ts,
        T0
    );
}

#[test]
fn disabled_engine_rejects_and_resets() {
    let h = harness();
    h.engine.notify(100, 0xABCD, win(T0)).unwrap();
    assert_eq!(h.engine.render_count(), 1);

    h.engine.apply_tunable("enabled", 0).unwrap();
    assert_eq!(h.engine.render_count(), 0);
    assert_eq!(
        h.engine.notify(100, 0xABCD, win(T0)),
        Err(EngineError::Disabled)
    );
    assert_eq!(h.estimator.forgotten.lock().len(), 1);
}

#[test]
fn sweep_reclaims_only_stale_records() {
    let h = harness();
    h.engine.notify(100, 0xABCD, win(T0)).unwrap();
    h.engine.notify(100, 0xBEEF, win(T0)).unwrap();

    // one render keeps producing, the other goes idle
    let later = T0 + NSEC_PER_SEC;
    h.clock.set(later);
    h.engine.notify(100, 0xBEEF, win(later)).unwrap();

    let outcome = h.engine.sweep_at(later + 1);
    assert_eq!(outcome, SweepOutcome::Swept { renders: 1, frames: 0 });
    assert!(h.engine.render_snapshot(100, 0xABCD).is_none());
    assert!(h.engine.render_snapshot(100, 0xBEEF).is_some());
    assert!(h.estimator.forgotten.lock().contains(&(100, 0xABCD)));
}

#[test]
fn sweep_within_window_reclaims_nothing() {
    let h = harness();
    h.engine.notify(100, 0xABCD, win(T0)).unwrap();

    let outcome = h.engine.sweep_at(T0 + NSEC_PER_SEC - 1);
    assert_eq!(outcome, SweepOutcome::Swept { renders: 0, frames: 0 });
    assert_eq!(h.engine.render_count(), 1);
}

#[test]
fn external_hint_records_are_exempt_from_sweep() {
    let h = harness();
    h.engine
        .set_external_dependencies(10, 100, 0xABCD, Some(&[101, 102]))
        .unwrap();

    assert_eq!(
        h.engine.sweep_at(T0 + 100 * NSEC_PER_SEC),
        SweepOutcome::Swept { renders: 0, frames: 0 }
    );
    assert_eq!(h.engine.render_count(), 1);

    // explicit teardown still works
    h.engine
        .set_external_dependencies(10, 100, 0xABCD, None)
        .unwrap();
    assert_eq!(h.engine.render_count(), 0);
    assert!(h.estimator.forgotten.lock().contains(&(100, 0xABCD)));
}

#[test]
fn window_change_resets_everything_exactly_once() {
    let h = harness();
    h.engine.notify(100, 0xABCD, win(T0)).unwrap();
    h.engine.frame_start(100, 0xABCD, 1, &[101]).unwrap();

    // two consecutive changes before the sweep collapse into one reset
    h.engine.apply_tunable("dep_frames", 9).unwrap();
    h.engine.apply_tunable("dep_frames", 11).unwrap();

    assert_eq!(h.engine.sweep_at(T0 + 1), SweepOutcome::WindowChanged);
    assert_eq!(h.engine.render_count(), 0);
    assert_eq!(h.engine.frame_count(), 0);
    assert_eq!(h.engine.dep_frames(), 11);

    assert_eq!(
        h.engine.sweep_at(T0 + 2),
        SweepOutcome::Swept { renders: 0, frames: 0 }
    );
}

#[test]
fn forced_extra_subtraction_overrides_suppression() {
    let h = harness();
    h.engine.apply_tunable("extra_sub", 1).unwrap();
    h.engine.apply_tunable("force_no_extra_sub", 1).unwrap();

    // dequeue here is 100ns, far under the trigger threshold
    h.engine.notify(100, 0xABCD, win(T0)).unwrap();
    assert!(h.estimator.last_request().flags.extra_subtraction);
}

#[test]
fn suppression_vetoes_the_long_dequeue_trigger() {
    let h = harness();
    h.engine.apply_tunable("force_no_extra_sub", 1).unwrap();

    let long_dequeue = FrameWindows {
        dequeue_start: T0 - 10_000_000,
        dequeue_end: T0 - 4_000_000,
        enqueue_start: T0 - 2_000_000,
        enqueue_end: T0,
        prev_frame_end: 0,
        cur_frame_end: T0,
    };
    h.engine.notify(100, 0xABCD, long_dequeue).unwrap();
    assert!(!h.estimator.last_request().flags.extra_subtraction);

    // without the suppression the same window triggers the subtraction
    h.engine.apply_tunable("force_no_extra_sub", 0).unwrap();
    h.engine
        .notify(100, 0xABCD, FrameWindows { cur_frame_end: T0 + 1, ..long_dequeue })
        .unwrap();
    assert!(h.estimator.last_request().flags.extra_subtraction);
}

#[test]
fn has_dependency_sees_owner_and_dependencies() {
    let h = harness();
    h.engine.notify(100, 0xABCD, win(T0)).unwrap();

    assert!(h.engine.has_dependency(100));
    assert!(!h.engine.has_dependency(999));

    h.engine.set_override_dependencies(10, &[102]).unwrap();
    assert!(h.engine.has_dependency(102));
}

#[test]
fn out_of_range_tunables_are_rejected() {
    let h = harness();
    assert!(h.engine.apply_tunable("dep_frames", 1).is_err());
    assert!(h.engine.apply_tunable("dep_frames", 21).is_err());
    assert!(h.engine.apply_tunable("ema_dividend", 0).is_err());
    assert!(h.engine.apply_tunable("force_floor", 101).is_err());
    assert!(h.engine.apply_tunable("no_such_knob", 1).is_err());
    // nothing changed, so the next sweep is a plain pass
    assert_eq!(
        h.engine.sweep_at(T0),
        SweepOutcome::Swept { renders: 0, frames: 0 }
    );
}

#[test]
fn policy_override_flows_into_the_estimate_request() {
    let h = harness();
    h.engine
        .set_policy_override(10, PolicyField::Ema2, Some(true), false)
        .unwrap();
    h.engine
        .set_policy_override(10, PolicyField::FilterDepTasks, Some(false), false)
        .unwrap();

    h.engine.apply_tunable("filter_dep_tasks", 1).unwrap();
    h.engine.notify(100, 0xABCD, win(T0)).unwrap();

    let req = h.estimator.last_request();
    assert!(req.flags.ema2_enabled);
    // the per-process override wins over the global filter setting
    assert!(!req.flags.filter_enabled);
}

#[test]
fn clearing_policy_override_drops_the_command() {
    let h = harness();
    h.engine
        .set_policy_override(10, PolicyField::Ema2, Some(true), false)
        .unwrap();
    assert_eq!(h.engine.policy_count(), 1);

    h.engine
        .set_policy_override(10, PolicyField::Ema2, None, false)
        .unwrap();
    assert_eq!(h.engine.policy_count(), 0);
}

#[test]
fn dependency_list_folds_owner_helper_and_overlay() {
    let h = harness();
    h.tasks.set_runtime(101, 5_000_000);

    h.engine.notify(100, 0xABCD, win(T0)).unwrap();
    h.engine.set_override_dependencies(10, &[101]).unwrap();

    // the scripted reply echoes the override, so 101 enters the dependency
    // set; the rescan after that picks it as the helper thread
    h.clock.advance(2 * NSEC_PER_SEC);
    h.engine.notify(100, 0xABCD, win(T0 + 16_000_000)).unwrap();
    h.clock.advance(2 * NSEC_PER_SEC);
    h.engine.notify(100, 0xABCD, win(T0 + 32_000_000)).unwrap();

    let deps = h.engine.dependency_list(100, 0xABCD);
    let ids: Vec<Tid> = deps.iter().map(|d| d.tid).collect();
    assert!(ids.contains(&100), "owner folded in: {ids:?}");
    assert!(ids.contains(&101), "helper folded in: {ids:?}");

    assert_eq!(h.engine.render_snapshot(100, 0xABCD).unwrap().spid, 101);
}

#[test]
fn dependency_filter_drops_foreign_tasks_except_allow_list() {
    let h = harness();
    // a thread of another process, and a kernel thread
    h.tasks.add_task(500, 50, "ExtWorker");
    h.tasks.add_task(600, 60, "kworker/0:1");
    h.tasks.set_kernel_thread(600, true);

    h.engine.apply_tunable("filter_dep_tasks", 1).unwrap();
    h.engine.notify(100, 0xABCD, win(T0)).unwrap();
    h.engine
        .set_override_dependencies(10, &[500, 600])
        .unwrap();
    // the next frame folds the overrides into the dependency set
    h.engine.notify(100, 0xABCD, win(T0 + 16_000_000)).unwrap();

    let ids: Vec<Tid> = h
        .engine
        .dependency_list(100, 0xABCD)
        .iter()
        .map(|d| d.tid)
        .collect();
    assert!(!ids.contains(&500));
    assert!(!ids.contains(&600));

    // allow-listing the foreign process readmits its thread
    h.engine.apply_tunable("external_hal_pid", 50).unwrap();
    let ids: Vec<Tid> = h
        .engine
        .dependency_list(100, 0xABCD)
        .iter()
        .map(|d| d.tid)
        .collect();
    assert!(ids.contains(&500));
    assert!(!ids.contains(&600), "kernel threads never pass");
}

#[test]
fn foreign_realtime_tasks_are_always_dropped() {
    let h = harness();
    h.tasks.add_task(700, 70, "rt-worker");
    h.tasks.set_class(700, SchedClass::RealTime);

    h.engine.notify(100, 0xABCD, win(T0)).unwrap();
    h.engine.set_override_dependencies(10, &[700]).unwrap();
    h.engine.notify(100, 0xABCD, win(T0 + 16_000_000)).unwrap();

    let ids: Vec<Tid> = h
        .engine
        .dependency_list(100, 0xABCD)
        .iter()
        .map(|d| d.tid)
        .collect();
    assert!(!ids.contains(&700));
}

#[test]
fn pattern_expansion_promotes_forced_cpu_time_entries() {
    let mut cfg = EngineConfig::default();
    cfg.expand_patterns = true;
    let h = harness_with(cfg);

    h.engine
        .register_pattern("com.game", "Worker", DepAction::ForceCpuTime)
        .unwrap();

    // first notify runs the rate-limited expansion, the second one promotes
    // the matched entries into the override set
    h.engine.notify(100, 0xABCD, win(T0)).unwrap();
    assert_eq!(h.engine.overlay_count(), 1);

    h.engine.notify(100, 0xABCD, win(T0 + 16_000_000)).unwrap();
    let req = h.estimator.last_request();
    assert_eq!(req.overrides, vec![102]);

    // re-running the expansion never duplicates the entry
    h.clock.advance(2 * NSEC_PER_SEC);
    h.engine.notify(100, 0xABCD, win(T0 + 32_000_000)).unwrap();
    assert_eq!(h.engine.overlay_count(), 1);
}

#[test]
fn override_set_survives_until_released() {
    let h = harness();
    h.engine.notify(100, 0xABCD, win(T0)).unwrap();

    h.engine.set_override_dependencies(10, &[101, 102]).unwrap();
    h.engine.notify(100, 0xABCD, win(T0 + 16_000_000)).unwrap();
    assert_eq!(h.estimator.last_request().overrides, vec![101, 102]);

    // releasing with an empty set clears the overrides again
    h.engine.set_override_dependencies(10, &[]).unwrap();
    h.engine.notify(100, 0xABCD, win(T0 + 32_000_000)).unwrap();
    assert!(h.estimator.last_request().overrides.is_empty());
}

#[test]
fn override_set_requires_a_live_render() {
    let h = harness();
    assert_eq!(
        h.engine.set_override_dependencies(10, &[101]),
        Err(EngineError::NotFound)
    );
}

#[test]
fn harness_records_can_be_created_and_destroyed() {
    let h = harness();
    h.engine.debug_touch_render(true, 100, 0xF00D).unwrap();
    assert_eq!(h.engine.render_count(), 1);

    h.engine.debug_touch_render(false, 100, 0xF00D).unwrap();
    assert_eq!(h.engine.render_count(), 0);
    assert_eq!(
        h.engine.debug_touch_render(false, 100, 0xF00D),
        Err(EngineError::NotFound)
    );
}

#[test]
fn explicit_frames_account_dependency_runtime() {
    let h = harness();
    h.tasks.set_runtime(101, 1_000);
    h.tasks.set_runtime(102, 2_000);

    h.engine.frame_start(100, 0xABCD, 7, &[101, 102]).unwrap();
    h.tasks.advance_runtime(101, 350);
    h.tasks.advance_runtime(102, 150);

    assert_eq!(h.engine.frame_end(100, 0xABCD, 7).unwrap(), 500);
    assert_eq!(h.engine.frame_count(), 0);
}

#[test]
fn abandoned_frames_are_swept() {
    let h = harness();
    h.engine.frame_start(100, 0xABCD, 1, &[101]).unwrap();

    let outcome = h.engine.sweep_at(T0 + 2 * NSEC_PER_SEC);
    assert_eq!(outcome, SweepOutcome::Swept { renders: 0, frames: 1 });
    assert_eq!(h.engine.frame_count(), 0);
}

#[test]
fn named_dependencies_attach_to_live_renders() {
    let h = harness();
    h.engine.notify(100, 0xABCD, win(T0)).unwrap();

    let added = h
        .engine
        .add_named_dependencies(10, "Worker-1, RenderThread", DepAction::Add)
        .unwrap();
    assert_eq!(added, 2);

    let ids: Vec<Tid> = h
        .engine
        .dependency_list(100, 0xABCD)
        .iter()
        .map(|d| d.tid)
        .collect();
    assert!(ids.contains(&101));
    assert!(ids.contains(&102));
}

#[test]
fn dumps_reflect_live_state() {
    let h = harness();
    h.engine.notify(100, 0xABCD, win(T0)).unwrap();
    h.engine
        .set_policy_override(10, PolicyField::Ema2, Some(true), false)
        .unwrap();
    h.engine
        .register_pattern("com.game", "Worker", DepAction::Add)
        .unwrap();

    assert!(h.engine.dump_policy().contains("tgid:10"));
    assert!(h.engine.dump_spid().contains("Worker"));
    assert!(h.engine.dump_deps().contains("owner:100"));
    assert!(h.engine.dump_runtime().contains("owner:100"));
}
