use std::fmt::Write as _;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::config::EngineConfig;
use crate::error::EngineError;
use crate::estimator::{
    CapacityController, EstimateFlags, EstimateLimits, EstimateRequest, FrameWindows,
    RuntimeEstimator,
};
use crate::metrics::EngineMetrics;
use crate::task::{Pid, SchedClass, TaskSource, Tid};

pub mod dep;
pub mod frames;
pub mod policy;
pub mod recycle;
pub mod render;
pub mod spid;

use dep::DepAction;
use frames::{FrameKey, FrameRegistry};
use policy::{PolicyField, PolicyStore};
use recycle::SweepOutcome;
use render::{BufferId, MasterType, MasterTypes, RenderKey, RenderRecord, RenderRegistry};
use spid::SpidTable;

/// CPU-time estimate returned to the boosting policy from `notify`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FrameEstimate {
    pub raw_cpu_ns: u64,
    pub ema_cpu_ns: u64,
    pub enqueue_cpu_ns: u64,
}

/// One dependency entry as exported to consumers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DepEntry {
    pub tid: Tid,
    pub action: DepAction,
}

/// Process-wide knobs read outside the main lock.
#[derive(Debug, Clone, Copy, Default)]
pub struct Tunables {
    /// External camera-style HAL process, exempt from the dependency filter.
    pub external_hal_pid: Pid,
    /// External server process, exempt from the dependency filter.
    pub external_server_pid: Pid,
    /// Capacity floor applied to ForceBoost dependencies, 0 disables.
    pub force_floor: u32,
}

/// State guarded by the main lock: the render registry with its dependency
/// sets, the name-pattern table, and the globals consulted per frame.
struct MainState {
    renders: RenderRegistry,
    spid: SpidTable,
    /// Requested attribution-window length; applied by the next sweep.
    dep_frames: u32,
    /// Window length currently in effect.
    applied_dep_frames: u32,
    ema_dividend: u32,
    ema2_enabled: bool,
    filter_enabled: bool,
    extra_sub_forced_on: bool,
    extra_sub_forced_off: bool,
    expand_patterns: bool,
    use_alt_helper_prefix: bool,
    last_spid_check_ts: u64,
}

/// Frame dependency graph and CPU-time attribution engine.
///
/// Lock order: the policy store may be taken while holding the main lock
/// (during `notify`); nothing else nests. The frame registry and tunables
/// are always taken on their own.
pub struct Engine {
    cfg: EngineConfig,
    main: Mutex<MainState>,
    frames: Mutex<FrameRegistry>,
    policy: Mutex<PolicyStore>,
    tunables: Mutex<Tunables>,
    estimator: Mutex<Option<Arc<dyn RuntimeEstimator>>>,
    tasks: Arc<dyn TaskSource>,
    caps: Arc<dyn CapacityController>,
    clock: Arc<dyn Clock>,
    metrics: Arc<EngineMetrics>,
    enabled: AtomicBool,
}

impl Engine {
    pub fn new(
        cfg: EngineConfig,
        tasks: Arc<dyn TaskSource>,
        caps: Arc<dyn CapacityController>,
        clock: Arc<dyn Clock>,
        metrics: Arc<EngineMetrics>,
    ) -> Self {
        let main = MainState {
            renders: RenderRegistry::new(),
            spid: SpidTable::new(cfg.max_spid_patterns, cfg.max_wspid_entries),
            dep_frames: cfg.dep_frames,
            applied_dep_frames: cfg.dep_frames,
            ema_dividend: cfg.ema_dividend,
            ema2_enabled: false,
            filter_enabled: false,
            extra_sub_forced_on: false,
            extra_sub_forced_off: false,
            expand_patterns: cfg.expand_patterns,
            use_alt_helper_prefix: false,
            last_spid_check_ts: 0,
        };

        Self {
            enabled: AtomicBool::new(cfg.enabled),
            policy: Mutex::new(PolicyStore::new(cfg.max_policy_commands)),
            cfg,
            main: Mutex::new(main),
            frames: Mutex::new(FrameRegistry::new()),
            tunables: Mutex::new(Tunables::default()),
            estimator: Mutex::new(None),
            tasks,
            caps,
            clock,
            metrics,
        }
    }

    pub fn set_estimator(&self, estimator: Arc<dyn RuntimeEstimator>) {
        *self.estimator.lock() = Some(estimator);
    }

    pub fn clear_estimator(&self) {
        *self.estimator.lock() = None;
    }

    fn estimator(&self) -> Option<Arc<dyn RuntimeEstimator>> {
        self.estimator.lock().clone()
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    /// Enable or disable estimation. Disabling tears down every live record.
    pub fn set_enabled(&self, enabled: bool) {
        let was = self.enabled.swap(enabled, Ordering::AcqRel);
        if was && !enabled {
            self.reset_all();
            info!("engine disabled, records reset");
        } else if !was && enabled {
            info!("engine enabled");
        }
    }

    // --- Frame notification ---

    /// Process one completed frame of a render and return its CPU-time
    /// estimate. Rejected notifications leave every record untouched.
    pub fn notify(
        &self,
        owner: Tid,
        buffer: BufferId,
        windows: FrameWindows,
    ) -> Result<FrameEstimate, EngineError> {
        if let Err(e) = validate_windows(owner, buffer, &windows) {
            self.metrics.estimate_rejected.inc();
            return Err(e);
        }
        if !self.is_enabled() {
            return Err(EngineError::Disabled);
        }
        let Some(process_id) = self.tasks.process_id(owner) else {
            self.metrics.estimate_rejected.inc();
            return Err(EngineError::InvalidParameter("owner thread not found"));
        };

        let estimator = self.estimator();
        let tunables = *self.tunables.lock();
        let now = self.clock.now_ns();

        let mut guard = self.main.lock();
        let main = &mut *guard;
        let key = RenderKey { owner, buffer };

        if main
            .renders
            .get_or_create(
                key,
                MasterTypes::just(MasterType::Primary),
                process_id,
                windows.cur_frame_end,
                true,
            )
            .is_none()
        {
            return Err(EngineError::ResourceExhausted("render registry"));
        }

        // per-process policy override; refreshing the eviction timestamp is
        // the one place the policy lock nests inside the main lock
        let (mut ema2, mut filter) = (main.ema2_enabled, main.filter_enabled);
        {
            let mut policy = self.policy.lock();
            if let Some(cmd) = policy.touch(process_id, windows.cur_frame_end) {
                if let Some(v) = cmd.ema2 {
                    ema2 = v;
                }
                if let Some(v) = cmd.filter {
                    filter = v;
                }
            }
        }

        // pattern entries tagged ForceCpuTime become this frame's overrides;
        // without any, an unmanaged record sheds stale overrides
        let forced = main.spid.force_cpu_time_tids(key);
        {
            let Some(rec) = main.renders.get_mut(&key) else {
                return Err(EngineError::NotFound);
            };
            if forced.is_empty() {
                if !rec.master.contains(MasterType::ExternalA) {
                    rec.overrides.clear();
                }
            } else {
                for tid in forced {
                    rec.overrides.upsert(tid, DepAction::ForceCpuTime);
                }
            }
            rec.prev_frame_end_ts = if windows.prev_frame_end > 0 {
                windows.prev_frame_end
            } else {
                rec.cur_frame_end_ts
            };
            rec.ema2_enabled = ema2;
            rec.filter_enabled = filter;
        }
        main.renders.touch(key, windows.cur_frame_end);

        self.maybe_rescan_helper(main, key, process_id, now, &tunables);

        // forcing the subtraction on is unconditional; the suppression flag
        // only vetoes the long-dequeue trigger
        let dequeue = windows.dequeue_duration();
        let threshold = self.cfg.extra_sub_threshold.as_nanos() as u64;
        let extra_sub =
            main.extra_sub_forced_on || (dequeue > threshold && !main.extra_sub_forced_off);
        if extra_sub && dequeue > threshold {
            debug!(owner, dequeue, "long dequeue, subtracting its window");
        }

        let req = {
            let Some(rec) = main.renders.get(&key) else {
                return Err(EngineError::NotFound);
            };
            EstimateRequest {
                process_id: rec.process_id,
                owner,
                buffer,
                spid: rec.spid,
                limits: EstimateLimits {
                    max_dep_paths: self.cfg.max_dep_paths,
                    max_dep_tasks: self.cfg.max_dep_tasks,
                    dep_frames: main.applied_dep_frames,
                },
                flags: EstimateFlags {
                    ema2_enabled: rec.ema2_enabled,
                    ema_dividend: main.ema_dividend,
                    extra_subtraction: extra_sub,
                    filter_enabled: rec.filter_enabled,
                },
                primary: rec.primary.ids(),
                overrides: rec
                    .overrides
                    .iter()
                    .filter(|&(_, action)| action == DepAction::ForceCpuTime)
                    .map(|(tid, _)| tid)
                    .collect(),
                windows: FrameWindows {
                    prev_frame_end: rec.prev_frame_end_ts,
                    cur_frame_end: rec.cur_frame_end_ts,
                    ..windows
                },
            }
        };

        let Some(estimator) = estimator else {
            self.metrics.estimator_unavailable.inc();
            self.metrics.last_estimate_status.set(-1.0);
            return Err(EngineError::EstimatorUnavailable);
        };

        match estimator.estimate(&req) {
            Ok(est) => {
                if let Some(rec) = main.renders.get_mut(&key) {
                    rec.primary.bulk_replace(&est.dependencies);
                    rec.raw_cpu_ns = est.raw_cpu_ns;
                    rec.ema_cpu_ns = est.ema_cpu_ns;
                }
                self.metrics.renders_live.set(main.renders.len() as f64);
                self.metrics.estimates_ok.inc();
                self.metrics.last_estimate_status.set(0.0);
                debug!(
                    owner,
                    buffer,
                    raw = est.raw_cpu_ns,
                    ema = est.ema_cpu_ns,
                    "frame estimate"
                );
                Ok(FrameEstimate {
                    raw_cpu_ns: est.raw_cpu_ns,
                    ema_cpu_ns: est.ema_cpu_ns,
                    enqueue_cpu_ns: est.enqueue_cpu_ns,
                })
            }
            Err(e) => {
                warn!(owner, buffer, error = %e, "estimator failed");
                self.metrics.estimator_unavailable.inc();
                self.metrics.last_estimate_status.set(-1.0);
                Err(EngineError::EstimatorUnavailable)
            }
        }
    }

    /// Rate-limited per-render maintenance: expand patterns against the
    /// thread group and re-pick the most active helper thread.
    fn maybe_rescan_helper(
        &self,
        main: &mut MainState,
        key: RenderKey,
        process_id: Pid,
        now: u64,
        tunables: &Tunables,
    ) {
        let period = self.cfg.spid_check_period.as_nanos() as u64;
        if now.saturating_sub(main.last_spid_check_ts) < period {
            return;
        }
        main.last_spid_check_ts = now;

        if main.expand_patterns {
            main.spid.expand(
                key,
                process_id,
                self.tasks.as_ref(),
                self.caps.as_ref(),
                tunables.force_floor,
            );
            main.spid.refresh(
                key,
                self.tasks.as_ref(),
                self.caps.as_ref(),
                tunables.force_floor,
            );
            self.metrics
                .wspid_entries
                .set(main.spid.overlay_count() as f64);
        }

        let prefix = if main.use_alt_helper_prefix {
            &self.cfg.helper_prefix_alt
        } else {
            &self.cfg.helper_prefix
        };

        let picked = {
            let Some(rec) = main.renders.get(&key) else {
                return;
            };
            let mut best: Tid = 0;
            let mut best_runtime: u64 = 0;
            for (tid, _) in rec.primary.iter() {
                if tid == rec.key.owner {
                    continue;
                }
                let Some(info) = self.tasks.task(tid) else {
                    continue;
                };
                if info.tgid != rec.process_id || !info.comm.starts_with(prefix.as_str()) {
                    continue;
                }
                if let Some(runtime) = self.tasks.sched_runtime_ns(tid) {
                    if runtime > best_runtime {
                        best_runtime = runtime;
                        best = tid;
                    }
                }
            }
            best
        };

        if picked > 0 {
            if let Some(rec) = main.renders.get_mut(&key) {
                if rec.spid != picked {
                    debug!(owner = key.owner, spid = picked, "helper thread selected");
                }
                rec.spid = picked;
            }
        }
    }

    // --- Dependency export ---

    /// Export the folded, filtered dependency list of a render.
    pub fn dependency_list(&self, owner: Tid, buffer: BufferId) -> Vec<DepEntry> {
        self.dependency_list_capped(owner, buffer, self.cfg.max_dep_tasks)
    }

    pub fn dependency_list_capped(
        &self,
        owner: Tid,
        buffer: BufferId,
        max: usize,
    ) -> Vec<DepEntry> {
        let tunables = *self.tunables.lock();
        let mut guard = self.main.lock();
        let main = &mut *guard;
        self.folded_dep_list(main, &tunables, RenderKey { owner, buffer }, max)
    }

    /// Raw estimator dependency ids of a render, unfolded and unfiltered.
    pub fn dependency_ids(&self, owner: Tid, buffer: BufferId) -> Vec<Tid> {
        let guard = self.main.lock();
        let key = RenderKey { owner, buffer };
        let Some(rec) = guard.renders.get(&key) else {
            return Vec::new();
        };
        let mut ids = rec.primary.ids();
        ids.truncate(self.cfg.max_dep_tasks);
        ids
    }

    pub fn dependency_count(&self, owner: Tid, buffer: BufferId) -> usize {
        self.dependency_list(owner, buffer).len()
    }

    /// Whether any live render depends on the given thread.
    pub fn has_dependency(&self, tid: Tid) -> bool {
        let guard = self.main.lock();
        let found = guard.renders.iter().any(|rec| {
            rec.key.owner == tid
                || rec.spid == tid
                || rec.primary.contains(tid)
                || rec.overrides.contains(tid)
        });
        found
    }

    /// Fold owner, helper, and pattern-overlay entries into the render's
    /// primary set, then export it through the task filter.
    fn folded_dep_list(
        &self,
        main: &mut MainState,
        tunables: &Tunables,
        key: RenderKey,
        max: usize,
    ) -> Vec<DepEntry> {
        let overlay = main.spid.entries_for(key);
        {
            let Some(rec) = main.renders.get_mut(&key) else {
                return Vec::new();
            };
            rec.primary.upsert(key.owner, DepAction::Add);
            if rec.spid > 0 {
                rec.primary.upsert(rec.spid, DepAction::Add);
            }
            for (tid, action) in overlay {
                match action {
                    DepAction::Delete => {
                        rec.primary.remove(tid);
                    }
                    other => rec.primary.upsert(tid, other),
                }
            }
        }

        let Some(rec) = main.renders.get(&key) else {
            return Vec::new();
        };
        let mut out = Vec::with_capacity(rec.primary.len().min(max));
        for (tid, action) in rec.primary.iter() {
            if out.len() >= max {
                break;
            }
            if self.filter_dep_task(tid, rec.process_id, rec.filter_enabled, tunables) {
                continue;
            }
            out.push(DepEntry { tid, action });
        }
        out
    }

    /// Whether a dependency id is dropped from the export: exited tasks,
    /// kernel threads, out-of-process realtime/deadline tasks, and (with the
    /// filter on) anything outside the render's process not on the external
    /// allow-list.
    fn filter_dep_task(
        &self,
        tid: Tid,
        process_id: Pid,
        filter_enabled: bool,
        tunables: &Tunables,
    ) -> bool {
        let Some(info) = self.tasks.task(tid) else {
            return true;
        };
        if info.kernel_thread {
            return true;
        }
        if matches!(info.class, SchedClass::RealTime | SchedClass::Deadline)
            && info.tgid != process_id
        {
            return true;
        }
        if filter_enabled && info.tgid != process_id {
            let allowed = (tunables.external_hal_pid > 0
                && info.tgid == tunables.external_hal_pid)
                || (tunables.external_server_pid > 0
                    && info.tgid == tunables.external_server_pid);
            if !allowed {
                return true;
            }
        }
        false
    }

    // --- External collaborators ---

    /// Replace (or with `None`, destroy) a render record owned by the
    /// external hint service. Hint-service records are exempt from the
    /// staleness sweep.
    pub fn set_external_dependencies(
        &self,
        process_id: Pid,
        owner: Tid,
        buffer: BufferId,
        deps: Option<&[Tid]>,
    ) -> Result<(), EngineError> {
        if process_id <= 0 || owner <= 0 {
            return Err(EngineError::InvalidParameter("ids must be positive"));
        }
        if buffer == 0 {
            return Err(EngineError::InvalidParameter("buffer id must be nonzero"));
        }

        let key = RenderKey { owner, buffer };
        match deps {
            None => {
                let removed = {
                    let mut guard = self.main.lock();
                    let main = &mut *guard;
                    main.spid.purge_render(key, self.caps.as_ref());
                    let removed = main.renders.remove(&key);
                    self.metrics.renders_live.set(main.renders.len() as f64);
                    removed
                };
                let Some(_) = removed else {
                    return Err(EngineError::NotFound);
                };
                if let Some(est) = self.estimator() {
                    est.forget(owner, buffer);
                }
                Ok(())
            }
            Some(list) => {
                let now = self.clock.now_ns();
                let mut guard = self.main.lock();
                let main = &mut *guard;
                {
                    let Some(rec) = main.renders.get_or_create(
                        key,
                        MasterTypes::just(MasterType::ExternalB),
                        process_id,
                        now,
                        true,
                    ) else {
                        return Err(EngineError::ResourceExhausted("render registry"));
                    };
                    rec.process_id = process_id;
                    rec.primary.bulk_replace(list);
                }
                main.renders.touch(key, now);
                self.metrics.renders_live.set(main.renders.len() as f64);
                Ok(())
            }
        }
    }

    /// Force the override dependency set of every primary render belonging
    /// to a process. An empty set releases the renders back to their own
    /// bookkeeping.
    pub fn set_override_dependencies(
        &self,
        process_id: Pid,
        deps: &[Tid],
    ) -> Result<(), EngineError> {
        if process_id <= 0 {
            return Err(EngineError::InvalidParameter("process id must be positive"));
        }

        let mut guard = self.main.lock();
        let mut touched = 0;
        for rec in guard.renders.iter_mut() {
            if rec.process_id != process_id || !rec.master.contains(MasterType::Primary) {
                continue;
            }
            rec.overrides.clear();
            if deps.is_empty() {
                rec.master.clear(MasterType::ExternalA);
            } else {
                for &tid in deps {
                    if tid > 0 {
                        rec.overrides.upsert(tid, DepAction::ForceCpuTime);
                    }
                }
                rec.master.set(MasterType::ExternalA);
            }
            touched += 1;
        }

        if touched == 0 {
            return Err(EngineError::NotFound);
        }
        debug!(process_id, renders = touched, forced = deps.len(), "override set applied");
        Ok(())
    }

    /// Create or destroy a harness-tagged render record directly.
    pub fn debug_touch_render(
        &self,
        add: bool,
        owner: Tid,
        buffer: BufferId,
    ) -> Result<(), EngineError> {
        if owner <= 0 {
            return Err(EngineError::InvalidParameter("owner tid must be positive"));
        }

        let now = self.clock.now_ns();
        let key = RenderKey { owner, buffer };
        let mut guard = self.main.lock();
        let main = &mut *guard;

        if add {
            let process_id = self.tasks.process_id(owner).unwrap_or(owner);
            {
                let Some(rec) = main.renders.get_or_create(
                    key,
                    MasterTypes::just(MasterType::Harness),
                    process_id,
                    now,
                    true,
                ) else {
                    return Err(EngineError::ResourceExhausted("render registry"));
                };
                rec.primary.upsert(owner, DepAction::Add);
            }
            main.renders.touch(key, now);
            self.metrics.renders_live.set(main.renders.len() as f64);
            Ok(())
        } else {
            main.spid.purge_render(key, self.caps.as_ref());
            let removed = main.renders.remove(&key);
            self.metrics.renders_live.set(main.renders.len() as f64);
            let Some(_) = removed else {
                return Err(EngineError::NotFound);
            };
            if let Some(est) = self.estimator() {
                est.forget(owner, buffer);
            }
            Ok(())
        }
    }

    /// Attach named threads of a process as overlay dependencies to all of
    /// its renders. Returns how many entries were added.
    pub fn add_named_dependencies(
        &self,
        process_id: Pid,
        names: &str,
        action: DepAction,
    ) -> Result<usize, EngineError> {
        if process_id <= 0 {
            return Err(EngineError::InvalidParameter("process id must be positive"));
        }

        let mut guard = self.main.lock();
        let main = &mut *guard;
        let renders: Vec<RenderKey> = main
            .renders
            .iter()
            .filter(|rec| rec.process_id == process_id)
            .map(|rec| rec.key)
            .collect();
        if renders.is_empty() {
            return Err(EngineError::NotFound);
        }

        let added = main
            .spid
            .add_named(process_id, &renders, names, action, self.tasks.as_ref());
        self.metrics
            .wspid_entries
            .set(main.spid.overlay_count() as f64);
        Ok(added)
    }

    /// Register a name pattern (or reset the table with the "0"/"0"
    /// sentinel).
    pub fn register_pattern(
        &self,
        process: &str,
        thread: &str,
        action: DepAction,
    ) -> Result<(), EngineError> {
        self.main.lock().spid.register_pattern(process, thread, action)
    }

    /// Set or clear (with `None`) one per-process policy override field.
    /// Non-persisted commands vanish once both fields are back at their
    /// defaults; persisted ones stay as preferred eviction victims.
    pub fn set_policy_override(
        &self,
        process_id: Pid,
        field: PolicyField,
        value: Option<bool>,
        persist: bool,
    ) -> Result<(), EngineError> {
        if process_id <= 0 {
            return Err(EngineError::InvalidParameter("process id must be positive"));
        }
        let ts = self.clock.now_ns();
        self.policy
            .lock()
            .set_field(process_id, field, value, ts, persist);
        Ok(())
    }

    // --- Explicit frames ---

    /// Open an explicit frame, snapshotting its dependencies' runtimes.
    pub fn frame_start(
        &self,
        owner: Tid,
        buffer: BufferId,
        frame: u64,
        deps: &[Tid],
    ) -> Result<(), EngineError> {
        if !self.is_enabled() {
            return Err(EngineError::Disabled);
        }
        if owner <= 0 {
            return Err(EngineError::InvalidParameter("owner tid must be positive"));
        }
        let Some(process_id) = self.tasks.process_id(owner) else {
            return Err(EngineError::InvalidParameter("owner thread not found"));
        };

        let ts = self.clock.now_ns();
        let key = FrameKey {
            owner,
            buffer,
            frame,
        };
        self.frames
            .lock()
            .start(key, process_id, deps, ts, self.tasks.as_ref())
    }

    /// Close an explicit frame and return the summed dependency CPU time.
    pub fn frame_end(&self, owner: Tid, buffer: BufferId, frame: u64) -> Result<u64, EngineError> {
        if !self.is_enabled() {
            return Err(EngineError::Disabled);
        }

        let key = FrameKey {
            owner,
            buffer,
            frame,
        };
        let total = self.frames.lock().end(&key, self.tasks.as_ref())?;
        if let Some(est) = self.estimator() {
            est.forget(owner, buffer);
        }
        debug!(owner, buffer, frame, total, "explicit frame closed");
        Ok(total)
    }

    /// Drop an explicit frame without accounting.
    pub fn frame_cancel(&self, owner: Tid, buffer: BufferId, frame: u64) -> bool {
        let key = FrameKey {
            owner,
            buffer,
            frame,
        };
        self.frames.lock().cancel(&key)
    }

    // --- Recycling ---

    pub fn sweep(&self) -> SweepOutcome {
        self.sweep_at(self.clock.now_ns())
    }

    /// One recycler pass at the given timestamp. A pending attribution-window
    /// change resets both registries exactly once; otherwise records idle for
    /// a full recycle window are reclaimed.
    pub fn sweep_at(&self, now: u64) -> SweepOutcome {
        let estimator = self.estimator();
        let cutoff = now.saturating_sub(self.cfg.recycle_window.as_nanos() as u64);

        let mut removed: Vec<RenderRecord> = Vec::new();
        let window_changed = {
            let mut guard = self.main.lock();
            let main = &mut *guard;

            let changed = main.dep_frames != main.applied_dep_frames;
            if changed {
                let applied = recycle::clamp_dep_frames(
                    main.dep_frames,
                    self.cfg.dep_frames_min,
                    self.cfg.dep_frames_max,
                    self.cfg.dep_frames,
                );
                main.dep_frames = applied;
                main.applied_dep_frames = applied;
                removed = main.renders.drain();
                for rec in &removed {
                    main.spid.purge_render(rec.key, self.caps.as_ref());
                }
            } else {
                while let Some(key) = main.renders.pop_stale(cutoff) {
                    main.spid.purge_render(key, self.caps.as_ref());
                    if let Some(rec) = main.renders.remove(&key) {
                        removed.push(rec);
                    }
                }
            }
            self.metrics.renders_live.set(main.renders.len() as f64);
            self.metrics
                .wspid_entries
                .set(main.spid.overlay_count() as f64);
            changed
        };

        for rec in &removed {
            if let Some(est) = &estimator {
                est.forget(rec.key.owner, rec.key.buffer);
            }
            debug!(owner = rec.key.owner, buffer = rec.key.buffer, "render recycled");
        }

        let stale_frames: Vec<FrameKey> = {
            let mut frames = self.frames.lock();
            if window_changed {
                frames.clear_all()
            } else {
                frames.pop_stale(cutoff)
            }
        };
        for key in &stale_frames {
            if let Some(est) = &estimator {
                est.forget(key.owner, key.buffer);
            }
        }

        if window_changed {
            self.metrics.policy_resets.inc();
            info!(
                renders = removed.len(),
                frames = stale_frames.len(),
                "attribution window changed, registries reset"
            );
            SweepOutcome::WindowChanged
        } else {
            if !removed.is_empty() {
                self.metrics.renders_recycled.inc_by(removed.len() as f64);
            }
            if !stale_frames.is_empty() {
                self.metrics
                    .frames_recycled
                    .inc_by(stale_frames.len() as f64);
            }
            SweepOutcome::Swept {
                renders: removed.len(),
                frames: stale_frames.len(),
            }
        }
    }

    /// Tear down every render and frame record.
    pub fn reset_all(&self) {
        let estimator = self.estimator();

        let removed = {
            let mut guard = self.main.lock();
            let main = &mut *guard;
            let removed = main.renders.drain();
            for rec in &removed {
                main.spid.purge_render(rec.key, self.caps.as_ref());
            }
            self.metrics.renders_live.set(0.0);
            self.metrics
                .wspid_entries
                .set(main.spid.overlay_count() as f64);
            removed
        };
        let frames = self.frames.lock().clear_all();

        if let Some(est) = &estimator {
            for rec in &removed {
                est.forget(rec.key.owner, rec.key.buffer);
            }
            for key in &frames {
                est.forget(key.owner, key.buffer);
            }
        }
    }

    // --- Tunables ---

    /// Apply one named tunable write. Out-of-range values are rejected, not
    /// clamped.
    pub fn apply_tunable(&self, name: &str, value: i64) -> Result<(), EngineError> {
        match name {
            "enabled" => {
                self.set_enabled(value != 0);
                Ok(())
            }
            "dep_frames" => {
                let v = u32::try_from(value)
                    .map_err(|_| EngineError::InvalidParameter("dep_frames out of range"))?;
                if v < self.cfg.dep_frames_min || v > self.cfg.dep_frames_max {
                    return Err(EngineError::InvalidParameter("dep_frames out of range"));
                }
                self.main.lock().dep_frames = v;
                Ok(())
            }
            "ema_dividend" => {
                if !(1..=9).contains(&value) {
                    return Err(EngineError::InvalidParameter("ema_dividend out of range"));
                }
                self.main.lock().ema_dividend = value as u32;
                Ok(())
            }
            "ema2_enabled" => {
                self.main.lock().ema2_enabled = value != 0;
                Ok(())
            }
            "filter_dep_tasks" => {
                self.main.lock().filter_enabled = value != 0;
                Ok(())
            }
            "extra_sub" => {
                self.main.lock().extra_sub_forced_on = value != 0;
                Ok(())
            }
            "force_no_extra_sub" => {
                self.main.lock().extra_sub_forced_off = value != 0;
                Ok(())
            }
            "expand_patterns" => {
                let mut guard = self.main.lock();
                let main = &mut *guard;
                main.expand_patterns = value != 0;
                if value == 0 {
                    main.spid.clear_overlay(self.caps.as_ref());
                    self.metrics.wspid_entries.set(0.0);
                }
                Ok(())
            }
            "use_alt_helper_prefix" => {
                self.main.lock().use_alt_helper_prefix = value != 0;
                Ok(())
            }
            "external_hal_pid" => {
                let v = Pid::try_from(value)
                    .map_err(|_| EngineError::InvalidParameter("pid out of range"))?;
                if v < 0 {
                    return Err(EngineError::InvalidParameter("pid out of range"));
                }
                self.tunables.lock().external_hal_pid = v;
                Ok(())
            }
            "external_server_pid" => {
                let v = Pid::try_from(value)
                    .map_err(|_| EngineError::InvalidParameter("pid out of range"))?;
                if v < 0 {
                    return Err(EngineError::InvalidParameter("pid out of range"));
                }
                self.tunables.lock().external_server_pid = v;
                Ok(())
            }
            "force_floor" => {
                if !(0..=100).contains(&value) {
                    return Err(EngineError::InvalidParameter("force_floor out of range"));
                }
                self.tunables.lock().force_floor = value as u32;
                Ok(())
            }
            _ => Err(EngineError::InvalidParameter("unknown tunable")),
        }
    }

    pub fn tunables(&self) -> Tunables {
        *self.tunables.lock()
    }

    pub fn dep_frames(&self) -> u32 {
        self.main.lock().applied_dep_frames
    }

    // --- Introspection ---

    pub fn render_count(&self) -> usize {
        self.main.lock().renders.len()
    }

    pub fn frame_count(&self) -> usize {
        self.frames.lock().len()
    }

    pub fn policy_count(&self) -> usize {
        self.policy.lock().len()
    }

    pub fn pattern_count(&self) -> usize {
        self.main.lock().spid.pattern_count()
    }

    pub fn overlay_count(&self) -> usize {
        self.main.lock().spid.overlay_count()
    }

    /// Clone of one render record, for inspection.
    pub fn render_snapshot(&self, owner: Tid, buffer: BufferId) -> Option<RenderRecord> {
        self.main
            .lock()
            .renders
            .get(&RenderKey { owner, buffer })
            .cloned()
    }

    // --- Text dumps ---

    pub fn dump_policy(&self) -> String {
        let policy = self.policy.lock();
        let mut out = String::new();
        for (i, cmd) in policy.iter().enumerate() {
            let _ = writeln!(
                out,
                "{}th\ttgid:{}\tema2:{}\tfilter:{}\tts:{}",
                i + 1,
                cmd.process_id,
                fmt_override(cmd.ema2),
                fmt_override(cmd.filter),
                cmd.last_touched_ts
            );
        }
        out
    }

    pub fn dump_spid(&self) -> String {
        let guard = self.main.lock();
        let mut out = String::from("patterns:\n");
        for p in guard.spid.patterns() {
            let _ = writeln!(out, "  {:<15} {:<15} {}", p.process, p.thread, p.action);
        }
        out.push_str("entries:\n");
        for e in guard.spid.overlay() {
            let _ = writeln!(
                out,
                "  tgid:{} owner:{} buf:{:#x} tid:{} action:{} ({} / {})",
                e.process_id, e.owner, e.buffer, e.tid, e.action, e.process, e.thread
            );
        }
        out
    }

    pub fn dump_deps(&self) -> String {
        let tunables = *self.tunables.lock();
        let mut guard = self.main.lock();
        let main = &mut *guard;

        let keys: Vec<RenderKey> = main.renders.iter().map(|rec| rec.key).collect();
        let mut out = String::new();
        for key in keys {
            let deps = self.folded_dep_list(main, &tunables, key, self.cfg.max_dep_tasks);
            let Some(rec) = main.renders.get(&key) else {
                continue;
            };
            let _ = writeln!(
                out,
                "render owner:{} buf:{:#x} tags:{} deps:{}",
                key.owner,
                key.buffer,
                rec.master,
                deps.len()
            );
            for d in deps {
                let _ = writeln!(out, "  {} ({})", d.tid, d.action);
            }
        }
        out
    }

    pub fn dump_runtime(&self) -> String {
        let guard = self.main.lock();
        let mut out = String::new();
        for rec in guard.renders.iter() {
            let _ = writeln!(
                out,
                "owner:{} buf:{:#x} spid:{} raw:{} ema:{}",
                rec.key.owner, rec.key.buffer, rec.spid, rec.raw_cpu_ns, rec.ema_cpu_ns
            );
        }
        out
    }
}

fn fmt_override(v: Option<bool>) -> &'static str {
    match v {
        None => "default",
        Some(true) => "on",
        Some(false) => "off",
    }
}

/// Reject malformed frame notifications before any state is touched.
fn validate_windows(owner: Tid, buffer: BufferId, w: &FrameWindows) -> Result<(), EngineError> {
    if owner <= 0 {
        return Err(EngineError::InvalidParameter("owner tid must be positive"));
    }
    if buffer == 0 {
        return Err(EngineError::InvalidParameter("buffer id must be nonzero"));
    }
    if w.dequeue_end < w.dequeue_start {
        return Err(EngineError::InvalidParameter("dequeue window inverted"));
    }
    if w.enqueue_end < w.enqueue_start {
        return Err(EngineError::InvalidParameter("enqueue window inverted"));
    }
    if w.dequeue_end > w.enqueue_start {
        return Err(EngineError::InvalidParameter("dequeue overlaps enqueue"));
    }
    if w.prev_frame_end > w.cur_frame_end {
        return Err(EngineError::InvalidParameter("frame end regressed"));
    }
    Ok(())
}
