use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use thiserror::Error;
use tracing::debug;

use crate::engine::render::BufferId;
use crate::task::{Pid, TaskSource, Tid};

/// Timing windows for one frame notification, in nanoseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FrameWindows {
    pub dequeue_start: u64,
    pub dequeue_end: u64,
    pub enqueue_start: u64,
    pub enqueue_end: u64,
    pub prev_frame_end: u64,
    pub cur_frame_end: u64,
}

impl FrameWindows {
    pub fn dequeue_duration(&self) -> u64 {
        self.dequeue_end.saturating_sub(self.dequeue_start)
    }
}

/// Size limits forwarded to the estimator.
#[derive(Debug, Clone, Copy)]
pub struct EstimateLimits {
    pub max_dep_paths: usize,
    pub max_dep_tasks: usize,
    /// Number of frames in the attribution window.
    pub dep_frames: u32,
}

/// Behavior flags forwarded to the estimator.
#[derive(Debug, Clone, Copy)]
pub struct EstimateFlags {
    pub ema2_enabled: bool,
    /// Weight of the newest frame in tenths, 1..=9.
    pub ema_dividend: u32,
    /// Subtract the dequeue window from attributed time.
    pub extra_subtraction: bool,
    pub filter_enabled: bool,
}

/// Full context handed to the estimator for one frame.
#[derive(Debug, Clone)]
pub struct EstimateRequest {
    pub process_id: Pid,
    pub owner: Tid,
    pub buffer: BufferId,
    /// Most active helper thread, 0 when unknown.
    pub spid: Tid,
    pub limits: EstimateLimits,
    pub flags: EstimateFlags,
    /// Candidate dependency set accumulated so far.
    pub primary: Vec<Tid>,
    /// Externally forced dependency ids.
    pub overrides: Vec<Tid>,
    pub windows: FrameWindows,
}

/// Result of one estimation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Estimate {
    pub raw_cpu_ns: u64,
    pub ema_cpu_ns: u64,
    pub dequeue_cpu_ns: u64,
    pub enqueue_cpu_ns: u64,
    /// Refreshed dependency set; replaces the render's primary set wholesale.
    pub dependencies: Vec<Tid>,
}

#[derive(Debug, Error)]
pub enum EstimatorError {
    #[error("estimator rejected request: {0}")]
    Rejected(String),

    #[error("estimator internal failure: {0}")]
    Internal(String),
}

/// Injected estimation strategy.
///
/// Called synchronously under the render-registry lock: implementations must
/// not block and must not call back into the engine.
pub trait RuntimeEstimator: Send + Sync {
    fn estimate(&self, req: &EstimateRequest) -> Result<Estimate, EstimatorError>;

    /// A render record was destroyed; drop any per-render state.
    fn forget(&self, _owner: Tid, _buffer: BufferId) {}
}

/// Seam for applying per-thread minimum capacity floors to forced-boost
/// dependencies.
pub trait CapacityController: Send + Sync {
    fn set_floor(&self, tid: Tid, min_cap: u32);
    fn clear_floor(&self, tid: Tid);
}

/// Controller for platforms without a capacity backend.
#[derive(Debug, Default)]
pub struct NoopCapacityController;

impl CapacityController for NoopCapacityController {
    fn set_floor(&self, tid: Tid, min_cap: u32) {
        debug!(tid, min_cap, "capacity floor (noop)");
    }

    fn clear_floor(&self, tid: Tid) {
        debug!(tid, "clear capacity floor (noop)");
    }
}

#[derive(Default)]
struct RenderEstState {
    last_runtimes: HashMap<Tid, u64>,
    ema_ns: u64,
}

/// Reference estimator: per-dependency scheduled-runtime deltas between
/// consecutive frames, smoothed with a tenths-weighted moving average.
///
/// ema2 has no separate model here; both flags share the same average.
pub struct SchedRuntimeEstimator {
    tasks: Arc<dyn TaskSource>,
    state: Mutex<HashMap<(Tid, BufferId), RenderEstState>>,
}

impl SchedRuntimeEstimator {
    pub fn new(tasks: Arc<dyn TaskSource>) -> Self {
        Self {
            tasks,
            state: Mutex::new(HashMap::new()),
        }
    }
}

impl RuntimeEstimator for SchedRuntimeEstimator {
    fn estimate(&self, req: &EstimateRequest) -> Result<Estimate, EstimatorError> {
        if req.process_id <= 0 {
            return Err(EstimatorError::Rejected("no owning process".to_string()));
        }

        let mut state = self.state.lock();
        let st = state.entry((req.owner, req.buffer)).or_default();

        // owner and overrides always participate, capped at the task limit
        let mut deps: Vec<Tid> = Vec::with_capacity(req.primary.len() + req.overrides.len() + 1);
        deps.push(req.owner);
        for &tid in req.primary.iter().chain(req.overrides.iter()) {
            if deps.len() >= req.limits.max_dep_tasks {
                break;
            }
            if !deps.contains(&tid) {
                deps.push(tid);
            }
        }

        let mut raw: u64 = 0;
        let mut live = Vec::with_capacity(deps.len());
        for &tid in &deps {
            // exited tasks silently leave the set
            let Some(now) = self.tasks.sched_runtime_ns(tid) else {
                continue;
            };
            if let Some(prev) = st.last_runtimes.get(&tid) {
                raw += now.saturating_sub(*prev);
            }
            st.last_runtimes.insert(tid, now);
            live.push(tid);
        }
        st.last_runtimes.retain(|tid, _| live.contains(tid));

        let dequeue_cpu_ns = if req.flags.extra_subtraction {
            raw.min(req.windows.dequeue_duration())
        } else {
            0
        };
        let attributed = raw - dequeue_cpu_ns;

        let dividend = u64::from(req.flags.ema_dividend.clamp(1, 9));
        let ema = if st.ema_ns == 0 {
            attributed
        } else {
            (attributed * dividend + st.ema_ns * (10 - dividend)) / 10
        };
        st.ema_ns = ema;

        Ok(Estimate {
            raw_cpu_ns: attributed,
            ema_cpu_ns: ema,
            dequeue_cpu_ns,
            enqueue_cpu_ns: attributed,
            dependencies: live,
        })
    }

    fn forget(&self, owner: Tid, buffer: BufferId) {
        self.state.lock().remove(&(owner, buffer));
    }
}
