use std::collections::HashMap;

use crate::error::EngineError;
use crate::task::{Pid, TaskSource, Tid};

use super::render::BufferId;

/// Identity of one explicit frame: render identity plus caller frame number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FrameKey {
    pub owner: Tid,
    pub buffer: BufferId,
    pub frame: u64,
}

/// Frame-scoped record capturing each dependency's cumulative runtime at
/// frame start.
pub struct FrameRecord {
    pub key: FrameKey,
    pub process_id: Pid,
    pub start_ts: u64,
    dep_runtimes: Vec<(Tid, u64)>,
}

impl FrameRecord {
    pub fn dependency_count(&self) -> usize {
        self.dep_runtimes.len()
    }
}

/// Registry of in-flight explicit frames.
///
/// Unlike render records, frame records are bounded by their own start/end
/// calls; the staleness sweep only catches frames whose end never arrived.
#[derive(Default)]
pub struct FrameRegistry {
    frames: HashMap<FrameKey, FrameRecord>,
}

impl FrameRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn get(&self, key: &FrameKey) -> Option<&FrameRecord> {
        self.frames.get(key)
    }

    /// Open a frame, snapshotting the current runtime of every declared
    /// dependency. Exited dependencies are silently dropped from the set.
    pub fn start(
        &mut self,
        key: FrameKey,
        process_id: Pid,
        deps: &[Tid],
        ts: u64,
        tasks: &dyn TaskSource,
    ) -> Result<(), EngineError> {
        if self.frames.contains_key(&key) {
            return Err(EngineError::InvalidParameter("frame already started"));
        }

        let mut dep_runtimes = Vec::with_capacity(deps.len());
        for &tid in deps {
            if let Some(runtime) = tasks.sched_runtime_ns(tid) {
                dep_runtimes.push((tid, runtime));
            }
        }

        self.frames.insert(
            key,
            FrameRecord {
                key,
                process_id,
                start_ts: ts,
                dep_runtimes,
            },
        );
        Ok(())
    }

    /// Close a frame, returning the summed runtime delta of its dependencies
    /// since the start snapshot. Dependencies that exited mid-frame
    /// contribute nothing.
    pub fn end(&mut self, key: &FrameKey, tasks: &dyn TaskSource) -> Result<u64, EngineError> {
        let rec = self.frames.remove(key).ok_or(EngineError::NotFound)?;

        let mut total: u64 = 0;
        for (tid, start_runtime) in rec.dep_runtimes {
            if let Some(now) = tasks.sched_runtime_ns(tid) {
                total += now.saturating_sub(start_runtime);
            }
        }
        Ok(total)
    }

    /// Drop a frame without accounting.
    pub fn cancel(&mut self, key: &FrameKey) -> bool {
        self.frames.remove(key).is_some()
    }

    /// Remove frames whose start is at or before `cutoff`.
    pub fn pop_stale(&mut self, cutoff: u64) -> Vec<FrameKey> {
        let stale: Vec<FrameKey> = self
            .frames
            .values()
            .filter(|f| f.start_ts <= cutoff)
            .map(|f| f.key)
            .collect();
        for key in &stale {
            self.frames.remove(key);
        }
        stale
    }

    pub fn clear_all(&mut self) -> Vec<FrameKey> {
        let keys: Vec<FrameKey> = self.frames.keys().copied().collect();
        self.frames.clear();
        keys
    }
}
