use tracing::debug;

use crate::error::EngineError;
use crate::estimator::CapacityController;
use crate::task::{Pid, TaskSource, Tid};

use super::dep::DepAction;
use super::render::{BufferId, RenderKey};

/// Pattern process-name wildcard: skip the process check entirely.
pub const PROCESS_WILDCARD: &str = "*";

/// Registering ("0", "0") clears the whole pattern table.
const RESET_SENTINEL: &str = "0";

/// A name-pattern rule: renders of a matching process get every thread whose
/// name starts with `thread` added as a dependency with `action`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpidPattern {
    pub process: String,
    pub thread: String,
    pub action: DepAction,
}

/// Concrete expansion of a pattern against one render's live threads.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WspidEntry {
    pub process_id: Pid,
    pub owner: Tid,
    pub buffer: BufferId,
    pub tid: Tid,
    pub action: DepAction,
    pub process: String,
    pub thread: String,
}

/// Name-pattern table plus its expanded per-render overlay.
pub struct SpidTable {
    patterns: Vec<SpidPattern>,
    overlay: Vec<WspidEntry>,
    max_patterns: usize,
    max_overlay: usize,
}

impl SpidTable {
    pub fn new(max_patterns: usize, max_overlay: usize) -> Self {
        Self {
            patterns: Vec::new(),
            overlay: Vec::new(),
            max_patterns,
            max_overlay,
        }
    }

    pub fn pattern_count(&self) -> usize {
        self.patterns.len()
    }

    pub fn overlay_count(&self) -> usize {
        self.overlay.len()
    }

    pub fn patterns(&self) -> &[SpidPattern] {
        &self.patterns
    }

    pub fn overlay(&self) -> &[WspidEntry] {
        &self.overlay
    }

    /// Register a pattern, or reset the table on the ("0", "0") sentinel.
    pub fn register_pattern(
        &mut self,
        process: &str,
        thread: &str,
        action: DepAction,
    ) -> Result<(), EngineError> {
        if process == RESET_SENTINEL && thread == RESET_SENTINEL {
            self.patterns.clear();
            debug!("name pattern table reset");
            return Ok(());
        }

        if process.is_empty() || thread.is_empty() {
            return Err(EngineError::InvalidParameter("empty pattern name"));
        }
        if self.patterns.len() >= self.max_patterns {
            return Err(EngineError::ResourceExhausted("pattern table full"));
        }

        self.patterns.push(SpidPattern {
            process: process.to_string(),
            thread: thread.to_string(),
            action,
        });
        Ok(())
    }

    fn contains(&self, process_id: Pid, owner: Tid, buffer: BufferId, tid: Tid) -> bool {
        self.overlay.iter().any(|e| {
            e.process_id == process_id && e.owner == owner && e.buffer == buffer && e.tid == tid
        })
    }

    /// Expand the pattern table against one render's thread group. Inserts
    /// past the overlay cap are silent no-ops; duplicates are skipped.
    /// ForceBoost entries get their capacity floor applied on insert.
    pub fn expand(
        &mut self,
        key: RenderKey,
        process_id: Pid,
        tasks: &dyn TaskSource,
        caps: &dyn CapacityController,
        force_floor: u32,
    ) {
        if self.patterns.is_empty() {
            return;
        }

        let process_comm = tasks
            .task(process_id)
            .map(|t| t.comm)
            .unwrap_or_default();

        for sibling in tasks.thread_group(process_id) {
            for pattern in &self.patterns {
                if pattern.process != PROCESS_WILDCARD && !process_comm.contains(&pattern.process) {
                    continue;
                }
                if !sibling.comm.starts_with(&pattern.thread) {
                    continue;
                }
                if self.overlay.len() >= self.max_overlay
                    || self.contains(process_id, key.owner, key.buffer, sibling.tid)
                {
                    continue;
                }

                if pattern.action == DepAction::ForceBoost && force_floor > 0 {
                    caps.set_floor(sibling.tid, force_floor);
                }

                debug!(
                    tid = sibling.tid,
                    comm = %sibling.comm,
                    action = %pattern.action,
                    "pattern matched dependency"
                );
                self.overlay.push(WspidEntry {
                    process_id,
                    owner: key.owner,
                    buffer: key.buffer,
                    tid: sibling.tid,
                    action: pattern.action,
                    process: process_comm.clone(),
                    thread: sibling.comm.clone(),
                });
            }
        }
    }

    /// Drop overlay entries of this render whose task has exited, clearing
    /// their boost floors, and re-apply floors for the survivors.
    pub fn refresh(
        &mut self,
        key: RenderKey,
        tasks: &dyn TaskSource,
        caps: &dyn CapacityController,
        force_floor: u32,
    ) {
        self.overlay.retain(|e| {
            if e.owner != key.owner || e.buffer != key.buffer {
                return true;
            }
            if tasks.task(e.tid).is_some() {
                if e.action == DepAction::ForceBoost && force_floor > 0 {
                    caps.set_floor(e.tid, force_floor);
                }
                true
            } else {
                if e.action == DepAction::ForceBoost {
                    caps.clear_floor(e.tid);
                }
                false
            }
        });
    }

    /// Remove all overlay entries of a destroyed render.
    pub fn purge_render(&mut self, key: RenderKey, caps: &dyn CapacityController) {
        self.overlay.retain(|e| {
            if e.owner != key.owner || e.buffer != key.buffer {
                return true;
            }
            if e.action == DepAction::ForceBoost {
                caps.clear_floor(e.tid);
            }
            false
        });
    }

    /// Drop the whole overlay, clearing any boost floors. Used when pattern
    /// expansion is switched off.
    pub fn clear_overlay(&mut self, caps: &dyn CapacityController) {
        for e in &self.overlay {
            if e.action == DepAction::ForceBoost {
                caps.clear_floor(e.tid);
            }
        }
        self.overlay.clear();
    }

    /// Overlay entries of this render tagged ForceCpuTime.
    pub fn force_cpu_time_tids(&self, key: RenderKey) -> Vec<Tid> {
        self.overlay
            .iter()
            .filter(|e| e.owner == key.owner && e.buffer == key.buffer)
            .filter(|e| e.action == DepAction::ForceCpuTime)
            .map(|e| e.tid)
            .collect()
    }

    /// Overlay entries scoped to one render.
    pub fn entries_for(&self, key: RenderKey) -> Vec<(Tid, DepAction)> {
        self.overlay
            .iter()
            .filter(|e| e.owner == key.owner && e.buffer == key.buffer)
            .map(|e| (e.tid, e.action))
            .collect()
    }

    /// Resolve comma-separated thread names inside one process and attach the
    /// matches to the given renders. Returns how many entries were added.
    pub fn add_named(
        &mut self,
        process_id: Pid,
        renders: &[RenderKey],
        names: &str,
        action: DepAction,
        tasks: &dyn TaskSource,
    ) -> usize {
        let process_comm = tasks
            .task(process_id)
            .map(|t| t.comm)
            .unwrap_or_default();

        let mut matched: Vec<(Tid, String)> = Vec::new();
        for name in names.split(',') {
            let name = name.trim();
            if name.is_empty() {
                continue;
            }
            for sibling in tasks.thread_group(process_id) {
                if sibling.comm == name {
                    matched.push((sibling.tid, sibling.comm));
                }
            }
        }

        let mut added = 0;
        for &key in renders {
            for (tid, comm) in &matched {
                if self.overlay.len() >= self.max_overlay
                    || self.contains(process_id, key.owner, key.buffer, *tid)
                {
                    continue;
                }
                self.overlay.push(WspidEntry {
                    process_id,
                    owner: key.owner,
                    buffer: key.buffer,
                    tid: *tid,
                    action,
                    process: process_comm.clone(),
                    thread: comm.clone(),
                });
                added += 1;
            }
        }
        added
    }
}
