use std::collections::BTreeMap;

use crate::task::Pid;

/// Which override field a policy write targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PolicyField {
    Ema2,
    FilterDepTasks,
}

/// Per-process overrides of the global smoothing and filter settings.
/// `None` means "follow the global default".
#[derive(Debug, Clone, Copy)]
pub struct PolicyCommand {
    pub process_id: Pid,
    pub ema2: Option<bool>,
    pub filter: Option<bool>,
    pub last_touched_ts: u64,
}

impl PolicyCommand {
    fn new(process_id: Pid, ts: u64) -> Self {
        Self {
            process_id,
            ema2: None,
            filter: None,
            last_touched_ts: ts,
        }
    }

    pub fn is_default(&self) -> bool {
        self.ema2.is_none() && self.filter.is_none()
    }
}

/// Capacity-bounded store of per-process policy overrides, ordered by
/// process id.
pub struct PolicyStore {
    commands: BTreeMap<Pid, PolicyCommand>,
    capacity: usize,
}

impl PolicyStore {
    pub fn new(capacity: usize) -> Self {
        Self {
            commands: BTreeMap::new(),
            capacity,
        }
    }

    pub fn len(&self) -> usize {
        self.commands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    pub fn get(&self, process_id: Pid) -> Option<&PolicyCommand> {
        self.commands.get(&process_id)
    }

    /// Read a process's overrides during a frame notification, refreshing its
    /// eviction timestamp.
    pub fn touch(&mut self, process_id: Pid, ts: u64) -> Option<PolicyCommand> {
        let cmd = self.commands.get_mut(&process_id)?;
        cmd.last_touched_ts = ts;
        Some(*cmd)
    }

    /// Set one override field for a process. A `None` value reverts the field
    /// to the global default. Without `persist`, a command left with both
    /// fields default is dropped immediately (ephemeral one-shot override);
    /// persisted commands stay and become preferred eviction victims.
    pub fn set_field(
        &mut self,
        process_id: Pid,
        field: PolicyField,
        value: Option<bool>,
        ts: u64,
        persist: bool,
    ) {
        if !self.commands.contains_key(&process_id) {
            if value.is_none() {
                return;
            }
            if self.commands.len() >= self.capacity {
                self.evict_one();
            }
            self.commands
                .insert(process_id, PolicyCommand::new(process_id, ts));
        }

        let Some(cmd) = self.commands.get_mut(&process_id) else {
            return;
        };
        match field {
            PolicyField::Ema2 => cmd.ema2 = value,
            PolicyField::FilterDepTasks => cmd.filter = value,
        }
        cmd.last_touched_ts = ts;

        if !persist && cmd.is_default() {
            self.commands.remove(&process_id);
        }
    }

    pub fn remove(&mut self, process_id: Pid) -> bool {
        self.commands.remove(&process_id).is_some()
    }

    pub fn iter(&self) -> impl Iterator<Item = &PolicyCommand> {
        self.commands.values()
    }

    /// Evict exactly one command: the oldest-touched with both fields unset,
    /// falling back to the oldest-touched overall.
    fn evict_one(&mut self) {
        let victim = self
            .commands
            .values()
            .filter(|c| c.is_default())
            .min_by_key(|c| c.last_touched_ts)
            .or_else(|| self.commands.values().min_by_key(|c| c.last_touched_ts))
            .map(|c| c.process_id);

        if let Some(pid) = victim {
            self.commands.remove(&pid);
        }
    }
}
