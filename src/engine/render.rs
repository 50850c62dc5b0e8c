use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::fmt;

use crate::task::{Pid, Tid};

use super::dep::DepSet;

/// Graphics buffer identity, opaque to the engine.
pub type BufferId = u64;

/// Which collaborator created or touched a render record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MasterType {
    /// The frame-pacing core driving `notify`.
    Primary,
    /// External manager forcing override dependency sets.
    ExternalA,
    /// External hint service owning its records outright.
    ExternalB,
    /// Test harness records.
    Harness,
}

impl MasterType {
    fn bit(self) -> u8 {
        match self {
            Self::Primary => 1 << 0,
            Self::ExternalA => 1 << 1,
            Self::ExternalB => 1 << 2,
            Self::Harness => 1 << 3,
        }
    }

    fn tag(self) -> char {
        match self {
            Self::Primary => 'P',
            Self::ExternalA => 'A',
            Self::ExternalB => 'B',
            Self::Harness => 'H',
        }
    }

    pub fn all() -> &'static [MasterType] {
        &[
            Self::Primary,
            Self::ExternalA,
            Self::ExternalB,
            Self::Harness,
        ]
    }
}

/// Small set of master-type tags. A record can be tagged by several
/// collaborators at once.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MasterTypes(u8);

impl MasterTypes {
    pub fn none() -> Self {
        Self(0)
    }

    pub fn just(ty: MasterType) -> Self {
        Self(ty.bit())
    }

    pub fn set(&mut self, ty: MasterType) {
        self.0 |= ty.bit();
    }

    pub fn clear(&mut self, ty: MasterType) {
        self.0 &= !ty.bit();
    }

    pub fn contains(&self, ty: MasterType) -> bool {
        self.0 & ty.bit() != 0
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for MasterTypes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return write!(f, "-");
        }
        for ty in MasterType::all() {
            if self.contains(*ty) {
                write!(f, "{}", ty.tag())?;
            }
        }
        Ok(())
    }
}

/// Identity of one render: owning thread plus target buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RenderKey {
    pub owner: Tid,
    pub buffer: BufferId,
}

/// Per-render bookkeeping: identity, frame window, smoothed CPU time, and
/// the two dependency sets.
#[derive(Debug, Clone)]
pub struct RenderRecord {
    pub key: RenderKey,
    pub process_id: Pid,
    /// Most active helper thread, 0 when unknown.
    pub spid: Tid,
    pub master: MasterTypes,
    pub prev_frame_end_ts: u64,
    pub cur_frame_end_ts: u64,
    pub raw_cpu_ns: u64,
    pub ema_cpu_ns: u64,
    pub ema2_enabled: bool,
    pub filter_enabled: bool,
    /// Estimator-maintained dependency set.
    pub primary: DepSet,
    /// Externally forced entries, folded in on export.
    pub overrides: DepSet,
}

impl RenderRecord {
    fn new(key: RenderKey, process_id: Pid, master: MasterTypes, ts: u64) -> Self {
        Self {
            key,
            process_id,
            spid: 0,
            master,
            prev_frame_end_ts: ts,
            cur_frame_end_ts: ts,
            raw_cpu_ns: 0,
            ema_cpu_ns: 0,
            ema2_enabled: false,
            filter_enabled: false,
            primary: DepSet::new(),
            overrides: DepSet::new(),
        }
    }
}

/// Registry of live renders keyed by (owner, buffer).
///
/// A lazy min-heap over `cur_frame_end_ts` indexes stale candidates so the
/// recycler never rescans every record; superseded heap entries are discarded
/// when popped.
#[derive(Default)]
pub struct RenderRegistry {
    records: HashMap<RenderKey, RenderRecord>,
    stale_index: BinaryHeap<Reverse<(u64, RenderKey)>>,
}

impl RenderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn get(&self, key: &RenderKey) -> Option<&RenderRecord> {
        self.records.get(key)
    }

    pub fn get_mut(&mut self, key: &RenderKey) -> Option<&mut RenderRecord> {
        self.records.get_mut(key)
    }

    /// Look up a record, creating it when `create` is set. At most one record
    /// exists per key; only creation applies the master tag.
    pub fn get_or_create(
        &mut self,
        key: RenderKey,
        master: MasterTypes,
        process_id: Pid,
        ts: u64,
        create: bool,
    ) -> Option<&mut RenderRecord> {
        if !self.records.contains_key(&key) {
            if !create {
                return None;
            }
            self.records
                .insert(key, RenderRecord::new(key, process_id, master, ts));
            self.stale_index.push(Reverse((ts, key)));
        }
        self.records.get_mut(&key)
    }

    /// Advance the record's frame-end timestamp and refresh its stale-index
    /// position.
    pub fn touch(&mut self, key: RenderKey, cur_ts: u64) {
        if let Some(rec) = self.records.get_mut(&key) {
            rec.cur_frame_end_ts = cur_ts;
            self.stale_index.push(Reverse((cur_ts, key)));
        }
    }

    pub fn remove(&mut self, key: &RenderKey) -> Option<RenderRecord> {
        self.records.remove(key)
    }

    /// Remove every record, returning them for teardown bookkeeping.
    pub fn drain(&mut self) -> Vec<RenderRecord> {
        self.stale_index.clear();
        self.records.drain().map(|(_, rec)| rec).collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &RenderRecord> {
        self.records.values()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut RenderRecord> {
        self.records.values_mut()
    }

    /// Pop one key whose record went stale at `cutoff` (its current frame end
    /// is at or before it). Records owned by the external hint service are
    /// exempt from staleness and are skipped.
    pub fn pop_stale(&mut self, cutoff: u64) -> Option<RenderKey> {
        while let Some(&Reverse((ts, key))) = self.stale_index.peek() {
            if ts > cutoff {
                return None;
            }
            self.stale_index.pop();

            let Some(rec) = self.records.get(&key) else {
                continue;
            };
            if rec.cur_frame_end_ts != ts {
                // a newer heap entry exists for this record
                continue;
            }
            if rec.master.contains(MasterType::ExternalB) {
                continue;
            }
            return Some(key);
        }
        None
    }
}
