use std::collections::BTreeMap;
use std::fmt;

use crate::task::Tid;

/// Action tag carried by a dependency entry or name pattern.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum DepAction {
    /// Participate in attribution.
    Add = 1,
    /// Remove from the exported list.
    Delete = 2,
    /// Apply a forced minimum capacity floor.
    ForceBoost = 3,
    /// Always count this thread's CPU time.
    ForceCpuTime = 4,
}

impl DepAction {
    pub fn from_i32(v: i32) -> Option<Self> {
        match v {
            1 => Some(Self::Add),
            2 => Some(Self::Delete),
            3 => Some(Self::ForceBoost),
            4 => Some(Self::ForceCpuTime),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Add => "add",
            Self::Delete => "del",
            Self::ForceBoost => "boost",
            Self::ForceCpuTime => "cputime",
        }
    }
}

impl fmt::Display for DepAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Ordered set of candidate dependency threads for one render.
///
/// Keyed by thread id; re-inserting an id updates its action tag in place.
#[derive(Debug, Default, Clone)]
pub struct DepSet {
    entries: BTreeMap<Tid, DepAction>,
}

impl DepSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, tid: Tid) -> bool {
        self.entries.contains_key(&tid)
    }

    pub fn get(&self, tid: Tid) -> Option<DepAction> {
        self.entries.get(&tid).copied()
    }

    /// Insert or retag an entry.
    pub fn upsert(&mut self, tid: Tid, action: DepAction) {
        self.entries.insert(tid, action);
    }

    pub fn remove(&mut self, tid: Tid) -> bool {
        self.entries.remove(&tid).is_some()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Replace the whole set with `ids`, all tagged Add.
    pub fn bulk_replace(&mut self, ids: &[Tid]) {
        self.entries.clear();
        for &tid in ids {
            self.entries.insert(tid, DepAction::Add);
        }
    }

    /// Entries in ascending thread-id order.
    pub fn iter(&self) -> impl Iterator<Item = (Tid, DepAction)> + '_ {
        self.entries.iter().map(|(&tid, &action)| (tid, action))
    }

    pub fn ids(&self) -> Vec<Tid> {
        self.entries.keys().copied().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_upsert_retags_without_duplicating() {
        let mut set = DepSet::new();
        set.upsert(10, DepAction::Add);
        set.upsert(10, DepAction::ForceCpuTime);

        assert_eq!(set.len(), 1);
        assert_eq!(set.get(10), Some(DepAction::ForceCpuTime));
    }

    #[test]
    fn test_iter_is_ordered_by_tid() {
        let mut set = DepSet::new();
        set.upsert(30, DepAction::Add);
        set.upsert(10, DepAction::Add);
        set.upsert(20, DepAction::Add);

        assert_eq!(set.ids(), vec![10, 20, 30]);
    }

    #[test]
    fn test_bulk_replace_discards_previous_entries() {
        let mut set = DepSet::new();
        set.upsert(1, DepAction::ForceBoost);
        set.bulk_replace(&[5, 6]);

        assert_eq!(set.ids(), vec![5, 6]);
        assert_eq!(set.get(5), Some(DepAction::Add));
        assert!(!set.contains(1));
    }

    #[test]
    fn test_dep_action_from_i32() {
        assert_eq!(DepAction::from_i32(1), Some(DepAction::Add));
        assert_eq!(DepAction::from_i32(4), Some(DepAction::ForceCpuTime));
        assert_eq!(DepAction::from_i32(0), None);
        assert_eq!(DepAction::from_i32(5), None);
    }
}
