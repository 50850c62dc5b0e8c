use std::collections::HashMap;

use parking_lot::Mutex;

use super::{Pid, SchedClass, TaskInfo, TaskSource, Tid};

/// In-memory task table for tests and benchmarks.
#[derive(Default)]
pub struct FakeTaskSource {
    tasks: Mutex<HashMap<Tid, TaskInfo>>,
    runtimes: Mutex<HashMap<Tid, u64>>,
}

impl FakeTaskSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a fair-class userspace task.
    pub fn add_task(&self, tid: Tid, tgid: Pid, comm: &str) {
        self.tasks.lock().insert(
            tid,
            TaskInfo {
                tid,
                tgid,
                comm: comm.to_string(),
                class: SchedClass::Fair,
                kernel_thread: false,
            },
        );
        self.runtimes.lock().entry(tid).or_insert(0);
    }

    pub fn set_class(&self, tid: Tid, class: SchedClass) {
        if let Some(info) = self.tasks.lock().get_mut(&tid) {
            info.class = class;
        }
    }

    pub fn set_kernel_thread(&self, tid: Tid, kernel: bool) {
        if let Some(info) = self.tasks.lock().get_mut(&tid) {
            info.kernel_thread = kernel;
        }
    }

    pub fn set_runtime(&self, tid: Tid, runtime_ns: u64) {
        self.runtimes.lock().insert(tid, runtime_ns);
    }

    pub fn advance_runtime(&self, tid: Tid, delta_ns: u64) {
        *self.runtimes.lock().entry(tid).or_insert(0) += delta_ns;
    }

    /// Simulate task exit.
    pub fn remove_task(&self, tid: Tid) {
        self.tasks.lock().remove(&tid);
        self.runtimes.lock().remove(&tid);
    }
}

impl TaskSource for FakeTaskSource {
    fn task(&self, tid: Tid) -> Option<TaskInfo> {
        self.tasks.lock().get(&tid).cloned()
    }

    fn thread_group(&self, tgid: Pid) -> Vec<TaskInfo> {
        let mut tasks: Vec<TaskInfo> = self
            .tasks
            .lock()
            .values()
            .filter(|t| t.tgid == tgid)
            .cloned()
            .collect();
        tasks.sort_by_key(|t| t.tid);
        tasks
    }

    fn sched_runtime_ns(&self, tid: Tid) -> Option<u64> {
        if !self.tasks.lock().contains_key(&tid) {
            return None;
        }
        self.runtimes.lock().get(&tid).copied()
    }
}
