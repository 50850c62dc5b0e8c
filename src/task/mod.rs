use std::fmt;

#[cfg(target_os = "linux")]
use anyhow::Context;
#[cfg(target_os = "linux")]
use anyhow::Result;

mod fake;

pub use fake::FakeTaskSource;

/// Thread id, as in the kernel: unique per task.
pub type Tid = i32;
/// Process id (thread group id).
pub type Pid = i32;

/// Scheduling class of a task, as far as the engine cares.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedClass {
    Fair,
    RealTime,
    Deadline,
}

impl fmt::Display for SchedClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Fair => "fair",
            Self::RealTime => "rt",
            Self::Deadline => "dl",
        };
        write!(f, "{s}")
    }
}

/// Snapshot of one live task.
#[derive(Debug, Clone)]
pub struct TaskInfo {
    pub tid: Tid,
    pub tgid: Pid,
    pub comm: String,
    pub class: SchedClass,
    pub kernel_thread: bool,
}

/// Read-only view of the platform's task table.
///
/// Lookups returning `None` mean the task has exited; callers drop the id
/// silently rather than failing the operation.
pub trait TaskSource: Send + Sync {
    /// Look up a single task by thread id.
    fn task(&self, tid: Tid) -> Option<TaskInfo>;

    /// All live tasks in a thread group.
    fn thread_group(&self, tgid: Pid) -> Vec<TaskInfo>;

    /// Cumulative scheduled CPU time of a task, in nanoseconds.
    fn sched_runtime_ns(&self, tid: Tid) -> Option<u64>;

    /// Thread group id of a task.
    fn process_id(&self, tid: Tid) -> Option<Pid> {
        self.task(tid).map(|t| t.tgid)
    }
}

/// Task source reading from /proc.
#[derive(Debug, Default)]
pub struct ProcTaskSource;

impl ProcTaskSource {
    pub fn new() -> Self {
        Self
    }
}

#[cfg(target_os = "linux")]
impl TaskSource for ProcTaskSource {
    fn task(&self, tid: Tid) -> Option<TaskInfo> {
        read_task(tid).ok()
    }

    fn thread_group(&self, tgid: Pid) -> Vec<TaskInfo> {
        use std::fs;

        let task_dir = format!("/proc/{tgid}/task");
        let entries = match fs::read_dir(&task_dir) {
            Ok(e) => e,
            Err(_) => return Vec::new(),
        };

        let mut tasks = Vec::with_capacity(16);
        for entry in entries {
            let entry = match entry {
                Ok(e) => e,
                Err(_) => continue,
            };

            let tid: Tid = match entry.file_name().to_string_lossy().parse() {
                Ok(t) => t,
                Err(_) => continue,
            };

            if let Ok(info) = read_task(tid) {
                tasks.push(info);
            }
        }

        tasks
    }

    fn sched_runtime_ns(&self, tid: Tid) -> Option<u64> {
        read_schedstat_runtime(tid).ok()
    }
}

#[cfg(not(target_os = "linux"))]
impl TaskSource for ProcTaskSource {
    fn task(&self, _tid: Tid) -> Option<TaskInfo> {
        None
    }

    fn thread_group(&self, _tgid: Pid) -> Vec<TaskInfo> {
        Vec::new()
    }

    fn sched_runtime_ns(&self, _tid: Tid) -> Option<u64> {
        None
    }
}

/// Build a TaskInfo from /proc/<tid>/{comm,status,stat,cmdline}.
#[cfg(target_os = "linux")]
fn read_task(tid: Tid) -> Result<TaskInfo> {
    let comm = read_proc_comm(tid)?;
    let tgid = read_proc_tgid(tid)?;
    let class = read_sched_class(tid).unwrap_or(SchedClass::Fair);
    let kernel_thread = read_proc_cmdline_empty(tid);

    Ok(TaskInfo {
        tid,
        tgid,
        comm,
        class,
        kernel_thread,
    })
}

/// Read /proc/<tid>/comm, returning the trimmed thread name.
#[cfg(target_os = "linux")]
fn read_proc_comm(tid: Tid) -> Result<String> {
    let path = format!("/proc/{tid}/comm");
    let data = std::fs::read_to_string(&path).with_context(|| format!("reading {path}"))?;
    Ok(data.trim().to_string())
}

/// Read the Tgid line from /proc/<tid>/status.
#[cfg(target_os = "linux")]
fn read_proc_tgid(tid: Tid) -> Result<Pid> {
    let path = format!("/proc/{tid}/status");
    let data = std::fs::read_to_string(&path).with_context(|| format!("reading {path}"))?;

    for line in data.lines() {
        if let Some(rest) = line.strip_prefix("Tgid:") {
            return rest
                .trim()
                .parse()
                .with_context(|| format!("parsing Tgid in {path}"));
        }
    }

    anyhow::bail!("no Tgid line in {path}")
}

/// Read the scheduling policy field (41st) from /proc/<tid>/stat.
///
/// The comm field may contain spaces, so split after the closing paren.
#[cfg(target_os = "linux")]
fn read_sched_class(tid: Tid) -> Result<SchedClass> {
    let path = format!("/proc/{tid}/stat");
    let data = std::fs::read_to_string(&path).with_context(|| format!("reading {path}"))?;

    let after_comm = data
        .rfind(')')
        .map(|i| &data[i + 1..])
        .unwrap_or(data.as_str());

    // fields 3.. follow, so policy (field 41) is the 39th after the comm
    let policy: u32 = after_comm
        .split_whitespace()
        .nth(38)
        .unwrap_or("0")
        .parse()
        .unwrap_or(0);

    // SCHED_FIFO = 1, SCHED_RR = 2, SCHED_DEADLINE = 6
    Ok(match policy {
        1 | 2 => SchedClass::RealTime,
        6 => SchedClass::Deadline,
        _ => SchedClass::Fair,
    })
}

/// Kernel threads have an empty /proc/<tid>/cmdline.
#[cfg(target_os = "linux")]
fn read_proc_cmdline_empty(tid: Tid) -> bool {
    let path = format!("/proc/{tid}/cmdline");
    match std::fs::read(&path) {
        Ok(data) => data.is_empty(),
        Err(_) => false,
    }
}

/// Read cumulative runtime (first field, nanoseconds) from /proc/<tid>/schedstat.
#[cfg(target_os = "linux")]
fn read_schedstat_runtime(tid: Tid) -> Result<u64> {
    let path = format!("/proc/{tid}/schedstat");
    let data = std::fs::read_to_string(&path).with_context(|| format!("reading {path}"))?;

    data.split_whitespace()
        .next()
        .and_then(|s| s.parse().ok())
        .with_context(|| format!("parsing runtime in {path}"))
}
