use std::fmt;

pub mod recorder;
pub mod source;

pub use recorder::{RingId, TraceRecorder, TraceRing};
pub use source::{EventGroup, EventHook, EventProbe, NoopEventHook};

/// Scheduling events the recorder subscribes to.
///
/// The discriminants are stable: they appear in recorded slots and trace
/// dumps, and 0 marks an empty slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum EventKind {
    IrqEntry = 1,
    IrqExit = 2,
    SchedSwitch = 3,
    SchedWaking = 4,
    TimerEntry = 5,
    TimerExit = 6,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::IrqEntry => "irq_entry",
            Self::IrqExit => "irq_exit",
            Self::SchedSwitch => "sched_switch",
            Self::SchedWaking => "sched_waking",
            Self::TimerEntry => "timer_entry",
            Self::TimerExit => "timer_exit",
        }
    }

    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            1 => Some(Self::IrqEntry),
            2 => Some(Self::IrqExit),
            3 => Some(Self::SchedSwitch),
            4 => Some(Self::SchedWaking),
            5 => Some(Self::TimerEntry),
            6 => Some(Self::TimerExit),
            _ => None,
        }
    }

    /// All kinds, in registration order.
    pub fn all() -> &'static [EventKind] {
        &[
            Self::IrqEntry,
            Self::IrqExit,
            Self::SchedSwitch,
            Self::SchedWaking,
            Self::TimerEntry,
            Self::TimerExit,
        ]
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One recorded scheduling event.
///
/// `note` carries the event-specific extra (irq number, waker pid, timer id
/// low bits), `state` the sched_switch prev-state, `addr` the timer address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TraceEvent {
    pub ts: u64,
    pub cpu: u32,
    pub kind: EventKind,
    pub pid: i32,
    pub note: i32,
    pub state: i64,
    pub addr: u64,
}

impl TraceEvent {
    pub fn new(kind: EventKind, ts: u64, cpu: u32, pid: i32) -> Self {
        Self {
            ts,
            cpu,
            kind,
            pid,
            note: 0,
            state: 0,
            addr: 0,
        }
    }
}
