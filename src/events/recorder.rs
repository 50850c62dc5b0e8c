use std::sync::atomic::{AtomicI32, AtomicI64, AtomicU32, AtomicU64, AtomicU8, Ordering};

use super::{EventKind, TraceEvent};

/// Which of the two rings an event lands in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RingId {
    /// IRQ and sched events feeding per-frame CPU attribution.
    Main,
    /// Waking and timer events feeding frame-boundary tracking.
    Frame,
}

#[derive(Default)]
struct Slot {
    ts: AtomicU64,
    cpu: AtomicU32,
    kind: AtomicU8,
    pid: AtomicI32,
    note: AtomicI32,
    state: AtomicI64,
    addr: AtomicU64,
}

/// Fixed-capacity, lock-free event ring.
///
/// `record` is safe to call from interrupt-style callbacks: one atomic
/// increment claims a slot, and any cursor anomaly resets to zero and drops
/// the event rather than blocking or corrupting neighbours. The slack bound
/// (capacity plus two slots per CPU) absorbs concurrent claimers racing past
/// the wrap point.
pub struct TraceRing {
    slots: Box<[Slot]>,
    cursor: AtomicI64,
    slack: i64,
}

impl TraceRing {
    pub fn new(capacity: usize, cpus: usize) -> Self {
        let mut slots = Vec::with_capacity(capacity);
        slots.resize_with(capacity, Slot::default);

        Self {
            slots: slots.into_boxed_slice(),
            cursor: AtomicI64::new(0),
            slack: capacity as i64 + 2 * cpus as i64,
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn cursor(&self) -> i64 {
        self.cursor.load(Ordering::Acquire)
    }

    /// Claim the next slot and store the event. Returns false when the event
    /// is dropped due to a cursor anomaly.
    pub fn record(&self, ev: &TraceEvent) -> bool {
        let cap = self.slots.len() as i64;
        let mut retried = false;

        loop {
            let index = self.cursor.fetch_add(1, Ordering::AcqRel).wrapping_add(1);

            if index <= 0 || index > self.slack {
                // underflow or runaway cursor: start over, drop this event
                self.cursor.store(0, Ordering::Release);
                return false;
            }

            if index == cap {
                // last slot claimed, wrap for the next claimer
                self.cursor.store(0, Ordering::Release);
            } else if index > cap {
                // lost the wrap race, retry against the fresh cursor once
                if !retried {
                    retried = true;
                    continue;
                }
                return false;
            }

            let slot = &self.slots[(index - 1) as usize];
            slot.ts.store(ev.ts, Ordering::Relaxed);
            slot.cpu.store(ev.cpu, Ordering::Relaxed);
            slot.pid.store(ev.pid, Ordering::Relaxed);
            slot.note.store(ev.note, Ordering::Relaxed);
            slot.state.store(ev.state, Ordering::Relaxed);
            slot.addr.store(ev.addr, Ordering::Relaxed);
            slot.kind.store(ev.kind as u8, Ordering::Release);
            return true;
        }
    }

    /// Rewind the cursor. Stale slot contents are left in place and
    /// overwritten by subsequent records.
    pub fn reset(&self) {
        self.cursor.store(0, Ordering::Release);
    }

    /// Copy out all written slots, oldest position first.
    pub fn snapshot(&self) -> Vec<TraceEvent> {
        let mut events = Vec::with_capacity(self.slots.len());

        for slot in self.slots.iter() {
            let Some(kind) = EventKind::from_u8(slot.kind.load(Ordering::Acquire)) else {
                continue;
            };
            events.push(TraceEvent {
                ts: slot.ts.load(Ordering::Relaxed),
                cpu: slot.cpu.load(Ordering::Relaxed),
                kind,
                pid: slot.pid.load(Ordering::Relaxed),
                note: slot.note.load(Ordering::Relaxed),
                state: slot.state.load(Ordering::Relaxed),
                addr: slot.addr.load(Ordering::Relaxed),
            });
        }

        events
    }
}

/// The two event rings, sized independently.
pub struct TraceRecorder {
    main: TraceRing,
    frame: TraceRing,
}

impl TraceRecorder {
    pub fn new(main_capacity: usize, frame_capacity: usize, cpus: usize) -> Self {
        Self {
            main: TraceRing::new(main_capacity, cpus),
            frame: TraceRing::new(frame_capacity, cpus),
        }
    }

    pub fn ring(&self, id: RingId) -> &TraceRing {
        match id {
            RingId::Main => &self.main,
            RingId::Frame => &self.frame,
        }
    }

    pub fn record(&self, id: RingId, ev: &TraceEvent) -> bool {
        self.ring(id).record(ev)
    }

    pub fn reset(&self) {
        self.main.reset();
        self.frame.reset();
    }
}
