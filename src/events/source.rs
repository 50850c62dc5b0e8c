use std::sync::Arc;

use anyhow::{Context, Result};
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::metrics::EngineMetrics;

use super::recorder::{RingId, TraceRecorder};
use super::{EventKind, TraceEvent};

/// Callback handed to the platform for one event kind. Invoked from
/// scheduling context: must be synchronous and non-blocking.
pub type EventProbe = Arc<dyn Fn(TraceEvent) + Send + Sync>;

/// Platform seam for subscribing to named scheduling events.
pub trait EventHook: Send + Sync {
    fn attach(&self, kind: EventKind, probe: EventProbe) -> Result<()>;
    fn detach(&self, kind: EventKind) -> Result<()>;
}

/// Hook that accepts every attach and never fires. Default backend on
/// platforms without a tracing facility.
#[derive(Debug, Default)]
pub struct NoopEventHook;

impl EventHook for NoopEventHook {
    fn attach(&self, kind: EventKind, _probe: EventProbe) -> Result<()> {
        debug!(kind = %kind, "noop event hook attach");
        Ok(())
    }

    fn detach(&self, kind: EventKind) -> Result<()> {
        debug!(kind = %kind, "noop event hook detach");
        Ok(())
    }
}

/// Registers the six scheduling events as one group.
///
/// Registration is all-or-nothing: a failed attach detaches everything
/// already attached and reports the error. Both rings are rewound on every
/// registration and deregistration so stale events never leak across an
/// enable cycle.
pub struct EventGroup {
    hook: Arc<dyn EventHook>,
    recorder: Arc<TraceRecorder>,
    metrics: Arc<EngineMetrics>,
    attached: Mutex<Vec<EventKind>>,
}

impl EventGroup {
    pub fn new(
        hook: Arc<dyn EventHook>,
        recorder: Arc<TraceRecorder>,
        metrics: Arc<EngineMetrics>,
    ) -> Self {
        Self {
            hook,
            recorder,
            metrics,
            attached: Mutex::new(Vec::new()),
        }
    }

    pub fn is_registered(&self) -> bool {
        !self.attached.lock().is_empty()
    }

    /// Attach probes for all event kinds. On partial failure every probe
    /// attached so far is detached before the error is returned.
    pub fn register_all(&self) -> Result<()> {
        let mut attached = self.attached.lock();
        if !attached.is_empty() {
            return Ok(());
        }

        for kind in EventKind::all() {
            let probe = self.probe_for(*kind);
            if let Err(e) = self.hook.attach(*kind, probe) {
                for done in attached.iter().rev() {
                    if let Err(de) = self.hook.detach(*done) {
                        warn!(kind = %done, error = %de, "detach during unwind failed");
                    }
                }
                attached.clear();
                return Err(e).with_context(|| format!("attaching {kind}"));
            }
            attached.push(*kind);
        }

        self.recorder.reset();
        info!(count = attached.len(), "event group registered");
        Ok(())
    }

    /// Detach all probes and rewind the rings.
    pub fn unregister_all(&self) {
        let mut attached = self.attached.lock();

        for kind in attached.iter().rev() {
            if let Err(e) = self.hook.detach(*kind) {
                warn!(kind = %kind, error = %e, "detach failed");
            }
        }

        if !attached.is_empty() {
            info!(count = attached.len(), "event group unregistered");
        }
        attached.clear();
        self.recorder.reset();
    }

    /// Build the probe for one kind, routing to the ring(s) it feeds.
    fn probe_for(&self, kind: EventKind) -> EventProbe {
        let recorder = Arc::clone(&self.recorder);
        let metrics = Arc::clone(&self.metrics);

        Arc::new(move |mut ev: TraceEvent| {
            ev.kind = kind;

            let stored = match kind {
                EventKind::IrqEntry | EventKind::IrqExit | EventKind::SchedSwitch => {
                    recorder.record(RingId::Main, &ev)
                }
                EventKind::SchedWaking => {
                    // waking feeds both attribution and frame tracking
                    let main = recorder.record(RingId::Main, &ev);
                    recorder.record(RingId::Frame, &ev) && main
                }
                EventKind::TimerEntry | EventKind::TimerExit => {
                    recorder.record(RingId::Frame, &ev)
                }
            };

            if stored {
                metrics.trace_events_recorded.inc();
            } else {
                metrics.trace_events_dropped.inc();
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::Arc;

    use anyhow::bail;
    use parking_lot::Mutex;

    use super::*;

    /// Hook that stores probes and can be told to fail the nth attach.
    #[derive(Default)]
    struct ScriptedHook {
        probes: Mutex<HashMap<EventKind, EventProbe>>,
        fail_at: Option<usize>,
        attach_count: Mutex<usize>,
        detached: Mutex<Vec<EventKind>>,
    }

    impl ScriptedHook {
        fn failing_at(n: usize) -> Self {
            Self {
                fail_at: Some(n),
                ..Default::default()
            }
        }

        fn fire(&self, kind: EventKind, ev: TraceEvent) {
            if let Some(probe) = self.probes.lock().get(&kind) {
                probe(ev);
            }
        }
    }

    impl EventHook for ScriptedHook {
        fn attach(&self, kind: EventKind, probe: EventProbe) -> Result<()> {
            let mut count = self.attach_count.lock();
            if self.fail_at == Some(*count) {
                bail!("scripted attach failure");
            }
            *count += 1;
            self.probes.lock().insert(kind, probe);
            Ok(())
        }

        fn detach(&self, kind: EventKind) -> Result<()> {
            self.probes.lock().remove(&kind);
            self.detached.lock().push(kind);
            Ok(())
        }
    }

    fn group_with(hook: Arc<ScriptedHook>) -> EventGroup {
        let recorder = Arc::new(TraceRecorder::new(64, 64, 1));
        let metrics = Arc::new(EngineMetrics::new().unwrap());
        EventGroup::new(hook, recorder, metrics)
    }

    #[test]
    fn test_register_all_attaches_six_probes() {
        let hook = Arc::new(ScriptedHook::default());
        let group = group_with(Arc::clone(&hook));

        group.register_all().unwrap();
        assert!(group.is_registered());
        assert_eq!(hook.probes.lock().len(), 6);
    }

    #[test]
    fn test_partial_attach_failure_unwinds() {
        let hook = Arc::new(ScriptedHook::failing_at(3));
        let group = group_with(Arc::clone(&hook));

        assert!(group.register_all().is_err());
        assert!(!group.is_registered());
        assert!(hook.probes.lock().is_empty());
        // the three successful attaches were detached in reverse order
        assert_eq!(
            *hook.detached.lock(),
            vec![
                EventKind::SchedSwitch,
                EventKind::IrqExit,
                EventKind::IrqEntry
            ]
        );
    }

    #[test]
    fn test_probes_route_to_expected_rings() {
        let hook = Arc::new(ScriptedHook::default());
        let recorder = Arc::new(TraceRecorder::new(64, 64, 1));
        let metrics = Arc::new(EngineMetrics::new().unwrap());
        let group = EventGroup::new(Arc::clone(&hook) as Arc<dyn EventHook>, Arc::clone(&recorder), metrics);
        group.register_all().unwrap();

        hook.fire(
            EventKind::SchedSwitch,
            TraceEvent::new(EventKind::SchedSwitch, 1, 0, 7),
        );
        hook.fire(
            EventKind::TimerEntry,
            TraceEvent::new(EventKind::TimerEntry, 2, 0, 7),
        );
        hook.fire(
            EventKind::SchedWaking,
            TraceEvent::new(EventKind::SchedWaking, 3, 0, 7),
        );

        assert_eq!(recorder.ring(RingId::Main).cursor(), 2);
        assert_eq!(recorder.ring(RingId::Frame).cursor(), 2);
    }

    #[test]
    fn test_unregister_rewinds_rings() {
        let hook = Arc::new(ScriptedHook::default());
        let recorder = Arc::new(TraceRecorder::new(64, 64, 1));
        let metrics = Arc::new(EngineMetrics::new().unwrap());
        let group = EventGroup::new(Arc::clone(&hook) as Arc<dyn EventHook>, Arc::clone(&recorder), metrics);
        group.register_all().unwrap();

        hook.fire(
            EventKind::SchedSwitch,
            TraceEvent::new(EventKind::SchedSwitch, 1, 0, 7),
        );
        group.unregister_all();

        assert!(!group.is_registered());
        assert_eq!(recorder.ring(RingId::Main).cursor(), 0);
    }
}
