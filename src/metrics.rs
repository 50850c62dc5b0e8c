use anyhow::Result;
use prometheus::{Counter, Gauge, Opts, Registry};

/// Prometheus metrics for the engine.
///
/// All metrics use the "framegov" namespace. `last_estimate_status` doubles
/// as the trace marker for the most recent estimation: 0 on success, the
/// negated error class on failure.
pub struct EngineMetrics {
    registry: Registry,

    /// Frame notifications that produced an estimate.
    pub estimates_ok: Counter,
    /// Frame notifications rejected for invalid parameters.
    pub estimate_rejected: Counter,
    /// Frame notifications failed because no estimator was usable.
    pub estimator_unavailable: Counter,
    /// Render records currently live.
    pub renders_live: Gauge,
    /// Render records reclaimed by the staleness sweep.
    pub renders_recycled: Counter,
    /// Frame-scoped records reclaimed by the staleness sweep.
    pub frames_recycled: Counter,
    /// Full registry resets triggered by a dependency-window change.
    pub policy_resets: Counter,
    /// Pattern-expanded dependency entries currently live.
    pub wspid_entries: Gauge,
    /// Events stored into the trace rings.
    pub trace_events_recorded: Counter,
    /// Events dropped by the trace rings.
    pub trace_events_dropped: Counter,
    /// Status of the most recent estimation (0 = ok).
    pub last_estimate_status: Gauge,
}

impl EngineMetrics {
    /// Creates a metrics instance with all metrics registered.
    pub fn new() -> Result<Self> {
        let registry = Registry::new();

        let estimates_ok = Counter::with_opts(
            Opts::new(
                "estimates_ok_total",
                "Frame notifications that produced an estimate.",
            )
            .namespace("framegov"),
        )?;
        let estimate_rejected = Counter::with_opts(
            Opts::new(
                "estimate_rejected_total",
                "Frame notifications rejected for invalid parameters.",
            )
            .namespace("framegov"),
        )?;
        let estimator_unavailable = Counter::with_opts(
            Opts::new(
                "estimator_unavailable_total",
                "Frame notifications failed because no estimator was usable.",
            )
            .namespace("framegov"),
        )?;
        let renders_live = Gauge::with_opts(
            Opts::new("renders_live", "Render records currently live.").namespace("framegov"),
        )?;
        let renders_recycled = Counter::with_opts(
            Opts::new(
                "renders_recycled_total",
                "Render records reclaimed by the staleness sweep.",
            )
            .namespace("framegov"),
        )?;
        let frames_recycled = Counter::with_opts(
            Opts::new(
                "frames_recycled_total",
                "Frame-scoped records reclaimed by the staleness sweep.",
            )
            .namespace("framegov"),
        )?;
        let policy_resets = Counter::with_opts(
            Opts::new(
                "policy_resets_total",
                "Full registry resets triggered by a dependency-window change.",
            )
            .namespace("framegov"),
        )?;
        let wspid_entries = Gauge::with_opts(
            Opts::new(
                "wspid_entries",
                "Pattern-expanded dependency entries currently live.",
            )
            .namespace("framegov"),
        )?;
        let trace_events_recorded = Counter::with_opts(
            Opts::new(
                "trace_events_recorded_total",
                "Events stored into the trace rings.",
            )
            .namespace("framegov"),
        )?;
        let trace_events_dropped = Counter::with_opts(
            Opts::new(
                "trace_events_dropped_total",
                "Events dropped by the trace rings.",
            )
            .namespace("framegov"),
        )?;
        let last_estimate_status = Gauge::with_opts(
            Opts::new(
                "last_estimate_status",
                "Status of the most recent estimation (0 = ok).",
            )
            .namespace("framegov"),
        )?;

        registry.register(Box::new(estimates_ok.clone()))?;
        registry.register(Box::new(estimate_rejected.clone()))?;
        registry.register(Box::new(estimator_unavailable.clone()))?;
        registry.register(Box::new(renders_live.clone()))?;
        registry.register(Box::new(renders_recycled.clone()))?;
        registry.register(Box::new(frames_recycled.clone()))?;
        registry.register(Box::new(policy_resets.clone()))?;
        registry.register(Box::new(wspid_entries.clone()))?;
        registry.register(Box::new(trace_events_recorded.clone()))?;
        registry.register(Box::new(trace_events_dropped.clone()))?;
        registry.register(Box::new(last_estimate_status.clone()))?;

        Ok(Self {
            registry,
            estimates_ok,
            estimate_rejected,
            estimator_unavailable,
            renders_live,
            renders_recycled,
            frames_recycled,
            policy_resets,
            wspid_entries,
            trace_events_recorded,
            trace_events_dropped,
            last_estimate_status,
        })
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_register_once() {
        let metrics = EngineMetrics::new().unwrap();
        metrics.estimates_ok.inc();
        metrics.renders_live.set(3.0);

        let families = metrics.registry().gather();
        assert!(families
            .iter()
            .any(|f| f.get_name() == "framegov_estimates_ok_total"));
    }
}
