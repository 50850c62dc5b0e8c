use std::sync::Arc;

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::clock::MonotonicClock;
use crate::config::Config;
use crate::ctl::ControlServer;
use crate::engine::recycle::SweepOutcome;
use crate::engine::Engine;
use crate::estimator::{NoopCapacityController, SchedRuntimeEstimator};
use crate::events::{EventGroup, EventHook, TraceRecorder};
use crate::metrics::EngineMetrics;
use crate::task::{ProcTaskSource, TaskSource};

/// Governor wires the engine together with its platform seams and runs the
/// periodic recycler and the control surface.
pub struct Governor {
    cfg: Config,
    engine: Arc<Engine>,
    metrics: Arc<EngineMetrics>,
    recorder: Arc<TraceRecorder>,
    ctl: ControlServer,
    events: Option<EventGroup>,
    cancel: CancellationToken,
}

impl Governor {
    pub fn new(cfg: Config) -> Result<Self> {
        let metrics = Arc::new(EngineMetrics::new().context("registering metrics")?);
        let tasks: Arc<dyn TaskSource> = Arc::new(ProcTaskSource::new());
        let clock = Arc::new(MonotonicClock::new());

        let engine = Arc::new(Engine::new(
            cfg.engine.clone(),
            Arc::clone(&tasks),
            Arc::new(NoopCapacityController),
            clock,
            Arc::clone(&metrics),
        ));
        engine.set_estimator(Arc::new(SchedRuntimeEstimator::new(tasks)));

        let recorder = Arc::new(TraceRecorder::new(
            cfg.engine.main_ring_capacity,
            cfg.engine.frame_ring_capacity,
            num_cpus::get(),
        ));

        let ctl = ControlServer::new(Arc::clone(&engine), Arc::clone(&metrics), &cfg.ctl.addr);

        Ok(Self {
            cfg,
            engine,
            metrics,
            recorder,
            ctl,
            events: None,
            cancel: CancellationToken::new(),
        })
    }

    /// Install a platform event backend. Must be called before `start`.
    pub fn set_event_hook(&mut self, hook: Arc<dyn EventHook>) {
        self.events = Some(EventGroup::new(
            hook,
            Arc::clone(&self.recorder),
            Arc::clone(&self.metrics),
        ));
    }

    pub fn engine(&self) -> Arc<Engine> {
        Arc::clone(&self.engine)
    }

    pub async fn start(&mut self) -> Result<()> {
        if let Some(events) = &self.events {
            events.register_all().context("registering event group")?;
        }

        self.ctl.start().await.context("starting control server")?;
        self.spawn_recycler();

        info!(
            dep_frames = self.cfg.engine.dep_frames,
            recycle_interval = ?self.cfg.recycle_interval,
            "governor started"
        );
        Ok(())
    }

    pub async fn stop(&mut self) -> Result<()> {
        self.cancel.cancel();

        if let Some(events) = &self.events {
            events.unregister_all();
        }
        self.engine.reset_all();

        if let Err(e) = self.ctl.stop().await {
            warn!(error = %e, "stopping control server");
        }

        info!("governor stopped");
        Ok(())
    }

    /// Periodic staleness sweep over render and frame records.
    fn spawn_recycler(&self) {
        let engine = Arc::clone(&self.engine);
        let cancel = self.cancel.clone();
        let interval = self.cfg.recycle_interval;

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        debug!("recycler stopped");
                        break;
                    }
                    _ = ticker.tick() => {
                        match engine.sweep() {
                            SweepOutcome::WindowChanged => {
                                info!("sweep applied new attribution window");
                            }
                            SweepOutcome::Swept { renders, frames } => {
                                if renders > 0 || frames > 0 {
                                    debug!(renders, frames, "sweep reclaimed records");
                                }
                            }
                        }
                    }
                }
            }
        });
    }
}
