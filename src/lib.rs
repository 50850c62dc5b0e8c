//! Frame dependency graph and CPU-time attribution engine for a
//! frame-pacing CPU governor.
//!
//! The [`engine::Engine`] tracks which threads each rendering pipeline
//! actually depends on frame to frame, attributes per-frame CPU time to that
//! set via an injected [`estimator::RuntimeEstimator`], and recycles records
//! for pipelines that stop producing.

pub mod clock;
pub mod config;
pub mod ctl;
pub mod engine;
pub mod error;
pub mod estimator;
pub mod events;
pub mod governor;
pub mod metrics;
pub mod task;
