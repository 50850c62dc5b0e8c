use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

/// Top-level configuration for the framegov daemon.
#[derive(Debug, Deserialize)]
pub struct Config {
    /// Logging verbosity (debug, info, warn, error). Default: "info".
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Engine tunables and capacity limits.
    #[serde(default)]
    pub engine: EngineConfig,

    /// Plain-text control surface configuration.
    #[serde(default)]
    pub ctl: CtlConfig,

    /// How often the recycler sweeps stale records. Default: 1s.
    #[serde(default = "default_recycle_interval", with = "humantime_serde")]
    pub recycle_interval: Duration,
}

/// Engine tunables. Every limit here is a configurable default, not a hard
/// invariant; ranges are enforced at load time.
#[derive(Debug, Clone, Deserialize)]
pub struct EngineConfig {
    /// Start with estimation enabled. Default: true.
    #[serde(default = "default_enabled")]
    pub enabled: bool,

    /// Idle time after which a render record is reclaimed. Default: 1s.
    #[serde(default = "default_recycle_window", with = "humantime_serde")]
    pub recycle_window: Duration,

    /// Dequeue duration beyond which its CPU time is subtracted from the
    /// frame. Default: 2500us.
    #[serde(default = "default_extra_sub_threshold", with = "humantime_serde")]
    pub extra_sub_threshold: Duration,

    /// Minimum gap between helper-thread rescans. Default: 1s.
    #[serde(default = "default_spid_check_period", with = "humantime_serde")]
    pub spid_check_period: Duration,

    /// Name-pattern table capacity. Default: 20.
    #[serde(default = "default_max_spid_patterns")]
    pub max_spid_patterns: usize,

    /// Expanded pattern-overlay capacity. Default: 100.
    #[serde(default = "default_max_wspid_entries")]
    pub max_wspid_entries: usize,

    /// Policy-command store capacity. Default: 10.
    #[serde(default = "default_max_policy_commands")]
    pub max_policy_commands: usize,

    /// Largest dependency set handed to the estimator. Default: 100.
    #[serde(default = "default_max_dep_tasks")]
    pub max_dep_tasks: usize,

    /// Largest dependency-path count handed to the estimator. Default: 60.
    #[serde(default = "default_max_dep_paths")]
    pub max_dep_paths: usize,

    /// Frames in the attribution window. Default: 7, range 2..=20.
    #[serde(default = "default_dep_frames")]
    pub dep_frames: u32,

    /// Lower bound for the attribution window.
    #[serde(default = "default_dep_frames_min")]
    pub dep_frames_min: u32,

    /// Upper bound for the attribution window.
    #[serde(default = "default_dep_frames_max")]
    pub dep_frames_max: u32,

    /// Weight of the newest frame in the moving average, in tenths.
    /// Default: 5, range 1..=9.
    #[serde(default = "default_ema_dividend")]
    pub ema_dividend: u32,

    /// Helper-thread name prefix for spid selection.
    #[serde(default = "default_helper_prefix")]
    pub helper_prefix: String,

    /// Alternate helper prefix, selected by tunable.
    #[serde(default = "default_helper_prefix_alt")]
    pub helper_prefix_alt: String,

    /// Start with pattern expansion enabled. Default: false.
    #[serde(default)]
    pub expand_patterns: bool,

    /// Main trace ring capacity in events. Default: 8192.
    #[serde(default = "default_ring_capacity")]
    pub main_ring_capacity: usize,

    /// Frame trace ring capacity in events. Default: 8192.
    #[serde(default = "default_ring_capacity")]
    pub frame_ring_capacity: usize,
}

/// Control surface configuration.
#[derive(Debug, Deserialize)]
pub struct CtlConfig {
    /// Listen address. ":8877" binds all interfaces.
    #[serde(default = "default_ctl_addr")]
    pub addr: String,
}

// --- Defaults ---

fn default_log_level() -> String {
    "info".to_string()
}

fn default_recycle_interval() -> Duration {
    Duration::from_secs(1)
}

fn default_enabled() -> bool {
    true
}

fn default_recycle_window() -> Duration {
    Duration::from_secs(1)
}

fn default_extra_sub_threshold() -> Duration {
    Duration::from_micros(2500)
}

fn default_spid_check_period() -> Duration {
    Duration::from_secs(1)
}

fn default_max_spid_patterns() -> usize {
    20
}

fn default_max_wspid_entries() -> usize {
    100
}

fn default_max_policy_commands() -> usize {
    10
}

fn default_max_dep_tasks() -> usize {
    100
}

fn default_max_dep_paths() -> usize {
    60
}

fn default_dep_frames() -> u32 {
    7
}

fn default_dep_frames_min() -> u32 {
    2
}

fn default_dep_frames_max() -> u32 {
    20
}

fn default_ema_dividend() -> u32 {
    5
}

fn default_helper_prefix() -> String {
    "RenderThread".to_string()
}

fn default_helper_prefix_alt() -> String {
    "GLThread".to_string()
}

fn default_ring_capacity() -> usize {
    8192
}

fn default_ctl_addr() -> String {
    ":8877".to_string()
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            recycle_window: default_recycle_window(),
            extra_sub_threshold: default_extra_sub_threshold(),
            spid_check_period: default_spid_check_period(),
            max_spid_patterns: default_max_spid_patterns(),
            max_wspid_entries: default_max_wspid_entries(),
            max_policy_commands: default_max_policy_commands(),
            max_dep_tasks: default_max_dep_tasks(),
            max_dep_paths: default_max_dep_paths(),
            dep_frames: default_dep_frames(),
            dep_frames_min: default_dep_frames_min(),
            dep_frames_max: default_dep_frames_max(),
            ema_dividend: default_ema_dividend(),
            helper_prefix: default_helper_prefix(),
            helper_prefix_alt: default_helper_prefix_alt(),
            expand_patterns: false,
            main_ring_capacity: default_ring_capacity(),
            frame_ring_capacity: default_ring_capacity(),
        }
    }
}

impl Default for CtlConfig {
    fn default() -> Self {
        Self {
            addr: default_ctl_addr(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            engine: EngineConfig::default(),
            ctl: CtlConfig::default(),
            recycle_interval: default_recycle_interval(),
        }
    }
}

// --- Validation and loading ---

impl Config {
    /// Load configuration from a YAML file.
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;

        let cfg: Config = serde_yaml::from_str(&data)
            .with_context(|| format!("parsing config file {}", path.display()))?;

        cfg.validate()?;

        Ok(cfg)
    }

    /// Validate the configuration for required fields and consistency.
    pub fn validate(&self) -> Result<()> {
        if self.recycle_interval.is_zero() {
            bail!("recycle_interval must be positive");
        }

        let engine = &self.engine;
        if engine.recycle_window.is_zero() {
            bail!("engine.recycle_window must be positive");
        }
        if engine.spid_check_period.is_zero() {
            bail!("engine.spid_check_period must be positive");
        }
        if engine.max_spid_patterns == 0 {
            bail!("engine.max_spid_patterns must be positive");
        }
        if engine.max_wspid_entries == 0 {
            bail!("engine.max_wspid_entries must be positive");
        }
        if engine.max_policy_commands == 0 {
            bail!("engine.max_policy_commands must be positive");
        }
        if engine.max_dep_tasks == 0 {
            bail!("engine.max_dep_tasks must be positive");
        }
        if engine.dep_frames_min == 0 || engine.dep_frames_min > engine.dep_frames_max {
            bail!("engine.dep_frames_min/max form an empty range");
        }
        if engine.dep_frames < engine.dep_frames_min || engine.dep_frames > engine.dep_frames_max {
            bail!(
                "engine.dep_frames must be within {}..={}",
                engine.dep_frames_min,
                engine.dep_frames_max
            );
        }
        if engine.ema_dividend < 1 || engine.ema_dividend > 9 {
            bail!("engine.ema_dividend must be within 1..=9");
        }
        if engine.helper_prefix.is_empty() || engine.helper_prefix_alt.is_empty() {
            bail!("engine.helper_prefix must not be empty");
        }
        if engine.main_ring_capacity == 0 || engine.frame_ring_capacity == 0 {
            bail!("engine ring capacities must be positive");
        }

        if self.ctl.addr.is_empty() {
            bail!("ctl.addr is required");
        }

        Ok(())
    }
}
