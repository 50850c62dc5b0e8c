/// Outcome of one recycler pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SweepOutcome {
    /// Per-record staleness pass, with the number of records reclaimed.
    Swept { renders: usize, frames: usize },
    /// The dependency-window tunable changed: both registries were fully
    /// reset, exactly once for that change.
    WindowChanged,
}

/// Clamp a requested dependency-window length into the configured range.
/// Zero means "back to the default".
pub fn clamp_dep_frames(requested: u32, min: u32, max: u32, default: u32) -> u32 {
    if requested == 0 {
        return default;
    }
    requested.clamp(min, max)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clamp_dep_frames_range() {
        assert_eq!(clamp_dep_frames(7, 2, 20, 7), 7);
        assert_eq!(clamp_dep_frames(1, 2, 20, 7), 2);
        assert_eq!(clamp_dep_frames(50, 2, 20, 7), 20);
        assert_eq!(clamp_dep_frames(0, 2, 20, 7), 7);
    }
}
