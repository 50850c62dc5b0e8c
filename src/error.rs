use thiserror::Error;

/// Failure taxonomy for engine operations.
///
/// Failures are always local to the operation at hand: `InvalidParameter`
/// rejects before any state is touched, `ResourceExhausted` turns the insert
/// into a no-op without disturbing unrelated records, and
/// `EstimatorUnavailable` is surfaced after the dependency bookkeeping for the
/// frame has already been applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum EngineError {
    #[error("invalid parameter: {0}")]
    InvalidParameter(&'static str),

    #[error("resource exhausted: {0}")]
    ResourceExhausted(&'static str),

    #[error("runtime estimator unavailable")]
    EstimatorUnavailable,

    #[error("engine is disabled")]
    Disabled,

    #[error("no such record")]
    NotFound,
}
