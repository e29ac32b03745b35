use thiserror::Error;

/// Raised when a configuration cannot be used as-is.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error(
        "batch of {batch_len} samples at up to {full_scale_mv} mV can exceed the exact accumulator range"
    )]
    OverflowRisk { batch_len: usize, full_scale_mv: u32 },
    #[error("batch length must be between 1 and {max}, got {got}")]
    BatchLength { got: usize, max: usize },
    #[error("smoothing window {window} leaves no room in a batch of {batch_len} samples")]
    SmoothingWindow { window: usize, batch_len: usize },
    #[error("unknown estimator policy {0:?}")]
    UnknownPolicy(String),
    #[error(transparent)]
    Calibration(#[from] CalibrationError),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CalibrationError {
    #[error("calibration curve needs at least two points, got {0}")]
    TooFewPoints(usize),
    #[error("calibration curve is not monotonic at point {index}")]
    NotMonotonic { index: usize },
    #[error("full scale code must be non-zero")]
    ZeroScale,
}

/// Failures specific to the zero-crossing windowing policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum EstimateError {
    #[error("no rising zero crossing in {samples} samples")]
    NoCrossingFound { samples: usize },
    #[error("only one rising zero crossing (index {crossing}) in {samples} samples")]
    IncompleteCycle { crossing: usize, samples: usize },
}
