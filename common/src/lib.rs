pub mod auth;
pub mod batch;
pub mod calibration;
pub mod config;
pub mod energy;
pub mod error;
pub mod estimator;
pub mod monitor;
pub mod remote;
pub mod sampler;
pub mod simulate;
pub mod types;

pub use batch::{RawReading, SampleBatch};
pub use calibration::{
    Calibration, CurveCalibration, FallbackCalibration, LinearCalibration, ADC_MAX_CODE,
};
pub use config::{EstimatorConfig, RuntimeConfig, SamplerConfig};
pub use energy::{EnergyMeter, EnergyReading};
pub use error::{CalibrationError, ConfigError, EstimateError};
pub use estimator::{EstimatorPolicy, RmsEstimator, RmsResult};
pub use monitor::MonitorState;
pub use remote::{RelayState, RemoteCommand};
pub use sampler::{BatchRead, BatchSource, CycleOutcome, Measurement, NoDataReason, Sampler};
pub use types::{ConfigView, EstimatorUpdate, MonitorStatus};
