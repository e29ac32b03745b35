use serde::{Deserialize, Serialize};

use crate::{
    calibration::{Calibration, CurveCalibration, LinearCalibration},
    error::{CalibrationError, ConfigError},
    estimator::{EstimatorPolicy, RmsEstimator, DEFAULT_SMOOTHING},
    simulate::WaveformConfig,
    types::EstimatorUpdate,
};

pub const MAX_BATCH_LEN: usize = 8_192;

/// Integers up to 2^53 are exact in `f64`; the squared-deviation sum must stay below it.
const EXACT_ACCUMULATOR_LIMIT: u128 = 1 << 53;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SamplerConfig {
    pub channel: u8,
    pub sample_rate_hz: u32,
    pub batch_len: usize,
    pub frame_len: usize,
    pub read_timeout_ms: u64,
    pub drain_timeout_ms: u64,
    pub cycle_delay_ms: u64,
}

impl Default for SamplerConfig {
    fn default() -> Self {
        Self {
            channel: 7,
            sample_rate_hz: 20_000,
            batch_len: 2_048,
            frame_len: 256,
            read_timeout_ms: 1_000,
            drain_timeout_ms: 50,
            cycle_delay_ms: 10,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct EstimatorConfig {
    pub policy: EstimatorPolicy,
    pub smoothing: usize,
}

impl Default for EstimatorConfig {
    fn default() -> Self {
        Self {
            policy: EstimatorPolicy::MeanDeviation,
            smoothing: DEFAULT_SMOOTHING,
        }
    }
}

impl EstimatorConfig {
    pub fn estimator(&self) -> RmsEstimator {
        RmsEstimator::new(self.policy).with_smoothing(self.smoothing)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CalibrationConfig {
    /// Prefer the chip's eFuse-backed scheme when the target provides one.
    pub use_chip_scheme: bool,
    pub linear: LinearCalibration,
    /// Measured `(code, mV)` points; overrides `linear` when present.
    #[serde(default)]
    pub curve: Option<Vec<(u16, i32)>>,
}

impl Default for CalibrationConfig {
    fn default() -> Self {
        Self {
            use_chip_scheme: true,
            linear: LinearCalibration::default(),
            curve: None,
        }
    }
}

impl CalibrationConfig {
    pub fn build(&self) -> Result<Box<dyn Calibration + Send>, CalibrationError> {
        match &self.curve {
            Some(points) => Ok(Box::new(CurveCalibration::new(points.clone())?)),
            None => Ok(Box::new(LinearCalibration::new(
                self.linear.max_code,
                self.linear.full_scale_mv,
            )?)),
        }
    }

    /// Widest spread between two calibrated samples, which bounds any
    /// deviation from the batch mean.
    pub fn full_scale_mv(&self) -> u32 {
        match &self.curve {
            Some(points) => {
                let lowest = points.iter().map(|&(_, mv)| i64::from(mv)).min();
                let highest = points.iter().map(|&(_, mv)| i64::from(mv)).max();
                match (lowest, highest) {
                    (Some(lowest), Some(highest)) => {
                        u32::try_from(highest - lowest).unwrap_or(u32::MAX)
                    }
                    _ => 0,
                }
            }
            None => self.linear.full_scale_mv,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RelayConfig {
    pub gpio: i32,
    pub active_high: bool,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            gpio: 18,
            active_high: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EnergyConfig {
    pub grid_voltage_v: f64,
    /// Empirical sensor scale: RMS millivolts per amp.
    pub mv_per_amp: f64,
    pub max_gap_ms: u64,
}

impl Default for EnergyConfig {
    fn default() -> Self {
        Self {
            grid_voltage_v: 240.0,
            mv_per_amp: 37.0,
            max_gap_ms: 5_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RemoteConfig {
    pub enabled: bool,
    pub base_url: String,
    pub poll_interval_ms: u64,
    pub timeout_ms: u64,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            base_url: "https://www.juicier.net/control".to_string(),
            poll_interval_ms: 1_000,
            timeout_ms: 10_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AuthConfig {
    pub enabled: bool,
    pub username: String,
    pub password: String,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            username: "ESP32".to_string(),
            password: "ESP32Webserver".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NetworkConfig {
    pub wifi_ssid: String,
    pub wifi_pass: String,
    pub http_port: u16,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            wifi_ssid: String::new(),
            wifi_pass: String::new(),
            http_port: 80,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct RuntimeConfig {
    #[serde(default)]
    pub sampler: SamplerConfig,
    #[serde(default)]
    pub estimator: EstimatorConfig,
    #[serde(default)]
    pub calibration: CalibrationConfig,
    #[serde(default)]
    pub relay: RelayConfig,
    #[serde(default)]
    pub energy: EnergyConfig,
    #[serde(default)]
    pub remote: RemoteConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub network: NetworkConfig,
    /// Only read by the host build, which has no ADC.
    #[serde(default)]
    pub simulation: WaveformConfig,
}

impl SamplerConfig {
    pub fn sanitize(&mut self) {
        if self.channel > 7 {
            self.channel = 7;
        }
        self.sample_rate_hz = self.sample_rate_hz.clamp(20_000, 2_000_000);
        self.batch_len = self.batch_len.clamp(1, MAX_BATCH_LEN);
        self.frame_len = self.frame_len.clamp(1, self.batch_len);
        // Whole frames only, so no conversions carry over into the next cycle.
        self.batch_len -= self.batch_len % self.frame_len;
        self.read_timeout_ms = self.read_timeout_ms.clamp(10, 60_000);
        self.drain_timeout_ms = self.drain_timeout_ms.min(self.read_timeout_ms);
    }
}

impl EstimatorConfig {
    pub fn sanitize(&mut self) {
        self.smoothing = self.smoothing.clamp(1, 64);
    }
}

impl EnergyConfig {
    pub fn sanitize(&mut self) {
        if !self.grid_voltage_v.is_finite() || self.grid_voltage_v <= 0.0 {
            self.grid_voltage_v = 240.0;
        }
        if !self.mv_per_amp.is_finite() || self.mv_per_amp <= 0.0 {
            self.mv_per_amp = 37.0;
        }
        self.max_gap_ms = self.max_gap_ms.max(1);
    }
}

impl RemoteConfig {
    pub fn sanitize(&mut self) {
        self.poll_interval_ms = self.poll_interval_ms.max(250);
        self.timeout_ms = self.timeout_ms.clamp(1_000, 60_000);
        let trimmed = self.base_url.trim().trim_end_matches('?');
        self.base_url = trimmed.to_string();
    }
}

impl RuntimeConfig {
    pub fn sanitize(&mut self) {
        self.sampler.sanitize();
        self.estimator.sanitize();
        self.energy.sanitize();
        self.remote.sanitize();
        if self.relay.gpio < 0 {
            self.relay.gpio = RelayConfig::default().gpio;
        }
    }

    /// Rejects combinations that would make the estimator unreliable.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let batch_len = self.sampler.batch_len;
        if batch_len == 0 || batch_len > MAX_BATCH_LEN {
            return Err(ConfigError::BatchLength {
                got: batch_len,
                max: MAX_BATCH_LEN,
            });
        }

        let full_scale_mv = self.calibration.full_scale_mv();
        let worst_case = batch_len as u128 * u128::from(full_scale_mv) * u128::from(full_scale_mv);
        if worst_case >= EXACT_ACCUMULATOR_LIMIT {
            return Err(ConfigError::OverflowRisk {
                batch_len,
                full_scale_mv,
            });
        }

        if self.estimator.policy == EstimatorPolicy::ZeroCrossing
            && self.estimator.smoothing.saturating_mul(2) >= batch_len
        {
            return Err(ConfigError::SmoothingWindow {
                window: self.estimator.smoothing,
                batch_len,
            });
        }

        self.calibration.build()?;
        Ok(())
    }

    /// The estimator settings `update` would produce, checked against the rest
    /// of the configuration. `self` is left untouched.
    pub fn estimator_update(&self, update: &EstimatorUpdate) -> Result<EstimatorConfig, ConfigError> {
        let policy = update
            .policy()
            .ok_or_else(|| ConfigError::UnknownPolicy(update.policy.clone()))?;

        let mut candidate = self.clone();
        candidate.estimator.policy = policy;
        if let Some(smoothing) = update.smoothing {
            candidate.estimator.smoothing = smoothing;
        }
        candidate.estimator.sanitize();
        candidate.validate()?;
        Ok(candidate.estimator)
    }

    /// Switches estimator policy in place. The previous settings are kept
    /// when the result would not validate.
    pub fn apply_estimator_update(&mut self, update: &EstimatorUpdate) -> Result<(), ConfigError> {
        self.estimator = self.estimator_update(update)?;
        Ok(())
    }
}
