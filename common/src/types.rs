use serde::{Deserialize, Serialize};

use crate::{
    config::{CalibrationConfig, EnergyConfig, EstimatorConfig, RuntimeConfig, SamplerConfig},
    estimator::EstimatorPolicy,
};

#[derive(Debug, Clone, Serialize)]
pub struct MonitorStatus {
    #[serde(rename = "deviceId")]
    pub device_id: String,
    #[serde(rename = "rmsMv")]
    pub rms_mv: f64,
    #[serde(rename = "meanMv")]
    pub mean_mv: f64,
    pub amps: f64,
    pub policy: &'static str,
    pub smoothing: usize,
    /// `MEASURED`, `TIMEOUT`, `EMPTY_BATCH`, `REJECTED` or `NONE` before the first cycle.
    #[serde(rename = "lastOutcome")]
    pub last_outcome: &'static str,
    #[serde(rename = "lastError")]
    pub last_error: Option<String>,
    pub samples: usize,
    pub dropped: usize,
    #[serde(rename = "minMv")]
    pub min_mv: i32,
    #[serde(rename = "maxMv")]
    pub max_mv: i32,
    pub cycles: u64,
    pub timeouts: u64,
    #[serde(rename = "emptyBatches")]
    pub empty_batches: u64,
    pub rejected: u64,
    #[serde(rename = "totalKwh")]
    pub total_kwh: f64,
    pub relay: &'static str,
    #[serde(rename = "remoteEnabled")]
    pub remote_enabled: bool,
    #[serde(rename = "lastRemoteError")]
    pub last_remote_error: Option<String>,
    #[serde(rename = "chargerLed")]
    pub charger_led: bool,
    #[serde(rename = "uptimeMs")]
    pub uptime_ms: u64,
}

/// Runtime configuration as exposed over HTTP; credentials stay private.
#[derive(Debug, Clone, Serialize)]
pub struct ConfigView {
    pub sampler: SamplerConfig,
    pub estimator: EstimatorConfig,
    pub calibration: CalibrationConfig,
    #[serde(rename = "relayGpio")]
    pub relay_gpio: i32,
    pub energy: EnergyConfig,
    #[serde(rename = "remoteEnabled")]
    pub remote_enabled: bool,
    #[serde(rename = "remoteUrl")]
    pub remote_url: String,
    #[serde(rename = "remotePollIntervalMs")]
    pub remote_poll_interval_ms: u64,
    #[serde(rename = "authEnabled")]
    pub auth_enabled: bool,
    #[serde(rename = "httpPort")]
    pub http_port: u16,
}

impl From<&RuntimeConfig> for ConfigView {
    fn from(config: &RuntimeConfig) -> Self {
        Self {
            sampler: config.sampler.clone(),
            estimator: config.estimator,
            calibration: config.calibration.clone(),
            relay_gpio: config.relay.gpio,
            energy: config.energy.clone(),
            remote_enabled: config.remote.enabled,
            remote_url: config.remote.base_url.clone(),
            remote_poll_interval_ms: config.remote.poll_interval_ms,
            auth_enabled: config.auth.enabled,
            http_port: config.network.http_port,
        }
    }
}

/// Body of `PUT /api/estimator`.
#[derive(Debug, Clone, Deserialize)]
pub struct EstimatorUpdate {
    pub policy: String,
    #[serde(default)]
    pub smoothing: Option<usize>,
}

impl EstimatorUpdate {
    pub fn policy(&self) -> Option<EstimatorPolicy> {
        EstimatorPolicy::parse(&self.policy)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn config_view_leaves_out_credentials() {
        let mut config = RuntimeConfig::default();
        config.network.wifi_pass = "hunter2".to_string();
        config.auth.password = "s3cret".to_string();

        let json = serde_json::to_string(&ConfigView::from(&config)).unwrap();
        assert!(!json.contains("hunter2"));
        assert!(!json.contains("s3cret"));
        assert!(json.contains("\"authEnabled\":false"));
    }

    #[test]
    fn estimator_update_smoothing_is_optional() {
        let update: EstimatorUpdate =
            serde_json::from_str(r#"{"policy":"median_offset"}"#).unwrap();
        assert_eq!(update.smoothing, None);
        assert_eq!(update.policy(), Some(EstimatorPolicy::MedianOffset));
    }
}
