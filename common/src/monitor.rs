use crate::{
    config::{EstimatorConfig, RuntimeConfig},
    energy::{EnergyMeter, EnergyReading},
    remote::{energy_report_value, RelayState},
    sampler::{CycleOutcome, NoDataReason},
    types::MonitorStatus,
};

/// Everything the HTTP surface and the control loop share about the device.
#[derive(Debug, Clone)]
pub struct MonitorState {
    estimator: EstimatorConfig,
    remote_enabled: bool,
    meter: EnergyMeter,

    last_outcome: Option<CycleOutcome>,
    last_energy: Option<EnergyReading>,
    unreported_kwh: f64,

    cycles: u64,
    timeouts: u64,
    empty_batches: u64,
    rejected: u64,

    relay: RelayState,
    last_remote_error: Option<String>,

    charger_led: bool,
    demo_routes_enabled: bool,
}

impl MonitorState {
    pub fn new(config: &RuntimeConfig) -> Self {
        Self {
            estimator: config.estimator,
            remote_enabled: config.remote.enabled,
            meter: EnergyMeter::new(&config.energy),
            last_outcome: None,
            last_energy: None,
            unreported_kwh: 0.0,
            cycles: 0,
            timeouts: 0,
            empty_batches: 0,
            rejected: 0,
            relay: RelayState::Off,
            last_remote_error: None,
            charger_led: false,
            demo_routes_enabled: true,
        }
    }

    pub fn estimator(&self) -> EstimatorConfig {
        self.estimator
    }

    pub fn set_estimator(&mut self, estimator: EstimatorConfig) {
        self.estimator = estimator;
    }

    /// Cycles without data still advance the energy time base at zero power.
    pub fn record_cycle(&mut self, outcome: CycleOutcome, now_ms: u64) -> EnergyReading {
        self.cycles += 1;
        match &outcome {
            CycleOutcome::Measured(_) => {}
            CycleOutcome::NoData {
                reason: NoDataReason::Timeout,
                ..
            } => self.timeouts += 1,
            CycleOutcome::NoData {
                reason: NoDataReason::EmptyBatch,
                ..
            } => self.empty_batches += 1,
            CycleOutcome::Rejected { .. } => self.rejected += 1,
        }

        let reading = self.meter.record(outcome.result().rms_mv, now_ms);
        self.unreported_kwh += reading.interval_kwh;
        self.last_outcome = Some(outcome);
        self.last_energy = Some(reading);
        reading
    }

    /// Energy accumulated since the last acknowledged report, formatted for upload.
    pub fn energy_report(&self, epoch_us: i64) -> (f64, String) {
        (
            self.unreported_kwh,
            energy_report_value(self.unreported_kwh, epoch_us),
        )
    }

    pub fn mark_reported(&mut self, kwh: f64) {
        self.unreported_kwh = (self.unreported_kwh - kwh).max(0.0);
    }

    /// Returns the new state when the relay has to change.
    pub fn apply_remote_status(&mut self, body: &str) -> Option<RelayState> {
        self.last_remote_error = None;
        self.set_relay(RelayState::from_status_body(body))
    }

    /// An unreachable control service opens the relay.
    pub fn remote_failed(&mut self, error: impl ToString) -> Option<RelayState> {
        self.last_remote_error = Some(error.to_string());
        self.set_relay(RelayState::Off)
    }

    fn set_relay(&mut self, next: RelayState) -> Option<RelayState> {
        if next == self.relay {
            return None;
        }
        self.relay = next;
        Some(next)
    }

    pub fn relay(&self) -> RelayState {
        self.relay
    }

    pub fn toggle_charger_led(&mut self) -> bool {
        self.charger_led = !self.charger_led;
        self.charger_led
    }

    pub fn charger_message(&self) -> String {
        format!(
            "EV Charger is: {}",
            if self.charger_led { "ON" } else { "OFF" }
        )
    }

    pub fn set_demo_routes_enabled(&mut self, enabled: bool) {
        self.demo_routes_enabled = enabled;
    }

    pub fn demo_routes_enabled(&self) -> bool {
        self.demo_routes_enabled
    }

    pub fn status(&self, device_id: &str, uptime_ms: u64) -> MonitorStatus {
        let result = self
            .last_outcome
            .as_ref()
            .map(CycleOutcome::result)
            .unwrap_or_default();
        let measurement = match &self.last_outcome {
            Some(CycleOutcome::Measured(measurement)) => Some(*measurement),
            _ => None,
        };
        let (samples, dropped) = match &self.last_outcome {
            Some(CycleOutcome::Measured(m)) => (m.samples, m.dropped),
            Some(CycleOutcome::NoData { dropped, .. }) => (0, *dropped),
            Some(CycleOutcome::Rejected { samples, .. }) => (*samples, 0),
            None => (0, 0),
        };
        let last_error = match &self.last_outcome {
            Some(CycleOutcome::Rejected { error, .. }) => Some(error.to_string()),
            _ => None,
        };

        MonitorStatus {
            device_id: device_id.to_string(),
            rms_mv: result.rms_mv,
            mean_mv: result.mean_mv,
            amps: self.meter.amps(result.rms_mv),
            policy: self.estimator.policy.as_str(),
            smoothing: self.estimator.smoothing,
            last_outcome: self
                .last_outcome
                .as_ref()
                .map(CycleOutcome::as_str)
                .unwrap_or("NONE"),
            last_error,
            samples,
            dropped,
            min_mv: measurement.map(|m| m.min_mv).unwrap_or_default(),
            max_mv: measurement.map(|m| m.max_mv).unwrap_or_default(),
            cycles: self.cycles,
            timeouts: self.timeouts,
            empty_batches: self.empty_batches,
            rejected: self.rejected,
            total_kwh: self.meter.total_kwh(),
            relay: self.relay.as_str(),
            remote_enabled: self.remote_enabled,
            last_remote_error: self.last_remote_error.clone(),
            charger_led: self.charger_led,
            uptime_ms,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        error::EstimateError,
        estimator::{EstimatorPolicy, RmsResult},
        sampler::Measurement,
    };
    use pretty_assertions::assert_eq;

    fn measured(rms_mv: f64) -> CycleOutcome {
        CycleOutcome::Measured(Measurement {
            result: RmsResult {
                rms_mv,
                mean_mv: 1_650.0,
            },
            samples: 2_048,
            dropped: 3,
            min_mv: 1_000,
            max_mv: 2_300,
        })
    }

    #[test]
    fn counts_outcomes_and_reports_last() {
        let mut state = MonitorState::new(&RuntimeConfig::default());
        state.record_cycle(measured(370.0), 0);
        state.record_cycle(
            CycleOutcome::NoData {
                reason: NoDataReason::Timeout,
                dropped: 0,
            },
            1_000,
        );
        state.record_cycle(
            CycleOutcome::Rejected {
                error: EstimateError::NoCrossingFound { samples: 64 },
                samples: 64,
            },
            2_000,
        );

        let status = state.status("dev", 5);
        assert_eq!(status.cycles, 3);
        assert_eq!(status.timeouts, 1);
        assert_eq!(status.rejected, 1);
        assert_eq!(status.last_outcome, "REJECTED");
        assert_eq!(status.rms_mv, 0.0);
        assert_eq!(status.samples, 64);
        assert_eq!(
            status.last_error.as_deref(),
            Some("no rising zero crossing in 64 samples")
        );
    }

    #[test]
    fn measured_status_carries_amps() {
        let mut state = MonitorState::new(&RuntimeConfig::default());
        state.record_cycle(measured(370.0), 0);

        let status = state.status("dev", 0);
        assert_eq!(status.last_outcome, "MEASURED");
        assert_eq!(status.amps, 10.0);
        assert_eq!((status.min_mv, status.max_mv), (1_000, 2_300));
        assert_eq!(status.policy, EstimatorPolicy::MeanDeviation.as_str());
    }

    #[test]
    fn energy_report_is_acknowledged_separately() {
        let mut state = MonitorState::new(&RuntimeConfig::default());
        state.record_cycle(measured(370.0), 0);
        state.record_cycle(measured(370.0), 1_000);

        let (kwh, value) = state.energy_report(42);
        assert!(kwh > 0.0);
        assert!(value.ends_with("_epochtime:42"));

        state.mark_reported(kwh);
        assert_eq!(state.energy_report(43).0, 0.0);
    }

    #[test]
    fn relay_transitions_only_on_change() {
        let mut state = MonitorState::new(&RuntimeConfig::default());

        assert_eq!(state.apply_remote_status("CHARGING"), Some(RelayState::On));
        assert_eq!(state.apply_remote_status("CHARGING"), None);
        assert_eq!(state.remote_failed("timed out"), Some(RelayState::Off));
        assert_eq!(
            state.status("dev", 0).last_remote_error.as_deref(),
            Some("timed out")
        );
        assert_eq!(state.apply_remote_status("IDLE"), None);
        assert_eq!(state.status("dev", 0).last_remote_error, None);
    }

    #[test]
    fn charger_led_toggles_before_reporting() {
        let mut state = MonitorState::new(&RuntimeConfig::default());
        assert!(state.toggle_charger_led());
        assert_eq!(state.charger_message(), "EV Charger is: ON");
        assert!(!state.toggle_charger_led());
        assert_eq!(state.charger_message(), "EV Charger is: OFF");
    }
}
