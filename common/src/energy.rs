use serde::Serialize;

use crate::config::EnergyConfig;

const MS_PER_HOUR: f64 = 3_600_000.0;

/// Energy drawn during one measurement interval.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct EnergyReading {
    pub amps: f64,
    pub watts: f64,
    #[serde(rename = "intervalKwh")]
    pub interval_kwh: f64,
    #[serde(rename = "totalKwh")]
    pub total_kwh: f64,
    #[serde(rename = "elapsedMs")]
    pub elapsed_ms: u64,
}

/// Integrates power over monotonic time, one RMS measurement at a time.
#[derive(Debug, Clone)]
pub struct EnergyMeter {
    grid_voltage_v: f64,
    mv_per_amp: f64,
    max_gap_ms: u64,
    total_kwh: f64,
    last_ms: Option<u64>,
}

impl EnergyMeter {
    pub fn new(config: &EnergyConfig) -> Self {
        Self {
            grid_voltage_v: config.grid_voltage_v,
            mv_per_amp: config.mv_per_amp,
            max_gap_ms: config.max_gap_ms,
            total_kwh: 0.0,
            last_ms: None,
        }
    }

    pub fn amps(&self, rms_mv: f64) -> f64 {
        if self.mv_per_amp <= 0.0 {
            return 0.0;
        }
        rms_mv.max(0.0) / self.mv_per_amp
    }

    /// The first call only establishes the time base and contributes no energy.
    pub fn record(&mut self, rms_mv: f64, now_ms: u64) -> EnergyReading {
        let elapsed_ms = match self.last_ms {
            Some(last) => now_ms.saturating_sub(last).min(self.max_gap_ms),
            None => 0,
        };
        self.last_ms = Some(now_ms);

        let amps = self.amps(rms_mv);
        let watts = amps * self.grid_voltage_v;
        let interval_kwh = watts / 1_000.0 * elapsed_ms as f64 / MS_PER_HOUR;
        self.total_kwh += interval_kwh;

        EnergyReading {
            amps,
            watts,
            interval_kwh,
            total_kwh: self.total_kwh,
            elapsed_ms,
        }
    }

    pub fn total_kwh(&self) -> f64 {
        self.total_kwh
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn meter() -> EnergyMeter {
        EnergyMeter::new(&EnergyConfig {
            grid_voltage_v: 240.0,
            mv_per_amp: 37.0,
            max_gap_ms: 5_000,
        })
    }

    #[test]
    fn first_record_sets_time_base() {
        let mut meter = meter();
        let reading = meter.record(370.0, 1_000);

        assert_eq!(reading.amps, 10.0);
        assert_eq!(reading.watts, 2_400.0);
        assert_eq!(reading.interval_kwh, 0.0);
        assert_eq!(reading.elapsed_ms, 0);
    }

    #[test]
    fn integrates_over_elapsed_time() {
        let mut meter = meter();
        meter.record(370.0, 0);
        let reading = meter.record(370.0, 1_500);

        // 2.4 kW for 1.5 s
        assert!((reading.interval_kwh - 2.4 * 1.5 / 3_600.0).abs() < 1e-12);
        assert_eq!(reading.total_kwh, reading.interval_kwh);
        assert_eq!(reading.elapsed_ms, 1_500);
    }

    #[test]
    fn long_gaps_are_clamped() {
        let mut meter = meter();
        meter.record(370.0, 0);
        let reading = meter.record(370.0, 60_000);

        assert_eq!(reading.elapsed_ms, 5_000);
    }

    #[test]
    fn clock_going_backwards_adds_nothing() {
        let mut meter = meter();
        meter.record(370.0, 10_000);
        let reading = meter.record(370.0, 9_000);

        assert_eq!(reading.interval_kwh, 0.0);
        assert_eq!(meter.total_kwh(), 0.0);
    }
}
