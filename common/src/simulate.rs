use serde::{Deserialize, Serialize};

use crate::{batch::RawReading, calibration::ADC_MAX_CODE};

/// Parameters of a synthetic mains waveform as the ADC would see it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WaveformConfig {
    pub frequency_hz: f64,
    #[serde(rename = "offsetCode")]
    pub offset_code: f64,
    #[serde(rename = "amplitudeCode")]
    pub amplitude_code: f64,
}

impl Default for WaveformConfig {
    fn default() -> Self {
        Self {
            frequency_hz: 60.0,
            offset_code: 2_048.0,
            amplitude_code: 640.0,
        }
    }
}

/// Deterministic sine generator producing clipped 12-bit codes.
#[derive(Debug, Clone)]
pub struct SineWave {
    channel: u8,
    sample_rate_hz: f64,
    waveform: WaveformConfig,
    index: u64,
}

impl SineWave {
    pub fn new(channel: u8, sample_rate_hz: u32, waveform: WaveformConfig) -> Self {
        Self {
            channel,
            sample_rate_hz: f64::from(sample_rate_hz.max(1)),
            waveform,
            index: 0,
        }
    }

    pub fn set_amplitude(&mut self, amplitude_code: f64) {
        self.waveform.amplitude_code = amplitude_code.max(0.0);
    }

    pub fn next_code(&mut self) -> u16 {
        let t = self.index as f64 / self.sample_rate_hz;
        self.index += 1;
        let value = self.waveform.offset_code
            + self.waveform.amplitude_code * (std::f64::consts::TAU * self.waveform.frequency_hz * t).sin();
        value.round().clamp(0.0, f64::from(ADC_MAX_CODE)) as u16
    }

    pub fn next_frame(&mut self, len: usize) -> Vec<RawReading> {
        (0..len)
            .map(|_| RawReading::new(self.channel, self.next_code()))
            .collect()
    }
}
