use std::{
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        mpsc::{self, Receiver, RecvTimeoutError, TrySendError},
        Arc,
    },
    thread::{self, JoinHandle},
    time::Duration,
};

use thiserror::Error;
use vrms_common::{
    simulate::{SineWave, WaveformConfig},
    BatchRead, BatchSource, RawReading, SamplerConfig,
};

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("simulated ADC is not running")]
    NotStarted,
    #[error("simulated ADC producer stopped")]
    ProducerStopped,
    #[error("failed to spawn simulated ADC producer: {0}")]
    Spawn(#[from] std::io::Error),
}

/// Stands in for the continuous ADC driver on the host.
///
/// A producer thread paces sine frames at the configured sample rate and
/// hands each one over a depth-1 channel. A frame that finds the slot still
/// occupied is dropped and counted, the way a full DMA pool loses
/// conversions.
pub struct SimulatedSource {
    channel: u8,
    frame_len: usize,
    sample_rate_hz: u32,
    waveform: WaveformConfig,
    running: Arc<AtomicBool>,
    overruns: Arc<AtomicU64>,
    receiver: Option<Receiver<Vec<RawReading>>>,
    producer: Option<JoinHandle<()>>,
    pending: Vec<RawReading>,
}

impl SimulatedSource {
    pub fn new(config: &SamplerConfig, waveform: WaveformConfig) -> Self {
        Self {
            channel: config.channel,
            frame_len: config.frame_len.max(1),
            sample_rate_hz: config.sample_rate_hz.max(1),
            waveform,
            running: Arc::new(AtomicBool::new(false)),
            overruns: Arc::new(AtomicU64::new(0)),
            receiver: None,
            producer: None,
            pending: Vec::new(),
        }
    }

    pub fn overruns(&self) -> u64 {
        self.overruns.load(Ordering::Relaxed)
    }

    fn frame_period(&self) -> Duration {
        Duration::from_secs_f64(self.frame_len as f64 / f64::from(self.sample_rate_hz))
    }

    fn take_pending(&mut self, max_count: usize) -> Vec<RawReading> {
        if self.pending.len() <= max_count {
            return std::mem::take(&mut self.pending);
        }
        let rest = self.pending.split_off(max_count);
        std::mem::replace(&mut self.pending, rest)
    }
}

impl BatchSource for SimulatedSource {
    type Error = SourceError;

    fn start(&mut self) -> Result<(), Self::Error> {
        if self.producer.is_some() {
            return Ok(());
        }

        let (sender, receiver) = mpsc::sync_channel(1);
        let mut wave = SineWave::new(self.channel, self.sample_rate_hz, self.waveform.clone());
        let frame_len = self.frame_len;
        let period = self.frame_period();
        let running = self.running.clone();
        let overruns = self.overruns.clone();
        running.store(true, Ordering::Relaxed);

        let producer = thread::Builder::new()
            .name("sim-adc".into())
            .spawn(move || {
                while running.load(Ordering::Relaxed) {
                    thread::sleep(period);
                    match sender.try_send(wave.next_frame(frame_len)) {
                        Ok(()) => {}
                        Err(TrySendError::Full(_)) => {
                            overruns.fetch_add(1, Ordering::Relaxed);
                        }
                        Err(TrySendError::Disconnected(_)) => break,
                    }
                }
            })?;

        self.receiver = Some(receiver);
        self.producer = Some(producer);
        Ok(())
    }

    fn stop(&mut self) -> Result<(), Self::Error> {
        self.running.store(false, Ordering::Relaxed);
        self.receiver = None;
        self.pending.clear();
        if let Some(producer) = self.producer.take() {
            producer.join().map_err(|_| SourceError::ProducerStopped)?;
        }
        Ok(())
    }

    fn read_batch(
        &mut self,
        max_count: usize,
        timeout: Duration,
    ) -> Result<BatchRead, Self::Error> {
        if !self.pending.is_empty() {
            return Ok(BatchRead::Ready(self.take_pending(max_count)));
        }

        let receiver = self.receiver.as_ref().ok_or(SourceError::NotStarted)?;
        match receiver.recv_timeout(timeout) {
            Ok(frame) => {
                self.pending = frame;
                Ok(BatchRead::Ready(self.take_pending(max_count)))
            }
            Err(RecvTimeoutError::Timeout) => Ok(BatchRead::Timeout),
            Err(RecvTimeoutError::Disconnected) => Err(SourceError::ProducerStopped),
        }
    }
}

impl Drop for SimulatedSource {
    fn drop(&mut self) {
        let _ = self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use vrms_common::{calibration::LinearCalibration, RmsEstimator, Sampler};

    fn config(frame_len: usize, batch_len: usize) -> SamplerConfig {
        SamplerConfig {
            frame_len,
            batch_len,
            ..SamplerConfig::default()
        }
    }

    #[test]
    fn read_before_start_is_an_error() {
        let mut source = SimulatedSource::new(&config(8, 8), WaveformConfig::default());
        let result = source.read_batch(8, Duration::from_millis(1));
        assert!(matches!(result, Err(SourceError::NotStarted)));
    }

    #[test]
    fn frames_are_split_to_the_requested_count() {
        let mut source = SimulatedSource::new(&config(8, 8), WaveformConfig::default());
        source.start().unwrap();

        let sizes: Vec<usize> = (0..3)
            .map(|_| match source.read_batch(3, Duration::from_secs(1)).unwrap() {
                BatchRead::Ready(readings) => readings.len(),
                BatchRead::Timeout => 0,
            })
            .collect();
        source.stop().unwrap();

        assert_eq!(sizes, vec![3, 3, 2]);
    }

    #[test]
    fn readings_carry_the_configured_channel() {
        let mut source = SimulatedSource::new(&config(16, 16), WaveformConfig::default());
        source.start().unwrap();
        let read = source.read_batch(16, Duration::from_secs(1)).unwrap();
        source.stop().unwrap();

        let BatchRead::Ready(readings) = read else {
            panic!("expected a frame");
        };
        assert!(readings.iter().all(|reading| reading.channel == 7));
    }

    #[test]
    fn sampler_measures_the_simulated_wave() {
        // 50 Hz at 20 kHz: every 400 sample frame is one whole cycle.
        let waveform = WaveformConfig {
            frequency_hz: 50.0,
            offset_code: 2_000.0,
            amplitude_code: 1_000.0,
        };
        let config = SamplerConfig {
            read_timeout_ms: 1_000,
            drain_timeout_ms: 1_000,
            ..config(400, 2_000)
        };
        let mut source = SimulatedSource::new(&config, waveform);
        let sampler = Sampler::new(
            &config,
            LinearCalibration::new(4_095, 4_095).unwrap(),
            RmsEstimator::default(),
        );

        source.start().unwrap();
        let outcome = sampler.poll(&mut source).unwrap();
        source.stop().unwrap();

        let result = outcome.result();
        assert_eq!(outcome.as_str(), "MEASURED");
        assert!((result.mean_mv - 2_000.0).abs() < 1.0);
        assert!((result.rms_mv - 1_000.0 / 2f64.sqrt()).abs() < 2.0);
    }

    #[test]
    fn sanitized_batches_leave_nothing_for_the_next_cycle() {
        let mut config = SamplerConfig {
            read_timeout_ms: 1_000,
            drain_timeout_ms: 1_000,
            ..config(100, 350)
        };
        config.sanitize();
        assert_eq!(config.batch_len, 300);

        let mut source = SimulatedSource::new(&config, WaveformConfig::default());
        let sampler = Sampler::new(&config, LinearCalibration::default(), RmsEstimator::default());

        source.start().unwrap();
        for _ in 0..2 {
            let outcome = sampler.poll(&mut source).unwrap();
            assert_eq!(outcome.as_str(), "MEASURED");
            assert!(source.pending.is_empty());
        }
        source.stop().unwrap();
    }

    #[test]
    fn stop_disconnects_the_consumer() {
        let mut source = SimulatedSource::new(&config(8, 8), WaveformConfig::default());
        source.start().unwrap();
        source.stop().unwrap();

        let result = source.read_batch(8, Duration::from_millis(10));
        assert!(matches!(result, Err(SourceError::NotStarted)));
    }
}
