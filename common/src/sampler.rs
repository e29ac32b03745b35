//! One polling cycle: wait for the driver's "frame ready" hand-off, drain
//! what is available, calibrate, estimate, discard the batch.

use std::time::Duration;

use serde::Serialize;

use crate::{
    batch::{RawReading, SampleBatch},
    calibration::Calibration,
    config::SamplerConfig,
    error::EstimateError,
    estimator::{RmsEstimator, RmsResult},
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BatchRead {
    Ready(Vec<RawReading>),
    Timeout,
}

/// A continuous ADC driver seen as a producer of conversion frames.
///
/// `read_batch` blocks until the producer signals a frame or `timeout`
/// elapses. Only one consumer ever reads from a source.
pub trait BatchSource {
    type Error;

    fn start(&mut self) -> Result<(), Self::Error>;
    fn stop(&mut self) -> Result<(), Self::Error>;
    fn read_batch(
        &mut self,
        max_count: usize,
        timeout: Duration,
    ) -> Result<BatchRead, Self::Error>;
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Measurement {
    #[serde(flatten)]
    pub result: RmsResult,
    pub samples: usize,
    pub dropped: usize,
    #[serde(rename = "minMv")]
    pub min_mv: i32,
    #[serde(rename = "maxMv")]
    pub max_mv: i32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NoDataReason {
    Timeout,
    EmptyBatch,
}

impl NoDataReason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Timeout => "TIMEOUT",
            Self::EmptyBatch => "EMPTY_BATCH",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum CycleOutcome {
    Measured(Measurement),
    /// Nothing to estimate this cycle; the result is defined as zero.
    NoData { reason: NoDataReason, dropped: usize },
    Rejected { error: EstimateError, samples: usize },
}

impl CycleOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Measured(_) => "MEASURED",
            Self::NoData { reason, .. } => reason.as_str(),
            Self::Rejected { .. } => "REJECTED",
        }
    }

    /// Value the caller should publish for this cycle.
    pub fn result(&self) -> RmsResult {
        match self {
            Self::Measured(measurement) => measurement.result,
            Self::NoData { .. } | Self::Rejected { .. } => RmsResult::ZERO,
        }
    }
}

pub struct Sampler<C> {
    channel: u8,
    batch_len: usize,
    first_read_timeout: Duration,
    drain_timeout: Duration,
    calibration: C,
    estimator: RmsEstimator,
}

impl<C: Calibration> Sampler<C> {
    pub fn new(config: &SamplerConfig, calibration: C, estimator: RmsEstimator) -> Self {
        Self {
            channel: config.channel,
            batch_len: config.batch_len.max(1),
            first_read_timeout: Duration::from_millis(config.read_timeout_ms),
            drain_timeout: Duration::from_millis(config.drain_timeout_ms),
            calibration,
            estimator,
        }
    }

    pub fn estimator(&self) -> RmsEstimator {
        self.estimator
    }

    pub fn set_estimator(&mut self, estimator: RmsEstimator) {
        self.estimator = estimator;
    }

    pub fn batch_len(&self) -> usize {
        self.batch_len
    }

    pub fn poll<S: BatchSource>(&self, source: &mut S) -> Result<CycleOutcome, S::Error> {
        let mut batch = SampleBatch::with_capacity(self.batch_len);

        match source.read_batch(self.batch_len, self.first_read_timeout)? {
            BatchRead::Timeout => {
                return Ok(CycleOutcome::NoData {
                    reason: NoDataReason::Timeout,
                    dropped: 0,
                })
            }
            BatchRead::Ready(readings) => batch.extend(self.channel, readings),
        }

        // Bounded so a source that only yields foreign channels cannot spin us.
        for _ in 0..self.batch_len {
            if batch.is_full() {
                break;
            }
            match source.read_batch(self.batch_len - batch.len(), self.drain_timeout)? {
                BatchRead::Ready(readings) if !readings.is_empty() => {
                    batch.extend(self.channel, readings)
                }
                _ => break,
            }
        }

        Ok(self.evaluate(&batch))
    }

    /// Calibrates and estimates an already collected batch.
    pub fn evaluate(&self, batch: &SampleBatch) -> CycleOutcome {
        if batch.is_empty() {
            return CycleOutcome::NoData {
                reason: NoDataReason::EmptyBatch,
                dropped: batch.dropped(),
            };
        }

        let samples = batch.calibrated(&self.calibration);
        match self.estimator.estimate(&samples) {
            Ok(result) => CycleOutcome::Measured(Measurement {
                result,
                samples: samples.len(),
                dropped: batch.dropped(),
                min_mv: samples.iter().copied().min().unwrap_or_default(),
                max_mv: samples.iter().copied().max().unwrap_or_default(),
            }),
            Err(error) => CycleOutcome::Rejected {
                error,
                samples: samples.len(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;

    use super::*;
    use crate::{calibration::LinearCalibration, estimator::EstimatorPolicy};
    use pretty_assertions::assert_eq;

    #[derive(Default)]
    struct ScriptedSource {
        reads: VecDeque<BatchRead>,
        requested: Vec<(usize, Duration)>,
    }

    impl ScriptedSource {
        fn new(reads: impl IntoIterator<Item = BatchRead>) -> Self {
            Self {
                reads: reads.into_iter().collect(),
                requested: Vec::new(),
            }
        }
    }

    impl BatchSource for ScriptedSource {
        type Error = std::convert::Infallible;

        fn start(&mut self) -> Result<(), Self::Error> {
            Ok(())
        }

        fn stop(&mut self) -> Result<(), Self::Error> {
            Ok(())
        }

        fn read_batch(
            &mut self,
            max_count: usize,
            timeout: Duration,
        ) -> Result<BatchRead, Self::Error> {
            self.requested.push((max_count, timeout));
            Ok(self.reads.pop_front().unwrap_or(BatchRead::Timeout))
        }
    }

    fn frame(codes: &[u16]) -> BatchRead {
        BatchRead::Ready(codes.iter().map(|&code| RawReading::new(7, code)).collect())
    }

    fn sampler(batch_len: usize) -> Sampler<LinearCalibration> {
        let config = SamplerConfig {
            batch_len,
            ..SamplerConfig::default()
        };
        Sampler::new(
            &config,
            LinearCalibration::new(4_095, 4_095).unwrap(),
            RmsEstimator::new(EstimatorPolicy::MeanDeviation),
        )
    }

    #[test]
    fn timeout_on_first_read_is_no_data() {
        let mut source = ScriptedSource::new([BatchRead::Timeout]);
        let outcome = sampler(4).poll(&mut source).unwrap();

        assert_eq!(
            outcome,
            CycleOutcome::NoData {
                reason: NoDataReason::Timeout,
                dropped: 0,
            }
        );
        assert_eq!(outcome.result(), RmsResult::ZERO);
    }

    #[test]
    fn drains_until_batch_is_full() {
        let mut source = ScriptedSource::new([frame(&[100, 300]), frame(&[100, 300, 999])]);
        let outcome = sampler(4).poll(&mut source).unwrap();

        let CycleOutcome::Measured(measurement) = outcome else {
            panic!("expected a measurement, got {outcome:?}");
        };
        assert_eq!(measurement.result.mean_mv, 200.0);
        assert_eq!(measurement.result.rms_mv, 100.0);
        assert_eq!(measurement.samples, 4);
        assert_eq!((measurement.min_mv, measurement.max_mv), (100, 300));
        assert_eq!(source.requested.iter().map(|r| r.0).collect::<Vec<_>>(), vec![4, 2]);
    }

    #[test]
    fn drain_stops_at_timeout_with_partial_batch() {
        let mut source = ScriptedSource::new([frame(&[100, 300]), BatchRead::Timeout]);
        let outcome = sampler(8).poll(&mut source).unwrap();

        assert_eq!(
            outcome.result(),
            RmsResult {
                rms_mv: 100.0,
                mean_mv: 200.0,
            }
        );
    }

    #[test]
    fn foreign_channel_only_is_empty_batch() {
        let foreign = BatchRead::Ready(vec![RawReading::new(3, 10), RawReading::new(3, 11)]);
        let mut source = ScriptedSource::new([foreign]);
        let outcome = sampler(4).poll(&mut source).unwrap();

        assert_eq!(
            outcome,
            CycleOutcome::NoData {
                reason: NoDataReason::EmptyBatch,
                dropped: 2,
            }
        );
    }

    #[test]
    fn zero_crossing_failure_is_surfaced() {
        let mut sampler = sampler(16);
        sampler.set_estimator(RmsEstimator::new(EstimatorPolicy::ZeroCrossing));
        let mut source = ScriptedSource::new([frame(&[2_000; 16])]);

        let outcome = sampler.poll(&mut source).unwrap();

        assert_eq!(
            outcome,
            CycleOutcome::Rejected {
                error: EstimateError::NoCrossingFound { samples: 16 },
                samples: 16,
            }
        );
        assert_eq!(outcome.result(), RmsResult::ZERO);
    }
}
