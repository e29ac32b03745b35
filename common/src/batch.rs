use crate::calibration::{Calibration, ADC_MAX_CODE};

/// One conversion as delivered by the ADC driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawReading {
    pub channel: u8,
    pub code: u16,
}

impl RawReading {
    pub fn new(channel: u8, code: u16) -> Self {
        Self { channel, code }
    }
}

/// Raw codes for a single channel collected during one polling cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SampleBatch {
    codes: Vec<u16>,
    dropped: usize,
    capacity: usize,
}

impl SampleBatch {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            codes: Vec::with_capacity(capacity),
            dropped: 0,
            capacity,
        }
    }

    pub fn from_readings(
        channel: u8,
        capacity: usize,
        readings: impl IntoIterator<Item = RawReading>,
    ) -> Self {
        let mut batch = Self::with_capacity(capacity);
        batch.extend(channel, readings);
        batch
    }

    /// Appends readings for `channel` until the batch is full. Readings from
    /// other channels or above the 12-bit range are counted as dropped;
    /// readings arriving after the batch filled are ignored.
    pub fn extend(&mut self, channel: u8, readings: impl IntoIterator<Item = RawReading>) {
        for reading in readings {
            if self.is_full() {
                break;
            }
            if reading.channel != channel || reading.code > ADC_MAX_CODE {
                self.dropped += 1;
                continue;
            }
            self.codes.push(reading.code);
        }
    }

    pub fn codes(&self) -> &[u16] {
        &self.codes
    }

    pub fn len(&self) -> usize {
        self.codes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.codes.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.codes.len() >= self.capacity
    }

    pub fn dropped(&self) -> usize {
        self.dropped
    }

    pub fn calibrated(&self, calibration: &impl Calibration) -> Vec<i32> {
        calibration.calibrate(&self.codes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calibration::LinearCalibration;
    use pretty_assertions::assert_eq;

    #[test]
    fn keeps_only_matching_channel_in_order() {
        let readings = [
            RawReading::new(7, 10),
            RawReading::new(6, 20),
            RawReading::new(7, 30),
            RawReading::new(7, 0x1FFF),
            RawReading::new(7, 40),
        ];

        let batch = SampleBatch::from_readings(7, 16, readings);

        assert_eq!(batch.codes(), &[10, 30, 40]);
        assert_eq!(batch.dropped(), 2);
        assert!(!batch.is_full());
    }

    #[test]
    fn stops_at_capacity() {
        let readings = (0..10).map(|code| RawReading::new(0, code));
        let batch = SampleBatch::from_readings(0, 4, readings);

        assert_eq!(batch.codes(), &[0, 1, 2, 3]);
        assert!(batch.is_full());
        assert_eq!(batch.dropped(), 0);
    }

    #[test]
    fn calibrates_every_code() {
        let batch = SampleBatch::from_readings(
            0,
            3,
            [0, 4_095, 2_048].map(|code| RawReading::new(0, code)),
        );
        let cal = LinearCalibration::new(4_095, 4_095).unwrap();

        assert_eq!(batch.calibrated(&cal), vec![0, 4_095, 2_048]);
    }
}
