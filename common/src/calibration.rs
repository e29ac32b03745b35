use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};

use serde::{Deserialize, Serialize};

use crate::error::CalibrationError;

/// Largest code a 12-bit conversion can produce.
pub const ADC_MAX_CODE: u16 = 0x0FFF;

/// Maps a raw ADC code to millivolts. Implementations must be monotonic.
pub trait Calibration {
    fn to_millivolts(&self, code: u16) -> i32;

    fn calibrate(&self, codes: &[u16]) -> Vec<i32> {
        codes.iter().map(|&code| self.to_millivolts(code)).collect()
    }
}

impl<T: Calibration + ?Sized> Calibration for Box<T> {
    fn to_millivolts(&self, code: u16) -> i32 {
        (**self).to_millivolts(code)
    }
}

impl<T: Calibration + ?Sized> Calibration for &T {
    fn to_millivolts(&self, code: u16) -> i32 {
        (**self).to_millivolts(code)
    }
}

/// `code / max_code * full_scale_mv`, rounded to the nearest millivolt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinearCalibration {
    #[serde(rename = "maxCode")]
    pub max_code: u16,
    #[serde(rename = "fullScaleMv")]
    pub full_scale_mv: u32,
}

impl Default for LinearCalibration {
    fn default() -> Self {
        Self {
            max_code: ADC_MAX_CODE,
            full_scale_mv: 3_300,
        }
    }
}

impl LinearCalibration {
    pub fn new(max_code: u16, full_scale_mv: u32) -> Result<Self, CalibrationError> {
        if max_code == 0 {
            return Err(CalibrationError::ZeroScale);
        }
        Ok(Self {
            max_code,
            full_scale_mv,
        })
    }
}

impl Calibration for LinearCalibration {
    fn to_millivolts(&self, code: u16) -> i32 {
        let max_code = u64::from(self.max_code.max(1));
        let code = u64::from(code).min(max_code);
        let mv = (code * u64::from(self.full_scale_mv) + max_code / 2) / max_code;
        i32::try_from(mv).unwrap_or(i32::MAX)
    }
}

/// Piecewise-linear curve through measured `(code, mV)` points. Codes outside
/// the curve clamp to its end points.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CurveCalibration {
    points: Vec<(u16, i32)>,
}

impl CurveCalibration {
    pub fn new(points: Vec<(u16, i32)>) -> Result<Self, CalibrationError> {
        if points.len() < 2 {
            return Err(CalibrationError::TooFewPoints(points.len()));
        }

        for (index, pair) in points.windows(2).enumerate() {
            let ((code0, mv0), (code1, mv1)) = (pair[0], pair[1]);
            if code1 <= code0 || mv1 < mv0 {
                return Err(CalibrationError::NotMonotonic { index: index + 1 });
            }
        }

        Ok(Self { points })
    }

    pub fn points(&self) -> &[(u16, i32)] {
        &self.points
    }
}

impl Calibration for CurveCalibration {
    fn to_millivolts(&self, code: u16) -> i32 {
        let upper = self.points.partition_point(|&(point, _)| point <= code);
        if upper == 0 {
            return self.points[0].1;
        }
        if upper == self.points.len() {
            return self.points[upper - 1].1;
        }

        let (x0, y0) = self.points[upper - 1];
        let (x1, y1) = self.points[upper];
        let span = i64::from(x1 - x0);
        let rise = i64::from(y1) - i64::from(y0);
        let offset = i64::from(code - x0);
        let mv = i64::from(y0) + (offset * rise + span / 2) / span;
        i32::try_from(mv).unwrap_or(i32::MAX)
    }
}

/// Wraps a conversion that can fail per code, such as a chip-provided scheme.
///
/// Failed codes go through `fallback` instead of collapsing to zero, and are
/// counted in a shared counter the owner can watch.
pub struct FallbackCalibration<F> {
    convert: F,
    fallback: LinearCalibration,
    failures: Arc<AtomicU64>,
}

impl<F> FallbackCalibration<F>
where
    F: Fn(u16) -> Option<i32>,
{
    pub fn new(convert: F, fallback: LinearCalibration) -> Self {
        Self {
            convert,
            fallback,
            failures: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn failures(&self) -> Arc<AtomicU64> {
        self.failures.clone()
    }
}

impl<F> Calibration for FallbackCalibration<F>
where
    F: Fn(u16) -> Option<i32>,
{
    fn to_millivolts(&self, code: u16) -> i32 {
        match (self.convert)(code) {
            Some(mv) => mv,
            None => {
                self.failures.fetch_add(1, Ordering::Relaxed);
                self.fallback.to_millivolts(code)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn linear_maps_end_points() {
        let cal = LinearCalibration::default();
        assert_eq!(cal.to_millivolts(0), 0);
        assert_eq!(cal.to_millivolts(ADC_MAX_CODE), 3_300);
        // Codes past the 12-bit range saturate.
        assert_eq!(cal.to_millivolts(u16::MAX), 3_300);
    }

    #[test]
    fn linear_rounds_to_nearest() {
        let cal = LinearCalibration::new(4_095, 4_100).unwrap();
        // 2048 * 4100 / 4095 = 2050.5 -> 2051
        assert_eq!(cal.to_millivolts(2_048), 2_051);
        assert_eq!(cal.to_millivolts(1), 1);
    }

    #[test]
    fn linear_rejects_zero_scale() {
        assert_eq!(
            LinearCalibration::new(0, 3_300),
            Err(CalibrationError::ZeroScale)
        );
    }

    #[test]
    fn curve_interpolates_and_clamps() {
        let curve = CurveCalibration::new(vec![(100, 150), (1_100, 1_150), (4_000, 3_100)]).unwrap();

        assert_eq!(curve.to_millivolts(0), 150);
        assert_eq!(curve.to_millivolts(100), 150);
        assert_eq!(curve.to_millivolts(600), 650);
        assert_eq!(curve.to_millivolts(1_100), 1_150);
        assert_eq!(curve.to_millivolts(4_000), 3_100);
        assert_eq!(curve.to_millivolts(4_095), 3_100);
    }

    #[test]
    fn curve_validation() {
        assert_eq!(
            CurveCalibration::new(vec![(0, 0)]),
            Err(CalibrationError::TooFewPoints(1))
        );
        assert_eq!(
            CurveCalibration::new(vec![(0, 0), (10, 100), (10, 200)]),
            Err(CalibrationError::NotMonotonic { index: 2 })
        );
        assert_eq!(
            CurveCalibration::new(vec![(0, 500), (10, 100)]),
            Err(CalibrationError::NotMonotonic { index: 1 })
        );
    }

    #[test]
    fn curve_is_monotonic_over_the_code_range() {
        let curve = CurveCalibration::new(vec![(0, 75), (2_000, 1_400), (4_095, 3_150)]).unwrap();
        let mvs = curve.calibrate(&(0..=ADC_MAX_CODE).collect::<Vec<_>>());
        assert!(mvs.windows(2).all(|pair| pair[0] <= pair[1]));
    }

    #[test]
    fn failed_codes_use_the_fallback_and_are_counted() {
        // Pretend the scheme rejects codes above 4000.
        let cal = FallbackCalibration::new(
            |code| (code <= 4_000).then(|| i32::from(code) / 2),
            LinearCalibration::new(4_095, 4_095).unwrap(),
        );
        let failures = cal.failures();

        assert_eq!(cal.calibrate(&[100, 4_000, 4_050, 4_095]), vec![50, 2_000, 4_050, 4_095]);
        assert_eq!(failures.load(Ordering::Relaxed), 2);
    }
}
