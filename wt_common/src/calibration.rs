//! Raw → engineering-value calibration transforms.
//!
//! Calibration is a pure function of the payload and the raw sample; it
//! owns no state, so applying it twice to the same input always yields the
//! same output. Out-of-domain inputs (Steinhart with `raw ≥ Vref`) return
//! a sentinel together with an out-of-range status instead of an error:
//! the pipeline publishes the sentinel so the supervisor sees what the
//! probe produced.

use serde::{Deserialize, Serialize};

use crate::consts::STEINHART_VREF;
use crate::error::{RtuError, RtuResult};
use crate::model::SensorStatus;

/// Degenerate two-point spans below this are treated as uncalibrated.
const TWO_POINT_EPSILON: f32 = 1e-4;

/// Absolute-zero sentinel returned by out-of-domain Steinhart inputs [°C].
pub const STEINHART_SENTINEL: f32 = -273.15;

/// Maximum polynomial degree.
pub const MAX_POLY_DEGREE: usize = 5;

/// Tagged calibration payload attached to a sensor module.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum Calibration {
    /// Pass the raw value through unchanged.
    #[default]
    None,
    /// `eng = scale · raw + offset`.
    Linear { scale: f32, offset: f32 },
    /// Linear interpolation through two measured points.
    TwoPoint {
        raw_low: f32,
        raw_high: f32,
        ref_low: f32,
        ref_high: f32,
    },
    /// Horner evaluation of `coefficients[0..=degree]`.
    Polynomial {
        coefficients: [f32; MAX_POLY_DEGREE + 1],
        degree: u8,
    },
    /// Piecewise-linear interpolation over an ordered raw table,
    /// clamped to the end points outside it.
    Lookup { raw: Vec<f32>, eng: Vec<f32> },
    /// Steinhart–Hart thermistor conversion. `raw` is the divider
    /// voltage against a 3.3 V reference.
    Steinhart {
        a: f32,
        b: f32,
        c: f32,
        series_resistor: f32,
    },
}

impl Calibration {
    /// Validate payload shape. Called once at load/bind time.
    pub fn validate(&self) -> RtuResult<()> {
        match self {
            Self::None | Self::Linear { .. } | Self::TwoPoint { .. } => Ok(()),
            Self::Polynomial { degree, .. } => {
                if usize::from(*degree) > MAX_POLY_DEGREE {
                    return Err(RtuError::InvalidParam(format!(
                        "polynomial degree {degree} above maximum {MAX_POLY_DEGREE}"
                    )));
                }
                Ok(())
            }
            Self::Lookup { raw, eng } => {
                if raw.len() < 2 || raw.len() != eng.len() {
                    return Err(RtuError::InvalidParam(format!(
                        "lookup table needs n ≥ 2 matched points, got {}/{}",
                        raw.len(),
                        eng.len()
                    )));
                }
                if raw.windows(2).any(|w| w[0] >= w[1]) {
                    return Err(RtuError::InvalidParam(
                        "lookup raw points must be strictly increasing".into(),
                    ));
                }
                Ok(())
            }
            Self::Steinhart {
                series_resistor, ..
            } => {
                if *series_resistor <= 0.0 {
                    return Err(RtuError::InvalidParam(format!(
                        "series resistor {series_resistor} must be positive"
                    )));
                }
                Ok(())
            }
        }
    }

    /// Apply the calibration to a raw sample.
    ///
    /// Returns the engineering value plus the status the conversion itself
    /// determined; range gating against the module's reference range
    /// happens later in the pipeline.
    pub fn apply(&self, raw: f32) -> (f32, SensorStatus) {
        match self {
            Self::None => (raw, SensorStatus::Ok),

            Self::Linear { scale, offset } => (scale * raw + offset, SensorStatus::Ok),

            Self::TwoPoint {
                raw_low,
                raw_high,
                ref_low,
                ref_high,
            } => {
                let span = raw_high - raw_low;
                if span.abs() < TWO_POINT_EPSILON {
                    return (raw, SensorStatus::Ok);
                }
                let t = (raw - raw_low) / span;
                (ref_low + t * (ref_high - ref_low), SensorStatus::Ok)
            }

            Self::Polynomial {
                coefficients,
                degree,
            } => {
                let degree = usize::from(*degree).min(MAX_POLY_DEGREE);
                let mut acc = coefficients[degree];
                for i in (0..degree).rev() {
                    acc = acc * raw + coefficients[i];
                }
                (acc, SensorStatus::Ok)
            }

            Self::Lookup { raw: xs, eng: ys } => {
                debug_assert!(xs.len() >= 2 && xs.len() == ys.len());
                // NaN compares false against both bounds and would reach
                // the interpolation search; treat it as out of domain.
                if raw.is_nan() {
                    return (raw, SensorStatus::OutOfRange);
                }
                if raw <= xs[0] {
                    return (ys[0], SensorStatus::Ok);
                }
                if raw >= xs[xs.len() - 1] {
                    return (ys[ys.len() - 1], SensorStatus::Ok);
                }
                // Binary search for the bracketing segment.
                let idx = match xs.binary_search_by(|x| x.partial_cmp(&raw).unwrap()) {
                    Ok(i) => return (ys[i], SensorStatus::Ok),
                    Err(i) => i,
                };
                let (x0, x1) = (xs[idx - 1], xs[idx]);
                let (y0, y1) = (ys[idx - 1], ys[idx]);
                let t = (raw - x0) / (x1 - x0);
                (y0 + t * (y1 - y0), SensorStatus::Ok)
            }

            Self::Steinhart {
                a,
                b,
                c,
                series_resistor,
            } => {
                if raw >= STEINHART_VREF {
                    return (STEINHART_SENTINEL, SensorStatus::OutOfRange);
                }
                let r = series_resistor * raw / (STEINHART_VREF - raw);
                if r <= 0.0 {
                    return (STEINHART_SENTINEL, SensorStatus::OutOfRange);
                }
                let ln_r = r.ln();
                let inv_t = a + b * ln_r + c * ln_r * ln_r * ln_r;
                (1.0 / inv_t - 273.15, SensorStatus::Ok)
            }
        }
    }
}
