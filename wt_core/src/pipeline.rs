//! Per-sensor processing: acquire → calibrate → filter → range gate →
//! publish.
//!
//! The blocking half (the driver read) runs on a bus worker; everything
//! here is bounded constant time and runs on the tick thread when the
//! worker's result arrives. Driver failures never leave this module:
//! they become the sensor's published status.

use tracing::{debug, warn};

use wt_common::consts::SENSOR_ERROR_STREAK;
use wt_common::error::{RtuError, RtuResult};
use wt_common::filter::Ema;
use wt_common::model::{ModuleType, Reading, SensorModule, SensorStatus};
use wt_hal::drivers::CalculatedSensor;

use crate::table::SensorValueTable;

/// Result of processing one acquisition.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProcessOutcome {
    /// Reading to publish, if any. A failed read with no prior value
    /// publishes nothing.
    pub reading: Option<Reading>,
    /// Set on the tick the consecutive-error streak crosses the
    /// unavailable threshold.
    pub health_event: bool,
}

/// Per-sensor runtime state.
pub struct SensorRuntime {
    pub module: SensorModule,
    ema: Ema,
    error_streak: u32,
    /// Last published engineering value, for error-status publishes.
    last_value: Option<f32>,
    /// Whether a driver is bound (false = configured but inactive).
    pub active: bool,
}

impl SensorRuntime {
    pub fn new(module: SensorModule, active: bool) -> Self {
        let ema = Ema::new(module.filter_alpha);
        Self {
            module,
            ema,
            error_streak: 0,
            last_value: None,
            active,
        }
    }

    /// Current consecutive-error streak.
    pub fn error_streak(&self) -> u32 {
        self.error_streak
    }

    /// Process one raw acquisition result into a publishable reading.
    pub fn process(&mut self, raw: RtuResult<f32>, now_ms: u64) -> ProcessOutcome {
        match raw {
            Ok(raw) => {
                self.error_streak = 0;
                let (value, status) = self.transform(raw);
                self.last_value = Some(value);
                ProcessOutcome {
                    reading: Some(Reading {
                        value,
                        status,
                        ts_ms: now_ms,
                    }),
                    health_event: false,
                }
            }
            Err(err) => self.process_failure(&err, now_ms),
        }
    }

    /// Calibrate, filter and range-gate one raw sample.
    fn transform(&mut self, raw: f32) -> (f32, SensorStatus) {
        let (calibrated, cal_status) = self.module.calibration.apply(raw);

        // Sentinel conversions bypass the filter so an out-of-domain
        // sample cannot poison the EMA state.
        let value = if cal_status == SensorStatus::Ok {
            self.ema.apply(calibrated)
        } else {
            calibrated
        };

        let status = if cal_status != SensorStatus::Ok {
            cal_status
        } else {
            self.gate(value)
        };
        (value, status)
    }

    /// Range gate: values exactly on a bound are ok, strictly outside
    /// are flagged but still published.
    fn gate(&self, value: f32) -> SensorStatus {
        if let (Some(min), Some(max)) = (self.module.range_min, self.module.range_max) {
            if min < max && (value < min || value > max) {
                return SensorStatus::OutOfRange;
            }
        }
        SensorStatus::Ok
    }

    fn process_failure(&mut self, err: &RtuError, now_ms: u64) -> ProcessOutcome {
        self.error_streak += 1;
        let status = match err {
            RtuError::Timeout(_) => SensorStatus::Timeout,
            _ => SensorStatus::Error,
        };
        debug!(
            sensor = %self.module.name,
            streak = self.error_streak,
            "driver read failed: {err}"
        );

        let health_event = self.error_streak == SENSOR_ERROR_STREAK;
        if health_event {
            warn!(
                sensor = %self.module.name,
                "sensor unavailable after {SENSOR_ERROR_STREAK} consecutive errors"
            );
        }

        // The published value stays what it was; only status and
        // timestamp move. With no prior value there is nothing to
        // publish yet.
        ProcessOutcome {
            reading: self.last_value.map(|value| Reading {
                value,
                status,
                ts_ms: now_ms,
            }),
            health_event,
        }
    }

    /// Produce the reading for a static module.
    pub fn static_reading(&mut self, now_ms: u64) -> Option<Reading> {
        debug_assert_eq!(self.module.module_type, ModuleType::Static);
        let value = self.module.static_value?;
        self.last_value = Some(value);
        Some(Reading {
            value,
            status: self.gate(value),
            ts_ms: now_ms,
        })
    }
}

/// Evaluate a calculated sensor against the value table.
///
/// Inputs that have never published make the evaluation fail with
/// `NotFound`; the caller treats that like any driver error.
pub fn evaluate_calculated(
    calc: &CalculatedSensor,
    table: &SensorValueTable,
) -> RtuResult<f32> {
    let mut values = Vec::with_capacity(calc.input_ids().len());
    for id in calc.input_ids() {
        let reading = table
            .get(*id)
            .ok_or_else(|| RtuError::NotFound(format!("input sensor {id} has no value yet")))?;
        values.push(reading.value);
    }
    calc.evaluate(&values)
}

#[cfg(test)]
mod tests {
    use super::*;
    use wt_common::calibration::Calibration;
    use wt_common::model::{HardwareBinding, Interface};

    fn ph_module(alpha: f32) -> SensorModule {
        SensorModule {
            id: 1,
            name: "ph_reactor".to_string(),
            slot: 1,
            subslot: 1,
            module_type: ModuleType::Adc,
            poll_period_ms: 1000,
            unit: "pH".to_string(),
            range_min: Some(0.0),
            range_max: Some(14.0),
            calibration: Calibration::Linear {
                scale: 3.5,
                offset: 0.0,
            },
            filter_alpha: alpha,
            hardware: Some(HardwareBinding {
                interface: Interface::I2c,
                bus: 1,
                address: "0x48".to_string(),
                channel: 0,
                counter: false,
                adc_gain: Some(1.0),
                adc_vref: None,
            }),
            expression: None,
            static_value: None,
            enabled: true,
        }
    }

    #[test]
    fn steady_voltage_publishes_calibrated_ok() {
        let mut rt = SensorRuntime::new(ph_module(0.0), true);
        for ts in [1000, 2000, 3000] {
            let out = rt.process(Ok(2.0), ts);
            let reading = out.reading.unwrap();
            assert!((reading.value - 7.0).abs() < 1e-6);
            assert_eq!(reading.status, SensorStatus::Ok);
            assert_eq!(reading.ts_ms, ts);
            assert!(!out.health_event);
        }
    }

    #[test]
    fn values_on_range_bounds_are_ok_strictly_outside_flagged() {
        let mut rt = SensorRuntime::new(ph_module(0.0), true);

        // 0.0 V → 0.0 pH == min → ok.
        assert_eq!(
            rt.process(Ok(0.0), 1).reading.unwrap().status,
            SensorStatus::Ok
        );
        // 4.0 V → 14.0 pH == max → ok.
        assert_eq!(
            rt.process(Ok(4.0), 2).reading.unwrap().status,
            SensorStatus::Ok
        );
        // Above max → flagged but published.
        let reading = rt.process(Ok(4.1), 3).reading.unwrap();
        assert_eq!(reading.status, SensorStatus::OutOfRange);
        assert!(reading.value > 14.0);
    }

    #[test]
    fn driver_error_keeps_last_value() {
        let mut rt = SensorRuntime::new(ph_module(0.0), true);
        rt.process(Ok(2.0), 1000);

        let out = rt.process(Err(RtuError::Io("bus fault".into())), 2000);
        let reading = out.reading.unwrap();
        assert!((reading.value - 7.0).abs() < 1e-6);
        assert_eq!(reading.status, SensorStatus::Error);
        assert_eq!(reading.ts_ms, 2000);
    }

    #[test]
    fn timeout_maps_to_timeout_status() {
        let mut rt = SensorRuntime::new(ph_module(0.0), true);
        rt.process(Ok(2.0), 1000);
        let out = rt.process(Err(RtuError::Timeout("i2c".into())), 2000);
        assert_eq!(out.reading.unwrap().status, SensorStatus::Timeout);
    }

    #[test]
    fn error_with_no_prior_value_publishes_nothing() {
        let mut rt = SensorRuntime::new(ph_module(0.0), true);
        let out = rt.process(Err(RtuError::Io("dead".into())), 1000);
        assert!(out.reading.is_none());
    }

    #[test]
    fn health_event_fires_once_at_threshold() {
        let mut rt = SensorRuntime::new(ph_module(0.0), true);
        let mut events = 0;
        for i in 0..SENSOR_ERROR_STREAK + 3 {
            let out = rt.process(Err(RtuError::Io("dead".into())), u64::from(i));
            if out.health_event {
                events += 1;
            }
        }
        assert_eq!(events, 1);

        // A good read resets the streak; the event can fire again.
        rt.process(Ok(2.0), 100);
        assert_eq!(rt.error_streak(), 0);
    }

    #[test]
    fn ema_smooths_after_seed() {
        let mut rt = SensorRuntime::new(ph_module(0.5), true);
        // Seed: first sample passes through. 2.0 V → 7.0 pH.
        assert!((rt.process(Ok(2.0), 1).reading.unwrap().value - 7.0).abs() < 1e-6);
        // 4.0 V → 14.0; EMA: 0.5·14 + 0.5·7 = 10.5.
        assert!((rt.process(Ok(4.0), 2).reading.unwrap().value - 10.5).abs() < 1e-6);
    }

    #[test]
    fn static_module_publishes_configured_value() {
        let mut module = ph_module(0.0);
        module.module_type = ModuleType::Static;
        module.static_value = Some(4.2);
        module.hardware = None;
        module.calibration = Calibration::None;

        let mut rt = SensorRuntime::new(module, false);
        let reading = rt.static_reading(123).unwrap();
        assert_eq!(reading.value, 4.2);
        assert_eq!(reading.status, SensorStatus::Ok);
    }

    #[test]
    fn calculated_evaluation_reads_the_table() {
        let table = SensorValueTable::new([1, 2]);
        table
            .publish(
                1,
                Reading {
                    value: 10.0,
                    status: SensorStatus::Ok,
                    ts_ms: 1,
                },
            )
            .unwrap();
        table
            .publish(
                2,
                Reading {
                    value: 4.0,
                    status: SensorStatus::Ok,
                    ts_ms: 1,
                },
            )
            .unwrap();

        let calc = CalculatedSensor::compile(
            "a - b",
            &[("a".to_string(), 1), ("b".to_string(), 2)],
        )
        .unwrap();
        assert_eq!(evaluate_calculated(&calc, &table).unwrap(), 6.0);
    }

    #[test]
    fn calculated_with_missing_input_fails() {
        let table = SensorValueTable::new([1, 2]);
        let calc = CalculatedSensor::compile(
            "a + b",
            &[("a".to_string(), 1), ("b".to_string(), 2)],
        )
        .unwrap();
        assert!(matches!(
            evaluate_calculated(&calc, &table),
            Err(RtuError::NotFound(_))
        ));
    }
}
