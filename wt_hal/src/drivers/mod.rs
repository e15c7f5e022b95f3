//! The closed driver set.
//!
//! Every sensor binds to exactly one of the variants below; the set is
//! closed and dispatch is a match, so an unknown combination fails at
//! load time instead of at 3 a.m. in a pump house. Chip-specific
//! behaviour lives in the leaf modules as data tables.
//!
//! Driver lifecycle is `bind → read × N → shutdown`. A read may block up
//! to its interface timeout and therefore only ever runs on the owning
//! bus worker.

pub mod ads1115;
pub mod i2c_chip;
pub mod mcp3208;
pub mod web;

use wt_common::error::{RtuError, RtuResult};
use wt_common::eval::Expr;
use wt_common::model::Reading;

use crate::gpio::{DigitalInput, DigitalOutput, PulseCounter, PwmChannel};
use crate::onewire::OneWireBus;

use self::ads1115::Ads1115Channel;
use self::i2c_chip::I2cChipSensor;
use self::mcp3208::Mcp3208Channel;
use self::web::WebPoll;

/// Production pin types are boxed so the drivers stay testable with
/// in-memory doubles.
pub type BoxedOutput = Box<dyn DigitalOutput>;
/// Boxed input line.
pub type BoxedInput = Box<dyn DigitalInput>;

// ─── Digital sensor ─────────────────────────────────────────────────

/// How a digital sensor turns its line into a value.
pub enum DigitalMode {
    /// Instantaneous logic level: 0.0 / 1.0.
    Level(BoxedInput),
    /// Rising-edge rate [pulses/s] (flow meters).
    Counter(PulseCounter),
}

/// A GPIO-backed sensor.
pub struct DigitalSensor {
    mode: DigitalMode,
}

impl DigitalSensor {
    pub fn level(input: BoxedInput) -> Self {
        Self {
            mode: DigitalMode::Level(input),
        }
    }

    pub fn counter(counter: PulseCounter) -> Self {
        Self {
            mode: DigitalMode::Counter(counter),
        }
    }

    fn read(&mut self) -> RtuResult<f32> {
        match &mut self.mode {
            DigitalMode::Level(input) => Ok(if input.get()? { 1.0 } else { 0.0 }),
            DigitalMode::Counter(counter) => counter.sample(),
        }
    }
}

// ─── 1-Wire temperature ─────────────────────────────────────────────

/// A 1-Wire temperature probe bound by device id.
pub struct OneWireTemp {
    bus: OneWireBus,
    device_id: String,
}

impl OneWireTemp {
    pub fn new(bus: OneWireBus, device_id: &str) -> Self {
        Self {
            bus,
            device_id: device_id.to_string(),
        }
    }

    fn read(&mut self) -> RtuResult<f32> {
        self.bus.read_temperature(&self.device_id)
    }
}

// ─── Calculated sensor ──────────────────────────────────────────────

/// A sensor computed from other sensors' published values.
///
/// The expression is compiled at bind time with inputs bound name →
/// index; the pipeline supplies the value slice each evaluation.
pub struct CalculatedSensor {
    expr: Expr,
    /// Module ids supplying the inputs, in bound order.
    inputs: Vec<u32>,
}

impl CalculatedSensor {
    /// Compile an expression over `(name, module_id)` input pairs.
    pub fn compile(source: &str, inputs: &[(String, u32)]) -> RtuResult<Self> {
        let names: Vec<&str> = inputs.iter().map(|(n, _)| n.as_str()).collect();
        let expr = Expr::compile(source, &names)?;
        Ok(Self {
            expr,
            inputs: inputs.iter().map(|(_, id)| *id).collect(),
        })
    }

    /// Module ids this expression reads, in input order.
    pub fn input_ids(&self) -> &[u32] {
        &self.inputs
    }

    /// Evaluate with the input values in [`input_ids`](Self::input_ids)
    /// order.
    pub fn evaluate(&self, values: &[f32]) -> RtuResult<f32> {
        self.expr.eval(values)
    }
}

// ─── Sensor driver dispatch ─────────────────────────────────────────

/// A bound sensor driver.
pub enum SensorDriver {
    /// SPI analog front end (MCP3208 class).
    Analog(Mcp3208Channel<BoxedOutput, BoxedInput>),
    /// GPIO level or pulse counter.
    Digital(DigitalSensor),
    /// 1-Wire temperature probe.
    OneWireTemp(OneWireTemp),
    /// Direct I²C chip (SHT3x class).
    I2cSensor(I2cChipSensor),
    /// I²C ADC channel (ADS1115 class).
    AdcChannel(Ads1115Channel),
    /// HTTP-polled remote value.
    WebPoll(WebPoll),
    /// Expression over other sensors.
    Calculated(CalculatedSensor),
}

impl SensorDriver {
    /// Stable driver kind tag for logs and diagnostics.
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Analog(_) => "analog",
            Self::Digital(_) => "digital",
            Self::OneWireTemp(_) => "onewire_temp",
            Self::I2cSensor(_) => "i2c_sensor",
            Self::AdcChannel(_) => "adc_channel",
            Self::WebPoll(_) => "web_poll",
            Self::Calculated(_) => "calculated",
        }
    }

    /// Whether reads must run on a bus worker (false for calculated,
    /// which only touches the in-process value table).
    pub const fn blocking(&self) -> bool {
        !matches!(self, Self::Calculated(_))
    }

    /// Take one raw reading.
    ///
    /// Calculated drivers are evaluated by the pipeline against the
    /// value table and reject a direct read.
    pub fn read_raw(&mut self) -> RtuResult<f32> {
        match self {
            Self::Analog(adc) => adc.read_volts(),
            Self::Digital(digital) => digital.read(),
            Self::OneWireTemp(probe) => probe.read(),
            Self::I2cSensor(chip) => chip.read(),
            Self::AdcChannel(adc) => adc.read_volts(),
            Self::WebPoll(web) => web.read(),
            Self::Calculated(_) => Err(RtuError::InvalidState(
                "calculated sensors are evaluated, not read".into(),
            )),
        }
    }

    /// Release hardware resources. Line handles close on drop; this is
    /// the explicit hook for drivers that need ordered teardown.
    pub fn shutdown(&mut self) {}
}

/// A bound driver plus its diagnostic cache.
pub struct BoundSensor {
    pub driver: SensorDriver,
    /// Last published reading, exposed for ad-hoc diagnostic queries.
    cached: Option<Reading>,
}

impl BoundSensor {
    pub fn new(driver: SensorDriver) -> Self {
        Self {
            driver,
            cached: None,
        }
    }

    /// Record the published reading.
    pub fn set_cached(&mut self, reading: Reading) {
        self.cached = Some(reading);
    }

    /// Last published reading, if any.
    pub fn cached(&self) -> Option<Reading> {
        self.cached
    }
}

// ─── Actuator driver ────────────────────────────────────────────────

/// Output stage behind one actuator.
pub enum ActuatorOutput {
    /// Plain on/off line (pump, valve, relay).
    Switched(BoxedOutput),
    /// Hardware PWM channel with an on/off gate duty.
    Pwm {
        channel: PwmChannel,
        /// Configured duty ceiling.
        max_duty: u8,
    },
}

/// A bound actuator driver.
pub struct ActuatorDriver {
    output: ActuatorOutput,
}

impl ActuatorDriver {
    pub fn switched(output: BoxedOutput) -> Self {
        Self {
            output: ActuatorOutput::Switched(output),
        }
    }

    pub fn pwm(channel: PwmChannel, max_duty: u8) -> Self {
        Self {
            output: ActuatorOutput::Pwm { channel, max_duty },
        }
    }

    /// Apply a command. PWM duty is clamped to the configured ceiling;
    /// on/off against a PWM stage maps to full/zero duty.
    pub fn apply(&mut self, command: wt_common::model::ActuatorCommand) -> RtuResult<()> {
        use wt_common::model::ActuatorCommand;
        match (&mut self.output, command) {
            (ActuatorOutput::Switched(line), ActuatorCommand::Off) => line.set(false),
            (ActuatorOutput::Switched(line), ActuatorCommand::On) => line.set(true),
            (ActuatorOutput::Switched(_), ActuatorCommand::Pwm(_)) => Err(
                RtuError::NotSupported("PWM command on a switched output".into()),
            ),
            (ActuatorOutput::Pwm { channel, .. }, ActuatorCommand::Off) => channel.set_duty(0),
            (ActuatorOutput::Pwm { channel, max_duty }, ActuatorCommand::On) => {
                channel.set_duty(*max_duty)
            }
            (ActuatorOutput::Pwm { channel, max_duty }, ActuatorCommand::Pwm(duty)) => {
                channel.set_duty(duty.min(*max_duty))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpio::ListenerPin;
    use wt_common::model::ActuatorCommand;

    #[test]
    fn digital_level_reads_as_binary() {
        let mut sensor = DigitalSensor::level(Box::new(ListenerPin::new(true)));
        assert_eq!(sensor.read().unwrap(), 1.0);

        let mut sensor = DigitalSensor::level(Box::new(ListenerPin::new(false)));
        assert_eq!(sensor.read().unwrap(), 0.0);
    }

    #[test]
    fn calculated_driver_rejects_direct_read() {
        let calc =
            CalculatedSensor::compile("avg(a, b)", &[("a".to_string(), 1), ("b".to_string(), 2)])
                .unwrap();
        let mut driver = SensorDriver::Calculated(calc);
        assert!(!driver.blocking());
        assert!(matches!(
            driver.read_raw(),
            Err(RtuError::InvalidState(_))
        ));
    }

    #[test]
    fn calculated_sensor_evaluates_inputs_in_order() {
        let calc = CalculatedSensor::compile(
            "outlet - inlet",
            &[("outlet".to_string(), 7), ("inlet".to_string(), 3)],
        )
        .unwrap();
        assert_eq!(calc.input_ids(), &[7, 3]);
        assert_eq!(calc.evaluate(&[10.0, 4.0]).unwrap(), 6.0);
    }

    #[test]
    fn switched_actuator_drives_line() {
        let mut driver = ActuatorDriver::switched(Box::new(ListenerPin::new(false)));
        driver.apply(ActuatorCommand::On).unwrap();
        driver.apply(ActuatorCommand::Off).unwrap();
        assert!(matches!(
            driver.apply(ActuatorCommand::Pwm(100)),
            Err(RtuError::NotSupported(_))
        ));
    }

    #[test]
    fn cached_reading_roundtrips() {
        let calc = CalculatedSensor::compile("1 + 1", &[]).unwrap();
        let mut bound = BoundSensor::new(SensorDriver::Calculated(calc));
        assert!(bound.cached().is_none());

        bound.set_cached(Reading {
            value: 2.0,
            status: wt_common::model::SensorStatus::Ok,
            ts_ms: 42,
        });
        assert_eq!(bound.cached().unwrap().value, 2.0);
    }
}
