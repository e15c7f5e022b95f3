//! Configuration → driver binding.
//!
//! Binding claims hardware for a sensor or actuator configuration and
//! produces the bound driver the pipeline polls. Two failure classes are
//! kept apart:
//!
//! - **Conflicts** (`AlreadyExists`, naming the current owner) are
//!   configuration errors and abort the bind.
//! - **Missing hardware** (`NotFound`) leaves the record configured but
//!   inactive; the sensor shows up with no driver and no claims.
//!
//! Discovery never consults the conflict map; it reports what the buses
//! answer regardless of ownership.

use std::collections::HashMap;

use tracing::{info, warn};

use wt_common::error::{RtuError, RtuResult};
use wt_common::model::{
    Actuator, ActuatorType, HardwareBinding, Interface, ModuleType, SensorModule,
};

use crate::drivers::{
    ActuatorDriver, BoundSensor, CalculatedSensor, DigitalSensor, SensorDriver,
};
use crate::drivers::ads1115::Ads1115Channel;
use crate::drivers::i2c_chip::I2cChipSensor;
use crate::drivers::mcp3208::Mcp3208Channel;
use crate::drivers::web::WebPoll;
use crate::gpio::{InputLine, OutputLine, PulseCounter, PwmChannel};
use crate::i2c::I2cBus;
use crate::onewire::OneWireBus;
use crate::spi::BitBangSpi;

// ─── Conflict map ───────────────────────────────────────────────────

/// Ownership registry for (chip, pin) pairs.
#[derive(Debug, Default)]
pub struct ConflictMap {
    owners: HashMap<(String, u32), String>,
}

impl ConflictMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim a pin for `owner`. Conflicts name the existing owner.
    pub fn claim(&mut self, chip: &str, pin: u32, owner: &str) -> RtuResult<()> {
        let key = (chip.to_string(), pin);
        if let Some(existing) = self.owners.get(&key) {
            return Err(RtuError::AlreadyExists(existing.clone()));
        }
        self.owners.insert(key, owner.to_string());
        Ok(())
    }

    /// Release a pin, e.g. after a failed bind or a record delete.
    pub fn release(&mut self, chip: &str, pin: u32) {
        self.owners.remove(&(chip.to_string(), pin));
    }

    /// Current owner of a pin.
    pub fn owner(&self, chip: &str, pin: u32) -> Option<&str> {
        self.owners
            .get(&(chip.to_string(), pin))
            .map(String::as_str)
    }
}

// ─── Address parsing helpers ────────────────────────────────────────

/// Parse an I²C address field: `0x48`, `72`, or `preset:key@0x44`.
pub fn parse_i2c_address(address: &str) -> RtuResult<u8> {
    let text = address.trim();
    let parsed = if let Some(hex) = text.strip_prefix("0x").or_else(|| text.strip_prefix("0X")) {
        u8::from_str_radix(hex, 16).ok()
    } else {
        text.parse().ok()
    };
    parsed.ok_or_else(|| RtuError::InvalidParam(format!("bad I2C address '{address}'")))
}

/// Split a physical-I²C address field into preset key and optional
/// address override (`sht3x:temperature@0x45`).
pub fn parse_chip_address(address: &str) -> RtuResult<(&str, Option<u8>)> {
    match address.split_once('@') {
        None => Ok((address, None)),
        Some((key, addr)) => Ok((key, Some(parse_i2c_address(addr)?))),
    }
}

/// Split a web-poll address into URL and optional JSON field
/// (`http://host/v#field`).
pub fn parse_web_address(address: &str) -> (&str, Option<&str>) {
    match address.rsplit_once('#') {
        Some((url, field)) if !field.is_empty() => (url, Some(field)),
        _ => (address, None),
    }
}

// ─── SPI front-end pins ─────────────────────────────────────────────

/// GPIO lines carrying the bit-banged SPI bus for analog front ends.
#[derive(Debug, Clone)]
pub struct SpiPins {
    pub chip: String,
    pub clk: u32,
    pub mosi: u32,
    pub miso: u32,
    pub cs: u32,
}

impl SpiPins {
    /// Raspberry Pi header defaults (SPI0).
    pub fn raspberry_pi(chip: &str) -> Self {
        Self {
            chip: chip.to_string(),
            clk: 11,
            mosi: 10,
            miso: 9,
            cs: 8,
        }
    }
}

// ─── Binder ─────────────────────────────────────────────────────────

/// Outcome of a sensor bind.
pub enum SensorBindOutcome {
    /// Driver ready for the pipeline.
    Bound(BoundSensor),
    /// Static module: the pipeline publishes the configured value
    /// directly, no driver involved.
    Static,
    /// Hardware missing; record stays configured but inactive.
    Inactive { reason: String },
}

impl std::fmt::Debug for SensorBindOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Bound(_) => write!(f, "Bound(..)"),
            Self::Static => write!(f, "Static"),
            Self::Inactive { reason } => write!(f, "Inactive {{ reason: {reason:?} }}"),
        }
    }
}

/// Binds configuration records to drivers, enforcing pin ownership.
pub struct Binder {
    conflicts: ConflictMap,
    spi_pins: SpiPins,
    /// (name, id) of every configured sensor, for calculated inputs.
    sensor_index: Vec<(String, u32)>,
}

impl Binder {
    pub fn new(spi_pins: SpiPins, sensors: &[SensorModule]) -> Self {
        Self {
            conflicts: ConflictMap::new(),
            spi_pins,
            sensor_index: sensors
                .iter()
                .map(|s| (s.name.clone(), s.id))
                .collect(),
        }
    }

    /// Access the conflict map (diagnostics, tests).
    pub fn conflicts(&self) -> &ConflictMap {
        &self.conflicts
    }

    /// Bind one sensor. Conflicts are errors; missing hardware is an
    /// inactive outcome.
    pub fn bind_sensor(&mut self, module: &SensorModule) -> RtuResult<SensorBindOutcome> {
        module.validate()?;
        module.validate_calibration()?;

        // Static modules publish their configured value; nothing to bind.
        if module.module_type == ModuleType::Static {
            return Ok(SensorBindOutcome::Static);
        }

        if module.module_type == ModuleType::Calculated {
            let source = module.expression.as_deref().ok_or_else(|| {
                RtuError::InvalidParam(format!("sensor '{}': missing expression", module.name))
            })?;
            let calc = CalculatedSensor::compile(source, &self.sensor_index)?;
            return Ok(SensorBindOutcome::Bound(BoundSensor::new(
                SensorDriver::Calculated(calc),
            )));
        }

        let hw = module.hardware.as_ref().ok_or_else(|| {
            RtuError::InvalidParam(format!("sensor '{}': missing hardware binding", module.name))
        })?;

        // GPIO-backed sensors own their pin; claim before touching
        // hardware so a conflict never half-binds.
        let claimed = if hw.interface == Interface::Gpio {
            self.conflicts
                .claim(&hw.address, u32::from(hw.channel), &module.name)?;
            Some((hw.address.clone(), u32::from(hw.channel)))
        } else {
            None
        };

        match self.build_driver(module, hw) {
            Ok(driver) => {
                info!(
                    sensor = %module.name,
                    kind = driver.kind(),
                    "bound sensor driver"
                );
                Ok(SensorBindOutcome::Bound(BoundSensor::new(driver)))
            }
            Err(RtuError::NotFound(what)) => {
                if let Some((chip, pin)) = claimed {
                    self.conflicts.release(&chip, pin);
                }
                warn!(
                    sensor = %module.name,
                    "hardware missing ({what}); sensor marked inactive"
                );
                Ok(SensorBindOutcome::Inactive { reason: what })
            }
            Err(other) => {
                if let Some((chip, pin)) = claimed {
                    self.conflicts.release(&chip, pin);
                }
                Err(other)
            }
        }
    }

    fn build_driver(
        &mut self,
        module: &SensorModule,
        hw: &HardwareBinding,
    ) -> RtuResult<SensorDriver> {
        match (module.module_type, hw.interface) {
            (ModuleType::Adc, Interface::I2c) => {
                let bus = I2cBus::open(hw.bus)?;
                let address = parse_i2c_address(&hw.address)?;
                Ok(SensorDriver::AdcChannel(Ads1115Channel::new(
                    bus,
                    address,
                    hw.channel,
                    hw.adc_gain,
                )?))
            }
            (ModuleType::Physical, Interface::I2c) => {
                let bus = I2cBus::open(hw.bus)?;
                let (key, address) = parse_chip_address(&hw.address)?;
                Ok(SensorDriver::I2cSensor(I2cChipSensor::new(
                    bus, key, address,
                )?))
            }
            (ModuleType::Physical, Interface::OneWire) => {
                let bus = OneWireBus::new();
                // Fail the bind now if the device directory is absent.
                bus.read_temperature(&hw.address)?;
                Ok(SensorDriver::OneWireTemp(
                    crate::drivers::OneWireTemp::new(bus, &hw.address),
                ))
            }
            (ModuleType::Physical, Interface::Gpio) => {
                if hw.counter {
                    let counter = PulseCounter::request(&hw.address, u32::from(hw.channel))?;
                    Ok(SensorDriver::Digital(DigitalSensor::counter(counter)))
                } else {
                    let line = InputLine::request(&hw.address, u32::from(hw.channel), false)?;
                    Ok(SensorDriver::Digital(DigitalSensor::level(Box::new(line))))
                }
            }
            (ModuleType::Physical | ModuleType::Adc, Interface::Spi) => {
                let pins = self.spi_pins.clone();
                // The SPI lines are shared bus infrastructure; they are
                // claimed once under a bus owner, not per sensor.
                for (pin, _role) in [
                    (pins.clk, "clk"),
                    (pins.mosi, "mosi"),
                    (pins.miso, "miso"),
                    (pins.cs, "cs"),
                ] {
                    match self.conflicts.claim(&pins.chip, pin, "spi-bus") {
                        Ok(()) => {}
                        Err(RtuError::AlreadyExists(owner)) if owner == "spi-bus" => {}
                        Err(e) => return Err(e),
                    }
                }
                let spi = BitBangSpi::new(
                    Box::new(OutputLine::request(&pins.chip, pins.clk, false)?)
                        as crate::drivers::BoxedOutput,
                    Box::new(OutputLine::request(&pins.chip, pins.mosi, false)?),
                    Box::new(InputLine::request(&pins.chip, pins.miso, false)?)
                        as crate::drivers::BoxedInput,
                    Box::new(OutputLine::request(&pins.chip, pins.cs, true)?),
                )?;
                let vref = hw.adc_vref.unwrap_or(3.3);
                Ok(SensorDriver::Analog(Mcp3208Channel::new(
                    spi, hw.channel, vref,
                )?))
            }
            (ModuleType::WebPoll, Interface::Http) => {
                let (url, field) = parse_web_address(&hw.address);
                Ok(SensorDriver::WebPoll(WebPoll::new(
                    url,
                    field.map(str::to_string),
                )?))
            }
            (module_type, interface) => Err(RtuError::InvalidParam(format!(
                "sensor '{}': no driver for ({module_type:?}, {interface:?})",
                module.name
            ))),
        }
    }

    /// Bind one actuator, claiming its pin.
    pub fn bind_actuator(&mut self, actuator: &Actuator) -> RtuResult<ActuatorDriver> {
        actuator.validate()?;
        self.conflicts
            .claim(&actuator.chip, actuator.pin, &actuator.name)?;

        let result = match actuator.actuator_type {
            ActuatorType::Pwm => {
                let chip_index = actuator
                    .chip
                    .strip_prefix("pwmchip")
                    .and_then(|n| n.parse::<u32>().ok())
                    .ok_or_else(|| {
                        RtuError::InvalidParam(format!(
                            "actuator '{}': PWM chip label '{}' is not pwmchipN",
                            actuator.name, actuator.chip
                        ))
                    })?;
                let frequency = actuator.pwm_frequency_hz.unwrap_or(25_000);
                PwmChannel::open(chip_index, actuator.pin, frequency).map(|ch| {
                    ActuatorDriver::pwm(ch, actuator.pwm_max_duty.unwrap_or(u8::MAX))
                })
            }
            ActuatorType::Pump | ActuatorType::Valve | ActuatorType::Relay => {
                OutputLine::request(&actuator.chip, actuator.pin, actuator.active_low)
                    .map(|line| ActuatorDriver::switched(Box::new(line)))
            }
        };

        match result {
            Ok(driver) => {
                info!(actuator = %actuator.name, "bound actuator driver");
                Ok(driver)
            }
            Err(e) => {
                self.conflicts.release(&actuator.chip, actuator.pin);
                Err(e)
            }
        }
    }

    /// Release an actuator's pin after a record delete.
    pub fn unbind_actuator(&mut self, actuator: &Actuator) {
        self.conflicts.release(&actuator.chip, actuator.pin);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wt_common::calibration::Calibration;

    #[test]
    fn conflict_map_names_the_owner() {
        let mut map = ConflictMap::new();
        map.claim("gpiochip0", 17, "dosing_pump").unwrap();

        let err = map.claim("gpiochip0", 17, "backwash_valve").unwrap_err();
        match err {
            RtuError::AlreadyExists(owner) => assert_eq!(owner, "dosing_pump"),
            other => panic!("expected AlreadyExists, got {other:?}"),
        }

        // Different pin on the same chip is fine.
        map.claim("gpiochip0", 18, "backwash_valve").unwrap();
        // Same pin on another chip is fine.
        map.claim("gpiochip1", 17, "uv_lamp").unwrap();

        map.release("gpiochip0", 17);
        map.claim("gpiochip0", 17, "backwash_valve").unwrap();
    }

    #[test]
    fn i2c_address_forms() {
        assert_eq!(parse_i2c_address("0x48").unwrap(), 0x48);
        assert_eq!(parse_i2c_address("0X4B").unwrap(), 0x4B);
        assert_eq!(parse_i2c_address("72").unwrap(), 72);
        assert!(parse_i2c_address("zz").is_err());
    }

    #[test]
    fn chip_address_with_override() {
        let (key, addr) = parse_chip_address("sht3x:temperature@0x45").unwrap();
        assert_eq!(key, "sht3x:temperature");
        assert_eq!(addr, Some(0x45));

        let (key, addr) = parse_chip_address("sht3x:humidity").unwrap();
        assert_eq!(key, "sht3x:humidity");
        assert_eq!(addr, None);
    }

    #[test]
    fn web_address_with_field() {
        let (url, field) = parse_web_address("http://lab/v#turbidity");
        assert_eq!(url, "http://lab/v");
        assert_eq!(field, Some("turbidity"));

        let (url, field) = parse_web_address("http://lab/v");
        assert_eq!(url, "http://lab/v");
        assert_eq!(field, None);
    }

    fn calc_module(expression: &str) -> SensorModule {
        SensorModule {
            id: 3,
            name: "delta_t".to_string(),
            slot: 3,
            subslot: 1,
            module_type: ModuleType::Calculated,
            poll_period_ms: 1000,
            unit: "K".to_string(),
            range_min: None,
            range_max: None,
            calibration: Calibration::None,
            filter_alpha: 0.0,
            hardware: None,
            expression: Some(expression.to_string()),
            static_value: None,
            enabled: true,
        }
    }

    fn named_sensor(id: u32, name: &str, slot: u16) -> SensorModule {
        SensorModule {
            id,
            name: name.to_string(),
            slot,
            subslot: 1,
            module_type: ModuleType::Static,
            poll_period_ms: 1000,
            unit: String::new(),
            range_min: None,
            range_max: None,
            calibration: Calibration::None,
            filter_alpha: 0.0,
            hardware: None,
            expression: None,
            static_value: Some(0.0),
            enabled: true,
        }
    }

    #[test]
    fn calculated_sensor_binds_against_sensor_names() {
        let sensors = vec![
            named_sensor(1, "inlet_temp", 1),
            named_sensor(2, "outlet_temp", 2),
        ];
        let mut binder = Binder::new(SpiPins::raspberry_pi("gpiochip0"), &sensors);

        let outcome = binder
            .bind_sensor(&calc_module("outlet_temp - inlet_temp"))
            .unwrap();
        assert!(matches!(outcome, SensorBindOutcome::Bound(_)));

        // Unknown name fails at bind, not at runtime.
        let err = binder
            .bind_sensor(&calc_module("outlet_temp - ghost"))
            .unwrap_err();
        assert!(err.to_string().contains("ghost"));
    }

    #[test]
    fn static_module_needs_no_driver() {
        let sensors = vec![named_sensor(1, "setpoint", 1)];
        let mut binder = Binder::new(SpiPins::raspberry_pi("gpiochip0"), &sensors);
        let outcome = binder.bind_sensor(&sensors[0]).unwrap();
        assert!(matches!(outcome, SensorBindOutcome::Static));
    }
}
