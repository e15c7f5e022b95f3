//! Sensor, actuator and alarm records.
//!
//! These are the persistent configuration records the store loads at
//! startup and the runtime binds to drivers. Validation enforces the
//! identity invariants (slot ranges, unique poll bounds, range ordering);
//! cross-record uniqueness (names, slots, pins) is enforced by the store
//! and the binding layer, which see the whole population.

use serde::{Deserialize, Serialize};

use crate::calibration::Calibration;
use crate::consts::{
    ACTUATOR_SLOT_MAX, ACTUATOR_SLOT_MIN, MAX_DEVICE_ADDRESS_LEN, MIN_POLL_PERIOD_MS,
    SENSOR_SLOT_MAX, SENSOR_SLOT_MIN,
};
use crate::error::{RtuError, RtuResult};

// ─── Sensor Module ──────────────────────────────────────────────────

/// Kind of value source behind a sensor module.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModuleType {
    /// Directly attached digital or analog probe.
    Physical,
    /// Channel of an ADC chip.
    Adc,
    /// Value polled from an HTTP endpoint.
    WebPoll,
    /// Value computed from other sensors by an expression.
    Calculated,
    /// Fixed configured value.
    Static,
}

/// Hardware interface a sensor is reached over.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Interface {
    I2c,
    Spi,
    Gpio,
    #[serde(rename = "1wire")]
    OneWire,
    Uart,
    Http,
}

impl Interface {
    /// Default read timeout for this interface [ms].
    pub const fn default_timeout_ms(self) -> u64 {
        match self {
            Self::I2c | Self::Spi | Self::Gpio | Self::Uart => crate::consts::TIMEOUT_I2C_MS,
            Self::OneWire => crate::consts::TIMEOUT_ONEWIRE_MS,
            Self::Http => crate::consts::TIMEOUT_HTTP_MS,
        }
    }
}

/// Physical backing of a sensor module.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HardwareBinding {
    /// Bus interface.
    pub interface: Interface,
    /// Bus index (e.g. 1 for `/dev/i2c-1`).
    pub bus: u8,
    /// Device address: hex I²C address, 1-Wire id, gpiochip label or URL host.
    pub address: String,
    /// Channel on multi-channel devices (ADC input, GPIO offset).
    pub channel: u8,
    /// GPIO interface only: count rising edges (pulses/s) instead of
    /// reading the level.
    #[serde(default)]
    pub counter: bool,
    /// Programmable gain setting for ADC channels.
    #[serde(default)]
    pub adc_gain: Option<f32>,
    /// ADC reference voltage [V].
    #[serde(default)]
    pub adc_vref: Option<f32>,
}

/// A configured sensor module.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SensorModule {
    /// Stable record id.
    pub id: u32,
    /// Unique display name (unique across sensors *and* actuators).
    pub name: String,
    /// Fieldbus slot, 1–8.
    pub slot: u16,
    /// Fieldbus subslot.
    pub subslot: u16,
    /// Value source kind.
    pub module_type: ModuleType,
    /// Poll period [ms], ≥ 10.
    pub poll_period_ms: u32,
    /// Engineering unit label.
    pub unit: String,
    /// Reference range minimum (engineering units).
    #[serde(default)]
    pub range_min: Option<f32>,
    /// Reference range maximum (engineering units).
    #[serde(default)]
    pub range_max: Option<f32>,
    /// Raw → engineering transform.
    #[serde(default)]
    pub calibration: Calibration,
    /// EMA smoothing factor, 0 disables filtering.
    #[serde(default)]
    pub filter_alpha: f32,
    /// Backing hardware. `None` for calculated/static modules.
    #[serde(default)]
    pub hardware: Option<HardwareBinding>,
    /// Expression source for calculated modules.
    #[serde(default)]
    pub expression: Option<String>,
    /// Fixed value for static modules.
    #[serde(default)]
    pub static_value: Option<f32>,
    /// Whether the module participates in polling.
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

impl SensorModule {
    /// Validate the per-record invariants.
    pub fn validate(&self) -> RtuResult<()> {
        if self.name.is_empty() {
            return Err(RtuError::InvalidParam("sensor name cannot be empty".into()));
        }
        if !(SENSOR_SLOT_MIN..=SENSOR_SLOT_MAX).contains(&self.slot) {
            return Err(RtuError::InvalidParam(format!(
                "sensor '{}': slot {} out of range [{SENSOR_SLOT_MIN}, {SENSOR_SLOT_MAX}]",
                self.name, self.slot
            )));
        }
        if self.poll_period_ms < MIN_POLL_PERIOD_MS {
            return Err(RtuError::InvalidParam(format!(
                "sensor '{}': poll period {} ms below minimum {MIN_POLL_PERIOD_MS} ms",
                self.name, self.poll_period_ms
            )));
        }
        if let (Some(min), Some(max)) = (self.range_min, self.range_max) {
            if min > max {
                return Err(RtuError::InvalidParam(format!(
                    "sensor '{}': range min {min} greater than max {max}",
                    self.name
                )));
            }
        }
        if !(0.0..1.0).contains(&self.filter_alpha) {
            return Err(RtuError::InvalidParam(format!(
                "sensor '{}': filter alpha {} outside [0, 1)",
                self.name, self.filter_alpha
            )));
        }
        if let Some(hw) = &self.hardware {
            if hw.address.len() > MAX_DEVICE_ADDRESS_LEN {
                return Err(RtuError::InvalidParam(format!(
                    "sensor '{}': device address longer than {MAX_DEVICE_ADDRESS_LEN} chars",
                    self.name
                )));
            }
        }
        match self.module_type {
            ModuleType::Calculated if self.expression.is_none() => {
                Err(RtuError::InvalidParam(format!(
                    "sensor '{}': calculated module without expression",
                    self.name
                )))
            }
            ModuleType::Static if self.static_value.is_none() => {
                Err(RtuError::InvalidParam(format!(
                    "sensor '{}': static module without value",
                    self.name
                )))
            }
            ModuleType::Physical | ModuleType::Adc | ModuleType::WebPoll
                if self.hardware.is_none() =>
            {
                Err(RtuError::InvalidParam(format!(
                    "sensor '{}': {:?} module without hardware binding",
                    self.name, self.module_type
                )))
            }
            _ => Ok(()),
        }
    }

    /// Calibration self-check, run once at bind time.
    pub fn validate_calibration(&self) -> RtuResult<()> {
        self.calibration.validate()
    }
}

// ─── Sensor runtime status ──────────────────────────────────────────

/// Status attached to every published sensor value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SensorStatus {
    /// Value valid and inside the reference range.
    #[default]
    Ok,
    /// Value valid but outside the reference range.
    OutOfRange,
    /// Driver read failed; published value is the previous one.
    Error,
    /// Driver read exceeded its interface deadline.
    Timeout,
}

impl SensorStatus {
    /// Whether the value can be trusted by consumers.
    pub const fn is_valid(self) -> bool {
        matches!(self, Self::Ok | Self::OutOfRange)
    }
}

/// One published sensor reading.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Reading {
    /// Engineering value after calibration and filtering.
    pub value: f32,
    /// Validity of the value.
    pub status: SensorStatus,
    /// Publish timestamp [ms since UNIX epoch].
    pub ts_ms: u64,
}

// ─── Actuator ───────────────────────────────────────────────────────

/// Actuator function class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActuatorType {
    Pump,
    Valve,
    Relay,
    Pwm,
}

/// Output an actuator must fall back to when the controller drops or a
/// fatal fault occurs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SafeState {
    /// De-energise.
    Off,
    /// Energise.
    On,
    /// Hold the last commanded state.
    Hold,
}

/// A configured actuator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Actuator {
    /// Stable record id.
    pub id: u32,
    /// Unique display name (unique across sensors *and* actuators).
    pub name: String,
    /// Fieldbus slot, 9–16.
    pub slot: u16,
    /// Fieldbus subslot.
    pub subslot: u16,
    /// Function class.
    pub actuator_type: ActuatorType,
    /// GPIO chip label (e.g. `gpiochip0`).
    pub chip: String,
    /// GPIO line offset.
    pub pin: u32,
    /// Whether the output is wired active-low.
    #[serde(default)]
    pub active_low: bool,
    /// Fallback state on connection loss.
    pub safe_state: SafeState,
    /// Whether the actuator accepts commands.
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// PWM carrier frequency [Hz], PWM type only.
    #[serde(default)]
    pub pwm_frequency_hz: Option<u32>,
    /// Maximum PWM duty 0–255, PWM type only.
    #[serde(default)]
    pub pwm_max_duty: Option<u8>,
}

/// PWM frequency bounds accepted by the sysfs PWM driver [Hz].
pub const PWM_FREQ_MIN_HZ: u32 = 1;
/// Upper PWM frequency bound [Hz].
pub const PWM_FREQ_MAX_HZ: u32 = 100_000;

impl Actuator {
    /// Validate the per-record invariants.
    pub fn validate(&self) -> RtuResult<()> {
        if self.name.is_empty() {
            return Err(RtuError::InvalidParam(
                "actuator name cannot be empty".into(),
            ));
        }
        if !(ACTUATOR_SLOT_MIN..=ACTUATOR_SLOT_MAX).contains(&self.slot) {
            return Err(RtuError::InvalidParam(format!(
                "actuator '{}': slot {} out of range [{ACTUATOR_SLOT_MIN}, {ACTUATOR_SLOT_MAX}]",
                self.name, self.slot
            )));
        }
        if self.chip.is_empty() {
            return Err(RtuError::InvalidParam(format!(
                "actuator '{}': GPIO chip label cannot be empty",
                self.name
            )));
        }
        if self.actuator_type == ActuatorType::Pwm {
            match self.pwm_frequency_hz {
                Some(f) if (PWM_FREQ_MIN_HZ..=PWM_FREQ_MAX_HZ).contains(&f) => {}
                Some(f) => {
                    return Err(RtuError::InvalidParam(format!(
                        "actuator '{}': PWM frequency {f} Hz outside \
                         [{PWM_FREQ_MIN_HZ}, {PWM_FREQ_MAX_HZ}]",
                        self.name
                    )));
                }
                None => {
                    return Err(RtuError::InvalidParam(format!(
                        "actuator '{}': PWM type requires a frequency",
                        self.name
                    )));
                }
            }
        }
        Ok(())
    }
}

/// A command issued against an actuator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ActuatorCommand {
    /// De-energise the output.
    Off,
    /// Energise the output.
    On,
    /// Drive a PWM output at the given duty (0–255).
    Pwm(u8),
}

/// Current commanded state of an actuator.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ActuatorState {
    /// Last applied command.
    pub commanded: ActuatorCommand,
    /// Timestamp of the last change [ms since UNIX epoch].
    pub last_change_ms: u64,
    /// Set when the driver failed to apply a command.
    pub fault: bool,
}

impl Default for ActuatorState {
    fn default() -> Self {
        Self {
            commanded: ActuatorCommand::Off,
            last_change_ms: 0,
            fault: false,
        }
    }
}

// ─── Alarm rules ────────────────────────────────────────────────────

/// Predicate kind of an alarm rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlarmCondition {
    /// Trip when the value rises to or above the high threshold.
    Above,
    /// Trip when the value falls to or below the low threshold.
    Below,
    /// Trip when the value leaves [low, high].
    OutOfRange,
    /// Trip when |dv/dt| exceeds the high threshold [units/s].
    RateOfChange,
}

/// Alarm severity, ordered: critical > high > medium > low.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

/// Safety action an interlock applies to its target actuator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InterlockAction {
    /// Force the actuator off.
    ForceOff,
    /// Force the actuator on.
    ForceOn,
    /// Drive a PWM duty (0–255).
    SetPwm(u8),
}

/// Optional interlock attached to an alarm rule.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Interlock {
    /// Target actuator slot (9–16).
    pub target_slot: u16,
    /// Action applied when the rule trips.
    pub action: InterlockAction,
    /// Restore the actuator's safe state when the rule clears.
    pub release_on_clear: bool,
}

/// A configured alarm rule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlarmRule {
    /// Stable record id; also the evaluation order key.
    pub id: u32,
    /// Bound sensor module id.
    pub module_id: u32,
    /// Human-readable rule name.
    pub name: String,
    /// Predicate kind.
    pub condition: AlarmCondition,
    /// Low threshold (condition-dependent).
    #[serde(default)]
    pub threshold_low: Option<f32>,
    /// High threshold (condition-dependent).
    #[serde(default)]
    pub threshold_high: Option<f32>,
    /// Critical low bound; trips low_low without hysteresis.
    #[serde(default)]
    pub critical_low: Option<f32>,
    /// Critical high bound; trips high_high without hysteresis.
    #[serde(default)]
    pub critical_high: Option<f32>,
    /// Severity of raised instances.
    pub severity: Severity,
    /// Hysteresis as integer percent of the rule's active span.
    #[serde(default)]
    pub hysteresis_pct: u8,
    /// Clear instances automatically on return to normal.
    #[serde(default = "default_enabled")]
    pub auto_clear: bool,
    /// Whether the rule is evaluated.
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Optional interlock.
    #[serde(default)]
    pub interlock: Option<Interlock>,
}

impl AlarmRule {
    /// Validate the per-record invariants.
    pub fn validate(&self) -> RtuResult<()> {
        if self.name.is_empty() {
            return Err(RtuError::InvalidParam("rule name cannot be empty".into()));
        }
        if self.hysteresis_pct > 100 {
            return Err(RtuError::InvalidParam(format!(
                "rule '{}': hysteresis {}% above 100%",
                self.name, self.hysteresis_pct
            )));
        }
        let has_threshold = match self.condition {
            AlarmCondition::Above | AlarmCondition::RateOfChange => self.threshold_high.is_some(),
            AlarmCondition::Below => self.threshold_low.is_some(),
            AlarmCondition::OutOfRange => {
                self.threshold_low.is_some() && self.threshold_high.is_some()
            }
        };
        if !has_threshold {
            return Err(RtuError::InvalidParam(format!(
                "rule '{}': condition {:?} missing its threshold(s)",
                self.name, self.condition
            )));
        }
        if let (Some(lo), Some(hi)) = (self.threshold_low, self.threshold_high) {
            if lo > hi {
                return Err(RtuError::InvalidParam(format!(
                    "rule '{}': low threshold {lo} above high threshold {hi}",
                    self.name
                )));
            }
        }
        if let Some(il) = &self.interlock {
            if !(ACTUATOR_SLOT_MIN..=ACTUATOR_SLOT_MAX).contains(&il.target_slot) {
                return Err(RtuError::InvalidParam(format!(
                    "rule '{}': interlock target slot {} outside \
                     [{ACTUATOR_SLOT_MIN}, {ACTUATOR_SLOT_MAX}]",
                    self.name, il.target_slot
                )));
            }
        }
        Ok(())
    }
}

// ─── Alarm instances ────────────────────────────────────────────────

/// Lifecycle state of an alarm instance. Transitions are monotonic:
/// active → acknowledged → cleared, with acknowledged optional.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlarmState {
    Active,
    Acknowledged,
    Cleared,
}

/// A raised alarm.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlarmInstance {
    /// Stable instance id.
    pub id: u64,
    /// Rule that raised this instance.
    pub rule_id: u32,
    /// Sensor module the rule is bound to.
    pub module_id: u32,
    /// Severity copied from the rule at raise time.
    pub severity: Severity,
    /// Lifecycle state.
    pub state: AlarmState,
    /// Raise timestamp [epoch s].
    pub raised_at: u64,
    /// Acknowledge timestamp [epoch s].
    #[serde(default)]
    pub acknowledged_at: Option<u64>,
    /// Clear timestamp [epoch s].
    #[serde(default)]
    pub cleared_at: Option<u64>,
    /// Operator that acknowledged.
    #[serde(default)]
    pub acknowledged_by: Option<String>,
    /// Formatted description of the trip.
    pub message: String,
    /// Sensor value that tripped the rule.
    pub trigger_value: f32,
}

impl AlarmInstance {
    /// Whether the instance still counts against the one-open-per-rule cap.
    pub const fn is_open(&self) -> bool {
        !matches!(self.state, AlarmState::Cleared)
    }

    /// Acknowledge the instance. Only legal from `Active`.
    pub fn acknowledge(&mut self, by: &str, now_s: u64) -> RtuResult<()> {
        match self.state {
            AlarmState::Active => {
                self.state = AlarmState::Acknowledged;
                self.acknowledged_at = Some(now_s);
                self.acknowledged_by = Some(by.to_string());
                Ok(())
            }
            AlarmState::Acknowledged => Err(RtuError::InvalidState(format!(
                "alarm {} already acknowledged",
                self.id
            ))),
            AlarmState::Cleared => Err(RtuError::InvalidState(format!(
                "alarm {} already cleared",
                self.id
            ))),
        }
    }

    /// Clear the instance. Legal from `Active` and `Acknowledged`.
    pub fn clear(&mut self, now_s: u64) -> RtuResult<()> {
        if self.state == AlarmState::Cleared {
            return Err(RtuError::InvalidState(format!(
                "alarm {} already cleared",
                self.id
            )));
        }
        self.state = AlarmState::Cleared;
        self.cleared_at = Some(now_s);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sensor() -> SensorModule {
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
            filter_alpha: 0.0,
            hardware: Some(HardwareBinding {
                interface: Interface::I2c,
                bus: 1,
                address: "0x48".to_string(),
                channel: 0,
                counter: false,
                adc_gain: Some(1.0),
                adc_vref: Some(4.096),
            }),
            expression: None,
            static_value: None,
            enabled: true,
        }
    }

    #[test]
    fn valid_sensor_passes() {
        assert!(sensor().validate().is_ok());
    }

    #[test]
    fn sensor_slot_out_of_range_rejected() {
        let mut s = sensor();
        s.slot = 9;
        assert!(s.validate().is_err());
    }

    #[test]
    fn sensor_poll_period_floor_enforced() {
        let mut s = sensor();
        s.poll_period_ms = 9;
        assert!(s.validate().is_err());
        s.poll_period_ms = 10;
        assert!(s.validate().is_ok());
    }

    #[test]
    fn sensor_inverted_range_rejected() {
        let mut s = sensor();
        s.range_min = Some(10.0);
        s.range_max = Some(2.0);
        assert!(s.validate().is_err());
    }

    #[test]
    fn calculated_sensor_requires_expression() {
        let mut s = sensor();
        s.module_type = ModuleType::Calculated;
        s.hardware = None;
        assert!(s.validate().is_err());
        s.expression = Some("avg(a, b)".to_string());
        assert!(s.validate().is_ok());
    }

    fn actuator() -> Actuator {
        Actuator {
            id: 1,
            name: "dosing_pump".to_string(),
            slot: 10,
            subslot: 1,
            actuator_type: ActuatorType::Pump,
            chip: "gpiochip0".to_string(),
            pin: 17,
            active_low: false,
            safe_state: SafeState::Off,
            enabled: true,
            pwm_frequency_hz: None,
            pwm_max_duty: None,
        }
    }

    #[test]
    fn valid_actuator_passes() {
        assert!(actuator().validate().is_ok());
    }

    #[test]
    fn actuator_slot_range_enforced() {
        let mut a = actuator();
        a.slot = 8;
        assert!(a.validate().is_err());
        a.slot = 16;
        assert!(a.validate().is_ok());
    }

    #[test]
    fn pwm_actuator_requires_frequency_in_bounds() {
        let mut a = actuator();
        a.actuator_type = ActuatorType::Pwm;
        assert!(a.validate().is_err());
        a.pwm_frequency_hz = Some(25_000);
        assert!(a.validate().is_ok());
        a.pwm_frequency_hz = Some(200_000);
        assert!(a.validate().is_err());
    }

    #[test]
    fn severity_ordering_matches_dispatch_priority() {
        assert!(Severity::Critical > Severity::High);
        assert!(Severity::High > Severity::Medium);
        assert!(Severity::Medium > Severity::Low);
    }

    #[test]
    fn alarm_instance_transitions_are_monotonic() {
        let mut inst = AlarmInstance {
            id: 1,
            rule_id: 1,
            module_id: 1,
            severity: Severity::High,
            state: AlarmState::Active,
            raised_at: 100,
            acknowledged_at: None,
            cleared_at: None,
            acknowledged_by: None,
            message: "pH high".to_string(),
            trigger_value: 8.4,
        };

        assert!(inst.is_open());
        inst.acknowledge("operator", 110).unwrap();
        assert_eq!(inst.state, AlarmState::Acknowledged);
        // Second acknowledge is rejected.
        assert!(inst.acknowledge("operator", 111).is_err());

        inst.clear(120).unwrap();
        assert_eq!(inst.cleared_at, Some(120));
        assert!(!inst.is_open());
        // No transitions out of cleared.
        assert!(inst.clear(130).is_err());
        assert!(inst.acknowledge("operator", 130).is_err());
    }

    #[test]
    fn rule_requires_matching_thresholds() {
        let rule = AlarmRule {
            id: 1,
            module_id: 1,
            name: "ph_high".to_string(),
            condition: AlarmCondition::Above,
            threshold_low: None,
            threshold_high: None,
            critical_low: None,
            critical_high: None,
            severity: Severity::High,
            hysteresis_pct: 10,
            auto_clear: true,
            enabled: true,
            interlock: None,
        };
        assert!(rule.validate().is_err());

        let rule = AlarmRule {
            threshold_high: Some(8.0),
            ..rule
        };
        assert!(rule.validate().is_ok());
    }
}
