//! Cyclic IO-data records.
//!
//! Every active slot exchanges a fixed 4-byte record per cycle:
//!
//! - Sensor slots (1–8): the latest engineering value as a big-endian
//!   IEEE-754 float.
//! - Actuator slots (9–16): byte 0 command kind (0 off, 1 on, 2 pwm),
//!   byte 1 duty 0–255, bytes 2–3 reserved zero.
//!
//! Records are read and written atomically per slot; the producer of an
//! input buffer is the adapter's cyclic path, the consumer of an output
//! buffer is the actuator dispatcher.

use std::sync::Mutex;

use bitflags::bitflags;
use static_assertions::const_assert_eq;

use wt_common::consts::{
    ACTUATOR_SLOT_MAX, ACTUATOR_SLOT_MIN, IO_RECORD_LEN, SENSOR_SLOT_MAX, SENSOR_SLOT_MIN,
};
use wt_common::error::{RtuError, RtuResult};
use wt_common::model::ActuatorCommand;

const_assert_eq!(IO_RECORD_LEN, 4);
const_assert_eq!(SENSOR_SLOT_MAX - SENSOR_SLOT_MIN + 1, 8);
const_assert_eq!(ACTUATOR_SLOT_MAX - ACTUATOR_SLOT_MIN + 1, 8);

bitflags! {
    /// Provider/consumer status byte attached to each cyclic record.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Ioxs: u8 {
        /// Data state: set = good, clear = bad.
        const STATE_GOOD = 0x80;
    }
}

impl Ioxs {
    /// Good provider status.
    pub const fn good() -> Self {
        Self::STATE_GOOD
    }

    /// Bad provider status.
    pub const fn bad() -> Self {
        Self::empty()
    }

    /// Whether the record counts as valid data.
    pub const fn is_good(self) -> bool {
        self.contains(Self::STATE_GOOD)
    }
}

// ─── Sensor records ─────────────────────────────────────────────────

/// Encode a sensor value into its 4-byte input record.
pub fn encode_sensor_value(value: f32) -> [u8; IO_RECORD_LEN] {
    value.to_be_bytes()
}

/// Decode a 4-byte input record back into a float.
pub fn decode_sensor_value(record: &[u8; IO_RECORD_LEN]) -> f32 {
    f32::from_be_bytes(*record)
}

// ─── Actuator records ───────────────────────────────────────────────

/// Command kinds on the wire.
const KIND_OFF: u8 = 0;
const KIND_ON: u8 = 1;
const KIND_PWM: u8 = 2;

/// Encode an actuator command into its 4-byte output record.
pub fn encode_actuator_command(command: ActuatorCommand) -> [u8; IO_RECORD_LEN] {
    match command {
        ActuatorCommand::Off => [KIND_OFF, 0, 0, 0],
        ActuatorCommand::On => [KIND_ON, 0, 0, 0],
        ActuatorCommand::Pwm(duty) => [KIND_PWM, duty, 0, 0],
    }
}

/// Decode a 4-byte output record into an actuator command.
///
/// Unknown kinds are `InvalidParam`; reserved bytes are ignored as the
/// contract says, not validated.
pub fn decode_actuator_command(record: &[u8; IO_RECORD_LEN]) -> RtuResult<ActuatorCommand> {
    match record[0] {
        KIND_OFF => Ok(ActuatorCommand::Off),
        KIND_ON => Ok(ActuatorCommand::On),
        KIND_PWM => Ok(ActuatorCommand::Pwm(record[1])),
        other => Err(RtuError::InvalidParam(format!(
            "unknown actuator command kind {other}"
        ))),
    }
}

// ─── Slot buffers ───────────────────────────────────────────────────

/// One input record plus its provider status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InputRecord {
    pub data: [u8; IO_RECORD_LEN],
    pub iops: Ioxs,
}

impl Default for InputRecord {
    fn default() -> Self {
        Self {
            data: [0; IO_RECORD_LEN],
            iops: Ioxs::bad(),
        }
    }
}

/// Per-slot cyclic buffers, slots 1–8 input and 9–16 output.
pub struct SlotTable {
    inputs: [Mutex<InputRecord>; 8],
    outputs: [Mutex<[u8; IO_RECORD_LEN]>; 8],
}

impl SlotTable {
    pub fn new() -> Self {
        Self {
            inputs: std::array::from_fn(|_| Mutex::new(InputRecord::default())),
            outputs: std::array::from_fn(|_| Mutex::new([0; IO_RECORD_LEN])),
        }
    }

    fn input_index(slot: u16) -> RtuResult<usize> {
        if (SENSOR_SLOT_MIN..=SENSOR_SLOT_MAX).contains(&slot) {
            Ok(usize::from(slot - SENSOR_SLOT_MIN))
        } else {
            Err(RtuError::InvalidParam(format!("{slot} is not an input slot")))
        }
    }

    fn output_index(slot: u16) -> RtuResult<usize> {
        if (ACTUATOR_SLOT_MIN..=ACTUATOR_SLOT_MAX).contains(&slot) {
            Ok(usize::from(slot - ACTUATOR_SLOT_MIN))
        } else {
            Err(RtuError::InvalidParam(format!(
                "{slot} is not an output slot"
            )))
        }
    }

    /// Atomically replace one input record.
    pub fn write_input(&self, slot: u16, record: InputRecord) -> RtuResult<()> {
        let idx = Self::input_index(slot)?;
        *self.inputs[idx].lock().expect("slot lock poisoned") = record;
        Ok(())
    }

    /// Atomically read one input record.
    pub fn read_input(&self, slot: u16) -> RtuResult<InputRecord> {
        let idx = Self::input_index(slot)?;
        Ok(*self.inputs[idx].lock().expect("slot lock poisoned"))
    }

    /// Atomically replace one output record.
    pub fn write_output(&self, slot: u16, data: [u8; IO_RECORD_LEN]) -> RtuResult<()> {
        let idx = Self::output_index(slot)?;
        *self.outputs[idx].lock().expect("slot lock poisoned") = data;
        Ok(())
    }

    /// Atomically read one output record.
    pub fn read_output(&self, slot: u16) -> RtuResult<[u8; IO_RECORD_LEN]> {
        let idx = Self::output_index(slot)?;
        Ok(*self.outputs[idx].lock().expect("slot lock poisoned"))
    }

    /// Zero every output buffer (connection abort).
    pub fn discard_outputs(&self) {
        for slot in &self.outputs {
            *slot.lock().expect("slot lock poisoned") = [0; IO_RECORD_LEN];
        }
    }
}

impl Default for SlotTable {
    fn default() -> Self {
        Self::new()
    }
}
