//! The IO-Device connection state machine.
//!
//! ```text
//! Idle → Parameterising → WaitAppReady → Running → (Abort/Release) → Idle
//! ```
//!
//! The adapter joins the stack's callbacks to the core: cyclic input
//! callbacks publish the sensor table as big-endian floats with
//! per-record provider status, cyclic output callbacks decode actuator
//! commands into the dispatcher queue. Record services carry I&M0;
//! identification and lifecycle requests go to injected handles so the
//! adapter never owns an LED or the process lifetime.
//!
//! The internal pipeline is deliberately independent of the connection:
//! a connection abort drives actuators to their safe state but sensors
//! keep polling and alarms keep firing interlocks.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tracing::{debug, info, warn};

use wt_common::consts::{ACTUATOR_SLOT_MAX, ACTUATOR_SLOT_MIN, SENSOR_SLOT_MAX, SENSOR_SLOT_MIN};
use wt_common::model::SensorStatus;
use wt_core::actuator::{ActuatorRequest, CommandSender};
use wt_core::table::SensorValueTable;

use crate::im::{IM0_INDEX, IM1_INDEX, IM4_INDEX, Im0};
use crate::iodata::{
    InputRecord, Ioxs, SlotTable, decode_actuator_command, encode_sensor_value,
};
use crate::stack::{CB_ERR, CB_OK, DeviceCallbacks};

/// Connection states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AdapterState {
    #[default]
    Idle,
    Parameterising,
    WaitAppReady,
    Running,
}

/// Identification LED handle (external LED subsystem).
pub trait IdentificationLamp: Send {
    fn set(&mut self, on: bool);
}

/// Process-lifecycle signalling handle. The adapter requests, the
/// process root decides.
pub trait LifecycleControl: Send {
    /// Clean restart (factory reset request).
    fn request_restart(&mut self);
    /// Configuration reload.
    fn request_reload(&mut self);
}

/// No-op lamp for headless deployments.
pub struct NullLamp;

impl IdentificationLamp for NullLamp {
    fn set(&mut self, _on: bool) {}
}

/// No-op lifecycle control.
pub struct NullLifecycle;

impl LifecycleControl for NullLifecycle {
    fn request_restart(&mut self) {}
    fn request_reload(&mut self) {}
}

/// Maximum expected-submodule entries a controller can plug.
const MAX_EXPECTED: usize = 16;

/// The fieldbus adapter.
pub struct Adapter {
    state: AdapterState,
    slots: SlotTable,
    expected: heapless::Vec<(u16, u16), MAX_EXPECTED>,
    table: Arc<SensorValueTable>,
    /// Input slot → sensor module id.
    slot_to_sensor: HashMap<u16, u32>,
    /// Configured output slots.
    actuator_slots: HashSet<u16>,
    commands: CommandSender,
    im0: Im0,
    lamp: Box<dyn IdentificationLamp>,
    lifecycle: Box<dyn LifecycleControl>,
}

impl Adapter {
    pub fn new(
        table: Arc<SensorValueTable>,
        slot_to_sensor: HashMap<u16, u32>,
        actuator_slots: HashSet<u16>,
        commands: CommandSender,
        im0: Im0,
        lamp: Box<dyn IdentificationLamp>,
        lifecycle: Box<dyn LifecycleControl>,
    ) -> Self {
        Self {
            state: AdapterState::Idle,
            slots: SlotTable::new(),
            expected: heapless::Vec::new(),
            table,
            slot_to_sensor,
            actuator_slots,
            commands,
            im0,
            lamp,
            lifecycle,
        }
    }

    /// Current connection state.
    pub fn state(&self) -> AdapterState {
        self.state
    }

    /// Plugged (slot, subslot) list from the last parameterisation.
    pub fn expected(&self) -> &[(u16, u16)] {
        &self.expected
    }

    /// Per-slot buffers, for diagnostics.
    pub fn slots(&self) -> &SlotTable {
        &self.slots
    }

    /// Build the current input record for a sensor slot.
    fn input_record(&self, slot: u16) -> InputRecord {
        let Some(sensor_id) = self.slot_to_sensor.get(&slot) else {
            return InputRecord::default();
        };
        match self.table.get(*sensor_id) {
            Some(reading) => InputRecord {
                data: encode_sensor_value(reading.value),
                // Only a clean reading counts as good provider data;
                // out-of-range and errors ship the value with IOPS bad.
                iops: if reading.status == SensorStatus::Ok {
                    Ioxs::good()
                } else {
                    Ioxs::bad()
                },
            },
            None => InputRecord::default(),
        }
    }

    /// Seed every input buffer with the last-known sensor floats.
    fn seed_inputs(&mut self) {
        for slot in SENSOR_SLOT_MIN..=SENSOR_SLOT_MAX {
            let record = self.input_record(slot);
            let _ = self.slots.write_input(slot, record);
        }
    }

    /// Common abort/release path: outputs are stale the moment the
    /// connection drops, so discard them and fall back to safe states.
    fn drop_connection(&mut self, reason: &str) {
        info!(state = ?self.state, "connection {reason}; actuators to safe state");
        self.slots.discard_outputs();
        if self.commands.send(ActuatorRequest::AllSafe).is_err() {
            warn!("actuator dispatcher gone; safe-state request dropped");
        }
        self.state = AdapterState::Idle;
    }
}

impl DeviceCallbacks for Adapter {
    fn on_startup(&mut self) -> i32 {
        info!("fieldbus startup; entering parameterisation");
        self.expected.clear();
        self.state = AdapterState::Parameterising;
        CB_OK
    }

    fn on_expected_submodule(&mut self, slot: u16, subslot: u16) -> i32 {
        if self.state != AdapterState::Parameterising {
            warn!(slot, state = ?self.state, "expected-submodule outside parameterisation");
            return CB_ERR;
        }
        let in_range = (SENSOR_SLOT_MIN..=SENSOR_SLOT_MAX).contains(&slot)
            || (ACTUATOR_SLOT_MIN..=ACTUATOR_SLOT_MAX).contains(&slot);
        if !in_range {
            warn!(slot, "controller plugged an out-of-range slot");
            return CB_ERR;
        }
        // Accept each plug; record for diagnostics.
        if self.expected.push((slot, subslot)).is_err() {
            warn!(slot, "expected-submodule list full");
            return CB_ERR;
        }
        debug!(slot, subslot, "expected submodule accepted");
        CB_OK
    }

    fn on_prm_end(&mut self) -> i32 {
        if self.state != AdapterState::Parameterising {
            return CB_ERR;
        }
        self.seed_inputs();
        self.state = AdapterState::WaitAppReady;
        info!(plugged = self.expected.len(), "parameterisation complete");
        CB_OK
    }

    fn on_app_ready(&mut self) -> i32 {
        if self.state != AdapterState::WaitAppReady {
            return CB_ERR;
        }
        self.state = AdapterState::Running;
        info!("application ready; cyclic exchange running");
        CB_OK
    }

    fn on_cyclic_input(&mut self, slot: u16) -> InputRecord {
        if self.state != AdapterState::Running {
            return InputRecord::default();
        }
        let record = self.input_record(slot);
        let _ = self.slots.write_input(slot, record);
        record
    }

    fn on_cyclic_output(&mut self, slot: u16, data: &[u8; 4]) -> i32 {
        if self.state != AdapterState::Running {
            return CB_ERR;
        }
        if !self.actuator_slots.contains(&slot) {
            debug!(slot, "output for unconfigured slot ignored");
            return CB_OK;
        }
        if self.slots.write_output(slot, *data).is_err() {
            return CB_ERR;
        }
        match decode_actuator_command(data) {
            Ok(command) => {
                if self
                    .commands
                    .send(ActuatorRequest::Command { slot, command })
                    .is_err()
                {
                    warn!(slot, "actuator dispatcher gone; output dropped");
                    return CB_ERR;
                }
                CB_OK
            }
            Err(e) => {
                warn!(slot, "bad output record: {e}");
                CB_ERR
            }
        }
    }

    fn on_record_read(&mut self, slot: u16, index: u16, out: &mut Vec<u8>) -> i32 {
        match index {
            IM0_INDEX => {
                out.extend_from_slice(&self.im0.to_bytes());
                CB_OK
            }
            IM1_INDEX..=IM4_INDEX => {
                // Not supported: length 0.
                debug!(slot, index, "unsupported I&M record read");
                CB_OK
            }
            _ => CB_OK,
        }
    }

    fn on_record_write(&mut self, slot: u16, index: u16, data: &[u8]) -> i32 {
        if index < IM0_INDEX {
            // Parameter writes are accepted and logged; configuration
            // changes go through the external edit path.
            info!(slot, index, len = data.len(), "parameter record write accepted");
            CB_OK
        } else {
            warn!(slot, index, "write to identification record rejected");
            CB_ERR
        }
    }

    fn on_signal_led(&mut self, on: bool) -> i32 {
        self.lamp.set(on);
        CB_OK
    }

    fn on_factory_reset(&mut self) -> i32 {
        info!("controller requested factory reset; signalling clean restart");
        self.lifecycle.request_restart();
        CB_OK
    }

    fn on_config_reload(&mut self) -> i32 {
        info!("controller requested configuration reload");
        self.lifecycle.request_reload();
        CB_OK
    }

    fn on_abort(&mut self) -> i32 {
        self.drop_connection("aborted");
        CB_OK
    }

    fn on_release(&mut self) -> i32 {
        self.drop_connection("released");
        CB_OK
    }
}
