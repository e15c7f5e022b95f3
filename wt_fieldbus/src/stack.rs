//! The vendor-stack callback contract.
//!
//! The low-level fieldbus stack is a third-party component running its
//! own thread. It drives the device through the [`DeviceCallbacks`]
//! trait; every callback must return quickly (≤ 1 ms typical) and
//! signals failure with a non-zero return code, which the stack consumes
//! without stopping the adapter's state machine.
//!
//! [`LoopbackStack`] is the in-process controller double used by tests:
//! it walks a device through the connection lifecycle and exchanges
//! cyclic frames the way a controller would.

use wt_common::consts::{ACTUATOR_SLOT_MAX, ACTUATOR_SLOT_MIN, SENSOR_SLOT_MAX, SENSOR_SLOT_MIN};

use crate::iodata::InputRecord;

/// Callback return code: success.
pub const CB_OK: i32 = 0;
/// Callback return code: generic failure.
pub const CB_ERR: i32 = -1;

/// Device-side callbacks invoked by the stack.
pub trait DeviceCallbacks {
    /// Stack came up; the device may announce itself.
    fn on_startup(&mut self) -> i32;

    /// Controller declared an expected module/submodule during
    /// parameterisation.
    fn on_expected_submodule(&mut self, slot: u16, subslot: u16) -> i32;

    /// Parameterisation finished.
    fn on_prm_end(&mut self) -> i32;

    /// Controller reports the application is ready; cyclic exchange
    /// starts after this.
    fn on_app_ready(&mut self) -> i32;

    /// Stack requests fresh input data for one slot. Returns the record
    /// to put on the wire.
    fn on_cyclic_input(&mut self, slot: u16) -> InputRecord;

    /// Stack delivers one slot's output data from the controller.
    fn on_cyclic_output(&mut self, slot: u16, data: &[u8; 4]) -> i32;

    /// Acyclic record read. Appends the payload to `out`.
    fn on_record_read(&mut self, slot: u16, index: u16, out: &mut Vec<u8>) -> i32;

    /// Acyclic record write.
    fn on_record_write(&mut self, slot: u16, index: u16, data: &[u8]) -> i32;

    /// Controller requests the identification LED.
    fn on_signal_led(&mut self, on: bool) -> i32;

    /// Controller requests a factory reset (clean restart).
    fn on_factory_reset(&mut self) -> i32;

    /// Controller requests a configuration reload.
    fn on_config_reload(&mut self) -> i32;

    /// Connection aborted by the controller or the stack.
    fn on_abort(&mut self) -> i32;

    /// Connection released in an orderly fashion.
    fn on_release(&mut self) -> i32;
}

// ─── Loopback stack (test controller) ───────────────────────────────

/// In-process controller double for exercising a device.
pub struct LoopbackStack;

impl LoopbackStack {
    /// Walk a device from startup to the running state, expecting every
    /// slot/subslot-1 pair. Returns the accumulated callback codes.
    pub fn connect(device: &mut dyn DeviceCallbacks) -> i32 {
        let mut rc = device.on_startup();
        for slot in SENSOR_SLOT_MIN..=SENSOR_SLOT_MAX {
            rc |= device.on_expected_submodule(slot, 1);
        }
        for slot in ACTUATOR_SLOT_MIN..=ACTUATOR_SLOT_MAX {
            rc |= device.on_expected_submodule(slot, 1);
        }
        rc |= device.on_prm_end();
        rc |= device.on_app_ready();
        rc
    }

    /// One controller cycle: collect every input slot, deliver the given
    /// output frames.
    pub fn exchange(
        device: &mut dyn DeviceCallbacks,
        outputs: &[(u16, [u8; 4])],
    ) -> Vec<(u16, InputRecord)> {
        let inputs = (SENSOR_SLOT_MIN..=SENSOR_SLOT_MAX)
            .map(|slot| (slot, device.on_cyclic_input(slot)))
            .collect();
        for (slot, data) in outputs {
            device.on_cyclic_output(*slot, data);
        }
        inputs
    }
}

/// A null device for contract smoke tests.
#[cfg(test)]
pub(crate) struct NullDevice;

#[cfg(test)]
impl DeviceCallbacks for NullDevice {
    fn on_startup(&mut self) -> i32 {
        CB_OK
    }
    fn on_expected_submodule(&mut self, _slot: u16, _subslot: u16) -> i32 {
        CB_OK
    }
    fn on_prm_end(&mut self) -> i32 {
        CB_OK
    }
    fn on_app_ready(&mut self) -> i32 {
        CB_OK
    }
    fn on_cyclic_input(&mut self, _slot: u16) -> InputRecord {
        InputRecord::default()
    }
    fn on_cyclic_output(&mut self, _slot: u16, _data: &[u8; 4]) -> i32 {
        CB_OK
    }
    fn on_record_read(&mut self, _slot: u16, _index: u16, _out: &mut Vec<u8>) -> i32 {
        CB_OK
    }
    fn on_record_write(&mut self, _slot: u16, _index: u16, _data: &[u8]) -> i32 {
        CB_OK
    }
    fn on_signal_led(&mut self, _on: bool) -> i32 {
        CB_OK
    }
    fn on_factory_reset(&mut self) -> i32 {
        CB_OK
    }
    fn on_config_reload(&mut self) -> i32 {
        CB_OK
    }
    fn on_abort(&mut self) -> i32 {
        CB_OK
    }
    fn on_release(&mut self) -> i32 {
        CB_OK
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn loopback_connects_a_null_device() {
        let mut device = NullDevice;
        assert_eq!(LoopbackStack::connect(&mut device), CB_OK);

        let inputs = LoopbackStack::exchange(&mut device, &[(10, [1, 0, 0, 0])]);
        assert_eq!(inputs.len(), 8);
        assert_eq!(inputs[0].0, SENSOR_SLOT_MIN);
    }
}
