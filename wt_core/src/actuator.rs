//! Actuator runtimes and the command dispatcher.
//!
//! All actuator writes funnel through one queue consumed by the
//! dispatcher thread, so a slow bus operation can never stall alarm
//! evaluation or a fieldbus callback. Producers are the interlock
//! engine, the fieldbus output path and the connection-fault handler.

use std::collections::HashMap;
use std::sync::mpsc::{Receiver, RecvTimeoutError, Sender};
use std::time::Duration;

use tracing::{info, warn};

use wt_common::error::{RtuError, RtuResult};
use wt_common::model::{Actuator, ActuatorCommand, ActuatorState, SafeState};
use wt_hal::drivers::ActuatorDriver;

use crate::time::now_ms;

/// A queued actuator request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActuatorRequest {
    /// Apply a command to the actuator on `slot`.
    Command {
        slot: u16,
        command: ActuatorCommand,
    },
    /// Restore the safe state of the actuator on `slot`.
    RestoreSafe { slot: u16 },
    /// Drive every actuator to its safe state (connection loss).
    AllSafe,
}

/// Producer handle for the dispatcher queue.
pub type CommandSender = Sender<ActuatorRequest>;

// ─── Per-actuator runtime ───────────────────────────────────────────

/// One bound actuator plus its commanded-state bookkeeping.
pub struct ActuatorRuntime {
    pub actuator: Actuator,
    driver: Option<ActuatorDriver>,
    state: ActuatorState,
}

impl ActuatorRuntime {
    pub fn new(actuator: Actuator, driver: Option<ActuatorDriver>) -> Self {
        Self {
            actuator,
            driver,
            state: ActuatorState::default(),
        }
    }

    /// Current commanded state.
    pub fn state(&self) -> ActuatorState {
        self.state
    }

    /// Apply one command through the driver.
    pub fn apply(&mut self, command: ActuatorCommand) -> RtuResult<()> {
        if !self.actuator.enabled {
            return Err(RtuError::InvalidState(format!(
                "actuator '{}' is disabled",
                self.actuator.name
            )));
        }
        let driver = self.driver.as_mut().ok_or_else(|| {
            RtuError::NotInitialised(format!("actuator '{}' has no driver", self.actuator.name))
        })?;
        match driver.apply(command) {
            Ok(()) => {
                if self.state.commanded != command {
                    self.state.last_change_ms = now_ms();
                }
                self.state.commanded = command;
                self.state.fault = false;
                Ok(())
            }
            Err(e) => {
                self.state.fault = true;
                Err(e)
            }
        }
    }

    /// The command realising this actuator's safe state; `None` for
    /// hold-last.
    pub fn safe_command(&self) -> Option<ActuatorCommand> {
        match self.actuator.safe_state {
            SafeState::Off => Some(ActuatorCommand::Off),
            SafeState::On => Some(ActuatorCommand::On),
            SafeState::Hold => None,
        }
    }

    /// Drive to safe state. Hold-last is a no-op.
    pub fn apply_safe(&mut self) -> RtuResult<()> {
        match self.safe_command() {
            Some(command) => self.apply(command),
            None => Ok(()),
        }
    }
}

// ─── Dispatcher ─────────────────────────────────────────────────────

/// Consumes the actuator queue and applies commands to drivers.
pub struct Dispatcher {
    actuators: HashMap<u16, ActuatorRuntime>,
}

impl Dispatcher {
    pub fn new(actuators: impl IntoIterator<Item = ActuatorRuntime>) -> Self {
        Self {
            actuators: actuators
                .into_iter()
                .map(|rt| (rt.actuator.slot, rt))
                .collect(),
        }
    }

    /// Commanded state of one slot, for diagnostics and the fieldbus.
    pub fn state(&self, slot: u16) -> Option<ActuatorState> {
        self.actuators.get(&slot).map(ActuatorRuntime::state)
    }

    /// Process one request. Failures are logged, never propagated; a
    /// faulted valve must not take the queue down with it.
    pub fn process(&mut self, request: ActuatorRequest) {
        match request {
            ActuatorRequest::Command { slot, command } => {
                let Some(rt) = self.actuators.get_mut(&slot) else {
                    warn!(slot, "command for unknown actuator slot dropped");
                    return;
                };
                if let Err(e) = rt.apply(command) {
                    warn!(slot, "actuator command failed: {e}");
                }
            }
            ActuatorRequest::RestoreSafe { slot } => {
                let Some(rt) = self.actuators.get_mut(&slot) else {
                    warn!(slot, "safe-state request for unknown slot dropped");
                    return;
                };
                if let Err(e) = rt.apply_safe() {
                    warn!(slot, "safe-state restore failed: {e}");
                }
            }
            ActuatorRequest::AllSafe => {
                info!("driving all actuators to safe state");
                for (slot, rt) in &mut self.actuators {
                    if let Err(e) = rt.apply_safe() {
                        warn!(slot, "safe-state restore failed: {e}");
                    }
                }
            }
        }
    }

    /// Blocking dispatcher loop. Returns when the queue closes or
    /// `shutdown` flips.
    pub fn run(
        mut self,
        queue: Receiver<ActuatorRequest>,
        shutdown: &std::sync::atomic::AtomicBool,
    ) {
        loop {
            if shutdown.load(std::sync::atomic::Ordering::Relaxed) {
                return;
            }
            match queue.recv_timeout(Duration::from_millis(100)) {
                Ok(request) => self.process(request),
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => return,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wt_common::model::ActuatorType;
    use wt_hal::gpio::ListenerPin;

    fn actuator(slot: u16, safe_state: SafeState) -> Actuator {
        Actuator {
            id: u32::from(slot),
            name: format!("act_{slot}"),
            slot,
            subslot: 1,
            actuator_type: ActuatorType::Pump,
            chip: "gpiochip0".to_string(),
            pin: u32::from(slot),
            active_low: false,
            safe_state,
            enabled: true,
            pwm_frequency_hz: None,
            pwm_max_duty: None,
        }
    }

    fn runtime(slot: u16, safe_state: SafeState) -> ActuatorRuntime {
        ActuatorRuntime::new(
            actuator(slot, safe_state),
            Some(ActuatorDriver::switched(Box::new(ListenerPin::new(false)))),
        )
    }

    #[test]
    fn apply_updates_commanded_state() {
        let mut rt = runtime(10, SafeState::Off);
        rt.apply(ActuatorCommand::On).unwrap();
        assert_eq!(rt.state().commanded, ActuatorCommand::On);
        assert!(!rt.state().fault);
        assert!(rt.state().last_change_ms > 0);
    }

    #[test]
    fn disabled_actuator_rejects_commands() {
        let mut act = actuator(10, SafeState::Off);
        act.enabled = false;
        let mut rt = ActuatorRuntime::new(
            act,
            Some(ActuatorDriver::switched(Box::new(ListenerPin::new(false)))),
        );
        assert!(matches!(
            rt.apply(ActuatorCommand::On),
            Err(RtuError::InvalidState(_))
        ));
    }

    #[test]
    fn unbound_actuator_reports_not_initialised() {
        let mut rt = ActuatorRuntime::new(actuator(10, SafeState::Off), None);
        assert!(matches!(
            rt.apply(ActuatorCommand::On),
            Err(RtuError::NotInitialised(_))
        ));
    }

    #[test]
    fn safe_commands_follow_configuration() {
        assert_eq!(
            runtime(10, SafeState::Off).safe_command(),
            Some(ActuatorCommand::Off)
        );
        assert_eq!(
            runtime(10, SafeState::On).safe_command(),
            Some(ActuatorCommand::On)
        );
        assert_eq!(runtime(10, SafeState::Hold).safe_command(), None);
    }

    #[test]
    fn hold_last_keeps_state_on_all_safe() {
        let mut dispatcher = Dispatcher::new([
            runtime(10, SafeState::Off),
            runtime(11, SafeState::Hold),
        ]);

        dispatcher.process(ActuatorRequest::Command {
            slot: 10,
            command: ActuatorCommand::On,
        });
        dispatcher.process(ActuatorRequest::Command {
            slot: 11,
            command: ActuatorCommand::On,
        });

        dispatcher.process(ActuatorRequest::AllSafe);
        assert_eq!(
            dispatcher.state(10).unwrap().commanded,
            ActuatorCommand::Off
        );
        // Hold-last leaves the commanded state alone.
        assert_eq!(dispatcher.state(11).unwrap().commanded, ActuatorCommand::On);
    }

    #[test]
    fn unknown_slot_is_dropped_quietly() {
        let mut dispatcher = Dispatcher::new([runtime(10, SafeState::Off)]);
        dispatcher.process(ActuatorRequest::Command {
            slot: 15,
            command: ActuatorCommand::On,
        });
        assert!(dispatcher.state(15).is_none());
    }
}
