//! Interlock request queueing and conflict resolution.
//!
//! Interlocks never touch hardware inline: the alarm engine emits
//! requests, this module resolves same-tick conflicts, and the actuator
//! dispatcher applies the winners on its own thread. Within one tick,
//! two rules targeting the same actuator resolve by severity
//! (critical > high > medium > low), ties by lower rule id.

use wt_common::model::{ActuatorCommand, InterlockAction, Severity};

/// What an interlock asks the dispatcher to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterlockCommand {
    /// Apply a concrete command.
    Apply(ActuatorCommand),
    /// Restore the target actuator's configured safe state.
    RestoreSafe,
}

impl InterlockCommand {
    /// Map a rule's configured action to a command.
    pub fn apply(action: InterlockAction) -> Self {
        Self::Apply(match action {
            InterlockAction::ForceOff => ActuatorCommand::Off,
            InterlockAction::ForceOn => ActuatorCommand::On,
            InterlockAction::SetPwm(duty) => ActuatorCommand::Pwm(duty),
        })
    }
}

/// One queued interlock request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InterlockRequest {
    pub rule_id: u32,
    pub severity: Severity,
    pub target_slot: u16,
    pub command: InterlockCommand,
}

/// Resolve one tick's requests: per target slot the highest-severity
/// request wins, ties going to the lower rule id. Output preserves the
/// issue order of the winning requests.
pub fn resolve_conflicts(requests: Vec<InterlockRequest>) -> Vec<InterlockRequest> {
    let mut winners: Vec<InterlockRequest> = Vec::with_capacity(requests.len());

    for request in requests {
        match winners
            .iter_mut()
            .find(|w| w.target_slot == request.target_slot)
        {
            None => winners.push(request),
            Some(current) => {
                let wins = request.severity > current.severity
                    || (request.severity == current.severity
                        && request.rule_id < current.rule_id);
                if wins {
                    *current = request;
                }
            }
        }
    }
    winners
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(
        rule_id: u32,
        severity: Severity,
        slot: u16,
        command: InterlockCommand,
    ) -> InterlockRequest {
        InterlockRequest {
            rule_id,
            severity,
            target_slot: slot,
            command,
        }
    }

    #[test]
    fn action_mapping() {
        assert_eq!(
            InterlockCommand::apply(InterlockAction::ForceOff),
            InterlockCommand::Apply(ActuatorCommand::Off)
        );
        assert_eq!(
            InterlockCommand::apply(InterlockAction::SetPwm(128)),
            InterlockCommand::Apply(ActuatorCommand::Pwm(128))
        );
    }

    #[test]
    fn distinct_slots_pass_through_in_order() {
        let requests = vec![
            request(1, Severity::Low, 10, InterlockCommand::apply(InterlockAction::ForceOff)),
            request(2, Severity::High, 11, InterlockCommand::apply(InterlockAction::ForceOn)),
        ];
        let resolved = resolve_conflicts(requests.clone());
        assert_eq!(resolved, requests);
    }

    #[test]
    fn higher_severity_wins_the_slot() {
        let resolved = resolve_conflicts(vec![
            request(1, Severity::Medium, 10, InterlockCommand::apply(InterlockAction::ForceOn)),
            request(2, Severity::Critical, 10, InterlockCommand::apply(InterlockAction::ForceOff)),
        ]);
        assert_eq!(resolved.len(), 1);
        assert_eq!(resolved[0].rule_id, 2);
        assert_eq!(
            resolved[0].command,
            InterlockCommand::Apply(ActuatorCommand::Off)
        );
    }

    #[test]
    fn severity_tie_goes_to_lower_rule_id() {
        let resolved = resolve_conflicts(vec![
            request(5, Severity::High, 10, InterlockCommand::apply(InterlockAction::ForceOn)),
            request(2, Severity::High, 10, InterlockCommand::apply(InterlockAction::ForceOff)),
        ]);
        assert_eq!(resolved.len(), 1);
        assert_eq!(resolved[0].rule_id, 2);
    }

    #[test]
    fn earlier_winner_is_not_displaced_by_equal_later() {
        let resolved = resolve_conflicts(vec![
            request(2, Severity::High, 10, InterlockCommand::apply(InterlockAction::ForceOff)),
            request(5, Severity::High, 10, InterlockCommand::apply(InterlockAction::ForceOn)),
        ]);
        assert_eq!(resolved[0].rule_id, 2);
    }
}
