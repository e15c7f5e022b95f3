//! Alarm rule evaluation and instance lifecycle.
//!
//! Every pipeline tick, after publish, each enabled rule is stepped
//! against the latest value of its bound sensor. The per-rule state
//! machine carries five states (normal, low, low_low, high, high_high);
//! the simple high/low bounds take a hysteresis band materialised from
//! the configured percent of the sensor's span, the critical bounds are
//! plain thresholds.
//!
//! Rules are evaluated in stable rule-id order; interlock requests are
//! collected in issue order and conflict-resolved downstream.

use std::collections::HashMap;

use tracing::{debug, info};

use wt_common::error::{RtuError, RtuResult};
use wt_common::model::{
    AlarmCondition, AlarmInstance, AlarmRule, AlarmState, Reading,
};

use crate::interlock::{InterlockCommand, InterlockRequest};

// ─── Rule state machine ─────────────────────────────────────────────

/// Evaluation state of one rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RuleState {
    #[default]
    Normal,
    Low,
    LowLow,
    High,
    HighHigh,
}

impl RuleState {
    /// Whether the state counts as alarmed.
    pub const fn alarmed(self) -> bool {
        !matches!(self, Self::Normal)
    }
}

/// Sensor context a rule evaluates against.
#[derive(Debug, Clone)]
pub struct ModuleContext {
    pub name: String,
    pub unit: String,
    /// Engineering span used to materialise the hysteresis band.
    pub span: Option<f32>,
}

/// Per-rule runtime.
struct RuleRuntime {
    rule: AlarmRule,
    state: RuleState,
    /// Previous (value, ts_ms) for rate-of-change rules.
    last_sample: Option<(f32, u64)>,
}

impl RuleRuntime {
    fn new(rule: AlarmRule) -> Self {
        Self {
            rule,
            state: RuleState::Normal,
            last_sample: None,
        }
    }

    /// High bound of the simple-threshold path, per condition.
    fn high_bound(&self) -> Option<f32> {
        match self.rule.condition {
            AlarmCondition::Above | AlarmCondition::OutOfRange | AlarmCondition::RateOfChange => {
                self.rule.threshold_high
            }
            AlarmCondition::Below => None,
        }
    }

    /// Low bound of the simple-threshold path, per condition.
    fn low_bound(&self) -> Option<f32> {
        match self.rule.condition {
            AlarmCondition::Below | AlarmCondition::OutOfRange => self.rule.threshold_low,
            AlarmCondition::Above | AlarmCondition::RateOfChange => None,
        }
    }

    /// Absolute hysteresis band from the configured percent of span.
    fn band(&self, span: Option<f32>) -> f32 {
        let span = span.unwrap_or_else(|| {
            match (self.rule.threshold_low, self.rule.threshold_high) {
                (Some(lo), Some(hi)) => hi - lo,
                _ => 0.0,
            }
        });
        span * f32::from(self.rule.hysteresis_pct) / 100.0
    }

    /// The value the thresholds compare against: the sensor value, or
    /// |dv/dt| for rate-of-change rules.
    fn evaluated_value(&mut self, reading: &Reading) -> Option<f32> {
        if self.rule.condition != AlarmCondition::RateOfChange {
            return Some(reading.value);
        }
        let prev = self.last_sample;
        self.last_sample = Some((reading.value, reading.ts_ms));
        let (prev_value, prev_ts) = prev?;
        if reading.ts_ms <= prev_ts {
            return None;
        }
        let dt_s = (reading.ts_ms - prev_ts) as f32 / 1000.0;
        Some(((reading.value - prev_value) / dt_s).abs())
    }

    /// One evaluation step. Transition order per the table: critical
    /// high, critical low, high with hysteresis, low with hysteresis,
    /// normal. Critical bounds take no hysteresis.
    fn step(&mut self, v: f32, span: Option<f32>) -> (RuleState, RuleState) {
        let band = self.band(span);
        let previous = self.state;

        let next = 'next: {
            if let Some(hh) = self.rule.critical_high {
                if v >= hh {
                    break 'next RuleState::HighHigh;
                }
            }
            if let Some(ll) = self.rule.critical_low {
                if v <= ll {
                    break 'next RuleState::LowLow;
                }
            }
            if let Some(high) = self.high_bound() {
                if previous == RuleState::High {
                    if v >= high - band {
                        break 'next RuleState::High;
                    }
                } else if v >= high {
                    break 'next RuleState::High;
                }
            }
            if let Some(low) = self.low_bound() {
                if previous == RuleState::Low {
                    if v <= low + band {
                        break 'next RuleState::Low;
                    }
                } else if v <= low {
                    break 'next RuleState::Low;
                }
            }
            RuleState::Normal
        };

        self.state = next;
        (previous, next)
    }
}

// ─── Alarm engine ───────────────────────────────────────────────────

/// Rule evaluation engine plus the in-memory alarm history.
pub struct AlarmEngine {
    /// Rule runtimes, kept sorted by rule id (evaluation order).
    rules: Vec<RuleRuntime>,
    /// Sensor context by module id.
    modules: HashMap<u32, ModuleContext>,
    instances: Vec<AlarmInstance>,
    next_instance_id: u64,
    /// Instance ids touched since the last store flush.
    dirty: Vec<u64>,
}

impl AlarmEngine {
    pub fn new(rules: Vec<AlarmRule>, modules: HashMap<u32, ModuleContext>) -> Self {
        let mut engine = Self {
            rules: Vec::new(),
            modules,
            instances: Vec::new(),
            next_instance_id: 1,
            dirty: Vec::new(),
        };
        engine.set_rules(rules);
        engine
    }

    /// Replace the rule set. Takes effect on the next evaluation; state
    /// is preserved for rule ids that survive the edit.
    pub fn set_rules(&mut self, mut rules: Vec<AlarmRule>) {
        rules.sort_by_key(|r| r.id);
        let mut old_states: HashMap<u32, (RuleState, Option<(f32, u64)>)> = self
            .rules
            .drain(..)
            .map(|rt| (rt.rule.id, (rt.state, rt.last_sample)))
            .collect();
        self.rules = rules
            .into_iter()
            .map(|rule| {
                let mut rt = RuleRuntime::new(rule);
                if let Some((state, last)) = old_states.remove(&rt.rule.id) {
                    rt.state = state;
                    rt.last_sample = last;
                }
                rt
            })
            .collect();
    }

    /// Evaluate every enabled rule against a snapshot. Returns the
    /// interlock requests issued this tick, in issue order.
    pub fn eval_tick(
        &mut self,
        snapshot: &HashMap<u32, Reading>,
        now_s: u64,
    ) -> Vec<InterlockRequest> {
        let mut requests = Vec::new();

        for idx in 0..self.rules.len() {
            let (rule_id, module_id, enabled) = {
                let rt = &self.rules[idx];
                (rt.rule.id, rt.rule.module_id, rt.rule.enabled)
            };
            if !enabled {
                continue;
            }
            let Some(reading) = snapshot.get(&module_id) else {
                continue;
            };
            let span = self
                .modules
                .get(&module_id)
                .and_then(|ctx| ctx.span);

            let rt = &mut self.rules[idx];
            let Some(v) = rt.evaluated_value(reading) else {
                continue;
            };
            let (previous, next) = rt.step(v, span);

            if previous == next {
                continue;
            }
            debug!(rule = rule_id, ?previous, ?next, value = v, "rule transition");

            if !previous.alarmed() && next.alarmed() {
                self.raise(idx, v, next, now_s);
                let rt = &self.rules[idx];
                if let Some(il) = rt.rule.interlock {
                    requests.push(InterlockRequest {
                        rule_id,
                        severity: rt.rule.severity,
                        target_slot: il.target_slot,
                        command: InterlockCommand::apply(il.action),
                    });
                }
            } else if previous.alarmed() && !next.alarmed() {
                let rt = &self.rules[idx];
                let auto_clear = rt.rule.auto_clear;
                let interlock = rt.rule.interlock;
                let severity = rt.rule.severity;
                if auto_clear {
                    self.clear_rule_instances(rule_id, now_s);
                }
                if let Some(il) = interlock {
                    if il.release_on_clear {
                        requests.push(InterlockRequest {
                            rule_id,
                            severity,
                            target_slot: il.target_slot,
                            command: InterlockCommand::RestoreSafe,
                        });
                    }
                }
            }
        }
        requests
    }

    /// Raise one instance for a rule, honouring the one-open-per-rule
    /// cap.
    fn raise(&mut self, rule_idx: usize, value: f32, state: RuleState, now_s: u64) {
        let rt = &self.rules[rule_idx];
        let rule = &rt.rule;
        if self
            .instances
            .iter()
            .any(|i| i.rule_id == rule.id && i.is_open())
        {
            return;
        }

        let ctx = self.modules.get(&rule.module_id);
        let sensor = ctx.map_or("?", |c| c.name.as_str());
        let unit = ctx.map_or("", |c| c.unit.as_str());
        let message = format!(
            "{}: {} = {value:.2}{unit}{}",
            rule.name,
            sensor,
            match state {
                RuleState::HighHigh => " (critical high)",
                RuleState::LowLow => " (critical low)",
                RuleState::High => " (high)",
                RuleState::Low => " (low)",
                RuleState::Normal => "",
            }
        );

        let instance = AlarmInstance {
            id: self.next_instance_id,
            rule_id: rule.id,
            module_id: rule.module_id,
            severity: rule.severity,
            state: AlarmState::Active,
            raised_at: now_s,
            acknowledged_at: None,
            cleared_at: None,
            acknowledged_by: None,
            message,
            trigger_value: value,
        };
        info!(alarm = instance.id, rule = rule.id, "alarm raised: {}", instance.message);
        self.next_instance_id += 1;
        self.dirty.push(instance.id);
        self.instances.push(instance);
    }

    /// Clear all open instances of a rule.
    fn clear_rule_instances(&mut self, rule_id: u32, now_s: u64) {
        for instance in &mut self.instances {
            if instance.rule_id == rule_id && instance.is_open() {
                let _ = instance.clear(now_s);
                self.dirty.push(instance.id);
                info!(alarm = instance.id, rule = rule_id, "alarm cleared");
            }
        }
    }

    /// Operator acknowledge: active → acknowledged only.
    pub fn acknowledge(&mut self, instance_id: u64, by: &str, now_s: u64) -> RtuResult<()> {
        let instance = self
            .instances
            .iter_mut()
            .find(|i| i.id == instance_id)
            .ok_or_else(|| RtuError::NotFound(format!("alarm instance {instance_id}")))?;
        instance.acknowledge(by, now_s)?;
        self.dirty.push(instance_id);
        Ok(())
    }

    /// Operator clear.
    pub fn clear(&mut self, instance_id: u64, now_s: u64) -> RtuResult<()> {
        let instance = self
            .instances
            .iter_mut()
            .find(|i| i.id == instance_id)
            .ok_or_else(|| RtuError::NotFound(format!("alarm instance {instance_id}")))?;
        instance.clear(now_s)?;
        self.dirty.push(instance_id);
        Ok(())
    }

    /// Drop cleared instances older than the retention window.
    pub fn gc(&mut self, now_s: u64, retention_days: u32) -> usize {
        let cutoff = now_s.saturating_sub(u64::from(retention_days) * 86_400);
        let before = self.instances.len();
        self.instances.retain(|i| match (i.state, i.cleared_at) {
            (AlarmState::Cleared, Some(cleared_at)) => cleared_at >= cutoff,
            _ => true,
        });
        before - self.instances.len()
    }

    /// All instances, newest last.
    pub fn instances(&self) -> &[AlarmInstance] {
        &self.instances
    }

    /// Instances touched since the last call, for the store flush.
    pub fn take_dirty(&mut self) -> Vec<AlarmInstance> {
        let mut ids: Vec<u64> = std::mem::take(&mut self.dirty);
        ids.sort_unstable();
        ids.dedup();
        ids.iter()
            .filter_map(|id| self.instances.iter().find(|i| i.id == *id).cloned())
            .collect()
    }

    /// Current state of one rule, for diagnostics.
    pub fn rule_state(&self, rule_id: u32) -> Option<RuleState> {
        self.rules
            .iter()
            .find(|rt| rt.rule.id == rule_id)
            .map(|rt| rt.state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wt_common::model::{Interlock, InterlockAction, SensorStatus, Severity};

    fn reading(value: f32, ts_ms: u64) -> Reading {
        Reading {
            value,
            status: SensorStatus::Ok,
            ts_ms,
        }
    }

    fn ph_context() -> HashMap<u32, ModuleContext> {
        let mut modules = HashMap::new();
        modules.insert(
            1,
            ModuleContext {
                name: "ph_reactor".to_string(),
                unit: "pH".to_string(),
                span: Some(14.0),
            },
        );
        modules
    }

    fn above_rule(high: f32, hysteresis_pct: u8) -> AlarmRule {
        AlarmRule {
            id: 1,
            module_id: 1,
            name: "ph_high".to_string(),
            condition: AlarmCondition::Above,
            threshold_low: None,
            threshold_high: Some(high),
            critical_low: None,
            critical_high: None,
            severity: Severity::High,
            hysteresis_pct,
            auto_clear: true,
            enabled: true,
            interlock: None,
        }
    }

    fn snapshot(value: f32, ts_ms: u64) -> HashMap<u32, Reading> {
        let mut snap = HashMap::new();
        snap.insert(1, reading(value, ts_ms));
        snap
    }

    #[test]
    fn hysteresis_trace_matches_expected_states() {
        // high = 8.0, hysteresis 10% of span 14 → band 1.4.
        let mut engine = AlarmEngine::new(vec![above_rule(8.0, 10)], ph_context());

        let expected = [
            (7.5, RuleState::Normal),
            (8.1, RuleState::High),
            (7.2, RuleState::High),   // 7.2 ≥ 8.0 − 1.4
            (6.5, RuleState::Normal), // 6.5 < 6.6 clears
        ];
        for (i, (value, state)) in expected.iter().enumerate() {
            engine.eval_tick(&snapshot(*value, i as u64 * 1000), 100 + i as u64);
            assert_eq!(engine.rule_state(1).unwrap(), *state, "at value {value}");
        }
    }

    #[test]
    fn zero_hysteresis_is_a_plain_threshold() {
        let mut engine = AlarmEngine::new(vec![above_rule(8.0, 0)], ph_context());

        engine.eval_tick(&snapshot(8.0, 0), 1);
        assert_eq!(engine.rule_state(1).unwrap(), RuleState::High);
        engine.eval_tick(&snapshot(7.999, 1000), 2);
        assert_eq!(engine.rule_state(1).unwrap(), RuleState::Normal);
    }

    #[test]
    fn raise_and_auto_clear_lifecycle() {
        let mut engine = AlarmEngine::new(vec![above_rule(8.0, 10)], ph_context());

        engine.eval_tick(&snapshot(8.5, 0), 100);
        assert_eq!(engine.instances().len(), 1);
        let instance = &engine.instances()[0];
        assert_eq!(instance.state, AlarmState::Active);
        assert_eq!(instance.trigger_value, 8.5);
        assert_eq!(instance.raised_at, 100);
        assert!(instance.message.contains("ph_high"));

        // Still tripped: no second instance.
        engine.eval_tick(&snapshot(8.4, 1000), 101);
        assert_eq!(engine.instances().len(), 1);

        // Clear.
        engine.eval_tick(&snapshot(5.0, 2000), 102);
        assert_eq!(engine.instances()[0].state, AlarmState::Cleared);
        assert_eq!(engine.instances()[0].cleared_at, Some(102));

        // Re-trip raises a fresh instance.
        engine.eval_tick(&snapshot(9.0, 3000), 103);
        assert_eq!(engine.instances().len(), 2);
    }

    #[test]
    fn at_most_one_open_instance_per_rule() {
        let mut rule = above_rule(8.0, 0);
        rule.auto_clear = false;
        let mut engine = AlarmEngine::new(vec![rule], ph_context());

        engine.eval_tick(&snapshot(9.0, 0), 1);
        engine.eval_tick(&snapshot(5.0, 1000), 2); // back to normal, no auto-clear
        engine.eval_tick(&snapshot(9.0, 2000), 3); // trips again

        // The first instance is still open, so no second raise.
        assert_eq!(engine.instances().len(), 1);
        assert!(engine.instances()[0].is_open());
    }

    #[test]
    fn critical_bounds_trip_without_hysteresis() {
        let mut rule = above_rule(8.0, 10);
        rule.critical_high = Some(10.0);
        let mut engine = AlarmEngine::new(vec![rule], ph_context());

        engine.eval_tick(&snapshot(10.0, 0), 1);
        assert_eq!(engine.rule_state(1).unwrap(), RuleState::HighHigh);

        // Just below critical falls back to the hysteresis path → High.
        engine.eval_tick(&snapshot(9.9, 1000), 2);
        assert_eq!(engine.rule_state(1).unwrap(), RuleState::High);
    }

    #[test]
    fn below_rule_symmetry() {
        let rule = AlarmRule {
            condition: AlarmCondition::Below,
            threshold_low: Some(6.0),
            threshold_high: None,
            ..above_rule(0.0, 10)
        };
        let mut engine = AlarmEngine::new(vec![rule], ph_context());

        engine.eval_tick(&snapshot(6.5, 0), 1);
        assert_eq!(engine.rule_state(1).unwrap(), RuleState::Normal);
        engine.eval_tick(&snapshot(6.0, 1000), 2);
        assert_eq!(engine.rule_state(1).unwrap(), RuleState::Low);
        // Band 1.4: stays low until above 7.4.
        engine.eval_tick(&snapshot(7.3, 2000), 3);
        assert_eq!(engine.rule_state(1).unwrap(), RuleState::Low);
        engine.eval_tick(&snapshot(7.5, 3000), 4);
        assert_eq!(engine.rule_state(1).unwrap(), RuleState::Normal);
    }

    #[test]
    fn rate_of_change_uses_per_second_delta() {
        let rule = AlarmRule {
            condition: AlarmCondition::RateOfChange,
            threshold_high: Some(2.0),
            hysteresis_pct: 0,
            ..above_rule(0.0, 0)
        };
        let mut engine = AlarmEngine::new(vec![rule], ph_context());

        // First sample only seeds.
        engine.eval_tick(&snapshot(5.0, 0), 1);
        assert_eq!(engine.rule_state(1).unwrap(), RuleState::Normal);
        // +1.0 over 1 s → 1.0/s, below threshold.
        engine.eval_tick(&snapshot(6.0, 1000), 2);
        assert_eq!(engine.rule_state(1).unwrap(), RuleState::Normal);
        // −3.0 over 1 s → |−3.0| ≥ 2.0 → trips.
        engine.eval_tick(&snapshot(3.0, 2000), 3);
        assert_eq!(engine.rule_state(1).unwrap(), RuleState::High);
    }

    #[test]
    fn interlock_issued_on_raise_and_release_on_clear() {
        let mut rule = above_rule(8.0, 10);
        rule.interlock = Some(Interlock {
            target_slot: 10,
            action: InterlockAction::ForceOff,
            release_on_clear: true,
        });
        let mut engine = AlarmEngine::new(vec![rule], ph_context());

        let reqs = engine.eval_tick(&snapshot(8.5, 0), 1);
        assert_eq!(reqs.len(), 1);
        assert_eq!(reqs[0].target_slot, 10);
        assert!(matches!(reqs[0].command, InterlockCommand::Apply(_)));

        // While tripped, nothing new.
        assert!(engine.eval_tick(&snapshot(8.4, 1000), 2).is_empty());

        let reqs = engine.eval_tick(&snapshot(5.0, 2000), 3);
        assert_eq!(reqs.len(), 1);
        assert!(matches!(reqs[0].command, InterlockCommand::RestoreSafe));
    }

    #[test]
    fn acknowledge_does_not_clear() {
        let mut engine = AlarmEngine::new(vec![above_rule(8.0, 0)], ph_context());
        engine.eval_tick(&snapshot(9.0, 0), 1);
        let id = engine.instances()[0].id;

        engine.acknowledge(id, "operator", 2).unwrap();
        assert_eq!(engine.instances()[0].state, AlarmState::Acknowledged);
        assert!(engine.instances()[0].is_open());
        assert_eq!(
            engine.instances()[0].acknowledged_by.as_deref(),
            Some("operator")
        );
    }

    #[test]
    fn gc_drops_only_old_cleared_instances() {
        let mut engine = AlarmEngine::new(vec![above_rule(8.0, 0)], ph_context());
        engine.eval_tick(&snapshot(9.0, 0), 1_000);
        engine.eval_tick(&snapshot(5.0, 1000), 2_000);
        engine.eval_tick(&snapshot(9.0, 2000), 500_000);

        assert_eq!(engine.instances().len(), 2);

        // Retention 1 day; now = cleared_at + just over a day.
        let dropped = engine.gc(2_000 + 86_401, 1);
        assert_eq!(dropped, 1);
        // The open instance survives regardless of age.
        assert_eq!(engine.instances().len(), 1);
        assert!(engine.instances()[0].is_open());
    }

    #[test]
    fn disabled_rules_are_skipped() {
        let mut rule = above_rule(8.0, 0);
        rule.enabled = false;
        let mut engine = AlarmEngine::new(vec![rule], ph_context());
        engine.eval_tick(&snapshot(9.0, 0), 1);
        assert!(engine.instances().is_empty());
    }

    #[test]
    fn dirty_tracking_feeds_the_store_flush() {
        let mut engine = AlarmEngine::new(vec![above_rule(8.0, 0)], ph_context());
        engine.eval_tick(&snapshot(9.0, 0), 1);

        let dirty = engine.take_dirty();
        assert_eq!(dirty.len(), 1);
        // Drained: second call is empty until something changes.
        assert!(engine.take_dirty().is_empty());

        engine.eval_tick(&snapshot(5.0, 1000), 2);
        assert_eq!(engine.take_dirty().len(), 1);
    }
}
