//! Table row types and the in-memory database image.
//!
//! Rows mirror the relational schema: `modules` carries the common
//! sensor identity, `physical_sensors` and `adc_sensors` the
//! interface-specific columns keyed by `module_id`. The store joins
//! them back into [`SensorModule`] values on load. Timestamps
//! everywhere are UNIX epoch seconds.

use serde::{Deserialize, Serialize};

use wt_common::calibration::Calibration;
use wt_common::model::{
    Actuator, AlarmInstance, AlarmRule, HardwareBinding, Interface, ModuleType, SensorModule,
};

/// Current schema version written by `db-migrate`.
pub const SCHEMA_VERSION: u32 = 1;

/// `users` table row. Authentication itself is an external concern;
/// the core only stores and uniquifies these.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserRow {
    pub id: u32,
    pub username: String,
    pub role: String,
    pub password_hash: String,
    /// Epoch seconds.
    pub created_at: u64,
}

/// `modules` table row: identity and pipeline configuration common to
/// every sensor kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModuleRow {
    pub id: u32,
    pub name: String,
    pub slot: u16,
    pub subslot: u16,
    pub module_type: ModuleType,
    pub poll_period_ms: u32,
    pub unit: String,
    pub range_min: Option<f32>,
    pub range_max: Option<f32>,
    pub calibration: Calibration,
    pub filter_alpha: f32,
    pub enabled: bool,
    pub expression: Option<String>,
    pub static_value: Option<f32>,
}

/// `physical_sensors` table row: hardware binding for non-ADC modules.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhysicalSensorRow {
    pub module_id: u32,
    pub interface: Interface,
    pub bus: u8,
    pub address: String,
    pub channel: u8,
    pub counter: bool,
}

/// `adc_sensors` table row: ADC-channel binding.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdcSensorRow {
    pub module_id: u32,
    pub interface: Interface,
    pub bus: u8,
    pub address: String,
    pub channel: u8,
    pub gain: Option<f32>,
    pub vref: Option<f32>,
}

/// The full database image persisted to the store file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Database {
    pub version: u32,
    pub users: Vec<UserRow>,
    pub modules: Vec<ModuleRow>,
    pub physical_sensors: Vec<PhysicalSensorRow>,
    pub adc_sensors: Vec<AdcSensorRow>,
    pub actuators: Vec<Actuator>,
    pub alarm_rules: Vec<AlarmRule>,
    pub alarm_history: Vec<AlarmInstance>,
}

impl Database {
    /// Empty database at the current schema version.
    pub fn empty() -> Self {
        Self {
            version: SCHEMA_VERSION,
            users: Vec::new(),
            modules: Vec::new(),
            physical_sensors: Vec::new(),
            adc_sensors: Vec::new(),
            actuators: Vec::new(),
            alarm_rules: Vec::new(),
            alarm_history: Vec::new(),
        }
    }

    pub fn next_module_id(&self) -> u32 {
        self.modules.iter().map(|m| m.id).max().unwrap_or(0) + 1
    }

    pub fn next_actuator_id(&self) -> u32 {
        self.actuators.iter().map(|a| a.id).max().unwrap_or(0) + 1
    }

    pub fn next_rule_id(&self) -> u32 {
        self.alarm_rules.iter().map(|r| r.id).max().unwrap_or(0) + 1
    }

    /// Split a sensor module into its table rows and insert them.
    pub fn push_sensor(&mut self, module: &SensorModule) {
        self.modules.push(ModuleRow {
            id: module.id,
            name: module.name.clone(),
            slot: module.slot,
            subslot: module.subslot,
            module_type: module.module_type,
            poll_period_ms: module.poll_period_ms,
            unit: module.unit.clone(),
            range_min: module.range_min,
            range_max: module.range_max,
            calibration: module.calibration.clone(),
            filter_alpha: module.filter_alpha,
            enabled: module.enabled,
            expression: module.expression.clone(),
            static_value: module.static_value,
        });
        if let Some(hw) = &module.hardware {
            match module.module_type {
                ModuleType::Adc => self.adc_sensors.push(AdcSensorRow {
                    module_id: module.id,
                    interface: hw.interface,
                    bus: hw.bus,
                    address: hw.address.clone(),
                    channel: hw.channel,
                    gain: hw.adc_gain,
                    vref: hw.adc_vref,
                }),
                _ => self.physical_sensors.push(PhysicalSensorRow {
                    module_id: module.id,
                    interface: hw.interface,
                    bus: hw.bus,
                    address: hw.address.clone(),
                    channel: hw.channel,
                    counter: hw.counter,
                }),
            }
        }
    }

    /// Drop a sensor's rows from every table.
    pub fn remove_sensor(&mut self, module_id: u32) {
        self.modules.retain(|m| m.id != module_id);
        self.physical_sensors.retain(|p| p.module_id != module_id);
        self.adc_sensors.retain(|a| a.module_id != module_id);
    }

    /// Join the sensor tables back into module values, ordered by id.
    pub fn assemble_sensors(&self) -> Vec<SensorModule> {
        let mut sensors: Vec<SensorModule> = self
            .modules
            .iter()
            .map(|row| {
                let hardware = match row.module_type {
                    ModuleType::Adc => self
                        .adc_sensors
                        .iter()
                        .find(|a| a.module_id == row.id)
                        .map(|a| HardwareBinding {
                            interface: a.interface,
                            bus: a.bus,
                            address: a.address.clone(),
                            channel: a.channel,
                            counter: false,
                            adc_gain: a.gain,
                            adc_vref: a.vref,
                        }),
                    _ => self
                        .physical_sensors
                        .iter()
                        .find(|p| p.module_id == row.id)
                        .map(|p| HardwareBinding {
                            interface: p.interface,
                            bus: p.bus,
                            address: p.address.clone(),
                            channel: p.channel,
                            counter: p.counter,
                            adc_gain: None,
                            adc_vref: None,
                        }),
                };
                SensorModule {
                    id: row.id,
                    name: row.name.clone(),
                    slot: row.slot,
                    subslot: row.subslot,
                    module_type: row.module_type,
                    poll_period_ms: row.poll_period_ms,
                    unit: row.unit.clone(),
                    range_min: row.range_min,
                    range_max: row.range_max,
                    calibration: row.calibration.clone(),
                    filter_alpha: row.filter_alpha,
                    hardware,
                    expression: row.expression.clone(),
                    static_value: row.static_value,
                    enabled: row.enabled,
                }
            })
            .collect();
        sensors.sort_by_key(|s| s.id);
        sensors
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_database_is_current_version() {
        let db = Database::empty();
        assert_eq!(db.version, SCHEMA_VERSION);
        assert!(db.modules.is_empty());
    }

    #[test]
    fn id_assignment_skips_used_ids() {
        let mut db = Database::empty();
        assert_eq!(db.next_module_id(), 1);

        db.modules.push(ModuleRow {
            id: 5,
            name: "x".to_string(),
            slot: 1,
            subslot: 1,
            module_type: ModuleType::Static,
            poll_period_ms: 1000,
            unit: String::new(),
            range_min: None,
            range_max: None,
            calibration: Calibration::None,
            filter_alpha: 0.0,
            enabled: true,
            expression: None,
            static_value: Some(1.0),
        });
        assert_eq!(db.next_module_id(), 6);
    }

    #[test]
    fn adc_sensor_splits_into_adc_table() {
        let mut db = Database::empty();
        let module = SensorModule {
            id: 1,
            name: "ph".to_string(),
            slot: 1,
            subslot: 1,
            module_type: ModuleType::Adc,
            poll_period_ms: 1000,
            unit: "pH".to_string(),
            range_min: None,
            range_max: None,
            calibration: Calibration::None,
            filter_alpha: 0.0,
            hardware: Some(HardwareBinding {
                interface: Interface::I2c,
                bus: 1,
                address: "0x48".to_string(),
                channel: 2,
                counter: false,
                adc_gain: Some(1.0),
                adc_vref: Some(4.096),
            }),
            expression: None,
            static_value: None,
            enabled: true,
        };
        db.push_sensor(&module);

        assert_eq!(db.adc_sensors.len(), 1);
        assert!(db.physical_sensors.is_empty());
        assert_eq!(db.assemble_sensors()[0], module);

        db.remove_sensor(1);
        assert!(db.adc_sensors.is_empty());
        assert!(db.modules.is_empty());
    }
}
