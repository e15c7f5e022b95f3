//! WT-RTU Persistent Store
//!
//! Relational table model for configuration and alarm history:
//! `users`, `modules`, `physical_sensors`, `adc_sensors`, `actuators`,
//! `alarm_rules`, `alarm_history`. All numeric columns are integers and
//! doubles; timestamps are UNIX epoch seconds.
//!
//! The store is only touched outside the tick (startup load,
//! configuration edits and the periodic alarm-history flush), under one
//! coarse lock. Conflict detection (unique names, unique slots,
//! pin-in-use) is enforced here, in code, not by schema constraints.
//!
//! The real SQLite binding is an external collaborator; this crate owns
//! the schema contract and the CRUD surface over a single-file backend.

pub mod tables;

use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use tracing::{info, warn};

use wt_common::error::{RtuError, RtuResult};
use wt_common::model::{Actuator, AlarmInstance, AlarmRule, Interface, SensorModule};

use crate::tables::{Database, SCHEMA_VERSION, UserRow};

/// Alarm-history write retry attempts before dropping.
const HISTORY_RETRIES: u32 = 3;
/// Base backoff between history-write retries.
const HISTORY_BACKOFF: Duration = Duration::from_millis(50);

/// The persistent store: one coarse lock over the database file.
pub struct Store {
    path: PathBuf,
    db: Mutex<Database>,
}

impl Store {
    /// Open an existing store file.
    pub fn open(path: &Path) -> RtuResult<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                RtuError::NotFound(format!("store file {}", path.display()))
            } else {
                RtuError::Io(format!("{}: {e}", path.display()))
            }
        })?;
        let db: Database = serde_json::from_str(&text)
            .map_err(|e| RtuError::Io(format!("{}: corrupt store: {e}", path.display())))?;
        if db.version > SCHEMA_VERSION {
            return Err(RtuError::NotSupported(format!(
                "store schema version {} is newer than supported {}",
                db.version, SCHEMA_VERSION
            )));
        }
        Ok(Self {
            path: path.to_path_buf(),
            db: Mutex::new(db),
        })
    }

    /// Create or upgrade the store file (the `db-migrate` path).
    /// Idempotent: an up-to-date store is left untouched.
    pub fn migrate(path: &Path) -> RtuResult<Self> {
        match Self::open(path) {
            Ok(store) => {
                let mut db = store.db.lock().expect("store lock poisoned");
                if db.version < SCHEMA_VERSION {
                    info!(
                        from = db.version,
                        to = SCHEMA_VERSION,
                        "migrating store schema"
                    );
                    db.version = SCHEMA_VERSION;
                    Self::persist(&store.path, &db)?;
                }
                drop(db);
                Ok(store)
            }
            Err(RtuError::NotFound(_)) => {
                if let Some(parent) = path.parent() {
                    std::fs::create_dir_all(parent)
                        .map_err(|e| RtuError::Io(format!("{}: {e}", parent.display())))?;
                }
                let db = Database::empty();
                Self::persist(path, &db)?;
                info!(path = %path.display(), "created empty store");
                Ok(Self {
                    path: path.to_path_buf(),
                    db: Mutex::new(db),
                })
            }
            Err(e) => Err(e),
        }
    }

    /// Write the database atomically: temp file then rename.
    fn persist(path: &Path, db: &Database) -> RtuResult<()> {
        let text = serde_json::to_string_pretty(db)
            .map_err(|e| RtuError::Io(format!("serialise store: {e}")))?;
        let tmp = path.with_extension("tmp");
        std::fs::write(&tmp, text).map_err(|e| RtuError::Io(format!("{}: {e}", tmp.display())))?;
        std::fs::rename(&tmp, path)
            .map_err(|e| RtuError::Io(format!("{}: {e}", path.display())))?;
        Ok(())
    }

    fn with_db<T>(
        &self,
        mutate: impl FnOnce(&mut Database) -> RtuResult<T>,
    ) -> RtuResult<T> {
        let mut db = self.db.lock().expect("store lock poisoned");
        let result = mutate(&mut db)?;
        Self::persist(&self.path, &db)?;
        Ok(result)
    }

    // ─── Conflict checks ────────────────────────────────────────────

    /// Unique-name check across sensors and actuators.
    fn check_name(db: &Database, name: &str, skip_module: Option<u32>, skip_actuator: Option<u32>) -> RtuResult<()> {
        if let Some(owner) = db
            .modules
            .iter()
            .find(|m| m.name == name && Some(m.id) != skip_module)
        {
            return Err(RtuError::AlreadyExists(owner.name.clone()));
        }
        if let Some(owner) = db
            .actuators
            .iter()
            .find(|a| a.name == name && Some(a.id) != skip_actuator)
        {
            return Err(RtuError::AlreadyExists(owner.name.clone()));
        }
        Ok(())
    }

    /// Pin-in-use check across GPIO sensors and actuators.
    fn check_pin(db: &Database, chip: &str, pin: u32, skip_module: Option<u32>, skip_actuator: Option<u32>) -> RtuResult<()> {
        for physical in &db.physical_sensors {
            if physical.interface == Interface::Gpio
                && physical.address == chip
                && u32::from(physical.channel) == pin
                && Some(physical.module_id) != skip_module
            {
                let owner = db
                    .modules
                    .iter()
                    .find(|m| m.id == physical.module_id)
                    .map_or_else(|| format!("module {}", physical.module_id), |m| m.name.clone());
                return Err(RtuError::AlreadyExists(owner));
            }
        }
        if let Some(owner) = db
            .actuators
            .iter()
            .find(|a| a.chip == chip && a.pin == pin && Some(a.id) != skip_actuator)
        {
            return Err(RtuError::AlreadyExists(owner.name.clone()));
        }
        Ok(())
    }

    // ─── Sensors ────────────────────────────────────────────────────

    /// Insert a sensor module; id 0 assigns the next free id.
    pub fn insert_sensor(&self, mut module: SensorModule) -> RtuResult<SensorModule> {
        module.validate()?;
        self.with_db(|db| {
            Self::check_name(db, &module.name, None, None)?;
            if let Some(owner) = db
                .modules
                .iter()
                .find(|m| m.slot == module.slot)
            {
                return Err(RtuError::AlreadyExists(owner.name.clone()));
            }
            if let Some(hw) = &module.hardware {
                if hw.interface == Interface::Gpio {
                    Self::check_pin(db, &hw.address, u32::from(hw.channel), None, None)?;
                }
            }
            if module.id == 0 {
                module.id = db.next_module_id();
            } else if db.modules.iter().any(|m| m.id == module.id) {
                return Err(RtuError::AlreadyExists(format!("module id {}", module.id)));
            }
            db.push_sensor(&module);
            Ok(module.clone())
        })
    }

    /// Replace a sensor module by id.
    pub fn update_sensor(&self, module: SensorModule) -> RtuResult<()> {
        module.validate()?;
        self.with_db(|db| {
            if !db.modules.iter().any(|m| m.id == module.id) {
                return Err(RtuError::NotFound(format!("module id {}", module.id)));
            }
            Self::check_name(db, &module.name, Some(module.id), None)?;
            if let Some(owner) = db
                .modules
                .iter()
                .find(|m| m.slot == module.slot && m.id != module.id)
            {
                return Err(RtuError::AlreadyExists(owner.name.clone()));
            }
            if let Some(hw) = &module.hardware {
                if hw.interface == Interface::Gpio {
                    Self::check_pin(db, &hw.address, u32::from(hw.channel), Some(module.id), None)?;
                }
            }
            db.remove_sensor(module.id);
            db.push_sensor(&module);
            Ok(())
        })
    }

    /// Delete a sensor module and its subtable rows.
    pub fn delete_sensor(&self, module_id: u32) -> RtuResult<()> {
        self.with_db(|db| {
            if !db.modules.iter().any(|m| m.id == module_id) {
                return Err(RtuError::NotFound(format!("module id {module_id}")));
            }
            db.remove_sensor(module_id);
            db.alarm_rules.retain(|r| r.module_id != module_id);
            Ok(())
        })
    }

    /// Load every sensor module, joined across its subtables.
    pub fn load_sensors(&self) -> Vec<SensorModule> {
        let db = self.db.lock().expect("store lock poisoned");
        db.assemble_sensors()
    }

    // ─── Actuators ──────────────────────────────────────────────────

    /// Insert an actuator; id 0 assigns the next free id.
    pub fn insert_actuator(&self, mut actuator: Actuator) -> RtuResult<Actuator> {
        actuator.validate()?;
        self.with_db(|db| {
            Self::check_name(db, &actuator.name, None, None)?;
            if let Some(owner) = db
                .actuators
                .iter()
                .find(|a| a.slot == actuator.slot)
            {
                return Err(RtuError::AlreadyExists(owner.name.clone()));
            }
            Self::check_pin(db, &actuator.chip, actuator.pin, None, None)?;
            if actuator.id == 0 {
                actuator.id = db.next_actuator_id();
            } else if db.actuators.iter().any(|a| a.id == actuator.id) {
                return Err(RtuError::AlreadyExists(format!(
                    "actuator id {}",
                    actuator.id
                )));
            }
            db.actuators.push(actuator.clone());
            Ok(actuator.clone())
        })
    }

    /// Replace an actuator by id.
    pub fn update_actuator(&self, actuator: Actuator) -> RtuResult<()> {
        actuator.validate()?;
        self.with_db(|db| {
            if !db.actuators.iter().any(|a| a.id == actuator.id) {
                return Err(RtuError::NotFound(format!("actuator id {}", actuator.id)));
            }
            Self::check_name(db, &actuator.name, None, Some(actuator.id))?;
            if let Some(owner) = db
                .actuators
                .iter()
                .find(|a| a.slot == actuator.slot && a.id != actuator.id)
            {
                return Err(RtuError::AlreadyExists(owner.name.clone()));
            }
            Self::check_pin(db, &actuator.chip, actuator.pin, None, Some(actuator.id))?;
            db.actuators.retain(|a| a.id != actuator.id);
            db.actuators.push(actuator);
            Ok(())
        })
    }

    /// Delete an actuator.
    pub fn delete_actuator(&self, actuator_id: u32) -> RtuResult<()> {
        self.with_db(|db| {
            let before = db.actuators.len();
            db.actuators.retain(|a| a.id != actuator_id);
            if db.actuators.len() == before {
                return Err(RtuError::NotFound(format!("actuator id {actuator_id}")));
            }
            Ok(())
        })
    }

    /// Load every actuator.
    pub fn load_actuators(&self) -> Vec<Actuator> {
        self.db.lock().expect("store lock poisoned").actuators.clone()
    }

    // ─── Alarm rules ────────────────────────────────────────────────

    /// Insert an alarm rule; id 0 assigns the next free id.
    pub fn insert_alarm_rule(&self, mut rule: AlarmRule) -> RtuResult<AlarmRule> {
        rule.validate()?;
        self.with_db(|db| {
            if !db.modules.iter().any(|m| m.id == rule.module_id) {
                return Err(RtuError::NotFound(format!("module id {}", rule.module_id)));
            }
            if rule.id == 0 {
                rule.id = db.next_rule_id();
            } else if db.alarm_rules.iter().any(|r| r.id == rule.id) {
                return Err(RtuError::AlreadyExists(format!("rule id {}", rule.id)));
            }
            db.alarm_rules.push(rule.clone());
            Ok(rule.clone())
        })
    }

    /// Replace an alarm rule by id.
    pub fn update_alarm_rule(&self, rule: AlarmRule) -> RtuResult<()> {
        rule.validate()?;
        self.with_db(|db| {
            if !db.alarm_rules.iter().any(|r| r.id == rule.id) {
                return Err(RtuError::NotFound(format!("rule id {}", rule.id)));
            }
            db.alarm_rules.retain(|r| r.id != rule.id);
            db.alarm_rules.push(rule);
            Ok(())
        })
    }

    /// Delete an alarm rule.
    pub fn delete_alarm_rule(&self, rule_id: u32) -> RtuResult<()> {
        self.with_db(|db| {
            let before = db.alarm_rules.len();
            db.alarm_rules.retain(|r| r.id != rule_id);
            if db.alarm_rules.len() == before {
                return Err(RtuError::NotFound(format!("rule id {rule_id}")));
            }
            Ok(())
        })
    }

    /// Load every alarm rule.
    pub fn load_alarm_rules(&self) -> Vec<AlarmRule> {
        self.db.lock().expect("store lock poisoned").alarm_rules.clone()
    }

    // ─── Alarm history ──────────────────────────────────────────────

    /// Upsert a batch of alarm instances into the history table,
    /// retrying up to three times with backoff. Failures after the last
    /// attempt drop the batch to bound memory.
    pub fn flush_alarm_history(&self, instances: &[AlarmInstance]) {
        if instances.is_empty() {
            return;
        }
        for attempt in 1..=HISTORY_RETRIES {
            let result = self.with_db(|db| {
                for instance in instances {
                    db.alarm_history.retain(|h| h.id != instance.id);
                    db.alarm_history.push(instance.clone());
                }
                Ok(())
            });
            match result {
                Ok(()) => return,
                Err(e) if attempt < HISTORY_RETRIES => {
                    warn!(attempt, "alarm-history flush failed, retrying: {e}");
                    std::thread::sleep(HISTORY_BACKOFF * attempt);
                }
                Err(e) => {
                    warn!(
                        dropped = instances.len(),
                        "alarm-history flush failed after {HISTORY_RETRIES} attempts, \
                         dropping batch: {e}"
                    );
                }
            }
        }
    }

    /// Delete cleared history rows older than the retention cutoff.
    pub fn gc_alarm_history(&self, now_s: u64, retention_days: u32) -> RtuResult<usize> {
        let cutoff = now_s.saturating_sub(u64::from(retention_days) * 86_400);
        self.with_db(|db| {
            let before = db.alarm_history.len();
            db.alarm_history.retain(|h| match h.cleared_at {
                Some(cleared_at) => cleared_at >= cutoff,
                None => true,
            });
            Ok(before - db.alarm_history.len())
        })
    }

    /// Load the alarm history.
    pub fn load_alarm_history(&self) -> Vec<AlarmInstance> {
        self.db.lock().expect("store lock poisoned").alarm_history.clone()
    }

    // ─── Users ──────────────────────────────────────────────────────

    /// Insert a user row. The core only stores it; authentication is an
    /// external collaborator.
    pub fn insert_user(&self, mut user: UserRow) -> RtuResult<UserRow> {
        self.with_db(|db| {
            if db.users.iter().any(|u| u.username == user.username) {
                return Err(RtuError::AlreadyExists(user.username.clone()));
            }
            if user.id == 0 {
                user.id = db.users.iter().map(|u| u.id).max().unwrap_or(0) + 1;
            }
            db.users.push(user.clone());
            Ok(user.clone())
        })
    }

    /// Look up a user by name.
    pub fn find_user(&self, username: &str) -> Option<UserRow> {
        self.db
            .lock()
            .expect("store lock poisoned")
            .users
            .iter()
            .find(|u| u.username == username)
            .cloned()
    }
}
