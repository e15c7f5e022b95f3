//! 1-Wire device enumeration and temperature reads.
//!
//! Devices appear under `/sys/bus/w1/devices` as `FF-XXXXXXXXXXXX`
//! directories where `FF` is the hex family code. Family codes 0x28
//! (DS18B20), 0x10 (DS18S20), 0x22 (DS1822) and 0x42 (DS28EA00) are
//! temperature variants. Discovery opportunistically reads the current
//! temperature of each variant through a snapshot cache so repeated
//! discovery calls do not trigger a ~750 ms conversion each time.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use wt_common::error::{RtuError, RtuResult};

/// Temperature-capable family codes.
pub const TEMP_FAMILIES: &[u8] = &[0x28, 0x10, 0x22, 0x42];

/// Snapshot refresh interval for discovery reads.
pub const SNAPSHOT_TTL: Duration = Duration::from_secs(30);

const W1_DEVICES_DIR: &str = "sys/bus/w1/devices";

/// One enumerated 1-Wire device.
#[derive(Debug, Clone, PartialEq)]
pub struct OneWireDevice {
    /// Full device id, e.g. `28-00000a1b2c3d`.
    pub id: String,
    /// Family code parsed from the first two hex digits.
    pub family: u8,
    /// Whether the family is a temperature variant.
    pub is_temperature: bool,
    /// Cached temperature [°C], when available.
    pub temperature: Option<f32>,
}

#[derive(Debug, Clone, Copy)]
struct CachedTemp {
    value: f32,
    read_at: Instant,
}

/// 1-Wire enumerator with a temperature snapshot cache.
pub struct OneWireBus {
    root: PathBuf,
    cache: Mutex<HashMap<String, CachedTemp>>,
}

impl OneWireBus {
    /// Enumerator over the standard sysfs mount.
    pub fn new() -> Self {
        Self::with_root(Path::new("/"))
    }

    /// Enumerator over an alternate root, for tests.
    pub fn with_root(root: &Path) -> Self {
        Self {
            root: root.to_path_buf(),
            cache: Mutex::new(HashMap::new()),
        }
    }

    fn devices_dir(&self) -> PathBuf {
        self.root.join(W1_DEVICES_DIR)
    }

    /// List devices, reading temperatures opportunistically through the
    /// snapshot cache. A masterless system returns an empty list.
    pub fn enumerate(&self) -> Vec<OneWireDevice> {
        let Ok(entries) = std::fs::read_dir(self.devices_dir()) else {
            return Vec::new();
        };

        let mut devices = Vec::new();
        for entry in entries.flatten() {
            let id = entry.file_name().to_string_lossy().to_string();
            let Some(family) = parse_family(&id) else {
                continue; // bus master nodes and malformed ids
            };
            let is_temperature = TEMP_FAMILIES.contains(&family);
            let temperature = if is_temperature {
                self.cached_temperature(&id).ok()
            } else {
                None
            };
            devices.push(OneWireDevice {
                id,
                family,
                is_temperature,
                temperature,
            });
        }
        devices.sort_by(|a, b| a.id.cmp(&b.id));
        devices
    }

    /// Read one device's temperature, preferring a snapshot younger than
    /// [`SNAPSHOT_TTL`].
    pub fn cached_temperature(&self, id: &str) -> RtuResult<f32> {
        {
            let cache = self.cache.lock().expect("w1 cache lock poisoned");
            if let Some(hit) = cache.get(id) {
                if hit.read_at.elapsed() < SNAPSHOT_TTL {
                    return Ok(hit.value);
                }
            }
        }
        let value = self.read_temperature(id)?;
        self.cache.lock().expect("w1 cache lock poisoned").insert(
            id.to_string(),
            CachedTemp {
                value,
                read_at: Instant::now(),
            },
        );
        Ok(value)
    }

    /// Read one device's temperature directly (blocking conversion).
    pub fn read_temperature(&self, id: &str) -> RtuResult<f32> {
        let path = self.devices_dir().join(id).join("w1_slave");
        let text = std::fs::read_to_string(&path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                RtuError::NotFound(format!("1-Wire device {id}"))
            } else {
                RtuError::Io(format!("{}: {e}", path.display()))
            }
        })?;
        parse_w1_slave(&text)
            .ok_or_else(|| RtuError::Io(format!("1-Wire device {id}: bad w1_slave payload")))
    }
}

impl Default for OneWireBus {
    fn default() -> Self {
        Self::new()
    }
}

/// Parse the family code from a device id (`28-00000a1b2c3d` → 0x28).
pub fn parse_family(id: &str) -> Option<u8> {
    let (family, rest) = id.split_once('-')?;
    if family.len() != 2 || rest.is_empty() {
        return None;
    }
    u8::from_str_radix(family, 16).ok()
}

/// Parse a `w1_slave` payload. Requires a passing CRC line and a
/// `t=` milli-degree field.
fn parse_w1_slave(text: &str) -> Option<f32> {
    let mut lines = text.lines();
    let crc_line = lines.next()?;
    if !crc_line.trim_end().ends_with("YES") {
        return None;
    }
    let data_line = lines.next()?;
    let (_, milli) = data_line.rsplit_once("t=")?;
    let milli: i32 = milli.trim().parse().ok()?;
    Some(milli as f32 / 1000.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn fake_bus(devices: &[(&str, &str)]) -> (TempDir, OneWireBus) {
        let dir = TempDir::new().unwrap();
        for (id, payload) in devices {
            let dev = dir.path().join(W1_DEVICES_DIR).join(id);
            fs::create_dir_all(&dev).unwrap();
            fs::write(dev.join("w1_slave"), payload).unwrap();
        }
        let bus = OneWireBus::with_root(dir.path());
        (dir, bus)
    }

    const GOOD_PAYLOAD: &str =
        "4b 46 7f ff 0c 10 1c : crc=1c YES\n4b 46 7f ff 0c 10 1c t=23062\n";

    #[test]
    fn family_code_parsing() {
        assert_eq!(parse_family("28-00000a1b2c3d"), Some(0x28));
        assert_eq!(parse_family("10-deadbeef"), Some(0x10));
        assert_eq!(parse_family("w1_bus_master1"), None);
        assert_eq!(parse_family("zz-123"), None);
    }

    #[test]
    fn enumeration_classifies_temperature_families() {
        let (_dir, bus) = fake_bus(&[
            ("28-00000a1b2c3d", GOOD_PAYLOAD),
            ("3a-000000111111", GOOD_PAYLOAD),
        ]);

        let devices = bus.enumerate();
        assert_eq!(devices.len(), 2);
        let ds18b20 = devices.iter().find(|d| d.family == 0x28).unwrap();
        assert!(ds18b20.is_temperature);
        assert_eq!(ds18b20.temperature, Some(23.062));

        let other = devices.iter().find(|d| d.family == 0x3a).unwrap();
        assert!(!other.is_temperature);
        assert!(other.temperature.is_none());
    }

    #[test]
    fn failed_crc_rejected() {
        let payload = "4b 46 7f ff 0c 10 1c : crc=1c NO\n4b 46 7f ff 0c 10 1c t=23062\n";
        let (_dir, bus) = fake_bus(&[("28-0000aaaaaaaa", payload)]);
        assert!(bus.read_temperature("28-0000aaaaaaaa").is_err());
    }

    #[test]
    fn negative_temperatures_parse() {
        let payload = "aa bb : crc=00 YES\naa bb t=-1250\n";
        let (_dir, bus) = fake_bus(&[("28-0000bbbbbbbb", payload)]);
        assert_eq!(bus.read_temperature("28-0000bbbbbbbb").unwrap(), -1.25);
    }

    #[test]
    fn snapshot_cache_serves_repeat_reads() {
        let (dir, bus) = fake_bus(&[("28-0000cccccccc", GOOD_PAYLOAD)]);
        assert_eq!(bus.cached_temperature("28-0000cccccccc").unwrap(), 23.062);

        // Remove the backing file; the cache still answers inside the TTL.
        fs::remove_file(
            dir.path()
                .join(W1_DEVICES_DIR)
                .join("28-0000cccccccc/w1_slave"),
        )
        .unwrap();
        assert_eq!(bus.cached_temperature("28-0000cccccccc").unwrap(), 23.062);
    }

    #[test]
    fn missing_device_is_not_found() {
        let (_dir, bus) = fake_bus(&[]);
        assert!(matches!(
            bus.read_temperature("28-0000dddddddd"),
            Err(RtuError::NotFound(_))
        ));
    }
}
