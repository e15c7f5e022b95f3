//! `/dev/i2c-N` bus access and address probing.
//!
//! Transfers go through the kernel i2c-dev interface: `I2C_SLAVE` selects
//! the peer, plain `read`/`write` move bytes, and the SMBus ioctl carries
//! the probe transactions. The ioctls are wrapped with nix's ioctl
//! macros; `libc` supplies the raw C types of the SMBus argument block.
//! Probing walks the legal address range with a write-quick transaction,
//! falling back to read-byte where the adapter rejects quick writes; an
//! ACK is matched against the static device table.

use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::os::fd::AsRawFd;

use nix::errno::Errno;

use wt_common::error::{RtuError, RtuResult};

// i2c-dev ioctl numbers (linux/i2c-dev.h).
const I2C_SLAVE: libc::c_ulong = 0x0703;
const I2C_SMBUS: libc::c_ulong = 0x0720;

const I2C_SMBUS_WRITE: u8 = 0;
const I2C_SMBUS_READ: u8 = 1;
const I2C_SMBUS_QUICK: u32 = 0;
const I2C_SMBUS_BYTE: u32 = 1;

/// SMBus data block (linux/i2c.h `union i2c_smbus_data`).
#[repr(C)]
union SmbusData {
    byte: u8,
    word: u16,
    block: [u8; 34],
}

#[repr(C)]
struct SmbusIoctlData {
    read_write: u8,
    command: u8,
    size: u32,
    data: *mut SmbusData,
}

// i2c-dev predates the encoded-ioctl convention, hence the `_bad`
// variants with the literal request numbers.
mod ioctls {
    use super::{I2C_SLAVE, I2C_SMBUS, SmbusIoctlData};

    nix::ioctl_write_int_bad!(set_slave, I2C_SLAVE);
    nix::ioctl_readwrite_bad!(smbus_access, I2C_SMBUS, SmbusIoctlData);
}

/// First probe-able address.
pub const ADDR_MIN: u8 = 0x03;
/// Last probe-able address.
pub const ADDR_MAX: u8 = 0x77;

/// Reserved address ranges skipped by the probe walk.
const RESERVED: &[(u8, u8)] = &[(0x30, 0x37), (0x78, 0x7F)];

/// Device class of a known I²C chip.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceClass {
    Adc,
    TemperatureHumidity,
    Pressure,
    PhProbe,
    TurbidityProbe,
    Rtc,
    Imu,
    IoExpander,
    Display,
}

/// Static address → (class, display name) table. Addresses with several
/// candidates resolve to the first entry; disambiguation is a UI concern.
pub const KNOWN_DEVICES: &[(u8, DeviceClass, &str)] = &[
    (0x23, DeviceClass::TurbidityProbe, "BH1750 / turbidity frontend"),
    (0x27, DeviceClass::Display, "HD44780 I2C backpack"),
    (0x38, DeviceClass::TemperatureHumidity, "AHT20"),
    (0x40, DeviceClass::TemperatureHumidity, "HTU21D / SHT21"),
    (0x40, DeviceClass::Imu, "INA219 current monitor"),
    (0x44, DeviceClass::TemperatureHumidity, "SHT3x"),
    (0x48, DeviceClass::Adc, "ADS1115 / ADS1015"),
    (0x49, DeviceClass::Adc, "ADS1115 (addr pin high)"),
    (0x4A, DeviceClass::PhProbe, "pH interface board"),
    (0x4B, DeviceClass::Adc, "ADS1115 (addr pin SCL)"),
    (0x62, DeviceClass::PhProbe, "Atlas EZO pH"),
    (0x68, DeviceClass::Rtc, "DS3231 RTC"),
    (0x68, DeviceClass::Imu, "MPU6050"),
    (0x76, DeviceClass::Pressure, "BMP280 / BME280"),
    (0x77, DeviceClass::Pressure, "BMP280 / BME280 (alt)"),
];

/// One probe hit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeHit {
    pub bus: u8,
    pub address: u8,
    /// First matching table entry, if any.
    pub device: Option<(DeviceClass, &'static str)>,
}

/// An open i2c-dev bus.
pub struct I2cBus {
    file: File,
    bus: u8,
}

impl I2cBus {
    /// Open `/dev/i2c-{bus}`.
    pub fn open(bus: u8) -> RtuResult<Self> {
        let path = format!("/dev/i2c-{bus}");
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&path)
            .map_err(|e| {
                if e.kind() == std::io::ErrorKind::NotFound {
                    RtuError::NotFound(format!("I2C bus {path}"))
                } else {
                    RtuError::Io(format!("{path}: {e}"))
                }
            })?;
        Ok(Self { file, bus })
    }

    /// Bus index this handle is bound to.
    pub const fn bus(&self) -> u8 {
        self.bus
    }

    fn set_slave(&self, address: u8) -> RtuResult<()> {
        unsafe { ioctls::set_slave(self.file.as_raw_fd(), libc::c_int::from(address)) }
            .map(drop)
            .map_err(|e| {
                RtuError::Io(format!(
                    "i2c-{}: cannot select address 0x{address:02x}: {e}",
                    self.bus
                ))
            })
    }

    fn smbus(&self, read_write: u8, command: u8, size: u32) -> Result<SmbusData, Errno> {
        let mut data = SmbusData { block: [0; 34] };
        let mut args = SmbusIoctlData {
            read_write,
            command,
            size,
            data: &mut data,
        };
        unsafe { ioctls::smbus_access(self.file.as_raw_fd(), &mut args) }?;
        Ok(data)
    }

    /// Probe one address: write-quick, falling back to read-byte when the
    /// adapter rejects quick transactions. `true` means the address ACKed.
    pub fn probe(&self, address: u8) -> bool {
        if self.set_slave(address).is_err() {
            return false;
        }
        match self.smbus(I2C_SMBUS_WRITE, 0, I2C_SMBUS_QUICK) {
            Ok(_) => true,
            Err(Errno::EOPNOTSUPP | Errno::EINVAL) => {
                self.smbus(I2C_SMBUS_READ, 0, I2C_SMBUS_BYTE).is_ok()
            }
            Err(_) => false,
        }
    }

    /// Write `data` to `address`.
    pub fn write_bytes(&mut self, address: u8, data: &[u8]) -> RtuResult<()> {
        self.set_slave(address)?;
        self.file.write_all(data).map_err(|e| {
            RtuError::Io(format!(
                "i2c-{} write to 0x{address:02x}: {e}",
                self.bus
            ))
        })
    }

    /// Read exactly `buf.len()` bytes from `address`.
    pub fn read_bytes(&mut self, address: u8, buf: &mut [u8]) -> RtuResult<()> {
        self.set_slave(address)?;
        self.file.read_exact(buf).map_err(|e| {
            RtuError::Io(format!(
                "i2c-{} read from 0x{address:02x}: {e}",
                self.bus
            ))
        })
    }
}

/// Whether an address falls in a reserved range.
pub fn is_reserved(address: u8) -> bool {
    RESERVED
        .iter()
        .any(|(lo, hi)| (*lo..=*hi).contains(&address))
}

/// Look up the first table entry for an address.
pub fn identify(address: u8) -> Option<(DeviceClass, &'static str)> {
    KNOWN_DEVICES
        .iter()
        .find(|(a, _, _)| *a == address)
        .map(|(_, class, name)| (*class, *name))
}

/// Walk one bus and return all ACKing addresses with identification.
pub fn probe_bus(bus: &I2cBus) -> Vec<ProbeHit> {
    let mut hits = Vec::new();
    for address in ADDR_MIN..=ADDR_MAX {
        if is_reserved(address) {
            continue;
        }
        if bus.probe(address) {
            hits.push(ProbeHit {
                bus: bus.bus(),
                address,
                device: identify(address),
            });
        }
    }
    hits
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reserved_ranges_are_skipped() {
        assert!(is_reserved(0x30));
        assert!(is_reserved(0x37));
        assert!(!is_reserved(0x38));
        assert!(!is_reserved(0x2F));
        assert!(is_reserved(0x78));
    }

    #[test]
    fn probe_walk_bounds() {
        // The walk never leaves the legal range.
        let probed: Vec<u8> = (ADDR_MIN..=ADDR_MAX).filter(|a| !is_reserved(*a)).collect();
        assert_eq!(*probed.first().unwrap(), 0x03);
        assert_eq!(*probed.last().unwrap(), 0x77);
        assert!(!probed.contains(&0x33));
    }

    #[test]
    fn ambiguous_addresses_resolve_to_first_entry() {
        // 0x40 and 0x68 both carry two candidates.
        let (_, name) = identify(0x40).unwrap();
        assert_eq!(name, "HTU21D / SHT21");
        let (class, _) = identify(0x68).unwrap();
        assert_eq!(class, DeviceClass::Rtc);
    }

    #[test]
    fn unknown_address_has_no_identification() {
        assert!(identify(0x3A).is_none());
    }
}
