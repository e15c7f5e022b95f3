//! ADS1115 16-bit I²C ADC.
//!
//! Single-shot, single-ended conversions. The programmable gain amplifier
//! is selected from the configured gain; the returned raw value is the
//! input voltage in volts so the calibration layer never needs to know
//! which ADC produced a sample.

use std::time::Duration;

use wt_common::error::{RtuError, RtuResult};

use crate::i2c::I2cBus;

/// Conversion register.
const REG_CONVERSION: u8 = 0x00;
/// Configuration register.
const REG_CONFIG: u8 = 0x01;

/// PGA settings: (configured gain, register bits, full-scale volts).
/// First entry is the fallback when the configured gain matches nothing.
const GAIN_TABLE: &[(f32, u16, f32)] = &[
    (1.0, 0b001, 4.096),
    (2.0 / 3.0, 0b000, 6.144),
    (2.0, 0b010, 2.048),
    (4.0, 0b011, 1.024),
    (8.0, 0b100, 0.512),
    (16.0, 0b101, 0.256),
];

/// Worst-case single-shot conversion time at the default 128 SPS data
/// rate, plus margin.
const CONVERSION_DELAY: Duration = Duration::from_millis(10);

/// One single-ended channel of an ADS1115.
pub struct Ads1115Channel {
    bus: I2cBus,
    address: u8,
    channel: u8,
    pga_bits: u16,
    full_scale: f32,
}

/// Select the PGA entry for a configured gain.
fn select_gain(gain: Option<f32>) -> (u16, f32) {
    let gain = gain.unwrap_or(1.0);
    let entry = GAIN_TABLE
        .iter()
        .find(|(g, _, _)| (g - gain).abs() < 1e-3)
        .unwrap_or(&GAIN_TABLE[0]);
    (entry.1, entry.2)
}

/// Build the 16-bit config word for a single-shot conversion.
fn config_word(channel: u8, pga_bits: u16) -> u16 {
    // OS=1 start, MUX=single-ended channel, MODE=1 single shot,
    // DR=128 SPS, comparator disabled.
    0x8000
        | (u16::from(0b100 + (channel & 0x03)) << 12)
        | (pga_bits << 9)
        | 0x0100
        | (0b100 << 5)
        | 0b11
}

/// Convert a signed conversion code to volts.
fn code_to_volts(code: i16, full_scale: f32) -> f32 {
    f32::from(code) * full_scale / 32768.0
}

impl Ads1115Channel {
    /// Bind one channel. `address` is the 7-bit chip address.
    pub fn new(bus: I2cBus, address: u8, channel: u8, gain: Option<f32>) -> RtuResult<Self> {
        if channel > 3 {
            return Err(RtuError::InvalidParam(format!(
                "ADS1115 channel {channel} outside 0–3"
            )));
        }
        let (pga_bits, full_scale) = select_gain(gain);
        Ok(Self {
            bus,
            address,
            channel,
            pga_bits,
            full_scale,
        })
    }

    /// Trigger one conversion and return the input voltage [V].
    pub fn read_volts(&mut self) -> RtuResult<f32> {
        let config = config_word(self.channel, self.pga_bits);
        self.bus.write_bytes(
            self.address,
            &[REG_CONFIG, (config >> 8) as u8, config as u8],
        )?;

        std::thread::sleep(CONVERSION_DELAY);

        self.bus.write_bytes(self.address, &[REG_CONVERSION])?;
        let mut buf = [0u8; 2];
        self.bus.read_bytes(self.address, &mut buf)?;
        let code = i16::from_be_bytes(buf);
        Ok(code_to_volts(code, self.full_scale))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gain_selection_matches_table() {
        assert_eq!(select_gain(Some(1.0)), (0b001, 4.096));
        assert_eq!(select_gain(Some(16.0)), (0b101, 0.256));
        // Unknown gains fall back to ±4.096 V.
        assert_eq!(select_gain(Some(3.3)), (0b001, 4.096));
        assert_eq!(select_gain(None), (0b001, 4.096));
    }

    #[test]
    fn config_word_layout() {
        let word = config_word(0, 0b001);
        // OS set, MUX=100 (AIN0 vs GND), PGA=001, single shot.
        assert_eq!(word & 0x8000, 0x8000);
        assert_eq!((word >> 12) & 0x7, 0b100);
        assert_eq!((word >> 9) & 0x7, 0b001);
        assert_eq!(word & 0x0100, 0x0100);

        let word = config_word(3, 0b010);
        assert_eq!((word >> 12) & 0x7, 0b111);
    }

    #[test]
    fn code_conversion_spans_full_scale() {
        assert_eq!(code_to_volts(0, 4.096), 0.0);
        assert!((code_to_volts(i16::MAX, 4.096) - 4.096).abs() < 1e-3);
        assert!((code_to_volts(16384, 4.096) - 2.048).abs() < 1e-3);
        assert!(code_to_volts(-16384, 4.096) < 0.0);
    }
}
