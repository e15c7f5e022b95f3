//! MCP3208 8-channel 12-bit SPI ADC.
//!
//! Carries the direct analog probes (pressure, level). The transfer
//! frame follows the datasheet's three-byte single-ended layout; the
//! returned raw value is volts against the configured reference.

use wt_common::error::{RtuError, RtuResult};

use crate::gpio::{DigitalInput, DigitalOutput};
use crate::spi::BitBangSpi;

/// Full-scale code of the 12-bit converter.
const FULL_SCALE: u16 = 1 << 12;

/// One single-ended channel of an MCP3208.
pub struct Mcp3208Channel<O: DigitalOutput, I: DigitalInput> {
    spi: BitBangSpi<O, I>,
    channel: u8,
    vref: f32,
}

/// Build the three-byte single-ended request frame for a channel.
fn request_frame(channel: u8) -> [u8; 3] {
    // Start bit, SGL/DIFF=1, then the three channel-select bits straddle
    // the first two bytes.
    [
        0b0000_0110 | (channel >> 2),
        (channel & 0x03) << 6,
        0x00,
    ]
}

/// Extract the 12-bit conversion code from the response frame.
fn response_code(frame: &[u8; 3]) -> u16 {
    (u16::from(frame[1] & 0x0F) << 8) | u16::from(frame[2])
}

impl<O: DigitalOutput, I: DigitalInput> Mcp3208Channel<O, I> {
    /// Bind one channel against a reference voltage.
    pub fn new(spi: BitBangSpi<O, I>, channel: u8, vref: f32) -> RtuResult<Self> {
        if channel > 7 {
            return Err(RtuError::InvalidParam(format!(
                "MCP3208 channel {channel} outside 0–7"
            )));
        }
        if vref <= 0.0 {
            return Err(RtuError::InvalidParam(format!(
                "MCP3208 reference voltage {vref} must be positive"
            )));
        }
        Ok(Self { spi, channel, vref })
    }

    /// Run one conversion and return the input voltage [V].
    pub fn read_volts(&mut self) -> RtuResult<f32> {
        let tx = request_frame(self.channel);
        let mut rx = [0u8; 3];
        self.spi.transfer(&tx, &mut rx)?;
        let code = response_code(&rx);
        Ok(f32::from(code) * self.vref / FULL_SCALE as f32)
    }
}
