//! Bit-banged SPI over GPIO lines.
//!
//! The analog front ends ride on an MCP3208-class SPI ADC. Rather than
//! depending on a kernel spidev being wired up, transfers are clocked
//! directly over four GPIO lines (mode 0, MSB first). Throughput is far
//! below a hardware controller but comfortably above what a 10 Hz-class
//! sensor poll needs.

use std::time::Duration;

use wt_common::error::RtuResult;

use crate::gpio::{DigitalInput, DigitalOutput};

/// Default half-period between clock edges.
const DEFAULT_HALF_PERIOD: Duration = Duration::from_micros(5);

/// A bit-banged SPI bus (mode 0, MSB first).
pub struct BitBangSpi<O: DigitalOutput, I: DigitalInput> {
    clk: O,
    mosi: O,
    miso: I,
    cs: O,
    half_period: Duration,
}

impl<O: DigitalOutput, I: DigitalInput> BitBangSpi<O, I> {
    /// Build a bus over the four lines. Chip select is driven inactive.
    pub fn new(mut clk: O, mut mosi: O, miso: I, mut cs: O) -> RtuResult<Self> {
        clk.set(false)?;
        mosi.set(false)?;
        cs.set(false)?; // CS is active-low at the line layer; inactive here
        Ok(Self {
            clk,
            mosi,
            miso,
            cs,
            half_period: DEFAULT_HALF_PERIOD,
        })
    }

    /// Override the clock half-period.
    pub fn with_half_period(mut self, half_period: Duration) -> Self {
        self.half_period = half_period;
        self
    }

    /// Full-duplex transfer: clock `tx` out while sampling the same
    /// number of bits back into `rx`. Slices must be the same length.
    pub fn transfer(&mut self, tx: &[u8], rx: &mut [u8]) -> RtuResult<()> {
        debug_assert_eq!(tx.len(), rx.len());

        self.cs.set(true)?;
        for (out_byte, in_byte) in tx.iter().zip(rx.iter_mut()) {
            let mut read = 0u8;
            for bit in (0..8).rev() {
                self.mosi.set(out_byte & (1 << bit) != 0)?;
                spin_wait(self.half_period);
                self.clk.set(true)?;
                if self.miso.get()? {
                    read |= 1 << bit;
                }
                spin_wait(self.half_period);
                self.clk.set(false)?;
            }
            *in_byte = read;
        }
        self.cs.set(false)?;
        Ok(())
    }
}

/// Busy-wait for sub-scheduler-quantum delays. `thread::sleep` has
/// millisecond-class jitter which would starve the clock.
fn spin_wait(period: Duration) {
    let start = std::time::Instant::now();
    while start.elapsed() < period {
        std::hint::spin_loop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    /// Shared wire state for the loopback harness.
    #[derive(Default)]
    struct Wire {
        mosi: bool,
        writes: Vec<(char, bool)>,
    }

    struct TracePin {
        wire: Arc<Mutex<Wire>>,
        tag: char,
    }

    impl DigitalOutput for TracePin {
        fn set(&mut self, active: bool) -> RtuResult<()> {
            let mut wire = self.wire.lock().unwrap();
            if self.tag == 'm' {
                wire.mosi = active;
            }
            wire.writes.push((self.tag, active));
            Ok(())
        }
    }

    /// MISO wired straight back to MOSI.
    struct LoopbackMiso(Arc<Mutex<Wire>>);

    impl DigitalInput for LoopbackMiso {
        fn get(&mut self) -> RtuResult<bool> {
            Ok(self.0.lock().unwrap().mosi)
        }
    }

    fn harness() -> (Arc<Mutex<Wire>>, BitBangSpi<TracePin, LoopbackMiso>) {
        let wire = Arc::new(Mutex::new(Wire::default()));
        let spi = BitBangSpi::new(
            TracePin { wire: Arc::clone(&wire), tag: 'c' },
            TracePin { wire: Arc::clone(&wire), tag: 'm' },
            LoopbackMiso(Arc::clone(&wire)),
            TracePin { wire: Arc::clone(&wire), tag: 's' },
        )
        .unwrap()
        .with_half_period(Duration::ZERO);
        (wire, spi)
    }

    #[test]
    fn loopback_echoes_transmitted_bytes() {
        let (_wire, mut spi) = harness();
        let tx = [0xA5, 0x3C, 0x00, 0xFF];
        let mut rx = [0u8; 4];
        spi.transfer(&tx, &mut rx).unwrap();
        assert_eq!(rx, tx);
    }

    #[test]
    fn chip_select_frames_the_transfer() {
        let (wire, mut spi) = harness();
        let tx = [0x01];
        let mut rx = [0u8; 1];
        spi.transfer(&tx, &mut rx).unwrap();

        let cs_writes: Vec<bool> = wire
            .lock()
            .unwrap()
            .writes
            .iter()
            .filter(|(tag, _)| *tag == 's')
            .map(|(_, v)| *v)
            .collect();
        // Inactive at setup, asserted for the transfer, released after.
        assert_eq!(cs_writes, vec![false, true, false]);
    }
}
