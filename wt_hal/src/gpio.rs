//! GPIO line access, pulse counting and PWM.
//!
//! Lines are addressed by (chip label, offset) through the character
//! device interface. The [`DigitalOutput`] / [`DigitalInput`] traits
//! abstract the hardware so the actuator runtime and tests run against
//! the same code; [`ListenerPin`] is the in-memory double that records
//! every write.
//!
//! PWM outputs go through the sysfs PWM class, which is what carries
//! hardware PWM on the supported boards.

use std::path::{Path, PathBuf};
use std::time::Instant;

use gpio_cdev::{Chip, EventRequestFlags, LineEventHandle, LineHandle, LineRequestFlags};

use wt_common::error::{RtuError, RtuResult};

/// Consumer label shown in `gpioinfo`.
const CONSUMER: &str = "wtrtu";

/// A writable digital output.
pub trait DigitalOutput: Send {
    /// Drive the output. `active` is the logical state; active-low
    /// inversion happens inside the implementation.
    fn set(&mut self, active: bool) -> RtuResult<()>;
}

/// A readable digital input.
pub trait DigitalInput: Send {
    /// Read the logical level.
    fn get(&mut self) -> RtuResult<bool>;
}

impl DigitalOutput for Box<dyn DigitalOutput> {
    fn set(&mut self, active: bool) -> RtuResult<()> {
        (**self).set(active)
    }
}

impl DigitalInput for Box<dyn DigitalInput> {
    fn get(&mut self) -> RtuResult<bool> {
        (**self).get()
    }
}

// ─── Character-device lines ─────────────────────────────────────────

/// Locate a GPIO chip by its label (e.g. `gpiochip0` name or the
/// controller label reported by the kernel).
pub fn find_chip(label: &str) -> RtuResult<Chip> {
    let iter = gpio_cdev::chips()
        .map_err(|e| RtuError::Io(format!("cannot enumerate GPIO chips: {e}")))?;
    for chip in iter.flatten() {
        let name = chip.name().to_string();
        if name == label || name.ends_with(label) || chip.label() == label {
            return Ok(chip);
        }
    }
    Err(RtuError::NotFound(format!("GPIO chip '{label}'")))
}

/// An output line held for the process lifetime.
pub struct OutputLine {
    handle: LineHandle,
    active_low: bool,
    chip: String,
    pin: u32,
}

impl OutputLine {
    /// Request `pin` on `chip` as an output, driven to inactive.
    pub fn request(chip_label: &str, pin: u32, active_low: bool) -> RtuResult<Self> {
        let mut chip = find_chip(chip_label)?;
        let line = chip.get_line(pin).map_err(|e| {
            RtuError::NotFound(format!("{chip_label} line {pin}: {e}"))
        })?;
        let initial = if active_low { 1 } else { 0 };
        let handle = line
            .request(LineRequestFlags::OUTPUT, initial, CONSUMER)
            .map_err(|e| RtuError::Io(format!("{chip_label} line {pin}: {e}")))?;
        Ok(Self {
            handle,
            active_low,
            chip: chip_label.to_string(),
            pin,
        })
    }
}

impl DigitalOutput for OutputLine {
    fn set(&mut self, active: bool) -> RtuResult<()> {
        let level = u8::from(active != self.active_low);
        self.handle.set_value(level).map_err(|e| {
            RtuError::Io(format!("{} line {} write: {e}", self.chip, self.pin))
        })
    }
}

/// An input line held for the process lifetime.
pub struct InputLine {
    handle: LineHandle,
    active_low: bool,
    chip: String,
    pin: u32,
}

impl InputLine {
    /// Request `pin` on `chip` as an input.
    pub fn request(chip_label: &str, pin: u32, active_low: bool) -> RtuResult<Self> {
        let mut chip = find_chip(chip_label)?;
        let line = chip.get_line(pin).map_err(|e| {
            RtuError::NotFound(format!("{chip_label} line {pin}: {e}"))
        })?;
        let handle = line
            .request(LineRequestFlags::INPUT, 0, CONSUMER)
            .map_err(|e| RtuError::Io(format!("{chip_label} line {pin}: {e}")))?;
        Ok(Self {
            handle,
            active_low,
            chip: chip_label.to_string(),
            pin,
        })
    }
}

impl DigitalInput for InputLine {
    fn get(&mut self) -> RtuResult<bool> {
        let level = self.handle.get_value().map_err(|e| {
            RtuError::Io(format!("{} line {} read: {e}", self.chip, self.pin))
        })?;
        Ok((level != 0) != self.active_low)
    }
}

// ─── Pulse counting (flow meters) ───────────────────────────────────

/// Rising-edge counter delivering pulses per second.
///
/// Events queue in the kernel between samples; each sample drains the
/// queue without blocking and divides by the elapsed wall time.
pub struct PulseCounter {
    events: LineEventHandle,
    last_sample: Instant,
}

impl PulseCounter {
    /// Request `pin` on `chip` for rising-edge events.
    pub fn request(chip_label: &str, pin: u32) -> RtuResult<Self> {
        let mut chip = find_chip(chip_label)?;
        let line = chip.get_line(pin).map_err(|e| {
            RtuError::NotFound(format!("{chip_label} line {pin}: {e}"))
        })?;
        let events = line
            .events(
                LineRequestFlags::INPUT,
                EventRequestFlags::RISING_EDGE,
                CONSUMER,
            )
            .map_err(|e| RtuError::Io(format!("{chip_label} line {pin} events: {e}")))?;
        Ok(Self {
            events,
            last_sample: Instant::now(),
        })
    }

    /// Drain queued edges and return the pulse rate since the previous
    /// sample [pulses/s].
    pub fn sample(&mut self) -> RtuResult<f32> {
        use std::os::fd::AsRawFd;

        let mut pulses = 0u32;
        loop {
            let mut pfd = libc::pollfd {
                fd: self.events.as_raw_fd(),
                events: libc::POLLIN,
                revents: 0,
            };
            let rc = unsafe { libc::poll(&mut pfd, 1, 0) };
            if rc < 0 {
                return Err(RtuError::Io(format!(
                    "pulse counter poll: {}",
                    std::io::Error::last_os_error()
                )));
            }
            if rc == 0 || pfd.revents & libc::POLLIN == 0 {
                break;
            }
            self.events
                .get_event()
                .map_err(|e| RtuError::Io(format!("pulse counter event: {e}")))?;
            pulses += 1;
        }

        let now = Instant::now();
        let elapsed = now.duration_since(self.last_sample).as_secs_f32();
        self.last_sample = now;
        if elapsed <= 0.0 {
            return Ok(0.0);
        }
        Ok(pulses as f32 / elapsed)
    }
}

// ─── Sysfs PWM ──────────────────────────────────────────────────────

/// A hardware PWM channel driven through `/sys/class/pwm`.
pub struct PwmChannel {
    channel_dir: PathBuf,
    period_ns: u64,
    enabled: bool,
}

impl PwmChannel {
    /// Export and configure `pwmchip{chip}/pwm{channel}` at `frequency_hz`.
    pub fn open(chip: u32, channel: u32, frequency_hz: u32) -> RtuResult<Self> {
        Self::open_at(Path::new("/"), chip, channel, frequency_hz)
    }

    /// As [`PwmChannel::open`] against an alternate root, for tests.
    pub fn open_at(root: &Path, chip: u32, channel: u32, frequency_hz: u32) -> RtuResult<Self> {
        if frequency_hz == 0 {
            return Err(RtuError::InvalidParam("PWM frequency must be > 0".into()));
        }
        let chip_dir = root.join(format!("sys/class/pwm/pwmchip{chip}"));
        if !chip_dir.exists() {
            return Err(RtuError::NotFound(format!("pwmchip{chip}")));
        }
        let channel_dir = chip_dir.join(format!("pwm{channel}"));
        if !channel_dir.exists() {
            // Export is idempotent per channel; EBUSY from a re-export of
            // an already-exported channel is tolerated below by the
            // directory re-check.
            std::fs::write(chip_dir.join("export"), channel.to_string())
                .map_err(|e| RtuError::Io(format!("pwmchip{chip} export: {e}")))?;
        }
        if !channel_dir.exists() {
            return Err(RtuError::Io(format!(
                "pwmchip{chip}: channel {channel} did not appear after export"
            )));
        }

        let period_ns = 1_000_000_000u64 / u64::from(frequency_hz);
        std::fs::write(channel_dir.join("period"), period_ns.to_string())
            .map_err(|e| RtuError::Io(format!("pwm period: {e}")))?;
        Ok(Self {
            channel_dir,
            period_ns,
            enabled: false,
        })
    }

    /// Drive the channel at `duty` / 255 of the period. Duty 0 disables
    /// the output entirely.
    pub fn set_duty(&mut self, duty: u8) -> RtuResult<()> {
        let duty_ns = self.period_ns * u64::from(duty) / 255;
        std::fs::write(self.channel_dir.join("duty_cycle"), duty_ns.to_string())
            .map_err(|e| RtuError::Io(format!("pwm duty_cycle: {e}")))?;

        let enable = duty > 0;
        if enable != self.enabled {
            std::fs::write(self.channel_dir.join("enable"), if enable { "1" } else { "0" })
                .map_err(|e| RtuError::Io(format!("pwm enable: {e}")))?;
            self.enabled = enable;
        }
        Ok(())
    }
}

// ─── Test double ────────────────────────────────────────────────────

/// In-memory pin recording the history of all writes. Reads return the
/// last written value.
#[derive(Debug, Default)]
pub struct ListenerPin {
    history: Vec<bool>,
}

impl ListenerPin {
    /// Pin with one seeded reading.
    pub fn new(initial: bool) -> Self {
        Self {
            history: vec![initial],
        }
    }

    /// Every value written so far, oldest first.
    pub fn history(&self) -> &[bool] {
        &self.history
    }
}

impl DigitalOutput for ListenerPin {
    fn set(&mut self, active: bool) -> RtuResult<()> {
        self.history.push(active);
        Ok(())
    }
}

impl DigitalInput for ListenerPin {
    fn get(&mut self) -> RtuResult<bool> {
        Ok(*self.history.last().unwrap_or(&false))
    }
}
