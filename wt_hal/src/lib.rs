//! WT-RTU Hardware Abstraction Layer
//!
//! Discovery and binding for the sensors and actuators of a
//! water-treatment RTU on a single-board computer:
//!
//! - [`board`] - Platform identification with confidence scoring
//! - [`i2c`] - `/dev/i2c-N` bus access and address-walk probing
//! - [`onewire`] - 1-Wire sysfs enumeration and temperature reads
//! - [`gpio`] - Character-device GPIO lines, pulse counting, sysfs PWM
//! - [`spi`] - Bit-banged SPI transfers over GPIO lines
//! - [`drivers`] - The closed driver set behind every sensor/actuator
//! - [`binding`] - Configuration → driver binding with pin-conflict
//!   enforcement
//!
//! Discovery is informational: it reports what is present on the buses
//! without claiming any of it. Binding claims hardware and is where
//! conflicts surface.

pub mod binding;
pub mod board;
pub mod drivers;
pub mod gpio;
pub mod i2c;
pub mod onewire;
pub mod spi;
