//! Shared constants for the wt-rtu workspace.

/// First fieldbus slot carrying a sensor input.
pub const SENSOR_SLOT_MIN: u16 = 1;
/// Last fieldbus slot carrying a sensor input.
pub const SENSOR_SLOT_MAX: u16 = 8;
/// First fieldbus slot carrying an actuator output.
pub const ACTUATOR_SLOT_MIN: u16 = 9;
/// Last fieldbus slot carrying an actuator output.
pub const ACTUATOR_SLOT_MAX: u16 = 16;
/// Subslot that carries the cyclic I/O payload on every slot.
pub const IO_SUBSLOT: u16 = 1;

/// Size of one cyclic IO-data record, input or output.
pub const IO_RECORD_LEN: usize = 4;

/// Fieldbus vendor identifier.
pub const VENDOR_ID: u16 = 0x0493;
/// Fieldbus device identifier.
pub const DEVICE_ID: u16 = 0x0001;

/// Minimum accepted sensor poll period [ms].
pub const MIN_POLL_PERIOD_MS: u32 = 10;

/// Default read timeout for I²C transactions [ms].
pub const TIMEOUT_I2C_MS: u64 = 100;
/// Default read timeout for 1-Wire conversions [ms].
pub const TIMEOUT_ONEWIRE_MS: u64 = 1_000;
/// Default read timeout for HTTP polls [ms].
pub const TIMEOUT_HTTP_MS: u64 = 10_000;

/// Consecutive driver errors before a sensor-unavailable health event.
pub const SENSOR_ERROR_STREAK: u32 = 5;

/// Default retention for cleared alarm instances [days].
pub const ALARM_RETENTION_DAYS: u32 = 30;

/// Default tick rate of the pipeline scheduler [Hz]. Must stay in 20–100.
pub const TICK_RATE_HZ: u32 = 50;

/// Maximum device address length in a sensor hardware binding.
pub const MAX_DEVICE_ADDRESS_LEN: usize = 32;

/// Maximum number of sensor modules (one per input slot).
pub const MAX_SENSORS: usize = (SENSOR_SLOT_MAX - SENSOR_SLOT_MIN + 1) as usize;
/// Maximum number of actuators (one per output slot).
pub const MAX_ACTUATORS: usize = (ACTUATOR_SLOT_MAX - ACTUATOR_SLOT_MIN + 1) as usize;

/// Reference voltage used by the Steinhart–Hart conversion [V].
pub const STEINHART_VREF: f32 = 3.3;

/// Timeout for the configuration bootstrap fetch [s].
pub const BOOTSTRAP_TIMEOUT_S: u64 = 10;
