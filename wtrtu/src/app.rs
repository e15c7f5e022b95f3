//! Subcommand implementations and service wiring.

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::time::Duration;

use tracing::{info, warn};

use wt_common::config::{ConfigResolution, RtuConfig};
use wt_common::error::{ExitCode, RtuError};
use wt_common::log::{EventLog, Level};
use wt_core::actuator::{ActuatorRuntime, Dispatcher};
use wt_core::alarm::{AlarmEngine, ModuleContext};
use wt_core::engine::{Engine, EngineConfig};
use wt_fieldbus::adapter::{Adapter, LifecycleControl, NullLamp};
use wt_fieldbus::im::Im0;
use wt_hal::binding::{Binder, SensorBindOutcome, SpiPins};
use wt_hal::board;
use wt_hal::i2c::{self, I2cBus};
use wt_hal::onewire::OneWireBus;
use wt_store::Store;

type CommandResult = Result<(), (ExitCode, RtuError)>;

/// Lifecycle requests are realised as process signals; the service
/// manager translates them into a reload or a clean restart.
struct SignalLifecycle;

impl LifecycleControl for SignalLifecycle {
    fn request_restart(&mut self) {
        info!("raising SIGTERM for clean restart");
        let _ = nix::sys::signal::kill(
            nix::unistd::Pid::this(),
            nix::sys::signal::Signal::SIGTERM,
        );
    }

    fn request_reload(&mut self) {
        info!("raising SIGHUP for configuration reload");
        let _ = nix::sys::signal::kill(
            nix::unistd::Pid::this(),
            nix::sys::signal::Signal::SIGHUP,
        );
    }
}

/// Software revision triple from the crate version.
fn sw_revision() -> (u8, u8, u8) {
    let mut parts = env!("CARGO_PKG_VERSION")
        .split('.')
        .map(|p| p.parse().unwrap_or(0));
    (
        parts.next().unwrap_or(0),
        parts.next().unwrap_or(0),
        parts.next().unwrap_or(0),
    )
}

/// `run`: assemble and drive the I/O runtime until shutdown.
pub fn run(config: &RtuConfig) -> CommandResult {
    // Sequenced event facade for the syslog contract; the sink is the
    // tracing subscriber installed in main.
    let events = EventLog::to_tracing();
    events.emit(
        Level::Info,
        "supervisor",
        format!("starting station {}", config.system.station_id),
    );

    // Best-effort memory locking; the tick loop should not page.
    if let Err(e) = nix::sys::mman::mlockall(
        nix::sys::mman::MlockAllFlags::MCL_CURRENT | nix::sys::mman::MlockAllFlags::MCL_FUTURE,
    ) {
        warn!("mlockall failed (running unprivileged?): {e}");
    }

    // 1. Store and configuration records.
    let store = Store::open(Path::new(&config.database.path))
        .map_err(|e| (ExitCode::Store, e))?;
    let sensors = store.load_sensors();
    let actuators = store.load_actuators();
    let rules = store.load_alarm_rules();
    info!(
        sensors = sensors.len(),
        actuators = actuators.len(),
        rules = rules.len(),
        "configuration loaded"
    );

    // 2. Board identity seeds the SPI pin map.
    let board = board::detect();
    info!(
        board = ?board.board,
        confidence = board.confidence,
        identity = %board.identity,
        "board detection"
    );
    let spi_pins = SpiPins::raspberry_pi(&board.pins.gpio_chip);

    // 3. Bind drivers.
    let mut binder = Binder::new(spi_pins, &sensors);
    let mut bound = HashMap::new();
    for module in &sensors {
        if !module.enabled {
            continue;
        }
        match binder.bind_sensor(module) {
            Ok(SensorBindOutcome::Bound(sensor)) => {
                bound.insert(module.id, sensor);
            }
            Ok(SensorBindOutcome::Static) => {}
            Ok(SensorBindOutcome::Inactive { reason }) => {
                warn!(sensor = %module.name, "inactive: {reason}");
            }
            Err(e) => return Err((ExitCode::Hardware, e)),
        }
    }

    let mut actuator_runtimes = Vec::new();
    for actuator in &actuators {
        let driver = match binder.bind_actuator(actuator) {
            Ok(driver) => Some(driver),
            Err(e @ RtuError::AlreadyExists(_)) => return Err((ExitCode::Hardware, e)),
            Err(e) => {
                warn!(actuator = %actuator.name, "driver bind failed: {e}");
                None
            }
        };
        actuator_runtimes.push(ActuatorRuntime::new(actuator.clone(), driver));
    }

    // 4. Actuator dispatcher on its own thread.
    let (command_tx, command_rx) = mpsc::channel();
    let dispatcher = Dispatcher::new(actuator_runtimes);
    let dispatcher_shutdown = Arc::new(AtomicBool::new(false));
    let dispatcher_handle = {
        let flag = Arc::clone(&dispatcher_shutdown);
        std::thread::Builder::new()
            .name("actuator-dispatch".to_string())
            .spawn(move || dispatcher.run(command_rx, &flag))
            .expect("spawn dispatcher")
    };

    // 5. Alarm engine with per-module spans.
    let contexts: HashMap<u32, ModuleContext> = sensors
        .iter()
        .map(|m| {
            let span = match (m.range_min, m.range_max) {
                (Some(min), Some(max)) if min < max => Some(max - min),
                _ => None,
            };
            (
                m.id,
                ModuleContext {
                    name: m.name.clone(),
                    unit: m.unit.clone(),
                    span,
                },
            )
        })
        .collect();
    let alarm = AlarmEngine::new(rules, contexts);

    // 6. Core engine.
    let engine_config = EngineConfig {
        tick_rate_hz: config.system.tick_rate_hz,
        retention_days: config.system.alarm_retention_days,
        log_rate_limit_s: config.logging.rate_limit_s,
        ..EngineConfig::default()
    };
    let mut engine = Engine::new(
        engine_config,
        sensors.clone(),
        bound,
        alarm,
        command_tx.clone(),
    );
    let shutdown = engine.shutdown_flag();

    // 7. Fieldbus adapter, handed to the vendor stack's thread.
    let slot_to_sensor: HashMap<u16, u32> =
        sensors.iter().map(|m| (m.slot, m.id)).collect();
    let actuator_slots: HashSet<u16> = actuators.iter().map(|a| a.slot).collect();
    let adapter = Adapter::new(
        engine.table(),
        slot_to_sensor,
        actuator_slots,
        command_tx,
        Im0::new(
            "WT-RTU-8S8A",
            &config.system.station_id,
            sw_revision(),
        ),
        Box::new(NullLamp),
        Box::new(SignalLifecycle),
    );
    let stack_handle = spawn_stack_host(adapter, Arc::clone(&shutdown));

    // 8. Alarm-history flush loop.
    let flush_handle = spawn_history_flush(
        engine.alarm(),
        store,
        Duration::from_secs(u64::from(config.database.flush_interval_s)),
        config.system.alarm_retention_days,
        Arc::clone(&shutdown),
    );

    // 9. Shutdown on SIGINT/SIGTERM.
    {
        let flag = Arc::clone(&shutdown);
        ctrlc::set_handler(move || {
            flag.store(true, Ordering::Relaxed);
        })
        .map_err(|e| (ExitCode::Failure, RtuError::Io(format!("signal handler: {e}"))))?;
    }

    events.emit(Level::Info, "supervisor", "runtime up");
    engine.run();

    dispatcher_shutdown.store(true, Ordering::Relaxed);
    let _ = dispatcher_handle.join();
    let _ = stack_handle.join();
    let _ = flush_handle.join();
    events.emit(Level::Info, "supervisor", "stopped");
    Ok(())
}

/// Host thread for the vendor fieldbus stack.
///
/// The stack is an external library driving [`Adapter`] through its
/// callback contract from its own thread. In builds without the vendor
/// library the adapter is parked here so the rest of the runtime is
/// unaffected.
fn spawn_stack_host(
    adapter: Adapter,
    shutdown: Arc<AtomicBool>,
) -> std::thread::JoinHandle<()> {
    std::thread::Builder::new()
        .name("fieldbus-stack".to_string())
        .spawn(move || {
            let _adapter = adapter;
            info!("fieldbus stack host up; waiting for vendor stack events");
            while !shutdown.load(Ordering::Relaxed) {
                std::thread::sleep(Duration::from_millis(200));
            }
        })
        .expect("spawn stack host")
}

/// Periodic alarm-history flush plus store-side retention GC.
fn spawn_history_flush(
    alarm: Arc<std::sync::Mutex<AlarmEngine>>,
    store: Store,
    interval: Duration,
    retention_days: u32,
    shutdown: Arc<AtomicBool>,
) -> std::thread::JoinHandle<()> {
    std::thread::Builder::new()
        .name("history-flush".to_string())
        .spawn(move || {
            let mut since_gc = Duration::ZERO;
            while !shutdown.load(Ordering::Relaxed) {
                std::thread::sleep(interval.min(Duration::from_secs(1)));
                since_gc += interval.min(Duration::from_secs(1));

                let dirty = alarm.lock().expect("alarm lock poisoned").take_dirty();
                store.flush_alarm_history(&dirty);

                // Store-side retention once a day.
                if since_gc >= Duration::from_secs(86_400) {
                    since_gc = Duration::ZERO;
                    let now_s = std::time::SystemTime::now()
                        .duration_since(std::time::UNIX_EPOCH)
                        .unwrap_or_default()
                        .as_secs();
                    match store.gc_alarm_history(now_s, retention_days) {
                        Ok(dropped) if dropped > 0 => {
                            info!(dropped, "store alarm-history GC");
                        }
                        Ok(_) => {}
                        Err(e) => warn!("store GC failed: {e}"),
                    }
                }
            }
            // Final flush on the way out.
            let dirty = alarm.lock().expect("alarm lock poisoned").take_dirty();
            store.flush_alarm_history(&dirty);
        })
        .expect("spawn history flush")
}

/// `config-check`: everything already validated during resolution;
/// report the outcome per knob.
pub fn config_check(resolution: &ConfigResolution) -> CommandResult {
    resolution.config.validate().map_err(|e| (ExitCode::Config, e))?;
    println!("configuration OK");
    println!(
        "  station_id = {} ({})",
        resolution.station_id.value,
        source_name(resolution.station_id.source)
    );
    println!(
        "  http_port  = {} ({})",
        resolution.http_port.value,
        source_name(resolution.http_port.source)
    );
    println!("  tick_rate  = {} Hz", resolution.config.system.tick_rate_hz);
    println!("  database   = {}", resolution.config.database.path);
    Ok(())
}

fn source_name(source: wt_common::config::Source) -> &'static str {
    match source {
        wt_common::config::Source::CliFlag => "cli flag",
        wt_common::config::Source::Environment => "environment",
        wt_common::config::Source::File => "file",
        wt_common::config::Source::Default => "default",
    }
}

/// `discover`: informational probe of the board and buses. Conflicts
/// never block discovery.
pub fn discover() -> CommandResult {
    let board = board::detect();
    println!(
        "board: {:?} ({}), confidence {}%{}",
        board.board,
        board.identity,
        board.confidence,
        if board.detected() { "" } else { " [below detection threshold]" }
    );
    println!("  gpio chip: {}", board.pins.gpio_chip);

    for bus_index in &board.pins.i2c_buses {
        match I2cBus::open(*bus_index) {
            Ok(bus) => {
                let hits = i2c::probe_bus(&bus);
                println!("i2c-{bus_index}: {} device(s)", hits.len());
                for hit in hits {
                    match hit.device {
                        Some((class, name)) => {
                            println!("  0x{:02x}: {name} ({class:?})", hit.address);
                        }
                        None => println!("  0x{:02x}: unknown device", hit.address),
                    }
                }
            }
            Err(e) => println!("i2c-{bus_index}: {e}"),
        }
    }

    let onewire = OneWireBus::new();
    let devices = onewire.enumerate();
    println!("1-wire: {} device(s)", devices.len());
    for device in devices {
        match (device.is_temperature, device.temperature) {
            (true, Some(t)) => println!("  {}: temperature sensor, {t:.2} °C", device.id),
            (true, None) => println!("  {}: temperature sensor (no reading)", device.id),
            (false, _) => println!("  {}: family 0x{:02x}", device.id, device.family),
        }
    }
    Ok(())
}

/// `db-migrate`: create or upgrade the store.
pub fn db_migrate(config: &RtuConfig) -> CommandResult {
    Store::migrate(Path::new(&config.database.path))
        .map(|_| {
            println!("store ready at {}", config.database.path);
        })
        .map_err(|e| (ExitCode::Store, e))
}
