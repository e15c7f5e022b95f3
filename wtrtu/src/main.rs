//! # WT-RTU Supervisor
//!
//! Process root of the water-treatment RTU. Resolves configuration,
//! opens the store, binds hardware, assembles the core engine and the
//! fieldbus adapter, and owns shutdown. Subcommands:
//!
//! - `run` - start the I/O runtime
//! - `config-check` - validate configuration and report knob sources
//! - `discover` - probe the board, I²C buses and the 1-Wire directory
//! - `db-migrate` - create or upgrade the store file
//!
//! Exit codes: 0 success, 1 generic failure, 2 configuration error,
//! 3 hardware-binding error, 4 persistent-store error.

mod app;

use std::path::PathBuf;
use std::process::ExitCode as ProcessExit;

use clap::{Parser, Subcommand};
use tracing::error;

use wt_common::config::{CliOverrides, ConfigResolution, RtuConfig};
use wt_common::error::{ExitCode, RtuError};

#[derive(Debug, Parser)]
#[command(name = "wtrtu", about = "Water-treatment RTU I/O runtime")]
struct Cli {
    /// Configuration file (INI).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Override the HTTP port (beats WT_HTTP_PORT and the file).
    #[arg(long, global = true)]
    http_port: Option<u16>,

    /// Override the station id (beats WT_STATION_ID and the file).
    #[arg(long, global = true)]
    station_id: Option<String>,

    /// Bootstrap URL replacing the configuration file.
    #[arg(long, global = true)]
    config_url: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Start the I/O runtime.
    Run,
    /// Validate configuration and print where each knob came from.
    ConfigCheck,
    /// Probe the board and buses; print what answers.
    Discover,
    /// Create or upgrade the store file.
    DbMigrate,
}

fn main() -> ProcessExit {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .compact()
        .init();

    let code = match dispatch(cli) {
        Ok(()) => ExitCode::Success,
        Err((code, err)) => {
            error!("{err}");
            code
        }
    };
    ProcessExit::from(code as i32 as u8)
}

type CommandResult = Result<(), (ExitCode, RtuError)>;

fn dispatch(cli: Cli) -> CommandResult {
    let resolution = resolve_config(&cli).map_err(|e| (ExitCode::Config, e))?;
    resolution.log_sources();

    match cli.command {
        Command::Run => app::run(&resolution.config),
        Command::ConfigCheck => app::config_check(&resolution),
        Command::Discover => app::discover(),
        Command::DbMigrate => app::db_migrate(&resolution.config),
    }
}

/// Resolve configuration with the documented precedence: CLI flag >
/// environment > file (or bootstrap fetch) > compiled default.
fn resolve_config(cli: &Cli) -> Result<ConfigResolution, RtuError> {
    let overrides = CliOverrides {
        http_port: cli.http_port,
        station_id: cli.station_id.clone(),
        config_url: cli.config_url.clone(),
    };

    // A bootstrap URL (flag or environment) replaces the file contents.
    let url = overrides
        .config_url
        .clone()
        .or_else(|| std::env::var(wt_common::config::ENV_CONFIG_URL).ok());

    let file_config: Option<RtuConfig> = if let Some(url) = url {
        let text = wt_common::config::fetch_bootstrap(&url)?;
        let ini = wt_common::config::Ini::parse(&text)?;
        let cfg = RtuConfig::from_ini(&ini)?;
        cfg.validate()?;
        Some(cfg)
    } else if let Some(path) = &cli.config {
        Some(RtuConfig::load(path)?)
    } else {
        // No file configured: compiled defaults.
        None
    };

    ConfigResolution::resolve(&overrides, file_config.as_ref())
}
