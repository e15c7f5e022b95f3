//! INI configuration: parsing, saving, defaults and the precedence
//! resolver.
//!
//! The configuration file is INI: case-insensitive section and key names,
//! `#` and `;` line comments, single- or double-quoted values. Knobs are
//! addressed as dotted `section.key`. Unknown sections and keys are
//! ignored with a warning so a newer file still loads on an older
//! runtime.
//!
//! Precedence per scalar knob: CLI flag > environment variable > file
//! value > compiled default. [`ConfigResolution`] records which source won
//! and logs it at startup.

use std::fmt::Write as _;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::consts::BOOTSTRAP_TIMEOUT_S;
use crate::error::{RtuError, RtuResult};

// ─── INI document ───────────────────────────────────────────────────

/// One parsed section: lowercase name plus ordered key/value pairs.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
struct IniSection {
    name: String,
    keys: Vec<(String, String)>,
}

/// A parsed INI document. Sections and keys keep file order so a saved
/// document is stable.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Ini {
    sections: Vec<IniSection>,
}

impl Ini {
    /// Parse an INI document from text.
    ///
    /// Comments (`#`, `;`) and blank lines are dropped. Keys that appear
    /// before any section header go into an unnamed section addressed by
    /// the empty string.
    pub fn parse(text: &str) -> RtuResult<Self> {
        let mut doc = Self::default();
        let mut current: Option<usize> = None;

        for (lineno, raw) in text.lines().enumerate() {
            let line = raw.trim();
            if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
                continue;
            }

            if let Some(rest) = line.strip_prefix('[') {
                let name = rest.strip_suffix(']').ok_or_else(|| {
                    RtuError::InvalidParam(format!(
                        "line {}: unterminated section header '{raw}'",
                        lineno + 1
                    ))
                })?;
                let name = name.trim().to_ascii_lowercase();
                current = Some(doc.section_index_or_insert(&name));
                continue;
            }

            let Some((key, value)) = line.split_once('=') else {
                return Err(RtuError::InvalidParam(format!(
                    "line {}: expected 'key = value', got '{raw}'",
                    lineno + 1
                )));
            };
            let key = key.trim().to_ascii_lowercase();
            if key.is_empty() {
                return Err(RtuError::InvalidParam(format!(
                    "line {}: empty key",
                    lineno + 1
                )));
            }
            let value = unquote(value.trim());

            let idx = match current {
                Some(idx) => idx,
                None => {
                    let idx = doc.section_index_or_insert("");
                    current = Some(idx);
                    idx
                }
            };
            doc.sections[idx].keys.push((key, value));
        }
        Ok(doc)
    }

    fn section_index_or_insert(&mut self, name: &str) -> usize {
        if let Some(idx) = self.sections.iter().position(|s| s.name == name) {
            return idx;
        }
        self.sections.push(IniSection {
            name: name.to_string(),
            keys: Vec::new(),
        });
        self.sections.len() - 1
    }

    /// Look up a value by case-insensitive section and key.
    pub fn get(&self, section: &str, key: &str) -> Option<&str> {
        let section = section.to_ascii_lowercase();
        let key = key.to_ascii_lowercase();
        self.sections
            .iter()
            .find(|s| s.name == section)?
            .keys
            .iter()
            .rev()
            .find(|(k, _)| *k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Look up a value by dotted `section.key` address.
    pub fn get_dotted(&self, dotted: &str) -> Option<&str> {
        let (section, key) = dotted.split_once('.')?;
        self.get(section, key)
    }

    /// Insert or replace a key.
    pub fn set(&mut self, section: &str, key: &str, value: &str) {
        let idx = self.section_index_or_insert(&section.to_ascii_lowercase());
        let key = key.to_ascii_lowercase();
        if let Some(slot) = self.sections[idx].keys.iter_mut().find(|(k, _)| *k == key) {
            slot.1 = value.to_string();
        } else {
            self.sections[idx].keys.push((key, value.to_string()));
        }
    }

    /// Iterate `(section, key, value)` triples in document order.
    pub fn entries(&self) -> impl Iterator<Item = (&str, &str, &str)> {
        self.sections.iter().flat_map(|s| {
            s.keys
                .iter()
                .map(move |(k, v)| (s.name.as_str(), k.as_str(), v.as_str()))
        })
    }

    /// Render the document. Normalised form: lowercase names, one
    /// `key = value` per line, values quoted only when they need it.
    pub fn save(&self) -> String {
        let mut out = String::new();
        for (i, section) in self.sections.iter().enumerate() {
            if i > 0 {
                out.push('\n');
            }
            if !section.name.is_empty() {
                let _ = writeln!(out, "[{}]", section.name);
            }
            for (key, value) in &section.keys {
                let _ = writeln!(out, "{key} = {}", quote_if_needed(value));
            }
        }
        out
    }
}

/// Strip one level of matched single or double quotes.
fn unquote(value: &str) -> String {
    let bytes = value.as_bytes();
    if bytes.len() >= 2 {
        let (first, last) = (bytes[0], bytes[bytes.len() - 1]);
        if (first == b'"' && last == b'"') || (first == b'\'' && last == b'\'') {
            return value[1..value.len() - 1].to_string();
        }
    }
    value.to_string()
}

fn quote_if_needed(value: &str) -> String {
    if value.is_empty()
        || value.starts_with(' ')
        || value.ends_with(' ')
        || value.contains('#')
        || value.contains(';')
    {
        format!("\"{value}\"")
    } else {
        value.to_string()
    }
}

// ─── Typed configuration ────────────────────────────────────────────

/// Log level knob.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warning,
    Error,
    Fatal,
}

impl LogLevel {
    fn parse(text: &str) -> Option<Self> {
        match text.to_ascii_lowercase().as_str() {
            "trace" => Some(Self::Trace),
            "debug" => Some(Self::Debug),
            "info" => Some(Self::Info),
            "warning" | "warn" => Some(Self::Warning),
            "error" => Some(Self::Error),
            "fatal" => Some(Self::Fatal),
            _ => None,
        }
    }

    const fn as_str(self) -> &'static str {
        match self {
            Self::Trace => "trace",
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warning => "warning",
            Self::Error => "error",
            Self::Fatal => "fatal",
        }
    }
}

/// `[system]` section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SystemConfig {
    /// Station identity reported on the fieldbus and in logs.
    pub station_id: String,
    /// Pipeline tick rate [Hz], 20–100.
    pub tick_rate_hz: u32,
    /// Days cleared alarms are retained before garbage collection.
    pub alarm_retention_days: u32,
}

/// `[network]` section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// HTTP port for the external health/UI collaborators.
    pub http_port: u16,
    /// Bind address for those collaborators.
    pub bind_address: String,
}

/// `[profinet]` section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProfinetConfig {
    /// Station name announced to the IO-Controller.
    pub station_name: String,
    /// Network interface the stack binds.
    pub interface: String,
}

/// `[database]` section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Store file path.
    pub path: String,
    /// Alarm-history flush interval [s].
    pub flush_interval_s: u32,
}

/// `[logging]` section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Minimum emitted level.
    pub level: LogLevel,
    /// Flood-guard suppression window [s].
    pub rate_limit_s: u32,
}

/// `[health]` section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthConfig {
    /// Whether the external health endpoint is served.
    pub enabled: bool,
    /// Health endpoint port.
    pub port: u16,
}

/// Complete runtime configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RtuConfig {
    pub system: SystemConfig,
    pub network: NetworkConfig,
    pub profinet: ProfinetConfig,
    pub database: DatabaseConfig,
    pub logging: LoggingConfig,
    pub health: HealthConfig,
}

impl Default for RtuConfig {
    fn default() -> Self {
        Self {
            system: SystemConfig {
                station_id: "wt-rtu-01".to_string(),
                tick_rate_hz: crate::consts::TICK_RATE_HZ,
                alarm_retention_days: crate::consts::ALARM_RETENTION_DAYS,
            },
            network: NetworkConfig {
                http_port: 8080,
                bind_address: "0.0.0.0".to_string(),
            },
            profinet: ProfinetConfig {
                station_name: "wt-rtu".to_string(),
                interface: "eth0".to_string(),
            },
            database: DatabaseConfig {
                path: "/var/lib/wtrtu/wtrtu.db".to_string(),
                flush_interval_s: 60,
            },
            logging: LoggingConfig {
                level: LogLevel::Info,
                rate_limit_s: 30,
            },
            health: HealthConfig {
                enabled: true,
                port: 8081,
            },
        }
    }
}

/// Known `section.key` addresses; anything else warns.
const KNOWN_KEYS: &[&str] = &[
    "system.station_id",
    "system.tick_rate_hz",
    "system.alarm_retention_days",
    "network.http_port",
    "network.bind_address",
    "profinet.station_name",
    "profinet.interface",
    "database.path",
    "database.flush_interval_s",
    "logging.level",
    "logging.rate_limit_s",
    "health.enabled",
    "health.port",
];

impl RtuConfig {
    /// Apply an INI document over the compiled defaults.
    ///
    /// Parse errors on individual values are hard errors; unknown
    /// sections/keys warn and are skipped.
    pub fn from_ini(ini: &Ini) -> RtuResult<Self> {
        let mut cfg = Self::default();

        for (section, key, value) in ini.entries() {
            let dotted = format!("{section}.{key}");
            match dotted.as_str() {
                "system.station_id" => cfg.system.station_id = value.to_string(),
                "system.tick_rate_hz" => cfg.system.tick_rate_hz = parse_num(&dotted, value)?,
                "system.alarm_retention_days" => {
                    cfg.system.alarm_retention_days = parse_num(&dotted, value)?;
                }
                "network.http_port" => cfg.network.http_port = parse_num(&dotted, value)?,
                "network.bind_address" => cfg.network.bind_address = value.to_string(),
                "profinet.station_name" => cfg.profinet.station_name = value.to_string(),
                "profinet.interface" => cfg.profinet.interface = value.to_string(),
                "database.path" => cfg.database.path = value.to_string(),
                "database.flush_interval_s" => {
                    cfg.database.flush_interval_s = parse_num(&dotted, value)?;
                }
                "logging.level" => {
                    cfg.logging.level = LogLevel::parse(value).ok_or_else(|| {
                        RtuError::InvalidParam(format!("logging.level: unknown level '{value}'"))
                    })?;
                }
                "logging.rate_limit_s" => cfg.logging.rate_limit_s = parse_num(&dotted, value)?,
                "health.enabled" => cfg.health.enabled = parse_bool(&dotted, value)?,
                "health.port" => cfg.health.port = parse_num(&dotted, value)?,
                _ => {
                    debug_assert!(!KNOWN_KEYS.contains(&dotted.as_str()));
                    tracing::warn!("ignoring unknown configuration key '{dotted}'");
                }
            }
        }
        Ok(cfg)
    }

    /// Load from an INI file on disk.
    pub fn load(path: &Path) -> RtuResult<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                RtuError::NotFound(format!("configuration file {}", path.display()))
            } else {
                RtuError::Io(format!("{}: {e}", path.display()))
            }
        })?;
        let cfg = Self::from_ini(&Ini::parse(&text)?)?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Render the configuration as a normalised INI document.
    pub fn to_ini(&self) -> Ini {
        let mut ini = Ini::default();
        ini.set("system", "station_id", &self.system.station_id);
        ini.set("system", "tick_rate_hz", &self.system.tick_rate_hz.to_string());
        ini.set(
            "system",
            "alarm_retention_days",
            &self.system.alarm_retention_days.to_string(),
        );
        ini.set("network", "http_port", &self.network.http_port.to_string());
        ini.set("network", "bind_address", &self.network.bind_address);
        ini.set("profinet", "station_name", &self.profinet.station_name);
        ini.set("profinet", "interface", &self.profinet.interface);
        ini.set("database", "path", &self.database.path);
        ini.set(
            "database",
            "flush_interval_s",
            &self.database.flush_interval_s.to_string(),
        );
        ini.set("logging", "level", self.logging.level.as_str());
        ini.set("logging", "rate_limit_s", &self.logging.rate_limit_s.to_string());
        ini.set("health", "enabled", if self.health.enabled { "true" } else { "false" });
        ini.set("health", "port", &self.health.port.to_string());
        ini
    }

    /// Semantic validation. Fatal at startup, downgraded to a warning on
    /// later reloads by the caller.
    pub fn validate(&self) -> RtuResult<()> {
        if self.system.station_id.is_empty() {
            return Err(RtuError::InvalidParam(
                "system.station_id cannot be empty".into(),
            ));
        }
        if !(20..=100).contains(&self.system.tick_rate_hz) {
            return Err(RtuError::InvalidParam(format!(
                "system.tick_rate_hz={} out of range [20, 100]",
                self.system.tick_rate_hz
            )));
        }
        if self.system.alarm_retention_days == 0 {
            return Err(RtuError::InvalidParam(
                "system.alarm_retention_days must be ≥ 1".into(),
            ));
        }
        if self.network.http_port == 0 {
            return Err(RtuError::InvalidParam(
                "network.http_port must be in 1–65535".into(),
            ));
        }
        if self.database.flush_interval_s == 0 {
            return Err(RtuError::InvalidParam(
                "database.flush_interval_s must be ≥ 1".into(),
            ));
        }
        if self.profinet.station_name.is_empty() {
            return Err(RtuError::InvalidParam(
                "profinet.station_name cannot be empty".into(),
            ));
        }
        Ok(())
    }
}

fn parse_num<T: std::str::FromStr>(key: &str, value: &str) -> RtuResult<T> {
    value
        .parse()
        .map_err(|_| RtuError::InvalidParam(format!("{key}: bad numeric value '{value}'")))
}

fn parse_bool(key: &str, value: &str) -> RtuResult<bool> {
    match value.to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Ok(true),
        "false" | "0" | "no" | "off" => Ok(false),
        _ => Err(RtuError::InvalidParam(format!(
            "{key}: bad boolean value '{value}'"
        ))),
    }
}

// ─── Precedence resolver ────────────────────────────────────────────

/// Where a resolved knob value came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Source {
    CliFlag,
    Environment,
    File,
    Default,
}

impl Source {
    const fn as_str(self) -> &'static str {
        match self {
            Self::CliFlag => "cli flag",
            Self::Environment => "environment",
            Self::File => "file",
            Self::Default => "compiled default",
        }
    }
}

/// A knob value plus the source that supplied it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolved<T> {
    pub value: T,
    pub source: Source,
}

/// CLI-supplied overrides, handed in by the binary.
#[derive(Debug, Clone, Default)]
pub struct CliOverrides {
    pub http_port: Option<u16>,
    pub station_id: Option<String>,
    pub config_url: Option<String>,
}

/// Environment variable names honoured by the resolver.
pub const ENV_HTTP_PORT: &str = "WT_HTTP_PORT";
pub const ENV_CONFIG_URL: &str = "WT_CONFIG_URL";
pub const ENV_STATION_ID: &str = "WT_STATION_ID";

/// Final resolution of the externally overridable scalar knobs.
#[derive(Debug, Clone)]
pub struct ConfigResolution {
    pub http_port: Resolved<u16>,
    pub station_id: Resolved<String>,
    pub config_url: Option<Resolved<String>>,
    /// The fully merged configuration.
    pub config: RtuConfig,
}

impl ConfigResolution {
    /// Resolve CLI > environment > file > default for each knob.
    ///
    /// `file` is the configuration parsed from disk (or the bootstrap
    /// fetch), already validated; `None` means no file was present and
    /// the compiled defaults stand in.
    pub fn resolve(cli: &CliOverrides, file: Option<&RtuConfig>) -> RtuResult<Self> {
        let defaults = RtuConfig::default();
        let mut config = file.cloned().unwrap_or_else(|| defaults.clone());

        let http_port = if let Some(port) = cli.http_port {
            Resolved { value: port, source: Source::CliFlag }
        } else if let Some(port) = env_port()? {
            Resolved { value: port, source: Source::Environment }
        } else if let Some(file) = file {
            Resolved { value: file.network.http_port, source: Source::File }
        } else {
            Resolved { value: defaults.network.http_port, source: Source::Default }
        };
        config.network.http_port = http_port.value;

        let station_id = if let Some(id) = &cli.station_id {
            Resolved { value: id.clone(), source: Source::CliFlag }
        } else if let Ok(id) = std::env::var(ENV_STATION_ID) {
            Resolved { value: id, source: Source::Environment }
        } else if let Some(file) = file {
            Resolved { value: file.system.station_id.clone(), source: Source::File }
        } else {
            Resolved { value: defaults.system.station_id.clone(), source: Source::Default }
        };
        config.system.station_id = station_id.value.clone();

        let config_url = if let Some(url) = &cli.config_url {
            Some(Resolved { value: url.clone(), source: Source::CliFlag })
        } else {
            std::env::var(ENV_CONFIG_URL).ok().map(|url| Resolved {
                value: url,
                source: Source::Environment,
            })
        };

        config.validate()?;
        Ok(Self {
            http_port,
            station_id,
            config_url,
            config,
        })
    }

    /// Log which source won for each knob.
    pub fn log_sources(&self) {
        tracing::info!(
            "http_port = {} (from {})",
            self.http_port.value,
            self.http_port.source.as_str()
        );
        tracing::info!(
            "station_id = {} (from {})",
            self.station_id.value,
            self.station_id.source.as_str()
        );
        if let Some(url) = &self.config_url {
            tracing::info!("config_url = {} (from {})", url.value, url.source.as_str());
        }
    }
}

fn env_port() -> RtuResult<Option<u16>> {
    match std::env::var(ENV_HTTP_PORT) {
        Err(_) => Ok(None),
        Ok(raw) => {
            let port: u32 = raw.parse().map_err(|_| {
                RtuError::InvalidParam(format!("{ENV_HTTP_PORT}: bad value '{raw}'"))
            })?;
            if !(1..=65535).contains(&port) {
                return Err(RtuError::InvalidParam(format!(
                    "{ENV_HTTP_PORT}: {port} outside 1–65535"
                )));
            }
            Ok(Some(port as u16))
        }
    }
}

// ─── Bootstrap fetch ────────────────────────────────────────────────

/// Fetch a replacement INI document over HTTP with a 10 s timeout.
pub fn fetch_bootstrap(url: &str) -> RtuResult<String> {
    let client = reqwest::blocking::Client::builder()
        .timeout(Duration::from_secs(BOOTSTRAP_TIMEOUT_S))
        .build()
        .map_err(|e| RtuError::Io(format!("bootstrap client: {e}")))?;
    let response = client
        .get(url)
        .send()
        .map_err(|e| {
            if e.is_timeout() {
                RtuError::Timeout(format!("bootstrap fetch from {url}"))
            } else {
                RtuError::Io(format!("bootstrap fetch from {url}: {e}"))
            }
        })?;
    if !response.status().is_success() {
        return Err(RtuError::Io(format!(
            "bootstrap fetch from {url}: HTTP {}",
            response.status()
        )));
    }
    response
        .text()
        .map_err(|e| RtuError::Io(format!("bootstrap body: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_basic_document() {
        let ini = Ini::parse(
            r#"
# leading comment
[System]
Station_ID = plant-7
tick_rate_hz = 25

[network]
http_port = "9090"
"#,
        )
        .unwrap();

        // Case-insensitive lookup.
        assert_eq!(ini.get("system", "station_id"), Some("plant-7"));
        assert_eq!(ini.get("SYSTEM", "STATION_ID"), Some("plant-7"));
        assert_eq!(ini.get_dotted("network.http_port"), Some("9090"));
    }

    #[test]
    fn quoted_values_unwrap() {
        let ini = Ini::parse("[a]\nx = \"hello world\"\ny = 'single'\n").unwrap();
        assert_eq!(ini.get("a", "x"), Some("hello world"));
        assert_eq!(ini.get("a", "y"), Some("single"));
    }

    #[test]
    fn comments_and_blank_lines_ignored() {
        let ini = Ini::parse("; top\n\n[s]\n# mid\nk = v\n").unwrap();
        assert_eq!(ini.get("s", "k"), Some("v"));
    }

    #[test]
    fn malformed_line_rejected() {
        assert!(Ini::parse("[s]\nno equals sign\n").is_err());
        assert!(Ini::parse("[unterminated\n").is_err());
    }

    #[test]
    fn save_load_round_trips() {
        let cfg = RtuConfig::default();
        let saved = cfg.to_ini().save();
        let reloaded = RtuConfig::from_ini(&Ini::parse(&saved).unwrap()).unwrap();
        assert_eq!(cfg, reloaded);

        // Normalised output is a fixpoint: byte-equivalent on re-save.
        let saved_again = reloaded.to_ini().save();
        assert_eq!(saved, saved_again);
    }

    #[test]
    fn unknown_keys_are_ignored() {
        let ini = Ini::parse("[system]\nstation_id = x\n[mystery]\nfoo = 1\n").unwrap();
        let cfg = RtuConfig::from_ini(&ini).unwrap();
        assert_eq!(cfg.system.station_id, "x");
        // Everything else keeps its default.
        assert_eq!(cfg.network.http_port, 8080);
    }

    #[test]
    fn validation_catches_out_of_range_tick() {
        let mut cfg = RtuConfig::default();
        cfg.system.tick_rate_hz = 10;
        assert!(cfg.validate().is_err());
        cfg.system.tick_rate_hz = 100;
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn bad_level_rejected() {
        let ini = Ini::parse("[logging]\nlevel = verbose\n").unwrap();
        assert!(RtuConfig::from_ini(&ini).is_err());
    }

    #[test]
    fn load_reads_a_file_and_missing_file_is_not_found() {
        use std::io::Write;

        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            "[system]\nstation_id = plant-7\n\n[network]\nhttp_port = 9090\n"
        )
        .unwrap();
        file.flush().unwrap();

        let cfg = RtuConfig::load(file.path()).unwrap();
        assert_eq!(cfg.system.station_id, "plant-7");
        assert_eq!(cfg.network.http_port, 9090);

        assert!(matches!(
            RtuConfig::load(std::path::Path::new("/nonexistent/wtrtu.ini")),
            Err(RtuError::NotFound(_))
        ));
    }

    #[test]
    fn cli_beats_file_beats_default() {
        let mut file = RtuConfig::default();
        file.network.http_port = 9000;

        // No CLI, file present → file wins.
        let res = ConfigResolution::resolve(&CliOverrides::default(), Some(&file)).unwrap();
        assert_eq!(res.http_port.value, 9000);
        assert_eq!(res.http_port.source, Source::File);

        // CLI flag wins over everything.
        let cli = CliOverrides {
            http_port: Some(7777),
            ..Default::default()
        };
        let res = ConfigResolution::resolve(&cli, Some(&file)).unwrap();
        assert_eq!(res.http_port.value, 7777);
        assert_eq!(res.http_port.source, Source::CliFlag);

        // Nothing set → compiled default.
        let res = ConfigResolution::resolve(&CliOverrides::default(), None).unwrap();
        assert_eq!(res.http_port.source, Source::Default);
    }
}
