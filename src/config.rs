//! Station configuration using Figment
//!
//! Configuration is loaded from:
//! 1. a TOML file (base configuration, `config/station.toml` by default)
//! 2. Environment variables prefixed with `STATION_`, using `__` between
//!    nesting levels (e.g. `STATION_APPLICATION__LOG_LEVEL=debug`)
//!
//! Every collaborator the session needs (board list, power supply drivers,
//! firmware status source) is named here and resolved once at startup by
//! [`crate::hardware::registry`]; nothing is looked up by name later.
//!
//! # Example
//! ```no_run
//! use station_ctl::config::StationConfig;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = StationConfig::load()?;
//! println!("Station: {}", config.application.name);
//! # Ok(())
//! # }
//! ```

use crate::channel::PowerRole;
use crate::error::ConfigError;
use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default configuration file location
pub const DEFAULT_CONFIG_PATH: &str = "config/station.toml";

/// Top-level station configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StationConfig {
    /// Application settings
    pub application: ApplicationConfig,
    /// Session controller settings
    #[serde(default)]
    pub session: SessionSettings,
    /// Firmware boards available for claiming
    #[serde(default)]
    pub boards: Vec<BoardDefinition>,
    /// HV and LV power supply definitions
    pub power: PowerConfig,
    /// Firmware status source
    #[serde(default)]
    pub firmware: FirmwareConfig,
}

/// Application-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplicationConfig {
    /// Station name
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

/// Session controller settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSettings {
    /// Start the session in expert mode
    #[serde(default)]
    pub start_in_expert_mode: bool,
    /// Board used by the non-expert fast path
    #[serde(default)]
    pub default_board: Option<String>,
    /// Timeout for opening a supply and reading its status, in milliseconds
    ///
    /// Never applied to interlock power-off commands.
    #[serde(default = "default_instrument_timeout")]
    pub instrument_timeout_ms: u64,
    /// Timeout for one firmware board check, in milliseconds
    #[serde(default = "default_status_timeout")]
    pub status_timeout_ms: u64,
    /// Capacity of the session command queue
    #[serde(default = "default_command_capacity")]
    pub command_capacity: usize,
    /// Capacity of the session event broadcast channel
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            start_in_expert_mode: false,
            default_board: None,
            instrument_timeout_ms: default_instrument_timeout(),
            status_timeout_ms: default_status_timeout(),
            command_capacity: default_command_capacity(),
            event_capacity: default_event_capacity(),
        }
    }
}

impl SessionSettings {
    /// Instrument timeout as a Duration
    pub fn instrument_timeout(&self) -> Duration {
        Duration::from_millis(self.instrument_timeout_ms)
    }

    /// Firmware status timeout as a Duration
    pub fn status_timeout(&self) -> Duration {
        Duration::from_millis(self.status_timeout_ms)
    }
}

/// One firmware board
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BoardDefinition {
    /// Unique board name (e.g. "FC7-A")
    pub name: String,
    /// Network address of the board
    pub address: String,
    /// FPGA image selected for the board
    #[serde(default)]
    pub fpga_config: Option<String>,
}

/// HV and LV rail definitions
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PowerConfig {
    /// High-voltage (sensor bias) supply
    pub hv: PowerSupplyDefinition,
    /// Low-voltage (chip supply) supply
    pub lv: PowerSupplyDefinition,
}

impl PowerConfig {
    /// Definition for one rail
    pub fn rail(&self, role: PowerRole) -> &PowerSupplyDefinition {
        match role {
            PowerRole::Hv => &self.hv,
            PowerRole::Lv => &self.lv,
        }
    }
}

/// One power supply rail
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PowerSupplyDefinition {
    /// Driver used to reach the supply
    pub driver: DriverType,
    /// Selectable models
    #[serde(default)]
    pub models: Vec<String>,
    /// Model used by "connect default devices"
    #[serde(default)]
    pub default_model: Option<String>,
    /// Port used by "connect default devices"
    #[serde(default)]
    pub default_port: Option<String>,
}

/// Driver configuration for instantiating a power supply connector
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DriverType {
    /// Simulated supply (always available)
    Mock {
        /// Port name to status text; use "No valid device" for empty ports
        #[serde(default)]
        ports: BTreeMap<String, String>,
        /// Simulated open latency in milliseconds
        #[serde(default)]
        open_delay_ms: u64,
    },
    /// SCPI supply on a serial port (requires `instrument_serial`)
    ScpiSerial {
        /// Communication speed
        #[serde(default = "default_baud_rate")]
        baud_rate: u32,
    },
}

impl DriverType {
    /// Human-readable driver type name
    pub fn driver_name(&self) -> &'static str {
        match self {
            DriverType::Mock { .. } => "mock",
            DriverType::ScpiSerial { .. } => "scpi_serial",
        }
    }
}

/// Firmware status source configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FirmwareConfig {
    /// Driver used to check boards
    #[serde(default = "default_firmware_driver")]
    pub driver: FirmwareDriver,
    /// Directory holding the per-board check logs
    #[serde(default = "default_log_dir")]
    pub log_dir: PathBuf,
    /// Status comment to operator solution text
    #[serde(default)]
    pub solutions: BTreeMap<String, String>,
}

impl Default for FirmwareConfig {
    fn default() -> Self {
        Self {
            driver: default_firmware_driver(),
            log_dir: default_log_dir(),
            solutions: BTreeMap::new(),
        }
    }
}

impl FirmwareConfig {
    /// Log identifier of a board's check log
    pub fn log_id(&self, board: &str) -> String {
        self.log_dir.join(format!(".{board}.log")).display().to_string()
    }
}

/// Firmware status source driver
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FirmwareDriver {
    /// Simulated boards; listed boards report healthy, others unreachable
    Mock {
        /// Boards that answer the check
        #[serde(default)]
        healthy: Vec<String>,
    },
}

// Default value functions
fn default_log_level() -> String {
    "info".to_string()
}

fn default_instrument_timeout() -> u64 {
    5000
}

fn default_status_timeout() -> u64 {
    3000
}

fn default_command_capacity() -> usize {
    32
}

fn default_event_capacity() -> usize {
    64
}

fn default_baud_rate() -> u32 {
    9600
}

fn default_firmware_driver() -> FirmwareDriver {
    FirmwareDriver::Mock { healthy: vec![] }
}

fn default_log_dir() -> PathBuf {
    PathBuf::from(".logs")
}

impl StationConfig {
    /// Load configuration from the default path and environment variables
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from(DEFAULT_CONFIG_PATH)
    }

    /// Load configuration from a specific file path and validate it
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let config: Self = Figment::new()
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed("STATION_").split("__"))
            .extract()?;
        config.validate()?;
        Ok(config)
    }

    /// Parse configuration from a TOML string and validate it
    pub fn from_toml_str(toml: &str) -> Result<Self, ConfigError> {
        let config: Self = Figment::new().merge(Toml::string(toml)).extract()?;
        config.validate()?;
        Ok(config)
    }

    /// Render the effective configuration (file plus environment) as TOML
    pub fn to_toml_string(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(|e| ConfigError::Validation(e.to_string()))
    }

    /// Validate configuration after loading
    pub fn validate(&self) -> Result<(), ConfigError> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.to_lowercase().as_str()) {
            return Err(ConfigError::Validation(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                valid_levels.join(", ")
            )));
        }

        if self.session.instrument_timeout_ms == 0 || self.session.status_timeout_ms == 0 {
            return Err(ConfigError::Validation(
                "Timeouts must be greater than zero".to_string(),
            ));
        }
        if self.session.command_capacity == 0 || self.session.event_capacity == 0 {
            return Err(ConfigError::Validation(
                "Channel capacities must be greater than zero".to_string(),
            ));
        }

        let mut names = HashSet::new();
        for board in &self.boards {
            if board.name.trim().is_empty() {
                return Err(ConfigError::Validation("Board name must not be empty".to_string()));
            }
            if !names.insert(board.name.as_str()) {
                return Err(ConfigError::Validation(format!(
                    "Duplicate board name: {}",
                    board.name
                )));
            }
        }

        if let Some(default_board) = &self.session.default_board {
            if !names.contains(default_board.as_str()) {
                return Err(ConfigError::Validation(format!(
                    "Default board '{}' is not listed in [[boards]]",
                    default_board
                )));
            }
        }

        for role in PowerRole::ALL {
            let rail = self.power.rail(role);
            if let Some(model) = &rail.default_model {
                if !rail.models.is_empty() && !rail.models.contains(model) {
                    return Err(ConfigError::Validation(format!(
                        "{} default model '{}' is not in the model list",
                        role, model
                    )));
                }
            }
        }

        Ok(())
    }

    /// The board used by the non-expert fast path
    ///
    /// Falls back to the first configured board.
    pub fn default_board(&self) -> Option<&str> {
        self.session
            .default_board
            .as_deref()
            .or_else(|| self.boards.first().map(|b| b.name.as_str()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const SAMPLE: &str = r#"
        [application]
        name = "Module Test Station"
        log_level = "info"

        [session]
        default_board = "FC7-A"
        instrument_timeout_ms = 2000

        [[boards]]
        name = "FC7-A"
        address = "192.168.1.80"

        [[boards]]
        name = "FC7-B"
        address = "192.168.1.81"
        fpga_config = "IT-uDTC_L12-KSU-3xQUAD"

        [power.hv]
        models = ["Keithley2410"]
        default_model = "Keithley2410"
        default_port = "ASRL/dev/ttyUSB0::INSTR"
        driver = { type = "mock", ports = { "ASRL/dev/ttyUSB0::INSTR" = "KEITHLEY 2410" } }

        [power.lv]
        models = ["KeysightE3633A"]
        driver = { type = "mock" }

        [firmware]
        driver = { type = "mock", healthy = ["FC7-A"] }

        [firmware.solutions]
        "Board not reachable" = "Check the ethernet cable and the board power"
    "#;

    #[test]
    fn test_parse_sample_config() {
        let config = StationConfig::from_toml_str(SAMPLE).unwrap();
        assert_eq!(config.application.name, "Module Test Station");
        assert_eq!(config.boards.len(), 2);
        assert_eq!(config.default_board(), Some("FC7-A"));
        assert_eq!(config.session.instrument_timeout(), Duration::from_millis(2000));
        assert_eq!(config.session.status_timeout_ms, 3000);
        assert_eq!(config.power.hv.driver.driver_name(), "mock");
        assert!(config.firmware.solutions.contains_key("Board not reachable"));
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(SAMPLE.as_bytes()).unwrap();

        let config = StationConfig::load_from(file.path()).unwrap();
        assert_eq!(config.boards[1].fpga_config.as_deref(), Some("IT-uDTC_L12-KSU-3xQUAD"));
    }

    #[test]
    fn test_invalid_log_level() {
        let toml = SAMPLE.replace("log_level = \"info\"", "log_level = \"loud\"");
        assert!(matches!(
            StationConfig::from_toml_str(&toml),
            Err(ConfigError::Validation(_))
        ));
    }

    #[test]
    fn test_duplicate_board_names() {
        let toml = SAMPLE.replace("name = \"FC7-B\"", "name = \"FC7-A\"");
        assert!(StationConfig::from_toml_str(&toml).is_err());
    }

    #[test]
    fn test_unknown_default_board() {
        let toml = SAMPLE.replace("default_board = \"FC7-A\"", "default_board = \"FC7-Z\"");
        assert!(StationConfig::from_toml_str(&toml).is_err());
    }

    #[test]
    fn test_default_model_must_be_listed() {
        let toml = SAMPLE.replace(
            "default_model = \"Keithley2410\"",
            "default_model = \"Keithley2450\"",
        );
        assert!(StationConfig::from_toml_str(&toml).is_err());
    }

    #[test]
    fn test_effective_config_reloads() {
        let config = StationConfig::from_toml_str(SAMPLE).unwrap();
        let rendered = config.to_toml_string().unwrap();
        let reloaded = StationConfig::from_toml_str(&rendered).unwrap();
        assert_eq!(reloaded.power.hv.driver, config.power.hv.driver);
        assert_eq!(reloaded.default_board(), Some("FC7-A"));
    }

    #[test]
    fn test_log_id_is_per_board() {
        let config = StationConfig::from_toml_str(SAMPLE).unwrap();
        assert!(config.firmware.log_id("FC7-A").ends_with(".FC7-A.log"));
    }
}
