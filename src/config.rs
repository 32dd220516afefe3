//! Configuration system using Figment
//!
//! Configuration is loaded from:
//! 1. a TOML file (default `config/sweep.toml`)
//! 2. environment variables prefixed with `SWEEPDAQ_`, using `__` between section and key
//!
//! ```text
//! SWEEPDAQ_APPLICATION__LOG_LEVEL=debug
//! SWEEPDAQ_ROBOT__ADDRESS=192.168.127.100:20002
//! SWEEPDAQ_STORAGE__BATCH_SIZE=50
//! ```
//!
//! Every section has defaults, so an empty file (or no file at all) yields a usable
//! configuration.
//!
//! ```toml
//! [application]
//! tick = "1s"
//!
//! [robot]
//! address = "192.168.127.100:20002"
//! home_pose = [0, 0, 140, 0, -50, 180]
//!
//! [calibration]
//! path = "max_positions.csv"
//! offset_column = "TY"
//!
//! [line_sensor]
//! port = "/dev/ttyUSB0"
//!
//! [sensors.annotations]
//! wind = "TriSonica Mini"
//! co2 = "LI-850"
//! ```

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::core::{Pose, Quantity};
use crate::error::{AppResult, DaqError};

/// Default location of the configuration file.
pub const DEFAULT_CONFIG_PATH: &str = "config/sweep.toml";

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Process-wide settings
    pub application: ApplicationConfig,
    /// Robot controller
    pub robot: RobotConfig,
    /// Positioning reference table
    pub calibration: CalibrationConfig,
    /// Serial line sensor
    pub line_sensor: LineSensorConfig,
    /// USB gas analyzer
    pub framed_sensor: FramedSensorConfig,
    /// Output writer
    pub storage: StorageConfig,
    /// Enabled quantities
    pub sensors: SensorSelection,
}

/// Application-level settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApplicationConfig {
    /// Name used in log output
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    pub log_level: String,
    /// Control-loop tick of the orchestrator
    #[serde(with = "humantime_serde")]
    pub tick: Duration,
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            name: "sweep_daq".to_string(),
            log_level: "info".to_string(),
            tick: Duration::from_secs(1),
        }
    }
}

/// Robot controller connection and fixed poses.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RobotConfig {
    /// Controller `host:port`
    pub address: String,
    /// Socket read timeout; expiry is retried, never surfaced
    #[serde(with = "humantime_serde")]
    pub read_timeout: Duration,
    /// Joint pose the arm returns to between workflows
    pub home_pose: Pose,
    /// Intermediate joint pose around every sweep; joint 0 comes from the field pose
    pub safe_pose: Pose,
    /// Pause after asking the robot to start streaming telemetry
    #[serde(with = "humantime_serde")]
    pub stream_settle: Duration,
    /// Pause between the stop command and closing the link
    #[serde(with = "humantime_serde")]
    pub stop_grace: Duration,
}

impl Default for RobotConfig {
    fn default() -> Self {
        Self {
            address: "127.0.0.1:20002".to_string(),
            read_timeout: Duration::from_secs(5),
            home_pose: Pose([0.0, 0.0, 140.0, 0.0, -50.0, 180.0]),
            safe_pose: Pose([0.0, 0.0, 10.0, 0.0, 80.0, 180.0]),
            stream_settle: Duration::from_secs(1),
            stop_grace: Duration::from_millis(100),
        }
    }
}

/// Positioning reference table.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CalibrationConfig {
    /// CSV file with six pose columns and an offset column
    pub path: PathBuf,
    /// Header of the offset column
    pub offset_column: String,
    /// Largest accepted distance between offset and target
    pub tolerance: f64,
    /// Abort the process when no reference pose matches
    pub fatal_on_miss: bool,
}

impl Default for CalibrationConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("max_positions.csv"),
            offset_column: "TY".to_string(),
            tolerance: 50.0,
            fatal_on_miss: true,
        }
    }
}

/// Serial anemometer / temperature sensor.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LineSensorConfig {
    /// Device path
    pub port: String,
    /// Line speed
    pub baud_rate: u32,
    /// Bounded read so the reader can observe its stop flag
    #[serde(with = "humantime_serde")]
    pub read_timeout: Duration,
    /// Written once after opening the port
    pub init_command: Option<String>,
    /// Whitespace token positions, in snapshot order
    pub tokens: LineTokens,
}

impl Default for LineSensorConfig {
    fn default() -> Self {
        Self {
            port: "/dev/ttyUSB0".to_string(),
            baud_rate: 115_200,
            read_timeout: Duration::from_secs(1),
            init_command: Some(
                "\u{3}hide S\rhide D\rhide Pitch\rhide Roll\routputrate 20\rexit\r".to_string(),
            ),
            tokens: LineTokens::default(),
        }
    }
}

/// Token index of each line-sensor value.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct LineTokens {
    /// Wind U component
    pub wind_u: usize,
    /// Wind V component
    pub wind_v: usize,
    /// Wind W component
    pub wind_w: usize,
    /// Magnetic heading
    pub magnetic: usize,
    /// Air temperature
    pub temperature: usize,
    /// Air pressure
    pub pressure: usize,
}

impl Default for LineTokens {
    fn default() -> Self {
        Self {
            wind_u: 1,
            wind_v: 3,
            wind_w: 5,
            magnetic: 13,
            temperature: 7,
            pressure: 11,
        }
    }
}

impl LineTokens {
    /// Token positions in snapshot order.
    pub fn positions(&self) -> [usize; 6] {
        [
            self.wind_u,
            self.wind_v,
            self.wind_w,
            self.magnetic,
            self.temperature,
            self.pressure,
        ]
    }
}

/// USB gas analyzer.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FramedSensorConfig {
    /// USB vendor id
    pub vendor_id: u16,
    /// USB product id
    pub product_id: u16,
    /// Bulk OUT endpoint address
    pub out_endpoint: u8,
    /// Bulk IN endpoint address
    pub in_endpoint: u8,
    /// Bytes requested per bulk read
    pub packet_size: usize,
    /// Bulk read timeout
    #[serde(with = "humantime_serde")]
    pub read_timeout: Duration,
    /// Written once after the device is claimed
    pub init_command: Option<String>,
    /// Tab-separated field positions, in snapshot order
    pub fields: FramedFields,
}

impl Default for FramedSensorConfig {
    fn default() -> Self {
        Self {
            vendor_id: 0x1509,
            product_id: 0x0A02,
            out_endpoint: 0x02,
            in_endpoint: 0x86,
            packet_size: 64,
            read_timeout: Duration::from_secs(5),
            init_command: Some(
                "(USB(Rate 20Hz)(Sources (\"CO2B um/m\" \"H2OB mm/m\" \"P kPa\" \"T C\")))\n"
                    .to_string(),
            ),
            fields: FramedFields::default(),
        }
    }
}

/// Field index of each gas-analyzer value.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct FramedFields {
    /// CO2 concentration
    pub co2: usize,
    /// H2O concentration
    pub h2o: usize,
    /// Cell pressure
    pub pressure: usize,
    /// Cell temperature
    pub temperature: usize,
}

impl Default for FramedFields {
    fn default() -> Self {
        Self {
            co2: 2,
            h2o: 3,
            pressure: 4,
            temperature: 5,
        }
    }
}

impl FramedFields {
    /// Field positions in snapshot order.
    pub fn positions(&self) -> [usize; 4] {
        [self.co2, self.h2o, self.pressure, self.temperature]
    }
}

/// Storage writer batching.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Rows buffered before a flush
    pub batch_size: usize,
    /// Queue poll interval of the writer task
    #[serde(with = "humantime_serde")]
    pub poll_timeout: Duration,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            batch_size: 100,
            poll_timeout: Duration::from_millis(100),
        }
    }
}

/// Quantities opened at connect time and their header annotations.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SensorSelection {
    /// Quantities whose devices are opened on connect
    pub enabled: Vec<Quantity>,
    /// Header row 2 label per quantity
    pub annotations: BTreeMap<Quantity, String>,
}

impl Settings {
    /// Loads `path` (if it exists) layered over defaults, then environment overrides.
    pub fn load(path: Option<&Path>) -> AppResult<Self> {
        let path = path.unwrap_or_else(|| Path::new(DEFAULT_CONFIG_PATH));
        let settings: Settings = Figment::from(Serialized::defaults(Settings::default()))
            .merge(Toml::file(path))
            .merge(Env::prefixed("SWEEPDAQ_").split("__"))
            .extract()?;
        settings.validate()?;
        Ok(settings)
    }

    /// Parses a TOML string layered over defaults, without environment overrides.
    pub fn from_toml_str(toml: &str) -> AppResult<Self> {
        let settings: Settings = Figment::from(Serialized::defaults(Settings::default()))
            .merge(Toml::string(toml))
            .extract()?;
        settings.validate()?;
        Ok(settings)
    }

    /// Rejects values the workflows cannot run with.
    pub fn validate(&self) -> AppResult<()> {
        if self.application.tick.is_zero() {
            return Err(DaqError::Configuration(
                "application.tick must be non-zero".to_string(),
            ));
        }
        if self.storage.batch_size == 0 {
            return Err(DaqError::Configuration(
                "storage.batch_size must be at least 1".to_string(),
            ));
        }
        if self.storage.poll_timeout.is_zero() {
            return Err(DaqError::Configuration(
                "storage.poll_timeout must be non-zero".to_string(),
            ));
        }
        if self.calibration.tolerance <= 0.0 {
            return Err(DaqError::Configuration(format!(
                "calibration.tolerance must be positive, got {}",
                self.calibration.tolerance
            )));
        }
        if self.calibration.offset_column.trim().is_empty() {
            return Err(DaqError::Configuration(
                "calibration.offset_column must not be empty".to_string(),
            ));
        }
        if self.framed_sensor.packet_size == 0 {
            return Err(DaqError::Configuration(
                "framed_sensor.packet_size must be at least 1".to_string(),
            ));
        }
        let mut tokens = self.line_sensor.tokens.positions().to_vec();
        tokens.sort_unstable();
        tokens.dedup();
        if tokens.len() != 6 {
            return Err(DaqError::Configuration(
                "line_sensor.tokens positions must be distinct".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let settings = Settings::default();
        assert!(settings.validate().is_ok());
        assert_eq!(settings.storage.batch_size, 100);
        assert_eq!(settings.calibration.offset_column, "TY");
        assert_eq!(settings.framed_sensor.vendor_id, 0x1509);
        assert_eq!(settings.line_sensor.tokens.positions(), [1, 3, 5, 13, 7, 11]);
    }

    #[test]
    fn test_toml_overrides() {
        let settings = Settings::from_toml_str(
            r#"
            [application]
            tick = "250ms"

            [robot]
            address = "10.0.0.5:20002"

            [storage]
            batch_size = 10

            [sensors]
            enabled = ["co2", "wind"]

            [sensors.annotations]
            wind = "TriSonica"
            "#,
        )
        .unwrap();
        assert_eq!(settings.application.tick, Duration::from_millis(250));
        assert_eq!(settings.robot.address, "10.0.0.5:20002");
        assert_eq!(settings.storage.batch_size, 10);
        assert_eq!(settings.sensors.enabled, vec![Quantity::Co2, Quantity::Wind]);
        assert_eq!(
            settings.sensors.annotations.get(&Quantity::Wind).map(String::as_str),
            Some("TriSonica")
        );
        // Untouched sections keep their defaults
        assert_eq!(settings.robot.read_timeout, Duration::from_secs(5));
    }

    #[test]
    fn test_shipped_config_parses() {
        let settings = Settings::from_toml_str(include_str!("../config/sweep.toml")).unwrap();
        assert_eq!(settings.framed_sensor.in_endpoint, 0x86);
        assert_eq!(settings.sensors.enabled.len(), 5);
        assert_eq!(settings.robot.safe_pose.0[4], 80.0);
    }

    #[test]
    fn test_validation_rejects_bad_values() {
        assert!(Settings::from_toml_str("[storage]\nbatch_size = 0").is_err());
        assert!(Settings::from_toml_str("[calibration]\ntolerance = -1.0").is_err());
        assert!(Settings::from_toml_str("[line_sensor.tokens]\nwind_u = 3").is_err());
    }
}
