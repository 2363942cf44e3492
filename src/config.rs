//! Configuration System using Figment
//!
//! Configuration is layered, later sources overriding earlier ones:
//! 1. Built-in defaults ([`SorterConfig::default`])
//! 2. `config/sorter.toml` (or the file given to [`SorterConfig::load_from`])
//! 3. Environment variables prefixed with `DRILL_SORTER_`, nested keys separated by `__`
//!
//! # Example
//! ```no_run
//! use drill_sorter::config::SorterConfig;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! // DRILL_SORTER_ROBOT__PATH=/dev/ttyUSB1 overrides robot.path
//! let config = SorterConfig::load()?;
//! config.validate()?;
//! println!("Caliper on {}", config.caliper.path);
//! # Ok(())
//! # }
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

use crate::capture::{CaptureSettings, DEFAULT_DELTA_THRESHOLD, DEFAULT_SENTINEL};
use crate::error::{AppResult, SorterError};
use crate::poller::PollSettings;
use crate::transport::PortOptions;

/// Default configuration file, relative to the working directory.
pub const DEFAULT_CONFIG_PATH: &str = "config/sorter.toml";

/// Prefix for environment overrides.
pub const ENV_PREFIX: &str = "DRILL_SORTER_";

/// Top-level configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct SorterConfig {
    /// Application settings
    pub application: ApplicationConfig,
    /// Caliper serial port
    pub caliper: DeviceConfig,
    /// Robot serial port
    pub robot: DeviceConfig,
    /// Capture sequencing
    pub capture: CaptureConfig,
    /// Line framing
    pub framing: FramingConfig,
    /// Classification table
    pub lookup: LookupConfig,
}

/// Application-level configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApplicationConfig {
    /// Application name
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    pub log_level: String,
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            name: "Drill Sorter".to_string(),
            log_level: "info".to_string(),
        }
    }
}

/// One serial device
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceConfig {
    /// Port path (e.g., "/dev/ttyUSB0", "COM3")
    pub path: String,
    /// Communication speed
    pub baud_rate: u32,
}

impl DeviceConfig {
    fn new(path: &str, baud_rate: u32) -> Self {
        Self {
            path: path.to_string(),
            baud_rate,
        }
    }

    /// Options to open this device with.
    pub fn port_options(&self) -> PortOptions {
        PortOptions::with_baud_rate(self.baud_rate)
    }
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self::new("", 9600)
    }
}

/// Capture sequencing configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    /// Robot line that starts a capture
    pub sentinel: String,
    /// Reading change (hundredths of a millimetre) above which the caliper is moving
    pub delta_threshold: i64,
    /// Delay between settle checks
    pub poll_interval_ms: u64,
    /// Attempt count the settle wait starts from
    pub start_count: u32,
    /// Give up waiting once the attempt count exceeds this
    pub max_attempts: u32,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        let poll = PollSettings::default();
        Self {
            sentinel: DEFAULT_SENTINEL.to_string(),
            delta_threshold: DEFAULT_DELTA_THRESHOLD,
            poll_interval_ms: poll.interval.as_millis() as u64,
            start_count: poll.start_count,
            max_attempts: poll.max_count,
        }
    }
}

impl CaptureConfig {
    /// Settings for the capture sequencer.
    pub fn settings(&self) -> CaptureSettings {
        CaptureSettings {
            sentinel: self.sentinel.clone(),
            delta_threshold: self.delta_threshold,
            poll: PollSettings::new(
                Duration::from_millis(self.poll_interval_ms),
                self.start_count,
                self.max_attempts,
            ),
        }
    }
}

/// Line framing configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FramingConfig {
    /// Bound on unterminated input per connection; unbounded when absent
    #[serde(default)]
    pub max_line_bytes: Option<usize>,
}

/// Lookup table configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LookupConfig {
    /// JSON file mapping readings to names
    pub table: PathBuf,
}

impl Default for LookupConfig {
    fn default() -> Self {
        Self {
            table: PathBuf::from("config/inchdrill.json"),
        }
    }
}

impl SorterConfig {
    /// Load configuration from config/sorter.toml and environment variables
    ///
    /// Environment variables override the file with prefix DRILL_SORTER_
    /// Example: DRILL_SORTER_APPLICATION__LOG_LEVEL=debug
    pub fn load() -> AppResult<Self> {
        Self::load_from(DEFAULT_CONFIG_PATH)
    }

    /// Load configuration from a specific file path. A missing file leaves the defaults.
    pub fn load_from<P: AsRef<Path>>(path: P) -> AppResult<Self> {
        let config = Figment::from(Serialized::defaults(SorterConfig::default()))
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()?;
        Ok(config)
    }

    /// Validate configuration after loading
    pub fn validate(&self) -> AppResult<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.to_lowercase().as_str()) {
            return Err(SorterError::Configuration(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                valid_levels.join(", ")
            )));
        }

        for (name, device) in [("caliper", &self.caliper), ("robot", &self.robot)] {
            if device.baud_rate == 0 {
                return Err(SorterError::Configuration(format!(
                    "{name}.baud_rate must be greater than 0"
                )));
            }
        }

        if self.capture.sentinel.trim().is_empty() {
            return Err(SorterError::Configuration(
                "capture.sentinel must not be empty".to_string(),
            ));
        }

        if self.capture.poll_interval_ms == 0 {
            return Err(SorterError::Configuration(
                "capture.poll_interval_ms must be greater than 0".to_string(),
            ));
        }

        if self.capture.start_count > self.capture.max_attempts {
            return Err(SorterError::Configuration(format!(
                "capture.start_count ({}) must not exceed capture.max_attempts ({})",
                self.capture.start_count, self.capture.max_attempts
            )));
        }

        if self.framing.max_line_bytes == Some(0) {
            return Err(SorterError::Configuration(
                "framing.max_line_bytes must be greater than 0 when set".to_string(),
            ));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn sample_config() -> SorterConfig {
        SorterConfig {
            application: ApplicationConfig {
                name: "Test".to_string(),
                log_level: "info".to_string(),
            },
            caliper: DeviceConfig::new("/dev/ttyUSB0", 115_200),
            robot: DeviceConfig::new("/dev/ttyUSB1", 38_400),
            capture: CaptureConfig::default(),
            framing: FramingConfig::default(),
            lookup: LookupConfig::default(),
        }
    }

    #[test]
    fn test_config_validation() {
        assert!(sample_config().validate().is_ok());
    }

    #[test]
    fn test_invalid_log_level() {
        let mut config = sample_config();
        config.application.log_level = "loud".to_string();

        assert!(matches!(config.validate(), Err(SorterError::Configuration(_))));
    }

    #[test]
    fn test_zero_values_rejected() {
        let mut config = sample_config();
        config.robot.baud_rate = 0;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("robot.baud_rate"));

        let mut config = sample_config();
        config.capture.poll_interval_ms = 0;
        assert!(config.validate().is_err());

        let mut config = sample_config();
        config.capture.sentinel = "  ".to_string();
        assert!(config.validate().is_err());

        let mut config = sample_config();
        config.framing.max_line_bytes = Some(0);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_start_count_beyond_max_attempts_rejected() {
        let mut config = sample_config();
        config.capture.start_count = u32::MAX;
        config.capture.max_attempts = 20;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("capture.start_count"));

        config.capture.max_attempts = u32::MAX;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_capture_settings_defaults() {
        let settings = CaptureConfig::default().settings();

        assert_eq!(settings.sentinel, "%m");
        assert_eq!(settings.delta_threshold, 2);
        assert_eq!(settings.poll, PollSettings::default());
    }

    #[test]
    fn test_load_from_file_overrides_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
[application]
name = "Cell 2"
log_level = "debug"

[caliper]
path = "/dev/ttyACM0"
baud_rate = 115200

[capture]
max_attempts = 5

[framing]
max_line_bytes = 256
"#
        )
        .unwrap();

        let config = SorterConfig::load_from(file.path()).unwrap();

        assert_eq!(config.application.name, "Cell 2");
        assert_eq!(config.caliper.port_options().baud_rate, 115_200);
        assert_eq!(config.capture.max_attempts, 5);
        assert_eq!(config.capture.sentinel, "%m");
        assert_eq!(config.framing.max_line_bytes, Some(256));
        // Untouched sections keep their defaults
        assert_eq!(config.robot, DeviceConfig::default());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_missing_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = SorterConfig::load_from(dir.path().join("absent.toml")).unwrap();

        assert_eq!(config.capture, CaptureConfig::default());
        assert_eq!(config.lookup.table, PathBuf::from("config/inchdrill.json"));
    }
}
