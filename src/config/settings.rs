//! Test configuration document and persisted application settings

use crate::core::logger::LogFormat;
use crate::core::transport::ConnectionError;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Errors loading or saving the configuration document
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Platform config directory could not be determined
    #[error("Could not determine config directory")]
    NoConfigDir,

    /// Reading or writing the file failed
    #[error("I/O error on {path}: {source}")]
    Io {
        /// File involved
        path: PathBuf,
        /// Underlying error
        #[source]
        source: std::io::Error,
    },

    /// File contents are not a valid configuration document
    #[error("Invalid config file: {0}")]
    Parse(#[from] toml::de::Error),

    /// Configuration could not be encoded
    #[error("Failed to encode config: {0}")]
    Serialize(#[from] toml::ser::Error),
}

/// Parameters for one cable test run.
///
/// Supplied when a session starts and read-only for the rest of the run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TestConfiguration {
    /// Relay device hostname or IP address
    pub host: String,
    /// SSH port on the relay
    pub session_port: u16,
    /// Login user on the relay
    pub username: String,
    /// Password; agent and default keys are tried when absent
    #[serde(skip_serializing)]
    pub credential: Option<String>,
    /// Serial device the console cable is attached to
    pub serial_device_path: String,
    /// Serial line speed
    pub baud_rate: u32,
    /// Connect and authentication timeout
    #[serde(with = "duration_ms")]
    pub connect_timeout: Duration,
    /// Remote file and program locations
    pub remote: RemoteLayout,
    /// Settle, poll and monitoring delays
    pub timing: Timing,
}

impl Default for TestConfiguration {
    fn default() -> Self {
        Self {
            host: String::new(),
            session_port: 22,
            username: "pi".to_string(),
            credential: None,
            serial_device_path: "/dev/ttyUSB0".to_string(),
            baud_rate: 260_416,
            connect_timeout: Duration::from_secs(10),
            remote: RemoteLayout::default(),
            timing: Timing::default(),
        }
    }
}

impl TestConfiguration {
    /// Create a configuration for the given relay host with defaults
    pub fn new(host: &str) -> Self {
        Self {
            host: host.to_string(),
            ..Self::default()
        }
    }

    /// Set the SSH port
    #[must_use]
    pub fn port(mut self, port: u16) -> Self {
        self.session_port = port;
        self
    }

    /// Set the login user
    #[must_use]
    pub fn username(mut self, username: &str) -> Self {
        self.username = username.to_string();
        self
    }

    /// Set password authentication
    #[must_use]
    pub fn credential(mut self, password: &str) -> Self {
        self.credential = Some(password.to_string());
        self
    }

    /// Set the serial device and baud rate
    #[must_use]
    pub fn serial(mut self, device: &str, baud_rate: u32) -> Self {
        self.serial_device_path = device.to_string();
        self.baud_rate = baud_rate;
        self
    }

    /// Replace the timing parameters
    #[must_use]
    pub fn timing(mut self, timing: Timing) -> Self {
        self.timing = timing;
        self
    }

    /// `user@host:port` for display
    pub fn target(&self) -> String {
        format!("{}@{}:{}", self.username, self.host, self.session_port)
    }

    /// Reject configurations that cannot possibly connect
    pub fn validate(&self) -> Result<(), ConnectionError> {
        if self.host.trim().is_empty() {
            return Err(ConnectionError::InvalidConfiguration(
                "relay host address is required".to_string(),
            ));
        }
        if self.username.trim().is_empty() {
            return Err(ConnectionError::InvalidConfiguration(
                "username is required".to_string(),
            ));
        }
        if self.session_port == 0 {
            return Err(ConnectionError::InvalidConfiguration(
                "session port must be non-zero".to_string(),
            ));
        }
        if self.baud_rate == 0 {
            return Err(ConnectionError::InvalidConfiguration(
                "baud rate must be non-zero".to_string(),
            ));
        }
        Ok(())
    }
}

/// Where things live on the relay device
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RemoteLayout {
    /// File the capture program appends decoded serial text to
    pub capture_file: String,
    /// File receiving the link program's stdout and stderr
    pub link_log: String,
    /// Where the capture program is uploaded
    pub capture_script: String,
    /// Working directory of the link-establishment program
    pub link_dir: String,
    /// Link-establishment program, relative to `link_dir`
    pub link_program: String,
    /// Interpreter used for both collaborators
    pub interpreter: String,
    /// Game identifier passed to the link program
    pub game_id: u32,
    /// Matching role passed to the link program
    pub matching: u32,
}

impl Default for RemoteLayout {
    fn default() -> Self {
        Self {
            capture_file: "/tmp/serial_data.txt".to_string(),
            link_log: "/tmp/link_output.log".to_string(),
            capture_script: "/tmp/monitor.py".to_string(),
            link_dir: "/opt/dreampi-linkcable".to_string(),
            link_program: "link_cable.py".to_string(),
            interpreter: "python3".to_string(),
            game_id: 5,
            matching: 1,
        }
    }
}

/// Fixed delays used while provisioning and monitoring
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Timing {
    /// Wait after killing stray processes
    #[serde(with = "duration_ms")]
    pub cleanup_settle: Duration,
    /// Wait after launching the capture program
    #[serde(with = "duration_ms")]
    pub capture_settle: Duration,
    /// Wait after launching the link program
    #[serde(with = "duration_ms")]
    pub link_settle: Duration,
    /// Wait before sampling the link log tail
    #[serde(with = "duration_ms")]
    pub diagnostic_delay: Duration,
    /// Monitoring loop cadence
    #[serde(with = "duration_ms")]
    pub poll_interval: Duration,
    /// Overall monitoring window
    #[serde(with = "duration_ms")]
    pub monitor_timeout: Duration,
}

impl Default for Timing {
    fn default() -> Self {
        Self {
            cleanup_settle: Duration::from_secs(2),
            capture_settle: Duration::from_secs(2),
            link_settle: Duration::from_secs(3),
            diagnostic_delay: Duration::from_secs(2),
            poll_interval: Duration::from_millis(500),
            monitor_timeout: Duration::from_secs(120),
        }
    }
}

impl Timing {
    /// No settle delays; only poll cadence and timeout remain
    pub fn immediate(poll_interval: Duration, monitor_timeout: Duration) -> Self {
        Self {
            cleanup_settle: Duration::ZERO,
            capture_settle: Duration::ZERO,
            link_settle: Duration::ZERO,
            diagnostic_delay: Duration::ZERO,
            poll_interval,
            monitor_timeout,
        }
    }
}

/// Persisted application settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Last used test configuration
    pub test: TestConfiguration,
    /// Event log output format for the CLI
    pub log_format: LogFormat,
}

impl AppConfig {
    /// Load config from the platform config directory
    pub fn load() -> Result<Self, ConfigError> {
        let path = super::config_file().ok_or(ConfigError::NoConfigDir)?;
        Self::load_from(&path)
    }

    /// Load config from a file; a missing file yields defaults
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(toml::from_str(&content)?)
    }

    /// Save config to the platform config directory
    pub fn save(&self) -> Result<PathBuf, ConfigError> {
        let path = super::config_file().ok_or(ConfigError::NoConfigDir)?;
        self.save_to(&path)?;
        Ok(path)
    }

    /// Save config to a file, creating parent directories
    pub fn save_to(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|source| ConfigError::Io {
                path: parent.to_path_buf(),
                source,
            })?;
        }
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })
    }
}

/// Serialize a `Duration` as integer milliseconds
mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(u64::try_from(duration.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let ms = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(ms))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_document() {
        let config = TestConfiguration::default();
        assert_eq!(config.session_port, 22);
        assert_eq!(config.username, "pi");
        assert_eq!(config.baud_rate, 260_416);
        assert_eq!(config.serial_device_path, "/dev/ttyUSB0");
        assert!(config.credential.is_none());
        assert_eq!(config.timing.monitor_timeout, Duration::from_secs(120));
        assert_eq!(config.timing.poll_interval, Duration::from_millis(500));
    }

    #[test]
    fn test_validate() {
        assert!(TestConfiguration::default().validate().is_err());
        assert!(TestConfiguration::new("10.0.0.2").validate().is_ok());
        assert!(TestConfiguration::new("10.0.0.2").username("").validate().is_err());
        assert!(TestConfiguration::new("10.0.0.2").port(0).validate().is_err());
        assert!(TestConfiguration::new("10.0.0.2").serial("/dev/ttyS0", 0).validate().is_err());
    }

    #[test]
    fn test_camel_case_keys() {
        let toml = r#"
            host = "192.168.1.50"
            sessionPort = 2222
            serialDevicePath = "/dev/ttyAMA0"
            baudRate = 115200
        "#;
        let config: TestConfiguration = toml::from_str(toml).unwrap();
        assert_eq!(config.host, "192.168.1.50");
        assert_eq!(config.session_port, 2222);
        assert_eq!(config.serial_device_path, "/dev/ttyAMA0");
        assert_eq!(config.baud_rate, 115_200);
        // unspecified keys fall back to defaults
        assert_eq!(config.username, "pi");
        assert_eq!(config.remote.link_program, "link_cable.py");
    }

    #[test]
    fn test_credential_not_persisted() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");

        let mut app = AppConfig::default();
        app.test = TestConfiguration::new("pi.local").credential("hunter2");
        app.save_to(&path).unwrap();

        let text = std::fs::read_to_string(&path).unwrap();
        assert!(!text.contains("hunter2"));

        let loaded = AppConfig::load_from(&path).unwrap();
        assert_eq!(loaded.test.host, "pi.local");
        assert!(loaded.test.credential.is_none());
        assert_eq!(loaded.test.timing, Timing::default());
    }

    #[test]
    fn test_missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let loaded = AppConfig::load_from(&dir.path().join("absent.toml")).unwrap();
        assert_eq!(loaded.test, TestConfiguration::default());
    }
}
