//! Agent configuration.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use caremon_core::{
    BufferOptions, ConnectionOptions, PipelineOptions, ReconnectOptions, ScanOptions, SignalRange,
};
use caremon_types::{Location, LocationSource};

/// Agent configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Ingestion backend.
    pub backend: BackendConfig,
    /// Which wearable to stream from.
    pub device: DeviceConfig,
    /// Scan, connect and reconnect timing.
    pub connection: ConnectionConfig,
    /// Batching.
    pub buffer: BufferConfig,
    /// Durable offline queue.
    pub queue: QueueConfig,
    /// Backend reachability probing.
    pub reachability: ReachabilityConfig,
    /// Signal strength to quality mapping.
    pub signal: SignalConfig,
    /// Fixed position attached to batches when no better fix is known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<LocationConfig>,
}

impl Config {
    /// Load configuration from the default path.
    pub fn load_default() -> Result<Self, ConfigError> {
        let path = default_config_path();
        if path.exists() {
            Self::load(&path)
        } else {
            Ok(Self::default())
        }
    }

    /// Load configuration from a file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(|e| ConfigError::Read {
            path: path.as_ref().to_path_buf(),
            source: e,
        })?;
        toml::from_str(&content).map_err(|e| ConfigError::Parse {
            path: path.as_ref().to_path_buf(),
            source: e,
        })
    }

    /// Save configuration to a file.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        let content = toml::to_string_pretty(self).map_err(ConfigError::Serialize)?;

        if let Some(parent) = path.as_ref().parent() {
            std::fs::create_dir_all(parent).map_err(|e| ConfigError::Write {
                path: parent.to_path_buf(),
                source: e,
            })?;
        }

        std::fs::write(path.as_ref(), content).map_err(|e| ConfigError::Write {
            path: path.as_ref().to_path_buf(),
            source: e,
        })
    }

    /// Validate the configuration and return every problem found.
    ///
    /// ```
    /// use caremon_service::Config;
    ///
    /// let config = Config::default();
    /// config.validate().expect("Default config should be valid");
    /// ```
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut errors = Vec::new();

        errors.extend(self.backend.validate());
        errors.extend(self.device.validate());
        errors.extend(self.connection.validate());
        errors.extend(self.buffer.validate());
        errors.extend(self.queue.validate());
        errors.extend(self.reachability.validate());
        errors.extend(self.signal.validate());
        if let Some(location) = &self.location {
            errors.extend(location.validate());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Validation(errors))
        }
    }

    /// Load and validate configuration from a file.
    pub fn load_validated<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let config = Self::load(path)?;
        config.validate()?;
        Ok(config)
    }

    /// Pipeline options derived from the connection, buffer and signal sections.
    pub fn pipeline_options(&self) -> PipelineOptions {
        PipelineOptions {
            connection: ConnectionOptions::new()
                .connect_timeout(Duration::from_secs(self.connection.connect_timeout_secs))
                .scan(ScanOptions::new().window(Duration::from_secs(self.connection.scan_window_secs)))
                .reconnect(
                    ReconnectOptions::new()
                        .base_delay(Duration::from_secs(self.connection.reconnect_base_delay_secs))
                        .max_attempts(self.connection.max_reconnect_attempts),
                ),
            buffer: BufferOptions::new()
                .max_buffer_size(self.buffer.max_buffer_size)
                .flush_interval(Duration::from_secs(self.buffer.flush_interval_secs))
                .max_pending(self.buffer.max_pending),
            signal: SignalRange {
                floor: self.signal.rssi_floor,
                ceiling: self.signal.rssi_ceiling,
                default_quality: self.signal.default_quality,
            },
            ..PipelineOptions::default()
        }
    }
}

/// Ingestion backend settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
    /// Scheme and host, e.g. `https://api.example.com`.
    pub base_url: String,
    /// Path batches are POSTed to.
    pub ingest_path: String,
    pub request_timeout_secs: u64,
    /// Sent as a bearer token when set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_token: Option<String>,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:8080".to_string(),
            ingest_path: "/api/v1/telemetry".to_string(),
            request_timeout_secs: 30,
            api_token: None,
        }
    }
}

impl BackendConfig {
    /// Full URL of the ingestion endpoint.
    pub fn ingest_url(&self) -> String {
        join_url(&self.base_url, &self.ingest_path)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn validate(&self) -> Vec<ValidationError> {
        let mut errors = Vec::new();

        if self.base_url.is_empty() {
            errors.push(ValidationError {
                field: "backend.base_url".to_string(),
                message: "base URL cannot be empty".to_string(),
            });
        } else if !(self.base_url.starts_with("http://") || self.base_url.starts_with("https://")) {
            errors.push(ValidationError {
                field: "backend.base_url".to_string(),
                message: format!("invalid base URL '{}': must start with http:// or https://", self.base_url),
            });
        }

        if !self.ingest_path.starts_with('/') {
            errors.push(ValidationError {
                field: "backend.ingest_path".to_string(),
                message: format!("ingest path '{}' must start with '/'", self.ingest_path),
            });
        }

        if self.request_timeout_secs == 0 {
            errors.push(ValidationError {
                field: "backend.request_timeout_secs".to_string(),
                message: "request timeout must be at least 1 second".to_string(),
            });
        }

        if let Some(token) = &self.api_token
            && token.is_empty()
        {
            errors.push(ValidationError {
                field: "backend.api_token".to_string(),
                message: "API token cannot be empty string (omit it instead)".to_string(),
            });
        }

        errors
    }
}

/// Which wearable to use.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    /// Serial number or MAC printed on the wearable; matched during scans.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fingerprint: Option<String>,
    /// Connect to this identifier directly, skipping the scan.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_id: Option<String>,
    /// Connect on start-up.
    pub auto_connect: bool,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            fingerprint: None,
            device_id: None,
            auto_connect: true,
        }
    }
}

impl DeviceConfig {
    pub fn validate(&self) -> Vec<ValidationError> {
        let mut errors = Vec::new();

        if let Some(fingerprint) = &self.fingerprint
            && caremon_core::util::normalize_fingerprint(fingerprint).is_empty()
        {
            errors.push(ValidationError {
                field: "device.fingerprint".to_string(),
                message: "fingerprint cannot be blank (omit it instead)".to_string(),
            });
        }

        if let Some(device_id) = &self.device_id
            && device_id.trim().is_empty()
        {
            errors.push(ValidationError {
                field: "device.device_id".to_string(),
                message: "device id cannot be blank (omit it instead)".to_string(),
            });
        }

        errors
    }
}

/// Scan, connect and reconnect timing.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    pub scan_window_secs: u64,
    pub connect_timeout_secs: u64,
    pub reconnect_base_delay_secs: u64,
    pub max_reconnect_attempts: u32,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            scan_window_secs: 10,
            connect_timeout_secs: 10,
            reconnect_base_delay_secs: 5,
            max_reconnect_attempts: 5,
        }
    }
}

/// Maximum scan window in seconds.
pub const MAX_SCAN_WINDOW_SECS: u64 = 120;

impl ConnectionConfig {
    pub fn validate(&self) -> Vec<ValidationError> {
        let mut errors = Vec::new();

        if self.scan_window_secs == 0 || self.scan_window_secs > MAX_SCAN_WINDOW_SECS {
            errors.push(ValidationError {
                field: "connection.scan_window_secs".to_string(),
                message: format!(
                    "scan window {} is out of range (1-{} seconds)",
                    self.scan_window_secs, MAX_SCAN_WINDOW_SECS
                ),
            });
        }
        if self.connect_timeout_secs == 0 {
            errors.push(ValidationError {
                field: "connection.connect_timeout_secs".to_string(),
                message: "connect timeout must be at least 1 second".to_string(),
            });
        }
        if self.reconnect_base_delay_secs == 0 {
            errors.push(ValidationError {
                field: "connection.reconnect_base_delay_secs".to_string(),
                message: "reconnect base delay must be at least 1 second".to_string(),
            });
        }
        if self.max_reconnect_attempts == 0 {
            errors.push(ValidationError {
                field: "connection.max_reconnect_attempts".to_string(),
                message: "at least one reconnect attempt is required".to_string(),
            });
        }

        errors
    }
}

/// Batching.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BufferConfig {
    pub max_buffer_size: usize,
    pub flush_interval_secs: u64,
    pub max_pending: usize,
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            max_buffer_size: 10,
            flush_interval_secs: 15,
            max_pending: 1000,
        }
    }
}

impl BufferConfig {
    pub fn validate(&self) -> Vec<ValidationError> {
        let mut errors = Vec::new();

        if self.max_buffer_size == 0 {
            errors.push(ValidationError {
                field: "buffer.max_buffer_size".to_string(),
                message: "buffer size must be at least 1".to_string(),
            });
        }
        if self.flush_interval_secs == 0 {
            errors.push(ValidationError {
                field: "buffer.flush_interval_secs".to_string(),
                message: "flush interval must be at least 1 second".to_string(),
            });
        }
        if self.max_pending < self.max_buffer_size {
            errors.push(ValidationError {
                field: "buffer.max_pending".to_string(),
                message: format!(
                    "max pending {} is smaller than the buffer size {}",
                    self.max_pending, self.max_buffer_size
                ),
            });
        }

        errors
    }
}

/// Durable offline queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Database file path.
    pub path: PathBuf,
    /// Requests that failed this many times are dropped on the next drain.
    pub max_retries: u32,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            path: caremon_store::default_db_path(),
            max_retries: 3,
        }
    }
}

impl QueueConfig {
    pub fn validate(&self) -> Vec<ValidationError> {
        let mut errors = Vec::new();

        if self.path.as_os_str().is_empty() {
            errors.push(ValidationError {
                field: "queue.path".to_string(),
                message: "database path cannot be empty".to_string(),
            });
        }
        if self.max_retries == 0 {
            errors.push(ValidationError {
                field: "queue.max_retries".to_string(),
                message: "max retries must be at least 1".to_string(),
            });
        }

        errors
    }
}

/// Backend reachability probing.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReachabilityConfig {
    /// Path probed on the backend; any HTTP response counts as reachable.
    pub probe_path: String,
    pub probe_interval_secs: u64,
    pub probe_timeout_secs: u64,
}

impl Default for ReachabilityConfig {
    fn default() -> Self {
        Self {
            probe_path: "/api/health".to_string(),
            probe_interval_secs: 30,
            probe_timeout_secs: 5,
        }
    }
}

impl ReachabilityConfig {
    pub fn validate(&self) -> Vec<ValidationError> {
        let mut errors = Vec::new();

        if !self.probe_path.starts_with('/') {
            errors.push(ValidationError {
                field: "reachability.probe_path".to_string(),
                message: format!("probe path '{}' must start with '/'", self.probe_path),
            });
        }
        if self.probe_interval_secs == 0 {
            errors.push(ValidationError {
                field: "reachability.probe_interval_secs".to_string(),
                message: "probe interval must be at least 1 second".to_string(),
            });
        }
        if self.probe_timeout_secs == 0 || self.probe_timeout_secs > self.probe_interval_secs {
            errors.push(ValidationError {
                field: "reachability.probe_timeout_secs".to_string(),
                message: format!(
                    "probe timeout {} must be between 1 and the probe interval ({})",
                    self.probe_timeout_secs, self.probe_interval_secs
                ),
            });
        }

        errors
    }
}

/// Signal strength to quality mapping.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SignalConfig {
    pub rssi_floor: i16,
    pub rssi_ceiling: i16,
    pub default_quality: f32,
}

impl Default for SignalConfig {
    fn default() -> Self {
        let range = SignalRange::default();
        Self {
            rssi_floor: range.floor,
            rssi_ceiling: range.ceiling,
            default_quality: range.default_quality,
        }
    }
}

impl SignalConfig {
    pub fn validate(&self) -> Vec<ValidationError> {
        let mut errors = Vec::new();

        if self.rssi_floor >= self.rssi_ceiling {
            errors.push(ValidationError {
                field: "signal.rssi_floor".to_string(),
                message: format!(
                    "RSSI floor {} must be below the ceiling {}",
                    self.rssi_floor, self.rssi_ceiling
                ),
            });
        }
        if !(0.0..=1.0).contains(&self.default_quality) {
            errors.push(ValidationError {
                field: "signal.default_quality".to_string(),
                message: format!("default quality {} must be within 0.0-1.0", self.default_quality),
            });
        }

        errors
    }
}

/// A fixed position, e.g. the care home's address.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct LocationConfig {
    pub latitude: f64,
    pub longitude: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub accuracy: Option<f64>,
}

impl LocationConfig {
    pub fn validate(&self) -> Vec<ValidationError> {
        let mut errors = Vec::new();

        if !(-90.0..=90.0).contains(&self.latitude) {
            errors.push(ValidationError {
                field: "location.latitude".to_string(),
                message: format!("latitude {} must be within -90..90", self.latitude),
            });
        }
        if !(-180.0..=180.0).contains(&self.longitude) {
            errors.push(ValidationError {
                field: "location.longitude".to_string(),
                message: format!("longitude {} must be within -180..180", self.longitude),
            });
        }

        errors
    }

    pub fn to_location(&self) -> Location {
        Location {
            latitude: self.latitude,
            longitude: self.longitude,
            accuracy: self.accuracy,
            source: LocationSource::Manual,
        }
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("Failed to serialize config: {0}")]
    Serialize(toml::ser::Error),
    #[error("Failed to write config file {path}: {source}")]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Configuration validation failed:\n{}", format_validation_errors(.0))]
    Validation(Vec<ValidationError>),
}

/// A single validation error with context.
#[derive(Debug, Clone)]
pub struct ValidationError {
    /// The field path (e.g., `backend.base_url`).
    pub field: String,
    /// Description of the validation failure.
    pub message: String,
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

fn format_validation_errors(errors: &[ValidationError]) -> String {
    errors
        .iter()
        .map(|e| format!("  - {}", e))
        .collect::<Vec<_>>()
        .join("\n")
}

fn join_url(base: &str, path: &str) -> String {
    format!("{}/{}", base.trim_end_matches('/'), path.trim_start_matches('/'))
}

/// Default configuration file path.
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("caremon")
        .join("agent.toml")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_default() {
        let config = Config::default();
        assert_eq!(config.connection.scan_window_secs, 10);
        assert_eq!(config.connection.connect_timeout_secs, 10);
        assert_eq!(config.connection.reconnect_base_delay_secs, 5);
        assert_eq!(config.connection.max_reconnect_attempts, 5);
        assert_eq!(config.buffer.max_buffer_size, 10);
        assert_eq!(config.buffer.flush_interval_secs, 15);
        assert_eq!(config.queue.max_retries, 3);
        assert_eq!(config.signal.rssi_floor, -100);
        assert_eq!(config.signal.rssi_ceiling, -50);
        assert!(config.device.auto_connect);
        assert!(config.location.is_none());
        config.validate().unwrap();
    }

    #[test]
    fn test_queue_config_default_path() {
        let config = QueueConfig::default();
        assert_eq!(config.path, caremon_store::default_db_path());
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let toml = r#"
            [backend]
            base_url = "https://ingest.example.com/"

            [device]
            fingerprint = "SN-123456"
        "#;
        let config: Config = toml::from_str(toml).unwrap();
        assert_eq!(config.backend.ingest_url(), "https://ingest.example.com/api/v1/telemetry");
        assert_eq!(config.device.fingerprint.as_deref(), Some("SN-123456"));
        assert!(config.device.auto_connect);
        assert_eq!(config.buffer.max_pending, 1000);
    }

    #[test]
    fn test_pipeline_options_follow_config() {
        let mut config = Config::default();
        config.connection.connect_timeout_secs = 20;
        config.connection.max_reconnect_attempts = 2;
        config.buffer.max_buffer_size = 25;
        config.signal.default_quality = 0.5;

        let options = config.pipeline_options();
        assert_eq!(options.connection.connect_timeout, Duration::from_secs(20));
        assert_eq!(options.connection.reconnect.max_attempts, 2);
        assert_eq!(options.buffer.max_buffer_size, 25);
        assert_eq!(options.signal.default_quality, 0.5);
        options.validate().unwrap();
    }

    #[test]
    fn test_config_save_and_load() {
        let temp_dir = tempfile::tempdir().unwrap();
        let config_path = temp_dir.path().join("agent.toml");

        let mut config = Config::default();
        config.backend.api_token = Some("secret".to_string());
        config.device.device_id = Some("AA:BB:CC:DD:EE:FF".to_string());
        config.queue.path = PathBuf::from("/tmp/caremon-test.db");
        config.location = Some(LocationConfig {
            latitude: 55.75,
            longitude: 37.61,
            accuracy: Some(25.0),
        });

        config.save(&config_path).unwrap();
        let loaded = Config::load(&config_path).unwrap();

        assert_eq!(loaded.backend.api_token.as_deref(), Some("secret"));
        assert_eq!(loaded.device.device_id.as_deref(), Some("AA:BB:CC:DD:EE:FF"));
        assert_eq!(loaded.queue.path, PathBuf::from("/tmp/caremon-test.db"));
        let location = loaded.location.unwrap().to_location();
        assert_eq!(location.source, LocationSource::Manual);
        assert_eq!(location.accuracy, Some(25.0));
    }

    #[test]
    fn test_validation_collects_every_error() {
        let mut config = Config::default();
        config.backend.base_url = "ftp://nope".to_string();
        config.buffer.max_buffer_size = 0;
        config.queue.max_retries = 0;
        config.signal.rssi_floor = -40;

        let Err(ConfigError::Validation(errors)) = config.validate() else {
            panic!("expected validation errors");
        };
        let fields: Vec<_> = errors.iter().map(|e| e.field.as_str()).collect();
        assert!(fields.contains(&"backend.base_url"));
        assert!(fields.contains(&"buffer.max_buffer_size"));
        assert!(fields.contains(&"queue.max_retries"));
        assert!(fields.contains(&"signal.rssi_floor"));
    }

    #[test]
    fn test_blank_fingerprint_rejected() {
        let device = DeviceConfig {
            fingerprint: Some(" - ".to_string()),
            ..DeviceConfig::default()
        };
        let errors = device.validate();
        assert_eq!(errors.len(), 1);
        assert!(errors[0].message.contains("blank"));
    }

    #[test]
    fn test_probe_timeout_bounded_by_interval() {
        let reachability = ReachabilityConfig {
            probe_interval_secs: 5,
            probe_timeout_secs: 10,
            ..ReachabilityConfig::default()
        };
        assert_eq!(reachability.validate().len(), 1);
    }

    #[test]
    fn test_load_missing_file() {
        let err = Config::load("/definitely/not/here/agent.toml").unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }

    #[test]
    fn test_config_validation_error_display() {
        let errors = vec![
            ValidationError {
                field: "backend.base_url".to_string(),
                message: "base URL cannot be empty".to_string(),
            },
            ValidationError {
                field: "queue.max_retries".to_string(),
                message: "max retries must be at least 1".to_string(),
            },
        ];
        let display = ConfigError::Validation(errors).to_string();
        assert!(display.contains("backend.base_url"));
        assert!(display.contains("queue.max_retries"));
    }
}
