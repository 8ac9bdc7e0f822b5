//! Configuration loading and types for formstash.
//!
//! Configuration is read from a YAML file and deserialized into the
//! [`Config`] struct.  Each subsection governs a different part of the
//! system: networking, multipart limits, upload rules, file storage,
//! logging and metrics.  Every section may be omitted.

use serde::Deserialize;
use std::path::Path;

use crate::source::form_data::PartLimits;

/// Top-level configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    /// HTTP server settings.
    #[serde(default)]
    pub server: ServerConfig,

    /// Per-request multipart limits.
    #[serde(default)]
    pub limits: LimitsConfig,

    /// Which files are accepted and how they are named.
    #[serde(default)]
    pub uploads: UploadsConfig,

    /// File storage backend settings.
    #[serde(default)]
    pub storage: StorageConfig,

    /// Logging settings.
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Observability settings.
    #[serde(default)]
    pub observability: ObservabilityConfig,
}

/// HTTP listener configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Bind host address.
    #[serde(default = "default_host")]
    pub host: String,

    /// Bind port.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Graceful shutdown timeout in seconds.
    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            shutdown_timeout: default_shutdown_timeout(),
        }
    }
}

/// Multipart limits.  A missing or `null` entry means unlimited, except
/// for the two field size limits which have defaults.
#[derive(Debug, Clone, Deserialize)]
pub struct LimitsConfig {
    /// Max field name length in bytes.
    #[serde(default = "default_field_name_size")]
    pub field_name_size: Option<usize>,

    /// Max field value length in bytes.
    #[serde(default = "default_field_size")]
    pub field_size: Option<usize>,

    /// Max number of non-file fields.
    #[serde(default)]
    pub fields: Option<usize>,

    /// Max size of a single file in bytes.
    #[serde(default)]
    pub file_size: Option<u64>,

    /// Max number of files.
    #[serde(default)]
    pub files: Option<usize>,

    /// Max number of parts (fields + files).
    #[serde(default)]
    pub parts: Option<usize>,

    /// Max number of keys in one bracketed field name (`a[b][c]` has 3).
    #[serde(default)]
    pub field_keys: Option<usize>,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            field_name_size: default_field_name_size(),
            field_size: default_field_size(),
            fields: None,
            file_size: None,
            files: None,
            parts: None,
            field_keys: None,
        }
    }
}

impl LimitsConfig {
    /// Limits enforced by the multipart source.
    pub fn part_limits(&self) -> PartLimits {
        PartLimits {
            field_name_size: self.field_name_size,
            field_size: self.field_size,
            fields: self.fields,
            file_size: self.file_size,
            files: self.files,
            parts: self.parts,
        }
    }
}

/// Upload acceptance rules.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct UploadsConfig {
    /// Keep directory components of client filenames.
    #[serde(default)]
    pub preserve_path: bool,

    /// Field names allowed to carry files.  Empty allows any field.
    #[serde(default)]
    pub allowed_fields: Vec<String>,

    /// Accepted content types (`type/subtype` or `type/*`).  Files of other
    /// types are skipped.  Empty accepts every type.
    #[serde(default)]
    pub allowed_types: Vec<String>,
}

/// File storage backend configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    /// Backend type: `disk` or `memory`.
    #[serde(default = "default_storage_backend")]
    pub backend: String,

    /// Disk storage configuration.
    #[serde(default)]
    pub disk: DiskStorageConfig,

    /// Memory storage configuration.
    #[serde(default)]
    pub memory: MemoryStorageConfig,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: default_storage_backend(),
            disk: DiskStorageConfig::default(),
            memory: MemoryStorageConfig::default(),
        }
    }
}

/// Disk storage configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct DiskStorageConfig {
    /// Root directory for stored files.
    #[serde(default = "default_storage_root")]
    pub root_dir: String,
}

impl Default for DiskStorageConfig {
    fn default() -> Self {
        Self {
            root_dir: default_storage_root(),
        }
    }
}

/// Memory storage backend configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct MemoryStorageConfig {
    /// Maximum total size in bytes (0 = unlimited).
    #[serde(default)]
    pub max_size_bytes: u64,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level: trace, debug, info, warn, error.
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format: text or json.
    #[serde(default = "default_log_format")]
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

/// Observability settings.
#[derive(Debug, Clone, Deserialize)]
pub struct ObservabilityConfig {
    /// Enable Prometheus metrics collection and `/metrics` endpoint.
    #[serde(default = "default_true")]
    pub metrics: bool,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self { metrics: true }
    }
}

// -- Defaults ----------------------------------------------------------------

fn default_true() -> bool {
    true
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    9013
}

fn default_shutdown_timeout() -> u64 {
    30
}

fn default_field_name_size() -> Option<usize> {
    Some(100)
}

fn default_field_size() -> Option<usize> {
    Some(1024 * 1024)
}

fn default_storage_backend() -> String {
    "disk".to_string()
}

fn default_storage_root() -> String {
    "./data/uploads".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "text".to_string()
}

// -- Loader ------------------------------------------------------------------

/// Load and parse configuration from a YAML file at `path`.
pub fn load_config<P: AsRef<Path>>(path: P) -> anyhow::Result<Config> {
    let contents = std::fs::read_to_string(path.as_ref())?;
    let config: Config = serde_yaml::from_str(&contents)?;
    Ok(config)
}
