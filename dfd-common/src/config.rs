//! Configuration loading and resolution
//!
//! Every setting is resolved independently in this priority order:
//! 1. Command-line argument (highest priority)
//! 2. Environment variable (`DFD_*`, surfaced through the CLI layer)
//! 3. TOML config file
//! 4. Compiled default (fallback)
//!
//! A missing default config file is not an error: the service starts with
//! compiled defaults. An explicitly requested file that is missing or
//! malformed aborts startup.

use crate::{Error, Result};
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

/// Total multipart body ceiling (10 MiB)
pub const DEFAULT_MAX_BODY_BYTES: usize = 10 * 1024 * 1024;

/// Default classifier deadline
pub const DEFAULT_CLASSIFIER_TIMEOUT_SECS: u64 = 300;

/// Default time a request may wait for a classifier slot
pub const DEFAULT_ADMISSION_WAIT_SECS: u64 = 30;

/// Default number of requests allowed to wait for a classifier slot
pub const DEFAULT_MAX_WAITING: usize = 16;

/// Default interval between retention sweeps
pub const DEFAULT_SWEEP_INTERVAL_SECS: u64 = 300;

/// How uploaded files are named inside the working directory
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageNaming {
    /// Random storage key (`<uuid>.<ext>`), declared name kept as metadata only
    #[default]
    Unique,
    /// Sanitized client-declared basename; same name overwrites the previous file
    Declared,
}

impl FromStr for StorageNaming {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "unique" => Ok(StorageNaming::Unique),
            "declared" => Ok(StorageNaming::Declared),
            other => Err(Error::InvalidInput(format!(
                "unknown storage naming '{}' (expected 'unique' or 'declared')",
                other
            ))),
        }
    }
}

/// How classifier output is turned into a verdict
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VerdictMode {
    /// Exact byte match against `real`, everything else takes the other branch
    #[default]
    Legacy,
    /// Trimmed output must be `real` or `fake`; anything else is an error
    Strict,
}

impl FromStr for VerdictMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "legacy" => Ok(VerdictMode::Legacy),
            "strict" => Ok(VerdictMode::Strict),
            other => Err(Error::InvalidInput(format!(
                "unknown verdict mode '{}' (expected 'legacy' or 'strict')",
                other
            ))),
        }
    }
}

/// `[classifier]` table of the TOML file
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ClassifierToml {
    pub program: Option<String>,
    pub args: Option<Vec<String>>,
    pub timeout_secs: Option<u64>,
    pub max_concurrent: Option<usize>,
    pub admission_wait_secs: Option<u64>,
    pub max_waiting: Option<usize>,
}

/// `[retention]` table of the TOML file
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RetentionToml {
    pub keep_uploads: Option<bool>,
    pub max_files: Option<usize>,
    pub max_total_bytes: Option<u64>,
    pub max_age_secs: Option<u64>,
    pub sweep_interval_secs: Option<u64>,
}

/// `[logging]` table of the TOML file
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LoggingToml {
    pub level: Option<String>,
}

/// On-disk TOML configuration. Every field is optional.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TomlConfig {
    pub bind_addr: Option<String>,
    pub uploads_dir: Option<PathBuf>,
    pub static_dir: Option<PathBuf>,
    pub template_path: Option<PathBuf>,
    pub max_body_bytes: Option<usize>,
    pub allowed_extensions: Option<Vec<String>>,
    pub storage_naming: Option<StorageNaming>,
    pub verdict_mode: Option<VerdictMode>,
    pub classifier: ClassifierToml,
    pub retention: RetentionToml,
    pub logging: LoggingToml,
}

impl TomlConfig {
    /// Parse a TOML config file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|source| Error::ConfigRead {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&content, path)
    }

    fn parse(content: &str, path: &Path) -> Result<Self> {
        toml::from_str(content).map_err(|source| Error::Toml {
            path: path.display().to_string(),
            source,
        })
    }
}

/// Values supplied on the command line or through `DFD_*` environment variables
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub config_path: Option<PathBuf>,
    pub bind_addr: Option<String>,
    pub uploads_dir: Option<PathBuf>,
    pub static_dir: Option<PathBuf>,
    pub template_path: Option<PathBuf>,
    pub max_body_bytes: Option<usize>,
    pub storage_naming: Option<StorageNaming>,
    pub verdict_mode: Option<VerdictMode>,
    pub classifier_program: Option<String>,
    pub classifier_args: Option<Vec<String>>,
    pub classifier_timeout_secs: Option<u64>,
    pub max_concurrent: Option<usize>,
    pub log_level: Option<String>,
}

/// External classifier invocation settings
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassifierConfig {
    /// Executable to launch
    pub program: String,
    /// Fixed leading arguments; the stored file path is appended after these
    pub args: Vec<String>,
    /// Deadline for a single invocation
    pub timeout: Duration,
    /// Maximum number of classifier processes running at once
    pub max_concurrent: usize,
    /// How long a request waits for a free slot before being rejected
    pub admission_wait: Duration,
    /// Requests allowed to wait for a slot at once; later ones are rejected
    /// immediately
    pub max_waiting: usize,
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            program: "python".to_string(),
            args: vec!["python_script.py".to_string()],
            timeout: Duration::from_secs(DEFAULT_CLASSIFIER_TIMEOUT_SECS),
            max_concurrent: default_concurrency(),
            admission_wait: Duration::from_secs(DEFAULT_ADMISSION_WAIT_SECS),
            max_waiting: DEFAULT_MAX_WAITING,
        }
    }
}

/// Working directory retention policy
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetentionConfig {
    /// Keep stored uploads after the response is sent
    pub keep_uploads: bool,
    pub max_files: Option<usize>,
    pub max_total_bytes: Option<u64>,
    pub max_age: Option<Duration>,
    pub sweep_interval: Duration,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            keep_uploads: true,
            max_files: None,
            max_total_bytes: None,
            max_age: None,
            sweep_interval: Duration::from_secs(DEFAULT_SWEEP_INTERVAL_SECS),
        }
    }
}

impl RetentionConfig {
    /// True when at least one eviction limit is configured
    pub fn has_limits(&self) -> bool {
        self.max_files.is_some() || self.max_total_bytes.is_some() || self.max_age.is_some()
    }
}

/// Logging settings
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoggingConfig {
    /// Default filter directive when `RUST_LOG` is not set
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

/// Fully resolved service configuration
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub bind_addr: SocketAddr,
    pub uploads_dir: PathBuf,
    pub static_dir: PathBuf,
    pub template_path: PathBuf,
    pub max_body_bytes: usize,
    /// Lowercase extensions without the dot; empty accepts every upload
    pub allowed_extensions: Vec<String>,
    pub storage_naming: StorageNaming,
    pub verdict_mode: VerdictMode,
    pub classifier: ClassifierConfig,
    pub retention: RetentionConfig,
    pub logging: LoggingConfig,
    /// TOML file the configuration was read from, if any
    pub config_file: Option<PathBuf>,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
            uploads_dir: PathBuf::from("uploads"),
            static_dir: PathBuf::from("static"),
            template_path: PathBuf::from("static").join("result.html"),
            max_body_bytes: DEFAULT_MAX_BODY_BYTES,
            allowed_extensions: Vec::new(),
            storage_naming: StorageNaming::default(),
            verdict_mode: VerdictMode::default(),
            classifier: ClassifierConfig::default(),
            retention: RetentionConfig::default(),
            logging: LoggingConfig::default(),
            config_file: None,
        }
    }
}

impl ServiceConfig {
    /// Locate and read the TOML file, merge it with overrides, and validate
    pub fn load(overrides: ConfigOverrides) -> Result<Self> {
        let config_file = locate_config_file(overrides.config_path.as_deref())?;
        let toml_config = match &config_file {
            Some(path) => TomlConfig::load(path)?,
            None => TomlConfig::default(),
        };

        let mut config = Self::resolve(overrides, toml_config)?;
        config.config_file = config_file;
        Ok(config)
    }

    /// Merge overrides over TOML values over compiled defaults
    pub fn resolve(overrides: ConfigOverrides, toml_config: TomlConfig) -> Result<Self> {
        let defaults = ServiceConfig::default();
        let TomlConfig {
            bind_addr,
            uploads_dir,
            static_dir,
            template_path,
            max_body_bytes,
            allowed_extensions,
            storage_naming,
            verdict_mode,
            classifier,
            retention,
            logging,
        } = toml_config;

        let bind_addr = match overrides.bind_addr.or(bind_addr) {
            Some(raw) => raw
                .parse::<SocketAddr>()
                .map_err(|e| Error::Config(format!("invalid bind_addr '{}': {}", raw, e)))?,
            None => defaults.bind_addr,
        };

        let static_dir = overrides
            .static_dir
            .or(static_dir)
            .unwrap_or(defaults.static_dir);

        // The template follows the static directory unless named explicitly
        let template_path = overrides
            .template_path
            .or(template_path)
            .unwrap_or_else(|| static_dir.join("result.html"));

        let classifier = ClassifierConfig {
            program: overrides
                .classifier_program
                .or(classifier.program)
                .unwrap_or(defaults.classifier.program),
            args: overrides
                .classifier_args
                .or(classifier.args)
                .unwrap_or(defaults.classifier.args),
            timeout: overrides
                .classifier_timeout_secs
                .or(classifier.timeout_secs)
                .map(Duration::from_secs)
                .unwrap_or(defaults.classifier.timeout),
            max_concurrent: overrides
                .max_concurrent
                .or(classifier.max_concurrent)
                .unwrap_or(defaults.classifier.max_concurrent),
            admission_wait: classifier
                .admission_wait_secs
                .map(Duration::from_secs)
                .unwrap_or(defaults.classifier.admission_wait),
            max_waiting: classifier
                .max_waiting
                .unwrap_or(defaults.classifier.max_waiting),
        };

        let retention = RetentionConfig {
            keep_uploads: retention
                .keep_uploads
                .unwrap_or(defaults.retention.keep_uploads),
            max_files: retention.max_files,
            max_total_bytes: retention.max_total_bytes,
            max_age: retention.max_age_secs.map(Duration::from_secs),
            sweep_interval: retention
                .sweep_interval_secs
                .map(Duration::from_secs)
                .unwrap_or(defaults.retention.sweep_interval),
        };

        let config = ServiceConfig {
            bind_addr,
            uploads_dir: overrides
                .uploads_dir
                .or(uploads_dir)
                .unwrap_or(defaults.uploads_dir),
            static_dir,
            template_path,
            max_body_bytes: overrides
                .max_body_bytes
                .or(max_body_bytes)
                .unwrap_or(defaults.max_body_bytes),
            allowed_extensions: allowed_extensions
                .unwrap_or_default()
                .into_iter()
                .map(|ext| ext.trim().trim_start_matches('.').to_ascii_lowercase())
                .filter(|ext| !ext.is_empty())
                .collect(),
            storage_naming: overrides
                .storage_naming
                .or(storage_naming)
                .unwrap_or(defaults.storage_naming),
            verdict_mode: overrides
                .verdict_mode
                .or(verdict_mode)
                .unwrap_or(defaults.verdict_mode),
            classifier,
            retention,
            logging: LoggingConfig {
                level: overrides
                    .log_level
                    .or(logging.level)
                    .unwrap_or(defaults.logging.level),
            },
            config_file: None,
        };

        config.validate()?;
        Ok(config)
    }

    /// Reject settings the service cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.max_body_bytes == 0 {
            return Err(Error::Config("max_body_bytes must be greater than 0".to_string()));
        }
        if self.classifier.program.trim().is_empty() {
            return Err(Error::Config("classifier program must not be empty".to_string()));
        }
        if self.classifier.timeout.is_zero() {
            return Err(Error::Config("classifier timeout must be greater than 0".to_string()));
        }
        if self.classifier.max_concurrent == 0 {
            return Err(Error::Config(
                "classifier max_concurrent must be at least 1".to_string(),
            ));
        }
        if self.retention.sweep_interval.is_zero() {
            return Err(Error::Config(
                "retention sweep_interval_secs must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }
}

/// Find the config file to load.
///
/// An explicit path must exist. Otherwise the platform config directory is
/// tried (`~/.config/dfd/config.toml` on Linux, then `/etc/dfd/config.toml`).
pub fn locate_config_file(explicit: Option<&Path>) -> Result<Option<PathBuf>> {
    if let Some(path) = explicit {
        if path.is_file() {
            return Ok(Some(path.to_path_buf()));
        }
        return Err(Error::Config(format!(
            "Config file not found: {}",
            path.display()
        )));
    }

    if let Some(user_config) = dirs::config_dir().map(|d| d.join("dfd").join("config.toml")) {
        if user_config.is_file() {
            return Ok(Some(user_config));
        }
    }

    if cfg!(target_os = "linux") {
        let system_config = PathBuf::from("/etc/dfd/config.toml");
        if system_config.is_file() {
            return Ok(Some(system_config));
        }
    }

    Ok(None)
}

fn default_concurrency() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
}
