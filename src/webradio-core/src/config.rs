use crate::paths::AppDirs;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

const CURRENT_CONFIG_VERSION: u32 = 1;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default = "default_config_version")]
    pub config_version: u32,
    #[serde(default)]
    pub player: PlayerConfig,
    #[serde(default)]
    pub events: EventsConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            config_version: default_config_version(),
            player: PlayerConfig::default(),
            events: EventsConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

/// Settings for the external player process and the controller driving it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlayerConfig {
    /// Player executable, looked up on `PATH` when not absolute.
    #[serde(default = "default_executable")]
    pub executable: String,
    /// Arguments that put the player into remote-control mode.
    #[serde(default = "default_player_args")]
    pub args: Vec<String>,
    /// Additional user arguments appended after `args`.
    #[serde(default)]
    pub extra_args: Vec<String>,
    /// Volume used when no persisted state exists.
    #[serde(default = "default_vol_default")]
    pub vol_default: u8,
    /// Step used by volume up/down when no explicit amount is given.
    #[serde(default = "default_vol_delta")]
    pub vol_delta: u8,
    /// Maximum wait for an acknowledgement line; 0 waits indefinitely.
    #[serde(default = "default_ack_timeout_ms")]
    pub ack_timeout_ms: u64,
    /// How long `destroy` waits for the process to exit after `QUIT`.
    #[serde(default = "default_shutdown_grace_secs")]
    pub shutdown_grace_secs: u64,
}

impl Default for PlayerConfig {
    fn default() -> Self {
        Self {
            executable: default_executable(),
            args: default_player_args(),
            extra_args: Vec::new(),
            vol_default: default_vol_default(),
            vol_delta: default_vol_delta(),
            ack_timeout_ms: default_ack_timeout_ms(),
            shutdown_grace_secs: default_shutdown_grace_secs(),
        }
    }
}

impl PlayerConfig {
    /// Full argument list passed to the executable.
    pub fn command_args(&self) -> Vec<String> {
        self.args
            .iter()
            .chain(self.extra_args.iter())
            .cloned()
            .collect()
    }

    pub fn ack_timeout(&self) -> Option<Duration> {
        match self.ack_timeout_ms {
            0 => None,
            ms => Some(Duration::from_millis(ms)),
        }
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventsConfig {
    /// Bounded wait of the dispatcher's pop, which is also the shutdown latency.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

impl Default for EventsConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval_ms(),
        }
    }
}

impl EventsConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: LogLevel,
    #[serde(default = "default_max_log_files")]
    pub max_log_files: usize,
    /// Mirror log output to stderr in addition to the log file.
    #[serde(default)]
    pub console: bool,
    #[serde(default)]
    pub file_name: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            max_log_files: default_max_log_files(),
            console: false,
            file_name: None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

impl From<LogLevel> for tracing::Level {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Trace => tracing::Level::TRACE,
            LogLevel::Debug => tracing::Level::DEBUG,
            LogLevel::Info => tracing::Level::INFO,
            LogLevel::Warn => tracing::Level::WARN,
            LogLevel::Error => tracing::Level::ERROR,
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config at {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse config at {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("config validation failed: {0}")]
    Validation(ValidationError),
    #[error("failed to prepare configuration directories: {0}")]
    Directories(#[from] crate::paths::DirsError),
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("unsupported config_version {found}, expected {expected}")]
    UnsupportedVersion { found: u32, expected: u32 },
    #[error("player.executable must not be empty")]
    EmptyExecutable,
    #[error("player.{field} must be within 0..=100, got {value}")]
    VolumeOutOfRange { field: &'static str, value: u8 },
    #[error("events.poll_interval_ms must be greater than zero")]
    ZeroPollInterval,
}

impl Config {
    pub fn load_or_default(dirs: &AppDirs) -> Result<Self, ConfigError> {
        dirs.ensure_exists()?;
        let path = Self::config_path(dirs);
        if !path.exists() {
            return Ok(Self::default());
        }
        Self::load_from(&path)
    }

    /// Load and validate a config file at an explicit location.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Config = toml::from_str(&contents).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        config.validate().map_err(ConfigError::Validation)?;
        Ok(config)
    }

    pub fn config_path(dirs: &AppDirs) -> PathBuf {
        dirs.config_dir().join("config.toml")
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.config_version != CURRENT_CONFIG_VERSION {
            return Err(ValidationError::UnsupportedVersion {
                found: self.config_version,
                expected: CURRENT_CONFIG_VERSION,
            });
        }
        if self.player.executable.trim().is_empty() {
            return Err(ValidationError::EmptyExecutable);
        }
        for (field, value) in [
            ("vol_default", self.player.vol_default),
            ("vol_delta", self.player.vol_delta),
        ] {
            if value > 100 {
                return Err(ValidationError::VolumeOutOfRange { field, value });
            }
        }
        if self.events.poll_interval_ms == 0 {
            return Err(ValidationError::ZeroPollInterval);
        }
        Ok(())
    }
}

fn default_config_version() -> u32 {
    CURRENT_CONFIG_VERSION
}

fn default_executable() -> String {
    "mpg123".to_string()
}

fn default_player_args() -> Vec<String> {
    vec!["-R".to_string()]
}

fn default_vol_default() -> u8 {
    30
}

fn default_vol_delta() -> u8 {
    5
}

fn default_ack_timeout_ms() -> u64 {
    10_000
}

fn default_shutdown_grace_secs() -> u64 {
    5
}

fn default_poll_interval_ms() -> u64 {
    1_000
}

fn default_log_level() -> LogLevel {
    LogLevel::Info
}

fn default_max_log_files() -> usize {
    7
}
