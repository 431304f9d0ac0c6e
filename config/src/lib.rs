// config/src/lib.rs

use serde::{Deserialize, Serialize};
use std::env;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Errors that can occur when loading or saving configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),
    #[error("Failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("Failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),
    #[error("Config file not found at: {0}")]
    NotFound(PathBuf),
    #[error("Could not determine home directory")]
    NoHomeDir,
}

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Bitcoin Core RPC connection settings
    pub bitcoind: BitcoindConfig,
    /// Logging configuration
    pub logging: LoggingConfig,
    /// Receiver HTTP server settings
    pub server: ServerConfig,
    /// Where completed exchanges are persisted
    pub persist: PersistConfig,
}

/// Bitcoin Core RPC connection settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BitcoindConfig {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub pass: String,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub verbose: bool,
}

/// Receiver HTTP server settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub port: u16,
}

/// Where the receiver writes completed exchange records (see §6 of SPEC_FULL.md)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PersistConfig {
    pub data_dir: PathBuf,
}

impl Config {
    /// Load configuration from a TOML file at `path`
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(ConfigError::NotFound(path.to_path_buf()));
        }
        let contents = std::fs::read_to_string(path)?;
        let config = toml::from_str(&contents)?;
        Ok(config)
    }

    /// Load configuration from `path` if given, otherwise from the default
    /// location if it exists, otherwise fall back to defaults.
    pub fn load(path: Option<PathBuf>) -> Result<Self, ConfigError> {
        if let Some(path) = path {
            return Self::from_file(path);
        }
        let default = Self::default_path()?;
        if default.exists() {
            Self::from_file(default)
        } else {
            Ok(Self::default())
        }
    }

    /// Save this configuration as a pretty-printed TOML file at `path`
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        let contents = toml::to_string_pretty(self)?;
        std::fs::write(path, contents)?;
        Ok(())
    }

    /// Returns the default config file path: `{config_dir()}/bustapay/config.toml`
    pub fn default_path() -> Result<PathBuf, ConfigError> {
        let config_dir = dirs::config_dir()
            .ok_or(ConfigError::NoHomeDir)?
            .join("bustapay");
        Ok(config_dir.join("config.toml"))
    }

    /// Returns the default data directory: `{home_dir()}/.bustapay/data`
    fn default_data_dir() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".bustapay")
            .join("data")
    }

    /// Apply environment overrides over whatever was loaded from file/defaults.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(v) = env::var("BITCOIND_HOST") {
            self.bitcoind.host = v;
        }
        if let Ok(v) = env::var("BITCOIND_PORT") {
            if let Ok(port) = v.parse() {
                self.bitcoind.port = port;
            }
        }
        if let Ok(v) = env::var("BITCOIND_USER") {
            self.bitcoind.user = v;
        }
        if let Ok(v) = env::var("BITCOIND_PASS") {
            self.bitcoind.pass = v;
        }
        if let Ok(v) = env::var("BUSTAPAY_VERBOSE") {
            if let Ok(b) = v.parse() {
                self.logging.verbose = b;
            }
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bitcoind: BitcoindConfig::default(),
            logging: LoggingConfig::default(),
            server: ServerConfig::default(),
            persist: PersistConfig::default(),
        }
    }
}

impl Default for BitcoindConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 18443,
            user: "rpcuser".to_string(),
            pass: "rpcpassword".to_string(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self { verbose: false }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self { port: 8080 }
    }
}

impl Default for PersistConfig {
    fn default() -> Self {
        Self {
            data_dir: Config::default_data_dir(),
        }
    }
}
