//! Configuration management
//!
//! This module handles loading, validation, and management of the AIRI configuration.
//! Configuration is stored in TOML format at ~/.airi/config.toml.
//!
//! # Configuration Sections
//!
//! - **core**: Log level, data directory
//! - **server**: Listen address, CORS origins, session user
//! - **client**: Server URL, reconnect backoff, keepalive interval
//! - **memory**: Short-term ceiling and importance scores
//! - **responder**: Provider labels and character name used in replies
//!
//! # Environment Overrides
//!
//! `PORT` replaces `server.port` when set to a valid port number.
//!
//! # Examples
//!
//! ```no_run
//! use airi_engine::config::Config;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = Config::load_or_create()?;
//! println!("Listening on port {}", config.server.port);
//! # Ok(())
//! # }
//! ```

use sdk::errors::EngineError;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Core engine settings
    pub core: CoreConfig,

    /// Server settings
    #[serde(default)]
    pub server: ServerConfig,

    /// Client (reconnect supervisor) settings
    #[serde(default)]
    pub client: ClientConfig,

    /// Memory ledger settings
    #[serde(default)]
    pub memory: MemoryConfig,

    /// Canned responder settings
    #[serde(default)]
    pub responder: ResponderConfig,
}

/// Core engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoreConfig {
    /// Log level (error, warn, info, debug, trace)
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Data directory path (supports ~ expansion)
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
}

/// HTTP / WebSocket server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Interface to bind
    #[serde(default = "default_host")]
    pub host: String,

    /// Listen port (overridden by the PORT environment variable)
    #[serde(default = "default_port")]
    pub port: u16,

    /// Origins allowed by the CORS layer
    #[serde(default = "default_allowed_origins")]
    pub allowed_origins: Vec<String>,

    /// Username every WebSocket session is attributed to
    #[serde(default = "default_user")]
    pub default_user: String,
}

/// Client configuration for connecting to a server
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// WebSocket URL to connect to
    #[serde(default = "default_client_url")]
    pub url: String,

    /// First reconnect delay in milliseconds
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,

    /// Upper bound on the reconnect delay in milliseconds
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,

    /// Seconds between keepalive pings while connected
    #[serde(default = "default_keepalive_secs")]
    pub keepalive_secs: u64,

    /// Seconds to wait for a connection before giving up on an attempt
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
}

/// Memory ledger configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryConfig {
    /// Ceiling applied to the reported short-term count
    #[serde(default = "default_short_term_ceiling")]
    pub short_term_ceiling: u64,

    /// Display ceiling for long-term memories
    #[serde(default = "default_long_term_ceiling")]
    pub long_term_ceiling: u64,

    /// Importance given to recorded user utterances
    #[serde(default = "default_user_importance")]
    pub user_importance: f64,

    /// Importance given to recorded agent replies
    #[serde(default = "default_reply_importance")]
    pub reply_importance: f64,

    /// Importance floor applied on promotion
    #[serde(default = "default_promotion_floor")]
    pub promotion_floor: f64,
}

/// Canned responder configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponderConfig {
    /// Provider label reported in `ai_response` metadata
    #[serde(default = "default_provider")]
    pub provider: String,

    /// Model label reported in `ai_response` metadata
    #[serde(default = "default_model")]
    pub model: String,

    /// Name the character introduces itself with
    #[serde(default = "default_character_name")]
    pub character_name: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            allowed_origins: default_allowed_origins(),
            default_user: default_user(),
        }
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            url: default_client_url(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            keepalive_secs: default_keepalive_secs(),
            connect_timeout_secs: default_connect_timeout_secs(),
        }
    }
}

impl ClientConfig {
    pub fn base_delay(&self) -> Duration {
        Duration::from_millis(self.base_delay_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }

    pub fn keepalive_interval(&self) -> Duration {
        Duration::from_secs(self.keepalive_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            short_term_ceiling: default_short_term_ceiling(),
            long_term_ceiling: default_long_term_ceiling(),
            user_importance: default_user_importance(),
            reply_importance: default_reply_importance(),
            promotion_floor: default_promotion_floor(),
        }
    }
}

impl Default for ResponderConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: default_model(),
            character_name: default_character_name(),
        }
    }
}

// Default value functions
fn default_log_level() -> String {
    "info".to_string()
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("~/.airi")
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    6121
}

fn default_allowed_origins() -> Vec<String> {
    vec!["http://localhost:5174".to_string()]
}

fn default_user() -> String {
    "guest".to_string()
}

fn default_client_url() -> String {
    "ws://localhost:6121/ws".to_string()
}

fn default_base_delay_ms() -> u64 {
    1000
}

fn default_max_delay_ms() -> u64 {
    30_000
}

fn default_keepalive_secs() -> u64 {
    30
}

fn default_connect_timeout_secs() -> u64 {
    10
}

fn default_short_term_ceiling() -> u64 {
    50
}

fn default_long_term_ceiling() -> u64 {
    500
}

fn default_user_importance() -> f64 {
    0.6
}

fn default_reply_importance() -> f64 {
    0.7
}

fn default_promotion_floor() -> f64 {
    0.8
}

fn default_provider() -> String {
    "openai".to_string()
}

fn default_model() -> String {
    "gpt-4".to_string()
}

fn default_character_name() -> String {
    "AIRI".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self::default_config()
    }
}

impl Config {
    /// Load configuration from the default location (~/.airi/config.toml)
    ///
    /// If the configuration file doesn't exist, creates a default configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - Configuration file cannot be read
    /// - TOML parsing fails
    /// - Validation fails
    pub fn load_or_create() -> Result<Self, EngineError> {
        let config_path = Self::default_config_path()?;

        if config_path.exists() {
            Self::load_from_path(&config_path)
        } else {
            Self::create_default(&config_path)
        }
    }

    /// Load configuration from a specific path
    pub fn load_from_path(path: &Path) -> Result<Self, EngineError> {
        let contents = fs::read_to_string(path)
            .map_err(|e| EngineError::Config(format!("Failed to read config file: {}", e)))?;

        Self::from_toml_str(&contents)
    }

    /// Parse, apply environment overrides and validate a TOML document
    pub fn from_toml_str(contents: &str) -> Result<Self, EngineError> {
        let mut config: Config = toml::from_str(contents)
            .map_err(|e| EngineError::Config(format!("Failed to parse config: {}", e)))?;

        config.apply_env_overrides(std::env::var("PORT").ok().as_deref())?;
        config.validate_and_process()?;

        Ok(config)
    }

    /// Create default configuration and save to path
    fn create_default(path: &Path) -> Result<Self, EngineError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| {
                EngineError::Config(format!("Failed to create config directory: {}", e))
            })?;
        }

        let mut config = Self::default_config();

        // Persist the file before env overrides so PORT is never written to disk
        let toml_string = toml::to_string_pretty(&config)
            .map_err(|e| EngineError::Config(format!("Failed to serialize config: {}", e)))?;

        fs::write(path, toml_string)
            .map_err(|e| EngineError::Config(format!("Failed to write config file: {}", e)))?;

        config.apply_env_overrides(std::env::var("PORT").ok().as_deref())?;
        config.validate_and_process()?;

        Ok(config)
    }

    /// Get the default configuration file path (~/.airi/config.toml)
    fn default_config_path() -> Result<PathBuf, EngineError> {
        let home = dirs::home_dir()
            .ok_or_else(|| EngineError::Config("Could not determine home directory".to_string()))?;

        Ok(home.join(".airi").join("config.toml"))
    }

    /// Create a default configuration
    fn default_config() -> Self {
        Self {
            core: CoreConfig {
                log_level: default_log_level(),
                data_dir: default_data_dir(),
            },
            server: ServerConfig::default(),
            client: ClientConfig::default(),
            memory: MemoryConfig::default(),
            responder: ResponderConfig::default(),
        }
    }

    /// Apply the `PORT` override, if any
    fn apply_env_overrides(&mut self, port: Option<&str>) -> Result<(), EngineError> {
        if let Some(raw) = port {
            self.server.port = raw.trim().parse().map_err(|_| {
                EngineError::Config(format!("PORT must be a port number, got '{}'", raw))
            })?;
        }
        Ok(())
    }

    /// Validate and process configuration
    ///
    /// This method:
    /// - Validates the log level and numeric ranges
    /// - Expands ~ in the data directory
    fn validate_and_process(&mut self) -> Result<(), EngineError> {
        let valid_log_levels = ["error", "warn", "info", "debug", "trace"];
        if !valid_log_levels.contains(&self.core.log_level.as_str()) {
            return Err(EngineError::Config(format!(
                "Invalid log level '{}'. Must be one of: {}",
                self.core.log_level,
                valid_log_levels.join(", ")
            )));
        }

        if self.server.port == 0 {
            return Err(EngineError::Config("server.port must not be 0".to_string()));
        }

        if self.client.base_delay_ms == 0 || self.client.base_delay_ms > self.client.max_delay_ms
        {
            return Err(EngineError::Config(
                "client.base_delay_ms must be > 0 and <= client.max_delay_ms".to_string(),
            ));
        }

        if self.client.keepalive_secs == 0 {
            return Err(EngineError::Config(
                "client.keepalive_secs must be > 0".to_string(),
            ));
        }

        for (name, value) in [
            ("user_importance", self.memory.user_importance),
            ("reply_importance", self.memory.reply_importance),
            ("promotion_floor", self.memory.promotion_floor),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(EngineError::Config(format!(
                    "memory.{} must be between 0.0 and 1.0",
                    name
                )));
            }
        }

        self.core.data_dir = expand_path(&self.core.data_dir)?;

        Ok(())
    }

    /// Path of the SQLite database inside the data directory
    pub fn db_path(&self) -> PathBuf {
        self.core.data_dir.join("airi.db")
    }
}

/// Expand ~ in path to user's home directory
fn expand_path(path: &Path) -> Result<PathBuf, EngineError> {
    let path_str = path
        .to_str()
        .ok_or_else(|| EngineError::Config("Invalid UTF-8 in path".to_string()))?;

    if let Some(rest) = path_str.strip_prefix("~/") {
        let home = dirs::home_dir()
            .ok_or_else(|| EngineError::Config("Could not determine home directory".to_string()))?;

        Ok(home.join(rest))
    } else if path_str == "~" {
        dirs::home_dir()
            .ok_or_else(|| EngineError::Config("Could not determine home directory".to_string()))
    } else {
        Ok(path.to_path_buf())
    }
}
