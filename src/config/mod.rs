//! Configuration management for mcp-session
//!
//! This module handles loading, parsing, and managing configuration from:
//! 1. Embedded default_config.toml (compile-time defaults)
//! 2. User config at ~/.config/mcp-session/config.toml (or platform-specific location)
//! 3. Project-local config at ./.mcp-session/config.toml
//!
//! Later layers override earlier ones key by key.

use crate::error::TransportResult;
use crate::logging::{self, LogFormat};
use crate::session::{BackoffMode, ReconnectPolicy};
use crate::transport::{TransportConfig, TransportType};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default configuration embedded in binary
const DEFAULT_CONFIG: &str = include_str!("../../default_config.toml");

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SessionConfig {
    #[serde(default)]
    pub transport: TransportSection,
    #[serde(default)]
    pub session: SessionSection,
    #[serde(default)]
    pub logging: LoggingSection,
}

/// Which server to reach and how
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportSection {
    #[serde(rename = "type", default = "default_transport_type")]
    pub transport_type: String,
    #[serde(default)]
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default)]
    pub working_dir: Option<PathBuf>,
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default = "default_connect_timeout", with = "humantime_serde")]
    pub connect_timeout: Duration,
    #[serde(default = "default_request_timeout", with = "humantime_serde")]
    pub request_timeout: Duration,
    #[serde(default = "default_probe_timeout", with = "humantime_serde")]
    pub probe_timeout: Duration,
    #[serde(default)]
    pub debug: bool,
}

impl Default for TransportSection {
    fn default() -> Self {
        Self {
            transport_type: default_transport_type(),
            command: String::new(),
            args: Vec::new(),
            env: HashMap::new(),
            working_dir: None,
            url: String::new(),
            headers: HashMap::new(),
            connect_timeout: default_connect_timeout(),
            request_timeout: default_request_timeout(),
            probe_timeout: default_probe_timeout(),
            debug: false,
        }
    }
}

impl TransportSection {
    /// Runtime transport configuration; unknown `type` values are rejected
    pub fn to_transport_config(&self) -> TransportResult<TransportConfig> {
        let transport_type: TransportType = self.transport_type.parse()?;

        let mut config = match transport_type {
            TransportType::Stdio => TransportConfig::stdio(self.command.clone(), self.args.clone()),
            TransportType::Http => TransportConfig::http(self.url.clone()),
            TransportType::StreamableHttp => TransportConfig::streamable_http(self.url.clone()),
            TransportType::Sse => TransportConfig::sse(self.url.clone()),
        };
        config.env = self.env.clone();
        config.working_dir = self.working_dir.clone();
        config.headers = self.headers.clone();

        Ok(config
            .with_connect_timeout(self.connect_timeout)
            .with_request_timeout(self.request_timeout)
            .with_probe_timeout(self.probe_timeout)
            .with_debug(self.debug))
    }
}

/// Backoff mode as written in configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackoffSetting {
    #[default]
    Fixed,
    Exponential,
}

/// Reconnection and health monitoring
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSection {
    #[serde(default = "default_max_reconnect_attempts")]
    pub max_reconnect_attempts: u32,
    #[serde(default = "default_reconnect_delay", with = "humantime_serde")]
    pub reconnect_delay: Duration,
    #[serde(default)]
    pub backoff: BackoffSetting,
    #[serde(default = "default_max_reconnect_delay", with = "humantime_serde")]
    pub max_reconnect_delay: Duration,
    #[serde(default = "default_health_check_interval", with = "humantime_serde")]
    pub health_check_interval: Duration,
}

impl Default for SessionSection {
    fn default() -> Self {
        Self {
            max_reconnect_attempts: default_max_reconnect_attempts(),
            reconnect_delay: default_reconnect_delay(),
            backoff: BackoffSetting::Fixed,
            max_reconnect_delay: default_max_reconnect_delay(),
            health_check_interval: default_health_check_interval(),
        }
    }
}

impl SessionSection {
    pub fn reconnect_policy(&self) -> ReconnectPolicy {
        ReconnectPolicy {
            max_attempts: self.max_reconnect_attempts,
            delay: self.reconnect_delay,
            backoff: match self.backoff {
                BackoffSetting::Fixed => BackoffMode::Fixed,
                BackoffSetting::Exponential => BackoffMode::Exponential {
                    max_delay: self.max_reconnect_delay,
                },
            },
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingSection {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default = "default_log_format")]
    pub format: String,
    #[serde(default)]
    pub file_output: bool,
    #[serde(default)]
    pub file_path: Option<PathBuf>,
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
            file_output: false,
            file_path: None,
        }
    }
}

impl LoggingSection {
    pub fn to_logging_config(&self) -> logging::LoggingConfig {
        logging::LoggingConfig {
            level: logging::parse_level(&self.level),
            format: LogFormat::parse(&self.format),
            file_output: self.file_output,
            file_path: self.file_path.clone(),
        }
    }
}

// ============================================================================
// Default value functions
// ============================================================================

fn default_transport_type() -> String {
    "stdio".to_string()
}

fn default_connect_timeout() -> Duration {
    crate::transport::DEFAULT_CONNECT_TIMEOUT
}

fn default_request_timeout() -> Duration {
    crate::transport::DEFAULT_REQUEST_TIMEOUT
}

fn default_probe_timeout() -> Duration {
    crate::transport::DEFAULT_PROBE_TIMEOUT
}

fn default_max_reconnect_attempts() -> u32 {
    crate::session::DEFAULT_MAX_RECONNECT_ATTEMPTS
}

fn default_reconnect_delay() -> Duration {
    crate::session::DEFAULT_RECONNECT_DELAY
}

fn default_max_reconnect_delay() -> Duration {
    Duration::from_secs(30)
}

fn default_health_check_interval() -> Duration {
    crate::session::DEFAULT_HEALTH_CHECK_INTERVAL
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "compact".to_string()
}

// ============================================================================
// Loading
// ============================================================================

impl SessionConfig {
    /// Load configuration with fallback chain:
    /// 1. Project-local .mcp-session/config.toml
    /// 2. User config ~/.config/mcp-session/config.toml
    /// 3. Embedded default_config.toml
    pub fn load() -> Result<Self, ConfigError> {
        let mut merged = parse_table(DEFAULT_CONFIG, "default config")?;

        for path in [Self::user_config_path(), Self::project_config_path()]
            .into_iter()
            .flatten()
        {
            if !path.exists() {
                continue;
            }
            match read_table(&path) {
                Ok(overlay) => {
                    merge_tables(&mut merged, overlay);
                    tracing::info!("Loaded config from {:?}", path);
                }
                Err(e) => {
                    tracing::warn!("Failed to load config {:?}: {}", path, e);
                }
            }
        }

        toml::Value::Table(merged)
            .try_into()
            .map_err(|e| ConfigError::ParseError(format!("Invalid configuration: {}", e)))
    }

    /// Load configuration from a specific file layered over the defaults
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let mut merged = parse_table(DEFAULT_CONFIG, "default config")?;
        merge_tables(&mut merged, read_table(path)?);

        toml::Value::Table(merged).try_into().map_err(|e| {
            ConfigError::ParseError(format!("Failed to parse {}: {}", path.display(), e))
        })
    }

    /// Get the user config path (~/.config/mcp-session/config.toml)
    pub fn user_config_path() -> Option<PathBuf> {
        dirs::config_dir().map(|config_dir| config_dir.join("mcp-session").join("config.toml"))
    }

    /// Get the project-local config path (./.mcp-session/config.toml)
    pub fn project_config_path() -> Option<PathBuf> {
        std::env::current_dir()
            .ok()
            .map(|cwd| cwd.join(".mcp-session").join("config.toml"))
    }

    /// Write this configuration as TOML
    pub fn save_to(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| ConfigError::IoError(e.to_string()))?;
        }

        let toml_string =
            toml::to_string_pretty(self).map_err(|e| ConfigError::SerializeError(e.to_string()))?;

        std::fs::write(path, toml_string).map_err(|e| ConfigError::IoError(e.to_string()))
    }
}

fn read_table(path: &Path) -> Result<toml::Table, ConfigError> {
    let contents =
        std::fs::read_to_string(path).map_err(|e| ConfigError::IoError(e.to_string()))?;
    parse_table(&contents, &path.display().to_string())
}

fn parse_table(contents: &str, origin: &str) -> Result<toml::Table, ConfigError> {
    contents
        .parse::<toml::Table>()
        .map_err(|e| ConfigError::ParseError(format!("Failed to parse {}: {}", origin, e)))
}

/// Deep merge; tables merge recursively, any other value is replaced
fn merge_tables(base: &mut toml::Table, overlay: toml::Table) {
    for (key, value) in overlay {
        match (base.get_mut(&key), value) {
            (Some(toml::Value::Table(existing)), toml::Value::Table(incoming)) => {
                merge_tables(existing, incoming);
            }
            (_, value) => {
                base.insert(key, value);
            }
        }
    }
}

// ============================================================================
// Error handling
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    IoError(String),
    #[error("Parse error: {0}")]
    ParseError(String),
    #[error("Serialize error: {0}")]
    SerializeError(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_embedded_defaults() {
        let table = parse_table(DEFAULT_CONFIG, "default config").unwrap();
        let config: SessionConfig = toml::Value::Table(table).try_into().unwrap();
        assert_eq!(config.transport.transport_type, "stdio");
        assert_eq!(config.transport.probe_timeout, Duration::from_secs(5));
        assert_eq!(config.session.max_reconnect_attempts, 3);
        assert_eq!(config.session.reconnect_delay, Duration::from_secs(2));
        assert_eq!(config.session.health_check_interval, Duration::from_secs(30));
        assert_eq!(config.session.backoff, BackoffSetting::Fixed);
    }

    #[test]
    fn test_overlay_keeps_unset_keys() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
[transport]
type = "sse"
url = "http://localhost:9000/sse"

[session]
backoff = "exponential"
reconnect_delay = "500ms"
"#
        )
        .unwrap();

        let config = SessionConfig::load_from_file(file.path()).unwrap();
        assert_eq!(config.transport.transport_type, "sse");
        assert_eq!(config.transport.connect_timeout, Duration::from_secs(30));
        assert_eq!(config.session.max_reconnect_attempts, 3);

        let policy = config.session.reconnect_policy();
        assert_eq!(policy.delay, Duration::from_millis(500));
        assert_eq!(
            policy.backoff,
            BackoffMode::Exponential {
                max_delay: Duration::from_secs(30)
            }
        );
    }

    #[test]
    fn test_unknown_transport_type_rejected() {
        let section = TransportSection {
            transport_type: "carrier-pigeon".to_string(),
            ..Default::default()
        };
        assert!(matches!(
            section.to_transport_config(),
            Err(crate::error::TransportError::UnsupportedType(_))
        ));
    }

    #[test]
    fn test_to_transport_config() {
        let section = TransportSection {
            command: "npx".to_string(),
            args: vec!["-y".to_string(), "server".to_string()],
            env: HashMap::from([("TOKEN".to_string(), "abc".to_string())]),
            probe_timeout: Duration::from_secs(2),
            ..Default::default()
        };
        let config = section.to_transport_config().unwrap();
        assert_eq!(config.transport_type, TransportType::Stdio);
        assert_eq!(config.command, "npx");
        assert_eq!(config.env["TOKEN"], "abc");
        assert_eq!(config.probe_timeout, Duration::from_secs(2));
    }

    #[test]
    fn test_missing_file() {
        let err = SessionConfig::load_from_file(Path::new("/nonexistent/mcp-session.toml"))
            .unwrap_err();
        assert!(matches!(err, ConfigError::IoError(_)));
    }

    #[test]
    fn test_save_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");
        let mut config = SessionConfig::default();
        config.transport.url = "http://localhost:1234/mcp".to_string();
        config.save_to(&path).unwrap();

        let loaded = SessionConfig::load_from_file(&path).unwrap();
        assert_eq!(loaded.transport.url, "http://localhost:1234/mcp");
    }
}
