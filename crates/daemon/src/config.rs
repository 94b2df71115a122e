//! Configuration management for the shellgate daemon.
//!
//! This module provides TOML-based configuration file loading and saving.
//! The default configuration path is `~/.config/shellgate/config.toml`.

use std::fs;
use std::net::ToSocketAddrs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Configuration validation errors.
#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("address is not a valid listen address: {0}")]
    InvalidAddress(String),

    #[error("executable not found: {0}")]
    InvalidExecutable(String),

    #[error("log_level must be one of: trace, debug, info, warn, error; got {0}")]
    InvalidLogLevel(String),

    #[error("teardown_grace_secs must be between 1 and 300 seconds, got {0}")]
    InvalidTeardownGrace(u64),

    #[error("config_dir is not a directory: {0}")]
    InvalidConfigDir(String),
}

/// Valid log level values for tracing configuration.
const VALID_LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

/// Main configuration structure for the shellgate daemon.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct Config {
    /// General daemon configuration.
    pub daemon: DaemonConfig,

    /// SSH listener configuration.
    pub server: ServerConfig,

    /// Per-session configuration.
    pub session: SessionConfig,

    /// Authentication policy.
    pub auth: AuthConfig,
}

/// General daemon configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DaemonConfig {
    /// Logging level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Directory for daily rotated log files. Logs go to stderr when unset.
    pub log_dir: Option<PathBuf>,
}

/// SSH listener configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ServerConfig {
    /// Address to bind.
    pub address: String,

    /// Port to bind. 0 picks a free port.
    pub port: u16,

    /// Seconds without traffic before a connection is dropped (0 = never).
    pub idle_timeout_secs: u64,

    /// Program launched for every session.
    pub executable: String,

    /// Host private key. Defaults to `~/.ssh/id_rsa`.
    pub host_key: Option<PathBuf>,

    /// Seconds to wait for session output to drain after a disconnect.
    pub teardown_grace_secs: u64,
}

/// Per-session configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct SessionConfig {
    /// Directory for provisioned config files. Defaults to the system temp dir.
    pub config_dir: Option<PathBuf>,
}

/// Authentication configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct AuthConfig {
    /// SHA-256 fingerprints of client keys allowed to connect.
    /// Empty means every client is accepted.
    pub allowed_fingerprints: Vec<String>,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_dir: None,
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            address: "0.0.0.0".to_string(),
            port: 2222,
            idle_timeout_secs: 600, // 10 minutes
            executable: default_executable(),
            host_key: None,
            teardown_grace_secs: 5,
        }
    }
}

impl ServerConfig {
    /// Idle timeout, or `None` when disabled.
    pub fn idle_timeout(&self) -> Option<Duration> {
        (self.idle_timeout_secs > 0).then(|| Duration::from_secs(self.idle_timeout_secs))
    }

    pub fn teardown_grace(&self) -> Duration {
        Duration::from_secs(self.teardown_grace_secs)
    }

    /// Resolves the executable to an absolute path, searching `PATH` for
    /// bare names.
    pub fn resolved_executable(&self) -> Result<PathBuf, ConfigError> {
        let path = Path::new(&self.executable);
        if path.is_absolute() {
            if path.exists() {
                Ok(path.to_path_buf())
            } else {
                Err(ConfigError::InvalidExecutable(self.executable.clone()))
            }
        } else {
            which::which(&self.executable)
                .map_err(|_| ConfigError::InvalidExecutable(self.executable.clone()))
        }
    }
}

/// Returns the default configuration file path.
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("shellgate")
        .join("config.toml")
}

/// Returns the default program to launch: the user's shell.
fn default_executable() -> String {
    std::env::var("SHELL").unwrap_or_else(|_| "/bin/sh".to_string())
}

impl Config {
    /// Apply environment variable overrides to the configuration.
    ///
    /// Environment variables take precedence over config file values.
    /// Supported variables:
    /// - SHELLGATE_LOG_LEVEL: Override log level (trace, debug, info, warn, error)
    /// - SHELLGATE_ADDRESS: Override bind address
    /// - SHELLGATE_PORT: Override bind port
    /// - SHELLGATE_EXECUTABLE: Override the program launched per session
    pub fn apply_env_overrides(&mut self) {
        if let Ok(level) = std::env::var("SHELLGATE_LOG_LEVEL") {
            if !level.is_empty() {
                tracing::info!("Overriding log_level from environment: {}", level);
                self.daemon.log_level = level;
            }
        }

        if let Ok(address) = std::env::var("SHELLGATE_ADDRESS") {
            if !address.is_empty() {
                tracing::info!("Overriding address from environment: {}", address);
                self.server.address = address;
            }
        }

        if let Ok(port) = std::env::var("SHELLGATE_PORT") {
            if !port.is_empty() {
                match port.parse::<u16>() {
                    Ok(port) => {
                        tracing::info!("Overriding port from environment: {}", port);
                        self.server.port = port;
                    }
                    Err(_) => {
                        tracing::warn!("Ignoring invalid SHELLGATE_PORT value: {}", port);
                    }
                }
            }
        }

        if let Ok(executable) = std::env::var("SHELLGATE_EXECUTABLE") {
            if !executable.is_empty() {
                tracing::info!("Overriding executable from environment: {}", executable);
                self.server.executable = executable;
            }
        }
    }

    /// Validate the configuration values.
    ///
    /// Returns an error if any configuration value is outside the valid range.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let address = &self.server.address;
        let resolves = (address.as_str(), self.server.port)
            .to_socket_addrs()
            .map(|mut addrs| addrs.next().is_some())
            .unwrap_or(false);
        if !resolves {
            return Err(ConfigError::InvalidAddress(address.clone()));
        }

        self.server.resolved_executable()?;

        let grace = self.server.teardown_grace_secs;
        if grace == 0 || grace > 300 {
            return Err(ConfigError::InvalidTeardownGrace(grace));
        }

        if let Some(dir) = &self.session.config_dir {
            if !dir.is_dir() {
                return Err(ConfigError::InvalidConfigDir(dir.display().to_string()));
            }
        }

        let level = self.daemon.log_level.to_lowercase();
        if !VALID_LOG_LEVELS.contains(&level.as_str()) {
            return Err(ConfigError::InvalidLogLevel(self.daemon.log_level.clone()));
        }

        Ok(())
    }

    /// Load configuration from a file.
    ///
    /// If the file does not exist, returns the default configuration.
    /// If the file exists but is invalid TOML, returns an error with
    /// a helpful message.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            tracing::debug!("Config file not found at {:?}, using defaults", path);
            return Ok(Self::default());
        }

        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        Self::from_toml(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    /// Load configuration from the default path.
    pub fn load_default() -> Result<Self> {
        Self::load(default_config_path())
    }

    /// Parse configuration from a TOML string.
    pub fn from_toml(toml_str: &str) -> Result<Self> {
        toml::from_str(toml_str)
            .map_err(|e| anyhow::anyhow!("Invalid TOML configuration: {}", format_toml_error(&e)))
    }

    /// Save configuration to a file.
    ///
    /// Creates parent directories if they don't exist.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create config directory: {}", parent.display())
            })?;
        }

        let contents = self.to_toml()?;
        fs::write(path, contents)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;

        tracing::debug!("Configuration saved to {:?}", path);
        Ok(())
    }

    /// Serialize configuration to a TOML string.
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("Failed to serialize configuration to TOML")
    }
}

/// Format a TOML deserialization error for user-friendly display.
fn format_toml_error(error: &toml::de::Error) -> String {
    let mut msg = error.message().to_string();

    if let Some(span) = error.span() {
        msg.push_str(&format!(" (at position {}..{})", span.start, span.end));
    }

    msg
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use tempfile::TempDir;

    /// A config that validates on any Unix host.
    fn valid_config() -> Config {
        let mut config = Config::default();
        config.server.address = "127.0.0.1".to_string();
        config.server.executable = "/bin/sh".to_string();
        config
    }

    #[test]
    fn test_default_config() {
        let config = Config::default();

        assert_eq!(config.daemon.log_level, "info");
        assert!(config.daemon.log_dir.is_none());
        assert_eq!(config.server.address, "0.0.0.0");
        assert_eq!(config.server.port, 2222);
        assert_eq!(config.server.idle_timeout_secs, 600);
        assert!(config.server.host_key.is_none());
        assert_eq!(config.server.teardown_grace_secs, 5);
        assert!(config.session.config_dir.is_none());
        assert!(config.auth.allowed_fingerprints.is_empty());
    }

    #[test]
    #[serial]
    fn test_default_executable_follows_shell() {
        let original = std::env::var("SHELL").ok();

        std::env::set_var("SHELL", "/bin/zsh");
        assert_eq!(default_executable(), "/bin/zsh");

        std::env::remove_var("SHELL");
        assert_eq!(default_executable(), "/bin/sh");

        if let Some(shell) = original {
            std::env::set_var("SHELL", shell);
        }
    }

    #[test]
    fn test_idle_timeout() {
        let mut server = ServerConfig::default();
        assert_eq!(server.idle_timeout(), Some(Duration::from_secs(600)));

        server.idle_timeout_secs = 0;
        assert_eq!(server.idle_timeout(), None);
    }

    #[test]
    fn test_from_toml_empty() {
        let config = Config::from_toml("").unwrap();
        assert_eq!(config, Config::default());
    }

    #[test]
    fn test_from_toml_partial() {
        let toml = r#"
[daemon]
log_level = "debug"

[server]
port = 2022
"#;
        let config = Config::from_toml(toml).unwrap();

        assert_eq!(config.daemon.log_level, "debug");
        assert_eq!(config.server.port, 2022);
        // Other values should be defaults
        assert_eq!(config.server.address, "0.0.0.0");
        assert_eq!(config.server.teardown_grace_secs, 5);
    }

    #[test]
    fn test_from_toml_full() {
        let toml = r#"
[daemon]
log_level = "trace"
log_dir = "/var/log/shellgate"

[server]
address = "127.0.0.1"
port = 2200
idle_timeout_secs = 30
executable = "/usr/local/bin/app"
host_key = "/etc/shellgate/host_key"
teardown_grace_secs = 2

[session]
config_dir = "/run/shellgate"

[auth]
allowed_fingerprints = ["SHA256:abc", "def"]
"#;
        let config = Config::from_toml(toml).unwrap();

        assert_eq!(config.daemon.log_level, "trace");
        assert_eq!(config.daemon.log_dir, Some(PathBuf::from("/var/log/shellgate")));
        assert_eq!(config.server.address, "127.0.0.1");
        assert_eq!(config.server.port, 2200);
        assert_eq!(config.server.idle_timeout_secs, 30);
        assert_eq!(config.server.executable, "/usr/local/bin/app");
        assert_eq!(
            config.server.host_key,
            Some(PathBuf::from("/etc/shellgate/host_key"))
        );
        assert_eq!(config.server.teardown_grace_secs, 2);
        assert_eq!(config.session.config_dir, Some(PathBuf::from("/run/shellgate")));
        assert_eq!(config.auth.allowed_fingerprints, vec!["SHA256:abc", "def"]);
    }

    #[test]
    fn test_from_toml_invalid_syntax() {
        let toml = r#"
[server
port = 22
"#;
        let err = Config::from_toml(toml).unwrap_err().to_string();
        assert!(err.contains("Invalid TOML"));
    }

    #[test]
    fn test_from_toml_wrong_type() {
        let toml = r#"
[server]
port = "not a number"
"#;
        assert!(Config::from_toml(toml).is_err());
    }

    #[test]
    fn test_from_toml_port_out_of_range() {
        let toml = r#"
[server]
port = 70000
"#;
        assert!(Config::from_toml(toml).is_err());
    }

    #[test]
    fn test_to_toml() {
        let toml = Config::default().to_toml().unwrap();

        assert!(toml.contains("[daemon]"));
        assert!(toml.contains("[server]"));
        assert!(toml.contains("[session]"));
        assert!(toml.contains("[auth]"));
    }

    #[test]
    fn test_roundtrip_custom() {
        let mut original = Config::default();
        original.daemon.log_level = "warn".to_string();
        original.server.port = 0;
        original.server.host_key = Some(PathBuf::from("/keys/host"));
        original.auth.allowed_fingerprints = vec!["abc".to_string()];

        let toml = original.to_toml().unwrap();
        let loaded = Config::from_toml(&toml).unwrap();

        assert_eq!(original, loaded);
    }

    #[test]
    fn test_load_missing_file() {
        let config = Config::load("/nonexistent/path/config.toml").unwrap();
        assert_eq!(config, Config::default());
    }

    #[test]
    fn test_save_and_load() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("nested").join("config.toml");

        let mut original = Config::default();
        original.daemon.log_level = "debug".to_string();
        original.server.idle_timeout_secs = 45;

        original.save(&config_path).unwrap();
        let loaded = Config::load(&config_path).unwrap();

        assert_eq!(original, loaded);
    }

    #[test]
    fn test_load_invalid_file() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("config.toml");
        fs::write(&config_path, "invalid [ toml").unwrap();

        let err = Config::load(&config_path).unwrap_err().to_string();
        assert!(err.contains("Failed to parse config file"));
    }

    #[test]
    fn test_default_config_path() {
        let path = default_config_path();
        assert!(path.to_string_lossy().contains("shellgate"));
        assert!(path.to_string_lossy().ends_with("config.toml"));
    }

    #[test]
    fn test_validate_accepts_valid_config() {
        assert_eq!(valid_config().validate(), Ok(()));
    }

    #[test]
    fn test_validate_rejects_bad_address() {
        let mut config = valid_config();
        config.server.address = "not an address".to_string();
        assert_eq!(
            config.validate(),
            Err(ConfigError::InvalidAddress("not an address".to_string()))
        );
    }

    #[test]
    fn test_validate_rejects_missing_executable() {
        let mut config = valid_config();
        config.server.executable = "/nonexistent/bin/app".to_string();
        assert_eq!(
            config.validate(),
            Err(ConfigError::InvalidExecutable("/nonexistent/bin/app".to_string()))
        );

        config.server.executable = "definitely-not-a-real-program-xyz".to_string();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidExecutable(_))
        ));
    }

    #[test]
    fn test_resolved_executable_searches_path() {
        let mut server = valid_config().server;
        server.executable = "sh".to_string();

        let resolved = server.resolved_executable().unwrap();
        assert!(resolved.is_absolute());
        assert!(resolved.ends_with("sh"));
    }

    #[test]
    fn test_validate_teardown_grace_range() {
        let mut config = valid_config();

        config.server.teardown_grace_secs = 0;
        assert_eq!(config.validate(), Err(ConfigError::InvalidTeardownGrace(0)));

        config.server.teardown_grace_secs = 301;
        assert_eq!(config.validate(), Err(ConfigError::InvalidTeardownGrace(301)));

        config.server.teardown_grace_secs = 300;
        assert_eq!(config.validate(), Ok(()));
    }

    #[test]
    fn test_validate_config_dir() {
        let temp_dir = TempDir::new().unwrap();
        let mut config = valid_config();

        config.session.config_dir = Some(temp_dir.path().to_path_buf());
        assert_eq!(config.validate(), Ok(()));

        let missing = temp_dir.path().join("missing");
        config.session.config_dir = Some(missing.clone());
        assert_eq!(
            config.validate(),
            Err(ConfigError::InvalidConfigDir(missing.display().to_string()))
        );
    }

    #[test]
    fn test_validate_log_level() {
        let mut config = valid_config();

        config.daemon.log_level = "DEBUG".to_string();
        assert_eq!(config.validate(), Ok(()));

        config.daemon.log_level = "verbose".to_string();
        assert_eq!(
            config.validate(),
            Err(ConfigError::InvalidLogLevel("verbose".to_string()))
        );
    }

    #[test]
    #[serial]
    fn test_env_overrides() {
        std::env::set_var("SHELLGATE_LOG_LEVEL", "trace");
        std::env::set_var("SHELLGATE_ADDRESS", "127.0.0.1");
        std::env::set_var("SHELLGATE_PORT", "2022");
        std::env::set_var("SHELLGATE_EXECUTABLE", "/usr/bin/env");

        let mut config = Config::default();
        config.apply_env_overrides();

        assert_eq!(config.daemon.log_level, "trace");
        assert_eq!(config.server.address, "127.0.0.1");
        assert_eq!(config.server.port, 2022);
        assert_eq!(config.server.executable, "/usr/bin/env");

        std::env::remove_var("SHELLGATE_LOG_LEVEL");
        std::env::remove_var("SHELLGATE_ADDRESS");
        std::env::remove_var("SHELLGATE_PORT");
        std::env::remove_var("SHELLGATE_EXECUTABLE");
    }

    #[test]
    #[serial]
    fn test_env_override_empty_does_not_override() {
        std::env::set_var("SHELLGATE_ADDRESS", "");

        let mut config = Config::default();
        config.apply_env_overrides();
        assert_eq!(config.server.address, "0.0.0.0");

        std::env::remove_var("SHELLGATE_ADDRESS");
    }

    #[test]
    #[serial]
    fn test_env_override_invalid_port_is_ignored() {
        std::env::set_var("SHELLGATE_PORT", "eighty");

        let mut config = Config::default();
        config.apply_env_overrides();
        assert_eq!(config.server.port, 2222);

        std::env::remove_var("SHELLGATE_PORT");
    }
}
