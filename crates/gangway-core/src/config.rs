//! Configuration for the gateway daemon
//!
//! Supports TOML configuration files with sensible defaults; every field can
//! also be overridden from the command line. Capabilities are opt-in: a
//! gateway with nothing enabled accepts connections and turns every endpoint
//! away.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    /// Unix socket the daemon listens on
    pub socket_path: PathBuf,
    /// Serve the file-manager endpoint
    pub enable_file_manager: bool,
    /// Serve the terminal endpoint
    pub enable_terminal: bool,
    /// Serve the notification endpoint and register on the session bus
    pub enable_notification: bool,
    /// Filesystem roots reachable by the file manager (empty = everything)
    pub allowed_paths: Vec<PathBuf>,
    /// Filesystem roots never reachable, regardless of allow rules
    pub denied_paths: Vec<PathBuf>,
    /// Terminal settings
    pub terminal: TerminalConfig,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            socket_path: PathBuf::from("/tmp/gangway.sock"),
            enable_file_manager: false,
            enable_terminal: false,
            enable_notification: false,
            allowed_paths: Vec::new(),
            denied_paths: Vec::new(),
            terminal: TerminalConfig::default(),
        }
    }
}

/// Terminal configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TerminalConfig {
    /// Shell spawned for each terminal session
    pub shell: String,
    /// Working directory the shell starts in
    pub workdir: PathBuf,
}

impl Default for TerminalConfig {
    fn default() -> Self {
        Self {
            shell: String::from("/bin/sh"),
            workdir: PathBuf::from("/tmp"),
        }
    }
}

impl GatewayConfig {
    /// Load configuration from a specific path, falling back to defaults if
    /// the file does not exist.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            debug!("Config file {:?} not found, using defaults", path);
            return Ok(Self::default());
        }

        let content =
            std::fs::read_to_string(path).map_err(|e| ConfigError::Io(e.to_string()))?;

        let config: GatewayConfig =
            toml::from_str(&content).map_err(|e| ConfigError::Parse(e.to_string()))?;

        info!("Loaded config from {:?}", path);
        Ok(config)
    }

    /// Reject configurations the daemon cannot start with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.socket_path.as_os_str().is_empty() {
            return Err(ConfigError::Invalid("socket_path must not be empty".into()));
        }
        if self.terminal.shell.is_empty() {
            return Err(ConfigError::Invalid("terminal.shell must not be empty".into()));
        }
        for root in self.allowed_paths.iter().chain(self.denied_paths.iter()) {
            if !root.is_absolute() {
                return Err(ConfigError::Invalid(format!(
                    "path rule {:?} must be absolute",
                    root
                )));
            }
        }
        Ok(())
    }
}

/// Configuration errors
#[derive(Debug, Clone)]
pub enum ConfigError {
    /// I/O error
    Io(String),
    /// Parse error
    Parse(String),
    /// Semantically invalid configuration
    Invalid(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "I/O error: {}", e),
            ConfigError::Parse(e) => write!(f, "Parse error: {}", e),
            ConfigError::Invalid(e) => write!(f, "Invalid configuration: {}", e),
        }
    }
}

impl std::error::Error for ConfigError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = GatewayConfig::default();
        assert_eq!(config.socket_path, PathBuf::from("/tmp/gangway.sock"));
        assert!(!config.enable_file_manager);
        assert_eq!(config.terminal.shell, "/bin/sh");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_config() {
        let toml_str = r#"
            enable_file_manager = true
            allowed_paths = ["/srv/data"]

            [terminal]
            shell = "/bin/bash"
        "#;
        let config: GatewayConfig = toml::from_str(toml_str).unwrap();
        assert!(config.enable_file_manager);
        assert!(!config.enable_terminal);
        assert_eq!(config.allowed_paths, vec![PathBuf::from("/srv/data")]);
        assert_eq!(config.terminal.shell, "/bin/bash");
        // Untouched values keep their defaults.
        assert_eq!(config.terminal.workdir, PathBuf::from("/tmp"));
    }

    #[test]
    fn test_config_roundtrip() {
        let config = GatewayConfig::default();
        let toml_str = toml::to_string(&config).unwrap();
        let parsed: GatewayConfig = toml::from_str(&toml_str).unwrap();
        assert_eq!(parsed.socket_path, config.socket_path);
    }

    #[test]
    fn test_config_load_missing() {
        let config = GatewayConfig::load_from(Path::new("/nonexistent/gangway.toml")).unwrap();
        assert_eq!(config.socket_path, PathBuf::from("/tmp/gangway.sock"));
    }

    #[test]
    fn test_validate_rejects_relative_rules() {
        let config = GatewayConfig {
            allowed_paths: vec![PathBuf::from("srv/data")],
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_empty_socket() {
        let config = GatewayConfig {
            socket_path: PathBuf::new(),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
