//! Server configuration

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::error::ConfigError;

/// Configuration for the one-time server
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Address to bind the SSH server to
    pub bind_address: String,

    /// Append-only file receiving everything the shell prints
    pub transcript_path: PathBuf,

    /// How long to wait for the single connection
    #[serde(with = "super::serde_utils::duration_secs")]
    pub timeout: Duration,

    /// Copy the server's environment into the shell
    pub copy_env: bool,

    /// authorized_keys file (read from stdin when unset)
    pub authorized_keys: Option<PathBuf>,

    /// Command run once with the public key line appended as its last argument
    pub announce: Option<String>,

    /// Shell to run instead of `$SHELL`
    pub shell: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0:2022".to_string(),
            transcript_path: PathBuf::from("otssh.log"),
            timeout: Duration::from_secs(600),
            copy_env: true,
            authorized_keys: None,
            announce: None,
            shell: None,
        }
    }
}

impl ServerConfig {
    /// Replace the port of the bind address, keeping its host part
    pub fn set_port(&mut self, port: u16) {
        let host = match self.bind_address.rsplit_once(':') {
            Some((host, _)) => host.to_string(),
            None => self.bind_address.clone(),
        };
        self.bind_address = format!("{}:{}", host, port);
    }

    /// Check the configuration for values the server cannot run with
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.bind_address.rsplit_once(':').is_none() {
            return Err(ConfigError::Invalid(format!(
                "bind address '{}' has no port",
                self.bind_address
            )));
        }

        if let Some(announce) = &self.announce {
            if announce.split_whitespace().next().is_none() {
                return Err(ConfigError::Invalid("announce command is empty".to_string()));
            }
        }

        if let Some(shell) = &self.shell {
            if shell.trim().is_empty() {
                return Err(ConfigError::Invalid("shell is empty".to_string()));
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_cli_defaults() {
        let config = ServerConfig::default();
        assert_eq!(config.bind_address, "0.0.0.0:2022");
        assert_eq!(config.transcript_path, PathBuf::from("otssh.log"));
        assert_eq!(config.timeout, Duration::from_secs(600));
        assert!(config.copy_env);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_set_port_keeps_host() {
        let mut config = ServerConfig::default();
        config.set_port(2200);
        assert_eq!(config.bind_address, "0.0.0.0:2200");

        config.bind_address = "[::1]:22".to_string();
        config.set_port(2022);
        assert_eq!(config.bind_address, "[::1]:2022");
    }

    #[test]
    fn test_validate_rejects_blank_announce() {
        let config = ServerConfig {
            announce: Some("   ".to_string()),
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_validate_rejects_missing_port() {
        let config = ServerConfig {
            bind_address: "localhost".to_string(),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
