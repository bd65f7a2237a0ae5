//! Core error types for onetime-ssh

use std::path::PathBuf;
use thiserror::Error;

/// Top-level error type for onetime-ssh
#[derive(Error, Debug)]
pub enum OtsError {
    /// Startup error
    #[error("Startup error: {0}")]
    Startup(#[from] StartupError),

    /// Bridge error
    #[error("Bridge error: {0}")]
    Bridge(#[from] BridgeError),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors that abort the process before the listener starts
#[derive(Error, Debug)]
pub enum StartupError {
    /// The random source could not produce a host key
    #[error("Failed to generate host key: {0}")]
    KeyGeneration(String),

    /// The generated key could not be converted for the SSH server
    #[error("Failed to convert host key to the format expected by the ssh server: {0}")]
    KeyEncoding(String),

    /// The transcript file could not be opened
    #[error("Failed to open transcript at {path:?}: {source}")]
    Transcript {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The authorized keys could not be read or parsed
    #[error("Failed to load authorized keys: {0}")]
    AuthorizedKeys(String),

    /// The listen address could not be bound
    #[error("Failed to bind to {address}: {source}")]
    Bind {
        address: String,
        #[source]
        source: std::io::Error,
    },
}

/// Errors raised while bridging the single session
#[derive(Error, Debug)]
pub enum BridgeError {
    /// Pseudoterminals are not available on this platform
    #[error("PTY allocation failed: {0}")]
    PtyUnavailable(String),

    /// The shell could not be spawned
    #[error("Failed to spawn shell {shell}: {reason}")]
    Spawn { shell: String, reason: String },

    /// Reading from the child failed for a reason other than exit
    #[error("Failed to read from command: {0}")]
    ChildRead(#[source] std::io::Error),

    /// Writing to the child failed
    #[error("Failed to write to command: {0}")]
    ChildWrite(#[source] std::io::Error),

    /// Appending to the transcript failed
    #[error("Failed to write to transcript: {0}")]
    Transcript(#[source] std::io::Error),

    /// Delivering output to the peer failed
    #[error("Failed to write to session: {0}")]
    PeerWrite(#[source] std::io::Error),

    /// The peer closed the connection while the child was still running
    #[error("Session closed by peer")]
    PeerDisconnected,

    /// Waiting for the child's exit status failed
    #[error("Failed to wait for command: {0}")]
    Wait(#[source] std::io::Error),

    /// A helper task panicked or was lost
    #[error("Bridge task failed: {0}")]
    Task(String),
}

/// Configuration-related errors
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Config file not found
    #[error("Config file not found: {0}")]
    NotFound(PathBuf),

    /// Invalid configuration
    #[error("Invalid config: {0}")]
    Invalid(String),

    /// TOML parse error
    #[error("TOML parse error: {0}")]
    Parse(#[from] toml::de::Error),
}
