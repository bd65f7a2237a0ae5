//! ots-core: Core types, host identity and configuration for onetime-ssh
//!
//! This crate provides the shared domain types, error taxonomy, ephemeral
//! host key handling and configuration structures used by the server.

pub mod config;
pub mod error;
pub mod identity;
pub mod logging;
pub mod types;

pub use error::{BridgeError, ConfigError, OtsError, StartupError};
pub use identity::HostIdentity;
pub use types::{PtyRequest, SessionOutcome, WindowSize};
