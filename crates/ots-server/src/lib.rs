//! ots-server: a single-use SSH server
//!
//! The server generates a throwaway host key, waits a bounded time for one
//! authorized peer, bridges that peer to a shell running on a local
//! pseudoterminal while recording a transcript, and then shuts down for good.

pub mod announce;
pub mod auth;
pub mod bridge;
pub mod gate;
pub mod orchestrator;
pub mod server;
pub mod state;

pub use auth::AuthorizedKeySet;
pub use bridge::{BridgeConfig, PeerOutput, PeerSession, PtyBridge, ShellCommand};
pub use gate::SessionGate;
pub use orchestrator::Orchestrator;
pub use state::ServerContext;
