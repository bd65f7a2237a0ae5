//! State shared by every connection handler

use std::sync::Arc;

use tokio::fs::File;
use tokio::sync::Mutex;

use crate::auth::AuthorizedKeySet;
use crate::bridge::PtyBridge;
use crate::gate::SessionGate;

/// Everything a connection handler needs to authorize and bridge a session
pub struct ServerContext {
    /// One-shot session gate
    pub gate: Arc<SessionGate>,
    /// Keys allowed to connect
    pub authorized_keys: AuthorizedKeySet,
    /// Bridge used by the winning session
    pub bridge: PtyBridge,
    /// Transcript of the single session
    pub transcript: Mutex<File>,
}

impl ServerContext {
    /// Create the shared context
    pub fn new(
        gate: Arc<SessionGate>,
        authorized_keys: AuthorizedKeySet,
        bridge: PtyBridge,
        transcript: File,
    ) -> Self {
        Self {
            gate,
            authorized_keys,
            bridge,
            transcript: Mutex::new(transcript),
        }
    }
}
