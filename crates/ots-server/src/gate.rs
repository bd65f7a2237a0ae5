//! One-shot session gate
//!
//! The gate is the single place where "exactly one session, ever" is decided.
//! Both triggers (an accepted connection and the timeout) race for the same
//! Idle -> Closed transition; whichever wins runs its body, every other
//! attempt observes Closed and does nothing.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, PoisonError};

use tokio_util::sync::CancellationToken;

use ots_core::SessionOutcome;

/// One-shot coordinator shared by the listener and the timeout timer
#[derive(Debug, Default)]
pub struct SessionGate {
    /// false = Idle, true = Closed
    closed: AtomicBool,
    /// Cancelled the moment the gate closes
    closed_signal: CancellationToken,
    /// Cancelled once the winning trigger's body is done; stops the listener
    shutdown: CancellationToken,
    /// Outcome of the bridged session, if one ran
    outcome: Mutex<Option<SessionOutcome>>,
}

impl SessionGate {
    /// Create an idle gate
    pub fn new() -> Self {
        Self::default()
    }

    /// Attempt the Idle -> Closed transition; true for the unique winner
    fn try_close(&self) -> bool {
        let won = self
            .closed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();
        if won {
            self.closed_signal.cancel();
        }
        won
    }

    /// Run `bridge` as the one and only session if the gate is still idle
    ///
    /// Returns false without calling `bridge` when the gate has already
    /// closed. The winner's outcome is recorded before shutdown is triggered,
    /// and shutdown is triggered even if the bridge future unwinds.
    pub async fn on_connection_accepted<F, Fut>(&self, bridge: F) -> bool
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = SessionOutcome>,
    {
        if !self.try_close() {
            tracing::debug!("Gate already closed, connection will not be bridged");
            return false;
        }

        let _shutdown_guard = self.shutdown.clone().drop_guard();

        let outcome = bridge().await;
        tracing::info!("Session finished: {}", outcome);

        *self.outcome.lock().unwrap_or_else(PoisonError::into_inner) = Some(outcome);
        true
    }

    /// Close the gate because the connection window elapsed
    ///
    /// Returns false (and does nothing) if a session already claimed the gate.
    pub fn on_timeout_elapsed(&self) -> bool {
        if !self.try_close() {
            tracing::debug!("Timeout fired after the gate closed, ignoring");
            return false;
        }

        self.shutdown.cancel();
        true
    }

    /// Whether the single opportunity has been used
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Resolves once the gate has closed
    pub async fn closed(&self) {
        self.closed_signal.cancelled().await
    }

    /// Token cancelled when the listener should stop
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Take the recorded session outcome, if a session ran
    pub fn take_outcome(&self) -> Option<SessionOutcome> {
        self.outcome
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }
}
