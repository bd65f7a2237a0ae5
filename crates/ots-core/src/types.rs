//! Core domain types

use std::fmt;

use crate::error::BridgeError;

/// Exit code used for unrecoverable errors that carry no child status
pub const FAILURE_EXIT_CODE: i32 = 1;

/// Terminal window dimensions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WindowSize {
    /// Number of columns
    pub cols: u16,
    /// Number of rows
    pub rows: u16,
}

impl WindowSize {
    /// Create a new window size
    pub fn new(cols: u16, rows: u16) -> Self {
        Self { cols, rows }
    }

    /// Build a window size from the 32-bit values carried by SSH requests,
    /// clamping anything that does not fit a terminal dimension
    pub fn from_ssh(cols: u32, rows: u32) -> Self {
        Self {
            cols: u16::try_from(cols).unwrap_or(u16::MAX),
            rows: u16::try_from(rows).unwrap_or(u16::MAX),
        }
    }
}

impl Default for WindowSize {
    fn default() -> Self {
        Self { cols: 80, rows: 24 }
    }
}

impl fmt::Display for WindowSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.cols, self.rows)
    }
}

/// A pseudoterminal request made by the peer before starting its shell
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PtyRequest {
    /// Value exported as `TERM` in the child environment
    pub term: String,
    /// Initial window size
    pub size: WindowSize,
}

/// Result of the single bridged session
#[derive(Debug)]
pub enum SessionOutcome {
    /// The session ran to completion and the child exited successfully
    Completed,
    /// An unexpected I/O failure ended the session early
    BridgeIo(BridgeError),
    /// The child exited with a non-zero status or was killed by a signal
    AbnormalChildExit {
        /// Exit status reported for the child
        code: i32,
    },
}

impl SessionOutcome {
    /// Process exit code this outcome maps to
    pub fn exit_code(&self) -> i32 {
        match self {
            SessionOutcome::Completed => 0,
            SessionOutcome::AbnormalChildExit { code } if *code != 0 => *code,
            SessionOutcome::AbnormalChildExit { .. } => FAILURE_EXIT_CODE,
            SessionOutcome::BridgeIo(_) => FAILURE_EXIT_CODE,
        }
    }

    /// Whether the session ended cleanly
    pub fn is_success(&self) -> bool {
        matches!(self, SessionOutcome::Completed)
    }
}

impl fmt::Display for SessionOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionOutcome::Completed => write!(f, "session completed"),
            SessionOutcome::BridgeIo(e) => write!(f, "session failed: {}", e),
            SessionOutcome::AbnormalChildExit { code } => {
                write!(f, "command exited with status {}", code)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_window_size_from_ssh_clamps() {
        assert_eq!(WindowSize::from_ssh(132, 43), WindowSize::new(132, 43));
        assert_eq!(
            WindowSize::from_ssh(100_000, 24),
            WindowSize::new(u16::MAX, 24)
        );
    }

    #[test]
    fn test_outcome_exit_codes() {
        assert_eq!(SessionOutcome::Completed.exit_code(), 0);
        assert_eq!(SessionOutcome::AbnormalChildExit { code: 3 }.exit_code(), 3);
        assert_eq!(SessionOutcome::AbnormalChildExit { code: 0 }.exit_code(), 1);

        let io = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "gone");
        let outcome = SessionOutcome::BridgeIo(BridgeError::PeerWrite(io));
        assert_eq!(outcome.exit_code(), FAILURE_EXIT_CODE);
        assert!(!outcome.is_success());
    }

    #[test]
    fn test_window_size_display() {
        assert_eq!(WindowSize::new(80, 24).to_string(), "80x24");
    }
}
