//! Announce collaborator
//!
//! Runs a user supplied command once at startup with the host public key line
//! as its final argument, e.g. to publish the key to a known_hosts service.

use std::process::{ExitStatus, Stdio};

use thiserror::Error;
use tokio::process::Command;

/// Why the announce command did not succeed
#[derive(Error, Debug)]
pub enum AnnounceError {
    /// The command string had no program in it
    #[error("announce command is empty")]
    Empty,

    /// The command could not be started
    #[error("failed to run announce command {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    /// The command ran but exited unsuccessfully
    #[error("announce command failed ({status}): {stderr}")]
    Failed { status: ExitStatus, stderr: String },
}

/// Run `command` with `public_key_line` appended as the last argument
///
/// The command is split on whitespace; no shell is involved.
pub async fn announce(command: &str, public_key_line: &str) -> Result<(), AnnounceError> {
    let mut parts = command.split_whitespace();
    let program = parts.next().ok_or(AnnounceError::Empty)?;

    tracing::debug!("Running announce command: {}", command);

    let output = Command::new(program)
        .args(parts)
        .arg(public_key_line)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .output()
        .await
        .map_err(|source| AnnounceError::Spawn {
            program: program.to_string(),
            source,
        })?;

    if !output.status.success() {
        return Err(AnnounceError::Failed {
            status: output.status,
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }

    Ok(())
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    const KEY_LINE: &str = "ssh-ed25519 AAAAC3NzaC1lZDI1NTE5AAAAIGZha2Vfa2V5X2Zvcl90ZXN0cw";

    #[tokio::test]
    async fn test_successful_command() {
        announce("true", KEY_LINE).await.unwrap();
    }

    #[tokio::test]
    async fn test_failing_command() {
        let err = announce("false", KEY_LINE).await.unwrap_err();
        assert!(matches!(err, AnnounceError::Failed { .. }), "{}", err);
    }

    #[tokio::test]
    async fn test_failure_carries_stderr() {
        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("fail.sh");
        std::fs::write(&script, "#!/bin/sh\necho 'upload refused' >&2\nexit 4\n").unwrap();

        let err = announce(&format!("sh {}", script.display()), KEY_LINE)
            .await
            .unwrap_err();
        match err {
            AnnounceError::Failed { status, stderr } => {
                assert_eq!(status.code(), Some(4));
                assert_eq!(stderr, "upload refused");
            }
            other => panic!("unexpected error: {}", other),
        }
    }

    #[tokio::test]
    async fn test_missing_program() {
        let err = announce("/nonexistent/announce", KEY_LINE)
            .await
            .unwrap_err();
        assert!(matches!(err, AnnounceError::Spawn { .. }));
    }

    #[tokio::test]
    async fn test_empty_command() {
        let err = announce("   ", KEY_LINE).await.unwrap_err();
        assert!(matches!(err, AnnounceError::Empty));
    }

    #[tokio::test]
    async fn test_key_line_is_last_argument() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("announced");
        let script = dir.path().join("record.sh");
        std::fs::write(&script, "#!/bin/sh\nprintf '%s|%s' \"$1\" \"$2\" > \"$1\"\n").unwrap();

        let command = format!("sh {} {}", script.display(), out.display());
        announce(&command, KEY_LINE).await.unwrap();

        let recorded = std::fs::read_to_string(&out).unwrap();
        assert_eq!(recorded, format!("{}|{}", out.display(), KEY_LINE));
    }
}
