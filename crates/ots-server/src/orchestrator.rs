//! Server lifecycle
//!
//! Wires the host identity, the authorized key set, the session gate and the
//! bridge to the SSH listener, races the listener against the connection
//! timeout and reports how the single session ended.

use std::path::Path;
use std::sync::Arc;

use tokio::fs::{File, OpenOptions};
use tokio::net::TcpListener;

use ots_core::config::ServerConfig;
use ots_core::{HostIdentity, OtsError, SessionOutcome, StartupError};

use crate::announce::announce;
use crate::auth::AuthorizedKeySet;
use crate::bridge::{BridgeConfig, PtyBridge, ShellCommand};
use crate::gate::SessionGate;
use crate::server::SshServer;
use crate::state::ServerContext;

/// Owns everything the server needs for its single run
pub struct Orchestrator {
    config: ServerConfig,
    authorized_keys: AuthorizedKeySet,
    identity: HostIdentity,
    transcript: File,
    gate: Arc<SessionGate>,
}

impl Orchestrator {
    /// Perform every fallible startup step before anything listens
    pub async fn prepare(config: ServerConfig) -> Result<Self, OtsError> {
        config.validate()?;

        let transcript = open_transcript(&config.transcript_path).await?;

        let keys_path = config.authorized_keys.clone();
        let authorized_keys =
            tokio::task::spawn_blocking(move || AuthorizedKeySet::load(keys_path.as_deref()))
                .await
                .map_err(|e| {
                    StartupError::AuthorizedKeys(format!("key loading task failed: {}", e))
                })??;

        let identity = HostIdentity::generate()?;

        Ok(Self::new(config, authorized_keys, identity, transcript))
    }

    /// Assemble an orchestrator from already prepared parts
    pub fn new(
        config: ServerConfig,
        authorized_keys: AuthorizedKeySet,
        identity: HostIdentity,
        transcript: File,
    ) -> Self {
        Self {
            config,
            authorized_keys,
            identity,
            transcript,
            gate: Arc::new(SessionGate::new()),
        }
    }

    /// The session gate, for observing the server from outside
    pub fn gate(&self) -> Arc<SessionGate> {
        Arc::clone(&self.gate)
    }

    /// Host identity of this run
    pub fn identity(&self) -> &HostIdentity {
        &self.identity
    }

    /// Bind the configured address and serve
    pub async fn run(self) -> Result<Option<SessionOutcome>, OtsError> {
        let listener = SshServer::bind(&self.config.bind_address).await?;
        self.serve(listener).await
    }

    /// Serve on an already bound listener
    ///
    /// Returns `None` when the timeout elapsed without a session, otherwise
    /// the outcome of the single bridged session.
    pub async fn serve(self, listener: TcpListener) -> Result<Option<SessionOutcome>, OtsError> {
        let Self {
            config,
            authorized_keys,
            identity,
            transcript,
            gate,
        } = self;

        let host_key = identity.to_russh_keypair()?;
        let public_key_line = identity.public_key_line()?;
        tracing::debug!("Host key fingerprint: {}", identity.fingerprint());

        if let Some(command) = &config.announce {
            if let Err(e) = announce(command, &public_key_line).await {
                tracing::warn!("announcement failed: {}", e);
            }
        }

        let local_addr = listener.local_addr()?;
        tracing::info!(
            "Starting server listening on {}. The server will use the following key:",
            local_addr
        );
        println!("\n{}\n", public_key_line);

        let bridge = PtyBridge::new(BridgeConfig {
            shell: ShellCommand::resolve(config.shell.as_deref()),
            copy_env: config.copy_env,
        });
        let context = Arc::new(ServerContext::new(
            Arc::clone(&gate),
            authorized_keys,
            bridge,
            transcript,
        ));
        let server = SshServer::new(host_key, context);

        let timeout = config.timeout;
        let timer = async {
            tokio::select! {
                _ = tokio::time::sleep(timeout) => {
                    if gate.on_timeout_elapsed() {
                        tracing::warn!("no connection within supplied timeout ({:?}), exiting", timeout);
                    }
                }
                _ = gate.closed() => {}
            }
        };

        tokio::join!(server.run(listener), timer);

        Ok(gate.take_outcome())
    }
}

/// Open the transcript for appending, creating it owner-only if absent
async fn open_transcript(path: &Path) -> Result<File, StartupError> {
    let mut options = OpenOptions::new();
    options.create(true).append(true);
    #[cfg(unix)]
    options.mode(0o600);

    options
        .open(path)
        .await
        .map_err(|source| StartupError::Transcript {
            path: path.to_path_buf(),
            source,
        })
}

/// Prepare and run the server with `config`
pub async fn run(config: ServerConfig) -> Result<Option<SessionOutcome>, OtsError> {
    Orchestrator::prepare(config).await?.run().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn test_keys() -> AuthorizedKeySet {
        let peer = HostIdentity::generate().unwrap();
        let mut keys = AuthorizedKeySet::new();
        keys.insert(peer.public_key()).unwrap();
        keys
    }

    #[tokio::test]
    async fn test_transcript_is_appended() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("otssh.log");
        std::fs::write(&path, b"earlier run\n").unwrap();

        let mut file = open_transcript(&path).await.unwrap();
        tokio::io::AsyncWriteExt::write_all(&mut file, b"this run\n")
            .await
            .unwrap();
        drop(file);

        let contents = std::fs::read_to_string(&path).unwrap();
        assert_eq!(contents, "earlier run\nthis run\n");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_transcript_is_owner_only() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("otssh.log");
        open_transcript(&path).await.unwrap();

        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[tokio::test]
    async fn test_unwritable_transcript_is_startup_error() {
        let err = open_transcript(Path::new("/nonexistent/dir/otssh.log"))
            .await
            .unwrap_err();
        assert!(matches!(err, StartupError::Transcript { .. }));
    }

    #[tokio::test]
    async fn test_invalid_config_is_rejected() {
        let config = ServerConfig {
            bind_address: "localhost".to_string(),
            ..ServerConfig::default()
        };
        let err = Orchestrator::prepare(config).await.err().unwrap();
        assert!(matches!(err, OtsError::Config(_)));
    }

    #[tokio::test]
    async fn test_timeout_without_connection() {
        let dir = tempfile::tempdir().unwrap();
        let config = ServerConfig {
            timeout: Duration::from_millis(50),
            ..ServerConfig::default()
        };
        let transcript = open_transcript(&dir.path().join("otssh.log")).await.unwrap();
        let orchestrator = Orchestrator::new(
            config,
            test_keys(),
            HostIdentity::generate().unwrap(),
            transcript,
        );
        let gate = orchestrator.gate();

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let outcome = tokio::time::timeout(Duration::from_secs(5), orchestrator.serve(listener))
            .await
            .expect("server did not stop after its timeout")
            .unwrap();

        assert!(outcome.is_none());
        assert!(gate.is_closed());
    }
}
