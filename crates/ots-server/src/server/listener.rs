//! SSH server listener
//!
//! Accepts incoming connections and spawns a handler for each client until
//! the session gate asks it to stop.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use russh_keys::key::KeyPair;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use ots_core::StartupError;

use crate::server::handler::ConnectionHandler;
use crate::state::ServerContext;

/// Time in-flight connections get to unwind after the listener stops
pub const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// SSH server that listens for incoming connections
pub struct SshServer {
    /// russh server configuration
    ssh_config: Arc<russh::server::Config>,
    /// Shared server context
    context: Arc<ServerContext>,
    /// Cancelled when the listener should stop accepting
    shutdown: CancellationToken,
}

impl SshServer {
    /// Create a new SSH server with the given host key
    pub fn new(host_key: KeyPair, context: Arc<ServerContext>) -> Self {
        let mut config = russh::server::Config::default();
        config.keys.push(host_key);
        config.methods = russh::MethodSet::PUBLICKEY;
        config.auth_rejection_time = Duration::from_secs(1);
        config.auth_rejection_time_initial = Some(Duration::from_secs(0));

        let shutdown = context.gate.shutdown_token();
        Self {
            ssh_config: Arc::new(config),
            context,
            shutdown,
        }
    }

    /// Bind the listening socket
    pub async fn bind(address: &str) -> Result<TcpListener, StartupError> {
        TcpListener::bind(address)
            .await
            .map_err(|source| StartupError::Bind {
                address: address.to_string(),
                source,
            })
    }

    /// Accept connections until shutdown, then drain the connection tasks
    pub async fn run(&self, listener: TcpListener) {
        let mut connections = JoinSet::new();

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    tracing::info!("SSH server shutting down");
                    break;
                }

                result = listener.accept() => {
                    match result {
                        Ok((socket, peer_addr)) => {
                            self.handle_connection(&mut connections, socket, peer_addr);
                        }
                        Err(e) => {
                            tracing::error!("Failed to accept connection: {}", e);
                        }
                    }
                }

                // Reap finished connection tasks as we go
                Some(_) = connections.join_next(), if !connections.is_empty() => {}
            }
        }

        drop(listener);

        if connections.is_empty() {
            return;
        }

        tracing::debug!("Waiting for {} connections to close", connections.len());
        let drained = tokio::time::timeout(SHUTDOWN_GRACE, async {
            while connections.join_next().await.is_some() {}
        })
        .await;

        if drained.is_err() {
            tracing::warn!(
                "Aborting {} connections still open after {:?}",
                connections.len(),
                SHUTDOWN_GRACE
            );
            connections.abort_all();
            while connections.join_next().await.is_some() {}
        }
    }

    /// Handle a new incoming connection
    fn handle_connection(
        &self,
        connections: &mut JoinSet<()>,
        socket: TcpStream,
        peer_addr: SocketAddr,
    ) {
        tracing::info!("New connection from {}", peer_addr);

        let config = Arc::clone(&self.ssh_config);
        let handler = ConnectionHandler::new(Arc::clone(&self.context), peer_addr);

        connections.spawn(async move {
            let session = match russh::server::run_stream(config, socket, handler).await {
                Ok(session) => session,
                Err(e) => {
                    tracing::warn!("Handshake with {} failed: {}", peer_addr, e);
                    return;
                }
            };

            match session.await {
                Ok(()) => {
                    tracing::info!("Connection from {} closed normally", peer_addr);
                }
                Err(e) => {
                    tracing::warn!("Connection from {} closed with error: {}", peer_addr, e);
                }
            }
        });
    }
}
