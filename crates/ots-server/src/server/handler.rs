//! SSH connection handler implementation
//!
//! Implements the russh server handler for the single-use server: public key
//! authorization against the loaded key set, PTY and window-size requests,
//! and handing the first shell request to the session gate.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use russh::server::{Auth, Handle, Handler, Msg, Session};
use russh::{Channel, ChannelId, CryptoVec, Pty};
use russh_keys::key::PublicKey;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use ots_core::{PtyRequest, WindowSize};

use crate::bridge::{supervise, PeerOutput, PeerSession};
use crate::state::ServerContext;

/// Buffered peer input chunks before the handler waits on the shell
const INPUT_BUFFER: usize = 256;

/// Buffered resize events
const RESIZE_BUFFER: usize = 16;

/// Peer output written back over an SSH channel
struct ChannelOutput {
    handle: Handle,
    channel: ChannelId,
}

#[async_trait]
impl PeerOutput for ChannelOutput {
    async fn write_all(&mut self, data: &[u8]) -> io::Result<()> {
        self.handle
            .data(self.channel, CryptoVec::from_slice(data))
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "ssh session closed"))
    }
}

/// Handler for a single SSH client connection
pub struct ConnectionHandler {
    /// Shared server context
    context: Arc<ServerContext>,
    /// Peer address of the connecting client
    peer_addr: SocketAddr,
    /// Terminal requested on the session channel
    pty: Option<PtyRequest>,
    /// Channel the shell was started on
    session_channel: Option<ChannelId>,
    /// Forwards channel data to the bridge
    input_tx: Option<mpsc::Sender<Bytes>>,
    /// Forwards window changes to the bridge
    resize_tx: Option<mpsc::Sender<WindowSize>>,
    /// Tells the bridge the peer is gone
    hangup: CancellationToken,
}

impl ConnectionHandler {
    /// Create a handler for a freshly accepted socket
    pub fn new(context: Arc<ServerContext>, peer_addr: SocketAddr) -> Self {
        Self {
            context,
            peer_addr,
            pty: None,
            session_channel: None,
            input_tx: None,
            resize_tx: None,
            hangup: CancellationToken::new(),
        }
    }

    /// Offer this channel to the session gate
    ///
    /// The bridge runs on its own task so the handler keeps pumping channel
    /// data and window changes while the shell is alive.
    fn start_session(&mut self, channel: ChannelId, session: &mut Session) {
        if self.session_channel.is_some() {
            tracing::warn!("{} requested a second shell, ignoring", self.peer_addr);
            session.channel_failure(channel);
            return;
        }
        session.channel_success(channel);

        let (input_tx, input_rx) = mpsc::channel(INPUT_BUFFER);
        let (resize_tx, resize_rx) = mpsc::channel(RESIZE_BUFFER);
        self.session_channel = Some(channel);
        self.input_tx = Some(input_tx);
        self.resize_tx = Some(resize_tx);

        let handle = session.handle();
        let peer_session = PeerSession {
            remote_addr: self.peer_addr,
            pty: self.pty.clone(),
            input: input_rx,
            resizes: resize_rx,
            output: Box::new(ChannelOutput {
                handle: handle.clone(),
                channel,
            }),
            hangup: self.hangup.clone(),
        };

        let context = Arc::clone(&self.context);
        let peer_addr = self.peer_addr;

        tokio::spawn(async move {
            let gate = Arc::clone(&context.gate);
            let bridge_handle = handle.clone();
            let bridged = gate
                .on_connection_accepted(move || async move {
                    tracing::info!("Session from {} connected", peer_addr);

                    let outcome = supervise(async move {
                        let mut transcript = context.transcript.lock().await;
                        context.bridge.run(peer_session, &mut *transcript).await
                    })
                    .await;

                    let status = u32::try_from(outcome.exit_code()).unwrap_or(1);
                    if bridge_handle
                        .exit_status_request(channel, status)
                        .await
                        .is_err()
                    {
                        tracing::debug!("Could not send exit status to {}", peer_addr);
                    }
                    if bridge_handle.eof(channel).await.is_err() {
                        tracing::debug!("Could not send EOF to {}", peer_addr);
                    }
                    if bridge_handle.close(channel).await.is_err() {
                        tracing::debug!("Could not close channel for {}", peer_addr);
                    }

                    tracing::info!("Session from {} disconnected", peer_addr);
                    outcome
                })
                .await;

            if !bridged {
                tracing::info!(
                    "Session already used, closing channel for {}",
                    peer_addr
                );
                if handle.close(channel).await.is_err() {
                    tracing::debug!("Could not close refused channel for {}", peer_addr);
                }
            }
        });
    }
}

impl Drop for ConnectionHandler {
    fn drop(&mut self) {
        tracing::debug!("Connection from {} ended", self.peer_addr);
        self.hangup.cancel();
    }
}

#[async_trait]
impl Handler for ConnectionHandler {
    type Error = anyhow::Error;

    /// Handle public key authentication
    ///
    /// Only keys in the authorized set are accepted. A rejection never
    /// touches the session gate.
    async fn auth_publickey(
        &mut self,
        user: &str,
        public_key: &PublicKey,
    ) -> Result<Auth, Self::Error> {
        let fingerprint = public_key.fingerprint();

        if self.context.authorized_keys.contains(public_key) {
            tracing::info!(
                "Accepted public key for {} from {}, fingerprint: {}",
                user,
                self.peer_addr,
                fingerprint
            );
            return Ok(Auth::Accept);
        }

        tracing::warn!(
            "Authentication REJECTED for {} from {}: unknown key {}",
            user,
            self.peer_addr,
            fingerprint
        );
        Ok(Auth::Reject {
            proceed_with_methods: None,
        })
    }

    /// Handle channel open request
    async fn channel_open_session(
        &mut self,
        channel: Channel<Msg>,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        tracing::debug!("Channel opened: {:?}", channel.id());
        Ok(true)
    }

    async fn pty_request(
        &mut self,
        channel: ChannelId,
        term: &str,
        col_width: u32,
        row_height: u32,
        _pix_width: u32,
        _pix_height: u32,
        _modes: &[(Pty, u32)],
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        let size = WindowSize::from_ssh(col_width, row_height);
        tracing::debug!("PTY requested on {:?}: TERM={} size={}", channel, term, size);

        self.pty = Some(PtyRequest {
            term: term.to_string(),
            size,
        });
        session.channel_success(channel);
        Ok(())
    }

    async fn window_change_request(
        &mut self,
        channel: ChannelId,
        col_width: u32,
        row_height: u32,
        _pix_width: u32,
        _pix_height: u32,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        let size = WindowSize::from_ssh(col_width, row_height);
        tracing::debug!("Window change on {:?}: {}", channel, size);

        match &self.resize_tx {
            Some(resize_tx) => {
                if resize_tx.send(size).await.is_err() {
                    tracing::debug!("Bridge no longer accepts resizes");
                }
            }
            None => {
                if let Some(pty) = self.pty.as_mut() {
                    pty.size = size;
                }
            }
        }
        Ok(())
    }

    async fn shell_request(
        &mut self,
        channel: ChannelId,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        tracing::debug!("Shell requested on {:?}", channel);
        self.start_session(channel, session);
        Ok(())
    }

    /// The requested command is ignored; the peer gets the same shell
    async fn exec_request(
        &mut self,
        channel: ChannelId,
        data: &[u8],
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        tracing::debug!(
            "Exec requested on {:?}: {}",
            channel,
            String::from_utf8_lossy(data)
        );
        self.start_session(channel, session);
        Ok(())
    }

    /// Handle incoming data on a channel
    async fn data(
        &mut self,
        channel: ChannelId,
        data: &[u8],
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        tracing::trace!("Received {} bytes on channel {:?}", data.len(), channel);

        match &self.input_tx {
            Some(input_tx) if self.session_channel == Some(channel) => {
                if input_tx.send(Bytes::copy_from_slice(data)).await.is_err() {
                    tracing::trace!("Bridge no longer accepts input");
                }
            }
            _ => tracing::debug!("Dropping {} bytes before shell start", data.len()),
        }
        Ok(())
    }

    /// Handle channel EOF
    async fn channel_eof(
        &mut self,
        channel: ChannelId,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        tracing::debug!("Channel EOF: {:?}", channel);
        if self.session_channel == Some(channel) {
            self.input_tx = None;
        }
        Ok(())
    }

    /// Handle channel close
    async fn channel_close(
        &mut self,
        channel: ChannelId,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        tracing::debug!("Channel closed: {:?}", channel);
        if self.session_channel == Some(channel) {
            self.input_tx = None;
            self.resize_tx = None;
            self.hangup.cancel();
        }
        Ok(())
    }
}
