//! Terminal I/O bridge
//!
//! Binds the single authenticated session to a shell running on a fresh
//! pseudoterminal. Peer input and resize events are applied by two helper
//! tasks; the calling task copies child output to the transcript and then to
//! the peer, one chunk at a time.

mod pty;

pub use pty::{apply_resizes, PtyIo, ShellCommand, ShellProcess, DEFAULT_SHELL};

use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use portable_pty::Child;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use ots_core::{BridgeError, PtyRequest, SessionOutcome, WindowSize};

/// Size of each read from the pseudoterminal
pub const READ_CHUNK_SIZE: usize = 1024;

/// Sent to peers that start a session without requesting a terminal
pub const NO_PTY_MESSAGE: &str = "No PTY requested.\n";

/// Written to the terminal when the peer closes its input (Ctrl-D)
const END_OF_INPUT: &[u8] = b"\x04";

/// Destination for bytes going back to the remote peer
#[async_trait]
pub trait PeerOutput: Send {
    /// Deliver the whole buffer to the peer
    async fn write_all(&mut self, data: &[u8]) -> io::Result<()>;
}

/// One accepted, authenticated connection ready to be bridged
pub struct PeerSession {
    /// Remote address of the peer
    pub remote_addr: SocketAddr,
    /// Requested terminal, absent when the peer asked for none
    pub pty: Option<PtyRequest>,
    /// Bytes typed by the peer
    pub input: mpsc::Receiver<Bytes>,
    /// Window-size changes, in the order the peer sent them
    pub resizes: mpsc::Receiver<WindowSize>,
    /// Output sink
    pub output: Box<dyn PeerOutput>,
    /// Cancelled when the peer's connection goes away
    pub hangup: CancellationToken,
}

/// How the child is started
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    /// Shell run on the pseudoterminal
    pub shell: ShellCommand,
    /// Copy the server's environment into the child
    pub copy_env: bool,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            shell: ShellCommand::resolve(None),
            copy_env: true,
        }
    }
}

/// Bridges a peer session to a pseudoterminal-backed shell
#[derive(Debug, Clone, Default)]
pub struct PtyBridge {
    config: BridgeConfig,
}

impl PtyBridge {
    /// Create a bridge with the given child settings
    pub fn new(config: BridgeConfig) -> Self {
        Self { config }
    }

    /// Child settings
    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    /// Run the session to completion and report how it ended
    pub async fn run<W>(&self, session: PeerSession, transcript: &mut W) -> SessionOutcome
    where
        W: AsyncWrite + Unpin + Send,
    {
        let PeerSession {
            remote_addr,
            pty,
            input,
            resizes,
            mut output,
            hangup,
        } = session;

        let Some(request) = pty else {
            tracing::info!("Session from {} did not request a PTY", remote_addr);
            return match output.write_all(NO_PTY_MESSAGE.as_bytes()).await {
                Ok(()) => SessionOutcome::Completed,
                Err(e) => SessionOutcome::BridgeIo(BridgeError::PeerWrite(e)),
            };
        };

        let process = match ShellProcess::spawn(&self.config.shell, &request, self.config.copy_env)
        {
            Ok(process) => process,
            Err(e) => {
                tracing::error!("Failed to start shell for {}: {}", remote_addr, e);
                return SessionOutcome::BridgeIo(e);
            }
        };
        let ShellProcess {
            master,
            mut child,
            io: terminal,
        } = process;
        let terminal = Arc::new(terminal);

        let cancel = CancellationToken::new();
        let input_task = tokio::spawn(forward_input(Arc::clone(&terminal), input, cancel.clone()));
        let resize_task = tokio::spawn(apply_resizes(master, resizes, cancel.clone()));

        let copied = copy_output(&terminal, transcript, output.as_mut(), &hangup).await;

        if let Err(e) = &copied {
            tracing::warn!("Bridge I/O failed for {}: {}", remote_addr, e);
            if let Err(kill_err) = child.kill() {
                tracing::debug!("Failed to kill child: {}", kill_err);
            }
        }

        cancel.cancel();
        if let Err(e) = join_helper(input_task).await.and_then(|r| r) {
            tracing::warn!("Input forwarding stopped: {}", e);
        }
        // Keep the master open until the output loop is finished
        let master = join_helper(resize_task).await;

        let outcome = match copied {
            Err(e) => {
                if let Err(wait_err) = wait_child(child).await {
                    tracing::debug!("Failed to reap child: {}", wait_err);
                }
                SessionOutcome::BridgeIo(e)
            }
            Ok(()) => match wait_child(child).await {
                Ok(status) if status.success() => SessionOutcome::Completed,
                Ok(status) => SessionOutcome::AbnormalChildExit {
                    code: i32::try_from(status.exit_code()).unwrap_or(i32::MAX),
                },
                Err(e) => SessionOutcome::BridgeIo(e),
            },
        };
        drop(master);

        outcome
    }
}

/// Run a bridge future on its own task so a panic becomes an outcome
///
/// A panicking bridge is reported as `BridgeIo(Task)` instead of unwinding
/// through the caller and leaving the session without a result.
pub async fn supervise<F>(bridge: F) -> SessionOutcome
where
    F: Future<Output = SessionOutcome> + Send + 'static,
{
    match tokio::spawn(bridge).await {
        Ok(outcome) => outcome,
        Err(e) => {
            tracing::error!("Bridge task failed: {}", e);
            SessionOutcome::BridgeIo(BridgeError::Task(e.to_string()))
        }
    }
}

/// Forward peer input to the child until the peer stops sending or the
/// bridge cancels
///
/// Cancellation also abandons a write the terminal is not accepting.
async fn forward_input(
    terminal: Arc<PtyIo>,
    mut input: mpsc::Receiver<Bytes>,
    cancel: CancellationToken,
) -> Result<(), BridgeError> {
    loop {
        let received = tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            data = input.recv() => data,
        };
        let (data, done) = match received {
            Some(data) => (data, false),
            None => {
                tracing::debug!("Peer input closed");
                (Bytes::from_static(END_OF_INPUT), true)
            }
        };

        tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            written = terminal.write_all(&data) => written.map_err(BridgeError::ChildWrite)?,
        }

        if done {
            return Ok(());
        }
    }
}

/// Copy child output to the transcript and then to the peer
///
/// Returns `Ok` when the child side of the terminal is gone.
async fn copy_output<W>(
    terminal: &PtyIo,
    transcript: &mut W,
    output: &mut dyn PeerOutput,
    hangup: &CancellationToken,
) -> Result<(), BridgeError>
where
    W: AsyncWrite + Unpin + Send,
{
    let mut buf = vec![0u8; READ_CHUNK_SIZE];
    loop {
        let result = tokio::select! {
            _ = hangup.cancelled() => return Err(BridgeError::PeerDisconnected),
            result = terminal.read(&mut buf) => result,
        };

        let n = match result {
            Ok(0) => return Ok(()),
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) if pty::is_child_gone(&e) => return Ok(()),
            Err(e) => return Err(BridgeError::ChildRead(e)),
        };
        let chunk = &buf[..n];

        transcript
            .write_all(chunk)
            .await
            .map_err(BridgeError::Transcript)?;
        transcript.flush().await.map_err(BridgeError::Transcript)?;

        output.write_all(chunk).await.map_err(BridgeError::PeerWrite)?;
    }
}

async fn wait_child(
    mut child: Box<dyn Child + Send + Sync>,
) -> Result<portable_pty::ExitStatus, BridgeError> {
    tokio::task::spawn_blocking(move || child.wait())
        .await
        .map_err(|e| BridgeError::Task(e.to_string()))?
        .map_err(BridgeError::Wait)
}

async fn join_helper<T>(task: JoinHandle<T>) -> Result<T, BridgeError> {
    task.await.map_err(|e| BridgeError::Task(e.to_string()))
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::time::Duration;

    /// Peer output collected on a channel
    struct ChannelOutput(mpsc::UnboundedSender<Vec<u8>>);

    #[async_trait]
    impl PeerOutput for ChannelOutput {
        async fn write_all(&mut self, data: &[u8]) -> io::Result<()> {
            self.0
                .send(data.to_vec())
                .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "receiver dropped"))
        }
    }

    /// Peer that hung up
    struct ClosedOutput;

    #[async_trait]
    impl PeerOutput for ClosedOutput {
        async fn write_all(&mut self, _data: &[u8]) -> io::Result<()> {
            Err(io::Error::new(io::ErrorKind::BrokenPipe, "peer gone"))
        }
    }

    struct Harness {
        session: PeerSession,
        input: mpsc::Sender<Bytes>,
        _resizes: mpsc::Sender<WindowSize>,
        output: mpsc::UnboundedReceiver<Vec<u8>>,
        hangup: CancellationToken,
    }

    fn harness(pty: Option<PtyRequest>) -> Harness {
        let (input_tx, input_rx) = mpsc::channel(16);
        let (resize_tx, resize_rx) = mpsc::channel(16);
        let (output_tx, output_rx) = mpsc::unbounded_channel();
        let hangup = CancellationToken::new();
        Harness {
            session: PeerSession {
                remote_addr: "127.0.0.1:40000".parse().unwrap(),
                pty,
                input: input_rx,
                resizes: resize_rx,
                output: Box::new(ChannelOutput(output_tx)),
                hangup: hangup.clone(),
            },
            input: input_tx,
            _resizes: resize_tx,
            output: output_rx,
            hangup,
        }
    }

    fn xterm() -> Option<PtyRequest> {
        Some(PtyRequest {
            term: "xterm".to_string(),
            size: WindowSize::default(),
        })
    }

    fn sh(script: &str, copy_env: bool) -> PtyBridge {
        PtyBridge::new(BridgeConfig {
            shell: ShellCommand::new("/bin/sh").arg("-c").arg(script),
            copy_env,
        })
    }

    fn drain(output: &mut mpsc::UnboundedReceiver<Vec<u8>>) -> Vec<u8> {
        let mut collected = Vec::new();
        while let Ok(chunk) = output.try_recv() {
            collected.extend(chunk);
        }
        collected
    }

    async fn wait_for(output: &mut mpsc::UnboundedReceiver<Vec<u8>>, marker: &[u8]) -> Vec<u8> {
        let mut seen = Vec::new();
        while !seen.ends_with(marker) {
            match output.recv().await {
                Some(chunk) => seen.extend(chunk),
                None => break,
            }
        }
        seen
    }

    #[tokio::test]
    async fn test_no_pty_gets_diagnostic() {
        let mut h = harness(None);
        let mut transcript = Vec::new();

        let outcome = sh("exit 9", true).run(h.session, &mut transcript).await;

        assert!(matches!(outcome, SessionOutcome::Completed));
        assert_eq!(drain(&mut h.output), NO_PTY_MESSAGE.as_bytes());
        assert!(transcript.is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_echo_reaches_transcript_and_peer() {
        let payload: Vec<u8> = (0..64u8).map(|i| b'a' + (i % 26)).collect();
        let h = harness(xterm());
        let bridge = sh("stty raw -echo; printf ready; head -c 64", true);
        let mut transcript = Vec::new();

        let session = h.session;
        let input = h.input.clone();
        let mut output = h.output;
        let sent = payload.clone();

        let run = bridge.run(session, &mut transcript);
        let feed = async move {
            // Wait for the prompt so the payload is not echoed by the line discipline
            let seen = wait_for(&mut output, b"ready").await;
            input.send(Bytes::from(sent)).await.unwrap();
            (seen, output)
        };

        let (outcome, (mut seen, mut output)) =
            tokio::time::timeout(Duration::from_secs(10), async { tokio::join!(run, feed) })
                .await
                .expect("bridge did not finish");

        assert!(matches!(outcome, SessionOutcome::Completed), "{}", outcome);
        seen.extend(drain(&mut output));

        let mut expected = b"ready".to_vec();
        expected.extend(&payload);
        assert_eq!(seen, expected);
        assert_eq!(transcript, expected);
    }

    #[tokio::test]
    async fn test_nonzero_exit_is_reported() {
        let h = harness(xterm());
        let mut transcript = Vec::new();

        let outcome = tokio::time::timeout(
            Duration::from_secs(10),
            sh("exit 3", true).run(h.session, &mut transcript),
        )
        .await
        .expect("bridge did not finish");

        assert!(matches!(
            outcome,
            SessionOutcome::AbnormalChildExit { code: 3 }
        ));
        assert_eq!(outcome.exit_code(), 3);
    }

    #[tokio::test]
    async fn test_peer_write_failure_is_bridge_error() {
        let mut h = harness(xterm());
        h.session.output = Box::new(ClosedOutput);
        let mut transcript = Vec::new();

        let outcome = tokio::time::timeout(
            Duration::from_secs(10),
            sh("printf hello; sleep 5", true).run(h.session, &mut transcript),
        )
        .await
        .expect("bridge did not finish");

        assert!(matches!(
            outcome,
            SessionOutcome::BridgeIo(BridgeError::PeerWrite(_))
        ));
        // Logged before the peer write was attempted
        assert_eq!(transcript, b"hello");
    }

    #[tokio::test]
    async fn test_term_is_exported_without_parent_env() {
        let mut h = harness(Some(PtyRequest {
            term: "vt100".to_string(),
            size: WindowSize::new(100, 30),
        }));
        let mut transcript = Vec::new();

        let outcome = tokio::time::timeout(
            Duration::from_secs(10),
            sh("printf \"%s|%s\" \"$TERM\" \"${HOME:-unset}\"", false)
                .run(h.session, &mut transcript),
        )
        .await
        .expect("bridge did not finish");

        assert!(matches!(outcome, SessionOutcome::Completed), "{}", outcome);
        assert_eq!(drain(&mut h.output), b"vt100|unset");
    }

    #[tokio::test]
    async fn test_missing_shell_fails_to_spawn() {
        let h = harness(xterm());
        let bridge = PtyBridge::new(BridgeConfig {
            shell: ShellCommand::new("/nonexistent/shell"),
            copy_env: true,
        });
        let mut transcript = Vec::new();

        let outcome = bridge.run(h.session, &mut transcript).await;
        assert!(matches!(
            outcome,
            SessionOutcome::BridgeIo(BridgeError::Spawn { .. })
        ));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_unread_input_does_not_block_exit() {
        let h = harness(xterm());
        let bridge = sh("stty raw -echo; printf ready; sleep 2", true);
        let mut transcript = Vec::new();

        let session = h.session;
        let input = h.input.clone();
        let mut output = h.output;

        let run = bridge.run(session, &mut transcript);
        let feed = async move {
            wait_for(&mut output, b"ready").await;
            // Far more than the terminal buffers; the child never reads it
            for _ in 0..16 {
                input.send(Bytes::from(vec![b'x'; 16 * 1024])).await.unwrap();
            }
        };

        let (outcome, ()) =
            tokio::time::timeout(Duration::from_secs(15), async { tokio::join!(run, feed) })
                .await
                .expect("bridge hung on input the child never read");

        assert!(matches!(outcome, SessionOutcome::Completed), "{}", outcome);
        assert_eq!(transcript, b"ready");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_peer_hangup_ends_silent_session() {
        let h = harness(xterm());
        let bridge = sh("printf started; sleep 30", true);
        let mut transcript = Vec::new();

        let session = h.session;
        let hangup = h.hangup.clone();
        let mut output = h.output;

        let run = bridge.run(session, &mut transcript);
        let disconnect = async move {
            wait_for(&mut output, b"started").await;
            hangup.cancel();
        };

        let (outcome, ()) =
            tokio::time::timeout(Duration::from_secs(10), async { tokio::join!(run, disconnect) })
                .await
                .expect("bridge kept running after the peer left");

        assert!(matches!(
            outcome,
            SessionOutcome::BridgeIo(BridgeError::PeerDisconnected)
        ));
        assert_eq!(transcript, b"started");
    }

    async fn exploding_bridge() -> SessionOutcome {
        panic!("bridge blew up")
    }

    #[tokio::test]
    async fn test_supervise_reports_panic_as_task_error() {
        let outcome = supervise(exploding_bridge()).await;
        assert!(matches!(
            outcome,
            SessionOutcome::BridgeIo(BridgeError::Task(_))
        ));
        assert_eq!(outcome.exit_code(), 1);

        let outcome = supervise(async { SessionOutcome::Completed }).await;
        assert!(matches!(outcome, SessionOutcome::Completed));
    }
}
