//! PTY process management
//!
//! Spawns the session shell on a new pseudoterminal using the portable-pty
//! crate and exposes the pieces the bridge drives independently: non-blocking
//! terminal I/O, the window-size capability and the child handle.

use std::io;
#[cfg(unix)]
use std::io::{Read, Write};
#[cfg(unix)]
use std::os::fd::{AsRawFd, BorrowedFd, RawFd};

use portable_pty::{native_pty_system, Child, CommandBuilder, MasterPty, PtyPair, PtySize};
#[cfg(unix)]
use tokio::io::unix::AsyncFd;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use ots_core::{BridgeError, PtyRequest, WindowSize};

/// Shell used when neither the configuration nor `$SHELL` names one
pub const DEFAULT_SHELL: &str = "bash";

/// The program (and arguments) run inside the pseudoterminal
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShellCommand {
    program: String,
    args: Vec<String>,
}

impl ShellCommand {
    /// Run `program` with no arguments
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    /// Append an argument
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Pick the shell: configured override, then `$SHELL`, then `bash`
    pub fn resolve(configured: Option<&str>) -> Self {
        let program = configured
            .map(str::to_string)
            .or_else(|| std::env::var("SHELL").ok().filter(|s| !s.is_empty()))
            .unwrap_or_else(|| DEFAULT_SHELL.to_string());
        Self::new(program)
    }

    /// Program name as given
    pub fn program(&self) -> &str {
        &self.program
    }

    /// Build the command for the child
    ///
    /// The program is located on the server's `PATH` before the child
    /// environment is assembled, so it still resolves when the environment
    /// is not copied.
    fn to_command_builder(&self, term: &str, copy_env: bool) -> CommandBuilder {
        let program = locate_executable(&self.program);
        let mut cmd = CommandBuilder::new(program);
        cmd.args(&self.args);

        if !copy_env {
            cmd.env_clear();
        }
        cmd.env("TERM", term);
        cmd
    }
}

/// Resolve a bare program name against `PATH`; paths are returned unchanged
fn locate_executable(program: &str) -> String {
    if program.contains(std::path::MAIN_SEPARATOR) {
        return program.to_string();
    }

    std::env::var_os("PATH")
        .and_then(|paths| {
            std::env::split_paths(&paths)
                .map(|dir| dir.join(program))
                .find(|candidate| candidate.is_file())
        })
        .map(|path| path.to_string_lossy().into_owned())
        .unwrap_or_else(|| program.to_string())
}

/// Convert a window size to the portable-pty representation
pub fn pty_size(size: WindowSize) -> PtySize {
    PtySize {
        rows: size.rows,
        cols: size.cols,
        pixel_width: 0,
        pixel_height: 0,
    }
}

/// Async handle on the master side of the pseudoterminal
///
/// Wraps a duplicate of the master descriptor switched to non-blocking mode,
/// so reads and writes wait on readiness instead of parking a thread. A
/// pending write can therefore always be abandoned.
pub struct PtyIo {
    #[cfg(unix)]
    fd: AsyncFd<std::fs::File>,
}

impl PtyIo {
    #[cfg(unix)]
    fn from_master(master: &dyn MasterPty) -> Result<Self, BridgeError> {
        let raw = master
            .as_raw_fd()
            .ok_or_else(|| BridgeError::PtyUnavailable("master has no descriptor".to_string()))?;

        // SAFETY: `raw` belongs to `master`, which outlives this borrow;
        // the descriptor is duplicated before it is used
        let owned = unsafe { BorrowedFd::borrow_raw(raw) }
            .try_clone_to_owned()
            .map_err(|e| BridgeError::PtyUnavailable(format!("failed to dup master: {}", e)))?;
        set_nonblocking(owned.as_raw_fd()).map_err(|e| {
            BridgeError::PtyUnavailable(format!("failed to set O_NONBLOCK: {}", e))
        })?;

        let fd = AsyncFd::new(std::fs::File::from(owned)).map_err(|e| {
            BridgeError::PtyUnavailable(format!("failed to register master: {}", e))
        })?;
        Ok(Self { fd })
    }

    #[cfg(not(unix))]
    fn from_master(_master: &dyn MasterPty) -> Result<Self, BridgeError> {
        Err(BridgeError::PtyUnavailable(
            "non-blocking terminal I/O requires a unix host".to_string(),
        ))
    }

    /// Read whatever the child printed, waiting until something is available
    #[cfg(unix)]
    pub async fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            let mut guard = self.fd.readable().await?;
            match guard.try_io(|inner| inner.get_ref().read(buf)) {
                Ok(result) => return result,
                Err(_would_block) => continue,
            }
        }
    }

    /// Write all of `data` to the child's terminal input
    ///
    /// Dropping the returned future abandons the rest of the buffer.
    #[cfg(unix)]
    pub async fn write_all(&self, mut data: &[u8]) -> io::Result<()> {
        while !data.is_empty() {
            let mut guard = self.fd.writable().await?;
            match guard.try_io(|inner| inner.get_ref().write(data)) {
                Ok(Ok(0)) => {
                    return Err(io::Error::new(
                        io::ErrorKind::WriteZero,
                        "pseudoterminal accepted no input",
                    ))
                }
                Ok(Ok(n)) => data = &data[n..],
                Ok(Err(e)) if e.kind() == io::ErrorKind::Interrupted => continue,
                Ok(Err(e)) => return Err(e),
                Err(_would_block) => continue,
            }
        }
        Ok(())
    }

    #[cfg(not(unix))]
    pub async fn read(&self, _buf: &mut [u8]) -> io::Result<usize> {
        Err(io::Error::from(io::ErrorKind::Unsupported))
    }

    #[cfg(not(unix))]
    pub async fn write_all(&self, _data: &[u8]) -> io::Result<()> {
        Err(io::Error::from(io::ErrorKind::Unsupported))
    }
}

#[cfg(unix)]
fn set_nonblocking(fd: RawFd) -> io::Result<()> {
    // SAFETY: plain fcntl flag manipulation on a descriptor we own
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
    if flags < 0 {
        return Err(io::Error::last_os_error());
    }
    if unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) } < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// A shell running on the slave side of a fresh pseudoterminal
pub struct ShellProcess {
    /// Master side, used for window-size changes
    pub master: Box<dyn MasterPty + Send>,
    /// Child process handle
    pub child: Box<dyn Child + Send + Sync>,
    /// Terminal I/O shared by the input and output loops
    pub io: PtyIo,
}

impl ShellProcess {
    /// Allocate a pseudoterminal and start `shell` on it
    ///
    /// Must be called from within the tokio runtime.
    pub fn spawn(
        shell: &ShellCommand,
        request: &PtyRequest,
        copy_env: bool,
    ) -> Result<Self, BridgeError> {
        tracing::info!(
            "Spawning {} with TERM={} and size {}",
            shell.program(),
            request.term,
            request.size
        );

        let pty_system = native_pty_system();
        let PtyPair { master, slave } = pty_system
            .openpty(pty_size(request.size))
            .map_err(|e| BridgeError::PtyUnavailable(e.to_string()))?;
        let io = PtyIo::from_master(master.as_ref())?;

        let cmd = shell.to_command_builder(&request.term, copy_env);
        let child = slave.spawn_command(cmd).map_err(|e| BridgeError::Spawn {
            shell: shell.program().to_string(),
            reason: e.to_string(),
        })?;

        // Only the child may hold the slave, otherwise reads never see EOF
        drop(slave);

        tracing::debug!("Spawned shell process with PID: {:?}", child.process_id());

        Ok(Self { master, child, io })
    }
}

/// Apply every resize event to the pseudoterminal until the stream ends or
/// `cancel` fires, then hand the master back
pub async fn apply_resizes(
    master: Box<dyn MasterPty + Send>,
    mut resizes: mpsc::Receiver<WindowSize>,
    cancel: CancellationToken,
) -> Box<dyn MasterPty + Send> {
    loop {
        let size = tokio::select! {
            _ = cancel.cancelled() => break,
            size = resizes.recv() => match size {
                Some(size) => size,
                None => break,
            },
        };

        match master.resize(pty_size(size)) {
            Ok(()) => tracing::debug!("Resized pty to {}", size),
            Err(e) => tracing::warn!("Failed to resize pty to {}: {}", size, e),
        }
    }

    master
}

/// Whether a PTY read error means the child side is gone
///
/// Linux reports EIO on the master once every slave descriptor is closed.
pub fn is_child_gone(err: &io::Error) -> bool {
    #[cfg(unix)]
    if err.raw_os_error() == Some(libc::EIO) {
        return true;
    }

    matches!(
        err.kind(),
        io::ErrorKind::UnexpectedEof | io::ErrorKind::BrokenPipe
    )
}
