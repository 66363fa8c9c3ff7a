//! PTY process handles.
//!
//! This module defines the [`Terminal`] abstraction (one interactive
//! interpreter process with byte-stream input and a broadcast output
//! stream) and [`PtyTerminal`], its implementation on top of a native
//! pseudo-terminal.

use std::future::Future;
use std::io::{Read, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU16, Ordering};
use std::sync::{Arc, OnceLock, PoisonError};

use bytes::Bytes;
use portable_pty::{native_pty_system, Child, CommandBuilder, MasterPty, PtySize};
use protocol::{DEFAULT_COLS, DEFAULT_ROWS};
use thiserror::Error;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;

use super::multiplexer::{OutputBroadcaster, DEFAULT_SUBSCRIBER_CAPACITY};

/// Writes queued per process before `write` waits.
const INPUT_QUEUE_DEPTH: usize = 64;

/// Identifier of a network connection.
pub type ConnectionId = String;

/// Errors that can occur during session operations.
#[derive(Error, Debug)]
pub enum SessionError {
    /// No session is registered for the connection.
    #[error("session not found: {0}")]
    NotFound(ConnectionId),

    /// A session is already registered for the connection.
    #[error("duplicate session for connection: {0}")]
    DuplicateSession(ConnectionId),

    /// The process behind the session has terminated.
    #[error("process closed")]
    ProcessClosed,

    /// Failed to spawn the PTY.
    #[error("failed to spawn PTY: {0}")]
    SpawnFailed(String),

    /// Failed to write to the PTY.
    #[error("failed to write to PTY: {0}")]
    WriteFailed(String),

    /// Failed to resize the PTY.
    #[error("failed to resize PTY: {0}")]
    ResizeFailed(String),

    /// Failed to kill the process.
    #[error("failed to kill process: {0}")]
    KillFailed(String),

    /// The configured session limit was reached.
    #[error("session limit reached ({0})")]
    CapacityReached(usize),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Status of a terminal process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessStatus {
    /// Process is running.
    Running,
    /// Process exited with a code.
    Exited(u32),
    /// Process was terminated by a signal.
    Killed,
}

impl ProcessStatus {
    /// Exit code, if the process exited on its own.
    pub fn exit_code(&self) -> Option<i32> {
        match self {
            ProcessStatus::Exited(code) => i32::try_from(*code).ok(),
            _ => None,
        }
    }
}

/// Parameters for spawning a terminal process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpawnOptions {
    /// Shell command. `None` selects the platform's interactive shell.
    pub shell: Option<String>,
    /// Terminal width in columns.
    pub cols: u16,
    /// Terminal height in rows.
    pub rows: u16,
    /// Working directory. `None` means the operator's home directory.
    pub cwd: Option<PathBuf>,
    /// Variables added on top of the inherited server environment.
    pub env: Vec<(String, String)>,
    /// Per-subscriber output queue depth, in chunks.
    pub output_buffer: usize,
}

impl Default for SpawnOptions {
    fn default() -> Self {
        Self {
            shell: None,
            cols: DEFAULT_COLS,
            rows: DEFAULT_ROWS,
            cwd: None,
            env: Vec::new(),
            output_buffer: DEFAULT_SUBSCRIBER_CAPACITY,
        }
    }
}

/// One interactive interpreter process.
///
/// Implementations own exactly one OS process. Output is published through
/// an [`OutputBroadcaster`]; callers subscribe first and then call
/// [`Terminal::start_output`] so no early output is missed.
pub trait Terminal: Send + Sync + 'static {
    /// Spawns a new process.
    fn spawn(options: &SpawnOptions) -> Result<Self, SessionError>
    where
        Self: Sized;

    /// Process ID, if the platform exposes one.
    fn pid(&self) -> Option<u32>;

    /// Current terminal size as `(cols, rows)`.
    fn size(&self) -> (u16, u16);

    /// Whether the process is still accepting input.
    fn is_running(&self) -> bool;

    /// The output stream of this process.
    fn output(&self) -> &OutputBroadcaster;

    /// Starts pumping process output into [`Terminal::output`].
    fn start_output(&self);

    /// Writes raw bytes to the process input.
    fn write(&self, data: &[u8]) -> impl Future<Output = Result<(), SessionError>> + Send;

    /// Resizes the terminal.
    fn resize(&self, cols: u16, rows: u16)
        -> impl Future<Output = Result<(), SessionError>> + Send;

    /// Terminates the process. Calling it again returns the first status.
    fn kill(&self) -> impl Future<Output = Result<ProcessStatus, SessionError>> + Send;

    /// Polls the process for exit without blocking.
    fn try_wait(&self) -> impl Future<Output = Result<ProcessStatus, SessionError>> + Send;
}

/// A terminal backed by a native pseudo-terminal.
pub struct PtyTerminal {
    /// The PTY master handle.
    master: Mutex<Box<dyn MasterPty + Send>>,

    /// Queue feeding the input thread. `None` once the process is killed.
    input: std::sync::Mutex<Option<mpsc::Sender<Bytes>>>,

    /// Cancelled on kill; releases writers waiting on a full queue.
    closed: CancellationToken,

    /// Output side of the PTY, handed to the reader thread on start.
    reader: std::sync::Mutex<Option<Box<dyn Read + Send>>>,

    /// The child process.
    child: Arc<std::sync::Mutex<Box<dyn Child + Send + Sync>>>,

    /// Broadcast of produced output.
    output: OutputBroadcaster,

    /// Set on the first kill.
    killed: AtomicBool,

    /// Final status, recorded once.
    status: OnceLock<ProcessStatus>,

    cols: AtomicU16,
    rows: AtomicU16,

    /// Process ID.
    pid: Option<u32>,
}

impl PtyTerminal {
    fn label(&self) -> String {
        thread_label(self.pid)
    }
}

impl Terminal for PtyTerminal {
    fn spawn(options: &SpawnOptions) -> Result<Self, SessionError> {
        let shell_cmd = detect_shell(options.shell.clone());

        let pty_system = native_pty_system();
        let pair = pty_system
            .openpty(PtySize {
                rows: options.rows,
                cols: options.cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| SessionError::SpawnFailed(e.to_string()))?;

        // CommandBuilder starts from a snapshot of the server environment.
        let mut cmd = CommandBuilder::new(&shell_cmd);
        cmd.env("TERM", "xterm-256color");
        for (key, value) in &options.env {
            cmd.env(key, value);
        }

        match options.cwd.clone().or_else(dirs::home_dir) {
            Some(dir) => cmd.cwd(dir),
            None => tracing::warn!("No home directory found, inheriting server cwd"),
        }

        let child = pair
            .slave
            .spawn_command(cmd)
            .map_err(|e| SessionError::SpawnFailed(format!("{}: {}", shell_cmd, e)))?;
        // The slave end must close here so reads see EOF once the child exits.
        drop(pair.slave);

        let pid = child.process_id();

        let writer = pair
            .master
            .take_writer()
            .map_err(|e| SessionError::SpawnFailed(e.to_string()))?;
        let reader = pair
            .master
            .try_clone_reader()
            .map_err(|e| SessionError::SpawnFailed(e.to_string()))?;

        tracing::debug!(
            shell = %shell_cmd,
            pid = ?pid,
            cols = options.cols,
            rows = options.rows,
            "Spawned PTY process"
        );

        let input = spawn_input_thread(&thread_label(pid), writer)?;

        Ok(PtyTerminal {
            master: Mutex::new(pair.master),
            input: std::sync::Mutex::new(Some(input)),
            closed: CancellationToken::new(),
            reader: std::sync::Mutex::new(Some(reader)),
            child: Arc::new(std::sync::Mutex::new(child)),
            output: OutputBroadcaster::new(options.output_buffer),
            killed: AtomicBool::new(false),
            status: OnceLock::new(),
            cols: AtomicU16::new(options.cols),
            rows: AtomicU16::new(options.rows),
            pid,
        })
    }

    fn pid(&self) -> Option<u32> {
        self.pid
    }

    fn size(&self) -> (u16, u16) {
        (
            self.cols.load(Ordering::Relaxed),
            self.rows.load(Ordering::Relaxed),
        )
    }

    fn is_running(&self) -> bool {
        !self.killed.load(Ordering::SeqCst) && !self.output.is_closed()
    }

    fn output(&self) -> &OutputBroadcaster {
        &self.output
    }

    fn start_output(&self) {
        let reader = self
            .reader
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();

        match reader {
            Some(reader) => self.output.start_reader_loop(self.label(), reader),
            None => tracing::debug!(pid = ?self.pid, "Output already started"),
        }
    }

    async fn write(&self, data: &[u8]) -> Result<(), SessionError> {
        if !self.is_running() {
            return Err(SessionError::ProcessClosed);
        }

        let input = self
            .input
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or(SessionError::ProcessClosed)?;

        tokio::select! {
            sent = input.send(Bytes::copy_from_slice(data)) => {
                sent.map_err(|_| SessionError::ProcessClosed)
            }
            _ = self.closed.cancelled() => Err(SessionError::ProcessClosed),
        }
    }

    async fn resize(&self, cols: u16, rows: u16) -> Result<(), SessionError> {
        if !self.is_running() {
            return Err(SessionError::ProcessClosed);
        }

        let master = self.master.lock().await;
        master
            .resize(PtySize {
                rows,
                cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| SessionError::ResizeFailed(e.to_string()))?;

        self.cols.store(cols, Ordering::Relaxed);
        self.rows.store(rows, Ordering::Relaxed);

        tracing::debug!(pid = ?self.pid, cols = cols, rows = rows, "Resized PTY");

        Ok(())
    }

    async fn kill(&self) -> Result<ProcessStatus, SessionError> {
        if self.killed.swap(true, Ordering::SeqCst) {
            return Ok(self.status.get().copied().unwrap_or(ProcessStatus::Killed));
        }

        self.closed.cancel();

        let child = Arc::clone(&self.child);
        let status = tokio::task::spawn_blocking(move || {
            let mut child = child.lock().unwrap_or_else(PoisonError::into_inner);
            if let Some(status) = child.try_wait()? {
                return Ok(ProcessStatus::Exited(status.exit_code()));
            }
            // The child may exit between try_wait and kill; wait() settles it.
            if let Err(e) = child.kill() {
                tracing::debug!(error = %e, "Kill signal not delivered");
            }
            child.wait().map(|_| ProcessStatus::Killed)
        })
        .await
        .map_err(|e| SessionError::KillFailed(e.to_string()))?
        .map_err(|e: std::io::Error| SessionError::KillFailed(e.to_string()))?;

        let status = *self.status.get_or_init(|| status);
        // The input thread exits once its queue drains or its write fails.
        self.input
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        self.output.close();

        tracing::info!(pid = ?self.pid, status = ?status, "PTY process terminated");

        Ok(status)
    }

    async fn try_wait(&self) -> Result<ProcessStatus, SessionError> {
        if let Some(status) = self.status.get() {
            return Ok(*status);
        }

        let mut child = self.child.lock().unwrap_or_else(PoisonError::into_inner);
        match child.try_wait()? {
            Some(status) => Ok(*self
                .status
                .get_or_init(|| ProcessStatus::Exited(status.exit_code()))),
            None => Ok(ProcessStatus::Running),
        }
    }
}

impl Drop for PtyTerminal {
    fn drop(&mut self) {
        if self.killed.swap(true, Ordering::SeqCst) {
            return;
        }

        let mut child = self.child.lock().unwrap_or_else(PoisonError::into_inner);
        if let Ok(Some(_)) = child.try_wait() {
            return;
        }
        if child.kill().is_ok() {
            let _ = child.wait();
        }
        self.output.close();
        tracing::debug!(pid = ?self.pid, "PTY process killed on drop");
    }
}

fn thread_label(pid: Option<u32>) -> String {
    pid.map(|pid| format!("pty-{}", pid))
        .unwrap_or_else(|| "pty".to_string())
}

/// Starts the thread that owns the PTY writer.
///
/// Writes to a PTY block when the process stops reading its input, so they
/// never run on the async runtime.
fn spawn_input_thread(
    label: &str,
    mut writer: Box<dyn Write + Send>,
) -> Result<mpsc::Sender<Bytes>, SessionError> {
    let (tx, mut rx) = mpsc::channel::<Bytes>(INPUT_QUEUE_DEPTH);
    let name = format!("{}-input", label);

    std::thread::Builder::new()
        .name(name.clone())
        .spawn(move || {
            while let Some(chunk) = rx.blocking_recv() {
                if let Err(e) = writer.write_all(&chunk).and_then(|_| writer.flush()) {
                    tracing::debug!(thread = %name, error = %e, "PTY input closed");
                    break;
                }
            }
        })
        .map_err(|e| SessionError::SpawnFailed(format!("input thread: {}", e)))?;

    Ok(tx)
}

/// Detects the shell to use.
///
/// Returns the shell in this order of preference:
/// 1. The provided shell if Some
/// 2. `$SHELL` on unix, `%COMSPEC%` on windows
/// 3. `/bin/sh` on unix, `powershell.exe` on windows
pub fn detect_shell(shell: Option<String>) -> String {
    if let Some(s) = shell.filter(|s| !s.is_empty()) {
        return s;
    }

    if cfg!(windows) {
        std::env::var("COMSPEC").unwrap_or_else(|_| "powershell.exe".to_string())
    } else {
        std::env::var("SHELL").unwrap_or_else(|_| "/bin/sh".to_string())
    }
}
