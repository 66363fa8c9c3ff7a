//! In-memory terminal used by unit tests.

use std::sync::atomic::{AtomicBool, AtomicU16, AtomicUsize, Ordering};
use std::sync::{Mutex, OnceLock};

use bytes::Bytes;

use super::multiplexer::OutputBroadcaster;
use super::pty::{ProcessStatus, SessionError, SpawnOptions, Terminal};

/// Shell path that makes [`MockTerminal::spawn`] fail.
pub const FAILING_SHELL: &str = "/nonexistent/shell";

/// A terminal that records its input and emits output on demand.
pub struct MockTerminal {
    output: OutputBroadcaster,
    writes: Mutex<Vec<Vec<u8>>>,
    killed: AtomicBool,
    kill_count: AtomicUsize,
    started: AtomicBool,
    status: OnceLock<ProcessStatus>,
    cols: AtomicU16,
    rows: AtomicU16,
}

impl MockTerminal {
    /// Publishes a chunk as if the process had printed it.
    pub fn emit(&self, data: &[u8]) -> usize {
        self.output.broadcast(Bytes::copy_from_slice(data))
    }

    /// Simulates the process exiting on its own.
    pub fn exit(&self, code: u32) {
        let _ = self.status.set(ProcessStatus::Exited(code));
        self.output.close();
    }

    /// Every write, one entry per call.
    pub fn writes(&self) -> Vec<Vec<u8>> {
        self.writes.lock().unwrap().clone()
    }

    /// All written bytes, concatenated.
    pub fn written(&self) -> Vec<u8> {
        self.writes().concat()
    }

    /// How many times kill was called.
    pub fn kill_count(&self) -> usize {
        self.kill_count.load(Ordering::SeqCst)
    }

    /// Whether start_output was called.
    pub fn output_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }
}

impl Terminal for MockTerminal {
    fn spawn(options: &SpawnOptions) -> Result<Self, SessionError> {
        if options.shell.as_deref() == Some(FAILING_SHELL) {
            return Err(SessionError::SpawnFailed(format!(
                "{}: No such file or directory",
                FAILING_SHELL
            )));
        }

        Ok(Self {
            output: OutputBroadcaster::new(options.output_buffer),
            writes: Mutex::new(Vec::new()),
            killed: AtomicBool::new(false),
            kill_count: AtomicUsize::new(0),
            started: AtomicBool::new(false),
            status: OnceLock::new(),
            cols: AtomicU16::new(options.cols),
            rows: AtomicU16::new(options.rows),
        })
    }

    fn pid(&self) -> Option<u32> {
        None
    }

    fn size(&self) -> (u16, u16) {
        (
            self.cols.load(Ordering::Relaxed),
            self.rows.load(Ordering::Relaxed),
        )
    }

    fn is_running(&self) -> bool {
        !self.killed.load(Ordering::SeqCst) && self.status.get().is_none()
    }

    fn output(&self) -> &OutputBroadcaster {
        &self.output
    }

    fn start_output(&self) {
        self.started.store(true, Ordering::SeqCst);
    }

    async fn write(&self, data: &[u8]) -> Result<(), SessionError> {
        if !self.is_running() {
            return Err(SessionError::ProcessClosed);
        }
        self.writes.lock().unwrap().push(data.to_vec());
        Ok(())
    }

    async fn resize(&self, cols: u16, rows: u16) -> Result<(), SessionError> {
        if !self.is_running() {
            return Err(SessionError::ProcessClosed);
        }
        self.cols.store(cols, Ordering::Relaxed);
        self.rows.store(rows, Ordering::Relaxed);
        Ok(())
    }

    async fn kill(&self) -> Result<ProcessStatus, SessionError> {
        self.kill_count.fetch_add(1, Ordering::SeqCst);
        self.killed.store(true, Ordering::SeqCst);
        let status = *self.status.get_or_init(|| ProcessStatus::Killed);
        self.output.close();
        Ok(status)
    }

    async fn try_wait(&self) -> Result<ProcessStatus, SessionError> {
        Ok(self.status.get().copied().unwrap_or(ProcessStatus::Running))
    }
}
