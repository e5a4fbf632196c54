use std::collections::HashMap;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use futures::Stream;
use nix::errno::Errno;
use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use portable_pty::{native_pty_system, CommandBuilder, MasterPty, PtySize};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};

use crate::io_thread::{self, UNKNOWN_EXIT_CODE};
use crate::lock;

/// Default time a process gets to exit after SIGTERM before it is killed.
pub const DEFAULT_GRACE_PERIOD: Duration = Duration::from_secs(5);

/// How long `close()` waits for the process to disappear after SIGKILL.
const KILL_WAIT: Duration = Duration::from_secs(2);

const OUTPUT_CHANNEL_CAPACITY: usize = 256;
const INPUT_CHANNEL_CAPACITY: usize = 256;
const DEFAULT_TERM: &str = "xterm-256color";

/// Errors from PTY operations.
#[derive(Debug, thiserror::Error)]
pub enum PtyError {
    /// The PTY could not be allocated or the command could not be started.
    #[error("failed to launch process: {0}")]
    Launch(String),
    #[error("PTY I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("PTY resize failed: {0}")]
    Resize(String),
    #[error("signal delivery failed: {0}")]
    Signal(#[from] Errno),
}

/// Terminal dimensions in character cells.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WindowSize {
    pub rows: u16,
    pub cols: u16,
}

impl From<WindowSize> for PtySize {
    fn from(size: WindowSize) -> Self {
        PtySize {
            rows: size.rows,
            cols: size.cols,
            pixel_width: 0,
            pixel_height: 0,
        }
    }
}

/// Everything needed to start a process inside a PTY.
///
/// The command line is passed through untouched; nothing here interprets it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LaunchSpec {
    pub command: Vec<String>,
    #[serde(default)]
    pub cwd: Option<PathBuf>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default = "default_rows")]
    pub rows: u16,
    #[serde(default = "default_cols")]
    pub cols: u16,
}

fn default_rows() -> u16 {
    24
}

fn default_cols() -> u16 {
    80
}

impl LaunchSpec {
    pub fn new<I, S>(command: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            command: command.into_iter().map(Into::into).collect(),
            cwd: None,
            env: HashMap::new(),
            rows: default_rows(),
            cols: default_cols(),
        }
    }

    pub fn cwd(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cwd = Some(dir.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn size(mut self, rows: u16, cols: u16) -> Self {
        self.rows = rows;
        self.cols = cols;
        self
    }

    pub fn window_size(&self) -> WindowSize {
        WindowSize {
            rows: self.rows,
            cols: self.cols,
        }
    }

    fn command_builder(&self) -> Result<CommandBuilder, PtyError> {
        let (program, args) = self
            .command
            .split_first()
            .ok_or_else(|| PtyError::Launch("empty command line".to_string()))?;

        let mut cmd = CommandBuilder::new(program);
        cmd.args(args);
        if let Some(dir) = &self.cwd {
            cmd.cwd(dir);
        }
        if !self.env.contains_key("TERM") {
            cmd.env("TERM", DEFAULT_TERM);
        }
        for (key, value) in &self.env {
            cmd.env(key, value);
        }
        Ok(cmd)
    }
}

struct OutputState {
    rx: Option<mpsc::Receiver<Bytes>>,
    pending: BytesMut,
}

/// Owns one pseudo-terminal and the process running inside it.
///
/// The child is started in its own session (portable-pty calls `setsid()`),
/// so its pid is also its process group id and every signal sent from here
/// reaches the whole tree it spawns. Blocking syscalls happen on the threads
/// in [`io_thread`]; methods on this type never block the async runtime.
pub struct PtyProcess {
    command_line: Vec<String>,
    pid: u32,
    master: Mutex<Option<Box<dyn MasterPty + Send>>>,
    input: Mutex<Option<mpsc::Sender<Vec<u8>>>>,
    output: Mutex<OutputState>,
    size: Mutex<WindowSize>,
    closed: AtomicBool,
    exit_rx: watch::Receiver<Option<i32>>,
    reader_stop: Arc<AtomicBool>,
    grace_period: Duration,
}

impl PtyProcess {
    /// Allocate a PTY at the requested size and start the command in it.
    pub fn spawn(spec: &LaunchSpec, grace_period: Duration) -> Result<Self, PtyError> {
        let cmd = spec.command_builder()?;
        let size = spec.window_size();

        let pair = native_pty_system()
            .openpty(size.into())
            .map_err(|e| PtyError::Launch(format!("failed to open PTY: {e}")))?;

        let child = pair
            .slave
            .spawn_command(cmd)
            .map_err(|e| PtyError::Launch(format!("failed to spawn {:?}: {e}", spec.command)))?;
        // The parent keeps only the master side.
        drop(pair.slave);

        let pid = child
            .process_id()
            .ok_or_else(|| PtyError::Launch("spawned child has no pid".to_string()))?;
        let master = pair.master;

        let (exit_tx, exit_rx) = watch::channel(None);
        let (output_tx, output_rx) = mpsc::channel(OUTPUT_CHANNEL_CAPACITY);
        let (input_tx, input_rx) = mpsc::channel(INPUT_CHANNEL_CAPACITY);
        let reader_stop = Arc::new(AtomicBool::new(false));

        // From here on the child is running; tear its group down on failure.
        let started = (|| -> Result<(), PtyError> {
            io_thread::start_wait_thread(pid, child, exit_tx)?;
            let writer = master
                .take_writer()
                .map_err(|e| PtyError::Launch(format!("failed to take writer: {e}")))?;
            let raw = master
                .as_raw_fd()
                .ok_or_else(|| PtyError::Launch("PTY master has no file descriptor".to_string()))?;
            let reader = io_thread::dup_master(raw)?;
            io_thread::start_writer_thread(pid, writer, input_rx)?;
            io_thread::start_reader_thread(
                pid,
                reader,
                output_tx,
                exit_rx.clone(),
                Arc::clone(&reader_stop),
            )?;
            Ok(())
        })();
        if let Err(e) = started {
            let _ = signal_group(pid, Signal::SIGKILL);
            return Err(match e {
                PtyError::Io(io) => PtyError::Launch(format!("failed to start I/O threads: {io}")),
                other => other,
            });
        }

        log::info!("spawned {:?} as pid {pid} ({}x{})", spec.command, size.rows, size.cols);

        Ok(Self {
            command_line: spec.command.clone(),
            pid,
            master: Mutex::new(Some(master)),
            input: Mutex::new(Some(input_tx)),
            output: Mutex::new(OutputState {
                rx: Some(output_rx),
                pending: BytesMut::new(),
            }),
            size: Mutex::new(size),
            closed: AtomicBool::new(false),
            exit_rx,
            reader_stop,
            grace_period,
        })
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn command_line(&self) -> &[String] {
        &self.command_line
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// `None` while the process is running, else its exit status.
    pub fn return_code(&self) -> Option<i32> {
        *self.exit_rx.borrow()
    }

    pub fn is_alive(&self) -> bool {
        self.return_code().is_none()
    }

    /// Wait until the process has exited and return its exit status.
    pub async fn wait_exit(&self) -> i32 {
        let mut rx = self.exit_rx.clone();
        rx.wait_for(Option::is_some)
            .await
            .map(|code| code.unwrap_or(UNKNOWN_EXIT_CODE))
            .unwrap_or(UNKNOWN_EXIT_CODE)
    }

    /// Queue bytes for the process's stdin.
    ///
    /// The write itself happens on the writer thread, in order. Suspends only
    /// while the input queue is full. No-op once closed or after the process
    /// has stopped reading.
    pub async fn write(&self, data: &[u8]) {
        if self.is_closed() || data.is_empty() {
            return;
        }
        let sender = lock(&self.input).clone();
        if let Some(sender) = sender {
            if sender.send(data.to_vec()).await.is_err() {
                log::debug!("pid {}: input dropped, writer has exited", self.pid);
            }
        }
    }

    /// Non-blocking read of up to `max_bytes` of output.
    ///
    /// Returns an empty vector when nothing is available right now, after the
    /// process has exited and its output has been drained, once closed, or
    /// after the output stream has been handed to [`stream_output`].
    ///
    /// [`stream_output`]: PtyProcess::stream_output
    pub fn read(&self, max_bytes: usize) -> Vec<u8> {
        if self.is_closed() || max_bytes == 0 {
            return Vec::new();
        }
        let mut state = lock(&self.output);
        let OutputState { rx, pending } = &mut *state;
        if let Some(rx) = rx {
            while pending.len() < max_bytes {
                match rx.try_recv() {
                    Ok(chunk) => pending.extend_from_slice(&chunk),
                    Err(_) => break,
                }
            }
        }
        let n = pending.len().min(max_bytes);
        pending.split_to(n).to_vec()
    }

    /// Take the lazily produced output stream.
    ///
    /// The stream yields chunks in the order the process wrote them and ends
    /// once the process has exited and all buffered output has been read.
    /// There is exactly one stream per process; later calls return `None`.
    pub fn stream_output(&self) -> Option<OutputStream> {
        let mut state = lock(&self.output);
        let rx = state.rx.take()?;
        let pending = if state.pending.is_empty() {
            None
        } else {
            Some(state.pending.split().freeze())
        };
        Some(OutputStream { pending, rx })
    }

    pub fn window_size(&self) -> WindowSize {
        *lock(&self.size)
    }

    /// Change the terminal size and notify the process group with SIGWINCH.
    ///
    /// Every call is applied immediately; debouncing is the client's job.
    pub fn resize(&self, rows: u16, cols: u16) -> Result<(), PtyError> {
        if self.is_closed() {
            return Ok(());
        }
        if rows == 0 || cols == 0 {
            return Err(PtyError::Resize(format!("invalid size {rows}x{cols}")));
        }
        let size = WindowSize { rows, cols };
        {
            let master = lock(&self.master);
            let Some(master) = master.as_ref() else {
                return Ok(());
            };
            master
                .resize(size.into())
                .map_err(|e| PtyError::Resize(format!("{e}")))?;
        }
        *lock(&self.size) = size;

        if self.is_alive() {
            if let Err(e) = signal_group(self.pid, Signal::SIGWINCH) {
                log::debug!("pid {}: SIGWINCH not delivered: {e}", self.pid);
            }
        }
        Ok(())
    }

    /// Deliver a signal to the child's whole process group.
    ///
    /// No-op once closed or after the process has exited.
    pub fn send_signal(&self, signal: Signal) -> Result<(), PtyError> {
        if self.is_closed() || !self.is_alive() {
            return Ok(());
        }
        log::debug!("pid {}: sending {signal} to process group", self.pid);
        signal_group(self.pid, signal)
    }

    /// Terminate the process and release the PTY.
    ///
    /// Sends SIGTERM to the group, waits up to the grace period, then escalates
    /// to SIGKILL. Calling this more than once is a no-op.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        // Dropping the sender lets the writer thread finish.
        lock(&self.input).take();

        if self.is_alive() {
            let _ = signal_group(self.pid, Signal::SIGTERM);
            if tokio::time::timeout(self.grace_period, self.wait_exit())
                .await
                .is_err()
            {
                log::warn!(
                    "pid {} still running {:?} after SIGTERM, sending SIGKILL",
                    self.pid,
                    self.grace_period
                );
                let _ = signal_group(self.pid, Signal::SIGKILL);
                if tokio::time::timeout(KILL_WAIT, self.wait_exit()).await.is_err() {
                    log::warn!("pid {} did not exit after SIGKILL", self.pid);
                }
            }
        }

        self.reader_stop.store(true, Ordering::Release);
        lock(&self.master).take();
        log::info!("pid {}: PTY closed (exit code {:?})", self.pid, self.return_code());
    }
}

impl Drop for PtyProcess {
    fn drop(&mut self) {
        self.reader_stop.store(true, Ordering::Release);
        if !self.is_closed() && self.is_alive() {
            let _ = signal_group(self.pid, Signal::SIGKILL);
        }
    }
}

impl std::fmt::Debug for PtyProcess {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PtyProcess")
            .field("pid", &self.pid)
            .field("command_line", &self.command_line)
            .field("closed", &self.is_closed())
            .field("return_code", &self.return_code())
            .finish_non_exhaustive()
    }
}

/// Signal a process group, treating "no such process" as already delivered.
fn signal_group(pgid: u32, signal: Signal) -> Result<(), PtyError> {
    let raw = i32::try_from(pgid)
        .map_err(|_| PtyError::Signal(Errno::EINVAL))?;
    match killpg(Pid::from_raw(raw), signal) {
        Ok(()) | Err(Errno::ESRCH) => Ok(()),
        Err(e) => Err(PtyError::Signal(e)),
    }
}

/// The output of one process as a stream of byte chunks.
///
/// Dropping the stream stops the reader thread at its next read.
pub struct OutputStream {
    pending: Option<Bytes>,
    rx: mpsc::Receiver<Bytes>,
}

impl Stream for OutputStream {
    type Item = Bytes;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Bytes>> {
        let this = self.get_mut();
        if let Some(chunk) = this.pending.take() {
            return Poll::Ready(Some(chunk));
        }
        this.rx.poll_recv(cx)
    }
}
