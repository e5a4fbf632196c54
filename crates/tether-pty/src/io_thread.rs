//! Dedicated OS threads that perform the blocking PTY syscalls.
//!
//! Each process gets one reader, one writer, and one thread blocked in
//! `wait()`. None of them touch the tokio scheduler except through channels,
//! so a wedged process can never stall other sessions. The reader owns its own
//! duplicate of the master fd and polls it with a short timeout so it notices
//! a stop request or a process exit promptly.

use std::fs::File;
use std::io::{self, Read, Write};
use std::os::fd::{AsFd, BorrowedFd, RawFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use nix::errno::Errno;
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use portable_pty::Child;
use tokio::sync::{mpsc, watch};

/// How long a single poll on the master waits before re-checking for stop/exit.
pub const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Exit code reported when the real status could not be collected.
pub const UNKNOWN_EXIT_CODE: i32 = -1;

const READ_CHUNK: usize = 4096;

/// Upper bound on reads performed after a stop request.
const MAX_DRAIN_READS: usize = 64;

/// Duplicate the master fd so the reader thread owns an independent handle.
pub(crate) fn dup_master(raw: RawFd) -> io::Result<File> {
    // SAFETY: `raw` comes from a live `MasterPty` owned by the caller for the
    // duration of this call; the borrow does not outlive it.
    let borrowed = unsafe { BorrowedFd::borrow_raw(raw) };
    Ok(File::from(borrowed.try_clone_to_owned()?))
}

/// Start the read loop for a process on a dedicated OS thread.
pub(crate) fn start_reader_thread(
    pid: u32,
    master: File,
    output: mpsc::Sender<Bytes>,
    exit_rx: watch::Receiver<Option<i32>>,
    stop: Arc<AtomicBool>,
) -> io::Result<()> {
    std::thread::Builder::new()
        .name(format!("pty-reader-{pid}"))
        .spawn(move || {
            read_loop(pid, master, output, exit_rx, stop);
        })?;
    Ok(())
}

fn read_loop(
    pid: u32,
    mut master: File,
    output: mpsc::Sender<Bytes>,
    exit_rx: watch::Receiver<Option<i32>>,
    stop: Arc<AtomicBool>,
) {
    let mut buf = [0u8; READ_CHUNK];
    let timeout = PollTimeout::from(POLL_INTERVAL.as_millis() as u16);

    loop {
        if stop.load(Ordering::Acquire) {
            log::debug!("pty-reader-{pid}: stop requested");
            drain_pending(&mut master, &output, &mut buf);
            return;
        }

        let polled = {
            let mut fds = [PollFd::new(master.as_fd(), PollFlags::POLLIN)];
            poll(&mut fds, timeout)
        };
        match polled {
            Ok(0) => {
                // Nothing readable. Once the child is gone this means the
                // output has been fully drained.
                if exit_rx.borrow().is_some() {
                    log::debug!("pty-reader-{pid}: process exited, output drained");
                    return;
                }
                continue;
            }
            Ok(_) => {}
            Err(Errno::EINTR) => continue,
            Err(e) => {
                log::debug!("pty-reader-{pid}: poll failed: {e}");
                return;
            }
        }

        match master.read(&mut buf) {
            Ok(0) => return,
            Ok(n) => {
                if output.blocking_send(Bytes::copy_from_slice(&buf[..n])).is_err() {
                    // Consumer dropped the stream.
                    return;
                }
            }
            Err(e) if matches!(e.kind(), io::ErrorKind::Interrupted | io::ErrorKind::WouldBlock) => {}
            // EIO once every slave fd is closed.
            Err(_) => return,
        }
    }
}

/// Forward whatever is already buffered on the master without waiting for more.
fn drain_pending(master: &mut File, output: &mpsc::Sender<Bytes>, buf: &mut [u8]) {
    for _ in 0..MAX_DRAIN_READS {
        let ready = {
            let mut fds = [PollFd::new(master.as_fd(), PollFlags::POLLIN)];
            poll(&mut fds, PollTimeout::ZERO)
        };
        if !matches!(ready, Ok(n) if n > 0) {
            return;
        }
        match master.read(buf) {
            Ok(0) | Err(_) => return,
            Ok(n) => {
                if output.blocking_send(Bytes::copy_from_slice(&buf[..n])).is_err() {
                    return;
                }
            }
        }
    }
}

/// Start the write loop for a process on a dedicated OS thread.
///
/// Input chunks are written in the order they were queued. The loop ends when
/// every sender is dropped or the PTY stops accepting writes.
pub(crate) fn start_writer_thread(
    pid: u32,
    writer: Box<dyn Write + Send>,
    input: mpsc::Receiver<Vec<u8>>,
) -> io::Result<()> {
    std::thread::Builder::new()
        .name(format!("pty-writer-{pid}"))
        .spawn(move || {
            write_loop(pid, writer, input);
        })?;
    Ok(())
}

fn write_loop(pid: u32, mut writer: Box<dyn Write + Send>, mut input: mpsc::Receiver<Vec<u8>>) {
    while let Some(data) = input.blocking_recv() {
        if let Err(e) = writer.write_all(&data).and_then(|_| writer.flush()) {
            log::debug!("pty-writer-{pid}: write failed, process likely exited: {e}");
            return;
        }
    }
}

/// Block in `wait()` on a dedicated thread and publish the exit code.
pub(crate) fn start_wait_thread(
    pid: u32,
    mut child: Box<dyn Child + Send + Sync>,
    exit_tx: watch::Sender<Option<i32>>,
) -> io::Result<()> {
    std::thread::Builder::new()
        .name(format!("pty-wait-{pid}"))
        .spawn(move || {
            let code = match child.wait() {
                Ok(status) => i32::try_from(status.exit_code()).unwrap_or(UNKNOWN_EXIT_CODE),
                Err(e) => {
                    log::warn!("pty-wait-{pid}: wait failed: {e}");
                    UNKNOWN_EXIT_CODE
                }
            };
            log::info!("process {pid} exited with code {code}");
            exit_tx.send_replace(Some(code));
        })?;
    Ok(())
}
