//! tether-pty: PTY processes and reattachable terminal sessions for Tether.
//!
//! This crate sits between a remote terminal view and a CLI process running
//! in a pseudo-terminal. It owns the process, validates keystrokes before they
//! reach it, and keeps enough recent output around that a client that drops
//! off the network can reattach and pick up where it left off.
//!
//! # Architecture
//!
//! - [`PtyProcess`]: One PTY and its child process group (spawn, write, read,
//!   stream, resize, signal, close). Blocking syscalls run on dedicated threads.
//! - [`InputValidator`]: Stateless size and escape-sequence checks for client input.
//! - [`Session`]: A `PtyProcess` plus its bounded replay buffer and event fan-out.
//! - [`SessionRegistry`]: Owns all sessions, indexed by id and business key,
//!   and reaps exited or idle ones.

pub mod io_thread;
pub mod pty;
pub mod registry;
pub mod session;
pub mod validate;

use std::sync::{Mutex, MutexGuard, PoisonError};

pub use nix::sys::signal::Signal;
pub use pty::{LaunchSpec, OutputStream, PtyError, PtyProcess, WindowSize, DEFAULT_GRACE_PERIOD};
pub use registry::{RegistryConfig, SessionRegistry};
pub use session::{
    AttachGuard, Attachment, ReplayBuffer, Session, SessionEvent, SessionId, SessionSummary,
    DEFAULT_OUTPUT_BUFFER_BYTES,
};
pub use validate::{
    classify_control_byte, ControlSignal, InputValidator, SequenceKind, ValidationError,
    DEFAULT_MAX_INPUT_BYTES,
};

/// Lock a mutex, recovering the data if a previous holder panicked.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
