use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::lock;
use crate::pty::{PtyProcess, WindowSize};

/// Opaque identifier for a session, generated at creation.
pub type SessionId = String;

/// Default cap on the replay buffer.
pub const DEFAULT_OUTPUT_BUFFER_BYTES: usize = 64 * 1024;

const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// Something that happened in a session, fanned out to every attached
/// connection in the order it happened.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    Output(Bytes),
    Exited(i32),
}

/// Bounded FIFO of the most recent output bytes.
#[derive(Debug, Clone)]
pub struct ReplayBuffer {
    buf: VecDeque<u8>,
    cap: usize,
}

impl ReplayBuffer {
    pub fn new(cap: usize) -> Self {
        Self {
            buf: VecDeque::with_capacity(cap.min(DEFAULT_OUTPUT_BUFFER_BYTES)),
            cap,
        }
    }

    /// Append bytes, evicting the oldest ones once the cap is exceeded.
    pub fn push(&mut self, data: &[u8]) {
        if self.cap == 0 {
            return;
        }
        let data = if data.len() > self.cap {
            &data[data.len() - self.cap..]
        } else {
            data
        };
        let overflow = (self.buf.len() + data.len()).saturating_sub(self.cap);
        self.buf.drain(..overflow);
        self.buf.extend(data);
    }

    pub fn contents(&self) -> Vec<u8> {
        let (front, back) = self.buf.as_slices();
        let mut out = Vec::with_capacity(self.buf.len());
        out.extend_from_slice(front);
        out.extend_from_slice(back);
        out
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.cap
    }
}

struct OutputLog {
    replay: ReplayBuffer,
    exit_code: Option<i32>,
}

/// One live terminal: a PTY process plus the state needed to reattach to it.
///
/// Output is recorded and broadcast under the same lock that [`attach`] takes,
/// so a connection's replay snapshot and its live event stream never overlap
/// or leave a gap.
///
/// [`attach`]: Session::attach
pub struct Session {
    id: SessionId,
    business_key: String,
    pty: PtyProcess,
    log: Mutex<OutputLog>,
    events: broadcast::Sender<SessionEvent>,
    created_at: DateTime<Utc>,
    last_activity: Arc<Mutex<Instant>>,
    attached: Arc<AtomicUsize>,
}

/// What a connection receives when it attaches.
pub struct Attachment {
    /// Buffered output produced before the attach.
    pub replay: Vec<u8>,
    /// Set when the process had already exited at attach time.
    pub exit_code: Option<i32>,
    /// Everything produced after the snapshot.
    pub events: broadcast::Receiver<SessionEvent>,
    pub guard: AttachGuard,
}

/// Counts a connection as attached until dropped.
pub struct AttachGuard {
    attached: Arc<AtomicUsize>,
    last_activity: Arc<Mutex<Instant>>,
}

impl Drop for AttachGuard {
    fn drop(&mut self) {
        self.attached.fetch_sub(1, Ordering::AcqRel);
        // The idle clock restarts when the last viewer leaves.
        *lock(&self.last_activity) = Instant::now();
    }
}

/// Serializable snapshot of a session for listings.
#[derive(Debug, Clone, Serialize)]
pub struct SessionSummary {
    pub session_id: SessionId,
    pub business_key: String,
    pub pid: u32,
    pub command: Vec<String>,
    pub rows: u16,
    pub cols: u16,
    pub created_at: DateTime<Utc>,
    pub idle_secs: u64,
    pub attached_clients: usize,
    pub exit_code: Option<i32>,
}

impl Session {
    pub fn new(business_key: impl Into<String>, pty: PtyProcess, buffer_bytes: usize) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            id: Uuid::new_v4().to_string(),
            business_key: business_key.into(),
            pty,
            log: Mutex::new(OutputLog {
                replay: ReplayBuffer::new(buffer_bytes),
                exit_code: None,
            }),
            events,
            created_at: Utc::now(),
            last_activity: Arc::new(Mutex::new(Instant::now())),
            attached: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn business_key(&self) -> &str {
        &self.business_key
    }

    pub fn pty(&self) -> &PtyProcess {
        &self.pty
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn window_size(&self) -> WindowSize {
        self.pty.window_size()
    }

    /// Append process output to the replay buffer and fan it out.
    pub fn record_output(&self, data: &[u8]) {
        if data.is_empty() {
            return;
        }
        {
            let mut log = lock(&self.log);
            log.replay.push(data);
            // No receivers is fine: nobody is attached right now.
            let _ = self
                .events
                .send(SessionEvent::Output(Bytes::copy_from_slice(data)));
        }
        self.touch();
    }

    /// Mark the process as finished. Only the first call has an effect.
    pub fn finish(&self, code: i32) {
        let mut log = lock(&self.log);
        if log.exit_code.is_none() {
            log.exit_code = Some(code);
            let _ = self.events.send(SessionEvent::Exited(code));
        }
    }

    /// Current replay buffer contents. Does not clear the buffer.
    pub fn replay(&self) -> Vec<u8> {
        lock(&self.log).replay.contents()
    }

    /// Exit code once the output pump has drained and recorded the exit.
    pub fn exit_code(&self) -> Option<i32> {
        lock(&self.log).exit_code
    }

    pub fn is_finished(&self) -> bool {
        self.exit_code().is_some()
    }

    /// Snapshot the replay buffer and subscribe to later events atomically.
    pub fn attach(&self) -> Attachment {
        let log = lock(&self.log);
        self.attached.fetch_add(1, Ordering::AcqRel);
        let attachment = Attachment {
            replay: log.replay.contents(),
            exit_code: log.exit_code,
            events: self.events.subscribe(),
            guard: AttachGuard {
                attached: Arc::clone(&self.attached),
                last_activity: Arc::clone(&self.last_activity),
            },
        };
        drop(log);
        self.touch();
        attachment
    }

    pub fn attached_clients(&self) -> usize {
        self.attached.load(Ordering::Acquire)
    }

    /// Record activity (bytes produced or consumed).
    pub fn touch(&self) {
        *lock(&self.last_activity) = Instant::now();
    }

    pub fn idle_for(&self) -> Duration {
        lock(&self.last_activity).elapsed()
    }

    /// Whether the session should be reaped: its process has finished, or it
    /// has no attached connection and has been idle longer than `idle_timeout`.
    pub fn is_expired(&self, idle_timeout: Duration) -> bool {
        self.is_finished() || (self.attached_clients() == 0 && self.idle_for() > idle_timeout)
    }

    pub fn summary(&self) -> SessionSummary {
        let size = self.window_size();
        SessionSummary {
            session_id: self.id.clone(),
            business_key: self.business_key.clone(),
            pid: self.pty.pid(),
            command: self.pty.command_line().to_vec(),
            rows: size.rows,
            cols: size.cols,
            created_at: self.created_at,
            idle_secs: self.idle_for().as_secs(),
            attached_clients: self.attached_clients(),
            exit_code: self.exit_code(),
        }
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("business_key", &self.business_key)
            .field("pid", &self.pty.pid())
            .finish_non_exhaustive()
    }
}
