use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use futures::StreamExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::io_thread::UNKNOWN_EXIT_CODE;
use crate::lock;
use crate::pty::{LaunchSpec, OutputStream, PtyError, PtyProcess, DEFAULT_GRACE_PERIOD};
use crate::session::{Session, SessionId, SessionSummary, DEFAULT_OUTPUT_BUFFER_BYTES};

/// Tunables for the registry and the sessions it creates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegistryConfig {
    pub output_buffer_bytes: usize,
    pub idle_timeout: Duration,
    pub grace_period: Duration,
    pub sweep_interval: Duration,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            output_buffer_bytes: DEFAULT_OUTPUT_BUFFER_BYTES,
            idle_timeout: Duration::from_secs(5 * 60),
            grace_period: DEFAULT_GRACE_PERIOD,
            sweep_interval: Duration::from_secs(30),
        }
    }
}

/// How long `close()` waits for a session's output pump to drain.
const PUMP_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Default)]
struct SessionMaps {
    by_id: HashMap<SessionId, Arc<Session>>,
    by_key: HashMap<String, SessionId>,
    pumps: HashMap<SessionId, JoinHandle<()>>,
}

impl SessionMaps {
    fn remove(&mut self, id: &str) -> Option<(Arc<Session>, Option<JoinHandle<()>>)> {
        let session = self.by_id.remove(id)?;
        if self.by_key.get(session.business_key()).map(String::as_str) == Some(id) {
            self.by_key.remove(session.business_key());
        }
        let pump = self.pumps.remove(id);
        Some((session, pump))
    }
}

struct RegistryInner {
    config: RegistryConfig,
    maps: Mutex<SessionMaps>,
    creation_locks: Mutex<HashMap<String, CreationSlot>>,
}

impl RegistryInner {
    fn remove(&self, id: &str) -> Option<(Arc<Session>, Option<JoinHandle<()>>)> {
        lock(&self.maps).remove(id)
    }

    fn live(&self, session: Option<Arc<Session>>) -> Option<Arc<Session>> {
        session.filter(|s| !s.is_expired(self.config.idle_timeout))
    }
}

#[derive(Default)]
struct CreationSlot {
    mutex: Arc<tokio::sync::Mutex<()>>,
    users: usize,
}

/// Per-key creation lock. The map entry goes away with its last user.
struct CreationLock<'a> {
    inner: &'a RegistryInner,
    key: &'a str,
    mutex: Arc<tokio::sync::Mutex<()>>,
}

impl<'a> CreationLock<'a> {
    fn acquire(inner: &'a RegistryInner, key: &'a str) -> Self {
        let mut locks = lock(&inner.creation_locks);
        let slot = locks.entry(key.to_string()).or_default();
        slot.users += 1;
        Self {
            inner,
            key,
            mutex: Arc::clone(&slot.mutex),
        }
    }
}

impl Drop for CreationLock<'_> {
    fn drop(&mut self) {
        let mut locks = lock(&self.inner.creation_locks);
        if let Some(slot) = locks.get_mut(self.key) {
            slot.users -= 1;
            if slot.users == 0 {
                locks.remove(self.key);
            }
        }
    }
}

/// The single owner of every live session.
///
/// Sessions are indexed by their generated id and by the caller's business
/// key, with at most one live session per key. The maps sit behind one lock
/// that is only held for map operations, never across PTY I/O. Cloning the
/// registry is cheap and yields another handle to the same sessions.
#[derive(Clone)]
pub struct SessionRegistry {
    inner: Arc<RegistryInner>,
}

impl SessionRegistry {
    pub fn new(config: RegistryConfig) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                config,
                maps: Mutex::new(SessionMaps::default()),
                creation_locks: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn config(&self) -> &RegistryConfig {
        &self.inner.config
    }

    /// Return the live session for `business_key`, starting one if needed.
    ///
    /// Creation is serialized per key, so concurrent callers with the same key
    /// share a single process.
    pub async fn get_or_create(
        &self,
        business_key: &str,
        spec: &LaunchSpec,
    ) -> Result<Arc<Session>, PtyError> {
        let key_lock = CreationLock::acquire(&self.inner, business_key);
        let _creating = key_lock.mutex.lock().await;
        self.create_locked(business_key, spec).await
    }

    async fn create_locked(
        &self,
        business_key: &str,
        spec: &LaunchSpec,
    ) -> Result<Arc<Session>, PtyError> {
        let existing = {
            let maps = lock(&self.inner.maps);
            maps.by_key
                .get(business_key)
                .and_then(|id| maps.by_id.get(id))
                .cloned()
        };
        if let Some(session) = existing {
            if !session.is_expired(self.inner.config.idle_timeout) {
                return Ok(session);
            }
            log::info!(
                "session {} for {business_key} has expired, replacing it",
                session.id()
            );
            self.close(session.id()).await;
        }

        let owned_spec = spec.clone();
        let grace = self.inner.config.grace_period;
        let pty = tokio::task::spawn_blocking(move || PtyProcess::spawn(&owned_spec, grace))
            .await
            .map_err(|e| PtyError::Launch(format!("spawn task failed: {e}")))??;
        let output = pty.stream_output();

        let session = Arc::new(Session::new(
            business_key,
            pty,
            self.inner.config.output_buffer_bytes,
        ));
        {
            let mut maps = lock(&self.inner.maps);
            maps.by_key
                .insert(business_key.to_string(), session.id().to_string());
            maps.by_id
                .insert(session.id().to_string(), Arc::clone(&session));
            // Spawned under the map lock so the pump cannot deregister the
            // session before its handle is stored.
            if let Some(output) = output {
                let pump = tokio::spawn(pump_output(
                    Arc::downgrade(&self.inner),
                    Arc::clone(&session),
                    output,
                ));
                maps.pumps.insert(session.id().to_string(), pump);
            }
        }

        log::info!(
            "session {} started for {business_key} (pid {})",
            session.id(),
            session.pty().pid()
        );
        Ok(session)
    }

    /// Start (or reuse) the session for `business_key` and return its id.
    pub async fn start_session(
        &self,
        business_key: &str,
        spec: &LaunchSpec,
    ) -> Result<SessionId, PtyError> {
        self.get_or_create(business_key, spec)
            .await
            .map(|s| s.id().to_string())
    }

    /// Look up a live session by id. Unknown and expired ids yield `None`.
    pub fn get(&self, id: &str) -> Option<Arc<Session>> {
        let session = lock(&self.inner.maps).by_id.get(id).cloned();
        self.inner.live(session)
    }

    /// Look up a live session by business key.
    pub fn get_by_business_key(&self, key: &str) -> Option<Arc<Session>> {
        let session = {
            let maps = lock(&self.inner.maps);
            maps.by_key.get(key).and_then(|id| maps.by_id.get(id)).cloned()
        };
        self.inner.live(session)
    }

    /// Append output to a session's replay buffer.
    pub fn record_output(&self, session: &Session, data: &[u8]) {
        session.record_output(data);
    }

    /// Buffered output for a reconnecting client. The buffer is not cleared.
    pub fn replay(&self, session: &Session) -> Vec<u8> {
        session.replay()
    }

    /// Close a session's process and forget it. Returns `false` for unknown ids.
    ///
    /// Returns once the output pump has forwarded everything the process
    /// wrote, so attached clients see all output before the exit event.
    pub async fn close(&self, id: &str) -> bool {
        let Some((session, pump)) = self.inner.remove(id) else {
            return false;
        };
        session.pty().close().await;
        if let Some(pump) = pump {
            if tokio::time::timeout(PUMP_DRAIN_TIMEOUT, pump).await.is_err() {
                log::warn!("session {id}: output pump did not finish after close");
            }
        }
        // No-op when the pump already recorded the exit.
        session.finish(session.pty().return_code().unwrap_or(UNKNOWN_EXIT_CODE));
        log::info!("session {id} closed");
        true
    }

    #[cfg(test)]
    fn creation_lock_count(&self) -> usize {
        lock(&self.inner.creation_locks).len()
    }

    /// Close every session whose process finished or that sat idle too long.
    pub async fn sweep_expired(&self) -> Vec<SessionId> {
        let idle_timeout = self.inner.config.idle_timeout;
        let expired: Vec<SessionId> = lock(&self.inner.maps)
            .by_id
            .values()
            .filter(|s| s.is_expired(idle_timeout))
            .map(|s| s.id().to_string())
            .collect();

        for id in &expired {
            log::info!("sweeping expired session {id}");
            self.close(id).await;
        }
        expired
    }

    /// Run [`sweep_expired`] every `sweep_interval` until `stop_rx` fires.
    ///
    /// [`sweep_expired`]: SessionRegistry::sweep_expired
    pub fn spawn_sweeper(&self, mut stop_rx: mpsc::Receiver<()>) -> JoinHandle<()> {
        let registry = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(registry.inner.config.sweep_interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            // The first tick completes immediately.
            interval.tick().await;

            loop {
                tokio::select! {
                    _ = interval.tick() => {}
                    _ = stop_rx.recv() => return,
                }
                let swept = registry.sweep_expired().await;
                if !swept.is_empty() {
                    log::debug!("sweeper closed {} session(s)", swept.len());
                }
            }
        })
    }

    /// Summaries of every registered session, oldest first.
    pub fn list(&self) -> Vec<SessionSummary> {
        let mut summaries: Vec<SessionSummary> = lock(&self.inner.maps)
            .by_id
            .values()
            .map(|s| s.summary())
            .collect();
        summaries.sort_by_key(|s| s.created_at);
        summaries
    }

    pub fn len(&self) -> usize {
        lock(&self.inner.maps).by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Close every session.
    pub async fn shutdown(&self) {
        let ids: Vec<SessionId> = lock(&self.inner.maps).by_id.keys().cloned().collect();
        for id in ids {
            self.close(&id).await;
        }
    }
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new(RegistryConfig::default())
    }
}

/// Feed one session's process output into its replay buffer and subscribers.
///
/// When the stream ends the exit is recorded, the session is dropped from
/// the registry, and the PTY is released.
async fn pump_output(registry: Weak<RegistryInner>, session: Arc<Session>, mut output: OutputStream) {
    while let Some(chunk) = output.next().await {
        session.record_output(&chunk);
    }

    let code = session.pty().wait_exit().await;
    session.finish(code);
    if let Some(inner) = registry.upgrade() {
        inner.remove(session.id());
    }
    session.pty().close().await;
    log::info!(
        "session {} ({}) ended with code {code}",
        session.id(),
        session.business_key()
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::SessionEvent;
    use std::time::Instant;

    fn config() -> RegistryConfig {
        RegistryConfig {
            grace_period: Duration::from_millis(500),
            ..RegistryConfig::default()
        }
    }

    fn cat() -> LaunchSpec {
        LaunchSpec::new(["cat"])
    }

    async fn wait_for<F: Fn() -> bool>(cond: F, within: Duration) -> bool {
        let deadline = Instant::now() + within;
        while Instant::now() < deadline {
            if cond() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        cond()
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_get_or_create_reuses_session() {
        let registry = SessionRegistry::new(config());

        let a = registry.get_or_create("task-1", &cat()).await.unwrap();
        let b = registry.get_or_create("task-1", &cat()).await.unwrap();
        assert_eq!(a.id(), b.id());
        assert_eq!(a.pty().pid(), b.pty().pid());
        assert_eq!(registry.len(), 1);

        let c = registry.get_or_create("task-2", &cat()).await.unwrap();
        assert_ne!(a.id(), c.id());
        assert_eq!(registry.len(), 2);

        registry.shutdown().await;
        assert!(registry.is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_get_or_create_spawns_once() {
        let registry = SessionRegistry::new(config());

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let registry = registry.clone();
                tokio::spawn(async move {
                    registry.get_or_create("shared", &cat()).await.unwrap()
                })
            })
            .collect();

        let mut pids = Vec::new();
        let mut ids = Vec::new();
        for handle in handles {
            let session = handle.await.unwrap();
            pids.push(session.pty().pid());
            ids.push(session.id().to_string());
        }
        pids.dedup();
        ids.dedup();
        assert_eq!(pids.len(), 1);
        assert_eq!(ids.len(), 1);
        assert_eq!(registry.len(), 1);

        registry.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_start_session_and_lookups() {
        let registry = SessionRegistry::new(config());
        let id = registry.start_session("task-1", &cat()).await.unwrap();

        assert_eq!(registry.get(&id).unwrap().id(), id);
        assert_eq!(registry.get_by_business_key("task-1").unwrap().id(), id);
        assert!(registry.get("no-such-id").is_none());
        assert!(registry.get_by_business_key("no-such-key").is_none());

        let listed = registry.list();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].session_id, id);

        assert!(registry.close(&id).await);
        assert!(!registry.close(&id).await);
        assert!(registry.get(&id).is_none());
        assert!(registry.get_by_business_key("task-1").is_none());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_launch_failure_registers_nothing() {
        let registry = SessionRegistry::new(config());
        let result = registry
            .get_or_create("bad", &LaunchSpec::new(["/nonexistent/tether-missing"]))
            .await;
        assert!(matches!(result, Err(PtyError::Launch(_))));
        assert!(registry.is_empty());
        assert!(registry.get_by_business_key("bad").is_none());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_creation_locks_are_released() {
        let registry = SessionRegistry::new(config());

        for i in 0..5 {
            let id = registry
                .start_session(&format!("task-{i}"), &cat())
                .await
                .unwrap();
            assert!(registry.close(&id).await);
        }
        let result = registry
            .get_or_create("bad", &LaunchSpec::new(["/nonexistent/tether-missing"]))
            .await;
        assert!(result.is_err());
        assert_eq!(registry.creation_lock_count(), 0);

        let handles: Vec<_> = (0..6)
            .map(|_| {
                let registry = registry.clone();
                tokio::spawn(async move { registry.get_or_create("shared", &cat()).await })
            })
            .collect();
        for handle in handles {
            handle.await.unwrap().unwrap();
        }
        assert_eq!(registry.creation_lock_count(), 0);

        registry.shutdown().await;
        assert_eq!(registry.creation_lock_count(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_close_delivers_trailing_output_before_exit() {
        let registry = SessionRegistry::new(config());
        let spec = LaunchSpec::new([
            "/bin/sh",
            "-c",
            "trap 'echo goodbye; exit 0' TERM; echo ready; while :; do sleep 0.1; done",
        ]);
        let session = registry.get_or_create("trap", &spec).await.unwrap();
        let mut attachment = session.attach();

        let ready = wait_for(
            || String::from_utf8_lossy(&session.replay()).contains("ready"),
            Duration::from_secs(5),
        )
        .await;
        assert!(ready);

        assert!(registry.close(session.id()).await);

        let mut output = Vec::new();
        let mut exited = None;
        while let Ok(event) = attachment.events.try_recv() {
            assert!(exited.is_none(), "no events may follow the exit");
            match event {
                SessionEvent::Output(chunk) => output.extend_from_slice(&chunk),
                SessionEvent::Exited(code) => exited = Some(code),
            }
        }
        assert!(
            String::from_utf8_lossy(&output).contains("goodbye"),
            "output written during shutdown should reach clients"
        );
        assert_eq!(exited, Some(0));
        assert_eq!(session.exit_code(), Some(0));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_replay_is_capped_to_most_recent_output() {
        let registry = SessionRegistry::new(RegistryConfig {
            output_buffer_bytes: 1024,
            ..config()
        });
        let spec = LaunchSpec::new([
            "/bin/sh",
            "-c",
            "i=0; while [ $i -lt 400 ]; do echo \"line-$i\"; i=$((i+1)); done; sleep 30",
        ]);
        let session = registry.get_or_create("noisy", &spec).await.unwrap();

        let done = wait_for(
            || String::from_utf8_lossy(&registry.replay(&session)).contains("line-399"),
            Duration::from_secs(10),
        )
        .await;
        assert!(done, "expected the final line in the replay buffer");

        let replay = registry.replay(&session);
        assert!(replay.len() <= 1024);
        let text = String::from_utf8_lossy(&replay);
        assert!(!text.contains("line-0\r\n"), "oldest output should be evicted");
        assert!(text.trim_end().ends_with("line-399"));

        // Replay does not consume the buffer.
        assert_eq!(registry.replay(&session), replay);
        registry.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_record_output_reaches_attached_clients() {
        let registry = SessionRegistry::new(config());
        let session = registry.get_or_create("task-1", &cat()).await.unwrap();
        let mut attachment = session.attach();

        registry.record_output(&session, b"injected");
        let event = attachment.events.recv().await.unwrap();
        assert_eq!(event, SessionEvent::Output(bytes::Bytes::from_static(b"injected")));
        assert!(registry.replay(&session).ends_with(b"injected"));

        drop(attachment);
        registry.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_process_exit_deregisters_session() {
        let registry = SessionRegistry::new(config());
        let spec = LaunchSpec::new(["/bin/sh", "-c", "echo bye; exit 4"]);
        let session = registry.get_or_create("short", &spec).await.unwrap();
        let id = session.id().to_string();

        let gone = wait_for(|| registry.is_empty(), Duration::from_secs(5)).await;
        assert!(gone, "exited session should be removed");
        assert!(registry.get(&id).is_none());
        assert_eq!(session.exit_code(), Some(4));
        assert!(String::from_utf8_lossy(&session.replay()).contains("bye"));

        // The key is free again.
        let next = registry.get_or_create("short", &cat()).await.unwrap();
        assert_ne!(next.id(), id);
        registry.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_idle_session_is_swept() {
        let registry = SessionRegistry::new(RegistryConfig {
            idle_timeout: Duration::from_millis(200),
            ..config()
        });
        let session = registry.get_or_create("idle", &cat()).await.unwrap();
        let id = session.id().to_string();
        assert!(registry.get_by_business_key("idle").is_some());

        tokio::time::sleep(Duration::from_millis(400)).await;
        assert!(
            registry.get_by_business_key("idle").is_none(),
            "idle sessions are not handed out"
        );

        let swept = registry.sweep_expired().await;
        assert_eq!(swept, vec![id.clone()]);
        assert!(registry.get(&id).is_none());
        assert!(registry.is_empty());
        assert!(session.pty().is_closed());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_attached_session_is_not_swept() {
        let registry = SessionRegistry::new(RegistryConfig {
            idle_timeout: Duration::from_millis(100),
            ..config()
        });
        let session = registry.get_or_create("watched", &cat()).await.unwrap();
        let attachment = session.attach();

        tokio::time::sleep(Duration::from_millis(250)).await;
        assert!(registry.sweep_expired().await.is_empty());
        assert!(registry.get(session.id()).is_some());

        drop(attachment);
        registry.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_sweeper_task_runs_and_stops() {
        let registry = SessionRegistry::new(RegistryConfig {
            idle_timeout: Duration::from_millis(100),
            sweep_interval: Duration::from_millis(50),
            ..config()
        });
        registry.get_or_create("idle", &cat()).await.unwrap();

        let (stop_tx, stop_rx) = mpsc::channel(1);
        let handle = registry.spawn_sweeper(stop_rx);

        let swept = wait_for(|| registry.is_empty(), Duration::from_secs(5)).await;
        assert!(swept, "sweeper should reap the idle session");

        stop_tx.send(()).await.unwrap();
        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .expect("sweeper should stop")
            .unwrap();
    }
}
