//! The process-wide coordinator.
//!
//! A [`Runtime`] owns the caches shared by every session and a single
//! delivery task. Sessions' runner threads enqueue messages and wake the
//! task; the task drains each session's queue, deduplicates large deltas
//! through the [`MessageCache`] and writes the result to the session's
//! [`SessionClient`].

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use indexmap::IndexMap;
use thiserror::Error;
use tokio::sync::Notify;
use tokio::task::JoinHandle;

use crate::config::RuntimeConfig;
use crate::memo::MemoRegistry;
use crate::message::{BackMsg, Delta, Element, ForwardBody, ForwardMsg, ScriptFinishedStatus};
use crate::message_cache::{self, MessageCache};
use crate::program::ScriptSource;
use crate::session::{AppSession, SessionError, SessionId, SessionServices};
use crate::stats::{CacheStat, StatsManager};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuntimeState {
    Initial,
    NoSessionsConnected,
    OneOrMoreSessionsConnected,
    Stopping,
    Stopped,
}

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("client connection closed")]
    Closed,
    #[error("cannot encode message: {0}")]
    Encode(#[from] serde_json::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// The connection of one session.
pub trait SessionClient: Send + Sync {
    fn write_forward_msg(&self, msg: ForwardMsg) -> Result<(), ClientError>;
}

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("the runtime is not accepting sessions in state {0:?}")]
    NotRunning(RuntimeState),
    #[error("no session with id {0}")]
    UnknownSession(SessionId),
    #[error(transparent)]
    Session(#[from] SessionError),
}

/// A connected session with its client and run counter.
pub struct SessionInfo {
    pub session: Arc<AppSession>,
    pub client: Arc<dyn SessionClient>,
    run_count: AtomicU64,
}

impl SessionInfo {
    /// Full runs that finished successfully so far.
    pub fn run_count(&self) -> u64 {
        self.run_count.load(Ordering::SeqCst)
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

pub struct Runtime {
    config: RuntimeConfig,
    state: Mutex<RuntimeState>,
    sessions: Mutex<IndexMap<SessionId, Arc<SessionInfo>>>,
    message_cache: Arc<MessageCache>,
    memo: Arc<MemoRegistry>,
    stats: StatsManager,
    wake: Arc<Notify>,
}

impl Runtime {
    pub fn new(config: RuntimeConfig) -> Arc<Self> {
        Self::with_memo(config.clone(), Arc::new(MemoRegistry::new().with_defaults(config.memo_defaults())))
    }

    pub fn with_memo(config: RuntimeConfig, memo: Arc<MemoRegistry>) -> Arc<Self> {
        let message_cache = Arc::new(MessageCache::new());
        let stats = StatsManager::new();
        stats.register_provider(message_cache.clone());
        stats.register_provider(memo.clone());
        Arc::new(Self {
            config,
            state: Mutex::new(RuntimeState::Initial),
            sessions: Mutex::new(IndexMap::new()),
            message_cache,
            memo,
            stats,
            wake: Arc::new(Notify::new()),
        })
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub fn state(&self) -> RuntimeState {
        *lock(&self.state)
    }

    fn set_state(&self, state: RuntimeState) {
        let mut current = lock(&self.state);
        if *current != state {
            tracing::debug!(from = ?*current, to = ?state, "runtime state changed");
            *current = state;
        }
    }

    pub fn memo(&self) -> &Arc<MemoRegistry> {
        &self.memo
    }

    pub fn message_cache(&self) -> &MessageCache {
        &self.message_cache
    }

    /// Spawns the delivery task on the current tokio runtime.
    pub fn start(self: &Arc<Self>) -> JoinHandle<()> {
        self.set_state(RuntimeState::NoSessionsConnected);
        let runtime = self.clone();
        tokio::spawn(async move { runtime.run_loop().await })
    }

    async fn run_loop(self: Arc<Self>) {
        tracing::info!("runtime started");
        let interval = self.config.delivery_interval();
        loop {
            tokio::select! {
                _ = self.wake.notified() => {}
                _ = tokio::time::sleep(interval) => {}
            }
            if self.state() == RuntimeState::Stopping {
                break;
            }
            self.deliver_all();
        }
        self.shut_down_sessions().await;
        self.set_state(RuntimeState::Stopped);
        tracing::info!("runtime stopped");
    }

    /// Asks the delivery task to shut every session down and exit. Await the
    /// handle returned by [`Runtime::start`] to wait for it.
    pub fn stop(&self) {
        let state = self.state();
        if matches!(state, RuntimeState::Stopping | RuntimeState::Stopped) {
            return;
        }
        self.set_state(RuntimeState::Stopping);
        self.wake.notify_one();
    }

    async fn shut_down_sessions(&self) {
        let sessions: Vec<Arc<SessionInfo>> = lock(&self.sessions).values().cloned().collect();
        for info in &sessions {
            info.session.shutdown();
        }
        let joins = sessions.iter().map(|info| {
            let session = info.session.clone();
            tokio::task::spawn_blocking(move || session.join())
        });
        for result in futures::future::join_all(joins).await {
            if let Err(err) = result {
                tracing::error!("joining a session runner failed: {err}");
            }
        }
        self.deliver_all();
        for info in &sessions {
            self.message_cache.remove_session(info.session.id());
        }
        lock(&self.sessions).clear();
    }

    /// Creates a session for `source`, starts its runner and registers it.
    /// The session does not run until the client asks for a rerun.
    pub fn connect(
        &self,
        source: Arc<dyn ScriptSource>,
        client: Arc<dyn SessionClient>,
    ) -> Result<SessionId, RuntimeError> {
        let state = self.state();
        if !matches!(
            state,
            RuntimeState::NoSessionsConnected | RuntimeState::OneOrMoreSessionsConnected
        ) {
            return Err(RuntimeError::NotRunning(state));
        }
        let session = Arc::new(AppSession::new(
            source,
            SessionServices {
                memo: self.memo.clone(),
                wake: self.wake.clone(),
            },
        ));
        session.start()?;
        let id = session.id().clone();
        tracing::info!(session_id = %id, script = session.script_name(), "session connected");
        lock(&self.sessions).insert(
            id.clone(),
            Arc::new(SessionInfo {
                session,
                client,
                run_count: AtomicU64::new(0),
            }),
        );
        self.set_state(RuntimeState::OneOrMoreSessionsConnected);
        Ok(id)
    }

    /// Shuts a session down. Its runner exits in the background; the
    /// delivery loop sends what is left in its queue and then forgets it.
    pub fn disconnect(&self, id: &SessionId) -> bool {
        let info = lock(&self.sessions).get(id).cloned();
        match info {
            Some(info) => {
                tracing::info!(session_id = %id, "session disconnecting");
                info.session.shutdown();
                self.wake.notify_one();
                true
            }
            None => false,
        }
    }

    pub fn handle_back_msg(&self, id: &SessionId, msg: BackMsg) -> Result<(), RuntimeError> {
        let info = self
            .session_info(id)
            .ok_or_else(|| RuntimeError::UnknownSession(id.clone()))?;
        if let BackMsg::ClearCache = msg {
            self.clear_caches();
        }
        info.session.handle_back_msg(msg)?;
        Ok(())
    }

    /// Drops every memoized value and every cached message.
    pub fn clear_caches(&self) {
        tracing::info!("clearing caches");
        self.memo.clear_all(None);
        self.message_cache.clear();
    }

    pub fn session_info(&self, id: &SessionId) -> Option<Arc<SessionInfo>> {
        lock(&self.sessions).get(id).cloned()
    }

    pub fn session_ids(&self) -> Vec<SessionId> {
        lock(&self.sessions).keys().cloned().collect()
    }

    pub fn is_active_session(&self, id: &SessionId) -> bool {
        lock(&self.sessions).contains_key(id)
    }

    /// Memory held by the shared caches and by every session.
    pub fn stats(&self) -> Vec<CacheStat> {
        let mut stats = self.stats.get_stats();
        let sessions: Vec<Arc<SessionInfo>> = lock(&self.sessions).values().cloned().collect();
        for info in sessions {
            stats.extend(crate::stats::StatsProvider::get_stats(&*info.session));
        }
        stats
    }

    /// Drains every session once.
    pub fn deliver_all(&self) {
        let sessions: Vec<Arc<SessionInfo>> = lock(&self.sessions).values().cloned().collect();
        for info in sessions {
            let finished = info.session.is_shut_down();
            let delivered = self.deliver(&info);
            if finished || !delivered {
                self.forget(&info);
            }
        }
        let empty = lock(&self.sessions).is_empty();
        if empty && self.state() == RuntimeState::OneOrMoreSessionsConnected {
            self.set_state(RuntimeState::NoSessionsConnected);
        }
    }

    fn forget(&self, info: &SessionInfo) {
        let id = info.session.id();
        if lock(&self.sessions).shift_remove(id).is_none() {
            return;
        }
        info.session.shutdown();
        let removed = self.message_cache.remove_session(id);
        tracing::info!(session_id = %id, cache_entries_released = removed, "session closed");
    }

    /// Sends everything queued for one session. Returns `false` if the
    /// client failed, which closes the session.
    fn deliver(&self, info: &SessionInfo) -> bool {
        let id = info.session.id();
        for msg in info.session.flush() {
            match self.prepare(msg, info) {
                Some(outgoing) => {
                    if outgoing.finished_status() == Some(ScriptFinishedStatus::FinishedSuccessfully) {
                        let run_count = info.run_count.fetch_add(1, Ordering::SeqCst) + 1;
                        let expired = self
                            .message_cache
                            .expire(id, run_count, self.config.message_cache_max_age);
                        tracing::trace!(session_id = %id, run_count, expired, "run counted");
                    }
                    if let Err(err) = info.client.write_forward_msg(outgoing) {
                        tracing::warn!(session_id = %id, "client write failed: {err}");
                        return false;
                    }
                }
                None => continue,
            }
        }
        true
    }

    /// Hashes `msg`, degrades it if it is too large, and swaps it for a
    /// reference if the session already holds it.
    fn prepare(&self, mut msg: ForwardMsg, info: &SessionInfo) -> Option<ForwardMsg> {
        let id = info.session.id();
        let min_size = self.config.min_cached_message_size;
        let mut size = match message_cache::populate_hash(&mut msg, min_size) {
            Ok(size) => size,
            Err(err) => {
                tracing::error!(session_id = %id, "cannot serialize message, dropping it: {err}");
                return None;
            }
        };

        if msg.is_delta() && size > self.config.max_message_size {
            tracing::warn!(session_id = %id, size, limit = self.config.max_message_size, "message too large");
            msg = oversized(&msg, size, self.config.max_message_size);
            size = match message_cache::populate_hash(&mut msg, min_size) {
                Ok(size) => size,
                Err(err) => {
                    tracing::error!(session_id = %id, "cannot serialize message, dropping it: {err}");
                    return None;
                }
            };
        }

        if !msg.metadata.cacheable {
            return Some(msg);
        }
        let run_count = info.run_count();
        let max_age = self.config.message_cache_max_age;
        let outgoing = if self.message_cache.has_reference(&msg, id, run_count, max_age) {
            message_cache::to_reference(&msg).unwrap_or_else(|| msg.clone())
        } else {
            msg.clone()
        };
        self.message_cache.add(&msg, id, run_count, size);
        Some(outgoing)
    }
}

/// An error element taking the place of a delta that exceeds the limit.
fn oversized(msg: &ForwardMsg, size: usize, limit: usize) -> ForwardMsg {
    let fragment_id = match &msg.body {
        ForwardBody::Delta { fragment_id, .. } => fragment_id.clone(),
        _ => None,
    };
    ForwardMsg::delta(
        msg.delta_path().to_vec(),
        Delta::NewElement {
            element: Element::exception(
                "MessageSizeError",
                format!("payload of {size} bytes exceeds the message size limit of {limit} bytes"),
            ),
        },
        fragment_id,
    )
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::sync::mpsc;

    use super::*;
    use crate::program::NativeSource;

    /// Forwards written messages into a channel.
    struct ChannelClient(mpsc::UnboundedSender<ForwardMsg>);

    impl SessionClient for ChannelClient {
        fn write_forward_msg(&self, msg: ForwardMsg) -> Result<(), ClientError> {
            self.0.send(msg).map_err(|_| ClientError::Closed)
        }
    }

    struct FailingClient;

    impl SessionClient for FailingClient {
        fn write_forward_msg(&self, _msg: ForwardMsg) -> Result<(), ClientError> {
            Err(ClientError::Closed)
        }
    }

    fn small_config() -> RuntimeConfig {
        RuntimeConfig {
            min_cached_message_size: 64,
            max_message_size: 4096,
            delivery_interval_ms: 5,
            ..RuntimeConfig::default()
        }
    }

    fn page() -> Arc<dyn ScriptSource> {
        Arc::new(NativeSource::from_fn("page", |ctx| {
            ctx.emit_element(Element::Markdown {
                body: "x".repeat(200),
            });
            Ok(())
        }))
    }

    async fn until_finished(rx: &mut mpsc::UnboundedReceiver<ForwardMsg>) -> Vec<ForwardMsg> {
        let mut messages = Vec::new();
        loop {
            let msg = tokio::time::timeout(Duration::from_secs(10), rx.recv())
                .await
                .expect("timed out")
                .expect("channel closed");
            let done = msg.finished_status().is_some();
            messages.push(msg);
            if done {
                return messages;
            }
        }
    }

    fn rerun() -> BackMsg {
        BackMsg::Rerun {
            controls: None,
            fragment_id: None,
        }
    }

    #[tokio::test]
    async fn repeated_deltas_become_references_per_session() {
        let runtime = Runtime::new(small_config());
        let task = runtime.start();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let id = runtime.connect(page(), Arc::new(ChannelClient(tx))).unwrap();

        runtime.handle_back_msg(&id, rerun()).unwrap();
        let first = until_finished(&mut rx).await;
        assert!(first.iter().any(|msg| msg.element().is_some()));

        runtime.handle_back_msg(&id, rerun()).unwrap();
        let second = until_finished(&mut rx).await;
        assert!(second.iter().all(|msg| msg.element().is_none()));
        assert!(second
            .iter()
            .any(|msg| matches!(msg.body, ForwardBody::RefHash { .. })));
        assert_eq!(runtime.session_info(&id).unwrap().run_count(), 2);

        let (other_tx, mut other_rx) = mpsc::unbounded_channel();
        let other = runtime.connect(page(), Arc::new(ChannelClient(other_tx))).unwrap();
        runtime.handle_back_msg(&other, rerun()).unwrap();
        let fresh = until_finished(&mut other_rx).await;
        assert!(fresh.iter().any(|msg| msg.element().is_some()));

        runtime.stop();
        task.await.unwrap();
        assert_eq!(runtime.state(), RuntimeState::Stopped);
        assert!(runtime.message_cache().is_empty());
    }

    #[tokio::test]
    async fn oversized_deltas_are_replaced() {
        let runtime = Runtime::new(small_config());
        let task = runtime.start();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let source = Arc::new(NativeSource::from_fn("big", |ctx| {
            ctx.emit_element(Element::Text {
                body: "small".to_string(),
            });
            ctx.emit_element(Element::Text {
                body: "y".repeat(10_000),
            });
            Ok(())
        }));
        let id = runtime.connect(source, Arc::new(ChannelClient(tx))).unwrap();
        runtime.handle_back_msg(&id, rerun()).unwrap();

        let elements: Vec<(Vec<u32>, Element)> = until_finished(&mut rx)
            .await
            .into_iter()
            .filter_map(|msg| msg.element().cloned().map(|e| (msg.delta_path().to_vec(), e)))
            .collect();
        assert_eq!(elements.len(), 2);
        assert_eq!(elements[1].0, vec![0, 1]);
        assert!(matches!(
            &elements[1].1,
            Element::Exception { kind, .. } if kind == "MessageSizeError"
        ));

        runtime.stop();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn failing_clients_close_only_their_session() {
        let runtime = Runtime::new(small_config());
        let task = runtime.start();
        let broken = runtime.connect(page(), Arc::new(FailingClient)).unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let healthy = runtime.connect(page(), Arc::new(ChannelClient(tx))).unwrap();

        runtime.handle_back_msg(&broken, rerun()).unwrap();
        runtime.handle_back_msg(&healthy, rerun()).unwrap();
        until_finished(&mut rx).await;

        tokio::time::timeout(Duration::from_secs(10), async {
            while runtime.is_active_session(&broken) {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        assert!(runtime.is_active_session(&healthy));
        assert!(matches!(
            runtime.handle_back_msg(&broken, rerun()),
            Err(RuntimeError::UnknownSession(_))
        ));

        runtime.stop();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn disconnect_drains_and_forgets_the_session() {
        let runtime = Runtime::new(small_config());
        let task = runtime.start();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let id = runtime.connect(page(), Arc::new(ChannelClient(tx))).unwrap();
        runtime.handle_back_msg(&id, rerun()).unwrap();
        until_finished(&mut rx).await;
        assert_eq!(runtime.state(), RuntimeState::OneOrMoreSessionsConnected);
        assert!(!runtime.stats().is_empty());

        assert!(runtime.disconnect(&id));
        tokio::time::timeout(Duration::from_secs(10), async {
            while runtime.is_active_session(&id) {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        assert_eq!(runtime.state(), RuntimeState::NoSessionsConnected);
        assert!(!runtime.disconnect(&id));

        runtime.stop();
        task.await.unwrap();
        assert!(matches!(
            runtime.connect(page(), Arc::new(FailingClient)),
            Err(RuntimeError::NotRunning(RuntimeState::Stopped))
        ));
    }

    #[tokio::test]
    async fn clear_cache_notifies_the_session() {
        let runtime = Runtime::new(small_config());
        let task = runtime.start();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let id = runtime.connect(page(), Arc::new(ChannelClient(tx))).unwrap();
        runtime.handle_back_msg(&id, rerun()).unwrap();
        until_finished(&mut rx).await;
        assert!(!runtime.message_cache().is_empty());

        runtime.handle_back_msg(&id, BackMsg::ClearCache).unwrap();
        loop {
            let msg = tokio::time::timeout(Duration::from_secs(10), rx.recv())
                .await
                .unwrap()
                .unwrap();
            if matches!(
                msg.body,
                ForwardBody::SessionEvent {
                    event: crate::message::SessionEvent::CacheCleared
                }
            ) {
                break;
            }
        }
        assert!(runtime.message_cache().is_empty());

        runtime.stop();
        task.await.unwrap();
    }
}
