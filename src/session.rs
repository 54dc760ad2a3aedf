//! One connected client.
//!
//! An [`AppSession`] owns exactly one [`ScriptRunner`] together with the
//! state that outlives individual runs: the control store, the media store
//! and the outbound queue. Back messages from the client become runner
//! requests; runner events become forward messages.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Notify;
use uuid::Uuid;

use crate::controls::{ControlSnapshot, ControlStore};
use crate::forward_queue::ForwardMsgQueue;
use crate::fragment::FragmentId;
use crate::media::MediaStore;
use crate::memo::MemoRegistry;
use crate::message::{BackMsg, ForwardBody, ForwardMsg, ScriptFinishedStatus, SessionEvent};
use crate::program::ScriptSource;
use crate::requests::RerunData;
use crate::run_context::MessageSink;
use crate::script_runner::{RunnerError, RunnerEvent, RunnerResources, ScriptRunner, ScriptRunnerState};
use crate::stats::{CacheStat, StatsProvider};

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(String);

impl SessionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for SessionId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppSessionState {
    AppNotRunning,
    AppIsRunning,
    ShutdownRequested,
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("session {0} is shutting down")]
    ShutdownRequested(SessionId),
    #[error(transparent)]
    Runner(#[from] RunnerError),
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// The session's outbound queue. Enqueuing wakes the delivery loop.
pub struct SessionQueue {
    queue: Mutex<ForwardMsgQueue>,
    wake: Arc<Notify>,
}

impl SessionQueue {
    pub fn new(wake: Arc<Notify>) -> Self {
        Self {
            queue: Mutex::new(ForwardMsgQueue::new()),
            wake,
        }
    }

    pub fn flush(&self) -> Vec<ForwardMsg> {
        lock(&self.queue).flush()
    }
}

impl MessageSink for SessionQueue {
    fn enqueue(&self, msg: ForwardMsg) {
        lock(&self.queue).enqueue(msg);
        self.wake.notify_one();
    }
}

/// Session state written by runner events.
struct Shared {
    id: SessionId,
    script_name: String,
    state: Mutex<AppSessionState>,
    final_controls: Mutex<Option<ControlSnapshot>>,
    queue: Arc<SessionQueue>,
}

impl Shared {
    fn set_state(&self, state: AppSessionState) {
        let mut current = lock(&self.state);
        if *current == AppSessionState::ShutdownRequested {
            return;
        }
        *current = state;
    }

    fn on_event(&self, event: RunnerEvent) {
        match event {
            RunnerEvent::ScriptStarted { run_id, fragment_id } => {
                tracing::debug!(session_id = %self.id, %run_id, "script started");
                self.set_state(AppSessionState::AppIsRunning);
                self.queue.enqueue(ForwardMsg::new(ForwardBody::NewSession {
                    session_id: self.id.to_string(),
                    script_run_id: run_id,
                    script_name: self.script_name.clone(),
                    fragment_id: fragment_id.map(|id| id.to_string()),
                }));
                self.queue.enqueue(ForwardMsg::status_changed(true));
            }
            RunnerEvent::CompileError { failure } => {
                self.set_state(AppSessionState::AppNotRunning);
                self.queue.enqueue(ForwardMsg::new(ForwardBody::SessionEvent {
                    event: SessionEvent::ScriptCompilationException {
                        message: failure.message,
                        report: failure.report,
                    },
                }));
                self.queue
                    .enqueue(ForwardMsg::script_finished(ScriptFinishedStatus::FinishedWithCompileError));
                self.queue.enqueue(ForwardMsg::status_changed(false));
            }
            RunnerEvent::Stopped { status } => {
                self.set_state(AppSessionState::AppNotRunning);
                self.queue.enqueue(ForwardMsg::script_finished(status));
                self.queue.enqueue(ForwardMsg::status_changed(false));
            }
            RunnerEvent::Shutdown { final_controls } => {
                tracing::info!(session_id = %self.id, controls = final_controls.len(), "runner shut down");
                *lock(&self.state) = AppSessionState::ShutdownRequested;
                *lock(&self.final_controls) = Some(final_controls);
            }
        }
    }
}

/// Process-wide state a session borrows.
#[derive(Clone)]
pub struct SessionServices {
    pub memo: Arc<MemoRegistry>,
    pub wake: Arc<Notify>,
}

pub struct AppSession {
    shared: Arc<Shared>,
    runner: ScriptRunner,
    controls: Arc<Mutex<ControlStore>>,
    media: Arc<MediaStore>,
}

impl AppSession {
    pub fn new(source: Arc<dyn ScriptSource>, services: SessionServices) -> Self {
        let id = SessionId::new();
        let queue = Arc::new(SessionQueue::new(services.wake));
        let shared = Arc::new(Shared {
            id: id.clone(),
            script_name: source.name().to_string(),
            state: Mutex::new(AppSessionState::AppNotRunning),
            final_controls: Mutex::new(None),
            queue: queue.clone(),
        });
        let controls = Arc::new(Mutex::new(ControlStore::new()));
        let media = Arc::new(MediaStore::new());

        let events = shared.clone();
        let runner = ScriptRunner::new(
            id.to_string(),
            source,
            RunnerResources {
                sink: queue,
                controls: controls.clone(),
                memo: services.memo,
                media: media.clone(),
            },
            Arc::new(move |event| events.on_event(event)),
        );

        Self {
            shared,
            runner,
            controls,
            media,
        }
    }

    pub fn id(&self) -> &SessionId {
        &self.shared.id
    }

    pub fn script_name(&self) -> &str {
        &self.shared.script_name
    }

    pub fn state(&self) -> AppSessionState {
        *lock(&self.shared.state)
    }

    pub fn runner_state(&self) -> ScriptRunnerState {
        self.runner.state()
    }

    pub fn start(&self) -> Result<(), SessionError> {
        self.runner.start()?;
        Ok(())
    }

    fn ensure_open(&self) -> Result<(), SessionError> {
        if self.state() == AppSessionState::ShutdownRequested {
            return Err(SessionError::ShutdownRequested(self.id().clone()));
        }
        Ok(())
    }

    pub fn request_rerun(&self, data: RerunData) -> Result<(), SessionError> {
        self.ensure_open()?;
        if !self.runner.request_rerun(data) {
            return Err(SessionError::ShutdownRequested(self.id().clone()));
        }
        Ok(())
    }

    pub fn request_stop(&self) -> Result<(), SessionError> {
        self.ensure_open()?;
        self.runner.request_stop();
        Ok(())
    }

    /// Handles the back messages that concern this session alone.
    /// `ClearCache` touches process-wide caches and is handled by the
    /// runtime, which then calls [`AppSession::notify_cache_cleared`].
    pub fn handle_back_msg(&self, msg: BackMsg) -> Result<(), SessionError> {
        match msg {
            BackMsg::Rerun { controls, fragment_id } => {
                let data = match fragment_id {
                    Some(id) => RerunData::fragment(FragmentId::new(id), controls),
                    None => RerunData::full(controls),
                };
                self.request_rerun(data)
            }
            BackMsg::StopScript => self.request_stop(),
            BackMsg::ClearCache => {
                self.ensure_open()?;
                self.notify_cache_cleared();
                Ok(())
            }
            BackMsg::AppHeartbeat => Ok(()),
        }
    }

    pub fn notify_cache_cleared(&self) {
        self.shared.queue.enqueue(ForwardMsg::new(ForwardBody::SessionEvent {
            event: SessionEvent::CacheCleared,
        }));
    }

    /// Asks the runner to exit. The runner finishes or interrupts its current
    /// run first; [`AppSession::is_shut_down`] reports when it is gone.
    pub fn shutdown(&self) {
        let previous = std::mem::replace(&mut *lock(&self.shared.state), AppSessionState::ShutdownRequested);
        if previous != AppSessionState::ShutdownRequested {
            tracing::info!(session_id = %self.id(), "shutdown requested");
        }
        self.runner.request_shutdown();
    }

    pub fn is_shut_down(&self) -> bool {
        matches!(self.runner.state(), ScriptRunnerState::Shutdown)
    }

    /// Blocks until the runner thread exits.
    pub fn join(&self) {
        self.runner.join();
    }

    pub fn flush(&self) -> Vec<ForwardMsg> {
        self.shared.queue.flush()
    }

    pub fn enqueue(&self, msg: ForwardMsg) {
        self.shared.queue.enqueue(msg);
    }

    /// Control values at the moment the runner shut down.
    pub fn final_controls(&self) -> Option<ControlSnapshot> {
        lock(&self.shared.final_controls).clone()
    }

    pub fn controls(&self) -> ControlSnapshot {
        lock(&*self.controls).snapshot()
    }

    pub fn media(&self) -> &MediaStore {
        &self.media
    }
}

impl Drop for AppSession {
    fn drop(&mut self) {
        self.runner.request_shutdown();
    }
}

impl StatsProvider for AppSession {
    fn get_stats(&self) -> Vec<CacheStat> {
        let mut stats = vec![CacheStat::new(
            "session_state",
            self.id().as_str(),
            lock(&*self.controls).byte_size(),
        )];
        stats.extend(self.media.get_stats());
        stats
    }
}
