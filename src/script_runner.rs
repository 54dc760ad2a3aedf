//! The per-session execution loop.
//!
//! A [`ScriptRunner`] owns one worker thread. The thread blocks on the
//! session's [`ScriptRequests`] slot, runs the program once per rerun request
//! and reports progress through [`RunnerEvent`]s. A rerun that arrives while
//! a run is in progress interrupts it at the program's next checkpoint and
//! starts a fresh run with the newest request.

use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};

use thiserror::Error;

use crate::controls::{ControlSnapshot, ControlStore};
use crate::fragment::{FragmentId, FragmentRegistry};
use crate::media::MediaStore;
use crate::memo::MemoRegistry;
use crate::message::ScriptFinishedStatus;
use crate::program::{CompileFailure, Program, ScriptSource};
use crate::requests::{RerunData, RunScope, ScriptRequest, ScriptRequests};
use crate::run_context::{Halt, Interrupt, MessageSink, RunEnv, ScriptRunContext};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScriptRunnerState {
    Initial,
    Started,
    StoppedWithCompileError,
    StoppedWithSuccess,
    Shutdown,
}

impl fmt::Display for ScriptRunnerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Initial => "initial",
            Self::Started => "started",
            Self::StoppedWithCompileError => "stopped_with_compile_error",
            Self::StoppedWithSuccess => "stopped_with_success",
            Self::Shutdown => "shutdown",
        };
        write!(f, "{name}")
    }
}

#[derive(Debug, Error)]
pub enum RunnerError {
    #[error("the script runner was already started")]
    AlreadyStarted,
    #[error("cannot spawn the runner thread: {0}")]
    Spawn(#[from] std::io::Error),
}

#[derive(Debug, Clone, PartialEq)]
pub enum RunnerEvent {
    ScriptStarted {
        run_id: String,
        fragment_id: Option<FragmentId>,
    },
    CompileError {
        failure: CompileFailure,
    },
    Stopped {
        status: ScriptFinishedStatus,
    },
    Shutdown {
        final_controls: ControlSnapshot,
    },
}

pub type EventHandler = Arc<dyn Fn(RunnerEvent) + Send + Sync>;

/// Session-owned state a runner reads and writes.
#[derive(Clone)]
pub struct RunnerResources {
    pub sink: Arc<dyn MessageSink>,
    pub controls: Arc<Mutex<ControlStore>>,
    pub memo: Arc<MemoRegistry>,
    pub media: Arc<MediaStore>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

pub struct ScriptRunner {
    session_id: String,
    requests: Arc<ScriptRequests>,
    state: Arc<Mutex<ScriptRunnerState>>,
    worker: Mutex<Option<Worker>>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl ScriptRunner {
    pub fn new(
        session_id: impl Into<String>,
        source: Arc<dyn ScriptSource>,
        resources: RunnerResources,
        on_event: EventHandler,
    ) -> Self {
        let session_id = session_id.into();
        let requests = Arc::new(ScriptRequests::new());
        let state = Arc::new(Mutex::new(ScriptRunnerState::Initial));
        let worker = Worker {
            session_id: session_id.clone(),
            source,
            requests: requests.clone(),
            state: state.clone(),
            resources,
            fragments: FragmentRegistry::new(),
            on_event,
        };
        Self {
            session_id,
            requests,
            state,
            worker: Mutex::new(Some(worker)),
            thread: Mutex::new(None),
        }
    }

    /// Spawns the worker thread. Can succeed only once.
    pub fn start(&self) -> Result<(), RunnerError> {
        let Some(worker) = lock(&self.worker).take() else {
            return Err(RunnerError::AlreadyStarted);
        };
        let handle = thread::Builder::new()
            .name(format!("livepage-runner-{}", self.session_id))
            .spawn(move || worker.run())?;
        *lock(&self.thread) = Some(handle);
        Ok(())
    }

    pub fn state(&self) -> ScriptRunnerState {
        *lock(&self.state)
    }

    pub fn request_rerun(&self, data: RerunData) -> bool {
        self.requests.request_rerun(data)
    }

    pub fn request_stop(&self) -> bool {
        self.requests.request_stop()
    }

    pub fn request_shutdown(&self) {
        self.requests.request_shutdown();
    }

    /// Waits for the worker thread to exit. Returns immediately if it was
    /// never started.
    pub fn join(&self) {
        let handle = lock(&self.thread).take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                tracing::error!(session_id = %self.session_id, "runner thread panicked");
            }
        }
    }
}

impl Drop for ScriptRunner {
    fn drop(&mut self) {
        self.requests.request_shutdown();
    }
}

struct Worker {
    session_id: String,
    source: Arc<dyn ScriptSource>,
    requests: Arc<ScriptRequests>,
    state: Arc<Mutex<ScriptRunnerState>>,
    resources: RunnerResources,
    fragments: FragmentRegistry,
    on_event: EventHandler,
}

/// How one run ended.
struct Outcome {
    status: ScriptFinishedStatus,
    completed: bool,
    next: Option<RerunData>,
}

impl Worker {
    fn run(mut self) {
        let span = tracing::info_span!("runner", session_id = %self.session_id);
        let _enter = span.enter();

        let result = panic::catch_unwind(AssertUnwindSafe(|| self.run_loop()));
        if let Err(payload) = result {
            let message = payload
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| payload.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            tracing::error!(%message, "runner panicked, shutting the session's runner down");
        }

        self.set_state(ScriptRunnerState::Shutdown);
        let final_controls = lock(&*self.resources.controls).snapshot();
        (self.on_event)(RunnerEvent::Shutdown { final_controls });
        tracing::debug!("runner exited");
    }

    fn set_state(&self, state: ScriptRunnerState) {
        let mut current = lock(&*self.state);
        if *current != state {
            tracing::trace!(from = %*current, to = %state, "runner state changed");
            *current = state;
        }
    }

    fn run_loop(&mut self) {
        loop {
            match self.requests.wait_for_request() {
                ScriptRequest::Shutdown => return,
                ScriptRequest::Stop => {}
                ScriptRequest::Rerun(data) => {
                    let mut next = Some(data);
                    while let Some(data) = next.take() {
                        next = self.run_script(data);
                    }
                }
            }
        }
    }

    fn run_script(&mut self, data: RerunData) -> Option<RerunData> {
        self.set_state(ScriptRunnerState::Started);
        let run_id = uuid::Uuid::new_v4().to_string();
        let fragment_id = match &data.scope {
            RunScope::Full => None,
            RunScope::Fragment(id) => Some(id.clone()),
        };
        let span = tracing::info_span!("run", %run_id);
        let _enter = span.enter();
        (self.on_event)(RunnerEvent::ScriptStarted {
            run_id: run_id.clone(),
            fragment_id,
        });

        let program = match self.source.compile() {
            Ok(program) => program,
            Err(failure) => {
                tracing::warn!(script = self.source.name(), error = %failure.message, "compile error");
                self.set_state(ScriptRunnerState::StoppedWithCompileError);
                (self.on_event)(RunnerEvent::CompileError { failure });
                return None;
            }
        };

        let full = !data.is_fragment();
        let changed = {
            let mut controls = lock(&*self.resources.controls);
            controls.begin_run();
            match &data.controls {
                Some(snapshot) => controls.apply_incoming(snapshot),
                None => Vec::new(),
            }
        };
        if full {
            self.fragments.clear();
        }
        self.resources.media.begin_run();

        let result = {
            let mut ctx = ScriptRunContext::new(RunEnv {
                session_id: &self.session_id,
                run_id: &run_id,
                requests: &self.requests,
                sink: &*self.resources.sink,
                controls: &self.resources.controls,
                fragments: &mut self.fragments,
                memo: &self.resources.memo,
                media: &self.resources.media,
            });
            let result = execute(&mut ctx, &self.resources.controls, &changed, &*program, &data.scope);
            let result = match result {
                Err(Halt::Exception(exception)) => {
                    tracing::info!(kind = %exception.kind, message = %exception.message, "uncaught exception");
                    ctx.emit_element(exception.to_element());
                    Ok(())
                }
                other => other,
            };
            ctx.release();
            result
        };

        let outcome = match result {
            Ok(()) | Err(Halt::Exception(_)) => Outcome {
                status: if full {
                    ScriptFinishedStatus::FinishedSuccessfully
                } else {
                    ScriptFinishedStatus::FinishedFragmentRunSuccessfully
                },
                completed: true,
                next: None,
            },
            Err(Halt::Interrupt(Interrupt::Stop)) => Outcome {
                status: ScriptFinishedStatus::FinishedSuccessfully,
                completed: false,
                next: None,
            },
            Err(Halt::Interrupt(Interrupt::Rerun(mut next))) => {
                if full && next.is_fragment() {
                    next.scope = RunScope::Full;
                }
                Outcome {
                    status: ScriptFinishedStatus::FinishedEarlyForRerun,
                    completed: false,
                    next: Some(next),
                }
            }
        };

        if outcome.completed {
            let mut controls = lock(&*self.resources.controls);
            if full {
                let removed = controls.cull_undeclared();
                if !removed.is_empty() {
                    tracing::debug!(count = removed.len(), "culled controls");
                }
            }
            controls.reset_triggers();
        }
        let released = self.resources.media.end_run(full);
        if released > 0 {
            tracing::debug!(count = released, "released media");
        }

        tracing::info!(status = ?outcome.status, "run finished");
        self.set_state(ScriptRunnerState::StoppedWithSuccess);
        (self.on_event)(RunnerEvent::Stopped {
            status: outcome.status,
        });
        outcome.next
    }
}

/// Fires change callbacks, then runs the requested scope.
fn execute(
    ctx: &mut ScriptRunContext<'_>,
    controls: &Mutex<ControlStore>,
    changed: &[crate::controls::ControlId],
    program: &dyn Program,
    scope: &RunScope,
) -> Result<(), Halt> {
    for id in changed {
        let callback = lock(controls).callback(id);
        let Some(callback) = callback else {
            continue;
        };
        match callback(ctx) {
            Ok(()) => {}
            Err(Halt::Exception(exception)) => {
                tracing::info!(control = %id, kind = %exception.kind, "on_change callback failed");
                ctx.emit_element(exception.to_element());
            }
            Err(interrupt) => return Err(interrupt),
        }
    }

    match scope {
        RunScope::Full => program.run(ctx),
        RunScope::Fragment(id) => match ctx.fragments().get(id).cloned() {
            Some(fragment) => ctx.rerun_fragment(&fragment),
            None => Err(Halt::exception(
                "FragmentError",
                format!("fragment `{id}` does not exist, rerun the whole page"),
            )),
        },
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::mpsc;
    use std::time::Duration;

    use super::*;
    use crate::controls::{ControlId, ControlKind, ControlValue};
    use crate::message::Element;
    use crate::program::NativeSource;
    use crate::run_context::fixture::RecordingSink;
    use crate::run_context::ControlRequest;

    const TIMEOUT: Duration = Duration::from_secs(10);

    struct Harness {
        runner: ScriptRunner,
        events: mpsc::Receiver<RunnerEvent>,
        sink: Arc<RecordingSink>,
        controls: Arc<Mutex<ControlStore>>,
    }

    impl Harness {
        fn new(source: impl ScriptSource + 'static) -> Self {
            let (sender, events) = mpsc::channel();
            let sender = Mutex::new(sender);
            let sink = Arc::new(RecordingSink::default());
            let controls = Arc::new(Mutex::new(ControlStore::new()));
            let runner = ScriptRunner::new(
                "test",
                Arc::new(source),
                RunnerResources {
                    sink: sink.clone(),
                    controls: controls.clone(),
                    memo: Arc::new(MemoRegistry::new()),
                    media: Arc::new(MediaStore::new()),
                },
                Arc::new(move |event| {
                    let _ = sender.lock().unwrap().send(event);
                }),
            );
            runner.start().unwrap();
            Self {
                runner,
                events,
                sink,
                controls,
            }
        }

        fn next(&self) -> RunnerEvent {
            self.events.recv_timeout(TIMEOUT).expect("runner event")
        }

        /// Collects events up to and including the next `Stopped`.
        fn until_stopped(&self) -> Vec<RunnerEvent> {
            let mut events = Vec::new();
            loop {
                let event = self.next();
                let done = matches!(event, RunnerEvent::Stopped { .. } | RunnerEvent::CompileError { .. });
                events.push(event);
                if done {
                    return events;
                }
            }
        }

        fn shutdown(&self) -> ControlSnapshot {
            self.runner.request_shutdown();
            loop {
                if let RunnerEvent::Shutdown { final_controls } = self.next() {
                    self.runner.join();
                    return final_controls;
                }
            }
        }
    }

    fn stopped(events: &[RunnerEvent]) -> Option<ScriptFinishedStatus> {
        events.iter().find_map(|event| match event {
            RunnerEvent::Stopped { status } => Some(*status),
            _ => None,
        })
    }

    fn checkbox(ctx: &mut ScriptRunContext<'_>, id: &str) -> Result<bool, Halt> {
        let value = ctx.declare_control(ControlRequest {
            id: ControlId::from(id),
            kind: ControlKind::Checkbox,
            label: id.to_string(),
            default: ControlValue::Bool(false),
            on_change: None,
        })?;
        Ok(value.as_bool().unwrap_or(false))
    }

    #[test]
    fn start_succeeds_only_once() {
        let harness = Harness::new(NativeSource::from_fn("noop", |_ctx| Ok(())));
        assert!(matches!(harness.runner.start(), Err(RunnerError::AlreadyStarted)));
        assert_eq!(harness.runner.state(), ScriptRunnerState::Initial);
        harness.shutdown();
        assert_eq!(harness.runner.state(), ScriptRunnerState::Shutdown);
    }

    #[test]
    fn runs_report_started_and_stopped() {
        let harness = Harness::new(NativeSource::from_fn("hello", |ctx| {
            ctx.emit_element(Element::Text {
                body: "hello".to_string(),
            });
            Ok(())
        }));
        harness.runner.request_rerun(RerunData::full(None));
        let events = harness.until_stopped();
        assert!(matches!(events[0], RunnerEvent::ScriptStarted { fragment_id: None, .. }));
        assert_eq!(stopped(&events), Some(ScriptFinishedStatus::FinishedSuccessfully));
        assert_eq!(harness.runner.state(), ScriptRunnerState::StoppedWithSuccess);
        assert_eq!(harness.sink.elements().len(), 1);
        harness.shutdown();
    }

    #[test]
    fn compile_errors_run_no_code() {
        let harness = Harness::new(crate::script::InlineSource::new("broken", "text(\"a\")\nlet = 2"));
        harness.runner.request_rerun(RerunData::full(None));
        let events = harness.until_stopped();
        assert!(matches!(events.last(), Some(RunnerEvent::CompileError { .. })));
        assert_eq!(harness.runner.state(), ScriptRunnerState::StoppedWithCompileError);
        assert!(harness.sink.elements().is_empty());
        harness.shutdown();
    }

    #[test]
    fn uncaught_exceptions_become_elements() {
        let harness = Harness::new(NativeSource::from_fn("raise", |_ctx| {
            Err(Halt::exception("ValueError", "bad input"))
        }));
        harness.runner.request_rerun(RerunData::full(None));
        let events = harness.until_stopped();
        assert_eq!(stopped(&events), Some(ScriptFinishedStatus::FinishedSuccessfully));
        assert_eq!(
            harness.sink.elements(),
            vec![Element::exception("ValueError", "bad input")]
        );
        harness.shutdown();
    }

    #[test]
    fn rerun_interrupts_a_sleeping_program() {
        let runs = Arc::new(AtomicUsize::new(0));
        let counter = runs.clone();
        let harness = Harness::new(NativeSource::from_fn("sleepy", move |ctx| {
            let run = counter.fetch_add(1, Ordering::SeqCst);
            if run == 0 {
                ctx.sleep(Duration::from_secs(60))?;
            }
            Ok(())
        }));
        harness.runner.request_rerun(RerunData::full(None));
        assert!(matches!(harness.next(), RunnerEvent::ScriptStarted { .. }));
        while runs.load(Ordering::SeqCst) == 0 {
            thread::sleep(Duration::from_millis(5));
        }
        harness.runner.request_rerun(RerunData::full(None));

        assert_eq!(
            stopped(&harness.until_stopped()),
            Some(ScriptFinishedStatus::FinishedEarlyForRerun)
        );
        assert_eq!(
            stopped(&harness.until_stopped()),
            Some(ScriptFinishedStatus::FinishedSuccessfully)
        );
        assert_eq!(runs.load(Ordering::SeqCst), 2);
        harness.shutdown();
    }

    #[test]
    fn queued_reruns_coalesce_into_one_run_with_the_last_snapshot() {
        let runs = Arc::new(AtomicUsize::new(0));
        let seen = Arc::new(Mutex::new(Vec::new()));
        let (release, gate) = mpsc::channel::<()>();
        let gate = Mutex::new(gate);
        let (counter, record) = (runs.clone(), seen.clone());
        let harness = Harness::new(NativeSource::from_fn("busy", move |ctx| {
            if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                let _ = lock(&gate).recv_timeout(TIMEOUT);
                ctx.checkpoint()?;
            }
            let values = [checkbox(ctx, "a")?, checkbox(ctx, "b")?, checkbox(ctx, "c")?];
            lock(&*record).push(values);
            Ok(())
        }));
        harness.runner.request_rerun(RerunData::full(None));
        assert!(matches!(harness.next(), RunnerEvent::ScriptStarted { .. }));
        while runs.load(Ordering::SeqCst) == 0 {
            thread::sleep(Duration::from_millis(5));
        }
        for id in ["a", "b", "c"] {
            let snapshot = ControlSnapshot::new().with(id, ControlValue::Bool(true));
            harness.runner.request_rerun(RerunData::full(Some(snapshot)));
        }
        release.send(()).unwrap();

        assert_eq!(
            stopped(&harness.until_stopped()),
            Some(ScriptFinishedStatus::FinishedEarlyForRerun)
        );
        assert_eq!(
            stopped(&harness.until_stopped()),
            Some(ScriptFinishedStatus::FinishedSuccessfully)
        );
        assert!(harness.events.recv_timeout(Duration::from_millis(200)).is_err());
        assert_eq!(runs.load(Ordering::SeqCst), 2);
        assert_eq!(*lock(&*seen), vec![[false, false, true]]);
        harness.shutdown();
    }

    #[test]
    fn undeclared_controls_are_culled_after_complete_runs() {
        let harness = Harness::new(NativeSource::from_fn("conditional", |ctx| {
            if checkbox(ctx, "show")? {
                checkbox(ctx, "detail")?;
            }
            Ok(())
        }));

        let on = ControlSnapshot::new().with("show", ControlValue::Bool(true));
        harness.runner.request_rerun(RerunData::full(Some(on)));
        harness.until_stopped();
        assert_eq!(lock(&*harness.controls).len(), 2);

        let off = ControlSnapshot::new().with("show", ControlValue::Bool(false));
        harness.runner.request_rerun(RerunData::full(Some(off)));
        harness.until_stopped();
        let controls = lock(&*harness.controls);
        assert_eq!(controls.len(), 1);
        assert_eq!(
            controls.value(&ControlId::from("show")),
            Some(&ControlValue::Bool(false))
        );
        drop(controls);

        let final_controls = harness.shutdown();
        assert_eq!(final_controls.len(), 1);
    }

    #[test]
    fn stopped_runs_keep_controls() {
        let harness = Harness::new(NativeSource::from_fn("halting", |ctx| {
            if checkbox(ctx, "first")? {
                return Err(Halt::Interrupt(Interrupt::Stop));
            }
            checkbox(ctx, "second")?;
            Ok(())
        }));
        harness.runner.request_rerun(RerunData::full(None));
        harness.until_stopped();
        assert_eq!(lock(&*harness.controls).len(), 2);

        let first = ControlSnapshot::new().with("first", ControlValue::Bool(true));
        harness.runner.request_rerun(RerunData::full(Some(first)));
        assert_eq!(
            stopped(&harness.until_stopped()),
            Some(ScriptFinishedStatus::FinishedSuccessfully)
        );
        assert_eq!(lock(&*harness.controls).len(), 2);
        harness.shutdown();
    }

    #[test]
    fn unknown_fragments_report_an_exception() {
        let harness = Harness::new(NativeSource::from_fn("plain", |_ctx| Ok(())));
        harness
            .runner
            .request_rerun(RerunData::fragment(FragmentId::new("gone"), None));
        let events = harness.until_stopped();
        assert!(matches!(
            &events[0],
            RunnerEvent::ScriptStarted { fragment_id: Some(id), .. } if id.as_str() == "gone"
        ));
        assert_eq!(
            stopped(&events),
            Some(ScriptFinishedStatus::FinishedFragmentRunSuccessfully)
        );
        assert!(matches!(
            harness.sink.elements().as_slice(),
            [Element::Exception { kind, .. }] if kind == "FragmentError"
        ));
        harness.shutdown();
    }

    #[test]
    fn panics_shut_the_runner_down() {
        let harness = Harness::new(NativeSource::from_fn("panics", |_ctx| panic!("boom")));
        harness.runner.request_rerun(RerunData::full(None));
        assert!(matches!(harness.next(), RunnerEvent::ScriptStarted { .. }));
        assert!(matches!(harness.next(), RunnerEvent::Shutdown { .. }));
        harness.runner.join();
        assert_eq!(harness.runner.state(), ScriptRunnerState::Shutdown);
    }
}
