//! The object a program sees while it runs.
//!
//! A [`ScriptRunContext`] lives for exactly one run. It allocates delta
//! paths, forwards elements to the session's outbound queue, records them for
//! any cached computation in progress, declares controls, and checks the
//! request slot so that a newer rerun or a stop can preempt the program.
//!
//! Preemption travels as [`Halt::Interrupt`], which is a different variant
//! from a program error ([`Halt::Exception`]). Program-level error handling
//! only ever matches on the latter.

use std::fmt;
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

use thiserror::Error;

use crate::controls::{ControlDeclaration, ControlError, ControlId, ControlKind, ControlStore, ControlValue};
use crate::cursor::OutputCursor;
use crate::fragment::{Fragment, FragmentFn, FragmentId, FragmentRegistry};
use crate::media::MediaStore;
use crate::memo::{CapturedMessage, MemoError, MemoRegistry, OutputTarget};
use crate::message::{Block, Delta, DeltaPath, Element, ForwardMsg};
use crate::requests::{RerunData, ScriptRequests};

const LONG_WAIT: Duration = Duration::from_secs(3600);

pub type ControlCallback = std::sync::Arc<dyn Fn(&mut ScriptRunContext<'_>) -> Result<(), Halt> + Send + Sync>;

/// Where a run's outbound messages go.
pub trait MessageSink: Send + Sync {
    fn enqueue(&self, msg: ForwardMsg);
}

#[derive(Debug, Clone, PartialEq)]
pub enum Interrupt {
    Stop,
    Rerun(RerunData),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{kind}: {message}")]
pub struct ScriptException {
    pub kind: String,
    pub message: String,
    pub trace: Vec<String>,
}

impl ScriptException {
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
            trace: Vec::new(),
        }
    }

    pub fn with_frame(mut self, frame: impl Into<String>) -> Self {
        self.trace.push(frame.into());
        self
    }

    pub fn to_element(&self) -> Element {
        Element::Exception {
            kind: self.kind.clone(),
            message: self.message.clone(),
            trace: self.trace.clone(),
        }
    }
}

/// Why a program stopped before reaching its end.
#[derive(Debug, Clone, PartialEq)]
pub enum Halt {
    Interrupt(Interrupt),
    Exception(ScriptException),
}

impl Halt {
    pub fn exception(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Exception(ScriptException::new(kind, message))
    }

    pub fn is_interrupt(&self) -> bool {
        matches!(self, Self::Interrupt(_))
    }
}

impl fmt::Display for Halt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Interrupt(Interrupt::Stop) => write!(f, "stop requested"),
            Self::Interrupt(Interrupt::Rerun(_)) => write!(f, "rerun requested"),
            Self::Exception(exception) => write!(f, "{exception}"),
        }
    }
}

impl From<ScriptException> for Halt {
    fn from(exception: ScriptException) -> Self {
        Self::Exception(exception)
    }
}

impl From<ControlError> for Halt {
    fn from(error: ControlError) -> Self {
        Self::exception("DuplicateControlId", error.to_string())
    }
}

impl From<MemoError> for Halt {
    fn from(error: MemoError) -> Self {
        Self::exception(error.kind(), error.to_string())
    }
}

/// A control as a program declares it. The id is computed by the caller from
/// the declaration site and configuration.
pub struct ControlRequest {
    pub id: ControlId,
    pub kind: ControlKind,
    pub label: String,
    pub default: ControlValue,
    pub on_change: Option<ControlCallback>,
}

/// Everything a run borrows from its session and runner.
pub struct RunEnv<'r> {
    pub session_id: &'r str,
    pub run_id: &'r str,
    pub requests: &'r ScriptRequests,
    pub sink: &'r dyn MessageSink,
    pub controls: &'r Mutex<ControlStore>,
    pub fragments: &'r mut FragmentRegistry,
    pub memo: &'r MemoRegistry,
    pub media: &'r MediaStore,
}

pub struct ScriptRunContext<'r> {
    env: RunEnv<'r>,
    cursor: OutputCursor,
    captures: Vec<Vec<CapturedMessage>>,
    fragment: Option<FragmentId>,
}

impl<'r> ScriptRunContext<'r> {
    pub fn new(env: RunEnv<'r>) -> Self {
        Self {
            env,
            cursor: OutputCursor::new(),
            captures: Vec::new(),
            fragment: None,
        }
    }

    pub fn session_id(&self) -> &str {
        self.env.session_id
    }

    pub fn run_id(&self) -> &str {
        self.env.run_id
    }

    pub fn memo(&self) -> &'r MemoRegistry {
        self.env.memo
    }

    pub fn fragments(&self) -> &FragmentRegistry {
        self.env.fragments
    }

    pub fn current_fragment(&self) -> Option<&FragmentId> {
        self.fragment.as_ref()
    }

    pub fn cursor(&self) -> &OutputCursor {
        &self.cursor
    }

    /// Returns an interrupt if a rerun or stop is pending. Programs call this
    /// between statements.
    pub fn checkpoint(&mut self) -> Result<(), Halt> {
        match self.env.requests.on_script_yield() {
            None => Ok(()),
            Some(interrupt) => Err(Halt::Interrupt(interrupt)),
        }
    }

    /// Sleeps for `duration`, waking early when a request arrives.
    pub fn sleep(&mut self, duration: Duration) -> Result<(), Halt> {
        // Past the end of `Instant`, only a request ends the sleep.
        let deadline = Instant::now().checked_add(duration);
        loop {
            self.checkpoint()?;
            let Some(deadline) = deadline else {
                self.env.requests.wait_timeout(LONG_WAIT);
                continue;
            };
            let now = Instant::now();
            if now >= deadline {
                return Ok(());
            }
            self.env.requests.wait_timeout(deadline - now);
        }
    }

    fn record(&mut self, message: CapturedMessage) {
        for capture in &mut self.captures {
            capture.push(message.clone());
        }
    }

    fn send(&mut self, path: DeltaPath, delta: Delta) {
        let fragment_id = self.fragment.as_ref().map(|id| id.to_string());
        self.env
            .sink
            .enqueue(ForwardMsg::delta(path, delta, fragment_id));
    }

    pub fn emit_element(&mut self, element: Element) -> DeltaPath {
        self.record(CapturedMessage::Element(element.clone()));
        let path = self.cursor.next_path();
        self.send(path.clone(), Delta::NewElement { element });
        path
    }

    pub fn open_block(&mut self, block: Block) -> DeltaPath {
        self.record(CapturedMessage::Block(block.clone()));
        let path = self.cursor.open_block();
        self.send(path.clone(), Delta::AddBlock { block });
        path
    }

    pub fn close_block(&mut self) {
        self.record(CapturedMessage::EndBlock);
        self.cursor.close_block();
    }

    pub fn is_capturing(&self) -> bool {
        !self.captures.is_empty()
    }

    /// Declares a control and returns its value for this run.
    pub fn declare_control(&mut self, request: ControlRequest) -> Result<ControlValue, Halt> {
        if self.is_capturing() {
            return Err(MemoError::ControlInCachedFunction {
                label: request.label,
            }
            .into());
        }
        let mut store = self.env.controls.lock().unwrap_or_else(PoisonError::into_inner);
        let value = store.declare(ControlDeclaration {
            id: request.id,
            kind: request.kind,
            label: request.label,
            default: request.default,
            incoming: None,
            on_change: request.on_change,
        })?;
        Ok(value)
    }

    pub fn user_value(&self, key: &str) -> Option<serde_json::Value> {
        let store = self.env.controls.lock().unwrap_or_else(PoisonError::into_inner);
        store.user_value(key).cloned()
    }

    pub fn set_user_value(&mut self, key: &str, value: serde_json::Value) {
        let mut store = self.env.controls.lock().unwrap_or_else(PoisonError::into_inner);
        store.set_user_value(key, value);
    }

    /// Stores a media payload for this session and returns its url.
    pub fn add_media(&mut self, bytes: &[u8], mimetype: &str) -> String {
        self.env.media.add(bytes, mimetype)
    }

    /// Runs a fragment body inside its own block and remembers it so a later
    /// rerun can execute just this body.
    pub fn call_fragment(&mut self, name: &str, closure: FragmentFn) -> Result<(), Halt> {
        if self.fragment.is_some() {
            return Err(Halt::exception(
                "FragmentError",
                format!("fragment `{name}` cannot be called from inside another fragment"),
            ));
        }
        let id = FragmentId::derive(name, &self.cursor.peek_path());
        let path = self.open_block(Block::Fragment { id: id.to_string() });
        self.env.fragments.register(Fragment {
            id: id.clone(),
            name: name.to_string(),
            closure: closure.clone(),
            cursor: OutputCursor::inside(path),
        });

        self.fragment = Some(id);
        let result = closure(self);
        self.fragment = None;
        self.close_block();
        result
    }

    /// Re-executes a registered fragment at its recorded position.
    pub fn rerun_fragment(&mut self, fragment: &Fragment) -> Result<(), Halt> {
        self.cursor.restore(&fragment.cursor);
        self.fragment = Some(fragment.id.clone());
        let result = (fragment.closure)(self);
        self.fragment = None;
        result
    }

    /// Abandons unfinished captures; used when a run ends.
    pub fn release(&mut self) {
        self.captures.clear();
    }
}

impl OutputTarget for ScriptRunContext<'_> {
    fn begin_capture(&mut self) {
        self.captures.push(Vec::new());
    }

    fn end_capture(&mut self) -> Vec<CapturedMessage> {
        self.captures.pop().unwrap_or_default()
    }

    fn replay(&mut self, message: &CapturedMessage) {
        match message {
            CapturedMessage::Element(element) => {
                self.emit_element(element.clone());
            }
            CapturedMessage::Block(block) => {
                self.open_block(block.clone());
            }
            CapturedMessage::EndBlock => self.close_block(),
        }
    }
}

#[cfg(test)]
pub(crate) mod fixture {
    use std::sync::{Arc, Mutex};

    use super::*;
    use crate::memo::ManualClock;

    #[derive(Default)]
    pub struct RecordingSink {
        pub messages: Mutex<Vec<ForwardMsg>>,
    }

    impl RecordingSink {
        pub fn elements(&self) -> Vec<Element> {
            self.messages
                .lock()
                .unwrap()
                .iter()
                .filter_map(|msg| msg.element().cloned())
                .collect()
        }

        pub fn take(&self) -> Vec<ForwardMsg> {
            std::mem::take(&mut *self.messages.lock().unwrap())
        }
    }

    impl MessageSink for RecordingSink {
        fn enqueue(&self, msg: ForwardMsg) {
            self.messages.lock().unwrap().push(msg);
        }
    }

    /// Owns everything a run borrows, for tests that drive programs directly.
    pub struct Fixture {
        pub requests: ScriptRequests,
        pub sink: RecordingSink,
        pub controls: Mutex<ControlStore>,
        pub fragments: FragmentRegistry,
        pub memo: Arc<MemoRegistry>,
        pub media: MediaStore,
        pub clock: Arc<ManualClock>,
    }

    impl Fixture {
        pub fn new() -> Self {
            let clock = Arc::new(ManualClock::new());
            Self {
                requests: ScriptRequests::new(),
                sink: RecordingSink::default(),
                controls: Mutex::new(ControlStore::new()),
                fragments: FragmentRegistry::new(),
                memo: Arc::new(MemoRegistry::with_clock(clock.clone())),
                media: MediaStore::new(),
                clock,
            }
        }

        pub fn context(&mut self) -> ScriptRunContext<'_> {
            self.controls.lock().unwrap().begin_run();
            ScriptRunContext::new(RunEnv {
                session_id: "test-session",
                run_id: "test-run",
                requests: &self.requests,
                sink: &self.sink,
                controls: &self.controls,
                fragments: &mut self.fragments,
                memo: &self.memo,
                media: &self.media,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::fixture::Fixture;
    use super::*;
    use crate::requests::RunScope;

    fn text(body: &str) -> Element {
        Element::Text {
            body: body.to_string(),
        }
    }

    #[test]
    fn checkpoint_turns_pending_requests_into_interrupts() {
        let mut fixture = Fixture::new();
        assert!(fixture.context().checkpoint().is_ok());

        fixture.requests.request_rerun(RerunData::full(None));
        let halt = fixture.context().checkpoint().unwrap_err();
        assert_eq!(
            halt,
            Halt::Interrupt(Interrupt::Rerun(RerunData {
                controls: None,
                scope: RunScope::Full,
            }))
        );

        fixture.requests.request_stop();
        assert_eq!(
            fixture.context().checkpoint(),
            Err(Halt::Interrupt(Interrupt::Stop))
        );
        assert!(fixture.context().checkpoint().is_ok());
    }

    #[test]
    fn sleep_wakes_early_on_request() {
        let mut fixture = Fixture::new();
        fixture.requests.request_stop();
        let started = Instant::now();
        let result = fixture.context().sleep(Duration::from_secs(30));
        assert_eq!(result, Err(Halt::Interrupt(Interrupt::Stop)));
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn unbounded_sleep_still_ends_on_request() {
        let mut fixture = Fixture::new();
        fixture.requests.request_stop();
        let result = fixture.context().sleep(Duration::MAX);
        assert_eq!(result, Err(Halt::Interrupt(Interrupt::Stop)));
    }

    #[test]
    fn elements_follow_blocks() {
        let mut fixture = Fixture::new();
        {
            let mut ctx = fixture.context();
            ctx.emit_element(text("a"));
            ctx.open_block(Block::Vertical);
            ctx.emit_element(text("b"));
            ctx.close_block();
            ctx.emit_element(text("c"));
        }
        let paths: Vec<DeltaPath> = fixture
            .sink
            .take()
            .iter()
            .map(|msg| msg.delta_path().to_vec())
            .collect();
        assert_eq!(paths, vec![vec![0, 0], vec![0, 1], vec![0, 1, 0], vec![0, 2]]);
    }

    #[test]
    fn declaring_controls_inside_a_capture_fails() {
        let mut fixture = Fixture::new();
        let mut ctx = fixture.context();
        ctx.begin_capture();
        let result = ctx.declare_control(ControlRequest {
            id: ControlId::from("x"),
            kind: ControlKind::Checkbox,
            label: "x".to_string(),
            default: ControlValue::Bool(false),
            on_change: None,
        });
        assert!(matches!(result, Err(Halt::Exception(_))));
    }

    #[test]
    fn fragments_register_and_cannot_nest() {
        let mut fixture = Fixture::new();
        {
            let mut ctx = fixture.context();
            let inner: FragmentFn = Arc::new(|ctx: &mut ScriptRunContext<'_>| {
                ctx.emit_element(Element::Text {
                    body: "inner".to_string(),
                });
                Ok(())
            });
            let outer: FragmentFn = Arc::new(move |ctx: &mut ScriptRunContext<'_>| {
                ctx.call_fragment("inner", inner.clone())
            });
            let result = ctx.call_fragment("outer", outer);
            assert!(matches!(
                result,
                Err(Halt::Exception(ScriptException { ref kind, .. })) if kind == "FragmentError"
            ));
        }
        assert_eq!(fixture.fragments.len(), 1);
    }

    #[test]
    fn fragment_rerun_writes_inside_its_block() {
        let mut fixture = Fixture::new();
        let body: FragmentFn = Arc::new(|ctx: &mut ScriptRunContext<'_>| {
            ctx.emit_element(Element::Text {
                body: "tick".to_string(),
            });
            Ok(())
        });
        {
            let mut ctx = fixture.context();
            ctx.emit_element(text("before"));
            ctx.call_fragment("ticker", body).unwrap();
        }
        fixture.sink.take();

        let fragment = fixture.fragments.iter().next().cloned().unwrap();
        fixture.context().rerun_fragment(&fragment).unwrap();
        let messages = fixture.sink.take();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].delta_path(), &[0, 1, 0]);
    }
}
