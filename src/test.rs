#![cfg(test)]

use std::fs::{self, DirEntry};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;

use crate::config::RuntimeConfig;
use crate::controls::{ControlSnapshot, ControlValue};
use crate::memo::{CallArg, FunctionIdentity, MemoOptions};
use crate::message::{BackMsg, Element, ForwardBody, ForwardMsg, ScriptFinishedStatus, SessionEvent};
use crate::program::{NativeSource, ScriptSource};
use crate::run_context::Halt;
use crate::runtime::{ClientError, Runtime, SessionClient};
use crate::script::{FileSource, InlineSource};
use crate::session::SessionId;

fn visit_dirs(dir: &Path, cb: &mut dyn FnMut(&DirEntry)) -> io::Result<()> {
    if dir.is_dir() {
        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            let path = entry.path();
            if path.is_dir() {
                visit_dirs(&path, cb)?;
            } else {
                cb(&entry);
            }
        }
    }
    Ok(())
}

#[test]
fn every_demo_compiles() -> Result<(), String> {
    let mut dir = PathBuf::from(env!("CARGO_MANIFEST_DIR"));
    dir.push("demos");
    let mut checked = 0;
    let mut result = Ok(());
    visit_dirs(&dir, &mut |entry| {
        if !matches!(entry.path().extension().and_then(|x| x.to_str()), Some("page")) {
            return;
        }
        checked += 1;
        if let Err(failure) = FileSource::new(entry.path()).compile() {
            result = Err(format!("{}:\n{}", entry.path().display(), failure.report));
        }
    })
    .map_err(|err| err.to_string())?;
    if checked == 0 {
        return Err("no demos found".to_string());
    }
    result
}

struct ChannelClient(mpsc::UnboundedSender<ForwardMsg>);

impl SessionClient for ChannelClient {
    fn write_forward_msg(&self, msg: ForwardMsg) -> Result<(), ClientError> {
        self.0.send(msg).map_err(|_| ClientError::Closed)
    }
}

/// One runtime with a single connected session.
struct Harness {
    runtime: Arc<Runtime>,
    task: tokio::task::JoinHandle<()>,
    id: SessionId,
    messages: mpsc::UnboundedReceiver<ForwardMsg>,
}

impl Harness {
    fn start(source: impl ScriptSource + 'static) -> Self {
        Self::with_runtime(Runtime::new(RuntimeConfig::default()), source)
    }

    fn with_runtime(runtime: Arc<Runtime>, source: impl ScriptSource + 'static) -> Self {
        let task = runtime.start();
        let (sender, messages) = mpsc::unbounded_channel();
        let id = runtime
            .connect(Arc::new(source), Arc::new(ChannelClient(sender)))
            .unwrap();
        Self {
            runtime,
            task,
            id,
            messages,
        }
    }

    fn send(&self, msg: BackMsg) {
        self.runtime.handle_back_msg(&self.id, msg).unwrap();
    }

    fn rerun(&self, controls: Option<ControlSnapshot>) {
        self.send(BackMsg::Rerun {
            controls,
            fragment_id: None,
        });
    }

    /// Messages up to and including the next `ScriptFinished`.
    async fn run(&mut self) -> (Vec<ForwardMsg>, ScriptFinishedStatus) {
        let mut messages = Vec::new();
        loop {
            let msg = tokio::time::timeout(Duration::from_secs(10), self.messages.recv())
                .await
                .expect("timed out waiting for the run to finish")
                .expect("client channel closed");
            if let Some(status) = msg.finished_status() {
                return (messages, status);
            }
            messages.push(msg);
        }
    }

    async fn stop(self) {
        self.runtime.stop();
        self.task.await.unwrap();
    }
}

fn elements(messages: &[ForwardMsg]) -> Vec<Element> {
    messages
        .iter()
        .filter_map(|msg| msg.element().cloned())
        .collect()
}

fn texts(messages: &[ForwardMsg]) -> Vec<String> {
    elements(messages)
        .into_iter()
        .filter_map(|element| match element {
            Element::Text { body } | Element::Markdown { body } => Some(body),
            _ => None,
        })
        .collect()
}

fn checkbox_id(messages: &[ForwardMsg]) -> String {
    elements(messages)
        .into_iter()
        .find_map(|element| match element {
            Element::Checkbox { id, .. } => Some(id),
            _ => None,
        })
        .expect("a checkbox")
}

#[tokio::test]
async fn checked_checkbox_shows_its_message() {
    let mut harness = Harness::start(InlineSource::new(
        "agree",
        "if checkbox(\"I agree\") { text(\"Great!\") }",
    ));

    harness.rerun(None);
    let (first, status) = harness.run().await;
    assert_eq!(status, ScriptFinishedStatus::FinishedSuccessfully);
    assert!(texts(&first).is_empty());
    let id = checkbox_id(&first);

    harness.rerun(Some(ControlSnapshot::new().with(id.as_str(), ControlValue::Bool(true))));
    let (second, _) = harness.run().await;
    assert_eq!(texts(&second), ["Great!"]);

    // The value sticks without being resent.
    harness.rerun(None);
    let (third, _) = harness.run().await;
    assert_eq!(texts(&third), ["Great!"]);
    harness.stop().await;
}

#[tokio::test]
async fn memoized_call_computes_once_and_replays_its_output() {
    let computed = Arc::new(AtomicUsize::new(0));
    let counter = computed.clone();
    let source = NativeSource::from_fn("memo", move |ctx| {
        let f = ctx
            .memo()
            .data_cache(FunctionIdentity::new("memo.f", "fn f(x) { x * 2 }"), MemoOptions::default());
        let x = 1_i64;
        let value: i64 = f.call(ctx, &[CallArg::new("x", &x)], |ctx| {
            counter.fetch_add(1, Ordering::SeqCst);
            ctx.emit_element(Element::Text {
                body: "computing".to_string(),
            });
            Ok::<_, Halt>(x * 2)
        })?;
        ctx.emit_element(Element::Text {
            body: value.to_string(),
        });
        Ok(())
    });
    let mut harness = Harness::start(source);

    harness.rerun(None);
    let (first, _) = harness.run().await;
    harness.rerun(None);
    let (second, _) = harness.run().await;

    assert_eq!(texts(&first), ["computing", "2"]);
    assert_eq!(texts(&second), ["computing", "2"]);
    assert_eq!(computed.load(Ordering::SeqCst), 1);
    assert_eq!(harness.runtime.memo().entry_count(), 1);
    harness.stop().await;
}

#[tokio::test]
async fn compile_errors_run_nothing_and_keep_the_session() {
    let mut harness = Harness::start(InlineSource::new("broken", "text(\"side effect\")\nlet = 1"));
    harness.rerun(None);
    let (messages, status) = harness.run().await;
    assert_eq!(status, ScriptFinishedStatus::FinishedWithCompileError);
    assert!(elements(&messages).is_empty());
    let report = messages.iter().find_map(|msg| match &msg.body {
        ForwardBody::SessionEvent {
            event: SessionEvent::ScriptCompilationException { report, .. },
        } => Some(report.clone()),
        _ => None,
    });
    assert!(report.is_some_and(|report| report.contains("let = 1")));
    assert!(harness.runtime.is_active_session(&harness.id));
    assert_eq!(harness.runtime.session_info(&harness.id).unwrap().run_count(), 0);
    harness.stop().await;
}

#[tokio::test]
async fn fragment_reruns_only_execute_the_fragment() {
    let source = r#"
        fragment clock(label) {
            set_state("ticks", state("ticks", default = 0) + 1)
            text(label + " " + str(state("ticks")))
        }
        text("header")
        clock("tick")
        text("footer")
    "#;
    let mut harness = Harness::start(InlineSource::new("fragments", source));
    harness.rerun(None);
    let (first, _) = harness.run().await;
    assert_eq!(texts(&first), ["header", "tick 1", "footer"]);
    let fragment_id = first
        .iter()
        .find_map(|msg| match &msg.body {
            ForwardBody::Delta {
                fragment_id: Some(id),
                ..
            } => Some(id.clone()),
            _ => None,
        })
        .expect("fragment output is tagged with its id");

    harness.send(BackMsg::Rerun {
        controls: None,
        fragment_id: Some(fragment_id.clone()),
    });
    let (second, status) = harness.run().await;
    assert_eq!(status, ScriptFinishedStatus::FinishedFragmentRunSuccessfully);
    assert_eq!(texts(&second), ["tick 2"]);
    assert!(second.iter().any(|msg| matches!(
        &msg.body,
        ForwardBody::NewSession { fragment_id: Some(id), .. } if *id == fragment_id
    )));
    // Fragment runs do not count as full runs.
    assert_eq!(harness.runtime.session_info(&harness.id).unwrap().run_count(), 1);
    harness.stop().await;
}

#[tokio::test]
async fn callbacks_run_before_the_page() {
    let source = r#"
        fn bump() { set_state("bumps", state("bumps", default = 0) + 1) }
        let on = checkbox("Toggle", key = "toggle", on_change = bump)
        text(str(on) + " " + str(state("bumps", default = 0)))
    "#;
    let mut harness = Harness::start(InlineSource::new("callbacks", source));
    harness.rerun(None);
    let (first, _) = harness.run().await;
    assert_eq!(texts(&first), ["false 0"]);

    let id = checkbox_id(&first);
    harness.rerun(Some(ControlSnapshot::new().with(id.as_str(), ControlValue::Bool(true))));
    let (second, _) = harness.run().await;
    assert_eq!(texts(&second), ["true 1"]);

    // A run without new values does not fire the callback again.
    harness.rerun(None);
    let (third, _) = harness.run().await;
    assert_eq!(texts(&third), ["true 1"]);

    // Neither does resending the same value.
    harness.rerun(Some(ControlSnapshot::new().with(id.as_str(), ControlValue::Bool(true))));
    let (fourth, _) = harness.run().await;
    assert_eq!(texts(&fourth), ["true 1"]);
    harness.stop().await;
}

#[tokio::test]
async fn uncaught_exceptions_render_in_place() {
    let source = "text(\"before\")\nlet x = [1][5]\ntext(\"after\")";
    let mut harness = Harness::start(InlineSource::new("raise", source));
    harness.rerun(None);
    let (messages, status) = harness.run().await;
    assert_eq!(status, ScriptFinishedStatus::FinishedSuccessfully);
    let elements = elements(&messages);
    assert_eq!(elements.len(), 2);
    assert!(matches!(&elements[1], Element::Exception { kind, .. } if kind == "IndexError"));
    harness.stop().await;
}

#[tokio::test]
async fn buttons_reset_after_the_run() {
    let mut harness = Harness::start(InlineSource::new(
        "button",
        "if button(\"Go\", key = \"go\") { text(\"clicked\") }",
    ));
    harness.rerun(None);
    let (first, _) = harness.run().await;
    let id = elements(&first)
        .into_iter()
        .find_map(|element| match element {
            Element::Button { id, .. } => Some(id),
            _ => None,
        })
        .unwrap();

    harness.rerun(Some(ControlSnapshot::new().with(id.as_str(), ControlValue::Bool(true))));
    let (clicked, _) = harness.run().await;
    assert_eq!(texts(&clicked), ["clicked"]);

    harness.rerun(None);
    let (after, _) = harness.run().await;
    assert!(texts(&after).is_empty());
    harness.stop().await;
}

#[tokio::test]
async fn stop_requests_end_long_runs() {
    let mut harness = Harness::start(InlineSource::new(
        "slow",
        "text(\"start\")\nsleep(60000)\ntext(\"never\")",
    ));
    harness.rerun(None);
    loop {
        let msg = tokio::time::timeout(Duration::from_secs(10), harness.messages.recv())
            .await
            .unwrap()
            .unwrap();
        if msg.element().is_some() {
            break;
        }
    }
    harness.send(BackMsg::StopScript);
    let (rest, status) = harness.run().await;
    assert_eq!(status, ScriptFinishedStatus::FinishedSuccessfully);
    assert!(texts(&rest).is_empty());
    harness.stop().await;
}
