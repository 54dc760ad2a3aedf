//! The runner's inbound request slot.
//!
//! Requests do not queue: a pending rerun absorbs later reruns, a stop
//! replaces whatever is pending, and a shutdown is final. The runner thread
//! blocks on the slot between runs and polls it while a program executes.

use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use crate::controls::ControlSnapshot;
use crate::fragment::FragmentId;
use crate::run_context::Interrupt;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunScope {
    Full,
    Fragment(FragmentId),
}

#[derive(Debug, Clone, PartialEq)]
pub struct RerunData {
    pub controls: Option<ControlSnapshot>,
    pub scope: RunScope,
}

impl RerunData {
    pub fn full(controls: Option<ControlSnapshot>) -> Self {
        Self {
            controls,
            scope: RunScope::Full,
        }
    }

    pub fn fragment(id: FragmentId, controls: Option<ControlSnapshot>) -> Self {
        Self {
            controls,
            scope: RunScope::Fragment(id),
        }
    }

    pub fn is_fragment(&self) -> bool {
        matches!(self.scope, RunScope::Fragment(_))
    }

    /// Folds a newer request into this pending one. The newer snapshot wins
    /// when it has one; a full scope is never narrowed to a fragment.
    fn absorb(&mut self, newer: RerunData) {
        if newer.controls.is_some() {
            self.controls = newer.controls;
        }
        if let RunScope::Fragment(_) = self.scope {
            self.scope = newer.scope;
        }
    }
}

/// What the runner receives between runs.
#[derive(Debug, Clone, PartialEq)]
pub enum ScriptRequest {
    Rerun(RerunData),
    Stop,
    Shutdown,
}

#[derive(Debug, Clone, PartialEq)]
enum State {
    Continue,
    Rerun(RerunData),
    Stop,
    Shutdown,
}

pub struct ScriptRequests {
    state: Mutex<State>,
    changed: Condvar,
}

impl Default for ScriptRequests {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptRequests {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State::Continue),
            changed: Condvar::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Returns `false` once shutdown has been requested.
    pub fn request_rerun(&self, data: RerunData) -> bool {
        let mut state = self.lock();
        if *state == State::Shutdown {
            return false;
        }
        if let State::Rerun(pending) = &mut *state {
            pending.absorb(data);
        } else {
            *state = State::Rerun(data);
        }
        self.changed.notify_all();
        true
    }

    pub fn request_stop(&self) -> bool {
        let mut state = self.lock();
        if *state == State::Shutdown {
            return false;
        }
        *state = State::Stop;
        self.changed.notify_all();
        true
    }

    pub fn request_shutdown(&self) {
        *self.lock() = State::Shutdown;
        self.changed.notify_all();
    }

    pub fn has_pending(&self) -> bool {
        *self.lock() != State::Continue
    }

    pub fn is_shutdown(&self) -> bool {
        *self.lock() == State::Shutdown
    }

    /// Polled by a running program. A pending shutdown stops the run but
    /// stays in the slot so the loop sees it next.
    pub fn on_script_yield(&self) -> Option<Interrupt> {
        let mut state = self.lock();
        match std::mem::replace(&mut *state, State::Continue) {
            State::Continue => None,
            State::Stop => Some(Interrupt::Stop),
            State::Rerun(data) => Some(Interrupt::Rerun(data)),
            State::Shutdown => {
                *state = State::Shutdown;
                Some(Interrupt::Stop)
            }
        }
    }

    /// Blocks until a request arrives and consumes it.
    pub fn wait_for_request(&self) -> ScriptRequest {
        let mut state = self
            .changed
            .wait_while(self.lock(), |state| *state == State::Continue)
            .unwrap_or_else(PoisonError::into_inner);
        match std::mem::replace(&mut *state, State::Continue) {
            State::Rerun(data) => ScriptRequest::Rerun(data),
            State::Stop | State::Continue => ScriptRequest::Stop,
            State::Shutdown => {
                *state = State::Shutdown;
                ScriptRequest::Shutdown
            }
        }
    }

    /// Waits at most `timeout` for a request without consuming it. Returns
    /// whether one is pending.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let (state, _) = self
            .changed
            .wait_timeout_while(self.lock(), timeout, |state| *state == State::Continue)
            .unwrap_or_else(PoisonError::into_inner);
        *state != State::Continue
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::thread;

    use super::*;
    use crate::controls::{ControlSnapshot, ControlValue};

    fn snapshot(value: i64) -> Option<ControlSnapshot> {
        Some(ControlSnapshot::new().with("volume", ControlValue::Int(value)))
    }

    #[test]
    fn reruns_coalesce_with_last_snapshot_winning() {
        let requests = ScriptRequests::new();
        assert!(requests.request_rerun(RerunData::full(snapshot(1))));
        assert!(requests.request_rerun(RerunData::full(snapshot(2))));
        assert!(requests.request_rerun(RerunData::full(None)));

        assert_eq!(
            requests.wait_for_request(),
            ScriptRequest::Rerun(RerunData::full(snapshot(2)))
        );
        assert!(!requests.has_pending());
    }

    #[test]
    fn full_scope_is_not_narrowed() {
        let requests = ScriptRequests::new();
        requests.request_rerun(RerunData::full(None));
        requests.request_rerun(RerunData::fragment(FragmentId::new("f"), snapshot(3)));
        assert_eq!(
            requests.wait_for_request(),
            ScriptRequest::Rerun(RerunData::full(snapshot(3)))
        );

        requests.request_rerun(RerunData::fragment(FragmentId::new("f"), None));
        requests.request_rerun(RerunData::full(None));
        assert_eq!(
            requests.wait_for_request(),
            ScriptRequest::Rerun(RerunData::full(None))
        );
    }

    #[test]
    fn shutdown_is_final() {
        let requests = ScriptRequests::new();
        requests.request_shutdown();
        assert!(!requests.request_rerun(RerunData::full(None)));
        assert!(!requests.request_stop());
        assert_eq!(requests.on_script_yield(), Some(Interrupt::Stop));
        assert_eq!(requests.wait_for_request(), ScriptRequest::Shutdown);
        assert_eq!(requests.wait_for_request(), ScriptRequest::Shutdown);
    }

    #[test]
    fn stop_replaces_pending_rerun() {
        let requests = ScriptRequests::new();
        requests.request_rerun(RerunData::full(snapshot(1)));
        requests.request_stop();
        assert_eq!(requests.on_script_yield(), Some(Interrupt::Stop));
        assert_eq!(requests.on_script_yield(), None);
    }

    #[test]
    fn waiting_thread_wakes_on_request() {
        let requests = Arc::new(ScriptRequests::new());
        let waiter = {
            let requests = requests.clone();
            thread::spawn(move || requests.wait_for_request())
        };
        thread::sleep(Duration::from_millis(20));
        requests.request_rerun(RerunData::full(None));
        assert_eq!(
            waiter.join().unwrap(),
            ScriptRequest::Rerun(RerunData::full(None))
        );
    }

    #[test]
    fn wait_timeout_does_not_consume() {
        let requests = ScriptRequests::new();
        assert!(!requests.wait_timeout(Duration::from_millis(5)));
        requests.request_stop();
        assert!(requests.wait_timeout(Duration::from_millis(5)));
        assert!(requests.has_pending());
    }
}
