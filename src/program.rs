//! What a runner executes.
//!
//! A [`ScriptSource`] is compiled at the start of every run, so edits to a
//! page script take effect on the next rerun. Compilation yields a
//! [`Program`], which executes against a [`ScriptRunContext`].
//!
//! Programs are preempted cooperatively. Page scripts check for pending
//! requests between statements and while sleeping. A native program is
//! preemptible only where it calls [`ScriptRunContext::checkpoint`],
//! [`ScriptRunContext::sleep`] or another primitive of the context; a loop
//! that never calls into the context runs to completion before a stop or
//! rerun takes effect.

use std::sync::Arc;

use crate::run_context::{Halt, ScriptRunContext};

pub trait Program: Send + Sync {
    fn run(&self, ctx: &mut ScriptRunContext<'_>) -> Result<(), Halt>;
}

/// Adapts a closure into a [`Program`].
pub struct FnProgram<F>(pub F);

impl<F> Program for FnProgram<F>
where
    F: Fn(&mut ScriptRunContext<'_>) -> Result<(), Halt> + Send + Sync,
{
    fn run(&self, ctx: &mut ScriptRunContext<'_>) -> Result<(), Halt> {
        (self.0)(ctx)
    }
}

/// Why a source did not produce a program.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompileFailure {
    /// One-line summary.
    pub message: String,
    /// Rendered diagnostic with source labels.
    pub report: String,
}

pub trait ScriptSource: Send + Sync {
    fn name(&self) -> &str;
    fn compile(&self) -> Result<Arc<dyn Program>, CompileFailure>;
}

/// A source that always yields the same native program.
pub struct NativeSource {
    name: String,
    program: Arc<dyn Program>,
}

impl NativeSource {
    pub fn new(name: impl Into<String>, program: impl Program + 'static) -> Self {
        Self {
            name: name.into(),
            program: Arc::new(program),
        }
    }

    pub fn from_fn<F>(name: impl Into<String>, f: F) -> Self
    where
        F: Fn(&mut ScriptRunContext<'_>) -> Result<(), Halt> + Send + Sync + 'static,
    {
        Self::new(name, FnProgram(f))
    }
}

impl ScriptSource for NativeSource {
    fn name(&self) -> &str {
        &self.name
    }

    fn compile(&self) -> Result<Arc<dyn Program>, CompileFailure> {
        Ok(self.program.clone())
    }
}
