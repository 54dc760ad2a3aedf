//! Page scripts: a small statement language compiled and interpreted by the
//! runtime.
//!
//! A script is re-read and compiled at the start of every run. Compilation
//! parses the source and resolves names; nothing executes unless both
//! succeed.

mod builtins;
mod compile;
mod interpret;
mod language;
mod parse;
mod value;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use miette::{GraphicalReportHandler, GraphicalTheme};

pub use compile::{compile, CompileError, CompiledScript};
pub use interpret::Interpreter;
pub use language::{FnDef, FnKind, Script};
pub use value::{Handle, Value};

use crate::location::FileName;
use crate::program::{CompileFailure, Program, ScriptSource};

/// Renders a report as plain text, for transports without a terminal.
pub fn render_report(report: &miette::Report) -> String {
    let mut out = String::new();
    let handler = GraphicalReportHandler::new_themed(GraphicalTheme::unicode_nocolor());
    match handler.render_report(&mut out, &**report) {
        Ok(()) => out,
        Err(_) => format!("{report}"),
    }
}

fn compile_source(name: &str, source: Arc<str>, file: FileName) -> Result<Arc<dyn Program>, CompileFailure> {
    let compiled = stacker::grow(32 * 1024 * 1024, || compile(name, source.clone(), file));
    match compiled {
        Ok(compiled) => Ok(Arc::new(Interpreter::new(Arc::new(compiled)))),
        Err(error) => {
            let report = error.to_report(source);
            Err(CompileFailure {
                message: error.to_string(),
                report: render_report(&report),
            })
        }
    }
}

/// A page script on disk, re-read on every compile so edits show up on the
/// next rerun.
pub struct FileSource {
    name: String,
    path: PathBuf,
}

impl FileSource {
    pub fn new(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref().to_path_buf();
        let name = path
            .file_stem()
            .map(|stem| stem.to_string_lossy().into_owned())
            .unwrap_or_else(|| "page".to_string());
        Self { name, path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl ScriptSource for FileSource {
    fn name(&self) -> &str {
        &self.name
    }

    fn compile(&self) -> Result<Arc<dyn Program>, CompileFailure> {
        let source = std::fs::read_to_string(&self.path).map_err(|error| {
            let message = format!("cannot read {}: {error}", self.path.display());
            CompileFailure {
                report: message.clone(),
                message,
            }
        })?;
        compile_source(&self.name, Arc::from(source), FileName::from(self.path.as_path()))
    }
}

/// A page script held in memory.
pub struct InlineSource {
    name: String,
    source: Arc<str>,
}

impl InlineSource {
    pub fn new(name: impl Into<String>, source: impl Into<Arc<str>>) -> Self {
        Self {
            name: name.into(),
            source: source.into(),
        }
    }
}

impl ScriptSource for InlineSource {
    fn name(&self) -> &str {
        &self.name
    }

    fn compile(&self) -> Result<Arc<dyn Program>, CompileFailure> {
        compile_source(&self.name, self.source.clone(), FileName::inline())
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;
    use crate::run_context::fixture::Fixture;

    #[test]
    fn compile_failures_render_a_labelled_report() {
        let source = InlineSource::new("page", "text(\"ok\")\nlet = 1");
        let Err(failure) = source.compile() else {
            panic!("expected a compile failure");
        };
        assert!(failure.message.contains("expected a name"));
        assert!(failure.report.contains("let = 1"));
    }

    #[test]
    fn file_sources_are_reread_on_every_compile() {
        let mut file = tempfile::Builder::new().suffix(".page").tempfile().unwrap();
        write!(file, "text(\"first\")").unwrap();
        let source = FileSource::new(file.path());

        let mut fixture = Fixture::new();
        source.compile().unwrap().run(&mut fixture.context()).unwrap();

        std::fs::write(file.path(), "text(\"second\")").unwrap();
        source.compile().unwrap().run(&mut fixture.context()).unwrap();

        let bodies: Vec<String> = fixture
            .sink
            .elements()
            .into_iter()
            .map(|element| match element {
                crate::message::Element::Text { body } => body,
                other => panic!("unexpected {other:?}"),
            })
            .collect();
        assert_eq!(bodies, ["first", "second"]);
    }

    #[test]
    fn missing_files_fail_to_compile() {
        let source = FileSource::new("/nonexistent/page.page");
        assert_eq!(source.name(), "page");
        assert!(source.compile().is_err());
    }
}
