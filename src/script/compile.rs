use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use miette::LabeledSpan;
use thiserror::Error;

use super::builtins;
use super::language::{Arg, Block, Expr, FnDef, FnKind, Name, Script, Stmt};
use super::parse::parse;
use crate::location::{labels_from_span, FileName, Span, Spanning};

#[derive(Debug, Clone, Error, PartialEq)]
pub enum CompileError {
    #[error("{message}")]
    Syntax { span: Span, message: String },
    #[error("`{name}` is not defined here")]
    UnknownName { span: Span, name: String },
    #[error("there is no function named `{name}`")]
    UnknownFunction { span: Span, name: String },
    #[error("function `{name}` is defined more than once")]
    DuplicateFunction {
        span: Span,
        previous: Span,
        name: String,
    },
    #[error("`{name}` is built in and cannot be redefined")]
    ReservedName { span: Span, name: String },
    #[error("`{name}` takes {expected} but was given {found}")]
    ArityMismatch {
        span: Span,
        name: String,
        expected: String,
        found: usize,
    },
    #[error("`{name}` is not a cached function, so it has no cache to clear")]
    NotCached { span: Span, name: String },
    #[error("`return` can only appear inside a function")]
    ReturnOutsideFunction { span: Span },
    #[error("functions can only be defined at the top level of a script")]
    NestedFunction { span: Span },
    #[error("`{name}` is not a container, expected `container` or `expander`")]
    InvalidContainer { span: Span, name: String },
    #[error("`on_change` must name a function that takes no arguments")]
    InvalidCallback { span: Span },
    #[error("`{function}` has no keyword argument `{name}`")]
    KeywordArgument {
        span: Span,
        function: String,
        name: String,
    },
}

impl Spanning for CompileError {
    fn span(&self) -> Span {
        match self {
            Self::Syntax { span, .. }
            | Self::UnknownName { span, .. }
            | Self::UnknownFunction { span, .. }
            | Self::DuplicateFunction { span, .. }
            | Self::ReservedName { span, .. }
            | Self::ArityMismatch { span, .. }
            | Self::NotCached { span, .. }
            | Self::ReturnOutsideFunction { span }
            | Self::NestedFunction { span }
            | Self::InvalidContainer { span, .. }
            | Self::InvalidCallback { span }
            | Self::KeywordArgument { span, .. } => span.clone(),
        }
    }
}

fn labelled(code: &str, span: &Span, label: &str) -> Vec<LabeledSpan> {
    let mut labels = labels_from_span(code, span);
    labels
        .iter_mut()
        .for_each(|x| x.set_label(Some(label.to_owned())));
    labels
}

impl CompileError {
    pub fn to_report(&self, source_code: Arc<str>) -> miette::Report {
        let code = &source_code;
        let report = match self {
            Self::Syntax { span, message } => {
                miette::miette!(labels = labels_from_span(code, span), "Syntax error: {}", message)
            }
            Self::DuplicateFunction {
                span,
                previous,
                name,
            } => {
                let mut labels = labelled(code, span, "this");
                labels.extend(labelled(code, previous, "is already defined here"));
                miette::miette!(labels = labels, "Function `{}` is already defined.", name)
            }
            Self::ArityMismatch { span, .. } => {
                miette::miette!(labels = labelled(code, span, "in this call"), "{}.", self)
            }
            Self::UnknownName { span, .. } | Self::UnknownFunction { span, .. } => {
                miette::miette!(
                    labels = labelled(code, span, "not found"),
                    help = "functions only see their own parameters and local variables",
                    "{}.",
                    self
                )
            }
            other => {
                let span = other.span();
                miette::miette!(labels = labels_from_span(code, &span), "{}.", other)
            }
        };
        report.with_source_code(source_code)
    }
}

/// A script that parsed and passed name resolution.
#[derive(Debug)]
pub struct CompiledScript {
    pub name: String,
    pub source: Arc<str>,
    pub script: Script,
    pub functions: HashMap<String, Arc<FnDef>>,
}

impl CompiledScript {
    pub fn function(&self, name: &str) -> Option<&Arc<FnDef>> {
        self.functions.get(name)
    }
}

pub fn compile(name: &str, source: Arc<str>, file: FileName) -> Result<CompiledScript, CompileError> {
    let script = parse(&source, file)?;

    let mut functions: HashMap<String, Arc<FnDef>> = HashMap::new();
    for statement in &script.statements {
        let Stmt::Fn(def) = statement else {
            continue;
        };
        if builtins::signature(&def.name.text).is_some() || is_container(&def.name.text) {
            return Err(CompileError::ReservedName {
                span: def.name.span.clone(),
                name: def.name.text.clone(),
            });
        }
        if let Some(previous) = functions.get(&def.name.text) {
            return Err(CompileError::DuplicateFunction {
                span: def.name.span.clone(),
                previous: previous.name.span.clone(),
                name: def.name.text.clone(),
            });
        }
        functions.insert(def.name.text.clone(), def.clone());
    }

    let mut checker = Checker {
        functions: &functions,
        scopes: vec![HashSet::new()],
        in_function: false,
    };
    for statement in &script.statements {
        match statement {
            Stmt::Fn(def) => checker.function(def)?,
            statement => checker.statement(statement)?,
        }
    }

    Ok(CompiledScript {
        name: name.to_string(),
        source,
        script,
        functions,
    })
}

fn is_container(name: &str) -> bool {
    matches!(name, "container" | "expander")
}

fn plural(count: usize, noun: &str) -> String {
    match count {
        1 => format!("1 {noun}"),
        n => format!("{n} {noun}s"),
    }
}

struct Checker<'a> {
    functions: &'a HashMap<String, Arc<FnDef>>,
    scopes: Vec<HashSet<String>>,
    in_function: bool,
}

impl Checker<'_> {
    fn function(&mut self, def: &FnDef) -> Result<(), CompileError> {
        let saved = std::mem::replace(
            &mut self.scopes,
            vec![def.params.iter().map(|param| param.text.clone()).collect()],
        );
        self.in_function = true;
        let result = self.statements(&def.body);
        self.in_function = false;
        self.scopes = saved;
        result
    }

    fn define(&mut self, name: &Name) {
        if let Some(scope) = self.scopes.last_mut() {
            scope.insert(name.text.clone());
        }
    }

    fn is_defined(&self, name: &str) -> bool {
        self.scopes.iter().any(|scope| scope.contains(name))
    }

    fn scoped(&mut self, block: &Block, bind: Option<&Name>) -> Result<(), CompileError> {
        self.scopes.push(HashSet::new());
        if let Some(name) = bind {
            self.define(name);
        }
        let result = self.statements(block);
        self.scopes.pop();
        result
    }

    fn statements(&mut self, block: &Block) -> Result<(), CompileError> {
        for statement in &block.statements {
            self.statement(statement)?;
        }
        Ok(())
    }

    fn statement(&mut self, statement: &Stmt) -> Result<(), CompileError> {
        match statement {
            Stmt::Let { name, value, .. } => {
                self.expression(value)?;
                self.define(name);
            }
            Stmt::Assign { name, value, .. } => {
                self.expression(value)?;
                self.variable(name)?;
            }
            Stmt::If {
                branches,
                otherwise,
                ..
            } => {
                for (condition, body) in branches {
                    self.expression(condition)?;
                    self.scoped(body, None)?;
                }
                if let Some(body) = otherwise {
                    self.scoped(body, None)?;
                }
            }
            Stmt::For { var, iter, body, .. } => {
                self.expression(iter)?;
                self.scoped(body, Some(var))?;
            }
            Stmt::While {
                condition, body, ..
            } => {
                self.expression(condition)?;
                self.scoped(body, None)?;
            }
            Stmt::Fn(def) => {
                return Err(CompileError::NestedFunction {
                    span: def.span.clone(),
                })
            }
            Stmt::Return { span, value } => {
                if !self.in_function {
                    return Err(CompileError::ReturnOutsideFunction { span: span.clone() });
                }
                if let Some(value) = value {
                    self.expression(value)?;
                }
            }
            Stmt::With {
                container,
                args,
                body,
                ..
            } => {
                let arity = match container.text.as_str() {
                    "container" => 0,
                    "expander" => 1,
                    _ => {
                        return Err(CompileError::InvalidContainer {
                            span: container.span.clone(),
                            name: container.text.clone(),
                        })
                    }
                };
                self.positional_only(&container.text, args)?;
                if args.len() != arity {
                    return Err(CompileError::ArityMismatch {
                        span: container.span.clone(),
                        name: container.text.clone(),
                        expected: plural(arity, "argument"),
                        found: args.len(),
                    });
                }
                self.arguments(args)?;
                self.scoped(body, None)?;
            }
            Stmt::Try {
                body,
                error,
                handler,
                ..
            } => {
                self.scoped(body, None)?;
                self.scoped(handler, Some(error))?;
            }
            Stmt::Stop(_) | Stmt::Rerun(_) => {}
            Stmt::Raise { value, .. } => self.expression(value)?,
            Stmt::ClearCache { function, args, .. } => {
                let Some(def) = self.functions.get(&function.text) else {
                    return Err(CompileError::UnknownFunction {
                        span: function.span.clone(),
                        name: function.text.clone(),
                    });
                };
                if !matches!(def.kind, FnKind::Cached { .. }) {
                    return Err(CompileError::NotCached {
                        span: function.span.clone(),
                        name: function.text.clone(),
                    });
                }
                self.positional_only(&function.text, args)?;
                if !args.is_empty() && args.len() != def.params.len() {
                    return Err(CompileError::ArityMismatch {
                        span: function.span.clone(),
                        name: format!("{}.clear", function.text),
                        expected: format!("no arguments or {}", plural(def.params.len(), "argument")),
                        found: args.len(),
                    });
                }
                self.arguments(args)?;
            }
            Stmt::Expr(expr) => self.expression(expr)?,
        }
        Ok(())
    }

    fn variable(&self, name: &Name) -> Result<(), CompileError> {
        if self.is_defined(&name.text) {
            Ok(())
        } else {
            Err(CompileError::UnknownName {
                span: name.span.clone(),
                name: name.text.clone(),
            })
        }
    }

    fn positional_only(&self, function: &str, args: &[Arg]) -> Result<(), CompileError> {
        match args.iter().find_map(|arg| arg.name.as_ref()) {
            Some(name) => Err(CompileError::KeywordArgument {
                span: name.span.clone(),
                function: function.to_string(),
                name: name.text.clone(),
            }),
            None => Ok(()),
        }
    }

    fn arguments(&mut self, args: &[Arg]) -> Result<(), CompileError> {
        for arg in args {
            self.expression(&arg.value)?;
        }
        Ok(())
    }

    fn expression(&mut self, expr: &Expr) -> Result<(), CompileError> {
        match expr {
            Expr::Literal(..) => Ok(()),
            Expr::Var(name) => self.variable(name),
            Expr::List(_, items) => {
                for item in items {
                    self.expression(item)?;
                }
                Ok(())
            }
            Expr::Index { target, index, .. } => {
                self.expression(target)?;
                self.expression(index)
            }
            Expr::Unary { operand, .. } => self.expression(operand),
            Expr::Binary { left, right, .. } => {
                self.expression(left)?;
                self.expression(right)
            }
            Expr::Call { callee, args, .. } => self.call(callee, args),
        }
    }

    fn call(&mut self, callee: &Name, args: &[Arg]) -> Result<(), CompileError> {
        if let Some(def) = self.functions.get(&callee.text) {
            self.positional_only(&callee.text, args)?;
            if args.len() != def.params.len() {
                return Err(CompileError::ArityMismatch {
                    span: callee.span.clone(),
                    name: callee.text.clone(),
                    expected: plural(def.params.len(), "argument"),
                    found: args.len(),
                });
            }
            return self.arguments(args);
        }

        let Some(signature) = builtins::signature(&callee.text) else {
            return Err(CompileError::UnknownFunction {
                span: callee.span.clone(),
                name: callee.text.clone(),
            });
        };

        let positional = args.iter().filter(|arg| arg.name.is_none()).count();
        if positional < signature.min || positional > signature.max {
            let expected = if signature.min == signature.max {
                plural(signature.min, "argument")
            } else if signature.max == usize::MAX {
                format!("at least {}", plural(signature.min, "argument"))
            } else {
                format!("{} to {} arguments", signature.min, signature.max)
            };
            return Err(CompileError::ArityMismatch {
                span: callee.span.clone(),
                name: callee.text.clone(),
                expected,
                found: positional,
            });
        }

        for arg in args {
            let Some(name) = &arg.name else {
                self.expression(&arg.value)?;
                continue;
            };
            if !signature.keywords.contains(&name.text.as_str()) {
                return Err(CompileError::KeywordArgument {
                    span: name.span.clone(),
                    function: callee.text.clone(),
                    name: name.text.clone(),
                });
            }
            if name.text == builtins::ON_CHANGE {
                self.callback(&arg.value)?;
            } else {
                self.expression(&arg.value)?;
            }
        }
        Ok(())
    }

    fn callback(&self, value: &Expr) -> Result<(), CompileError> {
        let valid = match value {
            Expr::Var(name) => self
                .functions
                .get(&name.text)
                .is_some_and(|def| def.params.is_empty() && def.kind == FnKind::Plain),
            _ => false,
        };
        if valid {
            Ok(())
        } else {
            Err(CompileError::InvalidCallback { span: value.span() })
        }
    }
}
