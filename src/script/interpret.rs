use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use super::builtins::{self, BuiltinCall, ON_CHANGE};
use super::compile::CompiledScript;
use super::language::{Arg, BinaryOp, Block, Expr, FnDef, FnKind, Literal, Name, Stmt, UnaryOp};
use super::value::Value;
use crate::fragment::FragmentFn;
use crate::location::{Span, Spanning};
use crate::memo::{CallArg, FunctionIdentity, MemoOptions};
use crate::message;
use crate::program::Program;
use crate::requests::RerunData;
use crate::run_context::{ControlCallback, Halt, Interrupt, ScriptException, ScriptRunContext};

const MAX_CALL_DEPTH: usize = 256;
const MAX_STRING_LEN: usize = 64 * 1024 * 1024;

/// Executes a compiled page script.
pub struct Interpreter {
    script: Arc<CompiledScript>,
}

impl Interpreter {
    pub fn new(script: Arc<CompiledScript>) -> Self {
        Self { script }
    }
}

impl Program for Interpreter {
    fn run(&self, ctx: &mut ScriptRunContext<'_>) -> Result<(), Halt> {
        let mut machine = Machine::new(self.script.clone());
        let mut env = Env::default();
        machine.statements(ctx, &mut env, &self.script.script.statements)?;
        Ok(())
    }
}

enum Flow {
    Normal,
    Return(Value),
}

#[derive(Default)]
struct Env {
    scopes: Vec<HashMap<String, Value>>,
}

impl Env {
    fn with_params(params: &[Name], values: Vec<Value>) -> Self {
        let scope = params
            .iter()
            .map(|param| param.text.clone())
            .zip(values)
            .collect();
        Self {
            scopes: vec![scope],
        }
    }

    fn push(&mut self) {
        self.scopes.push(HashMap::new());
    }

    fn pop(&mut self) {
        self.scopes.pop();
    }

    fn define(&mut self, name: &str, value: Value) {
        if self.scopes.is_empty() {
            self.push();
        }
        if let Some(scope) = self.scopes.last_mut() {
            scope.insert(name.to_string(), value);
        }
    }

    fn assign(&mut self, name: &str, value: Value) -> bool {
        match self
            .scopes
            .iter_mut()
            .rev()
            .find_map(|scope| scope.get_mut(name))
        {
            Some(slot) => {
                *slot = value;
                true
            }
            None => false,
        }
    }

    fn get(&self, name: &str) -> Option<&Value> {
        self.scopes.iter().rev().find_map(|scope| scope.get(name))
    }
}

fn fail(span: &Span, kind: &str, message: impl Into<String>) -> Halt {
    Halt::Exception(ScriptException::new(kind, message).with_frame(format!("at {span}")))
}

fn with_frame(halt: Halt, frame: String) -> Halt {
    match halt {
        Halt::Exception(exception) => Halt::Exception(exception.with_frame(frame)),
        interrupt => interrupt,
    }
}

struct Machine {
    script: Arc<CompiledScript>,
    depth: usize,
}

impl Machine {
    fn new(script: Arc<CompiledScript>) -> Self {
        Self { script, depth: 0 }
    }

    fn block(&mut self, ctx: &mut ScriptRunContext<'_>, env: &mut Env, block: &Block) -> Result<Flow, Halt> {
        env.push();
        let result = self.statements(ctx, env, &block.statements);
        env.pop();
        result
    }

    fn statements(
        &mut self,
        ctx: &mut ScriptRunContext<'_>,
        env: &mut Env,
        statements: &[Stmt],
    ) -> Result<Flow, Halt> {
        for statement in statements {
            if let Flow::Return(value) = self.statement(ctx, env, statement)? {
                return Ok(Flow::Return(value));
            }
        }
        Ok(Flow::Normal)
    }

    fn statement(&mut self, ctx: &mut ScriptRunContext<'_>, env: &mut Env, statement: &Stmt) -> Result<Flow, Halt> {
        ctx.checkpoint()?;
        match statement {
            Stmt::Let { name, value, .. } => {
                let value = self.eval(ctx, env, value)?;
                env.define(&name.text, value);
            }
            Stmt::Assign { name, value, .. } => {
                let value = self.eval(ctx, env, value)?;
                if !env.assign(&name.text, value) {
                    return Err(fail(&name.span, "NameError", format!("`{name}` is not defined")));
                }
            }
            Stmt::If {
                branches,
                otherwise,
                ..
            } => {
                for (condition, body) in branches {
                    if self.eval(ctx, env, condition)?.is_truthy() {
                        return self.block(ctx, env, body);
                    }
                }
                if let Some(body) = otherwise {
                    return self.block(ctx, env, body);
                }
            }
            Stmt::For { span, var, iter, body } => {
                let items = match self.eval(ctx, env, iter)? {
                    Value::List(items) => items,
                    Value::Str(text) => text.chars().map(|c| Value::Str(c.to_string())).collect(),
                    other => {
                        return Err(fail(
                            span,
                            "TypeError",
                            format!("cannot iterate over {}", other.type_name()),
                        ))
                    }
                };
                for item in items {
                    ctx.checkpoint()?;
                    env.push();
                    env.define(&var.text, item);
                    let flow = self.statements(ctx, env, &body.statements);
                    env.pop();
                    if let Flow::Return(value) = flow? {
                        return Ok(Flow::Return(value));
                    }
                }
            }
            Stmt::While { condition, body, .. } => loop {
                ctx.checkpoint()?;
                if !self.eval(ctx, env, condition)?.is_truthy() {
                    break;
                }
                if let Flow::Return(value) = self.block(ctx, env, body)? {
                    return Ok(Flow::Return(value));
                }
            },
            Stmt::Fn(_) => {}
            Stmt::Return { value, .. } => {
                let value = match value {
                    Some(value) => self.eval(ctx, env, value)?,
                    None => Value::None,
                };
                return Ok(Flow::Return(value));
            }
            Stmt::With {
                container,
                args,
                body,
                ..
            } => {
                let block = match args.first() {
                    Some(label) if container.text == "expander" => message::Block::Expander {
                        label: self.eval(ctx, env, &label.value)?.to_string(),
                    },
                    _ => message::Block::Vertical,
                };
                ctx.open_block(block);
                let result = self.block(ctx, env, body);
                ctx.close_block();
                return result;
            }
            Stmt::Try {
                body,
                error,
                handler,
                ..
            } => {
                return match self.block(ctx, env, body) {
                    Err(Halt::Exception(exception)) => {
                        tracing::debug!(kind = %exception.kind, "exception caught by script");
                        env.push();
                        env.define(&error.text, Value::Str(exception.message));
                        let flow = self.statements(ctx, env, &handler.statements);
                        env.pop();
                        flow
                    }
                    other => other,
                };
            }
            Stmt::Stop(_) => return Err(Halt::Interrupt(Interrupt::Stop)),
            Stmt::Rerun(_) => return Err(Halt::Interrupt(Interrupt::Rerun(RerunData::full(None)))),
            Stmt::Raise { span, value } => {
                let value = self.eval(ctx, env, value)?;
                return Err(fail(span, "ScriptError", value.to_string()));
            }
            Stmt::ClearCache { span, function, args } => {
                self.clear_cache(ctx, env, span, function, args)?;
            }
            Stmt::Expr(expr) => {
                self.eval(ctx, env, expr)?;
            }
        }
        Ok(Flow::Normal)
    }

    fn eval(&mut self, ctx: &mut ScriptRunContext<'_>, env: &mut Env, expr: &Expr) -> Result<Value, Halt> {
        match expr {
            Expr::Literal(_, literal) => Ok(match literal {
                Literal::None => Value::None,
                Literal::Bool(value) => Value::Bool(*value),
                Literal::Int(value) => Value::Int(*value),
                Literal::Float(value) => Value::Float(*value),
                Literal::Str(value) => Value::Str(value.clone()),
            }),
            Expr::Var(name) => env
                .get(&name.text)
                .cloned()
                .ok_or_else(|| fail(&name.span, "NameError", format!("`{name}` is not defined"))),
            Expr::List(_, items) => {
                let items = items
                    .iter()
                    .map(|item| self.eval(ctx, env, item))
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(Value::List(items))
            }
            Expr::Index { span, target, index } => {
                let target = self.eval(ctx, env, target)?;
                let index = self.eval(ctx, env, index)?;
                index_value(span, target, index)
            }
            Expr::Unary { span, op, operand } => {
                let operand = self.eval(ctx, env, operand)?;
                match (op, operand) {
                    (UnaryOp::Not, operand) => Ok(Value::Bool(!operand.is_truthy())),
                    (UnaryOp::Neg, Value::Int(value)) => value
                        .checked_neg()
                        .map(Value::Int)
                        .ok_or_else(|| fail(span, "OverflowError", "integer overflow")),
                    (UnaryOp::Neg, Value::Float(value)) => Ok(Value::Float(-value)),
                    (UnaryOp::Neg, other) => Err(fail(
                        span,
                        "TypeError",
                        format!("cannot negate {}", other.type_name()),
                    )),
                }
            }
            Expr::Binary {
                span,
                op,
                left,
                right,
            } => {
                let left = self.eval(ctx, env, left)?;
                match op {
                    BinaryOp::And if !left.is_truthy() => Ok(Value::Bool(false)),
                    BinaryOp::Or if left.is_truthy() => Ok(Value::Bool(true)),
                    BinaryOp::And | BinaryOp::Or => {
                        Ok(Value::Bool(self.eval(ctx, env, right)?.is_truthy()))
                    }
                    op => {
                        let right = self.eval(ctx, env, right)?;
                        binary(span, *op, left, right)
                    }
                }
            }
            Expr::Call { span, callee, args } => {
                stacker::maybe_grow(32 * 1024, 1024 * 1024, || self.call(ctx, env, span, callee, args))
            }
        }
    }

    fn call(
        &mut self,
        ctx: &mut ScriptRunContext<'_>,
        env: &mut Env,
        span: &Span,
        callee: &Name,
        args: &[Arg],
    ) -> Result<Value, Halt> {
        if let Some(def) = self.script.function(&callee.text).cloned() {
            let values = args
                .iter()
                .map(|arg| self.eval(ctx, env, &arg.value))
                .collect::<Result<Vec<_>, _>>()?;
            return self
                .call_user(ctx, &def, values)
                .map_err(|halt| with_frame(halt, format!("in `{}` called at {span}", def.name)));
        }

        let mut call = BuiltinCall {
            name: &callee.text,
            site: span.to_string(),
            args: Vec::new(),
            keywords: Vec::new(),
            on_change: None,
        };
        for arg in args {
            match &arg.name {
                None => {
                    let value = self.eval(ctx, env, &arg.value)?;
                    call.args.push(value);
                }
                Some(name) if name.text == ON_CHANGE => {
                    call.on_change = Some(self.callback(&arg.value)?);
                }
                Some(name) => {
                    let value = self.eval(ctx, env, &arg.value)?;
                    call.keywords.push((name.text.clone(), value));
                }
            }
        }
        builtins::call(ctx, call).map_err(|halt| with_frame(halt, format!("at {span}")))
    }

    fn callback(&self, value: &Expr) -> Result<ControlCallback, Halt> {
        let def = match value {
            Expr::Var(name) => self.script.function(&name.text).cloned(),
            _ => None,
        };
        let Some(def) = def else {
            return Err(fail(
                &value.span(),
                "TypeError",
                "`on_change` must name a function",
            ));
        };
        let script = self.script.clone();
        Ok(Arc::new(move |ctx: &mut ScriptRunContext<'_>| {
            Machine::new(script.clone())
                .call_user(ctx, &def, Vec::new())
                .map(|_| ())
        }))
    }

    fn identity(&self, def: &FnDef) -> FunctionIdentity {
        FunctionIdentity::new(format!("{}.{}", self.script.name, def.name), def.code.clone())
    }

    fn call_user(&mut self, ctx: &mut ScriptRunContext<'_>, def: &Arc<FnDef>, values: Vec<Value>) -> Result<Value, Halt> {
        match &def.kind {
            FnKind::Plain => self.invoke(ctx, def, values),
            FnKind::Fragment => {
                let script = self.script.clone();
                let body = def.clone();
                let closure: FragmentFn = Arc::new(move |ctx: &mut ScriptRunContext<'_>| {
                    Machine::new(script.clone())
                        .invoke(ctx, &body, values.clone())
                        .map(|_| ())
                });
                ctx.call_fragment(&def.name.text, closure)?;
                Ok(Value::None)
            }
            FnKind::Cached {
                resource,
                ttl_secs,
                max_entries,
            } => {
                let identity = self.identity(def);
                let options = MemoOptions {
                    ttl: ttl_secs.map(Duration::from_secs),
                    max_entries: *max_entries,
                };
                let call_args: Vec<CallArg<'_>> = def
                    .params
                    .iter()
                    .zip(&values)
                    .map(|(param, value)| CallArg::new(&param.text, value))
                    .collect();
                let memo = ctx.memo();
                if *resource {
                    memo.resource_cache(identity, options)
                        .call(ctx, &call_args, |ctx| self.invoke(ctx, def, values.clone()))
                } else {
                    memo.data_cache(identity, options)
                        .call(ctx, &call_args, |ctx| self.invoke(ctx, def, values.clone()))
                }
            }
        }
    }

    fn invoke(&mut self, ctx: &mut ScriptRunContext<'_>, def: &FnDef, values: Vec<Value>) -> Result<Value, Halt> {
        if self.depth >= MAX_CALL_DEPTH {
            return Err(fail(
                &def.name.span,
                "RecursionError",
                format!("`{}` recursed more than {MAX_CALL_DEPTH} calls deep", def.name),
            ));
        }
        self.depth += 1;
        let mut env = Env::with_params(&def.params, values);
        let result = self.statements(ctx, &mut env, &def.body.statements);
        self.depth -= 1;
        match result? {
            Flow::Return(value) => Ok(value),
            Flow::Normal => Ok(Value::None),
        }
    }

    fn clear_cache(
        &mut self,
        ctx: &mut ScriptRunContext<'_>,
        env: &mut Env,
        span: &Span,
        function: &Name,
        args: &[Arg],
    ) -> Result<(), Halt> {
        let Some(def) = self.script.function(&function.text).cloned() else {
            return Err(fail(span, "NameError", format!("there is no function `{function}`")));
        };
        let FnKind::Cached {
            resource,
            ttl_secs,
            max_entries,
        } = def.kind
        else {
            return Err(fail(span, "TypeError", format!("`{function}` is not cached")));
        };
        let values = args
            .iter()
            .map(|arg| self.eval(ctx, env, &arg.value))
            .collect::<Result<Vec<_>, _>>()?;

        let identity = self.identity(&def);
        let options = MemoOptions {
            ttl: ttl_secs.map(Duration::from_secs),
            max_entries,
        };
        let memo = ctx.memo();
        let cached = if resource {
            (*memo.resource_cache(identity, options)).clone()
        } else {
            (*memo.data_cache(identity, options)).clone()
        };
        if values.is_empty() {
            cached.clear();
        } else {
            let call_args: Vec<CallArg<'_>> = def
                .params
                .iter()
                .zip(&values)
                .map(|(param, value)| CallArg::new(&param.text, value))
                .collect();
            cached.clear_entry(&call_args)?;
        }
        Ok(())
    }
}

fn index_value(span: &Span, target: Value, index: Value) -> Result<Value, Halt> {
    let position = match index {
        Value::Int(position) => position,
        other => {
            return Err(fail(
                span,
                "TypeError",
                format!("indices must be ints, not {}", other.type_name()),
            ))
        }
    };
    let resolve = |len: usize| -> Option<usize> {
        let len = len as i64;
        let position = if position < 0 { len + position } else { position };
        (0..len).contains(&position).then_some(position as usize)
    };
    match target {
        Value::List(mut items) => match resolve(items.len()) {
            Some(position) => Ok(items.swap_remove(position)),
            None => Err(fail(span, "IndexError", format!("list index {position} out of range"))),
        },
        Value::Str(text) => {
            let chars: Vec<char> = text.chars().collect();
            match resolve(chars.len()) {
                Some(position) => Ok(Value::Str(chars[position].to_string())),
                None => Err(fail(span, "IndexError", format!("string index {position} out of range"))),
            }
        }
        other => Err(fail(
            span,
            "TypeError",
            format!("{} cannot be indexed", other.type_name()),
        )),
    }
}

fn numeric_eq(left: &Value, right: &Value) -> bool {
    match (left.as_f64(), right.as_f64()) {
        (Some(a), Some(b)) if matches!(left, Value::Float(_)) || matches!(right, Value::Float(_)) => a == b,
        _ => left == right,
    }
}

fn binary(span: &Span, op: BinaryOp, left: Value, right: Value) -> Result<Value, Halt> {
    let mismatch = |left: &Value, right: &Value| {
        fail(
            span,
            "TypeError",
            format!(
                "unsupported operand types for `{}`: {} and {}",
                op.symbol(),
                left.type_name(),
                right.type_name()
            ),
        )
    };
    let overflow = || fail(span, "OverflowError", "integer overflow");

    match op {
        BinaryOp::Eq => return Ok(Value::Bool(numeric_eq(&left, &right))),
        BinaryOp::Ne => return Ok(Value::Bool(!numeric_eq(&left, &right))),
        _ => {}
    }

    match (op, &left, &right) {
        (BinaryOp::Add, Value::Str(a), Value::Str(b)) => Ok(Value::Str(format!("{a}{b}"))),
        (BinaryOp::Add, Value::List(a), Value::List(b)) => {
            Ok(Value::List(a.iter().chain(b).cloned().collect()))
        }
        (BinaryOp::Mul, Value::Str(text), Value::Int(count)) => {
            let count = usize::try_from(*count).unwrap_or(0);
            match text.len().checked_mul(count) {
                Some(len) if len <= MAX_STRING_LEN => Ok(Value::Str(text.repeat(count))),
                _ => Err(fail(span, "OverflowError", "repeated string is too long")),
            }
        }
        (BinaryOp::Lt | BinaryOp::Le | BinaryOp::Gt | BinaryOp::Ge, Value::Str(a), Value::Str(b)) => {
            Ok(Value::Bool(compare(op, a.cmp(b))))
        }
        (_, Value::Int(a), Value::Int(b)) => {
            let (a, b) = (*a, *b);
            match op {
                BinaryOp::Add => a.checked_add(b).map(Value::Int).ok_or_else(overflow),
                BinaryOp::Sub => a.checked_sub(b).map(Value::Int).ok_or_else(overflow),
                BinaryOp::Mul => a.checked_mul(b).map(Value::Int).ok_or_else(overflow),
                BinaryOp::Div | BinaryOp::Rem if b == 0 => {
                    Err(fail(span, "ZeroDivisionError", "division by zero"))
                }
                BinaryOp::Div => a.checked_div(b).map(Value::Int).ok_or_else(overflow),
                BinaryOp::Rem => a.checked_rem(b).map(Value::Int).ok_or_else(overflow),
                _ => Ok(Value::Bool(compare(op, a.cmp(&b)))),
            }
        }
        _ => {
            let (Some(a), Some(b)) = (left.as_f64(), right.as_f64()) else {
                return Err(mismatch(&left, &right));
            };
            match op {
                BinaryOp::Add => Ok(Value::Float(a + b)),
                BinaryOp::Sub => Ok(Value::Float(a - b)),
                BinaryOp::Mul => Ok(Value::Float(a * b)),
                BinaryOp::Div | BinaryOp::Rem if b == 0.0 => {
                    Err(fail(span, "ZeroDivisionError", "division by zero"))
                }
                BinaryOp::Div => Ok(Value::Float(a / b)),
                BinaryOp::Rem => Ok(Value::Float(a % b)),
                _ => match a.partial_cmp(&b) {
                    Some(ordering) => Ok(Value::Bool(compare(op, ordering))),
                    None => Ok(Value::Bool(false)),
                },
            }
        }
    }
}

fn compare(op: BinaryOp, ordering: std::cmp::Ordering) -> bool {
    match op {
        BinaryOp::Lt => ordering.is_lt(),
        BinaryOp::Le => ordering.is_le(),
        BinaryOp::Gt => ordering.is_gt(),
        BinaryOp::Ge => ordering.is_ge(),
        _ => false,
    }
}
