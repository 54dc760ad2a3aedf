use std::sync::Arc;
use std::time::Duration;

use super::value::{Handle, Value};
use crate::controls::{ControlId, ControlKind, ControlSpec, ControlValue};
use crate::message::Element;
use crate::run_context::{ControlCallback, ControlRequest, Halt, ScriptRunContext};

pub const ON_CHANGE: &str = "on_change";

const MAX_RANGE: i64 = 1_000_000;

const NONE: &Value = &Value::None;

/// Accepted positional argument counts and keyword names of a builtin.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Signature {
    pub min: usize,
    pub max: usize,
    pub keywords: &'static [&'static str],
}

pub fn signature(name: &str) -> Option<Signature> {
    let (min, max, keywords): (usize, usize, &'static [&'static str]) = match name {
        "title" | "header" | "text" | "markdown" | "error" => (1, 1, &[]),
        "write" => (1, usize::MAX, &[]),
        "image" => (1, 1, &["mimetype"]),
        "checkbox" | "text_input" => (1, 1, &["value", "key", ON_CHANGE]),
        "slider" => (1, 1, &["min", "max", "value", "key", ON_CHANGE]),
        "button" => (1, 1, &["key", ON_CHANGE]),
        "selectbox" => (2, 2, &["index", "key", ON_CHANGE]),
        "sleep" | "len" | "str" | "int" | "connection" => (1, 1, &[]),
        "range" => (1, 2, &[]),
        "append" | "set_state" => (2, 2, &[]),
        "state" => (1, 1, &["default"]),
        _ => return None,
    };
    Some(Signature { min, max, keywords })
}

/// An evaluated builtin call.
pub struct BuiltinCall<'a> {
    pub name: &'a str,
    /// Source position of the call, part of unkeyed control identity.
    pub site: String,
    pub args: Vec<Value>,
    pub keywords: Vec<(String, Value)>,
    pub on_change: Option<ControlCallback>,
}

fn type_error(message: impl Into<String>) -> Halt {
    Halt::exception("TypeError", message)
}

fn value_error(message: impl Into<String>) -> Halt {
    Halt::exception("ValueError", message)
}

impl BuiltinCall<'_> {
    fn arg(&self, index: usize) -> &Value {
        self.args.get(index).unwrap_or(NONE)
    }

    fn keyword(&self, name: &str) -> Option<&Value> {
        self.keywords
            .iter()
            .find(|(keyword, _)| keyword == name)
            .map(|(_, value)| value)
    }

    fn text(&self, index: usize) -> String {
        self.arg(index).to_string()
    }

    fn int(&self, value: &Value, what: &str) -> Result<i64, Halt> {
        match value {
            Value::Int(value) => Ok(*value),
            Value::Bool(value) => Ok(*value as i64),
            other => Err(type_error(format!(
                "`{}` expects an int for {what}, got {}",
                self.name,
                other.type_name()
            ))),
        }
    }

    fn int_keyword(&self, name: &str, default: i64) -> Result<i64, Halt> {
        match self.keyword(name) {
            Some(value) => self.int(value, &format!("`{name}`")),
            None => Ok(default),
        }
    }

    fn user_key(&self) -> Option<String> {
        self.keyword("key").map(Value::to_string)
    }
}

pub fn call(ctx: &mut ScriptRunContext<'_>, call: BuiltinCall<'_>) -> Result<Value, Halt> {
    match call.name {
        "title" => emit(ctx, Element::Title { body: call.text(0) }),
        "header" => emit(ctx, Element::Header { body: call.text(0) }),
        "text" => emit(ctx, Element::Text { body: call.text(0) }),
        "markdown" => emit(ctx, Element::Markdown { body: call.text(0) }),
        "error" => emit(ctx, Element::exception("Error", call.text(0))),
        "write" => {
            for value in &call.args {
                let element = match value {
                    Value::Str(body) => Element::Markdown { body: body.clone() },
                    other => Element::Text {
                        body: other.to_string(),
                    },
                };
                ctx.emit_element(element);
            }
            Ok(Value::None)
        }
        "image" => {
            let Value::Str(data) = call.arg(0) else {
                return Err(type_error("`image` expects its data as a str"));
            };
            let mimetype = call
                .keyword("mimetype")
                .map(Value::to_string)
                .unwrap_or_else(|| "image/png".to_string());
            let url = ctx.add_media(data.as_bytes(), &mimetype);
            emit(ctx, Element::Image { url, mimetype })
        }
        "checkbox" => checkbox(ctx, &call),
        "slider" => slider(ctx, &call),
        "text_input" => text_input(ctx, &call),
        "button" => button(ctx, &call),
        "selectbox" => selectbox(ctx, &call),
        "sleep" => {
            let millis = match call.arg(0) {
                Value::Int(value) => *value as f64,
                Value::Float(value) => *value,
                other => return Err(type_error(format!("`sleep` expects milliseconds, got {}", other.type_name()))),
            };
            if !(millis >= 0.0 && millis.is_finite()) {
                return Err(value_error("`sleep` needs a non-negative duration"));
            }
            let duration = Duration::try_from_secs_f64(millis / 1000.0)
                .map_err(|_| value_error(format!("`sleep` duration of {millis} ms is too long")))?;
            ctx.sleep(duration)?;
            Ok(Value::None)
        }
        "len" => match call.arg(0) {
            Value::Str(text) => Ok(Value::Int(text.chars().count() as i64)),
            Value::List(items) => Ok(Value::Int(items.len() as i64)),
            other => Err(type_error(format!("{} has no length", other.type_name()))),
        },
        "str" => Ok(Value::Str(call.text(0))),
        "int" => match call.arg(0) {
            Value::Int(value) => Ok(Value::Int(*value)),
            Value::Bool(value) => Ok(Value::Int(*value as i64)),
            Value::Float(value) if value.is_finite() => Ok(Value::Int(value.trunc() as i64)),
            Value::Str(text) => text
                .trim()
                .parse()
                .map(Value::Int)
                .map_err(|_| value_error(format!("cannot convert {text:?} to an int"))),
            other => Err(type_error(format!("cannot convert {} to an int", other.type_name()))),
        },
        "range" => {
            let (start, end) = match call.args.len() {
                1 => (0, call.int(call.arg(0), "the end")?),
                _ => (call.int(call.arg(0), "the start")?, call.int(call.arg(1), "the end")?),
            };
            if end.saturating_sub(start) > MAX_RANGE {
                return Err(value_error(format!("range of more than {MAX_RANGE} items")));
            }
            Ok(Value::List((start..end).map(Value::Int).collect()))
        }
        "append" => match call.arg(0) {
            Value::List(items) => {
                let mut items = items.clone();
                items.push(call.arg(1).clone());
                Ok(Value::List(items))
            }
            other => Err(type_error(format!("cannot append to {}", other.type_name()))),
        },
        "connection" => {
            let name = call.text(0);
            tracing::debug!(session_id = %ctx.session_id(), %name, "opening connection");
            Ok(Value::Handle(Arc::new(Handle::open("connection", name))))
        }
        "state" => {
            let stored = ctx
                .user_value(&call.text(0))
                .and_then(|json| serde_json::from_value::<Value>(json).ok());
            Ok(stored.unwrap_or_else(|| call.keyword("default").cloned().unwrap_or(Value::None)))
        }
        "set_state" => {
            let json = serde_json::to_value(call.arg(1))
                .map_err(|_| type_error(format!("cannot store {} in session state", call.arg(1).type_name())))?;
            ctx.set_user_value(&call.text(0), json);
            Ok(Value::None)
        }
        other => Err(Halt::exception("NameError", format!("there is no builtin `{other}`"))),
    }
}

fn emit(ctx: &mut ScriptRunContext<'_>, element: Element) -> Result<Value, Halt> {
    ctx.emit_element(element);
    Ok(Value::None)
}

fn declare(
    ctx: &mut ScriptRunContext<'_>,
    call: &BuiltinCall<'_>,
    kind: ControlKind,
    default: ControlValue,
    options: &[String],
) -> Result<(ControlId, String, ControlValue), Halt> {
    let label = call.text(0);
    let key = call.user_key();
    let id = ControlSpec {
        kind,
        site: &call.site,
        label: &label,
        default: &default,
        options,
        user_key: key.as_deref(),
    }
    .id();
    let value = ctx.declare_control(ControlRequest {
        id: id.clone(),
        kind,
        label: label.clone(),
        default,
        on_change: call.on_change.clone(),
    })?;
    Ok((id, label, value))
}

fn checkbox(ctx: &mut ScriptRunContext<'_>, call: &BuiltinCall<'_>) -> Result<Value, Halt> {
    let default = call.keyword("value").is_some_and(Value::is_truthy);
    let (id, label, value) = declare(ctx, call, ControlKind::Checkbox, ControlValue::Bool(default), &[])?;
    let value = value.as_bool().unwrap_or(default);
    ctx.emit_element(Element::Checkbox {
        id: id.to_string(),
        label,
        value,
    });
    Ok(Value::Bool(value))
}

fn slider(ctx: &mut ScriptRunContext<'_>, call: &BuiltinCall<'_>) -> Result<Value, Halt> {
    let min = call.int_keyword("min", 0)?;
    let max = call.int_keyword("max", 100)?;
    if min > max {
        return Err(value_error(format!("slider minimum {min} is above its maximum {max}")));
    }
    let default = call.int_keyword("value", min)?.clamp(min, max);
    let bounds = [min.to_string(), max.to_string()];
    let (id, label, value) = declare(ctx, call, ControlKind::Slider, ControlValue::Int(default), &bounds)?;
    let value = value.as_rounded_int().unwrap_or(default).clamp(min, max);
    ctx.emit_element(Element::Slider {
        id: id.to_string(),
        label,
        min,
        max,
        value,
    });
    Ok(Value::Int(value))
}

fn text_input(ctx: &mut ScriptRunContext<'_>, call: &BuiltinCall<'_>) -> Result<Value, Halt> {
    let default = call.keyword("value").map(Value::to_string).unwrap_or_default();
    let (id, label, value) = declare(
        ctx,
        call,
        ControlKind::TextInput,
        ControlValue::Text(default.clone()),
        &[],
    )?;
    let value = match value {
        ControlValue::Text(text) => text,
        _ => default,
    };
    ctx.emit_element(Element::TextInput {
        id: id.to_string(),
        label,
        value: value.clone(),
    });
    Ok(Value::Str(value))
}

fn button(ctx: &mut ScriptRunContext<'_>, call: &BuiltinCall<'_>) -> Result<Value, Halt> {
    let (id, label, value) = declare(ctx, call, ControlKind::Button, ControlValue::Bool(false), &[])?;
    ctx.emit_element(Element::Button {
        id: id.to_string(),
        label,
    });
    Ok(Value::Bool(value.as_bool().unwrap_or(false)))
}

fn selectbox(ctx: &mut ScriptRunContext<'_>, call: &BuiltinCall<'_>) -> Result<Value, Halt> {
    let Value::List(items) = call.arg(1) else {
        return Err(type_error("`selectbox` expects its options as a list"));
    };
    if items.is_empty() {
        return Err(value_error("`selectbox` needs at least one option"));
    }
    let options: Vec<String> = items.iter().map(Value::to_string).collect();
    let last = options.len() as i64 - 1;
    let default = call.int_keyword("index", 0)?.clamp(0, last);
    let (id, label, value) = declare(ctx, call, ControlKind::Selectbox, ControlValue::Int(default), &options)?;
    let index = value.as_int().unwrap_or(default).clamp(0, last) as usize;
    ctx.emit_element(Element::Selectbox {
        id: id.to_string(),
        label,
        options,
        index,
    });
    Ok(items[index].clone())
}
