//! Memoized functions.
//!
//! A cached function owns one [`MemoBucket`] keyed by its *function key*
//! (name and code). Each call hashes its arguments into a *value key*; a hit
//! returns the stored value and replays the elements the original call
//! emitted, a miss computes under a per-key lock so concurrent identical
//! calls run the body once.

use std::any::Any;
use std::time::Duration;

use thiserror::Error;

use crate::hashing::{Fingerprint, Frame, HashError, HashOverrides, StableHash, StableHasher};
use crate::message::{Block, Element};

mod bucket;
mod cached;
mod clock;
mod registry;

pub use bucket::{CachePayload, MemoBucket, MemoEntry, Validator};
pub use cached::{CachedFunction, DataCache, ResourceCache};
pub use clock::{Clock, ManualClock, SystemClock};
pub use registry::MemoRegistry;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FunctionIdentity {
    pub qualified_name: String,
    pub code: String,
}

impl FunctionIdentity {
    pub fn new(qualified_name: impl Into<String>, code: impl Into<String>) -> Self {
        Self {
            qualified_name: qualified_name.into(),
            code: code.into(),
        }
    }

    /// Stable across runs; changes only when the name or the code does.
    pub fn key(&self, kind: CacheKind) -> Fingerprint {
        let overrides = HashOverrides::default();
        let mut hasher = StableHasher::new(&overrides);
        hasher.write_tag(kind.name());
        hasher.write_str(&self.qualified_name);
        hasher.write_str(&self.code);
        hasher.finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CacheKind {
    Data,
    Resource,
}

impl CacheKind {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Data => "cache_data",
            Self::Resource => "cache_resource",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MemoOptions {
    pub ttl: Option<Duration>,
    pub max_entries: Option<usize>,
}

impl MemoOptions {
    /// Fills unset fields from `defaults`.
    pub fn or(self, defaults: MemoOptions) -> Self {
        Self {
            ttl: self.ttl.or(defaults.ttl),
            max_entries: self.max_entries.or(defaults.max_entries),
        }
    }
}

/// Object-safe view of [`StableHash`] so arguments of different types can
/// sit in one slice.
pub trait DynStableHash {
    fn hash_into(&self, hasher: &mut StableHasher<'_>) -> Result<(), HashError>;
    fn type_name(&self) -> &'static str;
}

impl<T: StableHash + Any> DynStableHash for T {
    fn hash_into(&self, hasher: &mut StableHasher<'_>) -> Result<(), HashError> {
        hasher.write(self)
    }

    fn type_name(&self) -> &'static str {
        std::any::type_name::<T>()
    }
}

#[derive(Clone, Copy)]
pub struct CallArg<'a> {
    pub name: &'a str,
    pub value: &'a dyn DynStableHash,
}

impl<'a> CallArg<'a> {
    pub fn new(name: &'a str, value: &'a dyn DynStableHash) -> Self {
        Self { name, value }
    }

    /// Arguments whose name starts with `_` do not take part in the key.
    pub fn is_excluded(&self) -> bool {
        self.name.starts_with('_')
    }
}

pub fn value_key(
    function: &str,
    function_key: &Fingerprint,
    args: &[CallArg<'_>],
    overrides: &HashOverrides,
) -> Result<Fingerprint, MemoError> {
    let mut hasher = StableHasher::new(overrides);
    hasher.write_fingerprint(function_key);
    for arg in args.iter().filter(|arg| !arg.is_excluded()) {
        hasher
            .nested(Frame::Arg(arg.name.to_string()), |hasher| {
                hasher.write_str(arg.name);
                arg.value.hash_into(hasher)
            })
            .map_err(|error| MemoError::unhashable(function, arg, &error))?;
    }
    Ok(hasher.finish())
}

/// An output operation recorded while a cached function computed.
#[derive(Debug, Clone, PartialEq)]
pub enum CapturedMessage {
    Element(Element),
    Block(Block),
    EndBlock,
}

/// Where cached functions send output and where replays go.
pub trait OutputTarget {
    fn begin_capture(&mut self);
    fn end_capture(&mut self) -> Vec<CapturedMessage>;
    fn replay(&mut self, message: &CapturedMessage);
}

/// A target for calls made outside of any run. Replayed and captured output
/// is kept in `emitted`.
#[derive(Debug, Default)]
pub struct RecordedOutput {
    pub emitted: Vec<CapturedMessage>,
    captures: Vec<Vec<CapturedMessage>>,
}

impl RecordedOutput {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn emit(&mut self, message: CapturedMessage) {
        for capture in &mut self.captures {
            capture.push(message.clone());
        }
        self.emitted.push(message);
    }
}

impl OutputTarget for RecordedOutput {
    fn begin_capture(&mut self) {
        self.captures.push(Vec::new());
    }

    fn end_capture(&mut self) -> Vec<CapturedMessage> {
        self.captures.pop().unwrap_or_default()
    }

    fn replay(&mut self, message: &CapturedMessage) {
        self.emit(message.clone());
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum MemoError {
    #[error(
        "Cannot hash argument `{arg_name}` (of type `{type_name}`) in `{function}`: {reason}\n\n\
         To skip this argument, prefix its name with an underscore (`_{arg_name}`), \
         or register a hash override for `{type_name}`.\n\n\
         Object of type {type_name}: {value}\n\n{hash_stack}"
    )]
    UnhashableArgument {
        function: String,
        arg_name: String,
        type_name: String,
        value: String,
        reason: String,
        hash_stack: String,
    },
    #[error(
        "Cannot serialize the return value of `{function}`: {reason}. \
         A resource cache can hold values that cannot be serialized."
    )]
    UnserializableReturnValue { function: String, reason: String },
    #[error("The cached value of `{function}` could not be restored: {reason}")]
    CorruptedEntry { function: String, reason: String },
    #[error("Control `{label}` cannot be declared inside a cached function.")]
    ControlInCachedFunction { label: String },
}

impl MemoError {
    fn unhashable(function: &str, arg: &CallArg<'_>, error: &HashError) -> Self {
        let (type_name, value, reason) = match error {
            HashError::Unhashable {
                type_name,
                value,
                reason,
                ..
            } => (type_name.clone(), value.clone(), reason.clone()),
            HashError::OverrideFailed {
                type_name, reason, ..
            } => (type_name.to_string(), String::from("?"), reason.clone()),
            HashError::Poisoned { type_name, .. } => (
                type_name.to_string(),
                String::from("?"),
                error.to_string(),
            ),
        };
        Self::UnhashableArgument {
            function: function.to_string(),
            arg_name: arg.name.to_string(),
            type_name,
            value,
            reason,
            hash_stack: error.render_stack(),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::UnhashableArgument { .. } => "UnhashableArgument",
            Self::UnserializableReturnValue { .. } => "UnserializableReturnValue",
            Self::CorruptedEntry { .. } => "CacheError",
            Self::ControlInCachedFunction { .. } => "CachedControlError",
        }
    }
}
