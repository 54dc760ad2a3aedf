//! Stable fingerprints of arbitrary values.
//!
//! A value participates by implementing [`StableHash`], a closed capability
//! that feeds a [`StableHasher`]. Callers can replace the hashing of specific
//! types through [`HashOverrides`], keyed by [`TypeId`]. Shared values (`Arc`)
//! are hashed once per hasher and cycles through them terminate with a
//! back-reference marker.

use std::any::{Any, TypeId};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::fmt::{self, Display};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use indexmap::IndexMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};
use thiserror::Error;

#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Fingerprint([u8; 32]);

impl Fingerprint {
    pub fn of_bytes(bytes: &[u8]) -> Self {
        Self(Sha256::digest(bytes).into())
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(text: &str) -> Option<Self> {
        let bytes = hex::decode(text).ok()?;
        let bytes: [u8; 32] = bytes.try_into().ok()?;
        Some(Self(bytes))
    }

    pub fn short(&self) -> String {
        hex::encode(&self.0[..6])
    }
}

impl Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl fmt::Debug for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Fingerprint({})", self.short())
    }
}

impl Serialize for Fingerprint {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for Fingerprint {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        Self::from_hex(&text)
            .ok_or_else(|| serde::de::Error::custom("expected 64 hex characters"))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Type(&'static str),
    Index(usize),
    Key(String),
    Arg(String),
}

impl Display for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Type(name) => write!(f, "{name}"),
            Self::Index(index) => write!(f, "[{index}]"),
            Self::Key(key) => write!(f, "[{key}]"),
            Self::Arg(name) => write!(f, "argument `{name}`"),
        }
    }
}

#[derive(Debug, Clone, Error)]
pub enum HashError {
    #[error("cannot hash object of type `{type_name}` ({value}): {reason}")]
    Unhashable {
        type_name: String,
        value: String,
        reason: String,
        stack: Vec<Frame>,
    },
    #[error("hash override for `{type_name}` failed: {reason}")]
    OverrideFailed {
        type_name: &'static str,
        reason: String,
        stack: Vec<Frame>,
    },
    #[error("lock guarding `{type_name}` is poisoned")]
    Poisoned {
        type_name: &'static str,
        stack: Vec<Frame>,
    },
}

impl HashError {
    pub fn stack(&self) -> &[Frame] {
        match self {
            Self::Unhashable { stack, .. }
            | Self::OverrideFailed { stack, .. }
            | Self::Poisoned { stack, .. } => stack,
        }
    }

    /// Renders the hash stack as an indented, outermost-first listing.
    pub fn render_stack(&self) -> String {
        let mut out = String::new();
        for (depth, frame) in self.stack().iter().enumerate() {
            out.push_str(&"  ".repeat(depth));
            out.push_str(&frame.to_string());
            out.push('\n');
        }
        out
    }
}

pub trait StableHash {
    fn stable_hash(&self, hasher: &mut StableHasher<'_>) -> Result<(), HashError>;
}

pub type OverrideFn = Arc<dyn Fn(&dyn Any) -> Result<Vec<u8>, String> + Send + Sync>;

#[derive(Clone, Default)]
pub struct HashOverrides {
    by_type: HashMap<TypeId, (&'static str, OverrideFn)>,
}

impl HashOverrides {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `f` as the hashing of every `T` reached while fingerprinting.
    pub fn with<T, F>(mut self, f: F) -> Self
    where
        T: Any,
        F: Fn(&T) -> Result<Vec<u8>, String> + Send + Sync + 'static,
    {
        let erased: OverrideFn = Arc::new(move |value: &dyn Any| match value.downcast_ref::<T>() {
            Some(value) => f(value),
            None => Err("override called with a value of the wrong type".to_string()),
        });
        self.by_type
            .insert(TypeId::of::<T>(), (std::any::type_name::<T>(), erased));
        self
    }

    pub fn is_empty(&self) -> bool {
        self.by_type.is_empty()
    }

    pub fn len(&self) -> usize {
        self.by_type.len()
    }

    fn get(&self, id: TypeId) -> Option<&(&'static str, OverrideFn)> {
        self.by_type.get(&id)
    }
}

impl fmt::Debug for HashOverrides {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(self.by_type.values().map(|(name, _)| name))
            .finish()
    }
}

pub struct StableHasher<'o> {
    state: Sha256,
    overrides: &'o HashOverrides,
    stack: Vec<Frame>,
    in_progress: Vec<usize>,
    memo: HashMap<usize, Fingerprint>,
}

impl<'o> StableHasher<'o> {
    pub fn new(overrides: &'o HashOverrides) -> Self {
        Self {
            state: Sha256::new(),
            overrides,
            stack: Vec::new(),
            in_progress: Vec::new(),
            memo: HashMap::new(),
        }
    }

    pub fn write<T: StableHash + Any>(&mut self, value: &T) -> Result<(), HashError> {
        let overrides = self.overrides;
        if let Some((type_name, f)) = overrides.get(TypeId::of::<T>()) {
            let type_name = *type_name;
            let bytes = f(value as &dyn Any).map_err(|reason| HashError::OverrideFailed {
                type_name,
                reason,
                stack: self.stack_with(Frame::Type(type_name)),
            })?;
            self.write_tag("override");
            self.write_bytes(&bytes);
            return Ok(());
        }
        value.stable_hash(self)
    }

    pub fn write_tag(&mut self, tag: &str) {
        self.write_bytes(tag.as_bytes());
    }

    pub fn write_bytes(&mut self, bytes: &[u8]) {
        self.state.update((bytes.len() as u64).to_le_bytes());
        self.state.update(bytes);
    }

    pub fn write_u64(&mut self, value: u64) {
        self.state.update(value.to_le_bytes());
    }

    pub fn write_i64(&mut self, value: i64) {
        self.state.update(value.to_le_bytes());
    }

    pub fn write_f64(&mut self, value: f64) {
        self.state.update(value.to_bits().to_le_bytes());
    }

    pub fn write_str(&mut self, value: &str) {
        self.write_bytes(value.as_bytes());
    }

    pub fn write_fingerprint(&mut self, value: &Fingerprint) {
        self.state.update(value.0);
    }

    /// Runs `f` with `frame` on the hash stack, so failures can say where
    /// inside the value they happened.
    pub fn nested<R>(
        &mut self,
        frame: Frame,
        f: impl FnOnce(&mut Self) -> Result<R, HashError>,
    ) -> Result<R, HashError> {
        self.stack.push(frame);
        let result = f(self);
        self.stack.pop();
        result
    }

    /// Hashes a value reachable through a shared pointer. Each address is
    /// hashed once per hasher; re-entering an address that is still being
    /// hashed writes a back-reference instead of recursing.
    pub fn shared<T: ?Sized>(
        &mut self,
        ptr: *const T,
        f: impl FnOnce(&mut Self) -> Result<(), HashError>,
    ) -> Result<(), HashError> {
        let addr = ptr as *const () as usize;
        if let Some(depth) = self.in_progress.iter().position(|a| *a == addr) {
            self.write_tag("cycle");
            self.write_u64(depth as u64);
            return Ok(());
        }
        if let Some(fingerprint) = self.memo.get(&addr).copied() {
            self.write_tag("shared");
            self.write_fingerprint(&fingerprint);
            return Ok(());
        }

        self.in_progress.push(addr);
        let parent = std::mem::take(&mut self.state);
        let result = f(self);
        let child = std::mem::replace(&mut self.state, parent);
        self.in_progress.pop();
        result?;

        let fingerprint = Fingerprint(child.finalize().into());
        self.memo.insert(addr, fingerprint);
        self.write_tag("shared");
        self.write_fingerprint(&fingerprint);
        Ok(())
    }

    /// Hashes `f` into a standalone fingerprint, used for order-independent
    /// collections.
    pub fn sub_fingerprint(
        &mut self,
        f: impl FnOnce(&mut Self) -> Result<(), HashError>,
    ) -> Result<Fingerprint, HashError> {
        let parent = std::mem::take(&mut self.state);
        let result = f(self);
        let child = std::mem::replace(&mut self.state, parent);
        result?;
        Ok(Fingerprint(child.finalize().into()))
    }

    pub fn unhashable(
        &self,
        type_name: impl Into<String>,
        value: impl Into<String>,
        reason: impl Into<String>,
    ) -> HashError {
        let type_name = type_name.into();
        HashError::Unhashable {
            value: value.into(),
            reason: reason.into(),
            stack: self.stack.clone(),
            type_name,
        }
    }

    fn poisoned(&self, type_name: &'static str) -> HashError {
        HashError::Poisoned {
            type_name,
            stack: self.stack_with(Frame::Type(type_name)),
        }
    }

    fn stack_with(&self, frame: Frame) -> Vec<Frame> {
        let mut stack = self.stack.clone();
        stack.push(frame);
        stack
    }

    pub fn finish(self) -> Fingerprint {
        Fingerprint(self.state.finalize().into())
    }
}

pub fn fingerprint<T: StableHash + Any>(value: &T) -> Result<Fingerprint, HashError> {
    fingerprint_with(value, &HashOverrides::default())
}

pub fn fingerprint_with<T: StableHash + Any>(
    value: &T,
    overrides: &HashOverrides,
) -> Result<Fingerprint, HashError> {
    let mut hasher = StableHasher::new(overrides);
    hasher.write(value)?;
    Ok(hasher.finish())
}

macro_rules! stable_hash_unsigned {
    ($($ty:ty),*) => {
        $(impl StableHash for $ty {
            fn stable_hash(&self, hasher: &mut StableHasher<'_>) -> Result<(), HashError> {
                hasher.write_tag("uint");
                hasher.write_u64(*self as u64);
                Ok(())
            }
        })*
    };
}

macro_rules! stable_hash_signed {
    ($($ty:ty),*) => {
        $(impl StableHash for $ty {
            fn stable_hash(&self, hasher: &mut StableHasher<'_>) -> Result<(), HashError> {
                hasher.write_tag("int");
                hasher.write_i64(*self as i64);
                Ok(())
            }
        })*
    };
}

stable_hash_unsigned!(u8, u16, u32, u64, usize);
stable_hash_signed!(i8, i16, i32, i64, isize);

impl StableHash for f64 {
    fn stable_hash(&self, hasher: &mut StableHasher<'_>) -> Result<(), HashError> {
        hasher.write_tag("float");
        hasher.write_f64(*self);
        Ok(())
    }
}

impl StableHash for f32 {
    fn stable_hash(&self, hasher: &mut StableHasher<'_>) -> Result<(), HashError> {
        hasher.write_tag("float");
        hasher.write_f64(*self as f64);
        Ok(())
    }
}

impl StableHash for bool {
    fn stable_hash(&self, hasher: &mut StableHasher<'_>) -> Result<(), HashError> {
        hasher.write_tag("bool");
        hasher.write_u64(*self as u64);
        Ok(())
    }
}

impl StableHash for char {
    fn stable_hash(&self, hasher: &mut StableHasher<'_>) -> Result<(), HashError> {
        hasher.write_tag("char");
        hasher.write_u64(*self as u64);
        Ok(())
    }
}

impl StableHash for () {
    fn stable_hash(&self, hasher: &mut StableHasher<'_>) -> Result<(), HashError> {
        hasher.write_tag("unit");
        Ok(())
    }
}

impl StableHash for String {
    fn stable_hash(&self, hasher: &mut StableHasher<'_>) -> Result<(), HashError> {
        hasher.write_tag("str");
        hasher.write_str(self);
        Ok(())
    }
}

impl StableHash for &'static str {
    fn stable_hash(&self, hasher: &mut StableHasher<'_>) -> Result<(), HashError> {
        hasher.write_tag("str");
        hasher.write_str(self);
        Ok(())
    }
}

impl StableHash for Duration {
    fn stable_hash(&self, hasher: &mut StableHasher<'_>) -> Result<(), HashError> {
        hasher.write_tag("duration");
        hasher.write_u64(self.as_secs());
        hasher.write_u64(self.subsec_nanos() as u64);
        Ok(())
    }
}

impl StableHash for Fingerprint {
    fn stable_hash(&self, hasher: &mut StableHasher<'_>) -> Result<(), HashError> {
        hasher.write_tag("fingerprint");
        hasher.write_fingerprint(self);
        Ok(())
    }
}

impl<T: StableHash + Any> StableHash for Option<T> {
    fn stable_hash(&self, hasher: &mut StableHasher<'_>) -> Result<(), HashError> {
        match self {
            None => {
                hasher.write_tag("none");
                Ok(())
            }
            Some(value) => {
                hasher.write_tag("some");
                hasher.write(value)
            }
        }
    }
}

impl<T: StableHash + Any> StableHash for Box<T> {
    fn stable_hash(&self, hasher: &mut StableHasher<'_>) -> Result<(), HashError> {
        hasher.write(&**self)
    }
}

impl<T: StableHash + Any> StableHash for Vec<T> {
    fn stable_hash(&self, hasher: &mut StableHasher<'_>) -> Result<(), HashError> {
        hasher.write_tag("list");
        hasher.write_u64(self.len() as u64);
        for (index, item) in self.iter().enumerate() {
            hasher.nested(Frame::Index(index), |h| h.write(item))?;
        }
        Ok(())
    }
}

impl<A: StableHash + Any, B: StableHash + Any> StableHash for (A, B) {
    fn stable_hash(&self, hasher: &mut StableHasher<'_>) -> Result<(), HashError> {
        hasher.write_tag("tuple2");
        hasher.nested(Frame::Index(0), |h| h.write(&self.0))?;
        hasher.nested(Frame::Index(1), |h| h.write(&self.1))
    }
}

impl<A: StableHash + Any, B: StableHash + Any, C: StableHash + Any> StableHash for (A, B, C) {
    fn stable_hash(&self, hasher: &mut StableHasher<'_>) -> Result<(), HashError> {
        hasher.write_tag("tuple3");
        hasher.nested(Frame::Index(0), |h| h.write(&self.0))?;
        hasher.nested(Frame::Index(1), |h| h.write(&self.1))?;
        hasher.nested(Frame::Index(2), |h| h.write(&self.2))
    }
}

impl<K: StableHash + Any + fmt::Debug, V: StableHash + Any> StableHash for BTreeMap<K, V> {
    fn stable_hash(&self, hasher: &mut StableHasher<'_>) -> Result<(), HashError> {
        hasher.write_tag("map");
        hasher.write_u64(self.len() as u64);
        for (key, value) in self {
            hasher.nested(Frame::Key(format!("{key:?}")), |h| {
                h.write(key)?;
                h.write(value)
            })?;
        }
        Ok(())
    }
}

impl<K: StableHash + Any + fmt::Debug, V: StableHash + Any> StableHash for IndexMap<K, V> {
    fn stable_hash(&self, hasher: &mut StableHasher<'_>) -> Result<(), HashError> {
        hasher.write_tag("map");
        hasher.write_u64(self.len() as u64);
        for (key, value) in self {
            hasher.nested(Frame::Key(format!("{key:?}")), |h| {
                h.write(key)?;
                h.write(value)
            })?;
        }
        Ok(())
    }
}

impl<K: StableHash + Any + fmt::Debug, V: StableHash + Any, S: Any> StableHash
    for HashMap<K, V, S>
{
    fn stable_hash(&self, hasher: &mut StableHasher<'_>) -> Result<(), HashError> {
        let mut entries = Vec::with_capacity(self.len());
        for (key, value) in self {
            let entry = hasher.nested(Frame::Key(format!("{key:?}")), |h| {
                h.sub_fingerprint(|h| {
                    h.write(key)?;
                    h.write(value)
                })
            })?;
            entries.push(entry);
        }
        entries.sort();
        hasher.write_tag("map");
        hasher.write_u64(entries.len() as u64);
        for entry in &entries {
            hasher.write_fingerprint(entry);
        }
        Ok(())
    }
}

impl<T: StableHash + Any> StableHash for BTreeSet<T> {
    fn stable_hash(&self, hasher: &mut StableHasher<'_>) -> Result<(), HashError> {
        hasher.write_tag("set");
        hasher.write_u64(self.len() as u64);
        for (index, item) in self.iter().enumerate() {
            hasher.nested(Frame::Index(index), |h| h.write(item))?;
        }
        Ok(())
    }
}

impl<T: StableHash + Any, S: Any> StableHash for HashSet<T, S> {
    fn stable_hash(&self, hasher: &mut StableHasher<'_>) -> Result<(), HashError> {
        let mut items = Vec::with_capacity(self.len());
        for item in self {
            items.push(hasher.sub_fingerprint(|h| h.write(item))?);
        }
        items.sort();
        hasher.write_tag("set");
        hasher.write_u64(items.len() as u64);
        for item in &items {
            hasher.write_fingerprint(item);
        }
        Ok(())
    }
}

impl<T: StableHash + Any> StableHash for Arc<T> {
    fn stable_hash(&self, hasher: &mut StableHasher<'_>) -> Result<(), HashError> {
        hasher.shared(Arc::as_ptr(self), |h| h.write(&**self))
    }
}

impl<T: StableHash + Any> StableHash for Mutex<T> {
    fn stable_hash(&self, hasher: &mut StableHasher<'_>) -> Result<(), HashError> {
        let guard = self
            .lock()
            .map_err(|_| hasher.poisoned(std::any::type_name::<T>()))?;
        hasher.write(&*guard)
    }
}

impl<T: StableHash + Any> StableHash for RwLock<T> {
    fn stable_hash(&self, hasher: &mut StableHasher<'_>) -> Result<(), HashError> {
        let guard = self
            .read()
            .map_err(|_| hasher.poisoned(std::any::type_name::<T>()))?;
        hasher.write(&*guard)
    }
}
