use std::any::Any;
use std::ops::Deref;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;

use super::bucket::{CachePayload, MemoBucket, Validator};
use super::{value_key, CallArg, FunctionIdentity, MemoError, OutputTarget};
use crate::hashing::{Fingerprint, HashOverrides};

/// Handle to one cached function's bucket.
#[derive(Clone)]
pub struct CachedFunction {
    identity: FunctionIdentity,
    function_key: Fingerprint,
    bucket: Arc<MemoBucket>,
    overrides: HashOverrides,
}

impl CachedFunction {
    pub(super) fn new(identity: FunctionIdentity, function_key: Fingerprint, bucket: Arc<MemoBucket>) -> Self {
        Self {
            identity,
            function_key,
            bucket,
            overrides: HashOverrides::default(),
        }
    }

    pub fn name(&self) -> &str {
        &self.identity.qualified_name
    }

    pub fn function_key(&self) -> Fingerprint {
        self.function_key
    }

    pub fn value_key(&self, args: &[CallArg<'_>]) -> Result<Fingerprint, MemoError> {
        value_key(self.name(), &self.function_key, args, &self.overrides)
    }

    pub fn bucket(&self) -> &MemoBucket {
        &self.bucket
    }

    pub fn len(&self) -> usize {
        self.bucket.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bucket.is_empty()
    }

    pub fn clear(&self) {
        tracing::debug!(function = %self.name(), "cache cleared");
        self.bucket.clear();
    }

    /// Drops the entry for one argument list. Returns whether there was one.
    pub fn clear_entry(&self, args: &[CallArg<'_>]) -> Result<bool, MemoError> {
        let key = self.value_key(args)?;
        Ok(self.bucket.remove(&key))
    }

    fn with_override<T, F>(mut self, f: F) -> Self
    where
        T: Any,
        F: Fn(&T) -> Result<Vec<u8>, String> + Send + Sync + 'static,
    {
        self.overrides = self.overrides.with(f);
        self
    }
}

/// A cache that stores serialized copies of return values.
#[derive(Clone)]
pub struct DataCache(CachedFunction);

impl DataCache {
    pub(super) fn new(inner: CachedFunction) -> Self {
        Self(inner)
    }

    pub fn with_hash_override<T, F>(self, f: F) -> Self
    where
        T: Any,
        F: Fn(&T) -> Result<Vec<u8>, String> + Send + Sync + 'static,
    {
        Self(self.0.with_override(f))
    }

    pub fn call<V, T, E, F>(&self, target: &mut T, args: &[CallArg<'_>], compute: F) -> Result<V, E>
    where
        V: Serialize + DeserializeOwned,
        T: OutputTarget + ?Sized,
        E: From<MemoError>,
        F: FnOnce(&mut T) -> Result<V, E>,
    {
        let key = self.value_key(args)?;
        let function = self.name();
        let mut fresh = None;
        let payload = self.0.bucket.get_or_compute(key, target, None, |target| {
            let value = compute(target)?;
            let bytes = serde_json::to_vec(&value).map_err(|error| MemoError::UnserializableReturnValue {
                function: function.to_string(),
                reason: error.to_string(),
            })?;
            fresh = Some(value);
            Ok::<_, E>(CachePayload::Data(bytes.into()))
        })?;

        if let Some(value) = fresh {
            return Ok(value);
        }
        match payload {
            CachePayload::Data(bytes) => serde_json::from_slice(&bytes).map_err(|error| {
                MemoError::CorruptedEntry {
                    function: function.to_string(),
                    reason: error.to_string(),
                }
                .into()
            }),
            CachePayload::Resource(_) => Err(MemoError::CorruptedEntry {
                function: function.to_string(),
                reason: "data cache holds a resource".to_string(),
            }
            .into()),
        }
    }
}

impl Deref for DataCache {
    type Target = CachedFunction;

    fn deref(&self) -> &CachedFunction {
        &self.0
    }
}

/// A cache that shares one instance of each return value between callers.
#[derive(Clone)]
pub struct ResourceCache {
    inner: CachedFunction,
    validate: Option<Validator>,
}

impl ResourceCache {
    pub(super) fn new(inner: CachedFunction) -> Self {
        Self {
            inner,
            validate: None,
        }
    }

    pub fn with_hash_override<T, F>(self, f: F) -> Self
    where
        T: Any,
        F: Fn(&T) -> Result<Vec<u8>, String> + Send + Sync + 'static,
    {
        Self {
            inner: self.inner.with_override(f),
            validate: self.validate,
        }
    }

    /// Runs `f` on every hit; a `false` drops the entry and recomputes.
    pub fn with_validate<V, F>(mut self, f: F) -> Self
    where
        V: Any + Send + Sync,
        F: Fn(&V) -> bool + Send + Sync + 'static,
    {
        self.validate = Some(Arc::new(move |payload: &CachePayload| match payload {
            CachePayload::Resource(value) => value.downcast_ref::<V>().is_some_and(&f),
            CachePayload::Data(_) => true,
        }));
        self
    }

    pub fn call<V, T, E, F>(&self, target: &mut T, args: &[CallArg<'_>], compute: F) -> Result<V, E>
    where
        V: Clone + Send + Sync + 'static,
        T: OutputTarget + ?Sized,
        E: From<MemoError>,
        F: FnOnce(&mut T) -> Result<V, E>,
    {
        let key = self.value_key(args)?;
        let payload = self
            .inner
            .bucket
            .get_or_compute(key, target, self.validate.as_ref(), |target| {
                let value = compute(target)?;
                Ok::<_, E>(CachePayload::Resource(Arc::new(value)))
            })?;

        let restored = match &payload {
            CachePayload::Resource(value) => value.downcast_ref::<V>().cloned(),
            CachePayload::Data(_) => None,
        };
        restored.ok_or_else(|| {
            MemoError::CorruptedEntry {
                function: self.name().to_string(),
                reason: format!("stored value is not a `{}`", std::any::type_name::<V>()),
            }
            .into()
        })
    }
}

impl Deref for ResourceCache {
    type Target = CachedFunction;

    fn deref(&self) -> &CachedFunction {
        &self.inner
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::hashing::{HashError, StableHash, StableHasher};
    use crate::memo::{CapturedMessage, MemoOptions, MemoRegistry, RecordedOutput};
    use crate::message::Element;

    fn identity(name: &str) -> FunctionIdentity {
        FunctionIdentity::new(name, format!("fn {name}(x) {{ }}"))
    }

    #[test]
    fn data_cache_returns_fresh_copies_and_replays() {
        let registry = MemoRegistry::new();
        let cache = registry.data_cache(identity("page.load"), MemoOptions::default());
        let mut output = RecordedOutput::new();
        let computed = AtomicUsize::new(0);
        let x = 1_i64;

        let call = |output: &mut RecordedOutput| -> Vec<i64> {
            cache
                .call(output, &[CallArg::new("x", &x)], |output: &mut RecordedOutput| {
                    computed.fetch_add(1, Ordering::SeqCst);
                    output.emit(CapturedMessage::Element(Element::Text {
                        body: "loading".to_string(),
                    }));
                    Ok::<_, MemoError>(vec![1, 2, 3])
                })
                .unwrap()
        };

        let mut first = call(&mut output);
        first.push(4);
        let second = call(&mut output);
        assert_eq!(second, vec![1, 2, 3]);
        assert_eq!(computed.load(Ordering::SeqCst), 1);
        assert_eq!(output.emitted.len(), 2);
    }

    #[test]
    fn unserializable_return_value_fails() {
        struct Opaque;
        impl Serialize for Opaque {
            fn serialize<S: serde::Serializer>(&self, _: S) -> Result<S::Ok, S::Error> {
                Err(serde::ser::Error::custom("opaque"))
            }
        }
        impl<'de> serde::Deserialize<'de> for Opaque {
            fn deserialize<D: serde::Deserializer<'de>>(_: D) -> Result<Self, D::Error> {
                Ok(Opaque)
            }
        }

        let registry = MemoRegistry::new();
        let cache = registry.data_cache(identity("page.open"), MemoOptions::default());
        let mut output = RecordedOutput::new();
        let result = cache.call(&mut output, &[], |_: &mut RecordedOutput| Ok::<_, MemoError>(Opaque));
        assert!(matches!(
            result,
            Err(MemoError::UnserializableReturnValue { .. })
        ));
        assert!(cache.is_empty());
    }

    #[test]
    fn resource_cache_shares_and_validates() {
        let registry = MemoRegistry::new();
        let cache = registry
            .resource_cache(identity("page.connect"), MemoOptions::default())
            .with_validate(|conn: &Arc<AtomicUsize>| conn.load(Ordering::SeqCst) < 2);
        let mut output = RecordedOutput::new();
        let opened = AtomicUsize::new(0);
        let connect = |output: &mut RecordedOutput| -> Arc<AtomicUsize> {
            cache
                .call(output, &[], |_: &mut RecordedOutput| {
                    opened.fetch_add(1, Ordering::SeqCst);
                    Ok::<_, MemoError>(Arc::new(AtomicUsize::new(0)))
                })
                .unwrap()
        };

        let a = connect(&mut output);
        let b = connect(&mut output);
        assert!(Arc::ptr_eq(&a, &b));

        a.store(5, Ordering::SeqCst);
        let c = connect(&mut output);
        assert!(!Arc::ptr_eq(&a, &c));
        assert_eq!(opened.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn clear_entry_forgets_one_argument_list() {
        let registry = MemoRegistry::new();
        let cache = registry.data_cache(identity("page.square"), MemoOptions::default());
        let mut output = RecordedOutput::new();
        for x in [2_i64, 3] {
            let value: i64 = cache
                .call(&mut output, &[CallArg::new("x", &x)], |_: &mut RecordedOutput| {
                    Ok::<_, MemoError>(x * x)
                })
                .unwrap();
            assert_eq!(value, x * x);
        }
        assert_eq!(cache.len(), 2);
        assert_eq!(cache.clear_entry(&[CallArg::new("x", &2_i64)]), Ok(true));
        assert_eq!(cache.len(), 1);
        cache.clear();
        assert!(cache.is_empty());
    }

    #[test]
    fn hash_override_lets_unhashable_types_in() {
        struct Conn(u32);

        impl StableHash for Conn {
            fn stable_hash(&self, hasher: &mut StableHasher<'_>) -> Result<(), HashError> {
                Err(hasher.unhashable("Conn", format!("Conn({})", self.0), "no stable identity"))
            }
        }

        let registry = MemoRegistry::new();
        let plain = registry.data_cache(identity("page.query"), MemoOptions::default());
        let conn = Conn(9);
        assert!(plain.value_key(&[CallArg::new("conn", &conn)]).is_err());

        let with_override = plain.with_hash_override(|conn: &Conn| Ok(conn.0.to_le_bytes().to_vec()));
        let first = with_override.value_key(&[CallArg::new("conn", &conn)]).unwrap();
        let other = Conn(10);
        let second = with_override.value_key(&[CallArg::new("conn", &other)]).unwrap();
        assert_ne!(first, second);
    }
}
