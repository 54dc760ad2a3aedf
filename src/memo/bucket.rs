use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use indexmap::IndexMap;

use super::{CacheKind, CapturedMessage, Clock, MemoError, MemoOptions, OutputTarget};
use crate::hashing::Fingerprint;
use crate::stats::CacheStat;

/// A stored return value. Data payloads are serialized bytes so every hit
/// yields a fresh copy; resource payloads are shared.
#[derive(Clone)]
pub enum CachePayload {
    Data(Arc<[u8]>),
    Resource(Arc<dyn Any + Send + Sync>),
}

impl CachePayload {
    pub fn byte_length(&self) -> usize {
        match self {
            Self::Data(bytes) => bytes.len(),
            Self::Resource(value) => std::mem::size_of_val(&**value),
        }
    }
}

impl fmt::Debug for CachePayload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Data(bytes) => write!(f, "Data({} bytes)", bytes.len()),
            Self::Resource(_) => write!(f, "Resource"),
        }
    }
}

pub type Validator = Arc<dyn Fn(&CachePayload) -> bool + Send + Sync>;

#[derive(Debug, Clone)]
pub struct MemoEntry {
    pub payload: CachePayload,
    pub messages: Arc<[CapturedMessage]>,
    pub created: Instant,
}

/// Entries of one cached function, least recently used first.
pub struct MemoBucket {
    function: String,
    kind: CacheKind,
    options: Mutex<MemoOptions>,
    clock: Arc<dyn Clock>,
    entries: Mutex<IndexMap<Fingerprint, MemoEntry>>,
    key_locks: Mutex<HashMap<Fingerprint, Arc<Mutex<()>>>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl MemoBucket {
    pub fn new(function: impl Into<String>, kind: CacheKind, options: MemoOptions, clock: Arc<dyn Clock>) -> Self {
        Self {
            function: function.into(),
            kind,
            options: Mutex::new(options),
            clock,
            entries: Mutex::new(IndexMap::new()),
            key_locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn function(&self) -> &str {
        &self.function
    }

    pub fn kind(&self) -> CacheKind {
        self.kind
    }

    pub fn options(&self) -> MemoOptions {
        *lock(&self.options)
    }

    pub fn set_options(&self, options: MemoOptions) {
        *lock(&self.options) = options;
        self.evict_overflow(&mut lock(&self.entries));
    }

    /// Returns a live entry and marks it most recently used. Expired entries
    /// and entries failing `validate` are dropped.
    fn lookup(&self, key: &Fingerprint, validate: Option<&Validator>) -> Option<MemoEntry> {
        let ttl = self.options().ttl;
        let mut entries = lock(&self.entries);
        let index = entries.get_index_of(key)?;
        let entry = &entries[index];

        let expired = ttl.is_some_and(|ttl| {
            self.clock.now().saturating_duration_since(entry.created) > ttl
        });
        if expired {
            tracing::debug!(function = %self.function, key = %key.short(), "memo entry expired");
            entries.shift_remove_index(index);
            self.release_key_lock(key);
            return None;
        }
        if let Some(validate) = validate {
            if !validate(&entry.payload) {
                tracing::debug!(function = %self.function, key = %key.short(), "memo entry failed validation");
                entries.shift_remove_index(index);
                self.release_key_lock(key);
                return None;
            }
        }

        let last = entries.len() - 1;
        entries.move_index(index, last);
        entries.get_index(last).map(|(_, entry)| entry.clone())
    }

    fn key_lock(&self, key: &Fingerprint) -> Arc<Mutex<()>> {
        lock(&self.key_locks).entry(*key).or_default().clone()
    }

    /// Forgets the lock for `key` unless some caller still holds or waits on it.
    fn release_key_lock(&self, key: &Fingerprint) {
        let mut key_locks = lock(&self.key_locks);
        if key_locks.get(key).is_some_and(|key_lock| Arc::strong_count(key_lock) == 1) {
            key_locks.remove(key);
        }
    }

    fn evict_overflow(&self, entries: &mut IndexMap<Fingerprint, MemoEntry>) {
        let Some(max_entries) = self.options().max_entries else {
            return;
        };
        while entries.len() > max_entries {
            if let Some((key, _)) = entries.shift_remove_index(0) {
                tracing::debug!(function = %self.function, key = %key.short(), "memo entry evicted");
                self.release_key_lock(&key);
            }
        }
    }

    /// On a hit, replays the recorded output into `target` and returns the
    /// stored payload. On a miss, computes while holding the lock for `key`,
    /// recording everything `compute` emits.
    pub fn get_or_compute<T, E, F>(
        &self,
        key: Fingerprint,
        target: &mut T,
        validate: Option<&Validator>,
        compute: F,
    ) -> Result<CachePayload, E>
    where
        T: OutputTarget + ?Sized,
        E: From<MemoError>,
        F: FnOnce(&mut T) -> Result<CachePayload, E>,
    {
        if let Some(entry) = self.lookup(&key, validate) {
            return Ok(Self::replay(entry, target));
        }

        let result = {
            let key_lock = self.key_lock(&key);
            let _guard = lock(&*key_lock);
            if let Some(entry) = self.lookup(&key, validate) {
                return Ok(Self::replay(entry, target));
            }

            tracing::trace!(function = %self.function, key = %key.short(), "memo miss");
            target.begin_capture();
            let result = compute(target);
            let messages = target.end_capture();
            result.map(|payload| {
                self.insert(
                    key,
                    MemoEntry {
                        payload: payload.clone(),
                        messages: messages.into(),
                        created: self.clock.now(),
                    },
                );
                payload
            })
        };
        if result.is_err() {
            self.release_key_lock(&key);
        }
        result
    }

    fn replay<T: OutputTarget + ?Sized>(entry: MemoEntry, target: &mut T) -> CachePayload {
        for message in entry.messages.iter() {
            target.replay(message);
        }
        entry.payload
    }

    pub fn insert(&self, key: Fingerprint, entry: MemoEntry) {
        let mut entries = lock(&self.entries);
        entries.shift_remove(&key);
        entries.insert(key, entry);
        self.evict_overflow(&mut entries);
    }

    pub fn remove(&self, key: &Fingerprint) -> bool {
        let removed = lock(&self.entries).shift_remove(key).is_some();
        if removed {
            self.release_key_lock(key);
        }
        removed
    }

    pub fn contains(&self, key: &Fingerprint) -> bool {
        lock(&self.entries).contains_key(key)
    }

    pub fn clear(&self) {
        lock(&self.entries).clear();
        lock(&self.key_locks).clear();
    }

    pub fn len(&self) -> usize {
        lock(&self.entries).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> Vec<CacheStat> {
        lock(&self.entries)
            .values()
            .map(|entry| CacheStat::new(self.kind.name(), &self.function, entry.payload.byte_length()))
            .collect()
    }
}
