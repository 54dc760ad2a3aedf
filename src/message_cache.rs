//! Content-addressed store of messages already sent to sessions.
//!
//! A large delta is sent in full to a session at most once while it stays
//! fresh; after that the session receives a reference carrying only the hash.
//! Freshness is measured in runs: an entry a session last saw `max_age` runs
//! ago or earlier stops counting for that session.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::hashing::Fingerprint;
use crate::message::{ForwardBody, ForwardMsg};
use crate::session::SessionId;
use crate::stats::{CacheStat, StatsProvider};

/// Only deltas at or above `min_size` serialized bytes are worth caching.
pub fn should_cache(msg: &ForwardMsg, size: usize, min_size: usize) -> bool {
    msg.is_delta() && size >= min_size
}

/// Serializes the body once, stores its hash in `msg` and returns the size.
pub fn populate_hash(msg: &mut ForwardMsg, min_size: usize) -> Result<usize, serde_json::Error> {
    let bytes = msg.body_bytes()?;
    msg.hash = Some(Fingerprint::of_bytes(&bytes));
    msg.metadata.cacheable = should_cache(msg, bytes.len(), min_size);
    Ok(bytes.len())
}

pub fn to_reference(msg: &ForwardMsg) -> Option<ForwardMsg> {
    let hash = msg.hash?;
    Some(ForwardMsg {
        hash: Some(hash),
        metadata: msg.metadata.clone(),
        body: ForwardBody::RefHash { hash },
    })
}

#[derive(Debug)]
struct Entry {
    msg: ForwardMsg,
    byte_length: usize,
    sessions: HashMap<SessionId, u64>,
}

impl Entry {
    fn age(&self, session: &SessionId, run_count: u64) -> Option<u64> {
        self.sessions
            .get(session)
            .map(|sent_at| run_count.saturating_sub(*sent_at))
    }
}

#[derive(Default)]
pub struct MessageCache {
    entries: Mutex<HashMap<Fingerprint, Arc<Mutex<Entry>>>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl MessageCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn entry(&self, hash: &Fingerprint) -> Option<Arc<Mutex<Entry>>> {
        lock(&self.entries).get(hash).cloned()
    }

    /// Records that `session` received `msg` during run `run_count`. Messages
    /// without a hash are ignored.
    pub fn add(&self, msg: &ForwardMsg, session: &SessionId, run_count: u64, byte_length: usize) {
        let Some(hash) = msg.hash else {
            return;
        };
        let entry = lock(&self.entries)
            .entry(hash)
            .or_insert_with(|| {
                Arc::new(Mutex::new(Entry {
                    msg: msg.clone(),
                    byte_length,
                    sessions: HashMap::new(),
                }))
            })
            .clone();
        lock(&*entry).sessions.insert(session.clone(), run_count);
    }

    /// Whether `session` already holds `msg` and it is younger than
    /// `max_age` runs.
    pub fn has_reference(&self, msg: &ForwardMsg, session: &SessionId, run_count: u64, max_age: u64) -> bool {
        let Some(hash) = msg.hash else {
            return false;
        };
        let Some(entry) = self.entry(&hash) else {
            return false;
        };
        let entry = lock(&*entry);
        entry
            .age(session, run_count)
            .is_some_and(|age| age <= max_age)
    }

    pub fn get(&self, hash: &Fingerprint) -> Option<ForwardMsg> {
        self.entry(hash).map(|entry| lock(&*entry).msg.clone())
    }

    /// Forgets what `session` saw more than `max_age` runs ago, and drops
    /// entries no session refers to any more.
    pub fn expire(&self, session: &SessionId, run_count: u64, max_age: u64) -> usize {
        self.retain_sessions(|entry| {
            if entry
                .age(session, run_count)
                .is_some_and(|age| age > max_age)
            {
                entry.sessions.remove(session);
            }
        })
    }

    pub fn remove_session(&self, session: &SessionId) -> usize {
        self.retain_sessions(|entry| {
            entry.sessions.remove(session);
        })
    }

    fn retain_sessions(&self, mut update: impl FnMut(&mut Entry)) -> usize {
        let mut entries = lock(&self.entries);
        let before = entries.len();
        entries.retain(|_, entry| {
            let mut entry = lock(&**entry);
            update(&mut entry);
            !entry.sessions.is_empty()
        });
        before - entries.len()
    }

    pub fn clear(&self) {
        lock(&self.entries).clear();
    }

    pub fn len(&self) -> usize {
        lock(&self.entries).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl StatsProvider for MessageCache {
    fn get_stats(&self) -> Vec<CacheStat> {
        let entries: Vec<_> = lock(&self.entries).values().cloned().collect();
        entries
            .iter()
            .map(|entry| CacheStat::new("message_cache", "", lock(&**entry).byte_length))
            .collect()
    }
}
