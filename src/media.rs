use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::hashing::Fingerprint;
use crate::stats::{CacheStat, StatsProvider};

#[derive(Debug, Clone)]
pub struct MediaFile {
    pub bytes: Arc<[u8]>,
    pub mimetype: String,
}

#[derive(Debug, Default)]
struct Inner {
    files: HashMap<String, MediaFile>,
    used_this_run: HashSet<String>,
}

/// In-memory media of one session. A file stays alive while the most recent
/// full run referenced it.
#[derive(Debug, Default)]
pub struct MediaStore {
    inner: Mutex<Inner>,
}

fn extension(mimetype: &str) -> &str {
    match mimetype {
        "image/png" => "png",
        "image/jpeg" => "jpg",
        "image/gif" => "gif",
        "image/svg+xml" => "svg",
        "text/plain" => "txt",
        _ => "bin",
    }
}

impl MediaStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Stores `bytes` and returns the url the client fetches them from.
    pub fn add(&self, bytes: &[u8], mimetype: &str) -> String {
        let mut key = Vec::with_capacity(bytes.len() + mimetype.len() + 1);
        key.extend_from_slice(mimetype.as_bytes());
        key.push(0);
        key.extend_from_slice(bytes);
        let id = format!("{}.{}", Fingerprint::of_bytes(&key).short(), extension(mimetype));

        let mut inner = self.lock();
        inner.files.entry(id.clone()).or_insert_with(|| MediaFile {
            bytes: Arc::from(bytes),
            mimetype: mimetype.to_string(),
        });
        inner.used_this_run.insert(id.clone());
        format!("/media/{id}")
    }

    pub fn get(&self, id: &str) -> Option<MediaFile> {
        self.lock().files.get(id).cloned()
    }

    pub fn begin_run(&self) {
        self.lock().used_this_run.clear();
    }

    /// Drops files the run did not reference. Fragment runs only add.
    pub fn end_run(&self, full_run: bool) -> usize {
        let mut inner = self.lock();
        let Inner { files, used_this_run } = &mut *inner;
        let before = files.len();
        if full_run {
            files.retain(|id, _| used_this_run.contains(id));
        }
        used_this_run.clear();
        before - files.len()
    }

    pub fn clear(&self) {
        let mut inner = self.lock();
        inner.files.clear();
        inner.used_this_run.clear();
    }

    pub fn len(&self) -> usize {
        self.lock().files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl StatsProvider for MediaStore {
    fn get_stats(&self) -> Vec<CacheStat> {
        self.lock()
            .files
            .iter()
            .map(|(id, file)| CacheStat::new("media", id.as_str(), file.bytes.len()))
            .collect()
    }
}
