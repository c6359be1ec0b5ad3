use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::Duration;

use thiserror::Error;

use crate::config::StoreConfig;

use super::document::{FeedDocument, FeedId};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("malformed feed document: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("unknown feed {0}")]
    UnknownFeed(FeedId),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CounterKey {
    /// `global_car_count`
    Global,
    /// A feed's running `count`.
    Feed(FeedId),
}

struct Inner {
    path: PathBuf,
    /// Document whose last write did not reach disk. While set it is the
    /// authoritative state and the file is stale.
    pending: Mutex<Option<FeedDocument>>,
    write_attempts: u32,
    write_backoff: Duration,
}

/// File-backed counter state shared by every feed.
///
/// Each operation is one load-mutate-store cycle under a single lock, so
/// concurrent updates never interleave. Two separate calls are two separate
/// critical sections.
#[derive(Clone)]
pub struct CounterStore {
    inner: Arc<Inner>,
}

impl CounterStore {
    /// Opens the document at `path`, creating an empty one if it is missing.
    pub fn open<P: AsRef<Path>>(path: P, config: &StoreConfig) -> Result<Self, StoreError> {
        let store = Self {
            inner: Arc::new(Inner {
                path: path.as_ref().to_path_buf(),
                pending: Mutex::new(None),
                write_attempts: config.write_attempts.max(1),
                write_backoff: Duration::from_millis(config.write_backoff_ms),
            }),
        };

        if !store.inner.path.exists() {
            tracing::info!(path = %store.inner.path.display(), "creating empty feed document");
            store.write_atomic(&FeedDocument::default())?;
        } else {
            store.load()?;
        }

        Ok(store)
    }

    pub fn path(&self) -> &Path {
        &self.inner.path
    }

    /// Directory relative feed sources are resolved against.
    pub fn base_dir(&self) -> PathBuf {
        self.inner
            .path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_default()
    }

    /// True while a mutation is held in memory because it could not be written.
    pub fn is_degraded(&self) -> bool {
        self.lock().is_some()
    }

    pub fn snapshot(&self) -> Result<FeedDocument, StoreError> {
        let pending = self.lock();
        match pending.as_ref() {
            Some(doc) => Ok(doc.clone()),
            None => self.load(),
        }
    }

    /// Runs `f` against the current document and persists the result, all
    /// under the store lock. If `f` fails nothing is written.
    pub fn transact<R, F>(&self, f: F) -> Result<R, StoreError>
    where
        F: FnOnce(&mut FeedDocument) -> Result<R, StoreError>,
    {
        let mut pending = self.lock();
        let mut doc = match pending.as_ref() {
            Some(doc) => doc.clone(),
            None => self.load()?,
        };

        let out = f(&mut doc)?;

        match self.persist(&doc) {
            Ok(()) => {
                if pending.take().is_some() {
                    tracing::info!(path = %self.inner.path.display(), "feed document write recovered");
                }
            }
            Err(e) => {
                tracing::error!(
                    path = %self.inner.path.display(),
                    error = %e,
                    "feed document write failed, holding state in memory"
                );
                *pending = Some(doc);
            }
        }

        Ok(out)
    }

    pub fn increment(&self, key: CounterKey) -> Result<i64, StoreError> {
        self.add(key, 1)
    }

    pub fn decrement(&self, key: CounterKey) -> Result<i64, StoreError> {
        self.add(key, -1)
    }

    fn add(&self, key: CounterKey, delta: i64) -> Result<i64, StoreError> {
        self.transact(|doc| match key {
            CounterKey::Global => {
                doc.global_car_count += delta;
                Ok(doc.global_car_count)
            }
            CounterKey::Feed(id) => {
                let feed = doc.feed_mut(id).ok_or(StoreError::UnknownFeed(id))?;
                feed.count += delta;
                Ok(feed.count)
            }
        })
    }

    /// Stores a feed's available slot count, clamped to `[0, totalSlots]`.
    /// Returns the value actually stored.
    pub fn set_available_slots(&self, feed_id: FeedId, value: u32) -> Result<u32, StoreError> {
        self.transact(|doc| {
            let feed = doc.feed_mut(feed_id).ok_or(StoreError::UnknownFeed(feed_id))?;
            feed.available_slots = value.min(feed.total_slots);
            Ok(feed.available_slots)
        })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Option<FeedDocument>> {
        self.inner
            .pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn load(&self) -> Result<FeedDocument, StoreError> {
        match std::fs::read_to_string(&self.inner.path) {
            Ok(content) => Ok(serde_json::from_str(&content)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(FeedDocument::default()),
            Err(e) => Err(e.into()),
        }
    }

    fn persist(&self, doc: &FeedDocument) -> Result<(), StoreError> {
        let mut delay = self.inner.write_backoff;
        let mut attempt = 1;
        loop {
            match self.write_atomic(doc) {
                Ok(()) => return Ok(()),
                Err(e) if attempt >= self.inner.write_attempts => return Err(e),
                Err(e) => {
                    tracing::warn!(
                        path = %self.inner.path.display(),
                        attempt,
                        error = %e,
                        "feed document write failed, retrying"
                    );
                    thread::sleep(delay);
                    delay *= 2;
                    attempt += 1;
                }
            }
        }
    }

    /// Writes to a sibling temp file and renames it over the document, so a
    /// reader sees either the old or the new document, never a partial one.
    fn write_atomic(&self, doc: &FeedDocument) -> Result<(), StoreError> {
        let path = &self.inner.path;
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let mut tmp = path.clone().into_os_string();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);

        let data = serde_json::to_vec_pretty(doc)?;
        std::fs::write(&tmp, data)?;
        std::fs::rename(&tmp, path)?;
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;

    static NEXT_DIR: AtomicU32 = AtomicU32::new(0);

    /// Fresh scratch directory for one test.
    pub fn scratch_dir(tag: &str) -> PathBuf {
        let n = NEXT_DIR.fetch_add(1, Ordering::Relaxed);
        let dir = std::env::temp_dir().join(format!(
            "parkwatch-{tag}-{}-{n}",
            std::process::id()
        ));
        let _ = std::fs::remove_dir_all(&dir);
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    pub fn store_with(tag: &str, json: &str) -> CounterStore {
        let path = scratch_dir(tag).join("feeds_config.json");
        std::fs::write(&path, json).unwrap();
        CounterStore::open(&path, &StoreConfig::default()).unwrap()
    }

    pub fn read_doc(store: &CounterStore) -> FeedDocument {
        serde_json::from_str(&std::fs::read_to_string(store.path()).unwrap()).unwrap()
    }
}
