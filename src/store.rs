//! Coordination store holding idempotency markers, settlement leases, invoice
//! metadata and subscription watermarks.
//!
//! The operations mirror a small key/value server: plain string values, hash
//! fields and counters. Every mutation of a key is atomic with respect to
//! other mutations of the same key, including those issued by other processes
//! sharing a [`FileStore`] root.

use std::{
    collections::BTreeMap,
    fs::{self, File, OpenOptions},
    path::{Path, PathBuf},
    time::Duration,
};

use async_trait::async_trait;
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("corrupt store entry: {0}")]
    Corrupt(#[from] serde_json::Error),
    #[error("store task failed: {0}")]
    Task(String),
}

/// Field set on a hash once its fate has been decided.
pub const HANDLED_FIELD: &str = "handled";

#[async_trait]
pub trait CoordinationStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;
    async fn set(&self, key: &str, value: &str) -> Result<(), StoreError>;
    async fn hmget(&self, key: &str, fields: &[&str]) -> Result<Vec<Option<String>>, StoreError>;
    async fn hset(&self, key: &str, field: &str, value: &str) -> Result<(), StoreError>;
    /// Increment a counter. `ttl` is applied only when the counter is created,
    /// so an abandoned counter eventually disappears.
    async fn incr(&self, key: &str, ttl: Option<Duration>) -> Result<i64, StoreError>;
    /// Decrement a counter; a counter reaching zero is removed.
    async fn decr(&self, key: &str) -> Result<i64, StoreError>;
    async fn del(&self, key: &str) -> Result<bool, StoreError>;

    async fn hget(&self, key: &str, field: &str) -> Result<Option<String>, StoreError> {
        Ok(self.hmget(key, &[field]).await?.pop().flatten())
    }
}

/// Whether the handled marker is set for `key`.
pub async fn is_handled(store: &dyn CoordinationStore, key: &str) -> Result<bool, StoreError> {
    Ok(store.hget(key, HANDLED_FIELD).await?.as_deref() == Some("true"))
}

pub async fn mark_handled(store: &dyn CoordinationStore, key: &str) -> Result<(), StoreError> {
    store.hset(key, HANDLED_FIELD, "true").await
}

/// Counter key backing the lease for `key`.
pub fn lease_key(key: &str) -> String {
    format!("a:{key}")
}

/// Try to take the exclusive lease on `key`. Only the caller moving the
/// counter from 0 to 1 wins; everyone else must drop their work without
/// releasing.
pub async fn acquire_lease(
    store: &dyn CoordinationStore,
    key: &str,
    ttl: Duration,
) -> Result<bool, StoreError> {
    Ok(store.incr(&lease_key(key), Some(ttl)).await? == 1)
}

pub async fn release_lease(store: &dyn CoordinationStore, key: &str) -> Result<(), StoreError> {
    store.decr(&lease_key(key)).await?;
    Ok(())
}

/// Persisted shape of a single key.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct Entry {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    value: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    fields: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    counter: Option<i64>,
    /// Expiry as Unix milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    expires_at_ms: Option<u64>,
}

impl Entry {
    fn is_empty(&self) -> bool {
        self.value.is_none() && self.fields.is_empty() && self.counter.is_none()
    }
}

/// Store persisting one JSON document per key under `root`.
///
/// Each key has a sibling lock file; every operation holds an exclusive
/// `flock` on it for the whole read-modify-write cycle. A key left empty
/// loses both files, so the root only holds live keys.
#[derive(Debug, Clone)]
pub struct FileStore {
    root: PathBuf,
}

impl FileStore {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    /// Ensure the on-disk directory exists.
    pub fn init(&self) -> Result<(), StoreError> {
        fs::create_dir_all(&self.root)?;
        Ok(())
    }

    fn key_stem(&self, key: &str) -> PathBuf {
        let mut hasher = Sha1::new();
        hasher.update(key.as_bytes());
        self.root.join(hex::encode(hasher.finalize()))
    }

    /// Run `op` on the entry for `key` under its file lock and persist the
    /// result when `op` reports a change.
    async fn with_entry<T, F>(&self, key: &str, op: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&mut Entry) -> (T, bool) + Send + 'static,
    {
        let stem = self.key_stem(key);
        let root = self.root.clone();
        tokio::task::spawn_blocking(move || locked_update(&root, &stem, op))
            .await
            .map_err(|e| StoreError::Task(e.to_string()))?
    }
}

fn unix_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

/// Open and lock `path`, retrying when the file was unlinked by its previous
/// holder between our open and our lock.
fn lock_file(path: &Path) -> std::io::Result<File> {
    loop {
        let lock = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(path)?;
        lock.lock_exclusive()?;
        if still_linked(&lock, path)? {
            return Ok(lock);
        }
    }
}

#[cfg(unix)]
fn still_linked(lock: &File, path: &Path) -> std::io::Result<bool> {
    use std::os::unix::fs::MetadataExt;
    let held = lock.metadata()?;
    match fs::metadata(path) {
        Ok(current) => Ok(current.dev() == held.dev() && current.ino() == held.ino()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e),
    }
}

// Without inode identity a removed lock file cannot be detected, so lock
// files are never removed there.
#[cfg(not(unix))]
fn still_linked(_lock: &File, _path: &Path) -> std::io::Result<bool> {
    Ok(true)
}

fn remove_if_present(path: &Path) -> std::io::Result<()> {
    match fs::remove_file(path) {
        Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}

fn locked_update<T, F>(root: &Path, stem: &Path, op: F) -> Result<T, StoreError>
where
    F: FnOnce(&mut Entry) -> (T, bool),
{
    fs::create_dir_all(root)?;
    let lock_path = stem.with_extension("lock");
    let data_path = stem.with_extension("json");
    let lock = lock_file(&lock_path)?;

    let mut entry = match fs::read_to_string(&data_path) {
        Ok(data) => serde_json::from_str::<Entry>(&data)?,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Entry::default(),
        Err(e) => return Err(e.into()),
    };
    let expired = entry.expires_at_ms.is_some_and(|at| at <= unix_ms());
    if expired {
        entry = Entry::default();
    }
    let (out, changed) = op(&mut entry);
    if changed || expired {
        if entry.is_empty() {
            remove_if_present(&data_path)?;
        } else {
            // Write atomically so readers never observe a torn document.
            let tmp = tempfile::NamedTempFile::new_in(root)?;
            serde_json::to_writer(&tmp, &entry)?;
            tmp.persist(&data_path).map_err(|e| e.error)?;
        }
    }
    // Unlink while still locked; waiters notice and reopen a fresh file.
    if cfg!(unix) && entry.is_empty() {
        remove_if_present(&lock_path)?;
    }
    FileExt::unlock(&lock)?;
    Ok(out)
}

#[async_trait]
impl CoordinationStore for FileStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        self.with_entry(key, |e| (e.value.clone(), false)).await
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        let value = value.to_string();
        self.with_entry(key, move |e| {
            e.value = Some(value);
            ((), true)
        })
        .await
    }

    async fn hmget(&self, key: &str, fields: &[&str]) -> Result<Vec<Option<String>>, StoreError> {
        let fields: Vec<String> = fields.iter().map(|f| f.to_string()).collect();
        self.with_entry(key, move |e| {
            let out = fields.iter().map(|f| e.fields.get(f).cloned()).collect();
            (out, false)
        })
        .await
    }

    async fn hset(&self, key: &str, field: &str, value: &str) -> Result<(), StoreError> {
        let (field, value) = (field.to_string(), value.to_string());
        self.with_entry(key, move |e| {
            e.fields.insert(field, value);
            ((), true)
        })
        .await
    }

    async fn incr(&self, key: &str, ttl: Option<Duration>) -> Result<i64, StoreError> {
        self.with_entry(key, move |e| {
            if e.counter.is_none() {
                e.expires_at_ms = ttl.map(|t| unix_ms() + t.as_millis() as u64);
            }
            let next = e.counter.unwrap_or(0) + 1;
            e.counter = Some(next);
            (next, true)
        })
        .await
    }

    async fn decr(&self, key: &str) -> Result<i64, StoreError> {
        self.with_entry(key, |e| {
            let next = e.counter.unwrap_or(0) - 1;
            if next <= 0 {
                e.counter = None;
                e.expires_at_ms = None;
            } else {
                e.counter = Some(next);
            }
            (next, true)
        })
        .await
    }

    async fn del(&self, key: &str) -> Result<bool, StoreError> {
        self.with_entry(key, |e| {
            let existed = !e.is_empty();
            *e = Entry::default();
            (existed, true)
        })
        .await
    }
}

#[cfg(test)]
pub use memory::MemoryStore;


#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tempfile::TempDir;

    async fn exercise(store: &dyn CoordinationStore) {
        assert_eq!(store.get("k").await.unwrap(), None);
        store.set("k", "v").await.unwrap();
        assert_eq!(store.get("k").await.unwrap().as_deref(), Some("v"));

        store.hset("h", "pubkey", "abc").await.unwrap();
        store.hset("h", "comment", "hi").await.unwrap();
        let got = store.hmget("h", &["pubkey", "zapRequest", "comment"]).await.unwrap();
        assert_eq!(got, vec![Some("abc".into()), None, Some("hi".into())]);

        assert!(!is_handled(store, "h").await.unwrap());
        mark_handled(store, "h").await.unwrap();
        assert!(is_handled(store, "h").await.unwrap());

        assert_eq!(store.incr("c", None).await.unwrap(), 1);
        assert_eq!(store.incr("c", None).await.unwrap(), 2);
        assert_eq!(store.decr("c").await.unwrap(), 1);
        assert_eq!(store.decr("c").await.unwrap(), 0);
        assert_eq!(store.incr("c", None).await.unwrap(), 1);

        assert!(store.del("k").await.unwrap());
        assert!(!store.del("k").await.unwrap());
    }

    #[tokio::test]
    async fn memory_store_operations() {
        exercise(&MemoryStore::new()).await;
    }

    #[tokio::test]
    async fn file_store_operations() {
        let dir = TempDir::new().unwrap();
        let store = FileStore::new(dir.path().join("coord"));
        store.init().unwrap();
        exercise(&store).await;
    }

    #[tokio::test]
    async fn file_store_persists_across_instances() {
        let dir = TempDir::new().unwrap();
        let root = dir.path().join("coord");
        FileStore::new(root.clone()).set("watermark:x", "42").await.unwrap();
        let reopened = FileStore::new(root);
        assert_eq!(reopened.get("watermark:x").await.unwrap().as_deref(), Some("42"));
    }

    #[tokio::test]
    async fn only_one_concurrent_lease_wins() {
        let dir = TempDir::new().unwrap();
        let store: Arc<dyn CoordinationStore> = Arc::new(FileStore::new(dir.path().to_path_buf()));
        let mut handles = vec![];
        for _ in 0..16 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                acquire_lease(store.as_ref(), "pr", Duration::from_secs(60))
                    .await
                    .unwrap()
            }));
        }
        let mut winners = 0;
        for h in handles {
            if h.await.unwrap() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
    }

    #[tokio::test]
    async fn emptied_keys_leave_no_files() {
        let dir = TempDir::new().unwrap();
        let root = dir.path().join("coord");
        let store = FileStore::new(root.clone());
        store.init().unwrap();

        assert_eq!(store.get("missing").await.unwrap(), None);
        store.set("k", "v").await.unwrap();
        assert_eq!(fs::read_dir(&root).unwrap().count(), 2);
        store.del("k").await.unwrap();
        assert!(acquire_lease(&store, "pr", Duration::from_secs(60)).await.unwrap());
        release_lease(&store, "pr").await.unwrap();

        let left: Vec<_> = fs::read_dir(&root).unwrap().map(|e| e.unwrap().file_name()).collect();
        assert!(left.is_empty(), "leftover files: {left:?}");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn counter_churn_stays_exclusive() {
        use std::sync::atomic::{AtomicUsize, Ordering};
        let dir = TempDir::new().unwrap();
        let store: Arc<dyn CoordinationStore> = Arc::new(FileStore::new(dir.path().to_path_buf()));
        let holders = Arc::new(AtomicUsize::new(0));
        let mut handles = vec![];
        for _ in 0..8 {
            let (store, holders) = (store.clone(), holders.clone());
            handles.push(tokio::spawn(async move {
                for _ in 0..25 {
                    // Whoever moves the counter to 1 holds it until its decr empties the key.
                    if store.incr("c", None).await.unwrap() == 1 {
                        assert_eq!(holders.fetch_add(1, Ordering::SeqCst), 0);
                        tokio::task::yield_now().await;
                        holders.fetch_sub(1, Ordering::SeqCst);
                    }
                    store.decr("c").await.unwrap();
                }
            }));
        }
        for h in handles {
            h.await.unwrap();
        }
        assert_eq!(store.get("c").await.unwrap(), None);
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn memory_lease_expires_after_ttl() {
        let store = MemoryStore::new();
        assert!(acquire_lease(&store, "pr", Duration::from_secs(600)).await.unwrap());
        assert!(!acquire_lease(&store, "pr", Duration::from_secs(600)).await.unwrap());
        tokio::time::advance(Duration::from_secs(601)).await;
        assert!(acquire_lease(&store, "pr", Duration::from_secs(600)).await.unwrap());
    }

    #[tokio::test]
    async fn released_lease_can_be_retaken() {
        let store = MemoryStore::new();
        assert!(acquire_lease(&store, "pr", Duration::from_secs(60)).await.unwrap());
        release_lease(&store, "pr").await.unwrap();
        assert!(acquire_lease(&store, "pr", Duration::from_secs(60)).await.unwrap());
    }
}
