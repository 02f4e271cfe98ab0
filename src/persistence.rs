//! Mirroring the state to a durable blob store.
//!
//! [`PersistenceBridge`] hydrates the store from one JSON blob on attach
//! and rewrites that blob once per notification phase, however many keys
//! the phase changed. Storage is best-effort:
//! read, parse, and write failures are logged and never reach callers of
//! `dispatch`.

use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use serde_json::Value;

use crate::state::{Mutation, StateMap};
use crate::store::{Store, WeakStore, lock};
use crate::subscription::SubscriptionId;

/// Synchronous string blob storage keyed by name.
///
/// Called from subscriber callbacks, so implementations must not block
/// for long.
pub trait DurableStore: Send + Sync + 'static {
    /// Read the blob under `key`. `Ok(None)` if it was never written.
    fn get(&self, key: &str) -> io::Result<Option<String>>;

    /// Replace the blob under `key`.
    fn set(&self, key: &str, value: String) -> io::Result<()>;
}

/// In-process [`DurableStore`], mainly for tests.
#[derive(Debug, Default)]
pub struct MemoryBlobStore {
    blobs: Mutex<HashMap<String, String>>,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl DurableStore for MemoryBlobStore {
    fn get(&self, key: &str) -> io::Result<Option<String>> {
        Ok(lock(&self.blobs).get(key).cloned())
    }

    fn set(&self, key: &str, value: String) -> io::Result<()> {
        lock(&self.blobs).insert(key.to_string(), value);
        Ok(())
    }
}

/// [`DurableStore`] keeping one file per key under a directory.
///
/// Blobs live at `<dir>/<key>.json`. Writes are atomic via a temp-rename
/// pattern, so a crash mid-write leaves the previous blob intact.
#[derive(Debug, Clone)]
pub struct FileBlobStore {
    dir: PathBuf,
}

impl FileBlobStore {
    /// Store blobs under `dir`. The directory is created on first write.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// The directory holding the blobs.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Compute the file path for `key`.
    ///
    /// # Errors
    ///
    /// Returns `io::ErrorKind::InvalidInput` if `key` is empty or contains
    /// a path separator or `..`, which would escape the directory.
    pub fn blob_path(&self, key: &str) -> io::Result<PathBuf> {
        if key.is_empty() || key.contains(['/', '\\']) || key.contains("..") {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("invalid blob key `{key}`"),
            ));
        }
        Ok(self.dir.join(format!("{key}.json")))
    }
}

impl DurableStore for FileBlobStore {
    fn get(&self, key: &str) -> io::Result<Option<String>> {
        match std::fs::read_to_string(self.blob_path(key)?) {
            Ok(blob) => Ok(Some(blob)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn set(&self, key: &str, value: String) -> io::Result<()> {
        let path = self.blob_path(key)?;
        std::fs::create_dir_all(&self.dir)?;
        let tmp_path = path.with_extension("json.tmp");
        std::fs::write(&tmp_path, value)?;
        std::fs::rename(&tmp_path, &path)?;
        Ok(())
    }
}

/// Keeps a [`DurableStore`] blob in sync with a [`Store`].
#[derive(Clone)]
pub struct PersistenceBridge {
    store: Store,
    backend: Arc<dyn DurableStore>,
    key: String,
    subscription: SubscriptionId,
}

impl std::fmt::Debug for PersistenceBridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PersistenceBridge")
            .field("key", &self.key)
            .field("subscription", &self.subscription)
            .finish()
    }
}

impl PersistenceBridge {
    /// Hydrate `store` from `backend`, then persist every later change.
    ///
    /// The blob key is [`StoreConfig::persistence_key`](crate::StoreConfig::persistence_key).
    /// A stored JSON object is merged into the state one key at a time
    /// (subscribers attached earlier see each key). A missing blob is not
    /// an error; an unreadable or non-object blob is logged and ignored.
    pub fn attach(store: &Store, backend: Arc<dyn DurableStore>) -> Self {
        let key = store.config().persistence_key.clone();
        hydrate(store, backend.as_ref(), &key);

        let subscription = {
            let weak = store.downgrade();
            let backend = Arc::clone(&backend);
            let key = key.clone();
            let written = AtomicU64::new(0);
            store.subscribe(move |_| persist(&weak, backend.as_ref(), &key, &written))
        };

        Self {
            store: store.clone(),
            backend,
            key,
            subscription,
        }
    }

    /// Write the current state immediately.
    ///
    /// # Errors
    ///
    /// Returns `io::Error` if serialization or the backend write fails.
    pub fn save(&self) -> io::Result<()> {
        write_state(self.backend.as_ref(), &self.key, &self.store.get_all_state())
    }

    /// Stop mirroring changes. The blob keeps its last written value.
    pub fn detach(&self) {
        self.store.unsubscribe(self.subscription);
    }
}

fn hydrate(store: &Store, backend: &dyn DurableStore, key: &str) {
    let blob = match backend.get(key) {
        Ok(Some(blob)) => blob,
        Ok(None) => {
            tracing::debug!(key, "no persisted state found");
            return;
        }
        Err(e) => {
            tracing::warn!(key, error = %e, "failed to read persisted state; starting empty");
            return;
        }
    };

    match serde_json::from_str::<Value>(&blob) {
        Ok(Value::Object(entries)) => {
            tracing::debug!(key, entries = entries.len(), "restoring persisted state");
            store.apply_mutations(
                entries
                    .into_iter()
                    .map(|(k, v)| Mutation::Set(k, v))
                    .collect(),
            );
        }
        Ok(other) => {
            tracing::warn!(key, kind = json_kind(&other), "persisted state is not an object; ignoring");
        }
        Err(e) => {
            tracing::warn!(key, error = %e, "failed to parse persisted state; ignoring");
        }
    }
}

/// Write the state unless this notification phase was already written.
///
/// The state is complete before the first event of a phase is delivered.
fn persist(store: &WeakStore, backend: &dyn DurableStore, key: &str, written: &AtomicU64) {
    let Some(store) = store.upgrade() else {
        return;
    };
    let seq = store.commit_seq();
    if written.swap(seq, Ordering::SeqCst) == seq {
        return;
    }
    if let Err(e) = write_state(backend, key, &store.get_all_state()) {
        tracing::error!(key, error = %e, "failed to persist state");
    }
}

fn write_state(backend: &dyn DurableStore, key: &str, state: &StateMap) -> io::Result<()> {
    let json =
        serde_json::to_string(state).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    backend.set(key, json)
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
