//! Atomic per-document JSON storage.
//!
//! Each document is one file under the data directory. Writers go through a
//! sibling temp file, fsync, then an atomic rename, so a crash mid-write
//! never corrupts the previous version. A per-document lock (lazily
//! inserted into a shared map) serializes the whole read-modify-write
//! window; writers to distinct documents proceed in parallel.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::io::AsyncWriteExt;

use crate::error::PeerError;

/// Document names. Each maps to `<name>.json` in the data directory.
pub const IDENTITY_DOC: &str = "identity";
pub const NODES_DOC: &str = "nodes";
pub const STATES_DOC: &str = "states";
pub const CHAT_DOC: &str = "chat";
pub const SNIPPETS_DOC: &str = "snippets";
pub const SYNC_META_DOC: &str = "sync_meta";
pub const AUTH_DOC: &str = "auth";

pub struct Store {
    data_dir: PathBuf,
    locks: parking_lot::Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl Store {
    /// Open (and create) the data directory. Failure here is fatal: the
    /// process cannot run without writable storage.
    pub fn open(data_dir: impl AsRef<Path>) -> anyhow::Result<Self> {
        let data_dir = data_dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&data_dir)?;
        tracing::info!(dir = %data_dir.display(), "document store opened");
        Ok(Self {
            data_dir,
            locks: parking_lot::Mutex::new(HashMap::new()),
        })
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    /// Subdirectory for an auxiliary service (`tasks/`, `audit/`).
    pub fn ensure_subdir(&self, name: &str) -> std::io::Result<PathBuf> {
        let path = self.data_dir.join(name);
        std::fs::create_dir_all(&path)?;
        Ok(path)
    }

    fn path_for(&self, name: &str) -> PathBuf {
        self.data_dir.join(format!("{name}.json"))
    }

    fn lock_for(&self, name: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.locks.lock();
        locks
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    pub async fn exists(&self, name: &str) -> bool {
        tokio::fs::try_exists(self.path_for(name)).await.unwrap_or(false)
    }

    /// Read a document, returning `default` when the file is missing or
    /// unreadable. Decode failures are logged, not propagated: a corrupt
    /// document behaves like an empty one and is rewritten on next update.
    pub async fn read<T: DeserializeOwned>(&self, name: &str, default: T) -> T {
        let lock = self.lock_for(name);
        let _guard = lock.lock().await;
        self.read_unlocked(name, default).await
    }

    async fn read_unlocked<T: DeserializeOwned>(&self, name: &str, default: T) -> T {
        let path = self.path_for(name);
        let bytes = match tokio::fs::read(&path).await {
            Ok(b) => b,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return default,
            Err(e) => {
                tracing::error!(doc = name, "read failed: {e}");
                return default;
            }
        };
        match serde_json::from_slice(&bytes) {
            Ok(v) => v,
            Err(e) => {
                tracing::error!(doc = name, "decode failed: {e}");
                default
            }
        }
    }

    /// Atomically replace a document.
    pub async fn write<T: Serialize>(&self, name: &str, value: &T) -> Result<(), PeerError> {
        let lock = self.lock_for(name);
        let _guard = lock.lock().await;
        self.write_unlocked(name, value).await
    }

    async fn write_unlocked<T: Serialize>(&self, name: &str, value: &T) -> Result<(), PeerError> {
        let path = self.path_for(name);
        let bytes = serde_json::to_vec_pretty(value)?;

        // Sibling temp file in the same directory so the rename stays on one
        // filesystem.
        let tmp = self
            .data_dir
            .join(format!(".{name}.json.{}.tmp", hex::encode(rand::random::<[u8; 4]>())));
        {
            let mut file = tokio::fs::File::create(&tmp).await?;
            file.write_all(&bytes).await?;
            file.sync_all().await?;
        }
        if let Err(e) = tokio::fs::rename(&tmp, &path).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(e.into());
        }
        Ok(())
    }

    /// Read-modify-write under the document lock. The transform runs on a
    /// snapshot; the result is persisted and returned.
    pub async fn update<T, F>(&self, name: &str, default: T, f: F) -> Result<T, PeerError>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce(T) -> T,
    {
        let lock = self.lock_for(name);
        let _guard = lock.lock().await;
        let current = self.read_unlocked(name, default).await;
        let next = f(current);
        self.write_unlocked(name, &next).await?;
        Ok(next)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn temp_store() -> (tempfile::TempDir, Store) {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path()).unwrap();
        (dir, store)
    }

    #[tokio::test]
    async fn missing_document_yields_default() {
        let (_dir, store) = temp_store();
        let doc: BTreeMap<String, u64> = store.read("nope", BTreeMap::new()).await;
        assert!(doc.is_empty());
        assert!(!store.exists("nope").await);
    }

    #[tokio::test]
    async fn write_then_read_round_trips() {
        let (_dir, store) = temp_store();
        let mut doc = BTreeMap::new();
        doc.insert("a".to_string(), 1u64);
        store.write("counts", &doc).await.unwrap();
        let back: BTreeMap<String, u64> = store.read("counts", BTreeMap::new()).await;
        assert_eq!(back, doc);
    }

    #[tokio::test]
    async fn corrupt_document_reads_as_default() {
        let (dir, store) = temp_store();
        tokio::fs::write(dir.path().join("broken.json"), b"{not json")
            .await
            .unwrap();
        let doc: BTreeMap<String, u64> = store.read("broken", BTreeMap::new()).await;
        assert!(doc.is_empty());
    }

    #[tokio::test]
    async fn concurrent_updates_are_serialized() {
        let (_dir, store) = temp_store();
        let store = Arc::new(store);

        let mut handles = Vec::new();
        for _ in 0..32 {
            let store = Arc::clone(&store);
            handles.push(tokio::spawn(async move {
                store
                    .update("counter", BTreeMap::<String, u64>::new(), |mut doc| {
                        *doc.entry("n".to_string()).or_insert(0) += 1;
                        doc
                    })
                    .await
                    .unwrap();
            }));
        }
        for h in handles {
            h.await.unwrap();
        }

        let doc: BTreeMap<String, u64> = store.read("counter", BTreeMap::new()).await;
        assert_eq!(doc["n"], 32, "every increment must be observed");
    }

    #[tokio::test]
    async fn no_temp_files_left_behind() {
        let (dir, store) = temp_store();
        for i in 0..10u32 {
            store.write("doc", &i).await.unwrap();
        }
        let mut entries = tokio::fs::read_dir(dir.path()).await.unwrap();
        let mut names = Vec::new();
        while let Some(e) = entries.next_entry().await.unwrap() {
            names.push(e.file_name().to_string_lossy().to_string());
        }
        assert_eq!(names, vec!["doc.json".to_string()], "found: {names:?}");
    }
}
