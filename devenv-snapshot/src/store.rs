//! Object storage used for snapshots.
//!
//! Keys are `/`-separated relative paths. Every write returns the SHA-256 of
//! the stored bytes; `head` recomputes it from what is actually stored so a
//! caller can verify an upload independently of the write path.

use crate::hash_utils::sha256_hash;
use async_trait::async_trait;
use devenv_core::{DevEnvError, Result};
use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};
use std::sync::{Arc, RwLock};
use tracing::debug;

#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Store `bytes` under `key`, replacing any previous object. Returns the content hash.
    async fn put(&self, key: &str, bytes: Vec<u8>) -> Result<String>;

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// Content hash of the stored object, if any.
    async fn head(&self, key: &str) -> Result<Option<String>>;

    /// Remove the object. Deleting a missing key succeeds.
    async fn delete(&self, key: &str) -> Result<()>;
}

/// Directory-backed store. Writes go to a temp file and are renamed into place.
#[derive(Debug, Clone)]
pub struct FsObjectStore {
    root: PathBuf,
}

impl FsObjectStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, key: &str) -> Result<PathBuf> {
        let relative = Path::new(key);
        let valid = !key.is_empty()
            && relative
                .components()
                .all(|c| matches!(c, Component::Normal(_)));
        if !valid {
            return Err(DevEnvError::Config(format!("invalid object key '{key}'")));
        }
        Ok(self.root.join(relative))
    }
}

#[async_trait]
impl ObjectStore for FsObjectStore {
    async fn put(&self, key: &str, bytes: Vec<u8>) -> Result<String> {
        let path = self.path_for(key)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let hash = sha256_hash(&bytes);
        let tmp = path.with_file_name(format!(
            ".{}.{}.tmp",
            path.file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default(),
            uuid::Uuid::new_v4()
        ));
        tokio::fs::write(&tmp, &bytes).await?;
        if let Err(e) = tokio::fs::rename(&tmp, &path).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(e.into());
        }

        debug!(key, size = bytes.len(), "object stored");
        Ok(hash)
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let path = self.path_for(key)?;
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn head(&self, key: &str) -> Result<Option<String>> {
        Ok(self.get(key).await?.map(|bytes| sha256_hash(&bytes)))
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let path = self.path_for(key)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// Process-local store.
#[derive(Debug, Clone, Default)]
pub struct MemoryObjectStore {
    objects: Arc<RwLock<HashMap<String, Vec<u8>>>>,
}

impl MemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn keys(&self) -> Vec<String> {
        let objects = self.objects.read().unwrap_or_else(|e| e.into_inner());
        let mut keys: Vec<String> = objects.keys().cloned().collect();
        keys.sort();
        keys
    }

    /// Overwrite an object in place without going through `put`.
    pub fn tamper(&self, key: &str, bytes: Vec<u8>) {
        let mut objects = self.objects.write().unwrap_or_else(|e| e.into_inner());
        objects.insert(key.to_string(), bytes);
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn put(&self, key: &str, bytes: Vec<u8>) -> Result<String> {
        let hash = sha256_hash(&bytes);
        let mut objects = self.objects.write().unwrap_or_else(|e| e.into_inner());
        objects.insert(key.to_string(), bytes);
        Ok(hash)
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let objects = self.objects.read().unwrap_or_else(|e| e.into_inner());
        Ok(objects.get(key).cloned())
    }

    async fn head(&self, key: &str) -> Result<Option<String>> {
        let objects = self.objects.read().unwrap_or_else(|e| e.into_inner());
        Ok(objects.get(key).map(|bytes| sha256_hash(bytes)))
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let mut objects = self.objects.write().unwrap_or_else(|e| e.into_inner());
        objects.remove(key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_fs_store_put_get_head_delete() {
        let dir = TempDir::new().unwrap();
        let store = FsObjectStore::new(dir.path());

        let hash = store.put("projects/7/latest", b"hello world".to_vec()).await.unwrap();
        assert_eq!(
            hash,
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
        assert_eq!(store.head("projects/7/latest").await.unwrap(), Some(hash));
        assert_eq!(
            store.get("projects/7/latest").await.unwrap().as_deref(),
            Some(&b"hello world"[..])
        );

        store.delete("projects/7/latest").await.unwrap();
        store.delete("projects/7/latest").await.unwrap();
        assert!(store.get("projects/7/latest").await.unwrap().is_none());
        assert!(store.head("projects/7/latest").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_fs_store_leaves_no_temp_files() {
        let dir = TempDir::new().unwrap();
        let store = FsObjectStore::new(dir.path());
        store.put("a/b", b"one".to_vec()).await.unwrap();
        store.put("a/b", b"two".to_vec()).await.unwrap();

        let names: Vec<String> = std::fs::read_dir(dir.path().join("a"))
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, ["b"]);
    }

    #[tokio::test]
    async fn test_fs_store_rejects_escaping_keys() {
        let dir = TempDir::new().unwrap();
        let store = FsObjectStore::new(dir.path());
        assert!(store.put("../outside", vec![]).await.is_err());
        assert!(store.get("/etc/passwd").await.is_err());
        assert!(store.head("").await.is_err());
    }

    #[tokio::test]
    async fn test_memory_store_tamper_changes_head() {
        let store = MemoryObjectStore::new();
        let hash = store.put("k", b"original".to_vec()).await.unwrap();
        store.tamper("k", b"changed".to_vec());
        assert_ne!(store.head("k").await.unwrap(), Some(hash));
        assert_eq!(store.keys(), ["k"]);
    }
}
