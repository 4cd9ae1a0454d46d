//! Moving a project's working tree between object storage and its volume.
//!
//! Hydration extracts into a staging directory beside the volume, writes the
//! readiness marker and renames the staging directory into place, so the
//! volume path either does not exist or holds a complete tree. Dehydration
//! only releases the volume after the uploaded snapshot verified.

use crate::archive::{self, READY_MARKER};
use crate::hash_utils::sha256_hash;
use crate::store::ObjectStore;
use crate::{latest_key, snapshot_key, SnapshotRef};
use chrono::Utc;
use devenv_core::{DevEnvError, Result, VolumeRef};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, error, info, instrument, warn};

/// Where the tree of a freshly hydrated volume came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HydrationSource {
    Snapshot(SnapshotRef),
    Template(String),
    Empty,
    /// The volume was already complete; nothing was fetched.
    AlreadyHydrated,
}

#[derive(Clone)]
pub struct HydrationService {
    store: Arc<dyn ObjectStore>,
    volumes_root: PathBuf,
    template_key: Option<String>,
}

impl std::fmt::Debug for HydrationService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HydrationService")
            .field("volumes_root", &self.volumes_root)
            .field("template_key", &self.template_key)
            .finish()
    }
}

async fn blocking<T, F>(task: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(task)
        .await
        .map_err(|e| DevEnvError::internal(format!("archive task failed: {e}")))?
}

fn staging_prefix(volume_path: &Path) -> String {
    let leaf = volume_path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    format!(".{leaf}.staging-")
}

impl HydrationService {
    pub fn new(
        store: Arc<dyn ObjectStore>,
        volumes_root: impl Into<PathBuf>,
        template_key: Option<String>,
    ) -> Self {
        Self {
            store,
            volumes_root: volumes_root.into(),
            template_key,
        }
    }

    pub fn volume_path(&self, volume: &VolumeRef) -> PathBuf {
        volume.resolve(&self.volumes_root)
    }

    /// Whether `volume` holds a completely hydrated tree.
    pub fn is_hydrated(&self, volume: &VolumeRef) -> bool {
        self.volume_path(volume).join(READY_MARKER).is_file()
    }

    /// Pointer to the most recent verified snapshot of a project.
    pub async fn latest(&self, project_id: i64) -> Result<Option<SnapshotRef>> {
        let Some(raw) = self.store.get(&latest_key(project_id)).await? else {
            return Ok(None);
        };
        serde_json::from_slice(&raw).map(Some).map_err(|e| DevEnvError::CorruptSnapshot {
            key: latest_key(project_id),
            expected: "snapshot pointer".to_string(),
            actual: e.to_string(),
        })
    }

    async fn fetch_source(&self, project_id: i64) -> Result<(HydrationSource, Option<Vec<u8>>)> {
        if let Some(snapshot) = self.latest(project_id).await? {
            let bytes = self.store.get(&snapshot.key).await?;
            let actual = bytes
                .as_deref()
                .map(sha256_hash)
                .unwrap_or_else(|| "missing".to_string());
            if actual != snapshot.content_hash {
                error!(
                    project_id,
                    key = %snapshot.key,
                    expected = %snapshot.content_hash,
                    actual = %actual,
                    "snapshot failed verification"
                );
                return Err(DevEnvError::CorruptSnapshot {
                    key: snapshot.key,
                    expected: snapshot.content_hash,
                    actual,
                });
            }
            return Ok((HydrationSource::Snapshot(snapshot), bytes));
        }

        if let Some(template) = &self.template_key {
            match self.store.get(template).await? {
                Some(bytes) => return Ok((HydrationSource::Template(template.clone()), Some(bytes))),
                None => warn!(template = %template, "template object missing, hydrating empty tree"),
            }
        }

        Ok((HydrationSource::Empty, None))
    }

    /// Populate `volume` from the project's latest snapshot, the template, or nothing.
    #[instrument(skip(self), fields(volume = %volume))]
    pub async fn hydrate(&self, project_id: i64, volume: &VolumeRef) -> Result<HydrationSource> {
        let target = self.volume_path(volume);
        if target.join(READY_MARKER).is_file() {
            debug!("volume already hydrated");
            return Ok(HydrationSource::AlreadyHydrated);
        }

        let (source, bytes) = self.fetch_source(project_id).await?;

        let parent = target
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| self.volumes_root.clone());
        tokio::fs::create_dir_all(&parent).await?;
        let staging = parent.join(format!("{}{}", staging_prefix(&target), uuid::Uuid::new_v4()));

        let result = blocking({
            let staging = staging.clone();
            let target = target.clone();
            move || {
                std::fs::create_dir_all(&staging)?;
                if let Some(bytes) = bytes {
                    archive::unpack(&bytes, &staging)?;
                }
                std::fs::write(staging.join(READY_MARKER), b"")?;
                // An unmarked leftover at the target is an aborted hydration.
                if target.exists() {
                    std::fs::remove_dir_all(&target)?;
                }
                std::fs::rename(&staging, &target)?;
                Ok(())
            }
        })
        .await;

        if let Err(e) = result {
            let _ = tokio::fs::remove_dir_all(&staging).await;
            return Err(e);
        }

        info!(project_id, source = ?source, "volume hydrated");
        Ok(source)
    }

    /// Archive `volume`, upload and verify it, move the latest pointer, then release the volume.
    #[instrument(skip(self), fields(volume = %volume))]
    pub async fn dehydrate(&self, project_id: i64, volume: &VolumeRef) -> Result<SnapshotRef> {
        let target = self.volume_path(volume);
        if !target.is_dir() {
            return Err(DevEnvError::NotFound(format!("volume {volume}")));
        }

        let bytes = blocking({
            let target = target.clone();
            move || archive::pack(&target)
        })
        .await?;
        let content_hash = sha256_hash(&bytes);
        let key = snapshot_key(project_id, &content_hash);
        let size_bytes = bytes.len() as u64;

        if self.store.head(&key).await?.as_deref() == Some(content_hash.as_str()) {
            debug!(key = %key, "identical snapshot already stored");
        } else {
            self.store.put(&key, bytes).await?;
        }

        let stored = self.store.head(&key).await?;
        if stored.as_deref() != Some(content_hash.as_str()) {
            warn!(key = %key, expected = %content_hash, stored = ?stored, "snapshot upload did not verify");
            return Err(DevEnvError::transient(format!(
                "snapshot {key} did not verify after upload"
            )));
        }

        let snapshot = SnapshotRef {
            project_id,
            key,
            content_hash,
            size_bytes,
            created_at: Utc::now(),
        };
        let pointer = serde_json::to_vec(&snapshot)
            .map_err(|e| DevEnvError::internal(format!("failed to encode snapshot pointer: {e}")))?;
        self.store.put(&latest_key(project_id), pointer).await?;

        tokio::fs::remove_dir_all(&target).await?;
        info!(
            project_id,
            key = %snapshot.key,
            size_bytes = snapshot.size_bytes,
            "volume dehydrated"
        );
        Ok(snapshot)
    }

    /// Remove a working volume and any staging leftovers without archiving.
    #[instrument(skip(self), fields(volume = %volume))]
    pub async fn discard(&self, volume: &VolumeRef) -> Result<()> {
        let target = self.volume_path(volume);
        match tokio::fs::remove_dir_all(&target).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }

        if let Some(parent) = target.parent() {
            let prefix = staging_prefix(&target);
            if let Ok(mut entries) = tokio::fs::read_dir(parent).await {
                while let Some(entry) = entries.next_entry().await? {
                    if entry.file_name().to_string_lossy().starts_with(&prefix) {
                        let _ = tokio::fs::remove_dir_all(entry.path()).await;
                    }
                }
            }
        }
        debug!("volume discarded");
        Ok(())
    }
}
