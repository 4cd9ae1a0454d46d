//! Backend adapter abstraction library.
//!
//! A dev environment runs either as a single container on a local daemon or as
//! a Deployment/Service/Ingress triple on a cluster. Both sit behind the
//! [`BackendAdapter`] capability trait; the variant is picked once, from
//! configuration, by [`create_adapter`].

use async_trait::async_trait;
use devenv_config::{BackendKind, BackendSettings};
use devenv_core::{Result, VolumeRef};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;

pub mod command;
pub mod docker;
pub mod kubernetes;

#[cfg(any(test, feature = "test-helpers"))]
pub mod mock;

pub use docker::DockerAdapter;
pub use kubernetes::KubernetesAdapter;

/// Opaque reference to a provisioned workload.
///
/// Only the adapter that produced a handle looks inside it; everyone else
/// stores it and hands it back.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "backend", rename_all = "snake_case")]
pub enum BackendHandle {
    Container {
        name: String,
        id: String,
    },
    Cluster {
        namespace: String,
        deployment: String,
        service: String,
        ingress: String,
    },
}

impl BackendHandle {
    /// Short label for logs.
    pub fn describe(&self) -> String {
        match self {
            BackendHandle::Container { name, .. } => format!("container/{name}"),
            BackendHandle::Cluster {
                namespace,
                deployment,
                ..
            } => format!("{namespace}/deployment/{deployment}"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    Starting,
    Unreachable,
}

/// Everything an adapter needs to allocate a workload.
#[derive(Debug, Clone)]
pub struct ProvisionSpec {
    pub environment_id: String,
    pub owner_id: i64,
    pub project_id: i64,
    pub volume: VolumeRef,
    /// Host the reverse proxy / ingress will answer for.
    pub host: String,
}

/// Uniform provisioning capability set over both backends.
///
/// Every operation is idempotent with respect to the handle: stopping a
/// stopped workload or deleting a deleted one succeeds without effect.
#[async_trait]
pub trait BackendAdapter: Send + Sync {
    fn kind(&self) -> BackendKind;

    /// Handle naming the objects `provision` will create for `spec`.
    ///
    /// Names are deterministic, so this handle is enough to delete whatever a
    /// failed or interrupted provision left behind. Identifiers only known
    /// after creation are left empty.
    fn handle_for(&self, spec: &ProvisionSpec) -> BackendHandle;

    /// Allocate workload and storage attachment without starting traffic.
    async fn provision(&self, spec: &ProvisionSpec) -> Result<BackendHandle>;

    async fn start(&self, handle: &BackendHandle) -> Result<()>;

    /// Stop the workload, keeping its storage.
    async fn stop(&self, handle: &BackendHandle) -> Result<()>;

    /// Remove workload, routing objects and storage attachment.
    async fn delete(&self, handle: &BackendHandle) -> Result<()>;

    async fn health_check(&self, handle: &BackendHandle) -> Result<HealthStatus>;

    /// Address a routing rule for this workload should forward to.
    fn upstream(&self, handle: &BackendHandle) -> Result<String>;
}

/// Creates the adapter selected by `settings.kind`.
pub fn create_adapter(settings: &BackendSettings, volumes_root: PathBuf) -> Arc<dyn BackendAdapter> {
    match settings.kind {
        BackendKind::Local => Arc::new(DockerAdapter::new(settings.local.clone(), volumes_root)),
        BackendKind::Cluster => Arc::new(KubernetesAdapter::new(settings.cluster.clone())),
    }
}

/// Name shared by every workload object of one environment.
pub(crate) fn workload_name(owner_id: i64, project_id: i64) -> String {
    format!("devenv-u{owner_id}-p{project_id}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_adapter_follows_config() {
        let mut settings = BackendSettings::default();
        let adapter = create_adapter(&settings, PathBuf::from("/srv/volumes"));
        assert_eq!(adapter.kind(), BackendKind::Local);

        settings.kind = BackendKind::Cluster;
        let adapter = create_adapter(&settings, PathBuf::from("/srv/volumes"));
        assert_eq!(adapter.kind(), BackendKind::Cluster);
    }

    #[test]
    fn test_handle_serializes_with_backend_tag() {
        let handle = BackendHandle::Container {
            name: "devenv-u1-p2".into(),
            id: "abc".into(),
        };
        let json = serde_json::to_value(&handle).unwrap();
        assert_eq!(json["backend"], "container");
        let back: BackendHandle = serde_json::from_value(json).unwrap();
        assert_eq!(back, handle);
    }
}
