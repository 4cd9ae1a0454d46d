//! Cluster scheduler adapter.
//!
//! Each environment is a Deployment + Service + Ingress triple applied through
//! `kubectl`. Provisioning applies the objects with zero replicas; start and
//! stop scale the Deployment, so the shared volume subPath survives a stop.

pub mod manifests;

use crate::command::{ignore_not_found, CliCommand};
use crate::{workload_name, BackendAdapter, BackendHandle, HealthStatus, ProvisionSpec};
use async_trait::async_trait;
use devenv_config::{BackendKind, ClusterBackendSettings};
use devenv_core::{DevEnvError, Result};
use manifests::ObjectNames;
use serde::Deserialize;
use tracing::{info, warn};

#[derive(Debug, Clone)]
pub struct KubernetesAdapter {
    settings: ClusterBackendSettings,
}

struct ClusterRef<'a> {
    namespace: &'a str,
    deployment: &'a str,
    service: &'a str,
    ingress: &'a str,
}

impl KubernetesAdapter {
    pub fn new(settings: ClusterBackendSettings) -> Self {
        Self { settings }
    }

    /// kubectl with context and namespace already applied.
    fn kubectl(&self, namespace: &str) -> CliCommand {
        let mut cmd = CliCommand::new(&self.settings.kubectl);
        if let Some(context) = &self.settings.context {
            cmd = cmd.arg("--context").arg(context);
        }
        cmd.arg("-n").arg(namespace)
    }

    fn objects<'a>(&self, handle: &'a BackendHandle) -> Result<ClusterRef<'a>> {
        match handle {
            BackendHandle::Cluster {
                namespace,
                deployment,
                service,
                ingress,
            } => Ok(ClusterRef {
                namespace,
                deployment,
                service,
                ingress,
            }),
            other => Err(DevEnvError::internal(format!(
                "handle {} was not created by the cluster backend",
                other.describe()
            ))),
        }
    }

    async fn scale(&self, handle: &BackendHandle, replicas: u32) -> Result<()> {
        let objects = self.objects(handle)?;
        self.kubectl(objects.namespace)
            .arg("scale")
            .arg(format!("deployment/{}", objects.deployment))
            .arg(format!("--replicas={replicas}"))
            .execute()
            .await
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DeploymentStatus {
    #[serde(default)]
    replicas: u32,
    #[serde(default)]
    ready_replicas: u32,
}

#[derive(Debug, Default, Deserialize)]
struct DeploymentSpec {
    #[serde(default)]
    replicas: u32,
}

#[derive(Debug, Deserialize)]
struct Deployment {
    #[serde(default)]
    spec: DeploymentSpec,
    #[serde(default)]
    status: DeploymentStatus,
}

/// Interpret `kubectl get deployment -o json`.
pub(crate) fn health_from_deployment(raw: &str) -> Result<HealthStatus> {
    let deployment: Deployment = serde_json::from_str(raw)
        .map_err(|e| DevEnvError::transient(format!("unparseable deployment status: {e}")))?;

    Ok(if deployment.status.ready_replicas >= 1 {
        HealthStatus::Healthy
    } else if deployment.spec.replicas >= 1 || deployment.status.replicas >= 1 {
        HealthStatus::Starting
    } else {
        HealthStatus::Unreachable
    })
}

#[async_trait]
impl BackendAdapter for KubernetesAdapter {
    fn kind(&self) -> BackendKind {
        BackendKind::Cluster
    }

    fn handle_for(&self, spec: &ProvisionSpec) -> BackendHandle {
        let names = ObjectNames::for_workload(&workload_name(spec.owner_id, spec.project_id));
        BackendHandle::Cluster {
            namespace: self.settings.namespace.clone(),
            deployment: names.deployment,
            service: names.service,
            ingress: names.ingress,
        }
    }

    async fn provision(&self, spec: &ProvisionSpec) -> Result<BackendHandle> {
        let names = ObjectNames::for_workload(&workload_name(spec.owner_id, spec.project_id));
        let manifest = manifests::render(&self.settings, spec, &names)?;
        let handle = self.handle_for(spec);

        let applied = self
            .kubectl(&self.settings.namespace)
            .args(["apply", "-f", "-"])
            .stdin(manifest)
            .execute()
            .await;
        if let Err(err) = applied {
            // apply is not atomic across documents; drop whatever did land.
            if let Err(cleanup) = self.delete(&handle).await {
                warn!(deployment = %names.deployment, error = %cleanup, "failed to clean up partial apply");
            }
            return Err(err);
        }

        info!(
            namespace = %self.settings.namespace,
            deployment = %names.deployment,
            "cluster objects applied"
        );
        Ok(handle)
    }

    async fn start(&self, handle: &BackendHandle) -> Result<()> {
        self.scale(handle, 1).await
    }

    async fn stop(&self, handle: &BackendHandle) -> Result<()> {
        ignore_not_found(self.scale(handle, 0).await)
    }

    async fn delete(&self, handle: &BackendHandle) -> Result<()> {
        let objects = self.objects(handle)?;
        self.kubectl(objects.namespace)
            .arg("delete")
            .arg(format!("deployment/{}", objects.deployment))
            .arg(format!("service/{}", objects.service))
            .arg(format!("ingress/{}", objects.ingress))
            .arg("--ignore-not-found")
            .execute()
            .await?;
        info!(deployment = %objects.deployment, "cluster objects deleted");
        Ok(())
    }

    async fn health_check(&self, handle: &BackendHandle) -> Result<HealthStatus> {
        let objects = self.objects(handle)?;
        let output = self
            .kubectl(objects.namespace)
            .args(["get", "deployment", objects.deployment, "-o", "json"])
            .output()
            .await?;
        if !output.success {
            return Ok(HealthStatus::Unreachable);
        }
        health_from_deployment(&output.stdout)
    }

    fn upstream(&self, handle: &BackendHandle) -> Result<String> {
        let objects = self.objects(handle)?;
        Ok(format!(
            "http://{}.{}.svc.cluster.local:80",
            objects.service, objects.namespace
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handle() -> BackendHandle {
        BackendHandle::Cluster {
            namespace: "devenv".into(),
            deployment: "devenv-u1-p2".into(),
            service: "devenv-u1-p2".into(),
            ingress: "devenv-u1-p2".into(),
        }
    }

    #[test]
    fn test_kubectl_prefix_includes_context() {
        let settings = ClusterBackendSettings {
            context: Some("staging".into()),
            ..Default::default()
        };
        let cmd = KubernetesAdapter::new(settings).kubectl("devenv");
        assert_eq!(cmd.arguments(), ["--context", "staging", "-n", "devenv"]);
    }

    #[test]
    fn test_handle_for_uses_workload_names() {
        let adapter = KubernetesAdapter::new(ClusterBackendSettings::default());
        let spec = ProvisionSpec {
            environment_id: "e".into(),
            owner_id: 1,
            project_id: 2,
            volume: devenv_core::VolumeRef::for_project(1, 2),
            host: "user1-project2.dev.localhost".into(),
        };
        assert_eq!(adapter.handle_for(&spec), handle());
    }

    #[test]
    fn test_upstream_points_at_service_dns() {
        let adapter = KubernetesAdapter::new(ClusterBackendSettings::default());
        assert_eq!(
            adapter.upstream(&handle()).unwrap(),
            "http://devenv-u1-p2.devenv.svc.cluster.local:80"
        );
    }

    #[test]
    fn test_health_from_deployment() {
        let ready = r#"{"spec":{"replicas":1},"status":{"replicas":1,"readyReplicas":1}}"#;
        let rolling = r#"{"spec":{"replicas":1},"status":{"replicas":1}}"#;
        let scaled_down = r#"{"spec":{"replicas":0},"status":{}}"#;
        assert_eq!(health_from_deployment(ready).unwrap(), HealthStatus::Healthy);
        assert_eq!(health_from_deployment(rolling).unwrap(), HealthStatus::Starting);
        assert_eq!(
            health_from_deployment(scaled_down).unwrap(),
            HealthStatus::Unreachable
        );
    }

    #[test]
    fn test_rejects_container_handle() {
        let adapter = KubernetesAdapter::new(ClusterBackendSettings::default());
        let handle = BackendHandle::Container {
            name: "x".into(),
            id: "y".into(),
        };
        assert!(adapter.upstream(&handle).is_err());
    }
}
