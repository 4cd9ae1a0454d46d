//! Local container daemon adapter.
//!
//! One container per environment, named after owner and project. The working
//! volume is bind-mounted from below the local volumes root. Containers opt
//! out of proxy label discovery; host routing is published separately.

mod inspect;

use crate::command::{ignore_not_found, CliCommand};
use crate::{workload_name, BackendAdapter, BackendHandle, HealthStatus, ProvisionSpec};
use async_trait::async_trait;
use devenv_config::{BackendKind, LocalBackendSettings};
use devenv_core::{DevEnvError, Result};
use std::path::PathBuf;
use tracing::{debug, info};

pub(crate) const WORKSPACE_PATH: &str = "/workspace";

#[derive(Debug, Clone)]
pub struct DockerAdapter {
    settings: LocalBackendSettings,
    volumes_root: PathBuf,
}

impl DockerAdapter {
    pub fn new(settings: LocalBackendSettings, volumes_root: PathBuf) -> Self {
        Self {
            settings,
            volumes_root,
        }
    }

    fn docker(&self) -> CliCommand {
        CliCommand::new(&self.settings.executable)
    }

    fn container<'a>(&self, handle: &'a BackendHandle) -> Result<&'a str> {
        match handle {
            BackendHandle::Container { name, .. } => Ok(name),
            other => Err(DevEnvError::internal(format!(
                "handle {} was not created by the container daemon backend",
                other.describe()
            ))),
        }
    }

    /// Arguments for `docker create`.
    pub fn create_args(&self, spec: &ProvisionSpec) -> Vec<String> {
        let name = workload_name(spec.owner_id, spec.project_id);
        let volume_path = spec.volume.resolve(&self.volumes_root);

        let mut args = vec!["create".to_string(), "--name".to_string(), name.clone()];

        // Routers come from the route table once the environment is Running;
        // the container itself must never be picked up by label discovery.
        let labels = [
            format!("devenv.environment={}", spec.environment_id),
            format!("devenv.owner={}", spec.owner_id),
            format!("devenv.project={}", spec.project_id),
            format!("devenv.host={}", spec.host),
            "traefik.enable=false".to_string(),
        ];
        for label in labels {
            args.push("--label".to_string());
            args.push(label);
        }

        if let Some(network) = &self.settings.network {
            args.push("--network".to_string());
            args.push(network.clone());
        }

        args.push("-v".to_string());
        args.push(format!("{}:{WORKSPACE_PATH}", volume_path.display()));
        args.push("-w".to_string());
        args.push(WORKSPACE_PATH.to_string());
        args.push(self.settings.image.clone());
        args
    }

    async fn existing_id(&self, name: &str) -> Result<Option<String>> {
        let output = self
            .docker()
            .args(["inspect", "--format", "{{.Id}}", name])
            .output()
            .await?;
        if output.success {
            Ok(Some(output.stdout.trim().to_string()))
        } else {
            Ok(None)
        }
    }
}

#[async_trait]
impl BackendAdapter for DockerAdapter {
    fn kind(&self) -> BackendKind {
        BackendKind::Local
    }

    fn handle_for(&self, spec: &ProvisionSpec) -> BackendHandle {
        BackendHandle::Container {
            name: workload_name(spec.owner_id, spec.project_id),
            id: String::new(),
        }
    }

    async fn provision(&self, spec: &ProvisionSpec) -> Result<BackendHandle> {
        let name = workload_name(spec.owner_id, spec.project_id);

        if let Some(id) = self.existing_id(&name).await? {
            debug!(container = %name, "reusing existing container");
            return Ok(BackendHandle::Container { name, id });
        }

        let created = self.docker().args(self.create_args(spec)).execute_with_output().await;
        let id = match created {
            Ok(stdout) => stdout.trim().to_string(),
            // Lost a create race against ourselves; the container is there now.
            Err(err) if err.to_string().contains("already in use") => self
                .existing_id(&name)
                .await?
                .ok_or(err)?,
            Err(err) => return Err(err),
        };

        info!(container = %name, id = %id, "container provisioned");
        Ok(BackendHandle::Container { name, id })
    }

    async fn start(&self, handle: &BackendHandle) -> Result<()> {
        let name = self.container(handle)?;
        self.docker().args(["start", name]).execute().await
    }

    async fn stop(&self, handle: &BackendHandle) -> Result<()> {
        let name = self.container(handle)?;
        ignore_not_found(self.docker().args(["stop", name]).execute().await)
    }

    async fn delete(&self, handle: &BackendHandle) -> Result<()> {
        let name = self.container(handle)?;
        ignore_not_found(self.docker().args(["rm", "-f", name]).execute().await)?;
        info!(container = %name, "container removed");
        Ok(())
    }

    async fn health_check(&self, handle: &BackendHandle) -> Result<HealthStatus> {
        let name = self.container(handle)?;
        let output = self
            .docker()
            .args(["inspect", "--format", "{{json .State}}", name])
            .output()
            .await?;
        if !output.success {
            return Ok(HealthStatus::Unreachable);
        }
        inspect::health_from_state(&output.stdout)
    }

    fn upstream(&self, handle: &BackendHandle) -> Result<String> {
        let name = self.container(handle)?;
        Ok(format!("http://{name}:{}", self.settings.container_port))
    }
}
