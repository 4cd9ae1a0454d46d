//! Manifest rendering for cluster environments
use crate::docker::WORKSPACE_PATH;
use crate::ProvisionSpec;
use devenv_config::ClusterBackendSettings;
use devenv_core::{DevEnvError, Result};
use std::sync::OnceLock;
use tera::{Context as TeraContext, Tera};

/// Shared template engine for environment manifests
static MANIFEST_TERA: OnceLock<Tera> = OnceLock::new();

fn manifest_tera() -> &'static Tera {
    MANIFEST_TERA.get_or_init(|| {
        let mut tera = Tera::default();
        tera.add_raw_template("environment.yaml", include_str!("environment.yaml"))
            .expect("Failed to add environment manifest template");
        tera
    })
}

/// Object names of one environment on the cluster.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectNames {
    pub deployment: String,
    pub service: String,
    pub ingress: String,
}

impl ObjectNames {
    pub fn for_workload(base: &str) -> Self {
        Self {
            deployment: base.to_string(),
            service: base.to_string(),
            ingress: base.to_string(),
        }
    }
}

/// Render Deployment, Service and Ingress as one multi-document YAML stream.
pub fn render(
    settings: &ClusterBackendSettings,
    spec: &ProvisionSpec,
    names: &ObjectNames,
) -> Result<String> {
    let mut context = TeraContext::new();
    context.insert("namespace", &settings.namespace);
    context.insert("deployment", &names.deployment);
    context.insert("service", &names.service);
    context.insert("ingress", &names.ingress);
    context.insert("environment_id", &spec.environment_id);
    // Companion workloads of the same project share this label and node.
    context.insert(
        "colocate",
        &format!("u{}-p{}", spec.owner_id, spec.project_id),
    );
    context.insert("image", &settings.image);
    context.insert("sidecar_image", &settings.sidecar_image);
    context.insert("container_port", &settings.container_port);
    context.insert("pvc_name", &settings.pvc_name);
    context.insert("sub_path", spec.volume.as_str());
    context.insert("workspace_path", WORKSPACE_PATH);
    context.insert("ingress_class", &settings.ingress_class);
    context.insert("host", &spec.host);

    manifest_tera()
        .render("environment.yaml", &context)
        .map_err(|e| DevEnvError::internal(format!("failed to render manifests: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use devenv_core::VolumeRef;
    use serde::Deserialize;

    fn documents(raw: &str) -> Vec<serde_yaml_ng::Value> {
        serde_yaml_ng::Deserializer::from_str(raw)
            .map(|doc| serde_yaml_ng::Value::deserialize(doc).unwrap())
            .collect()
    }

    fn rendered() -> Vec<serde_yaml_ng::Value> {
        let spec = ProvisionSpec {
            environment_id: "3f1c".into(),
            owner_id: 42,
            project_id: 7,
            volume: VolumeRef::for_project(42, 7),
            host: "user42-project7.dev.example.com".into(),
        };
        let names = ObjectNames::for_workload("devenv-u42-p7");
        let raw = render(&ClusterBackendSettings::default(), &spec, &names).unwrap();
        documents(&raw)
    }

    #[test]
    fn test_renders_three_objects() {
        let docs = rendered();
        let kinds: Vec<&str> = docs.iter().map(|d| d["kind"].as_str().unwrap()).collect();
        assert_eq!(kinds, ["Deployment", "Service", "Ingress"]);
        assert!(docs
            .iter()
            .all(|d| d["metadata"]["namespace"].as_str() == Some("devenv")));
    }

    #[test]
    fn test_deployment_starts_scaled_down_with_subpath_and_affinity() {
        let docs = rendered();
        let deployment = &docs[0];
        assert_eq!(deployment["spec"]["replicas"].as_u64(), Some(0));

        let pod = &deployment["spec"]["template"]["spec"];
        let containers = pod["containers"].as_sequence().unwrap();
        assert_eq!(containers.len(), 2);
        for container in containers {
            assert_eq!(
                container["volumeMounts"][0]["subPath"].as_str(),
                Some("u42/p7")
            );
        }
        assert_eq!(
            pod["volumes"][0]["persistentVolumeClaim"]["claimName"].as_str(),
            Some("devenv-workspaces")
        );

        let term = &pod["affinity"]["podAffinity"]["preferredDuringSchedulingIgnoredDuringExecution"][0]
            ["podAffinityTerm"];
        assert_eq!(term["topologyKey"].as_str(), Some("kubernetes.io/hostname"));
        assert_eq!(
            term["labelSelector"]["matchLabels"]["devenv/colocate"].as_str(),
            Some("u42-p7")
        );
        assert_eq!(
            deployment["spec"]["template"]["metadata"]["labels"]["devenv/colocate"].as_str(),
            Some("u42-p7")
        );
    }

    #[test]
    fn test_ingress_routes_host_to_service() {
        let docs = rendered();
        let rule = &docs[2]["spec"]["rules"][0];
        assert_eq!(rule["host"].as_str(), Some("user42-project7.dev.example.com"));
        assert_eq!(
            rule["http"]["paths"][0]["backend"]["service"]["name"].as_str(),
            Some("devenv-u42-p7")
        );
        assert_eq!(docs[2]["spec"]["ingressClassName"].as_str(), Some("nginx"));
    }
}
