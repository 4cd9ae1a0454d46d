//! Orchestrator configuration
//!
//! Settings are read from a YAML file (`devenv.yaml`), every field has a
//! default, and selected values can be overridden with `DEVENV_*` environment
//! variables. Operational numbers (timeouts, retry bounds, backoff) live here
//! rather than in code.

use devenv_core::{DevEnvError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Root configuration object
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct OrchestratorConfig {
    pub registry: RegistrySettings,
    pub backend: BackendSettings,
    pub storage: StorageSettings,
    pub routing: RoutingSettings,
    pub lifecycle: LifecycleSettings,
    pub reaper: ReaperSettings,
    pub health: HealthSettings,
    pub api: ApiSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistrySettings {
    pub db_path: PathBuf,
}

impl Default for RegistrySettings {
    fn default() -> Self {
        Self {
            db_path: devenv_home().join("registry.db"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    #[default]
    Local,
    Cluster,
}

impl BackendKind {
    pub fn as_str(self) -> &'static str {
        match self {
            BackendKind::Local => "local",
            BackendKind::Cluster => "cluster",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "local" => Some(BackendKind::Local),
            "cluster" => Some(BackendKind::Cluster),
            _ => None,
        }
    }
}

impl std::fmt::Display for BackendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct BackendSettings {
    pub kind: BackendKind,
    pub local: LocalBackendSettings,
    pub cluster: ClusterBackendSettings,
}

/// Container daemon settings (docker or a CLI-compatible runtime)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LocalBackendSettings {
    pub executable: String,
    pub image: String,
    pub network: Option<String>,
    pub container_port: u16,
    pub proxy_entrypoint: String,
}

impl Default for LocalBackendSettings {
    fn default() -> Self {
        Self {
            executable: "docker".to_string(),
            image: "ghcr.io/devenv/workspace:latest".to_string(),
            network: Some("devenv".to_string()),
            container_port: 8080,
            proxy_entrypoint: "web".to_string(),
        }
    }
}

/// Cluster scheduler settings (driven through kubectl)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterBackendSettings {
    pub kubectl: String,
    pub context: Option<String>,
    pub namespace: String,
    pub image: String,
    pub sidecar_image: String,
    pub pvc_name: String,
    pub ingress_class: String,
    pub container_port: u16,
}

impl Default for ClusterBackendSettings {
    fn default() -> Self {
        Self {
            kubectl: "kubectl".to_string(),
            context: None,
            namespace: "devenv".to_string(),
            image: "ghcr.io/devenv/workspace:latest".to_string(),
            sidecar_image: "ghcr.io/devenv/tooling:latest".to_string(),
            pvc_name: "devenv-workspaces".to_string(),
            ingress_class: "nginx".to_string(),
            container_port: 8080,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageSettings {
    /// Root of the directory-backed object store
    pub root: PathBuf,
    /// Where working volumes are attached (the shared PV mount for clusters)
    pub volumes_root: PathBuf,
    /// Object used to seed projects that have no snapshot yet
    pub template_key: Option<String>,
}

impl Default for StorageSettings {
    fn default() -> Self {
        let home = devenv_home();
        Self {
            root: home.join("objects"),
            volumes_root: home.join("volumes"),
            template_key: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum RouteTableKind {
    #[default]
    Memory,
    TraefikFile,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RoutingSettings {
    pub base_domain: String,
    pub table: RouteTableKind,
    pub traefik_dir: PathBuf,
    pub max_disambiguation: u32,
}

impl Default for RoutingSettings {
    fn default() -> Self {
        Self {
            base_domain: "dev.localhost".to_string(),
            table: RouteTableKind::Memory,
            traefik_dir: devenv_home().join("traefik"),
            max_disambiguation: 5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LifecycleSettings {
    pub max_retries: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub backoff_multiplier: f64,
    pub jitter: bool,
    pub call_timeout_secs: u64,
    pub transition_timeout_secs: u64,
    pub health_poll_ms: u64,
}

impl Default for LifecycleSettings {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_backoff_ms: 500,
            max_backoff_ms: 30_000,
            backoff_multiplier: 2.0,
            jitter: true,
            call_timeout_secs: 120,
            transition_timeout_secs: 600,
            health_poll_ms: 500,
        }
    }
}

impl LifecycleSettings {
    pub fn initial_backoff(&self) -> Duration {
        Duration::from_millis(self.initial_backoff_ms)
    }

    pub fn max_backoff(&self) -> Duration {
        Duration::from_millis(self.max_backoff_ms)
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.call_timeout_secs)
    }

    pub fn transition_timeout(&self) -> Duration {
        Duration::from_secs(self.transition_timeout_secs)
    }

    pub fn health_poll(&self) -> Duration {
        Duration::from_millis(self.health_poll_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReaperSettings {
    pub interval_secs: u64,
    pub idle_timeout_secs: u64,
    pub max_concurrent_dehydrations: usize,
}

impl Default for ReaperSettings {
    fn default() -> Self {
        Self {
            interval_secs: 60,
            idle_timeout_secs: 30 * 60,
            max_concurrent_dehydrations: 4,
        }
    }
}

impl ReaperSettings {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthSettings {
    /// Zero disables the periodic health loop
    pub interval_secs: u64,
}

impl Default for HealthSettings {
    fn default() -> Self {
        Self { interval_secs: 30 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiSettings {
    pub bind_addr: String,
}

impl Default for ApiSettings {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:3121".to_string(),
        }
    }
}

fn devenv_home() -> PathBuf {
    if let Ok(path) = std::env::var("DEVENV_HOME") {
        return PathBuf::from(path);
    }
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    PathBuf::from(home).join(".devenv")
}

impl OrchestratorConfig {
    /// Load from `path` (or `$DEVENV_CONFIG`), apply env overrides and validate.
    ///
    /// A missing file is not an error; defaults are used.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = path
            .map(Path::to_path_buf)
            .or_else(|| std::env::var("DEVENV_CONFIG").ok().map(PathBuf::from));

        let mut config = match path {
            Some(path) if path.exists() => {
                let raw = std::fs::read_to_string(&path)?;
                tracing::debug!(path = %path.display(), "loading orchestrator config");
                Self::from_yaml(&raw)?
            }
            Some(path) => {
                tracing::warn!(path = %path.display(), "config file not found, using defaults");
                Self::default()
            }
            None => Self::default(),
        };

        config.apply_overrides(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_yaml(raw: &str) -> Result<Self> {
        serde_yaml_ng::from_str(raw)
            .map_err(|e| DevEnvError::Config(format!("invalid config yaml: {e}")))
    }

    pub fn to_yaml(&self) -> Result<String> {
        serde_yaml_ng::to_string(self)
            .map_err(|e| DevEnvError::Config(format!("failed to serialize config: {e}")))
    }

    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(v) = lookup("DEVENV_DB_PATH") {
            self.registry.db_path = PathBuf::from(v);
        }
        if let Some(v) = lookup("DEVENV_BACKEND") {
            self.backend.kind = BackendKind::parse(&v)
                .ok_or_else(|| DevEnvError::Config(format!("unknown backend kind: {v}")))?;
        }
        if let Some(v) = lookup("DEVENV_BASE_DOMAIN") {
            self.routing.base_domain = v;
        }
        if let Some(v) = lookup("DEVENV_BIND") {
            self.api.bind_addr = v;
        }
        if let Some(v) = lookup("DEVENV_STORAGE_ROOT") {
            self.storage.root = PathBuf::from(v);
        }
        if let Some(v) = lookup("DEVENV_VOLUMES_ROOT") {
            self.storage.volumes_root = PathBuf::from(v);
        }
        if let Some(v) = lookup("DEVENV_IDLE_TIMEOUT_SECS") {
            self.reaper.idle_timeout_secs = parse_number("DEVENV_IDLE_TIMEOUT_SECS", &v)?;
        }
        if let Some(v) = lookup("DEVENV_REAPER_INTERVAL_SECS") {
            self.reaper.interval_secs = parse_number("DEVENV_REAPER_INTERVAL_SECS", &v)?;
        }
        if let Some(v) = lookup("DEVENV_MAX_RETRIES") {
            self.lifecycle.max_retries = parse_number("DEVENV_MAX_RETRIES", &v)?;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        let mut problems = Vec::new();

        if self.routing.base_domain.trim().is_empty() {
            problems.push("routing.base_domain must not be empty".to_string());
        }
        if self.routing.base_domain.starts_with('.') {
            problems.push("routing.base_domain must not start with '.'".to_string());
        }
        if self.lifecycle.backoff_multiplier < 1.0 {
            problems.push("lifecycle.backoff_multiplier must be >= 1.0".to_string());
        }
        if self.lifecycle.initial_backoff_ms > self.lifecycle.max_backoff_ms {
            problems.push("lifecycle.initial_backoff_ms exceeds max_backoff_ms".to_string());
        }
        if self.lifecycle.call_timeout_secs == 0 || self.lifecycle.transition_timeout_secs == 0 {
            problems.push("lifecycle timeouts must be positive".to_string());
        }
        if self.reaper.idle_timeout_secs == 0 {
            problems.push("reaper.idle_timeout_secs must be positive".to_string());
        }
        if self.reaper.interval_secs == 0 {
            problems.push("reaper.interval_secs must be positive".to_string());
        }
        if self.reaper.max_concurrent_dehydrations == 0 {
            problems.push("reaper.max_concurrent_dehydrations must be at least 1".to_string());
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(DevEnvError::Config(problems.join("; ")))
        }
    }
}

fn parse_number<T: std::str::FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .trim()
        .parse()
        .map_err(|_| DevEnvError::Config(format!("{key} must be a number, got '{value}'")))
}
