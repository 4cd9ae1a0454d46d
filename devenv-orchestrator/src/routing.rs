//! Host names and the route table behind them.
//!
//! Each running environment answers on `user{owner}-project{project}.{domain}`.
//! The route table maps that host to the backend upstream; when the host is
//! already owned by another environment the resolver falls back to
//! `user{owner}-project{project}-{n}.{domain}`.

use async_trait::async_trait;
use devenv_config::RoutingSettings;
use devenv_core::{DevEnvError, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Route {
    pub host: String,
    pub environment_id: String,
    pub upstream: String,
}

#[async_trait]
pub trait RouteTable: Send + Sync {
    /// Map `host` to `upstream` for `environment_id`, replacing any earlier
    /// route of that environment. Fails with `RoutingConflict` when another
    /// environment owns the host.
    async fn publish(&self, host: &str, environment_id: &str, upstream: &str) -> Result<()>;

    /// Remove the environment's route. Withdrawing twice succeeds.
    async fn withdraw(&self, environment_id: &str) -> Result<()>;

    async fn lookup(&self, host: &str) -> Result<Option<Route>>;
}

#[derive(Debug, Default)]
pub struct InMemoryRouteTable {
    routes: RwLock<HashMap<String, Route>>,
}

impl InMemoryRouteTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn routes(&self) -> Vec<Route> {
        let routes = self.routes.read().unwrap_or_else(|e| e.into_inner());
        let mut all: Vec<Route> = routes.values().cloned().collect();
        all.sort_by(|a, b| a.host.cmp(&b.host));
        all
    }
}

#[async_trait]
impl RouteTable for InMemoryRouteTable {
    async fn publish(&self, host: &str, environment_id: &str, upstream: &str) -> Result<()> {
        let mut routes = self.routes.write().unwrap_or_else(|e| e.into_inner());
        if let Some(existing) = routes.get(host) {
            if existing.environment_id != environment_id {
                return Err(DevEnvError::RoutingConflict(host.to_string()));
            }
        }
        routes.retain(|_, route| route.environment_id != environment_id);
        routes.insert(
            host.to_string(),
            Route {
                host: host.to_string(),
                environment_id: environment_id.to_string(),
                upstream: upstream.to_string(),
            },
        );
        Ok(())
    }

    async fn withdraw(&self, environment_id: &str) -> Result<()> {
        let mut routes = self.routes.write().unwrap_or_else(|e| e.into_inner());
        routes.retain(|_, route| route.environment_id != environment_id);
        Ok(())
    }

    async fn lookup(&self, host: &str) -> Result<Option<Route>> {
        let routes = self.routes.read().unwrap_or_else(|e| e.into_inner());
        Ok(routes.get(host).cloned())
    }
}

// Traefik dynamic configuration, file provider flavour.
#[derive(Debug, Serialize, Deserialize)]
struct DynamicConfig {
    http: HttpConfig,
}

#[derive(Debug, Serialize, Deserialize)]
struct HttpConfig {
    routers: BTreeMap<String, RouterConfig>,
    services: BTreeMap<String, ServiceConfig>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RouterConfig {
    rule: String,
    service: String,
    entry_points: Vec<String>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ServiceConfig {
    load_balancer: LoadBalancer,
}

#[derive(Debug, Serialize, Deserialize)]
struct LoadBalancer {
    servers: Vec<Server>,
}

#[derive(Debug, Serialize, Deserialize)]
struct Server {
    url: String,
}

const ROUTER_PREFIX: &str = "devenv-";

/// One Traefik dynamic-configuration file per environment, watched by Traefik's file provider.
#[derive(Debug)]
pub struct TraefikFileRouteTable {
    dir: PathBuf,
    entrypoint: String,
    // Conflict check and write must not interleave.
    write_lock: Mutex<()>,
}

impl TraefikFileRouteTable {
    pub fn new(dir: impl Into<PathBuf>, entrypoint: impl Into<String>) -> Self {
        Self {
            dir: dir.into(),
            entrypoint: entrypoint.into(),
            write_lock: Mutex::new(()),
        }
    }

    fn file_for(&self, environment_id: &str) -> PathBuf {
        self.dir.join(format!("{ROUTER_PREFIX}{environment_id}.yml"))
    }

    fn render(&self, host: &str, environment_id: &str, upstream: &str) -> Result<String> {
        let name = format!("{ROUTER_PREFIX}{environment_id}");
        let config = DynamicConfig {
            http: HttpConfig {
                routers: BTreeMap::from([(
                    name.clone(),
                    RouterConfig {
                        rule: format!("Host(`{host}`)"),
                        service: name.clone(),
                        entry_points: vec![self.entrypoint.clone()],
                    },
                )]),
                services: BTreeMap::from([(
                    name,
                    ServiceConfig {
                        load_balancer: LoadBalancer {
                            servers: vec![Server {
                                url: upstream.to_string(),
                            }],
                        },
                    },
                )]),
            },
        };
        serde_yaml_ng::to_string(&config)
            .map_err(|e| DevEnvError::internal(format!("failed to render route: {e}")))
    }

    fn parse(raw: &str) -> Option<Route> {
        let config: DynamicConfig = serde_yaml_ng::from_str(raw).ok()?;
        let (name, router) = config.http.routers.into_iter().next()?;
        let environment_id = name.strip_prefix(ROUTER_PREFIX)?.to_string();
        let host = router
            .rule
            .strip_prefix("Host(`")?
            .strip_suffix("`)")?
            .to_string();
        let upstream = config
            .http
            .services
            .get(&router.service)?
            .load_balancer
            .servers
            .first()?
            .url
            .clone();
        Some(Route {
            host,
            environment_id,
            upstream,
        })
    }

    async fn read_routes(&self) -> Result<Vec<Route>> {
        let mut routes = Vec::new();
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(routes),
            Err(e) => return Err(e.into()),
        };
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("yml") {
                continue;
            }
            let raw = tokio::fs::read_to_string(&path).await?;
            match Self::parse(&raw) {
                Some(route) => routes.push(route),
                None => warn!(path = %path.display(), "ignoring unreadable route file"),
            }
        }
        Ok(routes)
    }

    async fn write_atomic(path: &Path, contents: String) -> Result<()> {
        let tmp = path.with_extension("yml.tmp");
        tokio::fs::write(&tmp, contents).await?;
        if let Err(e) = tokio::fs::rename(&tmp, path).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(e.into());
        }
        Ok(())
    }
}

#[async_trait]
impl RouteTable for TraefikFileRouteTable {
    async fn publish(&self, host: &str, environment_id: &str, upstream: &str) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let conflict = self
            .read_routes()
            .await?
            .into_iter()
            .any(|route| route.host == host && route.environment_id != environment_id);
        if conflict {
            return Err(DevEnvError::RoutingConflict(host.to_string()));
        }

        tokio::fs::create_dir_all(&self.dir).await?;
        let contents = self.render(host, environment_id, upstream)?;
        Self::write_atomic(&self.file_for(environment_id), contents).await?;
        debug!(host, environment_id, "route file written");
        Ok(())
    }

    async fn withdraw(&self, environment_id: &str) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        match tokio::fs::remove_file(self.file_for(environment_id)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn lookup(&self, host: &str) -> Result<Option<Route>> {
        Ok(self
            .read_routes()
            .await?
            .into_iter()
            .find(|route| route.host == host))
    }
}

/// Computes hosts and publishes them, disambiguating on conflict.
#[derive(Clone)]
pub struct RoutingResolver {
    table: Arc<dyn RouteTable>,
    base_domain: String,
    max_disambiguation: u32,
}

impl RoutingResolver {
    pub fn new(table: Arc<dyn RouteTable>, settings: &RoutingSettings) -> Self {
        Self {
            table,
            base_domain: settings.base_domain.clone(),
            max_disambiguation: settings.max_disambiguation,
        }
    }

    pub fn table(&self) -> &Arc<dyn RouteTable> {
        &self.table
    }

    pub fn host_for(&self, owner_id: i64, project_id: i64) -> String {
        self.candidate(owner_id, project_id, 0)
    }

    fn candidate(&self, owner_id: i64, project_id: i64, attempt: u32) -> String {
        if attempt == 0 {
            format!("user{owner_id}-project{project_id}.{}", self.base_domain)
        } else {
            format!(
                "user{owner_id}-project{project_id}-{attempt}.{}",
                self.base_domain
            )
        }
    }

    /// Publish a route for the environment and return the host it got.
    pub async fn publish(
        &self,
        environment_id: &str,
        owner_id: i64,
        project_id: i64,
        upstream: &str,
    ) -> Result<String> {
        for attempt in 0..=self.max_disambiguation {
            let host = self.candidate(owner_id, project_id, attempt);
            match self.table.publish(&host, environment_id, upstream).await {
                Ok(()) => {
                    info!(environment_id, host = %host, upstream, "route published");
                    return Ok(host);
                }
                Err(DevEnvError::RoutingConflict(_)) => {
                    warn!(environment_id, host = %host, attempt, "host taken, disambiguating");
                }
                Err(e) => return Err(e),
            }
        }
        Err(DevEnvError::RoutingConflict(self.host_for(owner_id, project_id)))
    }

    pub async fn withdraw(&self, environment_id: &str) -> Result<()> {
        self.table.withdraw(environment_id).await?;
        debug!(environment_id, "route withdrawn");
        Ok(())
    }

    pub async fn lookup(&self, host: &str) -> Result<Option<Route>> {
        self.table.lookup(host).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use devenv_core::ErrorKind;
    use tempfile::TempDir;

    fn settings(max: u32) -> RoutingSettings {
        RoutingSettings {
            base_domain: "dev.example.com".into(),
            max_disambiguation: max,
            ..Default::default()
        }
    }

    #[test]
    fn test_host_formula() {
        let resolver = RoutingResolver::new(Arc::new(InMemoryRouteTable::new()), &settings(5));
        assert_eq!(resolver.host_for(42, 7), "user42-project7.dev.example.com");
    }

    #[tokio::test]
    async fn test_conflict_is_disambiguated() {
        let table = Arc::new(InMemoryRouteTable::new());
        table
            .publish("user42-project7.dev.example.com", "squatter", "http://other")
            .await
            .unwrap();
        let resolver = RoutingResolver::new(table.clone(), &settings(5));

        let host = resolver.publish("env-1", 42, 7, "http://up").await.unwrap();
        assert_eq!(host, "user42-project7-1.dev.example.com");
        assert_eq!(
            resolver.lookup(&host).await.unwrap().unwrap().environment_id,
            "env-1"
        );
    }

    #[tokio::test]
    async fn test_conflicts_exhaust() {
        let table = Arc::new(InMemoryRouteTable::new());
        table
            .publish("user1-project1.dev.example.com", "a", "x")
            .await
            .unwrap();
        table
            .publish("user1-project1-1.dev.example.com", "b", "x")
            .await
            .unwrap();
        let resolver = RoutingResolver::new(table, &settings(1));
        let err = resolver.publish("c", 1, 1, "x").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::RoutingConflict);
    }

    #[tokio::test]
    async fn test_republish_replaces_and_withdraw_is_idempotent() {
        let table = InMemoryRouteTable::new();
        table.publish("a.example", "env", "http://one").await.unwrap();
        table.publish("b.example", "env", "http://two").await.unwrap();
        assert!(table.lookup("a.example").await.unwrap().is_none());
        assert_eq!(table.routes().len(), 1);

        table.withdraw("env").await.unwrap();
        table.withdraw("env").await.unwrap();
        assert!(table.routes().is_empty());
    }

    #[tokio::test]
    async fn test_traefik_file_table() {
        let dir = TempDir::new().unwrap();
        let table = TraefikFileRouteTable::new(dir.path().join("dynamic"), "web");

        table
            .publish("user1-project2.dev.localhost", "env-1", "http://devenv-u1-p2:8080")
            .await
            .unwrap();
        let raw = std::fs::read_to_string(dir.path().join("dynamic/devenv-env-1.yml")).unwrap();
        assert!(raw.contains("Host(`user1-project2.dev.localhost`)"));
        assert!(raw.contains("http://devenv-u1-p2:8080"));

        let route = table
            .lookup("user1-project2.dev.localhost")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(route.environment_id, "env-1");
        assert_eq!(route.upstream, "http://devenv-u1-p2:8080");

        let err = table
            .publish("user1-project2.dev.localhost", "env-2", "http://x")
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::RoutingConflict);

        table.withdraw("env-1").await.unwrap();
        table.withdraw("env-1").await.unwrap();
        assert!(table
            .lookup("user1-project2.dev.localhost")
            .await
            .unwrap()
            .is_none());
    }
}
