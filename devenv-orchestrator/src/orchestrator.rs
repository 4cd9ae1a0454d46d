//! Public entry point of the orchestrator.
//!
//! Synchronous calls (create, touch, status, listings) return their result
//! directly. Start, stop and delete validate the trigger against the current
//! state, hand the work to a tracked background task and return as soon as it
//! was accepted; progress is observable through [`EnvironmentOrchestrator::subscribe`]
//! and the status calls.

use crate::environment::{Environment, EnvironmentFilters, EnvironmentState, EnvironmentStatus};
use crate::error::{OrchestratorError, Result};
use crate::events::{EventBus, LifecycleEvent};
use crate::lifecycle::{HealthOutcome, LifecycleManager, LifecycleParts, Trigger};
use crate::operation::{Operation, OperationStatus, OperationType};
use crate::reaper::{IdleReaper, SweepReport};
use crate::registry::EnvironmentRegistry;
use crate::routing::{
    InMemoryRouteTable, Route, RouteTable, RoutingResolver, TraefikFileRouteTable,
};
use devenv_config::{BackendKind, OrchestratorConfig, RouteTableKind};
use devenv_core::{Clock, KeyedLocks, SystemClock};
use devenv_provider::{create_adapter, BackendAdapter};
use devenv_snapshot::{FsObjectStore, HydrationService, ObjectStore};
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn, Instrument};

/// Reply to an accepted asynchronous trigger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Accepted {
    pub accepted: bool,
    pub environment_id: String,
}

impl Accepted {
    fn new(environment_id: &str) -> Self {
        Self {
            accepted: true,
            environment_id: environment_id.to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthReport {
    pub checked: usize,
    pub healthy: usize,
    pub failed: usize,
    pub skipped: usize,
}

/// Pluggable collaborators. Production builds them from configuration; tests
/// swap in doubles.
pub struct Components {
    pub adapter: Arc<dyn BackendAdapter>,
    pub store: Arc<dyn ObjectStore>,
    pub route_table: Arc<dyn RouteTable>,
    pub clock: Arc<dyn Clock>,
}

impl Components {
    pub fn from_config(config: &OrchestratorConfig) -> Self {
        let route_table: Arc<dyn RouteTable> = match config.routing.table {
            RouteTableKind::Memory => Arc::new(InMemoryRouteTable::new()),
            RouteTableKind::TraefikFile => Arc::new(TraefikFileRouteTable::new(
                config.routing.traefik_dir.clone(),
                config.backend.local.proxy_entrypoint.clone(),
            )),
        };
        Self {
            adapter: create_adapter(&config.backend, config.storage.volumes_root.clone()),
            store: Arc::new(FsObjectStore::new(config.storage.root.clone())),
            route_table,
            clock: Arc::new(SystemClock),
        }
    }
}

#[derive(Clone)]
pub struct EnvironmentOrchestrator {
    registry: EnvironmentRegistry,
    lifecycle: LifecycleManager,
    reaper: IdleReaper,
    tracker: TaskTracker,
    backend_kind: BackendKind,
}

impl EnvironmentOrchestrator {
    pub fn from_config(pool: SqlitePool, config: &OrchestratorConfig) -> Self {
        Self::new(pool, config, Components::from_config(config))
    }

    pub fn new(pool: SqlitePool, config: &OrchestratorConfig, components: Components) -> Self {
        let registry = EnvironmentRegistry::with_clock(pool, components.clock);
        let backend_kind = components.adapter.kind();
        let lifecycle = LifecycleManager::new(
            LifecycleParts {
                registry: registry.clone(),
                adapter: components.adapter,
                hydration: HydrationService::new(
                    components.store,
                    config.storage.volumes_root.clone(),
                    config.storage.template_key.clone(),
                ),
                routing: RoutingResolver::new(components.route_table, &config.routing),
                events: EventBus::default(),
                locks: KeyedLocks::new(),
            },
            &config.lifecycle,
            config.reaper.max_concurrent_dehydrations,
        );
        let reaper = IdleReaper::new(lifecycle.clone(), config.reaper.idle_timeout());

        Self {
            registry,
            lifecycle,
            reaper,
            tracker: TaskTracker::new(),
            backend_kind,
        }
    }

    pub fn registry(&self) -> &EnvironmentRegistry {
        &self.registry
    }

    pub fn lifecycle(&self) -> &LifecycleManager {
        &self.lifecycle
    }

    pub fn backend_kind(&self) -> BackendKind {
        self.backend_kind
    }

    /// Record for `(owner_id, project_id)`; created in `Absent` on first call.
    pub async fn create_environment(&self, owner_id: i64, project_id: i64) -> Result<Environment> {
        if let Some(existing) = self.registry.find(owner_id, project_id).await? {
            return Ok(existing);
        }
        let (env, created) = self
            .registry
            .insert_if_absent(owner_id, project_id, self.backend_kind)
            .await?;
        if !created {
            return Ok(env);
        }
        let op = self
            .registry
            .record_operation(&env.id, OperationType::Create, OperationStatus::Running)
            .await?;
        self.registry
            .complete_operation(&op, OperationStatus::Success, None)
            .await?;
        info!(environment_id = %env.id, owner_id, project_id, "environment created");
        Ok(env)
    }

    pub async fn start_environment(&self, id: &str) -> Result<Accepted> {
        let env = self.registry.load(id).await?;
        // Mid-transition states are fine while an earlier start is pending: a
        // live one absorbs this request, a cancelled one is queued behind.
        if !Trigger::Start.accepts(env.state) && !self.lifecycle.start_pending(id) {
            return Err(OrchestratorError::invalid_transition(env.state, Trigger::Start));
        }

        let Some(pending) = self.lifecycle.begin_start(id) else {
            debug!(environment_id = id, "start already in flight");
            return Ok(Accepted::new(id));
        };

        let lifecycle = self.lifecycle.clone();
        let env_id = id.to_string();
        self.spawn("start", id, async move { lifecycle.start(&env_id, pending).await });
        Ok(Accepted::new(id))
    }

    pub async fn stop_environment(&self, id: &str) -> Result<Accepted> {
        let env = self.registry.load(id).await?;
        if self.lifecycle.cancel_start(id, Trigger::Stop) {
            // The start rolls back, or hibernates if it already came up.
            info!(environment_id = id, "cancelling start in flight");
            return Ok(Accepted::new(id));
        }
        if !Trigger::Stop.accepts(env.state) {
            return Err(OrchestratorError::invalid_transition(env.state, Trigger::Stop));
        }

        let lifecycle = self.lifecycle.clone();
        let env_id = id.to_string();
        self.spawn("stop", id, async move { lifecycle.stop(&env_id).await });
        Ok(Accepted::new(id))
    }

    pub async fn delete_environment(&self, id: &str) -> Result<Accepted> {
        let env = self.registry.load(id).await?;
        let cancelled = self.lifecycle.cancel_start(id, Trigger::Delete);
        if cancelled {
            info!(environment_id = id, "cancelling start in flight");
        } else if !Trigger::Delete.accepts(env.state) {
            return Err(OrchestratorError::invalid_transition(env.state, Trigger::Delete));
        }

        let lifecycle = self.lifecycle.clone();
        let env_id = id.to_string();
        self.spawn("delete", id, async move { lifecycle.delete(&env_id).await });
        Ok(Accepted::new(id))
    }

    /// Refresh `last_active_at`; an idle environment is woken up.
    pub async fn touch_environment(&self, id: &str) -> Result<EnvironmentStatus> {
        let env = self.lifecycle.touch(id).await?;
        Ok(EnvironmentStatus::from(&env))
    }

    pub async fn get_status(&self, id: &str) -> Result<EnvironmentStatus> {
        let env = self.registry.load(id).await?;
        Ok(EnvironmentStatus::from(&env))
    }

    pub async fn get_environment(&self, id: &str) -> Result<Environment> {
        self.registry.load(id).await
    }

    pub async fn list_environments(&self, filters: &EnvironmentFilters) -> Result<Vec<Environment>> {
        self.registry.list(filters).await
    }

    pub async fn list_operations(&self, id: &str) -> Result<Vec<Operation>> {
        self.registry.load(id).await?;
        self.registry.list_operations(id).await
    }

    pub async fn lookup_route(&self, host: &str) -> Result<Option<Route>> {
        Ok(self.lifecycle.routing().lookup(host).await?)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LifecycleEvent> {
        self.lifecycle.events().subscribe()
    }

    pub async fn run_reaper_sweep(&self) -> Result<SweepReport> {
        self.reaper.sweep().await
    }

    /// Probe every running environment once.
    pub async fn run_health_checks(&self) -> Result<HealthReport> {
        let running = self
            .registry
            .list_by_state(EnvironmentState::Running)
            .await?;
        let mut report = HealthReport {
            checked: running.len(),
            ..HealthReport::default()
        };
        for env in running {
            match self.lifecycle.check_health(&env.id).await {
                Ok(HealthOutcome::Healthy) => report.healthy += 1,
                Ok(HealthOutcome::Failed) => report.failed += 1,
                Ok(HealthOutcome::Skipped) => report.skipped += 1,
                Err(e) => {
                    warn!(environment_id = %env.id, error = %e, "health check failed");
                    report.skipped += 1;
                }
            }
        }
        if report.failed > 0 {
            warn!(failed = report.failed, "unreachable environments torn down");
        }
        Ok(report)
    }

    /// Settle records a previous process left mid-transition.
    pub async fn recover_interrupted(&self) -> Result<usize> {
        self.lifecycle.recover_interrupted().await
    }

    /// Wait until no background transition is running.
    pub async fn quiesce(&self) {
        while !self.tracker.is_empty() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    /// Cancel pending starts and wait for every background task to finish.
    pub async fn shutdown(&self) {
        info!(in_flight = self.tracker.len(), "shutting down orchestrator");
        self.lifecycle.cancel_all();
        self.tracker.close();
        self.tracker.wait().await;
    }

    fn spawn<F>(&self, trigger: &'static str, id: &str, work: F)
    where
        F: Future<Output = Result<()>> + Send + 'static,
    {
        let span = tracing::info_span!("transition", trigger, environment_id = %id);
        self.tracker.spawn(
            async move {
                if let Err(e) = work.await {
                    warn!(error = %e, kind = %e.kind(), "background transition failed");
                }
            }
            .instrument(span),
        );
    }
}
