//! Test fixtures shared by unit tests, integration tests and the API crate.

use crate::orchestrator::{Components, EnvironmentOrchestrator};
use crate::routing::InMemoryRouteTable;
use devenv_config::OrchestratorConfig;
use devenv_core::ManualClock;
use devenv_provider::mock::MockAdapter;
use devenv_snapshot::{FaultyStore, MemoryObjectStore};
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::SqlitePool;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

/// Helper to create an in-memory test database with migrations applied
pub async fn create_test_db() -> SqlitePool {
    // One connection: every connection to `sqlite::memory:` is its own database.
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .expect("Failed to create in-memory database");

    sqlx::migrate!("./migrations")
        .run(&pool)
        .await
        .expect("Failed to run migrations");

    pool
}

/// Configuration with millisecond backoffs and short timeouts.
pub fn fast_config(volumes_root: &std::path::Path) -> OrchestratorConfig {
    let mut config = OrchestratorConfig::default();
    config.storage.volumes_root = volumes_root.to_path_buf();
    config.lifecycle.max_retries = 2;
    config.lifecycle.initial_backoff_ms = 1;
    config.lifecycle.max_backoff_ms = 5;
    config.lifecycle.jitter = false;
    config.lifecycle.call_timeout_secs = 5;
    config.lifecycle.transition_timeout_secs = 30;
    config.lifecycle.health_poll_ms = 5;
    config.reaper.idle_timeout_secs = 30 * 60;
    config
}

/// An orchestrator wired to in-process doubles.
pub struct TestHarness {
    pub orchestrator: EnvironmentOrchestrator,
    pub adapter: MockAdapter,
    pub store: FaultyStore<MemoryObjectStore>,
    pub routes: Arc<InMemoryRouteTable>,
    pub clock: ManualClock,
    pub config: OrchestratorConfig,
    pub volumes: TempDir,
}

impl TestHarness {
    pub async fn new() -> Self {
        Self::with_config(|_| {}).await
    }

    /// Build with `adjust` applied on top of [`fast_config`].
    pub async fn with_config(adjust: impl FnOnce(&mut OrchestratorConfig)) -> Self {
        let volumes = TempDir::new().expect("Failed to create volumes dir");
        let mut config = fast_config(volumes.path());
        adjust(&mut config);

        let adapter = MockAdapter::new();
        let store = FaultyStore::new(MemoryObjectStore::new());
        let routes = Arc::new(InMemoryRouteTable::new());
        let clock = ManualClock::default();

        let orchestrator = EnvironmentOrchestrator::new(
            create_test_db().await,
            &config,
            Components {
                adapter: Arc::new(adapter.clone()),
                store: Arc::new(store.clone()),
                route_table: routes.clone(),
                clock: Arc::new(clock.clone()),
            },
        );

        Self {
            orchestrator,
            adapter,
            store,
            routes,
            clock,
            config,
            volumes,
        }
    }

    /// Create the environment, start it and wait for the start to settle.
    pub async fn running(&self, owner_id: i64, project_id: i64) -> String {
        let env = self
            .orchestrator
            .create_environment(owner_id, project_id)
            .await
            .expect("create");
        self.orchestrator
            .start_environment(&env.id)
            .await
            .expect("start accepted");
        self.settle().await;
        env.id
    }

    /// Wait for background transitions, failing the test if they hang.
    pub async fn settle(&self) {
        tokio::time::timeout(Duration::from_secs(10), self.orchestrator.quiesce())
            .await
            .expect("background transitions did not settle");
    }
}
