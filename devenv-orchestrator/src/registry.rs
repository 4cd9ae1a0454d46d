//! Persistent store of environment records.
//!
//! Every write goes through [`EnvironmentRegistry::compare_and_swap`], which
//! checks the caller's version, the state graph and the field invariants
//! before touching the row, and bumps `version` on success.

use crate::environment::{Environment, EnvironmentFilters, EnvironmentState};
use crate::error::{OrchestratorError, Result};
use crate::operation::{Operation, OperationStatus, OperationType};
use chrono::{DateTime, Utc};
use devenv_config::BackendKind;
use devenv_core::{Clock, SystemClock, VolumeRef};
use sqlx::SqlitePool;
use std::sync::Arc;
use tracing::{debug, instrument};
use uuid::Uuid;

#[derive(Clone)]
pub struct EnvironmentRegistry {
    pool: SqlitePool,
    clock: Arc<dyn Clock>,
}

impl EnvironmentRegistry {
    pub fn new(pool: SqlitePool) -> Self {
        Self::with_clock(pool, Arc::new(SystemClock))
    }

    pub fn with_clock(pool: SqlitePool, clock: Arc<dyn Clock>) -> Self {
        Self { pool, clock }
    }

    /// Get a reference to the database pool
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// Record for `(owner_id, project_id)`, created in `Absent` on first use.
    #[instrument(skip(self))]
    pub async fn get_or_create(
        &self,
        owner_id: i64,
        project_id: i64,
        backend_kind: BackendKind,
    ) -> Result<Environment> {
        let (env, _) = self.insert_if_absent(owner_id, project_id, backend_kind).await?;
        Ok(env)
    }

    /// Like [`get_or_create`](Self::get_or_create), also reporting whether this
    /// call inserted the row.
    pub async fn insert_if_absent(
        &self,
        owner_id: i64,
        project_id: i64,
        backend_kind: BackendKind,
    ) -> Result<(Environment, bool)> {
        let now = self.clock.now().timestamp_millis();

        let inserted = sqlx::query(
            r#"
            INSERT INTO environments (id, owner_id, project_id, backend_kind, state, last_active_at, version, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, 0, ?, ?)
            ON CONFLICT (owner_id, project_id) DO NOTHING
            "#,
        )
        .bind(Uuid::new_v4().to_string())
        .bind(owner_id)
        .bind(project_id)
        .bind(backend_kind.as_str())
        .bind(EnvironmentState::Absent)
        .bind(now)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await?;

        let created = inserted.rows_affected() > 0;
        if created {
            debug!(owner_id, project_id, "environment record created");
        }

        let env = self.find(owner_id, project_id).await?.ok_or_else(|| {
            OrchestratorError::NotFound(format!("owner {owner_id} project {project_id}"))
        })?;
        Ok((env, created))
    }

    pub async fn load(&self, id: &str) -> Result<Environment> {
        let row = sqlx::query_as::<_, EnvironmentRow>("SELECT * FROM environments WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| OrchestratorError::NotFound(id.to_string()))?;

        row.try_into()
    }

    pub async fn find(&self, owner_id: i64, project_id: i64) -> Result<Option<Environment>> {
        let row = sqlx::query_as::<_, EnvironmentRow>(
            "SELECT * FROM environments WHERE owner_id = ? AND project_id = ?",
        )
        .bind(owner_id)
        .bind(project_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(TryInto::try_into).transpose()
    }

    /// Apply `mutation` to the record at `expected_version` and persist it.
    ///
    /// Fails with `ConcurrentModification` when the stored version differs,
    /// `InvalidTransition` when the state change is not an edge of the graph,
    /// and `InvariantViolation` when the result breaks a field rule. Nothing is
    /// written in any of those cases.
    #[instrument(skip(self, mutation), fields(environment_id = %id))]
    pub async fn compare_and_swap<F>(
        &self,
        id: &str,
        expected_version: i64,
        mutation: F,
    ) -> Result<Environment>
    where
        F: FnOnce(&mut Environment),
    {
        let current = self.load(id).await?;
        if current.version != expected_version {
            return Err(OrchestratorError::ConcurrentModification {
                id: id.to_string(),
                expected_version,
            });
        }

        let mut next = current.clone();
        mutation(&mut next);

        if next.state != current.state && !current.state.can_transition_to(next.state) {
            return Err(OrchestratorError::invalid_transition(
                current.state,
                format!("move to {}", next.state),
            ));
        }
        next.check_invariants()
            .map_err(OrchestratorError::InvariantViolation)?;

        // Identity is not the mutation's to change.
        next.id = current.id.clone();
        next.owner_id = current.owner_id;
        next.project_id = current.project_id;
        next.created_at = current.created_at;
        next.version = expected_version + 1;
        next.updated_at = truncate_millis(self.clock.now());
        next.last_active_at = truncate_millis(next.last_active_at);

        let handle = next
            .backend_handle
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;
        let last_error = next
            .last_error
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;

        let result = sqlx::query(
            r#"
            UPDATE environments
            SET backend_kind = ?, state = ?, backend_handle = ?, volume_ref = ?, host = ?,
                last_active_at = ?, version = ?, last_error = ?, updated_at = ?
            WHERE id = ? AND version = ?
            "#,
        )
        .bind(next.backend_kind.as_str())
        .bind(next.state)
        .bind(handle)
        .bind(next.volume_ref.as_ref().map(|v| v.as_str().to_string()))
        .bind(&next.host)
        .bind(next.last_active_at.timestamp_millis())
        .bind(next.version)
        .bind(last_error)
        .bind(next.updated_at.timestamp_millis())
        .bind(id)
        .bind(expected_version)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(OrchestratorError::ConcurrentModification {
                id: id.to_string(),
                expected_version,
            });
        }

        if next.state != current.state {
            debug!(
                environment_id = %id,
                from = %current.state,
                to = %next.state,
                version = next.version,
                "state persisted"
            );
        }
        Ok(next)
    }

    /// Running or idle records whose last activity is strictly before `older_than`.
    pub async fn list_idle(&self, older_than: DateTime<Utc>) -> Result<Vec<Environment>> {
        let rows = sqlx::query_as::<_, EnvironmentRow>(
            "SELECT * FROM environments
             WHERE state IN (?, ?) AND last_active_at < ?
             ORDER BY last_active_at ASC",
        )
        .bind(EnvironmentState::Running)
        .bind(EnvironmentState::Idle)
        .bind(older_than.timestamp_millis())
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(TryInto::try_into).collect()
    }

    /// List environments with optional filters
    pub async fn list(&self, filters: &EnvironmentFilters) -> Result<Vec<Environment>> {
        let mut query = "SELECT * FROM environments WHERE 1=1".to_string();

        if filters.owner_id.is_some() {
            query.push_str(" AND owner_id = ?");
        }
        if filters.state.is_some() {
            query.push_str(" AND state = ?");
        }

        query.push_str(" ORDER BY created_at DESC, id ASC");

        let mut q = sqlx::query_as::<_, EnvironmentRow>(&query);

        if let Some(owner_id) = filters.owner_id {
            q = q.bind(owner_id);
        }
        if let Some(state) = filters.state {
            q = q.bind(state);
        }

        let rows = q.fetch_all(&self.pool).await?;

        rows.into_iter().map(TryInto::try_into).collect()
    }

    pub async fn list_by_state(&self, state: EnvironmentState) -> Result<Vec<Environment>> {
        self.list(&EnvironmentFilters {
            owner_id: None,
            state: Some(state),
        })
        .await
    }

    /// Physically remove an `Absent` record and its operations log.
    #[instrument(skip(self))]
    pub async fn purge(&self, id: &str) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        let result = sqlx::query("DELETE FROM environments WHERE id = ? AND state = ?")
            .bind(id)
            .bind(EnvironmentState::Absent)
            .execute(&mut *tx)
            .await?;

        if result.rows_affected() == 0 {
            tx.rollback().await?;
            let env = self.load(id).await?;
            return Err(OrchestratorError::invalid_transition(env.state, "purge"));
        }

        sqlx::query("DELETE FROM operations WHERE environment_id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(())
    }

    /// Record an operation for tracking
    pub async fn record_operation(
        &self,
        environment_id: &str,
        operation_type: OperationType,
        status: OperationStatus,
    ) -> Result<String> {
        let id = Uuid::new_v4().to_string();
        let now = self.clock.now().timestamp_millis();

        sqlx::query(
            "INSERT INTO operations (id, environment_id, operation_type, status, started_at)
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(&id)
        .bind(environment_id)
        .bind(operation_type)
        .bind(status)
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok(id)
    }

    /// Mark a recorded operation as finished.
    pub async fn complete_operation(
        &self,
        operation_id: &str,
        status: OperationStatus,
        error: Option<String>,
    ) -> Result<()> {
        let now = self.clock.now().timestamp_millis();

        sqlx::query("UPDATE operations SET status = ?, completed_at = ?, error = ? WHERE id = ?")
            .bind(status)
            .bind(now)
            .bind(error)
            .bind(operation_id)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    /// Operations of one environment, newest first.
    pub async fn list_operations(&self, environment_id: &str) -> Result<Vec<Operation>> {
        let rows = sqlx::query_as::<_, OperationRow>(
            "SELECT * FROM operations WHERE environment_id = ? ORDER BY started_at DESC, rowid DESC",
        )
        .bind(environment_id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(TryInto::try_into).collect()
    }
}

// Internal row types for sqlx
#[derive(sqlx::FromRow)]
struct EnvironmentRow {
    id: String,
    owner_id: i64,
    project_id: i64,
    backend_kind: String,
    state: EnvironmentState,
    backend_handle: Option<String>,
    volume_ref: Option<String>,
    host: Option<String>,
    last_active_at: i64,
    version: i64,
    last_error: Option<String>,
    created_at: i64,
    updated_at: i64,
}

#[derive(sqlx::FromRow)]
struct OperationRow {
    id: String,
    environment_id: String,
    operation_type: OperationType,
    status: OperationStatus,
    started_at: i64,
    completed_at: Option<i64>,
    error: Option<String>,
}

/// Stored precision, so returned records equal what a later load yields.
fn truncate_millis(at: DateTime<Utc>) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(at.timestamp_millis()).unwrap_or(at)
}

fn from_millis(column: &str, millis: i64) -> Result<DateTime<Utc>> {
    DateTime::from_timestamp_millis(millis).ok_or_else(|| {
        OrchestratorError::InvariantViolation(format!("{column} out of range: {millis}"))
    })
}

impl TryFrom<EnvironmentRow> for Environment {
    type Error = OrchestratorError;

    fn try_from(row: EnvironmentRow) -> Result<Self> {
        let backend_kind = BackendKind::parse(&row.backend_kind).ok_or_else(|| {
            OrchestratorError::InvariantViolation(format!(
                "unknown backend kind '{}'",
                row.backend_kind
            ))
        })?;

        Ok(Self {
            backend_kind,
            state: row.state,
            backend_handle: row
                .backend_handle
                .as_deref()
                .map(serde_json::from_str)
                .transpose()?,
            volume_ref: row.volume_ref.map(VolumeRef::from_raw),
            host: row.host,
            last_active_at: from_millis("last_active_at", row.last_active_at)?,
            version: row.version,
            last_error: row
                .last_error
                .as_deref()
                .map(serde_json::from_str)
                .transpose()?,
            created_at: from_millis("created_at", row.created_at)?,
            updated_at: from_millis("updated_at", row.updated_at)?,
            id: row.id,
            owner_id: row.owner_id,
            project_id: row.project_id,
        })
    }
}

impl TryFrom<OperationRow> for Operation {
    type Error = OrchestratorError;

    fn try_from(row: OperationRow) -> Result<Self> {
        Ok(Self {
            started_at: from_millis("started_at", row.started_at)?,
            completed_at: row
                .completed_at
                .map(|ts| from_millis("completed_at", ts))
                .transpose()?,
            id: row.id,
            environment_id: row.environment_id,
            operation_type: row.operation_type,
            status: row.status,
            error: row.error,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::create_test_db;
    use chrono::Duration;
    use devenv_core::{ErrorKind, ManualClock};

    async fn registry() -> (EnvironmentRegistry, ManualClock) {
        let clock = ManualClock::default();
        let registry = EnvironmentRegistry::with_clock(create_test_db().await, Arc::new(clock.clone()));
        (registry, clock)
    }

    #[tokio::test]
    async fn test_get_or_create_is_idempotent() {
        let (registry, _) = registry().await;
        let first = registry.get_or_create(42, 7, BackendKind::Local).await.unwrap();
        let second = registry.get_or_create(42, 7, BackendKind::Local).await.unwrap();

        assert_eq!(first.id, second.id);
        assert_eq!(first.state, EnvironmentState::Absent);
        assert_eq!(first.version, 0);
        assert_eq!(registry.list(&EnvironmentFilters::default()).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_load_missing_is_not_found() {
        let (registry, _) = registry().await;
        let err = registry.load("nope").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn test_compare_and_swap_bumps_version_and_rejects_stale() {
        let (registry, _) = registry().await;
        let env = registry.get_or_create(1, 2, BackendKind::Local).await.unwrap();

        let updated = registry
            .compare_and_swap(&env.id, 0, |e| {
                e.state = EnvironmentState::Provisioning;
                e.volume_ref = Some(VolumeRef::for_project(1, 2));
            })
            .await
            .unwrap();
        assert_eq!(updated.version, 1);
        assert_eq!(registry.load(&env.id).await.unwrap(), updated);

        let err = registry
            .compare_and_swap(&env.id, 0, |e| e.state = EnvironmentState::Failed)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ConcurrentModification);
        assert_eq!(registry.load(&env.id).await.unwrap().version, 1);
    }

    #[tokio::test]
    async fn test_compare_and_swap_rejects_off_graph_and_invariant_breaks() {
        let (registry, _) = registry().await;
        let env = registry.get_or_create(1, 2, BackendKind::Local).await.unwrap();

        let err = registry
            .compare_and_swap(&env.id, 0, |e| {
                e.state = EnvironmentState::Running;
                e.host = Some("h".into());
            })
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidTransition);

        // Provisioning without a volume breaks a field rule.
        let err = registry
            .compare_and_swap(&env.id, 0, |e| e.state = EnvironmentState::Provisioning)
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::InvariantViolation(_)));

        let unchanged = registry.load(&env.id).await.unwrap();
        assert_eq!(unchanged.version, 0);
        assert_eq!(unchanged.state, EnvironmentState::Absent);
    }

    #[tokio::test]
    async fn test_list_idle_uses_strict_cutoff() {
        let (registry, clock) = registry().await;
        let env = registry.get_or_create(1, 2, BackendKind::Local).await.unwrap();
        let env = registry
            .compare_and_swap(&env.id, 0, |e| {
                e.state = EnvironmentState::Provisioning;
                e.volume_ref = Some(VolumeRef::for_project(1, 2));
            })
            .await
            .unwrap();
        let env = registry
            .compare_and_swap(&env.id, env.version, |e| {
                e.state = EnvironmentState::Hydrating;
                e.backend_handle = Some(devenv_provider::BackendHandle::Container {
                    name: "n".into(),
                    id: "i".into(),
                });
            })
            .await
            .unwrap();
        let active_at = clock.now();
        registry
            .compare_and_swap(&env.id, env.version, |e| {
                e.state = EnvironmentState::Running;
                e.host = Some("user1-project2.dev.localhost".into());
                e.last_active_at = active_at;
            })
            .await
            .unwrap();

        assert!(registry.list_idle(active_at).await.unwrap().is_empty());
        let later = active_at + Duration::milliseconds(1);
        assert_eq!(registry.list_idle(later).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_filters_and_purge() {
        let (registry, _) = registry().await;
        let a = registry.get_or_create(1, 1, BackendKind::Local).await.unwrap();
        registry.get_or_create(1, 2, BackendKind::Local).await.unwrap();
        registry.get_or_create(2, 1, BackendKind::Cluster).await.unwrap();

        let owned = registry
            .list(&EnvironmentFilters {
                owner_id: Some(1),
                state: None,
            })
            .await
            .unwrap();
        assert_eq!(owned.len(), 2);
        assert_eq!(
            registry.list_by_state(EnvironmentState::Absent).await.unwrap().len(),
            3
        );

        registry
            .record_operation(&a.id, OperationType::Create, OperationStatus::Success)
            .await
            .unwrap();
        registry.purge(&a.id).await.unwrap();
        assert_eq!(registry.load(&a.id).await.unwrap_err().kind(), ErrorKind::NotFound);
        assert!(registry.list_operations(&a.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_operations_log() {
        let (registry, _) = registry().await;
        let env = registry.get_or_create(1, 1, BackendKind::Local).await.unwrap();

        let op = registry
            .record_operation(&env.id, OperationType::Start, OperationStatus::Running)
            .await
            .unwrap();
        registry
            .complete_operation(&op, OperationStatus::Failed, Some("quota".into()))
            .await
            .unwrap();

        let ops = registry.list_operations(&env.id).await.unwrap();
        assert_eq!(ops.len(), 1);
        assert_eq!(ops[0].operation_type, OperationType::Start);
        assert_eq!(ops[0].status, OperationStatus::Failed);
        assert_eq!(ops[0].error.as_deref(), Some("quota"));
        assert!(ops[0].completed_at.is_some());
    }
}
