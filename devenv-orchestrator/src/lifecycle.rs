//! The environment state machine.
//!
//! Every trigger runs under the per-environment lock and moves the record
//! through the registry's compare-and-swap, one graph edge at a time. Each
//! persisted change is announced on the [`EventBus`]. Backend and storage
//! calls go through the [`RetryPolicy`]; a whole transition is additionally
//! bounded by the transition timeout.
//!
//! A start in flight can be cancelled by a stop or delete. Cancellation is
//! checked between steps; the start then rolls back to the resting state it
//! came from, deleting the partially provisioned workload and discarding the
//! volume.

use crate::environment::{Environment, EnvironmentState};
use crate::error::{OrchestratorError, Result};
use crate::events::{EventBus, LifecycleEvent};
use crate::operation::{OperationStatus, OperationType};
use crate::registry::EnvironmentRegistry;
use crate::retry::RetryPolicy;
use crate::routing::RoutingResolver;
use devenv_config::LifecycleSettings;
use devenv_core::{
    Clock, DevEnvError, ErrorKind, ErrorSummary, KeyedGuard, KeyedLocks, VolumeRef,
};
use devenv_provider::{BackendAdapter, BackendHandle, HealthStatus, ProvisionSpec};
use devenv_snapshot::HydrationService;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use EnvironmentState::*;

/// Attempts for a lock holder whose write raced a touch.
const CAS_ATTEMPTS: usize = 3;
/// Attempts for a touch that keeps losing to other writers.
const TOUCH_ATTEMPTS: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    Start,
    Stop,
    Touch,
    IdleTimeout,
    Delete,
    HealthCheckFailure,
}

impl Trigger {
    pub fn as_str(self) -> &'static str {
        match self {
            Trigger::Start => "start",
            Trigger::Stop => "stop",
            Trigger::Touch => "touch",
            Trigger::IdleTimeout => "idle_timeout",
            Trigger::Delete => "delete",
            Trigger::HealthCheckFailure => "health_check_failure",
        }
    }

    /// States a caller may fire this trigger from.
    ///
    /// Stop and delete are also accepted while a start is in flight; that case
    /// is decided by whoever owns the pending-start registry.
    pub fn accepts(self, state: EnvironmentState) -> bool {
        match self {
            Trigger::Start => matches!(state, Absent | Hibernated | Failed),
            Trigger::Stop => matches!(state, Running | Idle),
            Trigger::Touch => matches!(state, Running | Idle),
            Trigger::IdleTimeout => matches!(state, Running | Idle),
            Trigger::Delete => matches!(state, Absent | Running | Idle | Hibernated | Failed),
            Trigger::HealthCheckFailure => state == Running,
        }
    }
}

impl fmt::Display for Trigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Ticket for a start that has been accepted but not finished.
#[derive(Debug, Clone)]
pub struct PendingStart {
    seq: u64,
    token: CancellationToken,
    /// Set when the cancelling trigger was a stop.
    stop_requested: Arc<AtomicBool>,
}

impl PendingStart {
    fn new(seq: u64) -> Self {
        Self {
            seq,
            token: CancellationToken::new(),
            stop_requested: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }
}

/// What the reaper got out of one idle candidate.
#[derive(Debug, Clone, PartialEq)]
pub enum IdleOutcome {
    Hibernated,
    /// Touched since the candidate list was read.
    Active,
    /// No longer running or idle.
    NotEligible,
    Failed(ErrorSummary),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthOutcome {
    Healthy,
    /// Torn down and marked failed.
    Failed,
    /// Busy, not running, or the probe itself errored.
    Skipped,
}

/// Collaborators the state machine drives.
pub struct LifecycleParts {
    pub registry: EnvironmentRegistry,
    pub adapter: Arc<dyn BackendAdapter>,
    pub hydration: HydrationService,
    pub routing: RoutingResolver,
    pub events: EventBus,
    pub locks: KeyedLocks,
}

struct Inner {
    registry: EnvironmentRegistry,
    adapter: Arc<dyn BackendAdapter>,
    hydration: HydrationService,
    routing: RoutingResolver,
    events: EventBus,
    locks: KeyedLocks,
    clock: Arc<dyn Clock>,
    retry: RetryPolicy,
    transition_timeout: Duration,
    health_poll: Duration,
    dehydrations: Semaphore,
    starts: Mutex<HashMap<String, PendingStart>>,
    next_start: AtomicU64,
}

#[derive(Clone)]
pub struct LifecycleManager {
    inner: Arc<Inner>,
}

fn in_env(id: &str) -> impl Fn(DevEnvError) -> OrchestratorError + '_ {
    move |e| OrchestratorError::Backend(e.with_environment(id))
}

fn cancelled() -> OrchestratorError {
    OrchestratorError::Backend(DevEnvError::Cancelled)
}

fn checkpoint(token: &CancellationToken) -> Result<()> {
    if token.is_cancelled() {
        Err(cancelled())
    } else {
        Ok(())
    }
}

fn timed_out(id: &str, what: &str, after: Duration) -> OrchestratorError {
    DevEnvError::transient(format!("{what} did not finish within {after:?}"))
        .with_environment(id)
        .into()
}

fn missing(id: &str, field: &str, state: EnvironmentState) -> OrchestratorError {
    OrchestratorError::InvariantViolation(format!("environment {id} in state {state} has no {field}"))
}

impl LifecycleManager {
    pub fn new(parts: LifecycleParts, settings: &LifecycleSettings, max_concurrent_dehydrations: usize) -> Self {
        let clock = parts.registry.clock().clone();
        Self {
            inner: Arc::new(Inner {
                registry: parts.registry,
                adapter: parts.adapter,
                hydration: parts.hydration,
                routing: parts.routing,
                events: parts.events,
                locks: parts.locks,
                clock,
                retry: RetryPolicy::from(settings),
                transition_timeout: settings.transition_timeout(),
                health_poll: settings.health_poll(),
                dehydrations: Semaphore::new(max_concurrent_dehydrations.max(1)),
                starts: Mutex::new(HashMap::new()),
                next_start: AtomicU64::new(0),
            }),
        }
    }

    pub fn registry(&self) -> &EnvironmentRegistry {
        &self.inner.registry
    }

    pub fn routing(&self) -> &RoutingResolver {
        &self.inner.routing
    }

    pub fn events(&self) -> &EventBus {
        &self.inner.events
    }

    pub fn locks(&self) -> &KeyedLocks {
        &self.inner.locks
    }

    // ---- pending starts -------------------------------------------------

    fn starts(&self) -> std::sync::MutexGuard<'_, HashMap<String, PendingStart>> {
        self.inner.starts.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Register a start for `id`. `None` when a live one is already pending.
    ///
    /// A pending start that has been cancelled is replaced: the new ticket
    /// queues behind the old start on the environment lock.
    pub fn begin_start(&self, id: &str) -> Option<PendingStart> {
        let mut starts = self.starts();
        if starts.get(id).is_some_and(|p| !p.token.is_cancelled()) {
            return None;
        }
        let pending = PendingStart::new(self.inner.next_start.fetch_add(1, Ordering::Relaxed));
        starts.insert(id.to_string(), pending.clone());
        Some(pending)
    }

    pub fn start_pending(&self, id: &str) -> bool {
        self.starts().contains_key(id)
    }

    /// Cancel the pending start of `id`, if any. Returns whether one existed.
    ///
    /// With `Trigger::Stop` the start hibernates the environment itself if it
    /// comes up before noticing the cancellation.
    pub fn cancel_start(&self, id: &str, by: Trigger) -> bool {
        match self.starts().get(id) {
            Some(pending) => {
                if by == Trigger::Stop {
                    pending.stop_requested.store(true, Ordering::SeqCst);
                }
                pending.token.cancel();
                true
            }
            None => false,
        }
    }

    /// Unregister `pending`; reports whether a stop asked for it meanwhile.
    fn end_start(&self, id: &str, pending: &PendingStart) -> bool {
        let mut starts = self.starts();
        if starts.get(id).is_some_and(|p| p.seq == pending.seq) {
            starts.remove(id);
        }
        pending.stop_requested.load(Ordering::SeqCst)
    }

    /// Cancel every pending start; used on shutdown.
    pub fn cancel_all(&self) {
        for pending in self.starts().values() {
            pending.token.cancel();
        }
    }

    // ---- persistence helpers --------------------------------------------

    /// Move `env` to `to`, applying `mutate`, and announce the change.
    ///
    /// The lock holder is the only one changing state, but a touch may bump
    /// `last_active_at` underneath; that race is retried on the fresh record
    /// as long as the state is still the one we loaded.
    async fn transition<F>(&self, env: &Environment, to: EnvironmentState, mutate: F) -> Result<Environment>
    where
        F: Fn(&mut Environment) + Send + Sync,
    {
        let mut current = env.clone();
        for _ in 0..CAS_ATTEMPTS {
            let outcome = self
                .inner
                .registry
                .compare_and_swap(&current.id, current.version, |e| {
                    e.state = to;
                    mutate(e);
                })
                .await;
            match outcome {
                Ok(updated) => {
                    self.announce(&current, &updated);
                    return Ok(updated);
                }
                Err(OrchestratorError::ConcurrentModification { .. }) => {
                    let reloaded = self.inner.registry.load(&current.id).await?;
                    if reloaded.state != current.state {
                        return Err(OrchestratorError::ConcurrentModification {
                            id: current.id.clone(),
                            expected_version: current.version,
                        });
                    }
                    debug!(environment_id = %current.id, "record touched meanwhile, retrying write");
                    current = reloaded;
                }
                Err(e) => return Err(e),
            }
        }
        Err(OrchestratorError::ConcurrentModification {
            id: current.id.clone(),
            expected_version: current.version,
        })
    }

    fn announce(&self, before: &Environment, after: &Environment) {
        if before.state == after.state {
            return;
        }
        info!(
            environment_id = %after.id,
            from = %before.state,
            to = %after.state,
            version = after.version,
            "state changed"
        );
        let error = if after.last_error != before.last_error {
            after.last_error.clone()
        } else {
            None
        };
        self.inner.events.publish(LifecycleEvent {
            environment_id: after.id.clone(),
            old_state: before.state,
            new_state: after.state,
            error,
            at: self.inner.clock.now(),
        });
    }

    async fn begin_operation(&self, id: &str, kind: OperationType) -> Option<String> {
        match self
            .inner
            .registry
            .record_operation(id, kind, OperationStatus::Running)
            .await
        {
            Ok(op) => Some(op),
            Err(e) => {
                warn!(environment_id = id, operation = ?kind, error = %e, "failed to record operation");
                None
            }
        }
    }

    async fn end_operation(&self, op: Option<String>, status: OperationStatus, error: Option<String>) {
        let Some(op) = op else { return };
        if let Err(e) = self.inner.registry.complete_operation(&op, status, error).await {
            warn!(operation_id = %op, error = %e, "failed to complete operation");
        }
    }

    async fn end_operation_with<T>(&self, op: Option<String>, result: &Result<T>) {
        match result {
            Ok(_) => self.end_operation(op, OperationStatus::Success, None).await,
            Err(e) => {
                self.end_operation(op, OperationStatus::Failed, Some(e.to_string()))
                    .await
            }
        }
    }

    // ---- start ----------------------------------------------------------

    /// Bring the environment to `Running`. Waits for the environment lock.
    #[instrument(skip(self, pending), fields(environment_id = %id))]
    pub async fn start(&self, id: &str, pending: PendingStart) -> Result<()> {
        let guard = self.inner.locks.lock(id).await;
        let result = self.start_locked(&guard, id, &pending.token).await;
        let stop_requested = self.end_start(id, &pending);
        if stop_requested && result.is_ok() {
            // Either rolled back already or came up before seeing the stop.
            return self.stop_locked(&guard, id).await;
        }
        result
    }

    async fn start_locked(&self, _guard: &KeyedGuard, id: &str, token: &CancellationToken) -> Result<()> {
        let mut env = self.inner.registry.load(id).await?;
        if token.is_cancelled() {
            debug!("start cancelled before it began");
            return Ok(());
        }

        match env.state {
            Absent | Hibernated => {}
            Failed => env = self.reset_failed(env).await?,
            Running | Idle => {
                debug!(state = %env.state, "already up");
                return Ok(());
            }
            other => return Err(OrchestratorError::invalid_transition(other, Trigger::Start)),
        }

        let prior = env.state;
        let op = self.begin_operation(id, OperationType::Start).await;
        let outcome = match tokio::time::timeout(self.inner.transition_timeout, self.bring_up(env, token)).await {
            Ok(outcome) => outcome,
            Err(_) => Err(timed_out(id, "start", self.inner.transition_timeout)),
        };

        match outcome {
            Ok(()) => {
                self.end_operation(op, OperationStatus::Success, None).await;
                Ok(())
            }
            Err(err) if err.kind() == ErrorKind::Cancelled => {
                info!(rollback_to = %prior, "start cancelled, rolling back");
                self.roll_back(id, prior, None).await?;
                self.end_operation(op, OperationStatus::Cancelled, None).await;
                Ok(())
            }
            Err(err) => {
                if err.kind() == ErrorKind::CorruptSnapshot {
                    error!(error = %err, "snapshot failed verification, start aborted");
                } else {
                    warn!(error = %err, "start failed, rolling back");
                }
                self.roll_back(id, Failed, Some(err.summary())).await?;
                self.end_operation(op, OperationStatus::Failed, Some(err.to_string()))
                    .await;
                Err(err)
            }
        }
    }

    /// Provisioning, hydration, workload start, readiness and routing.
    async fn bring_up(&self, env: Environment, token: &CancellationToken) -> Result<()> {
        let id = env.id.clone();
        let volume = VolumeRef::for_project(env.owner_id, env.project_id);
        let spec = ProvisionSpec {
            environment_id: id.clone(),
            owner_id: env.owner_id,
            project_id: env.project_id,
            volume: volume.clone(),
            host: self.inner.routing.host_for(env.owner_id, env.project_id),
        };
        let adapter = &self.inner.adapter;
        // Recorded up front so a rollback can delete objects from a provision
        // that failed or was dropped halfway.
        let expected = adapter.handle_for(&spec);
        let env = self
            .transition(&env, Provisioning, |e| {
                e.volume_ref = Some(volume.clone());
                e.backend_handle = Some(expected.clone());
                e.last_error = None;
            })
            .await?;
        checkpoint(token)?;

        let handle = self
            .inner
            .retry
            .run("provision", token, || adapter.provision(&spec))
            .await
            .map_err(in_env(&id))?;
        debug!(handle = %handle.describe(), "workload provisioned");

        let env = self
            .transition(&env, Hydrating, |e| e.backend_handle = Some(handle.clone()))
            .await?;
        checkpoint(token)?;

        let hydration = &self.inner.hydration;
        let source = self
            .inner
            .retry
            .run("hydrate", token, || hydration.hydrate(env.project_id, &volume))
            .await
            .map_err(in_env(&id))?;
        debug!(source = ?source, "volume hydrated");
        checkpoint(token)?;

        self.inner
            .retry
            .run("start", token, || adapter.start(&handle))
            .await
            .map_err(in_env(&id))?;
        self.wait_healthy(&id, &handle, token).await?;
        checkpoint(token)?;

        let upstream = adapter.upstream(&handle).map_err(in_env(&id))?;
        let host = self
            .inner
            .routing
            .publish(&id, env.owner_id, env.project_id, &upstream)
            .await
            .map_err(in_env(&id))?;

        let now = self.inner.clock.now();
        match self
            .transition(&env, Running, |e| {
                e.host = Some(host.clone());
                e.last_active_at = now;
            })
            .await
        {
            Ok(_) => Ok(()),
            Err(e) => {
                if let Err(withdraw) = self.inner.routing.withdraw(&id).await {
                    warn!(error = %withdraw, "failed to withdraw route after failed write");
                }
                Err(e)
            }
        }
    }

    async fn wait_healthy(&self, id: &str, handle: &BackendHandle, token: &CancellationToken) -> Result<()> {
        let adapter = &self.inner.adapter;
        loop {
            let status = self
                .inner
                .retry
                .run("health_check", token, || adapter.health_check(handle))
                .await
                .map_err(in_env(id))?;
            if status == HealthStatus::Healthy {
                return Ok(());
            }
            debug!(environment_id = id, status = ?status, "waiting for workload readiness");
            tokio::select! {
                _ = token.cancelled() => return Err(cancelled()),
                _ = tokio::time::sleep(self.inner.health_poll) => {}
            }
        }
    }

    /// Undo a partial start and settle in `target`.
    ///
    /// `target` is the resting state the start came from, or `Failed`. A
    /// workload that cannot be deleted keeps its handle and forces `Failed`.
    async fn roll_back(&self, id: &str, target: EnvironmentState, error: Option<ErrorSummary>) -> Result<()> {
        let env = self.inner.registry.load(id).await?;
        match env.state {
            Provisioning | Hydrating => {}
            Running if target == Failed => {}
            state => {
                debug!(state = %state, "nothing to roll back");
                return Ok(());
            }
        }

        if let Err(e) = self.inner.routing.withdraw(id).await {
            warn!(environment_id = id, error = %e, "failed to withdraw route during rollback");
        }

        let never = CancellationToken::new();
        let mut leftover = None;
        if let Some(handle) = env.backend_handle.clone() {
            let adapter = &self.inner.adapter;
            if let Err(e) = self.inner.retry.run("delete", &never, || adapter.delete(&handle)).await {
                warn!(environment_id = id, handle = %handle.describe(), error = %e, "failed to delete partial workload");
                leftover = Some((handle, e.with_environment(id).summary()));
            }
        }

        if let Some(volume) = &env.volume_ref {
            if let Err(e) = self.inner.hydration.discard(volume).await {
                warn!(environment_id = id, volume = %volume, error = %e, "failed to discard volume");
            }
        }

        let (target, error) = match (&leftover, target) {
            (Some((_, delete_error)), t) if t != Failed => (Failed, Some(delete_error.clone())),
            _ => (target, error),
        };
        let handle = leftover.map(|(handle, _)| handle);

        self.transition(&env, target, |e| {
            e.backend_handle = handle.clone();
            e.volume_ref = None;
            e.host = None;
            if let Some(error) = &error {
                e.last_error = Some(error.clone());
            }
        })
        .await?;
        Ok(())
    }

    /// `Failed -> Absent`, releasing whatever the failure left behind.
    async fn reset_failed(&self, env: Environment) -> Result<Environment> {
        let id = env.id.clone();
        if let Some(handle) = env.backend_handle.clone() {
            let adapter = &self.inner.adapter;
            self.inner
                .retry
                .run("delete", &CancellationToken::new(), || adapter.delete(&handle))
                .await
                .map_err(in_env(&id))?;
        }
        self.inner.routing.withdraw(&id).await.map_err(in_env(&id))?;

        self.transition(&env, Absent, |e| {
            e.backend_handle = None;
            e.volume_ref = None;
            e.host = None;
            e.last_error = None;
        })
        .await
    }

    // ---- stop / idle ----------------------------------------------------

    /// Hibernate the environment. Waits for the environment lock.
    #[instrument(skip(self), fields(environment_id = %id))]
    pub async fn stop(&self, id: &str) -> Result<()> {
        let guard = self.inner.locks.lock(id).await;
        self.stop_locked(&guard, id).await
    }

    async fn stop_locked(&self, _guard: &KeyedGuard, id: &str) -> Result<()> {
        let env = self.inner.registry.load(id).await?;
        match env.state {
            // Reached after a cancelled start settled.
            Hibernated | Absent | Failed => {
                debug!(state = %env.state, "nothing to stop");
                return Ok(());
            }
            Running | Idle => {}
            other => return Err(OrchestratorError::invalid_transition(other, Trigger::Stop)),
        }

        let op = self.begin_operation(id, OperationType::Stop).await;
        let result = self.hibernate(env).await;
        self.end_operation_with(op, &result).await;
        result
    }

    /// Called by the reaper with the environment lock already taken.
    ///
    /// Re-checks staleness against the current record before doing anything.
    #[instrument(skip(self, _guard), fields(environment_id = %id))]
    pub async fn expire_idle(&self, _guard: KeyedGuard, id: &str, idle_timeout: chrono::Duration) -> Result<IdleOutcome> {
        let env = self.inner.registry.load(id).await?;
        if !Trigger::IdleTimeout.accepts(env.state) {
            return Ok(IdleOutcome::NotEligible);
        }
        let cutoff = self.inner.clock.now() - idle_timeout;
        if env.last_active_at >= cutoff {
            return Ok(IdleOutcome::Active);
        }

        let op = self.begin_operation(id, OperationType::Idle).await;
        let env = if env.state == Running {
            // Strict write: a touch landing here means the environment is in use.
            match self
                .inner
                .registry
                .compare_and_swap(id, env.version, |e| {
                    e.state = Idle;
                    e.host = None;
                })
                .await
            {
                Ok(updated) => {
                    self.announce(&env, &updated);
                    if let Err(e) = self.inner.routing.withdraw(id).await {
                        warn!(error = %e, "failed to withdraw route of idle environment");
                    }
                    updated
                }
                Err(OrchestratorError::ConcurrentModification { .. }) => {
                    self.end_operation(op, OperationStatus::Cancelled, None).await;
                    return Ok(IdleOutcome::Active);
                }
                Err(e) => {
                    self.end_operation(op, OperationStatus::Failed, Some(e.to_string()))
                        .await;
                    return Err(e);
                }
            }
        } else {
            env
        };

        let result = self.hibernate(env).await;
        self.end_operation_with(op, &result).await;
        match result {
            Ok(()) => Ok(IdleOutcome::Hibernated),
            Err(e) => Ok(IdleOutcome::Failed(e.summary())),
        }
    }

    /// `Running | Idle -> Dehydrating -> Hibernated`.
    ///
    /// The volume is only released after the snapshot verified. When
    /// dehydration fails the workload is restarted and the prior state is
    /// restored with `last_error` set.
    async fn hibernate(&self, env: Environment) -> Result<()> {
        let id = env.id.clone();
        let prior = env.state;
        let handle = env
            .backend_handle
            .clone()
            .ok_or_else(|| missing(&id, "backend handle", prior))?;
        let volume = env
            .volume_ref
            .clone()
            .ok_or_else(|| missing(&id, "volume", prior))?;

        if prior == Running {
            self.inner.routing.withdraw(&id).await.map_err(in_env(&id))?;
        }
        let env = match self.transition(&env, Dehydrating, |e| e.host = None).await {
            Ok(env) => env,
            Err(e) => {
                if prior == Running {
                    self.republish(&env).await;
                }
                return Err(e);
            }
        };

        let never = CancellationToken::new();
        let adapter = &self.inner.adapter;
        let hydration = &self.inner.hydration;
        let saved = tokio::time::timeout(self.inner.transition_timeout, async {
            self.inner
                .retry
                .run("stop", &never, || adapter.stop(&handle))
                .await?;
            let _permit = self
                .inner
                .dehydrations
                .acquire()
                .await
                .map_err(|_| DevEnvError::internal("dehydration limiter closed"))?;
            let snapshot = self
                .inner
                .retry
                .run("dehydrate", &never, || hydration.dehydrate(env.project_id, &volume))
                .await?;
            Ok::<_, DevEnvError>(snapshot)
        })
        .await
        .unwrap_or_else(|_| {
            Err(DevEnvError::transient(format!(
                "dehydration did not finish within {:?}",
                self.inner.transition_timeout
            )))
        });

        let snapshot = match saved {
            Ok(snapshot) => snapshot,
            Err(err) => {
                let err = err.with_environment(&id);
                warn!(environment_id = %id, error = %err, restore = %prior, "dehydration failed, keeping volume");
                return self.restore_after_failed_dehydration(env, prior, &handle, err).await;
            }
        };
        info!(
            environment_id = %id,
            key = %snapshot.key,
            size_bytes = snapshot.size_bytes,
            "snapshot stored"
        );

        if let Err(err) = self
            .inner
            .retry
            .run("delete", &never, || adapter.delete(&handle))
            .await
        {
            let err = err.with_environment(&id);
            warn!(environment_id = %id, error = %err, "snapshot saved but workload could not be deleted");
            let summary = err.summary();
            self.transition(&env, Failed, |e| {
                e.volume_ref = None;
                e.last_error = Some(summary.clone());
            })
            .await?;
            return Err(err.into());
        }

        self.transition(&env, Hibernated, |e| {
            e.backend_handle = None;
            e.volume_ref = None;
            e.last_error = None;
        })
        .await?;
        Ok(())
    }

    async fn restore_after_failed_dehydration(
        &self,
        env: Environment,
        prior: EnvironmentState,
        handle: &BackendHandle,
        err: DevEnvError,
    ) -> Result<()> {
        let id = env.id.clone();
        let summary = err.summary();
        let adapter = &self.inner.adapter;

        if let Err(restart) = self
            .inner
            .retry
            .run("start", &CancellationToken::new(), || adapter.start(handle))
            .await
        {
            error!(environment_id = %id, error = %restart, "could not restart workload after failed dehydration");
            // The volume stays on disk; a later start finds it already hydrated.
            self.transition(&env, Failed, |e| {
                e.volume_ref = None;
                e.last_error = Some(summary.clone());
            })
            .await?;
            return Err(err.into());
        }

        let restored = if prior == Running {
            match self.publish_route(&env, handle).await {
                Ok(host) => {
                    self.transition(&env, Running, |e| {
                        e.host = Some(host.clone());
                        e.last_error = Some(summary.clone());
                    })
                    .await
                }
                Err(route_err) => {
                    warn!(environment_id = %id, error = %route_err, "could not republish route, leaving idle");
                    self.transition(&env, Idle, |e| e.last_error = Some(summary.clone()))
                        .await
                }
            }
        } else {
            self.transition(&env, Idle, |e| e.last_error = Some(summary.clone()))
                .await
        };
        restored?;
        Err(err.into())
    }

    async fn publish_route(&self, env: &Environment, handle: &BackendHandle) -> Result<String> {
        let upstream = self.inner.adapter.upstream(handle).map_err(in_env(&env.id))?;
        self.inner
            .routing
            .publish(&env.id, env.owner_id, env.project_id, &upstream)
            .await
            .map_err(in_env(&env.id))
    }

    async fn republish(&self, env: &Environment) {
        let Some(handle) = &env.backend_handle else { return };
        if let Err(e) = self.publish_route(env, handle).await {
            warn!(environment_id = %env.id, error = %e, "failed to restore route");
        }
    }

    // ---- touch ----------------------------------------------------------

    /// Record activity. Wakes an idle environment back to `Running`.
    #[instrument(skip(self), fields(environment_id = %id))]
    pub async fn touch(&self, id: &str) -> Result<Environment> {
        let mut last_version = 0;
        for _ in 0..TOUCH_ATTEMPTS {
            let env = self.inner.registry.load(id).await?;
            last_version = env.version;
            match env.state {
                Running => {
                    let now = self.inner.clock.now();
                    match self
                        .inner
                        .registry
                        .compare_and_swap(id, env.version, |e| e.last_active_at = now)
                        .await
                    {
                        Ok(updated) => return Ok(updated),
                        Err(OrchestratorError::ConcurrentModification { .. }) => {
                            debug!("touch lost a race, reloading");
                        }
                        Err(e) => return Err(e),
                    }
                }
                Idle => return self.wake(id).await,
                other => return Err(OrchestratorError::invalid_transition(other, Trigger::Touch)),
            }
        }
        Err(OrchestratorError::ConcurrentModification {
            id: id.to_string(),
            expected_version: last_version,
        })
    }

    /// `Idle -> Running`: republish the route and refresh activity.
    async fn wake(&self, id: &str) -> Result<Environment> {
        let _guard = self.inner.locks.lock(id).await;
        let env = self.inner.registry.load(id).await?;
        let now = self.inner.clock.now();
        match env.state {
            Idle => {}
            Running => {
                return self
                    .transition(&env, Running, |e| e.last_active_at = now)
                    .await
            }
            other => return Err(OrchestratorError::invalid_transition(other, Trigger::Touch)),
        }

        let handle = env
            .backend_handle
            .clone()
            .ok_or_else(|| missing(id, "backend handle", Idle))?;
        let op = self.begin_operation(id, OperationType::Touch).await;
        let host = match self.publish_route(&env, &handle).await {
            Ok(host) => host,
            Err(e) => {
                self.end_operation(op, OperationStatus::Failed, Some(e.to_string()))
                    .await;
                return Err(e);
            }
        };

        let result = self
            .transition(&env, Running, |e| {
                e.host = Some(host.clone());
                e.last_active_at = now;
            })
            .await;
        if result.is_err() {
            if let Err(e) = self.inner.routing.withdraw(id).await {
                warn!(error = %e, "failed to withdraw route after failed wake");
            }
        }
        self.end_operation_with(op, &result).await;
        result
    }

    // ---- delete ---------------------------------------------------------

    /// Tear the environment down without saving its volume.
    ///
    /// An `Absent` record is purged from the registry instead.
    #[instrument(skip(self), fields(environment_id = %id))]
    pub async fn delete(&self, id: &str) -> Result<()> {
        let _guard = self.inner.locks.lock(id).await;
        let env = self.inner.registry.load(id).await?;
        match env.state {
            Absent => {
                self.inner.registry.purge(id).await?;
                info!("environment record purged");
                return Ok(());
            }
            // Deleting is only seen here after an interrupted delete.
            Running | Idle | Hibernated | Failed | Deleting => {}
            other => return Err(OrchestratorError::invalid_transition(other, Trigger::Delete)),
        }

        let op = self.begin_operation(id, OperationType::Delete).await;
        let result = match tokio::time::timeout(self.inner.transition_timeout, self.tear_down(env)).await {
            Ok(result) => result,
            Err(_) => Err(timed_out(id, "delete", self.inner.transition_timeout)),
        };
        self.end_operation_with(op, &result).await;
        result
    }

    async fn tear_down(&self, env: Environment) -> Result<()> {
        let id = env.id.clone();
        let never = CancellationToken::new();

        self.inner.routing.withdraw(&id).await.map_err(in_env(&id))?;
        // Not `env.volume_ref`: a failed environment may have left its tree
        // on disk after the reference was cleared.
        let volume = VolumeRef::for_project(env.owner_id, env.project_id);
        let hydration = &self.inner.hydration;
        self.inner
            .retry
            .run("discard", &never, || hydration.discard(&volume))
            .await
            .map_err(in_env(&id))?;

        let env = if env.state == Deleting {
            env
        } else {
            self.transition(&env, Deleting, |e| {
                e.host = None;
                e.volume_ref = None;
            })
            .await?
        };

        if let Some(handle) = env.backend_handle.clone() {
            let adapter = &self.inner.adapter;
            if let Err(err) = self
                .inner
                .retry
                .run("delete", &never, || adapter.delete(&handle))
                .await
            {
                let err = err.with_environment(&id);
                let summary = err.summary();
                self.transition(&env, Failed, |e| e.last_error = Some(summary.clone()))
                    .await?;
                return Err(err.into());
            }
        }

        self.transition(&env, Absent, |e| {
            e.backend_handle = None;
            e.last_error = None;
        })
        .await?;
        Ok(())
    }

    // ---- health ---------------------------------------------------------

    /// Probe a running environment once; tear it down when unreachable.
    ///
    /// Environments somebody else is working on are skipped.
    pub async fn check_health(&self, id: &str) -> Result<HealthOutcome> {
        let Some(_guard) = self.inner.locks.try_lock(id) else {
            return Ok(HealthOutcome::Skipped);
        };
        let env = self.inner.registry.load(id).await?;
        if env.state != Running {
            return Ok(HealthOutcome::Skipped);
        }
        let handle = env
            .backend_handle
            .clone()
            .ok_or_else(|| missing(id, "backend handle", Running))?;

        let probe = tokio::time::timeout(
            self.inner.retry.call_timeout,
            self.inner.adapter.health_check(&handle),
        )
        .await;
        match probe {
            Ok(Ok(HealthStatus::Unreachable)) => {}
            Ok(Ok(_)) => return Ok(HealthOutcome::Healthy),
            Ok(Err(e)) => {
                warn!(environment_id = id, error = %e, "health probe failed");
                return Ok(HealthOutcome::Skipped);
            }
            Err(_) => {
                warn!(environment_id = id, "health probe timed out");
                return Ok(HealthOutcome::Skipped);
            }
        }

        warn!(environment_id = id, "workload unreachable, tearing down");
        let op = self.begin_operation(id, OperationType::HealthCheck).await;
        let result = self.fail_unreachable(env, handle).await;
        match &result {
            Ok(()) => {
                self.end_operation(
                    op,
                    OperationStatus::Success,
                    Some("workload unreachable".to_string()),
                )
                .await
            }
            Err(e) => {
                self.end_operation(op, OperationStatus::Failed, Some(e.to_string()))
                    .await
            }
        }
        result.map(|()| HealthOutcome::Failed)
    }

    /// `Running -> Dehydrating -> Failed`, saving the volume when possible.
    async fn fail_unreachable(&self, env: Environment, handle: BackendHandle) -> Result<()> {
        let id = env.id.clone();
        let never = CancellationToken::new();

        self.inner.routing.withdraw(&id).await.map_err(in_env(&id))?;
        let env = self.transition(&env, Dehydrating, |e| e.host = None).await?;

        if let Some(volume) = env.volume_ref.clone() {
            let hydration = &self.inner.hydration;
            let permit = self.inner.dehydrations.acquire().await;
            match self
                .inner
                .retry
                .run("dehydrate", &never, || hydration.dehydrate(env.project_id, &volume))
                .await
            {
                Ok(snapshot) => info!(environment_id = %id, key = %snapshot.key, "work preserved before teardown"),
                Err(e) => warn!(environment_id = %id, error = %e, "could not preserve work, volume left on disk"),
            }
            drop(permit);
        }

        let adapter = &self.inner.adapter;
        let leftover = match self
            .inner
            .retry
            .run("delete", &never, || adapter.delete(&handle))
            .await
        {
            Ok(()) => None,
            Err(e) => {
                warn!(environment_id = %id, error = %e, "failed to delete unreachable workload");
                Some(handle)
            }
        };

        let summary = ErrorSummary::new(
            ErrorKind::TransientBackend,
            "workload became unreachable and was torn down",
        );
        self.transition(&env, Failed, |e| {
            e.backend_handle = leftover.clone();
            e.volume_ref = None;
            e.last_error = Some(summary.clone());
        })
        .await?;
        Ok(())
    }

    // ---- recovery -------------------------------------------------------

    /// Settle records left mid-transition by a previous process.
    ///
    /// Nothing is running on their behalf any more, so each goes to `Failed`
    /// keeping its handle; a later start or delete cleans up from there.
    pub async fn recover_interrupted(&self) -> Result<usize> {
        let mut recovered = 0;
        for state in [Provisioning, Hydrating, Dehydrating, Deleting] {
            for env in self.inner.registry.list_by_state(state).await? {
                let Some(_guard) = self.inner.locks.try_lock(&env.id) else {
                    continue;
                };
                let summary = ErrorSummary::new(
                    ErrorKind::Internal,
                    format!("interrupted while {state}"),
                );
                match self
                    .transition(&env, Failed, |e| {
                        e.volume_ref = None;
                        e.host = None;
                        e.last_error = Some(summary.clone());
                    })
                    .await
                {
                    Ok(_) => {
                        warn!(environment_id = %env.id, state = %state, "recovered interrupted environment");
                        recovered += 1;
                    }
                    Err(e) => warn!(environment_id = %env.id, error = %e, "failed to recover environment"),
                }
            }
        }
        Ok(recovered)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_trigger_acceptance() {
        assert!(Trigger::Start.accepts(Absent));
        assert!(Trigger::Start.accepts(Hibernated));
        assert!(Trigger::Start.accepts(Failed));
        assert!(!Trigger::Start.accepts(Running));
        assert!(!Trigger::Start.accepts(Provisioning));

        assert!(Trigger::Stop.accepts(Idle));
        assert!(!Trigger::Stop.accepts(Hibernated));
        assert!(!Trigger::Stop.accepts(Absent));
        assert!(!Trigger::Touch.accepts(Hibernated));
        assert!(Trigger::Delete.accepts(Absent));
        assert!(!Trigger::Delete.accepts(Dehydrating));
        assert!(Trigger::HealthCheckFailure.accepts(Running));
        assert!(!Trigger::HealthCheckFailure.accepts(Idle));
    }

    #[test]
    fn test_trigger_names() {
        assert_eq!(Trigger::IdleTimeout.to_string(), "idle_timeout");
        assert_eq!(Trigger::HealthCheckFailure.as_str(), "health_check_failure");
    }
}
