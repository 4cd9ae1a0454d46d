//! In-memory backend for tests.
//!
//! Records every call, keeps a table of live workloads and can be told to fail
//! the next N invocations of an operation with a given error kind.
use crate::{workload_name, BackendAdapter, BackendHandle, HealthStatus, ProvisionSpec};
use async_trait::async_trait;
use devenv_config::BackendKind;
use devenv_core::{DevEnvError, ErrorKind, Result};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MockOp {
    Provision,
    Start,
    Stop,
    Delete,
    HealthCheck,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MockCall {
    pub op: MockOp,
    pub workload: String,
}

#[derive(Debug, Default)]
struct MockState {
    calls: Vec<MockCall>,
    /// workload name -> running
    workloads: HashMap<String, bool>,
    failures: HashMap<MockOp, (ErrorKind, usize)>,
    provision_delay: Option<Duration>,
    health: Option<HealthStatus>,
    /// Injected provision failures still leave the workload behind.
    partial_provision: bool,
    next_id: u64,
}

#[derive(Debug, Clone, Default)]
pub struct MockAdapter {
    state: Arc<Mutex<MockState>>,
}

fn error_for(kind: ErrorKind, op: MockOp) -> DevEnvError {
    let message = format!("injected {op:?} failure");
    match kind {
        ErrorKind::TransientBackend => DevEnvError::TransientBackend(message),
        ErrorKind::QuotaExceeded => DevEnvError::QuotaExceeded(message),
        ErrorKind::NotFound => DevEnvError::NotFound(message),
        ErrorKind::RoutingConflict => DevEnvError::RoutingConflict(message),
        ErrorKind::Config => DevEnvError::Config(message),
        ErrorKind::Cancelled => DevEnvError::Cancelled,
        _ => DevEnvError::Internal(message),
    }
}

impl MockAdapter {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Fail the next `times` calls of `op` with an error of `kind`.
    pub fn fail_next(&self, op: MockOp, kind: ErrorKind, times: usize) {
        self.lock().failures.insert(op, (kind, times));
    }

    /// Make provisioning take at least `delay`.
    pub fn set_provision_delay(&self, delay: Duration) {
        self.lock().provision_delay = Some(delay);
    }

    /// Let injected provision failures leave a half-created workload.
    pub fn set_partial_provision(&self, partial: bool) {
        self.lock().partial_provision = partial;
    }

    /// Force every health check to report `status`; `None` restores the default.
    pub fn set_health(&self, status: Option<HealthStatus>) {
        self.lock().health = status;
    }

    pub fn calls(&self) -> Vec<MockCall> {
        self.lock().calls.clone()
    }

    pub fn count(&self, op: MockOp) -> usize {
        self.lock().calls.iter().filter(|c| c.op == op).count()
    }

    /// Workloads currently allocated, running or not.
    pub fn live_workloads(&self) -> usize {
        self.lock().workloads.len()
    }

    pub fn running_workloads(&self) -> usize {
        self.lock().workloads.values().filter(|running| **running).count()
    }

    pub fn is_running(&self, workload: &str) -> bool {
        self.lock().workloads.get(workload).copied().unwrap_or(false)
    }

    fn record(&self, op: MockOp, workload: &str) -> Result<()> {
        let mut state = self.lock();
        state.calls.push(MockCall {
            op,
            workload: workload.to_string(),
        });
        if let Some((kind, remaining)) = state.failures.get_mut(&op) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(error_for(*kind, op));
            }
        }
        Ok(())
    }

    fn name(handle: &BackendHandle) -> Result<&str> {
        match handle {
            BackendHandle::Container { name, .. } => Ok(name),
            other => Err(DevEnvError::internal(format!(
                "mock backend cannot handle {}",
                other.describe()
            ))),
        }
    }
}

#[async_trait]
impl BackendAdapter for MockAdapter {
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
        let delay = self.lock().provision_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if let Err(e) = self.record(MockOp::Provision, &name) {
            let mut state = self.lock();
            if state.partial_provision {
                state.workloads.entry(name).or_insert(false);
            }
            return Err(e);
        }

        let mut state = self.lock();
        state.next_id += 1;
        let id = format!("mock-{}", state.next_id);
        state.workloads.entry(name.clone()).or_insert(false);
        Ok(BackendHandle::Container { name, id })
    }

    async fn start(&self, handle: &BackendHandle) -> Result<()> {
        let name = Self::name(handle)?;
        self.record(MockOp::Start, name)?;
        match self.lock().workloads.get_mut(name) {
            Some(running) => {
                *running = true;
                Ok(())
            }
            None => Err(DevEnvError::NotFound(format!("workload {name}"))),
        }
    }

    async fn stop(&self, handle: &BackendHandle) -> Result<()> {
        let name = Self::name(handle)?;
        self.record(MockOp::Stop, name)?;
        if let Some(running) = self.lock().workloads.get_mut(name) {
            *running = false;
        }
        Ok(())
    }

    async fn delete(&self, handle: &BackendHandle) -> Result<()> {
        let name = Self::name(handle)?;
        self.record(MockOp::Delete, name)?;
        self.lock().workloads.remove(name);
        Ok(())
    }

    async fn health_check(&self, handle: &BackendHandle) -> Result<HealthStatus> {
        let name = Self::name(handle)?;
        self.record(MockOp::HealthCheck, name)?;
        let state = self.lock();
        if let Some(status) = state.health {
            return Ok(status);
        }
        Ok(match state.workloads.get(name) {
            Some(true) => HealthStatus::Healthy,
            _ => HealthStatus::Unreachable,
        })
    }

    fn upstream(&self, handle: &BackendHandle) -> Result<String> {
        Ok(format!("http://{}:8080", Self::name(handle)?))
    }
}
