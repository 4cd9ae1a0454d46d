//! Idle environment reaper.
//!
//! A sweep lists running and idle environments whose last activity is older
//! than the idle timeout and hibernates each one. Environments whose lock is
//! held are skipped for this sweep, and staleness is re-checked under the lock
//! so a touch between listing and locking wins. Dehydrations across the sweep
//! share the lifecycle's concurrency limit, which makes overlapping sweeps
//! safe.

use crate::error::Result;
use crate::lifecycle::{IdleOutcome, LifecycleManager};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SweepReport {
    pub candidates: usize,
    pub hibernated: usize,
    pub skipped_locked: usize,
    pub skipped_active: usize,
    pub failed: usize,
}

enum Visit {
    Locked,
    Done(IdleOutcome),
    Error,
}

#[derive(Clone)]
pub struct IdleReaper {
    lifecycle: LifecycleManager,
    idle_timeout: chrono::Duration,
}

impl IdleReaper {
    pub fn new(lifecycle: LifecycleManager, idle_timeout: Duration) -> Self {
        // Out-of-range timeouts behave as "never idle".
        let idle_timeout = chrono::Duration::from_std(idle_timeout)
            .unwrap_or_else(|_| chrono::Duration::days(365 * 100));
        Self {
            lifecycle,
            idle_timeout,
        }
    }

    pub fn idle_timeout(&self) -> chrono::Duration {
        self.idle_timeout
    }

    pub async fn sweep(&self) -> Result<SweepReport> {
        let now = self.lifecycle.registry().clock().now();
        let cutoff = now - self.idle_timeout;
        let candidates = self.lifecycle.registry().list_idle(cutoff).await?;

        let mut report = SweepReport {
            candidates: candidates.len(),
            ..SweepReport::default()
        };
        if candidates.is_empty() {
            debug!("no idle environments");
            return Ok(report);
        }

        let visits = candidates.iter().map(|env| async move {
            let Some(guard) = self.lifecycle.locks().try_lock(&env.id) else {
                return Visit::Locked;
            };
            match self
                .lifecycle
                .expire_idle(guard, &env.id, self.idle_timeout)
                .await
            {
                Ok(outcome) => Visit::Done(outcome),
                Err(e) => {
                    warn!(environment_id = %env.id, error = %e, "idle expiry failed");
                    Visit::Error
                }
            }
        });

        for visit in join_all(visits).await {
            match visit {
                Visit::Locked => report.skipped_locked += 1,
                Visit::Done(IdleOutcome::Hibernated) => report.hibernated += 1,
                Visit::Done(IdleOutcome::Active | IdleOutcome::NotEligible) => {
                    report.skipped_active += 1
                }
                Visit::Done(IdleOutcome::Failed(_)) | Visit::Error => report.failed += 1,
            }
        }

        info!(
            candidates = report.candidates,
            hibernated = report.hibernated,
            skipped_locked = report.skipped_locked,
            skipped_active = report.skipped_active,
            failed = report.failed,
            "reaper sweep finished"
        );
        Ok(report)
    }
}
