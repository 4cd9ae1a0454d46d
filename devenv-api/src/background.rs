//! Periodic loops driven alongside the HTTP server.

use devenv_orchestrator::EnvironmentOrchestrator;
use tokio::time::{interval, Duration, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

/// Run an idle sweep every `interval_secs` until `shutdown` fires.
pub async fn start_reaper_task(
    orchestrator: EnvironmentOrchestrator,
    interval_secs: u64,
    shutdown: CancellationToken,
) {
    let mut ticker = interval(Duration::from_secs(interval_secs.max(1)));
    // A slow sweep must not cause a burst of catch-up sweeps.
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    info!(interval_secs, "idle reaper running");

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {}
        }

        if let Err(e) = orchestrator.run_reaper_sweep().await {
            error!(error = %e, "reaper sweep failed");
        }
    }

    debug!("idle reaper stopped");
}

/// Probe running environments every `interval_secs`. Zero disables the loop.
pub async fn start_health_task(
    orchestrator: EnvironmentOrchestrator,
    interval_secs: u64,
    shutdown: CancellationToken,
) {
    if interval_secs == 0 {
        info!("health checks disabled");
        return;
    }

    let mut ticker = interval(Duration::from_secs(interval_secs));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    info!(interval_secs, "health checks running");

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {}
        }

        match orchestrator.run_health_checks().await {
            Ok(report) if report.checked > 0 => debug!(
                checked = report.checked,
                healthy = report.healthy,
                failed = report.failed,
                "health check round finished"
            ),
            Ok(_) => {}
            Err(e) => error!(error = %e, "health check round failed"),
        }
    }

    debug!("health checks stopped");
}
