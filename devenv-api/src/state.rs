use devenv_orchestrator::EnvironmentOrchestrator;
use tokio_util::sync::CancellationToken;

#[derive(Clone)]
pub struct AppState {
    pub orchestrator: EnvironmentOrchestrator,
    /// Fired on server shutdown; long-lived streams end when it does.
    pub shutdown: CancellationToken,
}

impl AppState {
    pub fn new(orchestrator: EnvironmentOrchestrator) -> Self {
        Self::with_shutdown(orchestrator, CancellationToken::new())
    }

    pub fn with_shutdown(orchestrator: EnvironmentOrchestrator, shutdown: CancellationToken) -> Self {
        Self {
            orchestrator,
            shutdown,
        }
    }
}
