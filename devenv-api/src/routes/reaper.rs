use crate::{error::ApiResult, state::AppState};
use axum::{extract::State, routing::post, Json, Router};
use devenv_orchestrator::SweepReport;

pub fn routes() -> Router<AppState> {
    Router::new().route("/api/v1/reaper/sweep", post(run_sweep))
}

/// Run one idle sweep now instead of waiting for the next tick.
async fn run_sweep(State(state): State<AppState>) -> ApiResult<Json<SweepReport>> {
    let report = state.orchestrator.run_reaper_sweep().await?;
    Ok(Json(report))
}
