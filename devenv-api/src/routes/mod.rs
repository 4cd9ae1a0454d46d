pub mod environments;
pub mod events;
pub mod health;
pub mod reaper;

use crate::state::AppState;
use axum::Router;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

pub fn create_app(state: AppState) -> Router {
    // Dashboards are served from other origins during development.
    let cors = CorsLayer::permissive();

    Router::new()
        .merge(health::routes())
        .merge(environments::routes())
        .merge(events::routes())
        .merge(reaper::routes())
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
