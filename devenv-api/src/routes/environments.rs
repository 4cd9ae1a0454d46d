use crate::{
    error::{ApiError, ApiResult},
    state::AppState,
};
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use devenv_orchestrator::{
    Accepted, Environment, EnvironmentFilters, EnvironmentState, EnvironmentStatus, Operation,
};
use serde::{Deserialize, Serialize};

pub fn routes() -> Router<AppState> {
    Router::new()
        .route(
            "/api/v1/environments",
            get(list_environments).post(create_environment),
        )
        .route(
            "/api/v1/environments/{id}",
            get(get_environment).delete(delete_environment),
        )
        .route("/api/v1/environments/{id}/start", post(start_environment))
        .route("/api/v1/environments/{id}/stop", post(stop_environment))
        .route("/api/v1/environments/{id}/touch", post(touch_environment))
        .route(
            "/api/v1/environments/{id}/operations",
            get(list_operations),
        )
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateEnvironmentRequest {
    pub owner_id: i64,
    pub project_id: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateEnvironmentResponse {
    pub id: String,
    pub state: EnvironmentState,
}

#[derive(Debug, Default, Deserialize)]
pub struct ListQuery {
    pub owner_id: Option<i64>,
    pub state: Option<String>,
}

impl ListQuery {
    fn into_filters(self) -> ApiResult<EnvironmentFilters> {
        let state = match self.state.as_deref() {
            None | Some("") => None,
            Some(raw) => Some(
                EnvironmentState::parse(raw)
                    .ok_or_else(|| ApiError::BadRequest(format!("unknown state: {raw}")))?,
            ),
        };
        Ok(EnvironmentFilters {
            owner_id: self.owner_id,
            state,
        })
    }
}

/// Reply to a touch: accepted plus the status after the touch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TouchResponse {
    pub accepted: bool,
    #[serde(flatten)]
    pub status: EnvironmentStatus,
}

async fn create_environment(
    State(state): State<AppState>,
    Json(req): Json<CreateEnvironmentRequest>,
) -> ApiResult<Json<CreateEnvironmentResponse>> {
    let env = state
        .orchestrator
        .create_environment(req.owner_id, req.project_id)
        .await?;

    Ok(Json(CreateEnvironmentResponse {
        id: env.id,
        state: env.state,
    }))
}

async fn list_environments(
    State(state): State<AppState>,
    Query(query): Query<ListQuery>,
) -> ApiResult<Json<Vec<Environment>>> {
    let filters = query.into_filters()?;
    let environments = state.orchestrator.list_environments(&filters).await?;

    Ok(Json(environments))
}

async fn get_environment(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<EnvironmentStatus>> {
    let status = state.orchestrator.get_status(&id).await?;

    Ok(Json(status))
}

async fn start_environment(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<(StatusCode, Json<Accepted>)> {
    let accepted = state.orchestrator.start_environment(&id).await?;
    Ok((StatusCode::ACCEPTED, Json(accepted)))
}

async fn stop_environment(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<(StatusCode, Json<Accepted>)> {
    let accepted = state.orchestrator.stop_environment(&id).await?;
    Ok((StatusCode::ACCEPTED, Json(accepted)))
}

async fn delete_environment(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<(StatusCode, Json<Accepted>)> {
    let accepted = state.orchestrator.delete_environment(&id).await?;
    Ok((StatusCode::ACCEPTED, Json(accepted)))
}

async fn touch_environment(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<(StatusCode, Json<TouchResponse>)> {
    let status = state.orchestrator.touch_environment(&id).await?;
    Ok((
        StatusCode::ACCEPTED,
        Json(TouchResponse {
            accepted: true,
            status,
        }),
    ))
}

async fn list_operations(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<Vec<Operation>>> {
    let operations = state.orchestrator.list_operations(&id).await?;
    Ok(Json(operations))
}
