use axum::{
    Json, Router,
    extract::{Path, State},
    http::StatusCode,
    routing::get,
};
use db::models::{
    crew::{CreateCrew, Crew},
    execution::{CreateExecution, Execution},
};
use deployment::Deployment;
use serde::Deserialize;
use ts_rs::TS;
use utils::response::ApiResponse;
use uuid::Uuid;

use crate::{DeploymentImpl, error::ApiError};

#[derive(Debug, Deserialize, TS)]
pub struct StartExecutionRequest {
    pub client_id: Uuid,
}

pub fn router(deployment: &DeploymentImpl) -> Router<DeploymentImpl> {
    Router::new()
        .route("/crews", get(list_crews).post(create_crew))
        .route("/crews/{crew_id}", get(get_crew))
        .route(
            "/crews/{crew_id}/executions",
            get(list_executions).post(start_execution),
        )
        .with_state(deployment.clone())
}

async fn list_crews(
    State(deployment): State<DeploymentImpl>,
) -> Result<Json<ApiResponse<Vec<Crew>>>, ApiError> {
    let crews = Crew::find_all(&deployment.db().pool).await?;
    Ok(Json(ApiResponse::success(crews)))
}

async fn create_crew(
    State(deployment): State<DeploymentImpl>,
    Json(payload): Json<CreateCrew>,
) -> Result<(StatusCode, Json<ApiResponse<Crew>>), ApiError> {
    if payload.tasks.is_empty() {
        return Err(ApiError::BadRequest("A crew needs at least one task".into()));
    }
    let crew = Crew::create(&deployment.db().pool, &payload, Uuid::new_v4()).await?;
    Ok((StatusCode::CREATED, Json(ApiResponse::success(crew))))
}

async fn get_crew(
    State(deployment): State<DeploymentImpl>,
    Path(crew_id): Path<Uuid>,
) -> Result<Json<ApiResponse<Crew>>, ApiError> {
    let crew = Crew::find_by_id(&deployment.db().pool, crew_id)
        .await?
        .ok_or_else(|| ApiError::NotFound("Crew not found".into()))?;
    Ok(Json(ApiResponse::success(crew)))
}

async fn list_executions(
    State(deployment): State<DeploymentImpl>,
    Path(crew_id): Path<Uuid>,
) -> Result<Json<ApiResponse<Vec<Execution>>>, ApiError> {
    let executions = Execution::find_by_crew(&deployment.db().pool, crew_id).await?;
    Ok(Json(ApiResponse::success(executions)))
}

/// Insert a PENDING execution; the worker role claims and runs it.
async fn start_execution(
    State(deployment): State<DeploymentImpl>,
    Path(crew_id): Path<Uuid>,
    Json(payload): Json<StartExecutionRequest>,
) -> Result<(StatusCode, Json<ApiResponse<Execution>>), ApiError> {
    Crew::find_by_id(&deployment.db().pool, crew_id)
        .await?
        .ok_or_else(|| ApiError::NotFound("Crew not found".into()))?;

    let execution = Execution::create(
        &deployment.db().pool,
        &CreateExecution {
            crew_id,
            client_id: payload.client_id,
        },
        Uuid::new_v4(),
    )
    .await?;

    Ok((StatusCode::CREATED, Json(ApiResponse::success(execution))))
}
