use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::StatusCode,
    routing::{get, post},
};
use db::models::{
    crew::Crew,
    execution::Execution,
    human_input_request::ResolveOutcome,
    stage::Stage,
};
use deployment::Deployment;
use serde::{Deserialize, Serialize};
use services::services::{cancellation::CancelOutcome, kanban};
use ts_rs::TS;
use utils::response::ApiResponse;
use uuid::Uuid;

use crate::{DeploymentImpl, error::ApiError};

#[derive(Debug, Deserialize)]
pub struct ReplayQuery {
    /// Last sequence number the viewer already has; replay starts after it.
    pub from_sequence: Option<i64>,
}

#[derive(Debug, Deserialize, TS)]
pub struct SubmitInputRequest {
    pub input: String,
}

#[derive(Debug, Serialize, TS)]
pub struct SubmitInputResponse {
    pub status: String,
}

pub fn router(deployment: &DeploymentImpl) -> Router<DeploymentImpl> {
    Router::new()
        .route("/executions/{execution_id}", get(get_execution))
        .route("/executions/{execution_id}/stages", get(list_stages))
        .route("/executions/{execution_id}/board", get(get_board))
        .route("/executions/{execution_id}/input", post(submit_input))
        .route("/executions/{execution_id}/cancel", post(cancel_execution))
        .with_state(deployment.clone())
}

async fn get_execution(
    State(deployment): State<DeploymentImpl>,
    Path(execution_id): Path<Uuid>,
) -> Result<Json<ApiResponse<Execution>>, ApiError> {
    let execution = Execution::find_by_id(&deployment.db().pool, execution_id)
        .await?
        .ok_or_else(|| ApiError::NotFound("Execution not found".into()))?;
    Ok(Json(ApiResponse::success(execution)))
}

async fn list_stages(
    State(deployment): State<DeploymentImpl>,
    Path(execution_id): Path<Uuid>,
    Query(query): Query<ReplayQuery>,
) -> Result<Json<ApiResponse<Vec<Stage>>>, ApiError> {
    Execution::find_by_id(&deployment.db().pool, execution_id)
        .await?
        .ok_or_else(|| ApiError::NotFound("Execution not found".into()))?;

    let stages = deployment
        .stage_bus()
        .replay(execution_id, query.from_sequence.unwrap_or(0))
        .await?;
    Ok(Json(ApiResponse::success(stages)))
}

async fn get_board(
    State(deployment): State<DeploymentImpl>,
    Path(execution_id): Path<Uuid>,
) -> Result<Json<ApiResponse<kanban::KanbanBoard>>, ApiError> {
    let pool = &deployment.db().pool;
    let execution = Execution::find_by_id(pool, execution_id)
        .await?
        .ok_or_else(|| ApiError::NotFound("Execution not found".into()))?;
    let crew = Crew::find_by_id(pool, execution.crew_id)
        .await?
        .ok_or_else(|| ApiError::NotFound("Crew not found".into()))?;
    let stages = deployment.stage_bus().replay(execution_id, 0).await?;

    Ok(Json(ApiResponse::success(kanban::project(
        &crew, &execution, stages,
    ))))
}

/// Resolve the execution's pending input request. Concurrent submissions
/// race on a conditional update: one wins, the rest get 409.
async fn submit_input(
    State(deployment): State<DeploymentImpl>,
    Path(execution_id): Path<Uuid>,
    Json(payload): Json<SubmitInputRequest>,
) -> Result<(StatusCode, Json<SubmitInputResponse>), ApiError> {
    Execution::find_by_id(&deployment.db().pool, execution_id)
        .await?
        .ok_or_else(|| ApiError::NotFound("Execution not found".into()))?;

    match deployment
        .gate()
        .resolve(execution_id, &payload.input)
        .await?
    {
        ResolveOutcome::Resolved(_) => Ok((
            StatusCode::OK,
            Json(SubmitInputResponse {
                status: "success".to_string(),
            }),
        )),
        ResolveOutcome::AlreadyResolved => Ok((
            StatusCode::CONFLICT,
            Json(SubmitInputResponse {
                status: "already_resolved".to_string(),
            }),
        )),
        ResolveOutcome::NotFound => Err(ApiError::NotFound(
            "No input request for this execution".into(),
        )),
    }
}

/// Flag the execution for cancellation and close any gate it is waiting
/// on; the engine settles it at its next suspension point.
async fn cancel_execution(
    State(deployment): State<DeploymentImpl>,
    Path(execution_id): Path<Uuid>,
) -> Result<Json<ApiResponse<()>>, ApiError> {
    match deployment.cancellations().mark_cancelled(execution_id).await? {
        CancelOutcome::Flagged => {
            if deployment.gate().cancel_pending_input(execution_id).await? {
                tracing::info!(execution_id = %execution_id, "closed pending input request");
            }
            Ok(Json(ApiResponse::success(())))
        }
        CancelOutcome::AlreadyTerminal => Err(ApiError::Conflict(
            "Execution already reached a terminal status".into(),
        )),
        CancelOutcome::NotFound => Err(ApiError::NotFound("Execution not found".into())),
    }
}
