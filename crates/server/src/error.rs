use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use db::models::{
    crew::CrewError, execution::ExecutionError, human_input_request::HumanInputRequestError,
    stage::StageError,
};
use deployment::DeploymentError;
use services::services::{
    cancellation::CancellationError, engine::EngineError, gate::GateError,
    stage_bus::StageBusError,
};
use thiserror::Error;
use utils::response::ApiResponse;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error(transparent)]
    Database(#[from] sqlx::Error),
    #[error(transparent)]
    Deployment(#[from] DeploymentError),
    #[error(transparent)]
    Engine(#[from] EngineError),
    #[error(transparent)]
    Bus(#[from] StageBusError),
    #[error("Conflict: {0}")]
    Conflict(String),
    #[error("Bad Request: {0}")]
    BadRequest(String),
    #[error("Not Found: {0}")]
    NotFound(String),
    #[error("Internal Server Error: {0}")]
    InternalError(String),
}

impl From<CrewError> for ApiError {
    fn from(err: CrewError) -> Self {
        match err {
            CrewError::Database(e) => ApiError::Database(e),
            CrewError::NotFound => ApiError::NotFound("Crew not found".into()),
        }
    }
}

impl From<ExecutionError> for ApiError {
    fn from(err: ExecutionError) -> Self {
        match err {
            ExecutionError::Database(e) => ApiError::Database(e),
            ExecutionError::NotFound => ApiError::NotFound("Execution not found".into()),
        }
    }
}

impl From<StageError> for ApiError {
    fn from(err: StageError) -> Self {
        match err {
            StageError::Database(e) => ApiError::Database(e),
            StageError::NotFound => ApiError::NotFound("Stage not found".into()),
        }
    }
}

impl From<HumanInputRequestError> for ApiError {
    fn from(err: HumanInputRequestError) -> Self {
        match err {
            HumanInputRequestError::Database(e) => ApiError::Database(e),
            HumanInputRequestError::NotFound => {
                ApiError::NotFound("Input request not found".into())
            }
            HumanInputRequestError::PendingRequestExists => {
                ApiError::Conflict("An unresolved input request already exists".into())
            }
        }
    }
}

impl From<GateError> for ApiError {
    fn from(err: GateError) -> Self {
        match err {
            GateError::Database(e) => ApiError::Database(e),
            GateError::Request(e) => e.into(),
            GateError::Execution(e) => e.into(),
            GateError::Bus(e) => ApiError::Bus(e),
            GateError::Cancellation(e) => e.into(),
        }
    }
}

impl From<CancellationError> for ApiError {
    fn from(err: CancellationError) -> Self {
        match err {
            CancellationError::Database(e) => ApiError::Database(e),
            CancellationError::Execution(e) => e.into(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status_code, error_type) = match &self {
            ApiError::Database(_) => (StatusCode::INTERNAL_SERVER_ERROR, "DatabaseError"),
            ApiError::Deployment(_) => (StatusCode::INTERNAL_SERVER_ERROR, "DeploymentError"),
            ApiError::Engine(_) => (StatusCode::INTERNAL_SERVER_ERROR, "EngineError"),
            ApiError::Bus(_) => (StatusCode::INTERNAL_SERVER_ERROR, "StageBusError"),
            ApiError::Conflict(_) => (StatusCode::CONFLICT, "ConflictError"),
            ApiError::BadRequest(_) => (StatusCode::BAD_REQUEST, "BadRequest"),
            ApiError::NotFound(_) => (StatusCode::NOT_FOUND, "NotFound"),
            ApiError::InternalError(_) => (StatusCode::INTERNAL_SERVER_ERROR, "InternalError"),
        };

        let error_message = match &self {
            ApiError::Conflict(msg)
            | ApiError::BadRequest(msg)
            | ApiError::NotFound(msg)
            | ApiError::InternalError(msg) => msg.clone(),
            _ => format!("{}: {}", error_type, self),
        };
        let response = ApiResponse::<()>::error(&error_message);
        (status_code, Json(response)).into_response()
    }
}
