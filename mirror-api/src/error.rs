use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use mirror_common::config::ConfigError;
use mirror_common::event::PayloadDecodeError;
use mirror_common::pipeline::PipelineError;
use mirror_common::rpc::RpcError;
use mirror_common::schema::SchemaError;
use serde_derive::Serialize;
use thiserror::Error;
use tracing::error;

#[derive(Error, Debug)]
pub enum ApiError {
    #[error("invalid or missing credentials")]
    Unauthorized,
    #[error("a full refresh is running, retry later")]
    RefreshRunning,
    #[error("failed to parse request: {0}")]
    RequestParsing(#[from] serde_json::Error),
    #[error(transparent)]
    PayloadDecoding(#[from] PayloadDecodeError),
    #[error("program {0} is not tracked")]
    UnknownProgram(String),
    #[error(transparent)]
    Pipeline(#[from] PipelineError),
    #[error(transparent)]
    Rpc(#[from] RpcError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Schema(#[from] SchemaError),
}

#[derive(Serialize)]
struct ErrorBody {
    error: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match self {
            ApiError::Unauthorized => StatusCode::UNAUTHORIZED,
            ApiError::RefreshRunning => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::RequestParsing(_) | ApiError::PayloadDecoding(_) => StatusCode::BAD_REQUEST,
            ApiError::UnknownProgram(_) => StatusCode::NOT_FOUND,
            ApiError::Rpc(_) => StatusCode::BAD_GATEWAY,
            ApiError::Pipeline(_) | ApiError::Config(_) | ApiError::Schema(_) => {
                error!("internal error: {}", self);
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };

        (
            status,
            Json(ErrorBody {
                error: self.to_string(),
            }),
        )
            .into_response()
    }
}

/// Failures of a refresh or integrity sweep over one program.
#[derive(Error, Debug)]
pub enum JobError {
    #[error(transparent)]
    Rpc(#[from] RpcError),
    #[error(transparent)]
    Pipeline(#[from] PipelineError),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}
