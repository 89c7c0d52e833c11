use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};

use flowrun_core::error::FlowError;
use flowrun_core::types::{ExecutionId, ExecutionStatus, Variables};

/// Body of `POST /api/flows/{id}/executions`.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct SubmitRequest {
    #[serde(default)]
    pub variables: Variables,
}

/// Body of `POST /api/executions/{id}/approval`.
#[derive(Debug, Serialize, Deserialize)]
pub struct ApprovalRequest {
    pub approved: bool,
    #[serde(default)]
    pub reason: Option<String>,
    #[serde(default)]
    pub step_id: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CancelResponse {
    pub id: ExecutionId,
    pub status: ExecutionStatus,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ApprovalResponse {
    pub id: ExecutionId,
    pub step_id: String,
}

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    #[serde(default = "default_limit")]
    pub limit: usize,
}

fn default_limit() -> usize {
    50
}

#[derive(Debug, Default, Deserialize)]
pub struct SeqQuery {
    #[serde(default)]
    pub from_seq: u64,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub code: u16,
    pub message: String,
}

/// Error returned by REST handlers.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("Insufficient role for this operation")]
    Forbidden,

    #[error("Invalid request body: {0}")]
    BadRequest(String),

    #[error(transparent)]
    Flow(#[from] FlowError),
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            Self::Forbidden => StatusCode::FORBIDDEN,
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::Flow(e) => match e {
                FlowError::Graph(_) => StatusCode::UNPROCESSABLE_ENTITY,
                FlowError::FlowNotFound(_) | FlowError::ExecutionNotFound(_) => {
                    StatusCode::NOT_FOUND
                }
                FlowError::NoPendingApproval(_) => StatusCode::CONFLICT,
                _ => StatusCode::INTERNAL_SERVER_ERROR,
            },
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = ErrorPayload {
            code: status.as_u16(),
            message: self.to_string(),
        };
        (status, Json(serde_json::json!({ "error": body }))).into_response()
    }
}
