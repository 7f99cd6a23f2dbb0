use actix_web::{error::ResponseError, http::StatusCode, web, HttpResponse, Result};
use serde::Serialize;
use std::fmt;

use crate::session::SessionError;
use crate::web::state::AppState;

/// Standard API response wrapper
#[derive(Serialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl<T: Serialize> ApiResponse<T> {
    pub fn success(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }
}

/// Error response structure
#[derive(Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
}

/// Custom API error type
#[derive(Debug)]
pub enum ApiError {
    NotFound(String),
    Conflict(String),
    InternalError(String),
}

impl fmt::Display for ApiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ApiError::NotFound(msg) => write!(f, "Not found: {}", msg),
            ApiError::Conflict(msg) => write!(f, "{}", msg),
            ApiError::InternalError(msg) => write!(f, "Internal error: {}", msg),
        }
    }
}

impl ResponseError for ApiError {
    fn status_code(&self) -> StatusCode {
        match self {
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Conflict(_) => StatusCode::CONFLICT,
            ApiError::InternalError(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn error_response(&self) -> HttpResponse {
        let code = match self {
            ApiError::NotFound(_) => "NOT_FOUND",
            ApiError::Conflict(_) => "CONFLICT",
            ApiError::InternalError(_) => "INTERNAL_ERROR",
        };
        HttpResponse::build(self.status_code()).json(ErrorResponse {
            error: self.to_string(),
            code: code.to_string(),
        })
    }
}

impl From<SessionError> for ApiError {
    fn from(err: SessionError) -> Self {
        match &err {
            SessionError::WorkspaceCommitInProgress(_)
            | SessionError::SessionCommitInProgress(_)
            | SessionError::AlreadyCommitted => ApiError::Conflict(err.to_string()),
            SessionError::Store(store) => match store {
                crate::session::StoreError::SessionNotFound(id)
                | crate::session::StoreError::WorkspaceNotFound(id) => {
                    ApiError::NotFound(id.clone())
                }
                _ => ApiError::InternalError(err.to_string()),
            },
            _ => ApiError::InternalError(err.to_string()),
        }
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CommitAccepted {
    pub job_id: String,
}

/// POST /api/projects/{project_id}/sessions/{session_id}/commit
pub async fn commit_session(
    state: web::Data<AppState>,
    path: web::Path<(String, String)>,
) -> Result<HttpResponse, ApiError> {
    let (project_id, session_id) = path.into_inner();
    let job_id = state.service.commit_session(&project_id, &session_id).await?;
    Ok(HttpResponse::Accepted().json(ApiResponse::success(CommitAccepted { job_id })))
}

/// GET /api/projects/{project_id}/sessions/{session_id}
pub async fn get_session(
    state: web::Data<AppState>,
    path: web::Path<(String, String)>,
) -> Result<HttpResponse, ApiError> {
    let (_project_id, session_id) = path.into_inner();
    let session = state
        .service
        .store()
        .get_session(&session_id)
        .ok_or_else(|| ApiError::NotFound(session_id))?;
    Ok(HttpResponse::Ok().json(ApiResponse::success(session)))
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SystemStatus {
    pub provider: crate::provider::ProviderStatus,
    pub session_count: usize,
}

/// GET /api/status - Returns backend readiness
pub async fn get_status(state: web::Data<AppState>) -> Result<HttpResponse> {
    let status = SystemStatus {
        provider: state.provider.status(),
        session_count: state.service.store().list_sessions().len(),
    };
    Ok(HttpResponse::Ok().json(ApiResponse::success(status)))
}
