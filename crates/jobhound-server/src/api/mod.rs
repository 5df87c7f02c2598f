//! JSON command surface over the core.
//!
//! Every handler either returns its payload or an [`ApiError`] carrying the
//! core's [`ErrorKind`], which decides the status code.

pub mod accounts;
pub mod companies;
pub mod emails;
pub mod notifications;
pub mod scheduler;

use axum::{
    Json, Router,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::delete,
};
use serde::Serialize;

use jobhound_core::{
    AccountError, AllocationError, CompanyError, ErrorKind, MessageError, NotificationError,
    PatternError, SchedulerError, SyncError,
};

use crate::AppState;

/// Create the main API router with all endpoints mounted.
pub fn router() -> Router<AppState> {
    Router::new()
        .nest("/accounts", accounts::router())
        .nest("/companies", companies::router())
        .nest("/emails", emails::router())
        .nest("/notifications", notifications::router())
        .nest("/scheduler", scheduler::router())
        .route("/patterns/{id}", delete(companies::remove_pattern))
}

/// Error response for API errors.
#[derive(Debug, Serialize)]
pub struct ApiError {
    #[serde(skip)]
    pub kind: ErrorKind,
    pub error: String,
    pub message: String,
}

impl ApiError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            error: kind.as_str().to_string(),
            message: message.into(),
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Validation, message)
    }

    pub fn status(&self) -> StatusCode {
        status_for(self.kind)
    }
}

pub fn status_for(kind: ErrorKind) -> StatusCode {
    match kind {
        ErrorKind::NotFound => StatusCode::NOT_FOUND,
        ErrorKind::Validation => StatusCode::BAD_REQUEST,
        ErrorKind::TransientIo => StatusCode::SERVICE_UNAVAILABLE,
        ErrorKind::PermanentDelivery => StatusCode::BAD_GATEWAY,
        ErrorKind::Conflict => StatusCode::CONFLICT,
        ErrorKind::Internal => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status(), Json(self)).into_response()
    }
}

macro_rules! from_core_error {
    ($($err:ty),+ $(,)?) => {
        $(
            impl From<$err> for ApiError {
                fn from(err: $err) -> Self {
                    let kind = err.kind();
                    if kind == ErrorKind::Internal {
                        tracing::error!(error = %err, "request failed");
                        return ApiError::new(kind, "internal error");
                    }
                    ApiError::new(kind, err.to_string())
                }
            }
        )+
    };
}

from_core_error!(
    AccountError,
    AllocationError,
    CompanyError,
    MessageError,
    NotificationError,
    PatternError,
    SchedulerError,
    SyncError,
);

pub type ApiResult<T> = Result<Json<T>, ApiError>;
