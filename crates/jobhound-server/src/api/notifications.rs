//! Notifications API endpoints.
//!
//! - GET /api/notifications?state=&limit= - Recent items, newest first
//! - POST /api/notifications/{id}/retry - Re-arm a failed item
//! - POST /api/notifications/test - Send a test message to an endpoint

use axum::{
    Json, Router,
    extract::{Path, Query, State},
    routing::{get, post},
};
use serde::{Deserialize, Serialize};

use jobhound_core::{DeliveryState, NotificationItem};

use super::{ApiError, ApiResult};
use crate::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/", get(list_notifications))
        .route("/test", post(send_test))
        .route("/{id}/retry", post(retry_notification))
}

#[derive(Debug, Default, Deserialize)]
pub struct ListQuery {
    pub state: Option<String>,
    pub limit: Option<u32>,
}

#[derive(Debug, Deserialize)]
pub struct TestRequest {
    pub endpoint: String,
}

#[derive(Debug, Serialize)]
pub struct TestResponse {
    pub delivered: bool,
}

async fn list_notifications(
    State(state): State<AppState>,
    Query(query): Query<ListQuery>,
) -> ApiResult<Vec<NotificationItem>> {
    let filter = match query.state.as_deref().filter(|s| !s.is_empty()) {
        Some(raw) => Some(
            DeliveryState::parse(raw)
                .ok_or_else(|| ApiError::bad_request(format!("unknown state {raw}")))?,
        ),
        None => None,
    };
    let limit = query.limit.unwrap_or(50).clamp(1, 200);
    Ok(Json(state.notifications.list(filter, limit).await?))
}

async fn retry_notification(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<NotificationItem> {
    Ok(Json(state.scheduler.retry_notification(&id).await?))
}

/// Bypasses the queue; the outcome is reported directly.
async fn send_test(
    State(state): State<AppState>,
    Json(request): Json<TestRequest>,
) -> ApiResult<TestResponse> {
    state.scheduler.send_test(&request.endpoint).await?;
    Ok(Json(TestResponse { delivered: true }))
}
