//! Scheduler control.
//!
//! - GET /api/scheduler - Current status
//! - POST /api/scheduler/start - Start the loop, optionally with an endpoint
//! - POST /api/scheduler/stop - Stop the loop
//! - PUT /api/scheduler/endpoint - Replace or clear the delivery endpoint
//! - POST /api/scheduler/check - Run one tick immediately

use axum::{
    Json, Router,
    extract::State,
    routing::{get, post, put},
};
use serde::{Deserialize, Serialize};

use jobhound_core::{SchedulerStatus, TickReport};

use super::ApiResult;
use crate::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/", get(status))
        .route("/start", post(start))
        .route("/stop", post(stop))
        .route("/endpoint", put(set_endpoint))
        .route("/check", post(check_now))
}

#[derive(Debug, Default, Deserialize)]
pub struct StartRequest {
    pub endpoint: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct EndpointRequest {
    pub endpoint: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct StopResponse {
    pub stopped: bool,
    pub status: SchedulerStatus,
}

async fn status(State(state): State<AppState>) -> Json<SchedulerStatus> {
    Json(state.scheduler.status().await)
}

/// Idempotent; a second call only updates the endpoint.
async fn start(
    State(state): State<AppState>,
    body: Option<Json<StartRequest>>,
) -> ApiResult<SchedulerStatus> {
    let request = body.map(|Json(b)| b).unwrap_or_default();
    let status = state.scheduler.start(request.endpoint.as_deref()).await?;
    Ok(Json(status))
}

async fn stop(State(state): State<AppState>) -> Json<StopResponse> {
    let stopped = state.scheduler.stop().await;
    Json(StopResponse {
        stopped,
        status: state.scheduler.status().await,
    })
}

async fn set_endpoint(
    State(state): State<AppState>,
    Json(request): Json<EndpointRequest>,
) -> ApiResult<SchedulerStatus> {
    state
        .scheduler
        .set_endpoint(request.endpoint.as_deref())
        .await?;
    Ok(Json(state.scheduler.status().await))
}

async fn check_now(State(state): State<AppState>) -> Json<TickReport> {
    Json(state.scheduler.check_now().await)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::harness;
    use axum::http::StatusCode;

    #[tokio::test]
    async fn start_twice_keeps_one_loop_and_stop_reports_it() {
        let h = harness().await;

        let Json(first) = start(State(h.state.clone()), None).await.expect("start");
        assert!(first.running);
        let Json(second) = start(
            State(h.state.clone()),
            Some(Json(StartRequest {
                endpoint: Some("https://other.example.com/hook".into()),
            })),
        )
        .await
        .expect("start again");
        assert!(second.running);
        assert_eq!(second.endpoint.as_deref(), Some("https://other.example.com/hook"));

        let Json(stopped) = stop(State(h.state.clone())).await;
        assert!(stopped.stopped);
        assert!(!stopped.status.running);

        let Json(again) = stop(State(h.state.clone())).await;
        assert!(!again.stopped);
    }

    #[tokio::test]
    async fn invalid_endpoint_is_a_bad_request() {
        let h = harness().await;
        let err = set_endpoint(
            State(h.state.clone()),
            Json(EndpointRequest {
                endpoint: Some("ftp://example.com".into()),
            }),
        )
        .await
        .expect_err("rejected");
        assert_eq!(err.status(), StatusCode::BAD_REQUEST);
        assert_eq!(err.error, "validation_error");

        let Json(status) = status(State(h.state.clone())).await;
        assert_eq!(status.endpoint.as_deref(), Some("https://hooks.example.com/notify"));
    }

    #[tokio::test]
    async fn clearing_endpoint_is_allowed() {
        let h = harness().await;
        let Json(status) = set_endpoint(
            State(h.state.clone()),
            Json(EndpointRequest { endpoint: None }),
        )
        .await
        .expect("clear");
        assert_eq!(status.endpoint, None);
    }

    #[tokio::test]
    async fn check_runs_a_tick() {
        let h = harness().await;
        let Json(report) = check_now(State(h.state.clone())).await;
        assert_eq!(report.accounts_synced, 1);
        assert_eq!(report.accounts_failed, 0);

        let Json(status) = status(State(h.state.clone())).await;
        assert!(status.last_tick_at.is_some());
    }
}
