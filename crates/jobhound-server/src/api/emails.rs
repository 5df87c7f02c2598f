//! Per-message endpoints.
//!
//! - PUT /api/emails/{id}/allocation - Place a message with a company
//! - DELETE /api/emails/{id}/allocation - Return it to unallocated
//! - GET /api/emails/{id}/attachments/{attachment_id} - Raw attachment bytes

use axum::{
    Json, Router,
    extract::{Path, State},
    http::header,
    response::{IntoResponse, Response},
    routing::{get, put},
};
use serde::Deserialize;

use jobhound_core::{EmailMessage, MessageRepository};

use super::{ApiError, ApiResult};
use crate::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/{id}/allocation", put(allocate).delete(unallocate))
        .route("/{id}/attachments/{attachment_id}", get(fetch_attachment))
}

#[derive(Debug, Deserialize)]
pub struct AllocateRequest {
    pub company_id: String,
    /// When set, the write only lands if the message is still at this version.
    pub expected_version: Option<i64>,
}

async fn allocate(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(request): Json<AllocateRequest>,
) -> ApiResult<EmailMessage> {
    let message = match request.expected_version {
        Some(version) => {
            state
                .allocation
                .allocate_if_version(&id, Some(&request.company_id), version)
                .await?
        }
        None => state.allocation.allocate(&id, &request.company_id).await?,
    };
    Ok(Json(message))
}

async fn unallocate(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<EmailMessage> {
    Ok(Json(state.allocation.unallocate(&id).await?))
}

async fn fetch_attachment(
    State(state): State<AppState>,
    Path((id, attachment_id)): Path<(String, String)>,
) -> Result<Response, ApiError> {
    let message = MessageRepository::new(state.db.clone()).get(&id).await?;
    let mime_type = message
        .attachments
        .iter()
        .find(|a| a.attachment_id == attachment_id)
        .and_then(|a| a.mime_type.clone())
        .unwrap_or_else(|| "application/octet-stream".to_string());

    let bytes = state
        .sync
        .fetch_attachment(&message.account_id, &id, &attachment_id)
        .await?;
    Ok(([(header::CONTENT_TYPE, mime_type)], bytes).into_response())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{harness, raw_message};
    use axum::http::StatusCode;
    use jobhound_core::{Allocation, AllocationSource, AttachmentRef, Page};

    async fn synced_message(h: &crate::test_support::Harness) -> EmailMessage {
        let mut raw = raw_message("r1", "hr@acme.com", "Interview invite", 1);
        raw.attachments.push(AttachmentRef {
            attachment_id: "att1".into(),
            filename: Some("invite.pdf".into()),
            mime_type: Some("application/pdf".into()),
            size: 3,
        });
        h.provider.push_message(raw).await;
        h.provider.add_attachment("r1", "att1", b"pdf".to_vec()).await;
        h.state
            .sync
            .sync_account(&h.account_id)
            .await
            .expect("sync");
        h.state
            .allocation
            .list_by_account(&h.account_id, Page::default())
            .await
            .expect("list")
            .remove(0)
    }

    #[tokio::test]
    async fn allocate_then_unallocate() {
        let h = harness().await;
        let message = synced_message(&h).await;

        let Json(allocated) = allocate(
            State(h.state.clone()),
            Path(message.id.clone()),
            Json(AllocateRequest {
                company_id: "acme".into(),
                expected_version: None,
            }),
        )
        .await
        .expect("allocate");
        assert_eq!(
            allocated.allocation,
            Allocation::Allocated {
                company_id: "acme".into(),
                source: AllocationSource::Manual,
            }
        );

        let Json(cleared) = unallocate(State(h.state.clone()), Path(message.id.clone()))
            .await
            .expect("unallocate");
        assert_eq!(cleared.allocation, Allocation::Unallocated);
    }

    #[tokio::test]
    async fn stale_version_conflicts_and_unknown_company_is_not_found() {
        let h = harness().await;
        let message = synced_message(&h).await;

        let err = allocate(
            State(h.state.clone()),
            Path(message.id.clone()),
            Json(AllocateRequest {
                company_id: "acme".into(),
                expected_version: Some(message.allocation_version + 5),
            }),
        )
        .await
        .expect_err("stale version");
        assert_eq!(err.status(), StatusCode::CONFLICT);

        let err = allocate(
            State(h.state.clone()),
            Path(message.id.clone()),
            Json(AllocateRequest {
                company_id: "nobody".into(),
                expected_version: None,
            }),
        )
        .await
        .expect_err("unknown company");
        assert_eq!(err.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn attachment_bytes_come_from_the_provider() {
        let h = harness().await;
        let message = synced_message(&h).await;

        let response = fetch_attachment(
            State(h.state.clone()),
            Path((message.id.clone(), "att1".into())),
        )
        .await
        .expect("attachment");
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers().get(header::CONTENT_TYPE).expect("type"),
            "application/pdf"
        );

        let err = fetch_attachment(State(h.state.clone()), Path((message.id, "nope".into())))
            .await
            .expect_err("unknown attachment");
        assert_eq!(err.status(), StatusCode::NOT_FOUND);
    }
}
