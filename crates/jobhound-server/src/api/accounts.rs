//! Accounts API endpoints.
//!
//! Provides:
//! - GET /api/accounts - List accounts
//! - POST /api/accounts/sync - Sync every enabled account
//! - POST /api/accounts/{id}/sync - Sync one account now
//! - POST /api/accounts/{id}/reallocate - Re-run patterns over stored mail
//! - GET /api/accounts/{id}/emails - Stored mail, newest first

use axum::{
    Json, Router,
    extract::{Path, Query, State},
    routing::{get, post},
};
use serde::{Deserialize, Serialize};

use jobhound_core::{
    Account, AccountRepository, AccountState, EmailMessage, Page, ReallocationReport, SyncReport,
};

use super::{ApiError, ApiResult};
use crate::AppState;

/// Create the accounts API router.
pub fn router() -> Router<AppState> {
    Router::new()
        .route("/", get(list_accounts))
        .route("/sync", post(sync_all))
        .route("/{id}/sync", post(sync_now))
        .route("/{id}/reallocate", post(reallocate))
        .route("/{id}/emails", get(list_emails))
}

/// Account without credentials.
#[derive(Debug, Serialize)]
pub struct AccountSummary {
    pub id: String,
    pub provider: String,
    pub email: String,
    pub display_name: Option<String>,
    pub enabled: bool,
    pub state: AccountState,
}

fn account_to_summary(account: Account) -> AccountSummary {
    AccountSummary {
        id: account.id,
        provider: account.provider,
        email: account.email,
        display_name: account.display_name,
        enabled: account.enabled,
        state: account.state,
    }
}

/// One entry per account; exactly one of `report` and `error` is set.
#[derive(Debug, Serialize)]
pub struct AccountSyncResult {
    pub account_id: String,
    pub report: Option<SyncReport>,
    pub error: Option<ApiError>,
}

#[derive(Debug, Default, Deserialize)]
pub struct EmailQuery {
    #[serde(default)]
    pub unallocated: bool,
    pub limit: Option<u32>,
    pub offset: Option<u32>,
}

impl EmailQuery {
    pub fn page(&self) -> Page {
        let defaults = Page::default();
        Page {
            limit: self.limit.unwrap_or(defaults.limit),
            offset: self.offset.unwrap_or(defaults.offset),
        }
    }
}

async fn list_accounts(State(state): State<AppState>) -> ApiResult<Vec<AccountSummary>> {
    let accounts = AccountRepository::new(state.db.clone()).list_all().await?;
    Ok(Json(accounts.into_iter().map(account_to_summary).collect()))
}

async fn sync_now(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<SyncReport> {
    Ok(Json(state.scheduler.sync_now(&id).await?))
}

async fn sync_all(State(state): State<AppState>) -> ApiResult<Vec<AccountSyncResult>> {
    let results = state.scheduler.sync_all().await?;
    Ok(Json(
        results
            .into_iter()
            .map(|(account_id, outcome)| match outcome {
                Ok(report) => AccountSyncResult {
                    account_id,
                    report: Some(report),
                    error: None,
                },
                Err(err) => AccountSyncResult {
                    account_id,
                    report: None,
                    error: Some(err.into()),
                },
            })
            .collect(),
    ))
}

async fn reallocate(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<ReallocationReport> {
    Ok(Json(state.allocation.reallocate_all(&id).await?))
}

async fn list_emails(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<EmailQuery>,
) -> ApiResult<Vec<EmailMessage>> {
    AccountRepository::new(state.db.clone())
        .get_by_id(&id)
        .await?;
    let messages = if query.unallocated {
        state.allocation.list_unallocated(&id, query.page()).await?
    } else {
        state.allocation.list_by_account(&id, query.page()).await?
    };
    Ok(Json(messages))
}
