//! Companies and their classification patterns.
//!
//! - GET /api/companies - List companies
//! - GET /api/companies/{id}/emails - Mail allocated to the company
//! - GET /api/companies/{id}/patterns - Patterns in evaluation order
//! - POST /api/companies/{id}/patterns - Add a pattern
//! - DELETE /api/patterns/{id} - Remove a pattern

use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::StatusCode,
    routing::get,
};

use jobhound_core::{
    Company, CompanyPattern, CompanyRepository, EmailMessage, NewCompanyPattern, Page,
    PatternRepository,
};

use super::{ApiError, ApiResult};
use crate::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/", get(list_companies))
        .route("/{id}/emails", get(list_emails))
        .route("/{id}/patterns", get(list_patterns).post(add_pattern))
}

async fn list_companies(State(state): State<AppState>) -> ApiResult<Vec<Company>> {
    Ok(Json(CompanyRepository::new(state.db.clone()).list().await?))
}

async fn list_emails(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(page): Query<Page>,
) -> ApiResult<Vec<EmailMessage>> {
    CompanyRepository::new(state.db.clone()).get(&id).await?;
    Ok(Json(state.allocation.list_by_company(&id, page).await?))
}

async fn list_patterns(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Vec<CompanyPattern>> {
    CompanyRepository::new(state.db.clone()).get(&id).await?;
    Ok(Json(
        PatternRepository::new(state.db.clone())
            .list_for_company(&id)
            .await?,
    ))
}

/// New patterns only affect mail classified afterwards; stored mail moves on
/// the next reallocation.
async fn add_pattern(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(pattern): Json<NewCompanyPattern>,
) -> Result<(StatusCode, Json<CompanyPattern>), ApiError> {
    let created = PatternRepository::new(state.db.clone())
        .add_pattern(&id, pattern)
        .await?;
    Ok((StatusCode::CREATED, Json(created)))
}

pub async fn remove_pattern(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    PatternRepository::new(state.db.clone())
        .remove_pattern(&id)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}
