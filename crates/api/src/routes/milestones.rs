//! Trial milestone warnings

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Extension, Json,
};
use coachhub_billing::MilestoneKey;
use serde::Serialize;

use crate::{auth::AuthUser, error::ApiResult, state::AppState};

#[derive(Debug, Serialize)]
pub struct MilestoneResponse {
    /// `null` when no warning is due
    pub milestone: Option<MilestoneKey>,
}

/// GET /api/v1/milestones/pending
///
/// Read-only; the client acknowledges after showing the warning.
pub async fn pending(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
) -> ApiResult<Json<MilestoneResponse>> {
    let milestone = state.entitlements.pending_milestone(user.user_id).await?;
    Ok(Json(MilestoneResponse { milestone }))
}

/// POST /api/v1/milestones/claim
///
/// Decide and record in one step. At most one caller gets each key.
pub async fn claim(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
) -> ApiResult<Json<MilestoneResponse>> {
    let milestone = state.entitlements.claim_milestone(user.user_id).await?;
    Ok(Json(MilestoneResponse { milestone }))
}

/// POST /api/v1/milestones/{key}/acknowledge
pub async fn acknowledge(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Path(key): Path<String>,
) -> ApiResult<StatusCode> {
    let key = key.parse::<MilestoneKey>()?;
    state
        .entitlements
        .acknowledge_milestone(user.user_id, key)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}
