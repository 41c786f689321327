//! Trusted tier changes, called by the payment backend with the service key

use axum::{
    extract::{Path, State},
    Json,
};
use coachhub_billing::{BillingError, Entitlement, TierChangeSource};
use coachhub_shared::{SubscriptionTier, UserId};
use serde::Deserialize;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::{error::ApiResult, state::AppState};

#[derive(Debug, Deserialize)]
pub struct SetTierRequest {
    pub tier: String,
    /// Audit source; derived from the direction of the change when absent
    #[serde(default)]
    pub source: Option<TierChangeSource>,
}

/// PUT /api/v1/admin/users/{user_id}/tier
pub async fn set_user_tier(
    State(state): State<AppState>,
    Path(user_id): Path<Uuid>,
    Json(req): Json<SetTierRequest>,
) -> ApiResult<Json<Entitlement>> {
    let user_id = UserId(user_id);
    let tier = req
        .tier
        .parse::<SubscriptionTier>()
        .map_err(BillingError::from)?;

    state
        .entitlements
        .set_tier_at(user_id, tier, req.source, OffsetDateTime::now_utc())
        .await?;
    tracing::info!(user_id = %user_id, tier = %tier, source = ?req.source, "Tier set by service");

    let entitlement = state.entitlements.entitlement(user_id).await?;
    Ok(Json(entitlement))
}
