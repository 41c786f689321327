//! Subscription and trial routes

use axum::{extract::State, Extension, Json};
use coachhub_billing::Entitlement;
use coachhub_shared::SubscriptionTier;
use serde::Deserialize;

use crate::{auth::AuthUser, error::ApiResult, state::AppState};

/// GET /api/v1/subscription
pub async fn get_entitlement(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
) -> ApiResult<Json<Entitlement>> {
    let entitlement = state.entitlements.entitlement(user.user_id).await?;
    Ok(Json(entitlement))
}

/// POST /api/v1/subscription/trial
pub async fn start_trial(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
) -> ApiResult<Json<Entitlement>> {
    state.entitlements.start_trial(user.user_id).await?;
    let entitlement = state.entitlements.entitlement(user.user_id).await?;
    Ok(Json(entitlement))
}

#[derive(Debug, Deserialize)]
pub struct ChangeTierRequest {
    pub tier: String,
}

/// PUT /api/v1/subscription/tier
///
/// Downgrades only. Upgrades arrive from the payment backend on the admin
/// route once payment has settled.
pub async fn change_tier(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Json(req): Json<ChangeTierRequest>,
) -> ApiResult<Json<Entitlement>> {
    let tier = req
        .tier
        .parse::<SubscriptionTier>()
        .map_err(coachhub_billing::BillingError::from)?;

    state
        .entitlements
        .change_tier_for_user(user.user_id, tier)
        .await?;
    let entitlement = state.entitlements.entitlement(user.user_id).await?;
    Ok(Json(entitlement))
}
