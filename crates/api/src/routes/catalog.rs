//! Public tier catalog for the pricing page

use axum::Json;
use coachhub_shared::{catalog, SubscriptionTier, TierLimits, TRIAL_LENGTH_DAYS, TRIAL_TIER};
use serde::Serialize;

#[derive(Debug, Serialize)]
pub struct TrialOffer {
    pub tier: SubscriptionTier,
    pub length_days: i64,
}

#[derive(Debug, Serialize)]
pub struct TiersResponse {
    pub tiers: Vec<TierLimits>,
    pub trial: TrialOffer,
}

/// GET /api/v1/tiers
pub async fn list_tiers() -> Json<TiersResponse> {
    Json(TiersResponse {
        tiers: catalog::all(),
        trial: TrialOffer {
            tier: TRIAL_TIER,
            length_days: TRIAL_LENGTH_DAYS,
        },
    })
}
