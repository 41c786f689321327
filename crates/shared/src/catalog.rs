//! Tier catalog
//!
//! Static pricing and quota table. Not user-owned and never persisted.

use serde::Serialize;

use crate::types::{Limit, ResourceKind, SubscriptionTier};

/// Tier granted while a trial is running
pub const TRIAL_TIER: SubscriptionTier = SubscriptionTier::Pro;

/// Length of a trial in days
pub const TRIAL_LENGTH_DAYS: i64 = 14;

/// Quotas and list prices for one tier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TierLimits {
    pub tier: SubscriptionTier,
    /// Teams a user may own
    pub max_teams: Limit,
    /// Players on a single team
    pub max_players_per_team: Limit,
    /// `None` means custom pricing (contact sales)
    pub monthly_price_cents: Option<u32>,
    pub annual_price_cents: Option<u32>,
}

impl TierLimits {
    /// Free tier: 1 team, 15 players per team
    pub const fn free() -> Self {
        Self {
            tier: SubscriptionTier::Free,
            max_teams: Limit::Limited(1),
            max_players_per_team: Limit::Limited(15),
            monthly_price_cents: Some(0),
            annual_price_cents: Some(0),
        }
    }

    /// Pro tier: 3 teams, 30 players per team, $9.99/month or $99/year
    pub const fn pro() -> Self {
        Self {
            tier: SubscriptionTier::Pro,
            max_teams: Limit::Limited(3),
            max_players_per_team: Limit::Limited(30),
            monthly_price_cents: Some(999),
            annual_price_cents: Some(9_900),
        }
    }

    /// Premium tier: 10 teams, 50 players per team, $19.99/month or $199/year
    pub const fn premium() -> Self {
        Self {
            tier: SubscriptionTier::Premium,
            max_teams: Limit::Limited(10),
            max_players_per_team: Limit::Limited(50),
            monthly_price_cents: Some(1_999),
            annual_price_cents: Some(19_900),
        }
    }

    /// Enterprise tier: unlimited everything, custom pricing
    pub const fn enterprise() -> Self {
        Self {
            tier: SubscriptionTier::Enterprise,
            max_teams: Limit::Unlimited,
            max_players_per_team: Limit::Unlimited,
            monthly_price_cents: None,
            annual_price_cents: None,
        }
    }

    /// Quota that applies to a resource kind
    pub fn limit_for(&self, kind: ResourceKind) -> Limit {
        match kind {
            ResourceKind::Teams => self.max_teams,
            ResourceKind::Players => self.max_players_per_team,
        }
    }
}

/// Look up the limits of a tier
pub fn limits_for(tier: SubscriptionTier) -> TierLimits {
    match tier {
        SubscriptionTier::Free => TierLimits::free(),
        SubscriptionTier::Pro => TierLimits::pro(),
        SubscriptionTier::Premium => TierLimits::premium(),
        SubscriptionTier::Enterprise => TierLimits::enterprise(),
    }
}

/// Every tier, cheapest first (pricing page order)
pub fn all() -> Vec<TierLimits> {
    SubscriptionTier::ALL.into_iter().map(limits_for).collect()
}
