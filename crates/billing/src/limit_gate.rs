//! Limit gate
//!
//! Answers "may this user create one more team/player?" against the tier
//! catalog. The gate only decides; persistence of the guarded insert lives in
//! the store so the count is re-read under lock at insert time.

use coachhub_shared::{
    catalog, Limit, PlayerId, ResourceKind, SubscriptionTier, TeamId, TierLimits,
};
use serde::Serialize;
use time::OffsetDateTime;

use crate::subscription::Subscription;

/// A resource a user is about to create
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resource {
    /// A team owned by the user
    Team,
    /// A player on one of the user's teams
    Player(TeamId),
}

impl Resource {
    pub fn kind(&self) -> ResourceKind {
        match self {
            Resource::Team => ResourceKind::Teams,
            Resource::Player(_) => ResourceKind::Players,
        }
    }
}

/// Structured allow/deny answer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Decision {
    pub resource: ResourceKind,
    /// Effective tier the decision was made against
    pub tier: SubscriptionTier,
    pub allowed: bool,
    pub limit: Limit,
    pub remaining: Limit,
}

/// Evaluate a count against tier limits
pub fn evaluate(limits: &TierLimits, kind: ResourceKind, current_count: u32) -> Decision {
    let limit = limits.limit_for(kind);
    Decision {
        resource: kind,
        tier: limits.tier,
        allowed: limit.allows(current_count),
        limit,
        remaining: limit.remaining(current_count),
    }
}

/// Evaluate against the subscription's effective tier at `now`
pub fn can_create(
    subscription: &Subscription,
    kind: ResourceKind,
    current_count: u32,
    now: OffsetDateTime,
) -> Decision {
    let limits = catalog::limits_for(subscription.effective_tier(now));
    evaluate(&limits, kind, current_count)
}

/// Tier and limit that apply to `kind` for this subscription at `now`.
///
/// Stores call this on the subscription row they hold locked, so the limit
/// and the count it is compared against come from the same snapshot.
pub fn effective_limit(
    subscription: &Subscription,
    kind: ResourceKind,
    now: OffsetDateTime,
) -> (SubscriptionTier, Limit) {
    let tier = subscription.effective_tier(now);
    (tier, catalog::limits_for(tier).limit_for(kind))
}

/// Outcome of a quota-guarded insert
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GuardedInsert<Id> {
    /// Inserted; `count_before` is the count observed under lock
    Inserted {
        id: Id,
        tier: SubscriptionTier,
        count_before: u32,
    },
    /// Count under lock was already at the limit; nothing written
    LimitReached { tier: SubscriptionTier, count: u32 },
}

/// Result of a create attempt, as returned to callers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum Creation<Id> {
    Created { id: Id, decision: Decision },
    Denied { decision: Decision },
}

impl<Id> Creation<Id> {
    pub fn decision(&self) -> &Decision {
        match self {
            Creation::Created { decision, .. } | Creation::Denied { decision } => decision,
        }
    }

    pub fn is_created(&self) -> bool {
        matches!(self, Creation::Created { .. })
    }

    /// Turn a store outcome into a caller-facing result.
    ///
    /// `remaining` on a created resource already counts the new row.
    pub fn from_guarded(kind: ResourceKind, outcome: GuardedInsert<Id>) -> Self {
        match outcome {
            GuardedInsert::Inserted {
                id,
                tier,
                count_before,
            } => {
                let limits = catalog::limits_for(tier);
                let after = evaluate(&limits, kind, count_before.saturating_add(1));
                Creation::Created {
                    id,
                    decision: Decision {
                        allowed: true,
                        ..after
                    },
                }
            }
            GuardedInsert::LimitReached { tier, count } => Creation::Denied {
                decision: evaluate(&catalog::limits_for(tier), kind, count),
            },
        }
    }
}

pub type TeamCreation = Creation<TeamId>;
pub type PlayerCreation = Creation<PlayerId>;

#[cfg(test)]
mod tests {
    use super::*;
    use coachhub_shared::{SubscriptionStatus, UserId};
    use time::macros::datetime;

    fn free_subscription() -> Subscription {
        Subscription::new_free(UserId::new(), datetime!(2025-01-01 00:00 UTC))
    }

    #[test]
    fn test_free_user_with_one_team_is_denied() {
        let decision = can_create(
            &free_subscription(),
            ResourceKind::Teams,
            1,
            datetime!(2025-01-02 00:00 UTC),
        );
        assert!(!decision.allowed);
        assert_eq!(decision.limit, Limit::Limited(1));
        assert_eq!(decision.remaining, Limit::Limited(0));
        assert_eq!(decision.tier, SubscriptionTier::Free);
    }

    #[test]
    fn test_deny_at_or_above_limit_allow_below_for_every_tier() {
        for tier in SubscriptionTier::ALL {
            let limits = catalog::limits_for(tier);
            for kind in [ResourceKind::Teams, ResourceKind::Players] {
                match limits.limit_for(kind) {
                    Limit::Limited(max) => {
                        assert!(evaluate(&limits, kind, max - 1).allowed);
                        assert!(!evaluate(&limits, kind, max).allowed);
                        assert!(!evaluate(&limits, kind, max + 3).allowed);
                    }
                    Limit::Unlimited => {
                        let decision = evaluate(&limits, kind, 1_000_000);
                        assert!(decision.allowed);
                        assert_eq!(decision.remaining, Limit::Unlimited);
                    }
                }
            }
        }
    }

    #[test]
    fn test_trial_grants_trial_tier_limits() {
        let mut sub = free_subscription();
        sub.tier = SubscriptionTier::Pro;
        sub.status = SubscriptionStatus::Trialing;
        sub.trial_ends_at = Some(datetime!(2025-01-15 00:00 UTC));

        let decision = can_create(&sub, ResourceKind::Teams, 1, datetime!(2025-01-05 00:00 UTC));
        assert!(decision.allowed);
        assert_eq!(decision.tier, SubscriptionTier::Pro);
        assert_eq!(decision.limit, Limit::Limited(3));
        assert_eq!(decision.remaining, Limit::Limited(2));
    }

    #[test]
    fn test_lapsed_unreconciled_trial_uses_free_limits() {
        let mut sub = free_subscription();
        sub.tier = SubscriptionTier::Pro;
        sub.status = SubscriptionStatus::Trialing;
        sub.trial_ends_at = Some(datetime!(2025-01-15 00:00 UTC));

        let decision = can_create(&sub, ResourceKind::Teams, 1, datetime!(2025-01-16 00:00 UTC));
        assert!(!decision.allowed);
        assert_eq!(decision.tier, SubscriptionTier::Free);
    }

    #[test]
    fn test_created_decision_counts_the_new_row() {
        let created = Creation::from_guarded(
            ResourceKind::Players,
            GuardedInsert::Inserted {
                id: 7u32,
                tier: SubscriptionTier::Free,
                count_before: 14,
            },
        );
        assert!(created.is_created());
        assert!(created.decision().allowed);
        assert_eq!(created.decision().remaining, Limit::Limited(0));

        // Same answer a fresh check gives right after the insert
        let fresh = evaluate(&TierLimits::free(), ResourceKind::Players, 15);
        assert_eq!(created.decision().remaining, fresh.remaining);

        let denied: Creation<u32> = Creation::from_guarded(
            ResourceKind::Players,
            GuardedInsert::LimitReached {
                tier: SubscriptionTier::Free,
                count: 15,
            },
        );
        assert!(!denied.is_created());
        assert!(!denied.decision().allowed);
    }

    #[test]
    fn test_first_free_team_leaves_nothing_remaining() {
        let created = Creation::from_guarded(
            ResourceKind::Teams,
            GuardedInsert::Inserted {
                id: 1u32,
                tier: SubscriptionTier::Free,
                count_before: 0,
            },
        );
        assert_eq!(created.decision().limit, Limit::Limited(1));
        assert_eq!(created.decision().remaining, Limit::Limited(0));
    }

    #[test]
    fn test_effective_limit_of_lapsed_trial_is_free() {
        let mut sub = free_subscription();
        sub.tier = SubscriptionTier::Pro;
        sub.status = SubscriptionStatus::Trialing;
        sub.trial_ends_at = Some(datetime!(2025-01-15 00:00 UTC));

        assert_eq!(
            effective_limit(&sub, ResourceKind::Teams, datetime!(2025-01-10 00:00 UTC)),
            (SubscriptionTier::Pro, Limit::Limited(3))
        );
        assert_eq!(
            effective_limit(&sub, ResourceKind::Teams, datetime!(2025-01-15 00:00 UTC)),
            (SubscriptionTier::Free, Limit::Limited(1))
        );
    }

    #[test]
    fn test_decision_serialization() {
        let decision = evaluate(&TierLimits::enterprise(), ResourceKind::Teams, 12);
        let json = serde_json::to_string(&decision).unwrap();
        assert!(json.contains("\"resource\":\"teams\""));
        assert!(json.contains("\"limit\":null"));
        assert!(json.contains("\"allowed\":true"));
    }
}
