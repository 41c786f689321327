//! Subscription record
//!
//! One row per user, mutated in place. `version` backs the optimistic
//! compare-and-swap used by every write.

use coachhub_shared::{SubscriptionStatus, SubscriptionTier, UserId};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::BillingError;

/// Authoritative subscription state of a user
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subscription {
    pub user_id: UserId,
    /// Tier recorded on the row. While trialing this is the trial tier.
    pub tier: SubscriptionTier,
    pub status: SubscriptionStatus,
    /// Set iff `status == Trialing`
    #[serde(with = "time::serde::rfc3339::option")]
    pub trial_ends_at: Option<OffsetDateTime>,
    /// Number of trials started. Non-zero means the trial was used; also the
    /// scope key of the milestone log.
    pub trial_instance: i32,
    pub version: i64,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

impl Subscription {
    /// Record created at signup: free, active, no trial
    pub fn new_free(user_id: UserId, now: OffsetDateTime) -> Self {
        Self {
            user_id,
            tier: SubscriptionTier::Free,
            status: SubscriptionStatus::Active,
            trial_ends_at: None,
            trial_instance: 0,
            version: 0,
            updated_at: now,
        }
    }

    pub fn has_used_trial(&self) -> bool {
        self.trial_instance > 0
    }

    pub fn is_trialing(&self) -> bool {
        self.status == SubscriptionStatus::Trialing
    }

    /// Tier whose limits apply right now.
    ///
    /// A trial whose end has passed but has not been reconciled yet already
    /// resolves to free, so a lagging write never grants extra access.
    pub fn effective_tier(&self, now: OffsetDateTime) -> SubscriptionTier {
        match self.status {
            SubscriptionStatus::Active => self.tier,
            SubscriptionStatus::Trialing => match self.trial_ends_at {
                Some(ends_at) if now < ends_at => self.tier,
                _ => SubscriptionTier::Free,
            },
            SubscriptionStatus::Expired => SubscriptionTier::Free,
        }
    }
}

/// Subscription row as stored, before validation
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct RawSubscriptionRow {
    pub user_id: Uuid,
    pub tier: String,
    pub status: String,
    pub trial_ends_at: Option<OffsetDateTime>,
    pub trial_instance: i32,
    pub version: i64,
    pub updated_at: OffsetDateTime,
}

impl RawSubscriptionRow {
    /// Validate a stored row.
    ///
    /// Integrity problems are logged and resolved toward the most restrictive
    /// state (free, not trialing); they never surface as errors to callers.
    pub fn into_subscription(self) -> Subscription {
        let user_id = UserId(self.user_id);

        let mut tier = self.tier.parse::<SubscriptionTier>().unwrap_or_else(|e| {
            log_integrity(user_id, BillingError::from(e));
            SubscriptionTier::Free
        });

        let mut status = self.status.parse::<SubscriptionStatus>().unwrap_or_else(|e| {
            log_integrity(user_id, BillingError::from(e));
            tier = SubscriptionTier::Free;
            SubscriptionStatus::Active
        });

        let mut trial_ends_at = self.trial_ends_at;
        match (status, trial_ends_at) {
            (SubscriptionStatus::Trialing, None) => {
                log_integrity(
                    user_id,
                    BillingError::DataIntegrity("trialing without trial_ends_at".to_string()),
                );
                status = SubscriptionStatus::Expired;
                tier = SubscriptionTier::Free;
            }
            (SubscriptionStatus::Active | SubscriptionStatus::Expired, Some(_)) => {
                log_integrity(
                    user_id,
                    BillingError::DataIntegrity(format!(
                        "trial_ends_at set while status is {}",
                        status
                    )),
                );
                trial_ends_at = None;
            }
            _ => {}
        }

        if status == SubscriptionStatus::Expired && tier != SubscriptionTier::Free {
            log_integrity(
                user_id,
                BillingError::DataIntegrity(format!("expired subscription on tier {}", tier)),
            );
            tier = SubscriptionTier::Free;
        }

        Subscription {
            user_id,
            tier,
            status,
            trial_ends_at,
            trial_instance: self.trial_instance.max(0),
            version: self.version,
            updated_at: self.updated_at,
        }
    }
}

fn log_integrity(user_id: UserId, error: BillingError) {
    tracing::error!(
        user_id = %user_id,
        error = %error,
        "Subscription record failed validation, falling back to free tier"
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    fn raw(tier: &str, status: &str, trial_ends_at: Option<OffsetDateTime>) -> RawSubscriptionRow {
        RawSubscriptionRow {
            user_id: Uuid::new_v4(),
            tier: tier.to_string(),
            status: status.to_string(),
            trial_ends_at,
            trial_instance: 1,
            version: 4,
            updated_at: datetime!(2025-01-01 00:00 UTC),
        }
    }

    #[test]
    fn test_new_free_subscription() {
        let user_id = UserId::new();
        let sub = Subscription::new_free(user_id, datetime!(2025-01-01 00:00 UTC));
        assert_eq!(sub.tier, SubscriptionTier::Free);
        assert_eq!(sub.status, SubscriptionStatus::Active);
        assert!(sub.trial_ends_at.is_none());
        assert!(!sub.has_used_trial());
    }

    #[test]
    fn test_effective_tier_during_and_after_trial() {
        let mut sub = Subscription::new_free(UserId::new(), datetime!(2025-01-01 00:00 UTC));
        sub.tier = SubscriptionTier::Pro;
        sub.status = SubscriptionStatus::Trialing;
        sub.trial_ends_at = Some(datetime!(2025-01-15 00:00 UTC));

        assert_eq!(
            sub.effective_tier(datetime!(2025-01-10 00:00 UTC)),
            SubscriptionTier::Pro
        );
        assert_eq!(
            sub.effective_tier(datetime!(2025-01-15 00:00 UTC)),
            SubscriptionTier::Free
        );
    }

    #[test]
    fn test_valid_row_passes_through() {
        let end = datetime!(2025-01-15 00:00 UTC);
        let sub = raw("pro", "trialing", Some(end)).into_subscription();
        assert_eq!(sub.tier, SubscriptionTier::Pro);
        assert_eq!(sub.status, SubscriptionStatus::Trialing);
        assert_eq!(sub.trial_ends_at, Some(end));
        assert_eq!(sub.version, 4);
    }

    #[test]
    fn test_unknown_tier_falls_back_to_free() {
        let sub = raw("platinum", "active", None).into_subscription();
        assert_eq!(sub.tier, SubscriptionTier::Free);
        assert_eq!(sub.status, SubscriptionStatus::Active);
    }

    #[test]
    fn test_unknown_status_falls_back_to_free_active() {
        let sub = raw("premium", "past_due", None).into_subscription();
        assert_eq!(sub.tier, SubscriptionTier::Free);
        assert_eq!(sub.status, SubscriptionStatus::Active);
    }

    #[test]
    fn test_trialing_without_end_is_treated_as_not_trialing() {
        let sub = raw("pro", "trialing", None).into_subscription();
        assert!(!sub.is_trialing());
        assert_eq!(sub.tier, SubscriptionTier::Free);
        assert_eq!(
            sub.effective_tier(datetime!(2025-01-02 00:00 UTC)),
            SubscriptionTier::Free
        );
    }

    #[test]
    fn test_stray_trial_end_is_dropped() {
        let sub = raw("premium", "active", Some(datetime!(2025-01-15 00:00 UTC))).into_subscription();
        assert_eq!(sub.tier, SubscriptionTier::Premium);
        assert!(sub.trial_ends_at.is_none());
    }

    #[test]
    fn test_subscription_serializes_rfc3339() {
        let sub = Subscription::new_free(UserId::new(), datetime!(2025-01-01 00:00 UTC));
        let json = serde_json::to_string(&sub).unwrap();
        assert!(json.contains("\"updated_at\":\"2025-01-01T00:00:00Z\""));
        assert!(json.contains("\"trial_ends_at\":null"));
        assert!(json.contains("\"tier\":\"free\""));
    }
}
