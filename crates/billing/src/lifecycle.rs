//! Trial lifecycle
//!
//! Pure state transitions of a subscription and the milestone warning
//! decision. Nothing here touches storage: the service reads, asks for the
//! next state, and writes it back with a compare-and-swap.
//!
//! ```text
//! NoTrial --start_trial--> Trialing --expire_if_due--> Expired
//!    |                        |                          |
//!    +------ change_tier -----+------- change_tier ------+--> Paid / Free
//! ```

use std::collections::HashSet;

use coachhub_shared::{SubscriptionStatus, SubscriptionTier, TRIAL_LENGTH_DAYS, TRIAL_TIER};
use serde::{Deserialize, Serialize};
use time::{Duration, OffsetDateTime};

use crate::error::{BillingError, BillingResult};
use crate::subscription::Subscription;
use crate::trial_clock::{self, TrialPhase};

/// Derived lifecycle state of a subscription
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleState {
    /// On the free tier and not trialing
    NoTrial,
    Trialing,
    /// Trial ran out and was reconciled to free
    Expired,
    /// On a paid tier
    Paid,
}

impl LifecycleState {
    pub fn of(subscription: &Subscription) -> Self {
        match subscription.status {
            SubscriptionStatus::Trialing => LifecycleState::Trialing,
            SubscriptionStatus::Expired => LifecycleState::Expired,
            SubscriptionStatus::Active if subscription.tier.is_paid() => LifecycleState::Paid,
            SubscriptionStatus::Active => LifecycleState::NoTrial,
        }
    }
}

impl std::fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LifecycleState::NoTrial => write!(f, "no_trial"),
            LifecycleState::Trialing => write!(f, "trialing"),
            LifecycleState::Expired => write!(f, "expired"),
            LifecycleState::Paid => write!(f, "paid"),
        }
    }
}

/// Source of a subscription mutation, recorded in the audit trail
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TierChangeSource {
    /// User started their trial
    TrialStarted,
    /// Reconciliation noticed the trial ended
    TrialExpired,
    /// User upgraded after paying
    UserUpgrade,
    /// User moved to a cheaper tier
    UserDowngrade,
    /// Support staff changed the tier
    Admin,
    /// Any other automated change
    System,
}

impl TierChangeSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            TierChangeSource::TrialStarted => "trial_started",
            TierChangeSource::TrialExpired => "trial_expired",
            TierChangeSource::UserUpgrade => "user_upgrade",
            TierChangeSource::UserDowngrade => "user_downgrade",
            TierChangeSource::Admin => "admin",
            TierChangeSource::System => "system",
        }
    }

    /// Pick user_upgrade/user_downgrade from the tier ladder
    pub fn for_user_change(from: SubscriptionTier, to: SubscriptionTier) -> Self {
        if to.rank() < from.rank() {
            TierChangeSource::UserDowngrade
        } else {
            TierChangeSource::UserUpgrade
        }
    }
}

impl std::fmt::Display for TierChangeSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Start the one trial a user gets.
///
/// The "already used" marker is checked before the tier, so a user who
/// downgraded after a trial still cannot start another.
pub fn start_trial(current: &Subscription, now: OffsetDateTime) -> BillingResult<Subscription> {
    if current.has_used_trial() || current.is_trialing() {
        return Err(BillingError::TrialAlreadyUsed);
    }
    if current.tier != SubscriptionTier::Free {
        return Err(BillingError::TrialNotEligible(format!(
            "already on the {} tier",
            current.tier
        )));
    }

    Ok(Subscription {
        tier: TRIAL_TIER,
        status: SubscriptionStatus::Trialing,
        trial_ends_at: Some(now + Duration::days(TRIAL_LENGTH_DAYS)),
        trial_instance: current.trial_instance + 1,
        updated_at: now,
        ..current.clone()
    })
}

/// Expire a trial whose end has passed. `None` when there is nothing to do,
/// which makes repeated calls no-ops.
pub fn expire_if_due(current: &Subscription, now: OffsetDateTime) -> Option<Subscription> {
    if !current.is_trialing() {
        return None;
    }
    match current.trial_ends_at {
        Some(ends_at) if now < ends_at => None,
        _ => Some(Subscription {
            tier: SubscriptionTier::Free,
            status: SubscriptionStatus::Expired,
            trial_ends_at: None,
            updated_at: now,
            ..current.clone()
        }),
    }
}

/// Explicit tier change. Clears any running trial; keeps the trial marker.
pub fn change_tier(
    current: &Subscription,
    tier: SubscriptionTier,
    now: OffsetDateTime,
) -> Option<Subscription> {
    if current.tier == tier && current.status == SubscriptionStatus::Active {
        return None;
    }
    Some(Subscription {
        tier,
        status: SubscriptionStatus::Active,
        trial_ends_at: None,
        updated_at: now,
        ..current.clone()
    })
}

/// Tier change requested with a user's own credentials.
///
/// Only moves down from the tier the user is paying for. A running trial
/// does not count as paid, so converting it (or anything above free) needs
/// the payment backend to call [`change_tier`] through the trusted path.
pub fn user_change_tier(
    current: &Subscription,
    tier: SubscriptionTier,
    now: OffsetDateTime,
) -> BillingResult<Option<Subscription>> {
    let paid_tier = match current.status {
        SubscriptionStatus::Active => current.tier,
        SubscriptionStatus::Trialing | SubscriptionStatus::Expired => SubscriptionTier::Free,
    };
    if tier.rank() > paid_tier.rank() {
        return Err(BillingError::UpgradeRequiresPayment(format!(
            "{} to {}",
            paid_tier, tier
        )));
    }
    Ok(change_tier(current, tier, now))
}

/// One-time trial warnings
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MilestoneKey {
    #[serde(rename = "7days")]
    SevenDays,
    #[serde(rename = "3days")]
    ThreeDays,
    #[serde(rename = "expired")]
    Expired,
}

impl MilestoneKey {
    pub const ALL: [MilestoneKey; 3] = [
        MilestoneKey::SevenDays,
        MilestoneKey::ThreeDays,
        MilestoneKey::Expired,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            MilestoneKey::SevenDays => "7days",
            MilestoneKey::ThreeDays => "3days",
            MilestoneKey::Expired => "expired",
        }
    }

    /// Exact-match trigger: only 7, 3 and 0 days left are milestones
    pub fn for_days_remaining(days: u32) -> Option<Self> {
        match days {
            7 => Some(MilestoneKey::SevenDays),
            3 => Some(MilestoneKey::ThreeDays),
            0 => Some(MilestoneKey::Expired),
            _ => None,
        }
    }
}

impl std::fmt::Display for MilestoneKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for MilestoneKey {
    type Err = BillingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "7days" => Ok(MilestoneKey::SevenDays),
            "3days" => Ok(MilestoneKey::ThreeDays),
            "expired" => Ok(MilestoneKey::Expired),
            other => Err(BillingError::NotFound(format!("Unknown milestone '{}'", other))),
        }
    }
}

/// Days left for milestone purposes.
///
/// A trial that ended through reconciliation counts as 0 so the "expired"
/// warning can still be shown once after the downgrade.
fn milestone_days(subscription: &Subscription, now: OffsetDateTime) -> Option<u32> {
    match (subscription.status, subscription.trial_ends_at) {
        (SubscriptionStatus::Trialing, Some(ends_at)) => {
            Some(trial_clock::days_remaining(ends_at, now))
        }
        (SubscriptionStatus::Expired, _) if subscription.has_used_trial() => Some(0),
        _ => None,
    }
}

/// Which warning is due now, if any.
///
/// `already_shown` is the milestone log of the subscription's current trial
/// instance. The caller must record the returned key before (or together
/// with) showing it.
pub fn should_warn(
    subscription: &Subscription,
    already_shown: &HashSet<MilestoneKey>,
    now: OffsetDateTime,
) -> Option<MilestoneKey> {
    let days = milestone_days(subscription, now)?;
    let key = MilestoneKey::for_days_remaining(days)?;
    if already_shown.contains(&key) {
        None
    } else {
        Some(key)
    }
}

/// Snapshot of a running trial for display
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TrialStatus {
    #[serde(with = "time::serde::rfc3339")]
    pub ends_at: OffsetDateTime,
    pub days_remaining: u32,
    pub phase: TrialPhase,
}

impl TrialStatus {
    pub fn of(subscription: &Subscription, now: OffsetDateTime) -> Option<Self> {
        if !subscription.is_trialing() {
            return None;
        }
        let ends_at = subscription.trial_ends_at?;
        let days_remaining = trial_clock::days_remaining(ends_at, now);
        Some(Self {
            ends_at,
            days_remaining,
            phase: trial_clock::phase_for(days_remaining),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use coachhub_shared::UserId;
    use time::macros::datetime;

    fn fresh() -> Subscription {
        Subscription::new_free(UserId::new(), datetime!(2024-12-20 00:00 UTC))
    }

    fn trialing_from(start: OffsetDateTime) -> Subscription {
        start_trial(&fresh(), start).unwrap()
    }

    #[test]
    fn test_user_cannot_raise_own_tier() {
        let now = datetime!(2025-01-01 00:00 UTC);
        let err = user_change_tier(&fresh(), SubscriptionTier::Enterprise, now).unwrap_err();
        assert!(matches!(err, BillingError::UpgradeRequiresPayment(_)));

        // Trial tier is not paid for yet
        let trial = trialing_from(now);
        let err = user_change_tier(&trial, SubscriptionTier::Pro, now).unwrap_err();
        assert!(matches!(err, BillingError::UpgradeRequiresPayment(_)));
    }

    #[test]
    fn test_user_can_downgrade_or_leave_trial() {
        let now = datetime!(2025-01-01 00:00 UTC);
        let paid = change_tier(&fresh(), SubscriptionTier::Premium, now).unwrap();
        let down = user_change_tier(&paid, SubscriptionTier::Pro, now)
            .unwrap()
            .unwrap();
        assert_eq!(down.tier, SubscriptionTier::Pro);
        assert_eq!(user_change_tier(&paid, SubscriptionTier::Premium, now).unwrap(), None);

        let left = user_change_tier(&trialing_from(now), SubscriptionTier::Free, now)
            .unwrap()
            .unwrap();
        assert_eq!(left.tier, SubscriptionTier::Free);
        assert_eq!(left.status, SubscriptionStatus::Active);
        assert!(left.has_used_trial());
    }

    #[test]
    fn test_start_trial_on_fresh_free_user() {
        let start = datetime!(2025-01-01 00:00 UTC);
        let sub = start_trial(&fresh(), start).unwrap();
        assert_eq!(sub.status, SubscriptionStatus::Trialing);
        assert_eq!(sub.tier, SubscriptionTier::Pro);
        assert_eq!(sub.trial_ends_at, Some(datetime!(2025-01-15 00:00 UTC)));
        assert_eq!(sub.trial_instance, 1);
        assert_eq!(LifecycleState::of(&sub), LifecycleState::Trialing);
    }

    #[test]
    fn test_second_start_is_rejected_while_trialing() {
        let sub = trialing_from(datetime!(2025-01-01 00:00 UTC));
        let err = start_trial(&sub, datetime!(2025-01-02 00:00 UTC)).unwrap_err();
        assert!(matches!(err, BillingError::TrialAlreadyUsed));
    }

    #[test]
    fn test_downgrade_then_retrial_is_rejected() {
        let sub = trialing_from(datetime!(2025-01-01 00:00 UTC));
        let downgraded =
            change_tier(&sub, SubscriptionTier::Free, datetime!(2025-01-03 00:00 UTC)).unwrap();
        assert_eq!(LifecycleState::of(&downgraded), LifecycleState::NoTrial);

        let err = start_trial(&downgraded, datetime!(2025-01-04 00:00 UTC)).unwrap_err();
        assert!(matches!(err, BillingError::TrialAlreadyUsed));
    }

    #[test]
    fn test_paid_user_is_not_eligible() {
        let paid = change_tier(
            &fresh(),
            SubscriptionTier::Premium,
            datetime!(2025-01-01 00:00 UTC),
        )
        .unwrap();
        let err = start_trial(&paid, datetime!(2025-01-02 00:00 UTC)).unwrap_err();
        assert!(matches!(err, BillingError::TrialNotEligible(_)));
    }

    #[test]
    fn test_expire_if_due_boundaries() {
        let sub = trialing_from(datetime!(2025-01-01 00:00 UTC));
        assert!(expire_if_due(&sub, datetime!(2025-01-14 23:59 UTC)).is_none());

        let expired = expire_if_due(&sub, datetime!(2025-01-15 00:00 UTC)).unwrap();
        assert_eq!(expired.status, SubscriptionStatus::Expired);
        assert_eq!(expired.tier, SubscriptionTier::Free);
        assert!(expired.trial_ends_at.is_none());
        assert_eq!(expired.trial_instance, 1);

        // Already expired: no-op
        assert!(expire_if_due(&expired, datetime!(2025-01-20 00:00 UTC)).is_none());
    }

    #[test]
    fn test_change_tier_clears_trial_and_is_noop_when_unchanged() {
        let sub = trialing_from(datetime!(2025-01-01 00:00 UTC));
        let paid = change_tier(&sub, SubscriptionTier::Pro, datetime!(2025-01-05 00:00 UTC)).unwrap();
        assert_eq!(paid.status, SubscriptionStatus::Active);
        assert!(paid.trial_ends_at.is_none());
        assert_eq!(LifecycleState::of(&paid), LifecycleState::Paid);

        assert!(change_tier(&paid, SubscriptionTier::Pro, datetime!(2025-01-06 00:00 UTC)).is_none());
    }

    #[test]
    fn test_milestone_key_parsing() {
        for key in MilestoneKey::ALL {
            assert_eq!(key.as_str().parse::<MilestoneKey>().unwrap(), key);
        }
        assert!("5days".parse::<MilestoneKey>().is_err());
        assert_eq!(
            serde_json::to_string(&MilestoneKey::SevenDays).unwrap(),
            "\"7days\""
        );
    }

    #[test]
    fn test_only_exact_days_are_milestones() {
        assert_eq!(MilestoneKey::for_days_remaining(7), Some(MilestoneKey::SevenDays));
        assert_eq!(MilestoneKey::for_days_remaining(3), Some(MilestoneKey::ThreeDays));
        assert_eq!(MilestoneKey::for_days_remaining(0), Some(MilestoneKey::Expired));
        for days in [14, 8, 6, 5, 4, 2, 1] {
            assert_eq!(MilestoneKey::for_days_remaining(days), None);
        }
    }

    #[test]
    fn test_should_warn_on_day_seven_once() {
        let sub = trialing_from(datetime!(2025-01-01 00:00 UTC));
        let now = datetime!(2025-01-08 00:00 UTC);
        let mut log = HashSet::new();

        assert_eq!(should_warn(&sub, &log, now), Some(MilestoneKey::SevenDays));
        log.insert(MilestoneKey::SevenDays);
        assert_eq!(should_warn(&sub, &log, now), None);
    }

    #[test]
    fn test_no_warning_on_day_five() {
        let sub = trialing_from(datetime!(2025-01-01 00:00 UTC));
        let log = HashSet::new();
        assert_eq!(should_warn(&sub, &log, datetime!(2025-01-10 00:00 UTC)), None);
    }

    #[test]
    fn test_expired_trial_warns_once() {
        let sub = trialing_from(datetime!(2025-01-01 00:00 UTC));
        let expired = expire_if_due(&sub, datetime!(2025-01-16 00:00 UTC)).unwrap();
        let mut log = HashSet::new();

        assert_eq!(
            should_warn(&expired, &log, datetime!(2025-01-16 00:00 UTC)),
            Some(MilestoneKey::Expired)
        );
        log.insert(MilestoneKey::Expired);
        assert_eq!(should_warn(&expired, &log, datetime!(2025-02-01 00:00 UTC)), None);
    }

    #[test]
    fn test_no_warning_without_trial() {
        let log = HashSet::new();
        assert_eq!(should_warn(&fresh(), &log, datetime!(2025-01-01 00:00 UTC)), None);
    }

    #[test]
    fn test_trial_status_view() {
        let sub = trialing_from(datetime!(2025-01-01 00:00 UTC));
        let status = TrialStatus::of(&sub, datetime!(2025-01-12 12:00 UTC)).unwrap();
        assert_eq!(status.days_remaining, 3);
        assert_eq!(status.phase, TrialPhase::Urgent);
        assert!(TrialStatus::of(&fresh(), datetime!(2025-01-12 12:00 UTC)).is_none());
    }

    #[test]
    fn test_source_for_user_change() {
        assert_eq!(
            TierChangeSource::for_user_change(SubscriptionTier::Free, SubscriptionTier::Pro),
            TierChangeSource::UserUpgrade
        );
        assert_eq!(
            TierChangeSource::for_user_change(SubscriptionTier::Premium, SubscriptionTier::Pro),
            TierChangeSource::UserDowngrade
        );
        assert_eq!(TierChangeSource::TrialExpired.to_string(), "trial_expired");
    }
}
