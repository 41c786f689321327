//! Storage traits for entitlement data
//!
//! The service only talks to these traits. `PgEntitlementStore` is the
//! production backend; `InMemoryStore` backs tests and local development.

use std::collections::HashSet;

use async_trait::async_trait;
use coachhub_shared::{PlayerId, SubscriptionStatus, SubscriptionTier, TeamId, UserId};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::BillingResult;
use crate::lifecycle::{MilestoneKey, TierChangeSource};
use crate::limit_gate::GuardedInsert;
use crate::subscription::Subscription;

mod memory;
mod postgres;
#[cfg(all(test, feature = "postgres-tests"))]
mod postgres_tests;

pub use memory::InMemoryStore;
pub use postgres::PgEntitlementStore;

/// One audited subscription mutation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TierChange {
    pub id: Uuid,
    pub user_id: UserId,
    pub from_tier: SubscriptionTier,
    pub to_tier: SubscriptionTier,
    pub from_status: SubscriptionStatus,
    pub to_status: SubscriptionStatus,
    pub source: TierChangeSource,
    pub changed_at: OffsetDateTime,
}

impl TierChange {
    pub fn between(
        before: &Subscription,
        after: &Subscription,
        source: TierChangeSource,
        changed_at: OffsetDateTime,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            user_id: after.user_id,
            from_tier: before.tier,
            to_tier: after.tier,
            from_status: before.status,
            to_status: after.status,
            source,
            changed_at,
        }
    }
}

/// Subscription rows
#[async_trait]
pub trait SubscriptionStore: Send + Sync {
    async fn get(&self, user_id: UserId) -> BillingResult<Option<Subscription>>;

    /// Insert `subscription` unless a row for the user exists. Returns the row
    /// that is stored afterwards, whichever it is.
    async fn insert_if_absent(&self, subscription: &Subscription) -> BillingResult<Subscription>;

    /// Compare-and-swap write.
    ///
    /// Persists `next` only if the stored version still equals
    /// `expected_version`, bumping the version. `Ok(None)` means another
    /// writer got there first.
    async fn save_if_version(
        &self,
        next: &Subscription,
        expected_version: i64,
    ) -> BillingResult<Option<Subscription>>;

    /// Users whose trial ended at or before `now` but are still trialing
    async fn list_expired_trials(&self, now: OffsetDateTime) -> BillingResult<Vec<UserId>>;

    async fn record_tier_change(&self, change: &TierChange) -> BillingResult<()>;
}

/// Milestone warnings already shown, keyed by trial instance
#[async_trait]
pub trait MilestoneStore: Send + Sync {
    async fn recorded(
        &self,
        user_id: UserId,
        trial_instance: i32,
    ) -> BillingResult<HashSet<MilestoneKey>>;

    /// Insert-if-absent. `true` only for the caller whose insert landed.
    async fn record(
        &self,
        user_id: UserId,
        trial_instance: i32,
        key: MilestoneKey,
    ) -> BillingResult<bool>;

    /// Drop rows of earlier trial instances
    async fn clear_before(&self, user_id: UserId, trial_instance: i32) -> BillingResult<u64>;
}

/// Teams and players, as far as quotas are concerned
#[async_trait]
pub trait ResourceStore: Send + Sync {
    async fn count_teams(&self, owner_id: UserId) -> BillingResult<u32>;

    async fn count_players(&self, team_id: TeamId) -> BillingResult<u32>;

    async fn team_owner(&self, team_id: TeamId) -> BillingResult<Option<UserId>>;

    /// Lock the owner's subscription, resolve the team limit from it at
    /// `now`, re-count the owner's teams and insert only below that limit
    async fn insert_team_within_limit(
        &self,
        owner_id: UserId,
        name: &str,
        now: OffsetDateTime,
    ) -> BillingResult<GuardedInsert<TeamId>>;

    /// Lock the team and its owner's subscription, resolve the per-team
    /// player limit at `now`, re-count and insert only below it
    async fn insert_player_within_limit(
        &self,
        team_id: TeamId,
        name: &str,
        now: OffsetDateTime,
    ) -> BillingResult<GuardedInsert<PlayerId>>;
}

/// Convenience bound for a backend that implements every store
pub trait EntitlementStore: SubscriptionStore + MilestoneStore + ResourceStore {}

impl<T> EntitlementStore for T where T: SubscriptionStore + MilestoneStore + ResourceStore {}

pub(crate) fn count_to_u32(count: i64) -> u32 {
    u32::try_from(count.max(0)).unwrap_or(u32::MAX)
}
