//! Postgres entitlement store
//!
//! The subscription row is the source of truth. Writes are guarded by the
//! `version` column; quota-guarded inserts lock the parent row with
//! `SELECT ... FOR UPDATE` and read the owner's tier inside the same
//! transaction before re-counting.

use std::collections::HashSet;

use async_trait::async_trait;
use coachhub_shared::{Limit, PlayerId, ResourceKind, SubscriptionTier, TeamId, UserId};
use sqlx::PgPool;
use time::OffsetDateTime;
use uuid::Uuid;

use super::{count_to_u32, MilestoneStore, ResourceStore, SubscriptionStore, TierChange};
use crate::error::{BillingError, BillingResult};
use crate::lifecycle::MilestoneKey;
use crate::limit_gate::{self, GuardedInsert};
use crate::subscription::{RawSubscriptionRow, Subscription};

const SUBSCRIPTION_COLUMNS: &str =
    "user_id, tier, status, trial_ends_at, trial_instance, version, updated_at";

#[derive(Debug, Clone)]
pub struct PgEntitlementStore {
    pool: PgPool,
}

impl PgEntitlementStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

/// Limit from a subscription row read inside the inserting transaction
fn locked_limit(
    row: Option<RawSubscriptionRow>,
    owner_id: UserId,
    kind: ResourceKind,
    now: OffsetDateTime,
) -> BillingResult<(SubscriptionTier, Limit)> {
    let subscription = row
        .map(RawSubscriptionRow::into_subscription)
        .ok_or_else(|| BillingError::NotFound(format!("Subscription for user {}", owner_id)))?;
    Ok(limit_gate::effective_limit(&subscription, kind, now))
}

#[async_trait]
impl SubscriptionStore for PgEntitlementStore {
    async fn get(&self, user_id: UserId) -> BillingResult<Option<Subscription>> {
        let row: Option<RawSubscriptionRow> = sqlx::query_as(&format!(
            "SELECT {} FROM subscriptions WHERE user_id = $1",
            SUBSCRIPTION_COLUMNS
        ))
        .bind(user_id.0)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(RawSubscriptionRow::into_subscription))
    }

    async fn insert_if_absent(&self, subscription: &Subscription) -> BillingResult<Subscription> {
        let inserted: Option<RawSubscriptionRow> = sqlx::query_as(&format!(
            r#"
            INSERT INTO subscriptions
                (user_id, tier, status, trial_ends_at, trial_instance, version, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (user_id) DO NOTHING
            RETURNING {}
            "#,
            SUBSCRIPTION_COLUMNS
        ))
        .bind(subscription.user_id.0)
        .bind(subscription.tier.as_str())
        .bind(subscription.status.as_str())
        .bind(subscription.trial_ends_at)
        .bind(subscription.trial_instance)
        .bind(subscription.version)
        .bind(subscription.updated_at)
        .fetch_optional(&self.pool)
        .await?;

        if let Some(row) = inserted {
            tracing::info!(user_id = %subscription.user_id, "Subscription provisioned");
            return Ok(row.into_subscription());
        }

        // Lost the insert race or the row already existed
        self.get(subscription.user_id).await?.ok_or_else(|| {
            BillingError::DataIntegrity(format!(
                "Subscription for user {} vanished after conflicting insert",
                subscription.user_id
            ))
        })
    }

    async fn save_if_version(
        &self,
        next: &Subscription,
        expected_version: i64,
    ) -> BillingResult<Option<Subscription>> {
        let row: Option<RawSubscriptionRow> = sqlx::query_as(&format!(
            r#"
            UPDATE subscriptions SET
                tier = $1,
                status = $2,
                trial_ends_at = $3,
                trial_instance = $4,
                version = version + 1,
                updated_at = $5
            WHERE user_id = $6 AND version = $7
            RETURNING {}
            "#,
            SUBSCRIPTION_COLUMNS
        ))
        .bind(next.tier.as_str())
        .bind(next.status.as_str())
        .bind(next.trial_ends_at)
        .bind(next.trial_instance)
        .bind(next.updated_at)
        .bind(next.user_id.0)
        .bind(expected_version)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(RawSubscriptionRow::into_subscription))
    }

    async fn list_expired_trials(&self, now: OffsetDateTime) -> BillingResult<Vec<UserId>> {
        let rows: Vec<(Uuid,)> = sqlx::query_as(
            r#"
            SELECT user_id FROM subscriptions
            WHERE status = 'trialing' AND trial_ends_at <= $1
            ORDER BY trial_ends_at
            "#,
        )
        .bind(now)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(|(id,)| UserId(id)).collect())
    }

    async fn record_tier_change(&self, change: &TierChange) -> BillingResult<()> {
        sqlx::query(
            r#"
            INSERT INTO tier_change_audit
                (id, user_id, from_tier, to_tier, from_status, to_status, source, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(change.id)
        .bind(change.user_id.0)
        .bind(change.from_tier.as_str())
        .bind(change.to_tier.as_str())
        .bind(change.from_status.as_str())
        .bind(change.to_status.as_str())
        .bind(change.source.as_str())
        .bind(change.changed_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

#[async_trait]
impl MilestoneStore for PgEntitlementStore {
    async fn recorded(
        &self,
        user_id: UserId,
        trial_instance: i32,
    ) -> BillingResult<HashSet<MilestoneKey>> {
        let rows: Vec<(String,)> = sqlx::query_as(
            "SELECT milestone FROM trial_milestones WHERE user_id = $1 AND trial_instance = $2",
        )
        .bind(user_id.0)
        .bind(trial_instance)
        .fetch_all(&self.pool)
        .await?;

        let mut keys = HashSet::with_capacity(rows.len());
        for (raw,) in rows {
            match raw.parse::<MilestoneKey>() {
                Ok(key) => {
                    keys.insert(key);
                }
                Err(_) => tracing::error!(
                    user_id = %user_id,
                    milestone = %raw,
                    "Unknown milestone key in trial_milestones, ignoring"
                ),
            }
        }
        Ok(keys)
    }

    async fn record(
        &self,
        user_id: UserId,
        trial_instance: i32,
        key: MilestoneKey,
    ) -> BillingResult<bool> {
        let inserted = sqlx::query(
            r#"
            INSERT INTO trial_milestones (user_id, trial_instance, milestone)
            VALUES ($1, $2, $3)
            ON CONFLICT (user_id, trial_instance, milestone) DO NOTHING
            "#,
        )
        .bind(user_id.0)
        .bind(trial_instance)
        .bind(key.as_str())
        .execute(&self.pool)
        .await?
        .rows_affected();

        Ok(inserted == 1)
    }

    async fn clear_before(&self, user_id: UserId, trial_instance: i32) -> BillingResult<u64> {
        let deleted = sqlx::query(
            "DELETE FROM trial_milestones WHERE user_id = $1 AND trial_instance < $2",
        )
        .bind(user_id.0)
        .bind(trial_instance)
        .execute(&self.pool)
        .await?
        .rows_affected();

        Ok(deleted)
    }
}

#[async_trait]
impl ResourceStore for PgEntitlementStore {
    async fn count_teams(&self, owner_id: UserId) -> BillingResult<u32> {
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM teams WHERE owner_id = $1")
            .bind(owner_id.0)
            .fetch_one(&self.pool)
            .await?;
        Ok(count_to_u32(count))
    }

    async fn count_players(&self, team_id: TeamId) -> BillingResult<u32> {
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM players WHERE team_id = $1")
            .bind(team_id.0)
            .fetch_one(&self.pool)
            .await?;
        Ok(count_to_u32(count))
    }

    async fn team_owner(&self, team_id: TeamId) -> BillingResult<Option<UserId>> {
        let row: Option<(Uuid,)> = sqlx::query_as("SELECT owner_id FROM teams WHERE id = $1")
            .bind(team_id.0)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|(id,)| UserId(id)))
    }

    async fn insert_team_within_limit(
        &self,
        owner_id: UserId,
        name: &str,
        now: OffsetDateTime,
    ) -> BillingResult<GuardedInsert<TeamId>> {
        let mut tx = self.pool.begin().await?;

        // Serialize team creation per owner on the subscription row; a tier
        // change has to wait for this transaction and vice versa
        let row: Option<RawSubscriptionRow> = sqlx::query_as(&format!(
            "SELECT {} FROM subscriptions WHERE user_id = $1 FOR UPDATE",
            SUBSCRIPTION_COLUMNS
        ))
        .bind(owner_id.0)
        .fetch_optional(&mut *tx)
        .await?;
        let (tier, limit) = locked_limit(row, owner_id, ResourceKind::Teams, now)?;

        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM teams WHERE owner_id = $1")
            .bind(owner_id.0)
            .fetch_one(&mut *tx)
            .await?;
        let count = count_to_u32(count);
        if !limit.allows(count) {
            tx.rollback().await?;
            return Ok(GuardedInsert::LimitReached { tier, count });
        }

        let id = TeamId::new();
        sqlx::query("INSERT INTO teams (id, owner_id, name) VALUES ($1, $2, $3)")
            .bind(id.0)
            .bind(owner_id.0)
            .bind(name)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(GuardedInsert::Inserted {
            id,
            tier,
            count_before: count,
        })
    }

    async fn insert_player_within_limit(
        &self,
        team_id: TeamId,
        name: &str,
        now: OffsetDateTime,
    ) -> BillingResult<GuardedInsert<PlayerId>> {
        let mut tx = self.pool.begin().await?;

        // Team row first, then the owner's subscription; nothing takes these
        // two locks in the opposite order
        let team: Option<(Uuid,)> =
            sqlx::query_as("SELECT owner_id FROM teams WHERE id = $1 FOR UPDATE")
                .bind(team_id.0)
                .fetch_optional(&mut *tx)
                .await?;
        let Some((owner,)) = team else {
            return Err(BillingError::NotFound(format!("Team {}", team_id)));
        };
        let owner_id = UserId(owner);

        let row: Option<RawSubscriptionRow> = sqlx::query_as(&format!(
            "SELECT {} FROM subscriptions WHERE user_id = $1 FOR SHARE",
            SUBSCRIPTION_COLUMNS
        ))
        .bind(owner_id.0)
        .fetch_optional(&mut *tx)
        .await?;
        let (tier, limit) = locked_limit(row, owner_id, ResourceKind::Players, now)?;

        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM players WHERE team_id = $1")
            .bind(team_id.0)
            .fetch_one(&mut *tx)
            .await?;
        let count = count_to_u32(count);
        if !limit.allows(count) {
            tx.rollback().await?;
            return Ok(GuardedInsert::LimitReached { tier, count });
        }

        let id = PlayerId::new();
        sqlx::query("INSERT INTO players (id, team_id, name) VALUES ($1, $2, $3)")
            .bind(id.0)
            .bind(team_id.0)
            .bind(name)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(GuardedInsert::Inserted {
            id,
            tier,
            count_before: count,
        })
    }
}
