//! Postgres store tests
//!
//! Each test gets a fresh database with the shared migrations applied.
//! Run with `--features postgres-tests` and `DATABASE_URL` set.
//!
//! Tests cover:
//! - Insert-if-absent and the versioned compare-and-swap write
//! - Write-once milestone rows
//! - Row-locked quota inserts under concurrency
//! - Tier read under the same lock as the count

#[cfg(test)]
mod tests {
    use coachhub_shared::{SubscriptionStatus, SubscriptionTier, UserId};
    use sqlx::PgPool;
    use time::OffsetDateTime;

    use crate::lifecycle::MilestoneKey;
    use crate::limit_gate::GuardedInsert;
    use crate::store::{MilestoneStore, PgEntitlementStore, ResourceStore, SubscriptionStore};
    use crate::subscription::Subscription;

    async fn paid_owner(store: &PgEntitlementStore, tier: SubscriptionTier) -> Subscription {
        let mut sub = Subscription::new_free(UserId::new(), OffsetDateTime::now_utc());
        sub.tier = tier;
        sub.status = SubscriptionStatus::Active;
        store.insert_if_absent(&sub).await.unwrap()
    }

    #[sqlx::test(migrations = "../shared/migrations")]
    async fn test_insert_if_absent_returns_existing_row(pool: PgPool) {
        let store = PgEntitlementStore::new(pool);
        let existing = paid_owner(&store, SubscriptionTier::Pro).await;

        let again = Subscription::new_free(existing.user_id, OffsetDateTime::now_utc());
        let stored = store.insert_if_absent(&again).await.unwrap();
        assert_eq!(stored.tier, SubscriptionTier::Pro);
    }

    #[sqlx::test(migrations = "../shared/migrations")]
    async fn test_stale_version_write_is_rejected(pool: PgPool) {
        let store = PgEntitlementStore::new(pool);
        let current = paid_owner(&store, SubscriptionTier::Pro).await;

        let next = Subscription {
            tier: SubscriptionTier::Premium,
            ..current.clone()
        };
        let saved = store
            .save_if_version(&next, current.version)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(saved.version, current.version + 1);

        let lost = Subscription {
            tier: SubscriptionTier::Free,
            ..current.clone()
        };
        assert!(store
            .save_if_version(&lost, current.version)
            .await
            .unwrap()
            .is_none());
        let stored = store.get(current.user_id).await.unwrap().unwrap();
        assert_eq!(stored.tier, SubscriptionTier::Premium);
    }

    #[sqlx::test(migrations = "../shared/migrations")]
    async fn test_milestone_insert_lands_once(pool: PgPool) {
        let store = PgEntitlementStore::new(pool);
        let user = paid_owner(&store, SubscriptionTier::Free).await.user_id;

        let (first, second) = tokio::join!(
            store.record(user, 1, MilestoneKey::ThreeDays),
            store.record(user, 1, MilestoneKey::ThreeDays),
        );
        assert!(first.unwrap() ^ second.unwrap());
        assert_eq!(store.recorded(user, 1).await.unwrap().len(), 1);
    }

    #[sqlx::test(migrations = "../shared/migrations")]
    async fn test_two_team_inserts_at_limit_minus_one(pool: PgPool) {
        let store = PgEntitlementStore::new(pool);
        let owner = paid_owner(&store, SubscriptionTier::Pro).await.user_id;
        let now = OffsetDateTime::now_utc();
        for name in ["A", "B"] {
            let outcome = store.insert_team_within_limit(owner, name, now).await.unwrap();
            assert!(matches!(outcome, GuardedInsert::Inserted { .. }));
        }

        let (c, d) = tokio::join!(
            store.insert_team_within_limit(owner, "C", now),
            store.insert_team_within_limit(owner, "D", now),
        );
        let inserted = [c.unwrap(), d.unwrap()]
            .iter()
            .filter(|o| matches!(o, GuardedInsert::Inserted { .. }))
            .count();
        assert_eq!(inserted, 1);
        assert_eq!(store.count_teams(owner).await.unwrap(), 3);
    }

    #[sqlx::test(migrations = "../shared/migrations")]
    async fn test_guarded_insert_reads_committed_downgrade(pool: PgPool) {
        let store = PgEntitlementStore::new(pool);
        let current = paid_owner(&store, SubscriptionTier::Pro).await;
        let now = OffsetDateTime::now_utc();
        for name in ["A", "B"] {
            store
                .insert_team_within_limit(current.user_id, name, now)
                .await
                .unwrap();
        }

        let downgraded = Subscription {
            tier: SubscriptionTier::Free,
            ..current.clone()
        };
        store
            .save_if_version(&downgraded, current.version)
            .await
            .unwrap()
            .unwrap();

        let outcome = store
            .insert_team_within_limit(current.user_id, "C", now)
            .await
            .unwrap();
        assert_eq!(
            outcome,
            GuardedInsert::LimitReached {
                tier: SubscriptionTier::Free,
                count: 2
            }
        );
    }

    #[sqlx::test(migrations = "../shared/migrations")]
    async fn test_player_limit_follows_owner_tier(pool: PgPool) {
        let store = PgEntitlementStore::new(pool);
        let owner = paid_owner(&store, SubscriptionTier::Free).await.user_id;
        let now = OffsetDateTime::now_utc();
        let team = match store.insert_team_within_limit(owner, "U7", now).await.unwrap() {
            GuardedInsert::Inserted { id, .. } => id,
            GuardedInsert::LimitReached { .. } => panic!("first team must be allowed"),
        };

        for i in 0..15 {
            let outcome = store
                .insert_player_within_limit(team, &format!("Player {}", i), now)
                .await
                .unwrap();
            assert!(matches!(outcome, GuardedInsert::Inserted { .. }));
        }
        let outcome = store
            .insert_player_within_limit(team, "Extra", now)
            .await
            .unwrap();
        assert_eq!(
            outcome,
            GuardedInsert::LimitReached {
                tier: SubscriptionTier::Free,
                count: 15
            }
        );
    }
}
