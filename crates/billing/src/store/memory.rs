//! In-memory entitlement store for tests and local development

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use coachhub_shared::{Limit, PlayerId, ResourceKind, SubscriptionTier, TeamId, UserId};
use time::OffsetDateTime;
use tokio::sync::Mutex;

use super::{MilestoneStore, ResourceStore, SubscriptionStore, TierChange};
use crate::error::{BillingError, BillingResult};
use crate::lifecycle::MilestoneKey;
use crate::limit_gate::{self, GuardedInsert};
use crate::subscription::Subscription;

#[derive(Debug, Default)]
struct State {
    subscriptions: HashMap<UserId, Subscription>,
    milestones: HashSet<(UserId, i32, MilestoneKey)>,
    audit: Vec<TierChange>,
    teams: HashMap<TeamId, UserId>,
    players: HashMap<PlayerId, TeamId>,
}

/// Every collection sits behind one mutex, so each call is atomic the same
/// way a single Postgres transaction is.
#[derive(Debug, Default)]
pub struct InMemoryStore {
    state: Mutex<State>,
    unavailable: AtomicBool,
    fail_audit: AtomicBool,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every call fail with `StorageUnavailable`
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Make audit writes fail while everything else keeps working
    pub fn set_fail_audit(&self, fail: bool) {
        self.fail_audit.store(fail, Ordering::SeqCst);
    }

    /// Audit entries recorded for a user, oldest first
    pub async fn tier_changes(&self, user_id: UserId) -> Vec<TierChange> {
        let state = self.state.lock().await;
        state
            .audit
            .iter()
            .filter(|c| c.user_id == user_id)
            .cloned()
            .collect()
    }

    /// Overwrite a row without any checks, for seeding test fixtures
    pub async fn put_subscription(&self, subscription: Subscription) {
        let mut state = self.state.lock().await;
        state
            .subscriptions
            .insert(subscription.user_id, subscription);
    }

    fn check_available(&self) -> BillingResult<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(BillingError::StorageUnavailable(
                "in-memory store switched off".to_string(),
            ));
        }
        Ok(())
    }
}

fn count(n: usize) -> u32 {
    u32::try_from(n).unwrap_or(u32::MAX)
}

impl State {
    /// Limit from the owner's row as held under the store mutex
    fn limit_for(
        &self,
        owner_id: UserId,
        kind: ResourceKind,
        now: OffsetDateTime,
    ) -> BillingResult<(SubscriptionTier, Limit)> {
        let subscription = self.subscriptions.get(&owner_id).ok_or_else(|| {
            BillingError::NotFound(format!("Subscription for user {}", owner_id))
        })?;
        Ok(limit_gate::effective_limit(subscription, kind, now))
    }
}

#[async_trait]
impl SubscriptionStore for InMemoryStore {
    async fn get(&self, user_id: UserId) -> BillingResult<Option<Subscription>> {
        self.check_available()?;
        let state = self.state.lock().await;
        Ok(state.subscriptions.get(&user_id).cloned())
    }

    async fn insert_if_absent(&self, subscription: &Subscription) -> BillingResult<Subscription> {
        self.check_available()?;
        let mut state = self.state.lock().await;
        let stored = state
            .subscriptions
            .entry(subscription.user_id)
            .or_insert_with(|| subscription.clone());
        Ok(stored.clone())
    }

    async fn save_if_version(
        &self,
        next: &Subscription,
        expected_version: i64,
    ) -> BillingResult<Option<Subscription>> {
        self.check_available()?;
        let mut state = self.state.lock().await;
        let Some(current) = state.subscriptions.get_mut(&next.user_id) else {
            return Err(BillingError::NotFound(format!(
                "Subscription for user {}",
                next.user_id
            )));
        };
        if current.version != expected_version {
            return Ok(None);
        }

        let mut saved = next.clone();
        saved.version = expected_version + 1;
        *current = saved.clone();
        Ok(Some(saved))
    }

    async fn list_expired_trials(&self, now: OffsetDateTime) -> BillingResult<Vec<UserId>> {
        self.check_available()?;
        let state = self.state.lock().await;
        Ok(state
            .subscriptions
            .values()
            .filter(|s| s.is_trialing() && s.trial_ends_at.is_some_and(|end| end <= now))
            .map(|s| s.user_id)
            .collect())
    }

    async fn record_tier_change(&self, change: &TierChange) -> BillingResult<()> {
        self.check_available()?;
        if self.fail_audit.load(Ordering::SeqCst) {
            return Err(BillingError::StorageUnavailable(
                "audit table unavailable".to_string(),
            ));
        }
        let mut state = self.state.lock().await;
        state.audit.push(change.clone());
        Ok(())
    }
}

#[async_trait]
impl MilestoneStore for InMemoryStore {
    async fn recorded(
        &self,
        user_id: UserId,
        trial_instance: i32,
    ) -> BillingResult<HashSet<MilestoneKey>> {
        self.check_available()?;
        let state = self.state.lock().await;
        Ok(state
            .milestones
            .iter()
            .filter(|(u, instance, _)| *u == user_id && *instance == trial_instance)
            .map(|(_, _, key)| *key)
            .collect())
    }

    async fn record(
        &self,
        user_id: UserId,
        trial_instance: i32,
        key: MilestoneKey,
    ) -> BillingResult<bool> {
        self.check_available()?;
        let mut state = self.state.lock().await;
        Ok(state.milestones.insert((user_id, trial_instance, key)))
    }

    async fn clear_before(&self, user_id: UserId, trial_instance: i32) -> BillingResult<u64> {
        self.check_available()?;
        let mut state = self.state.lock().await;
        let before = state.milestones.len();
        state
            .milestones
            .retain(|(u, instance, _)| !(*u == user_id && *instance < trial_instance));
        Ok((before - state.milestones.len()) as u64)
    }
}

#[async_trait]
impl ResourceStore for InMemoryStore {
    async fn count_teams(&self, owner_id: UserId) -> BillingResult<u32> {
        self.check_available()?;
        let state = self.state.lock().await;
        Ok(count(
            state.teams.values().filter(|o| **o == owner_id).count(),
        ))
    }

    async fn count_players(&self, team_id: TeamId) -> BillingResult<u32> {
        self.check_available()?;
        let state = self.state.lock().await;
        Ok(count(
            state.players.values().filter(|t| **t == team_id).count(),
        ))
    }

    async fn team_owner(&self, team_id: TeamId) -> BillingResult<Option<UserId>> {
        self.check_available()?;
        let state = self.state.lock().await;
        Ok(state.teams.get(&team_id).copied())
    }

    async fn insert_team_within_limit(
        &self,
        owner_id: UserId,
        _name: &str,
        now: OffsetDateTime,
    ) -> BillingResult<GuardedInsert<TeamId>> {
        self.check_available()?;
        let mut state = self.state.lock().await;
        let (tier, limit) = state.limit_for(owner_id, ResourceKind::Teams, now)?;
        let current = count(state.teams.values().filter(|o| **o == owner_id).count());
        if !limit.allows(current) {
            return Ok(GuardedInsert::LimitReached {
                tier,
                count: current,
            });
        }

        let id = TeamId::new();
        state.teams.insert(id, owner_id);
        Ok(GuardedInsert::Inserted {
            id,
            tier,
            count_before: current,
        })
    }

    async fn insert_player_within_limit(
        &self,
        team_id: TeamId,
        _name: &str,
        now: OffsetDateTime,
    ) -> BillingResult<GuardedInsert<PlayerId>> {
        self.check_available()?;
        let mut state = self.state.lock().await;
        let Some(owner_id) = state.teams.get(&team_id).copied() else {
            return Err(BillingError::NotFound(format!("Team {}", team_id)));
        };
        let (tier, limit) = state.limit_for(owner_id, ResourceKind::Players, now)?;
        let current = count(state.players.values().filter(|t| **t == team_id).count());
        if !limit.allows(current) {
            return Ok(GuardedInsert::LimitReached {
                tier,
                count: current,
            });
        }

        let id = PlayerId::new();
        state.players.insert(id, team_id);
        Ok(GuardedInsert::Inserted {
            id,
            tier,
            count_before: current,
        })
    }
}
