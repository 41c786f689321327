//! Entitlement service
//!
//! Façade over the stores: reconciles lazily on every read, runs all
//! subscription mutations through a bounded compare-and-swap loop and
//! records an audit entry for each one that lands.
//!
//! Every public operation has an `_at` twin taking `now`, used by tests and
//! by the worker so a whole sweep shares one clock reading.

use std::sync::Arc;

use coachhub_shared::{
    catalog, ResourceKind, SubscriptionStatus, SubscriptionTier, TeamId, TierLimits, UserId,
};
use serde::Serialize;
use sqlx::PgPool;
use time::OffsetDateTime;

use crate::error::{BillingError, BillingResult};
use crate::lifecycle::{self, LifecycleState, MilestoneKey, TierChangeSource, TrialStatus};
use crate::limit_gate::{self, Creation, Decision, PlayerCreation, Resource, TeamCreation};
use crate::store::{
    EntitlementStore, InMemoryStore, MilestoneStore, PgEntitlementStore, ResourceStore,
    SubscriptionStore, TierChange,
};
use crate::subscription::Subscription;

/// Attempts before a contended write gives up
const MAX_CAS_ATTEMPTS: usize = 3;

/// Resolved permissions of a user at a point in time
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Entitlement {
    pub user_id: UserId,
    /// Tier whose limits apply right now
    pub tier: SubscriptionTier,
    pub status: SubscriptionStatus,
    pub state: LifecycleState,
    pub limits: TierLimits,
    pub trial: Option<TrialStatus>,
    pub trial_used: bool,
}

/// Result of one expiry sweep
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileSummary {
    /// Trials found past their end
    pub scanned: usize,
    /// Trials this sweep moved to expired
    pub expired: usize,
    /// Already handled by a concurrent reconciliation or tier change
    pub unchanged: usize,
    pub failed: usize,
}

/// What the CAS loop ended with
struct Applied {
    subscription: Subscription,
    /// Record the write replaced; `None` when nothing was written
    previous: Option<Subscription>,
}

impl Applied {
    fn changed(&self) -> bool {
        self.previous.is_some()
    }
}

#[derive(Clone)]
pub struct EntitlementService {
    subscriptions: Arc<dyn SubscriptionStore>,
    milestones: Arc<dyn MilestoneStore>,
    resources: Arc<dyn ResourceStore>,
}

impl EntitlementService {
    pub fn new<S>(store: Arc<S>) -> Self
    where
        S: EntitlementStore + 'static,
    {
        Self {
            subscriptions: store.clone(),
            milestones: store.clone(),
            resources: store,
        }
    }

    /// Service backed by Postgres
    pub fn postgres(pool: PgPool) -> Self {
        Self::new(Arc::new(PgEntitlementStore::new(pool)))
    }

    /// Service backed by a fresh in-memory store
    pub fn in_memory() -> Self {
        Self::new(Arc::new(InMemoryStore::new()))
    }

    // =========================================================================
    // Subscription
    // =========================================================================

    /// Signup hook: create the free subscription if it does not exist yet
    pub async fn provision(&self, user_id: UserId) -> BillingResult<Subscription> {
        self.provision_at(user_id, OffsetDateTime::now_utc()).await
    }

    pub async fn provision_at(
        &self,
        user_id: UserId,
        now: OffsetDateTime,
    ) -> BillingResult<Subscription> {
        match self.subscriptions.get(user_id).await? {
            Some(existing) => Ok(existing),
            None => {
                self.subscriptions
                    .insert_if_absent(&Subscription::new_free(user_id, now))
                    .await
            }
        }
    }

    /// Current subscription, with an overdue trial reconciled first
    pub async fn get_subscription(&self, user_id: UserId) -> BillingResult<Subscription> {
        self.get_subscription_at(user_id, OffsetDateTime::now_utc())
            .await
    }

    pub async fn get_subscription_at(
        &self,
        user_id: UserId,
        now: OffsetDateTime,
    ) -> BillingResult<Subscription> {
        Ok(self.reconcile_user(user_id, now).await?.subscription)
    }

    pub async fn entitlement(&self, user_id: UserId) -> BillingResult<Entitlement> {
        self.entitlement_at(user_id, OffsetDateTime::now_utc()).await
    }

    pub async fn entitlement_at(
        &self,
        user_id: UserId,
        now: OffsetDateTime,
    ) -> BillingResult<Entitlement> {
        let sub = self.get_subscription_at(user_id, now).await?;
        let tier = sub.effective_tier(now);

        Ok(Entitlement {
            user_id,
            tier,
            status: sub.status,
            state: LifecycleState::of(&sub),
            limits: catalog::limits_for(tier),
            trial: TrialStatus::of(&sub, now),
            trial_used: sub.has_used_trial(),
        })
    }

    /// Start the user's one trial
    pub async fn start_trial(&self, user_id: UserId) -> BillingResult<Subscription> {
        self.start_trial_at(user_id, OffsetDateTime::now_utc()).await
    }

    pub async fn start_trial_at(
        &self,
        user_id: UserId,
        now: OffsetDateTime,
    ) -> BillingResult<Subscription> {
        let applied = self
            .update_with(user_id, now, |current| {
                lifecycle::start_trial(current, now)
                    .map(|next| Some((next, TierChangeSource::TrialStarted)))
            })
            .await?;
        let sub = applied.subscription;

        tracing::info!(
            user_id = %user_id,
            tier = %sub.tier,
            trial_instance = sub.trial_instance,
            trial_ends_at = ?sub.trial_ends_at,
            "Trial started"
        );

        // Scoping by trial_instance already hides old rows; this is cleanup
        if let Err(e) = self
            .milestones
            .clear_before(user_id, sub.trial_instance)
            .await
        {
            tracing::warn!(user_id = %user_id, error = %e, "Failed to clear old trial milestones");
        }

        Ok(sub)
    }

    /// Explicit tier change with a caller-chosen audit source
    pub async fn set_tier(
        &self,
        user_id: UserId,
        tier: SubscriptionTier,
        source: TierChangeSource,
    ) -> BillingResult<Subscription> {
        self.set_tier_at(user_id, tier, Some(source), OffsetDateTime::now_utc())
            .await
    }

    /// Tier change requested with the user's own credentials: downgrades
    /// only, audited as user_downgrade
    pub async fn change_tier_for_user(
        &self,
        user_id: UserId,
        tier: SubscriptionTier,
    ) -> BillingResult<Subscription> {
        self.change_tier_for_user_at(user_id, tier, OffsetDateTime::now_utc())
            .await
    }

    pub async fn change_tier_for_user_at(
        &self,
        user_id: UserId,
        tier: SubscriptionTier,
        now: OffsetDateTime,
    ) -> BillingResult<Subscription> {
        let applied = self
            .update_with(user_id, now, |current| {
                Ok(lifecycle::user_change_tier(current, tier, now)?
                    .map(|next| (next, TierChangeSource::UserDowngrade)))
            })
            .await
            .inspect_err(|e| {
                if matches!(e, BillingError::UpgradeRequiresPayment(_)) {
                    tracing::warn!(user_id = %user_id, tier = %tier, "Refused self-service upgrade");
                }
            })?;

        if let Some(previous) = &applied.previous {
            tracing::info!(
                user_id = %user_id,
                from_tier = %previous.tier,
                to_tier = %tier,
                "Tier lowered by user"
            );
        }
        Ok(applied.subscription)
    }

    /// Trusted tier change (payment backend, support).
    ///
    /// `source: None` derives user_upgrade/user_downgrade from the tiers
    pub async fn set_tier_at(
        &self,
        user_id: UserId,
        tier: SubscriptionTier,
        source: Option<TierChangeSource>,
        now: OffsetDateTime,
    ) -> BillingResult<Subscription> {
        let applied = self
            .update_with(user_id, now, |current| {
                Ok(lifecycle::change_tier(current, tier, now).map(|next| {
                    let source = source.unwrap_or_else(|| {
                        TierChangeSource::for_user_change(current.tier, tier)
                    });
                    (next, source)
                }))
            })
            .await?;

        if let Some(previous) = &applied.previous {
            tracing::info!(
                user_id = %user_id,
                from_tier = %previous.tier,
                to_tier = %tier,
                "Tier changed"
            );
        }
        Ok(applied.subscription)
    }

    // =========================================================================
    // Limits
    // =========================================================================

    pub async fn can_create(&self, user_id: UserId, resource: Resource) -> BillingResult<Decision> {
        self.can_create_at(user_id, resource, OffsetDateTime::now_utc())
            .await
    }

    pub async fn can_create_at(
        &self,
        user_id: UserId,
        resource: Resource,
        now: OffsetDateTime,
    ) -> BillingResult<Decision> {
        let sub = self.get_subscription_at(user_id, now).await?;
        let count = match resource {
            Resource::Team => self.resources.count_teams(user_id).await?,
            Resource::Player(team_id) => {
                self.ensure_team_owner(user_id, team_id).await?;
                self.resources.count_players(team_id).await?
            }
        };

        let decision = limit_gate::can_create(&sub, resource.kind(), count, now);
        tracing::debug!(
            user_id = %user_id,
            resource = %decision.resource,
            tier = %decision.tier,
            allowed = decision.allowed,
            count = count,
            "Evaluated creation limit"
        );
        Ok(decision)
    }

    /// Create a team if the owner is below their team limit
    pub async fn create_team(&self, user_id: UserId, name: &str) -> BillingResult<TeamCreation> {
        self.create_team_at(user_id, name, OffsetDateTime::now_utc())
            .await
    }

    pub async fn create_team_at(
        &self,
        user_id: UserId,
        name: &str,
        now: OffsetDateTime,
    ) -> BillingResult<TeamCreation> {
        // Provision and reconcile first; the limit itself is read under lock
        self.get_subscription_at(user_id, now).await?;
        let outcome = self
            .resources
            .insert_team_within_limit(user_id, name, now)
            .await?;

        let creation = Creation::from_guarded(ResourceKind::Teams, outcome);
        log_creation(user_id, &creation);
        Ok(creation)
    }

    /// Add a player to one of the user's teams if the team has room
    pub async fn create_player(
        &self,
        user_id: UserId,
        team_id: TeamId,
        name: &str,
    ) -> BillingResult<PlayerCreation> {
        self.create_player_at(user_id, team_id, name, OffsetDateTime::now_utc())
            .await
    }

    pub async fn create_player_at(
        &self,
        user_id: UserId,
        team_id: TeamId,
        name: &str,
        now: OffsetDateTime,
    ) -> BillingResult<PlayerCreation> {
        self.ensure_team_owner(user_id, team_id).await?;
        self.get_subscription_at(user_id, now).await?;
        let outcome = self
            .resources
            .insert_player_within_limit(team_id, name, now)
            .await?;

        let creation = Creation::from_guarded(ResourceKind::Players, outcome);
        log_creation(user_id, &creation);
        Ok(creation)
    }

    // =========================================================================
    // Milestones
    // =========================================================================

    /// Warning due now, without recording it
    pub async fn pending_milestone(&self, user_id: UserId) -> BillingResult<Option<MilestoneKey>> {
        self.pending_milestone_at(user_id, OffsetDateTime::now_utc())
            .await
    }

    pub async fn pending_milestone_at(
        &self,
        user_id: UserId,
        now: OffsetDateTime,
    ) -> BillingResult<Option<MilestoneKey>> {
        let sub = self.get_subscription_at(user_id, now).await?;
        self.pending_for(&sub, now).await
    }

    /// Record that a warning was shown. `false` when it already was.
    pub async fn acknowledge_milestone(
        &self,
        user_id: UserId,
        key: MilestoneKey,
    ) -> BillingResult<bool> {
        self.acknowledge_milestone_at(user_id, key, OffsetDateTime::now_utc())
            .await
    }

    pub async fn acknowledge_milestone_at(
        &self,
        user_id: UserId,
        key: MilestoneKey,
        now: OffsetDateTime,
    ) -> BillingResult<bool> {
        let sub = self.get_subscription_at(user_id, now).await?;
        if !sub.has_used_trial() {
            return Err(BillingError::NotFound(format!(
                "No trial for user {}",
                user_id
            )));
        }
        self.milestones
            .record(user_id, sub.trial_instance, key)
            .await
    }

    /// Decide and record in one step; only the caller whose record lands
    /// gets the key back.
    pub async fn claim_milestone(&self, user_id: UserId) -> BillingResult<Option<MilestoneKey>> {
        self.claim_milestone_at(user_id, OffsetDateTime::now_utc())
            .await
    }

    pub async fn claim_milestone_at(
        &self,
        user_id: UserId,
        now: OffsetDateTime,
    ) -> BillingResult<Option<MilestoneKey>> {
        let sub = self.get_subscription_at(user_id, now).await?;
        let Some(key) = self.pending_for(&sub, now).await? else {
            return Ok(None);
        };

        if self
            .milestones
            .record(user_id, sub.trial_instance, key)
            .await?
        {
            tracing::info!(
                user_id = %user_id,
                milestone = %key,
                trial_instance = sub.trial_instance,
                "Trial milestone claimed"
            );
            Ok(Some(key))
        } else {
            Ok(None)
        }
    }

    // =========================================================================
    // Reconciliation
    // =========================================================================

    /// Expire every trial whose end has passed
    pub async fn reconcile_expired_trials(&self) -> BillingResult<ReconcileSummary> {
        self.reconcile_expired_trials_at(OffsetDateTime::now_utc())
            .await
    }

    pub async fn reconcile_expired_trials_at(
        &self,
        now: OffsetDateTime,
    ) -> BillingResult<ReconcileSummary> {
        let due = self.subscriptions.list_expired_trials(now).await?;
        let mut summary = ReconcileSummary {
            scanned: due.len(),
            ..Default::default()
        };

        for user_id in due {
            match self.reconcile_user(user_id, now).await {
                Ok(applied) if applied.changed() => summary.expired += 1,
                Ok(_) => summary.unchanged += 1,
                Err(e) => {
                    summary.failed += 1;
                    tracing::error!(user_id = %user_id, error = %e, "Failed to expire trial");
                }
            }
        }

        Ok(summary)
    }

    // =========================================================================
    // Internals
    // =========================================================================

    async fn reconcile_user(&self, user_id: UserId, now: OffsetDateTime) -> BillingResult<Applied> {
        let applied = self
            .update_with(user_id, now, |current| {
                Ok(lifecycle::expire_if_due(current, now)
                    .map(|next| (next, TierChangeSource::TrialExpired)))
            })
            .await?;

        if applied.changed() {
            tracing::info!(
                user_id = %user_id,
                trial_instance = applied.subscription.trial_instance,
                "Trial expired, downgraded to free"
            );
        }
        Ok(applied)
    }

    /// Read, transition, compare-and-swap; re-evaluate on a lost race.
    ///
    /// `transition` returns `Ok(None)` when the fresh record needs no change.
    async fn update_with<F>(
        &self,
        user_id: UserId,
        now: OffsetDateTime,
        transition: F,
    ) -> BillingResult<Applied>
    where
        F: Fn(&Subscription) -> BillingResult<Option<(Subscription, TierChangeSource)>>,
    {
        for attempt in 1..=MAX_CAS_ATTEMPTS {
            let current = self.provision_at(user_id, now).await?;
            let Some((next, source)) = transition(&current)? else {
                return Ok(Applied {
                    subscription: current,
                    previous: None,
                });
            };

            match self
                .subscriptions
                .save_if_version(&next, current.version)
                .await?
            {
                Some(saved) => {
                    self.audit(TierChange::between(&current, &saved, source, now))
                        .await;
                    return Ok(Applied {
                        subscription: saved,
                        previous: Some(current),
                    });
                }
                None => {
                    tracing::warn!(
                        user_id = %user_id,
                        attempt = attempt,
                        expected_version = current.version,
                        "Lost subscription write race, retrying"
                    );
                }
            }
        }

        Err(BillingError::ConcurrentModification(format!(
            "Subscription for user {} kept changing, gave up after {} attempts",
            user_id, MAX_CAS_ATTEMPTS
        )))
    }

    async fn audit(&self, change: TierChange) {
        if let Err(e) = self.subscriptions.record_tier_change(&change).await {
            tracing::warn!(
                user_id = %change.user_id,
                source = %change.source,
                error = %e,
                "Failed to record tier change audit"
            );
        }
    }

    async fn pending_for(
        &self,
        sub: &Subscription,
        now: OffsetDateTime,
    ) -> BillingResult<Option<MilestoneKey>> {
        if !sub.has_used_trial() {
            return Ok(None);
        }
        let shown = self
            .milestones
            .recorded(sub.user_id, sub.trial_instance)
            .await?;
        Ok(lifecycle::should_warn(sub, &shown, now))
    }

    /// Foreign teams read as missing so their existence is not revealed
    async fn ensure_team_owner(&self, user_id: UserId, team_id: TeamId) -> BillingResult<()> {
        match self.resources.team_owner(team_id).await? {
            Some(owner) if owner == user_id => Ok(()),
            _ => Err(BillingError::NotFound(format!("Team {}", team_id))),
        }
    }
}

fn log_creation<Id: std::fmt::Debug>(user_id: UserId, creation: &Creation<Id>) {
    let decision = creation.decision();
    match creation {
        Creation::Created { id, .. } => tracing::info!(
            user_id = %user_id,
            resource = %decision.resource,
            id = ?id,
            remaining = %decision.remaining,
            "Resource created"
        ),
        Creation::Denied { .. } => tracing::warn!(
            user_id = %user_id,
            resource = %decision.resource,
            tier = %decision.tier,
            limit = %decision.limit,
            "Creation denied, quota reached"
        ),
    }
}
