//! Entitlement invariants
//!
//! Runnable consistency checks over the subscription and resource tables.
//! Checks only read, never write. The worker runs them on a schedule and
//! logs what they find.

use coachhub_shared::{catalog, Limit, ResourceKind, SubscriptionTier};
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use time::{Duration, OffsetDateTime};
use uuid::Uuid;

use crate::error::BillingResult;
use crate::subscription::{RawSubscriptionRow, Subscription};

/// Grace period before a trialing row past its end counts as stale
const STALE_TRIAL_GRACE: Duration = Duration::days(1);

/// Result of running a single invariant check
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvariantViolation {
    /// Which invariant was violated
    pub invariant: String,
    /// Users affected
    pub user_ids: Vec<Uuid>,
    pub description: String,
    /// Additional context for debugging
    pub context: serde_json::Value,
    pub severity: ViolationSeverity,
}

/// Severity of an invariant violation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ViolationSeverity {
    /// Users may hold access they should not have
    Critical,
    /// Data inconsistency that needs attention
    High,
    /// Lagging state that reconciliation should fix on its own
    Medium,
    Low,
}

impl std::fmt::Display for ViolationSeverity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ViolationSeverity::Critical => write!(f, "CRITICAL"),
            ViolationSeverity::High => write!(f, "HIGH"),
            ViolationSeverity::Medium => write!(f, "MEDIUM"),
            ViolationSeverity::Low => write!(f, "LOW"),
        }
    }
}

/// Summary of all invariant checks
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvariantCheckSummary {
    #[serde(with = "time::serde::rfc3339")]
    pub checked_at: OffsetDateTime,
    pub checks_run: usize,
    pub checks_passed: usize,
    pub checks_failed: usize,
    pub violations: Vec<InvariantViolation>,
    pub healthy: bool,
}

impl InvariantCheckSummary {
    fn from_violations(checked_at: OffsetDateTime, violations: Vec<InvariantViolation>) -> Self {
        let checks_run = InvariantChecker::available_checks().len();
        let checks_failed = violations
            .iter()
            .map(|v| &v.invariant)
            .collect::<std::collections::HashSet<_>>()
            .len();

        Self {
            checked_at,
            checks_run,
            checks_passed: checks_run.saturating_sub(checks_failed),
            checks_failed,
            healthy: violations.is_empty(),
            violations,
        }
    }
}

#[derive(Debug, sqlx::FromRow)]
struct TrialWindowRow {
    user_id: Uuid,
    status: String,
    trial_ends_at: Option<OffsetDateTime>,
}

#[derive(Debug, sqlx::FromRow)]
struct StaleTrialRow {
    user_id: Uuid,
    trial_ends_at: OffsetDateTime,
}

#[derive(Debug, sqlx::FromRow)]
struct TeamUsageRow {
    #[sqlx(flatten)]
    subscription: RawSubscriptionRow,
    team_count: i64,
    newest_created_at: OffsetDateTime,
}

#[derive(Debug, sqlx::FromRow)]
struct PlayerUsageRow {
    #[sqlx(flatten)]
    subscription: RawSubscriptionRow,
    team_id: Uuid,
    player_count: i64,
    newest_created_at: OffsetDateTime,
}

/// Quota exceeded by `count`, if any. Sitting exactly at the limit is fine.
fn exceeded_limit(tier: SubscriptionTier, kind: ResourceKind, count: i64) -> Option<u32> {
    match catalog::limits_for(tier).limit_for(kind) {
        Limit::Limited(max) if count > i64::from(max) => Some(max),
        _ => None,
    }
}

/// When the tier that applies at `now` took effect. A lapsed trial that was
/// not reconciled yet has been free since its end.
fn tier_in_effect_since(subscription: &Subscription, now: OffsetDateTime) -> OffsetDateTime {
    match subscription.trial_ends_at {
        Some(ends_at) if subscription.is_trialing() && ends_at <= now => ends_at,
        _ => subscription.updated_at,
    }
}

/// Over quota with at least one row created after the current tier took
/// effect. Rows kept from a larger tier (an expired trial, a downgrade) are
/// not a breach.
fn quota_breach(
    subscription: &Subscription,
    kind: ResourceKind,
    count: i64,
    newest_created_at: OffsetDateTime,
    now: OffsetDateTime,
) -> Option<u32> {
    let max = exceeded_limit(subscription.effective_tier(now), kind, count)?;
    (newest_created_at > tier_in_effect_since(subscription, now)).then_some(max)
}

/// Service for running entitlement invariant checks
pub struct InvariantChecker {
    pool: PgPool,
}

impl InvariantChecker {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Run all invariant checks and return summary
    pub async fn run_all_checks(&self) -> BillingResult<InvariantCheckSummary> {
        let now = OffsetDateTime::now_utc();
        let mut violations = Vec::new();

        violations.extend(self.check_trial_window_consistent().await?);
        violations.extend(self.check_stale_trials(now).await?);
        violations.extend(self.check_team_quota_respected(now).await?);
        violations.extend(self.check_player_quota_respected(now).await?);

        Ok(InvariantCheckSummary::from_violations(now, violations))
    }

    /// `trial_ends_at` is set exactly when the status is trialing
    ///
    /// The table constraint enforces this; a hit here means the constraint
    /// was dropped or bypassed.
    async fn check_trial_window_consistent(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<TrialWindowRow> = sqlx::query_as(
            r#"
            SELECT user_id, status, trial_ends_at
            FROM subscriptions
            WHERE (status = 'trialing') <> (trial_ends_at IS NOT NULL)
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "trial_window_consistent".to_string(),
                user_ids: vec![row.user_id],
                description: format!(
                    "Subscription has status '{}' but trial_ends_at is {}",
                    row.status,
                    if row.trial_ends_at.is_some() { "set" } else { "missing" }
                ),
                context: serde_json::json!({
                    "status": row.status,
                    "trial_ends_at": row.trial_ends_at.map(|t| t.unix_timestamp()),
                }),
                severity: ViolationSeverity::Critical,
            })
            .collect())
    }

    /// Trials well past their end that no reconciliation has expired
    async fn check_stale_trials(&self, now: OffsetDateTime) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<StaleTrialRow> = sqlx::query_as(
            r#"
            SELECT user_id, trial_ends_at
            FROM subscriptions
            WHERE status = 'trialing' AND trial_ends_at < $1
            "#,
        )
        .bind(now - STALE_TRIAL_GRACE)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| {
                let overdue = now - row.trial_ends_at;
                InvariantViolation {
                    invariant: "stale_trials".to_string(),
                    user_ids: vec![row.user_id],
                    description: format!(
                        "Trial ended {} hours ago but is still trialing",
                        overdue.whole_hours()
                    ),
                    context: serde_json::json!({
                        "trial_ends_at": row.trial_ends_at.unix_timestamp(),
                        "overdue_hours": overdue.whole_hours(),
                    }),
                    severity: ViolationSeverity::Medium,
                }
            })
            .collect())
    }

    /// Team count per owner within the effective tier's limit, for teams
    /// added while that tier applied
    async fn check_team_quota_respected(
        &self,
        now: OffsetDateTime,
    ) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<TeamUsageRow> = sqlx::query_as(
            r#"
            SELECT
                s.user_id, s.tier, s.status, s.trial_ends_at,
                s.trial_instance, s.version, s.updated_at,
                COUNT(t.id) AS team_count,
                MAX(t.created_at) AS newest_created_at
            FROM subscriptions s
            JOIN teams t ON t.owner_id = s.user_id
            GROUP BY s.user_id
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .filter_map(|row| {
                let sub = row.subscription.into_subscription();
                let tier = sub.effective_tier(now);
                let max = quota_breach(
                    &sub,
                    ResourceKind::Teams,
                    row.team_count,
                    row.newest_created_at,
                    now,
                )?;
                Some(InvariantViolation {
                    invariant: "team_quota_respected".to_string(),
                    user_ids: vec![sub.user_id.0],
                    description: format!(
                        "User owns {} teams, some added on the {} tier which allows {}",
                        row.team_count, tier, max
                    ),
                    context: serde_json::json!({
                        "tier": tier,
                        "team_count": row.team_count,
                        "newest_created_at": row.newest_created_at.unix_timestamp(),
                        "limit": max,
                    }),
                    severity: ViolationSeverity::High,
                })
            })
            .collect())
    }

    /// Player count per team within the owner's effective tier limit, for
    /// players added while that tier applied
    async fn check_player_quota_respected(
        &self,
        now: OffsetDateTime,
    ) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<PlayerUsageRow> = sqlx::query_as(
            r#"
            SELECT
                s.user_id, s.tier, s.status, s.trial_ends_at,
                s.trial_instance, s.version, s.updated_at,
                t.id AS team_id,
                COUNT(p.id) AS player_count,
                MAX(p.created_at) AS newest_created_at
            FROM teams t
            JOIN subscriptions s ON s.user_id = t.owner_id
            JOIN players p ON p.team_id = t.id
            GROUP BY s.user_id, t.id
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .filter_map(|row| {
                let sub = row.subscription.into_subscription();
                let tier = sub.effective_tier(now);
                let max = quota_breach(
                    &sub,
                    ResourceKind::Players,
                    row.player_count,
                    row.newest_created_at,
                    now,
                )?;
                Some(InvariantViolation {
                    invariant: "player_quota_respected".to_string(),
                    user_ids: vec![sub.user_id.0],
                    description: format!(
                        "Team {} has {} players, some added on the {} tier which allows {}",
                        row.team_id, row.player_count, tier, max
                    ),
                    context: serde_json::json!({
                        "team_id": row.team_id,
                        "tier": tier,
                        "player_count": row.player_count,
                        "newest_created_at": row.newest_created_at.unix_timestamp(),
                        "limit": max,
                    }),
                    severity: ViolationSeverity::High,
                })
            })
            .collect())
    }

    /// Get list of all available invariant checks
    pub fn available_checks() -> Vec<&'static str> {
        vec![
            "trial_window_consistent",
            "stale_trials",
            "team_quota_respected",
            "player_quota_respected",
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    fn violation(invariant: &str) -> InvariantViolation {
        InvariantViolation {
            invariant: invariant.to_string(),
            user_ids: vec![Uuid::new_v4()],
            description: String::new(),
            context: serde_json::Value::Null,
            severity: ViolationSeverity::High,
        }
    }

    #[test]
    fn test_violation_severity_display() {
        assert_eq!(ViolationSeverity::Critical.to_string(), "CRITICAL");
        assert_eq!(ViolationSeverity::High.to_string(), "HIGH");
        assert_eq!(ViolationSeverity::Medium.to_string(), "MEDIUM");
        assert_eq!(ViolationSeverity::Low.to_string(), "LOW");
    }

    #[test]
    fn test_available_checks() {
        let checks = InvariantChecker::available_checks();
        assert_eq!(checks.len(), 4);
        assert!(checks.contains(&"trial_window_consistent"));
        assert!(checks.contains(&"player_quota_respected"));
    }

    #[test]
    fn test_exceeded_limit_only_above_cap() {
        assert_eq!(exceeded_limit(SubscriptionTier::Free, ResourceKind::Teams, 1), None);
        assert_eq!(exceeded_limit(SubscriptionTier::Free, ResourceKind::Teams, 2), Some(1));
        assert_eq!(exceeded_limit(SubscriptionTier::Pro, ResourceKind::Players, 31), Some(30));
        assert_eq!(
            exceeded_limit(SubscriptionTier::Enterprise, ResourceKind::Teams, 10_000),
            None
        );
    }

    fn expired_trial(created_at: OffsetDateTime) -> Subscription {
        let mut sub = Subscription::new_free(coachhub_shared::UserId::new(), created_at);
        sub.status = coachhub_shared::SubscriptionStatus::Expired;
        sub.trial_instance = 1;
        sub.updated_at = datetime!(2025-01-15 00:00 UTC);
        sub
    }

    #[test]
    fn test_teams_kept_from_expired_trial_are_not_a_breach() {
        let now = datetime!(2025-02-01 04:00 UTC);
        let sub = expired_trial(datetime!(2025-01-01 00:00 UTC));

        // Three teams, newest made during the trial
        assert_eq!(
            quota_breach(&sub, ResourceKind::Teams, 3, datetime!(2025-01-10 00:00 UTC), now),
            None
        );
        // A team added after the trial ended should have been refused
        assert_eq!(
            quota_breach(&sub, ResourceKind::Teams, 4, datetime!(2025-01-20 00:00 UTC), now),
            Some(1)
        );
    }

    #[test]
    fn test_unreconciled_trial_counts_from_trial_end() {
        let now = datetime!(2025-01-16 04:00 UTC);
        let mut sub = Subscription::new_free(
            coachhub_shared::UserId::new(),
            datetime!(2025-01-01 00:00 UTC),
        );
        sub.tier = SubscriptionTier::Pro;
        sub.status = coachhub_shared::SubscriptionStatus::Trialing;
        sub.trial_ends_at = Some(datetime!(2025-01-15 00:00 UTC));
        sub.trial_instance = 1;

        assert_eq!(
            quota_breach(&sub, ResourceKind::Teams, 3, datetime!(2025-01-10 00:00 UTC), now),
            None
        );
        assert_eq!(
            quota_breach(&sub, ResourceKind::Teams, 3, datetime!(2025-01-15 12:00 UTC), now),
            Some(1)
        );
    }

    #[test]
    fn test_summary_counts_failed_checks_once() {
        let summary = InvariantCheckSummary::from_violations(
            datetime!(2025-01-01 04:00 UTC),
            vec![
                violation("team_quota_respected"),
                violation("team_quota_respected"),
                violation("stale_trials"),
            ],
        );
        assert_eq!(summary.checks_run, 4);
        assert_eq!(summary.checks_failed, 2);
        assert_eq!(summary.checks_passed, 2);
        assert!(!summary.healthy);

        let clean = InvariantCheckSummary::from_violations(datetime!(2025-01-01 04:00 UTC), vec![]);
        assert!(clean.healthy);
        assert_eq!(clean.checks_passed, 4);
    }
}
