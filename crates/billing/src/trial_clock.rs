//! Trial clock
//!
//! The one place that turns a trial end timestamp into "days left". Every
//! caller (lifecycle, entitlement view, HTTP responses) goes through here so
//! the rounding can never drift between screens.

use serde::{Deserialize, Serialize};
use time::{Duration, OffsetDateTime};

/// Whole calendar days left before `trial_ends_at`, rounded up.
///
/// 13.01 days reads as 14 so that a fresh trial matches the "14 days free"
/// copy. Never negative: an ended trial reads as 0.
pub fn days_remaining(trial_ends_at: OffsetDateTime, now: OffsetDateTime) -> u32 {
    let left = trial_ends_at - now;
    if left <= Duration::ZERO {
        return 0;
    }

    let whole_days = left.whole_days();
    let days = if left > Duration::days(whole_days) {
        whole_days + 1
    } else {
        whole_days
    };

    u32::try_from(days).unwrap_or(u32::MAX)
}

/// Severity band of a running trial
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrialPhase {
    /// 7 or more days left
    Healthy,
    /// 1 to 6 days left
    Urgent,
    /// Nothing left
    Expired,
}

impl std::fmt::Display for TrialPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TrialPhase::Healthy => write!(f, "healthy"),
            TrialPhase::Urgent => write!(f, "urgent"),
            TrialPhase::Expired => write!(f, "expired"),
        }
    }
}

/// Classify days remaining. Drives color/severity only, never milestone dedup.
pub fn phase_for(days_remaining: u32) -> TrialPhase {
    match days_remaining {
        0 => TrialPhase::Expired,
        1..=6 => TrialPhase::Urgent,
        _ => TrialPhase::Healthy,
    }
}
