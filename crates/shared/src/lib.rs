#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! Coachhub Shared
//!
//! Domain types, the tier catalog and database plumbing shared by the
//! billing library, the API server and the background worker.

pub mod catalog;
pub mod db;
pub mod types;

pub use catalog::{limits_for, TierLimits, TRIAL_LENGTH_DAYS, TRIAL_TIER};
pub use db::{create_pool, run_migrations};
pub use types::{
    Limit, PlayerId, ResourceKind, SubscriptionStatus, SubscriptionTier, TeamId, UserId,
};

/// Errors raised while parsing shared types
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TypeError {
    #[error("Unknown subscription tier '{0}'")]
    UnknownTier(String),
    #[error("Unknown subscription status '{0}'")]
    UnknownStatus(String),
}
