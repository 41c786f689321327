// Billing crate clippy configuration
// unwrap/expect are denied workspace-wide; tests may use them:
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! Coachhub Billing Module
//!
//! Subscription tiers, the free trial and the quota gate in front of team
//! and player creation.
//!
//! ## Features
//!
//! - **Trial Lifecycle**: One 14-day Pro trial per user, expired lazily on read and by the worker
//! - **Limit Gate**: Team and player quotas per tier, rechecked under lock at insert time
//! - **Milestones**: One-time 7/3/0-days-left warnings, deduplicated per trial
//! - **Audit**: Every tier and status change recorded with its source
//! - **Invariants**: Read-only consistency checks over the stored state

pub mod error;
pub mod invariants;
pub mod lifecycle;
pub mod limit_gate;
pub mod service;
pub mod store;
pub mod subscription;
pub mod trial_clock;


// Error
pub use error::{BillingError, BillingResult};

// Invariants
pub use invariants::{
    InvariantCheckSummary, InvariantChecker, InvariantViolation, ViolationSeverity,
};

// Lifecycle
pub use lifecycle::{LifecycleState, MilestoneKey, TierChangeSource, TrialStatus};

// Limit gate
pub use limit_gate::{Creation, Decision, PlayerCreation, Resource, TeamCreation};

// Service
pub use service::{Entitlement, EntitlementService, ReconcileSummary};

// Store
pub use store::{
    EntitlementStore, InMemoryStore, MilestoneStore, PgEntitlementStore, ResourceStore,
    SubscriptionStore, TierChange,
};

// Subscription
pub use subscription::Subscription;

// Trial clock
pub use trial_clock::{days_remaining, phase_for, TrialPhase};
