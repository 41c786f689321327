//! Common types used across Coachhub

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::TypeError;

// =============================================================================
// ID Wrappers
// =============================================================================

/// User ID wrapper
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(pub Uuid);

impl UserId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for UserId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<Uuid> for UserId {
    fn from(id: Uuid) -> Self {
        Self(id)
    }
}

impl std::fmt::Display for UserId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Team ID wrapper
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TeamId(pub Uuid);

impl TeamId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for TeamId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<Uuid> for TeamId {
    fn from(id: Uuid) -> Self {
        Self(id)
    }
}

impl std::fmt::Display for TeamId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Player ID wrapper
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PlayerId(pub Uuid);

impl PlayerId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for PlayerId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<Uuid> for PlayerId {
    fn from(id: Uuid) -> Self {
        Self(id)
    }
}

// =============================================================================
// Enums
// =============================================================================

/// Commercial tier of a subscription
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SubscriptionTier {
    #[default]
    Free,
    Pro,
    Premium,
    Enterprise,
}

impl SubscriptionTier {
    pub const ALL: [SubscriptionTier; 4] = [
        SubscriptionTier::Free,
        SubscriptionTier::Pro,
        SubscriptionTier::Premium,
        SubscriptionTier::Enterprise,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Free => "free",
            Self::Pro => "pro",
            Self::Premium => "premium",
            Self::Enterprise => "enterprise",
        }
    }

    /// Position in the pricing ladder. Display metadata only: enterprise is
    /// custom and unbounded, not a larger step of the same ladder.
    pub fn rank(&self) -> u8 {
        match self {
            Self::Free => 0,
            Self::Pro => 1,
            Self::Premium => 2,
            Self::Enterprise => 3,
        }
    }

    pub fn is_paid(&self) -> bool {
        !matches!(self, Self::Free)
    }
}

impl std::fmt::Display for SubscriptionTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for SubscriptionTier {
    type Err = TypeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "free" => Ok(Self::Free),
            "pro" => Ok(Self::Pro),
            "premium" => Ok(Self::Premium),
            "enterprise" => Ok(Self::Enterprise),
            other => Err(TypeError::UnknownTier(other.to_string())),
        }
    }
}

/// Lifecycle status of a subscription record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SubscriptionStatus {
    #[default]
    Active,
    Trialing,
    Expired,
}

impl SubscriptionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Trialing => "trialing",
            Self::Expired => "expired",
        }
    }
}

impl std::fmt::Display for SubscriptionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for SubscriptionStatus {
    type Err = TypeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(Self::Active),
            "trialing" => Ok(Self::Trialing),
            "expired" => Ok(Self::Expired),
            other => Err(TypeError::UnknownStatus(other.to_string())),
        }
    }
}

/// Kind of quota-limited resource
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceKind {
    Teams,
    Players,
}

impl std::fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Teams => write!(f, "teams"),
            Self::Players => write!(f, "players"),
        }
    }
}

/// A quota value: either a hard cap or unbounded.
///
/// Serialized as a plain number, or `null` when unbounded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "Option<u32>", into = "Option<u32>")]
pub enum Limit {
    Limited(u32),
    Unlimited,
}

impl Limit {
    /// Whether one more resource fits given the current count
    pub fn allows(&self, current_count: u32) -> bool {
        match self {
            Limit::Limited(max) => current_count < *max,
            Limit::Unlimited => true,
        }
    }

    /// Headroom left at the current count, never negative
    pub fn remaining(&self, current_count: u32) -> Limit {
        match self {
            Limit::Limited(max) => Limit::Limited(max.saturating_sub(current_count)),
            Limit::Unlimited => Limit::Unlimited,
        }
    }

    pub fn is_unlimited(&self) -> bool {
        matches!(self, Limit::Unlimited)
    }
}

impl From<Option<u32>> for Limit {
    fn from(value: Option<u32>) -> Self {
        value.map(Limit::Limited).unwrap_or(Limit::Unlimited)
    }
}

impl From<Limit> for Option<u32> {
    fn from(value: Limit) -> Self {
        match value {
            Limit::Limited(max) => Some(max),
            Limit::Unlimited => None,
        }
    }
}

impl std::fmt::Display for Limit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Limit::Limited(max) => write!(f, "{}", max),
            Limit::Unlimited => write!(f, "unlimited"),
        }
    }
}
