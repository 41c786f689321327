//! Billing error types

use coachhub_shared::TypeError;
use thiserror::Error;

pub type BillingResult<T> = Result<T, BillingError>;

#[derive(Debug, Error)]
pub enum BillingError {
    /// The user already consumed their trial
    #[error("Trial already used")]
    TrialAlreadyUsed,

    /// The user is on a tier that cannot start a trial
    #[error("Not eligible for a trial: {0}")]
    TrialNotEligible(String),

    /// The backing store could not be reached or failed the query
    #[error("Storage unavailable: {0}")]
    StorageUnavailable(String),

    /// A stored record violates the subscription invariants
    #[error("Data integrity error: {0}")]
    DataIntegrity(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid tier: {0}")]
    InvalidTier(String),

    /// Moving up a tier has to come from the payment backend
    #[error("Upgrade requires payment: {0}")]
    UpgradeRequiresPayment(String),

    /// Lost every compare-and-swap attempt against concurrent writers
    #[error("Concurrent modification: {0}")]
    ConcurrentModification(String),
}

impl From<sqlx::Error> for BillingError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => BillingError::NotFound("Row not found".to_string()),
            other => BillingError::StorageUnavailable(other.to_string()),
        }
    }
}

impl From<TypeError> for BillingError {
    fn from(err: TypeError) -> Self {
        match err {
            TypeError::UnknownTier(tier) => BillingError::InvalidTier(tier),
            other => BillingError::DataIntegrity(other.to_string()),
        }
    }
}
