// API crate clippy configuration
// unwrap/expect are denied workspace-wide; tests may use them:
#![cfg_attr(test, allow(clippy::expect_used))]
#![cfg_attr(test, allow(clippy::unwrap_used))]

//! Coachhub API Library
//!
//! HTTP surface over the entitlement service: tier catalog, subscription and
//! trial management, quota-gated team/player creation and trial milestones.

pub mod auth;
pub mod config;
pub mod error;
pub mod routes;
pub mod state;

pub use config::{Config, ConfigError};
pub use error::{ApiError, ApiResult};
pub use routes::create_router;
pub use state::AppState;
