//! Application state

use std::sync::Arc;

use coachhub_billing::{EntitlementService, InMemoryStore};
use sqlx::PgPool;

use crate::{auth::JwtVerifier, config::Config};

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub entitlements: EntitlementService,
    pub jwt_verifier: JwtVerifier,
    /// Present when backed by Postgres; used by the health check
    pub pool: Option<PgPool>,
}

impl AppState {
    pub fn new(pool: PgPool, config: &Config) -> Self {
        tracing::info!("Supabase JWT validation enabled");
        Self {
            entitlements: EntitlementService::postgres(pool.clone()),
            jwt_verifier: JwtVerifier::from_secret(&config.supabase_jwt_secret),
            pool: Some(pool),
        }
    }

    /// State over an in-memory store, for tests and local development
    pub fn in_memory(store: Arc<InMemoryStore>, jwt_secret: &str) -> Self {
        Self {
            entitlements: EntitlementService::new(store),
            jwt_verifier: JwtVerifier::from_secret(jwt_secret),
            pool: None,
        }
    }
}
