//! Authentication module for Coachhub

pub mod jwt;
pub mod middleware;

pub use jwt::{Claims, JwtVerifier, ServiceClaims, SERVICE_ROLE, SUPABASE_AUDIENCE};
pub use middleware::{require_auth, require_service_role, AuthError, AuthUser};
