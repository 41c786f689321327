//! Supabase access token verification

use std::sync::Arc;

use coachhub_shared::UserId;
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::middleware::AuthError;

/// Audience Supabase puts on tokens of signed-in users
pub const SUPABASE_AUDIENCE: &str = "authenticated";

/// Role claim of the Supabase service key, held only by trusted backends
pub const SERVICE_ROLE: &str = "service_role";

/// Claims we read from a Supabase access token
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    /// Supabase user id
    pub sub: String,
    pub exp: u64,
    #[serde(default)]
    pub aud: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
}

/// Claims of a service-key token. It carries no user and no audience.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceClaims {
    #[serde(default)]
    pub role: Option<String>,
    pub exp: u64,
}

/// HS256 verifier for Supabase-issued tokens
#[derive(Clone)]
pub struct JwtVerifier {
    decoding_key: Arc<DecodingKey>,
    validation: Arc<Validation>,
    service_validation: Arc<Validation>,
}

impl JwtVerifier {
    pub fn from_secret(secret: &str) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.validate_exp = true;
        validation.set_audience(&[SUPABASE_AUDIENCE]);

        let mut service_validation = Validation::new(Algorithm::HS256);
        service_validation.validate_exp = true;
        service_validation.validate_aud = false;

        Self {
            decoding_key: Arc::new(DecodingKey::from_secret(secret.as_bytes())),
            validation: Arc::new(validation),
            service_validation: Arc::new(service_validation),
        }
    }

    /// Validate signature, expiry and audience, then read the user id
    pub fn verify(&self, token: &str) -> Result<(UserId, Claims), AuthError> {
        let data = decode::<Claims>(token, &self.decoding_key, &self.validation).map_err(|e| {
            tracing::debug!(error = %e, "Access token rejected");
            AuthError::InvalidToken
        })?;

        let user_id = Uuid::parse_str(&data.claims.sub)
            .map(UserId)
            .map_err(|_| AuthError::InvalidToken)?;

        Ok((user_id, data.claims))
    }

    /// Validate signature and expiry, then require the service role.
    ///
    /// A well-signed user token fails with `Forbidden`, not `InvalidToken`.
    pub fn verify_service_role(&self, token: &str) -> Result<ServiceClaims, AuthError> {
        let data = decode::<ServiceClaims>(token, &self.decoding_key, &self.service_validation)
            .map_err(|e| {
                tracing::debug!(error = %e, "Service token rejected");
                AuthError::InvalidToken
            })?;

        if data.claims.role.as_deref() != Some(SERVICE_ROLE) {
            return Err(AuthError::Forbidden);
        }
        Ok(data.claims)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jsonwebtoken::{encode, EncodingKey, Header};

    const SECRET: &str = "test-supabase-jwt-secret";

    fn token(sub: &str, exp_offset: i64, aud: &str, secret: &str) -> String {
        let exp = (time::OffsetDateTime::now_utc().unix_timestamp() + exp_offset) as u64;
        let claims = Claims {
            sub: sub.to_string(),
            exp,
            aud: Some(aud.to_string()),
            email: Some("coach@example.com".to_string()),
        };
        encode(
            &Header::new(Algorithm::HS256),
            &claims,
            &EncodingKey::from_secret(secret.as_bytes()),
        )
        .unwrap()
    }

    #[test]
    fn test_valid_token_yields_user_id() {
        let user = Uuid::new_v4();
        let verifier = JwtVerifier::from_secret(SECRET);
        let (user_id, claims) = verifier
            .verify(&token(&user.to_string(), 3600, SUPABASE_AUDIENCE, SECRET))
            .unwrap();
        assert_eq!(user_id, UserId(user));
        assert_eq!(claims.email.as_deref(), Some("coach@example.com"));
    }

    #[test]
    fn test_expired_token_is_rejected() {
        let verifier = JwtVerifier::from_secret(SECRET);
        let err = verifier
            .verify(&token(
                &Uuid::new_v4().to_string(),
                -3600,
                SUPABASE_AUDIENCE,
                SECRET,
            ))
            .unwrap_err();
        assert!(matches!(err, AuthError::InvalidToken));
    }

    #[test]
    fn test_wrong_secret_is_rejected() {
        let verifier = JwtVerifier::from_secret(SECRET);
        let forged = token(&Uuid::new_v4().to_string(), 3600, SUPABASE_AUDIENCE, "other");
        assert!(verifier.verify(&forged).is_err());
    }

    #[test]
    fn test_anon_audience_is_rejected() {
        let verifier = JwtVerifier::from_secret(SECRET);
        let anon = token(&Uuid::new_v4().to_string(), 3600, "anon", SECRET);
        assert!(verifier.verify(&anon).is_err());
    }

    fn service_token(role: &str, secret: &str) -> String {
        let claims = ServiceClaims {
            role: Some(role.to_string()),
            exp: (time::OffsetDateTime::now_utc().unix_timestamp() + 3600) as u64,
        };
        encode(
            &Header::new(Algorithm::HS256),
            &claims,
            &EncodingKey::from_secret(secret.as_bytes()),
        )
        .unwrap()
    }

    #[test]
    fn test_service_role_token_is_accepted() {
        let verifier = JwtVerifier::from_secret(SECRET);
        let claims = verifier
            .verify_service_role(&service_token(SERVICE_ROLE, SECRET))
            .unwrap();
        assert_eq!(claims.role.as_deref(), Some(SERVICE_ROLE));
    }

    #[test]
    fn test_user_token_is_not_service_role() {
        let verifier = JwtVerifier::from_secret(SECRET);
        let user = token(&Uuid::new_v4().to_string(), 3600, SUPABASE_AUDIENCE, SECRET);
        assert!(matches!(
            verifier.verify_service_role(&user),
            Err(AuthError::Forbidden)
        ));
        assert!(matches!(
            verifier.verify_service_role(&service_token("anon", SECRET)),
            Err(AuthError::Forbidden)
        ));
    }

    #[test]
    fn test_forged_service_token_is_invalid() {
        let verifier = JwtVerifier::from_secret(SECRET);
        assert!(matches!(
            verifier.verify_service_role(&service_token(SERVICE_ROLE, "other")),
            Err(AuthError::InvalidToken)
        ));
    }

    #[test]
    fn test_non_uuid_subject_is_rejected() {
        let verifier = JwtVerifier::from_secret(SECRET);
        let bad = token("service-role", 3600, SUPABASE_AUDIENCE, SECRET);
        assert!(matches!(verifier.verify(&bad), Err(AuthError::InvalidToken)));
    }
}
