//! Access-token verification.
//!
//! The auth provider signs access tokens (HS256) with the project's JWT
//! secret. Every API request carries one as `Authorization: Bearer <token>`;
//! the verified `sub` claim is the caller's user id.

use crate::config::AuthConfig;
use crate::error::AuthError;
use crate::models::UserIdentity;
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

/// Claims read from an access token
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: Uuid,
    #[serde(default)]
    pub email: Option<String>,
    pub aud: String,
    pub exp: u64,
}

/// Checks access tokens against the shared secret
pub struct TokenVerifier {
    key: DecodingKey,
    validation: Validation,
}

impl TokenVerifier {
    pub fn new(config: &AuthConfig) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.set_audience(&[config.audience.as_str()]);
        if let Some(issuer) = &config.issuer {
            validation.set_issuer(&[issuer.as_str()]);
        }

        Self {
            key: DecodingKey::from_secret(config.jwt_secret.as_bytes()),
            validation,
        }
    }

    /// Identity of a valid, unexpired token
    pub fn verify(&self, token: &str) -> Result<UserIdentity, AuthError> {
        let data = decode::<Claims>(token, &self.key, &self.validation).map_err(|e| {
            debug!(error = %e, "Access token rejected");
            AuthError::InvalidToken
        })?;

        Ok(UserIdentity {
            id: data.claims.sub,
            email: data.claims.email,
        })
    }
}

/// Token part of an `Authorization: Bearer` header value
pub fn bearer_token(header: &str) -> Option<&str> {
    let (scheme, token) = header.trim().split_once(' ')?;
    let token = token.trim();
    (scheme.eq_ignore_ascii_case("bearer") && !token.is_empty()).then_some(token)
}

/// Sign a token the way the auth provider does
#[cfg(test)]
pub(crate) fn issue_token(secret: &str, user: &UserIdentity, ttl_secs: i64) -> String {
    use jsonwebtoken::{encode, EncodingKey, Header};

    let claims = Claims {
        sub: user.id,
        email: user.email.clone(),
        aud: "authenticated".to_string(),
        exp: (chrono::Utc::now().timestamp() + ttl_secs).max(0) as u64,
    };
    encode(
        &Header::new(Algorithm::HS256),
        &claims,
        &EncodingKey::from_secret(secret.as_bytes()),
    )
    .unwrap()
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET: &str = "super-secret-jwt-token-with-at-least-32-characters";

    fn verifier() -> TokenVerifier {
        TokenVerifier::new(&AuthConfig {
            jwt_secret: SECRET.to_string(),
            audience: "authenticated".to_string(),
            issuer: None,
        })
    }

    fn identity() -> UserIdentity {
        UserIdentity {
            id: Uuid::new_v4(),
            email: Some("petugas@example.com".to_string()),
        }
    }

    #[test]
    fn test_valid_token_yields_identity() {
        let user = identity();
        let token = issue_token(SECRET, &user, 3600);

        assert_eq!(verifier().verify(&token), Ok(user));
    }

    #[test]
    fn test_wrong_secret_and_expired_tokens_rejected() {
        let user = identity();

        let forged = issue_token("another-secret-of-sufficient-length-000", &user, 3600);
        assert_eq!(verifier().verify(&forged), Err(AuthError::InvalidToken));

        let expired = issue_token(SECRET, &user, -3600);
        assert_eq!(verifier().verify(&expired), Err(AuthError::InvalidToken));

        assert_eq!(verifier().verify("not-a-jwt"), Err(AuthError::InvalidToken));
    }

    #[test]
    fn test_bearer_token_parsing() {
        assert_eq!(bearer_token("Bearer abc.def.ghi"), Some("abc.def.ghi"));
        assert_eq!(bearer_token("bearer  abc"), Some("abc"));
        assert_eq!(bearer_token("Basic dXNlcjpwYXNz"), None);
        assert_eq!(bearer_token("Bearer "), None);
        assert_eq!(bearer_token("abc"), None);
    }
}
