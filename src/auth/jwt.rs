//! JWT validation and (test-side) generation.

use anyhow::{Context, Result};
use chrono::Utc;
use jsonwebtoken::{decode, encode, errors::ErrorKind, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use tracing::debug;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    /// User id.
    pub sub: String,
    pub exp: usize,
}

/// Why a presented token was rejected. Expiry is kept distinct so clients
/// can refresh instead of re-authenticating.
#[derive(Debug, PartialEq, Eq)]
pub enum TokenError {
    Expired,
    Invalid,
}

pub struct JwtHandler {
    secret: String,
    expiration_hours: i64,
}

impl JwtHandler {
    pub fn new(secret: String) -> Self {
        Self {
            secret,
            expiration_hours: 24,
        }
    }

    pub fn generate_token(&self, user_id: &str) -> Result<String> {
        let expiration = Utc::now()
            .checked_add_signed(chrono::Duration::hours(self.expiration_hours))
            .context("invalid timestamp")?
            .timestamp() as usize;

        let claims = Claims {
            sub: user_id.to_string(),
            exp: expiration,
        };

        encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(self.secret.as_bytes()),
        )
        .context("failed to generate JWT")
    }

    pub fn validate_token(&self, token: &str) -> std::result::Result<Claims, TokenError> {
        match decode::<Claims>(
            token,
            &DecodingKey::from_secret(self.secret.as_bytes()),
            &Validation::default(),
        ) {
            Ok(decoded) => {
                debug!(user_id = %decoded.claims.sub, "validated bearer token");
                Ok(decoded.claims)
            }
            Err(e) if matches!(e.kind(), ErrorKind::ExpiredSignature) => Err(TokenError::Expired),
            Err(_) => Err(TokenError::Invalid),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generation_and_validation_roundtrip() {
        let handler = JwtHandler::new("test-secret-key-12345".to_string());
        let token = handler.generate_token("user_1").unwrap();
        let claims = handler.validate_token(&token).unwrap();
        assert_eq!(claims.sub, "user_1");
    }

    #[test]
    fn garbage_token_is_invalid() {
        let handler = JwtHandler::new("test-secret-key-12345".to_string());
        assert_eq!(
            handler.validate_token("invalid.token.here").unwrap_err(),
            TokenError::Invalid
        );
    }

    #[test]
    fn different_secret_rejects() {
        let a = JwtHandler::new("secret1".to_string());
        let b = JwtHandler::new("secret2".to_string());
        let token = a.generate_token("user_1").unwrap();
        assert_eq!(b.validate_token(&token).unwrap_err(), TokenError::Invalid);
    }

    #[test]
    fn expired_token_is_distinguishable() {
        let handler = JwtHandler {
            secret: "test-secret".to_string(),
            expiration_hours: -1,
        };
        let token = handler.generate_token("user_1").unwrap();
        assert_eq!(handler.validate_token(&token).unwrap_err(), TokenError::Expired);
    }
}
