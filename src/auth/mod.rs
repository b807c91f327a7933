//! C12 Auth [AMBIENT]: bearer-token guard for the REST surface. Passwords
//! are hashed with `bcrypt`; tokens are signed JWTs (`jsonwebtoken`)
//! carrying `sub`, `exp`, `iat` — grounded on the pack's only JWT example,
//! `ConaryLabs-Mira/backend/src/auth/jwt.rs`.

use chrono::{Duration, Utc};
use jsonwebtoken::{DecodingKey, EncodingKey, Header, Validation, decode, encode};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,
    pub exp: usize,
    pub iat: usize,
}

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("bad credentials")]
    BadCredentials,
    #[error("token error: {0}")]
    Token(String),
}

pub struct AuthService {
    secret: String,
    expire_days: i64,
}

impl AuthService {
    pub fn new(secret: String, expire_days: i64) -> Self {
        Self { secret, expire_days }
    }

    pub fn hash_password(&self, password: &str) -> Result<String, AuthError> {
        bcrypt::hash(password, bcrypt::DEFAULT_COST)
            .map_err(|e| AuthError::Token(format!("failed to hash password: {e}")))
    }

    pub fn verify_password(&self, password: &str, hash: &str) -> bool {
        bcrypt::verify(password, hash).unwrap_or(false)
    }

    pub fn issue_token(&self, user_id: Uuid) -> Result<String, AuthError> {
        let now = Utc::now();
        let exp = now
            .checked_add_signed(Duration::days(self.expire_days))
            .ok_or_else(|| AuthError::Token("failed to compute expiry".to_string()))?;

        let claims = Claims {
            sub: user_id.to_string(),
            exp: exp.timestamp() as usize,
            iat: now.timestamp() as usize,
        };

        encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(self.secret.as_bytes()),
        )
        .map_err(|e| AuthError::Token(e.to_string()))
    }

    pub fn verify_token(&self, token: &str) -> Result<Uuid, AuthError> {
        let data = decode::<Claims>(
            token,
            &DecodingKey::from_secret(self.secret.as_bytes()),
            &Validation::default(),
        )
        .map_err(|_| AuthError::BadCredentials)?;

        Uuid::parse_str(&data.claims.sub).map_err(|_| AuthError::BadCredentials)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_a_token() {
        let service = AuthService::new("test-secret".to_string(), 30);
        let user_id = Uuid::new_v4();
        let token = service.issue_token(user_id).unwrap();
        let verified = service.verify_token(&token).unwrap();
        assert_eq!(verified, user_id);
    }

    #[test]
    fn rejects_token_signed_with_different_secret() {
        let a = AuthService::new("secret-a".to_string(), 30);
        let b = AuthService::new("secret-b".to_string(), 30);
        let token = a.issue_token(Uuid::new_v4()).unwrap();
        assert!(matches!(b.verify_token(&token), Err(AuthError::BadCredentials)));
    }

    #[test]
    fn password_hash_round_trips() {
        let service = AuthService::new("secret".to_string(), 30);
        let hash = service.hash_password("hunter2").unwrap();
        assert!(service.verify_password("hunter2", &hash));
        assert!(!service.verify_password("wrong", &hash));
    }
}
