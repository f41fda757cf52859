use crate::error::{AppError, Result};
use crate::identity::{Identity, Role};
use chrono::{Duration, Utc};
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String, // user_id
    #[serde(default)]
    pub role: Option<String>,
    pub exp: i64,
}

impl Claims {
    pub fn identity(&self) -> Result<Identity> {
        let user_id = Uuid::parse_str(&self.sub)
            .map_err(|_| AppError::Unauthorized("Invalid token".to_string()))?;

        Ok(Identity {
            user_id,
            role: self.role.as_deref().map(Role::parse).unwrap_or_default(),
        })
    }
}

/// Token issuance belongs to the identity provider; this is kept for tooling and tests.
pub fn create_jwt(user_id: Uuid, role: Role, secret: &str, expiration_hours: i64) -> Result<String> {
    let expiration = Utc::now()
        .checked_add_signed(Duration::hours(expiration_hours))
        .ok_or(AppError::InternalError)?
        .timestamp();

    let role = match role {
        Role::User => "user",
        Role::Seller => "seller",
        Role::Admin => "admin",
    };

    let claims = Claims {
        sub: user_id.to_string(),
        role: Some(role.to_string()),
        exp: expiration,
    };

    encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(secret.as_bytes()),
    )
    .map_err(|_| AppError::InternalError)
}

pub fn verify_jwt(token: &str, secret: &str) -> Result<Claims> {
    decode::<Claims>(
        token,
        &DecodingKey::from_secret(secret.as_bytes()),
        &Validation::default(),
    )
    .map(|data| data.claims)
    .map_err(|_| AppError::Unauthorized("Invalid token".to_string()))
}
