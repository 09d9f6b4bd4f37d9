use crate::error::{AppError, Result};
use crate::state::AppState;
use axum::{
    RequestPartsExt,
    extract::{FromRef, FromRequestParts},
    http::request::Parts,
};
use axum_extra::{TypedHeader, headers};
use chrono::{Duration, Utc};
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation, decode, encode};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Serialize, Deserialize)]
pub struct Claims {
    pub sub: Uuid,       // User ID
    pub name: String,
    pub exp: i64,        // Expiration time
    pub iat: i64,        // Issued at
}

impl Claims {
    pub fn new(user_id: Uuid, name: String, expires_in: Duration) -> Self {
        let now = Utc::now();
        Self {
            sub: user_id,
            name,
            exp: (now + expires_in).timestamp(),
            iat: now.timestamp(),
        }
    }

    pub fn is_expired(&self) -> bool {
        self.exp <= Utc::now().timestamp()
    }
}

/// Sign a token for `user_id`. Issuing tokens belongs to the account service;
/// this exists for tooling and tests.
pub fn create_token(user_id: Uuid, name: &str, secret: &str, expires_in: Duration) -> Result<String> {
    let claims = Claims::new(user_id, name.to_string(), expires_in);

    encode(
        &Header::new(Algorithm::HS256),
        &claims,
        &EncodingKey::from_secret(secret.as_bytes()),
    )
    .map_err(|e| AppError::Internal(anyhow::anyhow!("Failed to sign token: {}", e)))
}

pub fn verify_token(token: &str, secret: &str) -> Result<Claims> {
    let token = token.trim();
    if token.is_empty() {
        return Err(AppError::Unauthenticated);
    }

    let mut validation = Validation::new(Algorithm::HS256);
    validation.leeway = 0;

    let claims = decode::<Claims>(token, &DecodingKey::from_secret(secret.as_bytes()), &validation)
        .map_err(|e| {
            tracing::debug!("Rejected token: {}", e);
            AppError::Unauthenticated
        })?
        .claims;

    // Expiry is enforced against the local clock regardless of decoder settings
    if claims.is_expired() {
        tracing::debug!("Rejected expired token for user {}", claims.sub);
        return Err(AppError::Unauthenticated);
    }

    Ok(claims)
}

/// Resolve a bearer credential to the user it was issued for
pub fn authenticate(token: &str, secret: &str) -> Result<Uuid> {
    verify_token(token, secret).map(|claims| claims.sub)
}

/// Extractor for authenticated requests
pub struct AuthUser {
    pub user_id: Uuid,
    pub name: String,
}

impl<S> FromRequestParts<S> for AuthUser
where
    AppState: FromRef<S>,
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> std::result::Result<Self, Self::Rejection> {
        let TypedHeader(auth_header) = parts
            .extract::<TypedHeader<headers::Authorization<headers::authorization::Bearer>>>()
            .await
            .map_err(|_| AppError::Unauthenticated)?;

        let app_state = AppState::from_ref(state);
        let claims = verify_token(auth_header.token(), &app_state.config.jwt_secret)?;

        Ok(AuthUser {
            user_id: claims.sub,
            name: claims.name,
        })
    }
}
