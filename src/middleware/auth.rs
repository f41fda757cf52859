use crate::{auth::verify_jwt, error::AppError, identity::Identity, state::AppState};
use axum::{
    async_trait,
    body::Body,
    extract::{FromRequestParts, State},
    http::{request::Parts, Request},
    middleware::Next,
    response::Response,
};
use uuid::Uuid;

pub async fn auth_middleware(
    State(state): State<AppState>,
    mut req: Request<Body>,
    next: Next,
) -> Result<Response, AppError> {
    let token = if let Some(auth_header) = req.headers().get("Authorization").and_then(|h| h.to_str().ok()) {
        auth_header
            .strip_prefix("Bearer ")
            .ok_or(AppError::Unauthorized("Invalid credentials".to_string()))?
            .to_string()
    } else {
        // Browsers can't set headers on WebSocket upgrades
        let query = req.uri().query().unwrap_or("");
        query
            .split('&')
            .find_map(|p| p.strip_prefix("token="))
            .map(str::to_string)
            .ok_or(AppError::Unauthorized("Invalid credentials".to_string()))?
    };

    let identity = verify_jwt(&token, &state.config.jwt_secret)?.identity()?;

    if let Err(e) = state.roles.observe(identity).await {
        tracing::warn!("Failed to record role of {}: {}", identity.user_id, e);
    }

    req.extensions_mut().insert(identity);

    Ok(next.run(req).await)
}

// Extractor for getting the caller's user id from request extensions
pub struct AuthUser(pub Uuid);

#[async_trait]
impl<S> FromRequestParts<S> for AuthUser
where
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .extensions
            .get::<Identity>()
            .map(|identity| AuthUser(identity.user_id))
            .ok_or(AppError::Unauthorized("Invalid credentials".to_string()))
    }
}
