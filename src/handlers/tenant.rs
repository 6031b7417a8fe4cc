//! Tenant resolution.
//!
//! Requests identify themselves with an opaque `X-Session-Token` header; an
//! unknown token provisions a fresh user on first sight. Credential
//! acquisition and real login flows live outside this service.

use axum::{async_trait, extract::FromRequestParts, http::request::Parts};

use crate::error::AppError;
use crate::models::User;
use crate::AppState;

pub const SESSION_HEADER: &str = "x-session-token";

/// Extractor for the calling tenant.
pub struct CurrentUser(pub User);

#[async_trait]
impl FromRequestParts<AppState> for CurrentUser {
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, AppError> {
        let token = parts
            .headers
            .get(SESSION_HEADER)
            .and_then(|value| value.to_str().ok())
            .map(str::trim)
            .filter(|token| !token.is_empty())
            .ok_or_else(|| AppError::BadRequest("missing session token".to_string()))?;

        let user = state.store.ensure_user(token).await?;
        Ok(CurrentUser(user))
    }
}
