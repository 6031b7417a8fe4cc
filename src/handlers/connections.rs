//! Provider connection endpoints: store, rotate and list credential blobs.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::error::{AppError, Result};
use crate::handlers::CurrentUser;
use crate::models::Provider;
use crate::services::catalog::ytm::BrowserHeaders;
use crate::AppState;

#[derive(Debug, Serialize)]
pub struct ConnectionResponse {
    pub provider: Provider,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
pub struct ConnectionsListResponse {
    pub connections: Vec<ConnectionResponse>,
}

fn parse_provider(raw: &str) -> Result<Provider> {
    raw.parse::<Provider>()
        .map_err(|e| AppError::BadRequest(e))
}

/// PUT /api/v1/connections/:provider
///
/// Stores (or atomically rotates) the opaque credential blob for the
/// calling user. YouTube Music blobs are shape-checked before storage so a
/// broken header capture fails here instead of mid-job.
pub async fn upsert_connection_handler(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
    Path(provider): Path<String>,
    Json(credentials): Json<serde_json::Value>,
) -> Result<(StatusCode, Json<ConnectionResponse>)> {
    let provider = parse_provider(&provider)?;
    if provider == Provider::YoutubeMusic {
        BrowserHeaders::parse(&credentials)?;
    }

    let connection = state
        .store
        .upsert_connection(user.id, provider, &credentials)
        .await?;
    tracing::info!(user_id = %user.id, %provider, "stored provider connection");

    Ok((
        StatusCode::OK,
        Json(ConnectionResponse {
            provider: connection.provider,
            created_at: connection.created_at,
            updated_at: connection.updated_at,
        }),
    ))
}

/// GET /api/v1/connections
pub async fn list_connections_handler(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
) -> Result<Json<ConnectionsListResponse>> {
    let connections = state
        .store
        .connections_for_user(user.id)
        .await?
        .into_iter()
        .map(|c| ConnectionResponse {
            provider: c.provider,
            created_at: c.created_at,
            updated_at: c.updated_at,
        })
        .collect();
    Ok(Json(ConnectionsListResponse { connections }))
}
