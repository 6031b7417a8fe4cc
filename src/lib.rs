//! Playlist Transfer Backend
//!
//! Migrates user playlists between streaming catalogs (Spotify as source;
//! YouTube Music, TIDAL and Qobuz as targets) through an asynchronous,
//! reviewable matching pipeline.

use axum::{
    extract::State,
    routing::{get, post, put},
    Json, Router,
};
use serde::Serialize;
use sqlx::PgPool;
use tower::ServiceBuilder;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

pub mod config;
pub mod database;
pub mod error;
pub mod handlers;
pub mod models;
pub mod services;

pub use config::{AppConfig, ConfigError, Environment, TransferSettings};
pub use error::{AppError, ErrorResponse, Result};
pub use services::{JobQueue, JobStore};

#[derive(Clone)]
pub struct AppState {
    pub db_pool: PgPool,
    pub store: JobStore,
    pub queue: JobQueue,
}

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
    pub database: &'static str,
}

async fn health_handler(State(state): State<AppState>) -> Json<HealthResponse> {
    let database = if database::health_check(&state.db_pool).await {
        "up"
    } else {
        "down"
    };
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        database,
    })
}

/// Create the main application router.
pub fn create_router(state: AppState) -> Router {
    let api = Router::new()
        .route(
            "/connections",
            get(handlers::connections::list_connections_handler),
        )
        .route(
            "/connections/:provider",
            put(handlers::connections::upsert_connection_handler),
        )
        .route(
            "/imports",
            post(handlers::imports::create_import_handler)
                .get(handlers::imports::list_imports_handler),
        )
        .route("/imports/:id", get(handlers::imports::get_import_handler))
        .route(
            "/imports/:id/review",
            get(handlers::imports::review_list_handler)
                .post(handlers::imports::apply_review_handler),
        )
        .route(
            "/imports/:id/search",
            post(handlers::imports::manual_search_handler),
        )
        .route(
            "/imports/:id/finalize",
            post(handlers::imports::finalize_handler),
        )
        .route("/imports/:id/cancel", post(handlers::imports::cancel_handler));

    Router::new()
        .route("/health", get(health_handler))
        .nest("/api/v1", api)
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(CorsLayer::permissive()),
        )
        .with_state(state)
}
