use anyhow::Context;
use tracing_subscriber::EnvFilter;

use playlist_transfer_backend::{
    config::AppConfig, database, services, AppState, JobStore,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,sqlx=warn")),
        )
        .init();

    let config = AppConfig::from_env().context("loading configuration")?;
    let db_pool = database::create_pool(&config.database)
        .await
        .context("connecting to database")?;
    database::run_migrations(&db_pool).await?;

    let store = JobStore::new(db_pool.clone());
    let queue = services::start_workers(store.clone(), config.transfer.clone());

    let state = AppState {
        db_pool,
        store,
        queue,
    };
    let app = playlist_transfer_backend::create_router(state);

    let bind_address = config.server.bind_address();
    let listener = tokio::net::TcpListener::bind(&bind_address)
        .await
        .with_context(|| format!("binding {}", bind_address))?;
    tracing::info!(address = %bind_address, "playlist transfer backend listening");
    axum::serve(listener, app).await.context("serving")?;
    Ok(())
}
