use anyhow::Context;
use chat_core::{
    conversation::PgConversationRepository,
    db::{create_pool, run_migrations},
    identity::PgRoleDirectory,
    message::PgMessageRepository,
    routes::create_router,
    state::{AppState, Config},
};
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables
    dotenv::dotenv().ok();

    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,chat_core=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    let config = Arc::new(Config::from_env().context("Invalid configuration")?);

    let state = match config.database_url.clone() {
        Some(database_url) => {
            // Sanitize URL for logging (hide password)
            let url_for_logging = database_url
                .split('@')
                .next()
                .map(|part| format!("{}@<hidden>", part))
                .unwrap_or_else(|| "<invalid format>".to_string());

            tracing::info!("Connecting to database at {}...", url_for_logging);
            let db = create_pool(&database_url)
                .await
                .with_context(|| format!("Failed to connect to database at {}", url_for_logging))?;

            tracing::info!("Running migrations...");
            run_migrations(&db).await.context("Failed to run migrations")?;

            AppState::new(
                config.clone(),
                Arc::new(PgConversationRepository::new(db.clone())),
                Arc::new(PgMessageRepository::new(db.clone())),
                Arc::new(PgRoleDirectory::new(db)),
            )
        }
        None => {
            tracing::warn!("DATABASE_URL not set, using the in-memory store; data is lost on restart");
            AppState::in_memory(config.clone())
        }
    };

    // Create router
    let app = create_router(state);

    // Start server
    let addr = format!("{}:{}", config.host, config.port);

    tracing::info!("Server starting on http://{}", addr);
    tracing::info!("Swagger UI available at http://{}/swagger-ui", addr);

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
