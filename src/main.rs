use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use exchange_server::config::AppConfig;
use exchange_server::db::Database;
use exchange_server::engine::MatchingEngine;
use exchange_server::router::Router;
use exchange_server::server::{self, ExchangeServer};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "exchange_server=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    dotenvy::dotenv().ok();
    let config = AppConfig::load()?;

    tracing::info!("starting exchange server v{}", env!("CARGO_PKG_VERSION"));

    // Initialize database
    let db = Database::connect(&config).await?;
    db.init_schema().await?;
    tracing::info!("database connected");

    // Wire the engine behind the request router
    let engine = MatchingEngine::new(db.pool.clone());
    let router = Router::new(engine);
    let server = ExchangeServer::new(router, &config);

    // Serve until terminated
    let listener = server::bind(&config).await?;
    server.run(listener).await?;

    Ok(())
}
