use std::sync::Arc;

use tokio::net::TcpListener;

use murmur_server::auth::jwt::{load_or_generate_jwt_secret, JwtVerifier};
use murmur_server::config::{generate_config_template, Config};
use murmur_server::db::{self, store::SqliteStore};
use murmur_server::kv::Backends;
use murmur_server::routes;
use murmur_server::state::AppState;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load config with layered precedence: defaults < TOML < env < CLI
    let config = Config::load()?;

    // Handle --generate-config: print template and exit
    if config.generate_config {
        print!("{}", generate_config_template());
        return Ok(());
    }

    // Initialize tracing/logging
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("murmur_server=info,tower_http=info"));
    if config.json_logs {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().pretty().with_env_filter(filter).init();
    }

    tracing::info!("murmur server v{} starting", env!("CARGO_PKG_VERSION"));

    // Initialize SQLite database
    let db = db::init_db(&config.data_dir)?;
    let store = Arc::new(SqliteStore::new(db));

    // Shared secret from config, else a key file in data_dir
    let secret = match &config.jwt_secret {
        Some(secret) if !secret.is_empty() => secret.as_bytes().to_vec(),
        _ => load_or_generate_jwt_secret(&config.data_dir)?,
    };
    let verifier = Arc::new(JwtVerifier::new(secret));

    let backends = Backends::connect(config.redis_url.as_deref()).await?;

    let app_state = AppState::new(store, backends, verifier, config.session(), &config.cache());
    let app = routes::build_router(app_state);

    // Bind and serve
    let addr = format!("{}:{}", config.bind_address, config.port);
    let listener = TcpListener::bind(&addr).await?;
    tracing::info!("Listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("murmur server stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown signal received");
}
