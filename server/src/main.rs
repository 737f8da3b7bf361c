use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;

use murmur_server::auth::jwt::{self, JwtVerifier};
use murmur_server::config::{generate_config_template, Config};
use murmur_server::state::{AppState, RealtimeSettings};
use murmur_server::store::SqliteStore;
use murmur_server::{db, routes};

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
    let env_filter = || {
        tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("murmur_server=info"))
    };
    if config.json_logs {
        tracing_subscriber::fmt().json().with_env_filter(env_filter()).init();
    } else {
        tracing_subscriber::fmt().pretty().with_env_filter(env_filter()).init();
    }

    tracing::info!("Murmur server v{} starting", env!("CARGO_PKG_VERSION"));

    // Initialize SQLite database
    let db = db::init_db(&config.data_dir)?;

    // Shared HS256 secret: configured, or generated and kept in data_dir
    let jwt_secret = jwt::resolve_jwt_secret(config.jwt_secret.as_deref(), &config.data_dir)?;

    let app_state = AppState::new(
        Arc::new(SqliteStore::new(db)),
        Arc::new(JwtVerifier::new(jwt_secret.clone())),
        jwt_secret,
        RealtimeSettings::from(&config),
    );

    // Reconcile presence left behind by connections that died without a close
    let presence_config = config.presence();
    app_state
        .presence
        .clone()
        .spawn_sweeper(config.sweep_interval());
    tracing::info!(
        interval_secs = config.sweep_interval().as_secs(),
        stale_after_secs = presence_config.stale_after_secs,
        "Presence sweeper started"
    );

    // Build router
    let app = routes::build_router(app_state);

    // Bind and serve
    let addr = format!("{}:{}", config.bind_address, config.port);
    let listener = TcpListener::bind(&addr).await?;
    tracing::info!("Listening on {}", addr);

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await?;

    Ok(())
}
