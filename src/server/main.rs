// src/server/main.rs
// Entry point for the legami backend
use std::sync::Arc;
use std::time::Duration;

use legami::server::{
    auth,
    config::ServerConfig,
    connection::Server,
    database::Database,
    dispatcher::NotificationDispatcher,
    membership::MembershipEngine,
    registry::GroupRegistry,
    session::{self, SessionContext},
};
use legami::utils::performance;
use log::{error, info};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let log_level = std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string());
    std::env::set_var("RUST_LOG", &log_level);
    env_logger::init();

    let config = ServerConfig::from_env();
    if config.enable_tls {
        info!("TLS is enabled; set TLS_CERT_PATH and TLS_KEY_PATH env vars to point to cert and key PEM files.");
    }

    let database = Arc::new(Database::connect(&config.database_url).await?);
    info!("🗄️ Running database migrations...");
    database.migrate().await.map_err(|e| {
        error!("Database migration failed: {}", e);
        e
    })?;
    info!("✅ Database migrations completed");

    let registry = Arc::new(GroupRegistry::new());
    let dispatcher = NotificationDispatcher::new(registry.clone());
    let engine = Arc::new(MembershipEngine::new(
        database.clone(),
        dispatcher,
        config.max_message_length,
    ));

    // Periodic expired-session sweep
    let sweep_db = database.clone();
    tokio::spawn(async move {
        loop {
            auth::cleanup_expired_sessions(&sweep_db).await;
            tokio::time::sleep(Duration::from_secs(3600)).await;
        }
    });

    // Performance logger in background
    let perf_log_path = std::env::var("PERFORMANCE_LOG_PATH")
        .unwrap_or_else(|_| "data/legami_performance.log".to_string());
    let perf_db = database.clone();
    tokio::spawn(async move {
        info!("📊 Starting performance logger - logging every 120 seconds to: {}", perf_log_path);
        performance::start_performance_logger(perf_db, &perf_log_path).await;
    });

    // WebSocket listener one port above the command listener
    let ws_addr = format!("{}:{}", config.host, config.websocket_port());
    let ws_ctx = SessionContext {
        db: database.clone(),
        engine: engine.clone(),
        registry: registry.clone(),
    };
    tokio::spawn(async move {
        if let Err(e) = session::serve(&ws_addr, ws_ctx).await {
            error!("WebSocket server error: {}", e);
        }
    });
    info!("WebSocket server started on {}:{}", config.host, config.websocket_port());

    let addr = format!("{}:{}", config.host, config.port);
    let server = Arc::new(Server {
        db: database,
        config,
        engine,
    });
    server.run(&addr).await?;
    Ok(())
}
