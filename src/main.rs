use anyhow::Context;
use std::net::SocketAddr;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use seat_booking::{
    config::{AppConfig, Config, LogFormat},
    controllers, AppState,
};

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let config = Config::from_env().context("invalid configuration")?;

    init_tracing(&config.app);
    info!("Starting Seat Booking API ({})", config.app.environment);

    // Store, migrations and cache
    let app_state = AppState::connect(&config).await?;

    // --- Start background tasks ---
    let sweeper = app_state.spawn_expiry_sweeper(config.booking.sweep_interval());

    // --- Start the web server ---
    let app = controllers::router(app_state.clone());

    let addr: SocketAddr = format!("{}:{}", config.app.host, config.app.port)
        .parse()
        .with_context(|| format!("invalid bind address {}:{}", config.app.host, config.app.port))?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    info!("Server listening on {}", addr);

    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    sweeper.abort();
    info!("Server stopped");
    Ok(())
}

fn init_tracing(app: &AppConfig) {
    let registry = tracing_subscriber::registry().with(EnvFilter::new(&app.rust_log));
    match app.log_format {
        LogFormat::Pretty => registry.with(tracing_subscriber::fmt::layer()).init(),
        LogFormat::Json => registry.with(tracing_subscriber::fmt::layer().json()).init(),
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}
