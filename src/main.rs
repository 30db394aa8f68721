//! # Voice Coach Server - Main Application Entry Point
//!
//! Backend for the voice-training app. Each browser tab opens a session socket and
//! role-plays a conversation with a persona driven by a realtime speech model; when
//! the user ends the session the transcript is graded into a markdown report.
//!
//! ## Application Architecture:
//! - **config**: Application configuration (environment variables + `.env`)
//! - **state**: Shared configuration and session metrics
//! - **health**: Health and metrics endpoints
//! - **handlers**: REST handlers (config, report generation)
//! - **websocket**: The `/ws/session` socket actor, one per browser tab
//! - **session**: Session controller, epoch guard and transcript reconciliation
//! - **audio**: Capture, playback scheduling and the browser relay backend
//! - **live**: Realtime model connection and its wire protocol
//! - **evaluation**: Markdown report generation
//! - **error**: Error types and HTTP error responses

mod audio;
mod config;
mod error;
mod evaluation;
mod handlers;
mod health;
mod live;
mod session;
mod state;
mod websocket;

use actix_cors::Cors;
use actix_web::{web, App, HttpServer};
use anyhow::Result;
use config::AppConfig;
use state::AppState;
use tracing::{error, info, warn};
use tracing_actix_web::TracingLogger;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// ## What this function does:
/// 1. **Loads configuration** from the environment
/// 2. **Sets up logging**
/// 3. **Creates shared application state** for handlers and session sockets
/// 4. **Runs the HTTP server** until a shutdown signal arrives
#[actix_web::main]
async fn main() -> Result<()> {
    // A missing .env file is fine
    dotenv::dotenv().ok();

    init_tracing()?;

    let config = AppConfig::load()?;
    config.validate()?;

    info!("Starting voice-coach-server v{}", env!("CARGO_PKG_VERSION"));
    info!("Configuration loaded: {}:{}", config.server.host, config.server.port);
    info!(
        "Live model: {} (voice {}), evaluation model: {}",
        config.live.model, config.live.voice, config.evaluation.model
    );
    if config.live.api_key.is_empty() {
        warn!("No API key configured; sessions will fail to connect until one is set");
    }

    let app_state = AppState::new(config.clone());
    let bind_addr = format!("{}:{}", config.server.host, config.server.port);

    info!("Starting HTTP server on {}", bind_addr);

    let server = HttpServer::new(move || {
        let cors = Cors::default()
            .allow_any_origin()
            .allow_any_method()
            .allow_any_header()
            .max_age(3600);

        App::new()
            .app_data(web::Data::new(app_state.clone()))
            .wrap(cors)
            .wrap(TracingLogger::default())
            .service(
                web::scope("/api/v1")
                    .route("/health", web::get().to(health::health_check))
                    .route("/metrics", web::get().to(health::detailed_metrics))
                    .route("/config", web::get().to(handlers::get_config))
                    .route("/config", web::put().to(handlers::update_config))
                    .route("/evaluate", web::post().to(handlers::evaluate)),
            )
            .route("/ws/session", web::get().to(websocket::session_websocket))
            .route("/health", web::get().to(health::health_check))
    })
    .bind(&bind_addr)?
    .disable_signals()
    .run();

    let server_handle = server.handle();
    let server_task = tokio::spawn(server);

    tokio::select! {
        result = server_task => {
            match result {
                Ok(Err(e)) => error!("Server error: {}", e),
                Err(e) => error!("Server task error: {}", e),
                Ok(Ok(())) => {}
            }
        }
        _ = wait_for_shutdown() => {
            info!("Shutdown signal received, stopping server...");
            // Open session sockets close, which stops their sessions
            server_handle.stop(true).await;
        }
    }

    info!("Server stopped gracefully");
    Ok(())
}

/// Structured console logging.
///
/// `RUST_LOG` controls the filter; defaults to `voice_coach_server=debug,actix_web=info`.
fn init_tracing() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "voice_coach_server=debug,actix_web=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    Ok(())
}

/// Resolves on SIGTERM or SIGINT. Falls back to Ctrl+C alone if the
/// SIGTERM handler cannot be installed.
async fn wait_for_shutdown() {
    use tokio::signal::unix::{signal, SignalKind};

    match signal(SignalKind::terminate()) {
        Ok(mut sigterm) => {
            tokio::select! {
                _ = sigterm.recv() => info!("Received SIGTERM"),
                _ = wait_for_ctrl_c() => info!("Received SIGINT"),
            }
        }
        Err(e) => {
            warn!("Failed to install SIGTERM handler: {}", e);
            wait_for_ctrl_c().await;
            info!("Received SIGINT");
        }
    }
}

/// Never resolves if the Ctrl+C listener cannot be installed.
async fn wait_for_ctrl_c() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for Ctrl+C: {}", e);
        std::future::pending::<()>().await;
    }
}
