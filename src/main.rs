//! # Voice Agent Backend - Main Application Entry Point
//!
//! An actix-web server that hosts real-time voice conversations: a client
//! streams microphone audio over a WebSocket, the server transcribes it,
//! answers through a reasoning backend and streams synthesized speech back,
//! cancelling its own answer as soon as the user talks over it.
//!
//! ## Application Architecture:
//! - **config**: layered configuration (defaults, config.toml, environment)
//! - **state**: shared configuration, metrics and collaborators
//! - **services**: collaborator contracts and their HTTP/WebSocket adapters
//! - **voice**: per-connection session controller, interruption coordinator
//!   and response pipeline
//! - **websocket**: actix actor bridging a socket to one voice session
//! - **health / handlers / middleware**: the HTTP surface
//! - **error**: HTTP and collaborator error types

mod config;
mod error;
mod handlers;
mod health;
mod middleware;
mod services;
mod state;
mod voice;
mod websocket;

use actix_cors::Cors;
use actix_web::{web, App, HttpServer};
use anyhow::Result;
use config::AppConfig;
use services::Services;
use state::AppState;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{error, info, warn};
use tracing_actix_web::TracingLogger;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Set once SIGTERM or SIGINT arrives.
static SHUTDOWN_SIGNAL: AtomicBool = AtomicBool::new(false);

#[actix_web::main]
async fn main() -> Result<()> {
    // A missing .env file is fine
    dotenv::dotenv().ok();

    init_tracing()?;

    let config = AppConfig::load()?;
    config.validate()?;

    info!("Starting voice-agent-backend v{}", env!("CARGO_PKG_VERSION"));
    info!("Configuration loaded: {}:{}", config.server.host, config.server.port);
    warn_missing_keys(&config);

    let services = Services::from_config(&config)?;
    let app_state = AppState::new(config.clone(), services);
    let bind_addr = format!("{}:{}", config.server.host, config.server.port);

    setup_signal_handlers();

    info!("Starting HTTP server on {}", bind_addr);

    let server = HttpServer::new(move || {
        let cors = Cors::default()
            .allow_any_origin()
            .allow_any_method()
            .allow_any_header()
            .max_age(3600);

        App::new()
            .app_data(web::Data::new(app_state.clone()))
            // Middleware runs in reverse registration order for requests
            .wrap(middleware::MetricsMiddleware)
            .wrap(cors)
            .wrap(TracingLogger::default())
            .service(
                web::scope("/api/v1")
                    .route("/health", web::get().to(health::health_check))
                    .route("/metrics", web::get().to(health::detailed_metrics))
                    .route("/config", web::get().to(handlers::get_config))
                    .route("/config", web::put().to(handlers::update_config))
                    .route("/conversations/{id}/messages", web::get().to(handlers::get_messages))
                    .route("/conversations/{id}", web::delete().to(handlers::delete_conversation)),
            )
            .route("/health", web::get().to(health::health_check))
            .route("/ws/voice/{conversation_id}", web::get().to(websocket::voice_session))
    })
    .bind(&bind_addr)?
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
            server_handle.stop(true).await;
        }
    }

    info!("Server stopped gracefully");
    Ok(())
}

/// Console logging, filtered by `RUST_LOG`.
///
/// Defaults to `voice_agent_backend=debug,actix_web=info` when `RUST_LOG`
/// is not set.
fn init_tracing() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "voice_agent_backend=debug,actix_web=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    Ok(())
}

fn warn_missing_keys(config: &AppConfig) {
    if config.transcription.api_key.is_empty() {
        warn!("DEEPGRAM_API_KEY is not set; voice sessions will fail to start transcription");
    }
    if config.reasoning.api_key.is_empty() {
        warn!("GROQ_API_KEY is not set; every turn will answer with the fallback reply");
    }
}

fn setup_signal_handlers() {
    tokio::spawn(async {
        use tokio::signal::unix::{signal, SignalKind};

        let (mut sigterm, mut sigint) = match (signal(SignalKind::terminate()), signal(SignalKind::interrupt())) {
            (Ok(term), Ok(int)) => (term, int),
            (Err(e), _) | (_, Err(e)) => {
                error!("Failed to install signal handlers: {}", e);
                return;
            }
        };

        tokio::select! {
            _ = sigterm.recv() => info!("Received SIGTERM"),
            _ = sigint.recv() => info!("Received SIGINT"),
        }

        SHUTDOWN_SIGNAL.store(true, Ordering::SeqCst);
    });
}

/// Poll the shutdown flag every 100ms.
async fn wait_for_shutdown() {
    while !SHUTDOWN_SIGNAL.load(Ordering::SeqCst) {
        tokio::time::sleep(tokio::time::Duration::from_millis(100)).await;
    }
}
