//! # Voice Call Backend - Main Application Entry Point
//!
//! Realtime voice calls with AI characters. A caller streams microphone audio
//! over a WebSocket; each utterance is transcribed, answered in character,
//! synthesized and pushed back on the same connection.
//!
//! ## Key Rust Concepts Used:
//! - **async/await**: Every connection and every turn runs on the tokio runtime
//! - **actors**: One actix actor per WebSocket connection
//! - **traits**: Speech and language backends sit behind `Arc<dyn Trait>` seams
//! - **Result<T, E>**: Errors are propagated with `?` up to the HTTP boundary
//!
//! ## Application Architecture:
//! - **config**: Layered configuration (defaults, `config.toml`, environment)
//! - **state**: Shared services and call metrics
//! - **audio**: Session registry and utterance buffers
//! - **transcription**: Streaming speech recognition client and its binary protocol
//! - **services**: Generation, synthesis and storage backends
//! - **pipeline**: The per-turn state machine
//! - **gateway / websocket**: The realtime connection
//! - **handlers / health**: Plain HTTP endpoints

mod audio; // Sessions, buffers, PCM helpers
mod auth; // Caller identification
mod config; // Configuration management (config.rs)
mod error; // Error handling types (error.rs)
mod gateway; // Realtime message handling
mod handlers; // HTTP request handlers (handlers/ directory)
mod health; // Health check endpoint
mod models; // Shared domain types
mod pipeline; // Turn orchestration
mod services; // Backend clients and stores
mod state; // Application state management (state.rs)
mod transcription; // Streaming speech recognition
mod websocket; // Realtime call WebSocket actor

use actix_cors::Cors;
use actix_web::{middleware::Logger, web, App, HttpServer};
use anyhow::Result;
use config::AppConfig;
use state::AppState;
use tracing::{error, info, warn};
use tracing_actix_web::TracingLogger;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// The main application entry point.
///
/// ## What this function does:
/// 1. **Loads configuration** from files and environment variables
/// 2. **Sets up logging**
/// 3. **Builds the shared state**: backends, session registry, connection hub
/// 4. **Serves HTTP and WebSocket routes** until a shutdown signal arrives
#[actix_web::main]
async fn main() -> Result<()> {
    // A missing .env file is fine
    dotenv::dotenv().ok();

    init_tracing()?;

    let config = AppConfig::load()?;
    config.validate()?;

    info!("Starting voice-call-backend v{}", env!("CARGO_PKG_VERSION"));
    info!("Configuration loaded: {}:{}", config.server.host, config.server.port);
    if config.llm.api_key.is_empty() {
        warn!("No generation API key configured, voice turns will fail until one is set");
    }

    let bind_addr = format!("{}:{}", config.server.host, config.server.port);
    let app_state = AppState::new(config)?;

    info!("Starting HTTP server on {}", bind_addr);

    let server = HttpServer::new(move || {
        let cors = Cors::default()
            .allow_any_origin()
            .allow_any_method()
            .allow_any_header()
            .max_age(3600);

        App::new()
            .app_data(web::Data::new(app_state.clone()))
            .app_data(error::json_config())
            .wrap(cors)
            .wrap(Logger::default())
            .wrap(TracingLogger::default())
            .service(
                web::scope("/api/streaming-voice-calls")
                    .route("/first-call", web::post().to(handlers::first_call))
                    .route("/ws", web::get().to(websocket::call_websocket))
                    .route("/status/{session_id}", web::get().to(handlers::session_status)),
            )
            .route("/health", web::get().to(health::health_check))
    })
    .bind(&bind_addr)?
    .run();

    let server_handle = server.handle();
    let server_task = tokio::spawn(server);

    // Whichever finishes first: the server (usually an error) or a shutdown signal
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

/// Initialize the tracing (logging) system.
///
/// ## Environment Variables:
/// - `RUST_LOG`: Log filter, defaults to `voice_call_backend=debug,actix_web=info`
fn init_tracing() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "voice_call_backend=debug,actix_web=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .try_init()?;

    Ok(())
}

/// Resolve on SIGINT (Ctrl+C) or, on Unix, SIGTERM.
async fn wait_for_shutdown() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
                info!("Received SIGTERM");
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received SIGINT"),
        _ = terminate => {}
    }
}
