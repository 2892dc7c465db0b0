//! # Voice Relay - Main Application Entry Point
//!
//! This is the main entry point for the voice-relay server. It accepts browser
//! WebSocket connections carrying microphone audio and relays each one to its
//! own realtime voice-AI session, streaming the synthesized speech back.
//!
//! ## Key Rust Concepts Used:
//! - **async/await**: The entire application is asynchronous; one event loop serves many relays
//! - **modules**: Code is organized into separate modules (mod statements)
//! - **Result<T, E>**: Error handling using Rust's Result type
//! - **Arc & trait objects**: The upstream connector and instruction resolver are shared by every relay
//!
//! ## Application Architecture:
//! - **config**: Application configuration (TOML files + environment variables) and the API key
//! - **routing**: Accepts or rejects connection requests on the single relay route
//! - **relay**: The per-connection actor and its state machine
//! - **upstream**: The voice backend session (OpenAI Realtime over WebSocket)
//! - **instructions**: Optional per-meeting instruction lookup
//! - **audio**: The audio frame type shared by both legs
//! - **state**: Shared application state and counters
//! - **health**: The `/health` probe
//! - **middleware**: Request logging
//! - **error**: Error types and HTTP error responses

// Module declarations - These tell Rust about our other source files
mod audio;        // Audio frame type (audio/ directory)
mod config;       // Configuration management (config.rs)
mod error;        // Error handling types (error.rs)
mod health;       // Health check endpoint (health.rs)
mod instructions; // Instruction store client (instructions.rs)
mod middleware;   // Custom middleware (middleware/ directory)
mod relay;        // Per-connection relay actor (relay/ directory)
mod routing;      // Listener routing rules (routing.rs)
mod state;        // Application state management (state.rs)
mod upstream;     // Voice backend session (upstream/ directory)

#[cfg(test)]
mod testing;

// External crate imports - These are dependencies from Cargo.toml
use actix_web::{web, App, HttpServer};
use anyhow::Result;
use config::{ApiCredential, AppConfig};
use error::RelayError;
use instructions::{HttpInstructionResolver, InstructionResolver};
use state::AppState;
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use upstream::RealtimeConnector;

/// The main application entry point.
///
/// ## What this function does:
/// 1. **Loads configuration** from files and environment variables
/// 2. **Reads the API key**, refusing to start without it
/// 3. **Builds the collaborators** every relay shares (connector, optional resolver)
/// 4. **Starts the HTTP server** that upgrades accepted requests to relays
/// 5. **Handles graceful shutdown** when receiving system signals
///
/// ## Error Handling:
/// Any startup failure (missing key, bad config, port in use) returns an error
/// and the process exits before accepting a single connection.
#[actix_web::main]
async fn main() -> Result<()> {
    // Load environment variables from .env file (if it exists)
    dotenv::dotenv().ok();

    init_tracing()?;

    let config = AppConfig::load().map_err(|e| RelayError::Config(e.to_string()))?;
    config.validate().map_err(|e| RelayError::Config(e.to_string()))?;

    // Fail fast: without a key every upstream connect would be rejected.
    let credential = ApiCredential::from_env()?;

    // TLS for the upstream and instruction store connections.
    let _ = rustls::crypto::ring::default_provider().install_default();

    info!("Starting voice-relay v{}", env!("CARGO_PKG_VERSION"));
    info!(
        "Configuration loaded: {}:{}, model {}",
        config.server.host, config.server.port, config.upstream.model
    );

    let connector = Arc::new(RealtimeConnector::from_config(&config.upstream));

    let resolver: Option<Arc<dyn InstructionResolver>> = if config.instructions.enabled {
        info!("Instruction store enabled at {}", config.instructions.base_url);
        Some(Arc::new(HttpInstructionResolver::from_config(&config.instructions)?))
    } else {
        info!("Instruction store disabled, using default instructions");
        None
    };

    let workers = config.server.workers;
    let bind_addr = format!("{}:{}", config.server.host, config.server.port);
    let app_state = web::Data::new(AppState::new(config, credential, connector, resolver));

    info!("Starting HTTP server on {}", bind_addr);

    let server = HttpServer::new(move || {
        App::new()
            .app_data(app_state.clone())
            .wrap(middleware::RequestLogging)
            .configure(routing::configure)
    })
    .workers(workers)
    .disable_signals()
    .bind(&bind_addr)?
    .run();

    // Get a handle to control the server and spawn it in a separate task
    let server_handle = server.handle();
    let server_task = tokio::spawn(server);

    // Wait for either the server to finish OR a shutdown signal
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

/// Initialize the tracing (logging) system for the application.
///
/// ## Environment Variables:
/// - `RUST_LOG`: Controls what gets logged (e.g., "debug", "voice_relay=trace")
/// - If not set, defaults to "voice_relay=debug,actix_web=info"
fn init_tracing() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "voice_relay=debug,actix_web=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    Ok(())
}

/// Resolve when SIGINT (Ctrl+C) or, on Unix, SIGTERM arrives.
async fn wait_for_shutdown() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received SIGINT"),
        _ = terminate => info!("Received SIGTERM"),
    }
}
