//! Standalone REST API server binary.
//!
//! ## Purpose
//! Runs the FHIR REST API on its own.
//!
//! ## Intended use
//! Useful for development when the schemas are already installed. The workspace's main
//! `idmp-run` binary also loads `.env` and can install the base types before serving.

use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use api_rest::{router, AppState};
use idmp_core::config::{
    data_dir_from_env_value, default_page_size_from_env_value, max_tree_depth_from_env_value,
};
use idmp_core::{CoreConfig, ResourceStore};

/// Main entry point for the IDMP REST API server
///
/// # Environment Variables
/// - `IDMP_REST_ADDR`: Server address (default: "0.0.0.0:3000")
/// - `IDMP_DATA_DIR`: Data directory; in-memory storage when unset
/// - `IDMP_MAX_TREE_DEPTH`: Maximum tree nesting (default: 2)
/// - `IDMP_DEFAULT_COUNT`: Default search page size (default: 10)
///
/// # Errors
/// Returns an error if:
/// - the logging/tracing configuration cannot be initialised,
/// - a configuration value is invalid or the data directory cannot be opened,
/// - the server address cannot be bound, or
/// - the HTTP server fails while running.
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("api_rest=info".parse()?),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let addr = std::env::var("IDMP_REST_ADDR").unwrap_or_else(|_| "0.0.0.0:3000".into());

    let cfg = Arc::new(CoreConfig::new(
        data_dir_from_env_value(std::env::var("IDMP_DATA_DIR").ok()),
        max_tree_depth_from_env_value(std::env::var("IDMP_MAX_TREE_DEPTH").ok())?,
        default_page_size_from_env_value(std::env::var("IDMP_DEFAULT_COUNT").ok())?,
    )?);
    match cfg.data_dir() {
        Some(dir) => tracing::info!("-- Using data directory {}", dir.display()),
        None => tracing::warn!("-- IDMP_DATA_DIR not set, storing everything in memory"),
    }
    let store = Arc::new(ResourceStore::from_config(cfg)?);

    tracing::info!("-- Starting IDMP REST API on {}", addr);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, router(AppState::new(store))).await?;

    Ok(())
}
