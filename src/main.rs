use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use api_rest::{AppState, router};
use idmp_core::config::{
    data_dir_from_env_value, default_page_size_from_env_value, flag_from_env_value,
    max_tree_depth_from_env_value,
};
use idmp_core::migration::{StepContext, install_pipeline};
use idmp_core::{CoreConfig, ResourceStore};

/// Main entry point for the IDMP registry
///
/// Loads `.env`, opens the data directory, optionally installs the resource types and serves
/// the FHIR REST API.
///
/// # Environment Variables
/// - `IDMP_REST_ADDR`: REST server address (default: "0.0.0.0:3000")
/// - `IDMP_DATA_DIR`: Data directory; in-memory storage when unset
/// - `IDMP_MAX_TREE_DEPTH`: Maximum tree nesting (default: 2)
/// - `IDMP_DEFAULT_COUNT`: Default search page size (default: 10)
/// - `IDMP_AUTO_INSTALL`: Run the install pipeline before serving (default: false)
///
/// # Returns
/// * `Ok(())` - If the server starts and runs successfully
/// * `Err(anyhow::Error)` - If configuration, installation or the server fails
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("idmp=info".parse()?)
                .add_directive("api_rest=info".parse()?),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let rest_addr = std::env::var("IDMP_REST_ADDR").unwrap_or_else(|_| "0.0.0.0:3000".into());
    let cfg = Arc::new(CoreConfig::new(
        data_dir_from_env_value(std::env::var("IDMP_DATA_DIR").ok()),
        max_tree_depth_from_env_value(std::env::var("IDMP_MAX_TREE_DEPTH").ok())?,
        default_page_size_from_env_value(std::env::var("IDMP_DEFAULT_COUNT").ok())?,
    )?);
    let auto_install =
        flag_from_env_value("IDMP_AUTO_INSTALL", std::env::var("IDMP_AUTO_INSTALL").ok())?;
    let store = Arc::new(ResourceStore::from_config(cfg)?);

    if auto_install {
        tracing::info!("++ Installing IDMP resource types");
        let report = install_pipeline().run(&StepContext::new(&store));
        if let Some(failure) = &report.failure {
            anyhow::bail!("install failed: {failure}");
        }
        tracing::info!(
            schema_changes = report.schema_changes(),
            "++ Resource types installed"
        );
    }

    tracing::info!("++ Starting IDMP REST on {}", rest_addr);
    let listener = tokio::net::TcpListener::bind(&rest_addr).await?;
    axum::serve(listener, router(AppState::new(store))).await?;

    Ok(())
}
