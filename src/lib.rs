pub mod audit;
pub mod config;
pub mod db;
pub mod models;
pub mod pdf;
pub mod stamping;

use tracing_subscriber::EnvFilter;

/// Initialize tracing for an embedding application.
pub fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(config::default_log_filter())),
        )
        .init();

    tracing::info!("Chartstamp core v{}", config::APP_VERSION);
}
