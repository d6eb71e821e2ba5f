pub mod cancellation;
pub mod config;
pub mod core_state;
pub mod db;
pub mod error;
pub mod models;
pub mod pipeline;

pub use cancellation::{cancellation_pair, CancelHandle, CancellationToken};
pub use config::CoreConfig;
pub use core_state::{CoreState, HealthReport, HealthStatus};
pub use error::{CoreError, ErrorKind};

use tracing_subscriber::EnvFilter;

/// Install the global `tracing` subscriber. `RUST_LOG` wins over the
/// build's default filter. Safe to call more than once.
pub fn init_tracing() {
    let installed = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(config::default_log_filter())),
        )
        .try_init()
        .is_ok();

    if installed {
        tracing::info!("{} core starting v{}", config::APP_NAME, config::APP_VERSION);
    }
}

/// Build the core from environment configuration.
pub async fn start() -> Result<CoreState, CoreError> {
    init_tracing();
    let config = CoreConfig::from_env();
    CoreState::builder(config).build().await
}
