//! Z-Metering Service
//!
//! Opens the shared backends, verifies them, and holds them until shutdown.
//! Workers and the API layer embed [`Metering`] as a library; this binary is
//! the connectivity check for a deployment's configuration.

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use z_metering_service::{Metering, MeteringConfig};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,z_metering=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting Z-Metering Service");

    let config = MeteringConfig::from_env();
    tracing::info!(
        max_connections = config.database_max_connections,
        run_migrations = config.run_migrations,
        provider_call_timeout_secs = config.provider_call_timeout.as_secs(),
        "Service configuration loaded"
    );

    let metering = Metering::connect(config).await?;
    metering.health_check().await?;
    tracing::info!("Backends healthy; waiting for shutdown signal");

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutdown signal received");

    metering.close().await;
    Ok(())
}
