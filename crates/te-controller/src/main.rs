//! TE Controller - Main Entry Point

use te_controller::config::{ConfigError, ControllerConfig, DEFAULT_CONFIG_PATH};
use te_controller::{shutdown_on, Controller};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config_path = std::env::var("CONFIG_PATH").unwrap_or_else(|_| DEFAULT_CONFIG_PATH.into());

    // a missing file means defaults, a broken one is fatal
    let (config, missing) = match ControllerConfig::load(&config_path) {
        Ok(config) => (config, false),
        Err(ConfigError::Io(e)) if e.kind() == std::io::ErrorKind::NotFound => (ControllerConfig::default(), true),
        Err(e) => return Err(e.into()),
    };

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| config.log_filter.clone()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("TE Controller v{}", env!("CARGO_PKG_VERSION"));
    if missing {
        tracing::warn!(path = %config_path, "Config not found, using defaults");
    }

    if let Some(addr) = config.metrics_addr {
        metrics_exporter_prometheus::PrometheusBuilder::new()
            .with_http_listener(addr)
            .install()?;
        tracing::info!(addr = %addr, "Metrics exporter listening");
    }

    let controller = Controller::new(config)?;
    let stats = controller
        .run(shutdown_on(tokio::signal::ctrl_c()))
        .await?;

    tracing::info!(
        admitted = stats.flows_admitted,
        rerouted = stats.flows_rerouted,
        fallback = stats.flows_fallback,
        released = stats.flows_released,
        "TE Controller exited"
    );
    Ok(())
}
