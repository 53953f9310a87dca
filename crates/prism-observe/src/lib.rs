//! # Prism Observe - Observability Layer
//!
//! Tracing initialization and metric descriptions for the engine. Hosts
//! call [`init`] once at startup; everything else emits through the
//! `tracing` and `metrics` facades.

use anyhow::Result;
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use prism_config::ObservabilityConfig;

pub mod metrics;

/// Initialize tracing and, when enabled, the Prometheus metrics recorder.
/// Returns the handle the host can render `/metrics` from.
///
/// Safe to call more than once; later calls are no-ops.
pub fn init(config: &ObservabilityConfig) -> Result<Option<PrometheusHandle>> {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("{},prism=debug", config.log_level)));

    let subscriber = tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer().with_target(true));

    if subscriber.try_init().is_err() {
        tracing::debug!("Tracing already initialized, skipping");
        return Ok(None);
    }

    if !config.metrics_enabled {
        return Ok(None);
    }

    let handle = PrometheusBuilder::new().install_recorder()?;
    metrics::init_metrics_descriptions();
    tracing::info!("Prometheus metrics recorder installed");
    Ok(Some(handle))
}
