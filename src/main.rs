//! The sensorstream service.

use std::io::Write;
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing_subscriber::prelude::*;

use sensorstream::{App, Config};

#[tokio::main]
async fn main() -> Result<()> {
    // Setup tracing/logging system.
    tracing_subscriber::registry()
        // Filter spans based on the RUST_LOG env var.
        .with(tracing_subscriber::EnvFilter::from_default_env())
        // Send a copy of all spans to stdout in compact form.
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(true)
                .with_level(true)
                .with_ansi(true),
        )
        // Install this registry as the global tracing registry.
        .try_init()
        .context("error initializing logging/tracing system")?;

    let cfg = Arc::new(Config::new()?);
    tracing::info!(
        cluster_name = %cfg.cluster_name,
        input_topic = %cfg.input_topic,
        sink_topic = %cfg.sink_topic,
        archive_path = %cfg.archive_path,
        "starting sensorstream",
    );
    match App::new(cfg).await {
        Ok(app) => match app.spawn().await {
            Ok(Err(err)) => tracing::error!(error = ?err),
            Err(err) => tracing::error!(error = ?err, "error joining app task"),
            Ok(Ok(())) => (),
        },
        Err(err) => tracing::error!(error = ?err, "error starting sensorstream"),
    }

    // Ensure any pending output is flushed.
    let _ = std::io::stdout().flush();
    let _ = std::io::stderr().flush();

    Ok(())
}
