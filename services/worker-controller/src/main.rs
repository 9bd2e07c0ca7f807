//! nodepool Worker Controller
//!
//! Runs the worker provisioning and state controllers. The development
//! build wires them to the in-memory API and the no-op actuator.

use std::sync::Arc;

use anyhow::Result;
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use nodepool_worker_controller::config::Config;
use nodepool_worker_controller::{add, AddArgs, InMemoryApi, NoopActuator};

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration first so the log level can come from it
    let config = Config::from_env()?;

    // Initialize tracing
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.clone().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!(
        extension_type = %config.extension_type,
        ignore_operation_annotation = config.ignore_operation_annotation,
        max_concurrent_reconciles = config.max_concurrent_reconciles,
        "Starting nodepool worker controller"
    );

    let api = InMemoryApi::new();
    let controllers = add(AddArgs {
        actuator: Arc::new(NoopActuator::new()),
        api: Arc::new(api.clone()),
        informers: api.informers(),
        options: config.controller_options(),
        ignore_operation_annotation: config.ignore_operation_annotation,
        extension_type: config.extension_type.clone(),
    });

    // Create shutdown channel
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut controllers_handle = tokio::spawn(controllers.run(shutdown_rx));

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
        }
        result = &mut controllers_handle => {
            if let Err(e) = result {
                error!(error = %e, "Controllers task panicked");
            }
            return Ok(());
        }
    }

    // Signal shutdown to all controllers
    let _ = shutdown_tx.send(true);

    // Controllers drain in-flight reconciles themselves; allow a little extra
    let grace = config.drain_timeout + std::time::Duration::from_secs(1);
    match tokio::time::timeout(grace, controllers_handle).await {
        Ok(Ok(())) => info!("Worker controller shutdown complete"),
        Ok(Err(e)) => error!(error = %e, "Controllers task panicked during shutdown"),
        Err(_) => error!("Timed out waiting for controllers to stop"),
    }

    Ok(())
}
