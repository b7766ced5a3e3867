// Gateway service entry point.

use std::future::Future;

use meter_gateway::observability::init_tracing;
use meter_gateway::{Gateway, GatewayConfig, Result};

fn main() -> Result<()> {
    init_tracing();

    let config = GatewayConfig::from_env_or_file()?;
    config.validate()?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(config.worker_threads)
        .thread_name("meter-gateway")
        .enable_all()
        .build()?;

    runtime.block_on(run_with_shutdown(config, async {
        let _ = tokio::signal::ctrl_c().await;
    }))
}

async fn run_with_shutdown<F>(config: GatewayConfig, shutdown: F) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    tracing::info!(
        bind = %config.bind,
        workers = config.worker_threads,
        acceptors = config.acceptor_threads,
        "Starting gateway"
    );

    let gateway = match Gateway::builder().config(config).bind().await {
        Ok(gateway) => gateway,
        Err(e) => {
            tracing::error!(error = %e, "Failed to start gateway");
            return Err(e);
        }
    };

    // Block until SIGINT so the process stays alive.
    shutdown.await;
    tracing::info!(devices = gateway.connection_count(), "Shutting down");
    gateway.shutdown().await;
    Ok(())
}
