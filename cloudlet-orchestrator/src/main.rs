use std::sync::Arc;
use tracing_subscriber::EnvFilter;

use cloudlet_orchestrator::cluster_manager::ClusterManager;
use cloudlet_orchestrator::port_forward::ForwardSupervisor;
use cloudlet_orchestrator::transfer::CommandTransferDriver;
use cloudlet_orchestrator::{create_router, AppState, HandoffConfig};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = HandoffConfig::from_env();
    tracing::info!(
        provider = %config.cluster_provider,
        recv_port = config.recv_port,
        flavor_match_disk = config.flavor_match_disk,
        flavor_auto_create = config.flavor_auto_create,
        "Starting cloudlet handoff orchestrator"
    );

    let handles = ClusterManager::connect(&config).await?;
    let relays = ForwardSupervisor::new(&config.forward_bind_addr, config.forward_timeout);
    let driver = Arc::new(CommandTransferDriver::new(&config.transfer_command));
    let state = AppState::assemble(&config, handles, driver, relays.clone());
    let app = create_router(state);

    let listener = tokio::net::TcpListener::bind(&config.listen_addr).await?;
    tracing::info!("Listening on {}", config.listen_addr);
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("Shutdown requested");
        })
        .await?;

    relays.shutdown().await;
    Ok(())
}
