//! Stove8s Operator Entry Point
//!
//! Starts the SnapShot controller.

use std::sync::Arc;

use stove8s::controller::{ControllerState, KubeletClient, WorkerClient};
use stove8s::registry::RegistryClient;
use stove8s::Error;
use tracing::{info, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> Result<(), Error> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true))
        .with(
            EnvFilter::builder()
                .with_default_directive(Level::INFO.into())
                .from_env_lossy(),
        )
        .init();

    info!("Starting Stove8s Operator v{}", stove8s::VERSION);

    // Initialize Kubernetes client
    let client = kube::Client::try_default().await.map_err(Error::KubeError)?;

    info!("Connected to Kubernetes cluster");

    // Service-account material for talking to kubelets directly
    let kubelet = KubeletClient::from_service_account()?;

    let state = Arc::new(ControllerState {
        client,
        kubelet,
        worker: WorkerClient::new(),
        registry: RegistryClient::new(),
    });

    // Run the main controller loop
    stove8s::controller::run_controller(state).await?;

    Ok(())
}
