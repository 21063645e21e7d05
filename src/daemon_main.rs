//! Stove8s Daemon Entry Point
//!
//! The per-node worker: builds checkpoint archives into OCI images and
//! pushes them. Deployed as a daemonset, one instance per node.

use std::sync::Arc;

use clap::Parser;
use stove8s::daemon::{AppState, ClusterJobExecutor, DaemonConfig, JobStore};
use stove8s::Error;
use tracing::{info, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser, Debug)]
#[command(
    name = "stove8s-daemon",
    version,
    about = "Per-node build/push worker for stove8s snapshots"
)]
struct Args {
    /// Address to bind the job API on
    #[arg(long, default_value = "::", env = "STOVE8S_DAEMON_HOST")]
    host: String,

    /// Port to bind the job API on
    #[arg(long, default_value_t = 8008, env = "STOVE8S_DAEMON_PORT")]
    port: u16,
}

#[tokio::main]
async fn main() -> Result<(), Error> {
    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true))
        .with(
            EnvFilter::builder()
                .with_default_directive(Level::INFO.into())
                .from_env_lossy(),
        )
        .init();

    let args = Args::parse();
    info!("Starting Stove8s Daemon v{}", stove8s::VERSION);

    let client = kube::Client::try_default().await.map_err(Error::KubeError)?;

    let state = AppState {
        jobs: JobStore::default(),
        executor: Arc::new(ClusterJobExecutor::new(client)),
    };

    stove8s::daemon::run_server(
        DaemonConfig {
            host: args.host,
            port: args.port,
        },
        state,
    )
    .await
}
