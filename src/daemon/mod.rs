//! Per-node worker daemon.
//!
//! Runs on every node, accepts build+push jobs from the controller over
//! HTTP, and executes them against the checkpoint archives the kubelet
//! leaves on the local disk. Deliberately stateless across restarts; the
//! SnapShot status in the cluster is the durable record of progress.

pub mod api;
mod handlers;
mod jobs;
mod server;

pub use handlers::AppState;
pub use jobs::{run_job, ClusterJobExecutor, JobExecutor, JobStore};
pub use server::{router, run_server, DaemonConfig};
