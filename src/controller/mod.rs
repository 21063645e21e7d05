//! Controller module for SnapShot reconciliation
//!
//! Contains the controller loop, the snapshot state machine, and the HTTP
//! clients it drives: the kubelet checkpoint API and the per-node daemon.

mod kubelet;
mod reconciler;
mod worker_client;

pub use kubelet::KubeletClient;
pub use reconciler::{run_controller, ControllerState, DAEMONSET_PORT};
pub use worker_client::WorkerClient;
