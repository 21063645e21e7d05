//! SnapShot reconciler.
//!
//! Drives each SnapShot through its state machine: checkpoint the target
//! container via the kubelet, hand the archive to the node-local daemon for
//! build+push, verify the pushed reference, and finally point the pod at the
//! snapshot image. Every step persists its observable outcome to the status
//! subresource before returning, so a controller restart resumes exactly
//! where the last write left off.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use k8s_openapi::api::core::v1::{Node, Pod, Secret};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::{
    api::{Api, Patch, PatchParams},
    client::Client,
    runtime::{
        controller::{Action, Controller},
        watcher::Config,
    },
    Resource, ResourceExt,
};
use tracing::{debug, error, info, instrument, warn};

use crate::crd::{SnapShot, SnapShotNode, SnapShotStage, SnapShotState, SnapShotStatus};
use crate::daemon::api::{CreateJobRequest, ImagePushSecretRef};
use crate::error::{Error, Result};
use crate::registry::RegistryClient;

use super::kubelet::KubeletClient;
use super::worker_client::WorkerClient;

/// Node port the daemonset's job API is exposed on.
pub const DAEMONSET_PORT: u16 = 31008;

const FIELD_MANAGER: &str = "stove8s-operator";

/// Shared state for the controller
pub struct ControllerState {
    pub client: Client,
    pub kubelet: KubeletClient,
    pub worker: WorkerClient,
    pub registry: RegistryClient,
}

/// Main entry point to start the controller
pub async fn run_controller(state: Arc<ControllerState>) -> Result<()> {
    let client = state.client.clone();
    let snapshots: Api<SnapShot> = Api::all(client.clone());

    info!("Starting SnapShot controller");

    // Verify CRD exists
    if let Err(e) = snapshots.list(&Default::default()).await {
        error!("SnapShot CRD not found. Please install the CRD first: {e:?}");
        return Err(Error::ConfigError("SnapShot CRD not installed".to_string()));
    }

    Controller::new(snapshots, Config::default())
        // Owned pods wake the reconciler when the target container changes
        .owns::<Pod>(Api::all(client.clone()), Config::default())
        .shutdown_on_signal()
        .run(reconcile, error_policy, state)
        .for_each(|res| async move {
            match res {
                Ok(obj) => debug!("Reconciled: {obj:?}"),
                Err(e) => error!("Reconcile error: {e:?}"),
            }
        })
        .await;

    Ok(())
}

/// Which of the persisted-progress steps runs next, keyed off status alone.
///
/// Each variant corresponds to exactly one status write per reconcile pass,
/// which is what makes the machine resumable: a step is skipped iff its
/// effect is already visible in the status.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum MachineStep {
    /// Enter the state machine: stage=CriuDumping, state=Started.
    Enter,
    /// Bind the snapshot to the pod's node.
    BindNode,
    /// Ask the kubelet for a checkpoint archive.
    Checkpoint,
    /// Create the build+push job on the bound node's daemon.
    CreateJob,
    /// Mirror the worker job's progress into the status.
    PollJob,
    /// Push reported success but the reference did not verify.
    FinalVerify,
}

pub(crate) fn machine_step(status: &SnapShotStatus) -> MachineStep {
    if status.stage.is_none() {
        return MachineStep::Enter;
    }
    if status.node.is_none() {
        return MachineStep::BindNode;
    }
    if status.checkpoint_node_path.is_empty() {
        return MachineStep::Checkpoint;
    }
    if status.job_id.is_empty() {
        return MachineStep::CreateJob;
    }
    if !(status.stage == Some(SnapShotStage::Pushing) && status.state == SnapShotState::Success) {
        return MachineStep::PollJob;
    }
    MachineStep::FinalVerify
}

/// One reconcile pass for a SnapShot.
///
/// Invoked on any change to the SnapShot or to the pod it owns. Advances at
/// most one observable step, persists, returns.
#[instrument(skip(ctx), fields(name = %snapshot.name_any(), namespace = snapshot.namespace()))]
async fn reconcile(snapshot: Arc<SnapShot>, ctx: Arc<ControllerState>) -> Result<Action> {
    let client = ctx.client.clone();
    let namespace = snapshot.namespace().unwrap_or_else(|| "default".to_string());

    // Resolve selector to the target pod.
    let pod_namespace = snapshot
        .spec
        .selector
        .object
        .namespace
        .clone()
        .unwrap_or_else(|| namespace.clone());
    let pods: Api<Pod> = Api::namespaced(client.clone(), &pod_namespace);

    let pod = match resolve_target_pod(&pods, &snapshot).await? {
        Some(pod) => pod,
        None => {
            info!(
                "target pod {}/{} not found, waiting",
                pod_namespace, snapshot.spec.selector.object.name
            );
            return Ok(Action::requeue(Duration::from_secs(10)));
        }
    };

    ensure_owner_reference(&pods, &snapshot, &pod).await?;

    // The selected container must exist; if it already runs the output
    // image the snapshot has been applied and there is nothing to do.
    let container = snapshot.spec.selector.container.as_str();
    let current_image =
        container_image(&pod, container).ok_or_else(|| Error::NoSuchContainer(container.to_string()))?;
    let output_reference = snapshot.output_reference();
    if current_image == output_reference {
        debug!("pod already runs {output_reference}, nothing to do");
        return Ok(Action::await_change());
    }

    let status = snapshot.status_or_default();

    // Failed is terminal; a new SnapShot is the retry mechanism.
    if status.state == SnapShotState::Failed {
        warn!("snapshot is in a terminal Failed state");
        return Ok(Action::await_change());
    }

    // Success already verified: only the image swap may still be pending.
    if status.output_reference_is_valid {
        patch_pod_image(&pods, &pod, container, output_reference).await?;
        info!("patched pod image to {output_reference}");
        return Ok(Action::await_change());
    }

    let secret = load_push_secret(&client, &snapshot, &namespace).await?;

    // The reference may already exist, either from a previous run whose
    // status write was lost or because someone pushed it out of band.
    if ctx
        .registry
        .reference_is_valid(output_reference, &secret)
        .await?
    {
        let mut next = status.clone();
        next.output_reference_is_valid = true;
        patch_status(&client, &snapshot, &namespace, &next).await?;
        patch_pod_image(&pods, &pod, container, output_reference).await?;
        info!("{output_reference} verified in registry, pod image patched");
        return Ok(Action::await_change());
    }

    if !pod_is_ready(&pod) {
        debug!("target pod not Ready, waiting");
        return Ok(Action::requeue(Duration::from_secs(10)));
    }

    match machine_step(&status) {
        MachineStep::Enter => {
            let mut next = status.clone();
            next.stage = Some(SnapShotStage::CriuDumping);
            next.state = SnapShotState::Started;
            patch_status(&client, &snapshot, &namespace, &next).await?;
            Ok(Action::await_change())
        }

        MachineStep::BindNode => {
            let node = bind_node(&client, &pod).await?;
            info!(node = %node.name, addr = %node.addr, "bound snapshot to node");
            let mut next = status.clone();
            next.node = Some(node);
            patch_status(&client, &snapshot, &namespace, &next).await?;
            Ok(Action::await_change())
        }

        MachineStep::Checkpoint => {
            let node = bound_node(&status)?;
            let mut next = status.clone();
            match ctx
                .kubelet
                .checkpoint(
                    &node.addr,
                    node.kubelet_port,
                    &pod_namespace,
                    &pod.name_any(),
                    container,
                )
                .await
            {
                Ok(path) => {
                    info!(%path, "kubelet wrote checkpoint archive");
                    next.checkpoint_node_path = path;
                }
                Err(err) => {
                    error!(%err, "checkpoint failed");
                    next.state = SnapShotState::Failed;
                }
            }
            patch_status(&client, &snapshot, &namespace, &next).await?;
            Ok(Action::await_change())
        }

        MachineStep::CreateJob => {
            let node = bound_node(&status)?;
            let secret_ref = &snapshot.spec.output.container_registry.image_push_secret;
            let request = CreateJobRequest {
                checkpoint_dump_path: status.checkpoint_node_path.clone(),
                image_push_secret: ImagePushSecretRef {
                    name: secret_ref.name.clone(),
                    namespace: secret_ref.namespace.clone().unwrap_or_else(|| namespace.clone()),
                },
                image_reference: output_reference.to_string(),
            };
            let job_id = ctx
                .worker
                .create_job(&node.addr, node.daemonset_port, &request)
                .await?;
            info!(%job_id, "created worker job");
            let mut next = status.clone();
            next.job_id = job_id;
            patch_status(&client, &snapshot, &namespace, &next).await?;
            Ok(Action::await_change())
        }

        MachineStep::PollJob => {
            let node = bound_node(&status)?;
            match ctx
                .worker
                .job_status(&node.addr, node.daemonset_port, &status.job_id)
                .await?
            {
                // The worker restarted and lost the job. Clearing the id
                // sends the next pass back to CreateJob; the checkpoint
                // archive on the node is still there.
                None => {
                    warn!(job_id = %status.job_id, "worker no longer knows the job, recreating");
                    let mut next = status.clone();
                    next.job_id = String::new();
                    patch_status(&client, &snapshot, &namespace, &next).await?;
                    Ok(Action::await_change())
                }
                Some(job) => {
                    if status.stage != Some(job.stage) || status.state != job.state {
                        debug!(stage = %job.stage, state = %job.state, "mirroring worker job status");
                        let mut next = status.clone();
                        next.stage = Some(job.stage);
                        next.state = job.state;
                        patch_status(&client, &snapshot, &namespace, &next).await?;
                        return Ok(Action::await_change());
                    }
                    // Unchanged and not terminal: poll again shortly.
                    Ok(Action::requeue(Duration::from_secs(5)))
                }
            }
        }

        // The registry HEAD above came back false even though the worker
        // reported a successful push. Either the registry is lying or the
        // push went somewhere unexpected; never auto-retry this.
        MachineStep::FinalVerify => {
            error!("invalid reference: push succeeded but {output_reference} is not in the registry");
            Ok(Action::await_change())
        }
    }
}

/// Resolve `spec.selector.object` to a Pod. Kinds other than Pod are not
/// supported.
async fn resolve_target_pod(pods: &Api<Pod>, snapshot: &SnapShot) -> Result<Option<Pod>> {
    let object = &snapshot.spec.selector.object;
    if object.kind != "Pod" {
        return Err(Error::UnsupportedKind(object.kind.clone()));
    }
    pods.get_opt(&object.name).await.map_err(Error::KubeError)
}

/// Make the SnapShot an owner of its target pod so pod events retrigger
/// reconciliation. Skipped when the reference is already present.
async fn ensure_owner_reference(pods: &Api<Pod>, snapshot: &SnapShot, pod: &Pod) -> Result<()> {
    let Some(mut owner_ref) = snapshot.controller_owner_ref(&()) else {
        return Err(Error::ConfigError("SnapShot has no uid yet".to_string()));
    };

    let mut refs: Vec<OwnerReference> = pod.owner_references().to_vec();
    if refs.iter().any(|r| r.uid == owner_ref.uid) {
        return Ok(());
    }
    // Only one controller owner is allowed per object; pods created by a
    // workload controller already have one.
    if refs.iter().any(|r| r.controller == Some(true)) {
        owner_ref.controller = Some(false);
    }
    refs.push(owner_ref);

    let patch = serde_json::json!({ "metadata": { "ownerReferences": refs } });
    pods.patch(
        &pod.name_any(),
        &PatchParams::apply(FIELD_MANAGER),
        &Patch::Merge(&patch),
    )
    .await
    .map_err(Error::KubeError)?;

    Ok(())
}

/// Image currently configured for `container` in the pod spec, or None when
/// the pod has no container with that name.
fn container_image<'a>(pod: &'a Pod, container: &str) -> Option<&'a str> {
    pod.spec
        .as_ref()?
        .containers
        .iter()
        .find(|c| c.name == container)
        .map(|c| c.image.as_deref().unwrap_or(""))
}

fn pod_is_ready(pod: &Pod) -> bool {
    pod.status
        .as_ref()
        .and_then(|status| status.conditions.as_ref())
        .map(|conditions| {
            conditions
                .iter()
                .any(|c| c.type_ == "Ready" && c.status == "True")
        })
        .unwrap_or(false)
}

/// Look up the pod's node and capture everything later steps need to reach
/// it: InternalIP, kubelet port, and the daemonset node port.
async fn bind_node(client: &Client, pod: &Pod) -> Result<SnapShotNode> {
    let node_name = pod
        .spec
        .as_ref()
        .and_then(|spec| spec.node_name.clone())
        .ok_or_else(|| Error::ConfigError(format!("pod {} is not scheduled", pod.name_any())))?;

    let nodes: Api<Node> = Api::all(client.clone());
    let node = nodes.get(&node_name).await.map_err(Error::KubeError)?;

    let addr = node_internal_ip(&node).ok_or_else(|| Error::NodeAddressMissing(node_name.clone()))?;
    let kubelet_port = node
        .status
        .as_ref()
        .and_then(|status| status.daemon_endpoints.as_ref())
        .and_then(|endpoints| endpoints.kubelet_endpoint.as_ref())
        .map(|endpoint| endpoint.port as u16)
        .unwrap_or(10250);

    Ok(SnapShotNode {
        name: node_name,
        addr,
        daemonset_port: DAEMONSET_PORT,
        kubelet_port,
    })
}

fn node_internal_ip(node: &Node) -> Option<String> {
    node.status
        .as_ref()?
        .addresses
        .as_ref()?
        .iter()
        .find(|address| address.type_ == "InternalIP")
        .map(|address| address.address.clone())
}

fn bound_node(status: &SnapShotStatus) -> Result<&SnapShotNode> {
    status
        .node
        .as_ref()
        .ok_or_else(|| Error::ConfigError("status.node is unset".to_string()))
}

/// Load the image-push secret, defaulting its namespace to the SnapShot's.
async fn load_push_secret(
    client: &Client,
    snapshot: &SnapShot,
    namespace: &str,
) -> Result<Secret> {
    let secret_ref = &snapshot.spec.output.container_registry.image_push_secret;
    let secret_namespace = secret_ref.namespace.as_deref().unwrap_or(namespace);
    let secrets: Api<Secret> = Api::namespaced(client.clone(), secret_namespace);
    secrets.get(&secret_ref.name).await.map_err(Error::KubeError)
}

/// Patch exactly `spec.containers[name].image`, the only pod spec field that
/// may change after admission.
async fn patch_pod_image(
    pods: &Api<Pod>,
    pod: &Pod,
    container: &str,
    image: &str,
) -> Result<()> {
    let patch = serde_json::json!({
        "spec": { "containers": [ { "name": container, "image": image } ] }
    });
    pods.patch(&pod.name_any(), &PatchParams::default(), &Patch::Strategic(&patch))
        .await
        .map_err(Error::KubeError)?;
    Ok(())
}

/// Persist the whole status via the status subresource. Serializing every
/// field means the merge patch also clears fields set back to empty.
async fn patch_status(
    client: &Client,
    snapshot: &SnapShot,
    namespace: &str,
    status: &SnapShotStatus,
) -> Result<()> {
    let api: Api<SnapShot> = Api::namespaced(client.clone(), namespace);
    let patch = serde_json::json!({ "status": status });
    api.patch_status(
        &snapshot.name_any(),
        &PatchParams::apply(FIELD_MANAGER),
        &Patch::Merge(&patch),
    )
    .await
    .map_err(Error::KubeError)?;
    Ok(())
}

/// Error policy determines how to handle reconciliation errors
fn error_policy(snapshot: Arc<SnapShot>, error: &Error, _ctx: Arc<ControllerState>) -> Action {
    error!("Reconciliation error for {}: {error:?}", snapshot.name_any());

    let retry_duration = if error.is_retriable() {
        Duration::from_secs(15)
    } else {
        Duration::from_secs(60)
    };

    Action::requeue(retry_duration)
}

#[cfg(test)]
mod tests {
    use k8s_openapi::api::core::v1::{
        Container, NodeAddress, NodeDaemonEndpoints, NodeStatus, PodCondition, PodSpec, PodStatus,
        DaemonEndpoint,
    };

    use super::*;

    fn status_with(
        stage: Option<SnapShotStage>,
        state: SnapShotState,
        node: bool,
        path: &str,
        job: &str,
    ) -> SnapShotStatus {
        SnapShotStatus {
            stage,
            state,
            node: node.then(|| SnapShotNode {
                name: "n1".to_string(),
                addr: "10.0.0.2".to_string(),
                daemonset_port: DAEMONSET_PORT,
                kubelet_port: 10250,
            }),
            checkpoint_node_path: path.to_string(),
            job_id: job.to_string(),
            output_reference_is_valid: false,
        }
    }

    // ── step selection ────────────────────────────────────────────────────────

    #[test]
    fn fresh_status_enters_the_machine() {
        assert_eq!(
            machine_step(&SnapShotStatus::default()),
            MachineStep::Enter
        );
    }

    #[test]
    fn stage_set_without_node_binds_the_node() {
        let status = status_with(
            Some(SnapShotStage::CriuDumping),
            SnapShotState::Started,
            false,
            "",
            "",
        );
        assert_eq!(machine_step(&status), MachineStep::BindNode);
    }

    #[test]
    fn bound_node_without_archive_checkpoints() {
        let status = status_with(
            Some(SnapShotStage::CriuDumping),
            SnapShotState::Started,
            true,
            "",
            "",
        );
        assert_eq!(machine_step(&status), MachineStep::Checkpoint);
    }

    #[test]
    fn archive_without_job_creates_the_job() {
        let status = status_with(
            Some(SnapShotStage::CriuDumping),
            SnapShotState::Started,
            true,
            "/var/lib/kubelet/checkpoints/c.tar",
            "",
        );
        assert_eq!(machine_step(&status), MachineStep::CreateJob);
    }

    #[test]
    fn in_flight_job_is_polled() {
        for (stage, state) in [
            (SnapShotStage::CriuDumping, SnapShotState::Started),
            (SnapShotStage::Formatting, SnapShotState::Started),
            (SnapShotStage::Pushing, SnapShotState::Started),
        ] {
            let status = status_with(
                Some(stage),
                state,
                true,
                "/var/lib/kubelet/checkpoints/c.tar",
                "job-1",
            );
            assert_eq!(machine_step(&status), MachineStep::PollJob);
        }
    }

    #[test]
    fn pushed_job_goes_to_final_verify() {
        let status = status_with(
            Some(SnapShotStage::Pushing),
            SnapShotState::Success,
            true,
            "/var/lib/kubelet/checkpoints/c.tar",
            "job-1",
        );
        assert_eq!(machine_step(&status), MachineStep::FinalVerify);
    }

    /// Clearing a lost job id must send the machine back to job creation
    /// without revisiting node binding or the checkpoint.
    #[test]
    fn cleared_job_id_recreates_the_job_only() {
        let status = status_with(
            Some(SnapShotStage::Formatting),
            SnapShotState::Started,
            true,
            "/var/lib/kubelet/checkpoints/c.tar",
            "",
        );
        assert_eq!(machine_step(&status), MachineStep::CreateJob);
    }

    /// Write-once fields: once populated, no step that would rewrite them is
    /// ever selected again.
    #[test]
    fn populated_fields_are_never_rewritten() {
        let statuses = [
            status_with(
                Some(SnapShotStage::Formatting),
                SnapShotState::Started,
                true,
                "/c.tar",
                "job-1",
            ),
            status_with(
                Some(SnapShotStage::Pushing),
                SnapShotState::Success,
                true,
                "/c.tar",
                "job-1",
            ),
        ];
        for status in &statuses {
            let step = machine_step(status);
            assert_ne!(step, MachineStep::Enter);
            assert_ne!(step, MachineStep::BindNode);
            assert_ne!(step, MachineStep::Checkpoint);
        }
    }

    // ── pod and node helpers ─────────────────────────────────────────────────

    fn pod_with(containers: Vec<Container>, conditions: Option<Vec<PodCondition>>) -> Pod {
        Pod {
            spec: Some(PodSpec {
                containers,
                node_name: Some("n1".to_string()),
                ..Default::default()
            }),
            status: Some(PodStatus {
                conditions,
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn container(name: &str, image: &str) -> Container {
        Container {
            name: name.to_string(),
            image: Some(image.to_string()),
            ..Default::default()
        }
    }

    #[test]
    fn container_image_finds_the_named_container() {
        let pod = pod_with(
            vec![container("sidecar", "envoy:v1"), container("app", "nginx:1.27")],
            None,
        );
        assert_eq!(container_image(&pod, "app"), Some("nginx:1.27"));
        assert_eq!(container_image(&pod, "missing"), None);
    }

    #[test]
    fn pod_readiness_requires_a_true_ready_condition() {
        let ready = pod_with(
            vec![container("app", "nginx:1.27")],
            Some(vec![PodCondition {
                type_: "Ready".to_string(),
                status: "True".to_string(),
                ..Default::default()
            }]),
        );
        assert!(pod_is_ready(&ready));

        let not_ready = pod_with(
            vec![container("app", "nginx:1.27")],
            Some(vec![PodCondition {
                type_: "Ready".to_string(),
                status: "False".to_string(),
                ..Default::default()
            }]),
        );
        assert!(!pod_is_ready(&not_ready));

        let no_conditions = pod_with(vec![container("app", "nginx:1.27")], None);
        assert!(!pod_is_ready(&no_conditions));
    }

    #[test]
    fn internal_ip_is_extracted_from_node_addresses() {
        let node = Node {
            status: Some(NodeStatus {
                addresses: Some(vec![
                    NodeAddress {
                        type_: "Hostname".to_string(),
                        address: "n1".to_string(),
                    },
                    NodeAddress {
                        type_: "InternalIP".to_string(),
                        address: "10.0.0.2".to_string(),
                    },
                ]),
                daemon_endpoints: Some(NodeDaemonEndpoints {
                    kubelet_endpoint: Some(DaemonEndpoint { port: 10250 }),
                }),
                ..Default::default()
            }),
            ..Default::default()
        };
        assert_eq!(node_internal_ip(&node), Some("10.0.0.2".to_string()));

        let bare = Node::default();
        assert_eq!(node_internal_ip(&bare), None);
    }
}
