//! SnapShot Custom Resource Definition
//!
//! A SnapShot targets one container inside one pod and names the registry
//! reference the checkpoint image is pushed to. All reconciliation progress
//! lives in the status subresource so the state machine survives controller
//! restarts.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Reference to the object owning the container to snapshot.
///
/// Only `kind: Pod` is supported; workload controllers (Deployment, Job, ...)
/// are rejected by the reconciler.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ObjectReference {
    pub kind: String,
    /// Defaults to the SnapShot's own namespace when empty.
    #[serde(default)]
    pub namespace: Option<String>,
    pub name: String,
}

/// Namespaced reference without a kind (secrets).
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct KindReference {
    #[serde(default)]
    pub namespace: Option<String>,
    pub name: String,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SnapShotSelector {
    pub object: ObjectReference,
    /// Name of the container to checkpoint inside the target pod.
    pub container: String,
}

/// What to do when the target pod already runs the output image.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
pub enum SnapShotInputPolicy {
    /// Skip the snapshot entirely if the pod already runs the output image.
    #[default]
    IfNotPresent,
}

/// Reserved input knobs. `delaySeconds` is accepted but not yet wired to any
/// behaviour; policies other than `IfNotPresent` are unimplemented.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SnapShotInput {
    #[serde(default)]
    pub delay_seconds: i64,
    #[serde(default)]
    pub policy: SnapShotInputPolicy,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SnapShotOutputContainerRegistry {
    /// Full push target, `registry/repository:tag`.
    pub image_reference: String,
    /// Secret of type kubernetes.io/dockerconfigjson holding push
    /// credentials. Namespace defaults to the SnapShot's.
    #[serde(default)]
    pub image_push_secret: KindReference,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SnapShotOutput {
    pub container_registry: SnapShotOutputContainerRegistry,
}

/// SnapShot spec: target container, reserved input knobs, push target.
///
/// `selector` and `output` are immutable once the state machine has started;
/// mutating them mid-flight is not defined.
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "stove8s.bud.studio",
    version = "v1beta1",
    kind = "SnapShot",
    namespaced,
    status = "SnapShotStatus",
    shortname = "snap",
    printcolumn = r#"{"name":"Target","type":"string","jsonPath":".spec.selector.object.name"}"#,
    printcolumn = r#"{"name":"Stage","type":"string","jsonPath":".status.stage"}"#,
    printcolumn = r#"{"name":"State","type":"string","jsonPath":".status.state"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct SnapShotSpec {
    pub selector: SnapShotSelector,
    #[serde(default)]
    pub input: SnapShotInput,
    pub output: SnapShotOutput,
}

/// Where in the checkpoint pipeline a snapshot (or a worker job) is.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
pub enum SnapShotStage {
    /// Waiting on the kubelet to produce the CRIU dump.
    CriuDumping,
    /// The node worker is packaging the dump as an OCI image.
    Formatting,
    /// The node worker is uploading the image to the registry.
    Pushing,
}

impl std::fmt::Display for SnapShotStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SnapShotStage::CriuDumping => write!(f, "CriuDumping"),
            SnapShotStage::Formatting => write!(f, "Formatting"),
            SnapShotStage::Pushing => write!(f, "Pushing"),
        }
    }
}

/// Outcome of the current stage.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
pub enum SnapShotState {
    #[default]
    Idle,
    Started,
    Failed,
    Success,
}

impl std::fmt::Display for SnapShotState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SnapShotState::Idle => write!(f, "Idle"),
            SnapShotState::Started => write!(f, "Started"),
            SnapShotState::Failed => write!(f, "Failed"),
            SnapShotState::Success => write!(f, "Success"),
        }
    }
}

/// Node the snapshot is bound to.
///
/// Written once on first progression and never changed afterwards: the
/// checkpoint archive lives on this node's local disk, so re-binding would
/// orphan `checkpointNodePath`.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase", default)]
pub struct SnapShotNode {
    pub name: String,
    /// InternalIP of the node.
    pub addr: String,
    /// Node port of the stove8s daemon.
    pub daemonset_port: u16,
    /// Port of the kubelet's HTTPS endpoint.
    pub kubelet_port: u16,
}

/// Observed state of a SnapShot.
///
/// Every field is always serialized (no skips), so a merge patch of the whole
/// status overwrites every field. The reconciler relies on that to clear
/// `jobId` when a worker loses a job.
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase", default)]
pub struct SnapShotStatus {
    /// Unset until the state machine has been entered.
    pub stage: Option<SnapShotStage>,
    pub state: SnapShotState,
    /// Bound target node; write-once.
    pub node: Option<SnapShotNode>,
    /// Path of the kubelet-produced checkpoint archive on the bound node's
    /// filesystem; write-once.
    pub checkpoint_node_path: String,
    /// Id of the in-flight worker job, empty when none.
    pub job_id: String,
    /// Terminal success gate: the output reference has been verified present
    /// in the registry. Once true, only the pod image swap may still run.
    pub output_reference_is_valid: bool,
}

impl SnapShot {
    /// The registry reference the snapshot image is pushed to.
    pub fn output_reference(&self) -> &str {
        &self.spec.output.container_registry.image_reference
    }

    /// Current status, defaulted when the subresource has never been written.
    pub fn status_or_default(&self) -> SnapShotStatus {
        self.status.clone().unwrap_or_default()
    }
}
