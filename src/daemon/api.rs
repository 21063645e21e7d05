//! Wire types of the daemon's HTTP API.
//!
//! Shared with the controller's worker client so both sides of the protocol
//! are defined once.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::crd::{SnapShotStage, SnapShotState};

/// Secret holding push credentials, resolved by the daemon in-cluster.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct ImagePushSecretRef {
    pub name: String,
    pub namespace: String,
}

/// Body of `POST /oci`: build the archive at `checkpoint_dump_path` into an
/// image and push it to `image_reference`.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct CreateJobRequest {
    /// Absolute path of the checkpoint archive on this node's filesystem.
    pub checkpoint_dump_path: String,
    pub image_push_secret: ImagePushSecretRef,
    pub image_reference: String,
}

impl CreateJobRequest {
    /// Field-level validation, mirrored into a 400 response.
    pub fn validate(&self) -> Result<(), String> {
        if self.checkpoint_dump_path.is_empty() {
            return Err("checkpoint_dump_path is required".to_string());
        }
        if !std::path::Path::new(&self.checkpoint_dump_path).is_absolute() {
            return Err("checkpoint_dump_path must be an absolute filepath".to_string());
        }
        if self.image_push_secret.name.is_empty() {
            return Err("image_push_secret.name is required".to_string());
        }
        if self.image_push_secret.namespace.is_empty() {
            return Err("image_push_secret.namespace is required".to_string());
        }
        if self.image_reference.is_empty() {
            return Err("image_reference is required".to_string());
        }
        Ok(())
    }
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct CreateJobResponse {
    pub job_id: String,
}

/// Progress of one build+push job; also the `GET /oci/{id}` response body.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct JobStatus {
    pub stage: SnapShotStage,
    pub state: SnapShotState,
}

impl JobStatus {
    pub fn new(stage: SnapShotStage, state: SnapShotState) -> Self {
        Self { stage, state }
    }
}

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct JobListResponse {
    pub jobs: BTreeMap<Uuid, JobStatus>,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub message: String,
}

impl ErrorResponse {
    pub fn new(error: &str, message: &str) -> Self {
        Self {
            error: error.to_string(),
            message: message.to_string(),
        }
    }
}
