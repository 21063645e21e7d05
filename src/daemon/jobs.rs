//! In-memory job store and the build+push job lifecycle.
//!
//! The daemon is stateless across restarts: every job lives only in process
//! memory. When the daemon dies mid-job the controller observes an unknown
//! job id on its next poll and creates a replacement job; the checkpoint
//! archive on the node's disk survives and is reused.

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Secret;
use kube::{Api, Client};
use tracing::{error, info, instrument};
use uuid::Uuid;

use crate::crd::{SnapShotStage, SnapShotState};
use crate::daemon::api::{CreateJobRequest, JobStatus};
use crate::error::{Error, Result};
use crate::oci::CheckpointImage;
use crate::registry::{self, RegistryClient};

/// Shared map of job id to status.
///
/// A job's entry is only ever written by its own task, and stages advance
/// monotonically, so concurrent readers at worst see a slightly stale view.
#[derive(Clone, Default)]
pub struct JobStore {
    jobs: Arc<RwLock<HashMap<Uuid, JobStatus>>>,
}

impl JobStore {
    pub fn insert(&self, id: Uuid, status: JobStatus) {
        self.jobs.write().unwrap_or_else(|e| e.into_inner()).insert(id, status);
    }

    pub fn update(&self, id: Uuid, stage: SnapShotStage, state: SnapShotState) {
        self.jobs
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id, JobStatus::new(stage, state));
    }

    pub fn get(&self, id: &Uuid) -> Option<JobStatus> {
        self.jobs
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(id)
            .copied()
    }

    /// Snapshot of all jobs, ordered by id for a stable listing.
    pub fn list(&self) -> BTreeMap<Uuid, JobStatus> {
        self.jobs
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .map(|(id, status)| (*id, *status))
            .collect()
    }
}

/// External effects of a job, separated so the lifecycle is testable without
/// a cluster or a registry.
#[async_trait]
pub trait JobExecutor: Send + Sync {
    /// Package the checkpoint archive as an OCI image.
    async fn build(&self, checkpoint_dump_path: &str) -> Result<CheckpointImage>;

    /// Fetch the image-push secret from the cluster.
    async fn fetch_push_secret(&self, namespace: &str, name: &str) -> Result<Secret>;

    /// Upload the image to the registry named by `image_reference`.
    async fn push(&self, image_reference: &str, image: CheckpointImage, secret: &Secret)
        -> Result<()>;
}

/// Production executor: builds on this node's filesystem, reads secrets via
/// the in-cluster client, pushes with the distribution client.
pub struct ClusterJobExecutor {
    client: Client,
    registry: RegistryClient,
}

impl ClusterJobExecutor {
    pub fn new(client: Client) -> Self {
        Self {
            client,
            registry: RegistryClient::new(),
        }
    }
}

#[async_trait]
impl JobExecutor for ClusterJobExecutor {
    async fn build(&self, checkpoint_dump_path: &str) -> Result<CheckpointImage> {
        let path = PathBuf::from(checkpoint_dump_path);
        // Tar reading and digesting are blocking work.
        tokio::task::spawn_blocking(move || crate::oci::build_image(&path))
            .await
            .map_err(|e| Error::WorkerError(format!("build task failed: {e}")))?
    }

    async fn fetch_push_secret(&self, namespace: &str, name: &str) -> Result<Secret> {
        let secrets: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        secrets.get(name).await.map_err(Error::KubeError)
    }

    async fn push(
        &self,
        image_reference: &str,
        image: CheckpointImage,
        secret: &Secret,
    ) -> Result<()> {
        let reference = registry::parse_reference(image_reference)?;
        let credentials = registry::credentials_from_secret(secret, reference.registry())?;
        self.registry.push(image_reference, image, &credentials).await
    }
}

/// Drive one job to a terminal state.
///
/// Stages advance strictly forward; Failed is terminal. The controller
/// retries by creating a new job, never by re-driving this one.
#[instrument(skip(store, executor, request), fields(job_id = %id))]
pub async fn run_job(
    store: JobStore,
    executor: Arc<dyn JobExecutor>,
    id: Uuid,
    request: CreateJobRequest,
) {
    let image = match executor.build(&request.checkpoint_dump_path).await {
        Ok(image) => image,
        Err(err) => {
            error!(%err, "building oci image");
            store.update(id, SnapShotStage::Formatting, SnapShotState::Failed);
            return;
        }
    };

    store.update(id, SnapShotStage::Pushing, SnapShotState::Started);

    let secret = match executor
        .fetch_push_secret(
            &request.image_push_secret.namespace,
            &request.image_push_secret.name,
        )
        .await
    {
        Ok(secret) => secret,
        Err(err) => {
            error!(%err, "getting image push secret");
            store.update(id, SnapShotStage::Pushing, SnapShotState::Failed);
            return;
        }
    };

    if let Err(err) = executor
        .push(&request.image_reference, image, &secret)
        .await
    {
        error!(%err, "pushing to registry");
        store.update(id, SnapShotStage::Pushing, SnapShotState::Failed);
        return;
    }

    store.update(id, SnapShotStage::Pushing, SnapShotState::Success);
    info!(image = %request.image_reference, "checkpoint image pushed");
}
