//! HTTP client for the per-node daemon's job API.

use tracing::debug;

use crate::daemon::api::{CreateJobRequest, CreateJobResponse, JobStatus};
use crate::error::{Error, Result};

#[derive(Clone, Default)]
pub struct WorkerClient {
    http: reqwest::Client,
}

impl WorkerClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// `POST /oci`: start a build+push job on the node at `addr`.
    pub async fn create_job(
        &self,
        addr: &str,
        port: u16,
        request: &CreateJobRequest,
    ) -> Result<String> {
        let url = format!("http://{addr}:{port}/oci");
        debug!(%url, image = %request.image_reference, "creating worker job");

        let response = self.http.post(&url).json(request).send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Error::WorkerError(format!(
                "job create returned {status}: {body}"
            )));
        }

        let body: CreateJobResponse = response.json().await?;
        Ok(body.job_id)
    }

    /// `GET /oci/{id}`: poll one job. `None` means the worker does not know
    /// the id, which after a daemon restart is how lost jobs surface.
    pub async fn job_status(&self, addr: &str, port: u16, id: &str) -> Result<Option<JobStatus>> {
        let url = format!("http://{addr}:{port}/oci/{id}");

        let response = self.http.get(&url).send().await?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Error::WorkerError(format!(
                "job poll returned {status}: {body}"
            )));
        }

        Ok(Some(response.json().await?))
    }
}

#[cfg(test)]
mod tests {
    use wiremock::matchers::{body_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;
    use crate::crd::{SnapShotStage, SnapShotState};
    use crate::daemon::api::ImagePushSecretRef;

    fn request() -> CreateJobRequest {
        CreateJobRequest {
            checkpoint_dump_path: "/var/lib/kubelet/checkpoints/dump.tar".to_string(),
            image_push_secret: ImagePushSecretRef {
                name: "push-creds".to_string(),
                namespace: "team-a".to_string(),
            },
            image_reference: "reg.example.com/demo/app:snap-1".to_string(),
        }
    }

    async fn server_addr(server: &MockServer) -> (String, u16) {
        let addr = server.address();
        (addr.ip().to_string(), addr.port())
    }

    #[tokio::test]
    async fn create_job_returns_the_assigned_id() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/oci"))
            .and(body_json(request()))
            .respond_with(ResponseTemplate::new(201).set_body_json(serde_json::json!({
                "job_id": "0190163d-8694-7f9c-a2e5-0a3f4c1f9a42"
            })))
            .mount(&server)
            .await;

        let (addr, port) = server_addr(&server).await;
        let id = WorkerClient::new()
            .create_job(&addr, port, &request())
            .await
            .unwrap();
        assert_eq!(id, "0190163d-8694-7f9c-a2e5-0a3f4c1f9a42");
    }

    #[tokio::test]
    async fn create_job_surfaces_rejections() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/oci"))
            .respond_with(ResponseTemplate::new(400).set_body_string("bad request"))
            .mount(&server)
            .await;

        let (addr, port) = server_addr(&server).await;
        let result = WorkerClient::new().create_job(&addr, port, &request()).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn job_status_mirrors_the_worker_view() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/oci/abc"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "stage": "Pushing",
                "state": "Started"
            })))
            .mount(&server)
            .await;

        let (addr, port) = server_addr(&server).await;
        let status = WorkerClient::new()
            .job_status(&addr, port, "abc")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(status.stage, SnapShotStage::Pushing);
        assert_eq!(status.state, SnapShotState::Started);
    }

    #[tokio::test]
    async fn unknown_job_is_none() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/oci/abc"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let (addr, port) = server_addr(&server).await;
        let status = WorkerClient::new().job_status(&addr, port, "abc").await.unwrap();
        assert!(status.is_none());
    }

    #[tokio::test]
    async fn worker_errors_propagate() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/oci/abc"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let (addr, port) = server_addr(&server).await;
        assert!(WorkerClient::new().job_status(&addr, port, "abc").await.is_err());
    }
}
