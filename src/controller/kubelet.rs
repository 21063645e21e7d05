//! Kubelet checkpoint API client.
//!
//! The checkpoint call goes straight to the kubelet's HTTPS endpoint on the
//! target node, authenticated with the controller pod's service-account
//! bearer token and trusting exactly the service-account CA bundle. The
//! `nodes/checkpoint` RBAC verb authorises it.

use serde::Deserialize;
use tracing::debug;

use crate::error::{Error, Result};

const POD_CA_CERT_PATH: &str = "/var/run/secrets/kubernetes.io/serviceaccount/ca.crt";
const POD_TOKEN_PATH: &str = "/var/run/secrets/kubernetes.io/serviceaccount/token";

#[derive(Debug, Deserialize)]
pub struct CheckpointResponse {
    pub items: Vec<String>,
}

pub struct KubeletClient {
    http: reqwest::Client,
    token: String,
}

impl KubeletClient {
    /// Build the client from the controller pod's mounted service account.
    /// Reads the CA bundle and token once at startup.
    pub fn from_service_account() -> Result<Self> {
        let ca = std::fs::read(POD_CA_CERT_PATH)?;
        let token = std::fs::read_to_string(POD_TOKEN_PATH)?.trim().to_string();

        let certificate = reqwest::Certificate::from_pem(&ca)?;
        let http = reqwest::Client::builder()
            .use_rustls_tls()
            .tls_built_in_root_certs(false)
            .add_root_certificate(certificate)
            .build()?;

        Ok(Self { http, token })
    }

    /// For tests and out-of-cluster runs.
    pub fn with_client(http: reqwest::Client, token: impl Into<String>) -> Self {
        Self {
            http,
            token: token.into(),
        }
    }

    /// Ask the kubelet on `addr` to checkpoint one container. Returns the
    /// node-local path of the archive it wrote.
    pub async fn checkpoint(
        &self,
        addr: &str,
        port: u16,
        namespace: &str,
        pod: &str,
        container: &str,
    ) -> Result<String> {
        let url = checkpoint_url(addr, port, namespace, pod, container);
        debug!(%url, "requesting kubelet checkpoint");

        let response = self
            .http
            .post(&url)
            .bearer_auth(&self.token)
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Error::CheckpointError(format!(
                "kubelet returned {status}: {body}"
            )));
        }

        let body: CheckpointResponse = response.json().await?;
        single_checkpoint_path(body)
    }
}

pub(crate) fn checkpoint_url(
    addr: &str,
    port: u16,
    namespace: &str,
    pod: &str,
    container: &str,
) -> String {
    format!("https://{addr}:{port}/checkpoint/{namespace}/{pod}/{container}")
}

/// The kubelet reports the archives it wrote; exactly one is expected for a
/// single-container checkpoint.
pub(crate) fn single_checkpoint_path(response: CheckpointResponse) -> Result<String> {
    let mut items = response.items;
    if items.len() != 1 {
        return Err(Error::CheckpointError(format!(
            "expected exactly one checkpoint item, kubelet returned {}",
            items.len()
        )));
    }
    Ok(items.remove(0))
}
