//! Container registry access: push-secret decoding, manifest existence
//! checks, and image upload.
//!
//! Credentials come from a cluster secret of type
//! `kubernetes.io/dockerconfigjson`, the same material a pod would use as an
//! image-*pull* secret; stove8s reuses it for pushing.

use std::collections::HashMap;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use k8s_openapi::api::core::v1::Secret;
use oci_client::client::ClientConfig;
use oci_client::secrets::RegistryAuth;
use oci_client::{ParseError, Reference};
use serde::Deserialize;
use tracing::debug;

use crate::error::{Error, Result};
use crate::oci::CheckpointImage;

pub const DOCKER_CONFIG_SECRET_TYPE: &str = "kubernetes.io/dockerconfigjson";
pub const DOCKER_CONFIG_JSON_KEY: &str = ".dockerconfigjson";

/// Hosts that all name Docker Hub in docker-config documents.
const DOCKER_HUB_ALIASES: [&str; 4] = [
    "docker.io",
    "index.docker.io",
    "registry-1.docker.io",
    "registry.hub.docker.com",
];

/// Decoded per-registry credential material.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
    pub identity_token: String,
    pub registry_token: String,
}

impl Credentials {
    pub fn is_anonymous(&self) -> bool {
        self == &Credentials::default()
    }

    /// Map to the wire auth scheme: explicit tokens win over basic auth.
    pub fn to_registry_auth(&self) -> RegistryAuth {
        if !self.registry_token.is_empty() {
            RegistryAuth::Bearer(self.registry_token.clone())
        } else if !self.identity_token.is_empty() {
            RegistryAuth::Bearer(self.identity_token.clone())
        } else if !self.username.is_empty() || !self.password.is_empty() {
            RegistryAuth::Basic(self.username.clone(), self.password.clone())
        } else {
            RegistryAuth::Anonymous
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct DockerConfigFile {
    #[serde(default)]
    auths: HashMap<String, DockerAuthEntry>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct DockerAuthEntry {
    username: String,
    password: String,
    /// base64 of `user:password`, used when the explicit fields are empty.
    auth: String,
    identitytoken: String,
    registrytoken: String,
}

/// Extract the credentials for `registry` from an image-push secret.
///
/// The secret must be of type `kubernetes.io/dockerconfigjson`. A registry
/// without an entry in the document yields anonymous credentials, matching
/// docker's own config lookup.
pub fn credentials_from_secret(secret: &Secret, registry: &str) -> Result<Credentials> {
    if secret.type_.as_deref() != Some(DOCKER_CONFIG_SECRET_TYPE) {
        return Err(Error::CredentialError(format!(
            "secret is not of type {DOCKER_CONFIG_SECRET_TYPE}"
        )));
    }

    let data = secret
        .data
        .as_ref()
        .and_then(|data| data.get(DOCKER_CONFIG_JSON_KEY))
        .ok_or_else(|| {
            Error::CredentialError(format!("secret missing {DOCKER_CONFIG_JSON_KEY} field"))
        })?;

    let config: DockerConfigFile = serde_json::from_slice(&data.0)
        .map_err(|e| Error::CredentialError(format!("parsing docker config: {e}")))?;

    Ok(lookup_auth(&config, registry))
}

/// Find the auth entry whose key names `registry`, tolerating the scheme
/// prefixes and `/v1/` suffixes legacy docker configs carry, and treating the
/// Docker Hub host aliases as one registry.
fn lookup_auth(config: &DockerConfigFile, registry: &str) -> Credentials {
    let wanted = normalize_registry_host(registry);

    for (key, entry) in &config.auths {
        if normalize_registry_host(key) != wanted {
            continue;
        }

        let mut credentials = Credentials {
            username: entry.username.clone(),
            password: entry.password.clone(),
            identity_token: entry.identitytoken.clone(),
            registry_token: entry.registrytoken.clone(),
        };
        if credentials.username.is_empty() && credentials.password.is_empty() {
            if let Some((username, password)) = decode_auth_field(&entry.auth) {
                credentials.username = username;
                credentials.password = password;
            }
        }
        return credentials;
    }

    debug!(registry, "no docker-config entry, using anonymous auth");
    Credentials::default()
}

fn normalize_registry_host(host: &str) -> String {
    let host = host
        .trim_start_matches("https://")
        .trim_start_matches("http://");
    let host = host.split('/').next().unwrap_or(host);
    if DOCKER_HUB_ALIASES.contains(&host) {
        return "docker.io".to_string();
    }
    host.to_string()
}

fn decode_auth_field(auth: &str) -> Option<(String, String)> {
    if auth.is_empty() {
        return None;
    }
    let decoded = BASE64.decode(auth).ok()?;
    let decoded = String::from_utf8(decoded).ok()?;
    let (username, password) = decoded.split_once(':')?;
    Some((username.to_string(), password.to_string()))
}

/// Registry client over the OCI distribution protocol.
pub struct RegistryClient {
    client: oci_client::Client,
}

impl Default for RegistryClient {
    fn default() -> Self {
        Self::new()
    }
}

impl RegistryClient {
    pub fn new() -> Self {
        Self::with_config(ClientConfig::default())
    }

    /// Used by tests to talk plain HTTP to a local mock registry.
    pub fn with_config(config: ClientConfig) -> Self {
        Self {
            client: oci_client::Client::new(config),
        }
    }

    /// Whether the manifest named by `reference` exists in its registry.
    ///
    /// A 404 (registries encode it variously: a status code, "not found", or
    /// a MANIFEST_UNKNOWN error body) means "absent" and returns false. Any
    /// other failure means "unknown" and propagates.
    pub async fn reference_is_valid(&self, reference: &str, secret: &Secret) -> Result<bool> {
        let reference = parse_reference(reference)?;
        let credentials = credentials_from_secret(secret, reference.registry())?;

        match self
            .client
            .fetch_manifest_digest(&reference, &credentials.to_registry_auth())
            .await
        {
            Ok(_) => Ok(true),
            Err(err) => {
                let message = err.to_string();
                let lower = message.to_lowercase();
                if lower.contains("not found")
                    || lower.contains("404")
                    || lower.contains("manifest unknown")
                {
                    Ok(false)
                } else {
                    Err(Error::RegistryError(message))
                }
            }
        }
    }

    /// Upload the image's layer, config, and annotated manifest.
    pub async fn push(
        &self,
        reference: &str,
        image: CheckpointImage,
        credentials: &Credentials,
    ) -> Result<()> {
        let reference = parse_reference(reference)?;
        let manifest = image.manifest();
        let CheckpointImage { config, layers, .. } = image;

        self.client
            .push(
                &reference,
                &layers,
                config,
                &credentials.to_registry_auth(),
                Some(manifest),
            )
            .await
            .map_err(|e| Error::RegistryError(e.to_string()))?;

        Ok(())
    }
}

/// Parse `registry/repository:tag` into a [`Reference`].
pub fn parse_reference(reference: &str) -> Result<Reference> {
    reference
        .parse()
        .map_err(|e: ParseError| Error::InvalidReferenceError(format!("{reference}: {e}")))
}
