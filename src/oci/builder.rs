//! Build an OCI image from a kubelet checkpoint archive.
//!
//! The kubelet packages a CRIU dump as an uncompressed tar. Two small JSON
//! manifests inside it describe the checkpointed container: `spec.dump` (the
//! OCI runtime spec, carrying the CRI annotations) and `config.dump` (the
//! high-level runtime's container metadata). The builder reads both, rejects
//! dumps from unsupported runtimes, and wraps the whole archive as the single
//! layer of an image whose annotations a checkpoint-aware runtime recognises.

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::Path;

use chrono::{DateTime, SecondsFormat, Utc};
use oci_client::client::{Config, ImageLayer};
use oci_client::manifest::OciImageManifest;
use oci_spec::runtime::Spec;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{Error, Result};
use crate::oci::annotations::*;

const SPEC_DUMP_FILE: &str = "spec.dump";
const CONFIG_DUMP_FILE: &str = "config.dump";

/// Set by podman and cri-o; containerd leaves it out. Only containerd dumps
/// are supported.
const CONTAINER_MANAGER_ANNOTATION: &str = "io.container.manager";

/// Container metadata written by the high-level runtime into `config.dump`.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ContainerDumpConfig {
    pub id: String,
    pub name: String,
    pub rootfs_image: String,
    pub rootfs_image_ref: String,
    pub rootfs_image_name: String,
    #[serde(rename = "runtime")]
    pub oci_runtime: String,
    pub checkpointed_time: Option<DateTime<Utc>>,
}

/// An in-memory OCI image ready to be pushed: one layer (the checkpoint
/// archive), a config blob, and the checkpoint annotations for the manifest.
pub struct CheckpointImage {
    pub config: Config,
    pub layers: Vec<ImageLayer>,
    pub annotations: BTreeMap<String, String>,
}

impl std::fmt::Debug for CheckpointImage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CheckpointImage")
            .field("config_media_type", &self.config.media_type)
            .field("layers", &self.layers.len())
            .field("annotations", &self.annotations)
            .finish()
    }
}

impl CheckpointImage {
    /// Manifest with the checkpoint annotations attached.
    pub fn manifest(&self) -> OciImageManifest {
        OciImageManifest::build(&self.layers, &self.config, Some(self.annotations.clone()))
    }
}

#[derive(Serialize)]
struct ImageConfigFile {
    architecture: &'static str,
    os: &'static str,
    config: ImageRunConfig,
    rootfs: RootFs,
    history: Vec<HistoryEntry>,
}

#[derive(Serialize)]
struct ImageRunConfig {
    #[serde(rename = "WorkingDir")]
    working_dir: &'static str,
    #[serde(rename = "Labels")]
    labels: BTreeMap<String, String>,
}

#[derive(Serialize)]
struct RootFs {
    #[serde(rename = "type")]
    fs_type: &'static str,
    diff_ids: Vec<String>,
}

#[derive(Serialize)]
struct HistoryEntry {
    #[serde(skip_serializing_if = "Option::is_none")]
    created: Option<String>,
    created_by: &'static str,
}

/// Build the checkpoint image for the archive at `path`.
///
/// Pure with respect to the archive contents: the same tar always yields the
/// same config bytes and layer digest, so the manifest digest is stable.
pub fn build_image(path: &Path) -> Result<CheckpointImage> {
    let archive = fs::read(path)?;
    let (spec, dump_config) = inspect_dump(&archive)?;
    let annotations = annotations_from_dump(&spec, &dump_config)?;

    let diff_id = format!("sha256:{}", hex::encode(Sha256::digest(&archive)));
    let config_file = ImageConfigFile {
        architecture: oci_arch(),
        os: std::env::consts::OS,
        config: ImageRunConfig {
            working_dir: "/",
            labels: BTreeMap::from([(
                "studio.bud.stove8s.version".to_string(),
                crate::VERSION.to_string(),
            )]),
        },
        rootfs: RootFs {
            fs_type: "layers",
            diff_ids: vec![diff_id],
        },
        history: vec![HistoryEntry {
            created: dump_config
                .checkpointed_time
                .map(|t| t.to_rfc3339_opts(SecondsFormat::Nanos, true)),
            created_by: "stove8s",
        }],
    };

    Ok(CheckpointImage {
        config: Config::oci_v1(serde_json::to_vec(&config_file)?, None),
        layers: vec![ImageLayer::oci_v1(archive, None)],
        annotations,
    })
}

fn annotations_from_dump(
    spec: &Spec,
    dump_config: &ContainerDumpConfig,
) -> Result<BTreeMap<String, String>> {
    if let Some(manager) = spec_annotation(spec, CONTAINER_MANAGER_ANNOTATION) {
        return Err(Error::UnsupportedRuntimeError(manager));
    }

    let mut annotations = BTreeMap::new();
    annotations.insert(
        CHECKPOINT_ANNOTATION_ENGINE.to_string(),
        "containerd".to_string(),
    );
    annotations.insert(
        CHECKPOINT_ANNOTATION_NAME.to_string(),
        spec_annotation(spec, "io.kubernetes.cri.container-name").unwrap_or_default(),
    );
    annotations.insert(
        CHECKPOINT_ANNOTATION_POD.to_string(),
        spec_annotation(spec, "io.kubernetes.cri.sandbox-name").unwrap_or_default(),
    );
    annotations.insert(
        CHECKPOINT_ANNOTATION_NAMESPACE.to_string(),
        spec_annotation(spec, "io.kubernetes.cri.sandbox-namespace").unwrap_or_default(),
    );
    annotations.insert(
        CHECKPOINT_ANNOTATION_ROOTFS_IMAGE.to_string(),
        dump_config.rootfs_image.clone(),
    );
    annotations.insert(
        CHECKPOINT_ANNOTATION_ROOTFS_IMAGE_NAME.to_string(),
        dump_config.rootfs_image_name.clone(),
    );
    annotations.insert(
        CHECKPOINT_ANNOTATION_ROOTFS_IMAGE_ID.to_string(),
        dump_config.rootfs_image_ref.clone(),
    );
    annotations.insert(
        CHECKPOINT_ANNOTATION_RUNTIME.to_string(),
        dump_config.oci_runtime.clone(),
    );

    Ok(annotations)
}

fn spec_annotation(spec: &Spec, key: &str) -> Option<String> {
    spec.annotations()
        .as_ref()
        .and_then(|annotations| annotations.get(key))
        .cloned()
}

fn inspect_dump(archive: &[u8]) -> Result<(Spec, ContainerDumpConfig)> {
    let raw = tar_files_read(&[SPEC_DUMP_FILE, CONFIG_DUMP_FILE], archive)?;
    let spec: Spec = serde_json::from_slice(&raw[SPEC_DUMP_FILE])?;
    let dump_config: ContainerDumpConfig = serde_json::from_slice(&raw[CONFIG_DUMP_FILE])?;
    Ok((spec, dump_config))
}

/// Single-pass extraction of a fixed set of regular files from a tar.
fn tar_files_read(files: &[&str], archive: &[u8]) -> Result<HashMap<String, Vec<u8>>> {
    let mut found: HashMap<String, Vec<u8>> = HashMap::new();
    let mut tar = tar::Archive::new(archive);

    for entry in tar
        .entries()
        .map_err(|e| Error::CheckpointArchiveError(e.to_string()))?
    {
        let mut entry = entry.map_err(|e| Error::CheckpointArchiveError(e.to_string()))?;
        if !entry.header().entry_type().is_file() {
            continue;
        }
        let path = entry
            .path()
            .map_err(|e| Error::CheckpointArchiveError(e.to_string()))?;
        let name = path.to_string_lossy().trim_start_matches("./").to_string();
        if !files.contains(&name.as_str()) {
            continue;
        }
        let mut data = Vec::with_capacity(entry.size() as usize);
        std::io::Read::read_to_end(&mut entry, &mut data)?;
        found.insert(name, data);
    }

    for file in files {
        if !found.contains_key(*file) {
            return Err(Error::CheckpointArchiveError(format!(
                "can't extract file {file}"
            )));
        }
    }

    Ok(found)
}

/// Architecture of the running process in OCI (GOARCH) spelling.
fn oci_arch() -> &'static str {
    match std::env::consts::ARCH {
        "x86_64" => "amd64",
        "aarch64" => "arm64",
        "x86" => "386",
        "powerpc64" => "ppc64le",
        other => other,
    }
}
