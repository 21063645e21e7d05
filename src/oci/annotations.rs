//! Checkpoint image annotation keys.
//!
//! These names are the public contract between stove8s and checkpoint-aware
//! container runtimes: a runtime that recognises them restores the container
//! from the image's layer instead of booting the rootfs image.

pub const CHECKPOINT_ANNOTATION_ENGINE: &str =
    "io.kubernetes.cri-o.annotations.checkpoint.engine";
pub const CHECKPOINT_ANNOTATION_NAME: &str = "io.kubernetes.cri-o.annotations.checkpoint.name";
pub const CHECKPOINT_ANNOTATION_POD: &str = "io.kubernetes.cri-o.annotations.checkpoint.pod";
pub const CHECKPOINT_ANNOTATION_NAMESPACE: &str =
    "io.kubernetes.cri-o.annotations.checkpoint.namespace";
pub const CHECKPOINT_ANNOTATION_ROOTFS_IMAGE: &str =
    "io.kubernetes.cri-o.annotations.checkpoint.rootfsImage";
pub const CHECKPOINT_ANNOTATION_ROOTFS_IMAGE_NAME: &str =
    "io.kubernetes.cri-o.annotations.checkpoint.rootfsImageName";
pub const CHECKPOINT_ANNOTATION_ROOTFS_IMAGE_ID: &str =
    "io.kubernetes.cri-o.annotations.checkpoint.rootfsImageID";
pub const CHECKPOINT_ANNOTATION_RUNTIME: &str =
    "io.kubernetes.cri-o.annotations.checkpoint.runtime";
