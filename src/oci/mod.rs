//! OCI image construction from kubelet checkpoint archives.

mod annotations;
mod builder;

pub use annotations::*;
pub use builder::{build_image, CheckpointImage, ContainerDumpConfig};
