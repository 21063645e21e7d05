//! Custom Resource Definitions for Stove8s
//!
//! A single CRD, SnapShot, describes a desired container snapshot: which
//! pod/container to checkpoint and where to push the resulting image.

mod snapshot;

#[cfg(test)]
mod tests;

pub use snapshot::{
    KindReference, ObjectReference, SnapShot, SnapShotInput, SnapShotInputPolicy, SnapShotNode,
    SnapShotOutput, SnapShotOutputContainerRegistry, SnapShotSelector, SnapShotSpec,
    SnapShotStage, SnapShotState, SnapShotStatus,
};
