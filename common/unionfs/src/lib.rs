//! Capabilities for inspecting and driving aufs union mounts.
//!
//! This crate deliberately knows nothing about layers or trees; it only
//! understands the kernel-facing primitives (`UnionFsInspector`,
//! `MountDriver`) that `layerfs` composes into a higher-level orchestrator.

mod driver;
mod inspector;

pub use driver::{DriverCall, DriverError, MountDriver, ProcessMountDriver, RecordingMountDriver};
pub use inspector::{AufsBranch, Permission, SysfsInspector, UnionFsError, UnionFsInspector};
