//! Orchestrates trees of aufs-backed filesystem layers: creation, mounting,
//! freezing into children, and the layer-spec language used to address them.
//!
//! This crate composes the capability traits from [`mountinfo`] and
//! [`unionfs`] into [`Layer`] and [`UnionMount`], which understand the
//! on-disk layer-tree shape and the freeze protocol. It knows nothing about
//! argument parsing or process exit codes; that lives in the `naruto` binary.

mod error;
mod layer;
mod metadata;
mod spec;
mod union_mount;

#[cfg(test)]
mod testutil;
#[cfg(test)]
mod tests_e2e;

use std::sync::Arc;

use mountinfo::MountInfoProvider;
use unionfs::{MountDriver, ProcessMountDriver, SysfsInspector, UnionFsInspector};

pub use error::LayerFsError;
pub use layer::{Layer, MountedBranch, CHILDREN_SUBDIR, CONTENTS_SUBDIR};
pub use metadata::LayerMetadata;
pub use spec::{find_layer, split_reference, RelOp};
pub use union_mount::{Branch, UnionMount, AUFS_FSTYPE};

/// The three kernel-facing capabilities a [`Layer`] needs, bundled so
/// production code and tests can swap all three together.
///
/// Cloning a `Runtime` is cheap: it's three `Arc`s.
#[derive(Clone)]
pub struct Runtime {
    pub mount_info: Arc<dyn MountInfoProvider + Send + Sync>,
    pub inspector: Arc<dyn UnionFsInspector + Send + Sync>,
    pub driver: Arc<dyn MountDriver + Send + Sync>,
}

impl Runtime {
    /// The real runtime: `/proc/mounts`, `/sys/fs/aufs`, and `mount`/`umount`
    /// invoked directly (no sudo wrapper).
    pub fn production() -> Self {
        Self {
            mount_info: Arc::new(mountinfo::ProcMountInfoProvider::new()),
            inspector: Arc::new(SysfsInspector::new()),
            driver: Arc::new(ProcessMountDriver::new()),
        }
    }

    /// Like [`Runtime::production`], but mount operations go through
    /// `sudo -n`, letting [`unionfs::DriverError::PermissionDenied`] surface
    /// as [`LayerFsError::PermissionDenied`] when the caller lacks rights.
    pub fn production_with_sudo() -> Self {
        Self {
            mount_info: Arc::new(mountinfo::ProcMountInfoProvider::new()),
            inspector: Arc::new(SysfsInspector::new()),
            driver: Arc::new(ProcessMountDriver::with_sudo()),
        }
    }
}
