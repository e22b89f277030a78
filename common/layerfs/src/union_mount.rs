use std::path::{Path, PathBuf};

use mountinfo::MountEntry;
use unionfs::Permission;

use crate::{error::LayerFsError, Runtime};

const AUFS_VFSTYPE: &str = "aufs";

/// One branch of a live [`UnionMount`], as last observed by `refresh()`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Branch {
    pub contents_path: PathBuf,
    pub permission: Permission,
    pub index: u32,
    pub brid: u32,
}

/// An in-memory view of one live aufs union mount.
///
/// Constructed from a [`MountEntry`]; immediately loads its branch stack via
/// the injected [`unionfs::UnionFsInspector`] and sorts it by index (index 0
/// is the topmost, writable branch).
pub struct UnionMount {
    mountpoint: PathBuf,
    session: String,
    branches: Vec<Branch>,
    runtime: Runtime,
}

impl UnionMount {
    pub fn from_mount_entry(entry: &MountEntry, runtime: Runtime) -> Result<Self, LayerFsError> {
        if entry.vfstype != AUFS_VFSTYPE {
            return Err(LayerFsError::LayerNotFound(format!(
                "{} is not an aufs mount point",
                entry.mountpoint.display()
            )));
        }
        let session = entry.aufs_session_code().ok_or_else(|| {
            LayerFsError::NotALayer(entry.mountpoint.clone())
        })?;

        let mut mount = Self {
            mountpoint: entry.mountpoint.clone(),
            session: session.to_string(),
            branches: Vec::new(),
            runtime,
        };
        mount.refresh()?;
        Ok(mount)
    }

    pub fn mountpoint(&self) -> &Path {
        &self.mountpoint
    }

    pub fn branches(&self) -> &[Branch] {
        &self.branches
    }

    /// Reloads the branch stack from the kernel.
    pub fn refresh(&mut self) -> Result<(), LayerFsError> {
        let mut branches: Vec<Branch> = self
            .runtime
            .inspector
            .branches(&self.session)
            .map_err(|_| LayerFsError::LayerNotFound(self.mountpoint.display().to_string()))?
            .into_iter()
            .map(|b| Branch {
                contents_path: b.path,
                permission: b.permission,
                index: b.index,
                brid: b.brid,
            })
            .collect();
        branches.sort_by_key(|b| b.index);
        self.branches = branches;
        Ok(())
    }

    pub fn branch_by_contents_path(&self, path: &Path) -> Result<&Branch, LayerFsError> {
        self.branches
            .iter()
            .find(|b| b.contents_path == path)
            .ok_or_else(|| LayerFsError::LayerNotFound(path.display().to_string()))
    }

    pub fn branch_by_index(&self, index: u32) -> Result<&Branch, LayerFsError> {
        self.branches
            .iter()
            .find(|b| b.index == index)
            .ok_or_else(|| LayerFsError::LayerNotFound(format!("branch index {index}")))
    }

    /// The topmost (lowest-index), writable-when-possible branch.
    pub fn leaf(&self) -> &Branch {
        // Non-empty by construction: `from_mount_entry` requires at least one
        // branch to exist for the mount to have been created at all.
        self.branches
            .iter()
            .min_by_key(|b| b.index)
            .expect("union mount with no branches")
    }

    /// Detaches the whole mount.
    pub fn unmount(&self) -> Result<(), LayerFsError> {
        self.runtime.driver.unmount(&self.mountpoint)?;
        Ok(())
    }

    /// Issues `remount,mod:<path>=<perm>` and refreshes.
    pub fn set_permission(&mut self, index: u32, permission: Permission) -> Result<(), LayerFsError> {
        let path = self.branch_by_index(index)?.contents_path.clone();
        let options = format!("mod:{}={}", path.display(), permission.as_str());
        self.runtime
            .driver
            .remount(&self.mountpoint, AUFS_VFSTYPE, &options)?;
        self.refresh()
    }

    /// Issues `remount,del:<path>` and refreshes.
    pub fn delete_branch(&mut self, index: u32) -> Result<(), LayerFsError> {
        let path = self.branch_by_index(index)?.contents_path.clone();
        let options = format!("del:{}", path.display());
        self.runtime
            .driver
            .remount(&self.mountpoint, AUFS_VFSTYPE, &options)?;
        self.refresh()
    }

    /// Issues `remount,add:<index>:<path>=<perm>`, where `index` is the
    /// branch this call is logically anchored at. In aufs's remount grammar
    /// this splices the new branch into that slot, shifting the anchor
    /// branch (and everything below it) to higher indices -- i.e. the new
    /// branch ends up immediately *above* the anchor. This is what the
    /// freeze protocol relies on to keep a new child layer as the writable
    /// top of the stack.
    pub fn insert_after(
        &mut self,
        anchor_index: u32,
        new_path: &Path,
        permission: Permission,
    ) -> Result<(), LayerFsError> {
        let anchor = self.branch_by_index(anchor_index)?;
        let options = format!(
            "add:{}:{}={}",
            anchor.index,
            new_path.display(),
            permission.as_str()
        );
        self.runtime
            .driver
            .remount(&self.mountpoint, AUFS_VFSTYPE, &options)?;
        self.refresh()
    }
}

/// Builds the initial `br:<p1>=<perm1>:<p2>=<perm2>:...` mount option string
/// for mounting a fresh union stack.
pub fn format_branch_options(stack: &[(PathBuf, Permission)]) -> String {
    let parts: Vec<String> = stack
        .iter()
        .map(|(path, perm)| format!("{}={}", path.display(), perm.as_str()))
        .collect();
    format!("br:{}", parts.join(":"))
}

pub const AUFS_FSTYPE: &str = AUFS_VFSTYPE;
