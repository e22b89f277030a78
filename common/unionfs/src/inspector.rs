use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

/// One branch of a live aufs union mount, as reported by the kernel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AufsBranch {
    pub path: PathBuf,
    pub permission: Permission,
    pub index: u32,
    pub brid: u32,
    pub session: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Permission {
    Rw,
    Ro,
}

impl Permission {
    pub fn as_str(&self) -> &'static str {
        match self {
            Permission::Rw => "rw",
            Permission::Ro => "ro",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "rw" => Some(Permission::Rw),
            "ro" => Some(Permission::Ro),
            _ => None,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum UnionFsError {
    #[error("no aufs session found for si_{0}")]
    NotFound(String),
}

/// Reads the kernel's per-session sysfs-like directory and enumerates its
/// branches.
///
/// Implementations are expected to be cheap and re-queried on every
/// `UnionMount::refresh()`.
pub trait UnionFsInspector {
    fn branches(&self, session: &str) -> Result<Vec<AufsBranch>, UnionFsError>;
}

/// Default implementation reading `/sys/fs/aufs/si_<session>/`.
pub struct SysfsInspector {
    sys_root: PathBuf,
}

impl SysfsInspector {
    pub fn new() -> Self {
        Self {
            sys_root: PathBuf::from("/sys/fs/aufs"),
        }
    }

    /// Builds an inspector rooted somewhere other than `/sys/fs/aufs`, for
    /// tests that lay out a fake sysfs tree on disk.
    pub fn with_root(sys_root: &Path) -> Self {
        Self {
            sys_root: sys_root.to_path_buf(),
        }
    }
}

impl Default for SysfsInspector {
    fn default() -> Self {
        Self::new()
    }
}

impl UnionFsInspector for SysfsInspector {
    fn branches(&self, session: &str) -> Result<Vec<AufsBranch>, UnionFsError> {
        let metadata_dir = self.sys_root.join(format!("si_{session}"));
        if !metadata_dir.is_dir() {
            return Err(UnionFsError::NotFound(session.to_string()));
        }

        read_branches(&metadata_dir, session)
            .map_err(|_| UnionFsError::NotFound(session.to_string()))
    }
}

fn read_branches(metadata_dir: &Path, session: &str) -> Result<Vec<AufsBranch>> {
    let mut branches = Vec::new();

    for entry in std::fs::read_dir(metadata_dir)? {
        let entry = entry?;
        let name = entry.file_name();
        let name = name.to_string_lossy();
        let Some(index_str) = name.strip_prefix("br") else {
            continue;
        };
        // Skip "brid<N>" entries here; they're read as a sibling below.
        if index_str.is_empty() || !index_str.chars().all(|c| c.is_ascii_digit()) {
            continue;
        }
        let index: u32 = index_str.parse()?;

        let path_permission = std::fs::read_to_string(metadata_dir.join(&*name))?;
        let path_permission = path_permission.trim();
        let (path, permission) = path_permission
            .split_once('=')
            .with_context(|| format!("malformed branch entry {name}: {path_permission:?}"))?;
        let permission = Permission::parse(permission)
            .with_context(|| format!("unknown branch permission {permission:?}"))?;

        let brid_contents = std::fs::read_to_string(metadata_dir.join(format!("brid{index}")))?;
        let brid: u32 = brid_contents.trim().parse()?;

        branches.push(AufsBranch {
            path: PathBuf::from(path),
            permission,
            index,
            brid,
            session: session.to_string(),
        });
    }

    Ok(branches)
}
