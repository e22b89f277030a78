//! A combined in-memory fake kernel for end-to-end tests: mounting,
//! remounting, and unmounting actually mutate shared state, so the mount
//! table and branch inspection stay consistent with each other, unlike
//! [`unionfs::RecordingMountDriver`] which only records calls.

use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
    sync::Mutex,
};

use anyhow::Result;
use mountinfo::{MountEntry, MountInfoProvider};
use unionfs::{AufsBranch, DriverError, MountDriver, Permission, UnionFsError, UnionFsInspector};

struct FakeMount {
    mountpoint: PathBuf,
    session: String,
    branches: Vec<AufsBranch>,
}

#[derive(Default)]
struct State {
    mounts: Vec<FakeMount>,
    next_session: u32,
    next_brid: u32,
}

#[derive(Default)]
pub struct FakeKernel {
    state: Mutex<State>,
}

impl FakeKernel {
    pub fn new() -> Self {
        Self::default()
    }
}

impl MountInfoProvider for FakeKernel {
    fn mounts(&self) -> Result<Vec<MountEntry>> {
        let state = self.state.lock().unwrap();
        Ok(state
            .mounts
            .iter()
            .map(|m| {
                let mut options = BTreeMap::new();
                options.insert("si".to_string(), Some(m.session.clone()));
                MountEntry {
                    source: "none".to_string(),
                    mountpoint: m.mountpoint.clone(),
                    vfstype: "aufs".to_string(),
                    options,
                    freq: 0,
                    passno: 0,
                }
            })
            .collect())
    }
}

impl UnionFsInspector for FakeKernel {
    fn branches(&self, session: &str) -> Result<Vec<AufsBranch>, UnionFsError> {
        let state = self.state.lock().unwrap();
        state
            .mounts
            .iter()
            .find(|m| m.session == session)
            .map(|m| m.branches.clone())
            .ok_or_else(|| UnionFsError::NotFound(session.to_string()))
    }
}

impl MountDriver for FakeKernel {
    fn mount(
        &self,
        _source: &str,
        target: &Path,
        fstype: &str,
        options: &str,
    ) -> Result<(), DriverError> {
        if fstype != "aufs" {
            return Err(DriverError::Other {
                exit_code: Some(1),
                stderr: format!("unsupported fstype {fstype}"),
            });
        }
        let mut state = self.state.lock().unwrap();
        let session = format!("{:x}", state.next_session);
        state.next_session += 1;

        let mut branches = Vec::new();
        for (path, permission) in parse_br_options(options) {
            let brid = state.next_brid;
            state.next_brid += 1;
            branches.push(AufsBranch {
                path,
                permission,
                index: branches.len() as u32,
                brid,
                session: session.clone(),
            });
        }

        state.mounts.push(FakeMount {
            mountpoint: target.to_path_buf(),
            session,
            branches,
        });
        Ok(())
    }

    fn unmount(&self, target: &Path) -> Result<(), DriverError> {
        let mut state = self.state.lock().unwrap();
        let before = state.mounts.len();
        state.mounts.retain(|m| m.mountpoint != target);
        if state.mounts.len() == before {
            return Err(DriverError::Other {
                exit_code: Some(1),
                stderr: format!("not mounted: {}", target.display()),
            });
        }
        Ok(())
    }

    fn remount(&self, target: &Path, fstype: &str, options: &str) -> Result<(), DriverError> {
        if fstype != "aufs" {
            return Err(DriverError::Other {
                exit_code: Some(1),
                stderr: format!("unsupported fstype {fstype}"),
            });
        }
        let mut state = self.state.lock().unwrap();
        let next_brid = {
            let brid = state.next_brid;
            state.next_brid += 1;
            brid
        };
        let mount = state
            .mounts
            .iter_mut()
            .find(|m| m.mountpoint == target)
            .ok_or_else(|| DriverError::Other {
                exit_code: Some(1),
                stderr: format!("not mounted: {}", target.display()),
            })?;
        apply_mutation(&mut mount.branches, &mount.session, next_brid, options)
            .map_err(|reason| DriverError::Other {
                exit_code: Some(1),
                stderr: reason,
            })
    }
}

fn parse_br_options(options: &str) -> Vec<(PathBuf, Permission)> {
    let rest = options.strip_prefix("br:").expect("mount options must start with br:");
    rest.split(':')
        .map(|part| {
            let (path, perm) = part
                .rsplit_once('=')
                .expect("each branch entry has shape path=perm");
            (
                PathBuf::from(path),
                Permission::parse(perm).expect("known permission"),
            )
        })
        .collect()
}

fn apply_mutation(
    branches: &mut Vec<AufsBranch>,
    session: &str,
    fresh_brid: u32,
    mutation: &str,
) -> Result<(), String> {
    if let Some(rest) = mutation.strip_prefix("mod:") {
        let (path, perm) = rest
            .rsplit_once('=')
            .ok_or_else(|| format!("malformed mod mutation: {mutation}"))?;
        let perm = Permission::parse(perm).ok_or_else(|| format!("unknown permission {perm}"))?;
        let branch = branches
            .iter_mut()
            .find(|b| b.path == Path::new(path))
            .ok_or_else(|| format!("no such branch: {path}"))?;
        branch.permission = perm;
    } else if let Some(path) = mutation.strip_prefix("del:") {
        let before = branches.len();
        branches.retain(|b| b.path != Path::new(path));
        if branches.len() == before {
            return Err(format!("no such branch: {path}"));
        }
        reindex(branches);
    } else if let Some(rest) = mutation.strip_prefix("add:") {
        let (index_str, path_perm) = rest
            .split_once(':')
            .ok_or_else(|| format!("malformed add mutation: {mutation}"))?;
        let index: usize = index_str
            .parse()
            .map_err(|_| format!("malformed add index: {index_str}"))?;
        let (path, perm) = path_perm
            .rsplit_once('=')
            .ok_or_else(|| format!("malformed add mutation: {mutation}"))?;
        let permission = Permission::parse(perm).ok_or_else(|| format!("unknown permission {perm}"))?;
        if index > branches.len() {
            return Err(format!("add index {index} out of range"));
        }
        branches.insert(
            index,
            AufsBranch {
                path: PathBuf::from(path),
                permission,
                index: 0,
                brid: fresh_brid,
                session: session.to_string(),
            },
        );
        reindex(branches);
    } else {
        return Err(format!("unknown remount mutation: {mutation}"));
    }
    Ok(())
}

fn reindex(branches: &mut [AufsBranch]) {
    for (i, branch) in branches.iter_mut().enumerate() {
        branch.index = i as u32;
    }
}
