use std::{
    collections::BTreeSet,
    fs,
    path::{Path, PathBuf},
};

use rand::RngCore;
use unionfs::Permission;

use crate::{
    error::LayerFsError,
    metadata::{self, LayerMetadata, METADATA_FILE_NAME},
    union_mount::{format_branch_options, UnionMount, AUFS_FSTYPE},
    Runtime,
};

pub const CHILDREN_SUBDIR: &str = "children";
pub const CONTENTS_SUBDIR: &str = "contents";

/// A live branch of a mount that currently exposes this layer's contents.
pub struct MountedBranch {
    pub mount: UnionMount,
    pub index: u32,
}

impl MountedBranch {
    pub fn permission(&self) -> Permission {
        self.mount
            .branch_by_index(self.index)
            .expect("index recorded at discovery time")
            .permission
    }

    pub fn mountpoint(&self) -> &Path {
        self.mount.mountpoint()
    }
}

/// A persisted filesystem snapshot: metadata, contents, and children.
///
/// A `Layer` is a thin, stateless view over a directory on disk; it holds no
/// cached metadata and no owning back-pointer to its parent -- navigation is
/// always recomputed from the filesystem path, per the design note that a
/// child should not own its parent.
#[derive(Clone)]
pub struct Layer {
    dir: PathBuf,
    runtime: Runtime,
}

impl PartialEq for Layer {
    fn eq(&self, other: &Self) -> bool {
        self.dir == other.dir
    }
}
impl Eq for Layer {}

impl std::fmt::Debug for Layer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Layer").field("dir", &self.dir).finish()
    }
}

impl Layer {
    /// Opens an existing layer directory, validating its shape.
    pub fn open(dir: &Path, runtime: Runtime) -> Result<Self, LayerFsError> {
        let dir = dir
            .canonicalize()
            .map_err(|_| LayerFsError::NotALayer(dir.to_path_buf()))?;
        let layer = Self { dir, runtime };

        if !layer.children_path().is_dir() || !layer.contents_path().is_dir() {
            return Err(LayerFsError::NotALayer(layer.dir));
        }
        if !layer.metadata_path().is_file() {
            return Err(LayerFsError::NotALayer(layer.dir));
        }
        // Fail fast if the metadata record doesn't parse, or is missing the
        // mandatory `is_root` key.
        layer.metadata()?;

        Ok(layer)
    }

    fn children_path(&self) -> PathBuf {
        self.dir.join(CHILDREN_SUBDIR)
    }

    pub fn contents_path(&self) -> PathBuf {
        self.dir.join(CONTENTS_SUBDIR)
    }

    fn metadata_path(&self) -> PathBuf {
        self.dir.join(METADATA_FILE_NAME)
    }

    pub fn path(&self) -> &Path {
        &self.dir
    }

    pub fn layer_id(&self) -> String {
        self.dir
            .file_name()
            .expect("canonical layer dir has a basename")
            .to_string_lossy()
            .into_owned()
    }

    pub fn metadata(&self) -> Result<LayerMetadata, LayerFsError> {
        metadata::read(&self.metadata_path())
    }

    fn update_metadata(&self, f: impl FnOnce(&mut LayerMetadata)) -> Result<(), LayerFsError> {
        let mut current = self.metadata()?;
        f(&mut current);
        metadata::write(&self.metadata_path(), &current)
    }

    pub fn is_root(&self) -> Result<bool, LayerFsError> {
        Ok(self.metadata()?.is_root)
    }

    pub fn description(&self) -> Result<String, LayerFsError> {
        Ok(self.metadata()?.description)
    }

    pub fn set_description(&self, description: impl Into<String>) -> Result<(), LayerFsError> {
        let description = description.into();
        self.update_metadata(|m| m.description = description)
    }

    pub fn tags(&self) -> Result<BTreeSet<String>, LayerFsError> {
        Ok(self.metadata()?.tags.into_iter().collect())
    }

    pub fn set_tags(&self, tags: impl IntoIterator<Item = String>) -> Result<(), LayerFsError> {
        let tags = metadata::dedupe_tags(tags);
        self.update_metadata(|m| m.tags = tags)
    }

    pub fn add_tags(&self, new_tags: impl IntoIterator<Item = String>) -> Result<(), LayerFsError> {
        let mut tags = self.tags()?;
        tags.extend(new_tags);
        self.set_tags(tags)
    }

    pub fn remove_tags(&self, to_remove: impl IntoIterator<Item = String>) -> Result<(), LayerFsError> {
        let mut tags = self.tags()?;
        for tag in to_remove {
            tags.remove(&tag);
        }
        self.set_tags(tags)
    }

    /// Direct children, in filesystem directory-listing order.
    pub fn children(&self) -> Result<Vec<Layer>, LayerFsError> {
        let mut out = Vec::new();
        for entry in fs::read_dir(self.children_path())? {
            let entry = entry?;
            if entry.file_type()?.is_dir() {
                out.push(Layer::open(&entry.path(), self.runtime.clone())?);
            }
        }
        Ok(out)
    }

    /// All descendants, depth-first pre-order.
    pub fn descendants(&self) -> Result<Vec<Layer>, LayerFsError> {
        let mut out = Vec::new();
        for child in self.children()? {
            out.push(child.clone());
            out.extend(child.descendants()?);
        }
        Ok(out)
    }

    pub fn has_children(&self) -> Result<bool, LayerFsError> {
        Ok(!self.children()?.is_empty())
    }

    pub fn is_leaf(&self) -> Result<bool, LayerFsError> {
        Ok(!self.has_children()?)
    }

    /// A layer is read-only iff it has at least one child.
    pub fn read_only(&self) -> Result<bool, LayerFsError> {
        self.has_children()
    }

    pub fn parent(&self) -> Result<Option<Layer>, LayerFsError> {
        if self.is_root()? {
            return Ok(None);
        }
        // Children live two levels under their parent (`<parent>/children/<id>`).
        let parent_dir = self
            .dir
            .parent()
            .and_then(|p| p.parent())
            .ok_or_else(|| LayerFsError::NotALayer(self.dir.clone()))?;
        Ok(Some(Layer::open(parent_dir, self.runtime.clone())?))
    }

    pub fn root(&self) -> Result<Layer, LayerFsError> {
        let mut layer = self.clone();
        while !layer.is_root()? {
            layer = layer
                .parent()?
                .expect("non-root layer always has a parent");
        }
        Ok(layer)
    }

    /// The ordered branch stack used to mount this layer: self first (rw iff
    /// leaf), then every ancestor up to the root, all read-only.
    pub fn layer_permissions(&self) -> Result<Vec<(PathBuf, Permission)>, LayerFsError> {
        let mut stack = Vec::new();
        let mut current = self.clone();
        loop {
            let permission = if current.read_only()? {
                Permission::Ro
            } else {
                Permission::Rw
            };
            stack.push((current.contents_path(), permission));
            match current.parent()? {
                Some(parent) => current = parent,
                None => break,
            }
        }
        Ok(stack)
    }

    /// Allocates a fresh layer under `parent_dir`, which must already be a
    /// valid layer unless `is_root` is set.
    pub fn create(
        parent_dir: &Path,
        is_root: bool,
        description: &str,
        runtime: Runtime,
    ) -> Result<Layer, LayerFsError> {
        if !is_root {
            // Validates the parent by constructing a view of it.
            Layer::open(parent_dir, runtime.clone())?;
        }

        let description = if description.is_empty() && is_root {
            "root".to_string()
        } else {
            description.to_string()
        };

        let mut id_bytes = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut id_bytes);
        let layer_dir = parent_dir.join(hex::encode(id_bytes));

        fs::create_dir(&layer_dir)?;
        fs::create_dir(layer_dir.join(CHILDREN_SUBDIR))?;
        fs::create_dir(layer_dir.join(CONTENTS_SUBDIR))?;
        metadata::write(
            &layer_dir.join(METADATA_FILE_NAME),
            &LayerMetadata {
                is_root,
                description,
                tags: Vec::new(),
            },
        )?;

        tracing::info!(layer = %layer_dir.display(), is_root, "created layer");
        Layer::open(&layer_dir, runtime)
    }

    fn create_child_raw(&self, description: &str) -> Result<Layer, LayerFsError> {
        Layer::create(&self.children_path(), false, description, self.runtime.clone())
    }

    /// Creates a new child layer, freezing any rw mounts of `self` first.
    ///
    /// If freezing allocates a preservation child (because `self` was
    /// mounted rw somewhere), that child becomes the returned child -- it is
    /// the same workspace the rw mount now writes into, just under this
    /// description -- rather than creating a second, unrelated child.
    pub fn create_child(&self, description: &str) -> Result<Layer, LayerFsError> {
        match self.freeze_mounts_internal(true, description)? {
            Some(child) => Ok(child),
            None => self.create_child_raw(description),
        }
    }

    /// Freezes any writable mounts of this layer: each such mount's top
    /// branch is remounted read-only, and (if `preserve_rw`) a single shared
    /// preservation child is spliced in above it so writes keep flowing.
    pub fn freeze_mounts(&self, preserve_rw: bool) -> Result<(), LayerFsError> {
        self.freeze_mounts_internal(preserve_rw, "")?;
        Ok(())
    }

    fn freeze_mounts_internal(
        &self,
        preserve_rw: bool,
        child_description: &str,
    ) -> Result<Option<Layer>, LayerFsError> {
        let mut child: Option<Layer> = None;

        for mounted in self.find_mounted_branches()? {
            let MountedBranch { mut mount, index } = mounted;
            if mount.branch_by_index(index)?.permission == Permission::Ro {
                continue;
            }

            mount.set_permission(index, Permission::Ro)?;

            if preserve_rw {
                if child.is_none() {
                    child = Some(self.create_child_raw(child_description)?);
                }
                let child_contents = child.as_ref().unwrap().contents_path();
                mount.insert_after(index, &child_contents, Permission::Rw)?;
            }
        }

        self.validate_frozen()?;
        Ok(child)
    }

    /// Invariant check after freezing: no mount may still expose this layer
    /// rw once it has children. A violation indicates a bug in this crate or
    /// concurrent external interference with the mount table; it is not
    /// something a caller can usefully recover from.
    fn validate_frozen(&self) -> Result<(), LayerFsError> {
        if !self.read_only()? {
            return Ok(());
        }
        for mounted in self.find_mounted_branches()? {
            if mounted.permission() != Permission::Ro {
                panic!(
                    "invariant violated: layer {} has children but is mounted rw at {}",
                    self.layer_id(),
                    mounted.mountpoint().display()
                );
            }
        }
        Ok(())
    }

    /// Mounts this layer at `destination`, which must exist, be a directory,
    /// and be empty.
    pub fn mount(&self, destination: &Path) -> Result<(), LayerFsError> {
        ensure_empty_dir(destination)?;

        let stack = self.layer_permissions()?;
        let options = format_branch_options(&stack);
        self.runtime
            .driver
            .mount("none", destination, AUFS_FSTYPE, &options)?;

        tracing::info!(
            layer = %self.layer_id(),
            dest = %destination.display(),
            "mounted layer"
        );
        Ok(())
    }

    /// Every live branch, across every live union mount, backed by this
    /// layer's contents directory. A single layer may appear in many mounts.
    pub fn find_mounted_branches(&self) -> Result<Vec<MountedBranch>, LayerFsError> {
        let mut out = Vec::new();
        let contents = self.contents_path();

        for entry in self.runtime.mount_info.mounts()? {
            if entry.vfstype != "aufs" {
                continue;
            }
            let mount = match UnionMount::from_mount_entry(&entry, self.runtime.clone()) {
                Ok(mount) => mount,
                Err(_) => continue,
            };
            if let Ok(branch) = mount.branch_by_contents_path(&contents) {
                let index = branch.index;
                out.push(MountedBranch { mount, index });
            }
        }
        Ok(out)
    }

    pub fn mounted(&self) -> Result<bool, LayerFsError> {
        Ok(!self.find_mounted_branches()?.is_empty())
    }

    /// Unmounts every live mount that currently exposes this layer.
    ///
    /// Tolerates a mount disappearing between the snapshot taken by
    /// `find_mounted_branches` and the unmount call itself -- that race is
    /// treated as success, since the end state (unmounted) is what we want.
    pub fn unmount_all(&self) -> Result<(), LayerFsError> {
        for mounted in self.find_mounted_branches()? {
            let still_present = self
                .runtime
                .mount_info
                .mounts()?
                .iter()
                .any(|entry| entry.mountpoint == mounted.mountpoint());
            if !still_present {
                continue;
            }
            mounted.mount.unmount()?;
        }
        Ok(())
    }

    /// Finds the layer whose contents back the leaf branch of the union
    /// mount covering `dest`.
    pub fn find_layer_mounted_at_dest(dest: &Path, runtime: Runtime) -> Result<Layer, LayerFsError> {
        let entry = runtime
            .mount_info
            .find_mount_by_dest(dest)
            .map_err(|err| LayerFsError::LayerNotFound(format!("{}: {err}", dest.display())))?;
        if entry.vfstype != "aufs" {
            return Err(LayerFsError::LayerNotFound(format!(
                "{} is not an aufs mount point",
                dest.display()
            )));
        }

        let mount = UnionMount::from_mount_entry(&entry, runtime.clone())?;
        let leaf = mount.leaf();
        let layer_dir = leaf.contents_path.parent().ok_or_else(|| {
            LayerFsError::LayerNotFound(dest.display().to_string())
        })?;
        Layer::open(layer_dir, runtime)
    }
}

fn ensure_empty_dir(dest: &Path) -> Result<(), LayerFsError> {
    let meta = fs::metadata(dest).map_err(|_| {
        LayerFsError::PreconditionFailed(format!("{} does not exist", dest.display()))
    })?;
    if !meta.is_dir() {
        return Err(LayerFsError::PreconditionFailed(format!(
            "{} is not a directory",
            dest.display()
        )));
    }
    if fs::read_dir(dest)?.next().is_some() {
        return Err(LayerFsError::PreconditionFailed(format!(
            "{} is not empty",
            dest.display()
        )));
    }
    Ok(())
}
