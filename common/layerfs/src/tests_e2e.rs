//! End-to-end scenarios exercising the freeze protocol, mount lifecycle, and
//! layer-spec resolver together against [`FakeKernel`].

use std::{collections::BTreeSet, fs, sync::Arc};

use unionfs::Permission;

use crate::{spec::find_layer, testutil::FakeKernel, Layer, Runtime};

fn test_runtime() -> Runtime {
    let kernel = Arc::new(FakeKernel::new());
    Runtime {
        mount_info: kernel.clone(),
        inspector: kernel.clone(),
        driver: kernel,
    }
}

fn empty_dir(parent: &std::path::Path, name: &str) -> std::path::PathBuf {
    let dir = parent.join(name);
    fs::create_dir(&dir).unwrap();
    dir
}

#[test]
fn s1_create_mount_unmount_leaf() {
    let runtime = test_runtime();
    let home = tempfile::tempdir().unwrap();

    let root = Layer::create(home.path(), true, "", runtime).unwrap();
    assert_eq!(root.description().unwrap(), "root");
    assert!(!root.mounted().unwrap());

    let d = empty_dir(home.path(), "d");
    root.mount(&d).unwrap();

    assert!(root.mounted().unwrap());
    let branches = root.find_mounted_branches().unwrap();
    assert_eq!(branches.len(), 1);
    assert_eq!(branches[0].permission(), Permission::Rw);
    assert_eq!(branches[0].mountpoint().to_path_buf(), d);

    root.unmount_all().unwrap();
    assert!(!root.mounted().unwrap());
}

#[test]
fn s2_freeze_on_branch() {
    let runtime = test_runtime();
    let home = tempfile::tempdir().unwrap();

    let root = Layer::create(home.path(), true, "", runtime).unwrap();
    let d1 = empty_dir(home.path(), "d1");
    root.mount(&d1).unwrap();
    fs::write(d1.join("hello.txt"), b"hi").unwrap();

    assert!(!root.read_only().unwrap());
    let c1 = root.create_child("c1").unwrap();
    assert_eq!(c1.description().unwrap(), "c1");

    // Creating a child must freeze root: it is now read-only...
    assert!(root.read_only().unwrap());

    // ...and the D1 mount now carries two branches: c1 (rw, on top) over
    // root (ro, below).
    let root_branches = root.find_mounted_branches().unwrap();
    assert_eq!(root_branches.len(), 1);
    assert_eq!(root_branches[0].permission(), Permission::Ro);

    let c1_branches = c1.find_mounted_branches().unwrap();
    assert_eq!(c1_branches.len(), 1);
    assert_eq!(c1_branches[0].permission(), Permission::Rw);
    assert!(c1_branches[0].index < root_branches[0].index);

    assert_eq!(fs::read_to_string(d1.join("hello.txt")).unwrap(), "hi");
}

#[test]
fn s3_independent_branches() {
    let runtime = test_runtime();
    let home = tempfile::tempdir().unwrap();

    let root = Layer::create(home.path(), true, "", runtime).unwrap();
    let d1 = empty_dir(home.path(), "d1");
    root.mount(&d1).unwrap();
    let c1 = root.create_child("c1").unwrap();

    // c1 is still a leaf, so mounting it directly (over root) succeeds even
    // though it already appears in the D1 stack.
    let d2 = empty_dir(home.path(), "d2");
    c1.mount(&d2).unwrap();
    let d2_branches = c1.find_mounted_branches().unwrap();
    assert_eq!(d2_branches.len(), 2); // the D1 branch plus this new D2 branch

    let c2 = root.create_child("c2").unwrap();
    let d3 = empty_dir(home.path(), "d3");
    c2.mount(&d3).unwrap();

    fs::write(d2.join("only-in-d2.txt"), b"d2").unwrap();
    fs::write(d3.join("only-in-d3.txt"), b"d3").unwrap();
    assert!(!d3.join("only-in-d2.txt").exists());
    assert!(!d2.join("only-in-d3.txt").exists());

    // root now backs three live mounts (D1, D2, D3), always read-only.
    let root_branches = root.find_mounted_branches().unwrap();
    assert_eq!(root_branches.len(), 3);
    assert!(root_branches.iter().all(|b| b.permission() == Permission::Ro));
}

#[test]
fn s4_spec_resolver() {
    let runtime = test_runtime();
    let home = tempfile::tempdir().unwrap();

    let root = Layer::create(home.path(), true, "", runtime).unwrap();
    let c1 = root.create_child("c1").unwrap();
    let c1a = c1.create_child("c1a").unwrap();
    let c2 = root.create_child("c2").unwrap();

    assert_eq!(find_layer("root", &c2).unwrap(), root);

    // root's two children are {c1, c2}; "^" always yields the first, "^2"
    // the second -- but directory-listing order across siblings is not
    // guaranteed, so check the pair as a set rather than by position.
    let first = find_layer("root^", &c2).unwrap();
    let second = find_layer("root^2", &c2).unwrap();
    let got: BTreeSet<String> = [first.layer_id(), second.layer_id()].into_iter().collect();
    let want: BTreeSet<String> = [c1.layer_id(), c2.layer_id()].into_iter().collect();
    assert_eq!(got, want);

    // root's first-child descent is unambiguous since c1 is root's only
    // child at each step of the way it was built (c1 before c2, c1a as
    // c1's only child).
    assert_eq!(find_layer("root~", &root).unwrap(), c1);
    assert_eq!(find_layer("root~2", &root).unwrap(), c1a);

    c2.set_tags(["wip".to_string()]).unwrap();
    assert_eq!(find_layer("wip", &root).unwrap(), c2);
}

#[test]
fn s5_discover_by_destination() {
    let runtime = test_runtime();
    let home = tempfile::tempdir().unwrap();

    let root = Layer::create(home.path(), true, "", runtime.clone()).unwrap();
    let c1 = root.create_child("c1").unwrap();
    let c1a = c1.create_child("c1a").unwrap();

    let d = empty_dir(home.path(), "d");
    c1a.mount(&d).unwrap();

    let found = Layer::find_layer_mounted_at_dest(&d, runtime.clone()).unwrap();
    assert_eq!(found, c1a);

    let err = Layer::find_layer_mounted_at_dest(std::path::Path::new("/"), runtime).unwrap_err();
    assert!(matches!(err, crate::LayerFsError::LayerNotFound(_)));
}

#[test]
fn s6_mount_table_longest_prefix() {
    use mountinfo::{find_mount_by_dest, parse_mount_table};
    use std::path::{Path, PathBuf};

    let table = "\
rootfs / rootfs rw 0 0
proc /proc proc rw 0 0
devpts /dev/pts devpts rw 0 0";
    let entries = parse_mount_table(table);

    assert_eq!(
        find_mount_by_dest(&entries, Path::new("/proc/geoff")).unwrap().mountpoint,
        PathBuf::from("/proc")
    );
    assert_eq!(
        find_mount_by_dest(&entries, Path::new("/dev/pts/blah")).unwrap().mountpoint,
        PathBuf::from("/dev/pts")
    );
    assert_eq!(
        find_mount_by_dest(&entries, Path::new("/geoff")).unwrap().mountpoint,
        PathBuf::from("/")
    );
}
