use std::{
    fs,
    path::{Path, PathBuf},
    str::FromStr,
};

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use itertools::Itertools;
use layerfs::{find_layer, Layer, Runtime};
use path_absolutize::Absolutize;

/// Orchestrates aufs-backed layer trees.
#[derive(Parser, Debug)]
#[command(name = "naruto")]
struct Cli {
    /// Home directory holding named trees. Defaults to `~/.naruto`.
    #[arg(long, global = true)]
    home: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Create a new named tree, or a raw-path tree if the name contains `/`.
    Create {
        name_or_path: String,
        #[arg(long, default_value = "")]
        description: String,
    },
    /// List named trees under the home directory.
    List,
    /// Print the tree rooted at the resolved layer's root.
    Info {
        #[arg(long, default_value = "")]
        layer: LayerArg,
    },
    /// Mount the resolved layer at `dest`.
    Mount {
        #[arg(long, default_value = "")]
        layer: LayerArg,
        dest: PathBuf,
    },
    /// Create a child of the resolved layer and mount it.
    BranchAndMount {
        #[arg(long, default_value = "")]
        layer: LayerArg,
        dest: PathBuf,
        #[arg(long, default_value = "")]
        description: String,
    },
    /// Unmount every live mount of the resolved layer.
    UnmountAll {
        #[arg(long, default_value = "")]
        layer: LayerArg,
    },
    /// Print every live branch backed by the resolved layer's contents.
    FindMounts {
        #[arg(long, default_value = "")]
        layer: LayerArg,
    },
    /// Unmount (if mounted) then recursively delete the resolved layer.
    Delete {
        #[arg(long, default_value = "")]
        layer: LayerArg,
    },
    /// Print or set the resolved layer's description.
    Description {
        #[arg(long, default_value = "")]
        layer: LayerArg,
        #[arg(long)]
        set: Option<String>,
    },
    /// Print the resolved layer's tags.
    Tags {
        #[arg(long, default_value = "")]
        layer: LayerArg,
    },
    /// Add one or more tags to the resolved layer.
    AddTags {
        #[arg(long, default_value = "")]
        layer: LayerArg,
        tags: Vec<String>,
    },
    /// Remove one or more tags from the resolved layer.
    RemoveTags {
        #[arg(long, default_value = "")]
        layer: LayerArg,
        tags: Vec<String>,
    },
}

/// A `--layer [<tree-name-or-path>]:[<layer-spec>]` argument.
///
/// Either side of the `:` may be empty. An empty tree means "discover the
/// tree from the mount covering the current directory"; an empty layer-spec
/// means "the tree's root" (the resolver's own "this layer" rule, applied
/// with the discovered root as receiver).
#[derive(Debug, Clone)]
pub struct LayerArg {
    tree: String,
    layer_spec: String,
}

impl FromStr for LayerArg {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once(':') {
            Some((tree, layer_spec)) => Ok(Self {
                tree: tree.to_string(),
                layer_spec: layer_spec.to_string(),
            }),
            None => Ok(Self {
                tree: s.to_string(),
                layer_spec: String::new(),
            }),
        }
    }
}

fn default_home() -> Result<PathBuf> {
    let home = std::env::var_os("HOME").context("HOME is not set")?;
    Ok(PathBuf::from(home).join(".naruto"))
}

fn resolve_tree_root(tree: &str, home: &Path, runtime: Runtime) -> Result<Layer> {
    if tree.is_empty() {
        let cwd = std::env::current_dir().context("failed to read current directory")?;
        let mounted = Layer::find_layer_mounted_at_dest(&cwd, runtime)
            .with_context(|| format!("no tree specified and {} is not inside a mounted layer", cwd.display()))?;
        return Ok(mounted.root()?);
    }

    if tree.contains('/') {
        return Ok(Layer::open(Path::new(tree), runtime)?);
    }

    let tree_dir = home.join(tree);
    let mut entries = fs::read_dir(&tree_dir)
        .with_context(|| format!("no such tree {tree:?} under {}", home.display()))?;
    let entry = entries
        .next()
        .ok_or_else(|| anyhow!("tree {tree:?} has no root layer"))??;
    Ok(Layer::open(&entry.path(), runtime)?)
}

fn resolve_layer(arg: &LayerArg, home: &Path, runtime: Runtime) -> Result<Layer> {
    let root = resolve_tree_root(&arg.tree, home, runtime)?;
    Ok(find_layer(&arg.layer_spec, &root)?)
}

pub fn run() -> Result<()> {
    let cli = Cli::parse();
    let home = match cli.home {
        Some(home) => home,
        None => default_home()?,
    };
    let runtime = Runtime::production_with_sudo();

    match cli.command {
        Command::Create {
            name_or_path,
            description,
        } => do_create(&home, &name_or_path, &description, runtime),
        Command::List => do_list(&home),
        Command::Info { layer } => do_info(&resolve_layer(&layer, &home, runtime.clone())?),
        Command::Mount { layer, dest } => {
            do_mount(&resolve_layer(&layer, &home, runtime.clone())?, &dest)
        }
        Command::BranchAndMount {
            layer,
            dest,
            description,
        } => do_branch_and_mount(
            &resolve_layer(&layer, &home, runtime.clone())?,
            &dest,
            &description,
        ),
        Command::UnmountAll { layer } => {
            do_unmount_all(&resolve_layer(&layer, &home, runtime.clone())?)
        }
        Command::FindMounts { layer } => {
            do_find_mounts(&resolve_layer(&layer, &home, runtime.clone())?)
        }
        Command::Delete { layer } => do_delete(&resolve_layer(&layer, &home, runtime.clone())?),
        Command::Description { layer, set } => {
            do_description(&resolve_layer(&layer, &home, runtime.clone())?, set.as_deref())
        }
        Command::Tags { layer } => do_tags(&resolve_layer(&layer, &home, runtime.clone())?),
        Command::AddTags { layer, tags } => {
            do_add_tags(&resolve_layer(&layer, &home, runtime.clone())?, tags)
        }
        Command::RemoveTags { layer, tags } => {
            do_remove_tags(&resolve_layer(&layer, &home, runtime.clone())?, tags)
        }
    }
}

fn do_create(home: &Path, name_or_path: &str, description: &str, runtime: Runtime) -> Result<()> {
    let tree_dir = if name_or_path.contains('/') {
        PathBuf::from(name_or_path).absolutize()?.into_owned()
    } else {
        home.join(name_or_path)
    };
    fs::create_dir_all(&tree_dir)
        .with_context(|| format!("failed to create tree directory {}", tree_dir.display()))?;

    let root = Layer::create(&tree_dir, true, description, runtime)?;
    println!("{}", root.layer_id());
    Ok(())
}

fn do_list(home: &Path) -> Result<()> {
    if !home.is_dir() {
        return Ok(());
    }
    let mut names: Vec<String> = fs::read_dir(home)?
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().map(|t| t.is_dir()).unwrap_or(false))
        .map(|entry| entry.file_name().to_string_lossy().into_owned())
        .collect();
    names.sort();
    for name in names {
        println!("{name}");
    }
    Ok(())
}

fn do_info(layer: &Layer) -> Result<()> {
    let root = layer.root()?;
    print_tree(&root, layer, 0)
}

fn print_tree(node: &Layer, selected: &Layer, depth: usize) -> Result<()> {
    let marker = if node == selected { "*" } else { " " };
    let permission = if node.read_only()? { "ro" } else { "rw" };
    let description = node.description()?;
    println!(
        "{}{} {} [{permission}] {description}",
        "  ".repeat(depth),
        marker,
        node.layer_id(),
    );
    for child in node.children()? {
        print_tree(&child, selected, depth + 1)?;
    }
    Ok(())
}

fn do_mount(layer: &Layer, dest: &Path) -> Result<()> {
    let dest = dest.absolutize()?;
    layer.mount(&dest)?;
    Ok(())
}

fn do_branch_and_mount(layer: &Layer, dest: &Path, description: &str) -> Result<()> {
    let dest = dest.absolutize()?;
    let child = layer.create_child(description)?;
    child.mount(&dest)?;
    println!("{}", child.layer_id());
    Ok(())
}

fn do_unmount_all(layer: &Layer) -> Result<()> {
    layer.unmount_all()?;
    Ok(())
}

fn do_find_mounts(layer: &Layer) -> Result<()> {
    for branch in layer.find_mounted_branches()? {
        println!(
            "{} [{}]",
            branch.mountpoint().display(),
            branch.permission().as_str(),
        );
    }
    Ok(())
}

fn do_delete(layer: &Layer) -> Result<()> {
    let descendants = layer.descendants()?;
    if !descendants.is_empty() {
        eprintln!(
            "naruto: warning: deleting {} and {} descendant layer(s)",
            layer.layer_id(),
            descendants.len()
        );
    }
    if layer.mounted()? {
        eprintln!("naruto: warning: {} is currently mounted; unmounting", layer.layer_id());
        layer.unmount_all()?;
    }
    fs::remove_dir_all(layer.path())
        .with_context(|| format!("failed to delete layer directory {}", layer.path().display()))
}

fn do_description(layer: &Layer, set: Option<&str>) -> Result<()> {
    match set {
        Some(description) => Ok(layer.set_description(description)?),
        None => {
            println!("{}", layer.description()?);
            Ok(())
        }
    }
}

fn do_tags(layer: &Layer) -> Result<()> {
    println!("{}", layer.tags()?.into_iter().join(","));
    Ok(())
}

fn do_add_tags(layer: &Layer, tags: Vec<String>) -> Result<()> {
    Ok(layer.add_tags(tags)?)
}

fn do_remove_tags(layer: &Layer, tags: Vec<String>) -> Result<()> {
    Ok(layer.remove_tags(tags)?)
}
