use std::path::PathBuf;

use btrfs_scope::engine::Engine;
use btrfs_scope::usage_query::SortBy;
use clap::{Parser, Subcommand};

/// cheap, sampling-based introspection for a mounted btrfs filesystem
#[derive(Parser, Debug)]
#[command(author, version, about, long_about)]
struct Args {
    /// Directory holding the shared session store.
    #[clap(long, default_value = "/var/lib/btrfs-scope")]
    store_dir: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List subvolumes on a mounted filesystem.
    Subvolumes { mount: PathBuf },
    /// Start a sampling run against a mounted filesystem.
    Sample { mount: PathBuf },
    /// Print the current usage tree under a path.
    Usage {
        mount: PathBuf,
        #[clap(default_value = "/")]
        path: String,
    },
    /// Report per-file fragmentation.
    Frag { path: PathBuf },
}

fn main() -> anyhow::Result<()> {
    env_logger::init();
    let args = Args::parse();

    let engine = Engine::open(&args.store_dir)?;

    match args.command {
        Command::Subvolumes { mount } => {
            for sv in engine.list_subvolumes(&mount)? {
                println!("{}\t{}", sv.root_id, sv.path);
            }
        }
        Command::Sample { mount } => {
            let result = engine.start_sampling(&mount, true)?;
            println!(
                "started={} resumed={} existing_samples={}",
                result.started, result.resumed, result.existing_samples
            );
        }
        Command::Usage { mount, path } => {
            let tree = engine.usage_tree(&mount, &path, SortBy::Size, true, None)?;
            for child in tree.children {
                println!(
                    "{}\t{}\t{:.2}%",
                    child.full_path, child.estimated_size, child.percentage
                );
            }
        }
        Command::Frag { path } => {
            let info = engine.file_fragmentation(&path)?;
            println!(
                "extents={} dof={:.2} fragmentation_pct={:.1}",
                info.extent_count, info.degree_of_fragmentation, info.fragmentation_pct
            );
        }
    }

    Ok(())
}
