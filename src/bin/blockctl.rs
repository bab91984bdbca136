//! Command-line control utility for block-device layer stores.
//!
//! `blockctl` exposes the driver's lifecycle operations for inspection and
//! recovery: registering layers, mounting and releasing their devices, and
//! committing writable layers into published blobs.

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};

use blocklayer::{paths, Driver};

/// blockctl
#[derive(Debug, Parser)]
#[clap(name = "blockctl", version)]
struct App {
    /// Layer store root directory
    #[clap(long, default_value = "/var/lib/blocklayer/layers")]
    root: PathBuf,

    #[clap(subcommand)]
    cmd: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Register a layer at creation time (container layers only)
    Create {
        id: String,
        /// Parent layer id
        #[clap(default_value = "")]
        parent: String,
    },
    /// Register a downloaded image layer and extend its parent's chain
    ApplyDiff {
        id: String,
        /// Parent layer id
        #[clap(default_value = "")]
        parent: String,
    },
    /// Provision and mount the block device for a layer
    Get { id: String },
    /// Release the block device of a layer
    Put { id: String },
    /// Freeze and publish the writable layer as a content-addressed blob
    Diff { id: String },
    /// Print the published digest and size of a layer
    Info { id: String },
}

fn main() -> Result<()> {
    env_logger::init();

    let args = App::parse();
    let driver = Driver::new(&args.root);

    match args.cmd {
        Command::Create { id, parent } => driver.create(&id, &parent)?,
        Command::ApplyDiff { id, parent } => driver.apply_diff(&id, &parent)?,
        Command::Get { id } => {
            let mount_point = driver.get(&id)?;
            println!("{}", mount_point.display());
        }
        Command::Put { id } => driver.put(&id)?,
        Command::Diff { id } => {
            let digest = driver.diff(&id)?;
            println!("sha256:{digest}");
        }
        Command::Info { id } => {
            let layer_dir = driver.layer_dir(&id);
            if !paths::is_block_layer(&layer_dir) {
                anyhow::bail!("{id} is not a block layer");
            }
            let (digest, size) = paths::meta_info(&layer_dir)?;
            println!("sha256:{digest} {size}");
        }
    }

    Ok(())
}
