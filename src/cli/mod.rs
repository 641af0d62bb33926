//! Command-line interface for fleetpkg

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Subcommand;

use fleetpkg::archive::Compression;
use fleetpkg::config::Config;
use fleetpkg::depot::Depot;
use fleetpkg::pool::WorkerPool;
use fleetpkg::storage::SqliteStorage;

mod build;
mod info;
mod install;
mod list;
mod resolve;
mod uninstall;
mod unlock;
mod verify;

#[derive(Subcommand)]
pub enum Commands {
    /// Build a package archive from a source tree
    Build {
        /// Directory containing OPSI/, CLIENT_DATA/ and SERVER_DATA/
        #[arg(default_value = ".")]
        source: PathBuf,

        /// Custom variant to include (OPSI.<name>, CLIENT_DATA.<name>, ...)
        #[arg(long)]
        custom_name: Option<String>,

        /// Output directory for the archive
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Sub-archive compression (none, gzip, zstd)
        #[arg(long)]
        compression: Option<Compression>,

        /// Install onto the depot after building
        #[arg(long)]
        install: bool,
    },

    /// Install package archives onto the depot
    Install {
        /// Path(s) to .fpkg archives
        #[arg(required = true)]
        archives: Vec<PathBuf>,

        /// Take the product lock even if another process holds it
        #[arg(long)]
        force: bool,

        /// Override a property default: NAME=VALUE[,VALUE...]
        #[arg(short, long = "property", value_name = "NAME=VALUES")]
        properties: Vec<String>,
    },

    /// Remove products from the depot
    Uninstall {
        /// Product id(s)
        #[arg(required = true)]
        products: Vec<String>,

        /// Keep the client-data directory
        #[arg(long)]
        keep_files: bool,
    },

    /// Show a product on the depot, or the metadata of an archive
    Info {
        /// Product id or path to a .fpkg archive
        target: String,
    },

    /// Verify installed files against their manifests
    Verify {
        /// Product id (all installed products if omitted)
        product: Option<String>,
    },

    /// Compute per-host action sequences
    Resolve {
        /// JSON file mapping host ids to desired product states
        input: PathBuf,

        /// Keep snapshot order instead of ordering by priority
        #[arg(long)]
        no_priorities: bool,

        /// Don't propagate actions along dependencies
        #[arg(long)]
        no_dependencies: bool,

        /// Sort topologically when sequence correction doesn't converge
        #[arg(long)]
        accurate: bool,

        /// Only keep actions for these products
        #[arg(long, value_delimiter = ',')]
        filter: Vec<String>,

        /// Store the resolved states
        #[arg(long)]
        apply: bool,
    },

    /// List products installed on the depot
    List {
        /// Only show products whose id contains this
        #[arg(short, long)]
        filter: Option<String>,
    },

    /// Remove a product lock left behind by a crashed process
    Unlock {
        /// Product id
        product: String,
    },
}

/// Execute a CLI command
pub fn execute(command: Commands, config: &Config) -> Result<()> {
    match command {
        Commands::Build {
            source,
            custom_name,
            output,
            compression,
            install,
        } => build::run(
            &source,
            custom_name.as_deref(),
            output.as_deref(),
            compression,
            install,
            config,
        ),
        Commands::Install {
            archives,
            force,
            properties,
        } => install::run(&archives, force, &properties, config),
        Commands::Uninstall {
            products,
            keep_files,
        } => uninstall::run(&products, !keep_files, config),
        Commands::Info { target } => info::run(&target, config),
        Commands::Verify { product } => verify::run(product.as_deref(), config),
        Commands::Resolve {
            input,
            no_priorities,
            no_dependencies,
            accurate,
            filter,
            apply,
        } => {
            let mut options = fleetpkg::resolver::ResolverOptions::from(&config.resolver);
            if no_priorities {
                options.process_priorities = false;
            }
            if no_dependencies {
                options.process_dependencies = false;
            }
            if accurate {
                options.force_accurate_sequence = true;
            }
            if !filter.is_empty() {
                options.action_processing_filter = Some(filter.into_iter().collect());
            }
            resolve::run(&input, &options, apply, config)
        }
        Commands::List { filter } => list::run(filter.as_deref(), config),
        Commands::Unlock { product } => unlock::run(&product, config),
    }
}

fn depot(config: &Config) -> Result<Depot> {
    Depot::from_config(config).context("Invalid depot configuration")
}

fn open_storage(config: &Config) -> Result<SqliteStorage> {
    SqliteStorage::open(&config.database.path).with_context(|| {
        format!(
            "Failed to open database: {}",
            config.database.path.display()
        )
    })
}

fn worker_pool(config: &Config) -> Result<WorkerPool> {
    WorkerPool::new(config.workers.threads).context("Failed to start worker pool")
}
