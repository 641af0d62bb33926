//! Uninstall command implementation

use anyhow::{bail, Result};
use colored::Colorize;

use fleetpkg::config::Config;
use fleetpkg::orchestrator::Orchestrator;
use fleetpkg::script::ProcessRunner;

pub fn run(products: &[String], delete_files: bool, config: &Config) -> Result<()> {
    let depot = super::depot(config)?;
    let storage = super::open_storage(config)?;
    let pool = super::worker_pool(config)?;
    let runner = ProcessRunner;
    let orchestrator = Orchestrator::new(&depot, &storage, &runner, &pool);

    let mut failed = 0;
    for product in products {
        match orchestrator.uninstall(product, delete_files) {
            Ok(()) => println!("  {} Removed {}", "✓".green(), product.bold()),
            Err(e) => {
                failed += 1;
                println!("  {} {}", "✗".red(), e);
            }
        }
    }

    if !delete_files {
        println!();
        println!("{}", "Client-data directories were kept.".yellow());
    }

    pool.shutdown();

    if failed > 0 {
        bail!("{} of {} product(s) failed to uninstall", failed, products.len());
    }
    Ok(())
}
