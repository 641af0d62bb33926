//! Unlock command implementation

use anyhow::Result;
use colored::Colorize;

use fleetpkg::config::Config;
use fleetpkg::lock::PackageLock;

pub fn run(product: &str, config: &Config) -> Result<()> {
    let depot = super::depot(config)?;

    match PackageLock::holder(&depot.lock_dir, product) {
        Some(holder) => println!(
            "  Lock on {} held by pid {} since {}",
            product.bold(),
            holder.pid,
            holder.acquired
        ),
        None if PackageLock::path(&depot.lock_dir, product).exists() => {
            println!("  Lock file of {} is unreadable", product.bold());
        }
        None => {
            println!("  {} is not locked", product.bold());
            return Ok(());
        }
    }

    PackageLock::release(&depot.lock_dir, product)?;
    println!("  {} Unlocked {}", "✓".green(), product.bold());
    Ok(())
}
