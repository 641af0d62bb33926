//! Verify command implementation

use anyhow::{bail, Result};
use colored::Colorize;

use fleetpkg::config::Config;
use fleetpkg::orchestrator::Orchestrator;
use fleetpkg::script::ProcessRunner;
use fleetpkg::storage::Storage;

pub fn run(product: Option<&str>, config: &Config) -> Result<()> {
    let depot = super::depot(config)?;
    let storage = super::open_storage(config)?;
    let pool = super::worker_pool(config)?;
    let runner = ProcessRunner;
    let orchestrator = Orchestrator::new(&depot, &storage, &runner, &pool);

    let products: Vec<String> = match product {
        Some(id) => vec![id.to_string()],
        None => storage
            .get_products_on_depot(&depot.id)?
            .into_iter()
            .map(|r| r.product_id)
            .collect(),
    };

    if products.is_empty() {
        println!("{}", "No products installed.".yellow());
        return Ok(());
    }

    let mut bad = 0;
    for id in &products {
        let mismatches = orchestrator.verify(id)?;
        if mismatches.is_empty() {
            println!("  {} {}", "✓".green(), id.bold());
            continue;
        }

        bad += 1;
        println!("  {} {}", "✗".red(), id.bold());
        for mismatch in &mismatches {
            println!(
                "    {}: expected {}, got {}",
                mismatch.path.display(),
                mismatch.expected,
                mismatch.actual.red()
            );
        }
    }

    pool.shutdown();

    if bad > 0 {
        bail!("{} of {} product(s) failed verification", bad, products.len());
    }
    Ok(())
}
