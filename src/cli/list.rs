//! List command implementation

use anyhow::Result;
use colored::Colorize;

use fleetpkg::config::Config;
use fleetpkg::storage::Storage;

pub fn run(filter: Option<&str>, config: &Config) -> Result<()> {
    let depot = super::depot(config)?;
    let storage = super::open_storage(config)?;

    let records: Vec<_> = storage
        .get_products_on_depot(&depot.id)?
        .into_iter()
        .filter(|r| filter.map(|f| r.product_id.contains(f)).unwrap_or(true))
        .collect();

    println!("{} {}", "Products on".bold(), depot.id.cyan());
    if records.is_empty() {
        println!("  (none)");
        return Ok(());
    }

    for record in &records {
        println!(
            "  {:<30} {:<16} {}",
            record.product_id.bold(),
            record.full_version(),
            record.product_type.to_string().dimmed()
        );
    }

    if let Some(f) = filter {
        println!();
        println!("  Filter: {}", f.cyan());
    }

    Ok(())
}
