//! Resolve command implementation

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{Context, Result};
use colored::Colorize;

use fleetpkg::config::Config;
use fleetpkg::resolver::{self, DesiredState, ProductCatalog, ResolverOptions};
use fleetpkg::storage::Storage;

pub fn run(input: &Path, options: &ResolverOptions, apply: bool, config: &Config) -> Result<()> {
    let content = std::fs::read_to_string(input)
        .with_context(|| format!("Failed to read {}", input.display()))?;
    let desired: BTreeMap<String, Vec<DesiredState>> = serde_json::from_str(&content)
        .with_context(|| format!("Failed to parse {}", input.display()))?;

    let depot = super::depot(config)?;
    let storage = super::open_storage(config)?;
    let catalog = ProductCatalog::from_storage(&storage, &depot.id)?;

    let mut current = BTreeMap::new();
    for host_id in desired.keys() {
        current.insert(host_id.clone(), storage.get_product_on_client(host_id)?);
    }

    let plans = resolver::resolve(&catalog, &current, &desired, options)?;
    println!("{}", serde_json::to_string_pretty(&plans)?);

    if apply {
        let mut written = 0;
        for plan in plans.values() {
            for state in plan {
                storage.set_product_on_client(state)?;
                written += 1;
            }
        }
        eprintln!(
            "{} Stored {} product state(s) for {} host(s)",
            "✓".green(),
            written,
            plans.len()
        );
    }

    Ok(())
}
