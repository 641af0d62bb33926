//! Info command implementation

use std::path::Path;

use anyhow::{bail, Result};
use colored::Colorize;

use fleetpkg::archive::ArchiveInstaller;
use fleetpkg::config::Config;
use fleetpkg::package::{DependencyTarget, Product, ProductDependency, ProductProperty, Requirement};
use fleetpkg::storage::Storage;

pub fn run(target: &str, config: &Config) -> Result<()> {
    let depot = super::depot(config)?;
    let path = Path::new(target);

    if path.is_file() {
        let mut installer = ArchiveInstaller::open(path, &depot)?;
        let control = installer.read_metadata()?;

        print_product(&control.product);
        if !control.package.depends.is_empty() {
            println!();
            println!("{}", "Package dependencies:".bold());
            for dependency in &control.package.depends {
                println!("  {}", dependency);
            }
        }
        print_dependencies(&control.dependencies);
        print_properties(&control.properties);
        return Ok(());
    }

    let storage = super::open_storage(config)?;
    let Some(record) = storage.get_product_on_depot(target, &depot.id)? else {
        bail!("Product {} is not installed on depot {}", target, depot.id);
    };

    let key = record.key();
    let Some(product) = storage.get_product(&key)? else {
        bail!("No product definition stored for {}", key);
    };

    print_product(&product);
    println!(
        "  {:<12} {}",
        "Installed:",
        chrono::DateTime::from_timestamp(record.install_date, 0)
            .map(|d| d.to_rfc3339())
            .unwrap_or_else(|| record.install_date.to_string())
    );
    println!(
        "  {:<12} {}",
        "Location:",
        depot.client_data_dir(&product.id).display()
    );
    print_dependencies(&storage.get_product_dependencies(&key)?);
    print_properties(&storage.get_product_properties(&key)?);

    Ok(())
}

fn print_product(product: &Product) {
    println!("{}: {}", "Product".bold(), product.id.cyan());
    println!("  {:<12} {}", "Name:", product.name);
    println!("  {:<12} {}", "Version:", product.full_version());
    println!("  {:<12} {}", "Type:", product.product_type);
    println!("  {:<12} {}", "Priority:", product.priority);
    if !product.description.is_empty() {
        println!("  {:<12} {}", "Description:", product.description.replace('\n', " "));
    }
    if !product.product_class_ids.is_empty() {
        println!("  {:<12} {}", "Classes:", product.product_class_ids.join(", "));
    }
}

fn print_dependencies(dependencies: &[ProductDependency]) {
    if dependencies.is_empty() {
        return;
    }
    println!();
    println!("{}", "Dependencies:".bold());
    for dependency in dependencies {
        let target = match &dependency.target {
            DependencyTarget::Product(id) => id.clone(),
            DependencyTarget::ProductClass(class) => format!("class {}", class),
        };
        let requirement = match dependency.requirement {
            Requirement::Action(action) => format!("action {}", action),
            Requirement::Status(status) => format!("status {}", status),
        };
        let order = dependency
            .requirement_type
            .map(|t| format!(" ({})", t))
            .unwrap_or_default();
        println!(
            "  {} -> {} {}{}",
            dependency.action, target, requirement, order
        );
    }
}

fn print_properties(properties: &[ProductProperty]) {
    if properties.is_empty() {
        return;
    }
    println!();
    println!("{}", "Properties:".bold());
    for property in properties {
        println!(
            "  {} = [{}]",
            property.name.bold(),
            property.default_values().join(", ")
        );
        let possible = property.possible_values();
        if !possible.is_empty() {
            println!("    {}", format!("values: {}", possible.join(", ")).dimmed());
        }
    }
}
