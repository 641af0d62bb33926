//! Install command implementation

use std::collections::HashMap;
use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use colored::Colorize;

use fleetpkg::config::Config;
use fleetpkg::orchestrator::{InstallOptions, Orchestrator};
use fleetpkg::script::ProcessRunner;
use fleetpkg::FleetpkgError;

pub fn run(archives: &[PathBuf], force: bool, properties: &[String], config: &Config) -> Result<()> {
    let options = InstallOptions {
        force,
        property_defaults: parse_properties(properties)?,
    };

    let depot = super::depot(config)?;
    let storage = super::open_storage(config)?;
    let pool = super::worker_pool(config)?;
    let runner = ProcessRunner;
    let orchestrator = Orchestrator::new(&depot, &storage, &runner, &pool)
        .with_access_rights(config.access_rights.clone());

    let mut failed = 0;
    for archive in archives {
        println!("{} {}", "Installing".cyan(), archive.display());

        match orchestrator.install(archive, &options) {
            Ok(report) => println!(
                "  {} {} ({} paths, manifest {})",
                "✓".green(),
                report.product.to_string().bold(),
                report.files,
                report.manifest_path.display()
            ),
            Err(e) => {
                failed += 1;
                println!("  {} {}", "✗".red(), e);
                if let FleetpkgError::Script { output, .. } = &e {
                    for line in output {
                        println!("    {}", line.dimmed());
                    }
                }
                if e.is_retryable() {
                    println!("    {}", "(retry later or use --force)".yellow());
                }
            }
        }
    }

    pool.shutdown();

    if failed > 0 {
        bail!("{} of {} package(s) failed to install", failed, archives.len());
    }
    Ok(())
}

/// `NAME=a,b` pairs into property default overrides
fn parse_properties(properties: &[String]) -> Result<HashMap<String, Vec<String>>> {
    let mut defaults = HashMap::new();
    for property in properties {
        let (name, values) = property
            .split_once('=')
            .with_context(|| format!("Expected NAME=VALUES, got '{}'", property))?;
        let values: Vec<String> = values
            .split(',')
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
            .collect();
        defaults.insert(name.trim().to_string(), values);
    }
    Ok(defaults)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_properties() {
        let parsed = parse_properties(&["lang=de, en".to_string(), "silent=true".to_string()])
            .unwrap();
        assert_eq!(parsed["lang"], vec!["de", "en"]);
        assert_eq!(parsed["silent"], vec!["true"]);

        assert!(parse_properties(&["broken".to_string()]).is_err());
    }
}
