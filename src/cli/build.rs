//! Build command implementation

use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Result};
use colored::Colorize;
use indicatif::{ProgressBar, ProgressStyle};

use fleetpkg::archive::{ArchiveBuilder, Compression};
use fleetpkg::config::Config;

pub fn run(
    source: &Path,
    custom_name: Option<&str>,
    output: Option<&Path>,
    compression: Option<Compression>,
    install: bool,
    config: &Config,
) -> Result<()> {
    if !source.is_dir() {
        bail!("Source directory not found: {}", source.display());
    }

    let builder = ArchiveBuilder::new(source)
        .custom_name(custom_name)
        .compression(compression.unwrap_or(config.build.compression))
        .output_dir(output.unwrap_or(&config.build.output_dir))
        .work_dir(&config.depot.work_dir);

    println!("{}", "Reading control file...".cyan());
    let control = builder.control()?;
    println!(
        "  {} {} {}",
        "✓".green(),
        control.product.id.bold(),
        control.product.full_version()
    );

    let spinner = ProgressBar::new_spinner();
    spinner.set_style(ProgressStyle::default_spinner().template("  {spinner} {msg}")?);
    spinner.set_message("Packing archive...");
    spinner.enable_steady_tick(Duration::from_millis(100));

    let result = builder.pack();
    spinner.finish_and_clear();
    let archive = result?;

    println!("  {} Packed", "✓".green());
    println!();
    println!("{} {}", "Output:".bold(), archive.display());

    if install {
        println!();
        super::install::run(&[archive], false, &[], config)?;
    }

    Ok(())
}
