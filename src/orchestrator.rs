//! Install and uninstall orchestration
//!
//! Install sequence for one archive:
//!
//! 1. lock the product (archive file name gives the id)
//! 2. read metadata and check `[Package] depends` against the depot
//! 3. run `preinst`
//! 4. drop the previous version's dependency and property records
//! 5. remove the previous client-data directory unless incremental
//! 6. unpack, write the manifest, apply access rights
//! 7. run `postinst`
//! 8. persist product records
//! 9. unlock
//!
//! Records are only written once `postinst` succeeds. Files written before a
//! failure stay on disk; the recovery path is to retry the install.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use crate::archive::{ArchiveInstaller, PackageFileName};
use crate::config::AccessRights;
use crate::control::ControlFile;
use crate::depot::Depot;
use crate::error::{FleetpkgError, Result};
use crate::lock::{LockGuard, PackageLock};
use crate::manifest::{FileManifest, Mismatch};
use crate::package::{ProductKey, ProductOnDepot};
use crate::pool::WorkerPool;
use crate::script::ScriptRunner;
use crate::storage::{ProductRecords, Storage};

/// Maintainer script run before unpacking
pub const PREINST: &str = "preinst";
/// Maintainer script run after unpacking
pub const POSTINST: &str = "postinst";

#[derive(Debug, Clone, Default)]
pub struct InstallOptions {
    /// Take the product lock even if another process holds it
    pub force: bool,
    /// Property name -> default values overriding the control file
    pub property_defaults: HashMap<String, Vec<String>>,
}

/// What an install produced
#[derive(Debug, Clone)]
pub struct InstallReport {
    pub product: ProductKey,
    pub client_data_dir: PathBuf,
    pub manifest_path: PathBuf,
    pub files: usize,
}

/// Drives installs and uninstalls on one depot
pub struct Orchestrator<'a> {
    depot: &'a Depot,
    storage: &'a dyn Storage,
    runner: &'a dyn ScriptRunner,
    pool: &'a WorkerPool,
    access_rights: AccessRights,
}

impl<'a> Orchestrator<'a> {
    pub fn new(
        depot: &'a Depot,
        storage: &'a dyn Storage,
        runner: &'a dyn ScriptRunner,
        pool: &'a WorkerPool,
    ) -> Self {
        Self {
            depot,
            storage,
            runner,
            pool,
            access_rights: AccessRights::default(),
        }
    }

    pub fn with_access_rights(mut self, rights: AccessRights) -> Self {
        self.access_rights = rights;
        self
    }

    /// Install a package archive onto the depot
    pub fn install(&self, archive: &Path, options: &InstallOptions) -> Result<InstallReport> {
        let name = PackageFileName::from_path(archive)?;
        let guard = self.lock(&name.product_id, options.force)?;

        let report = self.install_locked(archive, &name, options)?;

        guard.release()?;
        tracing::info!("Installed {} on {}", report.product, self.depot.id);
        Ok(report)
    }

    fn install_locked(
        &self,
        archive: &Path,
        name: &PackageFileName,
        options: &InstallOptions,
    ) -> Result<InstallReport> {
        let mut installer = ArchiveInstaller::open(archive, self.depot)?;
        let control = installer.read_metadata()?.clone();
        let product_id = control.product.id.clone();

        if product_id != name.product_id {
            return Err(FleetpkgError::packaging(
                &name.product_id,
                format!("archive contains product {}", product_id),
            ));
        }

        let properties = apply_property_defaults(&control, &options.property_defaults)?;
        self.check_dependencies(&control)?;

        let client_dir = self.depot.client_data_dir(&product_id);
        let env = vec![
            ("PRODUCT_ID".to_string(), product_id.clone()),
            (
                "CLIENT_DATA_DIR".to_string(),
                client_dir.display().to_string(),
            ),
        ];

        self.run_script(&installer.opsi_dir(), PREINST, &product_id, &env)?;

        if let Some(previous) = self
            .storage
            .get_product_on_depot(&product_id, &self.depot.id)?
        {
            tracing::info!("Replacing {} {}", product_id, previous.full_version());
            let key = previous.key();
            self.storage.delete_product_dependencies(&key)?;
            self.storage.delete_product_properties(&key)?;
        }

        if client_dir.exists() && !control.package.incremental {
            tracing::info!("Removing previous client data {}", client_dir.display());
            fs::remove_dir_all(&client_dir).map_err(|e| {
                FleetpkgError::packaging(
                    &product_id,
                    format!("removing previous client data: {}", e),
                )
            })?;
        }

        installer.unpack()?;
        let manifest_path = installer.write_manifest(self.pool)?;
        installer.set_access_rights(&self.access_rights)?;

        self.run_script(&installer.opsi_dir(), POSTINST, &product_id, &env)?;

        self.storage.store_product_records(&ProductRecords {
            product: control.product.clone(),
            dependencies: control.dependencies.clone(),
            properties,
            on_depot: ProductOnDepot {
                product_id: product_id.clone(),
                depot_id: self.depot.id.clone(),
                product_version: control.product.product_version.clone(),
                package_version: control.product.package_version.clone(),
                product_type: control.product.product_type,
                install_date: chrono::Utc::now().timestamp(),
            },
        })?;

        Ok(InstallReport {
            product: control.product.key(),
            client_data_dir: client_dir,
            manifest_path,
            files: installer.client_paths().len() + installer.server_paths().len(),
        })
    }

    /// Remove a product from the depot
    pub fn uninstall(&self, product_id: &str, delete_files: bool) -> Result<()> {
        let guard = self.lock(product_id, false)?;

        let record = self
            .storage
            .get_product_on_depot(product_id, &self.depot.id)?
            .ok_or_else(|| FleetpkgError::ProductNotInstalled {
                product_id: product_id.to_string(),
                depot_id: self.depot.id.clone(),
            })?;

        self.storage
            .delete_product_on_depot(product_id, &self.depot.id)?;

        let key = record.key();
        self.storage.delete_product_dependencies(&key)?;
        self.storage.delete_product_properties(&key)?;
        self.storage.delete_product(&key)?;

        let client_dir = self.depot.client_data_dir(product_id);
        if delete_files && client_dir.exists() {
            tracing::info!("Removing {}", client_dir.display());
            fs::remove_dir_all(&client_dir).map_err(|e| {
                FleetpkgError::packaging(product_id, format!("removing client data: {}", e))
            })?;
        }

        guard.release()?;
        tracing::info!("Uninstalled {} from {}", key, self.depot.id);
        Ok(())
    }

    /// Compare installed files against the product's manifest
    pub fn verify(&self, product_id: &str) -> Result<Vec<Mismatch>> {
        if self
            .storage
            .get_product_on_depot(product_id, &self.depot.id)?
            .is_none()
        {
            return Err(FleetpkgError::ProductNotInstalled {
                product_id: product_id.to_string(),
                depot_id: self.depot.id.clone(),
            });
        }

        let manifest = FileManifest::read(&self.depot.manifest_path(product_id))?;
        manifest.audit(
            &self.depot.client_data_dir(product_id),
            &self.depot.server_root,
        )
    }

    fn lock(&self, product_id: &str, force: bool) -> Result<LockGuard> {
        match PackageLock::acquire(&self.depot.lock_dir, product_id) {
            Ok(guard) => Ok(guard),
            Err(FleetpkgError::Locked { pid, .. }) if force => {
                tracing::warn!("Forcing lock on {} held by pid {}", product_id, pid);
                PackageLock::steal(&self.depot.lock_dir, product_id)
            }
            Err(FleetpkgError::Locked { pid, .. }) => Err(FleetpkgError::Temporary(format!(
                "{} is locked by process {}",
                product_id, pid
            ))),
            Err(e) => Err(e),
        }
    }

    /// Each `[Package] depends` entry must be on the depot in a matching version
    fn check_dependencies(&self, control: &ControlFile) -> Result<()> {
        for dependency in &control.package.depends {
            let installed = self
                .storage
                .get_product_on_depot(&dependency.package, &self.depot.id)?;

            let unsatisfied = |requirement: String| FleetpkgError::DependencyUnsatisfied {
                product_id: control.product.id.clone(),
                package: dependency.package.clone(),
                requirement,
            };

            let Some(installed) = installed else {
                return Err(unsatisfied("is not installed".to_string()));
            };

            if let Some(condition) = &dependency.condition {
                if !condition.is_satisfied_by(&installed.full_version())? {
                    return Err(unsatisfied(format!(
                        "{} (installed {})",
                        condition,
                        installed.full_version()
                    )));
                }
            }
            tracing::debug!("Dependency {} satisfied", dependency);
        }
        Ok(())
    }

    fn run_script(
        &self,
        opsi_dir: &Path,
        stage: &str,
        product_id: &str,
        env: &[(String, String)],
    ) -> Result<()> {
        let script = opsi_dir.join(stage);
        if !script.is_file() {
            return Ok(());
        }

        let output = self.runner.run(&script, env, opsi_dir)?;
        if !output.success() {
            return Err(FleetpkgError::Script {
                product_id: product_id.to_string(),
                stage: stage.to_string(),
                exit_code: output.exit_code,
                output: output.lines,
            });
        }
        Ok(())
    }
}

/// Property definitions with caller defaults applied
fn apply_property_defaults(
    control: &ControlFile,
    overrides: &HashMap<String, Vec<String>>,
) -> Result<Vec<crate::package::ProductProperty>> {
    let mut properties = control.properties.clone();

    for (name, values) in overrides {
        let Some(property) = properties.iter_mut().find(|p| &p.name == name) else {
            tracing::warn!("Ignoring default for unknown property {}", name);
            continue;
        };
        property.set_defaults(values.clone()).map_err(|e| {
            FleetpkgError::packaging(&control.product.id, format!("property {}: {}", name, e))
        })?;
    }

    Ok(properties)
}
