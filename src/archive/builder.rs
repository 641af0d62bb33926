//! Packing a product source tree into a package archive

use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};

use walkdir::{DirEntry, WalkDir};

use super::{is_valid_custom_name, write_tar, Area, Compression, PackageFileName, SubArchiveName};
use crate::control::{ControlFile, CONTROL_FILENAME};
use crate::error::{FleetpkgError, Result};

/// Version control directories never packed
const VCS_DIRS: &[&str] = &[".git", ".svn", ".hg", ".bzr", "CVS"];

/// Builds a `.fpkg` archive from a source tree laid out as
/// `OPSI/`, `CLIENT_DATA/`, `SERVER_DATA/` (plus optional `.custom` variants)
#[derive(Debug, Clone)]
pub struct ArchiveBuilder {
    source: PathBuf,
    custom_name: Option<String>,
    compression: Compression,
    output_dir: PathBuf,
    work_dir: PathBuf,
}

impl ArchiveBuilder {
    pub fn new(source: &Path) -> Self {
        Self {
            source: source.to_path_buf(),
            custom_name: None,
            compression: Compression::default(),
            output_dir: PathBuf::from("."),
            work_dir: std::env::temp_dir(),
        }
    }

    pub fn custom_name(mut self, name: Option<&str>) -> Self {
        self.custom_name = name.map(|n| n.to_string());
        self
    }

    pub fn compression(mut self, compression: Compression) -> Self {
        self.compression = compression;
        self
    }

    pub fn output_dir(mut self, dir: &Path) -> Self {
        self.output_dir = dir.to_path_buf();
        self
    }

    pub fn work_dir(mut self, dir: &Path) -> Self {
        self.work_dir = dir.to_path_buf();
        self
    }

    /// Read the control file that identifies the package
    pub fn control(&self) -> Result<ControlFile> {
        let label = self.source.display().to_string();

        let custom_control = self.custom_name.as_ref().map(|custom| {
            self.source
                .join(format!("{}.{}", Area::Opsi.dir_name(), custom))
                .join(CONTROL_FILENAME)
        });
        let path = match custom_control {
            Some(path) if path.is_file() => path,
            _ => self.source.join(Area::Opsi.dir_name()).join(CONTROL_FILENAME),
        };

        if !path.is_file() {
            return Err(FleetpkgError::packaging(
                &label,
                format!("no control file at {}", path.display()),
            ));
        }

        ControlFile::from_file(&path)
            .map_err(|e| FleetpkgError::packaging(&label, format!("{}: {}", path.display(), e)))
    }

    /// Pack the source tree and return the path of the written archive
    pub fn pack(&self) -> Result<PathBuf> {
        if let Some(custom) = &self.custom_name {
            if !is_valid_custom_name(custom) {
                return Err(FleetpkgError::packaging(
                    &self.source.display().to_string(),
                    format!("custom name '{}' must be ASCII alphanumeric", custom),
                ));
            }
        }

        let control = self.control()?;
        let product_id = control.product.id.clone();
        let file_name = PackageFileName {
            product_id: product_id.clone(),
            product_version: control.product.product_version.clone(),
            package_version: control.package.version.clone(),
            custom_name: self.custom_name.clone(),
        };

        tracing::info!("Packing {} from {}", file_name, self.source.display());

        // Dropping the work dir on any early return cleans it up
        let work = tempfile::Builder::new()
            .prefix(".fleetpkg-build-")
            .tempdir_in(&self.work_dir)
            .map_err(|e| FleetpkgError::packaging(&product_id, e))?;

        let mut members = Vec::new();
        for sub in self.sub_archives() {
            let dir = self.source.join(sub.dir_name());
            if !dir.is_dir() {
                continue;
            }

            let entries = collect_entries(&dir, sub.area == Area::ServerData)
                .map_err(|e| FleetpkgError::packaging(&product_id, e))?;
            if entries.is_empty() {
                tracing::debug!("Skipping empty {}", sub.dir_name());
                continue;
            }

            let name = sub.to_string();
            let dest = work.path().join(&name);
            write_tar(&dest, &dir, &entries, self.compression).map_err(|e| {
                FleetpkgError::packaging(&product_id, format!("{}: {}", name, e))
            })?;

            tracing::debug!("Wrote {} ({} entries)", name, entries.len());
            members.push((name, dest));
        }

        let output = self.output_dir.join(file_name.to_string());
        write_outer(&output, &self.output_dir, &members)
            .map_err(|e| FleetpkgError::packaging(&product_id, e))?;

        tracing::info!("Created {}", output.display());
        Ok(output)
    }

    /// Candidate sub-archives in packing order
    fn sub_archives(&self) -> Vec<SubArchiveName> {
        let mut names = Vec::new();
        for area in Area::ALL {
            names.push(SubArchiveName {
                area,
                custom_name: None,
                compression: self.compression,
            });
            if let Some(custom) = &self.custom_name {
                names.push(SubArchiveName {
                    area,
                    custom_name: Some(custom.clone()),
                    compression: self.compression,
                });
            }
        }
        names
    }
}

/// Bundle the sub-archives, renaming into place only once complete
fn write_outer(output: &Path, output_dir: &Path, members: &[(String, PathBuf)]) -> std::io::Result<()> {
    std::fs::create_dir_all(output_dir)?;
    let temp = tempfile::NamedTempFile::new_in(output_dir)?;

    let mut builder = tar::Builder::new(temp.reopen()?);
    for (name, path) in members {
        let mut file = File::open(path)?;
        builder.append_file(name, &mut file)?;
    }
    let mut file = builder.into_inner()?;
    file.flush()?;
    file.sync_all()?;

    temp.persist(output).map_err(|e| e.error)?;
    Ok(())
}

/// Collect relative paths below `dir` in sorted order
fn collect_entries(dir: &Path, skip_top_level: bool) -> walkdir::Result<Vec<PathBuf>> {
    let mut entries = Vec::new();

    let walker = WalkDir::new(dir)
        .min_depth(1)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|e| !is_vcs_dir(e));

    for entry in walker {
        let entry = entry?;
        if is_backup_file(&entry) {
            tracing::debug!("Skipping backup file {}", entry.path().display());
            continue;
        }
        if skip_top_level && entry.depth() == 1 {
            tracing::debug!("Skipping top-level server entry {}", entry.path().display());
            continue;
        }
        if let Ok(rel) = entry.path().strip_prefix(dir) {
            entries.push(rel.to_path_buf());
        }
    }

    Ok(entries)
}

fn is_vcs_dir(entry: &DirEntry) -> bool {
    entry.file_type().is_dir()
        && entry
            .file_name()
            .to_str()
            .map(|n| VCS_DIRS.contains(&n))
            .unwrap_or(false)
}

fn is_backup_file(entry: &DirEntry) -> bool {
    !entry.file_type().is_dir()
        && entry
            .file_name()
            .to_str()
            .map(|n| n.ends_with('~') || n.ends_with(".bak"))
            .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    const CONTROL: &str = "[Package]\nversion: 2\n\n[Product]\ntype: localboot\nid: demo\nname: Demo\nversion: 1.0\npriority: 0\n";

    fn source_tree() -> TempDir {
        let dir = TempDir::new().unwrap();
        let root = dir.path();
        fs::create_dir_all(root.join("OPSI")).unwrap();
        fs::write(root.join("OPSI/control"), CONTROL).unwrap();
        fs::create_dir_all(root.join("CLIENT_DATA/.git")).unwrap();
        fs::write(root.join("CLIENT_DATA/.git/HEAD"), "ref").unwrap();
        fs::write(root.join("CLIENT_DATA/setup.sh"), "#!/bin/sh\n").unwrap();
        fs::write(root.join("CLIENT_DATA/setup.sh~"), "old").unwrap();
        fs::write(root.join("CLIENT_DATA/notes.bak"), "old").unwrap();
        fs::create_dir_all(root.join("SERVER_DATA/etc")).unwrap();
        fs::write(root.join("SERVER_DATA/top.txt"), "x").unwrap();
        fs::write(root.join("SERVER_DATA/etc/demo.conf"), "x").unwrap();
        dir
    }

    #[test]
    fn test_collect_entries_excludes_vcs_and_backups() {
        let src = source_tree();
        let entries = collect_entries(&src.path().join("CLIENT_DATA"), false).unwrap();
        assert_eq!(entries, vec![PathBuf::from("setup.sh")]);
    }

    #[test]
    fn test_collect_server_entries_skips_top_level() {
        let src = source_tree();
        let entries = collect_entries(&src.path().join("SERVER_DATA"), true).unwrap();
        assert_eq!(entries, vec![PathBuf::from("etc/demo.conf")]);
    }

    #[test]
    fn test_pack_names_archive() {
        let src = source_tree();
        let out = TempDir::new().unwrap();

        let path = ArchiveBuilder::new(src.path())
            .output_dir(out.path())
            .work_dir(out.path())
            .pack()
            .unwrap();

        assert_eq!(path.file_name().unwrap(), "demo_1.0-2.fpkg");

        let mut outer = tar::Archive::new(File::open(&path).unwrap());
        let names: Vec<String> = outer
            .entries()
            .unwrap()
            .map(|e| e.unwrap().path().unwrap().display().to_string())
            .collect();
        assert_eq!(
            names,
            vec!["OPSI.tar.zst", "SERVER_DATA.tar.zst", "CLIENT_DATA.tar.zst"]
        );

        // Only the archive is left behind
        assert_eq!(fs::read_dir(out.path()).unwrap().count(), 1);
    }

    #[test]
    fn test_pack_without_control_fails() {
        let src = TempDir::new().unwrap();
        fs::create_dir_all(src.path().join("OPSI")).unwrap();
        let out = TempDir::new().unwrap();

        let err = ArchiveBuilder::new(src.path())
            .output_dir(out.path())
            .pack()
            .unwrap_err();
        assert!(matches!(err, FleetpkgError::Packaging { .. }));
        assert_eq!(fs::read_dir(out.path()).unwrap().count(), 0);
    }

    #[test]
    fn test_pack_rejects_bad_custom_name() {
        let src = source_tree();
        let err = ArchiveBuilder::new(src.path())
            .custom_name(Some("a_b"))
            .pack()
            .unwrap_err();
        assert!(matches!(err, FleetpkgError::Packaging { .. }));
    }
}
