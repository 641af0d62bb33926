//! Unpacking a package archive onto a depot

use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};

use tempfile::TempDir;

use super::{extract_tracked, Area, SubArchiveName};
use crate::config::AccessRights;
use crate::control::{ControlFile, CONTROL_FILENAME};
use crate::depot::{manifest_filename, Depot};
use crate::error::{FleetpkgError, Result};
use crate::manifest::FileManifest;
use crate::pool::WorkerPool;

/// Installs one archive, tracking everything it writes
///
/// The private temp directory is removed when the installer is dropped.
pub struct ArchiveInstaller {
    archive: PathBuf,
    depot: Depot,
    temp: TempDir,
    /// Outer members already copied into `temp`
    members: Vec<(SubArchiveName, PathBuf)>,
    control: Option<ControlFile>,
    client_paths: Vec<PathBuf>,
    server_paths: Vec<PathBuf>,
}

impl ArchiveInstaller {
    pub fn open(archive: &Path, depot: &Depot) -> Result<Self> {
        let label = archive.display().to_string();
        if !archive.is_file() {
            return Err(FleetpkgError::packaging(&label, "archive not found"));
        }

        let work_error = |e: io::Error| {
            FleetpkgError::packaging(
                &label,
                format!("work directory {}: {}", depot.work_dir.display(), e),
            )
        };
        fs::create_dir_all(&depot.work_dir).map_err(work_error)?;
        let temp = tempfile::Builder::new()
            .prefix(".fleetpkg-install-")
            .tempdir_in(&depot.work_dir)
            .map_err(work_error)?;

        Ok(Self {
            archive: archive.to_path_buf(),
            depot: depot.clone(),
            temp,
            members: Vec::new(),
            control: None,
            client_paths: Vec::new(),
            server_paths: Vec::new(),
        })
    }

    /// Extract only the OPSI area and parse its control file
    pub fn read_metadata(&mut self) -> Result<&ControlFile> {
        if self.control.is_none() {
            self.extract_members(|name| name.area == Area::Opsi)?;

            let opsi: Vec<(SubArchiveName, PathBuf)> = self
                .members
                .iter()
                .filter(|(name, _)| name.area == Area::Opsi)
                .cloned()
                .collect();

            // A custom OPSI variant replaces the base one
            let chosen = opsi
                .iter()
                .find(|(name, _)| name.custom_name.is_some())
                .or_else(|| opsi.first())
                .ok_or_else(|| self.error("archive has no OPSI area"))?;

            let dest = self.opsi_dir();
            extract_tracked(&chosen.1, &dest, false)
                .map_err(|e| self.error(format!("{}: {}", chosen.0, e)))?;

            let control_path = dest.join(CONTROL_FILENAME);
            let control = ControlFile::from_file(&control_path)
                .map_err(|e| self.error(format!("control file: {}", e)))?;
            tracing::info!(
                "Read metadata of {} {}",
                control.product.id,
                control.product.full_version()
            );
            self.control = Some(control);
        }

        self.control()
    }

    /// Extract SERVER_DATA and CLIENT_DATA onto the depot
    pub fn unpack(&mut self) -> Result<()> {
        self.read_metadata()?;
        self.extract_members(|name| name.area != Area::Opsi)?;

        let client_dir = self.client_data_dir()?;
        fs::create_dir_all(&client_dir).map_err(|e| {
            self.error(format!(
                "client data directory {}: {}",
                client_dir.display(),
                e
            ))
        })?;

        for (area, dest, skip_top_level) in [
            (Area::ServerData, self.depot.server_root.clone(), true),
            (Area::ClientData, client_dir, false),
        ] {
            for (name, path) in self.layered(area) {
                tracing::info!("Extracting {} to {}", name, dest.display());
                let extracted = extract_tracked(&path, &dest, skip_top_level)
                    .map_err(|e| self.error(format!("{}: {}", name, e)))?;

                match area {
                    Area::ServerData => self.server_paths.extend(extracted),
                    _ => self.client_paths.extend(extracted),
                }
            }
        }

        Ok(())
    }

    /// Write `<clientDataDir>/<productId>.files` for every tracked path
    pub fn write_manifest(&mut self, pool: &WorkerPool) -> Result<PathBuf> {
        let control = self.control()?;
        let product_id = control.product.id.clone();
        let client_dir = self.client_data_dir()?;

        let manifest = FileManifest::compute(
            &client_dir,
            &self.client_paths,
            &self.depot.server_root,
            &self.server_paths,
            pool,
        )
        .map_err(|e| self.error(format!("computing manifest: {}", e)))?;

        let path = self.depot.manifest_path(&product_id);
        manifest
            .write(&path)
            .map_err(|e| self.error(format!("writing {}: {}", path.display(), e)))?;
        self.client_paths.push(PathBuf::from(manifest_filename(&product_id)));

        tracing::info!("Wrote manifest with {} entries", manifest.len());
        Ok(path)
    }

    /// Apply configured ownership and modes to tracked client-data paths
    pub fn set_access_rights(&self, rights: &AccessRights) -> Result<()> {
        let client_dir = self.client_data_dir()?;
        let owner = lookup_owner(rights)?;

        let mut paths = vec![client_dir.clone()];
        paths.extend(self.client_paths.iter().map(|p| client_dir.join(p)));
        paths.sort();
        paths.dedup();

        for path in &paths {
            apply_rights(path, rights, owner).map_err(|e| {
                self.error(format!("access rights on {}: {}", path.display(), e))
            })?;
        }

        tracing::debug!("Set access rights on {} paths", paths.len());
        Ok(())
    }

    pub fn control(&self) -> Result<&ControlFile> {
        self.control
            .as_ref()
            .ok_or_else(|| self.error("metadata has not been read"))
    }

    /// Directory the OPSI area is unpacked into
    pub fn opsi_dir(&self) -> PathBuf {
        self.temp.path().join(Area::Opsi.dir_name())
    }

    pub fn client_data_dir(&self) -> Result<PathBuf> {
        Ok(self.depot.client_data_dir(&self.control()?.product.id))
    }

    pub fn client_paths(&self) -> &[PathBuf] {
        &self.client_paths
    }

    pub fn server_paths(&self) -> &[PathBuf] {
        &self.server_paths
    }

    /// Base variant first, then custom variants so they win
    fn layered(&self, area: Area) -> Vec<(SubArchiveName, PathBuf)> {
        let mut members: Vec<(SubArchiveName, PathBuf)> = self
            .members
            .iter()
            .filter(|(name, _)| name.area == area)
            .cloned()
            .collect();
        members.sort_by(|a, b| a.0.custom_name.cmp(&b.0.custom_name));
        members
    }

    /// Copy matching outer members into the temp directory
    fn extract_members(&mut self, wanted: impl Fn(&SubArchiveName) -> bool) -> Result<()> {
        let file = File::open(&self.archive)
            .map_err(|e| self.error(format!("opening archive: {}", e)))?;
        let mut outer = tar::Archive::new(file);
        let members_dir = self.temp.path().join("members");
        fs::create_dir_all(&members_dir)
            .map_err(|e| self.error(format!("staging directory: {}", e)))?;

        let entries = outer
            .entries()
            .map_err(|e| self.error(format!("not a package archive: {}", e)))?;

        for entry in entries {
            let mut entry = entry.map_err(|e| self.error(e))?;
            let raw = entry.path().map_err(|e| self.error(e))?.into_owned();
            let Some(name) = raw.to_str().and_then(SubArchiveName::parse) else {
                tracing::warn!("Ignoring unknown archive member {}", raw.display());
                continue;
            };

            if !wanted(&name) || self.members.iter().any(|(n, _)| n == &name) {
                continue;
            }

            let dest = members_dir.join(name.to_string());
            File::create(&dest)
                .and_then(|mut out| io::copy(&mut entry, &mut out))
                .map_err(|e| self.error(format!("staging {}: {}", name, e)))?;
            self.members.push((name, dest));
        }

        Ok(())
    }

    fn error(&self, message: impl std::fmt::Display) -> FleetpkgError {
        let product = match &self.control {
            Some(control) => control.product.id.clone(),
            None => self.archive.display().to_string(),
        };
        FleetpkgError::packaging(&product, message)
    }
}

#[cfg(unix)]
type Owner = (Option<u32>, Option<u32>);
#[cfg(not(unix))]
type Owner = ();

#[cfg(unix)]
fn lookup_owner(rights: &AccessRights) -> Result<Owner> {
    use std::ffi::CString;

    let uid = match &rights.user {
        Some(user) => {
            let name = CString::new(user.as_str())
                .map_err(|_| FleetpkgError::Config(format!("invalid user name '{}'", user)))?;
            // SAFETY: name is a valid C string; the returned record is read immediately
            let pw = unsafe { libc::getpwnam(name.as_ptr()) };
            if pw.is_null() {
                return Err(FleetpkgError::Config(format!("unknown user '{}'", user)));
            }
            Some(unsafe { (*pw).pw_uid })
        }
        None => None,
    };

    let gid = match &rights.group {
        Some(group) => {
            let name = CString::new(group.as_str())
                .map_err(|_| FleetpkgError::Config(format!("invalid group name '{}'", group)))?;
            // SAFETY: as above
            let gr = unsafe { libc::getgrnam(name.as_ptr()) };
            if gr.is_null() {
                return Err(FleetpkgError::Config(format!("unknown group '{}'", group)));
            }
            Some(unsafe { (*gr).gr_gid })
        }
        None => None,
    };

    Ok((uid, gid))
}

#[cfg(not(unix))]
fn lookup_owner(_rights: &AccessRights) -> Result<Owner> {
    Ok(())
}

#[cfg(unix)]
fn apply_rights(path: &Path, rights: &AccessRights, owner: Owner) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;

    let meta = match fs::symlink_metadata(path) {
        Ok(meta) => meta,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e.into()),
    };
    if meta.file_type().is_symlink() {
        return Ok(());
    }

    if owner.0.is_some() || owner.1.is_some() {
        std::os::unix::fs::chown(path, owner.0, owner.1)?;
    }

    let mode = if meta.is_dir() {
        rights.dir_mode
    } else if meta.permissions().mode() & 0o111 != 0 {
        rights.file_mode | 0o110
    } else {
        rights.file_mode
    };
    fs::set_permissions(path, fs::Permissions::from_mode(mode))?;
    Ok(())
}

#[cfg(not(unix))]
fn apply_rights(_path: &Path, _rights: &AccessRights, _owner: Owner) -> Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::{ArchiveBuilder, Compression};

    const CONTROL: &str = "[Package]\nversion: 1\n\n[Product]\ntype: localboot\nid: demo\nversion: 2.0\n";

    fn build(src: &Path, out: &Path, custom: Option<&str>) -> PathBuf {
        ArchiveBuilder::new(src)
            .custom_name(custom)
            .compression(Compression::Gzip)
            .output_dir(out)
            .work_dir(out)
            .pack()
            .unwrap()
    }

    fn layout() -> (TempDir, Depot) {
        let base = TempDir::new().unwrap();
        let depot_root = base.path().join("depot");
        let depot = Depot::new("depot1", &format!("file://{}", depot_root.display()))
            .unwrap()
            .with_lock_dir(base.path())
            .with_work_dir(base.path())
            .with_server_root(&base.path().join("server"));
        (base, depot)
    }

    #[test]
    fn test_unpack_layers_custom_over_base() {
        let src = TempDir::new().unwrap();
        let root = src.path();
        fs::create_dir_all(root.join("OPSI")).unwrap();
        fs::write(root.join("OPSI/control"), CONTROL).unwrap();
        fs::create_dir_all(root.join("CLIENT_DATA")).unwrap();
        fs::write(root.join("CLIENT_DATA/a.txt"), "base").unwrap();
        fs::write(root.join("CLIENT_DATA/b.txt"), "base").unwrap();
        fs::create_dir_all(root.join("CLIENT_DATA.site1")).unwrap();
        fs::write(root.join("CLIENT_DATA.site1/b.txt"), "custom").unwrap();
        fs::create_dir_all(root.join("SERVER_DATA/etc")).unwrap();
        fs::write(root.join("SERVER_DATA/etc/demo.conf"), "conf").unwrap();

        let out = TempDir::new().unwrap();
        let archive = build(root, out.path(), Some("site1"));
        assert_eq!(archive.file_name().unwrap(), "demo_2.0-1_site1.fpkg");

        let (base, depot) = layout();
        let mut installer = ArchiveInstaller::open(&archive, &depot).unwrap();
        installer.unpack().unwrap();

        let client = depot.client_data_dir("demo");
        assert_eq!(fs::read_to_string(client.join("a.txt")).unwrap(), "base");
        assert_eq!(fs::read_to_string(client.join("b.txt")).unwrap(), "custom");
        assert_eq!(
            fs::read_to_string(base.path().join("server/etc/demo.conf")).unwrap(),
            "conf"
        );
        assert!(installer.server_paths().contains(&PathBuf::from("etc/demo.conf")));

        let pool = WorkerPool::new(2).unwrap();
        let manifest_path = installer.write_manifest(&pool).unwrap();
        assert_eq!(manifest_path, depot.manifest_path("demo"));

        let manifest = FileManifest::read(&manifest_path).unwrap();
        assert!(manifest.entries().iter().any(|e| e.path == "/etc/demo.conf"));
        manifest.verify(&client, &depot.server_root).unwrap();
    }

    #[test]
    fn test_metadata_only_leaves_depot_untouched() {
        let src = TempDir::new().unwrap();
        let root = src.path();
        fs::create_dir_all(root.join("OPSI")).unwrap();
        fs::write(root.join("OPSI/control"), CONTROL).unwrap();
        fs::create_dir_all(root.join("CLIENT_DATA")).unwrap();
        fs::write(root.join("CLIENT_DATA/a.txt"), "x").unwrap();

        let out = TempDir::new().unwrap();
        let archive = build(root, out.path(), None);

        let (_base, depot) = layout();
        let mut installer = ArchiveInstaller::open(&archive, &depot).unwrap();
        let control = installer.read_metadata().unwrap();
        assert_eq!(control.product.id, "demo");
        assert!(installer.opsi_dir().join("control").is_file());
        assert!(!depot.client_data_dir("demo").exists());
    }

    #[test]
    fn test_unusable_work_dir_names_archive_and_stage() {
        let src = TempDir::new().unwrap();
        fs::create_dir_all(src.path().join("OPSI")).unwrap();
        fs::write(src.path().join("OPSI/control"), CONTROL).unwrap();
        fs::create_dir_all(src.path().join("CLIENT_DATA")).unwrap();
        fs::write(src.path().join("CLIENT_DATA/a.txt"), "x").unwrap();
        let out = TempDir::new().unwrap();
        let archive = build(src.path(), out.path(), None);

        let (base, depot) = layout();
        let blocker = base.path().join("not-a-dir");
        fs::write(&blocker, "").unwrap();
        let depot = depot.with_work_dir(&blocker.join("work"));

        let err = ArchiveInstaller::open(&archive, &depot).err().unwrap();
        match err {
            FleetpkgError::Packaging { product, message } => {
                assert!(product.ends_with("demo_2.0-1.fpkg"));
                assert!(message.contains("work directory"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    /// Copy an installed tree back into a source layout
    fn copy_tree(from: &Path, to: &Path, skip: &str) {
        for entry in walkdir::WalkDir::new(from).min_depth(1) {
            let entry = entry.unwrap();
            let rel = entry.path().strip_prefix(from).unwrap();
            if rel == Path::new(skip) {
                continue;
            }
            let dest = to.join(rel);
            if entry.file_type().is_dir() {
                fs::create_dir_all(&dest).unwrap();
            } else {
                fs::copy(entry.path(), &dest).unwrap();
            }
        }
    }

    #[test]
    fn test_repack_of_unpacked_tree_keeps_manifest() {
        let src = TempDir::new().unwrap();
        let root = src.path();
        fs::create_dir_all(root.join("OPSI")).unwrap();
        fs::write(root.join("OPSI/control"), CONTROL).unwrap();
        fs::create_dir_all(root.join("CLIENT_DATA/bin")).unwrap();
        fs::write(root.join("CLIENT_DATA/setup.sh"), "echo setup\n").unwrap();
        fs::write(root.join("CLIENT_DATA/bin/tool"), "binary").unwrap();
        fs::create_dir_all(root.join("SERVER_DATA/etc")).unwrap();
        fs::write(root.join("SERVER_DATA/etc/demo.conf"), "conf").unwrap();

        let pool = WorkerPool::new(2).unwrap();
        let install = |archive: &Path| {
            let (base, depot) = layout();
            let mut installer = ArchiveInstaller::open(archive, &depot).unwrap();
            installer.unpack().unwrap();
            let manifest = FileManifest::read(&installer.write_manifest(&pool).unwrap()).unwrap();
            (base, depot, manifest)
        };

        let out = TempDir::new().unwrap();
        let (first_base, first_depot, first) = install(&build(root, out.path(), None));

        // Repack what the first install produced
        let again = TempDir::new().unwrap();
        let again_root = again.path();
        fs::create_dir_all(again_root.join("OPSI")).unwrap();
        fs::write(again_root.join("OPSI/control"), CONTROL).unwrap();
        fs::create_dir_all(again_root.join("CLIENT_DATA")).unwrap();
        copy_tree(
            &first_depot.client_data_dir("demo"),
            &again_root.join("CLIENT_DATA"),
            "demo.files",
        );
        fs::create_dir_all(again_root.join("SERVER_DATA")).unwrap();
        copy_tree(
            &first_base.path().join("server"),
            &again_root.join("SERVER_DATA"),
            "",
        );

        let out_again = TempDir::new().unwrap();
        let (_base, _depot, second) = install(&build(again_root, out_again.path(), None));

        assert!(!first.is_empty());
        assert_eq!(first.entries(), second.entries());
    }

    #[cfg(unix)]
    #[test]
    fn test_access_rights_keep_exec_bit() {
        use std::os::unix::fs::PermissionsExt;

        let src = TempDir::new().unwrap();
        let root = src.path();
        fs::create_dir_all(root.join("OPSI")).unwrap();
        fs::write(root.join("OPSI/control"), CONTROL).unwrap();
        fs::create_dir_all(root.join("CLIENT_DATA")).unwrap();
        fs::write(root.join("CLIENT_DATA/run.sh"), "#!/bin/sh\n").unwrap();
        fs::set_permissions(
            root.join("CLIENT_DATA/run.sh"),
            fs::Permissions::from_mode(0o755),
        )
        .unwrap();
        fs::write(root.join("CLIENT_DATA/data.txt"), "x").unwrap();

        let out = TempDir::new().unwrap();
        let archive = build(root, out.path(), None);

        let (_base, depot) = layout();
        let mut installer = ArchiveInstaller::open(&archive, &depot).unwrap();
        installer.unpack().unwrap();

        let rights = AccessRights {
            dir_mode: 0o750,
            file_mode: 0o640,
            ..AccessRights::default()
        };
        installer.set_access_rights(&rights).unwrap();

        let client = depot.client_data_dir("demo");
        let mode = |p: &str| fs::metadata(client.join(p)).unwrap().permissions().mode() & 0o7777;
        assert_eq!(mode("run.sh"), 0o750);
        assert_eq!(mode("data.txt"), 0o640);
        assert_eq!(fs::metadata(&client).unwrap().permissions().mode() & 0o7777, 0o750);
    }
}
