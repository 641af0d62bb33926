//! Package archive format
//!
//! A package is an uncompressed outer tar archive named
//! `<productId>_<productVersion>-<packageVersion>[_<customName>].fpkg`
//! holding one sub-archive per area:
//!
//! - `OPSI.tar.zst` - control file and maintainer scripts (always present)
//! - `SERVER_DATA.tar.zst` - files installed relative to the server root
//! - `CLIENT_DATA.tar.zst` - files installed into the product's client-data
//!   directory
//!
//! Each area may also appear as a custom variant (`CLIENT_DATA.site1.tar.zst`)
//! layered over the base one. Sub-archives may be plain, gzip or zstd
//! compressed; the suffix says which.

use std::fmt;
use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::{Component, Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{FleetpkgError, Result};

mod builder;
mod installer;

pub use builder::ArchiveBuilder;
pub use installer::ArchiveInstaller;

/// File extension of package archives
pub const PACKAGE_EXTENSION: &str = "fpkg";

/// Compression applied to sub-archives
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Compression {
    None,
    Gzip,
    #[default]
    Zstd,
}

impl Compression {
    /// Suffix appended after `.tar`
    pub fn suffix(self) -> &'static str {
        match self {
            Compression::None => "",
            Compression::Gzip => ".gz",
            Compression::Zstd => ".zst",
        }
    }
}

impl fmt::Display for Compression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Compression::None => write!(f, "none"),
            Compression::Gzip => write!(f, "gzip"),
            Compression::Zstd => write!(f, "zstd"),
        }
    }
}

impl FromStr for Compression {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "none" => Ok(Compression::None),
            "gzip" | "gz" => Ok(Compression::Gzip),
            "zstd" | "zst" => Ok(Compression::Zstd),
            _ => Err(format!("Unknown compression: {}", s)),
        }
    }
}

/// Logical area of a package
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Area {
    Opsi,
    ServerData,
    ClientData,
}

impl Area {
    /// Areas in unpack order
    pub const ALL: [Area; 3] = [Area::Opsi, Area::ServerData, Area::ClientData];

    pub fn dir_name(self) -> &'static str {
        match self {
            Area::Opsi => "OPSI",
            Area::ServerData => "SERVER_DATA",
            Area::ClientData => "CLIENT_DATA",
        }
    }

    fn from_dir_name(name: &str) -> Option<Self> {
        Area::ALL.into_iter().find(|a| a.dir_name() == name)
    }
}

/// Name of one sub-archive inside a package
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubArchiveName {
    pub area: Area,
    pub custom_name: Option<String>,
    pub compression: Compression,
}

impl SubArchiveName {
    pub fn parse(name: &str) -> Option<Self> {
        let (stem, compression) = if let Some(stem) = name.strip_suffix(".tar.zst") {
            (stem, Compression::Zstd)
        } else if let Some(stem) = name.strip_suffix(".tar.gz") {
            (stem, Compression::Gzip)
        } else if let Some(stem) = name.strip_suffix(".tar") {
            (stem, Compression::None)
        } else {
            return None;
        };

        let (area, custom_name) = match stem.split_once('.') {
            Some((area, custom)) if !custom.is_empty() => (area, Some(custom.to_string())),
            Some(_) => return None,
            None => (stem, None),
        };

        Some(SubArchiveName {
            area: Area::from_dir_name(area)?,
            custom_name,
            compression,
        })
    }

    /// Directory name in the source tree (`CLIENT_DATA.site1`)
    pub fn dir_name(&self) -> String {
        match &self.custom_name {
            Some(custom) => format!("{}.{}", self.area.dir_name(), custom),
            None => self.area.dir_name().to_string(),
        }
    }
}

impl fmt::Display for SubArchiveName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.tar{}", self.dir_name(), self.compression.suffix())
    }
}

/// Identity encoded in a package archive's file name
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackageFileName {
    pub product_id: String,
    pub product_version: String,
    pub package_version: String,
    pub custom_name: Option<String>,
}

impl PackageFileName {
    /// Parse the file name component of an archive path
    pub fn from_path(path: &Path) -> Result<Self> {
        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| FleetpkgError::InvalidArchiveName(path.display().to_string()))?;
        name.parse()
    }
}

impl fmt::Display for PackageFileName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}_{}-{}",
            self.product_id, self.product_version, self.package_version
        )?;
        if let Some(custom) = &self.custom_name {
            write!(f, "_{}", custom)?;
        }
        write!(f, ".{}", PACKAGE_EXTENSION)
    }
}

impl FromStr for PackageFileName {
    type Err = FleetpkgError;

    fn from_str(name: &str) -> Result<Self> {
        let invalid = || FleetpkgError::InvalidArchiveName(name.to_string());

        let stem = name
            .strip_suffix(&format!(".{}", PACKAGE_EXTENSION))
            .ok_or_else(invalid)?;
        let parts: Vec<&str> = stem.split('_').collect();

        // Versions never contain '_' and custom names never contain '-', so
        // the right-most part with a '-' is the version part
        let version_idx = parts
            .iter()
            .rposition(|p| p.contains('-'))
            .filter(|&i| i > 0)
            .ok_or_else(invalid)?;

        let (product_version, package_version) =
            parts[version_idx].split_once('-').ok_or_else(invalid)?;
        if product_version.is_empty() || package_version.is_empty() || package_version.contains('-')
        {
            return Err(invalid());
        }

        let custom = parts[version_idx + 1..].join("_");

        Ok(PackageFileName {
            product_id: parts[..version_idx].join("_"),
            product_version: product_version.to_string(),
            package_version: package_version.to_string(),
            custom_name: if custom.is_empty() { None } else { Some(custom) },
        })
    }
}

/// Custom names end up in file names and must stay unambiguous
pub fn is_valid_custom_name(name: &str) -> bool {
    !name.is_empty() && name.chars().all(|c| c.is_ascii_alphanumeric())
}

/// Write a (compressed) tar of `entries`, relative to `root`, to `dest`
pub(crate) fn write_tar(
    dest: &Path,
    root: &Path,
    entries: &[PathBuf],
    compression: Compression,
) -> io::Result<()> {
    let file = File::create(dest)?;

    match compression {
        Compression::None => {
            let mut file = append_entries(tar::Builder::new(file), root, entries)?.into_inner()?;
            file.flush()?;
        }
        Compression::Gzip => {
            let encoder = flate2::write::GzEncoder::new(file, flate2::Compression::default());
            let encoder = append_entries(tar::Builder::new(encoder), root, entries)?.into_inner()?;
            encoder.finish()?;
        }
        Compression::Zstd => {
            let encoder = zstd::stream::write::Encoder::new(file, 0)?;
            let encoder = append_entries(tar::Builder::new(encoder), root, entries)?.into_inner()?;
            encoder.finish()?;
        }
    }

    Ok(())
}

fn append_entries<W: Write>(
    mut builder: tar::Builder<W>,
    root: &Path,
    entries: &[PathBuf],
) -> io::Result<tar::Builder<W>> {
    builder.follow_symlinks(false);
    for rel in entries {
        builder.append_path_with_name(root.join(rel), rel)?;
    }
    Ok(builder)
}

/// Open a sub-archive, picking the decoder from its file name
pub(crate) fn open_tar(path: &Path) -> io::Result<tar::Archive<Box<dyn Read>>> {
    let name = path.file_name().and_then(|n| n.to_str()).unwrap_or_default();
    let file = File::open(path)?;

    let reader: Box<dyn Read> = match SubArchiveName::parse(name).map(|n| n.compression) {
        Some(Compression::Zstd) => Box::new(zstd::stream::read::Decoder::new(file)?),
        Some(Compression::Gzip) => Box::new(flate2::read::GzDecoder::new(file)),
        _ => Box::new(file),
    };

    Ok(tar::Archive::new(reader))
}

/// Extract a tar into `dest`, returning the relative paths it produced
///
/// With `skip_top_level`, entries directly below the archive root are not
/// written; their children still are.
pub(crate) fn extract_tracked(
    archive: &Path,
    dest: &Path,
    skip_top_level: bool,
) -> io::Result<Vec<PathBuf>> {
    fs::create_dir_all(dest)?;
    let mut tar = open_tar(archive)?;
    let mut extracted = Vec::new();

    for entry in tar.entries()? {
        let mut entry = entry?;
        let rel = normalize_entry_path(&entry.path()?)?;

        if rel.as_os_str().is_empty() {
            continue;
        }
        if skip_top_level && rel.components().count() == 1 {
            tracing::debug!("Skipping top-level entry {}", rel.display());
            continue;
        }

        entry.set_preserve_permissions(true);
        if !entry.unpack_in(dest)? {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("archive entry escapes destination: {}", rel.display()),
            ));
        }
        extracted.push(rel);
    }

    Ok(extracted)
}

/// Strip `./` components and reject absolute or parent paths
fn normalize_entry_path(path: &Path) -> io::Result<PathBuf> {
    let mut normalized = PathBuf::new();
    for component in path.components() {
        match component {
            Component::Normal(part) => normalized.push(part),
            Component::CurDir => {}
            _ => {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("unsafe archive entry path: {}", path.display()),
                ))
            }
        }
    }
    Ok(normalized)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_package_file_name() {
        let name: PackageFileName = "my_tool-x_1.0-2_site1.fpkg".parse().unwrap();
        assert_eq!(name.product_id, "my_tool-x");
        assert_eq!(name.product_version, "1.0");
        assert_eq!(name.package_version, "2");
        assert_eq!(name.custom_name.as_deref(), Some("site1"));
        assert_eq!(name.to_string(), "my_tool-x_1.0-2_site1.fpkg");

        let plain: PackageFileName = "firefox_115.0-3.fpkg".parse().unwrap();
        assert_eq!(plain.product_id, "firefox");
        assert!(plain.custom_name.is_none());

        assert!("firefox.fpkg".parse::<PackageFileName>().is_err());
        assert!("firefox_115.0-3.tar".parse::<PackageFileName>().is_err());
        assert!("_1.0-1.fpkg".parse::<PackageFileName>().is_err());
    }

    #[test]
    fn test_sub_archive_names() {
        let name = SubArchiveName::parse("CLIENT_DATA.site1.tar.zst").unwrap();
        assert_eq!(name.area, Area::ClientData);
        assert_eq!(name.custom_name.as_deref(), Some("site1"));
        assert_eq!(name.compression, Compression::Zstd);
        assert_eq!(name.to_string(), "CLIENT_DATA.site1.tar.zst");

        let name = SubArchiveName::parse("OPSI.tar").unwrap();
        assert_eq!(name.area, Area::Opsi);
        assert_eq!(name.compression, Compression::None);

        assert!(SubArchiveName::parse("OTHER.tar.gz").is_none());
        assert!(SubArchiveName::parse("OPSI.zip").is_none());
    }

    #[test]
    fn test_normalize_rejects_escapes() {
        assert_eq!(
            normalize_entry_path(Path::new("./a/b")).unwrap(),
            PathBuf::from("a/b")
        );
        assert!(normalize_entry_path(Path::new("../x")).is_err());
        assert!(normalize_entry_path(Path::new("/etc/passwd")).is_err());
    }

    #[test]
    fn test_custom_names() {
        assert!(is_valid_custom_name("site1"));
        assert!(!is_valid_custom_name("site-1"));
        assert!(!is_valid_custom_name(""));
    }
}
