//! Configuration management for fleetpkg

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::archive::Compression;

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Depot layout
    #[serde(default)]
    pub depot: DepotConfig,

    /// Database configuration
    #[serde(default)]
    pub database: DatabaseConfig,

    /// Ownership and modes applied to installed client data
    #[serde(default)]
    pub access_rights: AccessRights,

    /// Package build configuration
    #[serde(default)]
    pub build: BuildConfig,

    /// Default resolver options
    #[serde(default)]
    pub resolver: ResolverConfig,

    /// Worker pool configuration
    #[serde(default)]
    pub workers: WorkerConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DepotConfig {
    /// Depot id, usually the depot's FQDN
    #[serde(default = "default_depot_id")]
    pub id: String,

    /// Local depot root as a `file://` URL
    #[serde(default = "default_depot_url")]
    pub url: String,

    /// Directory holding product lock files
    #[serde(default = "default_lock_dir")]
    pub lock_dir: PathBuf,

    /// Directory for temporary unpack/build directories
    #[serde(default = "default_work_dir")]
    pub work_dir: PathBuf,

    /// Destination of SERVER_DATA content
    #[serde(default = "default_server_root")]
    pub server_root: PathBuf,
}

fn default_depot_id() -> String {
    "localhost".to_string()
}

fn default_depot_url() -> String {
    "file:///var/lib/fleetpkg/depot".to_string()
}

fn default_lock_dir() -> PathBuf {
    std::env::temp_dir()
}

fn default_work_dir() -> PathBuf {
    std::env::temp_dir()
}

fn default_server_root() -> PathBuf {
    PathBuf::from("/")
}

impl Default for DepotConfig {
    fn default() -> Self {
        Self {
            id: default_depot_id(),
            url: default_depot_url(),
            lock_dir: default_lock_dir(),
            work_dir: default_work_dir(),
            server_root: default_server_root(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Path to the SQLite database
    pub path: PathBuf,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("/var/lib/fleetpkg/db.sqlite"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccessRights {
    /// Owner of installed files (unchanged if unset)
    #[serde(default)]
    pub user: Option<String>,

    /// Group of installed files (unchanged if unset)
    #[serde(default)]
    pub group: Option<String>,

    /// Mode for directories
    #[serde(default = "default_dir_mode")]
    pub dir_mode: u32,

    /// Mode for regular files
    #[serde(default = "default_file_mode")]
    pub file_mode: u32,
}

fn default_dir_mode() -> u32 {
    0o2770
}

fn default_file_mode() -> u32 {
    0o660
}

impl Default for AccessRights {
    fn default() -> Self {
        Self {
            user: None,
            group: None,
            dir_mode: default_dir_mode(),
            file_mode: default_file_mode(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildConfig {
    /// Compression of the sub-archives
    #[serde(default)]
    pub compression: Compression,

    /// Where built packages are written
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,
}

fn default_output_dir() -> PathBuf {
    PathBuf::from(".")
}

impl Default for BuildConfig {
    fn default() -> Self {
        Self {
            compression: Compression::default(),
            output_dir: default_output_dir(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResolverConfig {
    #[serde(default = "default_true")]
    pub process_priorities: bool,

    #[serde(default = "default_true")]
    pub process_dependencies: bool,

    #[serde(default)]
    pub force_accurate_sequence: bool,
}

fn default_true() -> bool {
    true
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            process_priorities: true,
            process_dependencies: true,
            force_accurate_sequence: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Number of worker threads for checksum computation
    #[serde(default = "default_threads")]
    pub threads: usize,
}

fn default_threads() -> usize {
    std::thread::available_parallelism()
        .map(|p| p.get())
        .unwrap_or(4)
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            threads: default_threads(),
        }
    }
}

impl Config {
    /// Load configuration from file, or use defaults
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let config_path = path.map(PathBuf::from).or_else(|| {
            // Try system config
            let system_config = PathBuf::from("/etc/fleetpkg/fleetpkg.conf");
            if system_config.exists() {
                return Some(system_config);
            }

            // Try user config
            directories::ProjectDirs::from("org", "fleetpkg", "fleetpkg")
                .map(|d| d.config_dir().join("fleetpkg.conf"))
                .filter(|p| p.exists())
        });

        match config_path {
            Some(path) => {
                let content = std::fs::read_to_string(&path)
                    .with_context(|| format!("Failed to read config: {}", path.display()))?;
                toml::from_str(&content)
                    .with_context(|| format!("Failed to parse config: {}", path.display()))
            }
            None => Ok(Config::default()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_config_uses_defaults() {
        let config: Config = toml::from_str(
            r#"
            [depot]
            id = "depot1.example.org"
            url = "file:///srv/depot"

            [access_rights]
            group = "pcpatch"

            [build]
            compression = "gzip"
            "#,
        )
        .unwrap();

        assert_eq!(config.depot.id, "depot1.example.org");
        assert_eq!(config.depot.server_root, PathBuf::from("/"));
        assert_eq!(config.access_rights.group.as_deref(), Some("pcpatch"));
        assert_eq!(config.access_rights.dir_mode, 0o2770);
        assert_eq!(config.build.compression, Compression::Gzip);
        assert!(config.resolver.process_dependencies);
    }

    #[test]
    fn test_load_explicit_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fleetpkg.conf");
        std::fs::write(&path, "[database]\npath = \"/tmp/x.sqlite\"\n").unwrap();

        let config = Config::load(Some(&path)).unwrap();
        assert_eq!(config.database.path, PathBuf::from("/tmp/x.sqlite"));

        std::fs::write(&path, "[database\n").unwrap();
        assert!(Config::load(Some(&path)).is_err());
    }
}
