//! Depot filesystem layout
//!
//! A depot stores every installed product's client data under
//! `<depot root>/<productId>`, together with the `<productId>.files`
//! manifest written at install time.

use std::path::{Path, PathBuf};

use url::Url;

use crate::config::Config;
use crate::error::{FleetpkgError, Result};

/// Suffix of the per-product file manifest
pub const MANIFEST_SUFFIX: &str = "files";

/// Resolved filesystem layout of one depot
#[derive(Debug, Clone)]
pub struct Depot {
    /// Depot id
    pub id: String,
    /// Local depot root
    pub root: PathBuf,
    /// Product lock files
    pub lock_dir: PathBuf,
    /// Temporary working directories
    pub work_dir: PathBuf,
    /// Destination of SERVER_DATA content
    pub server_root: PathBuf,
}

impl Depot {
    /// Build a depot layout from a `file://` URL
    pub fn new(id: &str, url: &str) -> Result<Self> {
        Ok(Self {
            id: id.to_string(),
            root: local_path_from_url(url)?,
            lock_dir: std::env::temp_dir(),
            work_dir: std::env::temp_dir(),
            server_root: PathBuf::from("/"),
        })
    }

    /// Build the depot layout from configuration
    pub fn from_config(config: &Config) -> Result<Self> {
        let mut depot = Self::new(&config.depot.id, &config.depot.url)?;
        depot.lock_dir = config.depot.lock_dir.clone();
        depot.work_dir = config.depot.work_dir.clone();
        depot.server_root = config.depot.server_root.clone();
        Ok(depot)
    }

    pub fn with_lock_dir(mut self, dir: &Path) -> Self {
        self.lock_dir = dir.to_path_buf();
        self
    }

    pub fn with_work_dir(mut self, dir: &Path) -> Self {
        self.work_dir = dir.to_path_buf();
        self
    }

    pub fn with_server_root(mut self, dir: &Path) -> Self {
        self.server_root = dir.to_path_buf();
        self
    }

    /// Client-data directory of a product
    pub fn client_data_dir(&self, product_id: &str) -> PathBuf {
        self.root.join(product_id)
    }

    /// Path of a product's file manifest
    pub fn manifest_path(&self, product_id: &str) -> PathBuf {
        self.client_data_dir(product_id)
            .join(manifest_filename(product_id))
    }
}

/// `<productId>.files`
pub fn manifest_filename(product_id: &str) -> String {
    format!("{}.{}", product_id, MANIFEST_SUFFIX)
}

/// Convert a `file:///abs/path` URL into a local path
pub fn local_path_from_url(url: &str) -> Result<PathBuf> {
    // The parser folds dot segments away, so reject them on the raw text
    let has_parent_segment = url.split('/').any(|segment| {
        matches!(
            segment.to_ascii_lowercase().as_str(),
            ".." | ".%2e" | "%2e." | "%2e%2e"
        )
    });
    if has_parent_segment {
        return Err(FleetpkgError::Config(format!(
            "depot url '{}' must not contain '..'",
            url
        )));
    }

    let parsed = Url::parse(url)
        .map_err(|e| FleetpkgError::Config(format!("invalid depot url '{}': {}", url, e)))?;
    if parsed.scheme() != "file" {
        return Err(FleetpkgError::Config(format!(
            "depot url '{}' must use the file:// scheme",
            url
        )));
    }

    let path = parsed.to_file_path().map_err(|_| {
        FleetpkgError::Config(format!(
            "depot url '{}' must contain an absolute local path",
            url
        ))
    })?;

    let path: PathBuf = path.components().collect();
    if path.parent().is_none() {
        return Err(FleetpkgError::Config(
            "depot url must not point at the filesystem root".to_string(),
        ));
    }

    Ok(path)
}
