//! Error types for fleetpkg

use std::path::PathBuf;

use thiserror::Error;

/// Main error type for fleetpkg operations
#[derive(Error, Debug)]
pub enum FleetpkgError {
    #[error("Control file error at line {line}, field '{field}': {message}")]
    Parse {
        line: usize,
        field: String,
        message: String,
    },

    #[error("Packaging failed for {product}: {message}")]
    Packaging { product: String, message: String },

    #[error("Product {product_id} is locked by running process {pid}")]
    Locked { product_id: String, pid: u32 },

    #[error("Temporary failure, retry later: {0}")]
    Temporary(String),

    #[error("Dependency of {product_id} not satisfied: {package} {requirement}")]
    DependencyUnsatisfied {
        product_id: String,
        package: String,
        requirement: String,
    },

    #[error("Unaccomplishable: {0}")]
    Unaccomplishable(String),

    #[error("Verification failed for {path}: expected {expected}, got {actual}")]
    Verification {
        path: PathBuf,
        expected: String,
        actual: String,
    },

    #[error("{stage} script of {product_id} exited with code {exit_code}")]
    Script {
        product_id: String,
        stage: String,
        exit_code: i32,
        output: Vec<String>,
    },

    #[error("Invalid version condition: {0}")]
    InvalidVersion(String),

    #[error("Invalid package archive name: {0}")]
    InvalidArchiveName(String),

    #[error("Product {product_id} is not installed on depot {depot_id}")]
    ProductNotInstalled {
        product_id: String,
        depot_id: String,
    },

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl FleetpkgError {
    pub(crate) fn parse(line: usize, field: &str, message: impl Into<String>) -> Self {
        FleetpkgError::Parse {
            line,
            field: field.to_string(),
            message: message.into(),
        }
    }

    pub(crate) fn packaging(product: &str, message: impl std::fmt::Display) -> Self {
        FleetpkgError::Packaging {
            product: product.to_string(),
            message: message.to_string(),
        }
    }

    /// Whether the caller may retry the same operation later
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            FleetpkgError::Locked { .. } | FleetpkgError::Temporary(_)
        )
    }
}

/// Result type alias for fleetpkg operations
pub type Result<T> = std::result::Result<T, FleetpkgError>;
