//! fleetpkg: product packaging, depot installation and per-host action
//! scheduling for managed client fleets

pub mod archive;
pub mod config;
pub mod control;
pub mod depot;
pub mod error;
pub mod lock;
pub mod manifest;
pub mod orchestrator;
pub mod package;
pub mod pool;
pub mod resolver;
pub mod script;
pub mod storage;
pub mod version;

pub use error::{FleetpkgError, Result};
