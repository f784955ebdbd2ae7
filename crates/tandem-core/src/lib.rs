//! Tandem Core Library
//!
//! Core types, configuration and cluster contracts for the Tandem
//! multi-cluster failover client.

pub mod config;
pub mod error;
pub mod traits;
pub mod types;

pub use config::{Configuration, FailoverSettings, FailoverThresholds};
pub use error::{AggregateFailure, ClusterFailure, Error, Result};
pub use traits::{Admin, ClusterConnection, ConnectionFactory, RegionLocator, Table};

/// Tandem version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Name reserved for the primary cluster
pub const PRIMARY_NAME: &str = "primary";

/// Default size of the per-connection worker pool
pub const DEFAULT_POOL_SIZE: usize = 20;

/// Default namespace for table names without an explicit one
pub const DEFAULT_NAMESPACE: &str = "default";
