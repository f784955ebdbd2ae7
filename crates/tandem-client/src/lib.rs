//! Tandem Client - Multi-cluster failover connection
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                    ConnectionBuilder                         │
//! │   split config ─► build per-cluster connections (factory)    │
//! └──────────────────────────────┬───────────────────────────────┘
//!                                │
//! ┌──────────────────────────────┴───────────────────────────────┐
//! │                  MultiClusterConnection                      │
//! │                                                              │
//! │  ┌──────────────┐  ┌──────────────┐  ┌──────────────┐        │
//! │  │   primary    │  │  failover 1  │  │  failover N  │        │
//! │  └──────────────┘  └──────────────┘  └──────────────┘        │
//! │        WorkerPool          PrimaryHealth        Span         │
//! └──────────────────────────────┬───────────────────────────────┘
//!                                │ table(name)
//! ┌──────────────────────────────┴───────────────────────────────┐
//! │   MultiClusterTable ─► speculative race / primary mutation   │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Features
//!
//! - **Pass-through**: without failover clusters the backend connection is
//!   returned as is
//! - **Speculative reads**: a slow or failing primary is raced against every
//!   failover; first success wins
//! - **Half-open recovery**: a failed primary is skipped for a cooldown
//! - **Master-master writes**: optional, with the divergence risk it implies
//! - **Aggregated lifecycle**: close and abort reach every cluster

mod connection;
mod factory;
mod health;
mod pool;
mod speculative;
mod splitter;
mod stats;
mod table;

pub use connection::{ClusterEndpoint, MultiClusterConnection};
pub use factory::{create_connection, ConnectionBuilder};
pub use health::PrimaryHealth;
pub use pool::WorkerPool;
pub use speculative::Served;
pub use splitter::{combine_configurations, split, ConfigSplitter, PrefixSplitter};
pub use stats::{names as metric_names, Operation, TableStats};
pub use table::MultiClusterTable;

// Re-export core types
pub use tandem_core::{
    ClusterConnection, Configuration, ConnectionFactory, Error, FailoverSettings,
    FailoverThresholds, Result, Table,
};
