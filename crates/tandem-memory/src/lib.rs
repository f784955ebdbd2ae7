//! In-memory cluster backend
//!
//! A complete implementation of the Tandem cluster contracts over an
//! in-process dataset. Each [`MemoryCluster`] stands in for one
//! independently operated cluster and supports fault injection (latency,
//! failing reads, writes, table acquisition and close) plus traffic
//! counters, which makes failover behavior observable in tests and in the
//! `tandem simulate` command.

mod cluster;
mod connection;
mod factory;

pub use cluster::{FaultPlan, MemoryCluster, TrafficStats};
pub use connection::{MemoryAdmin, MemoryConnection, MemoryRegionLocator, MemoryTable};
pub use factory::MemoryConnectionFactory;

/// Configuration keys read by the simulation factory
pub mod keys {
    /// Delay applied to every read
    pub const READ_LATENCY_MS: &str = "memory.read_latency_ms";
    /// Delay applied to every write
    pub const WRITE_LATENCY_MS: &str = "memory.write_latency_ms";
    pub const FAIL_READS: &str = "memory.fail_reads";
    pub const FAIL_WRITES: &str = "memory.fail_writes";
    /// Tables created up front, each with a single `cf` family
    pub const TABLES: &str = "memory.tables";
}
