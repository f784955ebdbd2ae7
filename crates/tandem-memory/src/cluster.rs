//! Shared state of one simulated cluster

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use tandem_core::types::{Column, TableDescriptor, TableName};
use tandem_core::{Configuration, Error, Result};
use tracing::debug;

use crate::connection::MemoryConnection;
use crate::keys;

/// Faults injected into every connection of a cluster
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FaultPlan {
    /// Delay before a read completes (or fails)
    pub read_latency: Duration,
    /// Delay before a write completes (or fails)
    pub write_latency: Duration,
    pub fail_reads: bool,
    pub fail_writes: bool,
    /// Fail this many upcoming writes, then recover
    pub fail_next_writes: u32,
    pub fail_table_acquire: bool,
    pub fail_close: bool,
}

impl FaultPlan {
    /// Read a plan from `memory.*` keys
    pub fn from_configuration(config: &Configuration) -> Result<Self> {
        Ok(Self {
            read_latency: config.get_millis(keys::READ_LATENCY_MS, 0)?,
            write_latency: config.get_millis(keys::WRITE_LATENCY_MS, 0)?,
            fail_reads: config.get_bool(keys::FAIL_READS, false)?,
            fail_writes: config.get_bool(keys::FAIL_WRITES, false)?,
            ..Self::default()
        })
    }
}

/// Request counters for one cluster
#[derive(Debug, Default)]
pub(crate) struct Counters {
    pub(crate) reads: AtomicU64,
    pub(crate) writes: AtomicU64,
    pub(crate) writes_applied: AtomicU64,
    pub(crate) connections: AtomicU64,
    pub(crate) closes: AtomicU64,
}

/// Snapshot of a cluster's traffic
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TrafficStats {
    /// Read requests received, failed ones included
    pub reads: u64,
    /// Write requests received, failed ones included
    pub writes: u64,
    pub writes_applied: u64,
    pub connections: u64,
    pub closes: u64,
}

#[derive(Debug)]
pub(crate) struct TableState {
    pub(crate) descriptor: TableDescriptor,
    pub(crate) enabled: bool,
    pub(crate) rows: BTreeMap<Bytes, BTreeMap<Column, Bytes>>,
}

#[derive(Debug)]
pub(crate) struct ClusterInner {
    pub(crate) name: String,
    pub(crate) tables: RwLock<HashMap<TableName, TableState>>,
    pub(crate) faults: Mutex<FaultPlan>,
    pub(crate) counters: Counters,
    pub(crate) master_running: RwLock<bool>,
}

/// One simulated cluster.
///
/// Cloning is cheap; clones share the same dataset, faults and counters.
#[derive(Debug, Clone)]
pub struct MemoryCluster {
    pub(crate) inner: Arc<ClusterInner>,
}

impl MemoryCluster {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(ClusterInner {
                name: name.into(),
                tables: RwLock::new(HashMap::new()),
                faults: Mutex::new(FaultPlan::default()),
                counters: Counters::default(),
                master_running: RwLock::new(true),
            }),
        }
    }

    /// Build a cluster from `memory.*` keys: faults plus pre-created tables
    pub fn from_configuration(name: impl Into<String>, config: &Configuration) -> Result<Self> {
        let cluster = Self::new(name);
        cluster.set_faults(FaultPlan::from_configuration(config)?);
        for table in config.get_list(keys::TABLES) {
            cluster.create_simple_table(&table)?;
        }
        Ok(cluster)
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Open a new connection carrying `config`
    pub fn connect(&self, config: Configuration) -> MemoryConnection {
        self.inner.counters.connections.fetch_add(1, Ordering::Relaxed);
        MemoryConnection::new(self.clone(), config)
    }

    // ============= Schema =============

    pub fn create_table(&self, descriptor: TableDescriptor) -> Result<()> {
        let mut tables = self.inner.tables.write();
        if tables.contains_key(&descriptor.name) {
            return Err(Error::Cluster(format!(
                "table '{}' already exists on '{}'",
                descriptor.name, self.inner.name
            )));
        }
        debug!("Creating table {} on {}", descriptor.name, self.inner.name);
        tables.insert(
            descriptor.name.clone(),
            TableState {
                descriptor,
                enabled: true,
                rows: BTreeMap::new(),
            },
        );
        Ok(())
    }

    /// Create `name` with a single `cf` family
    pub fn create_simple_table(&self, name: &str) -> Result<TableName> {
        let name = TableName::parse(name)?;
        self.create_table(TableDescriptor::new(name.clone()).with_family("cf"))?;
        Ok(name)
    }

    pub fn has_table(&self, name: &TableName) -> bool {
        self.inner.tables.read().contains_key(name)
    }

    pub fn set_table_enabled(&self, name: &TableName, enabled: bool) -> Result<()> {
        let mut tables = self.inner.tables.write();
        let state = tables
            .get_mut(name)
            .ok_or_else(|| Error::TableNotFound(name.to_string()))?;
        state.enabled = enabled;
        Ok(())
    }

    pub fn drop_table(&self, name: &TableName) -> Result<()> {
        self.inner
            .tables
            .write()
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| Error::TableNotFound(name.to_string()))
    }

    /// Direct read of a stored cell, bypassing faults and counters
    pub fn stored_value(
        &self,
        table: &TableName,
        row: &[u8],
        family: &str,
        qualifier: &str,
    ) -> Option<Bytes> {
        let column = Column::new(
            Bytes::copy_from_slice(family.as_bytes()),
            Bytes::copy_from_slice(qualifier.as_bytes()),
        );
        self.inner
            .tables
            .read()
            .get(table)
            .and_then(|state| state.rows.get(row))
            .and_then(|cells| cells.get(&column))
            .cloned()
    }

    pub fn set_master_running(&self, running: bool) {
        *self.inner.master_running.write() = running;
    }

    // ============= Faults =============

    pub fn faults(&self) -> FaultPlan {
        self.inner.faults.lock().clone()
    }

    pub fn set_faults(&self, plan: FaultPlan) {
        *self.inner.faults.lock() = plan;
    }

    pub fn update_faults(&self, f: impl FnOnce(&mut FaultPlan)) {
        f(&mut self.inner.faults.lock());
    }

    /// Apply the same latency to reads and writes
    pub fn set_latency(&self, latency: Duration) {
        self.update_faults(|p| {
            p.read_latency = latency;
            p.write_latency = latency;
        });
    }

    pub fn fail_reads(&self, fail: bool) {
        self.update_faults(|p| p.fail_reads = fail);
    }

    pub fn fail_writes(&self, fail: bool) {
        self.update_faults(|p| p.fail_writes = fail);
    }

    pub fn fail_next_writes(&self, count: u32) {
        self.update_faults(|p| p.fail_next_writes = count);
    }

    pub fn fail_table_acquire(&self, fail: bool) {
        self.update_faults(|p| p.fail_table_acquire = fail);
    }

    pub fn fail_close(&self, fail: bool) {
        self.update_faults(|p| p.fail_close = fail);
    }

    /// Remove every injected fault
    pub fn heal(&self) {
        self.set_faults(FaultPlan::default());
    }

    // ============= Counters =============

    pub fn traffic(&self) -> TrafficStats {
        let c = &self.inner.counters;
        TrafficStats {
            reads: c.reads.load(Ordering::Relaxed),
            writes: c.writes.load(Ordering::Relaxed),
            writes_applied: c.writes_applied.load(Ordering::Relaxed),
            connections: c.connections.load(Ordering::Relaxed),
            closes: c.closes.load(Ordering::Relaxed),
        }
    }

    pub fn reads(&self) -> u64 {
        self.traffic().reads
    }

    pub fn writes(&self) -> u64 {
        self.traffic().writes
    }

    // ============= Request Plumbing =============

    /// Count a read, wait out the latency and apply the read fault
    pub(crate) async fn begin_read(&self) -> Result<()> {
        self.inner.counters.reads.fetch_add(1, Ordering::Relaxed);
        let (latency, fail) = {
            let plan = self.inner.faults.lock();
            (plan.read_latency, plan.fail_reads)
        };
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        if fail {
            return Err(Error::Cluster(format!("{}: read failed", self.inner.name)));
        }
        Ok(())
    }

    /// Count a write, wait out the latency and apply the write faults
    pub(crate) async fn begin_write(&self) -> Result<()> {
        self.inner.counters.writes.fetch_add(1, Ordering::Relaxed);
        let (latency, fail) = {
            let mut plan = self.inner.faults.lock();
            let fail_once = plan.fail_next_writes > 0;
            if fail_once {
                plan.fail_next_writes -= 1;
            }
            (plan.write_latency, plan.fail_writes || fail_once)
        };
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        if fail {
            return Err(Error::Cluster(format!("{}: write failed", self.inner.name)));
        }
        Ok(())
    }

    pub(crate) fn record_applied(&self) {
        self.inner
            .counters
            .writes_applied
            .fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_close(&self) {
        self.inner.counters.closes.fetch_add(1, Ordering::Relaxed);
    }

    /// Run `f` against a table that exists and is enabled
    pub(crate) fn with_table<R>(
        &self,
        name: &TableName,
        f: impl FnOnce(&mut TableState) -> R,
    ) -> Result<R> {
        let mut tables = self.inner.tables.write();
        let state = tables
            .get_mut(name)
            .ok_or_else(|| Error::TableNotFound(name.to_string()))?;
        if !state.enabled {
            return Err(Error::TableDisabled(name.to_string()));
        }
        Ok(f(state))
    }
}
