//! Connection, table, admin and locator handles over a [`MemoryCluster`]

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tandem_core::traits::{Admin, ClusterConnection, RegionLocator, Table};
use tandem_core::types::{
    ClusterStatus, Delete, Get, Mutation, Put, RegionLocation, RowResult, TableDescriptor,
    TableName,
};
use tandem_core::{Configuration, Error, Result};
use tracing::{debug, warn};

use crate::cluster::MemoryCluster;

/// A connection to one [`MemoryCluster`]
pub struct MemoryConnection {
    cluster: MemoryCluster,
    config: Configuration,
    closed: AtomicBool,
    abort_reason: Mutex<Option<String>>,
}

impl MemoryConnection {
    pub(crate) fn new(cluster: MemoryCluster, config: Configuration) -> Self {
        Self {
            cluster,
            config,
            closed: AtomicBool::new(false),
            abort_reason: Mutex::new(None),
        }
    }

    pub fn cluster(&self) -> &MemoryCluster {
        &self.cluster
    }

    /// Reason passed to the first `abort`, if any
    pub fn abort_reason(&self) -> Option<String> {
        self.abort_reason.lock().clone()
    }

    fn ensure_open(&self) -> Result<()> {
        if let Some(reason) = self.abort_reason() {
            return Err(Error::Aborted(reason));
        }
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::Closed);
        }
        Ok(())
    }
}

impl fmt::Debug for MemoryConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryConnection")
            .field("cluster", &self.cluster.name())
            .field("closed", &self.is_closed())
            .field("aborted", &self.is_aborted())
            .finish()
    }
}

#[async_trait]
impl ClusterConnection for MemoryConnection {
    fn configuration(&self) -> &Configuration {
        &self.config
    }

    async fn table(&self, name: &TableName) -> Result<Arc<dyn Table>> {
        self.ensure_open()?;
        if self.cluster.faults().fail_table_acquire {
            return Err(Error::Cluster(format!(
                "{}: table '{}' unavailable",
                self.cluster.name(),
                name
            )));
        }
        if !self.cluster.has_table(name) {
            return Err(Error::TableNotFound(name.to_string()));
        }
        Ok(Arc::new(MemoryTable {
            cluster: self.cluster.clone(),
            name: name.clone(),
        }))
    }

    async fn admin(&self) -> Result<Arc<dyn Admin>> {
        self.ensure_open()?;
        Ok(Arc::new(MemoryAdmin {
            cluster: self.cluster.clone(),
        }))
    }

    async fn region_locator(&self, name: &TableName) -> Result<Arc<dyn RegionLocator>> {
        self.ensure_open()?;
        if !self.cluster.has_table(name) {
            return Err(Error::TableNotFound(name.to_string()));
        }
        Ok(Arc::new(MemoryRegionLocator {
            cluster: self.cluster.clone(),
            table: name.clone(),
        }))
    }

    async fn close(&self) -> Result<()> {
        self.cluster.record_close();
        if self.cluster.faults().fail_close {
            return Err(Error::Cluster(format!(
                "{}: close failed",
                self.cluster.name()
            )));
        }
        if !self.closed.swap(true, Ordering::AcqRel) {
            debug!("Closed memory connection to {}", self.cluster.name());
        }
        Ok(())
    }

    fn abort(&self, reason: &str, cause: Option<&Error>) {
        let mut slot = self.abort_reason.lock();
        if slot.is_none() {
            match cause {
                Some(cause) => warn!(
                    "Aborting memory connection to {}: {} ({})",
                    self.cluster.name(),
                    reason,
                    cause
                ),
                None => warn!(
                    "Aborting memory connection to {}: {}",
                    self.cluster.name(),
                    reason
                ),
            }
            *slot = Some(reason.to_string());
        }
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn is_aborted(&self) -> bool {
        self.abort_reason.lock().is_some()
    }
}

/// A table handle on a [`MemoryCluster`]
#[derive(Debug, Clone)]
pub struct MemoryTable {
    cluster: MemoryCluster,
    name: TableName,
}

impl MemoryTable {
    fn read_row(&self, get: &Get) -> Result<RowResult> {
        self.cluster.with_table(&self.name, |state| {
            let mut result = RowResult::empty(get.row.clone());
            if let Some(cells) = state.rows.get(&get.row) {
                result.cells = cells
                    .iter()
                    .filter(|(column, _)| get.wants(column))
                    .map(|(column, value)| (column.clone(), value.clone()))
                    .collect();
            }
            result
        })
    }

    fn apply(&self, mutation: &Mutation) -> Result<()> {
        self.cluster.with_table(&self.name, |state| match mutation {
            Mutation::Put(put) => {
                let cells = state.rows.entry(put.row.clone()).or_default();
                for cell in &put.cells {
                    cells.insert(cell.column.clone(), cell.value.clone());
                }
            }
            Mutation::Delete(delete) => {
                if delete.columns.is_empty() {
                    state.rows.remove(&delete.row);
                } else if let Some(cells) = state.rows.get_mut(&delete.row) {
                    for column in &delete.columns {
                        cells.remove(column);
                    }
                    if cells.is_empty() {
                        state.rows.remove(&delete.row);
                    }
                }
            }
        })?;
        self.cluster.record_applied();
        Ok(())
    }
}

#[async_trait]
impl Table for MemoryTable {
    fn name(&self) -> &TableName {
        &self.name
    }

    async fn get(&self, get: &Get) -> Result<RowResult> {
        self.cluster.begin_read().await?;
        self.read_row(get)
    }

    async fn get_batch(&self, gets: &[Get]) -> Result<Vec<RowResult>> {
        self.cluster.begin_read().await?;
        gets.iter().map(|get| self.read_row(get)).collect()
    }

    async fn put(&self, put: &Put) -> Result<()> {
        self.cluster.begin_write().await?;
        self.apply(&Mutation::Put(put.clone()))
    }

    async fn delete(&self, delete: &Delete) -> Result<()> {
        self.cluster.begin_write().await?;
        self.apply(&Mutation::Delete(delete.clone()))
    }

    async fn mutate_batch(&self, mutations: &[Mutation]) -> Result<()> {
        self.cluster.begin_write().await?;
        for mutation in mutations {
            self.apply(mutation)?;
        }
        Ok(())
    }
}

/// Admin handle on a [`MemoryCluster`]
#[derive(Debug, Clone)]
pub struct MemoryAdmin {
    cluster: MemoryCluster,
}

impl MemoryAdmin {
    fn state<R>(
        &self,
        name: &TableName,
        f: impl FnOnce(&crate::cluster::TableState) -> R,
    ) -> Result<R> {
        self.cluster
            .inner
            .tables
            .read()
            .get(name)
            .map(f)
            .ok_or_else(|| Error::TableNotFound(name.to_string()))
    }
}

#[async_trait]
impl Admin for MemoryAdmin {
    async fn cluster_status(&self) -> Result<ClusterStatus> {
        let name = self.cluster.name();
        let master = (*self.cluster.inner.master_running.read()).then(|| format!("{}-master", name));
        Ok(ClusterStatus {
            cluster_id: name.to_string(),
            master,
            live_servers: vec![format!("{}-rs1", name)],
            dead_servers: Vec::new(),
        })
    }

    async fn is_table_enabled(&self, name: &TableName) -> Result<bool> {
        self.state(name, |s| s.enabled)
    }

    async fn is_table_disabled(&self, name: &TableName) -> Result<bool> {
        self.state(name, |s| !s.enabled)
    }

    async fn is_table_available(&self, name: &TableName) -> Result<bool> {
        Ok(self.state(name, |s| s.enabled).unwrap_or(false))
    }

    async fn list_tables(&self) -> Result<Vec<TableDescriptor>> {
        let mut descriptors: Vec<_> = self
            .cluster
            .inner
            .tables
            .read()
            .values()
            .map(|s| s.descriptor.clone())
            .collect();
        descriptors.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(descriptors)
    }

    async fn table_descriptor(&self, name: &TableName) -> Result<TableDescriptor> {
        self.state(name, |s| s.descriptor.clone())
    }
}

/// Every memory table is a single region hosted on the cluster's only server
#[derive(Debug, Clone)]
pub struct MemoryRegionLocator {
    cluster: MemoryCluster,
    table: TableName,
}

#[async_trait]
impl RegionLocator for MemoryRegionLocator {
    fn table_name(&self) -> &TableName {
        &self.table
    }

    async fn region_location(&self, _row: &[u8], _reload: bool) -> Result<RegionLocation> {
        if !self.cluster.has_table(&self.table) {
            return Err(Error::TableNotFound(self.table.to_string()));
        }
        Ok(RegionLocation {
            table: self.table.clone(),
            start_key: Bytes::new(),
            end_key: Bytes::new(),
            server: format!("{}-rs1", self.cluster.name()),
        })
    }
}
