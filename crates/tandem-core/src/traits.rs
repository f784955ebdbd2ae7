//! Cluster client contracts
//!
//! Every per-cluster store client plugs into Tandem by implementing these
//! traits. The multi-cluster connection implements [`ClusterConnection`]
//! itself, so callers see the same shape whether failover is enabled or not.

use std::sync::Arc;

use async_trait::async_trait;

use crate::config::Configuration;
use crate::error::{Error, Result};
use crate::types::{
    ClusterStatus, Delete, Get, Mutation, Put, RegionLocation, RowResult, TableDescriptor,
    TableName,
};

/// Row-level access to one table
#[async_trait]
pub trait Table: Send + Sync {
    fn name(&self) -> &TableName;

    async fn get(&self, get: &Get) -> Result<RowResult>;

    /// Results are returned in request order
    async fn get_batch(&self, gets: &[Get]) -> Result<Vec<RowResult>> {
        let mut results = Vec::with_capacity(gets.len());
        for get in gets {
            results.push(self.get(get).await?);
        }
        Ok(results)
    }

    async fn exists(&self, get: &Get) -> Result<bool> {
        Ok(!self.get(get).await?.is_empty())
    }

    async fn put(&self, put: &Put) -> Result<()>;

    async fn delete(&self, delete: &Delete) -> Result<()>;

    async fn mutate_batch(&self, mutations: &[Mutation]) -> Result<()> {
        for mutation in mutations {
            match mutation {
                Mutation::Put(put) => self.put(put).await?,
                Mutation::Delete(delete) => self.delete(delete).await?,
            }
        }
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

/// Schema and cluster administration
#[async_trait]
pub trait Admin: Send + Sync {
    async fn cluster_status(&self) -> Result<ClusterStatus>;
    async fn is_table_enabled(&self, name: &TableName) -> Result<bool>;
    async fn is_table_disabled(&self, name: &TableName) -> Result<bool>;
    async fn is_table_available(&self, name: &TableName) -> Result<bool>;
    async fn list_tables(&self) -> Result<Vec<TableDescriptor>>;
    async fn table_descriptor(&self, name: &TableName) -> Result<TableDescriptor>;

    async fn list_table_names(&self) -> Result<Vec<TableName>> {
        Ok(self.list_tables().await?.into_iter().map(|d| d.name).collect())
    }
}

/// Region lookup for one table
#[async_trait]
pub trait RegionLocator: Send + Sync {
    fn table_name(&self) -> &TableName;
    async fn region_location(&self, row: &[u8], reload: bool) -> Result<RegionLocation>;
}

/// A live connection to one cluster (or, for the multi-cluster connection,
/// to several clusters behind one handle)
#[async_trait]
pub trait ClusterConnection: Send + Sync {
    fn configuration(&self) -> &Configuration;

    async fn table(&self, name: &TableName) -> Result<Arc<dyn Table>>;

    async fn admin(&self) -> Result<Arc<dyn Admin>>;

    async fn region_locator(&self, name: &TableName) -> Result<Arc<dyn RegionLocator>>;

    async fn close(&self) -> Result<()>;

    /// Signal a fatal condition. Never fails.
    fn abort(&self, reason: &str, cause: Option<&Error>);

    fn is_closed(&self) -> bool;

    fn is_aborted(&self) -> bool;

    /// Number of clusters behind this connection
    fn cluster_count(&self) -> usize {
        1
    }

    /// Legacy bulk mutation entry point
    async fn process_batch(&self, table: &TableName, mutations: &[Mutation]) -> Result<()> {
        self.table(table).await?.mutate_batch(mutations).await
    }

    // ============= Metadata Operations =============

    async fn is_master_running(&self) -> Result<bool> {
        Ok(self.admin().await?.cluster_status().await?.master.is_some())
    }

    async fn is_table_enabled(&self, name: &TableName) -> Result<bool> {
        self.admin().await?.is_table_enabled(name).await
    }

    async fn is_table_disabled(&self, name: &TableName) -> Result<bool> {
        self.admin().await?.is_table_disabled(name).await
    }

    async fn is_table_available(&self, name: &TableName) -> Result<bool> {
        self.admin().await?.is_table_available(name).await
    }

    async fn list_tables(&self) -> Result<Vec<TableDescriptor>> {
        self.admin().await?.list_tables().await
    }

    async fn list_table_names(&self) -> Result<Vec<TableName>> {
        self.admin().await?.list_table_names().await
    }

    async fn table_descriptor(&self, name: &TableName) -> Result<TableDescriptor> {
        self.admin().await?.table_descriptor(name).await
    }

    async fn table_descriptors(&self, names: &[TableName]) -> Result<Vec<TableDescriptor>> {
        let admin = self.admin().await?;
        let mut descriptors = Vec::with_capacity(names.len());
        for name in names {
            descriptors.push(admin.table_descriptor(name).await?);
        }
        Ok(descriptors)
    }

    async fn region_location(
        &self,
        table: &TableName,
        row: &[u8],
        reload: bool,
    ) -> Result<RegionLocation> {
        self.region_locator(table)
            .await?
            .region_location(row, reload)
            .await
    }
}

/// Builds single-cluster connections
#[async_trait]
pub trait ConnectionFactory: Send + Sync {
    async fn create_connection(&self, config: &Configuration) -> Result<Arc<dyn ClusterConnection>>;
}
