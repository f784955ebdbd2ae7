//! Connection factory resolving endpoints to memory clusters

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use tandem_core::config::keys;
use tandem_core::traits::{ClusterConnection, ConnectionFactory};
use tandem_core::{Configuration, Error, Result};
use tracing::info;

use crate::cluster::MemoryCluster;

/// Resolves `tandem.cluster.endpoint` to a registered [`MemoryCluster`].
///
/// In simulation mode, unknown endpoints get a fresh cluster built from the
/// connection's `memory.*` keys.
#[derive(Debug, Default)]
pub struct MemoryConnectionFactory {
    clusters: RwLock<HashMap<String, MemoryCluster>>,
    unreachable: RwLock<HashSet<String>>,
    auto_create: bool,
}

impl MemoryConnectionFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// A factory that creates clusters on first contact
    pub fn simulation() -> Self {
        Self {
            auto_create: true,
            ..Self::default()
        }
    }

    /// Register `cluster` under `endpoint`
    pub fn register(&self, endpoint: impl Into<String>, cluster: MemoryCluster) {
        self.clusters.write().insert(endpoint.into(), cluster);
    }

    /// Create and register an empty cluster named after its endpoint
    pub fn add_cluster(&self, endpoint: &str) -> MemoryCluster {
        let cluster = MemoryCluster::new(endpoint);
        self.register(endpoint, cluster.clone());
        cluster
    }

    pub fn cluster(&self, endpoint: &str) -> Option<MemoryCluster> {
        self.clusters.read().get(endpoint).cloned()
    }

    /// Refuse new connections to `endpoint`
    pub fn set_unreachable(&self, endpoint: &str, unreachable: bool) {
        let mut set = self.unreachable.write();
        if unreachable {
            set.insert(endpoint.to_string());
        } else {
            set.remove(endpoint);
        }
    }

    fn resolve(&self, endpoint: &str, config: &Configuration) -> Result<MemoryCluster> {
        if let Some(cluster) = self.cluster(endpoint) {
            return Ok(cluster);
        }
        if !self.auto_create {
            return Err(Error::Cluster(format!("unknown cluster endpoint '{}'", endpoint)));
        }
        let mut clusters = self.clusters.write();
        if let Some(cluster) = clusters.get(endpoint) {
            return Ok(cluster.clone());
        }
        let cluster = MemoryCluster::from_configuration(endpoint, config)?;
        info!("Simulating cluster {}", endpoint);
        clusters.insert(endpoint.to_string(), cluster.clone());
        Ok(cluster)
    }
}

#[async_trait]
impl ConnectionFactory for MemoryConnectionFactory {
    async fn create_connection(&self, config: &Configuration) -> Result<Arc<dyn ClusterConnection>> {
        let endpoint = config.get(keys::CLUSTER_ENDPOINT).ok_or_else(|| {
            Error::Configuration(format!("{} is not set", keys::CLUSTER_ENDPOINT))
        })?;
        if self.unreachable.read().contains(endpoint) {
            return Err(Error::Cluster(format!("connection refused by '{}'", endpoint)));
        }
        let cluster = self.resolve(endpoint, config)?;
        Ok(Arc::new(cluster.connect(config.clone())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn endpoint(name: &str) -> Configuration {
        Configuration::new().with(keys::CLUSTER_ENDPOINT, name)
    }

    #[tokio::test]
    async fn test_registered_clusters() {
        let factory = MemoryConnectionFactory::new();
        let cluster = factory.add_cluster("zk-a:2181");

        let conn = factory.create_connection(&endpoint("zk-a:2181")).await.unwrap();
        assert_eq!(conn.configuration().endpoint(), "zk-a:2181");
        assert_eq!(cluster.traffic().connections, 1);

        let err = factory.create_connection(&endpoint("zk-b:2181")).await.err().unwrap();
        assert_eq!(err.code(), "ClusterError");

        let err = factory.create_connection(&Configuration::new()).await.err().unwrap();
        assert_eq!(err.code(), "ConfigurationError");
    }

    #[tokio::test]
    async fn test_unreachable_endpoint() {
        let factory = MemoryConnectionFactory::new();
        factory.add_cluster("zk-a:2181");

        factory.set_unreachable("zk-a:2181", true);
        assert!(factory.create_connection(&endpoint("zk-a:2181")).await.is_err());
        factory.set_unreachable("zk-a:2181", false);
        assert!(factory.create_connection(&endpoint("zk-a:2181")).await.is_ok());
    }

    #[tokio::test]
    async fn test_simulation_creates_on_first_contact() {
        let factory = MemoryConnectionFactory::simulation();
        let config = endpoint("sim-1").with(crate::keys::TABLES, "t1");

        let first = factory.create_connection(&config).await.unwrap();
        let _second = factory.create_connection(&config).await.unwrap();
        assert!(first.is_table_enabled(&"t1".parse().unwrap()).await.unwrap());

        let cluster = factory.cluster("sim-1").unwrap();
        assert_eq!(cluster.traffic().connections, 2);
    }
}
