//! Connection factory selector
//!
//! Decides at creation time whether a configuration needs the failover
//! machinery at all. Without failover clusters the caller gets the backend
//! factory's own connection, untouched.

use std::fmt;
use std::sync::Arc;

use tandem_core::config::keys;
use tandem_core::traits::{ClusterConnection, ConnectionFactory};
use tandem_core::{Configuration, Error, FailoverSettings, Result, PRIMARY_NAME};
use tracing::{info, warn, Span};

use crate::connection::{ClusterEndpoint, MultiClusterConnection};
use crate::splitter::{ConfigSplitter, PrefixSplitter};

/// Builds connections from combined configurations
pub struct ConnectionBuilder {
    factory: Arc<dyn ConnectionFactory>,
    splitter: Arc<dyn ConfigSplitter>,
    span: Option<Span>,
}

impl ConnectionBuilder {
    /// Use `factory` to build every single-cluster connection
    pub fn new(factory: Arc<dyn ConnectionFactory>) -> Self {
        Self {
            factory,
            splitter: Arc::new(PrefixSplitter),
            span: None,
        }
    }

    /// Replace the default `tandem.failover.cluster.<name>.` layout
    pub fn splitter(mut self, splitter: impl ConfigSplitter + 'static) -> Self {
        self.splitter = Arc::new(splitter);
        self
    }

    /// Span attached to multi-cluster connections built by this builder
    pub fn span(mut self, span: Span) -> Self {
        self.span = Some(span);
        self
    }

    /// Build the connection `config` asks for.
    ///
    /// Returns the backend's own connection when no failover cluster is
    /// configured (or, with `tolerate_build_failures`, when none could be
    /// reached), and a [`MultiClusterConnection`] otherwise.
    pub async fn connect(&self, config: &Configuration) -> Result<Arc<dyn ClusterConnection>> {
        // single cluster: failover settings are never parsed
        if config.get_list(keys::FAILOVER_CLUSTERS).is_empty() {
            info!(
                "No failover clusters configured, connecting to {} directly",
                config.endpoint()
            );
            return self
                .factory
                .create_connection(config)
                .await
                .map_err(|source| build_error(PRIMARY_NAME, source));
        }

        let settings = FailoverSettings::from_configuration(config)?;
        let mut endpoints = self.build_endpoints(config, &settings).await?;
        if endpoints.len() == 1 {
            warn!("No failover cluster could be reached, using the primary alone");
            let primary = endpoints.remove(0);
            return Ok(Arc::clone(primary.connection()));
        }
        let connection =
            MultiClusterConnection::new(config.clone(), settings, endpoints, self.span.clone())?;
        Ok(Arc::new(connection))
    }

    /// Always build a [`MultiClusterConnection`], even over the primary alone
    pub async fn connect_multi(&self, config: &Configuration) -> Result<MultiClusterConnection> {
        let settings = FailoverSettings::from_configuration(config)?;
        let endpoints = self.build_endpoints(config, &settings).await?;
        MultiClusterConnection::new(config.clone(), settings, endpoints, self.span.clone())
    }

    async fn build_endpoints(
        &self,
        config: &Configuration,
        settings: &FailoverSettings,
    ) -> Result<Vec<ClusterEndpoint>> {
        let mut clusters = self.splitter.split(config)?;
        let primary_config = clusters.remove(PRIMARY_NAME).ok_or_else(|| {
            Error::Configuration(format!("no '{}' cluster in configuration", PRIMARY_NAME))
        })?;
        let mut failover_configs = Vec::with_capacity(settings.failover_clusters.len());
        for name in &settings.failover_clusters {
            let failover = clusters.remove(name).ok_or_else(|| {
                Error::Configuration(format!("no configuration for failover cluster '{}'", name))
            })?;
            failover_configs.push((name.as_str(), failover));
        }

        let primary = self
            .factory
            .create_connection(&primary_config)
            .await
            .map_err(|source| build_error(PRIMARY_NAME, source))?;
        let mut endpoints = vec![ClusterEndpoint::new(PRIMARY_NAME, primary)];

        for (name, failover) in failover_configs {
            match self.factory.create_connection(&failover).await {
                Ok(connection) => {
                    info!("Connected failover cluster {} at {}", name, failover.endpoint());
                    endpoints.push(ClusterEndpoint::new(name, connection));
                }
                Err(err) if settings.tolerate_build_failures => {
                    warn!("Skipping failover cluster {}: {}", name, err);
                }
                Err(err) => {
                    close_quietly(&endpoints).await;
                    return Err(build_error(name, err));
                }
            }
        }
        Ok(endpoints)
    }
}

impl fmt::Debug for ConnectionBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionBuilder")
            .field("span", &self.span)
            .finish_non_exhaustive()
    }
}

/// Create a connection with the default splitter.
///
/// See [`ConnectionBuilder::connect`].
pub async fn create_connection(
    config: &Configuration,
    factory: Arc<dyn ConnectionFactory>,
) -> Result<Arc<dyn ClusterConnection>> {
    ConnectionBuilder::new(factory).connect(config).await
}

fn build_error(cluster: &str, source: Error) -> Error {
    Error::ConnectionBuild {
        cluster: cluster.to_string(),
        source: Box::new(source),
    }
}

async fn close_quietly(endpoints: &[ClusterEndpoint]) {
    for endpoint in endpoints {
        if let Err(err) = endpoint.connection().close().await {
            warn!(
                "Failed to close connection to {} after build failure: {}",
                endpoint.name(),
                err
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use tandem_memory::MemoryConnectionFactory;

    fn combined(failovers: &[&str]) -> Configuration {
        let mut config = Configuration::new().with(keys::CLUSTER_ENDPOINT, "zk-primary");
        if !failovers.is_empty() {
            config.set(keys::FAILOVER_CLUSTERS, failovers.join(","));
        }
        for name in failovers {
            config.set(
                format!("tandem.failover.cluster.{}.{}", name, keys::CLUSTER_ENDPOINT),
                format!("zk-{}", name),
            );
        }
        config
    }

    fn factory(endpoints: &[&str]) -> Arc<MemoryConnectionFactory> {
        let factory = Arc::new(MemoryConnectionFactory::new());
        for endpoint in endpoints {
            factory.add_cluster(endpoint);
        }
        factory
    }

    #[tokio::test]
    async fn test_zero_failovers_pass_through() {
        let backend = factory(&["zk-primary"]);
        let config = combined(&[]);

        let conn = create_connection(&config, backend.clone()).await.unwrap();
        assert_eq!(conn.cluster_count(), 1);
        assert_eq!(conn.configuration(), &config);
        assert_eq!(backend.cluster("zk-primary").unwrap().traffic().connections, 1);

        // the backend connection itself, not a wrapper around it
        let err = conn.process_batch(&"t1".parse().unwrap(), &[]).await.unwrap_err();
        assert_eq!(err.code(), "TableNotFound");
    }

    #[tokio::test]
    async fn test_zero_failovers_ignore_thresholds() {
        let backend = factory(&["zk-primary"]);
        let config = combined(&[]).with(keys::ACCEPT_PRIMARY_RESULT_MS, "soon");

        let conn = create_connection(&config, backend).await.unwrap();
        assert_eq!(conn.cluster_count(), 1);

        // the same value is still rejected once failovers are configured
        let backend = factory(&["zk-primary", "zk-dr"]);
        let config = combined(&["dr"]).with(keys::ACCEPT_PRIMARY_RESULT_MS, "soon");
        let err = create_connection(&config, backend).await.err().unwrap();
        assert_eq!(err.code(), "ConfigurationError");
    }

    #[tokio::test]
    async fn test_builds_failovers_in_order() {
        let backend = factory(&["zk-primary", "zk-dr-west", "zk-dr-east"]);
        let builder = ConnectionBuilder::new(backend);

        let conn = builder
            .connect_multi(&combined(&["dr-west", "dr-east"]))
            .await
            .unwrap();
        let names: Vec<_> = conn.endpoints().iter().map(|e| e.name()).collect();
        assert_eq!(names, ["primary", "dr-west", "dr-east"]);
        assert_eq!(conn.failovers()[0].configuration().endpoint(), "zk-dr-west");
    }

    #[tokio::test]
    async fn test_build_failure_closes_built_connections() {
        let backend = factory(&["zk-primary", "zk-dr-a", "zk-dr-b"]);
        backend.set_unreachable("zk-dr-b", true);

        let err = create_connection(&combined(&["dr-a", "dr-b"]), backend.clone())
            .await
            .err()
            .unwrap();
        match &err {
            Error::ConnectionBuild { cluster, .. } => assert_eq!(cluster, "dr-b"),
            other => panic!("unexpected error {:?}", other),
        }
        assert_eq!(backend.cluster("zk-primary").unwrap().traffic().closes, 1);
        assert_eq!(backend.cluster("zk-dr-a").unwrap().traffic().closes, 1);
    }

    #[tokio::test]
    async fn test_primary_build_failure() {
        let backend = factory(&["zk-dr"]);
        let err = create_connection(&combined(&["dr"]), backend).await.err().unwrap();
        match err {
            Error::ConnectionBuild { cluster, .. } => assert_eq!(cluster, PRIMARY_NAME),
            other => panic!("unexpected error {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_tolerated_failover_build_failure() {
        let backend = factory(&["zk-primary", "zk-dr-a", "zk-dr-b"]);
        backend.set_unreachable("zk-dr-a", true);
        let config = combined(&["dr-a", "dr-b"]).with(keys::TOLERATE_BUILD_FAILURES, true);

        let conn = ConnectionBuilder::new(backend.clone())
            .connect_multi(&config)
            .await
            .unwrap();
        assert_eq!(conn.cluster_count(), 2);
        assert_eq!(conn.failovers()[0].name(), "dr-b");

        // nothing reachable but the primary: plain primary connection
        backend.set_unreachable("zk-dr-b", true);
        let conn = create_connection(&config, backend).await.unwrap();
        assert_eq!(conn.cluster_count(), 1);
    }

    #[tokio::test]
    async fn test_invalid_thresholds_rejected() {
        let backend = factory(&["zk-primary", "zk-dr"]);
        let config = combined(&["dr"]).with(keys::MUTATE_FAILOVER_MS, -5);
        let err = create_connection(&config, backend).await.err().unwrap();
        assert_eq!(err.code(), "ConfigurationError");
    }

    struct NoPrimary;

    impl ConfigSplitter for NoPrimary {
        fn split(&self, _combined: &Configuration) -> Result<BTreeMap<String, Configuration>> {
            Ok(BTreeMap::new())
        }
    }

    #[tokio::test]
    async fn test_split_without_primary() {
        let backend = factory(&["zk-primary", "zk-dr"]);
        let err = ConnectionBuilder::new(backend)
            .splitter(NoPrimary)
            .connect(&combined(&["dr"]))
            .await
            .err()
            .unwrap();
        assert_eq!(err.code(), "ConfigurationError");
    }
}
