//! Multi-cluster connection
//!
//! Owns one connection per cluster, the worker pool shared by every table
//! handle, and the primary's health. Metadata and administration go to the
//! primary only; row operations go through [`MultiClusterTable`].

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::join_all;
use tandem_core::traits::{Admin, ClusterConnection, RegionLocator, Table};
use tandem_core::types::{Mutation, TableName};
use tandem_core::{Configuration, Error, FailoverSettings, Result, PRIMARY_NAME};
use tracing::{debug, error, info, info_span, warn, Instrument, Span};
use uuid::Uuid;

use crate::health::PrimaryHealth;
use crate::pool::WorkerPool;
use crate::speculative::Replica;
use crate::table::MultiClusterTable;

/// One cluster behind a multi-cluster connection
#[derive(Clone)]
pub struct ClusterEndpoint {
    name: String,
    connection: Arc<dyn ClusterConnection>,
}

impl ClusterEndpoint {
    pub fn new(name: impl Into<String>, connection: Arc<dyn ClusterConnection>) -> Self {
        Self {
            name: name.into(),
            connection,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_primary(&self) -> bool {
        self.name == PRIMARY_NAME
    }

    pub fn configuration(&self) -> &Configuration {
        self.connection.configuration()
    }

    pub fn connection(&self) -> &Arc<dyn ClusterConnection> {
        &self.connection
    }
}

impl fmt::Debug for ClusterEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClusterEndpoint")
            .field("name", &self.name)
            .field("endpoint", &self.configuration().endpoint())
            .finish()
    }
}

/// A primary and its failover clusters behind one connection.
///
/// Endpoints are fixed at construction; index 0 is always the primary and
/// failovers follow in the order they are consulted.
pub struct MultiClusterConnection {
    id: Uuid,
    config: Configuration,
    settings: FailoverSettings,
    endpoints: Vec<ClusterEndpoint>,
    pool: Arc<WorkerPool>,
    health: Arc<PrimaryHealth>,
    span: Span,
    closed: AtomicBool,
    created_at: DateTime<Utc>,
}

impl MultiClusterConnection {
    /// Assemble a connection from already-built endpoints.
    ///
    /// `span` is attached to every operation of this connection and its
    /// tables; without one a `multi_cluster` span carrying the connection id
    /// is created.
    pub fn new(
        config: Configuration,
        settings: FailoverSettings,
        endpoints: Vec<ClusterEndpoint>,
        span: Option<Span>,
    ) -> Result<Self> {
        settings.validate()?;
        match endpoints.first() {
            Some(first) if first.is_primary() => {}
            _ => {
                return Err(Error::Configuration(
                    "the first endpoint must be the primary".to_string(),
                ))
            }
        }
        for (i, endpoint) in endpoints.iter().enumerate().skip(1) {
            if endpoint.is_primary() || endpoints[..i].iter().any(|e| e.name == endpoint.name) {
                return Err(Error::Configuration(format!(
                    "duplicate cluster name '{}'",
                    endpoint.name
                )));
            }
        }

        let id = Uuid::new_v4();
        let span = span.unwrap_or_else(|| {
            info_span!("multi_cluster", connection = %id, clusters = endpoints.len())
        });
        span.in_scope(|| {
            info!(
                "Multi-cluster connection ready: primary {} with {} failover(s), master_master={}",
                endpoints[0].configuration().endpoint(),
                endpoints.len() - 1,
                settings.master_master
            );
        });

        Ok(Self {
            id,
            config,
            pool: Arc::new(WorkerPool::new(settings.pool_size)),
            health: Arc::new(PrimaryHealth::new(settings.thresholds.primary_retry_cooldown)),
            settings,
            endpoints,
            span,
            closed: AtomicBool::new(false),
            created_at: Utc::now(),
        })
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn settings(&self) -> &FailoverSettings {
        &self.settings
    }

    pub fn endpoints(&self) -> &[ClusterEndpoint] {
        &self.endpoints
    }

    pub fn primary(&self) -> &ClusterEndpoint {
        &self.endpoints[0]
    }

    pub fn failovers(&self) -> &[ClusterEndpoint] {
        &self.endpoints[1..]
    }

    pub fn span(&self) -> &Span {
        &self.span
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Whether the primary is currently being skipped after a failure
    pub fn primary_cooling_down(&self) -> bool {
        self.health.in_cooldown()
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::Closed);
        }
        Ok(())
    }

    /// Acquire `name` on every cluster.
    ///
    /// All clusters are asked concurrently. If any of them fails, the tables
    /// already acquired are closed and the failing cluster is reported.
    pub async fn multi_table(&self, name: &TableName) -> Result<MultiClusterTable> {
        self.ensure_open()?;
        async {
            let acquired = join_all(
                self.endpoints
                    .iter()
                    .map(|endpoint| endpoint.connection.table(name)),
            )
            .await;

            let mut replicas = Vec::with_capacity(acquired.len());
            let mut failure = None;
            for (endpoint, result) in self.endpoints.iter().zip(acquired) {
                match result {
                    Ok(table) => replicas.push(Replica {
                        name: endpoint.name.clone(),
                        table,
                    }),
                    Err(err) if failure.is_none() => failure = Some((endpoint.name.clone(), err)),
                    Err(err) => warn!("Table {} also unavailable on {}: {}", name, endpoint.name, err),
                }
            }

            if let Some((cluster, source)) = failure {
                error!("Failed to acquire table {} on {}: {}", name, cluster, source);
                for replica in &replicas {
                    if let Err(err) = replica.table.close().await {
                        warn!("Failed to release table {} on {}: {}", name, replica.name, err);
                    }
                }
                return Err(Error::TableAcquisition {
                    cluster,
                    table: name.to_string(),
                    source: Box::new(source),
                });
            }

            debug!("Acquired table {} on {} cluster(s)", name, replicas.len());
            Ok(MultiClusterTable::new(
                name.clone(),
                replicas,
                &self.settings,
                Arc::clone(&self.pool),
                Arc::clone(&self.health),
                self.span.clone(),
            ))
        }
        .instrument(self.span.clone())
        .await
    }
}

impl fmt::Debug for MultiClusterConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MultiClusterConnection")
            .field("id", &self.id)
            .field("endpoints", &self.endpoints)
            .field("master_master", &self.settings.master_master)
            .field("pool_size", &self.pool.size())
            .field("closed", &self.closed.load(Ordering::Acquire))
            .finish()
    }
}

#[async_trait]
impl ClusterConnection for MultiClusterConnection {
    /// The combined configuration this connection was built from
    fn configuration(&self) -> &Configuration {
        &self.config
    }

    async fn table(&self, name: &TableName) -> Result<Arc<dyn Table>> {
        Ok(Arc::new(self.multi_table(name).await?))
    }

    async fn admin(&self) -> Result<Arc<dyn Admin>> {
        self.ensure_open()?;
        self.primary().connection.admin().await
    }

    async fn region_locator(&self, name: &TableName) -> Result<Arc<dyn RegionLocator>> {
        self.ensure_open()?;
        self.primary().connection.region_locator(name).await
    }

    /// Close the pool, then every cluster connection, primary first.
    ///
    /// Every connection is attempted even if an earlier one fails. Closing
    /// twice is a no-op.
    async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        async {
            info!("Closing multi-cluster connection");
            self.pool.close();

            let mut failed = 0;
            let mut last_failure = None;
            for endpoint in &self.endpoints {
                if let Err(err) = endpoint.connection.close().await {
                    error!("Failed to close connection to {}: {}", endpoint.name, err);
                    failed += 1;
                    last_failure = Some((endpoint.name.clone(), err));
                }
            }

            match last_failure {
                Some((cluster, source)) => Err(Error::CloseFailed {
                    count: failed,
                    cluster,
                    source: Box::new(source),
                }),
                None => Ok(()),
            }
        }
        .instrument(self.span.clone())
        .await
    }

    fn abort(&self, reason: &str, cause: Option<&Error>) {
        let _guard = self.span.enter();
        error!("Aborting multi-cluster connection: {}", reason);
        for endpoint in &self.endpoints {
            endpoint.connection.abort(reason, cause);
        }
    }

    fn is_closed(&self) -> bool {
        self.primary().connection.is_closed()
    }

    fn is_aborted(&self) -> bool {
        self.primary().connection.is_aborted()
    }

    fn cluster_count(&self) -> usize {
        self.endpoints.len()
    }

    async fn process_batch(&self, _table: &TableName, _mutations: &[Mutation]) -> Result<()> {
        Err(Error::Unsupported(
            "process_batch is not available on a multi-cluster connection".to_string(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tandem_core::FailoverThresholds;
    use tandem_memory::MemoryCluster;

    struct Fixture {
        clusters: Vec<MemoryCluster>,
        connection: MultiClusterConnection,
        table: TableName,
    }

    fn fixture(names: &[&str]) -> Fixture {
        let mut clusters = Vec::new();
        let mut endpoints = Vec::new();
        for name in names {
            let cluster = MemoryCluster::new(*name);
            cluster.create_simple_table("t1").unwrap();
            let conn = cluster.connect(Configuration::new());
            endpoints.push(ClusterEndpoint::new(*name, Arc::new(conn)));
            clusters.push(cluster);
        }
        let settings = FailoverSettings {
            failover_clusters: names[1..].iter().map(|n| n.to_string()).collect(),
            thresholds: FailoverThresholds::immediate(),
            ..FailoverSettings::default()
        };
        let connection =
            MultiClusterConnection::new(Configuration::new(), settings, endpoints, None).unwrap();
        Fixture {
            clusters,
            connection,
            table: TableName::parse("t1").unwrap(),
        }
    }

    #[tokio::test]
    async fn test_endpoints_ordered_primary_first() {
        let fx = fixture(&["primary", "dr-east", "dr-west"]);
        assert_eq!(fx.connection.cluster_count(), 3);
        assert!(fx.connection.primary().is_primary());
        let names: Vec<_> = fx.connection.failovers().iter().map(|e| e.name()).collect();
        assert_eq!(names, ["dr-east", "dr-west"]);
    }

    #[test]
    fn test_rejects_bad_endpoint_layout() {
        let cluster = MemoryCluster::new("c");
        let conn = |name: &str| {
            ClusterEndpoint::new(name, Arc::new(cluster.connect(Configuration::new())))
        };

        let no_primary = vec![conn("dr")];
        assert!(MultiClusterConnection::new(
            Configuration::new(),
            FailoverSettings::default(),
            no_primary,
            None
        )
        .is_err());

        let duplicate = vec![conn("primary"), conn("dr"), conn("dr")];
        assert!(MultiClusterConnection::new(
            Configuration::new(),
            FailoverSettings::default(),
            duplicate,
            None
        )
        .is_err());
    }

    #[tokio::test]
    async fn test_table_acquisition_is_atomic() {
        let fx = fixture(&["primary", "dr"]);
        fx.clusters[1].fail_table_acquire(true);

        let err = fx.connection.table(&fx.table).await.err().unwrap();
        match err {
            Error::TableAcquisition { cluster, table, .. } => {
                assert_eq!(cluster, "dr");
                assert_eq!(table, "t1");
            }
            other => panic!("unexpected error {:?}", other),
        }

        fx.clusters[1].fail_table_acquire(false);
        let table = fx.connection.table(&fx.table).await.unwrap();
        assert_eq!(table.name(), &fx.table);
    }

    #[tokio::test]
    async fn test_metadata_goes_to_primary() {
        let fx = fixture(&["primary", "dr"]);
        fx.clusters[1].set_master_running(false);
        fx.clusters[0].create_simple_table("primary_only").unwrap();

        assert!(fx.connection.is_master_running().await.unwrap());
        let names = fx.connection.list_table_names().await.unwrap();
        assert_eq!(names.len(), 2);
        let status = fx.connection.admin().await.unwrap().cluster_status().await.unwrap();
        assert_eq!(status.cluster_id, "primary");
        let region = fx
            .connection
            .region_location(&fx.table, b"row", true)
            .await
            .unwrap();
        assert_eq!(region.server, "primary-rs1");
    }

    #[tokio::test]
    async fn test_process_batch_unsupported() {
        let fx = fixture(&["primary", "dr"]);
        let err = fx.connection.process_batch(&fx.table, &[]).await.unwrap_err();
        assert_eq!(err.code(), "UnsupportedOperationError");
    }

    #[tokio::test]
    async fn test_close_attempts_every_cluster() {
        let fx = fixture(&["primary", "dr"]);
        fx.clusters[0].fail_close(true);

        let err = fx.connection.close().await.unwrap_err();
        match &err {
            Error::CloseFailed { count, cluster, .. } => {
                assert_eq!(*count, 1);
                assert_eq!(cluster, "primary");
            }
            other => panic!("unexpected error {:?}", other),
        }
        assert_eq!(fx.clusters[1].traffic().closes, 1);

        // second close does nothing
        fx.connection.close().await.unwrap();
        assert_eq!(fx.clusters[0].traffic().closes, 1);
        assert!(matches!(fx.connection.table(&fx.table).await, Err(Error::Closed)));
    }

    #[tokio::test]
    async fn test_abort_reaches_every_cluster() {
        let fx = fixture(&["primary", "dr"]);
        let cause = Error::Cluster("session expired".into());
        fx.connection.abort("lost coordination service", Some(&cause));
        assert!(fx.connection.is_aborted());
        for endpoint in fx.connection.endpoints() {
            assert!(endpoint.connection().is_aborted());
        }
    }
}
