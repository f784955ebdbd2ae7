//! Multi-cluster table handle

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::FutureExt;
use tandem_core::traits::Table;
use tandem_core::types::{Delete, Get, Mutation, Put, RowResult, TableName};
use tandem_core::{Error, FailoverSettings, FailoverThresholds, Result};
use tokio::time::Instant;
use tracing::{warn, Instrument, Span};

use crate::health::PrimaryHealth;
use crate::pool::WorkerPool;
use crate::speculative::{
    mutate_primary, race, PrimaryTiming, RaceContext, Replica, ReplicaOp, Served, Timing,
};
use crate::stats::{Operation, StatsRecorder, TableStats};

/// One table across the primary and every failover cluster.
///
/// Reads go to the primary first and fall over to the failovers when the
/// primary is slow or failing. Writes go to the primary only, unless the
/// connection is master-master.
pub struct MultiClusterTable {
    name: TableName,
    replicas: Vec<Replica>,
    thresholds: FailoverThresholds,
    master_master: bool,
    /// Overall bound on one operation
    deadline: Option<Duration>,
    pool: Arc<WorkerPool>,
    health: Arc<PrimaryHealth>,
    stats: StatsRecorder,
    span: Span,
}

impl MultiClusterTable {
    pub(crate) fn new(
        name: TableName,
        replicas: Vec<Replica>,
        settings: &FailoverSettings,
        pool: Arc<WorkerPool>,
        health: Arc<PrimaryHealth>,
        span: Span,
    ) -> Self {
        Self {
            stats: StatsRecorder::new(name.to_string()),
            name,
            replicas,
            thresholds: settings.thresholds,
            master_master: settings.master_master,
            deadline: settings.operation_deadline(),
            pool,
            health,
            span,
        }
    }

    /// Names of the clusters this table spans, primary first
    pub fn clusters(&self) -> impl Iterator<Item = &str> {
        self.replicas.iter().map(|r| r.name.as_str())
    }

    pub fn stats(&self) -> TableStats {
        self.stats.snapshot()
    }

    fn context(&self, op: Operation) -> RaceContext<'_> {
        RaceContext {
            replicas: &self.replicas,
            pool: &self.pool,
            health: &self.health,
            deadline: self.deadline,
            operation: op.as_str(),
        }
    }

    fn read_timing(&self, batch: bool) -> Timing {
        let t = &self.thresholds;
        if batch {
            Timing {
                accept_primary: t.accept_primary_batch_result,
                request_failover: t.request_failover_batch,
                after_primary_error: Duration::ZERO,
            }
        } else {
            Timing {
                accept_primary: t.accept_primary_result,
                request_failover: t.request_failover_read,
                after_primary_error: Duration::ZERO,
            }
        }
    }

    fn write_window(&self, batch: bool) -> Duration {
        if batch {
            self.thresholds.mutate_failover_batch
        } else {
            self.thresholds.mutate_failover
        }
    }

    async fn read<T>(&self, op: Operation, f: ReplicaOp<T>) -> Result<Served<T>>
    where
        T: Send + 'static,
    {
        let start = Instant::now();
        let result = race(&self.context(op), self.read_timing(op.is_batch()), f)
            .instrument(self.span.clone())
            .await;
        self.record(op, start, &result);
        result
    }

    async fn write<T>(&self, op: Operation, f: ReplicaOp<T>) -> Result<Served<T>>
    where
        T: Send + 'static,
    {
        let start = Instant::now();
        let window = self.write_window(op.is_batch());
        let ctx = self.context(op);
        let result = if self.master_master {
            let timing = Timing {
                accept_primary: window,
                request_failover: Duration::ZERO,
                after_primary_error: self.thresholds.mutate_failover_after_primary_exception,
            };
            race(&ctx, timing, f).instrument(self.span.clone()).await
        } else {
            let timing = PrimaryTiming {
                attempt_deadline: window,
                retry_delay: self.thresholds.mutate_failover_after_primary_exception,
            };
            mutate_primary(&ctx, timing, f)
                .instrument(self.span.clone())
                .await
        };
        self.record(op, start, &result);
        result
    }

    fn record<T>(&self, op: Operation, start: Instant, result: &Result<Served<T>>) {
        let latency = start.elapsed();
        match result {
            Ok(served) => self.stats.record_served(op, served.primary, latency),
            Err(err) => {
                let timed_out =
                    err.is_timeout() || err.cluster_failures().iter().any(|f| f.error.is_timeout());
                self.stats.record_failure(op, timed_out, latency);
            }
        }
    }

    /// Like [`Table::get`], also reporting which cluster answered
    pub async fn get_served(&self, get: &Get) -> Result<Served<RowResult>> {
        let get = get.clone();
        self.read(
            Operation::Get,
            Arc::new(move |table: Arc<dyn Table>| {
                let get = get.clone();
                async move { table.get(&get).await }.boxed()
            }),
        )
        .await
    }

    /// Like [`Table::put`], also reporting which cluster accepted the write
    pub async fn put_served(&self, put: &Put) -> Result<Served<()>> {
        let put = put.clone();
        self.write(
            Operation::Put,
            Arc::new(move |table: Arc<dyn Table>| {
                let put = put.clone();
                async move { table.put(&put).await }.boxed()
            }),
        )
        .await
    }
}

impl fmt::Debug for MultiClusterTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MultiClusterTable")
            .field("name", &self.name)
            .field("clusters", &self.clusters().collect::<Vec<_>>())
            .field("master_master", &self.master_master)
            .finish()
    }
}

#[async_trait]
impl Table for MultiClusterTable {
    fn name(&self) -> &TableName {
        &self.name
    }

    async fn get(&self, get: &Get) -> Result<RowResult> {
        Ok(self.get_served(get).await?.value)
    }

    /// Races the whole batch as one unit, using the batch thresholds
    async fn get_batch(&self, gets: &[Get]) -> Result<Vec<RowResult>> {
        if gets.is_empty() {
            return Ok(Vec::new());
        }
        let gets: Arc<[Get]> = gets.into();
        let served = self
            .read(
                Operation::GetBatch,
                Arc::new(move |table: Arc<dyn Table>| {
                    let gets = Arc::clone(&gets);
                    async move { table.get_batch(&gets).await }.boxed()
                }),
            )
            .await?;
        Ok(served.value)
    }

    async fn exists(&self, get: &Get) -> Result<bool> {
        let get = get.clone();
        let served = self
            .read(
                Operation::Exists,
                Arc::new(move |table: Arc<dyn Table>| {
                    let get = get.clone();
                    async move { table.exists(&get).await }.boxed()
                }),
            )
            .await?;
        Ok(served.value)
    }

    /// Write one row.
    ///
    /// On a master-master connection a slow or failing primary causes the
    /// same write to be sent to every failover cluster. Several clusters may
    /// then apply it, possibly in a different order relative to concurrent
    /// writes, so the clusters can diverge.
    async fn put(&self, put: &Put) -> Result<()> {
        self.put_served(put).await.map(|_| ())
    }

    /// Delete cells or a whole row; the master-master caveat of
    /// [`put`](Table::put) applies
    async fn delete(&self, delete: &Delete) -> Result<()> {
        let delete = delete.clone();
        self.write(
            Operation::Delete,
            Arc::new(move |table: Arc<dyn Table>| {
                let delete = delete.clone();
                async move { table.delete(&delete).await }.boxed()
            }),
        )
        .await
        .map(|_| ())
    }

    async fn mutate_batch(&self, mutations: &[Mutation]) -> Result<()> {
        if mutations.is_empty() {
            return Ok(());
        }
        let mutations: Arc<[Mutation]> = mutations.into();
        self.write(
            Operation::MutateBatch,
            Arc::new(move |table: Arc<dyn Table>| {
                let mutations = Arc::clone(&mutations);
                async move { table.mutate_batch(&mutations).await }.boxed()
            }),
        )
        .await
        .map(|_| ())
    }

    /// Release the table on every cluster, reporting the last failure
    async fn close(&self) -> Result<()> {
        let mut failed = 0;
        let mut last_failure = None;
        for replica in &self.replicas {
            if let Err(err) = replica.table.close().await {
                warn!("Failed to release table {} on {}: {}", self.name, replica.name, err);
                failed += 1;
                last_failure = Some((replica.name.clone(), err));
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
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::MultiClusterConnection;
    use crate::factory::ConnectionBuilder;
    use tandem_core::config::keys;
    use tandem_core::{ClusterConnection, Configuration};
    use tandem_memory::{MemoryCluster, MemoryConnectionFactory};

    const CLUSTERS: [&str; 3] = ["primary", "dr-a", "dr-b"];

    struct Fixture {
        primary: MemoryCluster,
        dr_a: MemoryCluster,
        dr_b: MemoryCluster,
        connection: MultiClusterConnection,
        table: MultiClusterTable,
    }

    async fn setup(configure: impl FnOnce(Configuration) -> Configuration) -> Fixture {
        let backend = Arc::new(MemoryConnectionFactory::new());
        let mut config = Configuration::new()
            .with(keys::CLUSTER_ENDPOINT, "zk-primary")
            .with(keys::FAILOVER_CLUSTERS, "dr-a,dr-b");
        for name in CLUSTERS {
            backend
                .add_cluster(&format!("zk-{}", name))
                .create_simple_table("t1")
                .unwrap();
            if name != "primary" {
                config.set(
                    format!("tandem.failover.cluster.{}.{}", name, keys::CLUSTER_ENDPOINT),
                    format!("zk-{}", name),
                );
            }
        }
        let config = configure(config);

        let connection = ConnectionBuilder::new(backend.clone())
            .connect_multi(&config)
            .await
            .unwrap();
        let table = connection
            .multi_table(&TableName::parse("t1").unwrap())
            .await
            .unwrap();
        let cluster = |name: &str| backend.cluster(&format!("zk-{}", name)).unwrap();
        Fixture {
            primary: cluster("primary"),
            dr_a: cluster("dr-a"),
            dr_b: cluster("dr-b"),
            connection,
            table,
        }
    }

    fn immediate(mut config: Configuration) -> Configuration {
        FailoverThresholds::immediate().write_to(&mut config);
        config
    }

    fn row(value: &str) -> Put {
        Put::new("r1").add_column("cf", "c", value.to_string())
    }

    #[tokio::test(start_paused = true)]
    async fn test_fast_primary_keeps_failovers_idle() {
        let fx = setup(|c| c).await;
        fx.primary.set_latency(Duration::from_millis(10));

        let served = fx.table.get_served(&Get::new("r1")).await.unwrap();
        assert!(served.primary);

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(fx.primary.reads(), 1);
        assert_eq!(fx.dr_a.reads(), 0);
        assert_eq!(fx.dr_b.reads(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_primary_error_fails_over_without_waiting() {
        let fx = setup(|c| c).await;
        fx.primary.fail_reads(true);

        let start = Instant::now();
        let served = fx.table.get_served(&Get::new("r1")).await.unwrap();
        assert!(!served.primary);
        assert!(start.elapsed() < Duration::from_millis(100));
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_primary_fails_over_after_both_windows() {
        let fx = setup(|c| {
            c.with(keys::ACCEPT_PRIMARY_RESULT_MS, 30)
                .with(keys::REQUEST_FAILOVER_READ_MS, 20)
        })
        .await;
        fx.primary.set_latency(Duration::from_secs(1));

        let start = Instant::now();
        let served = fx.table.get_served(&Get::new("r1")).await.unwrap();
        assert!(!served.primary);
        assert!(start.elapsed() >= Duration::from_millis(50));
        assert!(start.elapsed() < Duration::from_secs(1));
        assert_eq!(fx.table.stats().served_by_failover, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_thresholds_first_failover_serves_immediately() {
        let fx = setup(immediate).await;
        fx.primary.fail_reads(true);
        fx.dr_b.set_latency(Duration::from_secs(1));

        let start = Instant::now();
        let served = fx.table.get_served(&Get::new("r1")).await.unwrap();
        assert_eq!(served.cluster, "dr-a");
        assert!(start.elapsed() < Duration::from_millis(5));
        assert_eq!(fx.dr_a.reads(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_second_failover_rescues_read() {
        let fx = setup(immediate).await;
        fx.primary.fail_reads(true);
        fx.dr_a.fail_reads(true);

        let served = fx.table.get_served(&Get::new("r1")).await.unwrap();
        assert_eq!(served.cluster, "dr-b");
    }

    #[tokio::test(start_paused = true)]
    async fn test_every_cluster_failing_is_aggregated() {
        let fx = setup(immediate).await;
        for cluster in [&fx.primary, &fx.dr_a, &fx.dr_b] {
            cluster.fail_reads(true);
        }

        let err = fx.table.get(&Get::new("r1")).await.unwrap_err();
        assert_eq!(err.code(), "AggregateOperationFailure");
        let mut clusters: Vec<_> = err
            .cluster_failures()
            .iter()
            .map(|f| f.cluster.as_str())
            .collect();
        clusters.sort_unstable();
        assert_eq!(clusters, ["dr-a", "dr-b", "primary"]);
        assert_eq!(fx.table.stats().failures, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cooldown_skips_failed_primary() {
        let fx = setup(|c| c.with(keys::PRIMARY_RETRY_COOLDOWN_MS, 1000)).await;
        fx.primary.fail_reads(true);
        fx.table.get(&Get::new("r1")).await.unwrap();
        assert!(fx.connection.primary_cooling_down());

        fx.primary.heal();
        fx.table.get(&Get::new("r1")).await.unwrap();
        assert_eq!(fx.primary.reads(), 1);

        tokio::time::sleep(Duration::from_millis(1000)).await;
        let served = fx.table.get_served(&Get::new("r1")).await.unwrap();
        assert!(served.primary);
        assert_eq!(fx.primary.reads(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_batch_reads_use_batch_thresholds() {
        let fx = setup(|c| {
            c.with(keys::ACCEPT_PRIMARY_RESULT_MS, 5000)
                .with(keys::ACCEPT_PRIMARY_BATCH_RESULT_MS, 0)
                .with(keys::REQUEST_FAILOVER_BATCH_MS, 0)
        })
        .await;
        fx.primary.set_latency(Duration::from_secs(1));

        let start = Instant::now();
        let results = fx
            .table
            .get_batch(&[Get::new("r1"), Get::new("r2")])
            .await
            .unwrap();
        assert_eq!(results.len(), 2);
        assert!(start.elapsed() < Duration::from_secs(1));

        assert!(fx.table.get_batch(&[]).await.unwrap().is_empty());
        assert_eq!(fx.table.stats().reads, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exists_reads_through_failover() {
        let fx = setup(immediate).await;
        fx.primary.fail_reads(true);
        let name = TableName::parse("t1").unwrap();
        for cluster in [&fx.dr_a, &fx.dr_b] {
            let conn = cluster.connect(Configuration::new());
            conn.table(&name).await.unwrap().put(&row("v")).await.unwrap();
        }

        assert!(fx.table.exists(&Get::new("r1")).await.unwrap());
        assert!(!fx.table.exists(&Get::new("missing")).await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_primary_write_never_replayed() {
        let fx = setup(|c| c).await;

        let served = fx.table.put_served(&row("v1")).await.unwrap();
        assert!(served.primary);
        fx.table.delete(&Delete::new("r2")).await.unwrap();

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(fx.primary.traffic().writes_applied, 2);
        assert_eq!(fx.dr_a.writes(), 0);
        assert_eq!(fx.dr_b.writes(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_primary_write_times_out_without_failover() {
        let fx = setup(|c| c.with(keys::MUTATE_FAILOVER_MS, 100)).await;
        fx.primary.set_latency(Duration::from_secs(1));

        let err = fx.table.put(&row("v1")).await.unwrap_err();
        assert!(err.is_timeout());
        assert_eq!(fx.dr_a.writes() + fx.dr_b.writes(), 0);
        assert_eq!(fx.table.stats().timeouts, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_primary_write_does_not_start_cooldown() {
        let fx = setup(|c| c.with(keys::MUTATE_FAILOVER_MS, 100)).await;
        fx.primary.set_latency(Duration::from_millis(300));

        let err = fx.table.put(&row("v1")).await.unwrap_err();
        assert!(err.is_timeout());
        assert!(!fx.connection.primary_cooling_down());

        fx.primary.set_latency(Duration::ZERO);
        let served = fx.table.get_served(&Get::new("r1")).await.unwrap();
        assert!(served.primary);
        assert_eq!(fx.primary.reads(), 1);
        assert_eq!(fx.dr_a.reads() + fx.dr_b.reads(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_primary_write_is_retried_once() {
        let fx = setup(|c| c.with(keys::MUTATE_FAILOVER_AFTER_PRIMARY_EXCEPTION_MS, 25)).await;
        fx.primary.fail_next_writes(1);

        let mutations: Vec<Mutation> = vec![row("v1").into(), Delete::new("r9").into()];
        let start = Instant::now();
        fx.table.mutate_batch(&mutations).await.unwrap();
        assert!(start.elapsed() >= Duration::from_millis(25));
        assert_eq!(fx.primary.writes(), 2);
        assert_eq!(fx.dr_a.writes() + fx.dr_b.writes(), 0);

        fx.primary.fail_next_writes(2);
        assert!(fx.table.put(&row("v2")).await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_master_master_write_fails_over() {
        let fx = setup(|c| {
            c.with(keys::MASTER_MASTER, true)
                .with(keys::MUTATE_FAILOVER_MS, 100)
                .with(keys::MUTATE_FAILOVER_AFTER_PRIMARY_EXCEPTION_MS, 50)
        })
        .await;
        fx.primary.fail_writes(true);

        let start = Instant::now();
        let served = fx.table.put_served(&row("v1")).await.unwrap();
        assert!(!served.primary);
        assert!(start.elapsed() >= Duration::from_millis(50));
        assert!(start.elapsed() < Duration::from_millis(100));

        let table = TableName::parse("t1").unwrap();
        let written = [&fx.dr_a, &fx.dr_b]
            .iter()
            .filter(|c| c.stored_value(&table, b"r1", "cf", "c").is_some())
            .count();
        assert!(written >= 1);
        assert!(fx.primary.stored_value(&table, b"r1", "cf", "c").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_master_master_slow_primary_writes_everywhere() {
        let fx = setup(|c| {
            c.with(keys::MASTER_MASTER, true)
                .with(keys::MUTATE_FAILOVER_MS, 100)
        })
        .await;
        fx.primary.set_latency(Duration::from_millis(300));

        let start = Instant::now();
        let served = fx.table.put_served(&row("v1")).await.unwrap();
        assert!(!served.primary);
        assert!(start.elapsed() >= Duration::from_millis(100));
        assert!(start.elapsed() < Duration::from_millis(300));

        // the primary write is left running and still lands
        tokio::time::sleep(Duration::from_secs(1)).await;
        let table = TableName::parse("t1").unwrap();
        for cluster in [&fx.primary, &fx.dr_a, &fx.dr_b] {
            assert_eq!(cluster.writes(), 1);
            assert_eq!(
                cluster.stored_value(&table, b"r1", "cf", "c").as_deref(),
                Some(&b"v1"[..])
            );
        }
        assert!(!fx.connection.primary_cooling_down());
    }

    #[tokio::test(start_paused = true)]
    async fn test_operation_deadline_reports_every_cluster() {
        let fx = setup(|c| c.with(keys::OPERATION_TIMEOUT_MS, 300)).await;
        for cluster in [&fx.primary, &fx.dr_a, &fx.dr_b] {
            cluster.set_latency(Duration::from_secs(10));
        }

        let err = fx.table.get(&Get::new("r1")).await.unwrap_err();
        let failures = err.cluster_failures();
        assert_eq!(failures.len(), 3);
        assert!(failures.iter().all(|f| f.error.is_timeout()));
        assert_eq!(fx.table.stats().timeouts, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_closed_connection_rejects_table_work() {
        let fx = setup(immediate).await;
        fx.connection.close().await.unwrap();

        let err = fx.table.get(&Get::new("r1")).await.unwrap_err();
        assert!(err
            .cluster_failures()
            .iter()
            .all(|f| matches!(f.error, Error::Closed)));
        assert_eq!(fx.primary.reads(), 0);
    }
}
