//! `tandem simulate`
//!
//! Builds an in-memory cluster for every endpoint in the configuration and
//! drives writes and reads through the failover connection. Per-cluster
//! `memory.*` keys (latency, failing reads or writes) shape each cluster.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use clap::Args;
use serde::Serialize;
use tandem_client::{ClusterConnection, ConnectionBuilder, Table};
use tandem_core::config::keys;
use tandem_core::types::{Get, Put, TableName};
use tandem_core::Configuration;
use tandem_memory::MemoryConnectionFactory;
use tracing::{info, warn};

#[derive(Args, Debug, Clone)]
pub struct SimulateArgs {
    /// Table to exercise
    #[arg(long, default_value = "t1")]
    pub table: String,

    /// Number of write-then-read rounds
    #[arg(short = 'n', long, default_value_t = 10)]
    pub rounds: u32,

    /// Make every primary read and write fail
    #[arg(long)]
    pub fail_primary: bool,

    /// Extra latency on the primary, in milliseconds
    #[arg(long, default_value_t = 0)]
    pub primary_latency_ms: u64,

    /// Print the report as JSON
    #[arg(long)]
    pub json: bool,
}

#[derive(Debug, Default, Serialize)]
pub struct ClusterReport {
    pub name: String,
    pub endpoint: String,
    pub reads: u64,
    pub writes: u64,
    pub writes_applied: u64,
}

#[derive(Debug, Default, Serialize)]
pub struct Report {
    pub rounds: u32,
    /// Successful reads per serving cluster
    pub reads_served: BTreeMap<String, u64>,
    /// Successful writes per accepting cluster
    pub writes_served: BTreeMap<String, u64>,
    pub failed_reads: u64,
    pub failed_writes: u64,
    pub avg_latency_ms: f64,
    pub clusters: Vec<ClusterReport>,
}

const DEFAULT_ENDPOINT: &str = "sim-primary";

pub async fn execute(mut config: Configuration, args: &SimulateArgs) -> anyhow::Result<Report> {
    if config.get(keys::CLUSTER_ENDPOINT).is_none() {
        config.set(keys::CLUSTER_ENDPOINT, DEFAULT_ENDPOINT);
    }

    let backend = Arc::new(MemoryConnectionFactory::simulation());
    let connection = ConnectionBuilder::new(backend.clone())
        .connect_multi(&config)
        .await?;
    let table_name = TableName::parse(&args.table)?;

    for endpoint in connection.endpoints() {
        let Some(cluster) = backend.cluster(endpoint.configuration().endpoint()) else {
            continue;
        };
        if !cluster.has_table(&table_name) {
            cluster.create_simple_table(&args.table)?;
        }
        if endpoint.is_primary() {
            cluster.update_faults(|plan| {
                plan.fail_reads |= args.fail_primary;
                plan.fail_writes |= args.fail_primary;
                if args.primary_latency_ms > 0 {
                    plan.read_latency = Duration::from_millis(args.primary_latency_ms);
                    plan.write_latency = Duration::from_millis(args.primary_latency_ms);
                }
            });
        }
    }

    info!(
        "Simulating {} round(s) on {} cluster(s)",
        args.rounds,
        connection.cluster_count()
    );
    let table = connection.multi_table(&table_name).await?;
    let mut report = Report {
        rounds: args.rounds,
        ..Report::default()
    };

    for round in 0..args.rounds {
        let row = format!("row-{:04}", round);
        let put = Put::new(row.clone()).add_column("cf", "value", format!("v{}", round));
        match table.put_served(&put).await {
            Ok(served) => *report.writes_served.entry(served.cluster).or_default() += 1,
            Err(err) => {
                warn!("Write of {} failed: {}", row, err);
                report.failed_writes += 1;
            }
        }
        match table.get_served(&Get::new(row.clone())).await {
            Ok(served) => *report.reads_served.entry(served.cluster).or_default() += 1,
            Err(err) => {
                warn!("Read of {} failed: {}", row, err);
                report.failed_reads += 1;
            }
        }
    }

    let stats = table.stats();
    report.avg_latency_ms = stats.avg_latency().as_secs_f64() * 1000.0;
    for endpoint in connection.endpoints() {
        let address = endpoint.configuration().endpoint();
        if let Some(cluster) = backend.cluster(address) {
            let traffic = cluster.traffic();
            report.clusters.push(ClusterReport {
                name: endpoint.name().to_string(),
                endpoint: address.to_string(),
                reads: traffic.reads,
                writes: traffic.writes,
                writes_applied: traffic.writes_applied,
            });
        }
    }

    table.close().await?;
    connection.close().await?;
    Ok(report)
}

pub async fn run(config: Configuration, args: SimulateArgs) -> anyhow::Result<()> {
    let report = execute(config, &args).await?;
    if args.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    println!("Rounds:        {}", report.rounds);
    println!("Failed writes: {}", report.failed_writes);
    println!("Failed reads:  {}", report.failed_reads);
    println!("Avg latency:   {:.2} ms", report.avg_latency_ms);
    println!();
    println!("Served by:");
    for (cluster, count) in &report.writes_served {
        println!("  write  {:<16} {}", cluster, count);
    }
    for (cluster, count) in &report.reads_served {
        println!("  read   {:<16} {}", cluster, count);
    }
    println!();
    println!("Traffic:");
    for cluster in &report.clusters {
        println!(
            "  {:<16} {:<24} reads={} writes={} applied={}",
            cluster.name, cluster.endpoint, cluster.reads, cluster.writes, cluster.writes_applied
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args() -> SimulateArgs {
        SimulateArgs {
            table: "t1".to_string(),
            rounds: 4,
            fail_primary: false,
            primary_latency_ms: 0,
            json: false,
        }
    }

    fn two_clusters() -> Configuration {
        Configuration::new()
            .with(keys::FAILOVER_CLUSTERS, "dr")
            .with("tandem.failover.cluster.dr.tandem.cluster.endpoint", "sim-dr")
    }

    #[tokio::test(start_paused = true)]
    async fn test_healthy_primary_serves_everything() {
        let report = execute(two_clusters(), &args()).await.unwrap();
        assert_eq!(report.reads_served.get("primary"), Some(&4));
        assert_eq!(report.writes_served.get("primary"), Some(&4));
        assert_eq!(report.clusters.len(), 2);
        assert_eq!(report.clusters[1].endpoint, "sim-dr");
        assert_eq!(report.clusters[1].reads, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failing_primary_reads_from_failover() {
        let args = SimulateArgs {
            fail_primary: true,
            ..args()
        };
        let report = execute(two_clusters(), &args).await.unwrap();
        assert_eq!(report.failed_writes, 4);
        assert_eq!(report.reads_served.get("dr"), Some(&4));
        assert_eq!(report.clusters[1].writes, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_per_cluster_memory_keys() {
        let config = two_clusters()
            .with("tandem.failover.cluster.dr.memory.fail_reads", true)
            .with(keys::ACCEPT_PRIMARY_RESULT_MS, 0)
            .with(keys::REQUEST_FAILOVER_READ_MS, 0);
        let args = SimulateArgs {
            primary_latency_ms: 50,
            ..args()
        };
        let report = execute(config, &args).await.unwrap();
        assert_eq!(report.reads_served.get("primary"), Some(&4));
        assert_eq!(report.clusters[1].reads, 4);
    }
}
