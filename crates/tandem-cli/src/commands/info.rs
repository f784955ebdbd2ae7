//! `tandem info`

use clap::Args;
use serde::Serialize;
use tandem_client::split;
use tandem_core::{Configuration, FailoverSettings, PRIMARY_NAME};

#[derive(Args, Debug)]
pub struct InfoArgs {
    /// Print as JSON
    #[arg(long)]
    pub json: bool,
}

#[derive(Debug, Serialize)]
pub struct ClusterInfo {
    pub name: String,
    pub endpoint: String,
    /// Number of configuration entries for this cluster
    pub entries: usize,
}

/// Clusters in the order they are consulted, plus the failover settings
#[derive(Debug, Serialize)]
pub struct Layout {
    pub settings: FailoverSettings,
    pub clusters: Vec<ClusterInfo>,
}

pub fn resolve(config: &Configuration) -> anyhow::Result<Layout> {
    let settings = FailoverSettings::from_configuration(config)?;
    let mut configs = split(config)?;

    let mut clusters = Vec::with_capacity(configs.len());
    let order = std::iter::once(PRIMARY_NAME)
        .chain(settings.failover_clusters.iter().map(String::as_str));
    for name in order {
        if let Some(cluster) = configs.remove(name) {
            clusters.push(ClusterInfo {
                name: name.to_string(),
                endpoint: cluster.endpoint().to_string(),
                entries: cluster.len(),
            });
        }
    }
    Ok(Layout { settings, clusters })
}

pub fn run(config: Configuration, args: InfoArgs) -> anyhow::Result<()> {
    let layout = resolve(&config)?;
    if args.json {
        println!("{}", serde_json::to_string_pretty(&layout)?);
        return Ok(());
    }

    println!("Clusters:");
    for cluster in &layout.clusters {
        println!(
            "  {:<16} {:<32} ({} entries)",
            cluster.name, cluster.endpoint, cluster.entries
        );
    }

    let s = &layout.settings;
    let t = &s.thresholds;
    println!();
    println!("Master-master:            {}", s.master_master);
    println!("Tolerate build failures:  {}", s.tolerate_build_failures);
    println!("Worker pool size:         {}", s.pool_size);
    println!("Operation timeout:        {:?}", s.operation_timeout);
    println!();
    println!("Thresholds:");
    println!("  accept primary result       {:?}", t.accept_primary_result);
    println!("  request failover (read)     {:?}", t.request_failover_read);
    println!("  mutate failover             {:?}", t.mutate_failover);
    println!(
        "  after primary exception     {:?}",
        t.mutate_failover_after_primary_exception
    );
    println!("  accept primary batch result {:?}", t.accept_primary_batch_result);
    println!("  request failover (batch)    {:?}", t.request_failover_batch);
    println!("  mutate failover (batch)     {:?}", t.mutate_failover_batch);
    println!("  primary retry cooldown      {:?}", t.primary_retry_cooldown);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layout_follows_failover_order() {
        let config = Configuration::from_toml_str(
            r#"
            [tandem.cluster]
            endpoint = "zk-primary:2181"

            [tandem.failover]
            clusters = ["dr-west", "dr-east"]
            master_master = true

            [tandem.failover.cluster.dr-east.tandem.cluster]
            endpoint = "zk-east:2181"

            [tandem.failover.cluster.dr-west.tandem.cluster]
            endpoint = "zk-west:2181"
            "#,
        )
        .unwrap();

        let layout = resolve(&config).unwrap();
        let names: Vec<_> = layout.clusters.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, ["primary", "dr-west", "dr-east"]);
        assert_eq!(layout.clusters[2].endpoint, "zk-east:2181");
        assert!(layout.settings.master_master);

        let json = serde_json::to_value(&layout).unwrap();
        assert_eq!(json["settings"]["thresholds"]["primary_retry_cooldown"], 5000);
    }
}
