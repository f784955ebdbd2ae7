//! Combined multi-cluster configuration
//!
//! A combined configuration is the primary's configuration plus, for each
//! failover cluster `<name>`, that cluster's own keys stored under
//! `tandem.failover.cluster.<name>.`:
//!
//! ```text
//! tandem.cluster.endpoint = zk-primary:2181
//! tandem.failover.clusters = dr-east
//! tandem.failover.cluster.dr-east.tandem.cluster.endpoint = zk-east:2181
//! ```
//!
//! Splitting gives every failover the primary's base keys overlaid with its
//! own, so only the keys that differ need to be repeated.

use std::collections::BTreeMap;

use tandem_core::config::{keys, validate_cluster_name};
use tandem_core::{Configuration, Error, Result, PRIMARY_NAME};
use tracing::warn;

/// Keys that only make sense on the combined configuration
const MULTI_CLUSTER_PREFIX: &str = "tandem.failover.";

/// Turns one combined configuration into per-cluster configurations
pub trait ConfigSplitter: Send + Sync {
    /// Map of cluster name to configuration; always contains `primary`
    fn split(&self, combined: &Configuration) -> Result<BTreeMap<String, Configuration>>;
}

/// The `tandem.failover.cluster.<name>.` prefix layout
#[derive(Debug, Clone, Copy, Default)]
pub struct PrefixSplitter;

impl ConfigSplitter for PrefixSplitter {
    fn split(&self, combined: &Configuration) -> Result<BTreeMap<String, Configuration>> {
        split(combined)
    }
}

fn cluster_prefix(name: &str) -> String {
    format!("{}{}.", keys::FAILOVER_CLUSTER_PREFIX, name)
}

/// Split a combined configuration with the default prefix layout
pub fn split(combined: &Configuration) -> Result<BTreeMap<String, Configuration>> {
    let names = combined.get_list(keys::FAILOVER_CLUSTERS);

    let base: Configuration = combined
        .iter()
        .filter(|(k, _)| !k.starts_with(MULTI_CLUSTER_PREFIX))
        .collect();

    let mut clusters = BTreeMap::new();
    for name in &names {
        validate_cluster_name(name)?;
        let own = combined.with_prefix(&cluster_prefix(name));
        if own.is_empty() {
            return Err(Error::Configuration(format!(
                "failover cluster '{}' has no configuration under {}",
                name,
                cluster_prefix(name)
            )));
        }
        let mut config = base.clone();
        config.overlay(&own);
        if clusters.insert(name.clone(), config).is_some() {
            return Err(Error::Configuration(format!(
                "failover cluster '{}' is listed twice",
                name
            )));
        }
    }

    for (key, _) in combined.with_prefix(keys::FAILOVER_CLUSTER_PREFIX).iter() {
        let name = key.split('.').next().unwrap_or_default();
        if !names.iter().any(|n| n == name) {
            warn!("Ignoring configuration for unlisted failover cluster '{}'", name);
        }
    }

    clusters.insert(PRIMARY_NAME.to_string(), base);
    Ok(clusters)
}

/// Build a combined configuration from the primary and named failovers.
///
/// Failovers keep the order given; it becomes the order they are consulted.
pub fn combine_configurations<'a, I>(
    primary: &Configuration,
    failovers: I,
) -> Result<Configuration>
where
    I: IntoIterator<Item = (&'a str, &'a Configuration)>,
{
    let mut combined: Configuration = primary
        .iter()
        .filter(|(k, _)| {
            *k != keys::FAILOVER_CLUSTERS && !k.starts_with(keys::FAILOVER_CLUSTER_PREFIX)
        })
        .collect();

    let mut names: Vec<&str> = Vec::new();
    for (name, config) in failovers {
        validate_cluster_name(name)?;
        if names.contains(&name) {
            return Err(Error::Configuration(format!(
                "failover cluster '{}' is listed twice",
                name
            )));
        }
        let prefix = cluster_prefix(name);
        for (key, value) in config.iter() {
            if !key.starts_with(MULTI_CLUSTER_PREFIX) {
                combined.set(format!("{}{}", prefix, key), value);
            }
        }
        names.push(name);
    }

    if !names.is_empty() {
        combined.set(keys::FAILOVER_CLUSTERS, names.join(","));
    }
    Ok(combined)
}
