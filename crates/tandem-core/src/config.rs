//! Configuration for Tandem
//!
//! A [`Configuration`] is a flat, string-keyed map, read once when a
//! connection is built. TOML files are accepted as well: nested tables are
//! flattened into dotted keys and arrays are joined with commas, so
//!
//! ```toml
//! [tandem.failover]
//! clusters = ["dr-east", "dr-west"]
//! ```
//!
//! is the same as `tandem.failover.clusters = "dr-east,dr-west"`.

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{Error, Result};
use crate::{DEFAULT_POOL_SIZE, PRIMARY_NAME};

/// Recognized configuration keys
pub mod keys {
    /// Comma separated list of failover cluster names
    pub const FAILOVER_CLUSTERS: &str = "tandem.failover.clusters";
    /// Whether every cluster accepts writes from this client
    pub const MASTER_MASTER: &str = "tandem.failover.master_master";
    /// Skip failover clusters whose connection cannot be built
    pub const TOLERATE_BUILD_FAILURES: &str = "tandem.failover.tolerate_build_failures";
    /// Prefix under which each failover cluster's own keys are stored
    pub const FAILOVER_CLUSTER_PREFIX: &str = "tandem.failover.cluster.";

    pub const ACCEPT_PRIMARY_RESULT_MS: &str = "tandem.wait.accept_primary_result_ms";
    pub const REQUEST_FAILOVER_READ_MS: &str = "tandem.wait.request_failover_read_ms";
    pub const MUTATE_FAILOVER_MS: &str = "tandem.wait.mutate_failover_ms";
    pub const MUTATE_FAILOVER_AFTER_PRIMARY_EXCEPTION_MS: &str =
        "tandem.wait.mutate_failover_after_primary_exception_ms";
    pub const ACCEPT_PRIMARY_BATCH_RESULT_MS: &str = "tandem.wait.accept_primary_batch_result_ms";
    pub const REQUEST_FAILOVER_BATCH_MS: &str = "tandem.wait.request_failover_batch_ms";
    pub const MUTATE_FAILOVER_BATCH_MS: &str = "tandem.wait.mutate_failover_batch_ms";
    pub const PRIMARY_RETRY_COOLDOWN_MS: &str = "tandem.wait.primary_retry_cooldown_ms";
    /// Overall bound on a single table operation, 0 disables it
    pub const OPERATION_TIMEOUT_MS: &str = "tandem.wait.operation_timeout_ms";

    /// Number of concurrent per-cluster operations per connection
    pub const POOL_SIZE: &str = "tandem.multi_cluster.pool_size";

    /// Address of a single cluster, used by connection factories and in logs
    pub const CLUSTER_ENDPOINT: &str = "tandem.cluster.endpoint";
}

/// Environment variables mapped onto configuration keys by [`Configuration::from_env`]
const ENV_OVERRIDES: &[(&str, &str)] = &[
    ("TANDEM_ENDPOINT", keys::CLUSTER_ENDPOINT),
    ("TANDEM_FAILOVER_CLUSTERS", keys::FAILOVER_CLUSTERS),
    ("TANDEM_MASTER_MASTER", keys::MASTER_MASTER),
    ("TANDEM_POOL_SIZE", keys::POOL_SIZE),
    ("TANDEM_PRIMARY_RETRY_COOLDOWN_MS", keys::PRIMARY_RETRY_COOLDOWN_MS),
    ("TANDEM_OPERATION_TIMEOUT_MS", keys::OPERATION_TIMEOUT_MS),
];

/// Flat string-keyed configuration
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Configuration {
    entries: BTreeMap<String, String>,
}

impl Configuration {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load a TOML file, flattening nested tables into dotted keys
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::Configuration(format!("Failed to read {}: {}", path.display(), e))
        })?;
        let config = Self::from_toml_str(&content)?;
        debug!("Loaded {} entries from {}", config.len(), path.display());
        Ok(config)
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        let table: toml::Table = toml::from_str(content)?;
        let mut entries = BTreeMap::new();
        for (key, value) in &table {
            flatten_into(key, value, &mut entries);
        }
        Ok(Self { entries })
    }

    /// Defaults overridden by the `TANDEM_*` environment variables
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_env_overrides(std::env::vars());
        config
    }

    /// Apply `TANDEM_*` overrides from the given variables
    pub fn apply_env_overrides<I>(&mut self, vars: I)
    where
        I: IntoIterator<Item = (String, String)>,
    {
        for (name, value) in vars {
            if let Some((_, key)) = ENV_OVERRIDES.iter().find(|(var, _)| *var == name) {
                debug!("{} overridden by {}", key, name);
                self.set(*key, value);
            }
        }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries.get(key).map(String::as_str)
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl ToString) {
        self.entries.insert(key.into(), value.to_string());
    }

    /// Builder-style [`Configuration::set`]
    pub fn with(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        self.set(key, value);
        self
    }

    pub fn remove(&mut self, key: &str) -> Option<String> {
        self.entries.remove(key)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get_bool(&self, key: &str, default: bool) -> Result<bool> {
        match self.get(key).map(str::trim) {
            None | Some("") => Ok(default),
            Some(raw) => match raw.to_ascii_lowercase().as_str() {
                "true" | "yes" | "on" | "1" => Ok(true),
                "false" | "no" | "off" | "0" => Ok(false),
                _ => Err(Error::Configuration(format!(
                    "{} must be a boolean, got '{}'",
                    key, raw
                ))),
            },
        }
    }

    pub fn get_u64(&self, key: &str, default: u64) -> Result<u64> {
        match self.get(key).map(str::trim) {
            None | Some("") => Ok(default),
            Some(raw) => raw.parse().map_err(|_| {
                Error::Configuration(format!(
                    "{} must be a non-negative integer, got '{}'",
                    key, raw
                ))
            }),
        }
    }

    pub fn get_usize(&self, key: &str, default: usize) -> Result<usize> {
        let value = self.get_u64(key, default as u64)?;
        usize::try_from(value)
            .map_err(|_| Error::Configuration(format!("{} is out of range: {}", key, value)))
    }

    /// Read a millisecond duration
    pub fn get_millis(&self, key: &str, default_ms: u64) -> Result<Duration> {
        self.get_u64(key, default_ms).map(Duration::from_millis)
    }

    /// Read a comma separated list, ignoring blank items
    pub fn get_list(&self, key: &str) -> Vec<String> {
        self.get(key)
            .map(|raw| {
                raw.split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(String::from)
                    .collect()
            })
            .unwrap_or_default()
    }

    /// All entries under `prefix`, with the prefix stripped
    pub fn with_prefix(&self, prefix: &str) -> Configuration {
        self.entries
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .filter(|(k, _)| k.len() > prefix.len())
            .map(|(k, v)| (k[prefix.len()..].to_string(), v.clone()))
            .collect()
    }

    /// Copy every entry of `other` over this configuration
    pub fn overlay(&mut self, other: &Configuration) {
        for (k, v) in other.iter() {
            self.set(k, v);
        }
    }

    /// Short description of the cluster this configuration points at
    pub fn endpoint(&self) -> &str {
        self.get(keys::CLUSTER_ENDPOINT).unwrap_or("<unset>")
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for Configuration {
    fn from_iter<T: IntoIterator<Item = (K, V)>>(iter: T) -> Self {
        Self {
            entries: iter.into_iter().map(|(k, v)| (k.into(), v.into())).collect(),
        }
    }
}

impl<K: Into<String>, V: Into<String>> Extend<(K, V)> for Configuration {
    fn extend<T: IntoIterator<Item = (K, V)>>(&mut self, iter: T) {
        for (k, v) in iter {
            self.entries.insert(k.into(), v.into());
        }
    }
}

fn flatten_into(key: &str, value: &toml::Value, out: &mut BTreeMap<String, String>) {
    match value {
        toml::Value::Table(table) => {
            for (child, value) in table {
                flatten_into(&format!("{}.{}", key, child), value, out);
            }
        }
        toml::Value::Array(items) => {
            let joined = items
                .iter()
                .map(scalar_to_string)
                .collect::<Vec<_>>()
                .join(",");
            out.insert(key.to_string(), joined);
        }
        other => {
            out.insert(key.to_string(), scalar_to_string(other));
        }
    }
}

fn scalar_to_string(value: &toml::Value) -> String {
    match value {
        toml::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Check that a failover cluster name is usable as a key segment
pub fn validate_cluster_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(Error::Configuration("cluster name cannot be empty".into()));
    }
    if name == PRIMARY_NAME {
        return Err(Error::Configuration(format!(
            "'{}' is reserved for the primary cluster",
            PRIMARY_NAME
        )));
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    {
        return Err(Error::Configuration(format!(
            "invalid cluster name '{}': only letters, digits, '-' and '_' are allowed",
            name
        )));
    }
    Ok(())
}

/// Serde helper storing durations as integer milliseconds
mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

/// Timing thresholds governing when an operation gives up on the primary.
///
/// A zero value means "do not wait". Thresholds are read once when the
/// connection is built and never change afterwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailoverThresholds {
    /// How long a read waits for the primary alone
    #[serde(with = "millis")]
    pub accept_primary_result: Duration,
    /// Extra wait after `accept_primary_result` before reads go to the failovers
    #[serde(with = "millis")]
    pub request_failover_read: Duration,
    /// How long a mutation waits for the primary
    #[serde(with = "millis")]
    pub mutate_failover: Duration,
    /// Delay after a primary mutation error before failing over (or retrying)
    #[serde(with = "millis")]
    pub mutate_failover_after_primary_exception: Duration,
    /// Batch counterpart of `accept_primary_result`
    #[serde(with = "millis")]
    pub accept_primary_batch_result: Duration,
    /// Batch counterpart of `request_failover_read`
    #[serde(with = "millis")]
    pub request_failover_batch: Duration,
    /// Batch counterpart of `mutate_failover`
    #[serde(with = "millis")]
    pub mutate_failover_batch: Duration,
    /// How long the primary is skipped after it failed
    #[serde(with = "millis")]
    pub primary_retry_cooldown: Duration,
}

impl Default for FailoverThresholds {
    fn default() -> Self {
        Self {
            accept_primary_result: Duration::from_millis(100),
            request_failover_read: Duration::from_millis(100),
            mutate_failover: Duration::from_millis(100),
            mutate_failover_after_primary_exception: Duration::ZERO,
            accept_primary_batch_result: Duration::from_millis(100),
            request_failover_batch: Duration::from_millis(100),
            mutate_failover_batch: Duration::from_millis(100),
            primary_retry_cooldown: Duration::from_millis(5000),
        }
    }
}

impl FailoverThresholds {
    /// Every threshold set to zero: fail over as soon as anything goes wrong
    pub fn immediate() -> Self {
        Self {
            accept_primary_result: Duration::ZERO,
            request_failover_read: Duration::ZERO,
            mutate_failover: Duration::ZERO,
            mutate_failover_after_primary_exception: Duration::ZERO,
            accept_primary_batch_result: Duration::ZERO,
            request_failover_batch: Duration::ZERO,
            mutate_failover_batch: Duration::ZERO,
            primary_retry_cooldown: Duration::ZERO,
        }
    }

    pub fn from_configuration(config: &Configuration) -> Result<Self> {
        let d = Self::default();
        let ms = |key: &str, default: Duration| config.get_millis(key, default.as_millis() as u64);
        Ok(Self {
            accept_primary_result: ms(keys::ACCEPT_PRIMARY_RESULT_MS, d.accept_primary_result)?,
            request_failover_read: ms(keys::REQUEST_FAILOVER_READ_MS, d.request_failover_read)?,
            mutate_failover: ms(keys::MUTATE_FAILOVER_MS, d.mutate_failover)?,
            mutate_failover_after_primary_exception: ms(
                keys::MUTATE_FAILOVER_AFTER_PRIMARY_EXCEPTION_MS,
                d.mutate_failover_after_primary_exception,
            )?,
            accept_primary_batch_result: ms(
                keys::ACCEPT_PRIMARY_BATCH_RESULT_MS,
                d.accept_primary_batch_result,
            )?,
            request_failover_batch: ms(keys::REQUEST_FAILOVER_BATCH_MS, d.request_failover_batch)?,
            mutate_failover_batch: ms(keys::MUTATE_FAILOVER_BATCH_MS, d.mutate_failover_batch)?,
            primary_retry_cooldown: ms(keys::PRIMARY_RETRY_COOLDOWN_MS, d.primary_retry_cooldown)?,
        })
    }

    /// Write these thresholds back as configuration entries
    pub fn write_to(&self, config: &mut Configuration) {
        let entries = [
            (keys::ACCEPT_PRIMARY_RESULT_MS, self.accept_primary_result),
            (keys::REQUEST_FAILOVER_READ_MS, self.request_failover_read),
            (keys::MUTATE_FAILOVER_MS, self.mutate_failover),
            (
                keys::MUTATE_FAILOVER_AFTER_PRIMARY_EXCEPTION_MS,
                self.mutate_failover_after_primary_exception,
            ),
            (keys::ACCEPT_PRIMARY_BATCH_RESULT_MS, self.accept_primary_batch_result),
            (keys::REQUEST_FAILOVER_BATCH_MS, self.request_failover_batch),
            (keys::MUTATE_FAILOVER_BATCH_MS, self.mutate_failover_batch),
            (keys::PRIMARY_RETRY_COOLDOWN_MS, self.primary_retry_cooldown),
        ];
        for (key, value) in entries {
            config.set(key, value.as_millis());
        }
    }
}

/// Everything a multi-cluster connection reads from its configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailoverSettings {
    /// Failover cluster names, in the order they are consulted
    pub failover_clusters: Vec<String>,
    /// Every cluster accepts writes from this client
    pub master_master: bool,
    /// Skip failover clusters whose connection cannot be built
    pub tolerate_build_failures: bool,
    pub thresholds: FailoverThresholds,
    /// Overall bound on one table operation (zero disables it)
    #[serde(with = "millis")]
    pub operation_timeout: Duration,
    /// Concurrent per-cluster operations allowed per connection
    pub pool_size: usize,
}

impl Default for FailoverSettings {
    fn default() -> Self {
        Self {
            failover_clusters: Vec::new(),
            master_master: false,
            tolerate_build_failures: false,
            thresholds: FailoverThresholds::default(),
            operation_timeout: Duration::from_secs(30),
            pool_size: DEFAULT_POOL_SIZE,
        }
    }
}

impl FailoverSettings {
    pub fn from_configuration(config: &Configuration) -> Result<Self> {
        let defaults = Self::default();
        let settings = Self {
            failover_clusters: config.get_list(keys::FAILOVER_CLUSTERS),
            master_master: config.get_bool(keys::MASTER_MASTER, defaults.master_master)?,
            tolerate_build_failures: config
                .get_bool(keys::TOLERATE_BUILD_FAILURES, defaults.tolerate_build_failures)?,
            thresholds: FailoverThresholds::from_configuration(config)?,
            operation_timeout: config.get_millis(
                keys::OPERATION_TIMEOUT_MS,
                defaults.operation_timeout.as_millis() as u64,
            )?,
            pool_size: config.get_usize(keys::POOL_SIZE, defaults.pool_size)?,
        };
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<()> {
        if self.pool_size == 0 {
            return Err(Error::Configuration(format!(
                "{} must be at least 1",
                keys::POOL_SIZE
            )));
        }
        for (i, name) in self.failover_clusters.iter().enumerate() {
            validate_cluster_name(name)?;
            if self.failover_clusters[..i].contains(name) {
                return Err(Error::Configuration(format!(
                    "failover cluster '{}' is listed twice",
                    name
                )));
            }
        }
        Ok(())
    }

    pub fn is_multi_cluster(&self) -> bool {
        !self.failover_clusters.is_empty()
    }

    pub fn operation_deadline(&self) -> Option<Duration> {
        (!self.operation_timeout.is_zero()).then_some(self.operation_timeout)
    }
}
