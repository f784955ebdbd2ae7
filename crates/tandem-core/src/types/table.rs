//! Table and cluster metadata types

use std::fmt;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::DEFAULT_NAMESPACE;

/// A table name, `namespace:qualifier` or just `qualifier` in the default namespace
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TableName {
    namespace: String,
    qualifier: String,
}

impl TableName {
    /// Parse and validate a table name
    pub fn parse(name: &str) -> Result<Self> {
        let (namespace, qualifier) = match name.split_once(':') {
            Some((ns, q)) => (ns, q),
            None => (DEFAULT_NAMESPACE, name),
        };
        for part in [namespace, qualifier] {
            if part.is_empty() {
                return Err(Error::Configuration(format!("invalid table name '{}'", name)));
            }
            if !part
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'))
            {
                return Err(Error::Configuration(format!(
                    "invalid character in table name '{}'",
                    name
                )));
            }
        }
        Ok(Self {
            namespace: namespace.to_string(),
            qualifier: qualifier.to_string(),
        })
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn qualifier(&self) -> &str {
        &self.qualifier
    }
}

impl fmt::Display for TableName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.namespace == DEFAULT_NAMESPACE {
            f.write_str(&self.qualifier)
        } else {
            write!(f, "{}:{}", self.namespace, self.qualifier)
        }
    }
}

impl std::str::FromStr for TableName {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

/// Schema information for a table
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableDescriptor {
    pub name: TableName,
    pub families: Vec<String>,
}

impl TableDescriptor {
    pub fn new(name: TableName) -> Self {
        Self {
            name,
            families: Vec::new(),
        }
    }

    pub fn with_family(mut self, family: impl Into<String>) -> Self {
        self.families.push(family.into());
        self
    }
}

/// The region of a table that holds a given row
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegionLocation {
    pub table: TableName,
    /// Inclusive start key, empty for the first region
    pub start_key: Bytes,
    /// Exclusive end key, empty for the last region
    pub end_key: Bytes,
    /// Server currently hosting the region
    pub server: String,
}

impl RegionLocation {
    pub fn contains_row(&self, row: &[u8]) -> bool {
        row >= self.start_key.as_ref() && (self.end_key.is_empty() || row < self.end_key.as_ref())
    }
}

/// Cluster-wide status as reported by an admin handle
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ClusterStatus {
    pub cluster_id: String,
    /// Active master server, if one is running
    pub master: Option<String>,
    pub live_servers: Vec<String>,
    pub dead_servers: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_table_name_parse() {
        let plain = TableName::parse("t1").unwrap();
        assert_eq!(plain.namespace(), DEFAULT_NAMESPACE);
        assert_eq!(plain.qualifier(), "t1");
        assert_eq!(plain.to_string(), "t1");

        let scoped: TableName = "analytics:events".parse().unwrap();
        assert_eq!(scoped.namespace(), "analytics");
        assert_eq!(scoped.to_string(), "analytics:events");

        assert!(TableName::parse("").is_err());
        assert!(TableName::parse("ns:").is_err());
        assert!(TableName::parse("bad name").is_err());
    }

    #[test]
    fn test_region_contains_row() {
        let region = RegionLocation {
            table: TableName::parse("t1").unwrap(),
            start_key: Bytes::from_static(b"b"),
            end_key: Bytes::from_static(b"m"),
            server: "rs1".into(),
        };
        assert!(region.contains_row(b"b"));
        assert!(region.contains_row(b"cat"));
        assert!(!region.contains_row(b"a"));
        assert!(!region.contains_row(b"m"));

        let last = RegionLocation {
            end_key: Bytes::new(),
            ..region
        };
        assert!(last.contains_row(b"zzz"));
    }
}
