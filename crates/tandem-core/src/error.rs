//! Error types for Tandem

use std::fmt;
use std::time::Duration;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    // Configuration Errors
    #[error("Invalid configuration: {0}")]
    Configuration(String),

    #[error("Failed to parse configuration: {0}")]
    ConfigParse(#[from] toml::de::Error),

    // Connection Errors
    #[error("Failed to build connection to cluster '{cluster}': {source}")]
    ConnectionBuild {
        cluster: String,
        #[source]
        source: Box<Error>,
    },

    #[error("Failed to acquire table '{table}' on cluster '{cluster}': {source}")]
    TableAcquisition {
        cluster: String,
        table: String,
        #[source]
        source: Box<Error>,
    },

    #[error("Connection is closed")]
    Closed,

    #[error("Connection aborted: {0}")]
    Aborted(String),

    #[error("Failed to close {count} cluster connection(s), last failure on '{cluster}': {source}")]
    CloseFailed {
        count: usize,
        cluster: String,
        #[source]
        source: Box<Error>,
    },

    // Operation Errors
    #[error("Operation on cluster '{cluster}' timed out after {elapsed:?}")]
    OperationTimeout { cluster: String, elapsed: Duration },

    #[error("{0}")]
    AggregateOperationFailure(AggregateFailure),

    #[error("Operation not supported: {0}")]
    Unsupported(String),

    // Table Errors
    #[error("Table not found: {0}")]
    TableNotFound(String),

    #[error("Table is disabled: {0}")]
    TableDisabled(String),

    // Backend Errors
    #[error("Cluster error: {0}")]
    Cluster(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    pub fn code(&self) -> &'static str {
        match self {
            Error::Configuration(_) | Error::ConfigParse(_) => "ConfigurationError",
            Error::ConnectionBuild { .. } => "ConnectionBuildError",
            Error::TableAcquisition { .. } => "TableAcquisitionError",
            Error::Closed => "ConnectionClosed",
            Error::Aborted(_) => "ConnectionAborted",
            Error::CloseFailed { .. } => "CloseFailed",
            Error::OperationTimeout { .. } => "OperationTimeout",
            Error::AggregateOperationFailure(_) => "AggregateOperationFailure",
            Error::Unsupported(_) => "UnsupportedOperationError",
            Error::TableNotFound(_) => "TableNotFound",
            Error::TableDisabled(_) => "TableDisabled",
            Error::Cluster(_) => "ClusterError",
            Error::Io(_) => "IoError",
            Error::Internal(_) => "InternalError",
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Error::OperationTimeout { .. })
    }

    /// Per-cluster failures, when this is an aggregate failure
    pub fn cluster_failures(&self) -> &[ClusterFailure] {
        match self {
            Error::AggregateOperationFailure(aggregate) => &aggregate.failures,
            _ => &[],
        }
    }
}

/// One cluster's contribution to an aggregate failure
#[derive(Debug)]
pub struct ClusterFailure {
    pub cluster: String,
    pub error: Error,
}

impl ClusterFailure {
    pub fn new(cluster: impl Into<String>, error: Error) -> Self {
        Self {
            cluster: cluster.into(),
            error,
        }
    }
}

/// Every cluster consulted for an operation failed or timed out
#[derive(Debug)]
pub struct AggregateFailure {
    pub operation: String,
    pub failures: Vec<ClusterFailure>,
}

impl AggregateFailure {
    pub fn new(operation: impl Into<String>, failures: Vec<ClusterFailure>) -> Self {
        Self {
            operation: operation.into(),
            failures,
        }
    }

    /// Cluster names in the order their failures were observed
    pub fn clusters(&self) -> impl Iterator<Item = &str> {
        self.failures.iter().map(|f| f.cluster.as_str())
    }

    /// First failure recorded for `cluster`
    pub fn failure_for(&self, cluster: &str) -> Option<&Error> {
        self.failures
            .iter()
            .find(|f| f.cluster == cluster)
            .map(|f| &f.error)
    }
}

impl fmt::Display for AggregateFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} failed on every cluster ({} failure(s))",
            self.operation,
            self.failures.len()
        )?;
        for failure in &self.failures {
            write!(f, "; {}: {}", failure.cluster, failure.error)?;
        }
        Ok(())
    }
}

impl std::error::Error for AggregateFailure {}

impl From<AggregateFailure> for Error {
    fn from(aggregate: AggregateFailure) -> Self {
        Error::AggregateOperationFailure(aggregate)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_aggregate_names_every_cluster() {
        let err: Error = AggregateFailure::new(
            "get",
            vec![
                ClusterFailure::new("primary", Error::Cluster("region offline".into())),
                ClusterFailure::new(
                    "dr-east",
                    Error::OperationTimeout {
                        cluster: "dr-east".into(),
                        elapsed: Duration::from_millis(30),
                    },
                ),
            ],
        )
        .into();

        assert_eq!(err.code(), "AggregateOperationFailure");
        let message = err.to_string();
        assert!(message.contains("primary: Cluster error: region offline"));
        assert!(message.contains("dr-east: Operation on cluster 'dr-east' timed out"));

        assert_eq!(err.cluster_failures().len(), 2);
        match &err {
            Error::AggregateOperationFailure(aggregate) => {
                assert_eq!(aggregate.clusters().collect::<Vec<_>>(), ["primary", "dr-east"]);
                assert!(aggregate.failure_for("dr-east").unwrap().is_timeout());
                assert!(aggregate.failure_for("dr-west").is_none());
            }
            other => panic!("unexpected error {:?}", other),
        }
    }

    #[test]
    fn test_error_codes() {
        assert_eq!(
            Error::Unsupported("process_batch".into()).code(),
            "UnsupportedOperationError"
        );
        let build = Error::ConnectionBuild {
            cluster: "dr".into(),
            source: Box::new(Error::Cluster("refused".into())),
        };
        assert_eq!(build.code(), "ConnectionBuildError");
        assert!(build.to_string().contains("'dr'"));
        assert!(Error::Closed.cluster_failures().is_empty());
    }
}
