//! Per-table request statistics
//!
//! Every multi-cluster table keeps its own counters under a lock and mirrors
//! them to the `metrics` facade, so a process-wide recorder (if one is
//! installed) sees the same numbers.

use std::time::Duration;

use chrono::{DateTime, Utc};
use metrics::{counter, histogram};
use parking_lot::RwLock;

/// Metric names
pub mod names {
    pub const REQUESTS_TOTAL: &str = "tandem_requests_total";
    pub const REQUEST_FAILURES_TOTAL: &str = "tandem_request_failures_total";
    pub const REQUEST_LATENCY_SECONDS: &str = "tandem_request_latency_seconds";
}

/// Table operation types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    Get,
    Exists,
    GetBatch,
    Put,
    Delete,
    MutateBatch,
}

impl Operation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::Get => "get",
            Operation::Exists => "exists",
            Operation::GetBatch => "get_batch",
            Operation::Put => "put",
            Operation::Delete => "delete",
            Operation::MutateBatch => "mutate_batch",
        }
    }

    pub fn is_read(&self) -> bool {
        matches!(self, Operation::Get | Operation::Exists | Operation::GetBatch)
    }

    pub fn is_batch(&self) -> bool {
        matches!(self, Operation::GetBatch | Operation::MutateBatch)
    }
}

/// Snapshot of a table's statistics
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TableStats {
    /// Read operations completed or failed
    pub reads: u64,
    /// Write operations completed or failed
    pub writes: u64,
    /// Operations answered by the primary
    pub served_by_primary: u64,
    /// Operations answered by a failover cluster
    pub served_by_failover: u64,
    /// Operations that failed on every cluster consulted
    pub failures: u64,
    /// Failures caused by a deadline
    pub timeouts: u64,
    /// Sum of operation latencies
    pub total_latency: Duration,
    pub max_latency: Duration,
    /// When a failover cluster last answered
    pub last_failover: Option<DateTime<Utc>>,
}

impl TableStats {
    /// Operations recorded so far
    pub fn operations(&self) -> u64 {
        self.reads + self.writes
    }

    pub fn avg_latency(&self) -> Duration {
        match self.operations() {
            0 => Duration::ZERO,
            n => match u32::try_from(n) {
                Ok(n) => self.total_latency / n,
                Err(_) => self.total_latency.div_f64(n as f64),
            },
        }
    }
}

/// Lock-protected statistics shared by the handles of one table
#[derive(Debug, Default)]
pub(crate) struct StatsRecorder {
    table: String,
    stats: RwLock<TableStats>,
}

impl StatsRecorder {
    pub(crate) fn new(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            stats: RwLock::new(TableStats::default()),
        }
    }

    pub(crate) fn snapshot(&self) -> TableStats {
        self.stats.read().clone()
    }

    /// Record an operation answered by `primary` (true) or a failover
    pub(crate) fn record_served(&self, op: Operation, primary: bool, latency: Duration) {
        {
            let mut stats = self.stats.write();
            stats.count(op, latency);
            if primary {
                stats.served_by_primary += 1;
            } else {
                stats.served_by_failover += 1;
                stats.last_failover = Some(Utc::now());
            }
        }

        counter!(
            names::REQUESTS_TOTAL,
            "table" => self.table.clone(),
            "operation" => op.as_str(),
            "served_by" => if primary { "primary" } else { "failover" }
        )
        .increment(1);
        self.record_latency(op, latency);
    }

    pub(crate) fn record_failure(&self, op: Operation, timed_out: bool, latency: Duration) {
        {
            let mut stats = self.stats.write();
            stats.count(op, latency);
            stats.failures += 1;
            if timed_out {
                stats.timeouts += 1;
            }
        }

        counter!(
            names::REQUEST_FAILURES_TOTAL,
            "table" => self.table.clone(),
            "operation" => op.as_str(),
            "reason" => if timed_out { "timeout" } else { "error" }
        )
        .increment(1);
        self.record_latency(op, latency);
    }

    fn record_latency(&self, op: Operation, latency: Duration) {
        histogram!(
            names::REQUEST_LATENCY_SECONDS,
            "operation" => op.as_str()
        )
        .record(latency.as_secs_f64());
    }
}

impl TableStats {
    fn count(&mut self, op: Operation, latency: Duration) {
        if op.is_read() {
            self.reads += 1;
        } else {
            self.writes += 1;
        }
        self.total_latency += latency;
        self.max_latency = self.max_latency.max(latency);
    }
}
