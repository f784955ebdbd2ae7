//! Speculative execution across clusters
//!
//! An operation starts on the primary. If the primary has not answered when
//! the failover window closes, or it fails, the same operation is issued to
//! every failover cluster and the first success wins. Losing tasks are left
//! to finish on the worker pool; their results are discarded.
//!
//! While the primary is cooling down after a failure the order flips: the
//! failovers race at once and the primary is only consulted if every one of
//! them fails.

use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use futures::stream::{FuturesUnordered, StreamExt};
use futures::FutureExt;
use tandem_core::traits::Table;
use tandem_core::{AggregateFailure, ClusterFailure, Error, Result};
use tokio::time::{sleep_until, Instant};
use tracing::{debug, warn, Instrument};

use crate::health::PrimaryHealth;
use crate::pool::WorkerPool;

/// The operation to run against one cluster's table
pub(crate) type ReplicaOp<T> =
    Arc<dyn Fn(Arc<dyn Table>) -> BoxFuture<'static, Result<T>> + Send + Sync>;

/// One cluster's handle on the table being raced. Index 0 is the primary.
#[derive(Clone)]
pub(crate) struct Replica {
    pub(crate) name: String,
    pub(crate) table: Arc<dyn Table>,
}

/// Shared state every race of one table needs
pub(crate) struct RaceContext<'a> {
    pub(crate) replicas: &'a [Replica],
    pub(crate) pool: &'a WorkerPool,
    pub(crate) health: &'a PrimaryHealth,
    /// Overall bound on the operation
    pub(crate) deadline: Option<Duration>,
    /// Operation name used in aggregate failures
    pub(crate) operation: &'static str,
}

/// Windows of one speculative operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Timing {
    /// The primary runs alone for this long
    pub(crate) accept_primary: Duration,
    /// Added to `accept_primary` before the failovers are started
    pub(crate) request_failover: Duration,
    /// Delay between a primary failure and starting the failovers
    pub(crate) after_primary_error: Duration,
}

/// Windows of a primary-only mutation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct PrimaryTiming {
    /// Bound on each attempt; zero means unbounded
    pub(crate) attempt_deadline: Duration,
    /// Delay before the single retry after a failure
    pub(crate) retry_delay: Duration,
}

/// The winning result of an operation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Served<T> {
    pub value: T,
    /// Name of the cluster that answered
    pub cluster: String,
    pub primary: bool,
}

type InFlight<T> = FuturesUnordered<BoxFuture<'static, (usize, Result<T>)>>;

struct Runner<'a, T> {
    ctx: &'a RaceContext<'a>,
    op: &'a ReplicaOp<T>,
    inflight: InFlight<T>,
    running: Vec<usize>,
    failures: Vec<ClusterFailure>,
}

impl<'a, T: Send + 'static> Runner<'a, T> {
    fn launch(&mut self, idx: usize) {
        let replica = &self.ctx.replicas[idx];
        let task = (self.op)(Arc::clone(&replica.table)).in_current_span();
        match self.ctx.pool.spawn(task) {
            Ok(handle) => {
                self.running.push(idx);
                self.inflight.push(
                    async move {
                        let result = handle.await.unwrap_or_else(|e| {
                            Err(Error::Internal(format!("cluster task failed: {}", e)))
                        });
                        (idx, result)
                    }
                    .boxed(),
                );
            }
            Err(err) => self.failures.push(ClusterFailure::new(&replica.name, err)),
        }
    }

    fn into_failure(self) -> Error {
        AggregateFailure::new(self.ctx.operation, self.failures).into()
    }
}

/// Run `op` speculatively across every replica
pub(crate) async fn race<T>(
    ctx: &RaceContext<'_>,
    timing: Timing,
    op: ReplicaOp<T>,
) -> Result<Served<T>>
where
    T: Send + 'static,
{
    let start = Instant::now();
    let deadline = ctx.deadline.map(|d| start + d);
    let failovers: Vec<usize> = (1..ctx.replicas.len()).collect();

    let (lead, mut backup, mut last_resort) = if ctx.health.in_cooldown() {
        debug!("Primary cooling down, racing {} failover(s) first", failovers.len());
        (failovers, Vec::new(), vec![0])
    } else {
        (vec![0], failovers, Vec::new())
    };

    let mut runner = Runner {
        ctx,
        op: &op,
        inflight: FuturesUnordered::new(),
        running: Vec::new(),
        failures: Vec::new(),
    };
    for idx in lead {
        runner.launch(idx);
    }
    let mut failover_at = if backup.is_empty() {
        None
    } else if runner.inflight.is_empty() {
        // lead could not start
        Some(start + timing.after_primary_error)
    } else {
        Some(start + timing.accept_primary + timing.request_failover)
    };

    loop {
        if runner.inflight.is_empty() && failover_at.is_none() {
            if last_resort.is_empty() {
                break;
            }
            debug!("Every failover failed, trying the primary");
            for idx in last_resort.drain(..) {
                runner.launch(idx);
            }
            continue;
        }

        tokio::select! {
            biased;
            Some((idx, result)) = runner.inflight.next() => {
                runner.running.retain(|&i| i != idx);
                let name = &ctx.replicas[idx].name;
                match result {
                    Ok(value) => {
                        if idx == 0 {
                            ctx.health.record_success();
                        } else {
                            debug!(
                                "{} served by failover {} after {:?}",
                                ctx.operation,
                                name,
                                start.elapsed()
                            );
                        }
                        return Ok(Served {
                            value,
                            cluster: name.clone(),
                            primary: idx == 0,
                        });
                    }
                    Err(err) => {
                        if idx == 0 {
                            ctx.health.record_failure();
                        }
                        warn!("{} failed on {}: {}", ctx.operation, name, err);
                        runner.failures.push(ClusterFailure::new(name, err));
                        if runner.inflight.is_empty() && !backup.is_empty() {
                            let at = Instant::now() + timing.after_primary_error;
                            failover_at = Some(failover_at.map_or(at, |t| t.min(at)));
                        }
                    }
                }
            }
            _ = sleep_until(failover_at.unwrap_or(start)), if failover_at.is_some() => {
                failover_at = None;
                debug!("Requesting {} from {} failover(s)", ctx.operation, backup.len());
                for idx in backup.drain(..) {
                    runner.launch(idx);
                }
            }
            _ = sleep_until(deadline.unwrap_or(start)), if deadline.is_some() => {
                let elapsed = start.elapsed();
                warn!("{} timed out after {:?}", ctx.operation, elapsed);
                for idx in std::mem::take(&mut runner.running) {
                    let cluster = ctx.replicas[idx].name.clone();
                    runner.failures.push(ClusterFailure::new(
                        cluster.clone(),
                        Error::OperationTimeout { cluster, elapsed },
                    ));
                }
                return Err(runner.into_failure());
            }
            else => break,
        }
    }

    Err(runner.into_failure())
}

/// Run `op` on the primary alone, retrying once after a failure.
///
/// An attempt that outlives `attempt_deadline` fails the operation with
/// [`Error::OperationTimeout`] and is not retried. The task itself keeps
/// running on the pool.
pub(crate) async fn mutate_primary<T>(
    ctx: &RaceContext<'_>,
    timing: PrimaryTiming,
    op: ReplicaOp<T>,
) -> Result<Served<T>>
where
    T: Send + 'static,
{
    let start = Instant::now();
    let primary = &ctx.replicas[0];

    let attempts = async {
        match attempt(ctx, timing.attempt_deadline, &op).await {
            Err(err) if !err.is_timeout() => {
                warn!(
                    "{} failed on {}, retrying in {:?}: {}",
                    ctx.operation, primary.name, timing.retry_delay, err
                );
                tokio::time::sleep(timing.retry_delay).await;
                attempt(ctx, timing.attempt_deadline, &op).await
            }
            other => other,
        }
    };

    let value = match ctx.deadline {
        Some(limit) => tokio::time::timeout(limit, attempts)
            .await
            .map_err(|_| Error::OperationTimeout {
                cluster: primary.name.clone(),
                elapsed: start.elapsed(),
            })??,
        None => attempts.await?,
    };
    Ok(Served {
        value,
        cluster: primary.name.clone(),
        primary: true,
    })
}

async fn attempt<T>(ctx: &RaceContext<'_>, limit: Duration, op: &ReplicaOp<T>) -> Result<T>
where
    T: Send + 'static,
{
    let start = Instant::now();
    let primary = &ctx.replicas[0];
    let handle = ctx
        .pool
        .spawn(op(Arc::clone(&primary.table)).in_current_span())?;
    let joined = async {
        handle
            .await
            .unwrap_or_else(|e| Err(Error::Internal(format!("cluster task failed: {}", e))))
    };

    let result = if limit.is_zero() {
        joined.await
    } else {
        tokio::time::timeout(limit, joined)
            .await
            .unwrap_or_else(|_| {
                Err(Error::OperationTimeout {
                    cluster: primary.name.clone(),
                    elapsed: start.elapsed(),
                })
            })
    };
    // a slow primary is not a failed one
    match &result {
        Ok(_) => ctx.health.record_success(),
        Err(err) if !err.is_timeout() => ctx.health.record_failure(),
        Err(_) => {}
    }
    result
}
