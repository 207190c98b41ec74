//! Query execution engine.
//!
//! Each execution leases one connection, runs one batch under the pool's
//! request timeout and releases the lease on every exit path. Failures are
//! classified into an [`ErrorRecord`] here, once, and status signals are
//! emitted alongside the result.

use crate::db::pool::{PoolManager, run_until};
use crate::error::{BridgeError, BridgeResult, ErrorRecord};
use crate::models::{EventSink, ExecutionRequest, ExecutionResult, NodeStatus, RawResult};
use std::sync::Arc;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Runs execution requests against a pool.
#[derive(Debug, Clone)]
pub struct QueryExecutor {
    events: EventSink,
}

impl QueryExecutor {
    /// Create an executor reporting status on `events`.
    pub fn new(events: EventSink) -> Self {
        Self { events }
    }

    /// Execute one request and shape its result.
    ///
    /// Emits `requesting` before the lease, then `done` or a red `failed`
    /// status carrying the error message.
    pub async fn execute(
        &self,
        pool: &Arc<PoolManager>,
        request: &ExecutionRequest,
    ) -> ExecutionResult {
        self.events.status(NodeStatus::requesting());

        match self.run(pool, &request.query).await {
            Ok(raw) => {
                self.events.status(NodeStatus::done());
                ExecutionResult::Success(raw.shape(request.return_type))
            }
            Err(e) => {
                let record = ErrorRecord::from(&e);
                self.events.status(NodeStatus::failed(record.message.clone()));
                ExecutionResult::Failure(record)
            }
        }
    }

    /// Lease a connection, run `sql` and return the raw driver result.
    pub async fn run(&self, pool: &Arc<PoolManager>, sql: &str) -> BridgeResult<RawResult> {
        let start = Instant::now();
        let mut lease = pool.acquire().await?;

        let request_timeout = pool.config().request_timeout();
        let timeout_ms = request_timeout.map_or(0, |t| t.as_millis() as u64);
        debug!(
            pool_id = %pool.id(),
            sql = %sql,
            timeout_ms = timeout_ms,
            "Executing query"
        );

        let deadline = request_timeout.map(|t| Instant::now() + t);
        let outcome = match run_until(deadline, lease.query(sql)).await {
            Some(Ok(raw)) => Ok(raw),
            Some(Err(e)) => {
                debug!(pool_id = %pool.id(), code = %e.code, error = %e, "Query failed");
                Err(BridgeError::query(e))
            }
            None => {
                warn!(
                    pool_id = %pool.id(),
                    timeout_ms = timeout_ms,
                    "Query timed out, cancelling"
                );
                let cancel_deadline = pool.config().cancel_timeout().map(|t| Instant::now() + t);
                match run_until(cancel_deadline, lease.cancel()).await {
                    Some(Ok(())) => debug!(pool_id = %pool.id(), "Request cancelled"),
                    Some(Err(e)) => {
                        debug!(pool_id = %pool.id(), error = %e, "Cancel failed, discarding connection");
                        lease.mark_broken();
                    }
                    None => {
                        warn!(pool_id = %pool.id(), "Cancel timed out, discarding connection");
                        lease.mark_broken();
                    }
                }
                Err(BridgeError::request_timeout(timeout_ms))
            }
        };

        lease.release();

        debug!(
            pool_id = %pool.id(),
            elapsed_ms = start.elapsed().as_millis() as u64,
            ok = outcome.is_ok(),
            "Query finished"
        );
        outcome
    }
}
