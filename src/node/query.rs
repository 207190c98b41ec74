//! The query node: one execution per inbound flow message.

use crate::config::NodeConfig;
use crate::db::{PoolManager, QueryExecutor};
use crate::error::{BridgeError, BridgeResult, ErrorRecord};
use crate::models::{
    ErrorPolicy, EventSink, ExecutionRequest, ExecutionResult, FlowMessage, NodeEvent,
    NodeStatus,
};
use std::sync::Arc;
use tracing::{error, info, warn};

/// Runs the configured (or message-supplied) query for every message it
/// handles and emits the outcome as [`NodeEvent`]s.
#[derive(Debug, Clone)]
pub struct QueryNode {
    config: NodeConfig,
    pool: Arc<PoolManager>,
    executor: QueryExecutor,
    events: EventSink,
}

impl QueryNode {
    pub fn new(config: NodeConfig, pool: Arc<PoolManager>, events: EventSink) -> Self {
        Self {
            executor: QueryExecutor::new(events.clone()),
            config,
            pool,
            events,
        }
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    pub fn pool(&self) -> &Arc<PoolManager> {
        &self.pool
    }

    /// Query text for a message: the node's own query, else `msg.query`,
    /// else a string `msg.payload`.
    pub fn resolve_query(&self, msg: &FlowMessage) -> Option<String> {
        self.config
            .query
            .as_deref()
            .or_else(|| msg.query_text())
            .or_else(|| msg.payload_text())
            .map(String::from)
    }

    /// Build the execution request for `query` from the node settings.
    pub fn request(&self, query: impl Into<String>) -> ExecutionRequest {
        ExecutionRequest::new(query)
            .with_return_type(self.config.return_type)
            .with_out_field(self.config.out_field.clone())
            .with_error_policy(self.config.error_policy)
    }

    /// Handle one inbound message.
    pub async fn handle(&self, mut msg: FlowMessage) {
        self.events.status(NodeStatus::clear());
        msg.clear_error();
        let msg_id = msg.ensure_msg_id();

        let Some(query) = self.resolve_query(&msg) else {
            let err = BridgeError::message(
                "No query to execute: configure one on the node or set msg.query or msg.payload",
            );
            self.events.status(NodeStatus::failed(err.to_string()));
            self.fail(msg, &msg_id, self.config.error_policy, ErrorRecord::from(&err));
            return;
        };

        msg.set_query(query.clone());
        let request = self.request(query);

        match self.executor.execute(&self.pool, &request).await {
            ExecutionResult::Success(value) => {
                msg.set(request.out_field.as_str(), value);
                self.events.emit(NodeEvent::Send { msg });
            }
            ExecutionResult::Failure(record) => {
                self.fail(msg, &msg_id, request.error_policy, record)
            }
        }
    }

    fn fail(&self, mut msg: FlowMessage, msg_id: &str, policy: ErrorPolicy, record: ErrorRecord) {
        msg.set_error(&record);

        if policy.is_fatal() {
            error!(
                msg_id = %msg_id,
                code = ?record.code,
                error = %record,
                "Query failed"
            );
            self.events.emit(NodeEvent::Error { error: record, msg });
        } else {
            warn!(
                msg_id = %msg_id,
                code = ?record.code,
                error = %record,
                "Query failed, passing error downstream"
            );
            self.events.emit(NodeEvent::Send { msg });
        }
    }

    /// Teardown: close this node's pool. Other pools are not touched.
    pub async fn close(&self) -> BridgeResult<()> {
        let result = self.pool.shutdown().await;
        info!("Disconnecting {}", self.pool.config().target());
        if let Err(e) = &result {
            warn!(error = %e, "Pool did not close cleanly");
        }
        result
    }
}
