//! Transport layer between the flow host and the bridge.
//!
//! This module provides the host-facing transport:
//! - Stdio: newline-delimited JSON messages in, node events out

pub mod stdio;

pub use stdio::StdioTransport;

use crate::error::BridgeResult;
use std::future::Future;

/// Trait for host transport implementations.
///
/// Transports feed inbound flow messages to a node and deliver the node's
/// events back to the host.
pub trait Transport: Send + Sync {
    /// Start the transport and begin handling messages.
    ///
    /// This method should block until the transport is shut down, including
    /// the node teardown.
    fn run(&self) -> impl Future<Output = BridgeResult<()>> + Send;

    /// Get the name of this transport for logging.
    fn name(&self) -> &'static str;
}
