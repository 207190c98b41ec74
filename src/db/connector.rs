//! Driver seam between the pool and a physical database connection.
//!
//! The pool never talks to a wire protocol directly. It asks a [`Connector`]
//! for new connections and hands leased [`Connection`]s to the executor.

use crate::config::PoolConfig;
use crate::error::{DriverError, codes};
use crate::models::RawResult;
use async_trait::async_trait;

/// Opens physical connections for one target.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    /// Open a new connection. The pool bounds the attempt by
    /// [`PoolConfig::connect_timeout`].
    async fn connect(&self, config: &PoolConfig) -> Result<Box<dyn Connection>, DriverError>;
}

/// One physical connection.
#[async_trait]
pub trait Connection: Send + 'static {
    /// Run a batch and collect every row-set it produces.
    async fn query(&mut self, sql: &str) -> Result<RawResult, DriverError>;

    /// Cancel the request that was in flight when its future was dropped.
    ///
    /// `Ok` means the connection is clean and can go back into the pool.
    async fn cancel(&mut self) -> Result<(), DriverError> {
        Err(DriverError::request(
            codes::ECANCEL,
            "Cancellation is not supported by this connection",
        ))
    }

    /// Close the connection gracefully.
    async fn close(self: Box<Self>) -> Result<(), DriverError> {
        Ok(())
    }
}
