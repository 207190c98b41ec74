//! SQL Server flow bridge library.
//!
//! This library connects a flow-programming runtime to SQL Server: a shared
//! connection pool per configured target, and a query node that runs one
//! batch per inbound message and routes results or errors back into the flow.

pub mod config;
pub mod db;
pub mod error;
pub mod models;
pub mod node;
pub mod transport;

pub use config::Config;
pub use db::{PoolManager, QueryExecutor};
pub use error::{BridgeError, BridgeResult};
pub use node::QueryNode;
