//! Database abstraction layer.
//!
//! This module provides database access functionality:
//! - Connection pool management
//! - Query execution with request timeouts and cancellation
//! - The connector seam and its SQL Server implementation
//! - Row and value mappings

pub mod connector;
pub mod executor;
pub mod mssql;
pub mod pool;
pub mod types;

pub use connector::{Connection, Connector};
pub use executor::QueryExecutor;
pub use mssql::{TiberiusConnection, TiberiusConnector};
pub use pool::{PoolManager, PoolStatus, PooledConnection};
pub use types::RowShaping;
