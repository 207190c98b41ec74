//! Data models for the SQL Server flow bridge.
//!
//! This module re-exports all model types used throughout the application.

pub mod message;
pub mod query;
pub mod status;

// Re-export commonly used types
pub use message::FlowMessage;
pub use query::{
    ErrorPolicy, ExecutionRequest, ExecutionResult, RawResult, Recordset, ReturnType, Row,
};
pub use status::{EventSink, NodeEvent, NodeStatus, StatusFill, StatusShape};
