//! Flow nodes hosted by the bridge.
//!
//! A node turns inbound flow messages into [`NodeEvent`](crate::models::NodeEvent)s:
//! status updates, messages for the normal output and fatal errors.

pub mod query;

pub use query::QueryNode;
