//! Query-related data models.
//!
//! This module defines the per-message execution request and the shapes a
//! query result can take on its way back into the flow.

use crate::error::ErrorRecord;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

/// One result row, keyed by column name.
pub type Row = serde_json::Map<String, JsonValue>;

/// One row-set returned by a statement.
pub type Recordset = Vec<Row>;

/// Which part of the driver result is attached to the output field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReturnType {
    /// Only the first row-set (`returnType = 0`).
    #[default]
    Recordset,
    /// The whole raw result object (`returnType = 1`).
    Raw,
}

impl ReturnType {
    /// Parse the node setting. Anything other than `1`/`raw` selects the row-set.
    pub fn from_setting(raw: Option<&str>) -> Self {
        match raw.map(|v| v.trim().to_ascii_lowercase()).as_deref() {
            Some("1") | Some("raw") => Self::Raw,
            _ => Self::Recordset,
        }
    }
}

/// What to do with a failed execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorPolicy {
    /// Attach the error to the message and keep propagating it.
    #[default]
    SurfaceAsMessageField,
    /// Escalate the error; the message is not sent on the normal output.
    SurfaceAsFatal,
}

impl ErrorPolicy {
    /// Map the `throwErrors` switch onto a policy.
    pub fn from_throw_errors(throw_errors: bool) -> Self {
        if throw_errors {
            Self::SurfaceAsFatal
        } else {
            Self::SurfaceAsMessageField
        }
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::SurfaceAsFatal)
    }
}

/// A single query attempt, built from one inbound message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionRequest {
    pub query: String,
    pub return_type: ReturnType,
    pub out_field: String,
    pub error_policy: ErrorPolicy,
}

impl ExecutionRequest {
    /// Create a request with default shaping and policy.
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            return_type: ReturnType::default(),
            out_field: crate::config::DEFAULT_OUT_FIELD.to_string(),
            error_policy: ErrorPolicy::default(),
        }
    }

    /// Set the return type.
    pub fn with_return_type(mut self, return_type: ReturnType) -> Self {
        self.return_type = return_type;
        self
    }

    /// Set the output field.
    pub fn with_out_field(mut self, out_field: impl Into<String>) -> Self {
        self.out_field = out_field.into();
        self
    }

    /// Set the error policy.
    pub fn with_error_policy(mut self, error_policy: ErrorPolicy) -> Self {
        self.error_policy = error_policy;
        self
    }
}

/// The raw driver result for one batch.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RawResult {
    /// Every row-set the batch produced, in order.
    pub recordsets: Vec<Recordset>,
    /// The first row-set, empty when the batch produced none.
    pub recordset: Recordset,
    /// Output parameters. Ad-hoc batches have none.
    pub output: serde_json::Map<String, JsonValue>,
    /// Row count per statement, as reported by the connection.
    pub rows_affected: Vec<u64>,
}

impl RawResult {
    /// Build a result from row-sets; row counts default to the row-set sizes.
    pub fn new(recordsets: Vec<Recordset>) -> Self {
        let rows_affected = recordsets.iter().map(|rs| rs.len() as u64).collect();
        Self::with_rows_affected(recordsets, rows_affected)
    }

    /// Build a result with explicit per-statement row counts.
    pub fn with_rows_affected(recordsets: Vec<Recordset>, rows_affected: Vec<u64>) -> Self {
        let recordset = recordsets.first().cloned().unwrap_or_default();
        Self {
            recordsets,
            recordset,
            output: serde_json::Map::new(),
            rows_affected,
        }
    }

    /// Shape the result for the output field.
    pub fn shape(self, return_type: ReturnType) -> JsonValue {
        match return_type {
            ReturnType::Recordset => {
                JsonValue::Array(self.recordset.into_iter().map(JsonValue::Object).collect())
            }
            ReturnType::Raw => serde_json::to_value(&self).unwrap_or(JsonValue::Null),
        }
    }
}

/// Outcome of one execution.
#[derive(Debug, Clone, PartialEq)]
pub enum ExecutionResult {
    /// Shaped output destined for the request's output field.
    Success(JsonValue),
    /// Structured error destined for the message's `error` field.
    Failure(ErrorRecord),
}
