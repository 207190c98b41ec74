//! Error types for the SQL Server flow bridge.
//!
//! This module defines all error types using `thiserror`. Failures are
//! classified once, where they leave the driver, into [`BridgeError`]; the
//! outbound flow message only ever sees the serializable [`ErrorRecord`]
//! projection of it.

use serde::Serialize;
use thiserror::Error;

/// Driver error codes, matching the codes flow authors already switch on.
pub mod codes {
    /// Login failed (bad credentials, unknown database).
    pub const ELOGIN: &str = "ELOGIN";
    /// Connect, acquire or request deadline passed.
    pub const ETIMEOUT: &str = "ETIMEOUT";
    /// Socket-level failure talking to the server.
    pub const ESOCKET: &str = "ESOCKET";
    /// The pool or connection was already closed.
    pub const ECONNCLOSED: &str = "ECONNCLOSED";
    /// The server rejected the request.
    pub const EREQUEST: &str = "EREQUEST";
    /// The request was cancelled.
    pub const ECANCEL: &str = "ECANCEL";
    /// Invalid input handed to the driver.
    pub const EINVALID: &str = "EINVALID";
    /// A `FOR JSON` result could not be parsed.
    pub const EJSON: &str = "EJSON";
}

/// Structured error reported by the driver or by the server.
///
/// Server-side errors carry the full SQL Server diagnostic: error number,
/// severity class, state, and the source location of the failing statement.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct DriverError {
    /// Error family, `RequestError` or `ConnectionError`.
    pub name: String,
    /// One of [`codes`].
    pub code: String,
    pub message: String,
    /// SQL Server error number (e.g. 208 for an invalid object name).
    pub number: Option<u32>,
    /// Severity class.
    pub class: Option<u8>,
    pub state: Option<u8>,
    pub line_number: Option<u32>,
    pub proc_name: Option<String>,
    pub server_name: Option<String>,
}

impl DriverError {
    /// Create an error raised while running a request.
    pub fn request(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: "RequestError".to_string(),
            code: code.into(),
            message: message.into(),
            ..Self::default()
        }
    }

    /// Create an error raised while opening or holding a connection.
    pub fn connection(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: "ConnectionError".to_string(),
            code: code.into(),
            message: message.into(),
            ..Self::default()
        }
    }

    /// Attach the server error number.
    pub fn with_number(mut self, number: u32) -> Self {
        self.number = Some(number);
        self
    }

    /// Attach the server state byte.
    pub fn with_state(mut self, state: u8) -> Self {
        self.state = Some(state);
        self
    }

    /// Attach the source location reported by the server.
    pub fn with_location(
        mut self,
        line_number: u32,
        proc_name: Option<String>,
        server_name: Option<String>,
    ) -> Self {
        self.line_number = Some(line_number);
        self.proc_name = proc_name;
        self.server_name = server_name;
        self
    }

    /// True when the physical connection can no longer be trusted after this
    /// error and must not go back into the pool.
    pub fn breaks_connection(&self) -> bool {
        matches!(self.code.as_str(), codes::ESOCKET | codes::ECONNCLOSED)
    }
}

impl std::fmt::Display for DriverError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.message)
    }
}

impl std::error::Error for DriverError {}

/// Why a connection could not be leased from the pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionReason {
    /// No connection became available before the connect timeout.
    Timeout,
    /// The pool has been shut down.
    Closed,
    /// The driver failed to open a physical connection.
    Connect,
}

#[derive(Error, Debug)]
pub enum BridgeError {
    #[error("Configuration error: {message}")]
    Config { message: String },

    #[error("{error}")]
    Connection {
        reason: ConnectionReason,
        error: DriverError,
    },

    #[error("{0}")]
    Query(DriverError),

    #[error("Shutdown error: {message}")]
    Shutdown { message: String, failures: usize },

    /// A failure that only has text, no driver diagnostics.
    #[error("{0}")]
    Message(String),

    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl BridgeError {
    /// Create a configuration error.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Create an acquire-timeout error.
    pub fn connection_timeout(waited_ms: u64) -> Self {
        Self::Connection {
            reason: ConnectionReason::Timeout,
            error: DriverError::connection(
                codes::ETIMEOUT,
                format!("Failed to acquire a connection in {}ms", waited_ms),
            ),
        }
    }

    /// Create an error for acquiring from a pool that was shut down.
    pub fn pool_closed() -> Self {
        Self::Connection {
            reason: ConnectionReason::Closed,
            error: DriverError::connection(codes::ECONNCLOSED, "Connection pool is closed"),
        }
    }

    /// Wrap a driver failure raised while opening a connection.
    pub fn connect_failed(error: DriverError) -> Self {
        Self::Connection {
            reason: ConnectionReason::Connect,
            error,
        }
    }

    /// Wrap a driver failure raised while running a query.
    pub fn query(error: DriverError) -> Self {
        Self::Query(error)
    }

    /// Create a request-timeout error.
    pub fn request_timeout(timeout_ms: u64) -> Self {
        Self::Query(DriverError::request(
            codes::ETIMEOUT,
            format!("Timeout: Request failed to complete in {}ms", timeout_ms),
        ))
    }

    /// Create a shutdown error.
    pub fn shutdown(message: impl Into<String>, failures: usize) -> Self {
        Self::Shutdown {
            message: message.into(),
            failures,
        }
    }

    /// Create a plain text failure.
    pub fn message(text: impl Into<String>) -> Self {
        Self::Message(text.into())
    }

    /// Create an internal error (host I/O and the like).
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Error category used in outbound error records.
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::Config { .. } => ErrorCategory::Config,
            Self::Connection { .. } => ErrorCategory::Connection,
            Self::Query(_) => ErrorCategory::Query,
            Self::Shutdown { .. } => ErrorCategory::Shutdown,
            Self::Message(_) => ErrorCategory::Message,
            Self::Internal { .. } => ErrorCategory::Internal,
        }
    }

    /// Driver diagnostics, when the failure came from the driver.
    pub fn driver_error(&self) -> Option<&DriverError> {
        match self {
            Self::Connection { error, .. } => Some(error),
            Self::Query(error) => Some(error),
            _ => None,
        }
    }

    /// Check if this error is a timeout of any kind.
    pub fn is_timeout(&self) -> bool {
        self.driver_error()
            .is_some_and(|e| e.code == codes::ETIMEOUT)
    }
}

/// Convert tiberius errors raised during a request.
impl From<tiberius::error::Error> for DriverError {
    fn from(err: tiberius::error::Error) -> Self {
        use tiberius::error::Error as TdsError;

        match err {
            TdsError::Server(token) => {
                let proc_name = Some(token.procedure().to_string()).filter(|s| !s.is_empty());
                let server_name = Some(token.server().to_string()).filter(|s| !s.is_empty());
                let mut error = DriverError::request(codes::EREQUEST, token.message())
                    .with_number(token.code())
                    .with_state(token.state())
                    .with_location(token.line(), proc_name, server_name);
                error.class = Some(token.class());
                error
            }
            TdsError::Io { message, .. } => DriverError::connection(codes::ESOCKET, message),
            TdsError::Tls(message) => DriverError::connection(codes::ESOCKET, message),
            TdsError::Routing { host, port } => DriverError::connection(
                codes::ESOCKET,
                format!("Server requested routing to {}:{}", host, port),
            ),
            other => DriverError::request(codes::EREQUEST, other.to_string()),
        }
    }
}

/// Result type alias for bridge operations.
pub type BridgeResult<T> = Result<T, BridgeError>;

/// Category of an outbound error record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorCategory {
    Config,
    Connection,
    Query,
    Shutdown,
    /// Plain text failure without driver diagnostics.
    Message,
    Internal,
}

/// The `error` field attached to an outbound message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorRecord {
    pub category: ErrorCategory,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub number: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub class: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub line_number: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub proc_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub server_name: Option<String>,
}

impl ErrorRecord {
    /// Render the record as a JSON value for the message's `error` field.
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or_else(|_| serde_json::json!({
            "category": "message",
            "message": self.message,
        }))
    }
}

impl std::fmt::Display for ErrorRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.message)
    }
}

impl From<&BridgeError> for ErrorRecord {
    fn from(err: &BridgeError) -> Self {
        let category = err.category();
        match err.driver_error() {
            Some(driver) => Self {
                category,
                code: Some(driver.code.clone()),
                message: driver.message.clone(),
                name: Some(driver.name.clone()).filter(|n| !n.is_empty()),
                number: driver.number,
                class: driver.class,
                state: driver.state,
                line_number: driver.line_number,
                proc_name: driver.proc_name.clone(),
                server_name: driver.server_name.clone(),
            },
            None => Self {
                category,
                code: None,
                message: match err {
                    BridgeError::Message(text) => text.clone(),
                    other => other.to_string(),
                },
                name: None,
                number: None,
                class: None,
                state: None,
                line_number: None,
                proc_name: None,
                server_name: None,
            },
        }
    }
}
