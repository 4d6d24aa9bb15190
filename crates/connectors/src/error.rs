//! Connector error types.
//!
//! Every error carries a transient/terminal classification so callers can
//! decide whether an operation is worth retrying.

use thiserror::Error;

/// Errors that can occur while talking to a data store.
#[derive(Debug, Clone, Error)]
pub enum ConnectorError {
    /// The store could not be reached or dropped the connection.
    #[error("Store unavailable: {0}")]
    Unavailable(String),

    /// The operation did not complete in time.
    #[error("Operation timed out: {0}")]
    Timeout(String),

    /// Lock contention, serialization failure or deadlock.
    #[error("Contention: {0}")]
    Contention(String),

    /// Credentials were rejected or lack permission.
    #[error("Authorization failed: {0}")]
    Unauthorized(String),

    /// Rows do not fit the target's structure.
    #[error("Schema mismatch: {0}")]
    SchemaMismatch(String),

    /// Source data could not be decoded.
    #[error("Malformed data: {0}")]
    MalformedData(String),

    /// Location does not exist.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Capability not offered by this connector.
    #[error("Unsupported operation: {0}")]
    Unsupported(String),

    /// Connection configuration is invalid.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// A write rule could not be evaluated.
    #[error("Rule evaluation failed for column '{column}': {reason}")]
    RuleEvaluation { column: String, reason: String },
}

impl ConnectorError {
    /// Whether retrying the same operation may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ConnectorError::Unavailable(_) | ConnectorError::Timeout(_) | ConnectorError::Contention(_)
        )
    }

    /// Machine-readable error kind.
    pub fn kind(&self) -> &'static str {
        match self {
            ConnectorError::Unavailable(_) => "unavailable",
            ConnectorError::Timeout(_) => "timeout",
            ConnectorError::Contention(_) => "contention",
            ConnectorError::Unauthorized(_) => "unauthorized",
            ConnectorError::SchemaMismatch(_) => "schema_mismatch",
            ConnectorError::MalformedData(_) => "malformed_data",
            ConnectorError::NotFound(_) => "not_found",
            ConnectorError::Unsupported(_) => "unsupported",
            ConnectorError::Configuration(_) => "configuration",
            ConnectorError::RuleEvaluation { .. } => "rule_evaluation",
        }
    }
}

impl From<std::io::Error> for ConnectorError {
    fn from(e: std::io::Error) -> Self {
        use std::io::ErrorKind;
        match e.kind() {
            ErrorKind::NotFound => ConnectorError::NotFound(e.to_string()),
            ErrorKind::PermissionDenied => ConnectorError::Unauthorized(e.to_string()),
            ErrorKind::TimedOut | ErrorKind::WouldBlock => ConnectorError::Timeout(e.to_string()),
            ErrorKind::ConnectionRefused
            | ErrorKind::ConnectionReset
            | ErrorKind::ConnectionAborted
            | ErrorKind::NotConnected
            | ErrorKind::BrokenPipe
            | ErrorKind::Interrupted
            | ErrorKind::UnexpectedEof => ConnectorError::Unavailable(e.to_string()),
            ErrorKind::InvalidData => ConnectorError::MalformedData(e.to_string()),
            ErrorKind::InvalidInput => ConnectorError::Configuration(e.to_string()),
            _ => ConnectorError::Unavailable(e.to_string()),
        }
    }
}

impl From<serde_json::Error> for ConnectorError {
    fn from(e: serde_json::Error) -> Self {
        ConnectorError::MalformedData(e.to_string())
    }
}

impl From<tokio_postgres::Error> for ConnectorError {
    fn from(e: tokio_postgres::Error) -> Self {
        let Some(state) = e.code() else {
            // No SQLSTATE means the failure happened below the protocol.
            return ConnectorError::Unavailable(e.to_string());
        };

        let code = state.code();
        let detail = e.to_string();
        match code {
            "40001" | "40P01" | "55P03" => ConnectorError::Contention(detail),
            "57014" => ConnectorError::Timeout(detail),
            "57P01" | "57P02" | "57P03" | "53300" => ConnectorError::Unavailable(detail),
            "42501" => ConnectorError::Unauthorized(detail),
            "42P01" => ConnectorError::NotFound(detail),
            _ if code.starts_with("08") => ConnectorError::Unavailable(detail),
            _ if code.starts_with("28") => ConnectorError::Unauthorized(detail),
            _ if code.starts_with("42") || code.starts_with("23") => {
                ConnectorError::SchemaMismatch(detail)
            }
            _ if code.starts_with("22") => ConnectorError::MalformedData(detail),
            _ => ConnectorError::SchemaMismatch(detail),
        }
    }
}

impl From<deadpool_postgres::PoolError> for ConnectorError {
    fn from(e: deadpool_postgres::PoolError) -> Self {
        match e {
            deadpool_postgres::PoolError::Backend(inner) => inner.into(),
            deadpool_postgres::PoolError::Timeout(_) => ConnectorError::Timeout(e.to_string()),
            other => ConnectorError::Unavailable(other.to_string()),
        }
    }
}

impl From<object_store::Error> for ConnectorError {
    fn from(e: object_store::Error) -> Self {
        match e {
            object_store::Error::NotFound { .. } => ConnectorError::NotFound(e.to_string()),
            object_store::Error::PermissionDenied { .. }
            | object_store::Error::Unauthenticated { .. } => {
                ConnectorError::Unauthorized(e.to_string())
            }
            object_store::Error::InvalidPath { .. } => ConnectorError::Configuration(e.to_string()),
            object_store::Error::NotSupported { .. } | object_store::Error::NotImplemented => {
                ConnectorError::Unsupported(e.to_string())
            }
            object_store::Error::Precondition { .. }
            | object_store::Error::AlreadyExists { .. } => ConnectorError::Contention(e.to_string()),
            other => ConnectorError::Unavailable(other.to_string()),
        }
    }
}

impl From<suppaftp::FtpError> for ConnectorError {
    fn from(e: suppaftp::FtpError) -> Self {
        match e {
            suppaftp::FtpError::ConnectionError(io) => io.into(),
            suppaftp::FtpError::UnexpectedResponse(ref response) => {
                let code = response.status.code();
                match code {
                    530 | 532 => ConnectorError::Unauthorized(e.to_string()),
                    550 => ConnectorError::NotFound(e.to_string()),
                    400..=499 => ConnectorError::Unavailable(e.to_string()),
                    _ => ConnectorError::MalformedData(e.to_string()),
                }
            }
            other => ConnectorError::Unavailable(other.to_string()),
        }
    }
}

impl From<tokio::task::JoinError> for ConnectorError {
    fn from(e: tokio::task::JoinError) -> Self {
        ConnectorError::Unavailable(format!("Blocking task failed: {}", e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = ConnectorError::NotFound("orders.jsonl".to_string());
        assert_eq!(err.to_string(), "Not found: orders.jsonl");

        let err = ConnectorError::RuleEvaluation {
            column: "updated_at".to_string(),
            reason: "unknown rule".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "Rule evaluation failed for column 'updated_at': unknown rule"
        );
    }

    #[test]
    fn test_transient_classification() {
        assert!(ConnectorError::Timeout("t".into()).is_transient());
        assert!(ConnectorError::Unavailable("reset".into()).is_transient());
        assert!(ConnectorError::Contention("deadlock".into()).is_transient());
        assert!(!ConnectorError::Unauthorized("denied".into()).is_transient());
        assert!(!ConnectorError::SchemaMismatch("col".into()).is_transient());
        assert!(!ConnectorError::MalformedData("json".into()).is_transient());
    }

    #[test]
    fn test_error_from_io() {
        let err: ConnectorError =
            std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset by peer").into();
        assert!(matches!(err, ConnectorError::Unavailable(_)));
        assert!(err.is_transient());

        let err: ConnectorError =
            std::io::Error::new(std::io::ErrorKind::NotFound, "missing").into();
        assert_eq!(err.kind(), "not_found");
        assert!(!err.is_transient());
    }
}
