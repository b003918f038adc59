//! Error types for the tracker store.
//!
//! All errors are propagated via [`StoreError`]. Library errors that mean
//! "the storage cannot be reached" are folded into
//! [`StoreError::Connection`] on conversion, so callers can tell an outage
//! apart from every other failure without inspecting driver types.

use sqlx::error::{DatabaseError, ErrorKind};

/// Errors that can occur in a tracker store.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The backend does not implement a required operation.
    #[error("{store} does not implement `{operation}`")]
    NotImplemented {
        /// Name of the backend.
        store: &'static str,
        /// Name of the missing operation.
        operation: &'static str,
    },

    /// The underlying storage cannot be reached.
    #[error("connection failure: {message}")]
    Connection {
        /// Description of the connectivity failure.
        message: String,
    },

    /// The configured `PostgreSQL` schema does not exist.
    #[error(
        "Requested PostgreSQL schema '{schema}' was not found in the database. To continue, \
         please create the schema by running 'CREATE SCHEMA {schema};' or unset the \
         'POSTGRESQL_SCHEMA' environment variable in order to use the default schema. \
         Exiting application."
    )]
    SchemaMissing {
        /// Name of the missing schema.
        schema: String,
    },

    /// A SQL operation failed.
    #[error("database error: {0}")]
    Database(sqlx::Error),

    /// A Redis operation failed.
    #[error("Redis error: {0}")]
    Redis(fred::error::Error),

    /// A serialization or deserialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A tracker stored in the legacy binary format could not be decoded.
    #[error("legacy tracker decode error: {message}")]
    LegacyDecode {
        /// Description of the decode failure.
        message: String,
    },

    /// A configuration error.
    #[error("configuration error: {message}")]
    Config {
        /// Description of the configuration problem.
        message: String,
    },

    /// Publishing to the event broker failed.
    #[error("event broker error: {message}")]
    Broker {
        /// Description of the broker failure.
        message: String,
    },
}

impl StoreError {
    /// Create a [`StoreError::Config`] from any message.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Create a [`StoreError::Connection`] from any message.
    pub fn connection(message: impl Into<String>) -> Self {
        Self::Connection {
            message: message.into(),
        }
    }

    /// Whether the error must terminate the process rather than degrade.
    pub const fn is_fatal(&self) -> bool {
        matches!(self, Self::SchemaMissing { .. })
    }

    /// Whether retrying the same operation later may succeed.
    ///
    /// Covers connectivity failures and integrity violations raised while a
    /// concurrent instance is bootstrapping the same database.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Connection { .. } => true,
            Self::Database(error) => is_integrity_violation(error),
            _ => false,
        }
    }

    /// Whether the error is a connectivity failure.
    pub const fn is_connection(&self) -> bool {
        matches!(self, Self::Connection { .. })
    }
}

/// SQLSTATE codes the server answers with while it cannot take sessions:
/// admin or crash shutdown, still starting up, and too many connections.
const UNAVAILABLE_SQLSTATES: [&str; 4] = ["57P01", "57P02", "57P03", "53300"];

impl From<sqlx::Error> for StoreError {
    fn from(error: sqlx::Error) -> Self {
        let unreachable = match &error {
            sqlx::Error::Io(_)
            | sqlx::Error::Tls(_)
            | sqlx::Error::PoolTimedOut
            | sqlx::Error::PoolClosed
            | sqlx::Error::WorkerCrashed => true,
            sqlx::Error::Database(db) => is_server_unavailable(&**db),
            _ => false,
        };
        if unreachable {
            Self::Connection {
                message: error.to_string(),
            }
        } else {
            Self::Database(error)
        }
    }
}

impl From<fred::error::Error> for StoreError {
    fn from(error: fred::error::Error) -> Self {
        use fred::error::ErrorKind as RedisKind;

        match error.kind() {
            RedisKind::IO | RedisKind::Timeout | RedisKind::Canceled => Self::Connection {
                message: error.to_string(),
            },
            _ => Self::Redis(error),
        }
    }
}

/// Whether the server rejected the session because it is not serving.
///
/// Covers SQLSTATE class `08` (connection exception) and
/// [`UNAVAILABLE_SQLSTATES`].
fn is_server_unavailable(db: &dyn DatabaseError) -> bool {
    db.code().is_some_and(|code| {
        code.starts_with("08") || UNAVAILABLE_SQLSTATES.contains(&code.as_ref())
    })
}

/// Whether a SQL error is a constraint violation.
pub fn is_integrity_violation(error: &sqlx::Error) -> bool {
    error.as_database_error().is_some_and(|db| {
        matches!(
            db.kind(),
            ErrorKind::UniqueViolation
                | ErrorKind::ForeignKeyViolation
                | ErrorKind::NotNullViolation
                | ErrorKind::CheckViolation
        )
    })
}

/// Whether a SQL error is a unique-key conflict.
pub fn is_unique_violation(error: &sqlx::Error) -> bool {
    error
        .as_database_error()
        .is_some_and(|db| matches!(db.kind(), ErrorKind::UniqueViolation))
}

#[cfg(test)]
mod tests {
    use std::borrow::Cow;
    use std::fmt;

    use super::*;

    /// A server error carrying only a SQLSTATE code.
    #[derive(Debug)]
    struct ServerError(&'static str);

    impl fmt::Display for ServerError {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "server error {}", self.0)
        }
    }

    impl std::error::Error for ServerError {}

    impl DatabaseError for ServerError {
        fn message(&self) -> &str {
            "server error"
        }

        fn code(&self) -> Option<Cow<'_, str>> {
            Some(Cow::Borrowed(self.0))
        }

        fn as_error(&self) -> &(dyn std::error::Error + Send + Sync + 'static) {
            self
        }

        fn as_error_mut(&mut self) -> &mut (dyn std::error::Error + Send + Sync + 'static) {
            self
        }

        fn into_error(self: Box<Self>) -> Box<dyn std::error::Error + Send + Sync + 'static> {
            self
        }

        fn kind(&self) -> ErrorKind {
            ErrorKind::Other
        }
    }

    fn server_error(code: &'static str) -> StoreError {
        StoreError::from(sqlx::Error::Database(Box::new(ServerError(code))))
    }

    #[test]
    fn server_not_serving_is_connection_failure() {
        for code in ["57P03", "57P01", "53300", "08006", "08001"] {
            let error = server_error(code);
            assert!(error.is_connection(), "{code} should be a connection failure");
            assert!(error.is_transient());
        }
    }

    #[test]
    fn other_server_errors_stay_database_errors() {
        let error = server_error("42P01");
        assert!(matches!(error, StoreError::Database(_)));
        assert!(!error.is_transient());
    }

    #[test]
    fn redis_io_error_is_connection_failure() {
        let error = StoreError::from(fred::error::Error::new(
            fred::error::ErrorKind::IO,
            "connection reset",
        ));
        assert!(error.is_connection());

        let error = StoreError::from(fred::error::Error::new(
            fred::error::ErrorKind::Parse,
            "bad reply",
        ));
        assert!(matches!(error, StoreError::Redis(_)));
    }

    #[test]
    fn pool_timeout_is_connection_failure() {
        let error = StoreError::from(sqlx::Error::PoolTimedOut);
        assert!(error.is_connection());
        assert!(error.is_transient());
        assert!(!error.is_fatal());
    }

    #[test]
    fn row_not_found_is_not_transient() {
        let error = StoreError::from(sqlx::Error::RowNotFound);
        assert!(matches!(error, StoreError::Database(_)));
        assert!(!error.is_transient());
    }

    #[test]
    fn schema_missing_is_fatal_with_remediation() {
        let error = StoreError::SchemaMissing {
            schema: "tenant".to_owned(),
        };
        assert!(error.is_fatal());
        let message = error.to_string();
        assert!(message.contains("'tenant'"));
        assert!(message.contains("POSTGRESQL_SCHEMA"));
    }

    #[test]
    fn not_implemented_names_the_operation() {
        let error = StoreError::NotImplemented {
            store: "CustomStore",
            operation: "keys",
        };
        assert_eq!(error.to_string(), "CustomStore does not implement `keys`");
    }
}
