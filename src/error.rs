//! Error types and the temporary/permanent classifier
//!
//! Every failure the sink can surface flows through [`Error`]. The
//! classifier decides whether a failed write transaction is worth retrying
//! from scratch ([`is_temporary`]) or whether the affected sub-batch should
//! be dropped.

use std::error::Error as StdError;

use tokio_postgres::error::SqlState;

/// Result type alias for pgsink operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for pgsink
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Invalid configuration, fatal at startup
    #[error("invalid configuration: {0}")]
    Config(String),
    /// A DDL template failed to render
    #[error("rendering template: {0}")]
    Template(String),
    /// A required table could not be created or brought up to shape
    #[error("resolving schema for table {table}: {reason}")]
    Schema { table: String, reason: String },
    /// Inserting tag rows failed and `foreign_tag_constraint` is set
    #[error("writing to tag table '{table}': {source}")]
    TagInsert {
        table: String,
        #[source]
        source: Box<Error>,
    },
    /// Error reported by the database or the driver
    #[error("{}", describe_db(.0))]
    Db(#[from] tokio_postgres::Error),
    /// Timed out waiting for a connection from the pool
    #[error("timed out waiting for a database connection")]
    PoolTimeout,
    /// The sink is shutting down
    #[error("operation cancelled by shutdown")]
    Cancelled,
}

impl From<bb8::RunError<tokio_postgres::Error>> for Error {
    fn from(err: bb8::RunError<tokio_postgres::Error>) -> Self {
        match err {
            bb8::RunError::User(e) => Error::Db(e),
            bb8::RunError::TimedOut => Error::PoolTimeout,
        }
    }
}

/// Formats a driver error for logs, folding the server-side detail into the
/// message. The driver's `Display` omits `DETAIL`, which is where Postgres
/// puts the information needed to act on constraint and conversion failures.
fn describe_db(err: &tokio_postgres::Error) -> String {
    match err.as_db_error() {
        Some(db) => match db.detail() {
            Some(detail) => format!("{}; {}", db.message(), detail),
            None => db.message().to_string(),
        },
        None => err.to_string(),
    }
}

/// Reports whether `err` is temporary: retrying the enclosing transaction
/// from scratch may succeed.
///
/// The distinction applies to the transaction as a whole, not the individual
/// statement. A `CREATE TABLE` that lost a race with another writer fails
/// permanently as a statement, but a fresh transaction will observe the table
/// in the catalog and skip the create, so `duplicate_table` is temporary.
pub fn is_temporary(err: &Error) -> bool {
    match err {
        Error::Db(e) => temporary_db_error(e),
        Error::PoolTimeout => true,
        // The tag-insert wrapper is only surfaced when the foreign tag
        // constraint is enforced; tags are re-sent with every batch, so the
        // sub-batch is dropped rather than retried.
        Error::TagInsert { .. } => false,
        Error::Config(_) | Error::Template(_) | Error::Schema { .. } | Error::Cancelled => false,
    }
}

fn temporary_db_error(err: &tokio_postgres::Error) -> bool {
    if let Some(db) = err.as_db_error() {
        return temporary_sqlstate(db.code(), db.message());
    }

    // No server response: the connection itself failed. A closed connection
    // or an I/O failure underneath the protocol can heal on reconnect.
    if err.is_closed() {
        return true;
    }
    let mut source = err.source();
    while let Some(cause) = source {
        if cause.downcast_ref::<std::io::Error>().is_some() {
            return true;
        }
        source = cause.source();
    }
    false
}

/// SQLSTATE-level classification.
///
/// See <https://www.postgresql.org/docs/current/errcodes-appendix.html>.
fn temporary_sqlstate(code: &SqlState, message: &str) -> bool {
    match &code.code()[..2] {
        // Integrity Constraint Violation: only the unique violation raised
        // when two sessions race to create the same type (and with it, the
        // same table) is recoverable by retrying.
        "23" => {
            *code == SqlState::UNIQUE_VIOLATION && message.contains("pg_type_typname_nsp_index")
        }
        // Invalid Transaction State: recoverable by starting over.
        "25" => true,
        // Transaction Rollback: deadlocks resolve on retry.
        "40" => *code == SqlState::T_R_DEADLOCK_DETECTED,
        // Syntax Error or Access Rule Violation: almost always permanent,
        // except losing a DDL race with a concurrent writer.
        "42" => *code == SqlState::DUPLICATE_COLUMN || *code == SqlState::DUPLICATE_TABLE,
        // Insufficient Resources.
        "53" => true,
        // Operator Intervention. query_canceled comes back when the driver
        // itself cancels, e.g. on a value it cannot convert, so retrying
        // would fail identically. A dropped database is gone for good.
        "57" => !(*code == SqlState::QUERY_CANCELED || *code == SqlState::DATABASE_DROPPED),
        // Anything else from the server is permanent. Misclassifying here
        // would retry data that can never succeed, and the buffer upstream
        // would fill with good data behind it.
        _ => false,
    }
}
