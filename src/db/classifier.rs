//! Database error classification
//!
//! Maps a driver error to a retry verdict. PostgreSQL reports failures as
//! SQLSTATE codes (https://www.postgresql.org/docs/current/errcodes-appendix.html);
//! the code is decoded once into [`SqlState`] and the verdict is a match on
//! that enumeration.
//!
//! | Condition | Verdict |
//! |-----------|---------|
//! | Class 08 connection exception, socket/pool timeouts | Retriable |
//! | Class 40 transaction rollback (serialization, deadlock) | Retriable |
//! | Class 57 operator intervention (query canceled, shutdown) | Retriable |
//! | Class 22 data exception | NonRetriable |
//! | Class 23 integrity constraint violation | NonRetriable |
//! | Class 42 syntax error or access rule violation | NonRetriable |
//! | Anything else | NonRetriable |

/// Whether a failed storage operation is worth replaying unchanged
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    Retriable,
    NonRetriable,
}

impl ErrorClass {
    /// Classify the outcome of an operation. A success has nothing to retry.
    pub fn of<T, E: Classify>(result: &Result<T, E>) -> Self {
        match result {
            Ok(_) => ErrorClass::NonRetriable,
            Err(e) => e.classify(),
        }
    }

    pub fn is_retriable(&self) -> bool {
        *self == ErrorClass::Retriable
    }
}

/// Errors that know their own retry verdict
pub trait Classify {
    fn classify(&self) -> ErrorClass;
}

/// Known PostgreSQL SQLSTATE codes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SqlState {
    // Class 08
    ConnectionException,
    SqlClientUnableToEstablishConnection,
    ConnectionDoesNotExist,
    SqlServerRejectedConnection,
    ConnectionFailure,
    TransactionResolutionUnknown,
    ProtocolViolation,
    // Class 22
    DataException,
    NullValueNoIndicatorParameter,
    InvalidTextRepresentation,
    NumericValueOutOfRange,
    // Class 23
    IntegrityConstraintViolation,
    RestrictViolation,
    NotNullViolation,
    ForeignKeyViolation,
    UniqueViolation,
    CheckViolation,
    // Class 40
    TransactionRollback,
    SerializationFailure,
    TransactionIntegrityConstraintViolation,
    StatementCompletionUnknown,
    DeadlockDetected,
    // Class 42
    SyntaxError,
    UndefinedTable,
    UndefinedColumn,
    InvalidCursorDefinition,
    InvalidDatabaseDefinition,
    // Class 57
    QueryCanceled,
    AdminShutdown,
    CrashShutdown,
    CannotConnectNow,
    Other,
}

impl SqlState {
    pub fn from_code(code: &str) -> Self {
        match code {
            "08000" => SqlState::ConnectionException,
            "08001" => SqlState::SqlClientUnableToEstablishConnection,
            "08003" => SqlState::ConnectionDoesNotExist,
            "08004" => SqlState::SqlServerRejectedConnection,
            "08006" => SqlState::ConnectionFailure,
            "08007" => SqlState::TransactionResolutionUnknown,
            "08P01" => SqlState::ProtocolViolation,
            "22000" => SqlState::DataException,
            "22002" => SqlState::NullValueNoIndicatorParameter,
            "22P02" => SqlState::InvalidTextRepresentation,
            "22003" => SqlState::NumericValueOutOfRange,
            "23000" => SqlState::IntegrityConstraintViolation,
            "23001" => SqlState::RestrictViolation,
            "23502" => SqlState::NotNullViolation,
            "23503" => SqlState::ForeignKeyViolation,
            "23505" => SqlState::UniqueViolation,
            "23514" => SqlState::CheckViolation,
            "40000" => SqlState::TransactionRollback,
            "40001" => SqlState::SerializationFailure,
            "40002" => SqlState::TransactionIntegrityConstraintViolation,
            "40003" => SqlState::StatementCompletionUnknown,
            "40P01" => SqlState::DeadlockDetected,
            "42601" => SqlState::SyntaxError,
            "42P01" => SqlState::UndefinedTable,
            "42703" => SqlState::UndefinedColumn,
            "42P02" | "42P03" => SqlState::InvalidCursorDefinition,
            "42P04" => SqlState::InvalidDatabaseDefinition,
            "57014" => SqlState::QueryCanceled,
            "57P01" => SqlState::AdminShutdown,
            "57P02" => SqlState::CrashShutdown,
            "57P03" => SqlState::CannotConnectNow,
            _ => SqlState::Other,
        }
    }

    pub fn class(&self) -> ErrorClass {
        use SqlState::*;
        match self {
            ConnectionException
            | SqlClientUnableToEstablishConnection
            | ConnectionDoesNotExist
            | SqlServerRejectedConnection
            | ConnectionFailure
            | TransactionResolutionUnknown
            | ProtocolViolation
            | TransactionRollback
            | SerializationFailure
            | TransactionIntegrityConstraintViolation
            | StatementCompletionUnknown
            | DeadlockDetected
            | QueryCanceled
            | AdminShutdown
            | CrashShutdown
            | CannotConnectNow => ErrorClass::Retriable,
            DataException
            | NullValueNoIndicatorParameter
            | InvalidTextRepresentation
            | NumericValueOutOfRange
            | IntegrityConstraintViolation
            | RestrictViolation
            | NotNullViolation
            | ForeignKeyViolation
            | UniqueViolation
            | CheckViolation
            | SyntaxError
            | UndefinedTable
            | UndefinedColumn
            | InvalidCursorDefinition
            | InvalidDatabaseDefinition
            | Other => ErrorClass::NonRetriable,
        }
    }
}

/// SQLSTATE of a database error, if the driver reported one
pub fn sql_state(err: &sqlx::Error) -> Option<SqlState> {
    match err {
        sqlx::Error::Database(db_err) => db_err.code().map(|code| SqlState::from_code(&code)),
        _ => None,
    }
}

/// Check if an error is a unique constraint violation
pub fn is_unique_violation(err: &sqlx::Error) -> bool {
    sql_state(err) == Some(SqlState::UniqueViolation)
}

impl Classify for sqlx::Error {
    fn classify(&self) -> ErrorClass {
        match self {
            sqlx::Error::Database(_) => sql_state(self)
                .map(|state| state.class())
                .unwrap_or(ErrorClass::NonRetriable),
            // Lost or unreachable connections
            sqlx::Error::Io(_) | sqlx::Error::PoolTimedOut | sqlx::Error::Protocol(_) => {
                ErrorClass::Retriable
            }
            _ => ErrorClass::NonRetriable,
        }
    }
}
