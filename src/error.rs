//! Error types for the execution framework
//!
//! Errors fall into three families: dictionary/caller errors detected before
//! any server I/O, server errors that carry the server's error number
//! verbatim, and result-side errors raised while retrieving rows. The numeric
//! code travels with the failing execution end-to-end, so callers can match
//! on server codes such as `ER_NO_REFERENCED_ROW_2`.

use std::io;
use thiserror::Error;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Error code reported for framework-detected failures (everything that is
/// not a verbatim server error).
pub const FRAMEWORK_ERROR: i64 = 1;

/// Main error type for the execution framework
#[derive(Error, Debug)]
#[allow(missing_docs)]
pub enum Error {
    // =========================================================================
    // Dictionary / caller errors (reported before any server I/O)
    // =========================================================================
    /// The statement dictionary does not contain the requested statement
    #[error("unknown statement '{0}'")]
    UnknownStatement(String),

    /// A supplied argument tag does not match any declared parameter
    #[error("unknown parameter '{tag}' for statement {statement}")]
    UnknownParameter { statement: String, tag: String },

    /// The statement definition has no statement_text member
    #[error("no statement text supplied for statement {0}")]
    MissingStatementText(String),

    /// A parameter definition is missing a required field
    #[error("{field} missing in definition of parameter {parameter} for statement {statement}")]
    MissingParameterField {
        statement: String,
        parameter: String,
        field: &'static str,
    },

    /// A parameter declares a param_type outside marker/substitute
    #[error("unknown parameter type '{value}' in parameter {parameter} for statement {statement}")]
    InvalidParamType {
        statement: String,
        parameter: String,
        value: String,
    },

    /// A parameter declares a datatype the framework does not bind
    #[error("unsupported parameter datatype '{value}' in parameter {parameter} for statement {statement}")]
    UnsupportedDataType {
        statement: String,
        parameter: String,
        value: String,
    },

    /// A supplied value cannot be converted to the declared datatype
    #[error("parameter {parameter} for statement {statement} expects a {expected} value")]
    ParameterValueType {
        statement: String,
        parameter: String,
        expected: &'static str,
    },

    /// Arguments were passed to a statement that declares no parameters
    #[error("arguments passed for statement '{0}' which takes no arguments")]
    UnexpectedArguments(String),

    /// The statement dictionary failed to load or parse
    #[error("statement dictionary corrupt: {0}")]
    CorruptDictionary(String),

    /// The server reported no markers but a marker parameter is declared
    #[error("server found no parameters in statement {statement} but {parameter} is declared as marker")]
    UnexpectedMarker { statement: String, parameter: String },

    /// Declared marker count disagrees with the server's placeholder count
    #[error("server expects {expected} parameters in statement {statement} but {passed} were passed")]
    MarkerCountMismatch {
        statement: String,
        expected: usize,
        passed: usize,
    },

    // =========================================================================
    // Server errors (errno carried verbatim)
    // =========================================================================
    /// Opening the server session failed
    #[error("error connecting to server: {message} ({errno})")]
    ServerConnectFailed { errno: i64, message: String },

    /// The server rejected the prepare call
    #[error("server error preparing statement {statement}: {message} ({errno})")]
    ServerPrepareFailed {
        statement: String,
        errno: i64,
        message: String,
    },

    /// The server rejected the parameter bind
    #[error("server error binding parameters for statement {statement}: {message} ({errno})")]
    ServerBindFailed {
        statement: String,
        errno: i64,
        message: String,
    },

    /// Statement execution failed server-side; context names the operation
    #[error("server error {context}: {message} ({errno})")]
    ServerExecuteFailed {
        context: String,
        errno: i64,
        message: String,
    },

    /// A row or column fetch failed server-side
    #[error("server error {context}: {message} ({errno})")]
    ServerFetchFailed {
        context: String,
        errno: i64,
        message: String,
    },

    // =========================================================================
    // Parameter value errors
    // =========================================================================
    /// A temporal string did not match the expected format
    #[error("parameter '{value}' not in correct format: expect {expected}")]
    DateParseFailed {
        value: String,
        expected: &'static str,
    },

    /// A temporal field fell outside its legal range
    #[error("illegal {field} {actual} in parameter '{value}'")]
    DateFieldOutOfRange {
        field: &'static str,
        actual: u32,
        value: String,
    },

    // =========================================================================
    // Result-side errors
    // =========================================================================
    /// A result column has a type the framework does not decode
    #[error("column {column} has unsupported type {type_code}")]
    UnsupportedColumnType { column: String, type_code: i64 },

    // =========================================================================
    // Assertions and facade contract errors
    // =========================================================================
    /// A row-count assertion failed; message carries the rendered execution
    #[error("{0}")]
    AssertionFailed(String),

    /// Commit was requested with no transaction open
    #[error("commit called with no transaction in progress")]
    NoTransaction,

    /// A transaction was started while another is open
    #[error("attempt to start transaction {new} while {current} in progress")]
    TransactionInProgress { new: String, current: String },

    /// A server operation was requested before the session was opened
    #[error("{0} called with no server connection")]
    NotConnected(&'static str),

    // =========================================================================
    // Replay errors
    // =========================================================================
    /// The replayed program executed more statements than were recorded
    #[error("test executes more statements than expected. Expected {0}")]
    ReplayOverrun(usize),

    /// The live statement name differs from the recorded one
    #[error("statement names don't match: {recorded} NE {live}")]
    ReplayNameMismatch { recorded: String, live: String },

    /// The live statement text differs from the recorded one
    #[error("statement texts don't match for {0}")]
    ReplayTextMismatch(String),

    // =========================================================================
    // I/O
    // =========================================================================
    /// Underlying I/O error (dictionary and capture files)
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl Error {
    /// The numeric code carried on the failing execution. Server errors keep
    /// the server's error number; everything else reports [`FRAMEWORK_ERROR`].
    pub fn code(&self) -> i64 {
        match self {
            Error::ServerConnectFailed { errno, .. }
            | Error::ServerPrepareFailed { errno, .. }
            | Error::ServerBindFailed { errno, .. }
            | Error::ServerExecuteFailed { errno, .. }
            | Error::ServerFetchFailed { errno, .. } => *errno,
            _ => FRAMEWORK_ERROR,
        }
    }

    /// Check if this error originated on the server
    pub fn is_server_error(&self) -> bool {
        matches!(
            self,
            Error::ServerConnectFailed { .. }
                | Error::ServerPrepareFailed { .. }
                | Error::ServerBindFailed { .. }
                | Error::ServerExecuteFailed { .. }
                | Error::ServerFetchFailed { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_server_error_keeps_code() {
        let err = Error::ServerExecuteFailed {
            context: "executing statement assign_employee_to_department".to_string(),
            errno: 1452,
            message: "a foreign key constraint fails".to_string(),
        };
        assert_eq!(err.code(), 1452);
        assert!(err.is_server_error());
        assert!(err.to_string().contains("foreign key constraint fails"));
        assert!(err.to_string().contains("(1452)"));
    }

    #[test]
    fn test_framework_error_code_is_one() {
        let err = Error::UnknownStatement("get_employee".to_string());
        assert_eq!(err.code(), FRAMEWORK_ERROR);
        assert!(!err.is_server_error());
    }

    #[test]
    fn test_assertion_message_passthrough() {
        let err = Error::AssertionFailed(
            "get_dept_by_dept_no(\"xxxx\") returned 0 rows. 1 expected".to_string(),
        );
        assert!(err.to_string().contains("returned 0 rows"));
    }
}
