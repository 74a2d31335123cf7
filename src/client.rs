//! The native-client seam
//!
//! The framework does not implement the wire protocol. It drives a
//! [`ServerSession`] supplied by a [`SessionFactory`] — in production a thin
//! wrapper over a native MySQL-compatible client, in unit tests a scripted
//! mock. Only the calls the execution pipeline makes are part of the
//! interface; everything else about the client is its own business.
//!
//! The session is not reentrant: all calls for one session must come from a
//! single thread at a time. The connection facade enforces this by running
//! all server I/O either on the caller (sync mode) or on one worker thread
//! (async mode).

use crate::config::Config;
use crate::types::TypeCode;

/// Opaque server-side statement handle
pub type StatementId = u64;

/// An error reported by the server or the native client.
///
/// `errno` is the server's error number, carried verbatim through the
/// framework so callers can match on specific codes.
#[derive(Debug, Clone)]
pub struct SessionError {
    /// Server error number
    pub errno: i64,
    /// Human-readable server message
    pub message: String,
}

impl SessionError {
    /// Create a new session error
    pub fn new(errno: i64, message: impl Into<String>) -> Self {
        Self {
            errno,
            message: message.into(),
        }
    }
}

impl std::fmt::Display for SessionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.message, self.errno)
    }
}

/// Result alias for session calls
pub type SessionResult<T> = std::result::Result<T, SessionError>;

/// Metadata for one result column, reported by `prepare`.
///
/// The type code is carried raw: a code the framework does not decode still
/// binds as a scalar slot and is reported as unsupported only when a row
/// actually delivers it.
#[derive(Debug, Clone)]
pub struct FieldMeta {
    /// Column name
    pub name: String,
    /// Raw wire type code
    pub type_code: i64,
    /// Declared column length
    pub length: usize,
    /// Longest value present in the result, when the server reports it
    pub max_length: usize,
}

/// What `prepare` returns: the statement handle, the number of `?` markers
/// the server found, and result-column metadata (empty for statements that
/// return no result set).
#[derive(Debug, Clone)]
pub struct PreparedInfo {
    /// Server statement handle
    pub statement_id: StatementId,
    /// Number of `?` placeholders the server parsed
    pub marker_count: usize,
    /// Result columns; empty when the statement returns no rows
    pub fields: Vec<FieldMeta>,
}

/// Where a bound parameter's value lives
#[derive(Debug, Clone, PartialEq)]
pub enum BindSource {
    /// A fixed-size slot in the packed parameter buffer
    Packed {
        /// Byte offset into the packed buffer
        offset: usize,
        /// Slot length
        len: usize,
    },
    /// A variable-length value carried out of the settings document
    Text(String),
    /// No storage (NULL variable-length value)
    Empty,
}

/// One parameter bind record. NULL-ness is a side flag: a record can have a
/// packed slot reserved and still bind as NULL.
#[derive(Debug, Clone, PartialEq)]
pub struct ParamBind {
    /// Wire type the value binds as
    pub type_code: TypeCode,
    /// Value location
    pub source: BindSource,
    /// Bind as NULL regardless of slot contents
    pub is_null: bool,
}

/// One result-column bind record describing the column's slots in the packed
/// row buffer.
#[derive(Debug, Clone, PartialEq)]
pub struct ColumnBind {
    /// Raw wire type of the column
    pub type_code: i64,
    /// Byte offset of the value slot; for variable-length columns this is an
    /// 8-byte length slot and the value is fetched separately
    pub offset: usize,
    /// Value slot length
    pub length: usize,
    /// Byte offset of the column's 1-byte null flag
    pub null_offset: usize,
    /// Fetched on demand through the overflow buffer
    pub var_length: bool,
}

/// Outcome of `execute`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecOutcome {
    /// The statement returned no result set; carries the affected-row count
    RowsAffected(u64),
    /// A result set is available for fetching
    ResultSet,
}

/// Outcome of a single `fetch` call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fetch {
    /// A row was written into the row buffer
    Row,
    /// A row was written but one or more variable-length columns were
    /// truncated; their true lengths are in the length slots
    Truncated,
    /// No more rows
    Done,
}

/// A live server session.
///
/// Implementations wrap one native client connection. The framework calls
/// every method from a single thread at a time (see module docs).
pub trait ServerSession: Send {
    /// Prepare a statement and report markers and result metadata
    fn prepare(&mut self, sql: &str) -> SessionResult<PreparedInfo>;

    /// Hand the parameter bind array and packed buffer to the server
    fn bind_params(
        &mut self,
        statement: StatementId,
        binds: &[ParamBind],
        buffer: &[u8],
    ) -> SessionResult<()>;

    /// Execute a prepared statement
    fn execute(&mut self, statement: StatementId) -> SessionResult<ExecOutcome>;

    /// Register the column bind layout rows will be written through
    fn bind_result(&mut self, statement: StatementId, binds: &[ColumnBind]) -> SessionResult<()>;

    /// Fetch the next row into the packed row buffer
    fn fetch(&mut self, statement: StatementId, row: &mut [u8]) -> SessionResult<Fetch>;

    /// Re-fetch one variable-length column of the current row at its true
    /// length into `out`
    fn fetch_column(
        &mut self,
        statement: StatementId,
        column: usize,
        out: &mut [u8],
    ) -> SessionResult<()>;

    /// Release server-side result state for a statement
    fn free_result(&mut self, statement: StatementId);

    /// Close a server statement handle
    fn close_statement(&mut self, statement: StatementId);

    /// Toggle auto-commit on the session
    fn set_auto_commit(&mut self, auto_commit: bool) -> SessionResult<()>;

    /// Commit the open transaction
    fn commit(&mut self) -> SessionResult<()>;

    /// Roll back the open transaction
    fn rollback(&mut self) -> SessionResult<()>;

    /// Close the session; further calls are undefined
    fn close(&mut self) {}
}

impl std::fmt::Debug for dyn ServerSession + '_ {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("dyn ServerSession")
    }
}

/// Opens sessions for connection facades.
///
/// A factory wraps whatever process-wide state the native client needs (the
/// one-time library init/teardown belongs here, not in the core). The thread
/// hooks bracket the worker thread's lifetime for clients that keep
/// per-thread state.
pub trait SessionFactory: Send + Sync {
    /// Open a session for the given connection options
    fn connect(&self, config: &Config) -> SessionResult<Box<dyn ServerSession>>;

    /// Called on the worker thread before any session use
    fn thread_init(&self) {}

    /// Called on the worker thread after the last session use
    fn thread_end(&self) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_error_display() {
        let err = SessionError::new(1452, "a foreign key constraint fails");
        assert_eq!(err.to_string(), "a foreign key constraint fails (1452)");
    }

    #[test]
    fn test_param_bind_null_with_slot() {
        // NULL int still reserves its packed slot; the side flag wins.
        let bind = ParamBind {
            type_code: TypeCode::Long,
            source: BindSource::Packed { offset: 0, len: 8 },
            is_null: true,
        };
        assert!(bind.is_null);
        assert!(matches!(bind.source, BindSource::Packed { len: 8, .. }));
    }
}
