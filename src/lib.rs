#![warn(missing_docs)]

//! # dictsql
//!
//! A dictionary-driven SQL execution framework for MySQL-compatible
//! databases. Applications name their statements once, in a JSON dictionary,
//! and invoke them through a disciplined, observable pipeline: each
//! invocation runs a state machine that validates the definition,
//! materialises parameter bindings against the binary protocol, talks to the
//! server, and retrieves typed results into a structured document.
//!
//! ## Features
//!
//! - **Statement dictionary** — named, parameterized SQL loaded once per
//!   connection; marker parameters bind through the prepared-statement
//!   protocol, substitute parameters splice into the text.
//! - **Prepared-statement reuse** — repeated invocations of the same text on
//!   one connection skip the server prepare round-trip.
//! - **Sync and async execution** — in async mode one worker thread owns all
//!   server I/O with FIFO ordering and per-request completion wake-ups.
//! - **Transactions with rollback-on-error** — every reported error rolls
//!   back the open transaction automatically.
//! - **Observers** — audit trail, record/replay for server-free unit tests,
//!   and a debug narrator, hooked at every state transition.
//!
//! The wire protocol itself is out of scope: the framework drives a
//! [`ServerSession`] supplied by a [`SessionFactory`] — in production a thin
//! wrapper over a native client, in tests a scripted mock.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use dictsql::{Config, Connection};
//! use serde_json::json;
//! # fn native_factory() -> std::sync::Arc<dyn dictsql::SessionFactory> { unimplemented!() }
//!
//! let config = Config::new("employees", "employees", "sql/employees.json")
//!     .user("hr_app")
//!     .password("secret")
//!     .host("db.internal");
//! let conn = Connection::create(config, native_factory());
//!
//! conn.execute("get_employee_by_emp_no", &[("emp_no", json!(10001))]);
//! if conn.return_code(0) == 0 && conn.row_count(0) == 1 {
//!     let results = conn.results(0).unwrap();
//!     println!("{}", results["rows"][0]["first_name"]);
//! } else {
//!     eprintln!("{}", conn.error_message());
//! }
//! ```
//!
//! ## Record and replay
//!
//! ```rust,no_run
//! use dictsql::{Config, Connection, ObserverKind};
//! # fn native_factory() -> std::sync::Arc<dyn dictsql::SessionFactory> { unimplemented!() }
//! # let conn = Connection::create(Config::new("e", "e", "e.json"), native_factory());
//!
//! // Live run, recording:
//! conn.add_observer("capture", ObserverKind::Capture, None).unwrap();
//! conn.start_program("AddEmployee");
//! // ... execute statements ...
//! conn.end_program("AddEmployee");
//!
//! // Later, in a unit test, the same program runs from the recording —
//! // no server session is ever opened:
//! // conn.add_observer("capture", ObserverKind::Replay, None)
//! ```

pub mod binding;
pub mod client;
pub mod config;
pub mod connection;
pub mod dictionary;
pub mod driver;
pub mod error;
pub mod execution;
pub mod logging;
pub mod observer;
pub mod types;
pub mod worker;

// Re-export commonly used types
pub use client::{
    BindSource, ColumnBind, ExecOutcome, Fetch, FieldMeta, ParamBind, PreparedInfo, ServerSession,
    SessionError, SessionFactory, SessionResult, StatementId,
};
pub use config::Config;
pub use connection::Connection;
pub use dictionary::{ParameterDef, StatementDef, StatementDict};
pub use error::{Error, Result, FRAMEWORK_ERROR};
pub use execution::{DocumentMeta, Execution, ExecutionHandle, ExecutionState, ParamSetting};
pub use observer::{AuditEvent, Observer, ObserverContext, ObserverKind};
pub use types::{DataType, ParamKind, TimeValue, TypeCode, NOT_A_DATE_TIME};

// Re-export serde_json: statement arguments and results are its documents
pub use serde_json;
