//! Observer chain
//!
//! Observers hook every state transition and the audit events. They run in
//! registration order, and any observer may supersede the proposed target
//! state — that is how the replay observer satisfies a whole execution from
//! a recorded document without a server.
//!
//! Four variants:
//! - **Audit** writes finished executions and commit/rollback markers to an
//!   audit table through its own async connection.
//! - **Capture** records every execution finished inside a program to
//!   `<working_dir>/<observer>.<program>.json`.
//! - **Replay** satisfies executions from a previously captured file,
//!   short-circuiting the server-facing half of the state machine.
//! - **Debug** drops both log thresholds to trace and narrates transitions.

use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::PathBuf;
use std::sync::Arc;

use serde_json::{json, Value as JsonValue};

use crate::config::Config;
use crate::connection::{Connection, Shared};
use crate::error::{Error, Result, FRAMEWORK_ERROR};
use crate::execution::{DocumentMeta, Execution, ExecutionHandle, ExecutionState};
use crate::logging;
use crate::worker::Worker;

/// The observer variants
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObserverKind {
    /// Audit-table writer
    Audit,
    /// Program recorder
    Capture,
    /// Program replayer
    Replay,
    /// Transition narrator
    Debug,
}

/// Audit trail events
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuditEvent {
    /// An execution reached a terminal state
    Execute,
    /// A transaction committed
    Commit,
    /// A transaction rolled back
    Rollback,
}

impl AuditEvent {
    /// Event name as written to the audit table
    pub fn as_str(self) -> &'static str {
        match self {
            AuditEvent::Execute => "EXECUTE",
            AuditEvent::Commit => "COMMIT",
            AuditEvent::Rollback => "ROLLBACK",
        }
    }
}

/// What an observer can see of the connection during a callback
pub struct ObserverContext<'a> {
    shared: &'a Shared,
    worker: Option<&'a Worker>,
    on_worker: bool,
}

impl<'a> ObserverContext<'a> {
    pub(crate) fn new(
        shared: &'a Shared,
        worker: Option<&'a Worker>,
        on_worker: bool,
    ) -> ObserverContext<'a> {
        ObserverContext {
            shared,
            worker,
            on_worker,
        }
    }

    /// Name of the observed connection
    pub fn connection_name(&self) -> &str {
        &self.shared.name
    }

    /// Currently open program, if any
    pub fn current_program(&self) -> Option<String> {
        self.shared.current_program()
    }

    /// Currently open transaction, if any
    pub fn current_transaction(&self) -> Option<String> {
        self.shared.current_transaction()
    }

    /// Serialisation metadata for an execution document recorded with the
    /// given state
    pub fn document_meta(&self, state: ExecutionState) -> DocumentMeta {
        let (user, host) = self.shared.user_and_host();
        DocumentMeta {
            program: self.current_program(),
            transaction: self.current_transaction(),
            user,
            host,
            state,
        }
    }

    /// Report an error through the connection's error pipeline (records it,
    /// logs it, and rolls back any open transaction)
    pub fn report_error(&self, message: &str, errno: i64, handle: ExecutionHandle) -> i64 {
        self.shared
            .report_error(message, errno, handle, self.worker, self.on_worker)
    }
}

/// Hooked at every state transition and audit event, in registration order
pub trait Observer: Send {
    /// Observer name, used for removal and for program file names
    fn name(&self) -> &str;

    /// Which variant this is
    fn kind(&self) -> ObserverKind;

    /// Called for every proposed state transition. Return `new_state` to
    /// accept it, or a different state to supersede it.
    fn on_state(
        &mut self,
        ctx: &ObserverContext,
        execution: &mut Execution,
        new_state: ExecutionState,
    ) -> ExecutionState;

    /// Called for commit/rollback audit events
    fn on_audit(
        &mut self,
        _ctx: &ObserverContext,
        _event: AuditEvent,
        _comment: &str,
        _execution: Option<&Execution>,
    ) {
    }

    /// A program (named scope) opened
    fn start_program(&mut self, _ctx: &ObserverContext, _program: &str) {}

    /// A program closed
    fn end_program(&mut self, _ctx: &ObserverContext, _program: &str) {}
}

/// Construct an observer of the given kind. Replay construction disables
/// transactions on the owning connection; audit construction opens its own
/// connection to the audit database.
pub(crate) fn create_observer(
    name: &str,
    kind: ObserverKind,
    params: Option<&JsonValue>,
    shared: &Arc<Shared>,
) -> Result<Box<dyn Observer>> {
    tracing::trace!(conn = %shared.name, "Creating observer {}", name);
    match kind {
        ObserverKind::Audit => Ok(Box::new(AuditObserver::new(name, params, shared))),
        ObserverKind::Capture => Ok(Box::new(CaptureObserver::new(name, params))),
        ObserverKind::Replay => {
            shared.ctl.lock().transactions_enabled = false;
            Ok(Box::new(ReplayObserver::new(name, params)))
        }
        ObserverKind::Debug => Ok(Box::new(DebugObserver::new(name, params))),
    }
}

/// Name, program scope and working directory shared by the file-backed
/// observers.
struct ObserverBase {
    name: String,
    current_program: String,
    working_directory: PathBuf,
}

impl ObserverBase {
    fn new(name: &str, params: Option<&JsonValue>) -> ObserverBase {
        let working_directory = params
            .and_then(|p| p.get("working_directory"))
            .and_then(JsonValue::as_str)
            .map(PathBuf::from)
            .unwrap_or_else(|| std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")));
        ObserverBase {
            name: name.to_string(),
            current_program: String::new(),
            working_directory,
        }
    }

    /// `<working_dir>/<observer_name>.<program>.json`
    fn program_path(&self) -> PathBuf {
        self.working_directory
            .join(format!("{}.{}.json", self.name, self.current_program))
    }
}

// =============================================================================
// Audit observer
// =============================================================================

/// Writes finished executions and transaction markers to an audit table via
/// a separate async connection. Inert on replay connections: unit tests do
/// not audit.
pub struct AuditObserver {
    base: ObserverBase,
    table_name: String,
    insert_statement: String,
    audit_conn: Option<Connection>,
    is_auditing: bool,
}

impl AuditObserver {
    fn new(name: &str, params: Option<&JsonValue>, shared: &Arc<Shared>) -> AuditObserver {
        let base = ObserverBase::new(name, params);
        let mut observer = AuditObserver {
            base,
            table_name: String::new(),
            insert_statement: "insert_audit_record".to_string(),
            audit_conn: None,
            is_auditing: false,
        };

        if shared.is_replay() {
            return observer;
        }

        let Some(params) = params else {
            tracing::error!(
                conn = %shared.name,
                "audit observer requires database name, table name, and SQL dictionary path for audit db"
            );
            return observer;
        };
        let (database, table_name, sql_path) = match (
            params.get("database").and_then(JsonValue::as_str),
            params.get("table_name").and_then(JsonValue::as_str),
            params.get("sql").and_then(JsonValue::as_str),
        ) {
            (Some(database), Some(table), Some(sql)) => (database, table, sql),
            _ => {
                tracing::error!(
                    conn = %shared.name,
                    "audit observer requires database name, table name, and SQL dictionary path for audit db"
                );
                return observer;
            }
        };
        observer.table_name = table_name.to_string();
        if let Some(insert) = params.get("insert_statement").and_then(JsonValue::as_str) {
            observer.insert_statement = insert.to_string();
        }

        // The audit database is reached with the parent connection's
        // credentials, through a connection of its own so audit writes never
        // interleave with application statements.
        let (config, factory) = {
            let driver = shared.driver.lock();
            let parent = driver.config();
            let config = Config::new(format!("audit_{}", shared.name), database, sql_path)
                .user(parent.user.clone())
                .password(parent.get_password())
                .host(parent.host.clone())
                .port(parent.port)
                .flags(parent.flags)
                .async_mode(true);
            let config = match &parent.socket {
                Some(socket) => config.socket(socket.clone()),
                None => config,
            };
            (config, driver.factory())
        };
        let audit_conn = Connection::create(config, factory);
        observer.audit_conn = Some(audit_conn);
        observer.is_auditing = observer.prepare_to_audit();
        if !observer.is_auditing {
            if let Some(mut conn) = observer.audit_conn.take() {
                conn.close();
            }
        }
        observer
    }

    /// Open the audit connection, check the dictionary carries the insert
    /// statement, and create the audit table if it does not exist.
    fn prepare_to_audit(&mut self) -> bool {
        let Some(conn) = &self.audit_conn else {
            return false;
        };
        if let Err(err) = conn.open() {
            tracing::error!(conn = %conn.name(), "Error connecting to audit database: {}", err);
            return false;
        }
        match conn.statements() {
            Ok(dict) if dict.contains(&self.insert_statement) => {}
            Ok(_) => {
                tracing::error!(
                    conn = %conn.name(),
                    "audit SQL dictionary does not include {} statement",
                    self.insert_statement
                );
                return false;
            }
            Err(err) => {
                tracing::error!(conn = %conn.name(), "{}", err);
                return false;
            }
        }

        conn.execute(
            "create_audit_table",
            &[("table_name", json!(self.table_name))],
        );
        if conn.return_code(0) != 0 {
            tracing::error!(
                conn = %conn.name(),
                "Error creating audit table: {}",
                conn.error_message()
            );
            return false;
        }
        true
    }

    /// Bind the insert statement's parameters by name against the execution
    /// document and insert one audit row. Complex values are serialised to
    /// JSON strings.
    fn insert_record(
        &self,
        ctx: &ObserverContext,
        event: &str,
        execution_doc: Option<&JsonValue>,
        comment: Option<&str>,
    ) {
        let Some(conn) = &self.audit_conn else {
            return;
        };
        let Ok(dict) = conn.statements() else {
            return;
        };
        let Some(def) = dict.statement(&self.insert_statement) else {
            return;
        };

        let mut args = serde_json::Map::new();
        args.insert("event".to_string(), event.into());
        if let Some(comment) = comment {
            args.insert("comment".to_string(), comment.into());
        }

        for param in &def.parameters {
            match param.name.as_str() {
                "event" | "comment" => {}
                "table_name" => {
                    args.insert("table_name".to_string(), self.table_name.clone().into());
                }
                "program" => {
                    if let Some(program) = ctx.current_program() {
                        args.insert("program".to_string(), program.into());
                    }
                }
                "transaction" => {
                    if let Some(transaction) = ctx.current_transaction() {
                        args.insert("transaction".to_string(), transaction.into());
                    }
                }
                name => {
                    let Some(doc) = execution_doc else { continue };
                    let Some(value) = doc.get(name) else { continue };
                    if value.is_object() || value.is_array() {
                        let rendered = serde_json::to_string(value).unwrap_or_default();
                        args.insert(name.to_string(), rendered.into());
                    } else {
                        args.insert(name.to_string(), value.clone());
                    }
                }
            }
        }

        conn.execute_doc(&self.insert_statement, &JsonValue::Object(args));
    }
}

impl Observer for AuditObserver {
    fn name(&self) -> &str {
        &self.base.name
    }

    fn kind(&self) -> ObserverKind {
        ObserverKind::Audit
    }

    fn on_state(
        &mut self,
        ctx: &ObserverContext,
        execution: &mut Execution,
        new_state: ExecutionState,
    ) -> ExecutionState {
        if self.is_auditing && !execution.state().is_terminal() && new_state.is_terminal() {
            let meta = ctx.document_meta(new_state);
            let doc = execution.to_document(&meta);
            self.insert_record(ctx, AuditEvent::Execute.as_str(), Some(&doc), None);
        }
        new_state
    }

    fn on_audit(
        &mut self,
        ctx: &ObserverContext,
        event: AuditEvent,
        comment: &str,
        _execution: Option<&Execution>,
    ) {
        if !self.is_auditing {
            return;
        }
        if matches!(event, AuditEvent::Commit | AuditEvent::Rollback) {
            self.insert_record(ctx, event.as_str(), None, Some(comment));
        }
    }
}

// =============================================================================
// Capture observer
// =============================================================================

/// Records every execution finished inside a program, writing the collected
/// document to the program file when the program ends.
pub struct CaptureObserver {
    base: ObserverBase,
    captured: Vec<JsonValue>,
}

impl CaptureObserver {
    fn new(name: &str, params: Option<&JsonValue>) -> CaptureObserver {
        CaptureObserver {
            base: ObserverBase::new(name, params),
            captured: Vec::new(),
        }
    }
}

impl Observer for CaptureObserver {
    fn name(&self) -> &str {
        &self.base.name
    }

    fn kind(&self) -> ObserverKind {
        ObserverKind::Capture
    }

    fn on_state(
        &mut self,
        ctx: &ObserverContext,
        execution: &mut Execution,
        new_state: ExecutionState,
    ) -> ExecutionState {
        if !self.base.current_program.is_empty()
            && !execution.state().is_terminal()
            && new_state.is_terminal()
        {
            // Recorded with the target state, so replay knows how it ended.
            let meta = ctx.document_meta(new_state);
            self.captured.push(execution.to_document(&meta));
        }
        new_state
    }

    fn start_program(&mut self, _ctx: &ObserverContext, program: &str) {
        self.base.current_program = program.to_string();
        self.captured.clear();
    }

    fn end_program(&mut self, _ctx: &ObserverContext, program: &str) {
        let path = self.base.program_path();
        if self.base.current_program != program {
            tracing::warn!(
                "capture observer {} ending program {} while {} is open",
                self.base.name,
                program,
                self.base.current_program
            );
        }
        if !self.captured.is_empty() {
            let document = json!({ "executions": &self.captured });
            match File::create(&path) {
                Ok(file) => {
                    if let Err(err) = serde_json::to_writer(BufWriter::new(file), &document) {
                        tracing::error!("Unable to write {}: {}", path.display(), err);
                    }
                }
                Err(err) => tracing::error!("Unable to open {}: {}", path.display(), err),
            }
        }
        self.captured.clear();
        self.base.current_program.clear();
    }
}

// =============================================================================
// Replay observer
// =============================================================================

/// Satisfies executions from a captured program file. When a live execution
/// reaches `SqlGenerated`, the recorded execution with the same position is
/// matched by name and text; its outcome is copied into the live execution
/// and the machine jumps straight to the recorded terminal state, skipping
/// the server entirely.
pub struct ReplayObserver {
    base: ObserverBase,
    recorded: Vec<JsonValue>,
    execution_number: usize,
}

impl ReplayObserver {
    fn new(name: &str, params: Option<&JsonValue>) -> ReplayObserver {
        ReplayObserver {
            base: ObserverBase::new(name, params),
            recorded: Vec::new(),
            execution_number: 0,
        }
    }
}

impl Observer for ReplayObserver {
    fn name(&self) -> &str {
        &self.base.name
    }

    fn kind(&self) -> ObserverKind {
        ObserverKind::Replay
    }

    fn on_state(
        &mut self,
        ctx: &ObserverContext,
        execution: &mut Execution,
        new_state: ExecutionState,
    ) -> ExecutionState {
        if execution.state() == ExecutionState::Initial {
            self.execution_number += 1;
        }
        if new_state != ExecutionState::SqlGenerated {
            return new_state;
        }
        if self.recorded.is_empty() {
            return new_state;
        }

        if self.recorded.len() < self.execution_number {
            let err = Error::ReplayOverrun(self.recorded.len());
            execution.error_no = FRAMEWORK_ERROR;
            execution.error_message = err.to_string();
            ctx.report_error(&execution.error_message, FRAMEWORK_ERROR, execution.handle());
            return ExecutionState::Error;
        }

        let recorded = &self.recorded[self.execution_number - 1];
        if let Err(err) = execution.matches_recorded(recorded) {
            execution.error_no = FRAMEWORK_ERROR;
            execution.error_message = err.to_string();
            ctx.report_error(&execution.error_message, FRAMEWORK_ERROR, execution.handle());
            return ExecutionState::Error;
        }

        // The texts match: copy the recorded outcome into the live execution
        // and jump to the state the recorded execution finished in.
        execution.rc = recorded.get("rc").and_then(JsonValue::as_i64).unwrap_or(0);
        if let Some(rows) = recorded.get("rows_returned").and_then(JsonValue::as_i64) {
            execution.row_count = rows;
        }
        if let Some(rows) = recorded.get("rows_affected").and_then(JsonValue::as_i64) {
            execution.rows_affected = rows;
        }
        if let Some(results) = recorded.get("results") {
            execution.results = results.clone();
        }
        if let Some(errno) = recorded.get("error_no").and_then(JsonValue::as_i64) {
            if errno != 0 {
                let message = recorded
                    .get("error_message")
                    .and_then(JsonValue::as_str)
                    .unwrap_or_default()
                    .to_string();
                execution.error_no = errno;
                execution.error_message = message.clone();
                ctx.report_error(&message, errno, execution.handle());
            }
        }

        recorded
            .get("state")
            .and_then(JsonValue::as_i64)
            .and_then(ExecutionState::from_code)
            .unwrap_or(ExecutionState::StatementComplete)
    }

    fn start_program(&mut self, _ctx: &ObserverContext, program: &str) {
        self.base.current_program = program.to_string();
        self.execution_number = 0;
        self.recorded.clear();

        let path = self.base.program_path();
        let file = match File::open(&path) {
            Ok(file) => file,
            Err(err) => {
                tracing::error!("Unable to open {} for reading: {}", path.display(), err);
                return;
            }
        };
        match serde_json::from_reader::<_, JsonValue>(BufReader::new(file)) {
            Ok(document) => {
                if let Some(executions) = document.get("executions").and_then(JsonValue::as_array) {
                    self.recorded = executions.clone();
                }
            }
            Err(err) => tracing::error!("Error parsing {}: {}", path.display(), err),
        }
    }

    fn end_program(&mut self, _ctx: &ObserverContext, _program: &str) {
        self.base.current_program.clear();
    }
}

// =============================================================================
// Debug observer
// =============================================================================

/// Drops both log thresholds to trace for its lifetime and narrates every
/// transition: the statement text at `SqlGenerated`, the settings at
/// `BindingsPrepared`, and the results document at `StatementComplete`.
pub struct DebugObserver {
    base: ObserverBase,
    prior_console_level: logging::LevelFilter,
    prior_file_level: logging::LevelFilter,
}

impl DebugObserver {
    fn new(name: &str, params: Option<&JsonValue>) -> DebugObserver {
        let prior_console_level = logging::console_level();
        let prior_file_level = logging::file_level();
        logging::set_console_level(logging::LevelFilter::TRACE);
        logging::set_file_level(logging::LevelFilter::TRACE);
        DebugObserver {
            base: ObserverBase::new(name, params),
            prior_console_level,
            prior_file_level,
        }
    }
}

impl Observer for DebugObserver {
    fn name(&self) -> &str {
        &self.base.name
    }

    fn kind(&self) -> ObserverKind {
        ObserverKind::Debug
    }

    fn on_state(
        &mut self,
        ctx: &ObserverContext,
        execution: &mut Execution,
        new_state: ExecutionState,
    ) -> ExecutionState {
        tracing::trace!(
            conn = %ctx.connection_name(),
            execution = execution.handle(),
            "{:?} -> {:?}",
            execution.state(),
            new_state
        );
        match new_state {
            ExecutionState::SqlGenerated => {
                tracing::trace!(
                    conn = %ctx.connection_name(),
                    execution = execution.handle(),
                    "  {}",
                    execution.statement_text()
                );
            }
            ExecutionState::BindingsPrepared => {
                let settings = serde_json::to_string(execution.settings()).unwrap_or_default();
                tracing::trace!(
                    conn = %ctx.connection_name(),
                    execution = execution.handle(),
                    "  Ready to bind: {}",
                    settings
                );
            }
            ExecutionState::StatementComplete => {
                if execution.results().is_object() {
                    tracing::trace!(
                        conn = %ctx.connection_name(),
                        execution = execution.handle(),
                        "  {}",
                        execution.results()
                    );
                }
            }
            _ => {}
        }
        new_state
    }
}

impl Drop for DebugObserver {
    fn drop(&mut self) {
        logging::set_console_level(self.prior_console_level);
        logging::set_file_level(self.prior_file_level);
    }
}
