//! Statement execution state machine
//!
//! An [`Execution`] encapsulates one invocation of a named statement. It is a
//! linear state machine with a single side-exit to [`ExecutionState::Error`]:
//!
//! ```text
//! Initial          (validate_statement)       -> StatementValid
//! StatementValid   (create_settings)          -> SettingsCreated
//! SettingsCreated  (generate_text)            -> SqlGenerated
//! SqlGenerated     (create_server_statement)  -> ServerStmtCreated   (first server contact)
//! ServerStmtCreated(prepare_to_bind)          -> BindingsPrepared
//! BindingsPrepared (bind_parameters)          -> StatementPrepared
//! StatementPrepared(execute_statement)        -> ExecutionComplete | StatementComplete
//! ExecutionComplete(retrieve_results)         -> StatementComplete
//! ```
//!
//! The machine is cranked to an optional explicit exit state; the connection
//! uses this to run the client-local prepare side on the caller and hand the
//! server-facing tail to the worker in async mode. Server contact is lazy:
//! nothing touches the session before `SqlGenerated`, which is what lets the
//! replay observer short-circuit a whole execution from a recorded document.

use std::fmt;
use std::sync::atomic::{AtomicI32, Ordering};

use bytes::BytesMut;
use chrono::NaiveDateTime;
use indexmap::IndexMap;
use regex::Regex;
use serde::Serialize;
use serde_json::{json, Value as JsonValue};

use crate::binding;
use crate::client::{ColumnBind, FieldMeta, ParamBind, StatementId};
use crate::connection::Shared;
use crate::dictionary::StatementDef;
use crate::error::{Error, Result};
use crate::observer::ObserverContext;
use crate::types::{DataType, ParamKind, TimeValue, TypeCode, NOT_A_DATE_TIME};
use crate::worker::Worker;

/// Identifies one execution within its connection; process-unique
pub type ExecutionHandle = i32;

static NEXT_HANDLE: AtomicI32 = AtomicI32::new(1);

/// States of the execution state machine. The numeric codes are stable: they
/// appear in captured program files and audit records.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i64)]
pub enum ExecutionState {
    /// Freshly constructed, nothing validated
    Initial = 1,
    /// The dictionary contains the statement
    StatementValid = 2,
    /// Parameter definitions merged with caller values
    SettingsCreated = 3,
    /// SQL text generated, substitutions applied
    SqlGenerated = 4,
    /// Server statement handle obtained (prepared or reused)
    ServerStmtCreated = 5,
    /// Parameter and column buffers allocated
    BindingsPrepared = 6,
    /// Parameter binds handed to the server
    StatementPrepared = 7,
    /// Statement executed, result set pending
    ExecutionComplete = 8,
    /// Result rows retrieved
    ResultsRetrieved = 9,
    /// Terminal: execution finished
    StatementComplete = 10,
    /// Terminal: execution failed
    Error = 11,
}

impl ExecutionState {
    /// Numeric code as it appears in serialised documents
    pub fn code(self) -> i64 {
        self as i64
    }

    /// Decode a serialised state code
    pub fn from_code(code: i64) -> Option<ExecutionState> {
        match code {
            1 => Some(ExecutionState::Initial),
            2 => Some(ExecutionState::StatementValid),
            3 => Some(ExecutionState::SettingsCreated),
            4 => Some(ExecutionState::SqlGenerated),
            5 => Some(ExecutionState::ServerStmtCreated),
            6 => Some(ExecutionState::BindingsPrepared),
            7 => Some(ExecutionState::StatementPrepared),
            8 => Some(ExecutionState::ExecutionComplete),
            9 => Some(ExecutionState::ResultsRetrieved),
            10 => Some(ExecutionState::StatementComplete),
            11 => Some(ExecutionState::Error),
            _ => None,
        }
    }

    /// Terminal states end the execution
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ExecutionState::StatementComplete | ExecutionState::Error
        )
    }
}

/// One merged parameter setting: declaration plus the caller's value
#[derive(Debug, Clone, Serialize)]
pub struct ParamSetting {
    /// Marker or substitute
    #[serde(rename = "param_type")]
    pub kind: ParamKind,
    /// Declared datatype
    pub data_type: DataType,
    /// Caller-supplied value; absent binds as NULL
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<JsonValue>,
}

/// Caller-supplied argument values
#[derive(Debug, Clone)]
pub(crate) enum ArgSource {
    /// Ordered (tag, value) pairs
    Pairs(Vec<(String, JsonValue)>),
    /// A name -> value document; entries are consumed in document order
    Doc(JsonValue),
}

impl ArgSource {
    fn is_empty(&self) -> bool {
        match self {
            ArgSource::Pairs(pairs) => pairs.is_empty(),
            ArgSource::Doc(doc) => doc.as_object().map_or(true, |o| o.is_empty()),
        }
    }

    fn into_pairs(self) -> Vec<(String, JsonValue)> {
        match self {
            ArgSource::Pairs(pairs) => pairs,
            ArgSource::Doc(doc) => match doc {
                JsonValue::Object(map) => map.into_iter().collect(),
                _ => Vec::new(),
            },
        }
    }
}

/// The server statement handle together with what prepare reported. Moved
/// wholesale between executions on reuse.
#[derive(Debug, Clone)]
pub(crate) struct ServerStatement {
    pub id: StatementId,
    pub marker_count: usize,
    pub fields: Vec<FieldMeta>,
}

/// Everything the state machine needs from its surroundings
pub(crate) struct ExecContext<'a> {
    pub shared: &'a Shared,
    /// The connection's worker, when cranking on the caller of an async
    /// connection (used as the rollback-on-error barrier)
    pub worker: Option<&'a Worker>,
    /// True when cranking on the worker thread; rollback-on-error must not
    /// flush through the worker from the worker itself
    pub on_worker: bool,
}

/// Metadata merged into a serialised execution document
#[derive(Debug, Clone)]
pub struct DocumentMeta {
    /// Current program, if one is open
    pub program: Option<String>,
    /// Current transaction, if one is open
    pub transaction: Option<String>,
    /// Connection user
    pub user: String,
    /// Connection host
    pub host: String,
    /// State to record (capture records the target state of a transition)
    pub state: ExecutionState,
}

/// A single in-flight (or completed) invocation of one named statement
pub struct Execution {
    pub(crate) handle: ExecutionHandle,
    pub(crate) request_sequence: i64,
    pub(crate) statement_name: String,
    pub(crate) comment: String,
    pub(crate) args: Option<ArgSource>,
    pub(crate) statement_text: String,
    pub(crate) is_auto_commit: bool,
    pub(crate) transaction: String,
    pub(crate) statement_dirty: bool,
    pub(crate) state: ExecutionState,
    pub(crate) rc: i64,
    pub(crate) error_no: i64,
    pub(crate) error_message: String,

    pub(crate) settings: IndexMap<String, ParamSetting>,
    pub(crate) server_stmt: Option<ServerStatement>,
    pub(crate) param_binds: Vec<ParamBind>,
    pub(crate) param_buffer: BytesMut,

    pub(crate) column_binds: Vec<ColumnBind>,
    pub(crate) row_buffer: Vec<u8>,
    pub(crate) overflow: Vec<u8>,
    pub(crate) overflow_needed: usize,
    pub(crate) results_pending: bool,

    pub(crate) results: JsonValue,
    pub(crate) row_count: i64,
    pub(crate) rows_affected: i64,

    pub(crate) start_time: Option<NaiveDateTime>,
    pub(crate) execute_time: Option<NaiveDateTime>,
    pub(crate) retrieve_time: Option<NaiveDateTime>,
    pub(crate) complete_time: Option<NaiveDateTime>,
}

fn now() -> NaiveDateTime {
    chrono::Local::now().naive_local()
}

fn format_time(time: Option<NaiveDateTime>) -> String {
    match time {
        Some(t) => t.format("%Y-%m-%dT%H:%M:%S%.6f").to_string(),
        None => NOT_A_DATE_TIME.to_string(),
    }
}

impl Execution {
    pub(crate) fn new(
        statement_name: &str,
        comment: &str,
        args: ArgSource,
        is_auto_commit: bool,
        transaction: String,
    ) -> Execution {
        Execution {
            handle: NEXT_HANDLE.fetch_add(1, Ordering::Relaxed),
            request_sequence: 0,
            statement_name: statement_name.to_string(),
            comment: comment.to_string(),
            args: Some(args),
            statement_text: String::new(),
            is_auto_commit,
            transaction,
            statement_dirty: false,
            state: ExecutionState::Initial,
            rc: -1,
            error_no: 0,
            error_message: String::new(),
            settings: IndexMap::new(),
            server_stmt: None,
            param_binds: Vec::new(),
            param_buffer: BytesMut::new(),
            column_binds: Vec::new(),
            row_buffer: Vec::new(),
            overflow: Vec::new(),
            overflow_needed: 0,
            results_pending: false,
            results: JsonValue::Null,
            row_count: 0,
            rows_affected: 0,
            start_time: None,
            execute_time: None,
            retrieve_time: None,
            complete_time: None,
        }
    }

    // =========================================================================
    // Public read accessors (observers see executions through these)
    // =========================================================================

    /// Process-unique execution handle
    pub fn handle(&self) -> ExecutionHandle {
        self.handle
    }

    /// Worker request sequence; 0 in sync mode
    pub fn request_sequence(&self) -> i64 {
        self.request_sequence
    }

    /// Record the worker request sequence assigned at enqueue time
    pub(crate) fn set_request_sequence(&mut self, sequence: i64) {
        self.request_sequence = sequence;
    }

    /// Current state
    pub fn state(&self) -> ExecutionState {
        self.state
    }

    /// Statement name from the dictionary
    pub fn statement_name(&self) -> &str {
        &self.statement_name
    }

    /// Generated SQL text, after substitution
    pub fn statement_text(&self) -> &str {
        &self.statement_text
    }

    /// Return code: 0 on success, the error number on failure
    pub fn return_code(&self) -> i64 {
        self.rc
    }

    /// Error number, 0 when none
    pub fn error_no(&self) -> i64 {
        self.error_no
    }

    /// Error message, empty when none
    pub fn error_message(&self) -> &str {
        &self.error_message
    }

    /// Rows returned by the result set
    pub fn row_count(&self) -> i64 {
        self.row_count
    }

    /// Rows affected by a statement with no result set
    pub fn rows_affected(&self) -> i64 {
        self.rows_affected
    }

    /// The retrieved results document
    pub fn results(&self) -> &JsonValue {
        &self.results
    }

    /// Merged parameter settings, in declaration order
    pub fn settings(&self) -> &IndexMap<String, ParamSetting> {
        &self.settings
    }

    // =========================================================================
    // Crank loop
    // =========================================================================

    /// Run the state machine up to the point where the server is needed:
    /// validate the statement, build the settings, generate the SQL text.
    pub(crate) fn prepare_side(&mut self, ctx: &ExecContext) -> i64 {
        self.state = ExecutionState::Initial;
        self.row_count = 0;
        self.rows_affected = 0;
        self.start_time = Some(now());
        self.crank(ctx, Some(ExecutionState::SqlGenerated))
    }

    /// Run the server-facing tail to completion and release result state,
    /// keeping the statement handle for reuse.
    pub(crate) fn run_server_side(&mut self, ctx: &ExecContext) -> i64 {
        let rc = self.crank(ctx, None);
        self.finish(ctx, true);
        rc
    }

    /// Advance the machine until a terminal state, an error, or the explicit
    /// exit state. Returns 0 or the error number, which is also recorded as
    /// the execution's return code.
    pub(crate) fn crank(&mut self, ctx: &ExecContext, exit: Option<ExecutionState>) -> i64 {
        let mut rc = 0;
        loop {
            if exit == Some(self.state) {
                break;
            }
            let result = match self.state {
                ExecutionState::Initial => self.validate_statement(ctx),
                ExecutionState::StatementValid => self.create_settings(ctx),
                ExecutionState::SettingsCreated => self.generate_text(ctx),
                ExecutionState::SqlGenerated => self.create_server_statement(ctx),
                ExecutionState::ServerStmtCreated => self.prepare_to_bind(ctx),
                ExecutionState::BindingsPrepared => self.bind_parameters(ctx),
                ExecutionState::StatementPrepared => self.execute_statement(ctx),
                ExecutionState::ExecutionComplete => self.retrieve_results(ctx),
                ExecutionState::ResultsRetrieved
                | ExecutionState::StatementComplete
                | ExecutionState::Error => break,
            };
            match result {
                // An observer may have injected a recorded error while
                // diverting the transition; surface it here.
                Ok(()) => {
                    if self.error_no != 0 {
                        rc = self.error_no;
                        break;
                    }
                }
                Err(err) => {
                    rc = self.fail(ctx, err);
                    break;
                }
            }
        }
        self.rc = rc;
        rc
    }

    /// Transition to a new state, giving each observer (in registration
    /// order) the chance to supersede the target. This is the sole mutator
    /// of the state field.
    pub(crate) fn change_state(&mut self, ctx: &ExecContext, new_state: ExecutionState) {
        if new_state.is_terminal() {
            self.complete_time = Some(now());
        }
        let mut effective = new_state;
        {
            let mut observers = ctx.shared.observers.lock();
            let octx = ObserverContext::new(ctx.shared, ctx.worker, ctx.on_worker);
            for observer in observers.iter_mut() {
                let proposed = observer.on_state(&octx, self, new_state);
                if proposed != new_state {
                    effective = proposed;
                }
            }
        }
        if effective.is_terminal() && self.complete_time.is_none() {
            self.complete_time = Some(now());
        }
        self.state = effective;
    }

    /// Record the error on this execution, transition to the error state and
    /// pass the error up to the connection. Returns the error number.
    pub(crate) fn fail(&mut self, ctx: &ExecContext, err: Error) -> i64 {
        let code = err.code();
        self.error_no = code;
        self.error_message = err.to_string();
        self.change_state(ctx, ExecutionState::Error);
        ctx.shared.report_error(
            &self.error_message,
            code,
            self.handle,
            ctx.worker,
            ctx.on_worker,
        );
        code
    }

    // =========================================================================
    // State functions
    // =========================================================================

    /// Initial -> StatementValid: the dictionary must contain the statement.
    fn validate_statement(&mut self, ctx: &ExecContext) -> Result<()> {
        tracing::trace!(
            conn = %ctx.shared.name,
            execution = self.handle,
            "Executing {}",
            self.statement_name
        );
        let dict = ctx.shared.statements()?;
        if !dict.contains(&self.statement_name) {
            return Err(Error::UnknownStatement(self.statement_name.clone()));
        }
        self.change_state(ctx, ExecutionState::StatementValid);
        Ok(())
    }

    /// StatementValid -> SettingsCreated: merge the parameter declarations
    /// with the caller's values, consuming values in declaration order.
    fn create_settings(&mut self, ctx: &ExecContext) -> Result<()> {
        let dict = ctx.shared.statements()?;
        let def = self.statement_def(&dict)?;
        let parameters = def.parameters.clone();
        let args = self.args.take();

        if parameters.is_empty() {
            if args.as_ref().is_some_and(|a| !a.is_empty()) {
                return Err(Error::UnexpectedArguments(self.statement_name.clone()));
            }
            self.change_state(ctx, ExecutionState::SettingsCreated);
            return Ok(());
        }

        self.settings = IndexMap::with_capacity(parameters.len());
        for param in &parameters {
            let kind = param.kind(&self.statement_name)?;
            let data_type = param.datatype(&self.statement_name)?;
            self.settings.insert(
                param.name.clone(),
                ParamSetting {
                    kind,
                    data_type,
                    value: None,
                },
            );
        }

        // Values may be omitted from the tail; omitted parameters bind NULL.
        let supplied = args.map(ArgSource::into_pairs).unwrap_or_default();
        let limit = self.settings.len();
        for (tag, value) in supplied.into_iter().take(limit) {
            let data_type = match self.settings.get(&tag) {
                Some(setting) => setting.data_type,
                None => {
                    return Err(Error::UnknownParameter {
                        statement: self.statement_name.clone(),
                        tag,
                    })
                }
            };
            let converted = self.convert_value(&tag, data_type, value)?;
            if let Some(setting) = self.settings.get_mut(&tag) {
                setting.value = Some(converted);
            }
        }

        self.change_state(ctx, ExecutionState::SettingsCreated);
        Ok(())
    }

    /// Convert one caller value to the declared datatype. Temporal strings
    /// are validated here, before any server contact.
    fn convert_value(&self, tag: &str, data_type: DataType, value: JsonValue) -> Result<JsonValue> {
        let wrong_type = |expected: &'static str| Error::ParameterValueType {
            statement: self.statement_name.clone(),
            parameter: tag.to_string(),
            expected,
        };
        match data_type {
            DataType::Int => value
                .as_i64()
                .map(JsonValue::from)
                .ok_or_else(|| wrong_type("int")),
            DataType::Double => value
                .as_f64()
                .map(JsonValue::from)
                .ok_or_else(|| wrong_type("double")),
            DataType::String => value
                .as_str()
                .map(JsonValue::from)
                .ok_or_else(|| wrong_type("string")),
            DataType::Date | DataType::Time | DataType::Datetime | DataType::Timestamp => {
                let text = value.as_str().ok_or_else(|| wrong_type("time string"))?;
                TimeValue::parse(text, data_type)?;
                Ok(JsonValue::from(text))
            }
        }
    }

    /// SettingsCreated -> SqlGenerated: concatenate the statement text and
    /// splice substitute parameter values in place of their `@name` tokens.
    fn generate_text(&mut self, ctx: &ExecContext) -> Result<()> {
        let dict = ctx.shared.statements()?;
        let def = self.statement_def(&dict)?;
        let mut text = def.text(&self.statement_name)?;

        for (name, setting) in &self.settings {
            if setting.kind != ParamKind::Substitute {
                continue;
            }
            if let Some(value) = &setting.value {
                let rendered = value
                    .as_str()
                    .map(str::to_string)
                    .unwrap_or_else(|| value.to_string());
                let pattern = Regex::new(&format!("@{}", regex::escape(name)))
                    .expect("substitution pattern");
                text = pattern
                    .replace_all(&text, regex::NoExpand(&rendered))
                    .into_owned();
            }
        }

        self.statement_text = text;
        tracing::info!(
            conn = %ctx.shared.name,
            execution = self.handle,
            "Preparing to execute {}",
            self
        );
        self.change_state(ctx, ExecutionState::SqlGenerated);
        Ok(())
    }

    /// SqlGenerated -> ServerStmtCreated: first server contact. Reuse a live
    /// prior statement when one matches, otherwise prepare on the server and
    /// cross-check the marker count.
    fn create_server_statement(&mut self, ctx: &ExecContext) -> Result<()> {
        // Opening the session lazily keeps unit tests server-free: a replay
        // observer has already diverted the machine before this state runs.
        {
            let mut driver = ctx.shared.driver.lock();
            driver.session()?;
        }

        if let Some(prior) = ctx.shared.find_live_prior_execution(self) {
            {
                let mut prior = prior.inner.lock();
                self.take_server_statement_from(&mut prior);
                tracing::trace!(
                    conn = %ctx.shared.name,
                    execution = self.handle,
                    "reusing {}",
                    prior.handle
                );
            }
            self.change_state(ctx, ExecutionState::ServerStmtCreated);
            return Ok(());
        }

        let info = {
            let mut driver = ctx.shared.driver.lock();
            let session = driver.session()?;
            session
                .prepare(&self.statement_text)
                .map_err(|e| Error::ServerPrepareFailed {
                    statement: self.statement_name.clone(),
                    errno: e.errno,
                    message: e.message,
                })?
        };

        let declared = self
            .settings
            .values()
            .filter(|s| s.kind == ParamKind::Marker)
            .count();

        // The server's placeholder count and the dictionary's MARKER
        // declarations must agree, in both directions.
        if info.marker_count == 0 && declared > 0 {
            let first_marker = self
                .settings
                .iter()
                .find(|(_, s)| s.kind == ParamKind::Marker)
                .map(|(name, _)| name.clone())
                .unwrap_or_default();
            return Err(Error::UnexpectedMarker {
                statement: self.statement_name.clone(),
                parameter: first_marker,
            });
        }
        if info.marker_count > 0 && declared != info.marker_count {
            return Err(Error::MarkerCountMismatch {
                statement: self.statement_name.clone(),
                expected: info.marker_count,
                passed: declared,
            });
        }

        self.server_stmt = Some(ServerStatement {
            id: info.statement_id,
            marker_count: info.marker_count,
            fields: info.fields,
        });
        self.change_state(ctx, ExecutionState::ServerStmtCreated);
        Ok(())
    }

    /// ServerStmtCreated -> BindingsPrepared: two-pass allocation of the
    /// packed parameter buffer and, when the statement returns rows, the
    /// packed row buffer.
    fn prepare_to_bind(&mut self, ctx: &ExecContext) -> Result<()> {
        let (marker_count, fields) = match &self.server_stmt {
            Some(stmt) => (stmt.marker_count, stmt.fields.clone()),
            None => (0, Vec::new()),
        };

        if marker_count > 0 {
            let built = binding::build_param_binds(&self.settings)?;
            self.param_binds = built.binds;
            self.param_buffer = built.buffer;
        }

        if !fields.is_empty() {
            let layout = binding::build_column_binds(&fields);
            self.column_binds = layout.binds;
            self.row_buffer = vec![0; layout.row_len];
            self.overflow_needed = layout.overflow_len;
        }

        self.change_state(ctx, ExecutionState::BindingsPrepared);
        Ok(())
    }

    /// BindingsPrepared -> StatementPrepared: hand the bind array to the
    /// server.
    fn bind_parameters(&mut self, ctx: &ExecContext) -> Result<()> {
        if let Some(stmt) = &self.server_stmt {
            if stmt.marker_count > 0 {
                let mut driver = ctx.shared.driver.lock();
                let session = driver.session()?;
                session
                    .bind_params(stmt.id, &self.param_binds, &self.param_buffer)
                    .map_err(|e| Error::ServerBindFailed {
                        statement: self.statement_name.clone(),
                        errno: e.errno,
                        message: e.message,
                    })?;
            }
        }
        self.change_state(ctx, ExecutionState::StatementPrepared);
        Ok(())
    }

    /// StatementPrepared -> ExecutionComplete, or straight to
    /// StatementComplete when the statement returns no result set.
    fn execute_statement(&mut self, ctx: &ExecContext) -> Result<()> {
        self.execute_time = Some(now());
        let stmt_id = match &self.server_stmt {
            Some(stmt) => stmt.id,
            None => return Err(Error::NotConnected("execute")),
        };
        let outcome = {
            let mut driver = ctx.shared.driver.lock();
            let session = driver.session()?;
            session
                .execute(stmt_id)
                .map_err(|e| Error::ServerExecuteFailed {
                    context: format!("executing statement {}", self.statement_name),
                    errno: e.errno,
                    message: e.message,
                })?
        };
        self.rows_affected = 0;
        match outcome {
            crate::client::ExecOutcome::RowsAffected(n) => {
                self.rows_affected = n as i64;
                self.change_state(ctx, ExecutionState::StatementComplete);
            }
            crate::client::ExecOutcome::ResultSet => {
                self.results_pending = true;
                self.change_state(ctx, ExecutionState::ExecutionComplete);
            }
        }
        Ok(())
    }

    /// ExecutionComplete -> StatementComplete: fetch rows one at a time into
    /// the results document. Variable-length columns are refetched into the
    /// overflow buffer at their reported length.
    fn retrieve_results(&mut self, ctx: &ExecContext) -> Result<()> {
        self.retrieve_time = Some(now());
        let stmt_id = match &self.server_stmt {
            Some(stmt) => stmt.id,
            None => return Err(Error::NotConnected("retrieve")),
        };

        {
            let mut driver = ctx.shared.driver.lock();
            let session = driver.session()?;
            session
                .bind_result(stmt_id, &self.column_binds)
                .map_err(|e| Error::ServerFetchFailed {
                    context: format!("binding results of statement {}", self.statement_name),
                    errno: e.errno,
                    message: e.message,
                })?;
        }

        if self.overflow_needed > self.overflow.len() {
            self.overflow = vec![0; self.overflow_needed];
        }

        let mut columns = serde_json::Map::new();
        if let Some(stmt) = &self.server_stmt {
            for field in &stmt.fields {
                columns.insert(field.name.clone(), JsonValue::from(field.type_code));
            }
        }
        self.results = json!({ "columns": columns, "rows": [] });

        self.row_count = 0;
        loop {
            let fetched = {
                let mut driver = ctx.shared.driver.lock();
                let session = driver.session()?;
                session
                    .fetch(stmt_id, &mut self.row_buffer)
                    .map_err(|e| Error::ServerFetchFailed {
                        context: format!("fetching row for statement {}", self.statement_name),
                        errno: e.errno,
                        message: e.message,
                    })?
            };
            match fetched {
                crate::client::Fetch::Row | crate::client::Fetch::Truncated => {
                    self.store_result_row(ctx)?;
                    self.row_count += 1;
                }
                crate::client::Fetch::Done => break,
            }
        }

        self.change_state(ctx, ExecutionState::StatementComplete);
        Ok(())
    }

    /// Decode the current row buffer into the results document.
    fn store_result_row(&mut self, ctx: &ExecContext) -> Result<()> {
        let stmt = match &self.server_stmt {
            Some(stmt) => stmt,
            None => return Err(Error::NotConnected("fetch")),
        };
        let stmt_id = stmt.id;
        let mut row = serde_json::Map::new();

        for (icol, bind) in self.column_binds.iter().enumerate() {
            let field = &stmt.fields[icol];
            let reader = binding::RowReader::new(&self.row_buffer);
            if reader.is_null(bind) {
                row.insert(field.name.clone(), JsonValue::Null);
                continue;
            }
            let type_code = TypeCode::from_code(bind.type_code).ok_or_else(|| {
                Error::UnsupportedColumnType {
                    column: field.name.clone(),
                    type_code: bind.type_code,
                }
            })?;
            let value = match type_code {
                TypeCode::Long | TypeCode::LongLong => JsonValue::from(reader.i64_at(bind)),
                TypeCode::Double => JsonValue::from(reader.f64_at(bind)),
                TypeCode::String | TypeCode::VarString | TypeCode::Enum => {
                    let actual_len = reader.var_len_at(bind);
                    if actual_len > self.overflow.len() {
                        self.overflow = vec![0; actual_len];
                    }
                    {
                        let mut driver = ctx.shared.driver.lock();
                        let session = driver.session()?;
                        session
                            .fetch_column(stmt_id, icol, &mut self.overflow[..actual_len])
                            .map_err(|e| Error::ServerFetchFailed {
                                context: format!(
                                    "fetching string column {} in statement {}",
                                    field.name, self.statement_name
                                ),
                                errno: e.errno,
                                message: e.message,
                            })?;
                    }
                    JsonValue::from(String::from_utf8_lossy(&self.overflow[..actual_len]).into_owned())
                }
                TypeCode::Date | TypeCode::Time | TypeCode::Datetime | TypeCode::Timestamp => {
                    reader.time_at(bind).to_document(type_code)
                }
            };
            row.insert(field.name.clone(), value);
        }

        if let Some(rows) = self.results.get_mut("rows").and_then(JsonValue::as_array_mut) {
            rows.push(JsonValue::Object(row));
        }
        Ok(())
    }

    fn statement_def<'d>(&self, dict: &'d crate::dictionary::StatementDict) -> Result<&'d StatementDef> {
        dict.statement(&self.statement_name)
            .ok_or_else(|| Error::UnknownStatement(self.statement_name.clone()))
    }

    // =========================================================================
    // Reuse
    // =========================================================================

    /// Whether a prior execution's prepared statement can serve this one:
    /// same statement, identical generated text, and the same auto-commit
    /// snapshot. The server caches constraint-deferral decisions per the
    /// auto-commit setting seen at prepare time, so a preparation from
    /// outside a transaction must not be reused inside one.
    pub(crate) fn is_same_statement_as(&self, other: &Execution) -> bool {
        other.statement_name == self.statement_name
            && other.statement_text == self.statement_text
            && other.is_auto_commit == self.is_auto_commit
    }

    /// Move the server statement handle and parameter bind array from a
    /// prior execution; the prior loses them and becomes non-reusable. The
    /// packed parameter buffer is not moved: string parameter lengths may
    /// differ between invocations.
    pub(crate) fn take_server_statement_from(&mut self, prior: &mut Execution) {
        self.server_stmt = prior.server_stmt.take();
        self.param_binds = std::mem::take(&mut prior.param_binds);
        self.statement_dirty = self.transaction != prior.transaction;
    }

    /// Whether this execution still owns a live server statement handle
    pub(crate) fn has_live_statement(&self) -> bool {
        self.server_stmt.is_some()
    }

    // =========================================================================
    // Close and cleanup
    // =========================================================================

    /// Release server-side result state. When not reusable, also close the
    /// server statement handle and free all buffers.
    pub(crate) fn finish(&mut self, ctx: &ExecContext, reusable: bool) {
        if let Some(stmt) = &self.server_stmt {
            let mut driver = ctx.shared.driver.lock();
            if let Some(session) = driver.session_mut() {
                if self.results_pending {
                    session.free_result(stmt.id);
                }
                if !reusable {
                    session.close_statement(stmt.id);
                }
            }
            self.results_pending = false;
            if !reusable {
                self.server_stmt = None;
                self.cleanup();
            }
        }
    }

    /// Unconditionally release bind arrays and buffers.
    pub(crate) fn cleanup(&mut self) {
        self.param_binds.clear();
        self.param_buffer = BytesMut::new();
        self.column_binds.clear();
        self.row_buffer = Vec::new();
        self.overflow = Vec::new();
        self.overflow_needed = 0;
    }

    // =========================================================================
    // Serialisation and replay comparison
    // =========================================================================

    /// Render the execution as a structured document for audit records and
    /// captured program files.
    pub fn to_document(&self, meta: &DocumentMeta) -> JsonValue {
        let mut doc = serde_json::Map::new();
        doc.insert("statement_name".into(), self.statement_name.clone().into());
        if !self.comment.is_empty() {
            doc.insert("comment".into(), self.comment.clone().into());
        }
        doc.insert("statement_text".into(), self.statement_text.clone().into());
        if let Some(program) = &meta.program {
            doc.insert("program".into(), program.clone().into());
        }
        if let Some(transaction) = &meta.transaction {
            doc.insert("transaction".into(), transaction.clone().into());
        }
        doc.insert("state".into(), meta.state.code().into());
        doc.insert("rc".into(), self.rc.into());
        doc.insert("rows_returned".into(), self.row_count.into());
        doc.insert("rows_affected".into(), self.rows_affected.into());
        doc.insert("error_message".into(), self.error_message.clone().into());
        doc.insert("error_no".into(), self.error_no.into());
        doc.insert("start_time".into(), format_time(self.start_time).into());
        doc.insert("execute_time".into(), format_time(self.execute_time).into());
        doc.insert("retrieve_time".into(), format_time(self.retrieve_time).into());
        doc.insert("complete_time".into(), format_time(self.complete_time).into());
        if !self.settings.is_empty() {
            if let Ok(settings) = serde_json::to_value(&self.settings) {
                doc.insert("parameters".into(), settings);
            }
        }
        if self.results.is_object() {
            doc.insert("results".into(), self.results.clone());
        }
        doc.insert("user".into(), meta.user.clone().into());
        doc.insert("host".into(), meta.host.clone().into());
        JsonValue::Object(doc)
    }

    /// Compare this live execution with the serialised form of a recorded
    /// one. Called before the statement reaches the server, so only the name
    /// and generated text participate.
    pub(crate) fn matches_recorded(&self, recorded: &JsonValue) -> Result<()> {
        let recorded_name = recorded
            .get("statement_name")
            .and_then(JsonValue::as_str)
            .unwrap_or_default();
        if recorded_name != self.statement_name {
            return Err(Error::ReplayNameMismatch {
                recorded: recorded_name.to_string(),
                live: self.statement_name.clone(),
            });
        }
        let recorded_text = recorded
            .get("statement_text")
            .and_then(JsonValue::as_str)
            .unwrap_or_default();
        if recorded_text != self.statement_text {
            return Err(Error::ReplayTextMismatch(self.statement_name.clone()));
        }
        Ok(())
    }
}

const ARG_SEPARATORS: &[char] = &[' ', ':', '.', ';', '\r', '\n', '\t'];

impl fmt::Display for Execution {
    /// Renders as `name(arg1, arg2, ...)` with long values truncated.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut arguments = String::new();
        for setting in self.settings.values() {
            let mut argstring = String::new();
            if let Some(value) = &setting.value {
                argstring = value.to_string();
                if argstring.len() > 64 {
                    let mut cut = argstring.find(ARG_SEPARATORS).unwrap_or(64);
                    while !argstring.is_char_boundary(cut) {
                        cut -= 1;
                    }
                    argstring.truncate(cut);
                    argstring.push_str("...");
                }
            }
            if !arguments.is_empty() {
                arguments.push_str(", ");
            }
            arguments.push_str(&argstring);
        }
        write!(f, "{}({})", self.statement_name, arguments)
    }
}
