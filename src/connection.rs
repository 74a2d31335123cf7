//! Connection facade
//!
//! A [`Connection`] is the object applications hold: it owns the driver, the
//! list of live executions, the observer chain, and (in async mode) the
//! worker thread. It is a single-ownership object — one caller drives it; in
//! async mode the worker thread runs only the server-facing tail of each
//! execution's state machine.
//!
//! Every reported error rolls back the open transaction automatically. That
//! is the framework's at-most-one-partial-write guarantee: any error at or
//! after `start_transaction` erases all work inside that transaction.

use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::Value as JsonValue;

use crate::client::SessionFactory;
use crate::config::Config;
use crate::dictionary::StatementDict;
use crate::driver::{self, Driver, ExecutionCell};
use crate::error::{Error, Result};
use crate::execution::{ArgSource, ExecContext, Execution, ExecutionHandle};
use crate::logging;
use crate::observer::{self, AuditEvent, Observer, ObserverContext, ObserverKind};
use crate::worker::{RequestType, Worker};

/// Facade state mutated outside the driver: transaction and program scopes
/// plus the most recent error.
pub(crate) struct Control {
    pub transaction_name: String,
    pub programs: Vec<String>,
    pub transactions_enabled: bool,
    pub error_no: i64,
    pub error_message: String,
    pub error_handle: ExecutionHandle,
}

/// State shared between the facade and the worker thread
pub(crate) struct Shared {
    pub name: String,
    pub async_mode: bool,
    pub driver: Mutex<Driver>,
    pub executions: Mutex<Vec<Arc<ExecutionCell>>>,
    pub observers: Mutex<Vec<Box<dyn Observer>>>,
    pub ctl: Mutex<Control>,
}

impl Shared {
    /// The statement dictionary, loaded lazily by the driver
    pub fn statements(&self) -> Result<Arc<StatementDict>> {
        self.driver.lock().statements()
    }

    /// Find an execution by handle; 0 means the most recently created
    pub fn find_execution(&self, handle: ExecutionHandle) -> Option<Arc<ExecutionCell>> {
        let executions = self.executions.lock();
        if handle == 0 {
            return executions.last().cloned();
        }
        executions.iter().find(|cell| cell.handle == handle).cloned()
    }

    /// Reuse scan over the execution list (see [`driver::find_live_prior_execution`])
    pub fn find_live_prior_execution(&self, current: &Execution) -> Option<Arc<ExecutionCell>> {
        let executions = self.executions.lock();
        driver::find_live_prior_execution(&executions, current)
    }

    /// Whether a replay observer is attached
    pub fn is_replay(&self) -> bool {
        self.observers
            .lock()
            .iter()
            .any(|observer| observer.kind() == ObserverKind::Replay)
    }

    /// Innermost open program, if any
    pub fn current_program(&self) -> Option<String> {
        self.ctl.lock().programs.last().cloned()
    }

    /// Open transaction name, if any
    pub fn current_transaction(&self) -> Option<String> {
        let ctl = self.ctl.lock();
        if ctl.transaction_name.is_empty() {
            None
        } else {
            Some(ctl.transaction_name.clone())
        }
    }

    /// Connection credentials for serialised documents
    pub fn user_and_host(&self) -> (String, String) {
        let driver = self.driver.lock();
        let config = driver.config();
        (config.user.clone(), config.host.clone())
    }

    /// Record an error as the connection's current error, log it, and roll
    /// back any open transaction. Returns the error number.
    ///
    /// `on_worker` distinguishes the producing thread: the worker rolls back
    /// directly (a flush through itself would deadlock), the caller flushes
    /// in-flight executions first so the session is quiet.
    pub fn report_error(
        &self,
        message: &str,
        errno: i64,
        handle: ExecutionHandle,
        worker: Option<&Worker>,
        on_worker: bool,
    ) -> i64 {
        {
            let mut ctl = self.ctl.lock();
            ctl.error_no = errno;
            ctl.error_message = message.to_string();
            ctl.error_handle = handle;
        }
        tracing::error!(conn = %self.name, "{}", message);
        let _ = self.rollback_transaction("execution failed", worker, on_worker);
        errno
    }

    /// Roll back the open transaction, if any. A no-op when transactions are
    /// disabled (replay) or auto-commit is on.
    pub fn rollback_transaction(
        &self,
        reason: &str,
        worker: Option<&Worker>,
        on_worker: bool,
    ) -> Result<()> {
        if !self.ctl.lock().transactions_enabled {
            return Ok(());
        }
        if self.driver.lock().is_auto_commit() {
            return Ok(());
        }
        if !on_worker {
            if let Some(worker) = worker {
                let sequence = worker.put_request(RequestType::Rollback, 0, reason);
                worker.wait_for_request(sequence);
            }
        }
        let rolled_back = self.driver.lock().rollback();
        match rolled_back {
            Ok(()) => {
                let name = {
                    let mut ctl = self.ctl.lock();
                    let name = ctl.transaction_name.clone();
                    ctl.transaction_name.clear();
                    name
                };
                tracing::info!(conn = %self.name, "Rolled back transaction {}: {}", name, reason);
                self.notify_audit(AuditEvent::Rollback, reason, worker, on_worker);
                Ok(())
            }
            Err(err) => {
                tracing::error!(conn = %self.name, "rollback failed: {}", err);
                Err(err)
            }
        }
    }

    /// Run the audit hook on every observer, in registration order
    pub fn notify_audit(
        &self,
        event: AuditEvent,
        comment: &str,
        worker: Option<&Worker>,
        on_worker: bool,
    ) {
        let ctx = ObserverContext::new(self, worker, on_worker);
        for observer in self.observers.lock().iter_mut() {
            observer.on_audit(&ctx, event, comment, None);
        }
    }
}

/// A connection to a MySQL-compatible database, driving named statements
/// from a dictionary through the execution pipeline.
///
/// # Example
///
/// ```rust,no_run
/// use dictsql::{Config, Connection};
/// use serde_json::json;
/// # fn factory() -> std::sync::Arc<dyn dictsql::SessionFactory> { unimplemented!() }
///
/// let config = Config::new("employees", "employees", "sql/employees.json")
///     .user("hr_app")
///     .password("secret");
/// let conn = Connection::create(config, factory());
///
/// conn.execute("get_employee_by_emp_no", &[("emp_no", json!(10001))]);
/// if conn.return_code(0) == 0 {
///     let results = conn.results(0);
/// }
/// ```
pub struct Connection {
    shared: Arc<Shared>,
    worker: Option<Worker>,
}

impl Connection {
    /// Create a connection. The session opens lazily on first server
    /// contact; in async mode the worker thread starts immediately.
    pub fn create(config: Config, factory: Arc<dyn SessionFactory>) -> Connection {
        logging::init();
        let name = config.name.clone();
        let async_mode = config.async_mode;
        let shared = Arc::new(Shared {
            name,
            async_mode,
            driver: Mutex::new(Driver::new(config, factory)),
            executions: Mutex::new(Vec::new()),
            observers: Mutex::new(Vec::new()),
            ctl: Mutex::new(Control {
                transaction_name: String::new(),
                programs: Vec::new(),
                transactions_enabled: true,
                error_no: 0,
                error_message: String::new(),
                error_handle: 0,
            }),
        });
        let worker = async_mode.then(|| Worker::start(Arc::clone(&shared)));
        Connection { shared, worker }
    }

    /// Connection name
    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// Whether this connection dispatches through a worker thread
    pub fn is_async(&self) -> bool {
        self.worker.is_some()
    }

    /// The loaded statement dictionary
    pub fn statements(&self) -> Result<Arc<StatementDict>> {
        self.shared.statements()
    }

    // =========================================================================
    // Execution
    // =========================================================================

    /// Execute a named statement with ordered (tag, value) arguments.
    /// Always returns the execution handle, even when the prepare side
    /// fails; the next [`return_code`](Connection::return_code) reports the
    /// failure.
    pub fn execute(&self, statement_name: &str, args: &[(&str, JsonValue)]) -> ExecutionHandle {
        self.execute_with_comment(statement_name, "", args)
    }

    /// [`execute`](Connection::execute) with an audit comment attached
    pub fn execute_with_comment(
        &self,
        statement_name: &str,
        comment: &str,
        args: &[(&str, JsonValue)],
    ) -> ExecutionHandle {
        let pairs = args
            .iter()
            .map(|(tag, value)| (tag.to_string(), value.clone()))
            .collect();
        self.do_execute(self.new_execution(statement_name, comment, ArgSource::Pairs(pairs)))
    }

    /// Execute a named statement with values from a name -> value document
    pub fn execute_doc(&self, statement_name: &str, values: &JsonValue) -> ExecutionHandle {
        self.do_execute(self.new_execution(statement_name, "", ArgSource::Doc(values.clone())))
    }

    fn new_execution(&self, statement_name: &str, comment: &str, args: ArgSource) -> Execution {
        let is_auto_commit = self.shared.driver.lock().is_auto_commit();
        let transaction = self.shared.ctl.lock().transaction_name.clone();
        let execution = Execution::new(statement_name, comment, args, is_auto_commit, transaction);
        tracing::trace!(
            conn = %self.shared.name,
            execution = execution.handle(),
            "Creating execution"
        );
        execution
    }

    /// Run the prepare side on the caller; in sync mode continue through the
    /// server, in async mode enqueue the server-facing tail.
    fn do_execute(&self, execution: Execution) -> ExecutionHandle {
        let handle = execution.handle();
        let cell = Arc::new(ExecutionCell {
            handle,
            inner: Mutex::new(execution),
        });
        self.shared.executions.lock().push(Arc::clone(&cell));

        {
            let mut ctl = self.shared.ctl.lock();
            ctl.error_no = 0;
            ctl.error_message.clear();
        }

        let ctx = self.caller_context();
        let mut execution = cell.inner.lock();
        let rc = execution.prepare_side(&ctx);
        if rc != 0 {
            return handle;
        }

        if let Some(worker) = &self.worker {
            let sequence = worker.put_request(RequestType::Execution, handle, "");
            execution.set_request_sequence(sequence);
        } else {
            execution.run_server_side(&ctx);
        }
        handle
    }

    fn caller_context(&self) -> ExecContext<'_> {
        ExecContext {
            shared: &self.shared,
            worker: self.worker.as_ref(),
            on_worker: false,
        }
    }

    /// Find the execution and, in async mode, block until its request has
    /// completed server-side.
    fn completed_execution(&self, handle: ExecutionHandle) -> Option<Arc<ExecutionCell>> {
        let cell = self.shared.find_execution(handle)?;
        if let Some(worker) = &self.worker {
            let sequence = cell.inner.lock().request_sequence();
            if sequence > 0 && !worker.is_completed(sequence) {
                worker.wait_for_request(sequence);
            }
        }
        Some(cell)
    }

    /// Return code of an execution; 0 on success, the error number on
    /// failure. Handle 0 addresses the most recently created execution.
    pub fn return_code(&self, handle: ExecutionHandle) -> i64 {
        match self.completed_execution(handle) {
            Some(cell) => {
                let execution = cell.inner.lock();
                tracing::trace!(
                    conn = %self.shared.name,
                    execution = execution.handle(),
                    "rc {}",
                    execution.return_code()
                );
                execution.return_code()
            }
            None => {
                tracing::warn!(conn = %self.shared.name, "return_code: no such execution {}", handle);
                0
            }
        }
    }

    /// The results document of an execution
    pub fn results(&self, handle: ExecutionHandle) -> Option<JsonValue> {
        self.completed_execution(handle)
            .map(|cell| cell.inner.lock().results().clone())
    }

    /// Rows returned by an execution's result set
    pub fn row_count(&self, handle: ExecutionHandle) -> i64 {
        self.completed_execution(handle)
            .map(|cell| cell.inner.lock().row_count())
            .unwrap_or(0)
    }

    /// Rows affected by an execution with no result set
    pub fn rows_affected(&self, handle: ExecutionHandle) -> i64 {
        self.completed_execution(handle)
            .map(|cell| cell.inner.lock().rows_affected())
            .unwrap_or(0)
    }

    /// Fail unless the execution returned the expected number of rows.
    /// Before inserting a row, select its key and assert 0 rows returned;
    /// before updating, assert 1.
    pub fn assert_rows_returned(&self, expected: i64, handle: ExecutionHandle) -> bool {
        let Some(cell) = self.completed_execution(handle) else {
            return false;
        };
        let (rows, rendered, exec_handle) = {
            let execution = cell.inner.lock();
            (
                execution.row_count(),
                execution.to_string(),
                execution.handle(),
            )
        };
        if rows == expected {
            return true;
        }
        let message = format!(
            "{} returned {}{}{} expected",
            rendered,
            rows,
            if rows == 1 { " row. " } else { " rows. " },
            expected
        );
        self.shared
            .report_error(&message, 1, exec_handle, self.worker.as_ref(), false);
        false
    }

    /// Fail unless an INSERT, UPDATE or DELETE affected the expected number
    /// of rows.
    pub fn assert_rows_affected(&self, expected: i64, handle: ExecutionHandle) -> bool {
        let Some(cell) = self.completed_execution(handle) else {
            return false;
        };
        let (rows, rendered, exec_handle) = {
            let execution = cell.inner.lock();
            (
                execution.rows_affected(),
                execution.to_string(),
                execution.handle(),
            )
        };
        if rows == expected {
            return true;
        }
        let message = format!(
            "{} affected {}{}{} expected",
            rendered,
            rows,
            if rows == 1 { " row. " } else { " rows. " },
            expected
        );
        self.shared
            .report_error(&message, 1, exec_handle, self.worker.as_ref(), false);
        false
    }

    // =========================================================================
    // Transactions
    // =========================================================================

    /// Start a named transaction. A no-op when transactions are disabled
    /// (replay connections). Nested starts are rejected. In async mode all
    /// in-flight executions complete first.
    pub fn start_transaction(&self, transaction_name: &str) -> Result<()> {
        if !self.transactions_enabled() {
            return Ok(());
        }
        self.flush(RequestType::StartTransaction, 0, transaction_name);
        tracing::info!(conn = %self.shared.name, "Starting transaction {}", transaction_name);

        if !self.shared.driver.lock().is_auto_commit() {
            let current = self.shared.ctl.lock().transaction_name.clone();
            let err = Error::TransactionInProgress {
                new: transaction_name.to_string(),
                current,
            };
            self.record_error(&err);
            return Err(err);
        }
        if let Err(err) = self.shared.driver.lock().set_auto_commit(false) {
            self.record_error(&err);
            return Err(err);
        }
        self.shared.ctl.lock().transaction_name = transaction_name.to_string();
        Ok(())
    }

    /// Commit the open transaction and notify observers
    pub fn commit_transaction(&self) -> Result<()> {
        if !self.transactions_enabled() {
            return Ok(());
        }
        self.flush(RequestType::Commit, 0, "");

        if self.shared.driver.lock().is_auto_commit() {
            let err = Error::NoTransaction;
            self.record_error(&err);
            return Err(err);
        }
        let name = self.shared.ctl.lock().transaction_name.clone();
        if let Err(err) = self.shared.driver.lock().commit() {
            self.record_error(&err);
            return Err(err);
        }
        tracing::info!(conn = %self.shared.name, "Committed transaction {}", name);
        self.shared.ctl.lock().transaction_name.clear();
        self.shared
            .notify_audit(AuditEvent::Commit, &name, self.worker.as_ref(), false);
        Ok(())
    }

    /// Roll back the open transaction, logging the reason. A no-op when no
    /// transaction is open.
    pub fn rollback_transaction(&self, reason: &str) -> Result<()> {
        self.shared
            .rollback_transaction(reason, self.worker.as_ref(), false)
    }

    /// Name of the open transaction, empty when none
    pub fn current_transaction(&self) -> String {
        self.shared.ctl.lock().transaction_name.clone()
    }

    /// Whether transaction operations are live (replay disables them)
    pub fn transactions_enabled(&self) -> bool {
        self.shared.ctl.lock().transactions_enabled
    }

    // =========================================================================
    // Programs
    // =========================================================================

    /// Open a named program scope (typically a test case) for the benefit of
    /// the capture, replay and audit observers.
    pub fn start_program(&self, program: &str) {
        self.flush(RequestType::StartProgram, 0, program);
        self.shared.ctl.lock().programs.push(program.to_string());
        let ctx = ObserverContext::new(&self.shared, self.worker.as_ref(), false);
        for observer in self.shared.observers.lock().iter_mut() {
            observer.start_program(&ctx, program);
        }
    }

    /// Close a program scope
    pub fn end_program(&self, program: &str) {
        self.flush(RequestType::EndProgram, 0, program);
        {
            let ctx = ObserverContext::new(&self.shared, self.worker.as_ref(), false);
            for observer in self.shared.observers.lock().iter_mut() {
                observer.end_program(&ctx, program);
            }
        }
        self.shared.ctl.lock().programs.pop();
    }

    /// Innermost open program, if any
    pub fn current_program(&self) -> Option<String> {
        self.shared.current_program()
    }

    // =========================================================================
    // Observers
    // =========================================================================

    /// Attach an observer to the chain. Observers run in registration order.
    pub fn add_observer(
        &self,
        name: &str,
        kind: ObserverKind,
        params: Option<&JsonValue>,
    ) -> Result<()> {
        let observer = observer::create_observer(name, kind, params, &self.shared)?;
        self.shared.observers.lock().push(observer);
        Ok(())
    }

    /// Detach the named observer
    pub fn remove_observer(&self, name: &str) {
        self.shared
            .observers
            .lock()
            .retain(|observer| observer.name() != name);
    }

    /// Whether a replay observer is attached
    pub fn is_replay(&self) -> bool {
        self.shared.is_replay()
    }

    // =========================================================================
    // Errors
    // =========================================================================

    /// Report an application-level error: record it, log it, and roll back
    /// any open transaction. Returns the error number.
    pub fn report_error(&self, message: &str, errno: i64) -> i64 {
        self.shared
            .report_error(message, errno, 0, self.worker.as_ref(), false)
    }

    fn record_error(&self, err: &Error) {
        self.shared.report_error(
            &err.to_string(),
            err.code(),
            0,
            self.worker.as_ref(),
            false,
        );
    }

    /// Most recent error number, 0 when none
    pub fn error_no(&self) -> i64 {
        self.shared.ctl.lock().error_no
    }

    /// Most recent error message, empty when none
    pub fn error_message(&self) -> String {
        self.shared.ctl.lock().error_message.clone()
    }

    /// Handle of the execution the most recent error belongs to, 0 for
    /// connection-level errors
    pub fn error_execution(&self) -> ExecutionHandle {
        self.shared.ctl.lock().error_handle
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Open the server session now instead of on first use
    pub fn open(&self) -> Result<()> {
        let result = self.shared.driver.lock().open();
        if let Err(err) = &result {
            self.shared.report_error(
                &err.to_string(),
                err.code(),
                0,
                self.worker.as_ref(),
                false,
            );
        }
        result
    }

    /// Whether the server session is open
    pub fn is_open(&self) -> bool {
        self.shared.driver.lock().is_open()
    }

    /// Connection user
    pub fn user(&self) -> String {
        self.shared.user_and_host().0
    }

    /// Connection host
    pub fn host(&self) -> String {
        self.shared.user_and_host().1
    }

    /// Kill the worker (draining queued requests first) and close the
    /// driver. Also runs on drop.
    pub fn close(&mut self) {
        if let Some(mut worker) = self.worker.take() {
            worker.kill();
        }
        self.shared.driver.lock().close();
    }

    /// Enqueue a barrier request and wait for it, guaranteeing all prior
    /// executions are complete. A no-op in sync mode.
    fn flush(&self, rtype: RequestType, int_param: ExecutionHandle, string_param: &str) {
        if let Some(worker) = &self.worker {
            let sequence = worker.put_request(rtype, int_param, string_param);
            worker.wait_for_request(sequence);
        }
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.close();
    }
}
