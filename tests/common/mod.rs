//! Shared test fixtures: a scripted server session and the employees
//! statement dictionary.
//!
//! The mock session answers `prepare` from a per-SQL script of responses and
//! plays rows back through the same packed row buffers a native client would
//! fill. Tests enqueue one response per expected execution; when a script
//! runs dry the last response repeats.

#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use serde_json::{json, Value as JsonValue};

use dictsql::binding::RowWriter;
use dictsql::{
    ColumnBind, Config, Connection, DataType, ExecOutcome, Fetch, FieldMeta, ParamBind,
    PreparedInfo, ServerSession, SessionError, SessionFactory, SessionResult, StatementId,
    TimeValue, TypeCode,
};

/// One result column of a scripted response
#[derive(Debug, Clone)]
pub struct MockColumn {
    pub name: String,
    pub type_code: TypeCode,
    pub length: usize,
    pub max_length: usize,
}

pub fn col(name: &str, type_code: TypeCode) -> MockColumn {
    MockColumn {
        name: name.to_string(),
        type_code,
        length: 32,
        max_length: 0,
    }
}

pub fn col_sized(name: &str, type_code: TypeCode, length: usize, max_length: usize) -> MockColumn {
    MockColumn {
        name: name.to_string(),
        type_code,
        length,
        max_length,
    }
}

/// What one execution of a statement should produce
#[derive(Debug, Clone)]
pub enum MockResponse {
    Rows {
        columns: Vec<MockColumn>,
        rows: Vec<Vec<JsonValue>>,
    },
    Affected(u64),
    PrepareError { errno: i64, message: String },
    ExecuteError { errno: i64, message: String },
}

pub fn rows(columns: Vec<MockColumn>, rows: Vec<Vec<JsonValue>>) -> MockResponse {
    MockResponse::Rows { columns, rows }
}

pub fn affected(count: u64) -> MockResponse {
    MockResponse::Affected(count)
}

pub fn execute_error(errno: i64, message: &str) -> MockResponse {
    MockResponse::ExecuteError {
        errno,
        message: message.to_string(),
    }
}

struct StatementState {
    sql: String,
    fields: Vec<FieldMeta>,
    binds: Vec<ColumnBind>,
    pending_rows: Vec<Vec<JsonValue>>,
    columns: Vec<MockColumn>,
    cursor: usize,
    stashed: HashMap<usize, Vec<u8>>,
}

/// Scripted server state shared by every session the factory opens
#[derive(Default)]
pub struct MockState {
    scripts: HashMap<String, VecDeque<MockResponse>>,
    last_response: HashMap<String, MockResponse>,
    pub prepare_counts: HashMap<String, usize>,
    pub execute_log: Vec<String>,
    pub executed_statement_ids: Vec<StatementId>,
    pub auto_commit: bool,
    pub commits: usize,
    pub rollbacks: usize,
    pub closed_statements: Vec<StatementId>,
    next_statement_id: StatementId,
    statements: HashMap<StatementId, StatementState>,
}

impl MockState {
    fn next_response(&mut self, sql: &str) -> Option<MockResponse> {
        if let Some(queue) = self.scripts.get_mut(sql) {
            if let Some(response) = queue.pop_front() {
                self.last_response.insert(sql.to_string(), response.clone());
                return Some(response);
            }
        }
        self.last_response.get(sql).cloned()
    }

    fn peek_response(&self, sql: &str) -> Option<MockResponse> {
        self.scripts
            .get(sql)
            .and_then(|queue| queue.front().cloned())
            .or_else(|| self.last_response.get(sql).cloned())
    }
}

/// A shared handle to the scripted server
#[derive(Clone)]
pub struct MockServer {
    pub state: Arc<Mutex<MockState>>,
}

impl MockServer {
    pub fn new() -> MockServer {
        MockServer {
            state: Arc::new(Mutex::new(MockState {
                auto_commit: true,
                next_statement_id: 1,
                ..MockState::default()
            })),
        }
    }

    /// Enqueue a response for the next execution of the given SQL text
    pub fn script(&self, sql: &str, response: MockResponse) {
        self.state
            .lock()
            .unwrap()
            .scripts
            .entry(sql.to_string())
            .or_default()
            .push_back(response);
    }

    pub fn prepare_count(&self, sql: &str) -> usize {
        *self
            .state
            .lock()
            .unwrap()
            .prepare_counts
            .get(sql)
            .unwrap_or(&0)
    }

    pub fn execute_log(&self) -> Vec<String> {
        self.state.lock().unwrap().execute_log.clone()
    }

    pub fn executed_statement_ids(&self) -> Vec<StatementId> {
        self.state.lock().unwrap().executed_statement_ids.clone()
    }

    pub fn rollbacks(&self) -> usize {
        self.state.lock().unwrap().rollbacks
    }

    pub fn commits(&self) -> usize {
        self.state.lock().unwrap().commits
    }

    pub fn auto_commit(&self) -> bool {
        self.state.lock().unwrap().auto_commit
    }

    /// A factory opening sessions onto this scripted server
    pub fn factory(&self) -> Arc<MockFactory> {
        Arc::new(MockFactory {
            state: Arc::clone(&self.state),
            refuse_connect: false,
            connect_count: AtomicUsize::new(0),
        })
    }

    /// A factory that refuses every connection attempt
    pub fn refusing_factory(&self) -> Arc<MockFactory> {
        Arc::new(MockFactory {
            state: Arc::clone(&self.state),
            refuse_connect: true,
            connect_count: AtomicUsize::new(0),
        })
    }
}

pub struct MockFactory {
    state: Arc<Mutex<MockState>>,
    refuse_connect: bool,
    pub connect_count: AtomicUsize,
}

impl MockFactory {
    pub fn connects(&self) -> usize {
        self.connect_count.load(Ordering::SeqCst)
    }
}

impl SessionFactory for MockFactory {
    fn connect(&self, _config: &Config) -> SessionResult<Box<dyn ServerSession>> {
        self.connect_count.fetch_add(1, Ordering::SeqCst);
        if self.refuse_connect {
            return Err(SessionError::new(2003, "Can't connect to MySQL server"));
        }
        Ok(Box::new(MockSession {
            state: Arc::clone(&self.state),
        }))
    }
}

pub struct MockSession {
    state: Arc<Mutex<MockState>>,
}

fn data_type_for(type_code: TypeCode) -> DataType {
    match type_code {
        TypeCode::Date => DataType::Date,
        TypeCode::Time => DataType::Time,
        TypeCode::Timestamp => DataType::Timestamp,
        _ => DataType::Datetime,
    }
}

impl ServerSession for MockSession {
    fn prepare(&mut self, sql: &str) -> SessionResult<PreparedInfo> {
        let mut state = self.state.lock().unwrap();
        if let Some(MockResponse::PrepareError { errno, message }) = state.peek_response(sql) {
            state.next_response(sql);
            return Err(SessionError::new(errno, message));
        }
        *state.prepare_counts.entry(sql.to_string()).or_insert(0) += 1;

        let columns = match state.peek_response(sql) {
            Some(MockResponse::Rows { columns, .. }) => columns,
            _ => Vec::new(),
        };
        let fields: Vec<FieldMeta> = columns
            .iter()
            .map(|c| FieldMeta {
                name: c.name.clone(),
                type_code: c.type_code.code(),
                length: c.length,
                max_length: c.max_length,
            })
            .collect();

        let statement_id = state.next_statement_id;
        state.next_statement_id += 1;
        state.statements.insert(
            statement_id,
            StatementState {
                sql: sql.to_string(),
                fields: fields.clone(),
                binds: Vec::new(),
                pending_rows: Vec::new(),
                columns,
                cursor: 0,
                stashed: HashMap::new(),
            },
        );

        Ok(PreparedInfo {
            statement_id,
            marker_count: sql.matches('?').count(),
            fields,
        })
    }

    fn bind_params(
        &mut self,
        _statement: StatementId,
        _binds: &[ParamBind],
        _buffer: &[u8],
    ) -> SessionResult<()> {
        Ok(())
    }

    fn execute(&mut self, statement: StatementId) -> SessionResult<ExecOutcome> {
        let mut state = self.state.lock().unwrap();
        let sql = match state.statements.get(&statement) {
            Some(stmt) => stmt.sql.clone(),
            None => return Err(SessionError::new(2030, "statement not prepared")),
        };
        state.execute_log.push(sql.clone());
        state.executed_statement_ids.push(statement);

        match state.next_response(&sql) {
            Some(MockResponse::Affected(count)) => Ok(ExecOutcome::RowsAffected(count)),
            Some(MockResponse::Rows { columns, rows }) => {
                let stmt = state
                    .statements
                    .get_mut(&statement)
                    .expect("statement exists");
                stmt.columns = columns;
                stmt.pending_rows = rows;
                stmt.cursor = 0;
                Ok(ExecOutcome::ResultSet)
            }
            Some(MockResponse::ExecuteError { errno, message }) => {
                Err(SessionError::new(errno, message))
            }
            Some(MockResponse::PrepareError { errno, message }) => {
                Err(SessionError::new(errno, message))
            }
            None => Ok(ExecOutcome::RowsAffected(0)),
        }
    }

    fn bind_result(&mut self, statement: StatementId, binds: &[ColumnBind]) -> SessionResult<()> {
        let mut state = self.state.lock().unwrap();
        if let Some(stmt) = state.statements.get_mut(&statement) {
            stmt.binds = binds.to_vec();
        }
        Ok(())
    }

    fn fetch(&mut self, statement: StatementId, row: &mut [u8]) -> SessionResult<Fetch> {
        let mut state = self.state.lock().unwrap();
        let stmt = match state.statements.get_mut(&statement) {
            Some(stmt) => stmt,
            None => return Err(SessionError::new(2030, "statement not prepared")),
        };
        if stmt.cursor >= stmt.pending_rows.len() {
            return Ok(Fetch::Done);
        }

        let values = stmt.pending_rows[stmt.cursor].clone();
        stmt.cursor += 1;
        stmt.stashed.clear();
        row.fill(0);

        let mut truncated = false;
        let mut writer = RowWriter::new(row);
        for (icol, bind) in stmt.binds.iter().enumerate() {
            let value = values.get(icol).cloned().unwrap_or(JsonValue::Null);
            if value.is_null() {
                writer.set_null(bind, true);
                continue;
            }
            let type_code = TypeCode::from_code(bind.type_code)
                .ok_or_else(|| SessionError::new(2036, "unknown column type"))?;
            match type_code {
                TypeCode::Long | TypeCode::LongLong => {
                    writer.put_i64(bind, value.as_i64().unwrap_or(0));
                }
                TypeCode::Double => {
                    writer.put_f64(bind, value.as_f64().unwrap_or(0.0));
                }
                TypeCode::String | TypeCode::VarString | TypeCode::Enum => {
                    let text = value.as_str().unwrap_or_default().as_bytes().to_vec();
                    writer.put_var_len(bind, text.len());
                    truncated = true;
                    stmt.stashed.insert(icol, text);
                }
                TypeCode::Date | TypeCode::Time | TypeCode::Datetime | TypeCode::Timestamp => {
                    let text = value.as_str().unwrap_or_default();
                    let parsed = TimeValue::parse(text, data_type_for(type_code))
                        .ok()
                        .flatten()
                        .unwrap_or_default();
                    writer.put_time(bind, parsed);
                }
            }
        }

        Ok(if truncated { Fetch::Truncated } else { Fetch::Row })
    }

    fn fetch_column(
        &mut self,
        statement: StatementId,
        column: usize,
        out: &mut [u8],
    ) -> SessionResult<()> {
        let state = self.state.lock().unwrap();
        let stashed = state
            .statements
            .get(&statement)
            .and_then(|stmt| stmt.stashed.get(&column))
            .ok_or_else(|| SessionError::new(2051, "no column value to fetch"))?;
        let len = out.len().min(stashed.len());
        out[..len].copy_from_slice(&stashed[..len]);
        Ok(())
    }

    fn free_result(&mut self, statement: StatementId) {
        let mut state = self.state.lock().unwrap();
        if let Some(stmt) = state.statements.get_mut(&statement) {
            stmt.pending_rows.clear();
            stmt.cursor = 0;
        }
    }

    fn close_statement(&mut self, statement: StatementId) {
        let mut state = self.state.lock().unwrap();
        state.statements.remove(&statement);
        state.closed_statements.push(statement);
    }

    fn set_auto_commit(&mut self, auto_commit: bool) -> SessionResult<()> {
        self.state.lock().unwrap().auto_commit = auto_commit;
        Ok(())
    }

    fn commit(&mut self) -> SessionResult<()> {
        self.state.lock().unwrap().commits += 1;
        Ok(())
    }

    fn rollback(&mut self) -> SessionResult<()> {
        self.state.lock().unwrap().rollbacks += 1;
        Ok(())
    }
}

// =============================================================================
// Employees dictionary fixture
// =============================================================================

fn marker(name: &str, data_type: &str) -> JsonValue {
    json!({ "name": name, "param_type": "marker", "data_type": data_type })
}

/// The statement dictionary the employees scenarios run against
pub fn employees_dictionary() -> JsonValue {
    json!({
        "statements": {
            "get_employee_by_emp_no": {
                "statement_text": [
                    "SELECT emp_no, birth_date, first_name, last_name, gender, hire_date ",
                    "FROM employees WHERE emp_no = ?"
                ],
                "parameters": [marker("emp_no", "int")]
            },
            "days_from_now": {
                "statement_text": ["SELECT DATEDIFF(NOW(), ?) AS days"],
                "parameters": [marker("date_string", "string")]
            },
            "get_dept_by_dept_no": {
                "statement_text": ["SELECT dept_no, dept_name FROM departments WHERE dept_no = ?"],
                "parameters": [marker("dept_no", "string")]
            },
            "salary_range_for_dept": {
                "statement_text": [
                    "SELECT MIN(s.salary) AS `min salary`, MAX(s.salary) AS `max salary` ",
                    "FROM salaries s JOIN dept_emp de ON s.emp_no = de.emp_no ",
                    "WHERE de.dept_no = ?"
                ],
                "parameters": [marker("dept_no", "string")]
            },
            "add_employee_to_employee_table": {
                "statement_text": [
                    "INSERT INTO employees (emp_no, birth_date, first_name, last_name, gender, hire_date) ",
                    "VALUES (?, ?, ?, ?, ?, ?)"
                ],
                "parameters": [
                    marker("emp_no", "int"),
                    marker("birth_date", "date"),
                    marker("first_name", "string"),
                    marker("last_name", "string"),
                    marker("gender", "string"),
                    marker("hire_date", "date")
                ]
            },
            "assign_employee_to_department": {
                "statement_text": [
                    "INSERT INTO dept_emp (emp_no, dept_no, from_date, to_date) ",
                    "VALUES (?, ?, ?, ?)"
                ],
                "parameters": [
                    marker("emp_no", "int"),
                    marker("dept_no", "string"),
                    marker("from_date", "date"),
                    marker("to_date", "date")
                ]
            },
            "set_employee_salary": {
                "statement_text": [
                    "INSERT INTO salaries (emp_no, salary, from_date, to_date) ",
                    "VALUES (?, ?, ?, ?)"
                ],
                "parameters": [
                    marker("emp_no", "int"),
                    marker("salary", "int"),
                    marker("from_date", "date"),
                    marker("to_date", "date")
                ]
            },
            "get_current_employee_info_by_emp_no": {
                "statement_text": [
                    "SELECT e.emp_no, e.first_name, e.last_name, d.dept_no, s.salary ",
                    "FROM employees e ",
                    "JOIN dept_emp d ON d.emp_no = e.emp_no ",
                    "JOIN salaries s ON s.emp_no = e.emp_no ",
                    "WHERE e.emp_no = ?"
                ],
                "parameters": [marker("emp_no", "int")]
            }
        }
    })
}

/// Write a dictionary document into a directory and return its path
pub fn write_dictionary(dir: &Path, dictionary: &JsonValue) -> PathBuf {
    let path = dir.join("statements.json");
    std::fs::write(&path, serde_json::to_string_pretty(dictionary).unwrap()).unwrap();
    path
}

/// Connection over the employees dictionary and the given factory
pub fn employees_connection(
    dir: &Path,
    factory: Arc<MockFactory>,
    async_mode: bool,
) -> Connection {
    let dictionary = write_dictionary(dir, &employees_dictionary());
    let config = Config::new("employees_test", "employees", dictionary)
        .user("hr_app")
        .password("secret")
        .host("db.test")
        .async_mode(async_mode);
    Connection::create(config, factory)
}

// Generated texts of the employees statements, for scripting responses
pub const GET_EMPLOYEE_SQL: &str = "SELECT emp_no, birth_date, first_name, last_name, gender, hire_date FROM employees WHERE emp_no = ?";
pub const DAYS_FROM_NOW_SQL: &str = "SELECT DATEDIFF(NOW(), ?) AS days";
pub const GET_DEPT_SQL: &str = "SELECT dept_no, dept_name FROM departments WHERE dept_no = ?";
pub const SALARY_RANGE_SQL: &str = "SELECT MIN(s.salary) AS `min salary`, MAX(s.salary) AS `max salary` FROM salaries s JOIN dept_emp de ON s.emp_no = de.emp_no WHERE de.dept_no = ?";
pub const ADD_EMPLOYEE_SQL: &str = "INSERT INTO employees (emp_no, birth_date, first_name, last_name, gender, hire_date) VALUES (?, ?, ?, ?, ?, ?)";
pub const ASSIGN_DEPT_SQL: &str =
    "INSERT INTO dept_emp (emp_no, dept_no, from_date, to_date) VALUES (?, ?, ?, ?)";
pub const SET_SALARY_SQL: &str =
    "INSERT INTO salaries (emp_no, salary, from_date, to_date) VALUES (?, ?, ?, ?)";
pub const EMPLOYEE_INFO_SQL: &str = "SELECT e.emp_no, e.first_name, e.last_name, d.dept_no, s.salary FROM employees e JOIN dept_emp d ON d.emp_no = e.emp_no JOIN salaries s ON s.emp_no = e.emp_no WHERE e.emp_no = ?";

/// Script the responses for one successful `add_employee` pass
pub fn script_happy_add_employee(server: &MockServer, days: i64) {
    server.script(GET_EMPLOYEE_SQL, rows(employee_columns(), vec![]));
    server.script(
        DAYS_FROM_NOW_SQL,
        rows(vec![col("days", TypeCode::LongLong)], vec![vec![json!(days)]]),
    );
    server.script(
        GET_DEPT_SQL,
        rows(
            vec![
                col("dept_no", TypeCode::VarString),
                col("dept_name", TypeCode::VarString),
            ],
            vec![vec![json!("d005"), json!("Development")]],
        ),
    );
    server.script(
        SALARY_RANGE_SQL,
        rows(
            vec![
                col("min salary", TypeCode::LongLong),
                col("max salary", TypeCode::LongLong),
            ],
            vec![vec![json!(39000), json!(110000)]],
        ),
    );
    server.script(ADD_EMPLOYEE_SQL, affected(1));
    server.script(ASSIGN_DEPT_SQL, affected(1));
    server.script(SET_SALARY_SQL, affected(1));
    server.script(
        EMPLOYEE_INFO_SQL,
        rows(
            vec![
                col("emp_no", TypeCode::Long),
                col("first_name", TypeCode::VarString),
                col("last_name", TypeCode::VarString),
                col("dept_no", TypeCode::VarString),
                col("salary", TypeCode::LongLong),
            ],
            vec![vec![
                json!(500001),
                json!("Chirstian"),
                json!("Koblick"),
                json!("d005"),
                json!(60000),
            ]],
        ),
    );
}

pub fn employee_columns() -> Vec<MockColumn> {
    vec![
        col("emp_no", TypeCode::Long),
        col("birth_date", TypeCode::Date),
        col("first_name", TypeCode::VarString),
        col("last_name", TypeCode::VarString),
        col("gender", TypeCode::Enum),
        col("hire_date", TypeCode::Date),
    ]
}

/// Higher-level application flow the end-to-end scenarios drive: validate,
/// then insert the employee, their department assignment and salary inside
/// one transaction. Mirrors a cautious HR application, down to the closing
/// rollback left in for testing.
#[allow(clippy::too_many_arguments)]
pub fn add_employee(
    conn: &Connection,
    emp_no: i64,
    birth_date: &str,
    first_name: &str,
    last_name: &str,
    gender: &str,
    hire_date: &str,
    dept_no: &str,
    salary: i64,
) -> i64 {
    // confirm that no current employee has this employee number
    conn.execute("get_employee_by_emp_no", &[("emp_no", json!(emp_no))]);
    let rc = conn.return_code(0);
    if rc != 0 {
        return rc;
    }
    if !conn.assert_rows_returned(0, 0) {
        return 1;
    }

    // make sure the hire date is valid and in the recent past
    conn.execute("days_from_now", &[("date_string", json!(hire_date))]);
    let rc = conn.return_code(0);
    if rc != 0 {
        return rc;
    }
    if !conn.assert_rows_returned(1, 0) {
        return 1;
    }
    let results = conn.results(0).unwrap_or_default();
    let days = &results["rows"][0]["days"];
    if days.is_null() {
        conn.report_error(&format!("Hire date {} is not valid", hire_date), 1);
        return 1;
    }
    let days = days.as_i64().unwrap_or(0);
    if days > 10 || days < -60 {
        conn.report_error(&format!("Hire date {} is not recent", hire_date), 1);
        return 1;
    }

    // validate the department
    conn.execute("get_dept_by_dept_no", &[("dept_no", json!(dept_no))]);
    let rc = conn.return_code(0);
    if rc != 0 {
        return rc;
    }
    if !conn.assert_rows_returned(1, 0) {
        return 1;
    }

    // sanity-check the salary against the department's range
    conn.execute("salary_range_for_dept", &[("dept_no", json!(dept_no))]);
    let rc = conn.return_code(0);
    if rc != 0 {
        return rc;
    }
    if !conn.assert_rows_returned(1, 0) {
        return 1;
    }
    let results = conn.results(0).unwrap_or_default();
    let range = &results["rows"][0];
    let min_salary = range["min salary"].as_i64().unwrap_or(0);
    let max_salary = range["max salary"].as_i64().unwrap_or(0);
    if (salary as f64) < min_salary as f64 - 0.1 * min_salary as f64
        || (salary as f64) > max_salary as f64 + 0.1 * max_salary as f64
    {
        return conn.report_error(
            &format!(
                "salary {} out of range for department {} ({} - {})",
                salary, dept_no, min_salary, max_salary
            ),
            1,
        );
    }

    // the framework rolls back automatically on error from here on
    if conn.start_transaction("Add employee").is_err() {
        return conn.error_no();
    }

    conn.execute(
        "add_employee_to_employee_table",
        &[
            ("emp_no", json!(emp_no)),
            ("birth_date", json!(birth_date)),
            ("first_name", json!(first_name)),
            ("last_name", json!(last_name)),
            ("gender", json!(gender)),
            ("hire_date", json!(hire_date)),
        ],
    );
    let rc = conn.return_code(0);
    if rc != 0 {
        return rc;
    }
    if !conn.assert_rows_affected(1, 0) {
        return 1;
    }

    conn.execute(
        "assign_employee_to_department",
        &[
            ("emp_no", json!(emp_no)),
            ("dept_no", json!(dept_no)),
            ("from_date", json!(hire_date)),
            ("to_date", json!("9999-01-01")),
        ],
    );
    let rc = conn.return_code(0);
    if rc != 0 {
        return rc;
    }
    if !conn.assert_rows_affected(1, 0) {
        return 1;
    }

    conn.execute(
        "set_employee_salary",
        &[
            ("emp_no", json!(emp_no)),
            ("salary", json!(salary)),
            ("from_date", json!(hire_date)),
            ("to_date", json!("9999-01-01")),
        ],
    );
    let rc = conn.return_code(0);
    if rc != 0 {
        return rc;
    }
    if !conn.assert_rows_affected(1, 0) {
        return 1;
    }

    conn.execute(
        "get_current_employee_info_by_emp_no",
        &[("emp_no", json!(emp_no))],
    );
    let rc = conn.return_code(0);
    if rc != 0 {
        return rc;
    }
    if !conn.assert_rows_returned(1, 0) {
        return 1;
    }

    // just testing
    if conn.rollback_transaction("just testing").is_err() {
        return conn.error_no();
    }
    0
}
