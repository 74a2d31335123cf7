//! Connection configuration
//!
//! A [`Config`] names the connection, points at the statement dictionary
//! file, and carries the server coordinates and credentials the session
//! factory needs. The async flag selects single-worker asynchronous dispatch.

use std::fmt;
use std::path::PathBuf;

/// Default MySQL-compatible server port
pub const DEFAULT_PORT: u16 = 3306;

/// Connection-creation options.
///
/// # Examples
///
/// ```rust
/// use dictsql::Config;
///
/// let config = Config::new("employees", "employees", "sql/employees.json")
///     .user("hr_app")
///     .password("secret")
///     .host("db.internal")
///     .port(3306)
///     .async_mode(true);
/// ```
#[derive(Clone)]
pub struct Config {
    /// Connection name, used as the logging prefix
    pub name: String,
    /// Database (schema) to open
    pub database_name: String,
    /// Path to the statement dictionary file
    pub statement_path: PathBuf,
    /// Username for authentication
    pub user: String,
    /// Password for authentication
    password: String,
    /// Host to connect to
    pub host: String,
    /// Port to connect to
    pub port: u16,
    /// Unix socket path, when connecting locally
    pub socket: Option<String>,
    /// Client flags passed through to the native client
    pub flags: u64,
    /// Run server I/O on a dedicated worker thread
    pub async_mode: bool,
}

impl Config {
    /// Create a new configuration with the given connection name, database
    /// and statement dictionary path. Host defaults to localhost, port to
    /// [`DEFAULT_PORT`], and the connection is synchronous.
    pub fn new(
        name: impl Into<String>,
        database_name: impl Into<String>,
        statement_path: impl Into<PathBuf>,
    ) -> Self {
        Self {
            name: name.into(),
            database_name: database_name.into(),
            statement_path: statement_path.into(),
            user: String::new(),
            password: String::new(),
            host: "localhost".to_string(),
            port: DEFAULT_PORT,
            socket: None,
            flags: 0,
            async_mode: false,
        }
    }

    /// Set the username
    pub fn user(mut self, user: impl Into<String>) -> Self {
        self.user = user.into();
        self
    }

    /// Set the password
    pub fn password(mut self, password: impl Into<String>) -> Self {
        self.password = password.into();
        self
    }

    /// Set the host
    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    /// Set the port
    pub fn port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Set the Unix socket path
    pub fn socket(mut self, socket: impl Into<String>) -> Self {
        self.socket = Some(socket.into());
        self
    }

    /// Set the client flags
    pub fn flags(mut self, flags: u64) -> Self {
        self.flags = flags;
        self
    }

    /// Select asynchronous dispatch: one worker thread owns all server I/O
    pub fn async_mode(mut self, async_mode: bool) -> Self {
        self.async_mode = async_mode;
        self
    }

    /// Get the password (for session factories)
    pub fn get_password(&self) -> &str {
        &self.password
    }
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("name", &self.name)
            .field("database_name", &self.database_name)
            .field("statement_path", &self.statement_path)
            .field("user", &self.user)
            .field("password", &"***")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("socket", &self.socket)
            .field("flags", &self.flags)
            .field("async_mode", &self.async_mode)
            .finish()
    }
}
