//! Connection driver
//!
//! The driver owns the server session, the statement dictionary, and the
//! auto-commit flag. The session and the dictionary are both lazy: the
//! dictionary file is read the first time any execution validates against
//! it, and the session opens on first server contact. Lazy opening is what
//! lets a replay-observed connection run a whole program without a server.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::client::{ServerSession, SessionFactory};
use crate::config::Config;
use crate::dictionary::StatementDict;
use crate::error::{Error, Result};
use crate::execution::{Execution, ExecutionHandle};

/// An execution slot in the connection's list. The handle is outside the
/// mutex so list scans can skip entries without locking them.
pub(crate) struct ExecutionCell {
    pub handle: ExecutionHandle,
    pub inner: Mutex<Execution>,
}

/// Owns the server session, statement dictionary and auto-commit flag
pub(crate) struct Driver {
    config: Config,
    factory: Arc<dyn SessionFactory>,
    session: Option<Box<dyn ServerSession>>,
    dict: Option<Arc<StatementDict>>,
    dict_attempted: bool,
    auto_commit: bool,
    is_open: bool,
}

impl Driver {
    pub fn new(config: Config, factory: Arc<dyn SessionFactory>) -> Driver {
        Driver {
            config,
            factory,
            session: None,
            dict: None,
            dict_attempted: false,
            auto_commit: true,
            is_open: false,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn factory(&self) -> Arc<dyn SessionFactory> {
        Arc::clone(&self.factory)
    }

    pub fn is_auto_commit(&self) -> bool {
        self.auto_commit
    }

    pub fn is_open(&self) -> bool {
        self.is_open
    }

    /// The statement dictionary, loaded and parsed on first use. A load
    /// failure is reported once at error severity and poisons the
    /// dictionary: every later call keeps failing with the same cause.
    pub fn statements(&mut self) -> Result<Arc<StatementDict>> {
        if !self.dict_attempted {
            self.dict_attempted = true;
            tracing::info!(
                conn = %self.config.name,
                "Loading SQL dictionary from {}",
                self.config.statement_path.display()
            );
            match StatementDict::load(&self.config.statement_path) {
                Ok(dict) => self.dict = Some(Arc::new(dict)),
                Err(err) => {
                    tracing::error!(conn = %self.config.name, "{}", err);
                }
            }
        }
        match &self.dict {
            Some(dict) => Ok(Arc::clone(dict)),
            None => Err(Error::CorruptDictionary(
                self.config.statement_path.display().to_string(),
            )),
        }
    }

    /// The live session, opened on first use. Idempotent after success.
    pub fn session(&mut self) -> Result<&mut dyn ServerSession> {
        if self.session.is_none() {
            self.open()?;
        }
        match self.session.as_mut() {
            Some(session) => Ok(session.as_mut()),
            None => Err(Error::NotConnected("session")),
        }
    }

    /// The live session if one is open; never connects.
    pub fn session_mut(&mut self) -> Option<&mut (dyn ServerSession + '_)> {
        match self.session.as_mut() {
            Some(session) => Some(session.as_mut()),
            None => None,
        }
    }

    /// Open the session. One-shot: a no-op once connected.
    pub fn open(&mut self) -> Result<()> {
        if self.session.is_some() {
            return Ok(());
        }
        tracing::info!(
            conn = %self.config.name,
            "Creating {}connection to {}: SQL dictionary {}, user {}, host {}",
            if self.config.async_mode { "async " } else { "" },
            self.config.database_name,
            self.config.statement_path.display(),
            self.config.user,
            self.config.host
        );
        let session = self
            .factory
            .connect(&self.config)
            .map_err(|e| Error::ServerConnectFailed {
                errno: e.errno,
                message: e.message,
            })?;
        self.session = Some(session);
        self.set_auto_commit(true)?;
        self.is_open = true;
        Ok(())
    }

    /// Toggle auto-commit on the server and mirror the local flag
    pub fn set_auto_commit(&mut self, auto_commit: bool) -> Result<()> {
        let session = self.session()?;
        session
            .set_auto_commit(auto_commit)
            .map_err(|e| Error::ServerExecuteFailed {
                context: "setting auto-commit".to_string(),
                errno: e.errno,
                message: e.message,
            })?;
        self.auto_commit = auto_commit;
        Ok(())
    }

    /// Commit the open transaction and re-enable auto-commit. Errors when no
    /// session is open or no transaction is in progress.
    pub fn commit(&mut self) -> Result<()> {
        tracing::trace!(conn = %self.config.name, "committing transaction");
        if self.session.is_none() {
            return Err(Error::NotConnected("commit"));
        }
        if self.auto_commit {
            return Err(Error::NoTransaction);
        }
        let committed = match self.session_mut() {
            Some(session) => session.commit().map_err(|e| Error::ServerExecuteFailed {
                context: "committing transaction".to_string(),
                errno: e.errno,
                message: e.message,
            }),
            None => Err(Error::NotConnected("commit")),
        };
        // Auto-commit comes back on whether or not the commit stuck.
        let restored = self.set_auto_commit(true);
        committed.and(restored)
    }

    /// Roll back the open transaction and re-enable auto-commit. A no-op
    /// when no session is open or auto-commit is already on.
    pub fn rollback(&mut self) -> Result<()> {
        if self.session.is_none() || self.auto_commit {
            return Ok(());
        }
        let rolled_back = match self.session_mut() {
            Some(session) => session.rollback().map_err(|e| Error::ServerExecuteFailed {
                context: "rolling back transaction".to_string(),
                errno: e.errno,
                message: e.message,
            }),
            None => Ok(()),
        };
        let restored = self.set_auto_commit(true);
        rolled_back.and(restored)
    }

    /// Roll back any open transaction and close the session. Idempotent.
    pub fn close(&mut self) {
        self.is_open = false;
        if let Err(err) = self.rollback() {
            tracing::warn!(conn = %self.config.name, "rollback during close failed: {}", err);
        }
        if let Some(mut session) = self.session.take() {
            session.close();
            tracing::info!(
                conn = %self.config.name,
                "Closed connection to {}",
                self.config.database_name
            );
        }
    }
}

/// Scan the execution list in reverse for a live prior execution whose
/// prepared statement can serve the current one: same statement name,
/// identical generated text, same auto-commit snapshot, and a still-owned
/// server handle. Only executions created before the current one are
/// considered.
pub(crate) fn find_live_prior_execution(
    executions: &[Arc<ExecutionCell>],
    current: &Execution,
) -> Option<Arc<ExecutionCell>> {
    for cell in executions.iter().rev() {
        if cell.handle >= current.handle() {
            continue;
        }
        let prior = cell.inner.lock();
        if prior.has_live_statement() && current.is_same_statement_as(&prior) {
            drop(prior);
            return Some(Arc::clone(cell));
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::{
        ColumnBind, ExecOutcome, Fetch, ParamBind, PreparedInfo, SessionError, SessionResult,
        StatementId,
    };
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct StubSession {
        auto_commit_calls: Vec<bool>,
        commits: usize,
        rollbacks: usize,
    }

    impl ServerSession for StubSession {
        fn prepare(&mut self, _sql: &str) -> SessionResult<PreparedInfo> {
            Ok(PreparedInfo {
                statement_id: 1,
                marker_count: 0,
                fields: Vec::new(),
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
        fn execute(&mut self, _statement: StatementId) -> SessionResult<ExecOutcome> {
            Ok(ExecOutcome::RowsAffected(0))
        }
        fn bind_result(
            &mut self,
            _statement: StatementId,
            _binds: &[ColumnBind],
        ) -> SessionResult<()> {
            Ok(())
        }
        fn fetch(&mut self, _statement: StatementId, _row: &mut [u8]) -> SessionResult<Fetch> {
            Ok(Fetch::Done)
        }
        fn fetch_column(
            &mut self,
            _statement: StatementId,
            _column: usize,
            _out: &mut [u8],
        ) -> SessionResult<()> {
            Ok(())
        }
        fn free_result(&mut self, _statement: StatementId) {}
        fn close_statement(&mut self, _statement: StatementId) {}
        fn set_auto_commit(&mut self, auto_commit: bool) -> SessionResult<()> {
            self.auto_commit_calls.push(auto_commit);
            Ok(())
        }
        fn commit(&mut self) -> SessionResult<()> {
            self.commits += 1;
            Ok(())
        }
        fn rollback(&mut self) -> SessionResult<()> {
            self.rollbacks += 1;
            Ok(())
        }
    }

    struct StubFactory {
        connects: AtomicUsize,
        refuse: bool,
    }

    impl SessionFactory for StubFactory {
        fn connect(&self, _config: &Config) -> SessionResult<Box<dyn ServerSession>> {
            self.connects.fetch_add(1, Ordering::SeqCst);
            if self.refuse {
                return Err(SessionError::new(2003, "Can't connect to server"));
            }
            Ok(Box::new(StubSession {
                auto_commit_calls: Vec::new(),
                commits: 0,
                rollbacks: 0,
            }))
        }
    }

    fn driver(refuse: bool) -> (Driver, Arc<StubFactory>) {
        let factory = Arc::new(StubFactory {
            connects: AtomicUsize::new(0),
            refuse,
        });
        let config = Config::new("test", "employees", "/nonexistent/statements.json");
        (Driver::new(config, factory.clone()), factory)
    }

    #[test]
    fn test_lazy_open_is_one_shot() {
        let (mut driver, factory) = driver(false);
        assert!(!driver.is_open());
        driver.session().unwrap();
        assert!(driver.is_open());
        driver.session().unwrap();
        driver.open().unwrap();
        assert_eq!(factory.connects.load(Ordering::SeqCst), 1);
        // connecting turns auto-commit on
        assert!(driver.is_auto_commit());
    }

    #[test]
    fn test_connect_failure_carries_errno() {
        let (mut driver, _) = driver(true);
        let err = driver.session().unwrap_err();
        assert_eq!(err.code(), 2003);
        assert!(!driver.is_open());
    }

    #[test]
    fn test_commit_requires_session_and_transaction() {
        let (mut driver, _) = driver(false);
        assert!(matches!(driver.commit().unwrap_err(), Error::NotConnected(_)));
        driver.open().unwrap();
        assert!(matches!(driver.commit().unwrap_err(), Error::NoTransaction));
        driver.set_auto_commit(false).unwrap();
        driver.commit().unwrap();
        assert!(driver.is_auto_commit());
    }

    #[test]
    fn test_rollback_is_noop_without_transaction() {
        let (mut driver, factory) = driver(false);
        // no session: nothing to do, and no connection is opened
        driver.rollback().unwrap();
        assert_eq!(factory.connects.load(Ordering::SeqCst), 0);
        driver.open().unwrap();
        driver.rollback().unwrap();
        driver.set_auto_commit(false).unwrap();
        driver.rollback().unwrap();
        assert!(driver.is_auto_commit());
    }

    #[test]
    fn test_close_idempotent() {
        let (mut driver, _) = driver(false);
        driver.open().unwrap();
        driver.close();
        assert!(!driver.is_open());
        driver.close();
    }

    #[test]
    fn test_poisoned_dictionary_keeps_failing() {
        let (mut driver, _) = driver(false);
        assert!(matches!(
            driver.statements().unwrap_err(),
            Error::CorruptDictionary(_)
        ));
        assert!(matches!(
            driver.statements().unwrap_err(),
            Error::CorruptDictionary(_)
        ));
    }
}
