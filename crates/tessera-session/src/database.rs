//! A driver connection wrapped with compilation, tracing and link state.
//!
//! [`Database`] is what a [`Store`](crate::Store) talks to. It compiles
//! expressions with its dialect, converts `?` marks to the driver's
//! placeholder style, runs installed tracers around every raw statement,
//! and tracks whether the link is usable.

use std::fmt;
use std::sync::Arc;

use tessera_core::{
    Connection, ConnectionErrorKind, DebugTracer, Error, Expr, QueryResult, Result, Row, Tracer,
    Uri, Value,
};
use tessera_query::{Compiled, Compiler, Dialect, GenericDialect, ParamStyle};

use crate::config::DatabaseConfig;

/// Link state of a [`Database`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connected,
    /// The link was lost. Statements fail until a rollback schedules a
    /// reconnect.
    Disconnected,
    /// The next statement reconnects first.
    Reconnect,
}

pub struct Database {
    connection: Box<dyn Connection>,
    dialect: Arc<dyn Dialect>,
    tracers: Vec<Box<dyn Tracer>>,
    state: ConnectionState,
    closed: bool,
    config: DatabaseConfig,
    uri: Option<Uri>,
}

impl Database {
    /// Wrap a connection using the generic dialect.
    pub fn new(connection: impl Connection + 'static) -> Self {
        Self {
            connection: Box::new(connection),
            dialect: Arc::new(GenericDialect::new()),
            tracers: Vec::new(),
            state: ConnectionState::Connected,
            closed: false,
            config: DatabaseConfig::default(),
            uri: None,
        }
    }

    #[must_use]
    pub fn with_dialect(mut self, dialect: Arc<dyn Dialect>) -> Self {
        self.dialect = dialect;
        self
    }

    /// Apply a configuration. `debug` installs a [`DebugTracer`].
    #[must_use]
    pub fn with_config(mut self, config: DatabaseConfig) -> Self {
        if config.debug && !self.tracers.iter().any(|t| t.name() == "debug") {
            self.tracers.push(Box::new(DebugTracer));
        }
        self.config = config;
        self
    }

    /// Remember the URI this database was created from and apply its
    /// options.
    pub fn with_uri(self, uri: Uri) -> Result<Self> {
        let config = DatabaseConfig::from_uri(&uri)?;
        let mut database = self.with_config(config);
        database.uri = Some(uri);
        Ok(database)
    }

    pub fn uri(&self) -> Option<&Uri> {
        self.uri.as_ref()
    }

    pub fn dialect(&self) -> &dyn Dialect {
        self.dialect.as_ref()
    }

    pub fn config(&self) -> &DatabaseConfig {
        &self.config
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Placeholder style statements are sent in.
    pub fn param_style(&self) -> ParamStyle {
        self.config
            .param_style
            .unwrap_or_else(|| self.dialect.param_style())
    }

    // ========================================================================
    // Tracers
    // ========================================================================

    pub fn install_tracer(&mut self, tracer: impl Tracer + 'static) {
        self.tracers.push(Box::new(tracer));
    }

    /// Remove every tracer with the given name. Returns how many were
    /// removed.
    pub fn remove_tracer(&mut self, name: &str) -> usize {
        let before = self.tracers.len();
        self.tracers.retain(|t| t.name() != name);
        before - self.tracers.len()
    }

    pub fn tracer_names(&self) -> Vec<&'static str> {
        self.tracers.iter().map(|t| t.name()).collect()
    }

    // ========================================================================
    // Execution
    // ========================================================================

    pub fn compile(&self, expr: &Expr) -> Result<Compiled> {
        Compiler::new(self.dialect.as_ref()).compile(expr)
    }

    /// Compile and run one statement.
    pub fn execute(&mut self, expr: &Expr) -> Result<QueryResult> {
        self.ensure_connected()?;
        let compiled = self.compile(expr)?;
        let params = self.connection.to_database(&compiled.params)?;
        let style = self.param_style();
        let sql = style.convert(&compiled.sql).into_owned();
        self.raw_execute(&sql, &params)
    }

    /// Run SQL text as-is. `?` marks are still converted.
    pub fn execute_sql(&mut self, sql: &str, params: &[Value]) -> Result<QueryResult> {
        self.ensure_connected()?;
        let style = self.param_style();
        let sql = style.convert(sql).into_owned();
        self.raw_execute(&sql, params)
    }

    fn raw_execute(&mut self, sql: &str, params: &[Value]) -> Result<QueryResult> {
        tracing::debug!(sql = %sql, params = params.len(), "Executing statement");
        for tracer in &mut self.tracers {
            tracer.raw_execute(self.connection.as_mut(), sql, params)?;
        }
        match self.connection.execute(sql, params) {
            Ok(mut result) => {
                for tracer in &mut self.tracers {
                    tracer.raw_execute_success(self.connection.as_mut(), sql, params)?;
                }
                let rowcount = result.rowcount();
                let last_insert_id = result.last_insert_id();
                let rows: Vec<Row> = result
                    .get_all()
                    .into_iter()
                    .map(|row| self.connection.from_database(row))
                    .collect();
                let mut converted = QueryResult::from_rows(rows);
                if let Some(count) = rowcount {
                    converted = converted.with_rowcount(count);
                }
                if let Some(id) = last_insert_id {
                    converted = converted.with_last_insert_id(id);
                }
                Ok(converted)
            }
            Err(error) => {
                for tracer in &mut self.tracers {
                    tracer.raw_execute_error(self.connection.as_mut(), sql, params, &error)?;
                }
                Err(self.check_disconnect(error))
            }
        }
    }

    // ========================================================================
    // Transactions
    // ========================================================================

    pub fn commit(&mut self) -> Result<()> {
        self.ensure_connected()?;
        self.connection
            .commit()
            .map_err(|error| self.check_disconnect(error))
    }

    /// Roll back the transaction.
    ///
    /// A lost link is not an error here: the rollback happened implicitly,
    /// and the next statement reconnects.
    pub fn rollback(&mut self) -> Result<()> {
        if self.closed {
            return Err(Self::closed_error());
        }
        if self.state == ConnectionState::Connected {
            if let Err(error) = self.connection.rollback() {
                let error = self.check_disconnect(error);
                if !error.is_disconnection() {
                    return Err(error);
                }
                tracing::debug!(error = %error, "Link lost during rollback");
            }
        }
        if self.state == ConnectionState::Disconnected {
            self.state = ConnectionState::Reconnect;
        }
        Ok(())
    }

    pub fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        tracing::debug!("Closing database");
        self.connection.close()
    }

    // ========================================================================
    // Link state
    // ========================================================================

    fn closed_error() -> Error {
        Error::connection(ConnectionErrorKind::Closed, "Connection is closed")
    }

    fn ensure_connected(&mut self) -> Result<()> {
        if self.closed {
            return Err(Self::closed_error());
        }
        match self.state {
            ConnectionState::Connected => Ok(()),
            ConnectionState::Disconnected => Err(Error::connection(
                ConnectionErrorKind::Disconnected,
                "Already disconnected",
            )),
            ConnectionState::Reconnect => match self.connection.reconnect() {
                Ok(()) => {
                    tracing::info!("Reconnected");
                    self.state = ConnectionState::Connected;
                    Ok(())
                }
                Err(error) => {
                    self.state = ConnectionState::Disconnected;
                    Err(Error::connection(
                        ConnectionErrorKind::Disconnected,
                        error.to_string(),
                    ))
                }
            },
        }
    }

    /// Turn a driver-classified disconnection into a `Disconnected` error
    /// and record the lost link.
    fn check_disconnect(&mut self, error: Error) -> Error {
        if self.connection.is_disconnection_error(&error) {
            tracing::warn!(error = %error, "Database link lost");
            self.state = ConnectionState::Disconnected;
            if error.is_disconnection() {
                return error;
            }
            return Error::connection(ConnectionErrorKind::Disconnected, error.to_string());
        }
        error
    }
}

impl fmt::Debug for Database {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Database")
            .field("dialect", &self.dialect.name())
            .field("state", &self.state)
            .field("closed", &self.closed)
            .field("tracers", &self.tracer_names())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use tessera_core::{Column, Select};

    #[derive(Default)]
    struct LinkState {
        executed: Vec<(String, Vec<Value>)>,
        fail_next: Option<&'static str>,
        rollbacks: usize,
        reconnects: usize,
        reconnect_fails: bool,
    }

    struct FlakyConnection {
        state: Arc<Mutex<LinkState>>,
    }

    impl Connection for FlakyConnection {
        fn execute(&mut self, sql: &str, params: &[Value]) -> Result<QueryResult> {
            let mut state = self.state.lock().unwrap();
            if let Some(message) = state.fail_next.take() {
                return Err(Error::Custom(message.to_string()));
            }
            state.executed.push((sql.to_string(), params.to_vec()));
            Ok(QueryResult::from_rows(vec![Row::from_values(vec![Value::Int(1)])]))
        }

        fn commit(&mut self) -> Result<()> {
            Ok(())
        }

        fn rollback(&mut self) -> Result<()> {
            let mut state = self.state.lock().unwrap();
            state.rollbacks += 1;
            if let Some(message) = state.fail_next.take() {
                return Err(Error::Custom(message.to_string()));
            }
            Ok(())
        }

        fn reconnect(&mut self) -> Result<()> {
            let mut state = self.state.lock().unwrap();
            state.reconnects += 1;
            if state.reconnect_fails {
                return Err(Error::connection(ConnectionErrorKind::Connect, "refused"));
            }
            Ok(())
        }

        fn is_disconnection_error(&self, error: &Error) -> bool {
            matches!(error, Error::Custom(msg) if msg == "server closed the connection")
        }
    }

    fn database() -> (Database, Arc<Mutex<LinkState>>) {
        let state = Arc::new(Mutex::new(LinkState::default()));
        let db = Database::new(FlakyConnection {
            state: Arc::clone(&state),
        });
        (db, state)
    }

    #[test]
    fn converts_param_marks_to_driver_style() {
        let (db, state) = database();
        let mut db = db.with_config(DatabaseConfig {
            param_style: Some(ParamStyle::Numbered),
            debug: false,
        });
        let age = Column::of("person", "age");
        let select = Select::new([Column::of("person", "name")])
            .filter(age.gt(21).and(age.lt(65)));
        db.execute(&select.into()).unwrap();
        let executed = &state.lock().unwrap().executed;
        assert_eq!(
            executed[0].0,
            "SELECT person.name FROM person WHERE person.age > $1 AND person.age < $2"
        );
        assert_eq!(executed[0].1, vec![Value::Int(21), Value::Int(65)]);
    }

    #[test]
    fn disconnection_moves_through_reconnect() {
        let (mut db, state) = database();
        state.lock().unwrap().fail_next = Some("server closed the connection");
        let err = db.execute_sql("SELECT 1", &[]).unwrap_err();
        assert!(err.is_disconnection());
        assert_eq!(db.state(), ConnectionState::Disconnected);

        let err = db.execute_sql("SELECT 1", &[]).unwrap_err();
        assert!(err.to_string().contains("Already disconnected"));

        db.rollback().unwrap();
        assert_eq!(db.state(), ConnectionState::Reconnect);
        assert_eq!(state.lock().unwrap().rollbacks, 0);

        db.execute_sql("SELECT 1", &[]).unwrap();
        assert_eq!(db.state(), ConnectionState::Connected);
        assert_eq!(state.lock().unwrap().reconnects, 1);
    }

    #[test]
    fn failed_reconnect_stays_disconnected() {
        let (mut db, state) = database();
        state.lock().unwrap().fail_next = Some("server closed the connection");
        assert!(db.commit().is_ok());
        assert!(db.execute_sql("SELECT 1", &[]).is_err());
        db.rollback().unwrap();
        state.lock().unwrap().reconnect_fails = true;
        let err = db.execute_sql("SELECT 1", &[]).unwrap_err();
        assert!(err.is_disconnection());
        assert_eq!(db.state(), ConnectionState::Disconnected);
    }

    #[test]
    fn rollback_swallows_lost_link() {
        let (mut db, state) = database();
        state.lock().unwrap().fail_next = Some("server closed the connection");
        db.rollback().unwrap();
        assert_eq!(db.state(), ConnectionState::Reconnect);

        db.execute_sql("SELECT 1", &[]).unwrap();
        state.lock().unwrap().fail_next = Some("deadlock");
        let err = db.rollback().unwrap_err();
        assert!(matches!(err, Error::Custom(ref msg) if msg == "deadlock"));
    }

    #[test]
    fn closed_database_rejects_statements() {
        let (mut db, _) = database();
        db.close().unwrap();
        let err = db.execute_sql("SELECT 1", &[]).unwrap_err();
        assert!(matches!(
            err,
            Error::Connection(ref e) if e.kind == ConnectionErrorKind::Closed
        ));
        assert!(db.rollback().is_err());
    }

    struct Veto;

    impl Tracer for Veto {
        fn raw_execute(
            &mut self,
            _conn: &mut dyn Connection,
            statement: &str,
            _params: &[Value],
        ) -> Result<()> {
            if statement.starts_with("DELETE") {
                return Err(Error::Custom("vetoed".to_string()));
            }
            Ok(())
        }

        fn name(&self) -> &'static str {
            "veto"
        }
    }

    #[test]
    fn tracers_can_veto_and_be_removed() {
        let (mut db, state) = database();
        db.install_tracer(Veto);
        assert!(db.execute_sql("DELETE FROM person", &[]).is_err());
        assert!(state.lock().unwrap().executed.is_empty());
        assert_eq!(db.remove_tracer("veto"), 1);
        db.execute_sql("DELETE FROM person", &[]).unwrap();
        assert_eq!(state.lock().unwrap().executed.len(), 1);
    }

    #[test]
    fn uri_options_configure_database() {
        let (db, _) = database();
        let db = db
            .with_uri(Uri::parse("mock:db?param_style=numbered_qmark&debug=true").unwrap())
            .unwrap();
        assert_eq!(db.param_style(), ParamStyle::NumberedQmark);
        assert_eq!(db.tracer_names(), vec!["debug"]);
        assert_eq!(db.uri().unwrap().scheme, "mock");
    }
}
