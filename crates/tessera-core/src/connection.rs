//! The driver-facing connection trait.
//!
//! A [`Connection`] is the raw link to a database. It executes one
//! statement at a time, already rendered in the driver's placeholder style,
//! and reports rows, row counts and generated identities through
//! [`QueryResult`]. Everything above it (compilation, identity mapping,
//! flushing) lives in the other crates.

use crate::error::{ConnectionError, ConnectionErrorKind, Error, Result};
use crate::row::{QueryResult, Row};
use crate::value::Value;
use crate::variable::Variable;

/// A synchronous database connection.
///
/// Only [`execute`](Connection::execute), [`commit`](Connection::commit)
/// and [`rollback`](Connection::rollback) are required; the remaining
/// methods have defaults suitable for drivers without the capability.
///
/// # Example
///
/// ```rust,ignore
/// let mut result = conn.execute("SELECT id FROM person WHERE age > ?", &[Value::BigInt(21)])?;
/// while let Some(row) = result.get_one() {
///     println!("{:?}", row.get(0));
/// }
/// conn.commit()?;
/// ```
pub trait Connection: Send {
    /// Execute one statement and return its result.
    fn execute(&mut self, sql: &str, params: &[Value]) -> Result<QueryResult>;

    /// Commit the current transaction.
    fn commit(&mut self) -> Result<()>;

    /// Roll back the current transaction.
    fn rollback(&mut self) -> Result<()>;

    /// Release the underlying link.
    fn close(&mut self) -> Result<()> {
        Ok(())
    }

    /// Re-establish a link that was lost.
    fn reconnect(&mut self) -> Result<()> {
        Err(Error::Connection(ConnectionError {
            kind: ConnectionErrorKind::Connect,
            message: "this driver cannot reconnect".to_string(),
            source: None,
        }))
    }

    /// Does this driver error mean the link is gone?
    fn is_disconnection_error(&self, error: &Error) -> bool {
        error.is_disconnection()
    }

    /// Does this driver error mean the statement hit its timeout?
    fn is_timeout_error(&self, _error: &Error) -> bool {
        false
    }

    /// Limit the run time of subsequent statements.
    fn set_statement_timeout(&mut self, _seconds: f64) -> Result<()> {
        Ok(())
    }

    /// Convert statement parameters to their wire values.
    ///
    /// Undefined or lazy parameters are sent as NULL.
    fn to_database(&self, params: &[Variable]) -> Result<Vec<Value>> {
        params
            .iter()
            .map(|param| Ok(param.get(true)?.unwrap_or(Value::Null)))
            .collect()
    }

    /// Adjust a fetched row before the store parses it.
    fn from_database(&self, row: Row) -> Row {
        row
    }
}

impl<C: Connection + ?Sized> Connection for Box<C> {
    fn execute(&mut self, sql: &str, params: &[Value]) -> Result<QueryResult> {
        (**self).execute(sql, params)
    }

    fn commit(&mut self) -> Result<()> {
        (**self).commit()
    }

    fn rollback(&mut self) -> Result<()> {
        (**self).rollback()
    }

    fn close(&mut self) -> Result<()> {
        (**self).close()
    }

    fn reconnect(&mut self) -> Result<()> {
        (**self).reconnect()
    }

    fn is_disconnection_error(&self, error: &Error) -> bool {
        (**self).is_disconnection_error(error)
    }

    fn is_timeout_error(&self, error: &Error) -> bool {
        (**self).is_timeout_error(error)
    }

    fn set_statement_timeout(&mut self, seconds: f64) -> Result<()> {
        (**self).set_statement_timeout(seconds)
    }

    fn to_database(&self, params: &[Variable]) -> Result<Vec<Value>> {
        (**self).to_database(params)
    }

    fn from_database(&self, row: Row) -> Row {
        (**self).from_database(row)
    }
}
