//! Statement tracers.
//!
//! A tracer observes every raw statement a database executes. Tracers are
//! installed per database, run in installation order, and may veto a
//! statement by returning an error from [`Tracer::raw_execute`].

use std::fmt;

use crate::connection::Connection;
use crate::error::{Error, Result, TimeoutError};
use crate::value::Value;

pub trait Tracer: Send {
    /// Called before the statement is sent.
    fn raw_execute(
        &mut self,
        _conn: &mut dyn Connection,
        _statement: &str,
        _params: &[Value],
    ) -> Result<()> {
        Ok(())
    }

    /// Called when the driver reported an error. Returning an error
    /// replaces the driver error.
    fn raw_execute_error(
        &mut self,
        _conn: &mut dyn Connection,
        _statement: &str,
        _params: &[Value],
        _error: &Error,
    ) -> Result<()> {
        Ok(())
    }

    /// Called after the statement succeeded.
    fn raw_execute_success(
        &mut self,
        _conn: &mut dyn Connection,
        _statement: &str,
        _params: &[Value],
    ) -> Result<()> {
        Ok(())
    }

    /// Short name used in logs and for removal by kind.
    fn name(&self) -> &'static str;
}

/// Logs every statement through `tracing` at debug level.
#[derive(Debug, Default)]
pub struct DebugTracer;

impl Tracer for DebugTracer {
    fn raw_execute(
        &mut self,
        _conn: &mut dyn Connection,
        statement: &str,
        params: &[Value],
    ) -> Result<()> {
        tracing::debug!(target: "tessera::sql", sql = %statement, params = ?params, "EXECUTE");
        Ok(())
    }

    fn raw_execute_error(
        &mut self,
        _conn: &mut dyn Connection,
        _statement: &str,
        _params: &[Value],
        error: &Error,
    ) -> Result<()> {
        tracing::debug!(target: "tessera::sql", error = %error, "ERROR");
        Ok(())
    }

    fn raw_execute_success(
        &mut self,
        _conn: &mut dyn Connection,
        _statement: &str,
        _params: &[Value],
    ) -> Result<()> {
        tracing::debug!(target: "tessera::sql", "DONE");
        Ok(())
    }

    fn name(&self) -> &'static str {
        "debug"
    }
}

/// Enforces a time budget on every statement.
///
/// Before each statement the remaining budget is asked from the supplied
/// function. An exhausted budget fails the statement with a timeout error;
/// otherwise the driver's statement timeout is adjusted when the budget
/// grew, or shrank by at least `granularity` seconds since the last
/// adjustment.
pub struct TimeoutTracer {
    granularity: f64,
    remaining_time: Box<dyn FnMut() -> f64 + Send>,
    last_remaining: f64,
}

impl TimeoutTracer {
    /// Default adjustment granularity, in seconds.
    pub const DEFAULT_GRANULARITY: f64 = 5.0;

    pub fn new(remaining_time: impl FnMut() -> f64 + Send + 'static) -> Self {
        Self {
            granularity: Self::DEFAULT_GRANULARITY,
            remaining_time: Box::new(remaining_time),
            last_remaining: 0.0,
        }
    }

    #[must_use]
    pub fn with_granularity(mut self, granularity: f64) -> Self {
        self.granularity = granularity;
        self
    }

    fn timeout(statement: &str, params: &[Value], message: &str) -> Error {
        Error::Timeout(TimeoutError {
            statement: statement.to_string(),
            param_count: params.len(),
            message: message.to_string(),
        })
    }
}

impl Tracer for TimeoutTracer {
    fn raw_execute(
        &mut self,
        conn: &mut dyn Connection,
        statement: &str,
        params: &[Value],
    ) -> Result<()> {
        let remaining = (self.remaining_time)();
        if remaining <= 0.0 {
            return Err(Self::timeout(statement, params, "no time left for statement"));
        }
        if remaining > self.last_remaining
            || self.last_remaining - remaining >= self.granularity
        {
            tracing::trace!(remaining, "adjusting statement timeout");
            conn.set_statement_timeout(remaining)?;
            self.last_remaining = remaining;
        }
        Ok(())
    }

    fn raw_execute_error(
        &mut self,
        conn: &mut dyn Connection,
        statement: &str,
        params: &[Value],
        error: &Error,
    ) -> Result<()> {
        if conn.is_timeout_error(error) {
            return Err(Self::timeout(statement, params, "statement timed out"));
        }
        Ok(())
    }

    fn name(&self) -> &'static str {
        "timeout"
    }
}

impl fmt::Debug for TimeoutTracer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TimeoutTracer")
            .field("granularity", &self.granularity)
            .field("last_remaining", &self.last_remaining)
            .finish_non_exhaustive()
    }
}
