//! Error types for Tessera operations.

use std::fmt;

/// The primary error type for all Tessera operations.
#[derive(Debug)]
pub enum Error {
    /// An expression could not be compiled to SQL
    Compile(CompileError),
    /// Class mapping or property path errors
    Mapping(MappingError),
    /// NULL assigned to a non-nullable variable
    None(NoneError),
    /// Store state errors (wrong store, lost object, ordering loops, ...)
    Store(StoreError),
    /// Connection-related errors (connect, disconnect, closed)
    Connection(ConnectionError),
    /// Query execution errors reported by the driver
    Query(QueryError),
    /// Type conversion errors
    Type(TypeError),
    /// Validation errors
    Validation(ValidationError),
    /// Configuration errors (URI parsing, unknown schemes)
    Config(ConfigError),
    /// Statement budget exhausted before execution
    Timeout(TimeoutError),
    /// Serialization/deserialization errors
    Serde(String),
    /// Custom error with message
    Custom(String),
}

#[derive(Debug)]
pub struct CompileError {
    pub kind: CompileErrorKind,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompileErrorKind {
    /// No handler knows how to render the node
    Unsupported,
    /// A statement could not resolve any table
    NoTable,
    /// The expression is structurally invalid (empty statement, bad operand)
    Invalid,
}

#[derive(Debug)]
pub struct MappingError {
    pub kind: MappingErrorKind,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MappingErrorKind {
    /// Class metadata could not be derived
    ClassInfo,
    /// A property path does not name a mapped column
    PropertyPath,
}

#[derive(Debug, Clone)]
pub struct NoneError {
    pub column: Option<String>,
}

#[derive(Debug)]
pub struct StoreError {
    pub kind: StoreErrorKind,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreErrorKind {
    /// Object belongs to another store (or to none when one was required)
    WrongStore,
    /// Operation needs the object to be in a store
    NoStore,
    /// Object identity is unknown because it was never flushed
    NotFlushed,
    /// Flush ordering constraints form a cycle
    OrderLoop,
    /// `first`/`last` on a result set without ordering
    Unordered,
    /// The object's row no longer exists
    LostObject,
    /// `one` found more than one row
    NotOne,
    /// The requested combination of result set options is unsupported
    Feature,
    /// The handle refers to a collected object
    StaleHandle,
}

#[derive(Debug)]
pub struct ConnectionError {
    pub kind: ConnectionErrorKind,
    pub message: String,
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionErrorKind {
    /// Failed to establish connection
    Connect,
    /// Connection lost during operation
    Disconnected,
    /// The connection was closed by the application
    Closed,
}

#[derive(Debug)]
pub struct QueryError {
    pub kind: QueryErrorKind,
    pub sql: Option<String>,
    pub sqlstate: Option<String>,
    pub message: String,
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryErrorKind {
    /// Syntax error in SQL
    Syntax,
    /// Constraint violation (unique, foreign key, etc.)
    Constraint,
    /// Table or column not found
    NotFound,
    /// Deadlock detected
    Deadlock,
    /// Serialization failure (retry may succeed)
    Serialization,
    /// Operational failure reported by the driver
    Operational,
    /// Other database error
    Database,
}

#[derive(Debug)]
pub struct TypeError {
    pub expected: &'static str,
    pub actual: String,
    pub column: Option<String>,
}

#[derive(Debug)]
pub struct ConfigError {
    pub message: String,
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

#[derive(Debug, Clone)]
pub struct TimeoutError {
    pub statement: String,
    pub param_count: usize,
    pub message: String,
}

/// Validation error raised by column validators.
#[derive(Debug, Clone)]
pub struct ValidationError {
    /// The errors grouped by column name
    pub errors: Vec<FieldValidationError>,
}

/// A single validation error for a column.
#[derive(Debug, Clone)]
pub struct FieldValidationError {
    /// The column that failed validation
    pub field: String,
    /// The kind of validation that failed
    pub kind: ValidationErrorKind,
    /// Human-readable error message
    pub message: String,
}

/// The type of validation constraint that was violated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValidationErrorKind {
    /// Value is out of the accepted range
    Range,
    /// Value doesn't match a pattern
    Pattern,
    /// Value is not one of the accepted choices
    Choice,
    /// Custom validation failed
    Custom,
}

impl ValidationError {
    /// Create a new empty validation error container.
    pub fn new() -> Self {
        Self { errors: Vec::new() }
    }

    /// Check if there are any validation errors.
    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }

    /// Add a field validation error.
    pub fn add(
        &mut self,
        field: impl Into<String>,
        kind: ValidationErrorKind,
        message: impl Into<String>,
    ) {
        self.errors.push(FieldValidationError {
            field: field.into(),
            kind,
            message: message.into(),
        });
    }

    /// Add a custom validation error.
    pub fn add_custom(&mut self, field: impl Into<String>, message: impl Into<String>) {
        self.add(field, ValidationErrorKind::Custom, message);
    }
}

impl Default for ValidationError {
    fn default() -> Self {
        Self::new()
    }
}

impl Error {
    /// Shorthand for building a store error.
    pub fn store(kind: StoreErrorKind, message: impl Into<String>) -> Self {
        Error::Store(StoreError {
            kind,
            message: message.into(),
        })
    }

    /// Shorthand for building a connection error without a source.
    pub fn connection(kind: ConnectionErrorKind, message: impl Into<String>) -> Self {
        Error::Connection(ConnectionError {
            kind,
            message: message.into(),
            source: None,
        })
    }

    /// Shorthand for building a compile error.
    pub fn compile(kind: CompileErrorKind, message: impl Into<String>) -> Self {
        Error::Compile(CompileError {
            kind,
            message: message.into(),
        })
    }

    /// Shorthand for building a mapping error.
    pub fn mapping(kind: MappingErrorKind, message: impl Into<String>) -> Self {
        Error::Mapping(MappingError {
            kind,
            message: message.into(),
        })
    }

    /// Shorthand for building a type error.
    pub fn type_mismatch(
        expected: &'static str,
        actual: impl Into<String>,
        column: Option<&str>,
    ) -> Self {
        Error::Type(TypeError {
            expected,
            actual: actual.into(),
            column: column.map(str::to_string),
        })
    }

    /// Shorthand for building a configuration error.
    pub fn config(message: impl Into<String>) -> Self {
        Error::Config(ConfigError {
            message: message.into(),
            source: None,
        })
    }

    /// Is this a retryable error (deadlock, serialization failure)?
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Query(q) => matches!(
                q.kind,
                QueryErrorKind::Deadlock | QueryErrorKind::Serialization
            ),
            _ => false,
        }
    }

    /// Is this a connection error that likely requires reconnection?
    pub fn is_connection_error(&self) -> bool {
        match self {
            Error::Connection(c) => matches!(
                c.kind,
                ConnectionErrorKind::Connect | ConnectionErrorKind::Disconnected
            ),
            _ => false,
        }
    }

    /// Is this a lost link to the database?
    pub fn is_disconnection(&self) -> bool {
        matches!(self, Error::Connection(c) if c.kind == ConnectionErrorKind::Disconnected)
    }

    /// The store error kind, if this is a store error.
    pub fn store_kind(&self) -> Option<StoreErrorKind> {
        match self {
            Error::Store(e) => Some(e.kind),
            _ => None,
        }
    }

    /// The compile error kind, if this is a compile error.
    pub fn compile_kind(&self) -> Option<CompileErrorKind> {
        match self {
            Error::Compile(e) => Some(e.kind),
            _ => None,
        }
    }

    /// Get SQLSTATE if available (e.g., "23505" for unique violation)
    pub fn sqlstate(&self) -> Option<&str> {
        match self {
            Error::Query(q) => q.sqlstate.as_deref(),
            _ => None,
        }
    }

    /// Get the SQL that caused this error, if available
    pub fn sql(&self) -> Option<&str> {
        match self {
            Error::Query(q) => q.sql.as_deref(),
            Error::Timeout(t) => Some(t.statement.as_str()),
            _ => None,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Compile(e) => write!(f, "Compile error: {}", e),
            Error::Mapping(e) => write!(f, "Mapping error: {}", e.message),
            Error::None(e) => write!(f, "{}", e),
            Error::Store(e) => write!(f, "Store error: {}", e),
            Error::Connection(e) => write!(f, "Connection error: {}", e.message),
            Error::Query(e) => {
                if let Some(sqlstate) = &e.sqlstate {
                    write!(f, "Query error (SQLSTATE {}): {}", sqlstate, e.message)
                } else {
                    write!(f, "Query error: {}", e.message)
                }
            }
            Error::Type(e) => {
                if let Some(col) = &e.column {
                    write!(
                        f,
                        "Type error in column '{}': expected {}, found {}",
                        col, e.expected, e.actual
                    )
                } else {
                    write!(f, "Type error: expected {}, found {}", e.expected, e.actual)
                }
            }
            Error::Validation(e) => write!(f, "Validation error: {}", e),
            Error::Config(e) => write!(f, "Configuration error: {}", e.message),
            Error::Timeout(e) => write!(f, "Timeout: {}", e),
            Error::Serde(msg) => write!(f, "Serialization error: {}", msg),
            Error::Custom(msg) => write!(f, "{}", msg),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Connection(e) => e
                .source
                .as_deref()
                .map(|err| err as &(dyn std::error::Error + 'static)),
            Error::Query(e) => e
                .source
                .as_deref()
                .map(|err| err as &(dyn std::error::Error + 'static)),
            Error::Config(e) => e
                .source
                .as_deref()
                .map(|err| err as &(dyn std::error::Error + 'static)),
            _ => None,
        }
    }
}

impl fmt::Display for CompileError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            CompileErrorKind::NoTable => write!(f, "no table: {}", self.message),
            _ => write!(f, "{}", self.message),
        }
    }
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self.kind {
            StoreErrorKind::WrongStore => "wrong store",
            StoreErrorKind::NoStore => "no store",
            StoreErrorKind::NotFlushed => "not flushed",
            StoreErrorKind::OrderLoop => "flush order loop",
            StoreErrorKind::Unordered => "unordered result set",
            StoreErrorKind::LostObject => "lost object",
            StoreErrorKind::NotOne => "more than one result",
            StoreErrorKind::Feature => "unsupported feature",
            StoreErrorKind::StaleHandle => "stale handle",
        };
        write!(f, "{}: {}", label, self.message)
    }
}

impl fmt::Display for NoneError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.column {
            Some(column) => write!(f, "None isn't acceptable as a value for {}", column),
            None => write!(f, "None isn't acceptable as a value"),
        }
    }
}

impl fmt::Display for ConnectionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl fmt::Display for QueryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(sqlstate) = &self.sqlstate {
            write!(f, "{} (SQLSTATE {})", self.message, sqlstate)
        } else {
            write!(f, "{}", self.message)
        }
    }
}

impl fmt::Display for TypeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(col) = &self.column {
            write!(
                f,
                "expected {} for column '{}', found {}",
                self.expected, col, self.actual
            )
        } else {
            write!(f, "expected {}, found {}", self.expected, self.actual)
        }
    }
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl fmt::Display for TimeoutError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} (statement: {}, {} params)",
            self.message, self.statement, self.param_count
        )
    }
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.errors.is_empty() {
            write!(f, "validation passed")
        } else if self.errors.len() == 1 {
            let err = &self.errors[0];
            write!(f, "validation error on '{}': {}", err.field, err.message)
        } else {
            writeln!(f, "validation errors:")?;
            for err in &self.errors {
                writeln!(f, "  - {}: {}", err.field, err.message)?;
            }
            Ok(())
        }
    }
}

impl std::error::Error for ValidationError {}

impl From<CompileError> for Error {
    fn from(err: CompileError) -> Self {
        Error::Compile(err)
    }
}

impl From<MappingError> for Error {
    fn from(err: MappingError) -> Self {
        Error::Mapping(err)
    }
}

impl From<NoneError> for Error {
    fn from(err: NoneError) -> Self {
        Error::None(err)
    }
}

impl From<StoreError> for Error {
    fn from(err: StoreError) -> Self {
        Error::Store(err)
    }
}

impl From<ConnectionError> for Error {
    fn from(err: ConnectionError) -> Self {
        Error::Connection(err)
    }
}

impl From<QueryError> for Error {
    fn from(err: QueryError) -> Self {
        Error::Query(err)
    }
}

impl From<TypeError> for Error {
    fn from(err: TypeError) -> Self {
        Error::Type(err)
    }
}

impl From<ConfigError> for Error {
    fn from(err: ConfigError) -> Self {
        Error::Config(err)
    }
}

impl From<TimeoutError> for Error {
    fn from(err: TimeoutError) -> Self {
        Error::Timeout(err)
    }
}

impl From<ValidationError> for Error {
    fn from(err: ValidationError) -> Self {
        Error::Validation(err)
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serde(err.to_string())
    }
}

/// Result type alias for Tessera operations.
pub type Result<T> = std::result::Result<T, Error>;
