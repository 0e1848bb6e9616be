//! Core types and traits for Tessera.
//!
//! This crate provides the foundational abstractions shared by the query
//! compiler and the store:
//!
//! - [`Value`], [`Row`] and [`QueryResult`] for data crossing the driver boundary
//! - [`Variable`] and [`VariableKind`] for typed, change-tracked value slots
//! - [`Expr`] and the statement types for dialect-neutral SQL trees
//! - [`Connection`] for drivers, [`Tracer`] for statement observers
//! - [`Uri`] for connection strings, [`EventSystem`] for named hooks
//! - [`Error`], the error taxonomy used across the workspace

pub mod connection;
pub mod error;
pub mod event;
pub mod expr;
pub mod kind;
pub mod row;
pub mod tracer;
pub mod uri;
pub mod value;
pub mod variable;

pub use connection::Connection;
pub use error::{
    CompileError, CompileErrorKind, ConfigError, ConnectionError, ConnectionErrorKind, Error,
    FieldValidationError, MappingError, MappingErrorKind, NoneError, QueryError, QueryErrorKind,
    Result, StoreError, StoreErrorKind, TimeoutError, TypeError, ValidationError,
    ValidationErrorKind,
};
pub use event::{EventSystem, HookFlow, HookId};
pub use expr::{
    Alias, BinaryOp, Column, CompoundOp, Delete, Expr, Insert, Join, JoinKind, PrefixOp, Select,
    SetExpr, SetOp, SuffixOp, Update, compare_columns,
};
pub use kind::{EnumMap, VariableKind};
pub use row::{ColumnInfo, QueryResult, Row};
pub use tracer::{DebugTracer, TimeoutTracer, Tracer};
pub use uri::Uri;
pub use value::Value;
pub use variable::{
    Field, LazyValue, Validator, Validators, Variable, VariableChange, VariableFactory,
    VariableState,
};
