//! Tessera - object-relational persistence with an identity-mapped store.
//!
//! Tessera maps plain Rust types onto tables and tracks changes to the
//! objects it hands out:
//!
//! - A typed SQL expression tree compiled per dialect
//! - Typed variables with lazy values and change tracking
//! - An identity-mapped store with a unit of work and flush ordering
//! - References that keep foreign keys in step with related objects
//! - Object caches that keep recently used objects alive
//!
//! # Quick Start
//!
//! ```ignore
//! use tessera::prelude::*;
//!
//! struct Person;
//!
//! impl Mapped for Person {
//!     fn class_spec() -> ClassSpec {
//!         ClassSpec::new("person")
//!             .column("id", ColumnSpec::int().primary())
//!             .column("name", ColumnSpec::text())
//!             .column("age", ColumnSpec::int())
//!     }
//! }
//!
//! fn example(database: Database) -> Result<()> {
//!     let mut store = Store::from_database(database)?;
//!
//!     // Insert
//!     let joe = store.create::<Person>()?;
//!     store.set_value(joe, "name", "Joe")?;
//!     store.add(joe)?;
//!     store.flush()?;
//!     let id = store.get_value(joe, "id")?;
//!
//!     // Query
//!     let age = column_of::<Person>("age")?;
//!     let adults = store.find::<Person>(Some(age.gt(17)))?;
//!     println!("{} adults", adults.count(&mut store, None, false)?);
//!
//!     // Delete
//!     store.remove(joe)?;
//!     store.commit()
//! }
//! ```
//!
//! # Features
//!
//! - **Explicit ownership**: objects live in a store arena and are named by
//!   copyable handles
//! - **Deferred writes**: nothing reaches the database before a flush, and
//!   flushes honor declared ordering
//! - **Dialect hooks**: compilation can be overridden per expression kind
//! - **Scheme registry**: drivers register under a URI scheme

pub use tessera_core::{
    Alias, BinaryOp, Column, CompoundOp, Connection, DebugTracer, Delete, Error, EventSystem,
    Expr, Field, HookFlow, HookId, Insert, Join, JoinKind, LazyValue, PrefixOp, QueryResult,
    Result, Row, Select, SetExpr, SetOp, StoreErrorKind, SuffixOp, TimeoutTracer, Tracer, Update,
    Uri, Validator, Value, Variable, VariableChange, VariableFactory, VariableKind,
    compare_columns,
};

pub use tessera_query::{Compiled, Compiler, Dialect, GenericDialect, ParamStyle, compile};

pub use tessera_session::{
    BoundReferenceSet, Cache, CacheKind, ClassHook, ClassHooks, ClassInfo, ClassSpec, ColumnSpec,
    ConnectionState, Database, DatabaseConfig, FindSpec, Found, GenerationalCache, Handle, Key,
    Mapped, ObjectCache, ObjectEvent, Pending, Proxy, Reference, ReferenceSet, Relation,
    ResultSet, SpecItem, Store, StoreConfig, StoreEvent, TableSet, column_of,
};

mod registry;
pub use registry::{
    DatabaseFactory, create_database, has_scheme, register_scheme, unregister_scheme,
};

/// Open a database from `uri` and build a store configured by its options.
pub fn create_store(uri: &str) -> Result<Store> {
    Store::from_database(create_database(uri)?)
}

/// Prelude module for convenient imports.
///
/// ```ignore
/// use tessera::prelude::*;
/// ```
pub mod prelude {
    pub use crate::{
        // Mapping
        ClassHooks,
        ClassSpec,
        ColumnSpec,
        Mapped,
        column_of,
        // Expressions
        Column,
        Delete,
        Expr,
        Insert,
        Select,
        Update,
        // Store
        Database,
        Found,
        Handle,
        Key,
        Proxy,
        Reference,
        ReferenceSet,
        ResultSet,
        Store,
        // Values
        Connection,
        Error,
        Field,
        LazyValue,
        Result,
        Value,
        // Setup
        create_database,
        create_store,
        register_scheme,
    };
}
