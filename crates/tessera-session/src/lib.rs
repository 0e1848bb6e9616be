//! Object persistence for Tessera.
//!
//! `tessera-session` is the **unit-of-work layer**. It maps plain Rust types
//! onto tables, keeps one live object per row, and turns attribute changes
//! into SQL when flushed.
//!
//! # Role In The Architecture
//!
//! - **Mapping**: [`Mapped`] types describe their table through a
//!   [`ClassSpec`]; [`ClassInfo`] is the validated, shared form.
//! - **Store**: [`Store`] owns the objects, the identity map, the dirty set
//!   and the connection. Objects are addressed by [`Handle`].
//! - **Queries**: [`ResultSet`] is a lazy, refinable query over mapped
//!   classes and expressions.
//! - **Relationships**: [`Reference`] and [`ReferenceSet`] keep foreign keys
//!   in step with the objects they point at.
//!
//! # Design Philosophy
//!
//! - **Explicit ownership**: objects live in the store arena; handles are
//!   plain copyable ids, so there are no reference cycles to manage.
//! - **Lazy by default**: values the store cannot vouch for after a flush
//!   or commit are reloaded on first read.
//! - **Single threaded**: a store belongs to one thread at a time. Class
//!   metadata is shared across stores.
//!
//! # Example
//!
//! ```ignore
//! let mut store = Store::new(database);
//!
//! let person = store.create::<Person>()?;
//! store.set_value(person, "name", "Joe")?;
//! store.add(person)?;
//!
//! let adults = store.find::<Person>(Some(column_of::<Person>("age")?.gt(17)))?;
//! for joe in adults.handles(&mut store)? {
//!     println!("{}", store.get_value(joe, "name")?);
//! }
//!
//! store.commit()?;
//! ```

pub mod cache;
pub mod config;
pub mod database;
pub mod info;
pub mod object;
pub mod reference;
pub mod result_set;
pub mod store;

#[cfg(test)]
mod testing;

pub use cache::{Cache, GenerationalCache, ObjectCache};
pub use config::{CacheKind, DatabaseConfig, StoreConfig};
pub use database::{ConnectionState, Database};
pub use info::{ClassHook, ClassHooks, ClassInfo, ClassSpec, ColumnSpec, Mapped, column_of};
pub use object::{Handle, ObjectEvent, ObjectInfo, Pending};
pub use reference::{BoundReferenceSet, Proxy, Reference, ReferenceSet, Relation};
pub use result_set::{FindSpec, Found, ResultSet, SpecItem, replace_columns};
pub use store::{Key, Store, StoreEvent, TableSet};
