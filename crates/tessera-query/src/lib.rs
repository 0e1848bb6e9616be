//! SQL compiler for Tessera.
//!
//! `tessera-query` turns the dialect-neutral [`Expr`](tessera_core::Expr)
//! trees of `tessera-core` into SQL text plus an ordered parameter list.
//!
//! # Role In The Architecture
//!
//! - **Compiler**: [`Compiler`] renders statements, resolves FROM clauses
//!   from the columns they mention and parenthesizes by precedence.
//! - **Dialects**: [`Dialect`] lets a database override single nodes,
//!   reserved words and placeholder style without forking the compiler.
//! - **State**: [`State`] carries parameters, auto tables and the current
//!   context through one compilation.
//!
//! The store in `tessera-session` compiles every statement it issues
//! through this crate.
//!
//! # Example
//!
//! ```rust,ignore
//! let name = Column::of("person", "name");
//! let age = Column::of("person", "age");
//! let select = Select::new([name.clone()])
//!     .filter(age.gt(21))
//!     .order_by([name.desc()])
//!     .limit(5);
//! let compiled = Compiler::default().compile(&select.into())?;
//! assert_eq!(
//!     compiled.sql,
//!     "SELECT person.name FROM person WHERE person.age > ? ORDER BY person.name DESC LIMIT 5"
//! );
//! ```

pub mod compile;
pub mod dialect;
pub mod reserved;
pub mod state;

pub use compile::{Compiled, Compiler, default_precedence};
pub use dialect::{Dialect, GenericDialect, ParamStyle};
pub use reserved::{ReservedWords, is_sql92_reserved};
pub use state::{Context, HALF_STEP, MAX_PRECEDENCE, State};

use tessera_core::{Expr, Result};

/// Compile `expr` with the generic dialect.
pub fn compile(expr: &Expr) -> Result<Compiled> {
    Compiler::default().compile(expr)
}
