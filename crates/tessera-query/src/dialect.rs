//! Dialect hooks and parameter styles.
//!
//! A [`Dialect`] customizes compilation without forking the compiler: it
//! may claim any node through [`Dialect::compile_node`], override node
//! precedence, extend the reserved words and describe how a driver wants
//! its placeholders and generated keys.

use std::borrow::Cow;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tessera_core::{Column, Error, Expr, Result, Variable, compare_columns};

use crate::compile::Compiler;
use crate::reserved::ReservedWords;
use crate::state::State;

/// Placeholder syntax expected by a driver.
///
/// Statements are always compiled with `?` marks and converted once, right
/// before execution.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParamStyle {
    /// `?`
    #[default]
    Qmark,
    /// `$1`, `$2`, ...
    Numbered,
    /// `?1`, `?2`, ...
    NumberedQmark,
    /// `%s`
    Format,
}

impl ParamStyle {
    /// The placeholder for the parameter at 1-based `index`.
    pub fn placeholder(self, index: usize) -> String {
        match self {
            ParamStyle::Qmark => "?".to_string(),
            ParamStyle::Numbered => format!("${index}"),
            ParamStyle::NumberedQmark => format!("?{index}"),
            ParamStyle::Format => "%s".to_string(),
        }
    }

    /// Rewrite the `?` marks of `sql` into this style.
    ///
    /// Marks inside single-quoted literals are left alone.
    pub fn convert(self, sql: &str) -> Cow<'_, str> {
        if self == ParamStyle::Qmark || !sql.contains('?') {
            return Cow::Borrowed(sql);
        }
        let mut out = String::with_capacity(sql.len() + 8);
        let mut quoted = false;
        let mut index = 0;
        for c in sql.chars() {
            match c {
                '\'' => {
                    quoted = !quoted;
                    out.push(c);
                }
                '?' if !quoted => {
                    index += 1;
                    out.push_str(&self.placeholder(index));
                }
                _ => out.push(c),
            }
        }
        Cow::Owned(out)
    }
}

impl fmt::Display for ParamStyle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ParamStyle::Qmark => "qmark",
            ParamStyle::Numbered => "numbered",
            ParamStyle::NumberedQmark => "numbered_qmark",
            ParamStyle::Format => "format",
        })
    }
}

impl FromStr for ParamStyle {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "qmark" => Ok(ParamStyle::Qmark),
            "numbered" => Ok(ParamStyle::Numbered),
            "numbered_qmark" => Ok(ParamStyle::NumberedQmark),
            "format" => Ok(ParamStyle::Format),
            other => Err(Error::config(format!("unknown parameter style: {other:?}"))),
        }
    }
}

/// Database-specific compilation hooks.
///
/// Every method has a default matching generic SQL, so an implementation
/// only overrides what its database does differently.
///
/// # Example
///
/// ```rust,ignore
/// struct Postgres;
///
/// impl Dialect for Postgres {
///     fn name(&self) -> &str {
///         "postgres"
///     }
///
///     fn compile_node(&self, compiler: &Compiler<'_>, expr: &Expr, state: &mut State)
///         -> Option<Result<String>>
///     {
///         match expr {
///             Expr::Sequence(name) => Some(Ok(format!("nextval('{name}')"))),
///             _ => None,
///         }
///     }
/// }
/// ```
pub trait Dialect: Send + Sync {
    fn name(&self) -> &str;

    fn param_style(&self) -> ParamStyle {
        ParamStyle::Qmark
    }

    /// Tokens that are reserved words get quoted.
    fn is_reserved_word(&self, word: &str) -> bool {
        crate::reserved::is_sql92_reserved(word)
    }

    /// Override the precedence of a node. `None` keeps the default.
    fn precedence(&self, _expr: &Expr) -> Option<u32> {
        None
    }

    /// Compile `expr` instead of the default handler.
    ///
    /// Return `None` to decline. An implementation can still reuse the
    /// default rendering of a node through [`Compiler::compile_default`].
    fn compile_node(
        &self,
        _compiler: &Compiler<'_>,
        _expr: &Expr,
        _state: &mut State,
    ) -> Option<Result<String>> {
        None
    }

    /// Fill primary-key variables before an INSERT, for databases that
    /// hand out keys ahead of time.
    fn preset_primary_key(&self, _columns: &[Column], _variables: &mut [Variable]) -> Result<()> {
        Ok(())
    }

    /// A condition selecting the row an INSERT just created.
    ///
    /// The default keys undefined primary-key columns on the driver's last
    /// insert id, which identifies at most one generated column.
    fn insert_identity(
        &self,
        columns: &[Column],
        variables: &[Variable],
        last_insert_id: Option<i64>,
    ) -> Option<Expr> {
        let mut generated = last_insert_id;
        let mut values = Vec::with_capacity(variables.len());
        for variable in variables {
            if variable.value().is_some() {
                values.push(Expr::Param(variable.clone()));
            } else {
                values.push(Expr::from(generated.take()?));
            }
        }
        compare_columns(columns, values)
    }
}

/// Generic SQL with a configurable placeholder style and reserved words.
#[derive(Debug, Clone, Default)]
pub struct GenericDialect {
    param_style: ParamStyle,
    reserved: ReservedWords,
}

impl GenericDialect {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_param_style(mut self, style: ParamStyle) -> Self {
        self.param_style = style;
        self
    }

    /// Quote these words in addition to the SQL-92 list.
    #[must_use]
    pub fn with_reserved_words<I, S>(mut self, words: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.reserved.add(words);
        self
    }
}

impl Dialect for GenericDialect {
    fn name(&self) -> &str {
        "generic"
    }

    fn param_style(&self) -> ParamStyle {
        self.param_style
    }

    fn is_reserved_word(&self, word: &str) -> bool {
        self.reserved.contains(word)
    }
}
