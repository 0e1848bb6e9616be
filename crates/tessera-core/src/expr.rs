//! Dialect-neutral SQL expression trees.
//!
//! Expressions are plain data. They are rendered to SQL by the compiler in
//! `tessera-query`, which walks the tree with a default exhaustive match and
//! lets a dialect override individual nodes.
//!
//! Literal operands become [`Expr::Param`] nodes holding a [`Variable`], so a
//! value is never interpolated into the SQL text. Comparing against a
//! [`Column`] types the literal with the column's own variable factory.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{NaiveDate, NaiveDateTime, NaiveTime, TimeDelta};

use crate::kind::VariableKind;
use crate::value::Value;
use crate::variable::{Variable, VariableFactory};

// ==================== Operators ====================

/// Binary operators rendered as `left OP right`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Eq,
    Ne,
    Gt,
    Ge,
    Lt,
    Le,
    LShift,
    RShift,
    Sub,
    Div,
    Mod,
}

impl BinaryOp {
    pub const fn as_str(self) -> &'static str {
        match self {
            BinaryOp::Eq => " = ",
            BinaryOp::Ne => " != ",
            BinaryOp::Gt => " > ",
            BinaryOp::Ge => " >= ",
            BinaryOp::Lt => " < ",
            BinaryOp::Le => " <= ",
            BinaryOp::LShift => "<<",
            BinaryOp::RShift => ">>",
            BinaryOp::Sub => "-",
            BinaryOp::Div => "/",
            BinaryOp::Mod => "%",
        }
    }

    /// Operators whose right operand needs parentheses at equal precedence.
    pub const fn is_non_associative(self) -> bool {
        matches!(self, BinaryOp::Sub | BinaryOp::Div | BinaryOp::Mod)
    }
}

/// Operators that join any number of operands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompoundOp {
    And,
    Or,
    Add,
    Mul,
}

impl CompoundOp {
    pub const fn as_str(self) -> &'static str {
        match self {
            CompoundOp::And => " AND ",
            CompoundOp::Or => " OR ",
            CompoundOp::Add => "+",
            CompoundOp::Mul => "*",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrefixOp {
    Not,
    Exists,
    Neg,
}

impl PrefixOp {
    pub const fn as_str(self) -> &'static str {
        match self {
            PrefixOp::Not => "NOT",
            PrefixOp::Exists => "EXISTS",
            PrefixOp::Neg => "-",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SuffixOp {
    Asc,
    Desc,
}

impl SuffixOp {
    pub const fn as_str(self) -> &'static str {
        match self {
            SuffixOp::Asc => "ASC",
            SuffixOp::Desc => "DESC",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinKind {
    Inner,
    Left,
    Right,
    Natural,
    NaturalLeft,
    NaturalRight,
}

impl JoinKind {
    pub const fn as_str(self) -> &'static str {
        match self {
            JoinKind::Inner => "JOIN",
            JoinKind::Left => "LEFT JOIN",
            JoinKind::Right => "RIGHT JOIN",
            JoinKind::Natural => "NATURAL JOIN",
            JoinKind::NaturalLeft => "NATURAL LEFT JOIN",
            JoinKind::NaturalRight => "NATURAL RIGHT JOIN",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetOp {
    Union,
    Except,
    Intersect,
}

impl SetOp {
    pub const fn as_str(self) -> &'static str {
        match self {
            SetOp::Union => " UNION ",
            SetOp::Except => " EXCEPT ",
            SetOp::Intersect => " INTERSECT ",
        }
    }
}

// ==================== Expression tree ====================

/// A SQL expression.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Select(Box<Select>),
    Insert(Box<Insert>),
    Update(Box<Update>),
    Delete(Box<Delete>),
    SetExpr(Box<SetExpr>),

    Column(Column),
    /// Table reference by name
    Table(String),
    Alias(Alias),
    Join(Box<Join>),

    /// Bound parameter, rendered as a placeholder
    Param(Variable),
    /// The NULL literal
    Null,

    Binary {
        op: BinaryOp,
        left: Box<Expr>,
        right: Box<Expr>,
    },
    Like {
        expr: Box<Expr>,
        pattern: Box<Expr>,
        escape: Option<Box<Expr>>,
        /// `Some(false)` asks dialects that support it for a case
        /// insensitive match.
        case_sensitive: Option<bool>,
    },
    /// `expr IN (values)`, where values is a list or a subquery
    In {
        expr: Box<Expr>,
        values: Box<Expr>,
    },
    Compound {
        op: CompoundOp,
        exprs: Vec<Expr>,
    },
    Func {
        name: String,
        args: Vec<Expr>,
    },
    /// `COUNT(*)` when `expr` is absent
    Count {
        expr: Option<Box<Expr>>,
        distinct: bool,
    },
    Prefix {
        op: PrefixOp,
        expr: Box<Expr>,
    },
    Suffix {
        op: SuffixOp,
        expr: Box<Expr>,
    },

    /// SQL text emitted verbatim
    Raw(String),
    /// SQL text with its own parameters and tables
    Sql {
        sql: String,
        params: Vec<Variable>,
        tables: Vec<Expr>,
    },
    /// A single SQL token, quoted when needed
    Token(String),
    /// Next value of a database sequence
    Sequence(String),
    /// Compiles `expr` and then registers `tables` as auto tables
    AutoTables {
        expr: Box<Expr>,
        tables: Vec<Expr>,
        replace: bool,
    },
    /// Comma separated expressions
    List(Vec<Expr>),
    /// Dialect extension point
    Custom {
        name: String,
        args: Vec<Expr>,
    },
}

impl Expr {
    // ==================== Constructors ====================

    pub fn table(name: impl Into<String>) -> Self {
        Expr::Table(name.into())
    }

    pub fn raw(sql: impl Into<String>) -> Self {
        Expr::Raw(sql.into())
    }

    pub fn token(token: impl Into<String>) -> Self {
        Expr::Token(token.into())
    }

    pub fn null() -> Self {
        Expr::Null
    }

    /// Raw SQL carrying its own parameters and tables.
    pub fn sql(sql: impl Into<String>, params: Vec<Variable>, tables: Vec<Expr>) -> Self {
        Expr::Sql {
            sql: sql.into(),
            params,
            tables,
        }
    }

    /// A literal parameter holding `value` untyped.
    pub fn param(value: impl Into<Value>) -> Self {
        match value.into() {
            Value::Null => Expr::Null,
            value => Expr::Param(Variable::any(value)),
        }
    }

    pub fn list<I, T>(items: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<Expr>,
    {
        Expr::List(items.into_iter().map(Into::into).collect())
    }

    pub fn func<I, T>(name: impl Into<String>, args: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<Expr>,
    {
        Expr::Func {
            name: name.into(),
            args: args.into_iter().map(Into::into).collect(),
        }
    }

    pub fn count_star() -> Self {
        Expr::Count {
            expr: None,
            distinct: false,
        }
    }

    pub fn coalesce<I, T>(args: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<Expr>,
    {
        Expr::func("COALESCE", args)
    }

    pub fn exists(select: impl Into<Expr>) -> Self {
        Expr::Prefix {
            op: PrefixOp::Exists,
            expr: Box::new(select.into()),
        }
    }

    pub fn custom<I, T>(name: impl Into<String>, args: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<Expr>,
    {
        Expr::Custom {
            name: name.into(),
            args: args.into_iter().map(Into::into).collect(),
        }
    }

    /// AND all conditions together. Returns `None` for an empty input.
    pub fn and_all<I, T>(exprs: I) -> Option<Self>
    where
        I: IntoIterator<Item = T>,
        T: Into<Expr>,
    {
        exprs.into_iter().map(Into::into).reduce(Expr::and)
    }

    pub fn or_all<I, T>(exprs: I) -> Option<Self>
    where
        I: IntoIterator<Item = T>,
        T: Into<Expr>,
    {
        exprs.into_iter().map(Into::into).reduce(Expr::or)
    }

    fn binary(self, op: BinaryOp, other: impl Into<Expr>) -> Self {
        Expr::Binary {
            op,
            left: Box::new(self),
            right: Box::new(other.into()),
        }
    }

    fn compound(self, op: CompoundOp, other: impl Into<Expr>) -> Self {
        let other = other.into();
        match self {
            Expr::Compound { op: existing, mut exprs } if existing == op => {
                exprs.push(other);
                Expr::Compound { op, exprs }
            }
            this => Expr::Compound {
                op,
                exprs: vec![this, other],
            },
        }
    }

    fn named_func(self, name: &str) -> Self {
        Expr::Func {
            name: name.to_string(),
            args: vec![self],
        }
    }

    // ==================== Comparison Operators ====================

    /// Equal to (=). Comparing with NULL renders `IS NULL`.
    pub fn eq(self, other: impl Into<Expr>) -> Self {
        self.binary(BinaryOp::Eq, other)
    }

    /// Not equal to (!=). Comparing with NULL renders `IS NOT NULL`.
    pub fn ne(self, other: impl Into<Expr>) -> Self {
        self.binary(BinaryOp::Ne, other)
    }

    pub fn gt(self, other: impl Into<Expr>) -> Self {
        self.binary(BinaryOp::Gt, other)
    }

    pub fn ge(self, other: impl Into<Expr>) -> Self {
        self.binary(BinaryOp::Ge, other)
    }

    pub fn lt(self, other: impl Into<Expr>) -> Self {
        self.binary(BinaryOp::Lt, other)
    }

    pub fn le(self, other: impl Into<Expr>) -> Self {
        self.binary(BinaryOp::Le, other)
    }

    pub fn lshift(self, other: impl Into<Expr>) -> Self {
        self.binary(BinaryOp::LShift, other)
    }

    pub fn rshift(self, other: impl Into<Expr>) -> Self {
        self.binary(BinaryOp::RShift, other)
    }

    /// `self IN (values)`. An empty list yields a constant false.
    pub fn is_in<I, T>(self, values: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<Expr>,
    {
        let values: Vec<Expr> = values.into_iter().map(Into::into).collect();
        if values.is_empty() {
            return Expr::from(false);
        }
        Expr::In {
            expr: Box::new(self),
            values: Box::new(Expr::List(values)),
        }
    }

    /// `self IN (subquery)`.
    pub fn in_query(self, query: impl Into<Expr>) -> Self {
        Expr::In {
            expr: Box::new(self),
            values: Box::new(query.into()),
        }
    }

    // ==================== Pattern Matching ====================

    pub fn like(self, pattern: impl Into<Expr>) -> Self {
        Expr::Like {
            expr: Box::new(self),
            pattern: Box::new(pattern.into()),
            escape: None,
            case_sensitive: None,
        }
    }

    pub fn like_escape(self, pattern: impl Into<Expr>, escape: impl Into<Expr>) -> Self {
        Expr::Like {
            expr: Box::new(self),
            pattern: Box::new(pattern.into()),
            escape: Some(Box::new(escape.into())),
            case_sensitive: None,
        }
    }

    /// Case insensitive LIKE, for dialects that support it.
    pub fn ilike(self, pattern: impl Into<Expr>) -> Self {
        Expr::Like {
            expr: Box::new(self),
            pattern: Box::new(pattern.into()),
            escape: None,
            case_sensitive: Some(false),
        }
    }

    pub fn startswith(self, prefix: &str) -> Self {
        self.like_escape(format!("{}%", escape_like(prefix)), "!")
    }

    pub fn endswith(self, suffix: &str) -> Self {
        self.like_escape(format!("%{}", escape_like(suffix)), "!")
    }

    pub fn contains_string(self, substring: &str) -> Self {
        self.like_escape(format!("%{}%", escape_like(substring)), "!")
    }

    // ==================== Logical Operators ====================

    pub fn and(self, other: impl Into<Expr>) -> Self {
        self.compound(CompoundOp::And, other)
    }

    pub fn or(self, other: impl Into<Expr>) -> Self {
        self.compound(CompoundOp::Or, other)
    }

    #[allow(clippy::should_implement_trait)]
    pub fn not(self) -> Self {
        Expr::Prefix {
            op: PrefixOp::Not,
            expr: Box::new(self),
        }
    }

    // ==================== Arithmetic ====================

    #[allow(clippy::should_implement_trait)]
    pub fn add(self, other: impl Into<Expr>) -> Self {
        self.compound(CompoundOp::Add, other)
    }

    #[allow(clippy::should_implement_trait)]
    pub fn sub(self, other: impl Into<Expr>) -> Self {
        self.binary(BinaryOp::Sub, other)
    }

    #[allow(clippy::should_implement_trait)]
    pub fn mul(self, other: impl Into<Expr>) -> Self {
        self.compound(CompoundOp::Mul, other)
    }

    #[allow(clippy::should_implement_trait)]
    pub fn div(self, other: impl Into<Expr>) -> Self {
        self.binary(BinaryOp::Div, other)
    }

    pub fn modulo(self, other: impl Into<Expr>) -> Self {
        self.binary(BinaryOp::Mod, other)
    }

    #[allow(clippy::should_implement_trait)]
    pub fn neg(self) -> Self {
        Expr::Prefix {
            op: PrefixOp::Neg,
            expr: Box::new(self),
        }
    }

    // ==================== Ordering ====================

    pub fn asc(self) -> Self {
        Expr::Suffix {
            op: SuffixOp::Asc,
            expr: Box::new(self),
        }
    }

    pub fn desc(self) -> Self {
        Expr::Suffix {
            op: SuffixOp::Desc,
            expr: Box::new(self),
        }
    }

    // ==================== Functions ====================

    pub fn count(self) -> Self {
        Expr::Count {
            expr: Some(Box::new(self)),
            distinct: false,
        }
    }

    pub fn count_distinct(self) -> Self {
        Expr::Count {
            expr: Some(Box::new(self)),
            distinct: true,
        }
    }

    pub fn max(self) -> Self {
        self.named_func("MAX")
    }

    pub fn min(self) -> Self {
        self.named_func("MIN")
    }

    pub fn avg(self) -> Self {
        self.named_func("AVG")
    }

    pub fn sum(self) -> Self {
        self.named_func("SUM")
    }

    pub fn lower(self) -> Self {
        self.named_func("LOWER")
    }

    pub fn upper(self) -> Self {
        self.named_func("UPPER")
    }

    // ==================== Aliases ====================

    pub fn alias(self, name: impl Into<String>) -> Self {
        Expr::Alias(Alias::new(self, name))
    }

    /// Register extra auto tables after compiling this expression.
    pub fn with_auto_tables(self, tables: Vec<Expr>, replace: bool) -> Self {
        Expr::AutoTables {
            expr: Box::new(self),
            tables,
            replace,
        }
    }

    // ==================== Inspection ====================

    pub fn is_null(&self) -> bool {
        matches!(self, Expr::Null)
    }

    pub fn as_column(&self) -> Option<&Column> {
        match self {
            Expr::Column(c) => Some(c),
            _ => None,
        }
    }

    /// Is this a join whose left side is implied by the surrounding FROM?
    pub fn is_half_join(&self) -> bool {
        matches!(self, Expr::Join(j) if j.left.is_none())
    }
}

/// Escape LIKE wildcards with `!`.
fn escape_like(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        if matches!(c, '!' | '_' | '%') {
            out.push('!');
        }
        out.push(c);
    }
    out
}

// ==================== Columns ====================

#[derive(Debug)]
struct ColumnInner {
    name: String,
    table: Option<Expr>,
    primary: u32,
    factory: VariableFactory,
}

/// A column of some table.
///
/// Columns are cheap to clone and share one description. Comparison methods
/// take `&self` and type literal operands with the column's factory.
#[derive(Clone)]
pub struct Column(Arc<ColumnInner>);

impl Column {
    /// An untyped column with no table.
    pub fn new(name: impl Into<String>) -> Self {
        Self::build(name, None, 0, VariableFactory::any())
    }

    /// An untyped column of the named table.
    pub fn of(table: impl Into<String>, name: impl Into<String>) -> Self {
        Self::build(name, Some(Expr::table(table)), 0, VariableFactory::any())
    }

    /// A fully described column. `primary` is the 1-based position in the
    /// primary key, or 0.
    pub fn build(
        name: impl Into<String>,
        table: Option<Expr>,
        primary: u32,
        factory: VariableFactory,
    ) -> Self {
        Self(Arc::new(ColumnInner {
            name: name.into(),
            table,
            primary,
            factory,
        }))
    }

    pub fn name(&self) -> &str {
        &self.0.name
    }

    pub fn table(&self) -> Option<&Expr> {
        self.0.table.as_ref()
    }

    pub fn primary(&self) -> u32 {
        self.0.primary
    }

    pub fn is_primary(&self) -> bool {
        self.0.primary > 0
    }

    pub fn factory(&self) -> &VariableFactory {
        &self.0.factory
    }

    /// Do both handles share the same description?
    pub fn ptr_eq(&self, other: &Column) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    fn expr(&self) -> Expr {
        Expr::Column(self.clone())
    }

    /// Type an untyped literal with this column's variable factory.
    ///
    /// Literals the column's kind rejects are left untyped.
    pub fn operand(&self, other: impl Into<Expr>) -> Expr {
        let other = other.into();
        if *self.0.factory.kind() == VariableKind::Any {
            return other;
        }
        let typed = match &other {
            Expr::Param(var) if *var.kind() == VariableKind::Any => var
                .value()
                .and_then(|value| self.0.factory.param(value.clone()).ok()),
            _ => None,
        };
        typed.map_or(other, Expr::Param)
    }

    // ==================== Comparison Operators ====================

    pub fn eq(&self, other: impl Into<Expr>) -> Expr {
        self.expr().eq(self.operand(other))
    }

    pub fn ne(&self, other: impl Into<Expr>) -> Expr {
        self.expr().ne(self.operand(other))
    }

    pub fn gt(&self, other: impl Into<Expr>) -> Expr {
        self.expr().gt(self.operand(other))
    }

    pub fn ge(&self, other: impl Into<Expr>) -> Expr {
        self.expr().ge(self.operand(other))
    }

    pub fn lt(&self, other: impl Into<Expr>) -> Expr {
        self.expr().lt(self.operand(other))
    }

    pub fn le(&self, other: impl Into<Expr>) -> Expr {
        self.expr().le(self.operand(other))
    }

    pub fn is_in<I, T>(&self, values: I) -> Expr
    where
        I: IntoIterator<Item = T>,
        T: Into<Expr>,
    {
        let values: Vec<Expr> = values.into_iter().map(|v| self.operand(v)).collect();
        self.expr().is_in(values)
    }

    pub fn like(&self, pattern: impl Into<Expr>) -> Expr {
        self.expr().like(self.operand(pattern))
    }

    pub fn startswith(&self, prefix: &str) -> Expr {
        self.expr().startswith(prefix)
    }

    pub fn endswith(&self, suffix: &str) -> Expr {
        self.expr().endswith(suffix)
    }

    pub fn contains_string(&self, substring: &str) -> Expr {
        self.expr().contains_string(substring)
    }

    // ==================== Arithmetic ====================

    pub fn add(&self, other: impl Into<Expr>) -> Expr {
        self.expr().add(self.operand(other))
    }

    pub fn sub(&self, other: impl Into<Expr>) -> Expr {
        self.expr().sub(self.operand(other))
    }

    pub fn mul(&self, other: impl Into<Expr>) -> Expr {
        self.expr().mul(self.operand(other))
    }

    pub fn div(&self, other: impl Into<Expr>) -> Expr {
        self.expr().div(self.operand(other))
    }

    pub fn modulo(&self, other: impl Into<Expr>) -> Expr {
        self.expr().modulo(self.operand(other))
    }

    pub fn neg(&self) -> Expr {
        self.expr().neg()
    }

    // ==================== Ordering and functions ====================

    pub fn asc(&self) -> Expr {
        self.expr().asc()
    }

    pub fn desc(&self) -> Expr {
        self.expr().desc()
    }

    pub fn lower(&self) -> Expr {
        self.expr().lower()
    }

    pub fn upper(&self) -> Expr {
        self.expr().upper()
    }

    pub fn count(&self) -> Expr {
        self.expr().count()
    }

    pub fn max(&self) -> Expr {
        self.expr().max()
    }

    pub fn min(&self) -> Expr {
        self.expr().min()
    }
}

impl PartialEq for Column {
    fn eq(&self, other: &Self) -> bool {
        self.ptr_eq(other)
            || (self.0.name == other.0.name
                && self.0.primary == other.0.primary
                && self.0.table == other.0.table)
    }
}

impl fmt::Debug for Column {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.0.table {
            Some(Expr::Table(table)) => write!(f, "Column({table}.{})", self.0.name),
            Some(other) => write!(f, "Column({other:?}.{})", self.0.name),
            None => write!(f, "Column({})", self.0.name),
        }
    }
}

/// `Eq(column, value)` for a single column, or the AND of one `Eq` per
/// column. Returns `None` when there are no columns.
pub fn compare_columns<I, T>(columns: &[Column], values: I) -> Option<Expr>
where
    I: IntoIterator<Item = T>,
    T: Into<Expr>,
{
    let equals: Vec<Expr> = columns
        .iter()
        .zip(values)
        .map(|(column, value)| column.eq(value))
        .collect();
    match equals.len() {
        0 => None,
        1 => equals.into_iter().next(),
        _ => Some(Expr::Compound {
            op: CompoundOp::And,
            exprs: equals,
        }),
    }
}

// ==================== Aliases and joins ====================

static ALIAS_COUNTER: AtomicU64 = AtomicU64::new(0);

/// `expr AS name`.
#[derive(Debug, Clone, PartialEq)]
pub struct Alias {
    pub expr: Box<Expr>,
    pub name: String,
}

impl Alias {
    pub fn new(expr: impl Into<Expr>, name: impl Into<String>) -> Self {
        Self {
            expr: Box::new(expr.into()),
            name: name.into(),
        }
    }

    /// An alias with a generated, process-unique name.
    pub fn auto(expr: impl Into<Expr>) -> Self {
        let n = ALIAS_COUNTER.fetch_add(1, Ordering::Relaxed) + 1;
        Self::new(expr, format!("_{n:x}"))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Join {
    pub kind: JoinKind,
    /// Absent for a half join, whose left side is the preceding FROM clause
    pub left: Option<Expr>,
    pub right: Expr,
    pub on: Option<Expr>,
}

impl Join {
    pub fn new(kind: JoinKind, left: impl Into<Expr>, right: impl Into<Expr>) -> Self {
        Self {
            kind,
            left: Some(left.into()),
            right: right.into(),
            on: None,
        }
    }

    /// A join that only names its right side.
    pub fn half(kind: JoinKind, right: impl Into<Expr>) -> Self {
        Self {
            kind,
            left: None,
            right: right.into(),
            on: None,
        }
    }

    #[must_use]
    pub fn on(mut self, condition: impl Into<Expr>) -> Self {
        self.on = Some(condition.into());
        self
    }
}

// ==================== Statements ====================

fn collect<I, T>(items: I) -> Vec<Expr>
where
    I: IntoIterator<Item = T>,
    T: Into<Expr>,
{
    items.into_iter().map(Into::into).collect()
}

/// A SELECT statement.
///
/// Tables are resolved in order: explicit `tables`, then the tables of the
/// columns referenced anywhere in the statement, then `default_tables`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Select {
    pub columns: Vec<Expr>,
    pub where_clause: Option<Expr>,
    pub tables: Option<Vec<Expr>>,
    pub default_tables: Option<Vec<Expr>>,
    pub order_by: Vec<Expr>,
    pub group_by: Vec<Expr>,
    pub having: Option<Expr>,
    pub limit: Option<u64>,
    pub offset: Option<u64>,
    pub distinct: bool,
}

impl Select {
    pub fn new<I, T>(columns: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<Expr>,
    {
        Self {
            columns: collect(columns),
            ..Self::default()
        }
    }

    /// Add a WHERE condition, ANDed with any existing one.
    #[must_use]
    pub fn filter(mut self, condition: impl Into<Expr>) -> Self {
        let condition = condition.into();
        self.where_clause = Some(match self.where_clause.take() {
            Some(existing) => existing.and(condition),
            None => condition,
        });
        self
    }

    #[must_use]
    pub fn tables<I, T>(mut self, tables: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<Expr>,
    {
        self.tables = Some(collect(tables));
        self
    }

    #[must_use]
    pub fn default_tables<I, T>(mut self, tables: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<Expr>,
    {
        self.default_tables = Some(collect(tables));
        self
    }

    #[must_use]
    pub fn order_by<I, T>(mut self, order: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<Expr>,
    {
        self.order_by = collect(order);
        self
    }

    #[must_use]
    pub fn group_by<I, T>(mut self, group: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<Expr>,
    {
        self.group_by = collect(group);
        self
    }

    #[must_use]
    pub fn having(mut self, condition: impl Into<Expr>) -> Self {
        self.having = Some(condition.into());
        self
    }

    #[must_use]
    pub fn limit(mut self, n: u64) -> Self {
        self.limit = Some(n);
        self
    }

    #[must_use]
    pub fn offset(mut self, n: u64) -> Self {
        self.offset = Some(n);
        self
    }

    #[must_use]
    pub fn distinct(mut self, distinct: bool) -> Self {
        self.distinct = distinct;
        self
    }
}

/// An INSERT of one row.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Insert {
    pub map: Vec<(Column, Expr)>,
    pub table: Option<Expr>,
    pub default_table: Option<Expr>,
    /// Primary key hint for dialects that fetch generated keys
    pub primary_columns: Vec<Column>,
    pub primary_variables: Vec<Variable>,
}

impl Insert {
    pub fn new(map: Vec<(Column, Expr)>) -> Self {
        Self {
            map,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn table(mut self, table: impl Into<Expr>) -> Self {
        self.table = Some(table.into());
        self
    }

    #[must_use]
    pub fn default_table(mut self, table: impl Into<Expr>) -> Self {
        self.default_table = Some(table.into());
        self
    }

    #[must_use]
    pub fn primary(mut self, columns: Vec<Column>, variables: Vec<Variable>) -> Self {
        self.primary_columns = columns;
        self.primary_variables = variables;
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Update {
    pub map: Vec<(Column, Expr)>,
    pub where_clause: Option<Expr>,
    pub table: Option<Expr>,
    pub default_table: Option<Expr>,
}

impl Update {
    pub fn new(map: Vec<(Column, Expr)>) -> Self {
        Self {
            map,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn filter(mut self, condition: impl Into<Expr>) -> Self {
        let condition = condition.into();
        self.where_clause = Some(match self.where_clause.take() {
            Some(existing) => existing.and(condition),
            None => condition,
        });
        self
    }

    #[must_use]
    pub fn table(mut self, table: impl Into<Expr>) -> Self {
        self.table = Some(table.into());
        self
    }

    #[must_use]
    pub fn default_table(mut self, table: impl Into<Expr>) -> Self {
        self.default_table = Some(table.into());
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Delete {
    pub where_clause: Option<Expr>,
    pub table: Option<Expr>,
    pub default_table: Option<Expr>,
}

impl Delete {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn filter(mut self, condition: impl Into<Expr>) -> Self {
        let condition = condition.into();
        self.where_clause = Some(match self.where_clause.take() {
            Some(existing) => existing.and(condition),
            None => condition,
        });
        self
    }

    #[must_use]
    pub fn table(mut self, table: impl Into<Expr>) -> Self {
        self.table = Some(table.into());
        self
    }

    #[must_use]
    pub fn default_table(mut self, table: impl Into<Expr>) -> Self {
        self.default_table = Some(table.into());
        self
    }
}

/// UNION, EXCEPT or INTERSECT of several queries.
#[derive(Debug, Clone, PartialEq)]
pub struct SetExpr {
    pub op: SetOp,
    pub exprs: Vec<Expr>,
    pub all: bool,
    pub order_by: Vec<Expr>,
    pub limit: Option<u64>,
    pub offset: Option<u64>,
}

impl SetExpr {
    /// Combine queries. A leading operand of the same operation is
    /// flattened into this one when it carries no limit or offset.
    pub fn new<I, T>(op: SetOp, exprs: I, all: bool) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<Expr>,
    {
        let mut exprs = collect(exprs);
        if let Some(Expr::SetExpr(first)) = exprs.first() {
            if first.op == op && first.all == all && first.limit.is_none() && first.offset.is_none()
            {
                let rest = exprs.split_off(1);
                if let Some(Expr::SetExpr(first)) = exprs.pop() {
                    exprs = first.exprs;
                    exprs.extend(rest);
                }
            }
        }
        Self {
            op,
            exprs,
            all,
            order_by: Vec::new(),
            limit: None,
            offset: None,
        }
    }

    pub fn union<I, T>(exprs: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<Expr>,
    {
        Self::new(SetOp::Union, exprs, false)
    }

    pub fn except<I, T>(exprs: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<Expr>,
    {
        Self::new(SetOp::Except, exprs, false)
    }

    pub fn intersect<I, T>(exprs: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<Expr>,
    {
        Self::new(SetOp::Intersect, exprs, false)
    }

    #[must_use]
    pub fn order_by<I, T>(mut self, order: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<Expr>,
    {
        self.order_by = collect(order);
        self
    }

    #[must_use]
    pub fn limit(mut self, n: u64) -> Self {
        self.limit = Some(n);
        self
    }

    #[must_use]
    pub fn offset(mut self, n: u64) -> Self {
        self.offset = Some(n);
        self
    }
}

// ==================== Conversions ====================

impl From<Column> for Expr {
    fn from(column: Column) -> Self {
        Expr::Column(column)
    }
}

impl From<&Column> for Expr {
    fn from(column: &Column) -> Self {
        Expr::Column(column.clone())
    }
}

impl From<Select> for Expr {
    fn from(select: Select) -> Self {
        Expr::Select(Box::new(select))
    }
}

impl From<Insert> for Expr {
    fn from(insert: Insert) -> Self {
        Expr::Insert(Box::new(insert))
    }
}

impl From<Update> for Expr {
    fn from(update: Update) -> Self {
        Expr::Update(Box::new(update))
    }
}

impl From<Delete> for Expr {
    fn from(delete: Delete) -> Self {
        Expr::Delete(Box::new(delete))
    }
}

impl From<SetExpr> for Expr {
    fn from(set: SetExpr) -> Self {
        Expr::SetExpr(Box::new(set))
    }
}

impl From<Alias> for Expr {
    fn from(alias: Alias) -> Self {
        Expr::Alias(alias)
    }
}

impl From<Join> for Expr {
    fn from(join: Join) -> Self {
        Expr::Join(Box::new(join))
    }
}

impl From<Variable> for Expr {
    fn from(variable: Variable) -> Self {
        Expr::Param(variable)
    }
}

impl From<Value> for Expr {
    fn from(value: Value) -> Self {
        Expr::param(value)
    }
}

impl<T: Into<Expr>> From<Option<T>> for Expr {
    fn from(value: Option<T>) -> Self {
        value.map_or(Expr::Null, Into::into)
    }
}

macro_rules! literal_from {
    ($($t:ty),* $(,)?) => {
        $(
            impl From<$t> for Expr {
                fn from(v: $t) -> Self {
                    Expr::param(Value::from(v))
                }
            }
        )*
    };
}

literal_from!(
    bool,
    i8,
    i16,
    i32,
    i64,
    f32,
    f64,
    String,
    &str,
    uuid::Uuid,
    serde_json::Value,
    NaiveDateTime,
    NaiveDate,
    NaiveTime,
    TimeDelta,
);

// ==================== Tests ====================
