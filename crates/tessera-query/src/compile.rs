//! The expression compiler.
//!
//! [`Compiler`] walks an [`Expr`] tree and renders SQL with `?` marks,
//! collecting one [`Variable`] per mark. Each node is first offered to the
//! dialect; nodes it declines are rendered by [`Compiler::compile_default`].
//!
//! Nesting is handled entirely through precedence: every node sets the
//! current precedence to its own while it renders, and a node whose
//! precedence is lower than its parent's is wrapped in parentheses.

use std::collections::{BTreeSet, HashSet};
use std::sync::OnceLock;

use regex::Regex;
use tessera_core::{
    Alias, BinaryOp, Column, CompileErrorKind, CompoundOp, Delete, Error, Expr, Insert, Join,
    Result, Select, SetExpr, Update, Variable,
};

use crate::dialect::{Dialect, GenericDialect};
use crate::state::{Context, HALF_STEP, MAX_PRECEDENCE, State};

/// A compiled statement.
#[derive(Debug, Clone, PartialEq)]
pub struct Compiled {
    pub sql: String,
    pub params: Vec<Variable>,
}

/// Default precedence of a node, scaled by ten.
pub fn default_precedence(expr: &Expr) -> u32 {
    match expr {
        Expr::Select(_)
        | Expr::Insert(_)
        | Expr::Update(_)
        | Expr::Delete(_)
        | Expr::SetExpr(_)
        | Expr::Join(_) => 100,
        Expr::Sql { .. } => 200,
        Expr::Compound { op, .. } => match op {
            CompoundOp::Or => 300,
            CompoundOp::And => 400,
            CompoundOp::Add => 700,
            CompoundOp::Mul => 800,
        },
        Expr::Binary { op, .. } => match op {
            BinaryOp::Eq
            | BinaryOp::Ne
            | BinaryOp::Gt
            | BinaryOp::Ge
            | BinaryOp::Lt
            | BinaryOp::Le => 500,
            BinaryOp::LShift | BinaryOp::RShift => 600,
            BinaryOp::Sub => 700,
            BinaryOp::Div | BinaryOp::Mod => 800,
        },
        Expr::Like { .. } | Expr::In { .. } => 500,
        _ => MAX_PRECEDENCE,
    }
}

fn safe_token_regex() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[a-zA-Z][a-zA-Z0-9_]*$").ok())
        .as_ref()
}

fn no_table() -> Error {
    Error::compile(CompileErrorKind::NoTable, "Couldn't find any tables")
}

static GENERIC: OnceLock<GenericDialect> = OnceLock::new();

/// Renders expressions for one dialect.
#[derive(Clone, Copy)]
pub struct Compiler<'d> {
    dialect: &'d dyn Dialect,
}

impl Default for Compiler<'static> {
    fn default() -> Self {
        Self::new(GENERIC.get_or_init(GenericDialect::new))
    }
}

impl<'d> Compiler<'d> {
    pub fn new(dialect: &'d dyn Dialect) -> Self {
        Self { dialect }
    }

    pub fn dialect(&self) -> &'d dyn Dialect {
        self.dialect
    }

    /// Compile a whole statement with a fresh state.
    pub fn compile(&self, expr: &Expr) -> Result<Compiled> {
        let mut state = State::new();
        let sql = self.compile_expr(expr, &mut state)?;
        tracing::trace!(sql = %sql, params = state.parameters.len(), "compiled statement");
        Ok(Compiled {
            sql,
            params: state.parameters,
        })
    }

    /// Compile `expr` inside an enclosing node.
    ///
    /// The current precedence of `state` is the enclosing precedence, and
    /// is restored afterwards.
    pub fn compile_expr(&self, expr: &Expr, state: &mut State) -> Result<String> {
        let outer = state.precedence;
        let statement = match expr {
            Expr::List(items) => self.compile_list(items, state, ", "),
            _ => self.compile_single(expr, state, outer),
        };
        state.precedence = outer;
        statement
    }

    /// Compile every item under the current precedence, joined by `sep`.
    pub fn compile_list(&self, items: &[Expr], state: &mut State, sep: &str) -> Result<String> {
        let outer = state.precedence;
        let mut compiled = Vec::with_capacity(items.len());
        for item in items {
            let statement = match item {
                Expr::List(nested) => {
                    state.precedence = outer;
                    self.compile_list(nested, state, sep)?
                }
                _ => self.compile_single(item, state, outer)?,
            };
            compiled.push(statement);
        }
        state.precedence = outer;
        Ok(compiled.join(sep))
    }

    fn compile_single(&self, expr: &Expr, state: &mut State, outer: u32) -> Result<String> {
        let inner = self.precedence(expr);
        state.precedence = inner;
        let statement = match self.dialect.compile_node(self, expr, state) {
            Some(result) => result?,
            None => self.compile_default(expr, state)?,
        };
        if inner < outer {
            Ok(format!("({statement})"))
        } else {
            Ok(statement)
        }
    }

    pub fn precedence(&self, expr: &Expr) -> u32 {
        self.dialect
            .precedence(expr)
            .unwrap_or_else(|| default_precedence(expr))
    }

    /// Quote `token` unless it is a plain identifier and not reserved.
    pub fn token(&self, token: &str) -> String {
        let safe = safe_token_regex().is_some_and(|re| re.is_match(token));
        if safe && !self.dialect.is_reserved_word(token) {
            token.to_string()
        } else {
            format!("\"{}\"", token.replace('"', "\"\""))
        }
    }

    /// The dialect-neutral rendering of one node, without parentheses.
    pub fn compile_default(&self, expr: &Expr, state: &mut State) -> Result<String> {
        match expr {
            Expr::Select(select) => self.compile_select(select, state),
            Expr::Insert(insert) => self.compile_insert(insert, state),
            Expr::Update(update) => self.compile_update(update, state),
            Expr::Delete(delete) => self.compile_delete(delete, state),
            Expr::SetExpr(set) => self.compile_set_expr(set, state),
            Expr::Column(column) => self.compile_column(column, state),
            Expr::Table(name) => Ok(self.token(name)),
            Expr::Alias(alias) => self.compile_alias(alias, state),
            Expr::Join(join) => self.compile_join(join, state),
            Expr::Param(variable) => {
                state.parameters.push(variable.clone());
                Ok("?".to_string())
            }
            Expr::Null => Ok("NULL".to_string()),
            Expr::Binary { op, left, right } => self.compile_binary(*op, left, right, state),
            Expr::Like {
                expr,
                pattern,
                escape,
                ..
            } => {
                let mut statement = format!(
                    "{} LIKE {}",
                    self.compile_expr(expr, state)?,
                    self.compile_expr(pattern, state)?
                );
                if let Some(escape) = escape {
                    statement.push_str(" ESCAPE ");
                    statement.push_str(&self.compile_expr(escape, state)?);
                }
                Ok(statement)
            }
            Expr::In { expr, values } => {
                let left = self.compile_expr(expr, state)?;
                state.precedence = 0;
                Ok(format!("{left} IN ({})", self.compile_expr(values, state)?))
            }
            Expr::Compound { op, exprs } => self.compile_list(exprs, state, op.as_str()),
            Expr::Func { name, args } => {
                let previous = state.enter(Context::Expr);
                let args = self.compile_list(args, state, ", ");
                state.restore_context(previous);
                Ok(format!("{name}({})", args?))
            }
            Expr::Count { expr, distinct } => {
                let Some(expr) = expr else {
                    return Ok("COUNT(*)".to_string());
                };
                let previous = state.enter(Context::Expr);
                let column = self.compile_expr(expr, state);
                state.restore_context(previous);
                if *distinct {
                    Ok(format!("COUNT(DISTINCT {})", column?))
                } else {
                    Ok(format!("COUNT({})", column?))
                }
            }
            Expr::Prefix { op, expr } => {
                Ok(format!("{} {}", op.as_str(), self.compile_expr(expr, state)?))
            }
            Expr::Suffix { op, expr } => {
                Ok(format!("{} {}", self.compile_expr(expr, state)?, op.as_str()))
            }
            Expr::Raw(sql) => Ok(sql.clone()),
            Expr::Sql {
                sql,
                params,
                tables,
            } => {
                state.parameters.extend(params.iter().cloned());
                state.auto_tables.extend(tables.iter().cloned());
                Ok(sql.clone())
            }
            Expr::Token(token) => Ok(self.token(token)),
            Expr::Sequence(name) => Err(Error::compile(
                CompileErrorKind::Unsupported,
                format!("don't know how to compile sequence {name:?} for this database"),
            )),
            Expr::AutoTables {
                expr,
                tables,
                replace,
            } => {
                let saved = replace.then(|| std::mem::take(&mut state.auto_tables));
                let statement = self.compile_expr(expr, state);
                if let Some(saved) = saved {
                    state.auto_tables = saved;
                }
                state.auto_tables.extend(tables.iter().cloned());
                statement
            }
            Expr::List(items) => self.compile_list(items, state, ", "),
            Expr::Custom { name, .. } => Err(Error::compile(
                CompileErrorKind::Unsupported,
                format!("don't know how to compile custom node {name:?}"),
            )),
        }
    }

    // ==================== Tables ====================

    /// Render the tables of a statement.
    ///
    /// Explicit `tables` win, then the auto tables registered so far, then
    /// `default_tables`.
    pub fn build_tables(
        &self,
        tables: Option<&[Expr]>,
        default_tables: Option<&[Expr]>,
        state: &mut State,
    ) -> Result<String> {
        let tables = match tables {
            Some(tables) => tables,
            None if !state.auto_tables.is_empty() => return self.build_auto_tables(state),
            None => default_tables.unwrap_or(&[]),
        };
        match tables {
            [] => Err(no_table()),
            [single] => self.compile_expr(single, state),
            _ if !tables.iter().any(|t| matches!(t, Expr::Join(_))) => {
                self.compile_list(tables, state, ", ")
            }
            _ => {
                let mut result = String::new();
                for table in tables {
                    if !result.is_empty() {
                        result.push_str(if table.is_half_join() { " " } else { ", " });
                    }
                    result.push_str(&self.compile_expr(table, state)?);
                }
                Ok(result)
            }
        }
    }

    // Compiling a join may register further auto tables, which are
    // visited too.
    fn build_auto_tables(&self, state: &mut State) -> Result<String> {
        if state.auto_tables.len() == 1 {
            let table = state.auto_tables[0].clone();
            return self.compile_expr(&table, state);
        }
        if !state.auto_tables.iter().any(|t| matches!(t, Expr::Join(_))) {
            let mut names = BTreeSet::new();
            let mut i = 0;
            while i < state.auto_tables.len() {
                let table = state.auto_tables[i].clone();
                names.insert(self.compile_expr(&table, state)?);
                i += 1;
            }
            return Ok(names.into_iter().collect::<Vec<_>>().join(", "));
        }

        let saved = state.join_tables.replace(HashSet::new());
        let mut tables = BTreeSet::new();
        let mut joins = BTreeSet::new();
        let mut half_joins = BTreeSet::new();
        let mut i = 0;
        while i < state.auto_tables.len() {
            let table = state.auto_tables[i].clone();
            let statement = match self.compile_expr(&table, state) {
                Ok(statement) => statement,
                Err(e) => {
                    state.join_tables = saved;
                    return Err(e);
                }
            };
            match &table {
                Expr::Join(join) if join.left.is_none() => half_joins.insert(statement),
                Expr::Join(_) => joins.insert(statement),
                _ => tables.insert(statement),
            };
            i += 1;
        }
        let seen = std::mem::replace(&mut state.join_tables, saved).unwrap_or_default();
        tables.retain(|table| !seen.contains(table));

        let mut result = tables.into_iter().chain(joins).collect::<Vec<_>>().join(", ");
        if !half_joins.is_empty() {
            result.push(' ');
            result.push_str(&half_joins.into_iter().collect::<Vec<_>>().join(" "));
        }
        Ok(result)
    }

    // ==================== Statements ====================

    fn compile_select(&self, select: &Select, state: &mut State) -> Result<String> {
        let mut tokens = vec!["SELECT ".to_string()];
        if select.distinct {
            tokens.push("DISTINCT ".to_string());
        }
        let saved_tables = std::mem::take(&mut state.auto_tables);
        let previous = state.enter(Context::Column);

        tokens.push(self.compile_list(&select.columns, state, ", ")?);
        let tables_pos = tokens.len();
        let params_pos = state.parameters.len();
        state.context = Some(Context::Expr);
        if let Some(condition) = &select.where_clause {
            tokens.push(" WHERE ".to_string());
            tokens.push(self.compile_expr(condition, state)?);
        }
        if !select.group_by.is_empty() {
            tokens.push(" GROUP BY ".to_string());
            tokens.push(self.compile_list(&select.group_by, state, ", ")?);
        }
        if let Some(having) = &select.having {
            tokens.push(" HAVING ".to_string());
            tokens.push(self.compile_expr(having, state)?);
        }
        if !select.order_by.is_empty() {
            tokens.push(" ORDER BY ".to_string());
            tokens.push(self.compile_list(&select.order_by, state, ", ")?);
        }
        if let Some(limit) = select.limit {
            tokens.push(format!(" LIMIT {limit}"));
        }
        if let Some(offset) = select.offset {
            tokens.push(format!(" OFFSET {offset}"));
        }

        let has_tables = select.tables.is_some()
            || select.default_tables.is_some()
            || !state.auto_tables.is_empty();
        if has_tables {
            state.context = Some(Context::Table);
            let outer_params = std::mem::take(&mut state.parameters);
            let from = self.build_tables(
                select.tables.as_deref(),
                select.default_tables.as_deref(),
                state,
            );
            let table_params = std::mem::replace(&mut state.parameters, outer_params);
            tokens.insert(tables_pos, " FROM ".to_string());
            tokens.insert(tables_pos + 1, from?);
            let tail = state.parameters.split_off(params_pos);
            state.parameters.extend(table_params);
            state.parameters.extend(tail);
        }

        state.restore_context(previous);
        state.auto_tables = saved_tables;
        Ok(tokens.concat())
    }

    fn compile_insert(&self, insert: &Insert, state: &mut State) -> Result<String> {
        let previous = state.enter(Context::ColumnName);
        let mut columns = Vec::with_capacity(insert.map.len());
        for (column, _) in &insert.map {
            columns.push(self.compile_expr(&Expr::Column(column.clone()), state)?);
        }
        state.context = Some(Context::Table);
        let table = self.build_tables(
            insert.table.as_ref().map(std::slice::from_ref),
            insert.default_table.as_ref().map(std::slice::from_ref),
            state,
        )?;
        state.context = Some(Context::Expr);
        let mut values = Vec::with_capacity(insert.map.len());
        for (_, value) in &insert.map {
            values.push(self.compile_expr(value, state)?);
        }
        state.restore_context(previous);

        if columns.is_empty() {
            return Ok(format!("INSERT INTO {table} DEFAULT VALUES"));
        }
        Ok(format!(
            "INSERT INTO {table} ({}) VALUES ({})",
            columns.join(", "),
            values.join(", ")
        ))
    }

    // SET values are compiled in column-name context, so columns on the
    // right side render unqualified too.
    fn compile_update(&self, update: &Update, state: &mut State) -> Result<String> {
        let previous = state.enter(Context::ColumnName);
        let mut sets = Vec::with_capacity(update.map.len());
        for (column, value) in &update.map {
            let column = self.compile_expr(&Expr::Column(column.clone()), state)?;
            sets.push(format!("{column}={}", self.compile_expr(value, state)?));
        }
        state.context = Some(Context::Table);
        let table = self.build_tables(
            update.table.as_ref().map(std::slice::from_ref),
            update.default_table.as_ref().map(std::slice::from_ref),
            state,
        )?;
        let mut statement = format!("UPDATE {table} SET {}", sets.join(", "));
        if let Some(condition) = &update.where_clause {
            state.context = Some(Context::Expr);
            statement.push_str(" WHERE ");
            statement.push_str(&self.compile_expr(condition, state)?);
        }
        state.restore_context(previous);
        Ok(statement)
    }

    fn compile_delete(&self, delete: &Delete, state: &mut State) -> Result<String> {
        let previous = state.enter(Context::Expr);
        let condition = match &delete.where_clause {
            Some(condition) => Some(self.compile_expr(condition, state)?),
            None => None,
        };
        // The table comes last so the condition's columns can name it.
        state.context = Some(Context::Table);
        let table = self.build_tables(
            delete.table.as_ref().map(std::slice::from_ref),
            delete.default_table.as_ref().map(std::slice::from_ref),
            state,
        )?;
        state.restore_context(previous);
        Ok(match condition {
            Some(condition) => format!("DELETE FROM {table} WHERE {condition}"),
            None => format!("DELETE FROM {table}"),
        })
    }

    // With ORDER BY, plain columns of the operands are aliased and the
    // ordering refers to the aliases, since qualified names are not valid
    // there on most databases.
    fn compile_set_expr(&self, set: &SetExpr, state: &mut State) -> Result<String> {
        let mut aliases: Vec<(Column, Alias)> = Vec::new();
        let rewritten;
        let exprs = if set.order_by.is_empty() {
            &set.exprs
        } else {
            let mut exprs = set.exprs.clone();
            for expr in &mut exprs {
                let Expr::Select(select) = expr else {
                    continue;
                };
                for column in &mut select.columns {
                    match column {
                        Expr::Column(c) if !aliases.iter().any(|(known, _)| known == c) => {
                            let alias = Alias::auto(c.clone());
                            aliases.push((c.clone(), alias.clone()));
                            *column = Expr::Alias(alias);
                        }
                        Expr::Alias(alias) => {
                            if let Expr::Column(c) = alias.expr.as_ref() {
                                if !aliases.iter().any(|(known, _)| known == c) {
                                    aliases.push((c.clone(), alias.clone()));
                                }
                            }
                        }
                        _ => {}
                    }
                }
            }
            rewritten = exprs;
            &rewritten
        };

        let previous = state.enter(Context::Select);
        state.precedence += HALF_STEP;
        let sep = if set.all {
            format!("{}ALL ", set.op.as_str())
        } else {
            set.op.as_str().to_string()
        };
        let mut statement = self.compile_list(exprs, state, &sep)?;
        state.precedence -= HALF_STEP;

        if !set.order_by.is_empty() {
            state.context = Some(Context::ColumnName);
            let pushed = match state.aliases.take() {
                None => {
                    state.aliases = Some(aliases);
                    true
                }
                Some(existing) => {
                    // Aliases from an enclosing set operation take precedence.
                    for (column, alias) in existing {
                        match aliases.iter_mut().find(|(known, _)| *known == column) {
                            Some(entry) => entry.1 = alias,
                            None => aliases.push((column, alias)),
                        }
                    }
                    state.aliases = Some(aliases);
                    false
                }
            };
            let order = self.compile_list(&set.order_by, state, ", ");
            if pushed {
                state.aliases = None;
            }
            statement.push_str(" ORDER BY ");
            statement.push_str(&order?);
        }
        if let Some(limit) = set.limit {
            statement.push_str(&format!(" LIMIT {limit}"));
        }
        if let Some(offset) = set.offset {
            statement.push_str(&format!(" OFFSET {offset}"));
        }
        state.restore_context(previous);
        Ok(statement)
    }

    // ==================== Columns, aliases and joins ====================

    fn compile_column(&self, column: &Column, state: &mut State) -> Result<String> {
        let Some(table) = column.table() else {
            return Ok(self.column_name(column, state));
        };
        state.auto_tables.push(table.clone());
        if state.context == Some(Context::ColumnName) {
            return Ok(self.column_name(column, state));
        }
        let previous = state.enter(Context::ColumnPrefix);
        let prefix = self.compile_expr(table, state);
        state.restore_context(previous);
        Ok(format!("{}.{}", prefix?, self.token(column.name())))
    }

    fn column_name(&self, column: &Column, state: &State) -> String {
        match state.alias_for(column) {
            Some(alias) => self.token(&alias.name),
            None => self.token(column.name()),
        }
    }

    fn compile_alias(&self, alias: &Alias, state: &mut State) -> Result<String> {
        let name = self.token(&alias.name);
        if matches!(state.context, Some(Context::Column | Context::Table)) {
            return Ok(format!("{} AS {name}", self.compile_expr(&alias.expr, state)?));
        }
        Ok(name)
    }

    fn compile_join(&self, join: &Join, state: &mut State) -> Result<String> {
        let mut parts = Vec::with_capacity(5);
        if let Some(left) = &join.left {
            let statement = self.compile_expr(left, state)?;
            if let Some(seen) = state.join_tables.as_mut() {
                seen.insert(statement.clone());
            }
            parts.push(statement);
        }
        parts.push(join.kind.as_str().to_string());
        // Joins are left associative.
        state.precedence += HALF_STEP;
        let right = self.compile_expr(&join.right, state)?;
        if let Some(seen) = state.join_tables.as_mut() {
            seen.insert(right.clone());
        }
        parts.push(right);
        if let Some(on) = &join.on {
            let previous = state.enter(Context::Expr);
            let condition = self.compile_expr(on, state);
            state.restore_context(previous);
            parts.push("ON".to_string());
            parts.push(condition?);
        }
        Ok(parts.join(" "))
    }

    // ==================== Operators ====================

    fn compile_binary(
        &self,
        op: BinaryOp,
        left: &Expr,
        right: &Expr,
        state: &mut State,
    ) -> Result<String> {
        match (op, right) {
            (BinaryOp::Eq, Expr::Null) => {
                return Ok(format!("{} IS NULL", self.compile_expr(left, state)?));
            }
            (BinaryOp::Ne, Expr::Null) => {
                return Ok(format!("{} IS NOT NULL", self.compile_expr(left, state)?));
            }
            _ => {}
        }
        let left = self.compile_expr(left, state)?;
        if op.is_non_associative() {
            state.precedence += HALF_STEP;
        }
        let right = self.compile_expr(right, state)?;
        Ok(format!("{left}{}{right}", op.as_str()))
    }
}

impl std::fmt::Debug for Compiler<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Compiler")
            .field("dialect", &self.dialect.name())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tessera_core::{
        JoinKind, SetOp, SuffixOp, Value, VariableFactory, VariableKind,
    };

    fn person(name: &str) -> Column {
        Column::of("person", name)
    }

    fn compile(expr: impl Into<Expr>) -> Compiled {
        Compiler::default().compile(&expr.into()).unwrap()
    }

    fn values(compiled: &Compiled) -> Vec<Value> {
        compiled
            .params
            .iter()
            .map(|p| p.get(false).unwrap().unwrap_or(Value::Null))
            .collect()
    }

    #[test]
    fn select_with_auto_tables() {
        let age = Column::build(
            "age",
            Some(Expr::table("person")),
            0,
            VariableFactory::new(VariableKind::Int),
        );
        let select = Select::new([person("name")])
            .filter(age.gt(21))
            .order_by([person("name").desc()])
            .limit(5);
        let compiled = compile(select);
        assert_eq!(
            compiled.sql,
            "SELECT person.name FROM person WHERE person.age > ? ORDER BY person.name DESC LIMIT 5"
        );
        assert_eq!(values(&compiled), vec![Value::BigInt(21)]);
        assert_eq!(*compiled.params[0].kind(), VariableKind::Int);
    }

    #[test]
    fn select_without_tables() {
        let compiled = compile(Select::new([Expr::raw("1")]));
        assert_eq!(compiled.sql, "SELECT 1");
        assert!(compiled.params.is_empty());
    }

    #[test]
    fn select_explicit_and_default_tables() {
        let select = Select::new([Column::new("id")]).default_tables([Expr::table("person")]);
        assert_eq!(compile(select).sql, "SELECT id FROM person");

        let select = Select::new([person("id")]).tables([Expr::table("employee")]);
        assert_eq!(compile(select).sql, "SELECT person.id FROM employee");

        let select = Select::new([Column::new("id")])
            .tables([Expr::table("b"), Expr::table("a")]);
        assert_eq!(compile(select).sql, "SELECT id FROM b, a");
    }

    #[test]
    fn select_distinct_group_having_offset() {
        let select = Select::new([Expr::from(person("age")), Expr::count_star()])
            .group_by([person("age")])
            .having(Expr::count_star().gt(1))
            .offset(10)
            .distinct(true);
        let compiled = compile(select);
        assert_eq!(
            compiled.sql,
            "SELECT DISTINCT person.age, COUNT(*) FROM person GROUP BY person.age \
             HAVING COUNT(*) > ? OFFSET 10"
        );
    }

    #[test]
    fn auto_tables_are_deduplicated_and_sorted() {
        let select = Select::new([Column::of("zeta", "a"), Column::of("alpha", "b")])
            .filter(Column::of("zeta", "c").eq(Column::of("alpha", "d")));
        assert_eq!(
            compile(select).sql,
            "SELECT zeta.a, alpha.b FROM alpha, zeta WHERE zeta.c = alpha.d"
        );
    }

    #[test]
    fn joins_hide_their_tables_from_the_plain_list() {
        let join = Join::new(JoinKind::Left, Expr::table("person"), Expr::table("address"))
            .on(person("id").eq(Column::of("address", "person_id")));
        let select = Select::new([person("name"), Column::of("address", "city")]).filter(
            Expr::AutoTables {
                expr: Box::new(person("id").gt(0)),
                tables: vec![Expr::from(join)],
                replace: false,
            },
        );
        let compiled = compile(select);
        assert_eq!(
            compiled.sql,
            "SELECT person.name, address.city FROM person LEFT JOIN address \
             ON person.id = address.person_id WHERE person.id > ?"
        );
    }

    #[test]
    fn half_joins_come_last() {
        let half = Join::half(JoinKind::Inner, Expr::table("address"))
            .on(person("id").eq(Column::of("address", "person_id")));
        let select = Select::new([person("name")]).tables([Expr::table("person"), Expr::from(half)]);
        assert_eq!(
            compile(select).sql,
            "SELECT person.name FROM person JOIN address ON person.id = address.person_id"
        );
    }

    #[test]
    fn nested_right_join_is_parenthesized() {
        let inner = Join::new(JoinKind::Inner, Expr::table("b"), Expr::table("c"));
        let outer = Join::new(JoinKind::Inner, Expr::table("a"), inner);
        let select = Select::new([Expr::raw("*")]).tables([Expr::from(outer)]);
        assert_eq!(compile(select).sql, "SELECT * FROM a JOIN (b JOIN c)");
    }

    #[test]
    fn insert_update_delete() {
        let insert = Insert::new(vec![
            (person("id"), Expr::from(1)),
            (person("name"), Expr::from("joe")),
        ]);
        let compiled = compile(insert);
        assert_eq!(compiled.sql, "INSERT INTO person (id, name) VALUES (?, ?)");
        assert_eq!(
            values(&compiled),
            vec![Value::Int(1), Value::Text("joe".to_string())]
        );

        let update = Update::new(vec![(person("age"), person("age").add(1))])
            .filter(person("id").eq(1));
        assert_eq!(
            compile(update).sql,
            "UPDATE person SET age=age+? WHERE person.id = ?"
        );

        let delete = Delete::new().filter(person("id").eq(1));
        assert_eq!(compile(delete).sql, "DELETE FROM person WHERE person.id = ?");

        let delete = Delete::new().default_table(Expr::table("person"));
        assert_eq!(compile(delete).sql, "DELETE FROM person");
    }

    #[test]
    fn insert_without_columns_uses_default_values() {
        let insert = Insert::new(Vec::new()).table(Expr::table("counter"));
        assert_eq!(compile(insert).sql, "INSERT INTO counter DEFAULT VALUES");
    }

    #[test]
    fn missing_tables_are_an_error() {
        let err = Compiler::default()
            .compile(&Expr::from(Delete::new()))
            .unwrap_err();
        assert_eq!(err.compile_kind(), Some(CompileErrorKind::NoTable));

        let select = Select::new([Column::new("id")]).tables(Vec::<Expr>::new());
        let err = Compiler::default().compile(&select.into()).unwrap_err();
        assert_eq!(err.compile_kind(), Some(CompileErrorKind::NoTable));
    }

    #[test]
    fn precedence_adds_parentheses() {
        let a = Column::new("a");
        let b = Column::new("b");
        let c = Column::new("c");
        let expr = a.eq(1).or(b.eq(2)).and(c.eq(3));
        assert_eq!(compile(expr).sql, "(a = ? OR b = ?) AND c = ?");

        let expr = a.eq(1).and(b.eq(2)).or(c.eq(3));
        assert_eq!(compile(expr).sql, "a = ? AND b = ? OR c = ?");

        let expr = Expr::from(a.clone()).sub(Expr::from(b.clone()).sub(Expr::from(c.clone())));
        assert_eq!(compile(expr).sql, "a-(b-c)");

        let expr = Expr::from(a.clone()).sub(Expr::from(b.clone())).sub(Expr::from(c.clone()));
        assert_eq!(compile(expr).sql, "a-b-c");

        let expr = Expr::from(a.clone()).add(Expr::from(b.clone())).mul(Expr::from(c.clone()));
        assert_eq!(compile(expr).sql, "(a+b)*c");

        let expr = a.eq(1).not();
        assert_eq!(compile(expr).sql, "NOT (a = ?)");
    }

    #[test]
    fn null_comparisons() {
        let name = Column::new("name");
        assert_eq!(compile(name.eq(Expr::Null)).sql, "name IS NULL");
        assert_eq!(compile(name.ne(None::<i64>)).sql, "name IS NOT NULL");
        assert_eq!(compile(name.eq(Expr::param(Value::Null))).sql, "name IS NULL");
    }

    #[test]
    fn in_forces_parentheses() {
        let id = Column::new("id");
        let compiled = compile(id.is_in([1, 2, 3]));
        assert_eq!(compiled.sql, "id IN (?, ?, ?)");
        assert_eq!(compiled.params.len(), 3);

        let sub = Select::new([Column::of("person", "id")]);
        let compiled = compile(Expr::from(id).in_query(sub));
        assert_eq!(compiled.sql, "id IN (SELECT person.id FROM person)");
    }

    #[test]
    fn like_with_escape() {
        let name = Column::new("name");
        let compiled = compile(name.startswith("50%"));
        assert_eq!(compiled.sql, "name LIKE ? ESCAPE ?");
        assert_eq!(
            values(&compiled),
            vec![
                Value::Text("50!%%".to_string()),
                Value::Text("!".to_string())
            ]
        );
    }

    #[test]
    fn functions_and_suffixes() {
        let age = person("age");
        assert_eq!(compile(age.count()).sql, "COUNT(person.age)");
        assert_eq!(
            compile(Expr::from(age.clone()).count_distinct()).sql,
            "COUNT(DISTINCT person.age)"
        );
        assert_eq!(compile(age.max()).sql, "MAX(person.age)");
        assert_eq!(
            compile(Expr::coalesce([Expr::from(age.clone()), Expr::from(0)])).sql,
            "COALESCE(person.age, ?)"
        );
        assert_eq!(compile(age.asc()).sql, "person.age ASC");
        assert_eq!(
            compile(Expr::Suffix {
                op: SuffixOp::Desc,
                expr: Box::new(Expr::raw("x"))
            })
            .sql,
            "x DESC"
        );
    }

    #[test]
    fn tokens_are_quoted_when_needed() {
        let compiler = Compiler::default();
        assert_eq!(compiler.token("person"), "person");
        assert_eq!(compiler.token("order"), "\"order\"");
        assert_eq!(compiler.token("1st"), "\"1st\"");
        assert_eq!(compiler.token("we\"ird"), "\"we\"\"ird\"");
        let select = Select::new([Column::of("user", "select")]);
        assert_eq!(compile(select).sql, "SELECT \"user\".\"select\" FROM \"user\"");
    }

    #[test]
    fn raw_sql_with_parameters_and_tables() {
        let sql = Expr::sql(
            "age > ?",
            vec![Variable::any(18)],
            vec![Expr::table("person")],
        );
        let compiled = compile(Select::new([Expr::raw("*")]).filter(sql));
        assert_eq!(compiled.sql, "SELECT * FROM person WHERE age > ?");
        assert_eq!(values(&compiled), vec![Value::Int(18)]);
    }

    #[test]
    fn from_parameters_are_spliced_in_place() {
        let sub = Select::new([Column::of("t", "id")]).filter(Column::of("t", "x").eq(1));
        let aliased = Alias::new(sub, "s");
        let select = Select::new([Column::new("id").eq(2)])
            .tables([Expr::from(aliased)])
            .filter(Column::new("y").eq(3));
        let compiled = compile(select);
        assert_eq!(
            compiled.sql,
            "SELECT id = ? FROM (SELECT t.id FROM t WHERE t.x = ?) AS s WHERE y = ?"
        );
        assert_eq!(
            values(&compiled),
            vec![Value::Int(2), Value::Int(1), Value::Int(3)]
        );
    }

    #[test]
    fn set_operations_parenthesize_operands() {
        let a = Select::new([Column::of("a", "id")]);
        let b = Select::new([Column::of("b", "id")]).limit(1);
        let union = SetExpr::union([Expr::from(a.clone()), Expr::from(b.clone())]).limit(5);
        assert_eq!(
            compile(union).sql,
            "(SELECT a.id FROM a) UNION (SELECT b.id FROM b LIMIT 1) LIMIT 5"
        );

        let all = SetExpr::new(SetOp::Intersect, [a, b], true);
        assert_eq!(
            compile(all).sql,
            "(SELECT a.id FROM a) INTERSECT ALL (SELECT b.id FROM b LIMIT 1)"
        );
    }

    #[test]
    fn set_operation_order_by_uses_aliases() {
        let id = Column::of("a", "id");
        let union = SetExpr::union([
            Select::new([id.clone()]),
            Select::new([Column::of("b", "id")]),
        ])
        .order_by([id.clone()]);
        let compiled = compile(union);
        let re = Regex::new(
            r"^\(SELECT a\.id AS (_[0-9a-f]+) FROM a\) UNION \(SELECT b\.id AS _[0-9a-f]+ FROM b\) ORDER BY (_[0-9a-f]+)$",
        )
        .unwrap();
        let caps = re.captures(&compiled.sql).unwrap();
        assert_eq!(&caps[1], &caps[2]);
    }

    #[test]
    fn custom_and_sequence_nodes_need_a_dialect() {
        let err = Compiler::default()
            .compile(&Expr::custom("GREATEST", [1, 2]))
            .unwrap_err();
        assert_eq!(err.compile_kind(), Some(CompileErrorKind::Unsupported));
        let err = Compiler::default()
            .compile(&Expr::Sequence("person_id_seq".to_string()))
            .unwrap_err();
        assert_eq!(err.compile_kind(), Some(CompileErrorKind::Unsupported));
    }

    struct Shouting;

    impl Dialect for Shouting {
        fn name(&self) -> &str {
            "shouting"
        }

        fn is_reserved_word(&self, word: &str) -> bool {
            word == "name" || crate::reserved::is_sql92_reserved(word)
        }

        fn compile_node(
            &self,
            compiler: &Compiler<'_>,
            expr: &Expr,
            state: &mut State,
        ) -> Option<Result<String>> {
            match expr {
                Expr::Like {
                    case_sensitive: Some(false),
                    expr,
                    pattern,
                    ..
                } => Some(ilike(compiler, expr, pattern, state)),
                Expr::Sequence(name) => Some(Ok(format!("nextval('{name}')"))),
                Expr::Custom { name, args } if name == "GREATEST" => Some(
                    compiler
                        .compile_list(args, state, ", ")
                        .map(|args| format!("GREATEST({args})")),
                ),
                Expr::Select(_) => Some(
                    compiler
                        .compile_default(expr, state)
                        .map(|sql| format!("{sql} FOR UPDATE")),
                ),
                _ => None,
            }
        }
    }

    fn ilike(
        compiler: &Compiler<'_>,
        expr: &Expr,
        pattern: &Expr,
        state: &mut State,
    ) -> Result<String> {
        Ok(format!(
            "{} ILIKE {}",
            compiler.compile_expr(expr, state)?,
            compiler.compile_expr(pattern, state)?
        ))
    }

    #[test]
    fn dialect_overrides_individual_nodes() {
        let dialect = Shouting;
        let compiler = Compiler::new(&dialect);
        let name = Column::new("name");
        let compiled = compiler.compile(&Expr::from(name.clone()).ilike("j%")).unwrap();
        assert_eq!(compiled.sql, "\"name\" ILIKE ?");
        let compiled = compiler
            .compile(&Expr::custom("GREATEST", [1, 2]))
            .unwrap();
        assert_eq!(compiled.sql, "GREATEST(?, ?)");
        assert_eq!(compiled.params.len(), 2);
        let compiled = compiler
            .compile(&Select::new([Expr::Sequence("s".to_string())]).into())
            .unwrap();
        assert_eq!(compiled.sql, "SELECT nextval('s') FOR UPDATE");
    }
}
